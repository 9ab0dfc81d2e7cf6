//! Map objects
//!
//! The slice of a map the range devices care about: typed objects with a pose
//! and a from/to extent, and a source that can enumerate them and announce
//! changes. Map file formats are out of scope; `InMemoryMap` is filled from
//! code or from YAML.

// Dependencies
use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::core::{Point2D, Pose2D};

/// Type tag of a forbidden line.
pub const FORBIDDEN_LINE: &str = "ForbiddenLine";
/// Type tag of a forbidden area.
pub const FORBIDDEN_AREA: &str = "ForbiddenArea";

/// Called after the set of map objects changed.
pub type MapChangedCallback = Box<dyn Fn() + Send + Sync>;

/// A map object with a type tag.
///
/// For lines `from` and `to` are the endpoints. For areas they are opposite
/// corners of the rectangle before it is rotated by `pose.th`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapObject {
    /// Type tag, e.g. [`FORBIDDEN_LINE`].
    #[serde(rename = "type")]
    pub kind: String,
    /// Optional label.
    #[serde(default)]
    pub name: Option<String>,
    /// Heading of an area; the position is unused.
    #[serde(default)]
    pub pose: Pose2D,
    /// First endpoint or corner.
    pub from: Point2D,
    /// Second endpoint or corner.
    pub to: Point2D,
}

impl MapObject {
    /// A forbidden line from `from` to `to`.
    pub fn forbidden_line(from: Point2D, to: Point2D) -> Self {
        MapObject {
            kind: FORBIDDEN_LINE.to_string(),
            name: None,
            pose: Pose2D::origin(),
            from,
            to,
        }
    }

    /// A forbidden rectangle with corners `from` and `to`, rotated by `heading` degrees.
    pub fn forbidden_area(from: Point2D, to: Point2D, heading: f64) -> Self {
        MapObject {
            kind: FORBIDDEN_AREA.to_string(),
            name: None,
            pose: Pose2D::new(0.0, 0.0, heading),
            from,
            to,
        }
    }

    /// Sets the label.
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// True for a forbidden line.
    pub fn is_forbidden_line(&self) -> bool {
        self.kind == FORBIDDEN_LINE
    }

    /// True for a forbidden area.
    pub fn is_forbidden_area(&self) -> bool {
        self.kind == FORBIDDEN_AREA
    }
}

/// Something that holds map objects.
#[cfg_attr(test, mockall::automock)]
pub trait MapSource: Send + Sync {
    /// Copy of every object.
    fn map_objects(&self) -> Vec<MapObject>;

    /// Registers `cb` to run whenever the objects change.
    fn add_map_changed_cb(&self, cb: MapChangedCallback);
}

/// Map objects held in memory.
#[derive(Default)]
pub struct InMemoryMap {
    objects: RwLock<Vec<MapObject>>,
    callbacks: Mutex<Vec<MapChangedCallback>>,
}

impl InMemoryMap {
    /// A map holding `objects`.
    pub fn new(objects: Vec<MapObject>) -> Self {
        InMemoryMap {
            objects: RwLock::new(objects),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Parses a YAML list of objects.
    pub fn from_yaml_str(yaml: &str) -> crate::Result<Self> {
        let objects: Vec<MapObject> = serde_yaml::from_str(yaml)?;
        info!("Loaded {} map objects", objects.len());
        Ok(InMemoryMap::new(objects))
    }

    /// Number of objects.
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// True when the map holds no objects.
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Adds an object and notifies listeners.
    pub fn add_object(&self, object: MapObject) {
        self.objects.write().push(object);
        self.notify();
    }

    /// Replaces every object and notifies listeners.
    pub fn set_objects(&self, objects: Vec<MapObject>) {
        *self.objects.write() = objects;
        self.notify();
    }

    /// Removes every object and notifies listeners.
    pub fn clear(&self) {
        self.objects.write().clear();
        self.notify();
    }

    // Objects lock is released before callbacks run, so they may read the map.
    fn notify(&self) {
        let callbacks = self.callbacks.lock();
        debug!("Map changed, notifying {} listeners", callbacks.len());
        for cb in callbacks.iter() {
            cb();
        }
    }
}

impl MapSource for InMemoryMap {
    fn map_objects(&self) -> Vec<MapObject> {
        self.objects.read().clone()
    }

    fn add_map_changed_cb(&self, cb: MapChangedCallback) {
        self.callbacks.lock().push(cb);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_change_callbacks_fire() {
        let map = InMemoryMap::default();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        map.add_map_changed_cb(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));

        map.add_object(MapObject::forbidden_line(Point2D::new(0.0, 0.0), Point2D::new(1.0, 0.0)));
        map.clear();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(map.is_empty());
    }

    #[test]
    fn test_yaml_objects() {
        let yaml = r#"
- type: ForbiddenLine
  from: { x: 0.0, y: 0.0 }
  to: { x: 1000.0, y: 0.0 }
- type: ForbiddenArea
  name: dock
  pose: { x: 0.0, y: 0.0, th: 30.0 }
  from: { x: -500.0, y: -500.0 }
  to: { x: 500.0, y: 500.0 }
- type: Goal
  from: { x: 0.0, y: 0.0 }
  to: { x: 0.0, y: 0.0 }
"#;
        let map = InMemoryMap::from_yaml_str(yaml).unwrap();
        let objects = map.map_objects();
        assert_eq!(objects.len(), 3);
        assert!(objects[0].is_forbidden_line());
        assert!(objects[1].is_forbidden_area());
        assert_eq!(objects[1].name.as_deref(), Some("dock"));
        assert_eq!(objects[1].pose.th, 30.0);
        assert!(!objects[2].is_forbidden_line() && !objects[2].is_forbidden_area());
    }
}
