// sensors/forbidden.rs

// Forbidden zones from the map, published as if a sensor had seen them. The
// device caches the segments of every forbidden line and the four edges of
// every forbidden area, and each cycle rewrites its current buffer with points
// sampled along the segments near the robot. Navigation code then treats the
// zones like any other obstacle. There is no cumulative history; the map is
// the history.
//
// The cache is rebuilt lazily: the map's change callback only raises a flag
// and the next cycle does the work under the device lock.

// Dependencies
use log::info;
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::core::{Clock, LineSegment, Point2D};
use crate::map::{MapObject, MapSource};
use crate::range::{CycleContext, DeviceBuffers, DeviceSettings, RangeDevice, SensorFusionPolicy};

/// Settings of a forbidden-zone device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForbiddenSettings {
    /// Device settings; a partial block keeps the forbidden-zone defaults.
    #[serde(deserialize_with = "forbidden_device_settings")]
    pub device: DeviceSettings,
    /// Spacing of the points published along each segment (mm).
    pub distance_increment: f64,
    /// Whether zones are published at startup.
    pub enabled: bool,
}

impl Default for ForbiddenSettings {
    fn default() -> Self {
        ForbiddenSettings {
            device: DeviceSettings {
                name: "forbidden".to_string(),
                max_range: 4000.0,
                current_buffer_size: 400,
                cumulative_buffer_size: 0,
                priority: 60,
                ..DeviceSettings::default()
            },
            distance_increment: 100.0,
            enabled: true,
        }
    }
}

fn forbidden_device_settings<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DeviceSettings, D::Error> {
    DeviceSettings::deserialize_over(&ForbiddenSettings::default().device, deserializer)
}

/// Shared switch for a forbidden-zone device.
///
/// Clones control the same device; the policy itself is owned by the device.
#[derive(Debug, Clone)]
pub struct ForbiddenZoneHandle {
    enabled: Arc<AtomicBool>,
    dirty: Arc<AtomicBool>,
}

impl ForbiddenZoneHandle {
    fn new(enabled: bool) -> Self {
        ForbiddenZoneHandle {
            enabled: Arc::new(AtomicBool::new(enabled)),
            dirty: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Publishes the zones again from the next cycle.
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    /// Publishes an empty buffer from the next cycle.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Release);
    }

    /// True while zones are published.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Forces the segment cache to be rebuilt on the next cycle.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }
}

/// Segments contributed by one map object. Objects of other types give none.
pub fn object_segments(object: &MapObject) -> Vec<LineSegment> {
    if object.is_forbidden_line() {
        return vec![LineSegment::new(object.from, object.to)];
    }
    if !object.is_forbidden_area() {
        return Vec::new();
    }
    let (sa, ca) = object.pose.th.to_radians().sin_cos();
    let rotate = |x: f64, y: f64| Point2D::new(x * ca - y * sa, x * sa + y * ca);
    let (fx, fy, tx, ty) = (object.from.x, object.from.y, object.to.x, object.to.y);
    let corners = [rotate(fx, fy), rotate(tx, fy), rotate(tx, ty), rotate(fx, ty)];
    (0..4)
        .map(|i| LineSegment::new(corners[i], corners[(i + 1) % 4]))
        .collect()
}

/// True when part of `segment` is within `max_range` of `from`.
pub fn segment_in_range(segment: &LineSegment, from: &Point2D, max_range: f64) -> bool {
    let max_sq = max_range * max_range;
    segment.start.squared_distance_to(from) < max_sq
        || segment.end.squared_distance_to(from) < max_sq
        || segment
            .perp_point(from)
            .map_or(false, |foot| foot.squared_distance_to(from) < max_sq)
}

/// Points every `increment` along `segment` from its start, plus its end.
pub fn sample_segment(segment: &LineSegment, increment: f64) -> Vec<Point2D> {
    let length = segment.length();
    let mut points = Vec::new();
    if increment > 0.0 && length > 0.0 {
        let dx = (segment.end.x - segment.start.x) / length;
        let dy = (segment.end.y - segment.start.y) / length;
        let mut along = 0.0;
        while along < length {
            points.push(Point2D::new(segment.start.x + dx * along, segment.start.y + dy * along));
            along += increment;
        }
    }
    points.push(segment.end);
    points
}

/// Fusion policy publishing map forbidden zones.
pub struct ForbiddenZonePolicy {
    map: Arc<dyn MapSource>,
    handle: ForbiddenZoneHandle,
    distance_increment: f64,
    segments: Vec<LineSegment>,
}

impl ForbiddenZonePolicy {
    /// Creates the policy and subscribes it to map changes.
    pub fn new(map: Arc<dyn MapSource>, distance_increment: f64, enabled: bool) -> Self {
        let handle = ForbiddenZoneHandle::new(enabled);
        let on_change = handle.clone();
        map.add_map_changed_cb(Box::new(move || on_change.mark_dirty()));
        ForbiddenZonePolicy {
            map,
            handle,
            distance_increment: if distance_increment > 0.0 { distance_increment } else { 100.0 },
            segments: Vec::new(),
        }
    }

    /// A handle sharing this policy's enable flag.
    pub fn handle(&self) -> ForbiddenZoneHandle {
        self.handle.clone()
    }

    fn rebuild_segments(&mut self) {
        self.segments = self
            .map
            .map_objects()
            .iter()
            .flat_map(object_segments)
            .collect();
        info!("forbidden: {} segments from the map", self.segments.len());
    }
}

impl SensorFusionPolicy for ForbiddenZonePolicy {
    fn kind(&self) -> &'static str {
        "forbidden"
    }

    fn process(&mut self, buffers: &mut DeviceBuffers, ctx: &CycleContext<'_>) {
        if self.handle.take_dirty() {
            self.rebuild_segments();
        }
        let robot = ctx.pose.position();
        let current = buffers.current_mut();
        current.begin_redo();
        if self.handle.is_enabled() {
            for segment in self
                .segments
                .iter()
                .filter(|s| segment_in_range(s, &robot, ctx.max_range))
            {
                for p in sample_segment(segment, self.distance_increment) {
                    current.redo_reading(p.x, p.y, ctx.now);
                }
            }
        }
        current.end_redo();
    }
}

/// Builds a forbidden-zone device over `map`, returning the handle that
/// switches it on and off.
pub fn forbidden_device(
    settings: &ForbiddenSettings,
    map: Arc<dyn MapSource>,
    clock: Arc<dyn Clock>,
) -> (RangeDevice, ForbiddenZoneHandle) {
    let policy = ForbiddenZonePolicy::new(map, settings.distance_increment, settings.enabled);
    let handle = policy.handle();
    (RangeDevice::new(&settings.device, Box::new(policy), clock), handle)
}
