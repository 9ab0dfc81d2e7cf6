// range/buffer.rs

// Bounded store of timestamped readings in the global frame. A range device
// keeps two of these, a short-lived "current" buffer and a long-lived
// "cumulative" one. The buffer carries no lock of its own; the owning device
// serialises every call.
//
// Two multi-step protocols live here:
// - invalidation sweeps mark entries during a scan and compact at the end, so
//   indices stay stable while the caller is still iterating. Inserts and
//   capacity changes are refused while a sweep is open;
// - redo rebuilds the whole contents in a staging generation and swaps it in at
//   the end, so a reader that gets the lock never sees a half-filled buffer.

// Dependencies
use log::warn;
use std::collections::VecDeque;

use crate::core::{angle_between, Point2D, Pose2D, Timestamp, Transform};

/// A reading position with the time it was taken.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimedPoint {
    /// X coordinate in the global frame (mm).
    pub x: f64,
    /// Y coordinate in the global frame (mm).
    pub y: f64,
    /// When the reading was taken.
    pub time: Timestamp,
    invalid: bool,
}

impl TimedPoint {
    /// An unmarked reading.
    pub fn new(x: f64, y: f64, time: Timestamp) -> Self {
        TimedPoint {
            x,
            y,
            time,
            invalid: false,
        }
    }

    /// The position without the time.
    pub fn point(&self) -> Point2D {
        Point2D::new(self.x, self.y)
    }

    /// Squared distance to `(x, y)`.
    #[inline]
    pub fn squared_distance_to(&self, x: f64, y: f64) -> f64 {
        let dx = self.x - x;
        let dy = self.y - y;
        dx * dx + dy * dy
    }

    /// True once marked by an invalidation sweep that has not ended yet.
    pub fn is_invalidated(&self) -> bool {
        self.invalid
    }
}

/// Capacity-bounded FIFO of [`TimedPoint`]s.
#[derive(Debug, Clone)]
pub struct RangeBuffer {
    points: VecDeque<TimedPoint>,
    staging: VecDeque<TimedPoint>,
    capacity: usize,
    sweeping: bool,
    redoing: bool,
}

impl RangeBuffer {
    /// Empty buffer holding at most `capacity` readings.
    pub fn new(capacity: usize) -> Self {
        RangeBuffer {
            points: VecDeque::with_capacity(capacity),
            staging: VecDeque::new(),
            capacity,
            sweeping: false,
            redoing: false,
        }
    }

    /// Number of stored readings, marked ones included.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Most readings the buffer holds before evicting the oldest.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Changes the capacity; shrinking drops the oldest entries. Refused while
    /// an invalidation sweep is open.
    pub fn set_capacity(&mut self, capacity: usize) {
        if self.sweeping {
            warn!("set_capacity({}) called during an invalidation sweep; ignored", capacity);
            return;
        }
        self.capacity = capacity;
        while self.points.len() > capacity {
            self.points.pop_front();
        }
    }

    /// Drops every reading.
    pub fn clear(&mut self) {
        self.points.clear();
    }

    /// Points from oldest to newest.
    pub fn points(&self) -> impl Iterator<Item = &TimedPoint> {
        self.points.iter()
    }

    /// Reading at `index`, counting from the oldest.
    pub fn get(&self, index: usize) -> Option<&TimedPoint> {
        self.points.get(index)
    }

    /// The reading that will be evicted next.
    pub fn oldest(&self) -> Option<&TimedPoint> {
        self.points.front()
    }

    /// The most recent reading.
    pub fn newest(&self) -> Option<&TimedPoint> {
        self.points.back()
    }

    /// Copy of the contents, oldest first.
    pub fn snapshot(&self) -> Vec<TimedPoint> {
        self.points.iter().copied().collect()
    }

    /// Appends a reading, evicting the oldest when full. Returns false, adding
    /// nothing, while an invalidation sweep is open.
    pub fn add(&mut self, x: f64, y: f64, time: Timestamp) -> bool {
        if self.sweeping {
            warn!("add called during an invalidation sweep; ignored");
            return false;
        }
        push_bounded(&mut self.points, self.capacity, TimedPoint::new(x, y, time))
    }

    /// Appends a reading unless an existing one is closer than
    /// `sqrt(min_dist_squared)`. Returns whether the reading was added.
    pub fn add_conditional(&mut self, x: f64, y: f64, min_dist_squared: f64, time: Timestamp) -> bool {
        if min_dist_squared > 0.0
            && self
                .points
                .iter()
                .any(|p| !p.invalid && p.squared_distance_to(x, y) < min_dist_squared)
        {
            return false;
        }
        self.add(x, y, time)
    }

    /// Starts a sweep. Entries marked with [`invalidate`](Self::invalidate)
    /// stay in place until [`end_invalidation_sweep`](Self::end_invalidation_sweep).
    pub fn begin_invalidation_sweep(&mut self) {
        if self.sweeping {
            warn!("Invalidation sweep started while another is open; continuing it");
        }
        self.sweeping = true;
    }

    /// Marks the entry at `index` for removal. Outside a sweep this is a no-op.
    pub fn invalidate(&mut self, index: usize) {
        if !self.sweeping {
            warn!("invalidate({}) called outside an invalidation sweep; ignored", index);
            return;
        }
        if let Some(p) = self.points.get_mut(index) {
            p.invalid = true;
        }
    }

    /// Removes every marked entry. Returns how many went.
    pub fn end_invalidation_sweep(&mut self) -> usize {
        if !self.sweeping {
            return 0;
        }
        self.sweeping = false;
        let before = self.points.len();
        self.points.retain(|p| !p.invalid);
        before - self.points.len()
    }

    /// Runs a full sweep removing entries for which `pred` holds.
    pub fn invalidate_where<F>(&mut self, mut pred: F) -> usize
    where
        F: FnMut(&TimedPoint) -> bool,
    {
        self.begin_invalidation_sweep();
        for i in 0..self.points.len() {
            if pred(&self.points[i]) {
                self.invalidate(i);
            }
        }
        self.end_invalidation_sweep()
    }

    /// Starts rebuilding the buffer. Readers keep seeing the old contents until
    /// [`end_redo`](Self::end_redo).
    pub fn begin_redo(&mut self) {
        self.staging.clear();
        self.redoing = true;
    }

    /// Stages one reading of the generation being rebuilt.
    pub fn redo_reading(&mut self, x: f64, y: f64, time: Timestamp) {
        if !self.redoing {
            warn!("redo_reading called without begin_redo; ignored");
            return;
        }
        push_bounded(&mut self.staging, self.capacity, TimedPoint::new(x, y, time));
    }

    /// Installs the staged generation as the buffer contents.
    pub fn end_redo(&mut self) {
        if !self.redoing {
            warn!("end_redo called without begin_redo; ignored");
            return;
        }
        std::mem::swap(&mut self.points, &mut self.staging);
        self.staging.clear();
        self.redoing = false;
    }

    /// Closest reading on the arc from `start` to `end` (degrees, relative to
    /// `origin.th`, counter-clockwise). Returns `max_range` when nothing is
    /// closer than that.
    pub fn closest_polar(&self, start: f64, end: f64, origin: &Pose2D, max_range: f64) -> f64 {
        self.closest_polar_with_angle(start, end, origin, max_range).0
    }

    /// As [`closest_polar`](Self::closest_polar), also returning the bearing
    /// of the hit relative to `origin.th`.
    pub fn closest_polar_with_angle(
        &self,
        start: f64,
        end: f64,
        origin: &Pose2D,
        max_range: f64,
    ) -> (f64, Option<f64>) {
        let mut closest = max_range;
        let mut closest_angle = None;
        for p in self.points.iter().filter(|p| !p.invalid) {
            let point = p.point();
            let angle = origin.relative_angle_to(&point);
            if !angle_between(angle, start, end) {
                continue;
            }
            let dist = origin.distance_to(&point);
            if dist < closest {
                closest = dist;
                closest_angle = Some(angle);
            }
        }
        (closest, closest_angle)
    }

    /// Closest reading inside the rectangle spanned by the two corners, which
    /// are given in `origin`'s frame. Returns `max_range` when nothing is
    /// closer than that.
    pub fn closest_box(&self, x1: f64, y1: f64, x2: f64, y2: f64, origin: &Pose2D, max_range: f64) -> f64 {
        self.closest_box_with_point(x1, y1, x2, y2, origin, max_range).0
    }

    /// As [`closest_box`](Self::closest_box), also returning the global
    /// position of the hit.
    pub fn closest_box_with_point(
        &self,
        x1: f64,
        y1: f64,
        x2: f64,
        y2: f64,
        origin: &Pose2D,
        max_range: f64,
    ) -> (f64, Option<Point2D>) {
        let (min_x, max_x) = if x1 <= x2 { (x1, x2) } else { (x2, x1) };
        let (min_y, max_y) = if y1 <= y2 { (y1, y2) } else { (y2, y1) };
        let to_global = Transform::new(*origin);

        let mut closest = max_range;
        let mut closest_point = None;
        for p in self.points.iter().filter(|p| !p.invalid) {
            let point = p.point();
            let local = to_global.do_inv_transform(&point);
            if local.x < min_x || local.x > max_x || local.y < min_y || local.y > max_y {
                continue;
            }
            let dist = origin.distance_to(&point);
            if dist < closest {
                closest = dist;
                closest_point = Some(point);
            }
        }
        (closest, closest_point)
    }

    /// Rewrites every reading through `transform`.
    pub fn apply_transform(&mut self, transform: &Transform) {
        for p in self.points.iter_mut() {
            let moved = transform.do_transform(&Point2D::new(p.x, p.y));
            p.x = moved.x;
            p.y = moved.y;
        }
    }
}

impl Default for RangeBuffer {
    fn default() -> Self {
        RangeBuffer::new(0)
    }
}

fn push_bounded(queue: &mut VecDeque<TimedPoint>, capacity: usize, point: TimedPoint) -> bool {
    if capacity == 0 {
        return false;
    }
    while queue.len() >= capacity {
        queue.pop_front();
    }
    queue.push_back(point);
    true
}
