// core/geometry.rs

// Planar geometry shared by the range devices: poses with headings in degrees,
// points, rigid transforms between frames and line segments. Distances are in
// millimetres. Headings are kept in (-180, 180].

// Dependencies
use nalgebra::{Isometry2, Point2, Vector2};
use serde::{Deserialize, Serialize};

/// Normalises an angle in degrees to (-180, 180].
pub fn fix_angle(angle: f64) -> f64 {
    if !angle.is_finite() {
        return 0.0;
    }
    let mut a = angle % 360.0;
    if a > 180.0 {
        a -= 360.0;
    } else if a <= -180.0 {
        a += 360.0;
    }
    a
}

/// `a - b`, normalised.
pub fn sub_angle(a: f64, b: f64) -> f64 {
    fix_angle(a - b)
}

/// `a + b`, normalised.
pub fn add_angle(a: f64, b: f64) -> f64 {
    fix_angle(a + b)
}

/// True when `angle` lies on the counter-clockwise arc from `start` to `end`.
///
/// When `start > end` (after normalisation) the arc wraps through 180, so
/// `(10, -10)` is the 340 degree arc behind the robot rather than the 20 degree
/// arc in front of it.
pub fn angle_between(angle: f64, start: f64, end: f64) -> bool {
    let angle = fix_angle(angle);
    let start = fix_angle(start);
    let end = fix_angle(end);
    if start < end {
        angle >= start && angle <= end
    } else {
        angle >= start || angle <= end
    }
}

/// A 2D point in millimetres.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point2D {
    /// X coordinate (mm).
    pub x: f64,
    /// Y coordinate (mm).
    pub y: f64,
}

impl Point2D {
    /// Creates a point.
    pub fn new(x: f64, y: f64) -> Self {
        Point2D { x, y }
    }

    /// Squared distance to another point (avoids sqrt).
    #[inline]
    pub fn squared_distance_to(&self, other: &Point2D) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        dx * dx + dy * dy
    }

    /// Euclidean distance to another point.
    #[inline]
    pub fn distance_to(&self, other: &Point2D) -> f64 {
        self.squared_distance_to(other).sqrt()
    }
}

/// Robot or sensor pose: position in millimetres, heading in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose2D {
    /// X coordinate (mm).
    pub x: f64,
    /// Y coordinate (mm).
    pub y: f64,
    /// Heading (degrees, counter-clockwise from +x).
    pub th: f64,
}

impl Pose2D {
    /// Creates a pose with the heading normalised.
    pub fn new(x: f64, y: f64, th: f64) -> Self {
        Pose2D {
            x,
            y,
            th: fix_angle(th),
        }
    }

    /// Pose at the origin facing +x.
    pub fn origin() -> Self {
        Pose2D::default()
    }

    /// The position without the heading.
    pub fn position(&self) -> Point2D {
        Point2D::new(self.x, self.y)
    }

    /// Squared distance from this pose's position to `point`.
    pub fn squared_distance_to(&self, point: &Point2D) -> f64 {
        self.position().squared_distance_to(point)
    }

    /// Distance from this pose's position to `point`.
    pub fn distance_to(&self, point: &Point2D) -> f64 {
        self.position().distance_to(point)
    }

    /// Global bearing from this pose's position to `point`, in degrees.
    pub fn angle_to(&self, point: &Point2D) -> f64 {
        (point.y - self.y).atan2(point.x - self.x).to_degrees()
    }

    /// Bearing to `point` relative to this pose's heading.
    pub fn relative_angle_to(&self, point: &Point2D) -> f64 {
        sub_angle(self.angle_to(point), self.th)
    }
}

/// Rigid 2D transform (rotation then translation).
///
/// `Transform::new(pose)` maps points expressed in the frame of `pose` into the
/// frame `pose` itself is expressed in; for a robot pose that is local to
/// global. `Transform::between(from, to)` moves points that were recorded
/// relative to `from` so they keep the same relation to `to`, which is how
/// buffers are carried along when the odometry frame is corrected.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    iso: Isometry2<f64>,
}

impl Transform {
    /// Transform that leaves points where they are.
    pub fn identity() -> Self {
        Transform {
            iso: Isometry2::identity(),
        }
    }

    /// Local-to-global transform for `pose`.
    pub fn new(pose: Pose2D) -> Self {
        Transform {
            iso: Isometry2::new(Vector2::new(pose.x, pose.y), pose.th.to_radians()),
        }
    }

    /// Transform taking the frame of `from` onto the frame of `to`.
    pub fn between(from: Pose2D, to: Pose2D) -> Self {
        let from = Transform::new(from);
        let to = Transform::new(to);
        Transform {
            iso: to.iso * from.iso.inverse(),
        }
    }

    /// The transform undoing this one.
    pub fn inverse(&self) -> Self {
        Transform {
            iso: self.iso.inverse(),
        }
    }

    /// Maps `point` from the local frame to the outer one.
    pub fn do_transform(&self, point: &Point2D) -> Point2D {
        let p = self.iso * Point2::new(point.x, point.y);
        Point2D::new(p.x, p.y)
    }

    /// Maps `point` from the outer frame back to the local one.
    pub fn do_inv_transform(&self, point: &Point2D) -> Point2D {
        let p = self.iso.inverse_transform_point(&Point2::new(point.x, point.y));
        Point2D::new(p.x, p.y)
    }

    /// Maps a pose, rotating its heading along with its position.
    pub fn do_transform_pose(&self, pose: &Pose2D) -> Pose2D {
        let p = self.do_transform(&pose.position());
        Pose2D::new(p.x, p.y, pose.th + self.iso.rotation.angle().to_degrees())
    }
}

impl Default for Transform {
    fn default() -> Self {
        Transform::identity()
    }
}

/// Line segment between two points.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LineSegment {
    /// First endpoint.
    pub start: Point2D,
    /// Second endpoint.
    pub end: Point2D,
}

impl LineSegment {
    /// Creates a segment.
    pub fn new(start: Point2D, end: Point2D) -> Self {
        LineSegment { start, end }
    }

    /// Length of the segment (mm).
    pub fn length(&self) -> f64 {
        self.start.distance_to(&self.end)
    }

    /// Foot of the perpendicular from `point`, if it falls on the segment.
    pub fn perp_point(&self, point: &Point2D) -> Option<Point2D> {
        let a = Vector2::new(self.start.x, self.start.y);
        let d = Vector2::new(self.end.x, self.end.y) - a;
        let len2 = d.norm_squared();
        if len2 <= f64::EPSILON {
            return None;
        }
        let t = (Vector2::new(point.x, point.y) - a).dot(&d) / len2;
        if !(0.0..=1.0).contains(&t) {
            return None;
        }
        let foot = a + d * t;
        Some(Point2D::new(foot.x, foot.y))
    }

    /// Distance from `point` to the segment: perpendicular distance when the
    /// foot lies on the segment, otherwise the nearer endpoint.
    pub fn distance_to(&self, point: &Point2D) -> f64 {
        match self.perp_point(point) {
            Some(foot) => foot.distance_to(point),
            None => self
                .start
                .distance_to(point)
                .min(self.end.distance_to(point)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rstest::rstest;

    #[rstest]
    #[case(0.0, 0.0)]
    #[case(180.0, 180.0)]
    #[case(-180.0, 180.0)]
    #[case(190.0, -170.0)]
    #[case(-190.0, 170.0)]
    #[case(720.0, 0.0)]
    #[case(355.0, -5.0)]
    fn test_fix_angle(#[case] input: f64, #[case] expected: f64) {
        assert_relative_eq!(fix_angle(input), expected, epsilon = 1e-9);
    }

    #[rstest]
    #[case(5.0, -10.0, 10.0, true)]
    #[case(-5.0, -10.0, 10.0, true)]
    #[case(90.0, -10.0, 10.0, false)]
    #[case(90.0, 10.0, -10.0, true)]
    #[case(180.0, 10.0, -10.0, true)]
    #[case(5.0, 10.0, -10.0, false)]
    #[case(-5.0, 10.0, -10.0, false)]
    fn test_angle_between(
        #[case] angle: f64,
        #[case] start: f64,
        #[case] end: f64,
        #[case] expected: bool,
    ) {
        assert_eq!(angle_between(angle, start, end), expected);
    }

    #[test]
    fn test_transform_local_to_global() {
        let t = Transform::new(Pose2D::new(1000.0, 0.0, 90.0));
        let p = t.do_transform(&Point2D::new(100.0, 0.0));
        assert_relative_eq!(p.x, 1000.0, epsilon = 1e-9);
        assert_relative_eq!(p.y, 100.0, epsilon = 1e-9);

        let back = t.do_inv_transform(&p);
        assert_relative_eq!(back.x, 100.0, epsilon = 1e-9);
        assert_relative_eq!(back.y, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_transform_between_keeps_relative_position() {
        let from = Pose2D::new(0.0, 0.0, 0.0);
        let to = Pose2D::new(500.0, 500.0, 90.0);
        let t = Transform::between(from, to);
        // A point 100mm ahead of `from` ends up 100mm ahead of `to`.
        let p = t.do_transform(&Point2D::new(100.0, 0.0));
        assert_relative_eq!(p.x, 500.0, epsilon = 1e-9);
        assert_relative_eq!(p.y, 600.0, epsilon = 1e-9);
    }

    #[test]
    fn test_segment_distance() {
        let seg = LineSegment::new(Point2D::new(0.0, 0.0), Point2D::new(1000.0, 0.0));
        assert_relative_eq!(seg.distance_to(&Point2D::new(500.0, 30.0)), 30.0);
        // Past the end the nearer endpoint is used.
        assert_relative_eq!(seg.distance_to(&Point2D::new(1100.0, 0.0)), 100.0);
        assert!(seg.perp_point(&Point2D::new(-1.0, 5.0)).is_none());
    }

    #[test]
    fn test_relative_angle() {
        let pose = Pose2D::new(0.0, 0.0, 90.0);
        let ahead = Point2D::new(0.0, 100.0);
        assert_relative_eq!(pose.relative_angle_to(&ahead), 0.0, epsilon = 1e-9);
    }
}
