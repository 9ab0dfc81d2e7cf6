//! Sensor fusion policies
//!
//! One module per kind of range sensor. Each provides the sample-source trait
//! its driver implements, a thread-safe source for drivers that just push
//! samples, the policy that turns samples into buffer insertions, and a
//! settings block with a constructor for the finished device.

/// Bumper banks.
pub mod bumpers;
/// Map forbidden zones.
pub mod forbidden;
/// Scanning laser.
pub mod laser;
/// Sonar ring.
pub mod sonar;

pub use bumpers::{bumper_device, BumperPolicy, BumperSettings, BumperSource};
pub use forbidden::{forbidden_device, ForbiddenSettings, ForbiddenZoneHandle, ForbiddenZonePolicy};
pub use laser::{laser_device, AngleRange, LaserBeam, LaserPolicy, LaserScan, LaserSettings, LaserSource, LatestScan};
pub use sonar::{sonar_device, SonarBank, SonarPolicy, SonarReading, SonarSettings, SonarSource, SonarTransducer};
