// sensors/sonar.rs

// Sonar ring interpretation. Each transducer reports one range per robot
// packet; a reading is new when it was taken on the current cycle's counter.
// New readings are projected into the global frame from the transducer's
// mounting pose and the robot pose. A fresh return supersedes any cumulative
// point close to it, and readings far from the robot never make it into the
// cumulative buffer since sonar at long range is mostly noise.

// Dependencies
use log::{debug, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;

use crate::core::{Clock, Point2D, Pose2D, Timestamp, Transform};
use crate::range::{CycleContext, DeviceBuffers, DeviceSettings, FilterParams, RangeDevice, SensorFusionPolicy};

/// Mounting pose of one transducer in the robot frame.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SonarTransducer {
    /// X offset from the robot centre (mm).
    pub x: f64,
    /// Y offset from the robot centre (mm).
    pub y: f64,
    /// Heading relative to the robot (degrees).
    pub th: f64,
}

/// Latest sample of one transducer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SonarReading {
    /// Transducer the sample came from.
    pub transducer: SonarTransducer,
    /// Range along the transducer axis (mm).
    pub range: f64,
    /// Robot counter of the packet that carried the sample.
    pub counter_taken: u64,
    /// When the sample was taken.
    pub time: Timestamp,
    /// True when the sample carries no echo.
    pub ignore: bool,
}

impl SonarReading {
    /// True when the sample arrived on cycle `counter`.
    pub fn is_new(&self, counter: u64) -> bool {
        self.counter_taken == counter
    }

    /// Where the echo came from, in the robot frame.
    pub fn local_point(&self) -> Point2D {
        let th = self.transducer.th.to_radians();
        Point2D::new(
            self.transducer.x + self.range * th.cos(),
            self.transducer.y + self.range * th.sin(),
        )
    }

    /// Pose of the transducer in the global frame for `robot`.
    pub fn sensor_pose(&self, robot: &Pose2D) -> Pose2D {
        Transform::new(*robot).do_transform_pose(&Pose2D::new(
            self.transducer.x,
            self.transducer.y,
            self.transducer.th,
        ))
    }
}

/// Supplies the latest reading of each transducer.
#[cfg_attr(test, mockall::automock)]
pub trait SonarSource: Send + Sync {
    /// Latest reading of every transducer.
    fn readings(&self) -> Vec<SonarReading>;
}

/// Thread-safe store of the latest reading per transducer, written by the
/// packet handler and read by the sonar device.
#[derive(Debug)]
pub struct SonarBank {
    readings: RwLock<Vec<SonarReading>>,
}

impl SonarBank {
    /// Bank with one empty, ignored reading per transducer.
    pub fn new(transducers: &[SonarTransducer]) -> Self {
        let readings = transducers
            .iter()
            .map(|t| SonarReading {
                transducer: *t,
                range: 0.0,
                counter_taken: 0,
                time: Timestamp::default(),
                ignore: true,
            })
            .collect();
        SonarBank {
            readings: RwLock::new(readings),
        }
    }

    /// Number of transducers.
    pub fn len(&self) -> usize {
        self.readings.read().len()
    }

    /// True when the bank has no transducers.
    pub fn is_empty(&self) -> bool {
        self.readings.read().is_empty()
    }

    /// Records a sample for transducer `index`. Unknown indices are logged and
    /// dropped.
    pub fn record(&self, index: usize, range: f64, counter: u64, time: Timestamp) {
        let mut readings = self.readings.write();
        match readings.get_mut(index) {
            Some(reading) => {
                reading.range = range;
                reading.counter_taken = counter;
                reading.time = time;
                reading.ignore = false;
            }
            None => warn!("Sonar reading for unknown transducer {}", index),
        }
    }

    /// Flags transducer `index` so its readings are skipped until the next
    /// `record`.
    pub fn set_ignore(&self, index: usize) {
        if let Some(reading) = self.readings.write().get_mut(index) {
            reading.ignore = true;
        }
    }
}

impl SonarSource for SonarBank {
    fn readings(&self) -> Vec<SonarReading> {
        self.readings.read().clone()
    }
}

/// Settings of a sonar device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SonarSettings {
    /// Device settings; a partial block keeps the sonar defaults.
    #[serde(deserialize_with = "sonar_device_settings")]
    pub device: DeviceSettings,
    /// Cumulative points this close to a new reading are superseded (mm).
    pub near_dist: f64,
    /// Readings farther than this from the robot stay out of the cumulative
    /// buffer (mm).
    pub far_dist: f64,
    /// Transducer layout.
    pub transducers: Vec<SonarTransducer>,
}

impl Default for SonarSettings {
    fn default() -> Self {
        SonarSettings {
            device: DeviceSettings {
                name: "sonar".to_string(),
                max_range: 5000.0,
                current_buffer_size: 24,
                cumulative_buffer_size: 64,
                priority: 75,
                filter: FilterParams {
                    max_seconds_current: Some(3.0),
                    max_dist_cumulative: Some(3000.0),
                    ..FilterParams::default()
                },
            },
            near_dist: 50.0,
            far_dist: 3000.0,
            transducers: default_ring(),
        }
    }
}

fn sonar_device_settings<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DeviceSettings, D::Error> {
    DeviceSettings::deserialize_over(&SonarSettings::default().device, deserializer)
}

// Eight forward-facing transducers on a 200 mm radius.
fn default_ring() -> Vec<SonarTransducer> {
    [90.0, 50.0, 30.0, 10.0, -10.0, -30.0, -50.0, -90.0]
        .iter()
        .map(|th: &f64| SonarTransducer {
            x: 200.0 * th.to_radians().cos(),
            y: 200.0 * th.to_radians().sin(),
            th: *th,
        })
        .collect()
}

/// Optional filter on a reading's global position, with the transducer's
/// global heading; true drops it.
pub type SonarIgnorePredicate = Box<dyn Fn(Pose2D) -> bool + Send>;

/// Fusion policy for a sonar ring.
pub struct SonarPolicy {
    source: Arc<dyn SonarSource>,
    near_dist: f64,
    far_dist: f64,
    ignore: Option<SonarIgnorePredicate>,
}

impl SonarPolicy {
    /// Policy reading `source`; echoes beyond `far_dist` only reach the current buffer.
    pub fn new(source: Arc<dyn SonarSource>, near_dist: f64, far_dist: f64) -> Self {
        SonarPolicy {
            source,
            near_dist: near_dist.max(0.0),
            far_dist: far_dist.max(0.0),
            ignore: None,
        }
    }

    /// Adds a predicate that drops readings it returns true for.
    pub fn with_ignore_predicate(mut self, ignore: SonarIgnorePredicate) -> Self {
        self.ignore = Some(ignore);
        self
    }

    fn add_reading(&self, buffers: &mut DeviceBuffers, point: Point2D, ctx: &CycleContext<'_>) {
        buffers.add_current(point.x, point.y, ctx.now);

        let far_sq = self.far_dist * self.far_dist;
        if ctx.pose.squared_distance_to(&point) >= far_sq {
            return;
        }
        let near_sq = self.near_dist * self.near_dist;
        if near_sq > 0.0 {
            let superseded = buffers
                .cumulative_mut()
                .invalidate_where(|p| p.squared_distance_to(point.x, point.y) < near_sq);
            if superseded > 0 {
                debug!("sonar: reading superseded {} cumulative points", superseded);
            }
        }
        buffers.add_cumulative(point.x, point.y, &ctx.pose, ctx.now);
    }
}

impl SensorFusionPolicy for SonarPolicy {
    fn kind(&self) -> &'static str {
        "sonar"
    }

    fn process(&mut self, buffers: &mut DeviceBuffers, ctx: &CycleContext<'_>) {
        let to_global = Transform::new(ctx.pose);
        for reading in self.source.readings() {
            if !reading.is_new(ctx.counter) || reading.ignore || reading.range > ctx.max_range {
                continue;
            }
            let point = to_global.do_transform(&reading.local_point());
            if let Some(ignore) = &self.ignore {
                let th = reading.sensor_pose(&ctx.pose).th;
                if ignore(Pose2D::new(point.x, point.y, th)) {
                    continue;
                }
            }
            self.add_reading(buffers, point, ctx);
        }
    }
}

/// Builds a sonar range device reading from `source`.
pub fn sonar_device(settings: &SonarSettings, source: Arc<dyn SonarSource>, clock: Arc<dyn Clock>) -> RangeDevice {
    let policy = SonarPolicy::new(source, settings.near_dist, settings.far_dist);
    RangeDevice::new(&settings.device, Box::new(policy), clock)
}
