// sensors/bumpers.rs

// Bumper interpretation. The robot reports a stall word whose high byte is the
// front bumper bank and low byte the rear bank; bit i+1 of a bank is its
// segment i. Segments are spread evenly over an angular range centred on the
// front (or back) of the robot, and a triggered segment becomes a point on the
// robot's circumference in that direction. Bumps only matter briefly, so the
// cumulative buffer is never fed.

// Dependencies
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;

use crate::core::{Clock, Point2D, Transform};
use crate::range::{CycleContext, DeviceBuffers, DeviceSettings, FilterParams, RangeDevice, SensorFusionPolicy};

/// Bumper state as reported by the robot.
#[cfg_attr(test, mockall::automock)]
pub trait BumperSource: Send + Sync {
    /// Front bank in the high byte, rear bank in the low byte.
    fn stall_value(&self) -> u16;

    /// Number of bumper segments on the front bank.
    fn num_front_bumpers(&self) -> usize;

    /// Number of bumper segments on the rear bank.
    fn num_rear_bumpers(&self) -> usize;
}

/// Which side of the robot a bumper bank is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BumperBank {
    /// Facing the direction of travel.
    Front,
    /// Facing backwards.
    Rear,
}

/// Robot-relative heading of segment `index` of `count` on `bank`, with the
/// segments spread over `angle_range` degrees.
pub fn segment_angle(bank: BumperBank, index: usize, count: usize, angle_range: f64) -> f64 {
    let step = angle_range / count as f64;
    let offset = index as f64 * step + step / 2.0 - angle_range / 2.0;
    match bank {
        BumperBank::Front => -offset,
        BumperBank::Rear => 180.0 + offset,
    }
}

/// Settings of a bumper device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BumperSettings {
    /// Device settings; a partial block keeps the bumper defaults.
    #[serde(deserialize_with = "bumper_device_settings")]
    pub device: DeviceSettings,
    /// Angular spread of each bank (degrees).
    pub angle_range: f64,
}

impl Default for BumperSettings {
    fn default() -> Self {
        BumperSettings {
            device: DeviceSettings {
                name: "bumpers".to_string(),
                max_range: 5000.0,
                current_buffer_size: 30,
                cumulative_buffer_size: 30,
                priority: 75,
                filter: FilterParams {
                    max_seconds_current: Some(15.0),
                    ..FilterParams::default()
                },
            },
            angle_range: 135.0,
        }
    }
}

fn bumper_device_settings<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DeviceSettings, D::Error> {
    DeviceSettings::deserialize_over(&BumperSettings::default().device, deserializer)
}

/// Fusion policy for front and rear bumper banks.
pub struct BumperPolicy {
    source: Arc<dyn BumperSource>,
    angle_range: f64,
}

impl BumperPolicy {
    /// Policy spreading each bank over `angle_range` degrees.
    pub fn new(source: Arc<dyn BumperSource>, angle_range: f64) -> Self {
        BumperPolicy { source, angle_range }
    }

    fn add_bank(
        &self,
        buffers: &mut DeviceBuffers,
        ctx: &CycleContext<'_>,
        bank: BumperBank,
        bits: u16,
        count: usize,
    ) {
        let to_global = Transform::new(ctx.pose);
        for i in 0..count.min(15) {
            if bits & (1 << (i + 1)) == 0 {
                continue;
            }
            let th = segment_angle(bank, i, count, self.angle_range).to_radians();
            let local = Point2D::new(ctx.robot_radius * th.cos(), ctx.robot_radius * th.sin());
            let global = to_global.do_transform(&local);
            buffers.add_current(global.x, global.y, ctx.now);
        }
    }
}

impl SensorFusionPolicy for BumperPolicy {
    fn kind(&self) -> &'static str {
        "bumpers"
    }

    fn process(&mut self, buffers: &mut DeviceBuffers, ctx: &CycleContext<'_>) {
        let stall = self.source.stall_value();
        let front = (stall & 0xff00) >> 8;
        let rear = stall & 0x00ff;
        if front != 0 {
            self.add_bank(buffers, ctx, BumperBank::Front, front, self.source.num_front_bumpers());
        }
        if rear != 0 {
            self.add_bank(buffers, ctx, BumperBank::Rear, rear, self.source.num_rear_bumpers());
        }
    }
}

/// Builds a bumper range device reading from `source`.
pub fn bumper_device(settings: &BumperSettings, source: Arc<dyn BumperSource>, clock: Arc<dyn Clock>) -> RangeDevice {
    let policy = BumperPolicy::new(source, settings.angle_range);
    RangeDevice::new(&settings.device, Box::new(policy), clock)
}
