// src/main.rs
// Demo for mvr: a simulated robot driving a circle with sonar, bumpers, a laser
// and map forbidden zones, all interpreted by the range-device core.

// Imports dependencies and mvr modules.
// - env_logger: log output, level from the config file unless RUST_LOG is set.
// - mvr: session, sensors and map.
use log::{info, warn};
use mvr::core::ManualClock;
use mvr::map::InMemoryMap;
use mvr::sensors::laser::{LaserBeam, LaserScan};
use mvr::sensors::{bumper_device, forbidden_device, laser_device, sonar_device, BumperSource, LatestScan, SonarBank};
use mvr::{Clock, MapObject, MvrConfig, Point2D, Pose2D, RobotSession, RobotState};
use std::error::Error;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

const CYCLES: u64 = 50;
const CIRCLE_RADIUS: f64 = 1500.0;
// A wall the sensors can see, north of the circle.
const WALL_Y: f64 = 2200.0;

/// Bumper state written by the simulation.
#[derive(Default)]
struct SimBumpers {
    stall: AtomicU16,
}

impl BumperSource for SimBumpers {
    fn stall_value(&self) -> u16 {
        self.stall.load(Ordering::Relaxed)
    }

    fn num_front_bumpers(&self) -> usize {
        5
    }

    fn num_rear_bumpers(&self) -> usize {
        5
    }
}

/// Range from `pose` along global heading `th` to the wall, if it is hit.
fn wall_range(pose: &Pose2D, th: f64) -> Option<f64> {
    let s = th.to_radians().sin();
    if s <= 1e-6 {
        return None;
    }
    Some((WALL_Y - pose.y) / s)
}

/// Main function: builds the session, then steps the simulation one robot
/// cycle at a time.
fn main() -> Result<(), Box<dyn Error>> {
    let config = match std::env::args().nth(1) {
        Some(path) => MvrConfig::from_file(&path)?,
        None => MvrConfig::default(),
    };
    env_logger::Builder::new()
        .filter_level(config.logging.level_filter()?)
        .parse_default_env()
        .init();
    info!("Starting mvr demo...");

    let clock = Arc::new(ManualClock::default());
    let mut session = RobotSession::with_clock(config.session.clone(), clock.clone())?;

    let sonar_bank = Arc::new(SonarBank::new(&config.sonar.transducers));
    let sonar = Arc::new(sonar_device(&config.sonar, sonar_bank.clone(), clock.clone()));
    let bumpers = Arc::new(SimBumpers::default());
    let bumper = Arc::new(bumper_device(&config.bumpers, bumpers.clone(), clock.clone()));
    let scans = Arc::new(LatestScan::new());
    let laser = Arc::new(laser_device(&config.laser, scans.clone(), clock.clone()));
    let map = Arc::new(InMemoryMap::new(vec![
        MapObject::forbidden_line(Point2D::new(-500.0, -500.0), Point2D::new(500.0, -500.0)),
        MapObject::forbidden_area(Point2D::new(1200.0, -200.0), Point2D::new(1800.0, 200.0), 45.0).with_name("dock"),
    ]));
    let (forbidden, zones) = forbidden_device(&config.forbidden, map.clone(), clock.clone());
    let forbidden = Arc::new(forbidden);

    for device in [&sonar, &bumper, &laser, &forbidden] {
        if session.add_range_device(device.clone()).is_none() {
            warn!("Could not add range device '{}'", device.name());
        }
    }
    session.tasks().log_tree();

    let period = Duration::from_millis(config.session.cycle_ms);
    for cycle in 0..CYCLES {
        // Drive: one revolution over the run, heading tangent to the circle.
        let phase = cycle as f64 / CYCLES as f64 * 360.0;
        let pose = Pose2D::new(
            CIRCLE_RADIUS * phase.to_radians().cos(),
            CIRCLE_RADIUS * phase.to_radians().sin(),
            phase + 90.0,
        );
        clock.advance(period);
        session.robot().set_pose(pose, clock.now());
        let counter = session.robot().counter() + 1;

        for (i, t) in config.sonar.transducers.iter().enumerate() {
            match wall_range(&pose, pose.th + t.th) {
                Some(range) if range > 0.0 => sonar_bank.record(i, range, counter, clock.now()),
                _ => sonar_bank.set_ignore(i),
            }
        }
        let beams = (-90..=90)
            .map(|deg| {
                let bearing = deg as f64;
                LaserBeam {
                    range: wall_range(&pose, pose.th + bearing).unwrap_or(f64::INFINITY),
                    bearing,
                }
            })
            .collect();
        scans.publish(LaserScan {
            counter,
            time: Some(clock.now()),
            sensor: Pose2D::origin(),
            beams,
            error: false,
        });
        // Bump the middle front segment once a quarter turn.
        let stall = if cycle % (CYCLES / 4) == 0 { 1 << (3 + 8) } else { 0 };
        bumpers.stall.store(stall, Ordering::Relaxed);
        if cycle == CYCLES / 2 {
            info!("Disabling forbidden zones");
            zones.disable();
        }

        session.run_once();

        let (range, angle) = laser.closest_reading_polar_with_angle(-45.0, 45.0);
        let (forbidden_range, _) = forbidden.closest_reading_polar_with_angle(-180.0, 180.0);
        info!(
            "Cycle {:>2}: pose ({:.0}, {:.0}, {:.0}) laser ahead {:.0} mm at {:?} deg, sonar ahead {:.0} mm, forbidden {:.0} mm, bumps {}",
            cycle,
            pose.x,
            pose.y,
            pose.th,
            range,
            angle.map(|a| a.round()),
            sonar.closest_reading_polar(-45.0, 45.0),
            forbidden_range,
            bumper.current_len()
        );
    }

    info!(
        "mvr demo completed: {} cycles, {} cumulative laser points, {} cumulative sonar points",
        session.cycle_count(),
        laser.cumulative_len(),
        sonar.cumulative_len()
    );
    Ok(())
}
