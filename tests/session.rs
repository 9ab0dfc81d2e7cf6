// tests/session.rs
// Whole-stack runs: a session with real sensor devices fed by the bundled
// sample sources, stepped cycle by cycle on a manual clock.

use approx::assert_relative_eq;
use mockall::mock;
use mvr::core::{ManualClock, Pose2D, Timestamp};
use mvr::map::{InMemoryMap, MapObject};
use mvr::sensors::laser::{LaserBeam, LaserScan};
use mvr::sensors::{
    bumper_device, forbidden_device, laser_device, sonar_device, BumperSettings, BumperSource, ForbiddenSettings,
    LaserSettings, LatestScan, SonarBank, SonarSettings, SonarTransducer,
};
use mvr::{Clock, MvrConfig, Point2D, RobotSession, RobotState, SessionConfig};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

mock! {
    pub Bumpers {}
    impl BumperSource for Bumpers {
        fn stall_value(&self) -> u16;
        fn num_front_bumpers(&self) -> usize;
        fn num_rear_bumpers(&self) -> usize;
    }
}

fn session() -> (RobotSession, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(Timestamp::from_millis(1000)));
    let session = RobotSession::with_clock(SessionConfig::default(), clock.clone()).unwrap();
    (session, clock)
}

#[test]
fn test_sonar_readings_flow_into_device() {
    let (mut session, clock) = session();
    let settings = SonarSettings {
        transducers: vec![SonarTransducer { x: 100.0, y: 0.0, th: 0.0 }],
        ..SonarSettings::default()
    };
    let bank = Arc::new(SonarBank::new(&settings.transducers));
    let sonar = Arc::new(sonar_device(&settings, bank.clone(), clock.clone()));
    session.add_range_device(sonar.clone()).unwrap();
    session.robot().set_pose(Pose2D::new(0.0, 0.0, 90.0), clock.now());

    // Stamped for the next cycle.
    bank.record(0, 900.0, session.robot().counter() + 1, clock.now());
    session.run_once();
    let (range, angle) = sonar.closest_reading_polar_with_angle(-10.0, 10.0);
    assert_relative_eq!(range, 1000.0, epsilon = 1e-6);
    assert_relative_eq!(angle.unwrap(), 0.0, epsilon = 1e-6);
    assert_eq!(sonar.cumulative_len(), 1);

    // Not re-recorded, so the next cycle adds nothing.
    sonar.clear_current_readings();
    session.run_once();
    assert_eq!(sonar.current_len(), 0);
}

#[test]
fn test_bumper_hits_expire_from_current() {
    let (mut session, clock) = session();
    let mut source = MockBumpers::new();
    // Bumped on the first cycle only.
    let calls = AtomicUsize::new(0);
    source.expect_stall_value().returning(move || {
        if calls.fetch_add(1, Ordering::SeqCst) == 0 {
            1 << (3 + 8)
        } else {
            0
        }
    });
    source.expect_num_front_bumpers().return_const(5usize);
    source.expect_num_rear_bumpers().return_const(5usize);
    let bumpers = Arc::new(bumper_device(&BumperSettings::default(), Arc::new(source), clock.clone()));
    session.add_range_device(bumpers.clone()).unwrap();

    session.run_once();
    assert_eq!(bumpers.current_len(), 1);
    assert_relative_eq!(bumpers.closest_reading_polar(-5.0, 5.0), 250.0, epsilon = 1e-6);
    assert_eq!(bumpers.cumulative_len(), 0);

    clock.advance(Duration::from_secs(16));
    session.run_once();
    assert_eq!(bumpers.current_len(), 0);
}

#[test]
fn test_laser_and_forbidden_zone_in_one_cycle() {
    let (mut session, clock) = session();
    let scans = Arc::new(LatestScan::new());
    let laser = Arc::new(laser_device(&LaserSettings::default(), scans.clone(), clock.clone()));
    let map = Arc::new(InMemoryMap::new(vec![MapObject::forbidden_line(
        Point2D::new(0.0, -1000.0),
        Point2D::new(0.0, 1000.0),
    )]));
    let (forbidden, zones) = forbidden_device(&ForbiddenSettings::default(), map.clone(), clock.clone());
    let forbidden = Arc::new(forbidden);
    session.add_range_device(laser.clone()).unwrap();
    session.add_range_device(forbidden.clone()).unwrap();
    session.robot().set_pose(Pose2D::new(-600.0, 0.0, 0.0), clock.now());

    scans.publish(LaserScan {
        counter: session.robot().counter() + 1,
        time: None,
        sensor: Pose2D::origin(),
        beams: vec![
            LaserBeam { range: 2000.0, bearing: 0.0 },
            LaserBeam { range: 20_000.0, bearing: 90.0 },
        ],
        error: false,
    });
    session.run_once();

    assert_eq!(laser.current_len(), 1);
    assert_relative_eq!(laser.closest_reading_polar(-5.0, 5.0), 2000.0, epsilon = 1e-6);
    assert_relative_eq!(forbidden.closest_reading_polar(-5.0, 5.0), 600.0, epsilon = 1e-6);
    assert_eq!(forbidden.current_len(), 21);

    zones.disable();
    map.add_object(MapObject::forbidden_line(Point2D::new(-700.0, 0.0), Point2D::new(-700.0, 100.0)));
    session.run_once();
    assert_eq!(forbidden.current_len(), 0);
    zones.enable();
    session.run_once();
    assert_eq!(forbidden.current_len(), 23);
}

#[test]
fn test_session_from_config() {
    let config = MvrConfig::from_yaml_str("session: { cycle_ms: 20, robot_radius: 300.0 }\n").unwrap();
    let session = RobotSession::new(config.session).unwrap();
    assert_eq!(session.robot().robot_radius(), 300.0);
    assert_eq!(session.config().cycle_ms, 20);
}
