// session.rs

// The robot session: the owner of the per-cycle task tree, the shared robot
// state and the registered range devices. Each cycle bumps the robot counter
// and runs the tree once; sensor interpretation (priority 50) runs before the
// user tasks (priority 20). The session can drive itself on a dedicated
// thread at a fixed period, and hands itself back when that thread is joined.
//
// Structural changes (adding or removing devices and tasks) go through
// `&mut self`, so they can never race the tree while it runs.

// Dependencies
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::core::{Clock, MonotonicClock, SharedRobotState};
use crate::error::{MvrError, Result};
use crate::range::RangeDevice;
use crate::tasks::{SyncTaskTree, TaskCallback, TaskId, TaskState};

/// Name of the root task.
pub const ROOT_TASK: &str = "robotTask";
/// Name of the branch holding the range devices.
pub const SENSOR_INTERP_TASK: &str = "sensorInterp";
/// Name of the branch holding user tasks.
pub const USER_TASKS: &str = "userTasks";

const SENSOR_INTERP_PRIORITY: i32 = 50;
const USER_TASKS_PRIORITY: i32 = 20;

/// Cycle timing and robot geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Cycle period (ms).
    pub cycle_ms: u64,
    /// Leaves running longer than this are reported (ms); 0 disables.
    pub cycle_warning_ms: u64,
    /// Cycles at startup during which overruns are not reported.
    pub startup_grace_cycles: u64,
    /// Robot radius (mm).
    pub robot_radius: f64,
    /// Poses kept for looking up where the robot was at a past instant.
    pub pose_history_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            cycle_ms: 100,
            cycle_warning_ms: 250,
            startup_grace_cycles: 10,
            robot_radius: 250.0,
            pose_history_size: 100,
        }
    }
}

/// Per-robot cycle driver.
pub struct RobotSession {
    config: SessionConfig,
    robot: Arc<SharedRobotState>,
    clock: Arc<dyn Clock>,
    tasks: SyncTaskTree,
    root: TaskId,
    sensor_interp: TaskId,
    user_tasks: TaskId,
    devices: Vec<(Arc<RangeDevice>, TaskId)>,
    cycles: Arc<AtomicU64>,
}

impl RobotSession {
    /// Creates a session on the monotonic wall clock.
    pub fn new(config: SessionConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(MonotonicClock::new()))
    }

    /// Creates a session reading time from `clock`.
    pub fn with_clock(config: SessionConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        if config.cycle_ms == 0 {
            return Err(MvrError::InvalidConfig("session cycle_ms must be positive".to_string()));
        }
        let mut tasks = SyncTaskTree::new(ROOT_TASK);
        let root = tasks.root();
        let sensor_interp = tasks
            .add_new_branch(root, SENSOR_INTERP_TASK, SENSOR_INTERP_PRIORITY, TaskState::Init)
            .ok_or_else(|| MvrError::Session(format!("could not create {}", SENSOR_INTERP_TASK)))?;
        let user_tasks = tasks
            .add_new_branch(root, USER_TASKS, USER_TASKS_PRIORITY, TaskState::Init)
            .ok_or_else(|| MvrError::Session(format!("could not create {}", USER_TASKS)))?;

        let cycles = Arc::new(AtomicU64::new(0));
        let warning = Duration::from_millis(config.cycle_warning_ms);
        tasks.set_warning_time_cb(Box::new(move || Some(warning)));
        let grace = config.startup_grace_cycles;
        let seen = cycles.clone();
        tasks.set_no_time_warning_cb(Box::new(move || seen.load(Ordering::Relaxed) <= grace));

        info!(
            "Session created: cycle {} ms, warning at {} ms",
            config.cycle_ms, config.cycle_warning_ms
        );
        Ok(RobotSession {
            robot: Arc::new(SharedRobotState::new(config.robot_radius, config.pose_history_size)),
            config,
            clock,
            tasks,
            root,
            sensor_interp,
            user_tasks,
            devices: Vec::new(),
            cycles,
        })
    }

    /// The session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The shared robot state.
    pub fn robot(&self) -> &Arc<SharedRobotState> {
        &self.robot
    }

    /// The clock devices read time from.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// The cycle task tree.
    pub fn tasks(&self) -> &SyncTaskTree {
        &self.tasks
    }

    /// The cycle task tree, mutably.
    pub fn tasks_mut(&mut self) -> &mut SyncTaskTree {
        &mut self.tasks
    }

    /// The sensor-interpretation branch.
    pub fn sensor_interp_task(&self) -> TaskId {
        self.sensor_interp
    }

    /// The user-task branch.
    pub fn user_tasks_task(&self) -> TaskId {
        self.user_tasks
    }

    /// Cycles run so far.
    pub fn cycle_count(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Attaches the robot to `device` and schedules it under sensor
    /// interpretation. A device whose name is already registered is refused.
    pub fn add_range_device(&mut self, device: Arc<RangeDevice>) -> Option<TaskId> {
        if self.find_range_device(device.name()).is_some() {
            warn!("Range device '{}' is already registered", device.name());
            return None;
        }
        device.set_robot(self.robot.clone());
        let task = device.register_with(&mut self.tasks, self.sensor_interp)?;
        info!("Added range device '{}' at priority {}", device.name(), device.priority());
        self.devices.push((device, task));
        Some(task)
    }

    /// Unschedules and forgets the device called `name`.
    pub fn remove_range_device(&mut self, name: &str) -> Option<Arc<RangeDevice>> {
        let index = self.devices.iter().position(|(d, _)| d.name() == name)?;
        let (device, task) = self.devices.remove(index);
        self.tasks.remove(task);
        info!("Removed range device '{}'", name);
        Some(device)
    }

    /// The registered device called `name`.
    pub fn find_range_device(&self, name: &str) -> Option<Arc<RangeDevice>> {
        self.devices
            .iter()
            .find(|(d, _)| d.name() == name)
            .map(|(d, _)| d.clone())
    }

    /// Every registered device.
    pub fn range_devices(&self) -> Vec<Arc<RangeDevice>> {
        self.devices.iter().map(|(d, _)| d.clone()).collect()
    }

    /// Schedules `callback` under the user-task branch.
    pub fn add_user_task(&mut self, name: &str, priority: i32, callback: TaskCallback) -> Option<TaskId> {
        self.tasks
            .add_new_leaf(self.user_tasks, name, priority, callback, TaskState::Init)
    }

    /// Removes the user task called `name`. Returns false if there is none.
    pub fn remove_user_task(&mut self, name: &str) -> bool {
        match self.tasks.find_non_recursive(self.user_tasks, name) {
            Some(id) => self.tasks.remove(id),
            None => false,
        }
    }

    /// One cycle: advance the counter, then run the whole tree.
    pub fn run_once(&mut self) {
        self.robot.increment_counter();
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.tasks.run(self.root);
    }

    /// Runs cycles at the configured period until `stop` is set.
    pub fn run(&mut self, stop: &AtomicBool) {
        let period = Duration::from_millis(self.config.cycle_ms);
        info!("Cycle loop started");
        while !stop.load(Ordering::Acquire) {
            let started = Instant::now();
            self.run_once();
            let elapsed = started.elapsed();
            if elapsed < period {
                thread::sleep(period - elapsed);
            }
        }
        info!("Cycle loop stopped after {} cycles", self.cycle_count());
    }

    /// Moves the session onto its own cycle thread.
    pub fn spawn(self) -> Result<SessionHandle> {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let thread = thread::Builder::new()
            .name(ROOT_TASK.to_string())
            .spawn(move || {
                let mut session = self;
                session.run(&flag);
                session
            })?;
        Ok(SessionHandle {
            stop,
            thread: Some(thread),
        })
    }
}

impl std::fmt::Debug for RobotSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RobotSession")
            .field("config", &self.config)
            .field("devices", &self.devices.len())
            .field("cycles", &self.cycle_count())
            .finish_non_exhaustive()
    }
}

/// Control of a session running on its own thread. Dropping the handle stops
/// the loop without waiting for it.
pub struct SessionHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<RobotSession>>,
}

impl SessionHandle {
    /// Asks the loop to finish after the current cycle.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// True once the cycle thread has exited.
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Stops the loop, waits for it and returns the session.
    pub fn join(mut self) -> Result<RobotSession> {
        self.stop();
        let thread = self
            .thread
            .take()
            .ok_or_else(|| MvrError::Session("cycle thread already joined".to_string()))?;
        thread
            .join()
            .map_err(|_| MvrError::Session("cycle thread panicked".to_string()))
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.stop();
        }
    }
}
