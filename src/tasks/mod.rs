//! Sensor-interpretation scheduling
//!
//! A tree of named tasks run once per robot cycle, highest priority first.

/// The task tree.
pub mod sync_task;

pub use sync_task::{NoWarningCallback, SyncTaskTree, TaskCallback, TaskId, TaskState, WarningTimeCallback};
