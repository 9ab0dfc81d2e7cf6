// tasks/sync_task.rs

// Cooperative per-cycle scheduler. Tasks form a tree: branches group children
// by priority, leaves carry a callback. Running a node runs its callback (for a
// leaf) and then its children from the highest priority down. Nodes in a
// terminal state are skipped together with their subtree. The tree lives in an
// arena; a node's parent is an index and removing a node drops its subtree and
// unhooks it from the parent.
//
// The tree takes no locks. Whoever owns it must keep structural changes off
// the cycle thread while `run` is in progress.

// Dependencies
use log::{info, warn};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Work done by a leaf each cycle.
pub type TaskCallback = Arc<dyn Fn() + Send + Sync>;

/// Supplies the elapsed time above which a leaf run is reported.
pub type WarningTimeCallback = Box<dyn Fn() -> Option<Duration> + Send + Sync>;

/// Returns true when overrun warnings should be held back this cycle.
pub type NoWarningCallback = Box<dyn Fn() -> bool + Send + Sync>;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Created and not yet run.
    Init,
    /// Running again after a suspension.
    Resume,
    /// Running.
    Active,
    /// Paused.
    Suspend,
    /// Finished successfully.
    Success,
    /// Finished with an error.
    Failure,
}

impl TaskState {
    /// Terminal states are not run until reset.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Suspend | TaskState::Success | TaskState::Failure)
    }

    /// Upper-case name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            TaskState::Init => "INIT",
            TaskState::Resume => "RESUME",
            TaskState::Active => "ACTIVE",
            TaskState::Suspend => "SUSPEND",
            TaskState::Success => "SUCCESS",
            TaskState::Failure => "FAILURE",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Handle to a node of a [`SyncTaskTree`]. A handle to a removed node stays
/// dead even after its slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId {
    index: usize,
    generation: u32,
}

struct Slot {
    generation: u32,
    node: Option<TaskNode>,
}

struct TaskNode {
    name: String,
    state: TaskState,
    callback: Option<TaskCallback>,
    // Equal priorities keep insertion order inside the Vec.
    children: BTreeMap<i32, Vec<TaskId>>,
    parent: Option<TaskId>,
    last_elapsed: Option<Duration>,
}

/// Arena-backed tree of named, prioritised tasks.
pub struct SyncTaskTree {
    nodes: Vec<Slot>,
    free: Vec<usize>,
    root: TaskId,
    running: Option<TaskId>,
    warning_time_cb: Option<WarningTimeCallback>,
    no_warning_cb: Option<NoWarningCallback>,
}

impl SyncTaskTree {
    /// Creates a tree whose root is a branch named `root_name`.
    pub fn new(root_name: &str) -> Self {
        SyncTaskTree {
            nodes: vec![Slot {
                generation: 0,
                node: Some(TaskNode {
                    name: root_name.to_string(),
                    state: TaskState::Init,
                    callback: None,
                    children: BTreeMap::new(),
                    parent: None,
                    last_elapsed: None,
                }),
            }],
            free: Vec::new(),
            root: TaskId { index: 0, generation: 0 },
            running: None,
            warning_time_cb: None,
            no_warning_cb: None,
        }
    }

    /// The root branch.
    pub fn root(&self) -> TaskId {
        self.root
    }

    /// True if `id` names a live node.
    pub fn contains(&self, id: TaskId) -> bool {
        self.node(id).is_some()
    }

    /// Number of live nodes, root included.
    pub fn len(&self) -> usize {
        self.nodes.iter().filter(|slot| slot.node.is_some()).count()
    }

    /// Always false; the root cannot be removed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sets where the overrun threshold comes from.
    pub fn set_warning_time_cb(&mut self, cb: WarningTimeCallback) {
        self.warning_time_cb = Some(cb);
    }

    /// Sets the predicate that holds overrun warnings back.
    pub fn set_no_time_warning_cb(&mut self, cb: NoWarningCallback) {
        self.no_warning_cb = Some(cb);
    }

    /// Adds a branch under `parent`. Returns `None` if `parent` is gone or is a leaf.
    pub fn add_new_branch(&mut self, parent: TaskId, name: &str, priority: i32, state: TaskState) -> Option<TaskId> {
        self.insert(parent, name, priority, None, state)
    }

    /// Adds a leaf under `parent`. Returns `None` if `parent` is gone or is a leaf.
    pub fn add_new_leaf(
        &mut self,
        parent: TaskId,
        name: &str,
        priority: i32,
        callback: TaskCallback,
        state: TaskState,
    ) -> Option<TaskId> {
        self.insert(parent, name, priority, Some(callback), state)
    }

    /// Removes a node and everything below it. The root cannot be removed.
    pub fn remove(&mut self, id: TaskId) -> bool {
        if id == self.root || !self.contains(id) {
            return false;
        }
        if let Some(parent) = self.node(id).and_then(|n| n.parent) {
            if let Some(parent) = self.node_mut(parent) {
                for ids in parent.children.values_mut() {
                    ids.retain(|c| *c != id);
                }
                parent.children.retain(|_, ids| !ids.is_empty());
            }
        }
        let mut pending = vec![id];
        while let Some(next) = pending.pop() {
            let Some(slot) = self.nodes.get_mut(next.index) else {
                continue;
            };
            if slot.generation != next.generation {
                continue;
            }
            if let Some(node) = slot.node.take() {
                pending.extend(node.children.into_values().flatten());
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(next.index);
            }
        }
        true
    }

    /// Name of the node.
    pub fn name(&self, id: TaskId) -> Option<&str> {
        self.node(id).map(|n| n.name.as_str())
    }

    /// State of the node.
    pub fn state(&self, id: TaskId) -> Option<TaskState> {
        self.node(id).map(|n| n.state)
    }

    /// Changes the state of the node. Returns false if it is gone.
    pub fn set_state(&mut self, id: TaskId, state: TaskState) -> bool {
        match self.node_mut(id) {
            Some(node) => {
                node.state = state;
                true
            }
            None => false,
        }
    }

    /// Parent of the node; `None` for the root.
    pub fn parent(&self, id: TaskId) -> Option<TaskId> {
        self.node(id).and_then(|n| n.parent)
    }

    /// True for a leaf.
    pub fn is_leaf(&self, id: TaskId) -> bool {
        self.node(id).map_or(false, |n| n.callback.is_some())
    }

    /// Children in the order `run` visits them.
    pub fn children(&self, id: TaskId) -> Vec<TaskId> {
        match self.node(id) {
            Some(node) => node
                .children
                .values()
                .rev()
                .flat_map(|ids| ids.iter().rev().copied())
                .collect(),
            None => Vec::new(),
        }
    }

    /// How long the leaf's callback took the last time it ran.
    pub fn last_elapsed(&self, id: TaskId) -> Option<Duration> {
        self.node(id).and_then(|n| n.last_elapsed)
    }

    /// Name of the leaf whose callback is executing, if any.
    pub fn running_task_name(&self) -> Option<&str> {
        self.running.and_then(|id| self.name(id))
    }

    /// Depth-first search below (and including) `from` for `name`.
    pub fn find(&self, from: TaskId, name: &str) -> Option<TaskId> {
        self.find_by(from, &|node: &TaskNode| node.name == name)
    }

    /// Depth-first search below (and including) `from` for the leaf holding
    /// `callback`.
    pub fn find_callback(&self, from: TaskId, callback: &TaskCallback) -> Option<TaskId> {
        self.find_by(from, &|node: &TaskNode| {
            node.callback
                .as_ref()
                .map_or(false, |cb| std::ptr::addr_eq(Arc::as_ptr(cb), Arc::as_ptr(callback)))
        })
    }

    /// Searches only the direct children of `from`.
    pub fn find_non_recursive(&self, from: TaskId, name: &str) -> Option<TaskId> {
        self.children(from)
            .into_iter()
            .find(|id| self.name(*id) == Some(name))
    }

    /// Runs `id` and its subtree once.
    pub fn run(&mut self, id: TaskId) {
        let (state, callback) = match self.node(id) {
            Some(node) => (node.state, node.callback.clone()),
            None => return,
        };
        if state.is_terminal() {
            return;
        }

        if let Some(callback) = callback {
            self.running = Some(id);
            let started = Instant::now();
            callback();
            let elapsed = started.elapsed();
            self.running = None;
            if let Some(node) = self.node_mut(id) {
                node.last_elapsed = Some(elapsed);
            }
            self.warn_if_slow(id, elapsed);
        }

        for child in self.children(id) {
            self.run(child);
        }
    }

    /// Logs the tree with each node's state, one line per node.
    pub fn log_tree(&self) {
        self.log_node(self.root, 0);
    }

    fn log_node(&self, id: TaskId, depth: usize) {
        if let Some(node) = self.node(id) {
            let kind = if node.callback.is_some() { "leaf" } else { "branch" };
            info!("{}{} ({}) {}", "    ".repeat(depth), node.name, kind, node.state);
            for child in self.children(id) {
                self.log_node(child, depth + 1);
            }
        }
    }

    /// The warning time `elapsed` ran past, if a leaf run that long would be
    /// reported now. No threshold or a zero one disables reporting, as does the
    /// no-warning callback returning true.
    pub fn overran(&self, elapsed: Duration) -> Option<Duration> {
        let limit = self.warning_time_cb.as_ref().and_then(|cb| cb())?;
        if limit.is_zero() || elapsed <= limit {
            return None;
        }
        if self.no_warning_cb.as_ref().map_or(false, |cb| cb()) {
            return None;
        }
        Some(limit)
    }

    fn warn_if_slow(&self, id: TaskId, elapsed: Duration) {
        let Some(limit) = self.overran(elapsed) else {
            return;
        };
        warn!(
            "Task '{}' took {} ms to run (longer than the {} ms warning time)",
            self.name(id).unwrap_or("?"),
            elapsed.as_millis(),
            limit.as_millis()
        );
    }

    fn insert(
        &mut self,
        parent: TaskId,
        name: &str,
        priority: i32,
        callback: Option<TaskCallback>,
        state: TaskState,
    ) -> Option<TaskId> {
        match self.node(parent) {
            Some(p) if p.callback.is_none() => {}
            Some(_) => {
                warn!("Cannot add '{}' under leaf task '{}'", name, self.name(parent).unwrap_or("?"));
                return None;
            }
            None => return None,
        }
        let node = TaskNode {
            name: name.to_string(),
            state,
            callback,
            children: BTreeMap::new(),
            parent: Some(parent),
            last_elapsed: None,
        };
        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.nodes[index];
                slot.node = Some(node);
                TaskId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.nodes.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                TaskId {
                    index: self.nodes.len() - 1,
                    generation: 0,
                }
            }
        };
        if let Some(p) = self.node_mut(parent) {
            p.children.entry(priority).or_default().push(id);
        }
        Some(id)
    }

    fn find_by(&self, from: TaskId, pred: &dyn Fn(&TaskNode) -> bool) -> Option<TaskId> {
        let node = self.node(from)?;
        if pred(node) {
            return Some(from);
        }
        self.children(from)
            .into_iter()
            .find_map(|child| self.find_by(child, pred))
    }

    fn node(&self, id: TaskId) -> Option<&TaskNode> {
        self.nodes
            .get(id.index)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_ref())
    }

    fn node_mut(&mut self, id: TaskId) -> Option<&mut TaskNode> {
        self.nodes
            .get_mut(id.index)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_mut())
    }
}

impl fmt::Debug for SyncTaskTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncTaskTree")
            .field("root", &self.name(self.root))
            .field("nodes", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recorder(log: &Arc<Mutex<Vec<String>>>, name: &str) -> TaskCallback {
        let log = log.clone();
        let name = name.to_string();
        Arc::new(move || log.lock().push(name.clone()))
    }

    #[test]
    fn test_runs_high_priority_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut tree = SyncTaskTree::new("root");
        let root = tree.root();
        tree.add_new_leaf(root, "low", 10, recorder(&log, "low"), TaskState::Init);
        tree.add_new_leaf(root, "high", 90, recorder(&log, "high"), TaskState::Init);
        tree.add_new_leaf(root, "mid", 50, recorder(&log, "mid"), TaskState::Active);

        tree.run(root);
        assert_eq!(*log.lock(), vec!["high", "mid", "low"]);
    }

    #[test]
    fn test_equal_priority_runs_latest_first_every_cycle() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut tree = SyncTaskTree::new("root");
        let root = tree.root();
        tree.add_new_leaf(root, "a", 5, recorder(&log, "a"), TaskState::Init);
        tree.add_new_leaf(root, "b", 5, recorder(&log, "b"), TaskState::Init);
        tree.add_new_leaf(root, "c", 5, recorder(&log, "c"), TaskState::Init);

        tree.run(root);
        tree.run(root);
        assert_eq!(*log.lock(), vec!["c", "b", "a", "c", "b", "a"]);
    }

    #[test]
    fn test_suspended_branch_skips_subtree() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut tree = SyncTaskTree::new("root");
        let root = tree.root();
        let branch = tree.add_new_branch(root, "branch", 10, TaskState::Init).unwrap();
        let c = count.clone();
        let leaf = tree
            .add_new_leaf(
                branch,
                "leaf",
                10,
                Arc::new(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                }),
                TaskState::Init,
            )
            .unwrap();

        tree.run(root);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tree.set_state(branch, TaskState::Suspend);
        tree.run(root);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tree.set_state(branch, TaskState::Active);
        tree.set_state(leaf, TaskState::Success);
        tree.run(root);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tree.set_state(leaf, TaskState::Resume);
        tree.run(root);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_find_by_name_and_callback() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut tree = SyncTaskTree::new("root");
        let root = tree.root();
        let sensors = tree.add_new_branch(root, "sensors", 50, TaskState::Init).unwrap();
        let cb = recorder(&log, "sonar");
        let sonar = tree.add_new_leaf(sensors, "sonar", 10, cb.clone(), TaskState::Init).unwrap();
        let other = recorder(&log, "other");

        assert_eq!(tree.find(root, "sonar"), Some(sonar));
        assert_eq!(tree.find(root, "missing"), None);
        assert_eq!(tree.find_callback(root, &cb), Some(sonar));
        assert_eq!(tree.find_callback(root, &other), None);
        assert_eq!(tree.find_non_recursive(root, "sonar"), None);
        assert_eq!(tree.find_non_recursive(sensors, "sonar"), Some(sonar));
    }

    #[test]
    fn test_remove_detaches_subtree() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut tree = SyncTaskTree::new("root");
        let root = tree.root();
        let branch = tree.add_new_branch(root, "branch", 10, TaskState::Init).unwrap();
        let leaf = tree
            .add_new_leaf(branch, "leaf", 1, recorder(&log, "leaf"), TaskState::Init)
            .unwrap();
        assert_eq!(tree.len(), 3);

        assert!(tree.remove(branch));
        assert!(!tree.contains(leaf));
        assert!(tree.children(root).is_empty());
        assert_eq!(tree.len(), 1);
        assert!(!tree.remove(root));

        tree.run(root);
        assert!(log.lock().is_empty());

        // Freed slots are reused.
        let again = tree.add_new_branch(root, "again", 1, TaskState::Init).unwrap();
        assert_eq!(tree.name(again), Some("again"));
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn test_cannot_add_under_leaf() {
        let mut tree = SyncTaskTree::new("root");
        let root = tree.root();
        let leaf = tree
            .add_new_leaf(root, "leaf", 1, Arc::new(|| {}), TaskState::Init)
            .unwrap();
        assert!(tree.add_new_branch(leaf, "child", 1, TaskState::Init).is_none());
        assert!(tree.is_leaf(leaf));
        assert_eq!(tree.parent(leaf), Some(root));
    }

    #[test]
    fn test_records_elapsed_time() {
        let mut tree = SyncTaskTree::new("root");
        let root = tree.root();
        tree.set_warning_time_cb(Box::new(|| Some(Duration::from_millis(1))));
        tree.set_no_time_warning_cb(Box::new(|| true));
        let leaf = tree
            .add_new_leaf(
                root,
                "slow",
                1,
                Arc::new(|| std::thread::sleep(Duration::from_millis(5))),
                TaskState::Init,
            )
            .unwrap();
        tree.run(root);
        assert!(tree.last_elapsed(leaf).unwrap() >= Duration::from_millis(5));
        assert!(tree.running_task_name().is_none());
    }

    #[rstest]
    #[case::under_threshold(Some(100), 80, false, None)]
    #[case::over_threshold(Some(100), 120, false, Some(100))]
    #[case::held_back(Some(100), 120, true, None)]
    #[case::zero_threshold(Some(0), 120, false, None)]
    #[case::no_threshold(None, 120, false, None)]
    fn test_overrun_reporting(
        #[case] limit_ms: Option<u64>,
        #[case] elapsed_ms: u64,
        #[case] held_back: bool,
        #[case] expected_ms: Option<u64>,
    ) {
        let mut tree = SyncTaskTree::new("root");
        tree.set_warning_time_cb(Box::new(move || limit_ms.map(Duration::from_millis)));
        tree.set_no_time_warning_cb(Box::new(move || held_back));
        assert_eq!(
            tree.overran(Duration::from_millis(elapsed_ms)),
            expected_ms.map(Duration::from_millis)
        );
    }

    #[test]
    fn test_overrun_without_callbacks_is_silent() {
        let tree = SyncTaskTree::new("root");
        assert_eq!(tree.overran(Duration::from_secs(10)), None);
    }

    #[test]
    fn test_removed_id_stays_dead_after_slot_reuse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut tree = SyncTaskTree::new("root");
        let root = tree.root();
        let old = tree.add_new_leaf(root, "old", 1, recorder(&log, "old"), TaskState::Init).unwrap();
        assert!(tree.remove(old));

        let new = tree.add_new_leaf(root, "new", 1, recorder(&log, "new"), TaskState::Init).unwrap();
        assert_ne!(old, new);
        assert!(!tree.contains(old));
        assert_eq!(tree.name(old), None);
        assert!(!tree.set_state(old, TaskState::Suspend));
        assert!(!tree.remove(old));
        assert_eq!(tree.state(new), Some(TaskState::Init));

        tree.run(old);
        assert!(log.lock().is_empty());
        tree.run(root);
        assert_eq!(*log.lock(), vec!["new"]);
    }
}
