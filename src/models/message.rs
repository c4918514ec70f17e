use super::task::RunResult;

/// One unit of work handed to the pool. A worker receiving a slot makes a
/// single claim attempt against the task list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot(pub usize);

/// What workers report back to the pool owner.
#[derive(Debug)]
pub enum WorkerEvent {
    Started { worker_id: usize, task_id: u64, command: String },
    /// Answer to a slot. `None` when nothing was claimed.
    Finished { worker_id: usize, result: Option<RunResult> },
    /// The worker stopped on a termination request. `task_id` is the task it
    /// returned to the list, if it held one; `consumed_slot` tells whether a
    /// slot went unanswered because of it.
    Terminated { worker_id: usize, task_id: Option<u64>, consumed_slot: bool },
    /// Answer to a slot whose cycle failed outright.
    Errored { worker_id: usize, message: String },
}
