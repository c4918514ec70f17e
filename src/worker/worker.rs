use std::{
    io,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::debug;

use crate::{
    context::Termination,
    models::message::{Slot, WorkerEvent},
};

use super::executor::{Executor, SlotOutcome};

const IDLE_POLL: Duration = Duration::from_millis(100);

/// Starts a worker that serves slots until the slot channel closes or its
/// termination fires. Every slot it takes is answered with exactly one event.
pub fn spawn_worker_thread(
    worker_id: usize,
    slots: Receiver<Slot>,
    events: Sender<WorkerEvent>,
    executor: Arc<Executor>,
    termination: Termination,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("worker-{}", worker_id))
        .spawn(move || worker_loop(worker_id, &slots, &events, &executor, &termination))
}

fn worker_loop(
    worker_id: usize,
    slots: &Receiver<Slot>,
    events: &Sender<WorkerEvent>,
    executor: &Executor,
    termination: &Termination,
) {
    debug!("Worker {} started.", worker_id);
    loop {
        if termination.is_set() {
            let _ = events.send(WorkerEvent::Terminated {
                worker_id,
                task_id: None,
                consumed_slot: false,
            });
            break;
        }

        let slot = match slots.recv_timeout(IDLE_POLL) {
            Ok(slot) => slot,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| executor.run_slot(worker_id, termination, events)));
        let event = match outcome {
            Ok(Ok(SlotOutcome::Idle)) => WorkerEvent::Finished { worker_id, result: None },
            Ok(Ok(SlotOutcome::Completed(result))) => WorkerEvent::Finished {
                worker_id,
                result: Some(result),
            },
            Ok(Ok(SlotOutcome::Requeued(task_id))) => {
                let _ = events.send(WorkerEvent::Terminated {
                    worker_id,
                    task_id: Some(task_id),
                    consumed_slot: true,
                });
                break;
            }
            Ok(Err(e)) => WorkerEvent::Errored {
                worker_id,
                message: e.to_string(),
            },
            Err(_) => WorkerEvent::Errored {
                worker_id,
                message: format!("worker panicked while serving slot {}", slot.0),
            },
        };
        let _ = events.send(event);
    }
    debug!("Worker {} exiting.", worker_id);
}
