//! Fixed-size pool of worker threads draining a task list.
//!
//! The pool owner feeds one [`Slot`] per claimable task into a shared
//! channel; each slot is answered by exactly one `Finished` or `Errored`
//! event (or a `Terminated` event with `consumed_slot`). The pool is drained
//! once every slot has been answered, which happens exactly when the list
//! runs dry. A worker killed mid-task is replaced along with its slot, so the
//! requeued task is still picked up.

use std::{collections::BTreeMap, sync::Arc, thread::JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, info, warn};

use crate::{
    context::{FarmContext, Termination},
    models::{
        message::{Slot, WorkerEvent},
        task::RunResult,
    },
};

use super::{executor::Executor, worker::spawn_worker_thread};

struct WorkerHandle {
    termination: Termination,
    thread: JoinHandle<()>,
}

pub struct WorkerPool {
    ctx: Arc<FarmContext>,
    executor: Arc<Executor>,
    slot_tx: Option<Sender<Slot>>,
    slot_rx: Receiver<Slot>,
    event_tx: Sender<WorkerEvent>,
    event_rx: Receiver<WorkerEvent>,
    workers: BTreeMap<usize, WorkerHandle>,
    next_worker_id: usize,
    next_slot: usize,
    outstanding: usize,
}

impl WorkerPool {
    pub fn start(ctx: Arc<FarmContext>, pool_size: usize, n_slots: usize, executor: Arc<Executor>) -> Self {
        let (slot_tx, slot_rx) = unbounded();
        let (event_tx, event_rx) = unbounded();
        let mut pool = WorkerPool {
            ctx,
            executor,
            slot_tx: Some(slot_tx),
            slot_rx,
            event_tx,
            event_rx,
            workers: BTreeMap::new(),
            next_worker_id: 0,
            next_slot: 0,
            outstanding: 0,
        };

        for _ in 0..n_slots {
            pool.send_slot();
        }
        if pool.outstanding == 0 {
            pool.slot_tx = None;
        }
        for _ in 0..pool_size.max(1) {
            pool.spawn_worker();
        }
        info!("Started {} workers for {} slots.", pool.workers.len(), n_slots);
        pool
    }

    pub fn events(&self) -> &Receiver<WorkerEvent> {
        &self.event_rx
    }

    /// True once every slot has been answered.
    pub fn is_drained(&self) -> bool {
        self.outstanding == 0
    }

    /// Bookkeeping for an event taken from [`WorkerPool::events`]. Must be
    /// called for every event, in the order received.
    pub fn account(&mut self, event: &WorkerEvent) {
        match event {
            WorkerEvent::Started { .. } => {}
            WorkerEvent::Finished { .. } => self.answer_slot(),
            WorkerEvent::Errored { worker_id, message } => {
                error!("Worker {} failed: {}", worker_id, message);
                self.answer_slot();
            }
            WorkerEvent::Terminated {
                worker_id,
                consumed_slot,
                ..
            } => {
                debug!("Worker {} terminated.", worker_id);
                if self.ctx.is_shutting_down() {
                    if *consumed_slot {
                        self.answer_slot();
                    }
                    return;
                }
                if *consumed_slot {
                    self.outstanding -= 1;
                    self.send_slot();
                }
                self.spawn_worker();
            }
        }
    }

    /// Blocks for the next event, `None` once the pool is drained.
    pub fn next_event(&mut self) -> Option<WorkerEvent> {
        if self.is_drained() {
            return None;
        }
        let event = self.event_rx.recv().ok()?;
        self.account(&event);
        Some(event)
    }

    /// Slot answers in completion order: `Some` for a task that ran, `None`
    /// for a slot that found nothing to claim or failed.
    pub fn results(&mut self) -> Results<'_> {
        Results { pool: self }
    }

    /// Forced termination of one worker: its in-flight task is requeued and a
    /// replacement worker takes over.
    pub fn terminate_worker(&self, worker_id: usize) -> bool {
        match self.workers.get(&worker_id) {
            Some(worker) => {
                worker.termination.fire();
                true
            }
            None => false,
        }
    }

    /// Stops the whole pool. Running tasks are terminated and requeued.
    pub fn terminate(&mut self) {
        warn!("Terminating worker pool.");
        self.ctx.request_shutdown();
        self.slot_tx = None;
    }

    /// True once no worker thread is running any more.
    pub fn workers_exited(&self) -> bool {
        self.workers.values().all(|worker| worker.thread.is_finished())
    }

    /// Waits for every worker thread to exit.
    pub fn join(&mut self) {
        self.slot_tx = None;
        for (worker_id, worker) in std::mem::take(&mut self.workers) {
            if worker.thread.join().is_err() {
                error!("Worker {} panicked.", worker_id);
            }
        }
    }

    fn send_slot(&mut self) {
        if let Some(slot_tx) = &self.slot_tx {
            if slot_tx.send(Slot(self.next_slot)).is_ok() {
                self.next_slot += 1;
                self.outstanding += 1;
            }
        }
    }

    fn answer_slot(&mut self) {
        self.outstanding = self.outstanding.saturating_sub(1);
        if self.outstanding == 0 {
            // Idle workers see the channel close and exit.
            self.slot_tx = None;
        }
    }

    fn spawn_worker(&mut self) {
        let worker_id = self.next_worker_id;
        self.next_worker_id += 1;
        let termination = self.ctx.termination();

        match spawn_worker_thread(
            worker_id,
            self.slot_rx.clone(),
            self.event_tx.clone(),
            Arc::clone(&self.executor),
            termination.clone(),
        ) {
            Ok(thread) => {
                self.workers.insert(worker_id, WorkerHandle { termination, thread });
            }
            Err(e) => error!("Failed to spawn worker {}: {}", worker_id, e),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            self.terminate();
            self.join();
        }
    }
}

pub struct Results<'a> {
    pool: &'a mut WorkerPool,
}

impl Iterator for Results<'_> {
    type Item = Option<RunResult>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.pool.next_event()? {
                WorkerEvent::Finished { result, .. } => return Some(result),
                WorkerEvent::Errored { .. } => return Some(None),
                WorkerEvent::Started { .. } | WorkerEvent::Terminated { .. } => continue,
            }
        }
    }
}
