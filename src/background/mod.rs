//! # Background Task Processor
//!
//! Single-consumer queue of deferred catalog-affecting work, executed by one
//! named worker thread. Two task kinds exist:
//!
//! - **Force checkpoint**: writes a full or delta checkpoint through the WAL
//!   manager. Submitted by the supervisor during writable bring-up (where it
//!   is waited on synchronously before the periodic triggers start) and by
//!   the checkpoint triggers.
//! - **Cleanup**: removes dropped catalog entries that fell behind the
//!   visibility horizon.
//!
//! Every task carries a [`TaskHandle`]; `submit` is fire-and-forget but any
//! holder of the handle may `wait` for completion and observe the task's
//! error, which is how the supervisor makes bring-up step ordering strict.
//!
//! `stop` drains the queue — already-submitted work completes — and then
//! joins the worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Instant;

use eyre::{bail, Result};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::trigger::PeriodicTrigger;
use crate::wal::WalManager;

/// Completion handle shared between the submitter and the worker.
pub struct TaskHandle {
    completed: Mutex<bool>,
    cond: Condvar,
    error: Mutex<Option<String>>,
}

impl TaskHandle {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            completed: Mutex::new(false),
            cond: Condvar::new(),
            error: Mutex::new(None),
        })
    }

    fn complete(&self, error: Option<String>) {
        *self.error.lock() = error;
        let mut completed = self.completed.lock();
        *completed = true;
        self.cond.notify_all();
    }

    /// Blocks until the task finishes; surfaces the task's error.
    pub fn wait(&self) -> Result<()> {
        let mut completed = self.completed.lock();
        while !*completed {
            self.cond.wait(&mut completed);
        }
        drop(completed);
        match self.error.lock().take() {
            None => Ok(()),
            Some(msg) => bail!("background task failed: {}", msg),
        }
    }

    pub fn is_completed(&self) -> bool {
        *self.completed.lock()
    }
}

enum BgTaskKind {
    ForceCheckpoint { ts: u64, full: bool },
    Cleanup { visible_ts: u64 },
}

/// A deferred unit of work for the background worker.
pub struct BgTask {
    kind: BgTaskKind,
    handle: Arc<TaskHandle>,
}

impl BgTask {
    pub fn force_checkpoint(ts: u64, full: bool) -> Self {
        Self {
            kind: BgTaskKind::ForceCheckpoint { ts, full },
            handle: TaskHandle::new(),
        }
    }

    pub fn cleanup(visible_ts: u64) -> Self {
        Self {
            kind: BgTaskKind::Cleanup { visible_ts },
            handle: TaskHandle::new(),
        }
    }

    pub fn handle(&self) -> Arc<TaskHandle> {
        Arc::clone(&self.handle)
    }
}

struct ProcessorShared {
    queue: Mutex<Vec<BgTask>>,
    work_ready: Condvar,
    shutdown: AtomicBool,
    wal: Arc<WalManager>,
    catalog: Arc<Catalog>,
    cleanup_trigger: Mutex<Weak<dyn PeriodicTrigger>>,
}

pub struct BgTaskProcessor {
    shared: Arc<ProcessorShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl BgTaskProcessor {
    pub fn new(wal: Arc<WalManager>, catalog: Arc<Catalog>) -> Self {
        Self {
            shared: Arc::new(ProcessorShared {
                queue: Mutex::new(Vec::new()),
                work_ready: Condvar::new(),
                shutdown: AtomicBool::new(false),
                wal,
                catalog,
                cleanup_trigger: Mutex::new(Weak::<NoTrigger>::new()),
            }),
            worker: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    /// Registers the installed cleanup trigger so forced cleanups can reset
    /// its timer.
    pub fn set_cleanup_trigger(&self, trigger: Weak<dyn PeriodicTrigger>) {
        *self.shared.cleanup_trigger.lock() = trigger;
    }

    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("opal-bg".to_string())
            .spawn(move || worker_loop(&shared))
            .expect("failed to spawn background task worker");
        *self.worker.lock() = Some(handle);
        info!("background task processor started");
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Enqueues a task. Tasks submitted before `start` run once the worker
    /// comes up.
    pub fn submit(&self, task: BgTask) {
        let mut queue = self.shared.queue.lock();
        queue.push(task);
        self.shared.work_ready.notify_one();
    }

    /// Drains the queue and joins the worker.
    pub fn stop(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        {
            let _queue = self.shared.queue.lock();
            self.shared.work_ready.notify_all();
        }
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        self.started.store(false, Ordering::Release);
        info!("background task processor stopped");
    }

    pub fn queued_tasks(&self) -> usize {
        self.shared.queue.lock().len()
    }
}

/// Placeholder type so the weak trigger slot has a concrete default.
struct NoTrigger;

impl PeriodicTrigger for NoTrigger {
    fn name(&self) -> &'static str {
        "none"
    }

    fn interval_secs(&self) -> i64 {
        0
    }

    fn is_due(&self, _now: Instant) -> bool {
        false
    }

    fn fire(&self) {}

    fn reset_timer(&self) {}
}

fn worker_loop(shared: &ProcessorShared) {
    loop {
        let task = {
            let mut queue = shared.queue.lock();
            loop {
                if !queue.is_empty() {
                    break queue.remove(0);
                }
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                shared.work_ready.wait(&mut queue);
            }
        };

        let outcome = match task.kind {
            BgTaskKind::ForceCheckpoint { ts, full } => shared
                .wal
                .checkpoint(&shared.catalog, ts, full)
                .map(|written| {
                    debug!(ts, full, written, "checkpoint task finished");
                }),
            BgTaskKind::Cleanup { visible_ts } => {
                let removed = shared.catalog.cleanup_dropped(visible_ts);
                if !removed.is_empty() {
                    info!(visible_ts, count = removed.len(), "cleanup removed entries");
                }
                if let Some(trigger) = shared.cleanup_trigger.lock().upgrade() {
                    trigger.reset_timer();
                }
                Ok(())
            }
        };

        match outcome {
            Ok(()) => task.handle.complete(None),
            Err(e) => {
                warn!("background task failed: {:#}", e);
                task.handle.complete(Some(format!("{:#}", e)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlushMethod;
    use tempfile::tempdir;

    fn processor(dir: &std::path::Path) -> (BgTaskProcessor, Arc<WalManager>, Arc<Catalog>) {
        let wal = Arc::new(
            WalManager::new(
                &dir.join("wal"),
                &dir.join("data"),
                u64::MAX,
                u64::MAX,
                FlushMethod::PerCommit,
            )
            .unwrap(),
        );
        let catalog = Arc::new(Catalog::new());
        let bg = BgTaskProcessor::new(Arc::clone(&wal), Arc::clone(&catalog));
        (bg, wal, catalog)
    }

    #[test]
    fn force_checkpoint_task_is_waitable() {
        let dir = tempdir().unwrap();
        let (bg, _wal, catalog) = processor(dir.path());
        catalog.create_database("db1", "", 1).unwrap();
        bg.start();

        let task = BgTask::force_checkpoint(1, true);
        let handle = task.handle();
        bg.submit(task);
        handle.wait().unwrap();
        assert!(handle.is_completed());
        assert_eq!(catalog.pending_delta_ops(), 0);

        bg.stop();
    }

    #[test]
    fn cleanup_task_prunes_dropped_databases() {
        let dir = tempdir().unwrap();
        let (bg, _wal, catalog) = processor(dir.path());
        catalog.create_database("doomed", "", 1).unwrap();
        catalog.drop_database("doomed", 2).unwrap();
        bg.start();

        let task = BgTask::cleanup(10);
        let handle = task.handle();
        bg.submit(task);
        handle.wait().unwrap();
        assert_eq!(catalog.database_count(), 0);

        bg.stop();
    }

    #[test]
    fn stop_drains_submitted_tasks() {
        let dir = tempdir().unwrap();
        let (bg, _wal, catalog) = processor(dir.path());
        catalog.create_database("db1", "", 1).unwrap();

        // Submitted before start: the worker picks them up on spawn, and
        // stop must not return until they ran.
        let task = BgTask::force_checkpoint(1, true);
        let handle = task.handle();
        bg.submit(task);
        bg.start();
        bg.stop();

        assert!(handle.is_completed());
    }

    #[test]
    fn failed_task_surfaces_error_to_waiter() {
        let dir = tempdir().unwrap();
        let (bg, wal, catalog) = processor(dir.path());
        bg.start();

        // Remove the WAL directory out from under the checkpoint to force a
        // write failure.
        drop(wal);
        std::fs::remove_dir_all(dir.path().join("wal")).unwrap();
        catalog.create_database("db1", "", 1).unwrap();

        let task = BgTask::force_checkpoint(1, true);
        let handle = task.handle();
        bg.submit(task);
        assert!(handle.wait().is_err());

        bg.stop();
    }
}
