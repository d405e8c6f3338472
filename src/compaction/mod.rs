//! # Compaction Processor
//!
//! Writable-only worker that merges a table's small active segments into one
//! and dumps in-memory index state into the catalog. Replicas never run it:
//! compaction rewrites shared state that only the primary may touch.
//!
//! Jobs arrive through `submit`; the periodic triggers call
//! [`CompactionProcessor::trigger_compaction`] /
//! [`CompactionProcessor::trigger_optimize`], which scan the catalog for
//! candidates and enqueue one job per table. Each job runs in its own
//! transaction so the segment rewrite is logged and replayable like any
//! other commit.
//!
//! `stop` drains queued jobs, then joins the worker.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use eyre::{Result, WrapErr};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::txn::TxnManager;

/// A unit of compaction work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompactionJob {
    CompactTable { database: String, table: String },
    OptimizeIndex { database: String, table: String },
}

struct ProcessorShared {
    queue: Mutex<Vec<CompactionJob>>,
    work_ready: Condvar,
    shutdown: AtomicBool,
    catalog: Arc<Catalog>,
    txn_mgr: Arc<TxnManager>,
    jobs_completed: AtomicU64,
}

pub struct CompactionProcessor {
    shared: Arc<ProcessorShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl CompactionProcessor {
    pub fn new(catalog: Arc<Catalog>, txn_mgr: Arc<TxnManager>) -> Self {
        Self {
            shared: Arc::new(ProcessorShared {
                queue: Mutex::new(Vec::new()),
                work_ready: Condvar::new(),
                shutdown: AtomicBool::new(false),
                catalog,
                txn_mgr,
                jobs_completed: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("opal-compact".to_string())
            .spawn(move || worker_loop(&shared))
            .expect("failed to spawn compaction worker");
        *self.worker.lock() = Some(handle);
        info!("compaction processor started");
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn submit(&self, job: CompactionJob) {
        let mut queue = self.shared.queue.lock();
        queue.push(job);
        self.shared.work_ready.notify_one();
    }

    /// Scans the catalog and enqueues a compaction job per candidate table.
    pub fn trigger_compaction(&self) -> usize {
        let candidates = self.shared.catalog.compaction_candidates();
        let count = candidates.len();
        for (database, table) in candidates {
            self.submit(CompactionJob::CompactTable { database, table });
        }
        count
    }

    /// Enqueues an index-optimize job for every table carrying in-memory
    /// index state.
    pub fn trigger_optimize(&self) -> usize {
        let tables = self.shared.catalog.tables_with_mem_index();
        let count = tables.len();
        for (database, table) in tables {
            self.submit(CompactionJob::OptimizeIndex { database, table });
        }
        count
    }

    /// Drains queued jobs and joins the worker.
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
        info!("compaction processor stopped");
    }

    pub fn jobs_completed(&self) -> u64 {
        self.shared.jobs_completed.load(Ordering::Relaxed)
    }
}

fn worker_loop(shared: &ProcessorShared) {
    loop {
        let job = {
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

        if let Err(e) = run_job(shared, &job) {
            warn!("compaction job {:?} failed: {:#}", job, e);
        }
        shared.jobs_completed.fetch_add(1, Ordering::Relaxed);
    }
}

fn run_job(shared: &ProcessorShared, job: &CompactionJob) -> Result<()> {
    match job {
        CompactionJob::CompactTable { database, table } => {
            if shared.catalog.active_segment_count(database, table) < 2 {
                return Ok(());
            }
            let mut txn = shared
                .txn_mgr
                .begin_txn(format!("compact {}.{}", database, table))
                .wrap_err("failed to begin compaction transaction")?;
            txn.compact_segments(database, table);
            let commit_ts = shared.txn_mgr.commit_txn(txn)?;
            debug!(database, table, commit_ts, "segments compacted");
        }
        CompactionJob::OptimizeIndex { database, table } => {
            let mut txn = shared
                .txn_mgr
                .begin_txn(format!("optimize index {}.{}", database, table))
                .wrap_err("failed to begin index optimize transaction")?;
            txn.dump_mem_index(database, table);
            let commit_ts = shared.txn_mgr.commit_txn(txn)?;
            debug!(database, table, commit_ts, "index optimized");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferManager;
    use crate::config::{FlushMethod, PAGE_SIZE};
    use crate::wal::WalManager;
    use tempfile::tempdir;

    fn setup(dir: &std::path::Path) -> (Arc<Catalog>, Arc<TxnManager>) {
        let buffer = Arc::new(
            BufferManager::new(
                16 * PAGE_SIZE,
                &dir.join("data"),
                &dir.join("tmp"),
                None,
                2,
            )
            .unwrap(),
        );
        buffer.start().unwrap();
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
        let txn_mgr = Arc::new(TxnManager::new(buffer, wal, Arc::clone(&catalog), 0));
        txn_mgr.start();
        (catalog, txn_mgr)
    }

    fn seed_segments(catalog: &Catalog, txn_mgr: &TxnManager, count: usize) {
        let mut txn = txn_mgr.begin_txn("seed").unwrap();
        txn.create_database("db1", "").unwrap();
        txn.create_table("db1", "t").unwrap();
        for _ in 0..count {
            txn.add_segment("db1", "t", 100, 4096);
        }
        txn_mgr.commit_txn(txn).unwrap();
        assert_eq!(catalog.active_segment_count("db1", "t"), count);
    }

    #[test]
    fn compaction_job_merges_segments() {
        let dir = tempdir().unwrap();
        let (catalog, txn_mgr) = setup(dir.path());
        seed_segments(&catalog, &txn_mgr, 3);
        catalog.init_compaction_alg(0);

        let processor = CompactionProcessor::new(Arc::clone(&catalog), txn_mgr);
        processor.start();
        assert_eq!(processor.trigger_compaction(), 1);
        processor.stop();

        assert_eq!(catalog.active_segment_count("db1", "t"), 1);
        assert_eq!(processor.jobs_completed(), 1);
    }

    #[test]
    fn single_segment_tables_are_not_candidates() {
        let dir = tempdir().unwrap();
        let (catalog, txn_mgr) = setup(dir.path());
        seed_segments(&catalog, &txn_mgr, 1);
        catalog.init_compaction_alg(0);

        let processor = CompactionProcessor::new(Arc::clone(&catalog), txn_mgr);
        processor.start();
        assert_eq!(processor.trigger_compaction(), 0);
        processor.stop();
    }

    #[test]
    fn optimize_job_dumps_mem_index_state() {
        let dir = tempdir().unwrap();
        let (catalog, txn_mgr) = setup(dir.path());
        seed_segments(&catalog, &txn_mgr, 1);
        catalog.set_mem_index_bytes("db1", "t", 2048).unwrap();

        let processor = CompactionProcessor::new(Arc::clone(&catalog), txn_mgr);
        processor.start();
        assert_eq!(processor.trigger_optimize(), 1);
        processor.stop();

        assert!(catalog.tables_with_mem_index().is_empty());
    }

    #[test]
    fn stop_drains_queued_jobs() {
        let dir = tempdir().unwrap();
        let (catalog, txn_mgr) = setup(dir.path());
        seed_segments(&catalog, &txn_mgr, 4);
        catalog.init_compaction_alg(0);

        let processor = CompactionProcessor::new(Arc::clone(&catalog), txn_mgr);
        processor.submit(CompactionJob::CompactTable {
            database: "db1".to_string(),
            table: "t".to_string(),
        });
        processor.start();
        processor.stop();

        assert_eq!(catalog.active_segment_count("db1", "t"), 1);
    }
}
