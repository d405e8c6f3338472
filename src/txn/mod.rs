//! # Transaction Manager
//!
//! Issues monotonically increasing commit timestamps seeded from the
//! `system_start_ts` materialized by WAL replay, and drives the commit
//! protocol: stage catalog ops on the transaction, make the commit record
//! durable through the WAL manager, then apply the ops to the catalog and
//! touch the affected segment pages through the buffer manager.
//!
//! ## Transaction Identity
//!
//! A transaction's begin timestamp doubles as its id. Timestamps come from
//! one atomic counter, so ids are unique and naturally ordered. The counter
//! resumes from `system_start_ts` after replay — timestamps never repeat
//! across restarts.
//!
//! ## Reader-Allowed Commits
//!
//! System-internal transactions performed during bring-up (default database
//! creation, the forced checkpoint) set `reader_allowed` so their effects
//! are visible to replicas mid bring-up. The flag travels in the WAL commit
//! record.
//!
//! ## Shutdown
//!
//! `stop` refuses new transactions and blocks until every in-flight
//! transaction commits or aborts. [`Transaction`] aborts itself on drop if
//! neither happened, so a panicking caller cannot wedge shutdown.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use tracing::{debug, info};

use crate::buffer::{BufferManager, PageKey};
use crate::catalog::{Catalog, CatalogOp};
use crate::wal::{WalManager, WalPayload};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum TxnState {
    #[default]
    Active,
    Committed,
    Aborted,
}

pub struct TxnManager {
    buffer: Arc<BufferManager>,
    wal: Arc<WalManager>,
    catalog: Arc<Catalog>,
    system_start_ts: u64,
    next_ts: AtomicU64,
    last_durable_ts: AtomicU64,
    active: Mutex<HashSet<u64>>,
    drained: Condvar,
    started: AtomicBool,
    stopping: AtomicBool,
}

impl TxnManager {
    pub fn new(
        buffer: Arc<BufferManager>,
        wal: Arc<WalManager>,
        catalog: Arc<Catalog>,
        system_start_ts: u64,
    ) -> Self {
        Self {
            buffer,
            wal,
            catalog,
            system_start_ts,
            next_ts: AtomicU64::new(system_start_ts + 1),
            last_durable_ts: AtomicU64::new(system_start_ts),
            active: Mutex::new(HashSet::new()),
            drained: Condvar::new(),
            started: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
        }
    }

    pub fn start(&self) {
        self.started.store(true, Ordering::Release);
        info!(system_start_ts = self.system_start_ts, "transaction manager started");
    }

    /// Refuses new transactions and waits for in-flight ones to drain.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        let mut active = self.active.lock();
        while !active.is_empty() {
            self.drained.wait(&mut active);
        }
        drop(active);
        self.started.store(false, Ordering::Release);
        info!("transaction manager stopped");
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// The timestamp replay handed to this manager.
    pub fn system_start_ts(&self) -> u64 {
        self.system_start_ts
    }

    /// Highest timestamp issued so far.
    pub fn latest_ts(&self) -> u64 {
        self.next_ts.load(Ordering::Acquire) - 1
    }

    /// Highest commit timestamp known durable on disk.
    pub fn last_durable_ts(&self) -> u64 {
        self.last_durable_ts.load(Ordering::Acquire)
    }

    /// Called by the WAL flusher once a batch of commits has been synced.
    pub fn note_durable_ts(&self, ts: u64) {
        self.last_durable_ts.fetch_max(ts, Ordering::AcqRel);
    }

    pub fn active_txn_count(&self) -> usize {
        self.active.lock().len()
    }

    pub fn begin_txn(&self, text: impl Into<String>) -> Result<Transaction<'_>> {
        ensure!(self.is_started(), "transaction manager is not started");
        ensure!(
            !self.stopping.load(Ordering::Acquire),
            "transaction manager is draining"
        );

        let begin_ts = self.next_ts.fetch_add(1, Ordering::SeqCst);
        self.active.lock().insert(begin_ts);
        Ok(Transaction {
            manager: self,
            begin_ts,
            text: text.into(),
            reader_allowed: false,
            ops: SmallVec::new(),
            state: TxnState::Active,
        })
    }

    /// Commits `txn`: durable WAL record first, then catalog application,
    /// then segment page touch-up. Returns the commit timestamp.
    pub fn commit_txn(&self, mut txn: Transaction<'_>) -> Result<u64> {
        debug_assert!(txn.state == TxnState::Active, "commit of finished txn");
        let commit_ts = self.next_ts.fetch_add(1, Ordering::SeqCst);

        let payload = WalPayload::Commit {
            reader_allowed: txn.reader_allowed,
            ops: txn.ops.to_vec(),
        };
        self.wal
            .append_commit(commit_ts, &payload)
            .wrap_err_with(|| format!("failed to log commit of '{}'", txn.text))?;
        self.note_durable_ts(commit_ts);

        for op in txn.ops.iter() {
            self.catalog
                .apply(op.clone(), commit_ts, true)
                .wrap_err_with(|| format!("failed to apply committed op of '{}'", txn.text))?;
            self.materialize_segment(op)?;
        }

        txn.state = TxnState::Committed;
        self.release(txn.begin_ts);
        debug!(commit_ts, txn = %txn.text, "transaction committed");
        Ok(commit_ts)
    }

    pub fn abort_txn(&self, mut txn: Transaction<'_>) {
        txn.state = TxnState::Aborted;
        self.release(txn.begin_ts);
        debug!(begin_ts = txn.begin_ts, txn = %txn.text, "transaction aborted");
    }

    /// Stamps the header page of a freshly added segment so the data file
    /// exists before any reader asks for it.
    fn materialize_segment(&self, op: &CatalogOp) -> Result<()> {
        let CatalogOp::AddSegment {
            database,
            table,
            row_count,
            ..
        } = op
        else {
            return Ok(());
        };
        let Some(segment_id) = self.catalog.newest_active_segment_id(database, table) else {
            return Ok(());
        };

        let page = self.buffer.get_page(PageKey::new(segment_id, 0))?;
        let mut data = page.write();
        data[..8].copy_from_slice(&segment_id.to_le_bytes());
        data[8..16].copy_from_slice(&row_count.to_le_bytes());
        Ok(())
    }

    fn release(&self, begin_ts: u64) {
        let mut active = self.active.lock();
        active.remove(&begin_ts);
        if active.is_empty() {
            self.drained.notify_all();
        }
    }
}

/// An in-flight transaction. Aborts on drop unless committed or aborted
/// explicitly.
pub struct Transaction<'a> {
    manager: &'a TxnManager,
    begin_ts: u64,
    text: String,
    reader_allowed: bool,
    ops: SmallVec<[CatalogOp; 4]>,
    state: TxnState,
}

impl<'a> Transaction<'a> {
    pub fn begin_ts(&self) -> u64 {
        self.begin_ts
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Marks this commit visible to replicas that are still bringing up.
    pub fn set_reader_allowed(&mut self, allowed: bool) {
        self.reader_allowed = allowed;
    }

    pub fn reader_allowed(&self) -> bool {
        self.reader_allowed
    }

    pub fn create_database(&mut self, name: &str, comment: &str) -> Result<()> {
        ensure!(
            !self.manager.catalog.has_database(name),
            "database '{}' already exists",
            name
        );
        self.ops.push(CatalogOp::CreateDatabase {
            name: name.to_string(),
            comment: comment.to_string(),
        });
        Ok(())
    }

    pub fn drop_database(&mut self, name: &str) -> Result<()> {
        ensure!(
            self.manager.catalog.has_database(name),
            "database '{}' does not exist",
            name
        );
        self.ops.push(CatalogOp::DropDatabase {
            name: name.to_string(),
        });
        Ok(())
    }

    pub fn create_table(&mut self, database: &str, table: &str) -> Result<()> {
        ensure!(
            self.manager.catalog.has_database(database),
            "database '{}' does not exist",
            database
        );
        self.ops.push(CatalogOp::CreateTable {
            database: database.to_string(),
            table: table.to_string(),
        });
        Ok(())
    }

    pub fn add_segment(&mut self, database: &str, table: &str, row_count: u64, size_bytes: u64) {
        self.ops.push(CatalogOp::AddSegment {
            database: database.to_string(),
            table: table.to_string(),
            row_count,
            size_bytes,
        });
    }

    pub fn compact_segments(&mut self, database: &str, table: &str) {
        self.ops.push(CatalogOp::CompactSegments {
            database: database.to_string(),
            table: table.to_string(),
        });
    }

    pub fn dump_mem_index(&mut self, database: &str, table: &str) {
        self.ops.push(CatalogOp::DumpMemIndex {
            database: database.to_string(),
            table: table.to_string(),
        });
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.state == TxnState::Active {
            self.manager.release(self.begin_ts);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FlushMethod, PAGE_SIZE};
    use tempfile::tempdir;

    fn managers(dir: &std::path::Path) -> (Arc<BufferManager>, Arc<WalManager>, Arc<Catalog>) {
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
        (buffer, wal, catalog)
    }

    #[test]
    fn timestamps_resume_from_system_start_ts() {
        let dir = tempdir().unwrap();
        let (buffer, wal, catalog) = managers(dir.path());
        let txn_mgr = TxnManager::new(buffer, wal, catalog, 1000);
        txn_mgr.start();

        let txn = txn_mgr.begin_txn("first").unwrap();
        assert_eq!(txn.begin_ts(), 1001);
        let commit_ts = txn_mgr.commit_txn(txn).unwrap();
        assert_eq!(commit_ts, 1002);
        assert_eq!(txn_mgr.system_start_ts(), 1000);
        assert_eq!(txn_mgr.latest_ts(), 1002);
    }

    #[test]
    fn commit_applies_ops_and_logs_them() {
        let dir = tempdir().unwrap();
        let (buffer, wal, catalog) = managers(dir.path());
        let txn_mgr = TxnManager::new(buffer, Arc::clone(&wal), Arc::clone(&catalog), 0);
        txn_mgr.start();

        let mut txn = txn_mgr.begin_txn("create db").unwrap();
        txn.create_database("db1", "created by test").unwrap();
        txn_mgr.commit_txn(txn).unwrap();
        assert!(catalog.has_database("db1"));

        let outcome = wal.replay().unwrap();
        assert!(outcome.catalog.unwrap().has_database("db1"));
    }

    #[test]
    fn add_segment_materializes_its_data_file() {
        let dir = tempdir().unwrap();
        let (buffer, wal, catalog) = managers(dir.path());
        let txn_mgr =
            TxnManager::new(Arc::clone(&buffer), wal, Arc::clone(&catalog), 0);
        txn_mgr.start();

        let mut txn = txn_mgr.begin_txn("seed table").unwrap();
        txn.create_database("db1", "").unwrap();
        txn.create_table("db1", "t").unwrap();
        txn.add_segment("db1", "t", 500, 8192);
        txn_mgr.commit_txn(txn).unwrap();

        let segment_id = catalog.newest_active_segment_id("db1", "t").unwrap();
        let page = buffer.get_page(PageKey::new(segment_id, 0)).unwrap();
        let data = page.read();
        assert_eq!(u64::from_le_bytes(data[..8].try_into().unwrap()), segment_id);
        assert_eq!(u64::from_le_bytes(data[8..16].try_into().unwrap()), 500);
    }

    #[test]
    fn dropped_transaction_releases_its_slot() {
        let dir = tempdir().unwrap();
        let (buffer, wal, catalog) = managers(dir.path());
        let txn_mgr = TxnManager::new(buffer, wal, catalog, 0);
        txn_mgr.start();

        {
            let _txn = txn_mgr.begin_txn("abandoned").unwrap();
            assert_eq!(txn_mgr.active_txn_count(), 1);
        }
        assert_eq!(txn_mgr.active_txn_count(), 0);
    }

    #[test]
    fn stop_waits_for_inflight_transactions() {
        let dir = tempdir().unwrap();
        let (buffer, wal, catalog) = managers(dir.path());
        let txn_mgr = Arc::new(TxnManager::new(buffer, wal, catalog, 0));
        txn_mgr.start();

        let mgr = Arc::clone(&txn_mgr);
        let held = std::sync::Arc::new(std::sync::Barrier::new(2));
        let held_clone = Arc::clone(&held);
        let worker = std::thread::spawn(move || {
            let txn = mgr.begin_txn("slow").unwrap();
            held_clone.wait();
            std::thread::sleep(std::time::Duration::from_millis(50));
            mgr.commit_txn(txn).unwrap();
        });

        held.wait();
        txn_mgr.stop();
        assert_eq!(txn_mgr.active_txn_count(), 0);
        assert!(txn_mgr.begin_txn("after stop").is_err());
        worker.join().unwrap();
    }

    #[test]
    fn begin_is_rejected_before_start() {
        let dir = tempdir().unwrap();
        let (buffer, wal, catalog) = managers(dir.path());
        let txn_mgr = TxnManager::new(buffer, wal, catalog, 0);
        assert!(txn_mgr.begin_txn("too early").is_err());
    }
}
