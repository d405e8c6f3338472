//! # Memory Index Tracer
//!
//! Tracks the total footprint of in-memory indexes against a byte quota.
//! Index builders report growth through [`MemIndexTracer::register`]; once
//! the total passes the quota the tracer picks the heaviest index and dumps
//! it through a transaction, which both logs the dump and zeroes the
//! table's in-memory accounting.
//!
//! The tracer owns no thread. Flushes run on whichever thread pushed the
//! total over quota.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use eyre::Result;
use tracing::{debug, info};

use crate::catalog::Catalog;
use crate::txn::TxnManager;

pub struct MemIndexTracer {
    quota: u64,
    total: AtomicU64,
    catalog: Arc<Catalog>,
    txn_mgr: Weak<TxnManager>,
}

impl MemIndexTracer {
    pub fn new(quota: u64, catalog: Arc<Catalog>, txn_mgr: Weak<TxnManager>) -> Self {
        Self {
            quota,
            total: AtomicU64::new(0),
            catalog,
            txn_mgr,
        }
    }

    pub fn quota(&self) -> u64 {
        self.quota
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Acquire)
    }

    /// Records `bytes` of additional in-memory index for a table. Flushes
    /// the heaviest index when the quota is exceeded.
    pub fn register(&self, database: &str, table: &str, bytes: u64) -> Result<()> {
        let current = self
            .catalog
            .mem_index_bytes(database, table)
            .unwrap_or(0);
        self.catalog
            .set_mem_index_bytes(database, table, current + bytes)?;
        let total = self.total.fetch_add(bytes, Ordering::AcqRel) + bytes;
        debug!(database, table, bytes, total, "memory index grew");

        if self.quota > 0 && total > self.quota {
            self.flush_heaviest()?;
        }
        Ok(())
    }

    /// Drops `bytes` from the accounting (index freed without a dump).
    pub fn release(&self, bytes: u64) {
        let mut current = self.total.load(Ordering::Acquire);
        loop {
            let next = current.saturating_sub(bytes);
            match self.total.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Dumps the largest in-memory index through a transaction.
    fn flush_heaviest(&self) -> Result<()> {
        let Some((database, table, bytes)) = self.catalog.largest_mem_index() else {
            return Ok(());
        };
        let Some(txn_mgr) = self.txn_mgr.upgrade() else {
            return Ok(());
        };

        let mut txn = txn_mgr.begin_txn(format!("dump mem index {}.{}", database, table))?;
        txn.dump_mem_index(&database, &table);
        txn_mgr.commit_txn(txn)?;
        self.release(bytes);
        info!(database, table, bytes, "memory index dumped over quota");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferManager;
    use crate::config::{FlushMethod, PAGE_SIZE};
    use crate::wal::WalManager;
    use tempfile::tempdir;

    fn tracer_with_quota(
        dir: &std::path::Path,
        quota: u64,
    ) -> (MemIndexTracer, Arc<Catalog>, Arc<TxnManager>) {
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

        let mut txn = txn_mgr.begin_txn("seed").unwrap();
        txn.create_database("db1", "").unwrap();
        txn.create_table("db1", "t").unwrap();
        txn_mgr.commit_txn(txn).unwrap();

        let tracer = MemIndexTracer::new(quota, Arc::clone(&catalog), Arc::downgrade(&txn_mgr));
        (tracer, catalog, txn_mgr)
    }

    #[test]
    fn register_accumulates_total() {
        let dir = tempdir().unwrap();
        let (tracer, catalog, _txn_mgr) = tracer_with_quota(dir.path(), 1 << 30);

        tracer.register("db1", "t", 100).unwrap();
        tracer.register("db1", "t", 50).unwrap();
        assert_eq!(tracer.total(), 150);
        assert_eq!(catalog.mem_index_bytes("db1", "t").unwrap(), 150);
    }

    #[test]
    fn exceeding_quota_dumps_heaviest_index() {
        let dir = tempdir().unwrap();
        let (tracer, catalog, _txn_mgr) = tracer_with_quota(dir.path(), 100);

        tracer.register("db1", "t", 80).unwrap();
        assert_eq!(catalog.mem_index_bytes("db1", "t").unwrap(), 80);

        tracer.register("db1", "t", 40).unwrap();
        // Over quota: the index was dumped and the accounting zeroed.
        assert_eq!(catalog.mem_index_bytes("db1", "t").unwrap(), 0);
        assert_eq!(tracer.total(), 0);
    }

    #[test]
    fn release_never_underflows() {
        let dir = tempdir().unwrap();
        let (tracer, _catalog, _txn_mgr) = tracer_with_quota(dir.path(), 0);

        tracer.register("db1", "t", 10).unwrap();
        tracer.release(100);
        assert_eq!(tracer.total(), 0);
    }
}
