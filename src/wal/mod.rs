//! # Write-Ahead Log Manager
//!
//! Durable log for committed mutations, written as a sequence of segment
//! files (`wal.000001`, `wal.000002`, ...) under the WAL directory. A new
//! segment starts when the active one grows past the segment limit.
//!
//! ## Commit Durability
//!
//! [`FlushMethod`] selects the per-commit policy:
//!
//! - `PerCommit`: the committing thread writes and fsyncs its record before
//!   the commit is acknowledged.
//! - `Grouped`: records queue for the flusher thread, which writes a whole
//!   batch and fsyncs once. All waiting committers are released together.
//!
//! ## Checkpoints
//!
//! A checkpoint writes the catalog (full snapshot or delta ops) next to the
//! segments and appends a marker record. Segments whose records are fully
//! covered by the last checkpoint become garbage; the compactor thread
//! removes them once the total segment size passes the compaction
//! threshold.
//!
//! ## Replay
//!
//! [`WalManager::replay`] rebuilds the catalog: newest full snapshot, then
//! delta checkpoints in timestamp order, then every commit record past the
//! checkpoint horizon. It returns the highest commit timestamp seen — the
//! `system_start_ts` the transaction manager resumes from — and the rebuilt
//! catalog, or `(0, None)` when there is no prior state.
//!
//! ## Threads
//!
//! `start` spawns the flusher and the compactor; it takes the transaction
//! manager because the flusher reports durable timestamps back to it, which
//! is why the supervisor starts the transaction manager first. `stop` drains
//! pending appends, joins both threads, and leaves the manager unusable —
//! transitions back into admin mode construct a fresh one.

pub mod record;

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use eyre::{bail, ensure, Result, WrapErr};
use memmap2::Mmap;
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::config::{
    FlushMethod, DELTA_CHECKPOINT_PREFIX, FULL_CHECKPOINT_PREFIX, MAX_WAL_SEGMENT_SIZE,
    WAL_SEGMENT_PREFIX,
};
use crate::txn::TxnManager;

pub use record::{WalPayload, WalRecord};

/// Result of scanning the persisted log.
pub struct ReplayOutcome {
    /// Highest commit timestamp materialized from the log; `0` means no
    /// prior state.
    pub system_start_ts: u64,
    /// Catalog rebuilt from checkpoints and commit records; `None` exactly
    /// when `system_start_ts == 0`.
    pub catalog: Option<Catalog>,
}

struct WalSegment {
    file: File,
    seq: u64,
    offset: u64,
}

impl WalSegment {
    fn path_for(dir: &Path, seq: u64) -> PathBuf {
        dir.join(format!("{}{:06}", WAL_SEGMENT_PREFIX, seq))
    }

    fn create(dir: &Path, seq: u64) -> Result<Self> {
        let path = Self::path_for(dir, seq);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .truncate(true)
            .open(&path)
            .wrap_err_with(|| format!("failed to create WAL segment at {:?}", path))?;
        Ok(Self {
            file,
            seq,
            offset: 0,
        })
    }

    fn open_end(dir: &Path, seq: u64) -> Result<Self> {
        let path = Self::path_for(dir, seq);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .wrap_err_with(|| format!("failed to open WAL segment at {:?}", path))?;
        let offset = file.metadata().wrap_err("failed to stat WAL segment")?.len();
        use std::io::{Seek, SeekFrom};
        let mut file = file;
        file.seek(SeekFrom::Start(offset))
            .wrap_err("failed to seek to WAL segment end")?;
        Ok(Self { file, seq, offset })
    }

    fn append(&mut self, bytes: &[u8]) -> Result<()> {
        self.file
            .write_all(bytes)
            .wrap_err("failed to append WAL record")?;
        self.offset += bytes.len() as u64;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file
            .sync_data()
            .wrap_err("failed to sync WAL segment")
    }
}

struct AppendWaiter {
    completed: Mutex<bool>,
    cond: Condvar,
    error: Mutex<Option<String>>,
}

impl AppendWaiter {
    fn new() -> Self {
        Self {
            completed: Mutex::new(false),
            cond: Condvar::new(),
            error: Mutex::new(None),
        }
    }

    fn complete(&self, error: Option<String>) {
        *self.error.lock() = error;
        let mut completed = self.completed.lock();
        *completed = true;
        self.cond.notify_all();
    }

    fn wait(&self) -> Result<()> {
        let mut completed = self.completed.lock();
        while !*completed {
            self.cond.wait(&mut completed);
        }
        drop(completed);
        match self.error.lock().take() {
            None => Ok(()),
            Some(msg) => bail!("group commit flush failed: {}", msg),
        }
    }
}

struct PendingAppend {
    commit_ts: u64,
    bytes: Vec<u8>,
    waiter: Arc<AppendWaiter>,
}

/// Horizon below which log segments are garbage.
#[derive(Debug, Clone, Copy)]
struct CheckpointMark {
    ts: u64,
    segment_seq: u64,
}

struct WalInner {
    wal_dir: PathBuf,
    #[allow(dead_code)]
    data_dir: PathBuf,
    compact_threshold: u64,
    delta_checkpoint_threshold: u64,
    flush_method: FlushMethod,
    segment: Mutex<WalSegment>,
    queue: Mutex<Vec<PendingAppend>>,
    work_ready: Condvar,
    compact_gate: Mutex<()>,
    compact_kick: Condvar,
    shutdown: AtomicBool,
    txn_mgr: Mutex<Weak<TxnManager>>,
    bytes_since_delta: AtomicU64,
    /// Highest commit timestamp ever appended; checkpoints may not claim a
    /// horizon below it.
    max_commit_ts: AtomicU64,
    last_checkpoint: Mutex<Option<CheckpointMark>>,
}

pub struct WalManager {
    inner: Arc<WalInner>,
    flusher: Mutex<Option<JoinHandle<()>>>,
    compactor: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl WalManager {
    pub fn new(
        wal_dir: &Path,
        data_dir: &Path,
        compact_threshold: u64,
        delta_checkpoint_threshold: u64,
        flush_method: FlushMethod,
    ) -> Result<Self> {
        std::fs::create_dir_all(wal_dir)
            .wrap_err_with(|| format!("failed to create WAL directory {:?}", wal_dir))?;

        let latest = find_latest_segment(wal_dir)?;
        let segment = if WalSegment::path_for(wal_dir, latest).exists() {
            WalSegment::open_end(wal_dir, latest)?
        } else {
            WalSegment::create(wal_dir, latest)?
        };

        Ok(Self {
            inner: Arc::new(WalInner {
                wal_dir: wal_dir.to_path_buf(),
                data_dir: data_dir.to_path_buf(),
                compact_threshold,
                delta_checkpoint_threshold,
                flush_method,
                segment: Mutex::new(segment),
                queue: Mutex::new(Vec::new()),
                work_ready: Condvar::new(),
                compact_gate: Mutex::new(()),
                compact_kick: Condvar::new(),
                shutdown: AtomicBool::new(false),
                txn_mgr: Mutex::new(Weak::new()),
                bytes_since_delta: AtomicU64::new(0),
                max_commit_ts: AtomicU64::new(0),
                last_checkpoint: Mutex::new(None),
            }),
            flusher: Mutex::new(None),
            compactor: Mutex::new(None),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    // ------------------------------------------------------------------
    // Thread lifecycle
    // ------------------------------------------------------------------

    /// Spawns the flusher and compactor threads. The transaction manager
    /// must already be running: the flusher reports durable commit
    /// timestamps back through it.
    pub fn start(&self, txn_mgr: Weak<TxnManager>) -> Result<()> {
        ensure!(
            !self.stopped.load(Ordering::Acquire),
            "a stopped WAL manager cannot be restarted"
        );
        ensure!(
            !self.started.swap(true, Ordering::AcqRel),
            "WAL manager already started"
        );

        *self.inner.txn_mgr.lock() = txn_mgr;

        let inner = Arc::clone(&self.inner);
        let flusher = std::thread::Builder::new()
            .name("opal-wal-flush".to_string())
            .spawn(move || flusher_loop(&inner))
            .expect("failed to spawn WAL flusher thread");
        *self.flusher.lock() = Some(flusher);

        let inner = Arc::clone(&self.inner);
        let compactor = std::thread::Builder::new()
            .name("opal-wal-compact".to_string())
            .spawn(move || compactor_loop(&inner))
            .expect("failed to spawn WAL compactor thread");
        *self.compactor.lock() = Some(compactor);

        info!(wal_dir = ?self.inner.wal_dir, "WAL manager started");
        Ok(())
    }

    /// Drains pending appends, joins both threads, and retires the manager.
    pub fn stop(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        {
            let _queue = self.inner.queue.lock();
            self.inner.work_ready.notify_all();
        }
        {
            let _gate = self.inner.compact_gate.lock();
            self.inner.compact_kick.notify_all();
        }
        if let Some(handle) = self.flusher.lock().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.compactor.lock().take() {
            let _ = handle.join();
        }
        self.started.store(false, Ordering::Release);
        self.stopped.store(true, Ordering::Release);
        info!("WAL manager stopped");
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Appends
    // ------------------------------------------------------------------

    /// Durably logs a commit. Blocks until the record is on disk under the
    /// configured flush method.
    pub fn append_commit(&self, commit_ts: u64, payload: &WalPayload) -> Result<()> {
        let bytes = record::encode_record(commit_ts, payload)?;
        self.inner
            .bytes_since_delta
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        self.inner
            .max_commit_ts
            .fetch_max(commit_ts, Ordering::AcqRel);

        let grouped = matches!(self.inner.flush_method, FlushMethod::Grouped) && self.is_started();
        if !grouped {
            return self.inner.write_now(&bytes, true);
        }

        let waiter = Arc::new(AppendWaiter::new());
        {
            let mut queue = self.inner.queue.lock();
            // The flusher only exits while holding this lock with an empty
            // queue; once shutdown is visible here the record must be
            // written inline or its waiter would never complete.
            if self.inner.shutdown.load(Ordering::Acquire) {
                drop(queue);
                return self.inner.write_now(&bytes, true);
            }
            queue.push(PendingAppend {
                commit_ts,
                bytes,
                waiter: Arc::clone(&waiter),
            });
            self.inner.work_ready.notify_one();
        }
        waiter.wait()
    }

    // ------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------

    /// Writes a checkpoint of `catalog` at `ts`. Returns whether anything
    /// was written (a delta checkpoint with no pending ops is skipped).
    ///
    /// The checkpoint horizon is raised to the highest commit timestamp
    /// already appended, so a snapshot never claims to predate state it
    /// contains.
    pub fn checkpoint(&self, catalog: &Catalog, ts: u64, full: bool) -> Result<bool> {
        let ts = ts.max(self.inner.max_commit_ts.load(Ordering::Acquire));
        let marker = if full {
            let path = catalog.save_full_checkpoint(&self.inner.wal_dir, ts)?;
            Some(WalPayload::FullCheckpoint {
                catalog_file: file_name(&path),
            })
        } else {
            catalog
                .save_delta_checkpoint(&self.inner.wal_dir, ts)?
                .map(|path| WalPayload::DeltaCheckpoint {
                    delta_file: file_name(&path),
                })
        };

        let Some(marker) = marker else {
            return Ok(false);
        };

        let bytes = record::encode_record(ts, &marker)?;
        self.inner.write_now(&bytes, true)?;

        let segment_seq = self.inner.segment.lock().seq;
        *self.inner.last_checkpoint.lock() = Some(CheckpointMark { ts, segment_seq });
        self.inner.bytes_since_delta.store(0, Ordering::Relaxed);

        {
            let _gate = self.inner.compact_gate.lock();
            self.inner.compact_kick.notify_all();
        }
        Ok(true)
    }

    /// Whether enough log has accumulated since the last delta checkpoint
    /// to warrant firing one off-schedule.
    pub fn delta_checkpoint_needed(&self) -> bool {
        self.inner.delta_checkpoint_threshold > 0
            && self.inner.bytes_since_delta.load(Ordering::Relaxed)
                >= self.inner.delta_checkpoint_threshold
    }

    // ------------------------------------------------------------------
    // Replay
    // ------------------------------------------------------------------

    /// Rebuilds catalog state from checkpoints and the log tail.
    pub fn replay(&self) -> Result<ReplayOutcome> {
        let (mut catalog, mut horizon_ts) = self.load_latest_checkpoints()?;
        let mut max_ts = horizon_ts;

        for seq in list_segments(&self.inner.wal_dir)? {
            let path = WalSegment::path_for(&self.inner.wal_dir, seq);
            let file = File::open(&path)
                .wrap_err_with(|| format!("failed to open WAL segment {:?}", path))?;
            if file.metadata().wrap_err("failed to stat WAL segment")?.len() == 0 {
                continue;
            }
            // SAFETY: segments are append-only and nothing writes concurrently
            // during replay, which runs before any worker thread starts.
            let mmap = unsafe {
                Mmap::map(&file)
                    .wrap_err_with(|| format!("failed to map WAL segment {:?}", path))?
            };

            for wal_record in record::decode_all(&mmap) {
                max_ts = max_ts.max(wal_record.commit_ts);
                let WalPayload::Commit { ops, .. } = wal_record.payload else {
                    continue;
                };
                if wal_record.commit_ts <= horizon_ts {
                    continue;
                }
                let target = catalog.get_or_insert_with(Catalog::new);
                for op in ops {
                    target.apply(op, wal_record.commit_ts, true).wrap_err_with(|| {
                        format!(
                            "failed to replay commit at ts {} from {:?}",
                            wal_record.commit_ts, path
                        )
                    })?;
                }
                horizon_ts = horizon_ts.max(wal_record.commit_ts);
            }
        }

        if catalog.is_none() && max_ts > 0 {
            // Checkpoint markers without a catalog snapshot cannot happen in
            // a well-formed log.
            bail!("WAL contains records at ts {} but no catalog state", max_ts);
        }

        let system_start_ts = if catalog.is_some() { max_ts } else { 0 };
        self.inner
            .max_commit_ts
            .fetch_max(system_start_ts, Ordering::AcqRel);
        info!(system_start_ts, "WAL replay finished");
        Ok(ReplayOutcome {
            system_start_ts,
            catalog,
        })
    }

    /// Loads the newest full checkpoint plus any later delta checkpoints.
    fn load_latest_checkpoints(&self) -> Result<(Option<Catalog>, u64)> {
        let mut full: Option<(u64, PathBuf)> = None;
        let mut deltas: Vec<(u64, PathBuf)> = Vec::new();

        for entry in std::fs::read_dir(&self.inner.wal_dir)
            .wrap_err_with(|| format!("failed to read WAL directory {:?}", self.inner.wal_dir))?
        {
            let path = entry.wrap_err("failed to read WAL directory entry")?.path();
            let Some(ts) = Catalog::checkpoint_file_ts(&path) else {
                continue;
            };
            let name = file_name(&path);
            if name.starts_with(FULL_CHECKPOINT_PREFIX) {
                if full.as_ref().map(|(t, _)| ts > *t).unwrap_or(true) {
                    full = Some((ts, path));
                }
            } else if name.starts_with(DELTA_CHECKPOINT_PREFIX) {
                deltas.push((ts, path));
            }
        }

        let Some((full_ts, full_path)) = full else {
            return Ok((None, 0));
        };

        let catalog = Catalog::load_full_checkpoint(&full_path)?;
        let mut horizon = full_ts;
        deltas.retain(|(ts, _)| *ts > full_ts);
        deltas.sort_by_key(|(ts, _)| *ts);
        for (ts, path) in deltas {
            catalog.attach_delta_checkpoint(&path)?;
            horizon = ts;
        }
        Ok((Some(catalog), horizon))
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn total_segment_bytes(&self) -> Result<u64> {
        let mut total = 0;
        for seq in list_segments(&self.inner.wal_dir)? {
            let path = WalSegment::path_for(&self.inner.wal_dir, seq);
            total += std::fs::metadata(&path)
                .wrap_err_with(|| format!("failed to stat {:?}", path))?
                .len();
        }
        Ok(total)
    }

    pub fn segment_count(&self) -> Result<usize> {
        Ok(list_segments(&self.inner.wal_dir)?.len())
    }
}

impl WalInner {
    /// Appends `bytes` to the active segment, rotating first if it is full.
    fn write_now(&self, bytes: &[u8], sync: bool) -> Result<()> {
        let mut segment = self.segment.lock();
        if segment.offset + bytes.len() as u64 > MAX_WAL_SEGMENT_SIZE && segment.offset > 0 {
            let next = segment.seq + 1;
            *segment = WalSegment::create(&self.wal_dir, next)?;
            debug!(seq = next, "rotated WAL segment");
        }
        segment.append(bytes)?;
        if sync {
            segment.sync()?;
        }
        Ok(())
    }

    fn maybe_compact(&self) {
        let Some(mark) = *self.last_checkpoint.lock() else {
            return;
        };

        let total = match self.total_bytes() {
            Ok(total) => total,
            Err(e) => {
                warn!("WAL compaction skipped: {:#}", e);
                return;
            }
        };
        if total < self.compact_threshold {
            return;
        }

        let segments = match list_segments(&self.wal_dir) {
            Ok(segments) => segments,
            Err(e) => {
                warn!("WAL compaction skipped: {:#}", e);
                return;
            }
        };

        let mut removed = 0;
        for seq in segments {
            if seq >= mark.segment_seq {
                continue;
            }
            let path = WalSegment::path_for(&self.wal_dir, seq);
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) => warn!("failed to remove WAL segment {:?}: {}", path, e),
            }
        }
        if removed > 0 {
            info!(removed, up_to_ts = mark.ts, "compacted WAL segments");
        }
    }

    fn total_bytes(&self) -> Result<u64> {
        let mut total = 0;
        for seq in list_segments(&self.wal_dir)? {
            let path = WalSegment::path_for(&self.wal_dir, seq);
            total += std::fs::metadata(&path)?.len();
        }
        Ok(total)
    }
}

fn flusher_loop(inner: &WalInner) {
    loop {
        let batch: SmallVec<[PendingAppend; 8]> = {
            let mut queue = inner.queue.lock();
            loop {
                if !queue.is_empty() {
                    break queue.drain(..).collect();
                }
                if inner.shutdown.load(Ordering::Acquire) {
                    return;
                }
                inner.work_ready.wait(&mut queue);
            }
        };

        let mut write_error: Option<String> = None;
        for pending in &batch {
            if write_error.is_some() {
                break;
            }
            if let Err(e) = inner.write_now(&pending.bytes, false) {
                write_error = Some(format!("{:#}", e));
            }
        }
        if write_error.is_none() {
            if let Err(e) = inner.segment.lock().sync() {
                write_error = Some(format!("{:#}", e));
            }
        }

        let max_ts = batch.iter().map(|p| p.commit_ts).max().unwrap_or(0);
        for pending in &batch {
            pending.waiter.complete(write_error.clone());
        }

        if write_error.is_none() {
            if let Some(txn_mgr) = inner.txn_mgr.lock().upgrade() {
                txn_mgr.note_durable_ts(max_ts);
            }
        }
    }
}

fn compactor_loop(inner: &WalInner) {
    let mut gate = inner.compact_gate.lock();
    loop {
        if inner.shutdown.load(Ordering::Acquire) {
            return;
        }
        inner
            .compact_kick
            .wait_for(&mut gate, Duration::from_millis(500));
        if inner.shutdown.load(Ordering::Acquire) {
            return;
        }
        inner.maybe_compact();
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn find_latest_segment(dir: &Path) -> Result<u64> {
    Ok(list_segments(dir)?.last().copied().unwrap_or(1))
}

fn list_segments(dir: &Path) -> Result<Vec<u64>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut seqs = Vec::new();
    for entry in
        std::fs::read_dir(dir).wrap_err_with(|| format!("failed to read WAL directory {:?}", dir))?
    {
        let entry = entry.wrap_err("failed to read WAL directory entry")?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(digits) = name.strip_prefix(WAL_SEGMENT_PREFIX) {
            if let Ok(seq) = digits.parse::<u64>() {
                seqs.push(seq);
            }
        }
    }
    seqs.sort_unstable();
    Ok(seqs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogOp;
    use tempfile::tempdir;

    fn wal_at(dir: &Path, flush: FlushMethod) -> WalManager {
        WalManager::new(
            &dir.join("wal"),
            &dir.join("data"),
            u64::MAX,
            u64::MAX,
            flush,
        )
        .unwrap()
    }

    fn commit_ops(name: &str) -> WalPayload {
        WalPayload::Commit {
            reader_allowed: true,
            ops: vec![CatalogOp::CreateDatabase {
                name: name.to_string(),
                comment: String::new(),
            }],
        }
    }

    #[test]
    fn empty_log_replays_to_nothing() {
        let dir = tempdir().unwrap();
        let wal = wal_at(dir.path(), FlushMethod::PerCommit);

        let outcome = wal.replay().unwrap();
        assert_eq!(outcome.system_start_ts, 0);
        assert!(outcome.catalog.is_none());
    }

    #[test]
    fn commits_replay_into_a_catalog() {
        let dir = tempdir().unwrap();
        let wal = wal_at(dir.path(), FlushMethod::PerCommit);

        wal.append_commit(5, &commit_ops("db1")).unwrap();
        wal.append_commit(9, &commit_ops("db2")).unwrap();

        let outcome = wal.replay().unwrap();
        assert_eq!(outcome.system_start_ts, 9);
        let catalog = outcome.catalog.unwrap();
        assert!(catalog.has_database("db1"));
        assert!(catalog.has_database("db2"));
    }

    #[test]
    fn replay_layers_wal_tail_over_full_checkpoint() {
        let dir = tempdir().unwrap();
        let wal = wal_at(dir.path(), FlushMethod::PerCommit);

        wal.append_commit(3, &commit_ops("old")).unwrap();
        let catalog = Catalog::new();
        catalog.create_database("old", "", 3).unwrap();
        assert!(wal.checkpoint(&catalog, 3, true).unwrap());

        wal.append_commit(8, &commit_ops("new")).unwrap();

        let outcome = wal.replay().unwrap();
        assert_eq!(outcome.system_start_ts, 8);
        let replayed = outcome.catalog.unwrap();
        assert!(replayed.has_database("old"));
        assert!(replayed.has_database("new"));
    }

    #[test]
    fn delta_checkpoint_without_pending_ops_is_skipped() {
        let dir = tempdir().unwrap();
        let wal = wal_at(dir.path(), FlushMethod::PerCommit);

        let catalog = Catalog::new();
        assert!(!wal.checkpoint(&catalog, 1, false).unwrap());
    }

    #[test]
    fn delta_threshold_drives_off_schedule_checkpoints() {
        let dir = tempdir().unwrap();
        let wal = WalManager::new(
            &dir.path().join("wal"),
            &dir.path().join("data"),
            u64::MAX,
            64,
            FlushMethod::PerCommit,
        )
        .unwrap();

        assert!(!wal.delta_checkpoint_needed());
        wal.append_commit(1, &commit_ops("db1")).unwrap();
        assert!(wal.delta_checkpoint_needed());

        let catalog = Catalog::new();
        catalog.create_database("db1", "", 1).unwrap();
        wal.checkpoint(&catalog, 1, false).unwrap();
        assert!(!wal.delta_checkpoint_needed());
    }

    #[test]
    fn grouped_appends_complete_through_the_flusher() {
        let dir = tempdir().unwrap();
        let wal = wal_at(dir.path(), FlushMethod::Grouped);
        wal.start(Weak::new()).unwrap();

        wal.append_commit(2, &commit_ops("db1")).unwrap();
        wal.append_commit(4, &commit_ops("db2")).unwrap();
        wal.stop();

        let wal = wal_at(dir.path(), FlushMethod::PerCommit);
        let outcome = wal.replay().unwrap();
        assert_eq!(outcome.system_start_ts, 4);
    }

    #[test]
    fn stopped_manager_cannot_restart() {
        let dir = tempdir().unwrap();
        let wal = wal_at(dir.path(), FlushMethod::Grouped);
        wal.start(Weak::new()).unwrap();
        wal.stop();
        assert!(wal.start(Weak::new()).is_err());
    }

    #[test]
    fn compactor_removes_checkpoint_covered_segments() {
        let dir = tempdir().unwrap();
        let wal = WalManager::new(
            &dir.path().join("wal"),
            &dir.path().join("data"),
            1, // compact as soon as any segment bytes exist
            u64::MAX,
            FlushMethod::PerCommit,
        )
        .unwrap();

        wal.append_commit(1, &commit_ops("db1")).unwrap();
        // Force rotation by exhausting the segment: write a checkpoint after
        // manually rotating via a fresh segment boundary.
        {
            let mut segment = wal.inner.segment.lock();
            let next = segment.seq + 1;
            *segment = WalSegment::create(&wal.inner.wal_dir, next).unwrap();
        }
        let catalog = Catalog::new();
        catalog.create_database("db1", "", 1).unwrap();
        wal.checkpoint(&catalog, 1, true).unwrap();

        assert_eq!(wal.segment_count().unwrap(), 2);
        wal.inner.maybe_compact();
        assert_eq!(wal.segment_count().unwrap(), 1);
    }
}
