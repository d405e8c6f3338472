//! # Storage Engine Supervisor
//!
//! The mode state machine that owns every storage manager and sequences
//! their bring-up and tear-down. External callers drive the engine by
//! requesting a target [`Mode`]; the engine constructs, starts, stops, and
//! drops the managers in the one order that keeps their dependencies sound:
//!
//! ```text
//! bring-up:   buffer → (replay) catalog → bg → txn → wal.start
//!             → default db → mem tracer → bg.start → compaction
//!             → index recover → triggers installed → force checkpoint
//!             → triggers started
//! tear-down:  triggers → compaction → bg → catalog → tracer → wal
//!             → remote store → txn → buffer → persistence
//! ```
//!
//! ## Transitions
//!
//! ```text
//! from \ to    UnInit    Admin     Readable   Writable
//! UnInit         —       wal new     fatal      fatal
//! Admin        wal drop     —       bring-up   bring-up
//! Readable     teardown  teardown      —       promote
//! Writable     teardown  teardown   demote        —
//! ```
//!
//! Requesting the current mode again is a warned no-op. The diagonal
//! entries above are therefore unreachable through the public API; they
//! remain as defensive fatal checks. Every other `fatal` cell aborts the
//! process: those transitions are caller bugs, not recoverable states.
//!
//! ## Failure semantics
//!
//! The only recoverable mid-transition failure is remote object store
//! initialization: the engine rolls the mode back, un-initializes the
//! process-wide handle, and returns the error. Every later failure means an
//! invariant was violated and the process terminates with a diagnostic
//! before in-memory state can diverge from disk.
//!
//! ## Replica bring-up
//!
//! A transition to [`Mode::Readable`] stops at [`ReaderInitPhase::Phase1`]
//! (buffer manager up, waiting for the log stream). Once the replica has
//! caught up, [`StorageEngine::continue_reader_bring_up`] finishes the job
//! and reaches [`ReaderInitPhase::Phase2`].

mod cleanup;

pub use cleanup::CleanupInfoTracer;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::Result;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::background::{BgTask, BgTaskProcessor};
use crate::buffer::BufferManager;
use crate::catalog::{functions, Catalog};
use crate::compaction::CompactionProcessor;
use crate::config::{ConfigView, StorageType};
use crate::memindex::MemIndexTracer;
use crate::object_store::{self, ObjectStoreProcessor};
use crate::persistence::PersistenceManager;
use crate::result_cache::ResultCacheManager;
use crate::trigger::{
    CheckpointTrigger, CleanupTrigger, CompactSegmentTrigger, OptimizeIndexTrigger,
    PeriodicTrigger, PeriodicTriggerThread,
};
use crate::txn::TxnManager;
use crate::wal::WalManager;

/// Top-level state of the storage engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    UnInitialized,
    Admin,
    Readable,
    Writable,
}

impl Mode {
    pub fn name(&self) -> &'static str {
        match self {
            Mode::UnInitialized => "un-initialized",
            Mode::Admin => "admin",
            Mode::Readable => "readable",
            Mode::Writable => "writable",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Two-stage replica bring-up marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderInitPhase {
    None,
    /// Mode set, buffer manager up, awaiting the log stream.
    Phase1,
    /// Log caught up, transaction manager running, fully online read-only.
    Phase2,
}

struct EngineState {
    mode: Mode,
    reader_init_phase: ReaderInitPhase,
}

/// One cell of the mode transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    /// UnInit → Admin: construct the WAL manager.
    ConstructWal,
    /// Admin → UnInit: drop the WAL manager.
    DropWal,
    /// Admin → Readable/Writable: the core bring-up.
    BringUp,
    /// Readable/Writable → UnInit/Admin: full tear-down.
    TearDown,
    /// Readable → Writable: start compaction, install writer triggers.
    Promote,
    /// Writable → Readable: retire compaction, keep only cleanup.
    Demote,
    /// Never legal; requesting it is a caller bug.
    Illegal,
}

/// The transition table, encoded once so illegal requests are caught
/// centrally and tests can enumerate the whole matrix. Same-target
/// requests never reach this table: `set_mode` short-circuits them as a
/// warned no-op, which leaves the diagonal `Illegal` cells unreachable
/// defensive state.
fn transition_for(from: Mode, to: Mode) -> Transition {
    use Mode::*;
    match (from, to) {
        (UnInitialized, Admin) => Transition::ConstructWal,
        (Admin, UnInitialized) => Transition::DropWal,
        (Admin, Readable) | (Admin, Writable) => Transition::BringUp,
        (Readable, UnInitialized) | (Readable, Admin) => Transition::TearDown,
        (Readable, Writable) => Transition::Promote,
        (Writable, UnInitialized) | (Writable, Admin) => Transition::TearDown,
        (Writable, Readable) => Transition::Demote,
        _ => Transition::Illegal,
    }
}

/// Terminates the process: the supervisor or a caller violated a lifecycle
/// invariant and continuing would let memory state diverge from disk.
fn unrecoverable(msg: &str) -> ! {
    error!("{}", msg);
    panic!("{}", msg);
}

pub struct StorageEngine {
    config: Arc<ConfigView>,
    // Guards mode and reader phase only; never held across manager
    // start/stop calls.
    state: Mutex<EngineState>,
    object_store_processor: Option<ObjectStoreProcessor>,
    persistence: Option<Arc<PersistenceManager>>,
    result_cache: Option<Arc<ResultCacheManager>>,
    buffer: Option<Arc<BufferManager>>,
    wal: Option<Arc<WalManager>>,
    catalog: Option<Arc<Catalog>>,
    txn_mgr: Option<Arc<TxnManager>>,
    bg_processor: Option<Arc<BgTaskProcessor>>,
    compact_processor: Option<Arc<CompactionProcessor>>,
    memindex_tracer: Option<Arc<MemIndexTracer>>,
    trigger_thread: Option<Arc<PeriodicTriggerThread>>,
    cleanup_tracer: Option<Arc<CleanupInfoTracer>>,
}

impl StorageEngine {
    pub fn new(config: Arc<ConfigView>) -> Self {
        Self {
            config,
            state: Mutex::new(EngineState {
                mode: Mode::UnInitialized,
                reader_init_phase: ReaderInitPhase::None,
            }),
            object_store_processor: None,
            persistence: None,
            result_cache: None,
            buffer: None,
            wal: None,
            catalog: None,
            txn_mgr: None,
            bg_processor: None,
            compact_processor: None,
            memindex_tracer: None,
            trigger_thread: None,
            cleanup_tracer: None,
        }
    }

    // ------------------------------------------------------------------
    // State accessors
    // ------------------------------------------------------------------

    pub fn get_mode(&self) -> Mode {
        self.state.lock().mode
    }

    pub fn reader_init_phase(&self) -> ReaderInitPhase {
        self.state.lock().reader_init_phase
    }

    pub fn config(&self) -> &ConfigView {
        &self.config
    }

    /// The result cache, when the configuration enables it.
    pub fn result_cache_manager(&self) -> Option<Arc<ResultCacheManager>> {
        if !self.config.result_cache_enabled() {
            return None;
        }
        self.result_cache.clone()
    }

    /// The result cache regardless of the configuration switch.
    pub fn result_cache_manager_any(&self) -> Option<Arc<ResultCacheManager>> {
        self.result_cache.clone()
    }

    pub fn buffer_manager(&self) -> Option<&Arc<BufferManager>> {
        self.buffer.as_ref()
    }

    pub fn wal_manager(&self) -> Option<&Arc<WalManager>> {
        self.wal.as_ref()
    }

    pub fn catalog(&self) -> Option<&Arc<Catalog>> {
        self.catalog.as_ref()
    }

    pub fn txn_manager(&self) -> Option<&Arc<TxnManager>> {
        self.txn_mgr.as_ref()
    }

    pub fn bg_processor(&self) -> Option<&Arc<BgTaskProcessor>> {
        self.bg_processor.as_ref()
    }

    pub fn compact_processor(&self) -> Option<&Arc<CompactionProcessor>> {
        self.compact_processor.as_ref()
    }

    pub fn memindex_tracer(&self) -> Option<&Arc<MemIndexTracer>> {
        self.memindex_tracer.as_ref()
    }

    pub fn trigger_thread(&self) -> Option<&Arc<PeriodicTriggerThread>> {
        self.trigger_thread.as_ref()
    }

    pub fn persistence_manager(&self) -> Option<&Arc<PersistenceManager>> {
        self.persistence.as_ref()
    }

    /// Cleanup work recorded by the most recent transition.
    pub fn cleanup_tracer(&self) -> Option<&Arc<CleanupInfoTracer>> {
        self.cleanup_tracer.as_ref()
    }

    // ------------------------------------------------------------------
    // Mode transitions
    // ------------------------------------------------------------------

    /// Drives the engine to `target`. Same-target requests are a warned
    /// no-op. Remote-store initialization failure rolls the mode back and
    /// returns the error; every other mid-transition failure is fatal.
    pub fn set_mode(&mut self, target: Mode) -> Result<()> {
        let current = self.get_mode();
        if current == target {
            warn!(mode = %current, "set unchanged storage mode");
            return Ok(());
        }

        self.cleanup_tracer = Some(Arc::new(CleanupInfoTracer::new()));

        match transition_for(current, target) {
            Transition::Illegal => {
                unrecoverable(&format!(
                    "attempt to set storage mode from {} to {}",
                    current, target
                ));
            }
            Transition::ConstructWal => {
                self.state.lock().mode = target;

                if self.wal.is_some() {
                    unrecoverable("WAL manager was initialized before");
                }
                self.wal = Some(Arc::new(self.construct_wal_manager()));
                info!("set storage from un-init mode to admin");
            }
            Transition::DropWal => {
                self.record_cleanup("wal manager dropped");
                self.wal = None;
                self.state.lock().mode = target;
                info!("set storage from admin mode to un-init");
            }
            Transition::BringUp => {
                self.bring_up(current, target)?;
                info!(to = %target, "set storage from admin mode");
            }
            Transition::TearDown => {
                self.tear_down(current, target);
                self.state.lock().mode = target;
                info!(from = %current, to = %target, "storage torn down");
            }
            Transition::Promote => {
                self.promote_to_writable();
                self.state.lock().mode = target;
            }
            Transition::Demote => {
                self.demote_to_readable();
                self.state.lock().mode = target;
            }
        }
        Ok(())
    }

    /// Completes Phase2 for a replica whose log stream has caught up to
    /// `system_start_ts`.
    pub fn continue_reader_bring_up(&mut self, system_start_ts: u64) -> Result<()> {
        {
            let state = self.state.lock();
            if state.mode != Mode::Readable {
                unrecoverable(&format!(
                    "expect current storage mode is readable, but it is {}",
                    state.mode
                ));
            }
            if state.reader_init_phase != ReaderInitPhase::Phase1 {
                unrecoverable("reader bring-up continuation requires phase 1");
            }
        }

        let catalog = match self.catalog.take() {
            Some(catalog) => catalog,
            None => Arc::new(Catalog::new()),
        };
        functions::seed_builtin_functions(&catalog);
        self.catalog = Some(Arc::clone(&catalog));

        let buffer = self.require_buffer();
        let wal = self.require_wal();

        if self.bg_processor.is_some() {
            unrecoverable("background processor was initialized before");
        }
        let bg = Arc::new(BgTaskProcessor::new(Arc::clone(&wal), Arc::clone(&catalog)));
        self.bg_processor = Some(Arc::clone(&bg));

        if self.txn_mgr.is_some() {
            unrecoverable("transaction manager was initialized before");
        }
        let txn_mgr = Arc::new(TxnManager::new(
            Arc::clone(&buffer),
            Arc::clone(&wal),
            Arc::clone(&catalog),
            system_start_ts,
        ));
        txn_mgr.start();
        self.txn_mgr = Some(Arc::clone(&txn_mgr));

        // WAL threads come up after the transaction manager: the flusher
        // reports durable timestamps into it.
        or_fatal(wal.start(Arc::downgrade(&txn_mgr)), "start WAL manager");

        if self.memindex_tracer.is_some() {
            unrecoverable("memory index tracer was initialized before");
        }
        self.memindex_tracer = Some(Arc::new(MemIndexTracer::new(
            self.config.mem_index_memory_quota(),
            Arc::clone(&catalog),
            Arc::downgrade(&txn_mgr),
        )));

        catalog.start_memory_index_commit();
        or_fatal(
            catalog.mem_index_recover(&buffer, system_start_ts),
            "recover memory index state",
        );

        bg.start();

        if self.trigger_thread.is_some() {
            unrecoverable("periodic trigger was initialized before");
        }
        let trigger_thread = Arc::new(PeriodicTriggerThread::new());
        self.install_cleanup_trigger(&trigger_thread, &bg, &txn_mgr);
        trigger_thread.start();
        self.trigger_thread = Some(trigger_thread);

        self.state.lock().reader_init_phase = ReaderInitPhase::Phase2;
        info!(system_start_ts, "reader bring-up completed");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Admin checkpoint hooks
    // ------------------------------------------------------------------

    /// Repopulates the catalog from a full checkpoint plus deltas. Admin
    /// mode only.
    pub fn attach_catalog(&mut self, full_ckp: &Path, delta_ckps: &[PathBuf]) -> Result<()> {
        self.require_admin("attach_catalog");
        let catalog = Catalog::load_from_files(full_ckp, delta_ckps)?;
        self.catalog = Some(Arc::new(catalog));
        Ok(())
    }

    /// Loads a full checkpoint into a fresh catalog. Admin mode only; the
    /// catalog must not already exist.
    pub fn load_full_checkpoint(&mut self, checkpoint_path: &Path) -> Result<()> {
        self.require_admin("load_full_checkpoint");
        if self.catalog.is_some() {
            unrecoverable("catalog was already initialized before");
        }
        self.catalog = Some(Arc::new(Catalog::load_full_checkpoint(checkpoint_path)?));
        Ok(())
    }

    /// Applies a delta checkpoint on top of the loaded catalog. Admin mode
    /// only.
    pub fn attach_delta_checkpoint(&mut self, checkpoint_path: &Path) -> Result<()> {
        self.require_admin("attach_delta_checkpoint");
        let Some(catalog) = self.catalog.as_ref() else {
            unrecoverable("attach_delta_checkpoint requires a loaded catalog");
        };
        catalog.attach_delta_checkpoint(checkpoint_path)
    }

    /// Creates the distinguished initial database in a reader-visible
    /// transaction. Runs on a fresh writable start.
    pub fn create_default_database(&mut self) {
        let txn_mgr = self.require_txn();
        let name = self.config.default_database_name().to_string();

        let mut txn = or_fatal(
            txn_mgr.begin_txn("create default database"),
            "begin default database transaction",
        );
        txn.set_reader_allowed(true);
        if txn.create_database(&name, "Initial startup created").is_err() {
            unrecoverable(&format!("can't create initial '{}'", name));
        }
        or_fatal(txn_mgr.commit_txn(txn), "commit default database");
        info!(name = %name, "default database created");
    }

    // ------------------------------------------------------------------
    // Core bring-up (admin → readable / writable)
    // ------------------------------------------------------------------

    fn bring_up(&mut self, previous: Mode, target: Mode) -> Result<()> {
        // Mode first: later steps observe the target mode, and a failed
        // remote-store init rolls it back.
        self.state.lock().mode = target;

        if let StorageType::RemoteBlob(remote) = self.config.storage_type() {
            if object_store::is_remote_store_initialized() {
                unrecoverable("remote storage system was initialized before");
            }
            info!(url = %remote.url, "initializing remote object store");
            let staging = self.config.temp_dir().join("remote_staging");
            if let Err(e) = object_store::init_remote_store(remote, &staging) {
                self.state.lock().mode = previous;
                object_store::uninit_remote_store();
                return Err(e);
            }

            if self.object_store_processor.is_some() {
                unrecoverable("object storage processor was initialized before");
            }
            let processor = ObjectStoreProcessor::new();
            processor.start();
            self.object_store_processor = Some(processor);
        }

        if let Some(persistence_dir) = self.config.persistence_dir() {
            if self.persistence.is_some() {
                unrecoverable("persistence manager was initialized before");
            }
            self.persistence = Some(Arc::new(or_fatal(
                PersistenceManager::new(
                    persistence_dir,
                    self.config.data_dir(),
                    self.config.persistence_object_size_limit(),
                ),
                "construct persistence manager",
            )));
        }

        if self.result_cache.is_none() {
            self.result_cache = Some(Arc::new(ResultCacheManager::new(
                self.config.cache_result_num(),
            )));
        }

        if self.buffer.is_some() {
            unrecoverable("buffer manager was initialized before");
        }
        let buffer = Arc::new(or_fatal(
            BufferManager::new(
                self.config.buffer_manager_size(),
                self.config.data_dir(),
                self.config.temp_dir(),
                self.persistence.clone(),
                self.config.lru_num(),
            ),
            "construct buffer manager",
        ));
        or_fatal(buffer.start(), "start buffer manager");
        self.buffer = Some(Arc::clone(&buffer));

        if target == Mode::Readable {
            info!("no checkpoint replay in reader mode, waiting for log replication");
            self.state.lock().reader_init_phase = ReaderInitPhase::Phase1;
            return Ok(());
        }

        // Catalog before the transaction manager: replay rebuilds it from
        // checkpoints and the log tail.
        let wal = self.require_wal();
        let replay = or_fatal(wal.replay(), "replay WAL");
        let system_start_ts = replay.system_start_ts;
        let catalog = match (replay.catalog, self.catalog.take()) {
            (Some(replayed), _) => Arc::new(replayed),
            (None, Some(attached)) => attached,
            (None, None) => {
                info!("initializing a new catalog");
                Arc::new(Catalog::new())
            }
        };
        self.catalog = Some(Arc::clone(&catalog));

        if self.config.compact_interval() > 0 && target == Mode::Writable {
            info!("initializing compaction algorithm");
            catalog.init_compaction_alg(system_start_ts);
        } else {
            info!("skipping compaction algorithm init");
        }

        functions::seed_builtin_functions(&catalog);
        // Catalog finishes init here.

        if self.bg_processor.is_some() {
            unrecoverable("background processor was initialized before");
        }
        let bg = Arc::new(BgTaskProcessor::new(Arc::clone(&wal), Arc::clone(&catalog)));
        self.bg_processor = Some(Arc::clone(&bg));

        if self.txn_mgr.is_some() {
            unrecoverable("transaction manager was initialized before");
        }
        let txn_mgr = Arc::new(TxnManager::new(
            Arc::clone(&buffer),
            Arc::clone(&wal),
            Arc::clone(&catalog),
            system_start_ts,
        ));
        txn_mgr.start();
        self.txn_mgr = Some(Arc::clone(&txn_mgr));

        // WAL threads after the transaction manager: the flusher reports
        // durable timestamps into it.
        or_fatal(wal.start(Arc::downgrade(&txn_mgr)), "start WAL manager");

        if system_start_ts == 0 && target == Mode::Writable {
            self.create_default_database();
        }

        if self.memindex_tracer.is_some() {
            unrecoverable("memory index tracer was initialized before");
        }
        self.memindex_tracer = Some(Arc::new(MemIndexTracer::new(
            self.config.mem_index_memory_quota(),
            Arc::clone(&catalog),
            Arc::downgrade(&txn_mgr),
        )));

        bg.start();

        if target == Mode::Writable {
            if self.compact_processor.is_some() {
                unrecoverable("compact processor was initialized before");
            }
            let compact = Arc::new(CompactionProcessor::new(
                Arc::clone(&catalog),
                Arc::clone(&txn_mgr),
            ));
            compact.start();
            self.compact_processor = Some(compact);
        }

        // Recover the in-memory index after the compaction processor is up.
        catalog.start_memory_index_commit();
        or_fatal(
            catalog.mem_index_recover(&buffer, system_start_ts),
            "recover memory index state",
        );

        if self.trigger_thread.is_some() {
            unrecoverable("periodic trigger was initialized before");
        }
        let trigger_thread = Arc::new(PeriodicTriggerThread::new());
        if target == Mode::Writable {
            self.install_writer_triggers(&trigger_thread, &txn_mgr);
        }
        self.install_cleanup_trigger(&trigger_thread, &bg, &txn_mgr);

        if target == Mode::Writable {
            // The forced checkpoint must complete before the periodic
            // triggers start firing.
            let mut txn = or_fatal(
                txn_mgr.begin_txn("force checkpoint"),
                "begin force checkpoint transaction",
            );
            let task = BgTask::force_checkpoint(system_start_ts, true);
            let handle = task.handle();
            bg.submit(task);
            or_fatal(handle.wait(), "force checkpoint");
            txn.set_reader_allowed(true);
            or_fatal(txn_mgr.commit_txn(txn), "commit force checkpoint transaction");
        }

        trigger_thread.start();
        self.trigger_thread = Some(trigger_thread);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Tear-down (readable / writable → un-init / admin)
    // ------------------------------------------------------------------

    fn tear_down(&mut self, from: Mode, target: Mode) {
        let reader_teardown = from == Mode::Readable;

        if let Some(trigger_thread) = self.trigger_thread.take() {
            if reader_teardown {
                self.require_phase2("stop periodic triggers");
            }
            trigger_thread.stop();
            self.record_cleanup("periodic trigger thread retired");
        }

        if reader_teardown {
            if self.compact_processor.is_some() {
                unrecoverable("compact processor shouldn't be set on a replica");
            }
        } else if let Some(compact) = self.compact_processor.take() {
            compact.stop();
            self.record_cleanup("compaction processor retired");
        }

        if let Some(bg) = self.bg_processor.take() {
            if reader_teardown {
                self.require_phase2("stop background processor");
            }
            bg.stop();
            self.record_cleanup("background task processor retired");
        }

        self.catalog = None;
        self.memindex_tracer = None;

        if let Some(wal) = self.wal.take() {
            wal.stop();
            self.record_cleanup("wal manager retired");
        }

        if let StorageType::RemoteBlob(_) = self.config.storage_type() {
            if let Some(processor) = self.object_store_processor.take() {
                processor.stop();
                object_store::uninit_remote_store();
                self.record_cleanup("remote object store disconnected");
            }
        }

        if let Some(txn_mgr) = self.txn_mgr.take() {
            if reader_teardown {
                self.require_phase2("stop transaction manager");
            }
            txn_mgr.stop();
            self.record_cleanup("transaction manager retired");
        }

        if let Some(buffer) = self.buffer.take() {
            or_fatal(buffer.stop(), "stop buffer manager");
            self.record_cleanup("buffer manager retired");
        }

        self.persistence = None;
        self.result_cache = None;

        if target == Mode::Admin {
            // Stopping a WAL manager retires it for good; admin mode needs
            // a fresh one.
            self.wal = Some(Arc::new(self.construct_wal_manager()));
        }

        self.state.lock().reader_init_phase = ReaderInitPhase::None;
    }

    // ------------------------------------------------------------------
    // Role changes between readable and writable
    // ------------------------------------------------------------------

    /// Readable → Writable: start compaction and install the writer
    /// triggers next to the surviving cleanup trigger.
    fn promote_to_writable(&mut self) {
        if self.compact_processor.is_some() {
            unrecoverable("compact processor was initialized before");
        }
        let catalog = self.require_catalog();
        let txn_mgr = self.require_txn();
        let compact = Arc::new(CompactionProcessor::new(
            Arc::clone(&catalog),
            Arc::clone(&txn_mgr),
        ));
        compact.start();
        self.compact_processor = Some(compact);

        let trigger_thread = self.require_trigger_thread();
        trigger_thread.stop();
        self.install_writer_triggers(&trigger_thread, &txn_mgr);
        trigger_thread.start();
        info!("replica promoted to writable");
    }

    /// Writable → Readable: retire compaction and rebuild the trigger
    /// thread with only the cleanup trigger.
    fn demote_to_readable(&mut self) {
        if let Some(trigger_thread) = self.trigger_thread.take() {
            trigger_thread.stop();
        }
        if let Some(compact) = self.compact_processor.take() {
            compact.stop();
            self.record_cleanup("compaction processor retired");
        }

        let bg = self.require_bg();
        let txn_mgr = self.require_txn();
        let trigger_thread = Arc::new(PeriodicTriggerThread::new());
        self.install_cleanup_trigger(&trigger_thread, &bg, &txn_mgr);
        trigger_thread.start();
        self.trigger_thread = Some(trigger_thread);

        // A demoted primary is a fully online read-only node; the phase
        // marker must say so or a later tear-down would refuse to stop it.
        self.state.lock().reader_init_phase = ReaderInitPhase::Phase2;
        info!("primary demoted to readable");
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn construct_wal_manager(&self) -> WalManager {
        or_fatal(
            WalManager::new(
                self.config.wal_dir(),
                self.config.data_dir(),
                self.config.wal_compact_threshold(),
                self.config.delta_checkpoint_threshold(),
                self.config.flush_method_at_commit(),
            ),
            "construct WAL manager",
        )
    }

    fn install_writer_triggers(
        &self,
        trigger_thread: &PeriodicTriggerThread,
        txn_mgr: &Arc<TxnManager>,
    ) {
        let wal = self.require_wal();
        let catalog = self.require_catalog();
        let compact = self.require_compaction();

        trigger_thread.install_full_checkpoint(Arc::new(CheckpointTrigger::new(
            self.config.full_checkpoint_interval(),
            true,
            Arc::clone(&wal),
            Arc::clone(&catalog),
            Arc::downgrade(txn_mgr),
        )));
        trigger_thread.install_delta_checkpoint(Arc::new(CheckpointTrigger::new(
            self.config.delta_checkpoint_interval(),
            false,
            Arc::clone(&wal),
            Arc::clone(&catalog),
            Arc::downgrade(txn_mgr),
        )));
        trigger_thread.install_compact_segment(Arc::new(CompactSegmentTrigger::new(
            self.config.compact_interval(),
            Arc::clone(&compact),
        )));
        trigger_thread.install_optimize_index(Arc::new(OptimizeIndexTrigger::new(
            self.config.optimize_index_interval(),
            Arc::clone(&compact),
        )));
    }

    fn install_cleanup_trigger(
        &self,
        trigger_thread: &PeriodicTriggerThread,
        bg: &Arc<BgTaskProcessor>,
        txn_mgr: &Arc<TxnManager>,
    ) {
        let cleanup: Arc<dyn PeriodicTrigger> = Arc::new(CleanupTrigger::new(
            self.config.cleanup_interval(),
            Arc::clone(bg),
            Arc::downgrade(txn_mgr),
        ));
        bg.set_cleanup_trigger(Arc::downgrade(&cleanup));
        trigger_thread.install_cleanup(cleanup);
    }

    fn record_cleanup(&self, what: &str) {
        if let Some(tracer) = &self.cleanup_tracer {
            tracer.record(what);
        }
    }

    fn require_admin(&self, operation: &str) {
        let mode = self.get_mode();
        if mode != Mode::Admin {
            unrecoverable(&format!(
                "{} requires admin mode, but storage is {}",
                operation, mode
            ));
        }
    }

    fn require_phase2(&self, operation: &str) {
        if self.state.lock().reader_init_phase != ReaderInitPhase::Phase2 {
            unrecoverable(&format!("error reader init phase during {}", operation));
        }
    }

    fn require_buffer(&self) -> Arc<BufferManager> {
        match &self.buffer {
            Some(buffer) => Arc::clone(buffer),
            None => unrecoverable("buffer manager is not initialized"),
        }
    }

    fn require_wal(&self) -> Arc<WalManager> {
        match &self.wal {
            Some(wal) => Arc::clone(wal),
            None => unrecoverable("WAL manager is not initialized"),
        }
    }

    fn require_catalog(&self) -> Arc<Catalog> {
        match &self.catalog {
            Some(catalog) => Arc::clone(catalog),
            None => unrecoverable("catalog is not initialized"),
        }
    }

    fn require_txn(&self) -> Arc<TxnManager> {
        match &self.txn_mgr {
            Some(txn_mgr) => Arc::clone(txn_mgr),
            None => unrecoverable("transaction manager is not initialized"),
        }
    }

    fn require_bg(&self) -> Arc<BgTaskProcessor> {
        match &self.bg_processor {
            Some(bg) => Arc::clone(bg),
            None => unrecoverable("background processor is not initialized"),
        }
    }

    fn require_compaction(&self) -> Arc<CompactionProcessor> {
        match &self.compact_processor {
            Some(compact) => Arc::clone(compact),
            None => unrecoverable("compaction processor is not initialized"),
        }
    }

    fn require_trigger_thread(&self) -> Arc<PeriodicTriggerThread> {
        match &self.trigger_thread {
            Some(trigger_thread) => Arc::clone(trigger_thread),
            None => unrecoverable("periodic trigger thread is not initialized"),
        }
    }
}

/// Escalates any error in a mandatory bring-up/tear-down step to a process
/// abort, with the step named in the diagnostic.
fn or_fatal<T>(result: Result<T>, what: &str) -> T {
    match result {
        Ok(value) => value,
        Err(e) => unrecoverable(&format!("failed to {}: {:#}", what, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigView;
    use tempfile::tempdir;

    fn engine(dir: &Path) -> StorageEngine {
        let config = ConfigView::builder(dir).build().unwrap();
        StorageEngine::new(Arc::new(config))
    }

    #[test]
    fn transition_table_matches_the_mode_matrix() {
        use Mode::*;
        use Transition::*;

        let modes = [UnInitialized, Admin, Readable, Writable];
        for from in modes {
            // The diagonal never dispatches: same-target requests short-
            // circuit as a no-op before the table is consulted.
            assert_eq!(transition_for(from, from), Illegal);
        }

        assert_eq!(transition_for(UnInitialized, Admin), ConstructWal);
        assert_eq!(transition_for(UnInitialized, Readable), Illegal);
        assert_eq!(transition_for(UnInitialized, Writable), Illegal);

        assert_eq!(transition_for(Admin, UnInitialized), DropWal);
        assert_eq!(transition_for(Admin, Readable), BringUp);
        assert_eq!(transition_for(Admin, Writable), BringUp);

        assert_eq!(transition_for(Readable, UnInitialized), TearDown);
        assert_eq!(transition_for(Readable, Admin), TearDown);
        assert_eq!(transition_for(Readable, Writable), Promote);

        assert_eq!(transition_for(Writable, UnInitialized), TearDown);
        assert_eq!(transition_for(Writable, Admin), TearDown);
        assert_eq!(transition_for(Writable, Readable), Demote);
    }

    #[test]
    fn fresh_engine_is_uninitialized() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());
        assert_eq!(engine.get_mode(), Mode::UnInitialized);
        assert_eq!(engine.reader_init_phase(), ReaderInitPhase::None);
        assert!(engine.wal_manager().is_none());
    }

    #[test]
    fn uninit_to_admin_constructs_only_the_wal_manager() {
        let dir = tempdir().unwrap();
        let mut engine = engine(dir.path());

        engine.set_mode(Mode::Admin).unwrap();
        assert_eq!(engine.get_mode(), Mode::Admin);
        assert!(engine.wal_manager().is_some());
        assert!(engine.buffer_manager().is_none());
        assert!(engine.txn_manager().is_none());
        assert!(engine.catalog().is_none());
    }

    #[test]
    fn admin_back_to_uninit_drops_the_wal_manager() {
        let dir = tempdir().unwrap();
        let mut engine = engine(dir.path());

        engine.set_mode(Mode::Admin).unwrap();
        engine.set_mode(Mode::UnInitialized).unwrap();
        assert_eq!(engine.get_mode(), Mode::UnInitialized);
        assert!(engine.wal_manager().is_none());
    }

    #[test]
    fn same_target_is_a_noop() {
        let dir = tempdir().unwrap();
        let mut engine = engine(dir.path());

        engine.set_mode(Mode::Admin).unwrap();
        engine.set_mode(Mode::Admin).unwrap();
        assert_eq!(engine.get_mode(), Mode::Admin);
        assert!(engine.wal_manager().is_some());
    }

    #[test]
    #[should_panic(expected = "un-initialized")]
    fn uninit_to_writable_is_fatal() {
        let dir = tempdir().unwrap();
        let mut engine = engine(dir.path());
        let _ = engine.set_mode(Mode::Writable);
    }

    #[test]
    #[should_panic(expected = "un-initialized")]
    fn uninit_to_readable_is_fatal() {
        let dir = tempdir().unwrap();
        let mut engine = engine(dir.path());
        let _ = engine.set_mode(Mode::Readable);
    }

    #[test]
    #[should_panic(expected = "requires admin mode")]
    fn admin_hooks_reject_other_modes() {
        let dir = tempdir().unwrap();
        let mut engine = engine(dir.path());
        let _ = engine.load_full_checkpoint(Path::new("/nonexistent.json"));
    }

    #[test]
    #[should_panic(expected = "expect current storage mode is readable")]
    fn continue_reader_bring_up_requires_phase1() {
        let dir = tempdir().unwrap();
        let config = ConfigView::builder(dir.path()).build().unwrap();
        let mut engine = StorageEngine::new(Arc::new(config));
        engine.set_mode(Mode::Admin).unwrap();
        engine.set_mode(Mode::Writable).unwrap();
        // Writable mode: not readable, and certainly not phase 1.
        let _ = engine.continue_reader_bring_up(1);
    }
}
