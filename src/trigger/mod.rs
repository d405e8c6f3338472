//! # Periodic Trigger Thread
//!
//! One timer thread driving up to five triggers: full checkpoint, delta
//! checkpoint, segment compaction, index optimization, and cleanup. Each
//! trigger pairs an interval with an action; a non-positive interval leaves
//! the trigger disabled rather than firing it continuously.
//!
//! The thread wakes on the shortest armed interval and fires every due
//! trigger sequentially — handlers never overlap. Triggers are installed
//! after construction and before `start`; changing the installed set
//! requires `stop`, reinstall, `start`. The supervisor does exactly that
//! when a primary steps down to replica or a replica is promoted.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::background::{BgTask, BgTaskProcessor};
use crate::catalog::Catalog;
use crate::compaction::CompactionProcessor;
use crate::txn::TxnManager;
use crate::wal::WalManager;

/// An `(interval, action)` pair owned by the trigger thread.
pub trait PeriodicTrigger: Send + Sync {
    fn name(&self) -> &'static str;

    /// Interval in seconds; non-positive disables the trigger.
    fn interval_secs(&self) -> i64;

    /// Whether the trigger is due at `now`.
    fn is_due(&self, now: Instant) -> bool;

    fn fire(&self);

    /// Restarts the interval clock, e.g. after an out-of-band firing.
    fn reset_timer(&self);
}

/// Interval bookkeeping shared by the concrete triggers.
struct TriggerTimer {
    interval_secs: i64,
    last_fire: Mutex<Instant>,
}

impl TriggerTimer {
    fn new(interval_secs: i64) -> Self {
        Self {
            interval_secs,
            last_fire: Mutex::new(Instant::now()),
        }
    }

    fn enabled(&self) -> bool {
        self.interval_secs > 0
    }

    fn due(&self, now: Instant) -> bool {
        if !self.enabled() {
            return false;
        }
        now.duration_since(*self.last_fire.lock()).as_secs() >= self.interval_secs as u64
    }

    fn reset(&self) {
        *self.last_fire.lock() = Instant::now();
    }
}

// ============================================================================
// Concrete triggers
// ============================================================================

/// Fires full or delta catalog checkpoints through the WAL manager. The
/// delta variant also fires off-schedule once enough log has accumulated
/// since the last delta checkpoint.
pub struct CheckpointTrigger {
    timer: TriggerTimer,
    full: bool,
    wal: Arc<WalManager>,
    catalog: Arc<Catalog>,
    txn_mgr: Weak<TxnManager>,
}

impl CheckpointTrigger {
    pub fn new(
        interval_secs: i64,
        full: bool,
        wal: Arc<WalManager>,
        catalog: Arc<Catalog>,
        txn_mgr: Weak<TxnManager>,
    ) -> Self {
        Self {
            timer: TriggerTimer::new(interval_secs),
            full,
            wal,
            catalog,
            txn_mgr,
        }
    }
}

impl PeriodicTrigger for CheckpointTrigger {
    fn name(&self) -> &'static str {
        if self.full {
            "full-checkpoint"
        } else {
            "delta-checkpoint"
        }
    }

    fn interval_secs(&self) -> i64 {
        self.timer.interval_secs
    }

    fn is_due(&self, now: Instant) -> bool {
        if self.timer.due(now) {
            return true;
        }
        // Delta checkpoints also fire when the log has grown past the
        // configured threshold, regardless of schedule.
        !self.full && self.timer.enabled() && self.wal.delta_checkpoint_needed()
    }

    fn fire(&self) {
        let Some(txn_mgr) = self.txn_mgr.upgrade() else {
            return;
        };
        let ts = txn_mgr.latest_ts();
        match self.wal.checkpoint(&self.catalog, ts, self.full) {
            Ok(written) => debug!(trigger = self.name(), ts, written, "checkpoint fired"),
            Err(e) => warn!("{} trigger failed: {:#}", self.name(), e),
        }
    }

    fn reset_timer(&self) {
        self.timer.reset();
    }
}

/// Scans for tables worth compacting and enqueues the jobs.
pub struct CompactSegmentTrigger {
    timer: TriggerTimer,
    processor: Arc<CompactionProcessor>,
}

impl CompactSegmentTrigger {
    pub fn new(interval_secs: i64, processor: Arc<CompactionProcessor>) -> Self {
        Self {
            timer: TriggerTimer::new(interval_secs),
            processor,
        }
    }
}

impl PeriodicTrigger for CompactSegmentTrigger {
    fn name(&self) -> &'static str {
        "compact-segment"
    }

    fn interval_secs(&self) -> i64 {
        self.timer.interval_secs
    }

    fn is_due(&self, now: Instant) -> bool {
        self.timer.due(now)
    }

    fn fire(&self) {
        let submitted = self.processor.trigger_compaction();
        if submitted > 0 {
            debug!(submitted, "compaction jobs submitted");
        }
    }

    fn reset_timer(&self) {
        self.timer.reset();
    }
}

/// Enqueues index-optimize jobs for tables with in-memory index state.
pub struct OptimizeIndexTrigger {
    timer: TriggerTimer,
    processor: Arc<CompactionProcessor>,
}

impl OptimizeIndexTrigger {
    pub fn new(interval_secs: i64, processor: Arc<CompactionProcessor>) -> Self {
        Self {
            timer: TriggerTimer::new(interval_secs),
            processor,
        }
    }
}

impl PeriodicTrigger for OptimizeIndexTrigger {
    fn name(&self) -> &'static str {
        "optimize-index"
    }

    fn interval_secs(&self) -> i64 {
        self.timer.interval_secs
    }

    fn is_due(&self, now: Instant) -> bool {
        self.timer.due(now)
    }

    fn fire(&self) {
        let submitted = self.processor.trigger_optimize();
        if submitted > 0 {
            debug!(submitted, "index optimize jobs submitted");
        }
    }

    fn reset_timer(&self) {
        self.timer.reset();
    }
}

/// Submits a cleanup task for catalog entries behind the visibility horizon.
pub struct CleanupTrigger {
    timer: TriggerTimer,
    bg: Arc<BgTaskProcessor>,
    txn_mgr: Weak<TxnManager>,
}

impl CleanupTrigger {
    pub fn new(interval_secs: i64, bg: Arc<BgTaskProcessor>, txn_mgr: Weak<TxnManager>) -> Self {
        Self {
            timer: TriggerTimer::new(interval_secs),
            bg,
            txn_mgr,
        }
    }
}

impl PeriodicTrigger for CleanupTrigger {
    fn name(&self) -> &'static str {
        "cleanup"
    }

    fn interval_secs(&self) -> i64 {
        self.timer.interval_secs
    }

    fn is_due(&self, now: Instant) -> bool {
        self.timer.due(now)
    }

    fn fire(&self) {
        let Some(txn_mgr) = self.txn_mgr.upgrade() else {
            return;
        };
        let visible_ts = txn_mgr.last_durable_ts();
        self.bg.submit(BgTask::cleanup(visible_ts));
    }

    fn reset_timer(&self) {
        self.timer.reset();
    }
}

// ============================================================================
// The timer thread
// ============================================================================

#[derive(Default)]
struct TriggerSlots {
    full_checkpoint: Option<Arc<dyn PeriodicTrigger>>,
    delta_checkpoint: Option<Arc<dyn PeriodicTrigger>>,
    compact_segment: Option<Arc<dyn PeriodicTrigger>>,
    optimize_index: Option<Arc<dyn PeriodicTrigger>>,
    cleanup: Option<Arc<dyn PeriodicTrigger>>,
}

impl TriggerSlots {
    fn installed(&self) -> Vec<Arc<dyn PeriodicTrigger>> {
        [
            &self.full_checkpoint,
            &self.delta_checkpoint,
            &self.compact_segment,
            &self.optimize_index,
            &self.cleanup,
        ]
        .into_iter()
        .flatten()
        .cloned()
        .collect()
    }
}

struct ThreadShared {
    slots: Mutex<TriggerSlots>,
    shutdown: AtomicBool,
    wake: Condvar,
    wake_gate: Mutex<()>,
}

pub struct PeriodicTriggerThread {
    shared: Arc<ThreadShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
}

impl PeriodicTriggerThread {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(ThreadShared {
                slots: Mutex::new(TriggerSlots::default()),
                shutdown: AtomicBool::new(false),
                wake: Condvar::new(),
                wake_gate: Mutex::new(()),
            }),
            worker: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn install_full_checkpoint(&self, trigger: Arc<dyn PeriodicTrigger>) {
        debug_assert!(!self.is_running(), "install while trigger thread runs");
        self.shared.slots.lock().full_checkpoint = Some(trigger);
    }

    pub fn install_delta_checkpoint(&self, trigger: Arc<dyn PeriodicTrigger>) {
        debug_assert!(!self.is_running(), "install while trigger thread runs");
        self.shared.slots.lock().delta_checkpoint = Some(trigger);
    }

    pub fn install_compact_segment(&self, trigger: Arc<dyn PeriodicTrigger>) {
        debug_assert!(!self.is_running(), "install while trigger thread runs");
        self.shared.slots.lock().compact_segment = Some(trigger);
    }

    pub fn install_optimize_index(&self, trigger: Arc<dyn PeriodicTrigger>) {
        debug_assert!(!self.is_running(), "install while trigger thread runs");
        self.shared.slots.lock().optimize_index = Some(trigger);
    }

    pub fn install_cleanup(&self, trigger: Arc<dyn PeriodicTrigger>) {
        debug_assert!(!self.is_running(), "install while trigger thread runs");
        self.shared.slots.lock().cleanup = Some(trigger);
    }

    /// Clears every installed trigger. Used between stop and reinstall when
    /// the engine changes role.
    pub fn clear_triggers(&self) {
        debug_assert!(!self.is_running(), "clear while trigger thread runs");
        *self.shared.slots.lock() = TriggerSlots::default();
    }

    /// Names of the armed (installed and enabled) triggers.
    pub fn armed_triggers(&self) -> Vec<&'static str> {
        self.shared
            .slots
            .lock()
            .installed()
            .iter()
            .filter(|t| t.interval_secs() > 0)
            .map(|t| t.name())
            .collect()
    }

    /// Every installed trigger with its configured interval, disabled ones
    /// included.
    pub fn installed_triggers(&self) -> Vec<(&'static str, i64)> {
        self.shared
            .slots
            .lock()
            .installed()
            .iter()
            .map(|t| (t.name(), t.interval_secs()))
            .collect()
    }

    pub fn start(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.shutdown.store(false, Ordering::Release);

        for trigger in self.shared.slots.lock().installed() {
            trigger.reset_timer();
        }

        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("opal-trigger".to_string())
            .spawn(move || timer_loop(&shared))
            .expect("failed to spawn periodic trigger thread");
        *self.worker.lock() = Some(handle);
        info!(armed = ?self.armed_triggers(), "periodic trigger thread started");
    }

    /// Joins the timer thread. The installed triggers stay in place so a
    /// subsequent `start` re-arms them.
    pub fn stop(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        {
            let _gate = self.shared.wake_gate.lock();
            self.shared.wake.notify_all();
        }
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
        self.running.store(false, Ordering::Release);
        info!("periodic trigger thread stopped");
    }
}

impl Default for PeriodicTriggerThread {
    fn default() -> Self {
        Self::new()
    }
}

fn timer_loop(shared: &ThreadShared) {
    loop {
        let triggers = shared.slots.lock().installed();

        // Wake on the shortest armed interval. Shutdown does not wait for a
        // tick: stop signals the condvar directly.
        let shortest = triggers
            .iter()
            .map(|t| t.interval_secs())
            .filter(|&secs| secs > 0)
            .min()
            .unwrap_or(1);
        let tick = Duration::from_secs(shortest.max(1) as u64);

        {
            let mut gate = shared.wake_gate.lock();
            if shared.shutdown.load(Ordering::Acquire) {
                return;
            }
            shared.wake.wait_for(&mut gate, tick);
        }
        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }

        let now = Instant::now();
        for trigger in &triggers {
            if trigger.is_due(now) {
                trigger.fire();
                trigger.reset_timer();
            }
        }
    }
}
