//! Replica lifecycle: two-phase reader bring-up, promotion to primary, and
//! demotion back to read-only.

use std::sync::Arc;

use opaldb::config::ConfigView;
use opaldb::{Mode, ReaderInitPhase, StorageEngine};

fn replica_config(base: &std::path::Path) -> ConfigView {
    // RUST_LOG=debug surfaces the engine's transition logging on failures.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    ConfigView::builder(base)
        .compact_interval(60)
        .full_checkpoint_interval(300)
        .delta_checkpoint_interval(30)
        .cleanup_interval(120)
        .optimize_index_interval(45)
        .build()
        .unwrap()
}

fn bring_up_replica(dir: &std::path::Path) -> StorageEngine {
    let config = Arc::new(replica_config(dir));
    let mut engine = StorageEngine::new(config);
    engine.set_mode(Mode::Admin).unwrap();
    engine.set_mode(Mode::Readable).unwrap();
    engine
}

#[test]
fn replica_bring_up_runs_in_two_phases() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = bring_up_replica(dir.path());

    // Phase 1: mode set, buffer up, everything downstream of the log
    // stream still missing.
    assert_eq!(engine.get_mode(), Mode::Readable);
    assert_eq!(engine.reader_init_phase(), ReaderInitPhase::Phase1);
    assert!(engine.buffer_manager().is_some());
    assert!(engine.txn_manager().is_none());
    assert!(engine.bg_processor().is_none());
    assert!(engine.trigger_thread().is_none());

    engine.continue_reader_bring_up(1000).unwrap();

    // Phase 2: fully online read-only.
    assert_eq!(engine.reader_init_phase(), ReaderInitPhase::Phase2);
    let txn_mgr = engine.txn_manager().unwrap();
    assert_eq!(txn_mgr.system_start_ts(), 1000);
    assert!(engine.bg_processor().unwrap().is_started());

    // Replicas never compact, and carry only the cleanup trigger.
    assert!(engine.compact_processor().is_none());
    let triggers = engine.trigger_thread().unwrap();
    assert_eq!(triggers.installed_triggers(), vec![("cleanup", 120)]);

    engine.set_mode(Mode::UnInitialized).unwrap();
}

#[test]
fn promote_replica_to_writable() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = bring_up_replica(dir.path());
    engine.continue_reader_bring_up(1000).unwrap();

    let txn_before = Arc::clone(engine.txn_manager().unwrap());
    engine.set_mode(Mode::Writable).unwrap();

    assert_eq!(engine.get_mode(), Mode::Writable);

    // Promotion starts compaction and installs the writer triggers next to
    // the surviving cleanup trigger.
    assert!(engine.compact_processor().unwrap().is_started());
    let triggers = engine.trigger_thread().unwrap();
    assert_eq!(
        triggers.installed_triggers(),
        vec![
            ("full-checkpoint", 300),
            ("delta-checkpoint", 30),
            ("compact-segment", 60),
            ("optimize-index", 45),
            ("cleanup", 120),
        ]
    );

    // The transaction manager and catalog survive the role change.
    let txn_after = engine.txn_manager().unwrap();
    assert!(Arc::ptr_eq(&txn_before, txn_after));
    assert_eq!(txn_after.system_start_ts(), 1000);

    engine.set_mode(Mode::UnInitialized).unwrap();
}

#[test]
fn demote_primary_to_readable() {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(replica_config(dir.path()));
    let mut engine = StorageEngine::new(config);
    engine.set_mode(Mode::Admin).unwrap();
    engine.set_mode(Mode::Writable).unwrap();

    let catalog_before = Arc::clone(engine.catalog().unwrap());
    engine.set_mode(Mode::Readable).unwrap();

    assert_eq!(engine.get_mode(), Mode::Readable);
    assert!(engine.compact_processor().is_none());

    // Only the cleanup trigger remains installed after demotion.
    let triggers = engine.trigger_thread().unwrap();
    assert_eq!(triggers.installed_triggers(), vec![("cleanup", 120)]);
    assert!(triggers.is_running());

    // Catalog, transactions, and background worker keep running.
    assert!(Arc::ptr_eq(&catalog_before, engine.catalog().unwrap()));
    assert!(engine.txn_manager().is_some());
    assert!(engine.bg_processor().unwrap().is_started());

    engine.set_mode(Mode::UnInitialized).unwrap();
}

#[test]
fn replica_teardown_after_phase2() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = bring_up_replica(dir.path());
    engine.continue_reader_bring_up(500).unwrap();

    engine.set_mode(Mode::Admin).unwrap();

    assert_eq!(engine.get_mode(), Mode::Admin);
    assert!(engine.wal_manager().is_some());
    assert!(engine.buffer_manager().is_none());
    assert!(engine.txn_manager().is_none());
    assert!(engine.trigger_thread().is_none());
    assert_eq!(engine.reader_init_phase(), ReaderInitPhase::None);
}

#[test]
fn phase1_replica_can_shut_down() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = bring_up_replica(dir.path());
    assert_eq!(engine.reader_init_phase(), ReaderInitPhase::Phase1);

    // Nothing past the buffer manager exists yet; teardown must cope.
    engine.set_mode(Mode::UnInitialized).unwrap();
    assert_eq!(engine.get_mode(), Mode::UnInitialized);
    assert!(engine.buffer_manager().is_none());
}

#[test]
#[should_panic(expected = "reader bring-up continuation requires phase 1")]
fn continue_reader_bring_up_rejects_phase2() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = bring_up_replica(dir.path());
    engine.continue_reader_bring_up(1000).unwrap();
    // Already in phase 2: a second continuation is a caller bug.
    let _ = engine.continue_reader_bring_up(2000);
}
