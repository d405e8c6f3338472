//! End-to-end mode transition scenarios: fresh start, replay, shutdown,
//! and the remote-store failure path.

use std::sync::Arc;

use opaldb::config::ConfigView;
use opaldb::{object_store, Mode, ReaderInitPhase, RemoteBlobConfig, StorageEngine, StorageType};

fn writer_config(base: &std::path::Path) -> ConfigView {
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
        .optimize_index_interval(0)
        .build()
        .unwrap()
}

#[test]
fn fresh_writable_start() {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(writer_config(dir.path()));
    let mut engine = StorageEngine::new(config);

    engine.set_mode(Mode::Admin).unwrap();
    engine.set_mode(Mode::Writable).unwrap();
    assert_eq!(engine.get_mode(), Mode::Writable);

    // A fresh store gets exactly the configured default database.
    let catalog = engine.catalog().unwrap();
    assert!(catalog.has_database("default_db"));
    assert_eq!(catalog.database_count(), 1);

    // Compaction runs on a primary.
    let compact = engine.compact_processor().unwrap();
    assert!(compact.is_started());

    // All five triggers installed with the configured intervals; a zero
    // interval is installed but disabled.
    let triggers = engine.trigger_thread().unwrap();
    assert!(triggers.is_running());
    assert_eq!(
        triggers.installed_triggers(),
        vec![
            ("full-checkpoint", 300),
            ("delta-checkpoint", 30),
            ("compact-segment", 60),
            ("optimize-index", 0),
            ("cleanup", 120),
        ]
    );
    assert!(!triggers.armed_triggers().contains(&"optimize-index"));

    // The forced checkpoint completed before the triggers started.
    let full_checkpoints = std::fs::read_dir(engine.config().wal_dir())
        .unwrap()
        .filter(|e| {
            e.as_ref()
                .unwrap()
                .file_name()
                .to_string_lossy()
                .starts_with("catalog_full.")
        })
        .count();
    assert_eq!(full_checkpoints, 1);

    engine.set_mode(Mode::UnInitialized).unwrap();
}

#[test]
fn replay_existing_store() {
    let dir = tempfile::tempdir().unwrap();

    // First life: create extra state beyond the default database.
    let final_ts = {
        let config = Arc::new(writer_config(dir.path()));
        let mut engine = StorageEngine::new(config);
        engine.set_mode(Mode::Admin).unwrap();
        engine.set_mode(Mode::Writable).unwrap();

        let txn_mgr = engine.txn_manager().unwrap();
        let mut txn = txn_mgr.begin_txn("create user db").unwrap();
        txn.create_database("analytics", "user data").unwrap();
        txn_mgr.commit_txn(txn).unwrap();
        let final_ts = txn_mgr.latest_ts();

        engine.set_mode(Mode::UnInitialized).unwrap();
        final_ts
    };

    // Second life: replay must resume past the first life's timestamps and
    // must not re-create the default database.
    let config = Arc::new(writer_config(dir.path()));
    let mut engine = StorageEngine::new(config);
    engine.set_mode(Mode::Admin).unwrap();
    engine.set_mode(Mode::Writable).unwrap();

    let txn_mgr = engine.txn_manager().unwrap();
    assert!(txn_mgr.system_start_ts() > 0);
    assert_eq!(txn_mgr.system_start_ts(), final_ts);

    let catalog = engine.catalog().unwrap();
    assert!(catalog.has_database("default_db"));
    assert!(catalog.has_database("analytics"));
    assert_eq!(catalog.database_count(), 2);

    engine.set_mode(Mode::UnInitialized).unwrap();
}

#[test]
fn remote_store_failure_rolls_back_mode() {
    let dir = tempfile::tempdir().unwrap();
    // Port 9 (discard) is not listening: remote store init must fail.
    let config = ConfigView::builder(dir.path())
        .storage_type(StorageType::RemoteBlob(RemoteBlobConfig {
            url: "127.0.0.1:9".to_string(),
            https: false,
            access_key: "ak".to_string(),
            secret_key: "sk".to_string(),
            bucket: "opal".to_string(),
        }))
        .build()
        .unwrap();
    let mut engine = StorageEngine::new(Arc::new(config));

    engine.set_mode(Mode::Admin).unwrap();
    let result = engine.set_mode(Mode::Writable);

    assert!(result.is_err());
    assert_eq!(engine.get_mode(), Mode::Admin);
    assert!(!object_store::is_remote_store_initialized());

    // The engine stays usable: a local retry is not wedged by the failure.
    engine.set_mode(Mode::UnInitialized).unwrap();
}

#[test]
fn graceful_shutdown_nulls_every_manager() {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(writer_config(dir.path()));
    let mut engine = StorageEngine::new(config);

    engine.set_mode(Mode::Admin).unwrap();
    engine.set_mode(Mode::Writable).unwrap();
    engine.set_mode(Mode::UnInitialized).unwrap();

    assert_eq!(engine.get_mode(), Mode::UnInitialized);
    assert_eq!(engine.reader_init_phase(), ReaderInitPhase::None);
    assert!(engine.buffer_manager().is_none());
    assert!(engine.wal_manager().is_none());
    assert!(engine.catalog().is_none());
    assert!(engine.txn_manager().is_none());
    assert!(engine.bg_processor().is_none());
    assert!(engine.compact_processor().is_none());
    assert!(engine.memindex_tracer().is_none());
    assert!(engine.trigger_thread().is_none());
    assert!(engine.persistence_manager().is_none());
    assert!(engine.result_cache_manager_any().is_none());
}

#[test]
fn shutdown_to_admin_reconstructs_the_wal_manager() {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(writer_config(dir.path()));
    let mut engine = StorageEngine::new(config);

    engine.set_mode(Mode::Admin).unwrap();
    engine.set_mode(Mode::Writable).unwrap();
    engine.set_mode(Mode::Admin).unwrap();

    assert_eq!(engine.get_mode(), Mode::Admin);
    // Admin mode: the WAL manager exists and nothing else does.
    assert!(engine.wal_manager().is_some());
    assert!(engine.buffer_manager().is_none());
    assert!(engine.txn_manager().is_none());
    assert!(engine.catalog().is_none());

    // And the store can come back up from the reconstructed WAL manager.
    engine.set_mode(Mode::Writable).unwrap();
    assert!(engine.catalog().unwrap().has_database("default_db"));
    engine.set_mode(Mode::UnInitialized).unwrap();
}

#[test]
fn system_start_ts_flows_from_replay_into_txn_manager() {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(writer_config(dir.path()));
    let mut engine = StorageEngine::new(config);

    engine.set_mode(Mode::Admin).unwrap();
    engine.set_mode(Mode::Writable).unwrap();

    // Fresh store: replay produced 0 and the transaction manager was
    // seeded with exactly that.
    assert_eq!(engine.txn_manager().unwrap().system_start_ts(), 0);
    engine.set_mode(Mode::UnInitialized).unwrap();
}

#[test]
fn cleanup_tracer_records_teardown_work() {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(writer_config(dir.path()));
    let mut engine = StorageEngine::new(config);

    engine.set_mode(Mode::Admin).unwrap();
    engine.set_mode(Mode::Writable).unwrap();
    engine.set_mode(Mode::UnInitialized).unwrap();

    let tracer = engine.cleanup_tracer().unwrap();
    let entries = tracer.entries();
    assert!(entries.iter().any(|e| e.contains("wal manager")));
    assert!(entries.iter().any(|e| e.contains("buffer manager")));
    assert!(entries.iter().any(|e| e.contains("compaction processor")));
}

#[test]
fn result_cache_accessor_is_config_gated() {
    let dir = tempfile::tempdir().unwrap();
    let config = ConfigView::builder(dir.path())
        .result_cache(false)
        .build()
        .unwrap();
    let mut engine = StorageEngine::new(Arc::new(config));

    engine.set_mode(Mode::Admin).unwrap();
    engine.set_mode(Mode::Writable).unwrap();

    // The cache object exists but the gated accessor hides it.
    assert!(engine.result_cache_manager().is_none());
    assert!(engine.result_cache_manager_any().is_some());

    engine.set_mode(Mode::UnInitialized).unwrap();
}
