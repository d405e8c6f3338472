//! # OpalDB Storage Engine
//!
//! Storage engine for OpalDB, an analytical database with native vector
//! search. This crate is the engine's lifecycle core: the mode state
//! machine that brings a coordinated set of managers up and down without
//! corrupting data or deadlocking startup.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │        StorageEngine (mode state machine)      │
//! ├───────────────┬───────────────┬───────────────┤
//! │  TxnManager   │  WalManager   │ BgTaskProcessor│
//! ├───────────────┼───────────────┼───────────────┤
//! │ BufferManager │   Catalog     │ CompactionProc │
//! ├───────────────┴───────┬───────┴───────────────┤
//! │  PersistenceManager   │  PeriodicTriggerThread │
//! ├───────────────────────┴───────────────────────┤
//! │     Object Store (local / S3-compatible)       │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! ## Modes
//!
//! The engine is always in exactly one of four modes:
//!
//! - **UnInitialized**: nothing running.
//! - **Admin**: only the WAL manager exists, for checkpoint inspection and
//!   staged startup.
//! - **Readable**: replica mode — read-only, no compaction, brought up in
//!   two phases around the log stream catch-up.
//! - **Writable**: primary mode — full transactional writes, compaction,
//!   and periodic checkpoints.
//!
//! Callers move between modes with [`StorageEngine::set_mode`]; the engine
//! sequences manager construction, `start`/`stop`, and destruction in
//! dependency order, replays the write-ahead log on the way up, and forces
//! a checkpoint before a primary finishes coming up.
//!
//! ## Quick Start
//!
//! ```ignore
//! use opaldb::{ConfigView, Mode, StorageEngine};
//! use std::sync::Arc;
//!
//! let config = ConfigView::builder("./opal").build()?;
//! let mut engine = StorageEngine::new(Arc::new(config));
//! engine.set_mode(Mode::Admin)?;
//! engine.set_mode(Mode::Writable)?;
//! // ... serve queries ...
//! engine.set_mode(Mode::UnInitialized)?;
//! ```
//!
//! ## Module Overview
//!
//! - [`engine`]: the supervisor state machine
//! - [`config`]: immutable runtime configuration snapshot
//! - [`wal`]: segmented write-ahead log, replay, checkpoints
//! - [`buffer`]: sharded LRU page cache
//! - [`catalog`]: in-memory schema and segment metadata
//! - [`txn`]: timestamps, commit protocol
//! - [`background`], [`compaction`], [`trigger`]: worker threads
//! - [`object_store`], [`persistence`]: blob and large-object backends
//! - [`memindex`], [`result_cache`]: memory accounting and result caching

pub mod background;
pub mod buffer;
pub mod catalog;
pub mod compaction;
pub mod config;
pub mod engine;
pub mod memindex;
pub mod object_store;
pub mod persistence;
pub mod result_cache;
pub mod trigger;
pub mod txn;
pub mod wal;

pub use config::{ConfigView, FlushMethod, RemoteBlobConfig, StorageType};
pub use engine::{CleanupInfoTracer, Mode, ReaderInitPhase, StorageEngine};
