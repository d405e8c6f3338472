//! # Engine Configuration Constants
//!
//! Centralizes the default values and structural constants consumed by the
//! storage engine lifecycle. Interdependent values are co-located and the
//! relationships that must hold between them are enforced with compile-time
//! assertions.
//!
//! ## Dependency Notes
//!
//! ```text
//! PAGE_SIZE (16384 bytes)
//!       │
//!       └─> WAL_RECORD_HEADER_SIZE (32 bytes per record)
//!             Every WAL record = header + payload.
//!
//! DEFAULT_BUFFER_MANAGER_SIZE
//!       │
//!       └─> must hold at least DEFAULT_LRU_NUM pages, one per shard,
//!           or shard construction fails at open time.
//! ```
//!
//! Intervals are expressed in seconds; a non-positive interval disables the
//! corresponding periodic trigger rather than firing it continuously.

// ============================================================================
// PAGE AND WAL LAYOUT
// ============================================================================

/// Size of each buffer-managed page in bytes (16KB).
pub const PAGE_SIZE: usize = 16384;

/// Size of the fixed WAL record header in bytes.
pub const WAL_RECORD_HEADER_SIZE: usize = 32;

/// Maximum size of a single WAL segment file. A new segment is created when
/// the active one grows past this.
pub const MAX_WAL_SEGMENT_SIZE: u64 = 64 * 1024 * 1024;

/// Maximum payload carried by a single WAL record.
pub const MAX_WAL_RECORD_PAYLOAD: usize = MAX_WAL_SEGMENT_SIZE as usize - WAL_RECORD_HEADER_SIZE;

const _: () = assert!(
    MAX_WAL_RECORD_PAYLOAD + WAL_RECORD_HEADER_SIZE == MAX_WAL_SEGMENT_SIZE as usize,
    "a maximal WAL record must exactly fill one segment"
);

// ============================================================================
// BUFFER MANAGER
// ============================================================================

/// Default byte budget for the buffer manager (128MB).
pub const DEFAULT_BUFFER_MANAGER_SIZE: usize = 128 * 1024 * 1024;

/// Default number of LRU shards in the buffer manager.
pub const DEFAULT_LRU_NUM: usize = 16;

const _: () = assert!(
    DEFAULT_BUFFER_MANAGER_SIZE >= DEFAULT_LRU_NUM * PAGE_SIZE,
    "buffer budget must hold at least one page per LRU shard"
);

// ============================================================================
// WAL POLICIES
// ============================================================================

/// Total segment bytes after which the WAL compactor removes segments fully
/// covered by the last checkpoint.
pub const DEFAULT_WAL_COMPACT_THRESHOLD: u64 = 1024 * 1024 * 1024;

/// Bytes of log appended since the last delta checkpoint after which a delta
/// checkpoint is requested off-schedule.
pub const DEFAULT_DELTA_CHECKPOINT_THRESHOLD: u64 = 64 * 1024 * 1024;

// ============================================================================
// PERIODIC TRIGGER INTERVALS (seconds; <= 0 disables)
// ============================================================================

/// Default full-checkpoint interval.
pub const DEFAULT_FULL_CHECKPOINT_INTERVAL: i64 = 3600;

/// Default delta-checkpoint interval.
pub const DEFAULT_DELTA_CHECKPOINT_INTERVAL: i64 = 60;

/// Default segment-compaction interval.
pub const DEFAULT_COMPACT_INTERVAL: i64 = 120;

/// Default index-optimization interval.
pub const DEFAULT_OPTIMIZE_INDEX_INTERVAL: i64 = 30;

/// Default dropped-entry cleanup interval.
pub const DEFAULT_CLEANUP_INTERVAL: i64 = 60;

// ============================================================================
// MEMORY AND CACHING
// ============================================================================

/// Default quota for in-memory index footprint (1GB).
pub const DEFAULT_MEM_INDEX_MEMORY_QUOTA: u64 = 1024 * 1024 * 1024;

/// Default capacity (entry count) of the query result cache.
pub const DEFAULT_CACHE_RESULT_NUM: usize = 1024;

/// Per-object byte cap for the persistence directory (128MB).
pub const DEFAULT_PERSISTENCE_OBJECT_SIZE_LIMIT: u64 = 128 * 1024 * 1024;

// ============================================================================
// NAMES
// ============================================================================

/// Name given to the database created on a fresh writable start.
pub const DEFAULT_DATABASE_NAME: &str = "default_db";

/// File name prefix for WAL segments (`wal.000001`, `wal.000002`, ...).
pub const WAL_SEGMENT_PREFIX: &str = "wal.";

/// File name prefix for full-checkpoint catalog snapshots inside the WAL dir.
pub const FULL_CHECKPOINT_PREFIX: &str = "catalog_full.";

/// File name prefix for delta-checkpoint files inside the WAL dir.
pub const DELTA_CHECKPOINT_PREFIX: &str = "catalog_delta.";
