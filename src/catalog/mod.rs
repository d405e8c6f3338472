//! # Catalog
//!
//! In-memory schema and metadata: databases, their tables, and the segments
//! backing each table. The catalog is rebuilt on every bring-up, either
//! empty (fresh store) or from a full checkpoint plus delta checkpoints and
//! the WAL tail.
//!
//! ## Concurrency
//!
//! Reads take the inner `RwLock` shared; writes arrive serialized through
//! transaction commits and the background processor's single worker, so the
//! write lock is never contended for long. Replay and memory-index recovery
//! run single-threaded before the periodic triggers start.
//!
//! ## Checkpoints
//!
//! A full checkpoint is a JSON snapshot of every database entry; a delta
//! checkpoint is the list of `(commit_ts, op)` pairs applied since the last
//! checkpoint of either kind. Applying a full snapshot then the deltas in
//! timestamp order reconstructs the catalog exactly.

pub mod functions;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use eyre::{ensure, Result, WrapErr};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::buffer::{BufferManager, PageKey};
use crate::config::{DELTA_CHECKPOINT_PREFIX, FULL_CHECKPOINT_PREFIX};

/// A catalog-affecting operation, as carried by WAL commit records and delta
/// checkpoint files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CatalogOp {
    CreateDatabase {
        name: String,
        comment: String,
    },
    DropDatabase {
        name: String,
    },
    CreateTable {
        database: String,
        table: String,
    },
    DropTable {
        database: String,
        table: String,
    },
    AddSegment {
        database: String,
        table: String,
        row_count: u64,
        size_bytes: u64,
    },
    CompactSegments {
        database: String,
        table: String,
    },
    DumpMemIndex {
        database: String,
        table: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentStatus {
    Active,
    Deprecated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentEntry {
    pub id: u64,
    pub row_count: u64,
    pub size_bytes: u64,
    pub status: SegmentStatus,
    /// Commit timestamp at which the segment became deprecated, if any.
    pub deprecated_at: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableEntry {
    pub name: String,
    pub create_ts: u64,
    pub segments: Vec<SegmentEntry>,
    /// Bytes currently held by this table's in-memory index.
    pub mem_index_bytes: u64,
}

impl TableEntry {
    fn new(name: &str, ts: u64) -> Self {
        Self {
            name: name.to_string(),
            create_ts: ts,
            segments: Vec::new(),
            mem_index_bytes: 0,
        }
    }

    pub fn active_segments(&self) -> impl Iterator<Item = &SegmentEntry> {
        self.segments
            .iter()
            .filter(|s| s.status == SegmentStatus::Active)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseEntry {
    pub name: String,
    pub comment: String,
    pub create_ts: u64,
    /// Commit timestamp of the drop, if the database has been dropped but
    /// not yet cleaned up.
    pub dropped_at: Option<u64>,
    pub tables: HashMap<String, TableEntry>,
}

fn default_next_segment_id() -> u64 {
    1
}

#[derive(Debug, Serialize, Deserialize)]
struct CatalogSnapshot {
    checkpoint_ts: u64,
    #[serde(default = "default_next_segment_id")]
    next_segment_id: u64,
    databases: HashMap<String, DatabaseEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct DeltaSnapshot {
    checkpoint_ts: u64,
    ops: Vec<(u64, CatalogOp)>,
}

struct CatalogInner {
    databases: HashMap<String, DatabaseEntry>,
    /// Ops applied since the last checkpoint of either kind.
    delta_ops: Vec<(u64, CatalogOp)>,
    functions: HashMap<String, ()>,
    /// Segment ids are unique across all tables: they name data files.
    next_segment_id: u64,
}

impl Default for CatalogInner {
    fn default() -> Self {
        Self {
            databases: HashMap::new(),
            delta_ops: Vec::new(),
            functions: HashMap::new(),
            next_segment_id: 1,
        }
    }
}

/// Compaction bookkeeping enabled on writable bring-up when a compaction
/// interval is configured.
struct CompactionAlg {
    enabled_since: u64,
}

pub struct Catalog {
    inner: RwLock<CatalogInner>,
    compaction_alg: RwLock<Option<CompactionAlg>>,
    mem_index_commit_started: AtomicBool,
}

impl Catalog {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(CatalogInner::default()),
            compaction_alg: RwLock::new(None),
            mem_index_commit_started: AtomicBool::new(false),
        }
    }

    // ------------------------------------------------------------------
    // Databases and tables
    // ------------------------------------------------------------------

    pub fn create_database(&self, name: &str, comment: &str, ts: u64) -> Result<()> {
        self.apply(
            CatalogOp::CreateDatabase {
                name: name.to_string(),
                comment: comment.to_string(),
            },
            ts,
            true,
        )
    }

    pub fn drop_database(&self, name: &str, ts: u64) -> Result<()> {
        self.apply(
            CatalogOp::DropDatabase {
                name: name.to_string(),
            },
            ts,
            true,
        )
    }

    pub fn create_table(&self, database: &str, table: &str, ts: u64) -> Result<()> {
        self.apply(
            CatalogOp::CreateTable {
                database: database.to_string(),
                table: table.to_string(),
            },
            ts,
            true,
        )
    }

    pub fn database_names(&self) -> Vec<String> {
        let inner = self.inner.read();
        let mut names: Vec<String> = inner
            .databases
            .values()
            .filter(|db| db.dropped_at.is_none())
            .map(|db| db.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn database_count(&self) -> usize {
        self.inner
            .read()
            .databases
            .values()
            .filter(|db| db.dropped_at.is_none())
            .count()
    }

    pub fn has_database(&self, name: &str) -> bool {
        self.inner
            .read()
            .databases
            .get(name)
            .map(|db| db.dropped_at.is_none())
            .unwrap_or(false)
    }

    pub fn table_names(&self, database: &str) -> Result<Vec<String>> {
        let inner = self.inner.read();
        let db = inner
            .databases
            .get(database)
            .ok_or_else(|| eyre::eyre!("database '{}' does not exist", database))?;
        let mut names: Vec<String> = db.tables.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    pub fn active_segment_count(&self, database: &str, table: &str) -> usize {
        let inner = self.inner.read();
        inner
            .databases
            .get(database)
            .and_then(|db| db.tables.get(table))
            .map(|t| t.active_segments().count())
            .unwrap_or(0)
    }

    /// Id of the most recently added active segment of a table, if any.
    pub fn newest_active_segment_id(&self, database: &str, table: &str) -> Option<u64> {
        let inner = self.inner.read();
        inner
            .databases
            .get(database)
            .and_then(|db| db.tables.get(table))
            .and_then(|t| t.active_segments().map(|s| s.id).max())
    }

    // ------------------------------------------------------------------
    // Op application
    // ------------------------------------------------------------------

    /// Applies `op` at commit timestamp `ts`. When `record` is set the op is
    /// also appended to the delta log so the next delta checkpoint carries
    /// it; replayed WAL ops record (they have not been checkpointed yet)
    /// while delta-checkpoint attachment does not.
    pub(crate) fn apply(&self, op: CatalogOp, ts: u64, record: bool) -> Result<()> {
        let mut inner = self.inner.write();
        Self::apply_inner(&mut inner, &op, ts)?;
        if record {
            inner.delta_ops.push((ts, op));
        }
        Ok(())
    }

    fn apply_inner(inner: &mut CatalogInner, op: &CatalogOp, ts: u64) -> Result<()> {
        match op {
            CatalogOp::CreateDatabase { name, comment } => {
                if let Some(existing) = inner.databases.get(name) {
                    ensure!(
                        existing.dropped_at.is_some(),
                        "database '{}' already exists",
                        name
                    );
                }
                inner.databases.insert(
                    name.clone(),
                    DatabaseEntry {
                        name: name.clone(),
                        comment: comment.clone(),
                        create_ts: ts,
                        dropped_at: None,
                        tables: HashMap::new(),
                    },
                );
            }
            CatalogOp::DropDatabase { name } => {
                let db = inner
                    .databases
                    .get_mut(name)
                    .ok_or_else(|| eyre::eyre!("database '{}' does not exist", name))?;
                ensure!(db.dropped_at.is_none(), "database '{}' already dropped", name);
                db.dropped_at = Some(ts);
            }
            CatalogOp::CreateTable { database, table } => {
                let db = inner
                    .databases
                    .get_mut(database)
                    .ok_or_else(|| eyre::eyre!("database '{}' does not exist", database))?;
                ensure!(
                    !db.tables.contains_key(table),
                    "table '{}.{}' already exists",
                    database,
                    table
                );
                db.tables.insert(table.clone(), TableEntry::new(table, ts));
            }
            CatalogOp::DropTable { database, table } => {
                let db = inner
                    .databases
                    .get_mut(database)
                    .ok_or_else(|| eyre::eyre!("database '{}' does not exist", database))?;
                ensure!(
                    db.tables.remove(table).is_some(),
                    "table '{}.{}' does not exist",
                    database,
                    table
                );
            }
            CatalogOp::AddSegment {
                database,
                table,
                row_count,
                size_bytes,
            } => {
                let id = inner.next_segment_id;
                inner.next_segment_id += 1;
                let entry = Self::table_mut(inner, database, table)?;
                entry.segments.push(SegmentEntry {
                    id,
                    row_count: *row_count,
                    size_bytes: *size_bytes,
                    status: SegmentStatus::Active,
                    deprecated_at: None,
                });
            }
            CatalogOp::CompactSegments { database, table } => {
                let id = inner.next_segment_id;
                inner.next_segment_id += 1;
                let entry = Self::table_mut(inner, database, table)?;
                let active: Vec<usize> = entry
                    .segments
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| s.status == SegmentStatus::Active)
                    .map(|(i, _)| i)
                    .collect();
                if active.len() < 2 {
                    return Ok(());
                }
                let row_count: u64 = active.iter().map(|&i| entry.segments[i].row_count).sum();
                let size_bytes: u64 = active.iter().map(|&i| entry.segments[i].size_bytes).sum();
                for &i in &active {
                    entry.segments[i].status = SegmentStatus::Deprecated;
                    entry.segments[i].deprecated_at = Some(ts);
                }
                entry.segments.push(SegmentEntry {
                    id,
                    row_count,
                    size_bytes,
                    status: SegmentStatus::Active,
                    deprecated_at: None,
                });
            }
            CatalogOp::DumpMemIndex { database, table } => {
                let entry = Self::table_mut(inner, database, table)?;
                entry.mem_index_bytes = 0;
            }
        }
        Ok(())
    }

    fn table_mut<'a>(
        inner: &'a mut CatalogInner,
        database: &str,
        table: &str,
    ) -> Result<&'a mut TableEntry> {
        let db = inner
            .databases
            .get_mut(database)
            .ok_or_else(|| eyre::eyre!("database '{}' does not exist", database))?;
        db.tables
            .get_mut(table)
            .ok_or_else(|| eyre::eyre!("table '{}.{}' does not exist", database, table))
    }

    // ------------------------------------------------------------------
    // Functions
    // ------------------------------------------------------------------

    pub fn register_function(&self, name: &str) {
        self.inner.write().functions.insert(name.to_string(), ());
    }

    pub fn has_function(&self, name: &str) -> bool {
        self.inner.read().functions.contains_key(name)
    }

    pub fn function_count(&self) -> usize {
        self.inner.read().functions.len()
    }

    // ------------------------------------------------------------------
    // Compaction bookkeeping
    // ------------------------------------------------------------------

    /// Enables segment compaction from `ts` onward. Called on writable
    /// bring-up when a compaction interval is configured.
    pub fn init_compaction_alg(&self, ts: u64) {
        *self.compaction_alg.write() = Some(CompactionAlg { enabled_since: ts });
    }

    pub fn compaction_enabled(&self) -> bool {
        self.compaction_alg.read().is_some()
    }

    /// Timestamp compaction was enabled at, if it was.
    pub fn compaction_enabled_since(&self) -> Option<u64> {
        self.compaction_alg.read().as_ref().map(|alg| alg.enabled_since)
    }

    /// Tables with at least two active segments, in name order.
    pub fn compaction_candidates(&self) -> Vec<(String, String)> {
        if !self.compaction_enabled() {
            return Vec::new();
        }

        let inner = self.inner.read();
        let mut candidates = Vec::new();
        for db in inner.databases.values() {
            if db.dropped_at.is_some() {
                continue;
            }
            for table in db.tables.values() {
                if table.active_segments().count() >= 2 {
                    candidates.push((db.name.clone(), table.name.clone()));
                }
            }
        }
        candidates.sort();
        candidates
    }

    // ------------------------------------------------------------------
    // Memory index lifecycle
    // ------------------------------------------------------------------

    pub fn start_memory_index_commit(&self) {
        self.mem_index_commit_started.store(true, Ordering::Release);
    }

    pub fn memory_index_commit_started(&self) -> bool {
        self.mem_index_commit_started.load(Ordering::Acquire)
    }

    /// Replays in-memory index state for every live table by touching the
    /// first page of each active segment through the buffer manager. Runs
    /// single-threaded during bring-up, after `start_memory_index_commit`.
    pub fn mem_index_recover(&self, buffer: &BufferManager, system_start_ts: u64) -> Result<usize> {
        ensure!(
            self.memory_index_commit_started(),
            "memory index recovery requires start_memory_index_commit first"
        );

        let mut recovered = 0;
        let inner = self.inner.read();
        for db in inner.databases.values() {
            if db.dropped_at.is_some() {
                continue;
            }
            for table in db.tables.values() {
                for segment in table.active_segments() {
                    let _page = buffer.get_page(PageKey::new(segment.id, 0))?;
                    recovered += 1;
                }
            }
        }
        debug!(
            recovered,
            system_start_ts, "memory index state recovered"
        );
        Ok(recovered)
    }

    pub fn mem_index_bytes(&self, database: &str, table: &str) -> Result<u64> {
        let inner = self.inner.read();
        let db = inner
            .databases
            .get(database)
            .ok_or_else(|| eyre::eyre!("database '{}' does not exist", database))?;
        let entry = db
            .tables
            .get(table)
            .ok_or_else(|| eyre::eyre!("table '{}.{}' does not exist", database, table))?;
        Ok(entry.mem_index_bytes)
    }

    pub fn set_mem_index_bytes(&self, database: &str, table: &str, bytes: u64) -> Result<()> {
        let mut inner = self.inner.write();
        let entry = Self::table_mut(&mut inner, database, table)?;
        entry.mem_index_bytes = bytes;
        Ok(())
    }

    /// Tables currently carrying in-memory index state, in name order.
    pub fn tables_with_mem_index(&self) -> Vec<(String, String)> {
        let inner = self.inner.read();
        let mut tables: Vec<(String, String)> = inner
            .databases
            .values()
            .filter(|db| db.dropped_at.is_none())
            .flat_map(|db| {
                db.tables
                    .values()
                    .filter(|t| t.mem_index_bytes > 0)
                    .map(move |t| (db.name.clone(), t.name.clone()))
            })
            .collect();
        tables.sort();
        tables
    }

    /// The table currently holding the largest in-memory index, if any.
    pub fn largest_mem_index(&self) -> Option<(String, String, u64)> {
        let inner = self.inner.read();
        inner
            .databases
            .values()
            .filter(|db| db.dropped_at.is_none())
            .flat_map(|db| {
                db.tables
                    .values()
                    .map(move |t| (db.name.clone(), t.name.clone(), t.mem_index_bytes))
            })
            .filter(|(_, _, bytes)| *bytes > 0)
            .max_by_key(|(_, _, bytes)| *bytes)
    }

    // ------------------------------------------------------------------
    // Cleanup
    // ------------------------------------------------------------------

    /// Removes dropped databases and deprecated segments no longer visible
    /// at `visible_ts`. Returns descriptions of what was removed.
    pub fn cleanup_dropped(&self, visible_ts: u64) -> Vec<String> {
        let mut removed = Vec::new();
        let mut inner = self.inner.write();

        inner.databases.retain(|name, db| {
            if let Some(dropped_at) = db.dropped_at {
                if dropped_at < visible_ts {
                    removed.push(format!("database '{}'", name));
                    return false;
                }
            }
            true
        });

        for db in inner.databases.values_mut() {
            for table in db.tables.values_mut() {
                table.segments.retain(|segment| {
                    if let (SegmentStatus::Deprecated, Some(at)) =
                        (segment.status, segment.deprecated_at)
                    {
                        if at < visible_ts {
                            removed.push(format!(
                                "segment {} of '{}.{}'",
                                segment.id, db.name, table.name
                            ));
                            return false;
                        }
                    }
                    true
                });
            }
        }

        removed
    }

    // ------------------------------------------------------------------
    // Checkpoints
    // ------------------------------------------------------------------

    /// Writes a full snapshot to `dir` and clears the delta log. Returns the
    /// snapshot path.
    pub fn save_full_checkpoint(&self, dir: &Path, ts: u64) -> Result<PathBuf> {
        let mut inner = self.inner.write();
        let snapshot = CatalogSnapshot {
            checkpoint_ts: ts,
            next_segment_id: inner.next_segment_id,
            databases: inner.databases.clone(),
        };
        let path = dir.join(format!("{}{:020}.json", FULL_CHECKPOINT_PREFIX, ts));
        let json = serde_json::to_vec_pretty(&snapshot)
            .wrap_err("failed to serialize full catalog checkpoint")?;
        std::fs::write(&path, json)
            .wrap_err_with(|| format!("failed to write full checkpoint {:?}", path))?;
        inner.delta_ops.clear();
        info!(ts, path = ?path, "full catalog checkpoint written");
        Ok(path)
    }

    /// Writes the ops applied since the last checkpoint, if any, and clears
    /// the delta log.
    pub fn save_delta_checkpoint(&self, dir: &Path, ts: u64) -> Result<Option<PathBuf>> {
        let mut inner = self.inner.write();
        if inner.delta_ops.is_empty() {
            return Ok(None);
        }
        let snapshot = DeltaSnapshot {
            checkpoint_ts: ts,
            ops: std::mem::take(&mut inner.delta_ops),
        };
        let path = dir.join(format!("{}{:020}.json", DELTA_CHECKPOINT_PREFIX, ts));
        let json = serde_json::to_vec_pretty(&snapshot)
            .wrap_err("failed to serialize delta catalog checkpoint")?;
        std::fs::write(&path, json)
            .wrap_err_with(|| format!("failed to write delta checkpoint {:?}", path))?;
        info!(ts, ops = snapshot.ops.len(), "delta catalog checkpoint written");
        Ok(Some(path))
    }

    /// Loads a catalog from a full checkpoint snapshot.
    pub fn load_full_checkpoint(path: &Path) -> Result<Catalog> {
        let bytes = std::fs::read(path)
            .wrap_err_with(|| format!("failed to read full checkpoint {:?}", path))?;
        let snapshot: CatalogSnapshot = serde_json::from_slice(&bytes)
            .wrap_err_with(|| format!("failed to parse full checkpoint {:?}", path))?;

        let catalog = Catalog::new();
        {
            let mut inner = catalog.inner.write();
            inner.databases = snapshot.databases;
            inner.next_segment_id = snapshot.next_segment_id;
        }
        Ok(catalog)
    }

    /// Applies a delta checkpoint file on top of the current state. The ops
    /// are already checkpointed, so they are not re-recorded.
    pub fn attach_delta_checkpoint(&self, path: &Path) -> Result<()> {
        let bytes = std::fs::read(path)
            .wrap_err_with(|| format!("failed to read delta checkpoint {:?}", path))?;
        let snapshot: DeltaSnapshot = serde_json::from_slice(&bytes)
            .wrap_err_with(|| format!("failed to parse delta checkpoint {:?}", path))?;

        for (ts, op) in snapshot.ops {
            self.apply(op, ts, false)?;
        }
        Ok(())
    }

    /// Reconstructs a catalog from a full checkpoint plus delta checkpoints,
    /// applied in the given order.
    pub fn load_from_files(full: &Path, deltas: &[PathBuf]) -> Result<Catalog> {
        let catalog = Self::load_full_checkpoint(full)?;
        for delta in deltas {
            catalog.attach_delta_checkpoint(delta)?;
        }
        Ok(catalog)
    }

    /// Timestamp embedded in a checkpoint file name, if it carries one.
    pub fn checkpoint_file_ts(path: &Path) -> Option<u64> {
        let name = path.file_name()?.to_str()?;
        let digits = name
            .strip_prefix(FULL_CHECKPOINT_PREFIX)
            .or_else(|| name.strip_prefix(DELTA_CHECKPOINT_PREFIX))?
            .strip_suffix(".json")?;
        digits.parse().ok()
    }

    /// Number of delta-log entries awaiting the next checkpoint.
    pub fn pending_delta_ops(&self) -> usize {
        self.inner.read().delta_ops.len()
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

// Used by tests and the supervisor's admin hooks for error messages.
impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field("databases", &self.database_count())
            .field("pending_delta_ops", &self.pending_delta_ops())
            .finish()
    }
}
