//! # Runtime Configuration
//!
//! The storage engine consumes configuration through [`ConfigView`], an
//! immutable snapshot of every parameter the lifecycle consults. A view is
//! assembled once with [`ConfigBuilder`] and then shared by reference for
//! the life of the engine; nothing in the engine mutates it.
//!
//! Interval parameters are in seconds and a non-positive value disables the
//! corresponding periodic trigger. The remote-blob parameters are only
//! meaningful when [`StorageType::RemoteBlob`] is selected.

pub mod constants;

pub use constants::*;

use std::path::{Path, PathBuf};

use eyre::{ensure, Result};

/// Which backing store holds segment and large-object data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageType {
    /// Everything lives on the local filesystem.
    Local,
    /// Cold objects are mirrored to an S3-compatible remote store.
    RemoteBlob(RemoteBlobConfig),
}

impl StorageType {
    pub fn is_remote(&self) -> bool {
        matches!(self, StorageType::RemoteBlob(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            StorageType::Local => "local",
            StorageType::RemoteBlob(_) => "remote_blob",
        }
    }
}

/// Connection parameters for an S3-compatible remote store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteBlobConfig {
    pub url: String,
    pub https: bool,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
}

/// Durability policy applied when a transaction commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushMethod {
    /// fsync the log once per commit before acknowledging.
    PerCommit,
    /// Batch commits and fsync once per flusher wakeup (group commit).
    #[default]
    Grouped,
}

/// Immutable snapshot of runtime parameters consumed by the lifecycle.
#[derive(Debug, Clone)]
pub struct ConfigView {
    data_dir: PathBuf,
    temp_dir: PathBuf,
    wal_dir: PathBuf,
    persistence_dir: Option<PathBuf>,
    persistence_object_size_limit: u64,
    storage_type: StorageType,
    buffer_manager_size: usize,
    lru_num: usize,
    wal_compact_threshold: u64,
    delta_checkpoint_threshold: u64,
    flush_method_at_commit: FlushMethod,
    full_checkpoint_interval: i64,
    delta_checkpoint_interval: i64,
    compact_interval: i64,
    optimize_index_interval: i64,
    cleanup_interval: i64,
    mem_index_memory_quota: u64,
    result_cache_enabled: bool,
    cache_result_num: usize,
    default_database_name: String,
}

impl ConfigView {
    /// Starts a builder rooted at `base_dir`, deriving the data, temp, and
    /// WAL directories from it.
    pub fn builder<P: AsRef<Path>>(base_dir: P) -> ConfigBuilder {
        ConfigBuilder::new(base_dir)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn wal_dir(&self) -> &Path {
        &self.wal_dir
    }

    /// `None` disables the persistence manager.
    pub fn persistence_dir(&self) -> Option<&Path> {
        self.persistence_dir.as_deref()
    }

    pub fn persistence_object_size_limit(&self) -> u64 {
        self.persistence_object_size_limit
    }

    pub fn storage_type(&self) -> &StorageType {
        &self.storage_type
    }

    pub fn buffer_manager_size(&self) -> usize {
        self.buffer_manager_size
    }

    pub fn lru_num(&self) -> usize {
        self.lru_num
    }

    pub fn wal_compact_threshold(&self) -> u64 {
        self.wal_compact_threshold
    }

    pub fn delta_checkpoint_threshold(&self) -> u64 {
        self.delta_checkpoint_threshold
    }

    pub fn flush_method_at_commit(&self) -> FlushMethod {
        self.flush_method_at_commit
    }

    pub fn full_checkpoint_interval(&self) -> i64 {
        self.full_checkpoint_interval
    }

    pub fn delta_checkpoint_interval(&self) -> i64 {
        self.delta_checkpoint_interval
    }

    pub fn compact_interval(&self) -> i64 {
        self.compact_interval
    }

    pub fn optimize_index_interval(&self) -> i64 {
        self.optimize_index_interval
    }

    pub fn cleanup_interval(&self) -> i64 {
        self.cleanup_interval
    }

    pub fn mem_index_memory_quota(&self) -> u64 {
        self.mem_index_memory_quota
    }

    pub fn result_cache_enabled(&self) -> bool {
        self.result_cache_enabled
    }

    pub fn cache_result_num(&self) -> usize {
        self.cache_result_num
    }

    pub fn default_database_name(&self) -> &str {
        &self.default_database_name
    }
}

/// Fluent builder for [`ConfigView`].
///
/// Only `base_dir` is mandatory; every other parameter falls back to the
/// defaults in [`constants`].
pub struct ConfigBuilder {
    data_dir: PathBuf,
    temp_dir: PathBuf,
    wal_dir: PathBuf,
    persistence_dir: Option<PathBuf>,
    persistence_object_size_limit: u64,
    storage_type: StorageType,
    buffer_manager_size: usize,
    lru_num: usize,
    wal_compact_threshold: u64,
    delta_checkpoint_threshold: u64,
    flush_method_at_commit: FlushMethod,
    full_checkpoint_interval: i64,
    delta_checkpoint_interval: i64,
    compact_interval: i64,
    optimize_index_interval: i64,
    cleanup_interval: i64,
    mem_index_memory_quota: u64,
    result_cache_enabled: bool,
    cache_result_num: usize,
    default_database_name: String,
}

impl ConfigBuilder {
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Self {
        let base = base_dir.as_ref();
        Self {
            data_dir: base.join("data"),
            temp_dir: base.join("tmp"),
            wal_dir: base.join("wal"),
            persistence_dir: None,
            persistence_object_size_limit: DEFAULT_PERSISTENCE_OBJECT_SIZE_LIMIT,
            storage_type: StorageType::Local,
            buffer_manager_size: DEFAULT_BUFFER_MANAGER_SIZE,
            lru_num: DEFAULT_LRU_NUM,
            wal_compact_threshold: DEFAULT_WAL_COMPACT_THRESHOLD,
            delta_checkpoint_threshold: DEFAULT_DELTA_CHECKPOINT_THRESHOLD,
            flush_method_at_commit: FlushMethod::default(),
            full_checkpoint_interval: DEFAULT_FULL_CHECKPOINT_INTERVAL,
            delta_checkpoint_interval: DEFAULT_DELTA_CHECKPOINT_INTERVAL,
            compact_interval: DEFAULT_COMPACT_INTERVAL,
            optimize_index_interval: DEFAULT_OPTIMIZE_INDEX_INTERVAL,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            mem_index_memory_quota: DEFAULT_MEM_INDEX_MEMORY_QUOTA,
            result_cache_enabled: false,
            cache_result_num: DEFAULT_CACHE_RESULT_NUM,
            default_database_name: DEFAULT_DATABASE_NAME.to_string(),
        }
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.data_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn temp_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.temp_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn wal_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.wal_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Enables the persistence manager rooted at `dir`.
    pub fn persistence_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.persistence_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn persistence_object_size_limit(mut self, bytes: u64) -> Self {
        self.persistence_object_size_limit = bytes;
        self
    }

    pub fn storage_type(mut self, storage_type: StorageType) -> Self {
        self.storage_type = storage_type;
        self
    }

    pub fn buffer_manager_size(mut self, bytes: usize) -> Self {
        self.buffer_manager_size = bytes;
        self
    }

    pub fn lru_num(mut self, shards: usize) -> Self {
        self.lru_num = shards;
        self
    }

    pub fn wal_compact_threshold(mut self, bytes: u64) -> Self {
        self.wal_compact_threshold = bytes;
        self
    }

    pub fn delta_checkpoint_threshold(mut self, bytes: u64) -> Self {
        self.delta_checkpoint_threshold = bytes;
        self
    }

    pub fn flush_method_at_commit(mut self, method: FlushMethod) -> Self {
        self.flush_method_at_commit = method;
        self
    }

    pub fn full_checkpoint_interval(mut self, secs: i64) -> Self {
        self.full_checkpoint_interval = secs;
        self
    }

    pub fn delta_checkpoint_interval(mut self, secs: i64) -> Self {
        self.delta_checkpoint_interval = secs;
        self
    }

    pub fn compact_interval(mut self, secs: i64) -> Self {
        self.compact_interval = secs;
        self
    }

    pub fn optimize_index_interval(mut self, secs: i64) -> Self {
        self.optimize_index_interval = secs;
        self
    }

    pub fn cleanup_interval(mut self, secs: i64) -> Self {
        self.cleanup_interval = secs;
        self
    }

    pub fn mem_index_memory_quota(mut self, bytes: u64) -> Self {
        self.mem_index_memory_quota = bytes;
        self
    }

    pub fn result_cache(mut self, enabled: bool) -> Self {
        self.result_cache_enabled = enabled;
        self
    }

    pub fn cache_result_num(mut self, entries: usize) -> Self {
        self.cache_result_num = entries;
        self
    }

    pub fn default_database_name(mut self, name: impl Into<String>) -> Self {
        self.default_database_name = name.into();
        self
    }

    /// Validates parameter relationships and freezes the view.
    pub fn build(self) -> Result<ConfigView> {
        ensure!(self.lru_num > 0, "lru_num must be at least 1");
        ensure!(
            self.buffer_manager_size >= self.lru_num * PAGE_SIZE,
            "buffer_manager_size {} cannot hold one page per shard ({} shards of {} bytes)",
            self.buffer_manager_size,
            self.lru_num,
            PAGE_SIZE
        );
        ensure!(
            !self.default_database_name.is_empty(),
            "default_database_name must not be empty"
        );
        if let StorageType::RemoteBlob(remote) = &self.storage_type {
            ensure!(!remote.url.is_empty(), "remote blob store requires a url");
            ensure!(
                !remote.bucket.is_empty(),
                "remote blob store requires a bucket"
            );
        }

        Ok(ConfigView {
            data_dir: self.data_dir,
            temp_dir: self.temp_dir,
            wal_dir: self.wal_dir,
            persistence_dir: self.persistence_dir,
            persistence_object_size_limit: self.persistence_object_size_limit,
            storage_type: self.storage_type,
            buffer_manager_size: self.buffer_manager_size,
            lru_num: self.lru_num,
            wal_compact_threshold: self.wal_compact_threshold,
            delta_checkpoint_threshold: self.delta_checkpoint_threshold,
            flush_method_at_commit: self.flush_method_at_commit,
            full_checkpoint_interval: self.full_checkpoint_interval,
            delta_checkpoint_interval: self.delta_checkpoint_interval,
            compact_interval: self.compact_interval,
            optimize_index_interval: self.optimize_index_interval,
            cleanup_interval: self.cleanup_interval,
            mem_index_memory_quota: self.mem_index_memory_quota,
            result_cache_enabled: self.result_cache_enabled,
            cache_result_num: self.cache_result_num,
            default_database_name: self.default_database_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_derives_directories_from_base() {
        let config = ConfigView::builder("/srv/opal").build().unwrap();

        assert_eq!(config.data_dir(), Path::new("/srv/opal/data"));
        assert_eq!(config.temp_dir(), Path::new("/srv/opal/tmp"));
        assert_eq!(config.wal_dir(), Path::new("/srv/opal/wal"));
        assert!(config.persistence_dir().is_none());
    }

    #[test]
    fn builder_rejects_undersized_buffer() {
        let result = ConfigView::builder("/srv/opal")
            .buffer_manager_size(PAGE_SIZE)
            .lru_num(4)
            .build();

        assert!(result.is_err());
    }

    #[test]
    fn builder_rejects_remote_store_without_bucket() {
        let result = ConfigView::builder("/srv/opal")
            .storage_type(StorageType::RemoteBlob(RemoteBlobConfig {
                url: "127.0.0.1:9000".to_string(),
                https: false,
                access_key: "ak".to_string(),
                secret_key: "sk".to_string(),
                bucket: String::new(),
            }))
            .build();

        assert!(result.is_err());
    }

    #[test]
    fn builder_chaining_overrides_defaults() {
        let config = ConfigView::builder("/srv/opal")
            .compact_interval(60)
            .full_checkpoint_interval(300)
            .delta_checkpoint_interval(30)
            .cleanup_interval(120)
            .optimize_index_interval(0)
            .result_cache(true)
            .cache_result_num(256)
            .build()
            .unwrap();

        assert_eq!(config.compact_interval(), 60);
        assert_eq!(config.full_checkpoint_interval(), 300);
        assert_eq!(config.delta_checkpoint_interval(), 30);
        assert_eq!(config.cleanup_interval(), 120);
        assert_eq!(config.optimize_index_interval(), 0);
        assert!(config.result_cache_enabled());
        assert_eq!(config.cache_result_num(), 256);
    }

    #[test]
    fn default_database_name_is_configurable() {
        let config = ConfigView::builder("/srv/opal")
            .default_database_name("main")
            .build()
            .unwrap();

        assert_eq!(config.default_database_name(), "main");
    }
}
