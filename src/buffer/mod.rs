//! # Buffer Manager
//!
//! Fixed-byte-budget page cache in front of the data directory. The budget
//! is divided across `lru_num` independent shards, each guarded by its own
//! `RwLock`, so concurrent readers on different pages rarely contend.
//!
//! ## Eviction
//!
//! Each shard tracks a recency tick per entry and evicts the least recently
//! used unpinned page when full. Evicted dirty pages are written back to the
//! persistence manager when one is configured, otherwise directly to the
//! page's data file.
//!
//! ## Pin Protocol
//!
//! [`PageHandle`] is an RAII pin: while a handle exists the page cannot be
//! evicted. Reads go through `PageHandle::read`, writes through
//! `PageHandle::write` (which marks the page dirty). Many readers may hold
//! the same page; the inner `RwLock` serializes writers per page.
//!
//! `stop` flushes every dirty page before the manager is dropped; the
//! supervisor guarantees the WAL and transaction manager are already
//! stopped at that point, so nothing can dirty pages concurrently.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use eyre::{bail, ensure, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

use crate::config::PAGE_SIZE;
use crate::persistence::{ObjectAddr, PersistenceManager};

/// Identifies one page of one data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub file_id: u64,
    pub page_no: u32,
}

impl PageKey {
    pub fn new(file_id: u64, page_no: u32) -> Self {
        Self { file_id, page_no }
    }
}

struct Page {
    data: RwLock<Box<[u8; PAGE_SIZE]>>,
    dirty: AtomicBool,
    pin_count: AtomicU32,
    last_used: AtomicU64,
}

impl Page {
    fn new(data: Box<[u8; PAGE_SIZE]>) -> Self {
        Self {
            data: RwLock::new(data),
            dirty: AtomicBool::new(false),
            pin_count: AtomicU32::new(0),
            last_used: AtomicU64::new(0),
        }
    }

    fn is_pinned(&self) -> bool {
        self.pin_count.load(Ordering::Acquire) > 0
    }
}

struct Shard {
    pages: HashMap<PageKey, Arc<Page>>,
    capacity: usize,
}

pub struct BufferManager {
    shards: Vec<RwLock<Shard>>,
    tick: AtomicU64,
    data_dir: PathBuf,
    temp_dir: PathBuf,
    persistence: Option<Arc<PersistenceManager>>,
    // Addresses of pages currently parked in the persistence directory.
    persisted_pages: Mutex<HashMap<PageKey, ObjectAddr>>,
    started: AtomicBool,
}

impl BufferManager {
    pub fn new(
        size_bytes: usize,
        data_dir: &Path,
        temp_dir: &Path,
        persistence: Option<Arc<PersistenceManager>>,
        lru_num: usize,
    ) -> Result<Self> {
        ensure!(lru_num > 0, "buffer manager requires at least one shard");
        let total_pages = size_bytes / PAGE_SIZE;
        ensure!(
            total_pages >= lru_num,
            "buffer budget of {} bytes cannot hold one page per shard ({} shards)",
            size_bytes,
            lru_num
        );

        let capacity_per_shard = total_pages / lru_num;
        let remainder = total_pages % lru_num;
        let shards = (0..lru_num)
            .map(|i| {
                let cap = if i < remainder {
                    capacity_per_shard + 1
                } else {
                    capacity_per_shard
                };
                RwLock::new(Shard {
                    pages: HashMap::with_capacity(cap),
                    capacity: cap,
                })
            })
            .collect();

        Ok(Self {
            shards,
            tick: AtomicU64::new(1),
            data_dir: data_dir.to_path_buf(),
            temp_dir: temp_dir.to_path_buf(),
            persistence,
            persisted_pages: Mutex::new(HashMap::new()),
            started: AtomicBool::new(false),
        })
    }

    /// Creates the backing directories. Must be called before any page
    /// access; the supervisor does so immediately after construction.
    pub fn start(&self) -> Result<()> {
        std::fs::create_dir_all(&self.data_dir)
            .wrap_err_with(|| format!("failed to create data directory {:?}", self.data_dir))?;
        std::fs::create_dir_all(&self.temp_dir)
            .wrap_err_with(|| format!("failed to create temp directory {:?}", self.temp_dir))?;
        self.started.store(true, Ordering::Release);
        info!(data_dir = ?self.data_dir, shards = self.shards.len(), "buffer manager started");
        Ok(())
    }

    /// Flushes all dirty pages and drops the cache contents.
    pub fn stop(&self) -> Result<()> {
        let flushed = self.flush_all()?;
        for shard in &self.shards {
            shard.write().pages.clear();
        }
        self.started.store(false, Ordering::Release);
        info!(flushed, "buffer manager stopped");
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn capacity_pages(&self) -> usize {
        self.shards.iter().map(|s| s.read().capacity).sum()
    }

    pub fn cached_pages(&self) -> usize {
        self.shards.iter().map(|s| s.read().pages.len()).sum()
    }

    /// Path for temp-dir spill files.
    pub fn temp_file(&self, name: &str) -> PathBuf {
        self.temp_dir.join(name)
    }

    fn shard_for(&self, key: &PageKey) -> &RwLock<Shard> {
        let hash = (key.file_id as usize)
            .wrapping_mul(31)
            .wrapping_add(key.page_no as usize);
        &self.shards[hash % self.shards.len()]
    }

    fn data_file_path(&self, file_id: u64) -> PathBuf {
        self.data_dir.join(format!("seg_{:08}.dat", file_id))
    }

    fn touch(&self, page: &Page) {
        let now = self.tick.fetch_add(1, Ordering::Relaxed);
        page.last_used.store(now, Ordering::Relaxed);
    }

    /// Returns a pinned handle for `key`, loading the page from backing
    /// storage if it is not cached. Absent pages read as zeroes.
    pub fn get_page(&self, key: PageKey) -> Result<PageHandle<'_>> {
        ensure!(self.is_started(), "buffer manager is not started");

        {
            let shard = self.shard_for(&key).read();
            if let Some(page) = shard.pages.get(&key) {
                page.pin_count.fetch_add(1, Ordering::AcqRel);
                self.touch(page);
                return Ok(PageHandle {
                    manager: self,
                    key,
                    page: Arc::clone(page),
                });
            }
        }

        let data = self.load_page(&key)?;

        let mut shard = self.shard_for(&key).write();
        // Another thread may have loaded the page while we read the file.
        if let Some(page) = shard.pages.get(&key) {
            page.pin_count.fetch_add(1, Ordering::AcqRel);
            self.touch(page);
            return Ok(PageHandle {
                manager: self,
                key,
                page: Arc::clone(page),
            });
        }

        if shard.pages.len() >= shard.capacity {
            self.evict_one(&mut shard)?;
        }

        let page = Arc::new(Page::new(data));
        page.pin_count.fetch_add(1, Ordering::AcqRel);
        self.touch(&page);
        shard.pages.insert(key, Arc::clone(&page));

        Ok(PageHandle {
            manager: self,
            key,
            page,
        })
    }

    fn load_page(&self, key: &PageKey) -> Result<Box<[u8; PAGE_SIZE]>> {
        let mut data = Box::new([0u8; PAGE_SIZE]);

        if let Some(persistence) = &self.persistence {
            let addr = self.persisted_pages.lock().get(key).cloned();
            if let Some(addr) = addr {
                let bytes = persistence.read(&addr)?;
                data.copy_from_slice(&bytes);
                return Ok(data);
            }
        }

        let path = self.data_file_path(key.file_id);
        if !path.exists() {
            return Ok(data);
        }

        use std::io::{Read, Seek, SeekFrom};
        let mut file = std::fs::File::open(&path)
            .wrap_err_with(|| format!("failed to open data file {:?}", path))?;
        let offset = key.page_no as u64 * PAGE_SIZE as u64;
        let len = file.metadata().wrap_err("failed to stat data file")?.len();
        if offset >= len {
            return Ok(data);
        }
        file.seek(SeekFrom::Start(offset))
            .wrap_err("failed to seek in data file")?;
        let readable = ((len - offset) as usize).min(PAGE_SIZE);
        file.read_exact(&mut data[..readable])
            .wrap_err_with(|| format!("failed to read page {} of {:?}", key.page_no, path))?;
        Ok(data)
    }

    fn evict_one(&self, shard: &mut Shard) -> Result<()> {
        let victim = shard
            .pages
            .iter()
            .filter(|(_, page)| !page.is_pinned())
            .min_by_key(|(_, page)| page.last_used.load(Ordering::Relaxed))
            .map(|(key, _)| *key);

        let Some(key) = victim else {
            bail!(
                "cannot evict: all {} pages in shard are pinned",
                shard.pages.len()
            );
        };

        let page = shard.pages.remove(&key).expect("victim vanished under write lock");
        if page.dirty.load(Ordering::Acquire) {
            let data = page.data.read();
            self.write_back(&key, &**data)?;
        }
        debug!(file_id = key.file_id, page_no = key.page_no, "evicted page");
        Ok(())
    }

    /// Writes one page to the persistence manager when configured, or
    /// directly into the data file.
    fn write_back(&self, key: &PageKey, data: &[u8; PAGE_SIZE]) -> Result<()> {
        if let Some(persistence) = &self.persistence {
            let addr = persistence.persist_bytes(data.as_slice())?;
            self.persisted_pages.lock().insert(*key, addr);
            return Ok(());
        }

        use std::io::{Seek, SeekFrom, Write};
        let path = self.data_file_path(key.file_id);
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .open(&path)
            .wrap_err_with(|| format!("failed to open data file {:?} for write-back", path))?;

        let offset = key.page_no as u64 * PAGE_SIZE as u64;
        let len = file.metadata().wrap_err("failed to stat data file")?.len();
        if len < offset {
            file.set_len(offset)
                .wrap_err("failed to extend data file")?;
        }
        file.seek(SeekFrom::Start(offset))
            .wrap_err("failed to seek in data file")?;
        file.write_all(data.as_slice())
            .wrap_err_with(|| format!("failed to write page {} of {:?}", key.page_no, path))?;
        file.sync_data().wrap_err("failed to sync data file")?;
        Ok(())
    }

    /// Flushes every dirty cached page. Returns the number flushed.
    pub fn flush_all(&self) -> Result<usize> {
        let mut flushed = 0;
        for shard in &self.shards {
            let guard = shard.read();
            for (key, page) in guard.pages.iter() {
                if page.dirty.swap(false, Ordering::AcqRel) {
                    let data = page.data.read();
                    self.write_back(key, &**data)?;
                    flushed += 1;
                }
            }
        }
        Ok(flushed)
    }
}

/// Pinned reference to one cached page. Unpins on drop.
pub struct PageHandle<'a> {
    manager: &'a BufferManager,
    key: PageKey,
    page: Arc<Page>,
}

impl<'a> PageHandle<'a> {
    pub fn key(&self) -> PageKey {
        self.key
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.manager.touch(&self.page);
        self.page.data.read()
    }

    /// Exclusive write access; marks the page dirty.
    pub fn write(&self) -> RwLockWriteGuard<'_, Box<[u8; PAGE_SIZE]>> {
        self.manager.touch(&self.page);
        self.page.dirty.store(true, Ordering::Release);
        self.page.data.write()
    }

    pub fn is_dirty(&self) -> bool {
        self.page.dirty.load(Ordering::Acquire)
    }
}

impl Drop for PageHandle<'_> {
    fn drop(&mut self) {
        let prev = self.page.pin_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unpin of unpinned page");
    }
}
