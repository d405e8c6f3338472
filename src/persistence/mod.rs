//! # Persistence Manager
//!
//! Maps large on-disk objects (dumped index files, cold segment spills) into
//! a dedicated persistence directory. Objects are content-addressed: the
//! file name carries a CRC-64 of the payload plus its length, so persisting
//! identical content twice is naturally de-duplicated.
//!
//! A per-object size cap keeps runaway objects out of the persistence
//! directory; anything larger stays in the data directory and is the buffer
//! manager's problem.
//!
//! Only constructed when a persistence directory is configured. Unlike the
//! thread-owning managers there is no start/stop pair here; the manager is
//! plain state and is dropped during tear-down after the buffer manager has
//! flushed through it.

use std::path::{Path, PathBuf};

use crc::{Crc, CRC_64_ECMA_182};
use eyre::{ensure, Result, WrapErr};
use tracing::debug;

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_ECMA_182);

/// Address of a persisted object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectAddr {
    key: String,
    size: u64,
}

impl ObjectAddr {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

pub struct PersistenceManager {
    persistence_dir: PathBuf,
    #[allow(dead_code)]
    data_dir: PathBuf,
    object_size_limit: u64,
}

impl PersistenceManager {
    pub fn new(persistence_dir: &Path, data_dir: &Path, object_size_limit: u64) -> Result<Self> {
        std::fs::create_dir_all(persistence_dir).wrap_err_with(|| {
            format!("failed to create persistence directory {:?}", persistence_dir)
        })?;

        Ok(Self {
            persistence_dir: persistence_dir.to_path_buf(),
            data_dir: data_dir.to_path_buf(),
            object_size_limit,
        })
    }

    pub fn object_size_limit(&self) -> u64 {
        self.object_size_limit
    }

    /// Copies `src` into the persistence directory and returns its address.
    pub fn persist(&self, src: &Path) -> Result<ObjectAddr> {
        let bytes = std::fs::read(src)
            .wrap_err_with(|| format!("failed to read {:?} for persistence", src))?;
        self.persist_bytes(&bytes)
    }

    /// Persists an in-memory payload (evicted dirty pages take this path).
    pub fn persist_bytes(&self, bytes: &[u8]) -> Result<ObjectAddr> {
        ensure!(
            bytes.len() as u64 <= self.object_size_limit,
            "object of {} bytes exceeds persistence limit of {} bytes",
            bytes.len(),
            self.object_size_limit
        );

        let checksum = CRC64.checksum(bytes);
        let key = format!("obj_{:016x}_{}.bin", checksum, bytes.len());
        let path = self.persistence_dir.join(&key);

        if !path.exists() {
            std::fs::write(&path, bytes)
                .wrap_err_with(|| format!("failed to write persisted object {:?}", path))?;
            debug!(key = %key, size = bytes.len(), "persisted object");
        }

        Ok(ObjectAddr {
            key,
            size: bytes.len() as u64,
        })
    }

    pub fn read(&self, addr: &ObjectAddr) -> Result<Vec<u8>> {
        let path = self.persistence_dir.join(addr.key());
        let bytes = std::fs::read(&path)
            .wrap_err_with(|| format!("failed to read persisted object {:?}", path))?;
        ensure!(
            bytes.len() as u64 == addr.size(),
            "persisted object '{}' has {} bytes, expected {}",
            addr.key(),
            bytes.len(),
            addr.size()
        );
        Ok(bytes)
    }

    pub fn remove(&self, addr: &ObjectAddr) -> Result<()> {
        let path = self.persistence_dir.join(addr.key());
        if path.exists() {
            std::fs::remove_file(&path)
                .wrap_err_with(|| format!("failed to remove persisted object {:?}", path))?;
        }
        Ok(())
    }

    pub fn contains(&self, addr: &ObjectAddr) -> bool {
        self.persistence_dir.join(addr.key()).exists()
    }
}
