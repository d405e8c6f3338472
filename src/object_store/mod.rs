//! # Remote Object Store Adapter
//!
//! Optional remote-blob backend for cold segment and large-object data.
//! The engine talks to the store through two pieces:
//!
//! - A **process-wide handle** ([`init_remote_store`] / [`uninit_remote_store`]):
//!   exactly one remote store connection may exist per process. The handle is
//!   guarded by an atomic `initialized` flag; initializing twice is a caller
//!   bug (the supervisor treats it as fatal), while un-initializing is
//!   idempotent and performed only by whoever initialized it.
//!
//! - An [`ObjectStoreProcessor`] worker thread that drains upload, download,
//!   and delete requests so that page eviction and checkpointing never block
//!   on remote I/O.
//!
//! ## Backend
//!
//! Blob transfer itself sits behind the [`BlobBackend`] trait. The shipped
//! backend stages objects in a local bucket directory; the S3 wire client is
//! a drop-in replacement behind the same trait. Connecting probes the
//! configured endpoint over TCP so that an unreachable store fails the mode
//! transition recoverably instead of surfacing later in a worker thread.
//!
//! ## Thread Safety
//!
//! All entry points are safe to call from any thread. The singleton state
//! uses `parking_lot::Mutex` plus an `AtomicBool` fast path for
//! [`is_remote_store_initialized`].

use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use eyre::{bail, ensure, Result, WrapErr};
use parking_lot::{Condvar, Mutex};
use tracing::{info, warn};

use crate::config::RemoteBlobConfig;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Transfers blobs between local paths and the remote bucket.
pub trait BlobBackend: Send + Sync {
    fn put(&self, key: &str, src: &Path) -> Result<()>;
    fn get(&self, key: &str, dst: &Path) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
}

/// Directory-backed blob backend. Objects live as files under
/// `<root>/<bucket>/<key>`, with `/` in keys mapped to subdirectories.
pub struct FsBackend {
    bucket_root: PathBuf,
}

impl FsBackend {
    pub fn new(staging_dir: &Path, bucket: &str) -> Result<Self> {
        let bucket_root = staging_dir.join(bucket);
        std::fs::create_dir_all(&bucket_root)
            .wrap_err_with(|| format!("failed to create bucket directory {:?}", bucket_root))?;
        Ok(Self { bucket_root })
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.bucket_root.join(key)
    }
}

impl BlobBackend for FsBackend {
    fn put(&self, key: &str, src: &Path) -> Result<()> {
        let dst = self.object_path(key);
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)
                .wrap_err_with(|| format!("failed to create object directory {:?}", parent))?;
        }
        std::fs::copy(src, &dst)
            .wrap_err_with(|| format!("failed to upload {:?} as object '{}'", src, key))?;
        Ok(())
    }

    fn get(&self, key: &str, dst: &Path) -> Result<()> {
        let src = self.object_path(key);
        ensure!(src.exists(), "remote object '{}' does not exist", key);
        std::fs::copy(&src, dst)
            .wrap_err_with(|| format!("failed to download object '{}' to {:?}", key, dst))?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.object_path(key);
        if path.exists() {
            std::fs::remove_file(&path)
                .wrap_err_with(|| format!("failed to delete object '{}'", key))?;
        }
        Ok(())
    }
}

/// A connected remote store: configuration plus the transfer backend.
pub struct RemoteStore {
    config: RemoteBlobConfig,
    backend: Box<dyn BlobBackend>,
}

impl RemoteStore {
    /// Probes the configured endpoint and opens the transfer backend.
    ///
    /// Objects are staged under `staging_dir` until the wire client hands
    /// them off; tests point this at a tempdir.
    pub fn connect(config: &RemoteBlobConfig, staging_dir: &Path) -> Result<Self> {
        probe_endpoint(&config.url, config.https)
            .wrap_err_with(|| format!("remote object store at '{}' is unreachable", config.url))?;

        let backend = FsBackend::new(staging_dir, &config.bucket)?;
        Ok(Self {
            config: config.clone(),
            backend: Box::new(backend),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.config.bucket
    }

    pub fn put(&self, key: &str, src: &Path) -> Result<()> {
        self.backend.put(key, src)
    }

    pub fn get(&self, key: &str, dst: &Path) -> Result<()> {
        self.backend.get(key, dst)
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        self.backend.delete(key)
    }
}

/// Resolves `url` (with or without scheme) and attempts a TCP connection.
fn probe_endpoint(url: &str, https: bool) -> Result<()> {
    let trimmed = url
        .trim_start_matches("http://")
        .trim_start_matches("https://");
    let trimmed = trimmed.split('/').next().unwrap_or(trimmed);

    let addr_str = if trimmed.contains(':') {
        trimmed.to_string()
    } else {
        let default_port = if https { 443 } else { 80 };
        format!("{}:{}", trimmed, default_port)
    };

    let mut addrs = addr_str
        .to_socket_addrs()
        .wrap_err_with(|| format!("failed to resolve endpoint '{}'", addr_str))?;
    let addr = addrs
        .next()
        .ok_or_else(|| eyre::eyre!("endpoint '{}' resolved to no addresses", addr_str))?;

    TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
        .wrap_err_with(|| format!("failed to connect to '{}'", addr_str))?;
    Ok(())
}

// ============================================================================
// Process-wide handle
// ============================================================================

static REMOTE_STORE_INITIALIZED: AtomicBool = AtomicBool::new(false);
static REMOTE_STORE: Mutex<Option<Arc<RemoteStore>>> = Mutex::new(None);

/// Initializes the process-wide remote store handle.
///
/// Returns a recoverable error if the endpoint is unreachable or if a handle
/// already exists; callers that require exactly-once semantics check
/// [`is_remote_store_initialized`] first and escalate a `true` to a fatal
/// error.
pub fn init_remote_store(config: &RemoteBlobConfig, staging_dir: &Path) -> Result<()> {
    let mut guard = REMOTE_STORE.lock();
    if guard.is_some() {
        bail!("remote object store is already initialized");
    }

    let store = RemoteStore::connect(config, staging_dir)?;
    info!(url = %config.url, bucket = %config.bucket, "remote object store connected");
    *guard = Some(Arc::new(store));
    REMOTE_STORE_INITIALIZED.store(true, Ordering::Release);
    Ok(())
}

pub fn is_remote_store_initialized() -> bool {
    REMOTE_STORE_INITIALIZED.load(Ordering::Acquire)
}

/// Returns the process-wide handle, if initialized.
pub fn remote_store() -> Option<Arc<RemoteStore>> {
    REMOTE_STORE.lock().clone()
}

/// Drops the process-wide handle. Idempotent: un-initializing an
/// uninitialized store is a no-op.
pub fn uninit_remote_store() {
    let mut guard = REMOTE_STORE.lock();
    if guard.take().is_some() {
        info!("remote object store disconnected");
    }
    REMOTE_STORE_INITIALIZED.store(false, Ordering::Release);
}

/// Test seam: clears the process-wide handle between test cases.
#[doc(hidden)]
pub fn reset_remote_store_for_tests() {
    let mut guard = REMOTE_STORE.lock();
    *guard = None;
    REMOTE_STORE_INITIALIZED.store(false, Ordering::Release);
}

// ============================================================================
// Transfer processor
// ============================================================================

/// A queued transfer request.
pub enum ObjectStoreTask {
    Upload { key: String, path: PathBuf },
    Download { key: String, path: PathBuf },
    Delete { key: String },
}

impl ObjectStoreTask {
    fn describe(&self) -> String {
        match self {
            ObjectStoreTask::Upload { key, .. } => format!("upload '{}'", key),
            ObjectStoreTask::Download { key, .. } => format!("download '{}'", key),
            ObjectStoreTask::Delete { key } => format!("delete '{}'", key),
        }
    }
}

struct ProcessorShared {
    queue: Mutex<Vec<ObjectStoreTask>>,
    work_ready: Condvar,
    shutdown: AtomicBool,
}

/// Single worker thread draining remote-store transfer requests.
///
/// Constructed only when the engine runs with a remote blob store; started
/// immediately after the process-wide handle comes up and stopped before the
/// handle is dropped.
pub struct ObjectStoreProcessor {
    shared: Arc<ProcessorShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ObjectStoreProcessor {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(ProcessorShared {
                queue: Mutex::new(Vec::new()),
                work_ready: Condvar::new(),
                shutdown: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("opal-objstore".to_string())
            .spawn(move || worker_loop(&shared))
            .expect("failed to spawn object store worker thread");
        *self.worker.lock() = Some(handle);
    }

    pub fn submit(&self, task: ObjectStoreTask) {
        let mut queue = self.shared.queue.lock();
        queue.push(task);
        self.shared.work_ready.notify_one();
    }

    /// Signals shutdown and joins the worker. Remaining queued tasks are
    /// drained before the worker exits.
    pub fn stop(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        {
            let _queue = self.shared.queue.lock();
            self.shared.work_ready.notify_all();
        }
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Default for ObjectStoreProcessor {
    fn default() -> Self {
        Self::new()
    }
}

fn worker_loop(shared: &ProcessorShared) {
    loop {
        let task = {
            let mut queue = shared.queue.lock();
            loop {
                if !queue.is_empty() {
                    break queue.remove(0);
                }
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                shared.work_ready.wait(&mut queue);
            }
        };

        let Some(store) = remote_store() else {
            warn!("dropping {}: remote store is gone", task.describe());
            continue;
        };

        let outcome = match &task {
            ObjectStoreTask::Upload { key, path } => store.put(key, path),
            ObjectStoreTask::Download { key, path } => store.get(key, path),
            ObjectStoreTask::Delete { key } => store.delete(key),
        };

        if let Err(e) = outcome {
            warn!("object store {} failed: {:#}", task.describe(), e);
        }
    }
}
