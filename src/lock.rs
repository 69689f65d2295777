//! Lock managers guarding shard storage against a second writer.
//!
//! An empty lock URI means the backend needs no lock. `file:///path` takes
//! an advisory OS lock on `{path}.lock`, which is enough for writers that
//! share one host or one network filesystem.

use crate::error::{GriddleError, Result};
use async_trait::async_trait;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(500);
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(3);

#[async_trait]
pub trait LockManager: Send + Sync {
    /// Acquire the lock, retrying for a bounded time. Returns a token
    /// identifying this holder.
    ///
    /// Fails with [`GriddleError::AlreadyLocked`] when another holder keeps
    /// the lock past the timeout, [`GriddleError::LockFailed`] on backend
    /// failure.
    async fn lock(&self) -> Result<String>;

    /// Fails with [`GriddleError::LockDoesNotExist`] when not held.
    async fn unlock(&self) -> Result<()>;
}

pub fn open_lock_manager(lock_uri: &str) -> Result<Box<dyn LockManager>> {
    if lock_uri.is_empty() {
        return Ok(Box::new(NoopLock));
    }
    let parsed = url::Url::parse(lock_uri)
        .map_err(|e| GriddleError::InvalidUri(format!("{}: {}", lock_uri, e)))?;
    match parsed.scheme() {
        "file" => {
            let path = parsed
                .to_file_path()
                .map_err(|_| GriddleError::InvalidUri(format!("{}: not a local path", lock_uri)))?;
            Ok(Box::new(FileLock::new(path)))
        }
        other => Err(GriddleError::UnsupportedBackend(format!(
            "lock scheme '{}' in {}",
            other, lock_uri
        ))),
    }
}

pub struct NoopLock;

#[async_trait]
impl LockManager for NoopLock {
    async fn lock(&self) -> Result<String> {
        Ok(String::new())
    }

    async fn unlock(&self) -> Result<()> {
        Ok(())
    }
}

pub struct FileLock {
    path: PathBuf,
    held: Mutex<Option<(File, String)>>,
    retry_interval: Duration,
    timeout: Duration,
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let mut path = path.into().into_os_string();
        path.push(".lock");
        FileLock {
            path: PathBuf::from(path),
            held: Mutex::new(None),
            retry_interval: LOCK_RETRY_INTERVAL,
            timeout: LOCK_TIMEOUT,
        }
    }

    pub fn with_timing(mut self, retry_interval: Duration, timeout: Duration) -> Self {
        self.retry_interval = retry_interval;
        self.timeout = timeout;
        self
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn held(&self) -> Result<std::sync::MutexGuard<'_, Option<(File, String)>>> {
        self.held
            .lock()
            .map_err(|_| GriddleError::LockFailed(format!("{}: poisoned", self.path.display())))
    }

    fn open_file(&self) -> Result<File> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| GriddleError::LockFailed(format!("{}: {}", self.path.display(), e)))?;
        }
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| GriddleError::LockFailed(format!("{}: {}", self.path.display(), e)))
    }
}

#[async_trait]
impl LockManager for FileLock {
    async fn lock(&self) -> Result<String> {
        if self.held()?.is_some() {
            return Err(GriddleError::AlreadyLocked(self.path.display().to_string()));
        }
        let file = self.open_file()?;
        let deadline = Instant::now() + self.timeout;

        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                    if Instant::now() >= deadline {
                        warn!(path = %self.path.display(), "lock still held elsewhere after {:?}", self.timeout);
                        return Err(GriddleError::AlreadyLocked(self.path.display().to_string()));
                    }
                    tokio::time::sleep(self.retry_interval).await;
                }
                Err(e) => {
                    return Err(GriddleError::LockFailed(format!(
                        "{}: {}",
                        self.path.display(),
                        e
                    )))
                }
            }
        }

        let token = uuid::Uuid::new_v4().to_string();
        let mut held = self.held()?;
        if held.is_some() {
            // a concurrent lock() on this manager won; ours is a duplicate flock
            return Err(GriddleError::AlreadyLocked(self.path.display().to_string()));
        }
        *held = Some((file, token.clone()));
        debug!(path = %self.path.display(), "lock acquired");
        Ok(token)
    }

    async fn unlock(&self) -> Result<()> {
        let taken = self.held()?.take();
        match taken {
            Some((file, _)) => {
                FileExt::unlock(&file).map_err(|e| {
                    GriddleError::LockFailed(format!("{}: {}", self.path.display(), e))
                })?;
                debug!(path = %self.path.display(), "lock released");
                Ok(())
            }
            None => Err(GriddleError::LockDoesNotExist(self.path.display().to_string())),
        }
    }
}
