//! S3-backed shard storage.
//!
//! Files live in a [`RamDirectory`] hydrated from the bucket when the shard
//! is opened. Finished files are uploaded when the next `meta.json` is
//! written, `meta.json` itself last, so a fresh open never sees a commit
//! whose segments are missing. Deletes go straight through.
//!
//! tantivy drives the directory from blocking threads; remote calls run on
//! the runtime captured at open, which must be multi-threaded.

use crate::error::{GriddleError, Result};
use s3::creds::Credentials;
use s3::{Bucket, Region};
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tantivy::directory::error::{DeleteError, LockError, OpenReadError, OpenWriteError};
use tantivy::directory::{
    AntiCallToken, Directory, DirectoryLock, FileHandle, Lock, RamDirectory, TerminatingWrite,
    WatchCallback, WatchHandle, WritePtr,
};
use tokio::runtime::Handle;
use tracing::{debug, info};

const META_FILE: &str = "meta.json";

/// Connection settings, read from `GRIDDLE_S3_REGION` (default
/// `us-east-1`) and `GRIDDLE_S3_ENDPOINT`. Credentials come from the usual
/// `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY` variables.
#[derive(Debug, Clone)]
pub struct S3Config {
    pub region: String,
    pub endpoint: Option<String>,
}

impl S3Config {
    pub fn from_env() -> Self {
        S3Config {
            region: std::env::var("GRIDDLE_S3_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
            endpoint: std::env::var("GRIDDLE_S3_ENDPOINT")
                .ok()
                .filter(|e| !e.is_empty()),
        }
    }

    pub fn bucket(&self, name: &str) -> Result<Arc<Bucket>> {
        let credentials = Credentials::from_env()
            .map_err(|e| GriddleError::S3(format!("credentials: {}", e)))?;
        self.bucket_with(name, credentials)
    }

    pub fn bucket_with(&self, name: &str, credentials: Credentials) -> Result<Arc<Bucket>> {
        let region = match &self.endpoint {
            Some(endpoint) => Region::Custom {
                region: self.region.clone(),
                endpoint: endpoint.clone(),
            },
            None => self
                .region
                .parse()
                .map_err(|e| GriddleError::Config(format!("S3 region {}: {}", self.region, e)))?,
        };
        let mut bucket = Bucket::new(name, region, credentials).map_err(s3_error)?;
        // custom endpoints (MinIO) address buckets by path
        if self.endpoint.is_some() {
            bucket.set_path_style();
        }
        Ok(Arc::from(bucket))
    }
}

fn s3_error(e: s3::error::S3Error) -> GriddleError {
    GriddleError::S3(e.to_string())
}

fn check_status(key: &str, status: u16) -> Result<()> {
    if (200..300).contains(&status) {
        Ok(())
    } else {
        Err(GriddleError::S3(format!("{}: status {}", key, status)))
    }
}

#[derive(Clone)]
struct Remote {
    bucket: Arc<Bucket>,
    prefix: String,
}

impl Remote {
    fn new(bucket: Arc<Bucket>, prefix: &str) -> Self {
        Remote {
            bucket,
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    fn list_prefix(&self) -> String {
        if self.prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", self.prefix)
        }
    }

    fn key(&self, path: &Path) -> String {
        format!("{}{}", self.list_prefix(), path.to_string_lossy())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let pages = self
            .bucket
            .list(self.list_prefix(), None)
            .await
            .map_err(s3_error)?;
        Ok(pages
            .into_iter()
            .flat_map(|page| page.contents)
            .map(|object| object.key)
            .collect())
    }

    async fn fetch_all(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let prefix = self.list_prefix();
        let mut files = Vec::new();
        for key in self.keys().await? {
            let name = key.strip_prefix(&prefix).unwrap_or(&key).to_string();
            if name.is_empty() {
                continue;
            }
            let response = self.bucket.get_object(&key).await.map_err(s3_error)?;
            check_status(&key, response.status_code())?;
            files.push((name, response.bytes().to_vec()));
        }
        Ok(files)
    }

    async fn put(&self, path: &Path, data: &[u8]) -> Result<()> {
        let key = self.key(path);
        let response = self.bucket.put_object(&key, data).await.map_err(s3_error)?;
        check_status(&key, response.status_code())?;
        debug!(key = %key, bytes = data.len(), "uploaded shard file");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let response = self.bucket.delete_object(key).await.map_err(s3_error)?;
        match response.status_code() {
            404 => Ok(()),
            status => check_status(key, status),
        }
    }
}

/// Delete every object under `prefix`. Returns how many were removed.
pub async fn remove_prefix(bucket: Arc<Bucket>, prefix: &str) -> Result<usize> {
    let remote = Remote::new(bucket, prefix);
    let keys = remote.keys().await?;
    for key in &keys {
        remote.delete(key).await?;
    }
    Ok(keys.len())
}

type Finished = Arc<Mutex<BTreeSet<PathBuf>>>;

#[derive(Clone)]
pub struct S3Directory {
    ram: RamDirectory,
    remote: Remote,
    finished: Finished,
    runtime: Handle,
}

impl fmt::Debug for S3Directory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S3Directory(s3://{}/{})", self.remote.bucket.name, self.remote.prefix)
    }
}

impl S3Directory {
    /// Download everything under `prefix` into memory.
    pub async fn open(bucket: Arc<Bucket>, prefix: &str) -> Result<Self> {
        let remote = Remote::new(bucket, prefix);
        let ram = RamDirectory::create();
        let files = remote.fetch_all().await?;
        for (name, data) in &files {
            ram.atomic_write(Path::new(name), data)?;
        }
        info!(
            bucket = %remote.bucket.name,
            prefix = %remote.prefix,
            files = files.len(),
            "hydrated s3 shard directory"
        );
        Ok(S3Directory {
            ram,
            remote,
            finished: Arc::default(),
            runtime: Handle::current(),
        })
    }

    fn block_on<F>(&self, fut: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send,
    {
        if Handle::try_current().is_err() {
            return self.runtime.block_on(fut);
        }
        // a thread inside the runtime cannot block on it
        std::thread::scope(|scope| scope.spawn(|| self.runtime.block_on(fut)).join())
            .map_err(|_| GriddleError::S3("upload thread panicked".to_string()))?
    }

    fn take_finished(&self) -> Result<BTreeSet<PathBuf>> {
        let mut finished = self
            .finished
            .lock()
            .map_err(|_| GriddleError::Io("s3 upload set poisoned".to_string()))?;
        Ok(std::mem::take(&mut *finished))
    }

    fn restore_finished(&self, paths: BTreeSet<PathBuf>) {
        if let Ok(mut finished) = self.finished.lock() {
            finished.extend(paths);
        }
    }

    /// Upload every finished file still present, then `meta`.
    fn publish(&self, meta: &[u8]) -> Result<()> {
        let paths = self.take_finished()?;
        let mut uploads = Vec::with_capacity(paths.len());
        for path in &paths {
            match self.ram.atomic_read(path) {
                Ok(data) => uploads.push((path.clone(), data)),
                Err(OpenReadError::FileDoesNotExist(_)) => {}
                Err(e) => {
                    self.restore_finished(paths);
                    return Err(GriddleError::Io(e.to_string()));
                }
            }
        }
        let remote = self.remote.clone();
        let result = self.block_on(async move {
            for (path, data) in &uploads {
                remote.put(path, data).await?;
            }
            remote.put(Path::new(META_FILE), meta).await
        });
        if result.is_err() {
            self.restore_finished(paths);
        }
        result
    }
}

fn to_io(e: GriddleError) -> io::Error {
    io::Error::other(e.to_string())
}

impl Directory for S3Directory {
    fn get_file_handle(&self, path: &Path) -> std::result::Result<Arc<dyn FileHandle>, OpenReadError> {
        self.ram.get_file_handle(path)
    }

    fn delete(&self, path: &Path) -> std::result::Result<(), DeleteError> {
        self.ram.delete(path)?;
        if let Ok(mut finished) = self.finished.lock() {
            finished.remove(path);
        }
        let remote = self.remote.clone();
        let key = remote.key(path);
        self.block_on(async move { remote.delete(&key).await })
            .map_err(|e| DeleteError::IoError {
                io_error: Arc::new(to_io(e)),
                filepath: path.to_path_buf(),
            })
    }

    fn exists(&self, path: &Path) -> std::result::Result<bool, OpenReadError> {
        self.ram.exists(path)
    }

    fn open_write(&self, path: &Path) -> std::result::Result<WritePtr, OpenWriteError> {
        let inner = self.ram.open_write(path)?;
        Ok(BufWriter::new(Box::new(FinishOnTerminate {
            inner: Some(inner),
            path: path.to_path_buf(),
            finished: Arc::clone(&self.finished),
        })))
    }

    fn atomic_read(&self, path: &Path) -> std::result::Result<Vec<u8>, OpenReadError> {
        self.ram.atomic_read(path)
    }

    fn atomic_write(&self, path: &Path, data: &[u8]) -> io::Result<()> {
        self.ram.atomic_write(path, data)?;
        if path == Path::new(META_FILE) {
            return self.publish(data).map_err(to_io);
        }
        let remote = self.remote.clone();
        let path = path.to_path_buf();
        let data = data.to_vec();
        self.block_on(async move { remote.put(&path, &data).await })
            .map_err(to_io)
    }

    fn acquire_lock(&self, lock: &Lock) -> std::result::Result<DirectoryLock, LockError> {
        self.ram.acquire_lock(lock)
    }

    fn sync_directory(&self) -> io::Result<()> {
        Ok(())
    }

    fn watch(&self, watch_callback: WatchCallback) -> tantivy::Result<WatchHandle> {
        self.ram.watch(watch_callback)
    }
}

/// Marks its file ready for upload once tantivy terminates it.
struct FinishOnTerminate {
    inner: Option<WritePtr>,
    path: PathBuf,
    finished: Finished,
}

impl FinishOnTerminate {
    fn inner(&mut self) -> io::Result<&mut WritePtr> {
        self.inner
            .as_mut()
            .ok_or_else(|| io::Error::other(format!("{} already terminated", self.path.display())))
    }
}

impl Write for FinishOnTerminate {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner()?.flush()
    }
}

impl TerminatingWrite for FinishOnTerminate {
    fn terminate_ref(&mut self, _: AntiCallToken) -> io::Result<()> {
        if let Some(inner) = self.inner.take() {
            inner.terminate()?;
            self.finished
                .lock()
                .map_err(|_| io::Error::other("s3 upload set poisoned"))?
                .insert(self.path.clone());
        }
        Ok(())
    }
}
