//! Shard storage resolution: URI → tantivy directory.
//!
//! * `file:///path` → [`MmapDirectory`] at `path`, created on demand.
//! * `mem://name` → a [`RamDirectory`] cached per URI, so every handle
//!   opened through the same factory sees the same files.
//! * `s3://bucket/prefix` → an S3-backed directory (`s3-storage` feature),
//!   hydrated from the bucket on every open.

#[cfg(feature = "s3-storage")]
pub mod s3;

use crate::error::{GriddleError, Result};
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tantivy::directory::{Directory, MmapDirectory, RamDirectory};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageLocation {
    File(PathBuf),
    Memory(String),
    S3 { bucket: String, prefix: String },
}

impl StorageLocation {
    pub fn parse(uri: &str) -> Result<Self> {
        let parsed = url::Url::parse(uri)
            .map_err(|e| GriddleError::InvalidUri(format!("{}: {}", uri, e)))?;
        match parsed.scheme() {
            "file" => parsed
                .to_file_path()
                .map(StorageLocation::File)
                .map_err(|_| GriddleError::InvalidUri(format!("{}: not a local path", uri))),
            "mem" => Ok(StorageLocation::Memory(uri.trim_end_matches('/').to_string())),
            "s3" => {
                let bucket = parsed
                    .host_str()
                    .filter(|h| !h.is_empty())
                    .ok_or_else(|| GriddleError::InvalidUri(format!("{}: missing bucket", uri)))?;
                Ok(StorageLocation::S3 {
                    bucket: bucket.to_string(),
                    prefix: parsed.path().trim_matches('/').to_string(),
                })
            }
            other => Err(GriddleError::UnsupportedBackend(format!(
                "shard storage scheme '{}' in {}",
                other, uri
            ))),
        }
    }

    /// [`parse`](Self::parse), also rejecting backends this build cannot open.
    pub fn parse_supported(uri: &str) -> Result<Self> {
        match Self::parse(uri)? {
            StorageLocation::S3 { .. } if !cfg!(feature = "s3-storage") => Err(s3_disabled(uri)),
            location => Ok(location),
        }
    }
}

fn s3_disabled(uri: &str) -> GriddleError {
    GriddleError::UnsupportedBackend(format!("{}: built without the s3-storage feature", uri))
}

/// Node-owned directory factory shared by the writer and reader pools.
#[derive(Default)]
pub struct DirectoryFactory {
    ram: DashMap<String, RamDirectory>,
}

impl DirectoryFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn open(&self, uri: &str) -> Result<Box<dyn Directory>> {
        match StorageLocation::parse(uri)? {
            StorageLocation::File(path) => {
                std::fs::create_dir_all(&path)?;
                let dir = MmapDirectory::open(&path).map_err(|e| {
                    GriddleError::Io(format!("open {}: {}", path.display(), e))
                })?;
                debug!(uri, "opened mmap directory");
                Ok(Box::new(dir))
            }
            StorageLocation::Memory(key) => {
                let dir = self
                    .ram
                    .entry(key)
                    .or_insert_with(RamDirectory::create)
                    .clone();
                Ok(Box::new(dir))
            }
            #[cfg(feature = "s3-storage")]
            StorageLocation::S3 { bucket, prefix } => {
                let bucket = s3::S3Config::from_env().bucket(&bucket)?;
                Ok(Box::new(s3::S3Directory::open(bucket, &prefix).await?))
            }
            #[cfg(not(feature = "s3-storage"))]
            StorageLocation::S3 { .. } => Err(s3_disabled(uri)),
        }
    }

    /// Drop the shard's files. Missing storage is not an error.
    pub async fn remove(&self, uri: &str) -> Result<()> {
        match StorageLocation::parse(uri)? {
            StorageLocation::File(path) => match std::fs::remove_dir_all(&path) {
                Ok(()) => {
                    info!(uri, "removed shard storage");
                    Ok(())
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            },
            StorageLocation::Memory(key) => {
                self.ram.remove(&key);
                Ok(())
            }
            #[cfg(feature = "s3-storage")]
            StorageLocation::S3 { bucket, prefix } => {
                let bucket = s3::S3Config::from_env().bucket(&bucket)?;
                let removed = s3::remove_prefix(bucket, &prefix).await?;
                info!(uri, removed, "removed shard storage");
                Ok(())
            }
            #[cfg(not(feature = "s3-storage"))]
            StorageLocation::S3 { .. } => Err(s3_disabled(uri)),
        }
    }
}
