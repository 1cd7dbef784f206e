//! Storage abstraction layer
//!
//! Per-package manifest and tarball persistence behind a pluggable backend.
//! The default implementation stores everything on the local filesystem.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use crate::manifest::Manifest;
use crate::{Error, Result};

pub mod local;

/// Serialized read-modify-write callback. Returning `Ok(None)` means the
/// manifest is unchanged and no write happens.
pub type ManifestTransform<'a> =
    &'a (dyn Fn(Manifest) -> Result<Option<Manifest>> + Send + Sync);

/// Readable tarball byte source.
pub type TarballRead = Box<dyn AsyncRead + Send + Unpin>;

/// Atomic tarball upload. Bytes land in a temporary location until `commit`;
/// readers see either the previous tarball or the complete new one, never a
/// prefix. Dropping an uncommitted sink releases the temporary file.
#[async_trait]
pub trait TarballSink: Send {
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<()>;
    async fn commit(self: Box<Self>) -> Result<()>;
    async fn abort(self: Box<Self>) -> Result<()>;
}

/// One hit reported by a backend search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchItem {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

/// An authentication token persisted on behalf of the access layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub user: String,
    pub key: String,
    #[serde(default)]
    pub readonly: bool,
    #[serde(default)]
    pub created: String,
}

/// Storage backend contract. Every operation namespaces its state by package
/// name; mutating manifest operations on the same name are linearizable.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Read a package manifest.
    async fn read_manifest(&self, name: &str) -> Result<Manifest>;

    /// Atomically replace a package manifest.
    async fn write_manifest(&self, name: &str, manifest: &Manifest) -> Result<()>;

    /// Atomically create a package manifest, failing with a conflict when the
    /// package already exists.
    async fn create_manifest(&self, name: &str, manifest: &Manifest) -> Result<()>;

    /// Serialized read-modify-write of a package manifest. Concurrent calls
    /// against the same name never interleave.
    async fn update_manifest(
        &self,
        name: &str,
        transform: ManifestTransform<'_>,
    ) -> Result<Manifest>;

    /// Register the package in the global index.
    async fn add_package(&self, name: &str) -> Result<()>;

    /// Remove the index entry and the package directory.
    async fn remove_package(&self, name: &str) -> Result<()>;

    /// All package names known to the index.
    async fn list_packages(&self) -> Result<Vec<String>>;

    async fn open_tarball_read(&self, name: &str, filename: &str) -> Result<TarballRead>;

    async fn open_tarball_write(
        &self,
        name: &str,
        filename: &str,
        signal: CancellationToken,
    ) -> Result<Box<dyn TarballSink>>;

    async fn delete_tarball(&self, name: &str, filename: &str) -> Result<()>;

    async fn search(&self, _query: &str) -> Result<Vec<SearchItem>> {
        Err(Error::unavailable(
            "search is not supported by this storage backend",
        ))
    }

    async fn save_token(&self, _token: Token) -> Result<()> {
        Err(Error::unavailable(
            "token storage is not supported by this storage backend",
        ))
    }

    async fn delete_token(&self, _user: &str, _key: &str) -> Result<()> {
        Err(Error::unavailable(
            "token storage is not supported by this storage backend",
        ))
    }

    async fn read_tokens(&self, _user: &str) -> Result<Vec<Token>> {
        Err(Error::unavailable(
            "token storage is not supported by this storage backend",
        ))
    }
}

/// Storage configuration.
#[derive(Debug, Clone)]
pub enum StorageConfig {
    Local { path: PathBuf },
    Plugin { reference: String },
}

/// Create a storage backend from config.
pub fn create_storage(config: StorageConfig) -> Result<Arc<dyn StorageBackend>> {
    match config {
        StorageConfig::Local { path } => Ok(Arc::new(local::LocalFsBackend::new(path)?)),
        StorageConfig::Plugin { reference } => Err(Error::unavailable(format!(
            "storage plugin '{}' is not available",
            reference
        ))),
    }
}
