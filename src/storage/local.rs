//! Local filesystem storage backend
//!
//! Layout:
//! - `<root>/<package>/package.json` - manifest, written atomically
//! - `<root>/<package>/<filename>` - raw tarball bytes
//! - `<root>/.packrat-db.json` - global index of known package names
//!
//! Scoped packages nest one directory deeper (`<root>/@scope/name/...`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::manifest::{validate_filename, validate_package_name, Manifest};
use crate::storage::{
    ManifestTransform, SearchItem, StorageBackend, TarballRead, TarballSink, Token,
};
use crate::{Error, Result};

const MANIFEST_FILE: &str = "package.json";
const DB_FILE: &str = ".packrat-db.json";

#[derive(Debug, Default, Serialize, Deserialize)]
struct LocalDatabase {
    #[serde(default)]
    list: Vec<String>,
    #[serde(default)]
    secret: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    tokens: HashMap<String, Vec<Token>>,
}

/// Local filesystem storage.
pub struct LocalFsBackend {
    root: PathBuf,
    locks: DashMap<String, Arc<Mutex<()>>>,
    db_lock: Mutex<()>,
}

impl LocalFsBackend {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            locks: DashMap::new(),
            db_lock: Mutex::new(()),
        })
    }

    fn package_dir(&self, name: &str) -> Result<PathBuf> {
        validate_package_name(name)?;
        Ok(self.root.join(name))
    }

    fn manifest_path(&self, name: &str) -> Result<PathBuf> {
        Ok(self.package_dir(name)?.join(MANIFEST_FILE))
    }

    fn tarball_path(&self, name: &str, filename: &str) -> Result<PathBuf> {
        validate_filename(filename)?;
        Ok(self.package_dir(name)?.join(filename))
    }

    fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn db_path(&self) -> PathBuf {
        self.root.join(DB_FILE)
    }

    async fn read_db(&self) -> Result<LocalDatabase> {
        match fs::read(self.db_path()).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| Error::bad_data(format!("corrupted package index: {}", e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(LocalDatabase::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_db(&self, mut db: LocalDatabase) -> Result<()> {
        if db.secret.is_empty() {
            db.secret = format!("{:016x}{:016x}", fastrand::u64(..), fastrand::u64(..));
        }
        let bytes = serde_json::to_vec_pretty(&db)?;
        atomic_write(&self.db_path(), &bytes).await
    }

    async fn write_manifest_bytes(&self, name: &str, manifest: &Manifest) -> Result<PathBuf> {
        let path = self.manifest_path(name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        atomic_write(&path, &manifest.to_vec()?).await?;
        Ok(path)
    }
}

async fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = tmp_sibling(path);
    fs::write(&tmp, bytes).await?;
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{:08x}.tmp", file_name, fastrand::u32(..)))
}

#[async_trait]
impl StorageBackend for LocalFsBackend {
    async fn read_manifest(&self, name: &str) -> Result<Manifest> {
        let path = self.manifest_path(name)?;
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_found(format!("no such package: {}", name)));
            }
            Err(e) => return Err(e.into()),
        };
        Manifest::from_slice(&bytes)
    }

    async fn write_manifest(&self, name: &str, manifest: &Manifest) -> Result<()> {
        self.write_manifest_bytes(name, manifest).await?;
        Ok(())
    }

    async fn create_manifest(&self, name: &str, manifest: &Manifest) -> Result<()> {
        let path = self.manifest_path(name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = tmp_sibling(&path);
        fs::write(&tmp, manifest.to_vec()?).await?;
        // hard_link refuses to clobber, making the create exclusive even
        // across concurrent first publishes.
        let linked = fs::hard_link(&tmp, &path).await;
        let _ = fs::remove_file(&tmp).await;
        match linked {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(Error::conflict(
                format!("package {} already exists", name),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_manifest(
        &self,
        name: &str,
        transform: ManifestTransform<'_>,
    ) -> Result<Manifest> {
        let lock = self.lock_for(name);
        let _guard = lock.lock().await;

        let current = self.read_manifest(name).await?;
        match transform(current.clone())? {
            None => Ok(current),
            Some(next) => {
                self.write_manifest(name, &next).await?;
                Ok(next)
            }
        }
    }

    async fn add_package(&self, name: &str) -> Result<()> {
        validate_package_name(name)?;
        let _guard = self.db_lock.lock().await;
        let mut db = self.read_db().await?;
        if !db.list.iter().any(|n| n == name) {
            db.list.push(name.to_string());
            db.list.sort();
            self.write_db(db).await?;
        }
        Ok(())
    }

    async fn remove_package(&self, name: &str) -> Result<()> {
        let dir = self.package_dir(name)?;
        {
            let _guard = self.db_lock.lock().await;
            let mut db = self.read_db().await?;
            db.list.retain(|n| n != name);
            self.write_db(db).await?;
        }
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_packages(&self) -> Result<Vec<String>> {
        Ok(self.read_db().await?.list)
    }

    async fn open_tarball_read(&self, name: &str, filename: &str) -> Result<TarballRead> {
        let path = self.tarball_path(name, filename)?;
        match fs::File::open(&path).await {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::not_found(
                format!("no such file available: {}", filename),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn open_tarball_write(
        &self,
        name: &str,
        filename: &str,
        signal: CancellationToken,
    ) -> Result<Box<dyn TarballSink>> {
        let dest_path = self.tarball_path(name, filename)?;
        if let Some(parent) = dest_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp_path = tmp_sibling(&dest_path);
        let file = fs::File::create(&tmp_path).await?;
        Ok(Box::new(FsTarballSink {
            file: Some(file),
            tmp_path,
            dest_path,
            signal,
            finished: false,
        }))
    }

    async fn delete_tarball(&self, name: &str, filename: &str) -> Result<()> {
        let path = self.tarball_path(name, filename)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::not_found(
                format!("no such file available: {}", filename),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn search(&self, query: &str) -> Result<Vec<SearchItem>> {
        let list = self.list_packages().await?;
        Ok(list
            .into_iter()
            .filter(|name| query.is_empty() || name.contains(query))
            .map(|name| SearchItem { name, score: None })
            .collect())
    }

    async fn save_token(&self, token: Token) -> Result<()> {
        let _guard = self.db_lock.lock().await;
        let mut db = self.read_db().await?;
        let tokens = db.tokens.entry(token.user.clone()).or_default();
        tokens.retain(|t| t.key != token.key);
        tokens.push(token);
        self.write_db(db).await
    }

    async fn delete_token(&self, user: &str, key: &str) -> Result<()> {
        let _guard = self.db_lock.lock().await;
        let mut db = self.read_db().await?;
        match db.tokens.get_mut(user) {
            Some(tokens) => {
                let before = tokens.len();
                tokens.retain(|t| t.key != key);
                if tokens.len() == before {
                    return Err(Error::not_found(format!("no such token: {}", key)));
                }
            }
            None => return Err(Error::not_found(format!("no tokens for user: {}", user))),
        }
        self.write_db(db).await
    }

    async fn read_tokens(&self, user: &str) -> Result<Vec<Token>> {
        let db = self.read_db().await?;
        Ok(db.tokens.get(user).cloned().unwrap_or_default())
    }
}

struct FsTarballSink {
    file: Option<fs::File>,
    tmp_path: PathBuf,
    dest_path: PathBuf,
    signal: CancellationToken,
    finished: bool,
}

#[async_trait]
impl TarballSink for FsTarballSink {
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<()> {
        if self.signal.is_cancelled() {
            return Err(Error::internal("tarball upload cancelled"));
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| Error::internal("tarball sink already closed"))?;
        file.write_all(&chunk).await?;
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| Error::internal("tarball sink already closed"))?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&self.tmp_path, &self.dest_path).await?;
        self.finished = true;
        Ok(())
    }

    async fn abort(mut self: Box<Self>) -> Result<()> {
        self.file.take();
        let _ = fs::remove_file(&self.tmp_path).await;
        self.finished = true;
        Ok(())
    }
}

impl Drop for FsTarballSink {
    fn drop(&mut self) {
        if !self.finished {
            self.file.take();
            let _ = std::fs::remove_file(&self.tmp_path);
        }
    }
}
