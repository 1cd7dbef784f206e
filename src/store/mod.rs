//! Local package store
//!
//! Domain semantics layered over a storage backend: manifest normalization,
//! revision management, publish/unpublish/deprecate/dist-tag mutations and
//! the merge of remotely fetched metadata into the local cache.

use std::collections::HashMap;
use std::sync::Arc;

use url::Url;

use crate::manifest::{next_revision, tarball_filename, Attachment, DistFile, Manifest, Version};
use crate::storage::StorageBackend;
use crate::{Error, Result};

/// Owns manifest read/create/update semantics for locally persisted packages.
#[derive(Clone)]
pub struct LocalStore {
    backend: Arc<dyn StorageBackend>,
    debug: bool,
}

impl LocalStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            backend,
            debug: false,
        }
    }

    /// Debug mode keeps `_rev` untouched on writes so fixtures stay stable.
    pub fn with_debug(backend: Arc<dyn StorageBackend>, debug: bool) -> Self {
        Self { backend, debug }
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Read and normalize a manifest.
    pub async fn get_manifest(&self, name: &str) -> Result<Manifest> {
        let mut manifest = self.backend.read_manifest(name).await?;
        manifest.normalize();
        Ok(manifest)
    }

    /// Like `get_manifest`, but a missing package yields an in-memory
    /// template instead of an error. Nothing is written.
    pub async fn read_or_create(&self, name: &str) -> Result<Manifest> {
        match self.get_manifest(name).await {
            Ok(manifest) => Ok(manifest),
            Err(Error::NotFound(_)) => Ok(Manifest::template(name)),
            Err(e) => Err(e),
        }
    }

    /// Serialized update. The callback returns whether it changed anything;
    /// unchanged manifests are not rewritten and keep their revision.
    async fn update<F>(&self, name: &str, mutate: &F) -> Result<Manifest>
    where
        F: Fn(&mut Manifest) -> Result<bool> + Send + Sync,
    {
        let debug = self.debug;
        let transform = move |mut manifest: Manifest| -> Result<Option<Manifest>> {
            manifest.normalize();
            let prior_rev = manifest.rev.clone();
            if !mutate(&mut manifest)? {
                return Ok(None);
            }
            if !debug {
                manifest.rev = next_revision(&prior_rev);
            }
            Ok(Some(manifest))
        };
        self.backend.update_manifest(name, &transform).await
    }

    /// Serialized update that materializes the package on first write. Two
    /// racing creators serialize through the backend's exclusive create: the
    /// loser retries on the now-existing manifest.
    async fn update_or_create<F>(&self, name: &str, mutate: &F) -> Result<Manifest>
    where
        F: Fn(&mut Manifest) -> Result<bool> + Send + Sync,
    {
        match self.update(name, mutate).await {
            Err(Error::NotFound(_)) => {}
            other => return other,
        }

        let mut manifest = Manifest::template(name);
        let prior_rev = manifest.rev.clone();
        if !mutate(&mut manifest)? {
            return Ok(manifest);
        }
        if !self.debug {
            manifest.rev = next_revision(&prior_rev);
        }
        match self.backend.create_manifest(name, &manifest).await {
            Ok(()) => {
                self.backend.add_package(name).await?;
                Ok(manifest)
            }
            Err(Error::Conflict(_)) => self.update(name, mutate).await,
            Err(e) => Err(e),
        }
    }

    /// Publish one version. Fails with a conflict when the version already
    /// exists and guards the tarball shasum against the recorded attachment.
    pub async fn add_version(
        &self,
        name: &str,
        version: &str,
        record: Version,
        tag: &str,
    ) -> Result<Manifest> {
        let name_owned = name.to_string();
        let version_owned = version.to_string();
        let tag_owned = tag.to_string();

        self.update_or_create(name, &move |manifest: &mut Manifest| {
            if manifest.versions.contains_key(&version_owned) {
                return Err(Error::conflict(format!(
                    "{}@{} already exists (cannot republish over an existing version)",
                    name_owned, version_owned
                )));
            }

            let mut record = record.clone();
            record.stamp(&name_owned, &version_owned);
            // One README per package: it lives on the manifest, not on every
            // version record.
            manifest.readme = record.readme.take().unwrap_or_default();

            if let Some(filename) = tarball_filename(&record.dist.tarball) {
                if let Some(attachment) = manifest.attachments.get_mut(&filename) {
                    if let (Some(existing), Some(incoming)) =
                        (attachment.shasum.as_deref(), record.dist.shasum.as_deref())
                    {
                        if existing != incoming {
                            return Err(Error::bad_request(format!(
                                "shasum mismatch for {}: expected {}, got {}",
                                filename, existing, incoming
                            )));
                        }
                    }
                    attachment.version = Some(version_owned.clone());
                }
            }

            let now = manifest.touch();
            manifest.time.insert(version_owned.clone(), now);
            manifest.versions.insert(version_owned.clone(), record);
            manifest.tag_version(&tag_owned, &version_owned);
            Ok(true)
        })
        .await
    }

    /// Unpublish-of-versions and deprecation: versions absent from `incoming`
    /// are removed, changed `deprecated` flags are applied, `users` and
    /// `dist-tags` are replaced wholesale.
    pub async fn change_package(&self, name: &str, incoming: Manifest) -> Result<Manifest> {
        let name_owned = name.to_string();

        self.update(name, &move |manifest: &mut Manifest| {
            let mut changed = false;

            let local_versions: Vec<String> = manifest.versions.keys().cloned().collect();
            for version in local_versions {
                if incoming.versions.contains_key(&version) {
                    continue;
                }
                tracing::info!(package = %name_owned, version = %version, "unpublishing version");
                manifest.versions.remove(&version);
                manifest.time.remove(&version);
                for attachment in manifest.attachments.values_mut() {
                    if attachment.version.as_deref() == Some(version.as_str()) {
                        attachment.version = None;
                    }
                }
                changed = true;
            }

            for (version, local) in manifest.versions.iter_mut() {
                let Some(remote) = incoming.versions.get(version) else {
                    continue;
                };
                let incoming_flag = match remote.deprecated.as_deref() {
                    None | Some("") => None,
                    Some(message) => Some(message.to_string()),
                };
                if incoming_flag != local.deprecated {
                    local.deprecated = incoming_flag;
                    changed = true;
                }
            }

            if manifest.users != incoming.users {
                manifest.users = incoming.users.clone();
                changed = true;
            }

            let mut tags = incoming.dist_tags.clone();
            tags.retain(|_, target| manifest.versions.contains_key(target));
            if manifest.dist_tags != tags {
                manifest.dist_tags = tags;
                changed = true;
            }

            if changed {
                manifest.touch();
            }
            Ok(changed)
        })
        .await
    }

    /// Apply dist-tag changes. A `None` target deletes the tag; a `Some`
    /// target must name an existing version.
    pub async fn merge_tags(
        &self,
        name: &str,
        tags: HashMap<String, Option<String>>,
    ) -> Result<Manifest> {
        self.update(name, &move |manifest: &mut Manifest| {
            let mut changed = false;
            for (tag, target) in &tags {
                match target {
                    None => {
                        changed |= manifest.dist_tags.remove(tag).is_some();
                    }
                    Some(version) => {
                        if !manifest.versions.contains_key(version) {
                            return Err(Error::not_found(format!(
                                "this version doesn't exist: {}",
                                version
                            )));
                        }
                        if manifest.dist_tags.get(tag) != Some(version) {
                            manifest.dist_tags.insert(tag.clone(), version.clone());
                            changed = true;
                        }
                    }
                }
            }
            if changed {
                manifest.touch();
            }
            Ok(changed)
        })
        .await
    }

    /// Remove an attachment record, then its blob. Blob deletion failures are
    /// logged only: the manifest is already consistent at that point.
    pub async fn remove_tarball(&self, name: &str, filename: &str, _rev: &str) -> Result<Manifest> {
        let filename_owned = filename.to_string();
        let manifest = self
            .update(name, &move |manifest: &mut Manifest| {
                if manifest.attachments.remove(&filename_owned).is_none() {
                    return Err(Error::not_found(format!(
                        "no such file available: {}",
                        filename_owned
                    )));
                }
                manifest.touch();
                Ok(true)
            })
            .await?;

        if let Err(e) = self.backend.delete_tarball(name, filename).await {
            if !e.is_not_found() {
                tracing::warn!(package = %name, filename = %filename, error = %e,
                    "failed to delete tarball blob");
            }
        }
        Ok(manifest)
    }

    /// Destroy a package: every attachment blob, then the manifest and the
    /// package directory, then the index entry.
    pub async fn remove_package(&self, name: &str) -> Result<()> {
        let manifest = self.get_manifest(name).await?;

        for filename in manifest.attachments.keys() {
            match self.backend.delete_tarball(name, filename).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    return Err(Error::bad_data(format!(
                        "failed to remove tarball {} for {}: {}",
                        filename, name, e
                    )));
                }
            }
        }

        self.backend
            .remove_package(name)
            .await
            .map_err(|e| Error::bad_data(format!("failed to remove package {}: {}", name, e)))?;
        tracing::info!(package = %name, "package removed");
        Ok(())
    }

    /// Record an uploaded tarball's shasum. The recorded shasum is monotonic:
    /// once set, a conflicting value for the same filename is rejected.
    pub async fn add_attachment(
        &self,
        name: &str,
        filename: &str,
        shasum: &str,
    ) -> Result<Manifest> {
        let filename_owned = filename.to_string();
        let shasum_owned = shasum.to_string();

        self.update_or_create(name, &move |manifest: &mut Manifest| {
            match manifest.attachments.get_mut(&filename_owned) {
                Some(attachment) => match attachment.shasum.as_deref() {
                    Some(existing) if existing == shasum_owned => return Ok(false),
                    Some(existing) => {
                        return Err(Error::bad_request(format!(
                            "shasum mismatch for {}: expected {}, got {}",
                            filename_owned, existing, shasum_owned
                        )));
                    }
                    None => attachment.shasum = Some(shasum_owned.clone()),
                },
                None => {
                    manifest.attachments.insert(
                        filename_owned.clone(),
                        Attachment {
                            shasum: Some(shasum_owned.clone()),
                            version: None,
                        },
                    );
                }
            }
            manifest.touch();
            Ok(true)
        })
        .await
    }

    /// Merge a manifest fetched from an uplink into the local cache.
    ///
    /// Versions are insert-only (a version merged from an earlier uplink is
    /// never overwritten), `_distfiles` entries are recorded once per
    /// filename, dist-tags and uplink cache state are adopted on change and
    /// `time` is replaced when it differs. Nothing is written when nothing
    /// changed.
    pub async fn merge_remote_into_cache(
        &self,
        name: &str,
        remote: Manifest,
        uplink_url: Option<&Url>,
    ) -> Result<Manifest> {
        let uplink_url = uplink_url.cloned();

        self.update_or_create(name, &move |manifest: &mut Manifest| {
            let mut changed = false;

            if !remote.readme.is_empty() && remote.readme != manifest.readme {
                manifest.readme = remote.readme.clone();
                changed = true;
            }

            for (key, remote_version) in &remote.versions {
                if manifest.versions.contains_key(key) {
                    continue;
                }
                let mut version = remote_version.clone();
                version.readme = None;
                version.stamp(&remote.name, key);

                if let Some(filename) = tarball_filename(&version.dist.tarball) {
                    if !version.dist.tarball.is_empty()
                        && !manifest.distfiles.contains_key(&filename)
                    {
                        let mut dist_url = version.dist.tarball.clone();
                        if version.origin.is_some() {
                            if let Some(base) = uplink_url.as_ref() {
                                dist_url = align_protocol(&dist_url, base);
                            }
                        }
                        manifest.distfiles.insert(
                            filename,
                            DistFile {
                                url: dist_url,
                                sha: version.dist.shasum.clone().unwrap_or_default(),
                                registry: version.origin.clone(),
                            },
                        );
                    }
                }

                manifest.versions.insert(key.clone(), version);
                changed = true;
            }

            for (tag, target) in &remote.dist_tags {
                if manifest.dist_tags.get(tag) == Some(target) {
                    continue;
                }
                if manifest.versions.contains_key(target) {
                    manifest.dist_tags.insert(tag.clone(), target.clone());
                    changed = true;
                }
            }

            for (uplink, state) in &remote.uplinks {
                if manifest.uplinks.get(uplink) != Some(state) {
                    manifest.uplinks.insert(uplink.clone(), state.clone());
                    changed = true;
                }
            }

            if !remote.time.is_empty() && remote.time != manifest.time {
                manifest.time = remote.time.clone();
                changed = true;
            }

            Ok(changed)
        })
        .await
    }
}

/// Rewrite a tarball URL's scheme to the uplink's configured scheme when the
/// hosts match, so clients see the protocol the operator chose.
fn align_protocol(dist_url: &str, uplink_url: &Url) -> String {
    let Ok(mut parsed) = Url::parse(dist_url) else {
        return dist_url.to_string();
    };
    if parsed.host_str() == uplink_url.host_str() && parsed.scheme() != uplink_url.scheme() {
        if parsed.set_scheme(uplink_url.scheme()).is_err() {
            return dist_url.to_string();
        }
    }
    parsed.to_string()
}
