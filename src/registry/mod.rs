//! Federated package store
//!
//! Composes the local store with the configured uplink clients:
//! - Read-through manifests: local cache first, then a concurrent fan-out
//!   across the package's uplinks, merged in declaration order
//! - Write-through tarballs: upstream bytes are teed into local storage
//!   while streaming to the client, when the uplink allows caching
//! - Dist-URL rewriting so clients always download through this registry
//! - Search fan-out over the local backend and the uplinks

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt, TryStreamExt};
use sha1::{Digest, Sha1};
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::{AppConfig, PackageRule};
use crate::manifest::{
    tarball_filename, tarball_name_for, validate_filename, DistFile, Manifest, UplinkState,
    Version,
};
use crate::storage::{StorageBackend, TarballSink};
use crate::store::LocalStore;
use crate::types::{RequestScope, SearchPackageBody};
use crate::uplink::{TarballDownload, UplinkClient, UplinkConfig};
use crate::{Error, Result};

/// Byte stream handed to the HTTP layer for tarball responses.
pub type TarballStream = BoxStream<'static, Result<Bytes>>;

/// The federated store: local store + uplink clients, plus the package rules
/// deciding which uplinks serve which packages.
pub struct Registry {
    local: LocalStore,
    backend: Arc<dyn StorageBackend>,
    uplinks: Vec<Arc<UplinkClient>>,
    rules: Vec<PackageRule>,
    url_prefix: String,
}

impl Registry {
    pub fn new(config: &AppConfig, backend: Arc<dyn StorageBackend>) -> Result<Self> {
        let mut uplinks = Vec::with_capacity(config.uplinks.len());
        for def in &config.uplinks {
            uplinks.push(Arc::new(UplinkClient::new(
                def.name.clone(),
                def.config.clone(),
            )?));
        }
        Ok(Self {
            local: LocalStore::with_debug(Arc::clone(&backend), config.debug),
            backend,
            uplinks,
            rules: config.packages.clone(),
            url_prefix: config.url_prefix.clone(),
        })
    }

    pub fn local(&self) -> &LocalStore {
        &self.local
    }

    /// Uplinks eligible for a package: the first matching rule's proxy list,
    /// in uplink declaration order. No rules configured means every uplink;
    /// a matching rule with an empty proxy list means the package is private.
    fn uplinks_for(&self, name: &str) -> Vec<Arc<UplinkClient>> {
        match self.rules.iter().find(|rule| rule.matches(name)) {
            Some(rule) => self
                .uplinks
                .iter()
                .filter(|uplink| rule.proxy.iter().any(|p| p == uplink.name()))
                .cloned()
                .collect(),
            None if self.rules.is_empty() => self.uplinks.clone(),
            None => Vec::new(),
        }
    }

    /// Fan out across the package's uplinks and merge what came back into
    /// the local cache, in uplink declaration order. Uplink errors are
    /// collected, never fatal while a cached manifest or one success exists.
    pub async fn sync_uplinks(
        &self,
        name: &str,
        cached: Option<Manifest>,
        uplinks_look: bool,
    ) -> (Option<Manifest>, Vec<Error>) {
        if !uplinks_look {
            return (cached, Vec::new());
        }
        let uplinks = self.uplinks_for(name);
        if uplinks.is_empty() {
            return (cached, Vec::new());
        }

        let fetches = uplinks.iter().map(|uplink| {
            let etag = cached
                .as_ref()
                .and_then(|m| m.uplinks.get(uplink.name()))
                .and_then(|state| state.etag.clone());
            let uplink = Arc::clone(uplink);
            let name = name.to_string();
            async move {
                let result = uplink.fetch_manifest(&name, etag.as_deref()).await;
                (uplink, result)
            }
        });
        let results = futures::future::join_all(fetches).await;

        let mut merged = cached;
        let mut errors = Vec::new();
        for (uplink, result) in results {
            match result {
                Ok(Some(fetch)) => {
                    let mut remote = fetch.manifest;
                    if remote.name.is_empty() {
                        remote.name = name.to_string();
                    }
                    remote.uplinks.insert(
                        uplink.name().to_string(),
                        UplinkState {
                            etag: fetch.etag,
                            fetched: Some(fetch.fetched),
                        },
                    );
                    match self
                        .local
                        .merge_remote_into_cache(name, remote, Some(uplink.url()))
                        .await
                    {
                        Ok(manifest) => merged = Some(manifest),
                        Err(e) => {
                            tracing::warn!(package = %name, uplink = %uplink.name(),
                                error = %e, "failed to merge uplink manifest");
                            errors.push(e);
                        }
                    }
                }
                Ok(None) => {
                    tracing::debug!(package = %name, uplink = %uplink.name(), "not modified");
                }
                Err(e) => {
                    if !e.is_not_found() {
                        tracing::warn!(package = %name, uplink = %uplink.name(),
                            error = %e, "uplink fetch failed");
                    }
                    errors.push(e);
                }
            }
        }
        (merged, errors)
    }

    /// Read-through manifest: local cache merged with whatever the uplinks
    /// returned. The second element carries non-fatal uplink errors.
    pub async fn get_package(
        &self,
        name: &str,
        uplinks_look: bool,
    ) -> Result<(Manifest, Vec<Error>)> {
        let cached = match self.local.get_manifest(name).await {
            Ok(manifest) => Some(manifest),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        let (merged, errors) = self.sync_uplinks(name, cached, uplinks_look).await;
        match merged {
            Some(manifest) => Ok((manifest, errors)),
            None => Err(Error::not_found(format!(
                "no such package available: {}",
                name
            ))),
        }
    }

    /// The manifest form served to clients: tarball URLs rewritten to this
    /// registry, bookkeeping fields stripped.
    pub async fn get_package_manifest(
        &self,
        name: &str,
        scope: &RequestScope,
    ) -> Result<serde_json::Value> {
        let (mut manifest, _warnings) = self.get_package(name, scope.uplinks_look).await?;
        self.rewrite_dist_urls(&mut manifest, scope);
        Ok(manifest.client_view())
    }

    /// Resolve `selector` first as a literal version, then as a dist-tag.
    pub async fn get_package_by_version(
        &self,
        name: &str,
        selector: &str,
        scope: &RequestScope,
    ) -> Result<Version> {
        let (mut manifest, _warnings) = self.get_package(name, scope.uplinks_look).await?;
        self.rewrite_dist_urls(&mut manifest, scope);

        if let Some(version) = manifest.versions.get(selector) {
            return Ok(version.clone());
        }
        if let Some(target) = manifest.dist_tags.get(selector) {
            if let Some(version) = manifest.versions.get(target) {
                return Ok(version.clone());
            }
        }
        Err(Error::not_found(format!(
            "version not found: {}@{}",
            name, selector
        )))
    }

    fn rewrite_dist_urls(&self, manifest: &mut Manifest, scope: &RequestScope) {
        let name = manifest.name.clone();
        for (key, version) in manifest.versions.iter_mut() {
            let filename = tarball_filename(&version.dist.tarball)
                .unwrap_or_else(|| tarball_name_for(&name, key));
            version.dist.tarball = format!(
                "{}://{}{}/{}/-/{}",
                scope.protocol, scope.host, self.url_prefix, name, filename
            );
        }
    }

    /// Stream a tarball: local bytes when present, otherwise the recorded
    /// upstream location, teeing into the local cache when the uplink is
    /// configured with `cache: true`.
    pub async fn get_tarball(
        &self,
        name: &str,
        filename: &str,
        signal: CancellationToken,
    ) -> Result<TarballStream> {
        match self.backend.open_tarball_read(name, filename).await {
            Ok(reader) => {
                tracing::debug!(package = %name, filename = %filename, "serving local tarball");
                Ok(ReaderStream::new(reader).map_err(Error::from).boxed())
            }
            Err(e) if e.is_not_found() => self.stream_remote_tarball(name, filename, signal).await,
            Err(e) => Err(e),
        }
    }

    async fn stream_remote_tarball(
        &self,
        name: &str,
        filename: &str,
        signal: CancellationToken,
    ) -> Result<TarballStream> {
        let mut distfile = match self.local.get_manifest(name).await {
            Ok(manifest) => manifest.distfiles.get(filename).cloned(),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };

        // Nothing recorded yet: force an uplink sync to learn where the
        // tarball lives.
        if distfile.is_none() {
            let cached = self.local.get_manifest(name).await.ok();
            let (merged, _errors) = self.sync_uplinks(name, cached, true).await;
            distfile = merged.and_then(|m| m.distfiles.get(filename).cloned());
        }

        let Some(distfile) = distfile else {
            return Err(Error::not_found(format!(
                "no such file available: {}",
                filename
            )));
        };

        let (uplink, cache) = self.uplink_for_distfile(&distfile)?;
        tracing::info!(package = %name, filename = %filename, uplink = %uplink.name(),
            cache, "streaming tarball from uplink");
        let download = uplink.fetch_tarball(&distfile.url, signal.clone()).await?;

        if !cache {
            return Ok(download.boxed());
        }
        let sink = self
            .backend
            .open_tarball_write(name, filename, signal.clone())
            .await?;
        Ok(tee_to_cache(
            download,
            sink,
            signal,
            name.to_string(),
            filename.to_string(),
        ))
    }

    /// Pick the uplink responsible for a recorded distfile: by recorded
    /// registry name, then by URL host, falling back to a one-off client
    /// that never caches.
    fn uplink_for_distfile(&self, distfile: &DistFile) -> Result<(Arc<UplinkClient>, bool)> {
        if let Some(registry) = &distfile.registry {
            if let Some(uplink) = self.uplinks.iter().find(|u| u.name() == registry) {
                return Ok((Arc::clone(uplink), uplink.cache_enabled()));
            }
        }
        let url = Url::parse(&distfile.url)
            .map_err(|e| Error::bad_data(format!("invalid distfile url {}: {}", distfile.url, e)))?;
        if let Some(uplink) = self
            .uplinks
            .iter()
            .find(|u| u.url().host_str() == url.host_str())
        {
            return Ok((Arc::clone(uplink), uplink.cache_enabled()));
        }
        let transient = UplinkClient::new(
            "transient",
            UplinkConfig {
                url: url.origin().ascii_serialization(),
                cache: false,
                ..UplinkConfig::default()
            },
        )?;
        Ok((Arc::new(transient), false))
    }

    /// Open a tarball upload for a publish. The returned sink hashes the
    /// bytes as they arrive; `finish` records the attachment shasum before
    /// the bytes atomically replace anything previously stored.
    pub async fn add_tarball(
        &self,
        name: &str,
        filename: &str,
        signal: CancellationToken,
    ) -> Result<PublishSink> {
        validate_filename(filename)?;
        let sink = self.backend.open_tarball_write(name, filename, signal).await?;
        Ok(PublishSink {
            sink: Some(sink),
            hasher: Sha1::new(),
            local: self.local.clone(),
            name: name.to_string(),
            filename: filename.to_string(),
        })
    }

    pub async fn add_version(
        &self,
        name: &str,
        version: &str,
        record: Version,
        tag: &str,
    ) -> Result<Manifest> {
        self.local.add_version(name, version, record, tag).await
    }

    pub async fn change_package(&self, name: &str, incoming: Manifest) -> Result<Manifest> {
        self.local.change_package(name, incoming).await
    }

    pub async fn merge_tags(
        &self,
        name: &str,
        tags: HashMap<String, Option<String>>,
    ) -> Result<Manifest> {
        self.local.merge_tags(name, tags).await
    }

    pub async fn remove_tarball(&self, name: &str, filename: &str, rev: &str) -> Result<Manifest> {
        self.local.remove_tarball(name, filename, rev).await
    }

    pub async fn remove_package(&self, name: &str) -> Result<()> {
        self.local.remove_package(name).await
    }

    /// Search stream: the local backend's hits enriched from their manifests,
    /// then uplink results deduplicated against local names. The channel is
    /// bounded, so production never outruns the consumer.
    pub fn search(self: Arc<Self>, query: String) -> impl Stream<Item = Result<SearchPackageBody>> + Send {
        let registry = self;
        let (tx, mut rx) = mpsc::channel::<Result<SearchPackageBody>>(16);

        tokio::spawn(async move {
            let mut seen = std::collections::HashSet::new();

            match registry.backend.search(&query).await {
                Ok(items) => {
                    for item in items {
                        let manifest = match registry.local.get_manifest(&item.name).await {
                            Ok(manifest) => manifest,
                            Err(e) => {
                                tracing::debug!(package = %item.name, error = %e,
                                    "skipping unreadable search hit");
                                continue;
                            }
                        };
                        let Some(body) = SearchPackageBody::from_manifest(&manifest) else {
                            continue;
                        };
                        seen.insert(body.name.clone());
                        if tx.send(Ok(body)).await.is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }

            for uplink in &registry.uplinks {
                match uplink.search(&query).await {
                    Ok(bodies) => {
                        for body in bodies {
                            if seen.insert(body.name.clone())
                                && tx.send(Ok(body)).await.is_err()
                            {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::debug!(uplink = %uplink.name(), error = %e,
                            "uplink search failed");
                    }
                }
            }
        });

        futures::stream::poll_fn(move |cx| rx.poll_recv(cx))
    }
}

/// Tarball upload wrapper that hashes bytes on the way through.
pub struct PublishSink {
    sink: Option<Box<dyn TarballSink>>,
    hasher: Sha1,
    local: LocalStore,
    name: String,
    filename: String,
}

impl PublishSink {
    pub async fn write_chunk(&mut self, chunk: Bytes) -> Result<()> {
        self.hasher.update(&chunk);
        self.sink
            .as_mut()
            .ok_or_else(|| Error::internal("tarball sink already closed"))?
            .write_chunk(chunk)
            .await
    }

    /// Record the attachment shasum, then atomically publish the bytes.
    /// A shasum conflicting with the recorded attachment aborts the upload
    /// before any stored bytes are replaced.
    pub async fn finish(mut self) -> Result<String> {
        let sink = self
            .sink
            .take()
            .ok_or_else(|| Error::internal("tarball sink already closed"))?;
        let shasum = format!("{:x}", self.hasher.finalize());
        if let Err(e) = self
            .local
            .add_attachment(&self.name, &self.filename, &shasum)
            .await
        {
            let _ = sink.abort().await;
            return Err(e);
        }
        sink.commit().await?;
        Ok(shasum)
    }

    pub async fn abort(mut self) -> Result<()> {
        match self.sink.take() {
            Some(sink) => sink.abort().await,
            None => Ok(()),
        }
    }
}

fn tee_to_cache(
    mut download: TarballDownload,
    sink: Box<dyn TarballSink>,
    signal: CancellationToken,
    package: String,
    filename: String,
) -> TarballStream {
    let (tx, mut rx) = mpsc::channel::<Result<Bytes>>(8);

    tokio::spawn(async move {
        let mut sink = Some(sink);
        loop {
            tokio::select! {
                _ = signal.cancelled() => {
                    if let Some(sink) = sink.take() {
                        let _ = sink.abort().await;
                    }
                    tracing::debug!(package = %package, filename = %filename,
                        "tarball download cancelled");
                    return;
                }
                chunk = download.next() => match chunk {
                    Some(Ok(bytes)) => {
                        if let Some(active) = sink.as_mut() {
                            if let Err(e) = active.write_chunk(bytes.clone()).await {
                                tracing::warn!(package = %package, filename = %filename,
                                    error = %e, "tarball cache write failed");
                                if let Some(sink) = sink.take() {
                                    let _ = sink.abort().await;
                                }
                            }
                        }
                        if tx.send(Ok(bytes)).await.is_err() {
                            if let Some(sink) = sink.take() {
                                let _ = sink.abort().await;
                            }
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        if let Some(sink) = sink.take() {
                            let _ = sink.abort().await;
                        }
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                    None => {
                        if let Some(sink) = sink.take() {
                            match sink.commit().await {
                                Ok(()) => tracing::debug!(package = %package,
                                    filename = %filename, "tarball cached"),
                                Err(e) => tracing::warn!(package = %package,
                                    filename = %filename, error = %e,
                                    "tarball cache commit failed"),
                            }
                        }
                        return;
                    }
                }
            }
        }
    });

    futures::stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed()
}
