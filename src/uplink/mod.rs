//! Uplink client
//!
//! One instance per configured upstream registry. Manifest fetches are
//! conditional (ETag / If-None-Match) and guarded by a per-uplink circuit
//! breaker; tarball downloads are streamed and verified against
//! Content-Length. One uplink failing never prevents the engine from serving
//! cached data or consulting other uplinks.

use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use reqwest::header::{ACCEPT, ETAG, IF_NONE_MATCH};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::manifest::{iso_now, Manifest};
use crate::types::SearchPackageBody;
use crate::{Error, Result};

/// Per-uplink configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UplinkConfig {
    pub url: String,
    /// Tee fetched tarballs into local storage.
    pub cache: bool,
    /// Request timeout in seconds.
    pub timeout: u64,
    /// Consecutive failures before the circuit opens.
    pub max_fails: u32,
    /// Seconds the circuit stays open before another attempt is allowed.
    pub fail_timeout: u64,
}

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            cache: true,
            timeout: 30,
            max_fails: 2,
            fail_timeout: 300,
        }
    }
}

/// A manifest successfully fetched from an uplink.
#[derive(Debug)]
pub struct RemoteFetch {
    pub manifest: Manifest,
    pub etag: Option<String>,
    pub fetched: String,
}

#[derive(Debug, Default)]
struct FailureState {
    count: u32,
    last_failure: Option<Instant>,
}

/// Client for one upstream registry.
pub struct UplinkClient {
    name: String,
    config: UplinkConfig,
    base: Url,
    client: reqwest::Client,
    failures: Mutex<FailureState>,
}

impl UplinkClient {
    pub fn new(name: impl Into<String>, config: UplinkConfig) -> Result<Self> {
        let base = Url::parse(&config.url)
            .map_err(|e| Error::bad_data(format!("invalid uplink url {}: {}", config.url, e)))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .build()
            .map_err(|e| Error::internal(format!("failed to build http client: {}", e)))?;
        Ok(Self {
            name: name.into(),
            config,
            base,
            client,
            failures: Mutex::new(FailureState::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &Url {
        &self.base
    }

    pub fn cache_enabled(&self) -> bool {
        self.config.cache
    }

    /// Fail fast while the circuit is open; allow a fresh attempt once the
    /// cool-down elapsed.
    fn guard(&self) -> Result<()> {
        let mut state = self.failures.lock().unwrap();
        if state.count >= self.config.max_fails {
            let open_for = state
                .last_failure
                .map(|at| at.elapsed())
                .unwrap_or(Duration::MAX);
            if open_for < Duration::from_secs(self.config.fail_timeout) {
                return Err(Error::unavailable(format!(
                    "uplink {} is temporarily offline",
                    self.name
                )));
            }
            state.count = 0;
            state.last_failure = None;
        }
        Ok(())
    }

    fn record_success(&self) {
        let mut state = self.failures.lock().unwrap();
        state.count = 0;
        state.last_failure = None;
    }

    fn record_failure(&self) {
        let mut state = self.failures.lock().unwrap();
        state.count += 1;
        state.last_failure = Some(Instant::now());
    }

    fn manifest_url(&self, name: &str) -> String {
        format!(
            "{}/{}",
            self.config.url.trim_end_matches('/'),
            name.replace('/', "%2f")
        )
    }

    /// Conditional manifest fetch. `Ok(None)` means not-modified: the cached
    /// copy is still valid. Every returned version is annotated with this
    /// uplink's name for downstream URL rewriting.
    pub async fn fetch_manifest(
        &self,
        name: &str,
        etag: Option<&str>,
    ) -> Result<Option<RemoteFetch>> {
        self.guard()?;

        let mut request = self
            .client
            .get(self.manifest_url(name))
            .header(ACCEPT, "application/json");
        if let Some(etag) = etag {
            request = request.header(IF_NONE_MATCH, etag);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                self.record_failure();
                return Err(Error::unavailable(format!(
                    "uplink {} request failed: {}",
                    self.name, e
                )));
            }
        };

        match response.status() {
            StatusCode::NOT_MODIFIED => {
                self.record_success();
                Ok(None)
            }
            StatusCode::NOT_FOUND => {
                self.record_success();
                Err(Error::not_found(format!(
                    "package {} not found on uplink {}",
                    name, self.name
                )))
            }
            status if status.is_success() => {
                let etag = response
                    .headers()
                    .get(ETAG)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let body = match response.bytes().await {
                    Ok(body) => body,
                    Err(e) => {
                        self.record_failure();
                        return Err(Error::unavailable(format!(
                            "uplink {} body read failed: {}",
                            self.name, e
                        )));
                    }
                };
                let mut manifest = Manifest::from_slice(&body)?;
                for version in manifest.versions.values_mut() {
                    version.origin = Some(self.name.clone());
                }
                self.record_success();
                tracing::debug!(uplink = %self.name, package = %name, "fetched manifest");
                Ok(Some(RemoteFetch {
                    manifest,
                    etag,
                    fetched: iso_now(),
                }))
            }
            status => {
                self.record_failure();
                Err(Error::unavailable(format!(
                    "uplink {} returned {} for {}",
                    self.name, status, name
                )))
            }
        }
    }

    /// Stream a tarball. The byte count is checked against Content-Length
    /// when the upstream sent one; a short or long body surfaces as a
    /// content-mismatch on the stream.
    pub async fn fetch_tarball(
        &self,
        url: &str,
        signal: CancellationToken,
    ) -> Result<TarballDownload> {
        self.guard()?;

        let response = match self.client.get(url).send().await {
            Ok(response) => response,
            Err(e) => {
                self.record_failure();
                return Err(Error::unavailable(format!(
                    "uplink {} tarball request failed: {}",
                    self.name, e
                )));
            }
        };

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(Error::not_found(format!("tarball not found: {}", url)));
        }
        if !status.is_success() {
            self.record_failure();
            return Err(Error::unavailable(format!(
                "uplink {} returned {} for {}",
                self.name, status, url
            )));
        }
        self.record_success();

        Ok(TarballDownload {
            expected: response.content_length(),
            received: 0,
            inner: response.bytes_stream().boxed(),
            signal,
            done: false,
        })
    }

    /// Search the uplink. Failures here are the caller's to swallow; the
    /// search fan-out treats an erroring uplink as contributing nothing.
    pub async fn search(&self, query: &str) -> Result<Vec<SearchPackageBody>> {
        self.guard()?;

        let url = format!("{}/-/v1/search", self.config.url.trim_end_matches('/'));
        let request = self.client.get(url).query(&[("text", query), ("size", "20")]);
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                self.record_failure();
                return Err(Error::unavailable(format!(
                    "uplink {} search failed: {}",
                    self.name, e
                )));
            }
        };
        if !response.status().is_success() {
            return Err(Error::unavailable(format!(
                "uplink {} search returned {}",
                self.name,
                response.status()
            )));
        }
        self.record_success();

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::bad_data(format!("uplink {} search body: {}", self.name, e)))?;
        let hits = body
            .get("objects")
            .and_then(serde_json::Value::as_array)
            .map(|objects| {
                objects
                    .iter()
                    .filter_map(|o| o.get("package"))
                    .filter_map(|p| serde_json::from_value(p.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();
        Ok(hits)
    }
}

/// Streaming tarball download with byte accounting.
pub struct TarballDownload {
    expected: Option<u64>,
    received: u64,
    inner: BoxStream<'static, reqwest::Result<Bytes>>,
    signal: CancellationToken,
    done: bool,
}

impl TarballDownload {
    pub fn content_length(&self) -> Option<u64> {
        self.expected
    }
}

impl Stream for TarballDownload {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        if this.signal.is_cancelled() {
            this.done = true;
            return Poll::Ready(Some(Err(Error::internal("tarball download cancelled"))));
        }
        match futures::ready!(this.inner.poll_next_unpin(cx)) {
            Some(Ok(chunk)) => {
                this.received += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Some(Err(e)) => {
                this.done = true;
                Poll::Ready(Some(Err(Error::unavailable(format!(
                    "tarball download failed: {}",
                    e
                )))))
            }
            None => {
                this.done = true;
                if let Some(expected) = this.expected {
                    if this.received != expected {
                        return Poll::Ready(Some(Err(Error::ContentMismatch {
                            expected,
                            actual: this.received,
                        })));
                    }
                }
                Poll::Ready(None)
            }
        }
    }
}
