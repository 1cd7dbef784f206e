//! Shared request-scope and search projection types

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::manifest::{Manifest, Person};

/// Per-call context threaded through the federated store.
///
/// `protocol` and `host` describe the request origin and drive tarball URL
/// rewriting; `username` is opaque to the engine and only echoed where the
/// wire protocol wants it.
#[derive(Debug, Clone)]
pub struct RequestScope {
    pub protocol: String,
    pub host: String,
    pub username: Option<String>,
    pub uplinks_look: bool,
    pub signal: CancellationToken,
}

impl RequestScope {
    pub fn new(protocol: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            host: host.into(),
            username: None,
            uplinks_look: true,
            signal: CancellationToken::new(),
        }
    }

    pub fn no_uplinks(mut self) -> Self {
        self.uplinks_look = false;
        self
    }
}

impl Default for RequestScope {
    fn default() -> Self {
        Self::new("http", "localhost")
    }
}

/// External links projected into a search result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchLinks {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bugs: Option<String>,
}

/// One package in a search response, projected from the latest version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchPackageBody {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<Person>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub maintainers: Vec<Person>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<SearchLinks>,
}

impl SearchPackageBody {
    /// Project a manifest into a search row. Packages without any published
    /// version yield `None` and are skipped by the search stream.
    pub fn from_manifest(manifest: &Manifest) -> Option<Self> {
        let latest = manifest.latest_version()?;
        let scope = manifest
            .name
            .strip_prefix('@')
            .and_then(|rest| rest.split('/').next())
            .map(str::to_string);

        let links = SearchLinks {
            homepage: if latest.homepage.is_empty() {
                None
            } else {
                Some(latest.homepage.clone())
            },
            repository: latest
                .repository
                .as_ref()
                .and_then(|r| match r {
                    serde_json::Value::String(s) => Some(s.clone()),
                    serde_json::Value::Object(m) => m
                        .get("url")
                        .and_then(serde_json::Value::as_str)
                        .map(str::to_string),
                    _ => None,
                }),
            bugs: latest.bugs.as_ref().and_then(|b| match b {
                serde_json::Value::String(s) => Some(s.clone()),
                serde_json::Value::Object(m) => m
                    .get("url")
                    .and_then(serde_json::Value::as_str)
                    .map(str::to_string),
                _ => None,
            }),
        };

        Some(Self {
            name: manifest.name.clone(),
            scope,
            description: latest.description.clone(),
            version: latest.version.clone(),
            keywords: latest.keywords.clone(),
            date: manifest.time.get("modified").cloned(),
            author: latest.author.clone(),
            maintainers: latest.maintainers.clone(),
            links: Some(links),
        })
    }
}
