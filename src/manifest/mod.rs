//! Package manifest model
//!
//! A manifest is the JSON document describing one package:
//! - Version records (frozen snapshots of published releases)
//! - Dist-tags mapping tag names to versions
//! - Publication timestamps
//! - Registry bookkeeping: attachments, cached upstream dist files,
//!   per-uplink cache-validation state and the revision token

use std::collections::HashMap;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::{Error, Result};

pub const TAG_LATEST: &str = "latest";
pub const INITIAL_REVISION: &str = "0-0000000000000000";

const TIME_CREATED: &str = "created";
const TIME_MODIFIED: &str = "modified";

/// A person reference, normalized from the string / object / array shapes
/// npm clients send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

fn person_from_value(value: &Value) -> Option<Person> {
    match value {
        Value::String(s) if !s.is_empty() => Some(Person {
            name: s.clone(),
            email: None,
        }),
        Value::Object(map) => {
            let name = map.get("name").and_then(Value::as_str)?.to_string();
            let email = map
                .get("email")
                .and_then(Value::as_str)
                .map(str::to_string);
            Some(Person { name, email })
        }
        _ => None,
    }
}

/// Collapse any of the accepted person shapes into a list.
pub fn normalize_people(value: &Value) -> Vec<Person> {
    match value {
        Value::Array(items) => items.iter().filter_map(person_from_value).collect(),
        other => person_from_value(other).into_iter().collect(),
    }
}

fn de_people<'de, D>(deserializer: D) -> std::result::Result<Vec<Person>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(normalize_people(&value))
}

fn de_person_opt<'de, D>(deserializer: D) -> std::result::Result<Option<Person>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(person_from_value(&value))
}

fn de_string_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::String(s) => s.split_whitespace().map(str::to_string).collect(),
        Value::Array(items) => items
            .into_iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    })
}

/// Tarball location and integrity data inside a version record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dist {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tarball: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shasum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// A version record: the frozen snapshot of one published release.
///
/// Unknown npm fields (scripts, engines, devDependencies, ...) ride along in
/// `extra` so clients get back exactly what was published. `origin` names the
/// uplink a remotely-fetched version came from; it is never serialized.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Version {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, deserialize_with = "de_string_list", skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    #[serde(default, deserialize_with = "de_person_opt", skip_serializing_if = "Option::is_none")]
    pub author: Option<Person>,
    #[serde(default, deserialize_with = "de_people", skip_serializing_if = "Vec::is_empty")]
    pub maintainers: Vec<Person>,
    #[serde(default, deserialize_with = "de_people", skip_serializing_if = "Vec::is_empty")]
    pub contributors: Vec<Person>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub dependencies: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub homepage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bugs: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deprecated: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readme: Option<String>,
    #[serde(default)]
    pub dist: Dist,
    #[serde(skip)]
    pub origin: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl Version {
    /// Fill in the identity fields a sloppy client may have omitted.
    pub fn stamp(&mut self, name: &str, version: &str) {
        if self.name.is_empty() {
            self.name = name.to_string();
        }
        if self.version.is_empty() {
            self.version = version.to_string();
        }
    }
}

/// Recorded tarball upload: shasum of the stored bytes and the version the
/// attachment belongs to, once known.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shasum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Cached pointer to where a tarball can be fetched upstream when the bytes
/// are not locally present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DistFile {
    pub url: String,
    #[serde(default)]
    pub sha: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<String>,
}

/// Per-uplink cache-validation state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UplinkState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetched: Option<String>,
}

/// The package manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub versions: HashMap<String, Version>,
    #[serde(rename = "dist-tags", default)]
    pub dist_tags: HashMap<String, String>,
    #[serde(default)]
    pub time: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub users: HashMap<String, bool>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub readme: String,
    #[serde(rename = "_attachments", default, skip_serializing_if = "HashMap::is_empty")]
    pub attachments: HashMap<String, Attachment>,
    #[serde(rename = "_distfiles", default, skip_serializing_if = "HashMap::is_empty")]
    pub distfiles: HashMap<String, DistFile>,
    #[serde(rename = "_uplinks", default, skip_serializing_if = "HashMap::is_empty")]
    pub uplinks: HashMap<String, UplinkState>,
    #[serde(rename = "_rev", default)]
    pub rev: String,
}

impl Manifest {
    /// Empty manifest template for a package that does not exist yet. Not
    /// persisted until something actually gets written into it.
    pub fn template(name: &str) -> Self {
        Self {
            name: name.to_string(),
            rev: INITIAL_REVISION.to_string(),
            ..Self::default()
        }
    }

    /// Decode from raw bytes, stripping `__proto__` keys at every nesting
    /// level before the typed decode.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let mut value: Value = serde_json::from_slice(bytes)
            .map_err(|e| Error::bad_data(format!("invalid manifest json: {}", e)))?;
        strip_proto(&mut value);
        Self::from_value(value)
    }

    /// Decode from an already-parsed (and proto-stripped) value.
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| Error::bad_data(format!("malformed manifest: {}", e)))
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Fill the holes older or foreign manifests may carry so downstream
    /// code never observes absent fields.
    pub fn normalize(&mut self) {
        if self.rev.is_empty() {
            self.rev = INITIAL_REVISION.to_string();
        }
        let name = self.name.clone();
        for (key, version) in self.versions.iter_mut() {
            let key = key.clone();
            version.stamp(&name, &key);
        }
    }

    /// Set `dist-tags[tag] = version`, making sure a `latest` tag exists
    /// afterwards (the greatest published version wins when it is missing).
    pub fn tag_version(&mut self, tag: &str, version: &str) {
        self.dist_tags.insert(tag.to_string(), version.to_string());
        if !self.dist_tags.contains_key(TAG_LATEST) {
            if let Some(best) = self.greatest_version() {
                self.dist_tags.insert(TAG_LATEST.to_string(), best);
            }
        }
    }

    /// Greatest published version under semver ordering; keys that do not
    /// parse as semver fall back to lexicographic order among themselves.
    pub fn greatest_version(&self) -> Option<String> {
        let mut keys: Vec<&String> = self.versions.keys().collect();
        keys.sort_by(|a, b| {
            match (semver::Version::parse(a), semver::Version::parse(b)) {
                (Ok(x), Ok(y)) => x.cmp(&y),
                (Ok(_), Err(_)) => std::cmp::Ordering::Greater,
                (Err(_), Ok(_)) => std::cmp::Ordering::Less,
                (Err(_), Err(_)) => a.cmp(b),
            }
        });
        keys.last().map(|s| s.to_string())
    }

    /// The version record `latest` points at, falling back to the greatest
    /// version when the tag is absent.
    pub fn latest_version(&self) -> Option<&Version> {
        if let Some(v) = self.dist_tags.get(TAG_LATEST) {
            if let Some(ver) = self.versions.get(v) {
                return Some(ver);
            }
        }
        self.greatest_version()
            .and_then(|v| self.versions.get(&v))
    }

    /// Stamp `time.modified` (and `time.created` on first write) with the
    /// given instant; returns the timestamp used.
    pub fn touch(&mut self) -> String {
        let now = iso_now();
        self.time
            .entry(TIME_CREATED.to_string())
            .or_insert_with(|| now.clone());
        self.time.insert(TIME_MODIFIED.to_string(), now.clone());
        now
    }

    /// The form served to clients: registry bookkeeping stripped, `_id`
    /// restored the way npm clients expect it.
    pub fn client_view(&self) -> Value {
        let mut stripped = self.clone();
        stripped.attachments.clear();
        stripped.distfiles.clear();
        stripped.uplinks.clear();
        let mut value = serde_json::to_value(&stripped).unwrap_or_default();
        if let Value::Object(map) = &mut value {
            map.insert("_id".to_string(), Value::String(self.name.clone()));
        }
        value
    }
}

/// Remove `__proto__` keys everywhere in the tree. Manifests are parsed from
/// untrusted client input; the key is dropped even where it would be inert.
pub fn strip_proto(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.remove("__proto__");
            for (_, v) in map.iter_mut() {
                strip_proto(v);
            }
        }
        Value::Array(items) => {
            for v in items.iter_mut() {
                strip_proto(v);
            }
        }
        _ => {}
    }
}

/// Next revision token: counter incremented, fresh 16-hex-char suffix.
pub fn next_revision(old: &str) -> String {
    let counter = old
        .split('-')
        .next()
        .and_then(|n| n.parse::<u64>().ok())
        .unwrap_or(0);
    format!("{}-{:016x}", counter + 1, fastrand::u64(..))
}

/// Current instant as the ISO-8601 string the `time` map carries.
pub fn iso_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Basename of a tarball URL or path.
pub fn tarball_filename(url: &str) -> Option<String> {
    let name = url.rsplit('/').next()?;
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// Conventional tarball filename for a `(name, version)` pair; the scope is
/// not part of the filename.
pub fn tarball_name_for(package: &str, version: &str) -> String {
    let base = package.rsplit('/').next().unwrap_or(package);
    format!("{}-{}.tgz", base, version)
}

/// Validate a package name against the registry naming rules. Scoped names
/// (`@scope/name`) have each half validated separately.
pub fn validate_package_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 214 {
        return Err(Error::bad_request(format!("invalid package name: {}", name)));
    }
    let segments: Vec<&str> = name.split('/').collect();
    let valid = match segments.as_slice() {
        [single] => is_valid_segment(single, false),
        [scope, base] => {
            scope.starts_with('@')
                && is_valid_segment(&scope[1..], true)
                && is_valid_segment(base, false)
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(Error::bad_request(format!("invalid package name: {}", name)))
    }
}

fn is_valid_segment(segment: &str, is_scope: bool) -> bool {
    if segment.is_empty() {
        return false;
    }
    if !is_scope && (segment.starts_with('.') || segment.starts_with('_')) {
        return false;
    }
    segment
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Tarball filenames must be plain basenames; anything that could walk the
/// directory tree is rejected.
pub fn validate_filename(filename: &str) -> Result<()> {
    if filename.is_empty()
        || filename.starts_with('.')
        || filename.contains('/')
        || filename.contains('\\')
        || filename.contains("..")
    {
        return Err(Error::bad_request(format!("invalid filename: {}", filename)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_template_defaults() {
        let manifest = Manifest::template("foo");
        assert_eq!(manifest.name, "foo");
        assert_eq!(manifest.rev, INITIAL_REVISION);
        assert!(manifest.versions.is_empty());
        assert!(manifest.dist_tags.is_empty());
    }

    #[test]
    fn test_proto_stripped_at_every_level() {
        let bytes = serde_json::to_vec(&json!({
            "name": "evil",
            "__proto__": {"polluted": true},
            "versions": {
                "1.0.0": {
                    "name": "evil",
                    "version": "1.0.0",
                    "__proto__": {"polluted": true},
                    "dist": {"tarball": "http://x/evil/-/evil-1.0.0.tgz"}
                }
            }
        }))
        .unwrap();

        let manifest = Manifest::from_slice(&bytes).unwrap();
        let ver = &manifest.versions["1.0.0"];
        assert!(!ver.extra.contains_key("__proto__"));
        let round = serde_json::to_string(&manifest).unwrap();
        assert!(!round.contains("__proto__"));
    }

    #[test]
    fn test_people_normalization() {
        let value = json!({
            "name": "pkg",
            "version": "1.0.0",
            "contributors": "Alice",
            "maintainers": [{"name": "Bob", "email": "bob@example.com"}, "Carol"],
            "author": {"name": "Dora"}
        });
        let ver: Version = serde_json::from_value(value).unwrap();
        assert_eq!(ver.contributors, vec![Person { name: "Alice".into(), email: None }]);
        assert_eq!(ver.maintainers.len(), 2);
        assert_eq!(ver.maintainers[0].email.as_deref(), Some("bob@example.com"));
        assert_eq!(ver.author.as_ref().unwrap().name, "Dora");
    }

    #[test]
    fn test_keywords_accept_string_form() {
        let ver: Version =
            serde_json::from_value(json!({"version": "1.0.0", "keywords": "http cache"})).unwrap();
        assert_eq!(ver.keywords, vec!["http", "cache"]);
    }

    #[test]
    fn test_tag_version_backfills_latest() {
        let mut manifest = Manifest::template("foo");
        manifest.versions.insert("1.0.0".into(), Version::default());
        manifest.versions.insert("1.2.0".into(), Version::default());
        manifest.tag_version("beta", "1.0.0");

        assert_eq!(manifest.dist_tags["beta"], "1.0.0");
        assert_eq!(manifest.dist_tags[TAG_LATEST], "1.2.0");

        // A present latest is never moved implicitly.
        manifest.versions.insert("2.0.0".into(), Version::default());
        manifest.tag_version("next", "2.0.0");
        assert_eq!(manifest.dist_tags[TAG_LATEST], "1.2.0");
    }

    #[test]
    fn test_next_revision_increments_counter() {
        let first = next_revision(INITIAL_REVISION);
        assert!(first.starts_with("1-"));
        let second = next_revision(&first);
        assert!(second.starts_with("2-"));
        assert_eq!(second.len(), "2-".len() + 16);
    }

    #[test]
    fn test_client_view_strips_bookkeeping() {
        let mut manifest = Manifest::template("foo");
        manifest
            .attachments
            .insert("foo-1.0.0.tgz".into(), Attachment::default());
        manifest.uplinks.insert("npmjs".into(), UplinkState::default());
        manifest
            .distfiles
            .insert("foo-1.0.0.tgz".into(), DistFile::default());

        let view = manifest.client_view();
        assert!(view.get("_attachments").is_none());
        assert!(view.get("_distfiles").is_none());
        assert!(view.get("_uplinks").is_none());
        assert_eq!(view["_id"], "foo");
    }

    #[test]
    fn test_version_extra_fields_round_trip() {
        let value = json!({
            "name": "pkg",
            "version": "1.0.0",
            "scripts": {"test": "node test.js"},
            "engines": {"node": ">=18"}
        });
        let ver: Version = serde_json::from_value(value).unwrap();
        assert!(ver.extra.contains_key("scripts"));
        let out = serde_json::to_value(&ver).unwrap();
        assert_eq!(out["engines"]["node"], ">=18");
    }

    #[test]
    fn test_package_name_validation() {
        assert!(validate_package_name("foo").is_ok());
        assert!(validate_package_name("@scope/foo").is_ok());
        assert!(validate_package_name("foo-bar.baz_qux").is_ok());
        assert!(validate_package_name("").is_err());
        assert!(validate_package_name("../escape").is_err());
        assert!(validate_package_name(".hidden").is_err());
        assert!(validate_package_name("@scope/foo/extra").is_err());
        assert!(validate_package_name("UPPER CASE").is_err());
    }

    #[test]
    fn test_filename_validation() {
        assert!(validate_filename("foo-1.0.0.tgz").is_ok());
        assert!(validate_filename("../../etc/passwd").is_err());
        assert!(validate_filename(".hidden.tgz").is_err());
        assert!(validate_filename("dir/file.tgz").is_err());
    }

    #[test]
    fn test_tarball_names() {
        assert_eq!(
            tarball_filename("https://registry.npmjs.org/react/-/react-18.2.0.tgz").as_deref(),
            Some("react-18.2.0.tgz")
        );
        assert_eq!(tarball_name_for("@scope/pkg", "1.0.0"), "pkg-1.0.0.tgz");
        assert_eq!(tarball_name_for("pkg", "1.0.0"), "pkg-1.0.0.tgz");
    }
}
