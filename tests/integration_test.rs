//! Integration tests for packrat
//!
//! These tests verify end-to-end engine behavior across the local store,
//! the storage backend and the federated registry.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use futures::TryStreamExt;
use sha1::{Digest, Sha1};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use packrat::config::AppConfig;
use packrat::manifest::{Dist, Version, TAG_LATEST};
use packrat::registry::Registry;
use packrat::storage::local::LocalFsBackend;
use packrat::types::RequestScope;
use packrat::Error;

fn registry() -> (Arc<Registry>, TempDir) {
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(LocalFsBackend::new(dir.path()).unwrap());
    let registry = Registry::new(&AppConfig::default(), backend).unwrap();
    (Arc::new(registry), dir)
}

fn sha1_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha1::digest(bytes))
}

fn version_record(name: &str, version: &str, shasum: &str) -> Version {
    Version {
        name: name.to_string(),
        version: version.to_string(),
        description: "test package".to_string(),
        dist: Dist {
            tarball: format!("http://localhost:4873/{}/-/{}-{}.tgz", name, name, version),
            shasum: Some(shasum.to_string()),
            ..Dist::default()
        },
        ..Version::default()
    }
}

/// Publish a tarball + version the way the publish endpoint drives the
/// engine, returning the stored shasum.
async fn publish(registry: &Arc<Registry>, name: &str, version: &str, content: &[u8]) -> String {
    let filename = format!("{}-{}.tgz", name.rsplit('/').next().unwrap(), version);
    let mut sink = registry
        .add_tarball(name, &filename, CancellationToken::new())
        .await
        .unwrap();
    sink.write_chunk(Bytes::copy_from_slice(content)).await.unwrap();
    let shasum = sink.finish().await.unwrap();

    registry
        .add_version(name, version, version_record(name, version, &shasum), TAG_LATEST)
        .await
        .unwrap();
    shasum
}

/// Publish followed by fetch returns the claimed shasum and the exact bytes.
#[tokio::test]
async fn test_publish_fetch_round_trip() {
    let (registry, _dir) = registry();
    let content = b"round trip tarball bytes";
    let shasum = publish(&registry, "foo", "1.0.0", content).await;
    assert_eq!(shasum, sha1_hex(content));

    let scope = RequestScope::new("http", "localhost:4873");
    let fetched = registry
        .get_package_by_version("foo", "1.0.0", &scope)
        .await
        .unwrap();
    assert_eq!(fetched.dist.shasum.as_deref(), Some(shasum.as_str()));
    assert_eq!(
        fetched.dist.tarball,
        "http://localhost:4873/foo/-/foo-1.0.0.tgz"
    );

    let stream = registry
        .get_tarball("foo", "foo-1.0.0.tgz", CancellationToken::new())
        .await
        .unwrap();
    let chunks: Vec<Bytes> = stream.try_collect().await.unwrap();
    assert_eq!(chunks.concat(), content);
}

/// Two concurrent publishes of the same version produce exactly one success
/// and one conflict.
#[tokio::test]
async fn test_concurrent_publish_single_winner() {
    let (registry, _dir) = registry();

    let mut handles = Vec::new();
    for _ in 0..2 {
        let registry = Arc::clone(&registry);
        handles.push(tokio::spawn(async move {
            registry
                .add_version(
                    "race",
                    "1.0.0",
                    version_record("race", "1.0.0", &sha1_hex(b"bytes")),
                    TAG_LATEST,
                )
                .await
        }));
    }

    let mut ok = 0;
    let mut conflicts = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => ok += 1,
            Err(Error::Conflict(_)) => conflicts += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!((ok, conflicts), (1, 1));
}

/// Versions never disappear except through an explicit change_package that
/// omits them; dist-tags always point at present versions.
#[tokio::test]
async fn test_unpublish_and_tag_closure() {
    let (registry, _dir) = registry();
    publish(&registry, "multi", "1.0.0", b"one").await;
    publish(&registry, "multi", "1.1.0", b"two").await;

    let mut tags = HashMap::new();
    tags.insert("beta".to_string(), Some("1.0.0".to_string()));
    registry.merge_tags("multi", tags).await.unwrap();

    let (manifest, _) = registry.get_package("multi", false).await.unwrap();
    assert_eq!(manifest.versions.len(), 2);
    assert_eq!(manifest.dist_tags["beta"], "1.0.0");

    // Drop 1.0.0 through an explicit change.
    let mut incoming = manifest.clone();
    incoming.versions.remove("1.0.0");
    incoming.dist_tags.remove("beta");
    registry.change_package("multi", incoming).await.unwrap();

    let (manifest, _) = registry.get_package("multi", false).await.unwrap();
    assert!(!manifest.versions.contains_key("1.0.0"));
    assert!(manifest.versions.contains_key("1.1.0"));
    for (tag, target) in &manifest.dist_tags {
        assert!(
            manifest.versions.contains_key(target),
            "tag {} points at missing version {}",
            tag,
            target
        );
    }
}

/// Deprecation round-trip through change_package.
#[tokio::test]
async fn test_deprecate_version() {
    let (registry, _dir) = registry();
    publish(&registry, "olden", "1.0.0", b"old bytes").await;

    let (mut incoming, _) = registry.get_package("olden", false).await.unwrap();
    incoming.versions.get_mut("1.0.0").unwrap().deprecated =
        Some("this version is broken".to_string());
    registry.change_package("olden", incoming).await.unwrap();

    let scope = RequestScope::new("http", "localhost:4873");
    let fetched = registry
        .get_package_by_version("olden", "1.0.0", &scope)
        .await
        .unwrap();
    assert_eq!(fetched.deprecated.as_deref(), Some("this version is broken"));
}

/// Removing a package deletes the manifest, the tarballs and the index entry.
#[tokio::test]
async fn test_remove_package_deletes_everything() {
    let (registry, dir) = registry();
    publish(&registry, "doomed", "1.0.0", b"doomed bytes").await;
    assert!(dir.path().join("doomed/package.json").exists());
    assert!(dir.path().join("doomed/doomed-1.0.0.tgz").exists());

    registry.remove_package("doomed").await.unwrap();

    assert!(!dir.path().join("doomed").exists());
    assert!(matches!(
        registry.get_package("doomed", false).await,
        Err(Error::NotFound(_))
    ));
    let listed = registry.local().backend().list_packages().await.unwrap();
    assert!(!listed.contains(&"doomed".to_string()));
}

/// The second publish of a different version reusing the same filename with
/// different bytes is rejected before the stored tarball is replaced.
#[tokio::test]
async fn test_shasum_guard_on_filename_reuse() {
    let (registry, _dir) = registry();
    publish(&registry, "guarded", "1.0.0", b"original bytes").await;

    let mut sink = registry
        .add_tarball("guarded", "guarded-1.0.0.tgz", CancellationToken::new())
        .await
        .unwrap();
    sink.write_chunk(Bytes::from_static(b"attacker bytes")).await.unwrap();
    assert!(matches!(sink.finish().await, Err(Error::BadRequest(_))));

    let stream = registry
        .get_tarball("guarded", "guarded-1.0.0.tgz", CancellationToken::new())
        .await
        .unwrap();
    let chunks: Vec<Bytes> = stream.try_collect().await.unwrap();
    assert_eq!(chunks.concat(), b"original bytes");
}

/// Revisions strictly increase across writes to the same package.
#[tokio::test]
async fn test_revision_monotonicity() {
    let (registry, _dir) = registry();

    let counter = |rev: &str| rev.split('-').next().unwrap().parse::<u64>().unwrap();
    publish(&registry, "revs", "1.0.0", b"a").await;
    let (m1, _) = registry.get_package("revs", false).await.unwrap();

    let mut tags = HashMap::new();
    tags.insert("beta".to_string(), Some("1.0.0".to_string()));
    registry.merge_tags("revs", tags).await.unwrap();
    let (m2, _) = registry.get_package("revs", false).await.unwrap();

    assert!(counter(&m2.rev) > counter(&m1.rev));
}

/// Scoped packages go through the same flows with nested storage.
#[tokio::test]
async fn test_scoped_package_round_trip() {
    let (registry, dir) = registry();
    publish(&registry, "@scope/pkg", "2.0.0", b"scoped bytes").await;
    assert!(dir.path().join("@scope/pkg/package.json").exists());
    assert!(dir.path().join("@scope/pkg/pkg-2.0.0.tgz").exists());

    let scope = RequestScope::new("https", "registry.example.com");
    let view = registry
        .get_package_manifest("@scope/pkg", &scope)
        .await
        .unwrap();
    assert_eq!(
        view["versions"]["2.0.0"]["dist"]["tarball"],
        "https://registry.example.com/@scope/pkg/-/pkg-2.0.0.tgz"
    );
}
