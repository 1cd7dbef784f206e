//! Wire-protocol tests
//!
//! Drive the HTTP surface the way npm clients do and assert the status codes
//! and document shapes the protocol promises.

use std::sync::Arc;

use axum::http::StatusCode;
use axum_test::TestServer;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Value};
use sha1::{Digest, Sha1};
use tempfile::TempDir;

use packrat::config::AppConfig;
use packrat::registry::Registry;
use packrat::storage::local::LocalFsBackend;

fn server() -> (TestServer, TempDir) {
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(LocalFsBackend::new(dir.path()).unwrap());
    let registry = Arc::new(Registry::new(&AppConfig::default(), backend).unwrap());
    let server = TestServer::new(packrat::api::create_router(registry)).unwrap();
    (server, dir)
}

fn publish_payload(name: &str, version: &str, tarball: &[u8]) -> Value {
    let base = name.rsplit('/').next().unwrap();
    let filename = format!("{}-{}.tgz", base, version);
    json!({
        "_id": name,
        "name": name,
        "description": "a test package",
        "dist-tags": { "latest": version },
        "versions": {
            version: {
                "name": name,
                "version": version,
                "description": "a test package",
                "dist": {
                    "tarball": format!("http://localhost:4873/{}/-/{}", name, filename),
                    "shasum": format!("{:x}", Sha1::digest(tarball))
                }
            }
        },
        "_attachments": {
            filename: {
                "content_type": "application/octet-stream",
                "data": BASE64.encode(tarball),
                "length": tarball.len()
            }
        }
    })
}

#[tokio::test]
async fn test_publish_then_fetch_manifest() {
    let (server, _dir) = server();
    let tarball = b"wire protocol tarball";

    let response = server
        .put("/foo")
        .json(&publish_payload("foo", "1.0.0", tarball))
        .await;
    assert_eq!(response.status_code(), StatusCode::CREATED);
    let body: Value = response.json();
    assert!(body["ok"].is_string());

    let response = server.get("/foo").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let manifest: Value = response.json();
    assert_eq!(manifest["name"], "foo");
    assert_eq!(manifest["dist-tags"]["latest"], "1.0.0");
    assert_eq!(
        manifest["versions"]["1.0.0"]["dist"]["shasum"],
        format!("{:x}", Sha1::digest(tarball))
    );
    assert!(manifest.get("_attachments").is_none());
    assert!(manifest.get("_distfiles").is_none());
}

#[tokio::test]
async fn test_republish_conflicts() {
    let (server, _dir) = server();
    let payload = publish_payload("foo", "1.0.0", b"bytes");

    let response = server.put("/foo").json(&payload).await;
    assert_eq!(response.status_code(), StatusCode::CREATED);

    let response = server.put("/foo").json(&payload).await;
    assert_eq!(response.status_code(), StatusCode::CONFLICT);
    let body: Value = response.json();
    assert!(body["error"].as_str().unwrap().contains("already exists"));
}

#[tokio::test]
async fn test_fetch_by_version_and_tag() {
    let (server, _dir) = server();
    server
        .put("/foo")
        .json(&publish_payload("foo", "1.2.3", b"bytes"))
        .await;

    let response = server.get("/foo/1.2.3").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let version: Value = response.json();
    assert_eq!(version["version"], "1.2.3");

    let response = server.get("/foo/latest").await;
    assert_eq!(response.status_code(), StatusCode::OK);

    let response = server.get("/foo/9.9.9").await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_tarball_download_round_trip() {
    let (server, _dir) = server();
    let tarball = b"exact tarball bytes";
    server
        .put("/foo")
        .json(&publish_payload("foo", "1.0.0", tarball))
        .await;

    let response = server.get("/foo/-/foo-1.0.0.tgz").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.as_bytes().to_vec(), tarball.to_vec());

    let response = server.get("/foo/-/foo-9.9.9.tgz").await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_dist_tag_lifecycle() {
    let (server, _dir) = server();
    server
        .put("/foo")
        .json(&publish_payload("foo", "1.0.0", b"bytes"))
        .await;

    let response = server
        .put("/-/package/foo/dist-tags/beta")
        .text("\"1.0.0\"")
        .await;
    assert_eq!(response.status_code(), StatusCode::CREATED);

    let response = server.get("/-/package/foo/dist-tags").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let tags: Value = response.json();
    assert_eq!(tags["beta"], "1.0.0");
    assert_eq!(tags["latest"], "1.0.0");

    let response = server.delete("/-/package/foo/dist-tags/beta").await;
    assert_eq!(response.status_code(), StatusCode::CREATED);

    let tags: Value = server.get("/-/package/foo/dist-tags").await.json();
    assert!(tags.get("beta").is_none());
}

#[tokio::test]
async fn test_dist_tag_requires_existing_version() {
    let (server, _dir) = server();
    server
        .put("/foo")
        .json(&publish_payload("foo", "1.0.0", b"bytes"))
        .await;

    let response = server
        .put("/-/package/foo/dist-tags/beta")
        .text("\"4.5.6\"")
        .await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_tag_via_short_route() {
    let (server, _dir) = server();
    server
        .put("/foo")
        .json(&publish_payload("foo", "1.0.0", b"bytes"))
        .await;

    let response = server.put("/foo/next").text("\"1.0.0\"").await;
    assert_eq!(response.status_code(), StatusCode::CREATED);

    let tags: Value = server.get("/-/package/foo/dist-tags").await.json();
    assert_eq!(tags["next"], "1.0.0");
}

#[tokio::test]
async fn test_unpublish_version_then_package() {
    let (server, dir) = server();
    server
        .put("/foo")
        .json(&publish_payload("foo", "1.0.0", b"one"))
        .await;
    server
        .put("/foo")
        .json(&publish_payload("foo", "1.1.0", b"two"))
        .await;

    let manifest: Value = server.get("/foo").await.json();
    let rev = manifest["_rev"].as_str().unwrap().to_string();

    // Unpublish 1.0.0: same manifest without that version or its tags.
    let mut change = manifest.clone();
    change["versions"].as_object_mut().unwrap().remove("1.0.0");
    change["dist-tags"] = json!({ "latest": "1.1.0" });
    let response = server
        .put(&format!("/foo/-rev/{}", rev))
        .json(&change)
        .await;
    assert_eq!(response.status_code(), StatusCode::CREATED);

    let manifest: Value = server.get("/foo").await.json();
    assert!(manifest["versions"].get("1.0.0").is_none());
    assert!(manifest["versions"].get("1.1.0").is_some());

    // Now remove the whole package.
    let rev = manifest["_rev"].as_str().unwrap().to_string();
    let response = server.delete(&format!("/foo/-rev/{}", rev)).await;
    assert_eq!(response.status_code(), StatusCode::CREATED);

    let response = server.get("/foo").await;
    assert_eq!(response.status_code(), StatusCode::NOT_FOUND);
    assert!(!dir.path().join("foo").exists());
}

#[tokio::test]
async fn test_deprecate_via_change() {
    let (server, _dir) = server();
    server
        .put("/foo")
        .json(&publish_payload("foo", "1.0.0", b"bytes"))
        .await;

    let mut manifest: Value = server.get("/foo").await.json();
    manifest["versions"]["1.0.0"]["deprecated"] = json!("use bar instead");
    let rev = manifest["_rev"].as_str().unwrap().to_string();
    let response = server
        .put(&format!("/foo/-rev/{}", rev))
        .json(&manifest)
        .await;
    assert_eq!(response.status_code(), StatusCode::CREATED);

    let fetched: Value = server.get("/foo/1.0.0").await.json();
    assert_eq!(fetched["deprecated"], "use bar instead");
}

#[tokio::test]
async fn test_scoped_package_over_the_wire() {
    let (server, _dir) = server();
    let tarball = b"scoped bytes";

    // npm sends scoped names percent-encoded as a single segment.
    let response = server
        .put("/@scope%2fpkg")
        .json(&publish_payload("@scope/pkg", "1.0.0", tarball))
        .await;
    assert_eq!(response.status_code(), StatusCode::CREATED);

    // Both the encoded and the raw two-segment form resolve.
    let response = server.get("/@scope%2fpkg").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let response = server.get("/@scope/pkg").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let manifest: Value = response.json();
    assert_eq!(manifest["name"], "@scope/pkg");

    let response = server.get("/@scope/pkg/1.0.0").await;
    assert_eq!(response.status_code(), StatusCode::OK);

    let response = server.get("/@scope/pkg/-/pkg-1.0.0.tgz").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert_eq!(response.as_bytes().to_vec(), tarball.to_vec());
}

#[tokio::test]
async fn test_tarball_urls_follow_request_host() {
    let (server, _dir) = server();
    server
        .put("/foo")
        .json(&publish_payload("foo", "1.0.0", b"bytes"))
        .await;

    let response = server
        .get("/foo")
        .add_header(
            axum::http::header::HOST,
            axum::http::HeaderValue::from_static("pkgs.example.com"),
        )
        .add_header(
            axum::http::HeaderName::from_static("x-forwarded-proto"),
            axum::http::HeaderValue::from_static("https"),
        )
        .await;
    let manifest: Value = response.json();
    assert_eq!(
        manifest["versions"]["1.0.0"]["dist"]["tarball"],
        "https://pkgs.example.com/foo/-/foo-1.0.0.tgz"
    );
}

#[tokio::test]
async fn test_search_returns_published_packages() {
    let (server, _dir) = server();
    server
        .put("/foo")
        .json(&publish_payload("foo", "1.0.0", b"bytes"))
        .await;
    server
        .put("/unrelated")
        .json(&publish_payload("unrelated", "1.0.0", b"bytes"))
        .await;

    let response = server.get("/-/v1/search?text=foo").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    let objects = body["objects"].as_array().unwrap();
    assert_eq!(objects.len(), 1);
    assert_eq!(objects[0]["package"]["name"], "foo");
    assert_eq!(objects[0]["package"]["version"], "1.0.0");
}

#[tokio::test]
async fn test_publish_without_versions_is_bad_data() {
    let (server, _dir) = server();
    let response = server.put("/foo").json(&json!({ "name": "foo" })).await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_shasum_mismatch_is_rejected() {
    let (server, _dir) = server();
    let mut payload = publish_payload("foo", "1.0.0", b"actual bytes");
    payload["versions"]["1.0.0"]["dist"]["shasum"] =
        json!("0000000000000000000000000000000000000000");

    let response = server.put("/foo").json(&payload).await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_ping() {
    let (server, _dir) = server();
    let response = server.get("/-/ping").await;
    assert_eq!(response.status_code(), StatusCode::OK);
}
