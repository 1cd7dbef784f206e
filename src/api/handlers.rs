//! API handlers

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::manifest::{iso_now, strip_proto, validate_package_name, Manifest, TAG_LATEST};
use crate::registry::Registry;
use crate::types::RequestScope;
use crate::{Error, Result};

fn scope_from(headers: &HeaderMap) -> RequestScope {
    let host = headers
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost")
        .to_string();
    let protocol = headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("http")
        .to_string();
    RequestScope::new(protocol, host)
}

fn created(message: &str) -> Response {
    (StatusCode::CREATED, Json(json!({ "ok": message }))).into_response()
}

/// Dist-tag bodies arrive either as a JSON string (`"1.0.0"`) or as the bare
/// version text, depending on the client.
fn parse_version_body(body: &str) -> Result<String> {
    if let Ok(version) = serde_json::from_str::<String>(body) {
        return Ok(version);
    }
    let trimmed = body.trim().trim_matches('"');
    if trimmed.is_empty() {
        return Err(Error::bad_request("expected a version in the request body"));
    }
    Ok(trimmed.to_string())
}

pub async fn ping() -> Json<Value> {
    Json(json!({}))
}

// Manifest reads

pub async fn get_package(
    State(registry): State<Arc<Registry>>,
    Path(p1): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    validate_package_name(&p1)?;
    debug!(package = %p1, "manifest request");
    let scope = scope_from(&headers);
    Ok(Json(registry.get_package_manifest(&p1, &scope).await?))
}

/// `GET /{a}/{b}`: either the manifest of an unencoded scoped package or a
/// version/tag lookup on a plain one.
pub async fn get_two(
    State(registry): State<Arc<Registry>>,
    Path((p1, p2)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    let scope = scope_from(&headers);
    if p1.starts_with('@') {
        let name = format!("{}/{}", p1, p2);
        validate_package_name(&name)?;
        return Ok(Json(registry.get_package_manifest(&name, &scope).await?));
    }
    validate_package_name(&p1)?;
    let version = registry.get_package_by_version(&p1, &p2, &scope).await?;
    Ok(Json(serde_json::to_value(version)?))
}

/// `GET /@scope/name/{version|tag}`.
pub async fn get_three(
    State(registry): State<Arc<Registry>>,
    Path((p1, p2, p3)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    if !p1.starts_with('@') {
        return Err(Error::not_found(format!("no such route: /{}/{}/{}", p1, p2, p3)));
    }
    let name = format!("{}/{}", p1, p2);
    validate_package_name(&name)?;
    let scope = scope_from(&headers);
    let version = registry.get_package_by_version(&name, &p3, &scope).await?;
    Ok(Json(serde_json::to_value(version)?))
}

// Tarballs

async fn tarball_response(registry: Arc<Registry>, name: String, filename: String) -> Result<Response> {
    validate_package_name(&name)?;
    let signal = CancellationToken::new();
    let stream = registry.get_tarball(&name, &filename, signal).await?;
    let body = Body::from_stream(stream);
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        body,
    )
        .into_response())
}

pub async fn get_tarball(
    State(registry): State<Arc<Registry>>,
    Path((p1, file)): Path<(String, String)>,
) -> Result<Response> {
    tarball_response(registry, p1, file).await
}

pub async fn get_tarball_scoped(
    State(registry): State<Arc<Registry>>,
    Path((p1, p2, file)): Path<(String, String, String)>,
) -> Result<Response> {
    tarball_response(registry, format!("{}/{}", p1, p2), file).await
}

// Publish / change / unpublish

pub async fn publish(
    State(registry): State<Arc<Registry>>,
    Path(p1): Path<String>,
    Json(body): Json<Value>,
) -> Result<Response> {
    publish_impl(registry, p1, body).await
}

/// `PUT /{a}/{b}`: publish for an unencoded scoped package, dist-tag update
/// for a plain one.
pub async fn put_two(
    State(registry): State<Arc<Registry>>,
    Path((p1, p2)): Path<(String, String)>,
    body: String,
) -> Result<Response> {
    if p1.starts_with('@') {
        let value: Value = serde_json::from_str(&body)
            .map_err(|e| Error::bad_data(format!("invalid manifest body: {}", e)))?;
        return publish_impl(registry, format!("{}/{}", p1, p2), value).await;
    }
    validate_package_name(&p1)?;
    let version = parse_version_body(&body)?;
    let mut tags = HashMap::new();
    tags.insert(p2, Some(version));
    registry.merge_tags(&p1, tags).await?;
    Ok(created("tags updated"))
}

async fn publish_impl(registry: Arc<Registry>, name: String, mut body: Value) -> Result<Response> {
    validate_package_name(&name)?;
    strip_proto(&mut body);

    let Some(obj) = body.as_object_mut() else {
        return Err(Error::bad_data("manifest must be a json object"));
    };
    match obj.get("versions") {
        Some(Value::Object(_)) => {}
        _ => return Err(Error::bad_data("versions must be an object")),
    }
    if let Some(tags) = obj.get("dist-tags") {
        if !tags.is_object() {
            return Err(Error::bad_data("dist-tags must be an object"));
        }
    }

    let attachments = obj
        .remove("_attachments")
        .as_ref()
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    let incoming = Manifest::from_value(Value::Object(obj.clone()))?;

    // A body without attachments is a metadata-only change: unpublish of
    // versions and/or deprecation.
    if attachments.is_empty() {
        info!(package = %name, "package change request");
        registry.change_package(&name, incoming).await?;
        return Ok(created("package changed"));
    }

    for (filename, attachment) in &attachments {
        let data = attachment
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::bad_request("attachment data must be a base64 string"))?;
        let bytes = BASE64
            .decode(data)
            .map_err(|e| Error::bad_request(format!("invalid base64 attachment: {}", e)))?;

        let mut sink = registry
            .add_tarball(&name, filename, CancellationToken::new())
            .await?;
        sink.write_chunk(Bytes::from(bytes)).await?;
        let shasum = sink.finish().await?;
        debug!(package = %name, filename = %filename, shasum = %shasum, "tarball stored");
    }

    let mut published = Vec::new();
    for (version, record) in &incoming.versions {
        let tag = incoming
            .dist_tags
            .iter()
            .find(|(_, target)| *target == version)
            .map(|(tag, _)| tag.clone())
            .unwrap_or_else(|| TAG_LATEST.to_string());
        registry
            .add_version(&name, version, record.clone(), &tag)
            .await?;
        published.push(version.clone());
    }
    info!(package = %name, versions = ?published, "package published");
    Ok(created("created new package"))
}

async fn change_impl(registry: Arc<Registry>, name: String, mut body: Value) -> Result<Response> {
    validate_package_name(&name)?;
    strip_proto(&mut body);
    if let Some(obj) = body.as_object_mut() {
        obj.remove("_attachments");
    }
    let incoming = Manifest::from_value(body)?;
    registry.change_package(&name, incoming).await?;
    Ok(created("package changed"))
}

pub async fn change_package(
    State(registry): State<Arc<Registry>>,
    Path((p1, _rev)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Result<Response> {
    change_impl(registry, p1, body).await
}

pub async fn change_package_scoped(
    State(registry): State<Arc<Registry>>,
    Path((p1, p2, _rev)): Path<(String, String, String)>,
    Json(body): Json<Value>,
) -> Result<Response> {
    change_impl(registry, format!("{}/{}", p1, p2), body).await
}

pub async fn remove_package(
    State(registry): State<Arc<Registry>>,
    Path((p1, _rev)): Path<(String, String)>,
) -> Result<Response> {
    validate_package_name(&p1)?;
    registry.remove_package(&p1).await?;
    Ok(created("package removed"))
}

pub async fn remove_package_scoped(
    State(registry): State<Arc<Registry>>,
    Path((p1, p2, _rev)): Path<(String, String, String)>,
) -> Result<Response> {
    let name = format!("{}/{}", p1, p2);
    validate_package_name(&name)?;
    registry.remove_package(&name).await?;
    Ok(created("package removed"))
}

pub async fn remove_tarball(
    State(registry): State<Arc<Registry>>,
    Path((p1, file, rev)): Path<(String, String, String)>,
) -> Result<Response> {
    validate_package_name(&p1)?;
    registry.remove_tarball(&p1, &file, &rev).await?;
    Ok(created("tarball removed"))
}

pub async fn remove_tarball_scoped(
    State(registry): State<Arc<Registry>>,
    Path((p1, p2, file, rev)): Path<(String, String, String, String)>,
) -> Result<Response> {
    let name = format!("{}/{}", p1, p2);
    validate_package_name(&name)?;
    registry.remove_tarball(&name, &file, &rev).await?;
    Ok(created("tarball removed"))
}

// Dist-tags

async fn dist_tags_of(registry: &Registry, name: &str) -> Result<Json<Value>> {
    validate_package_name(name)?;
    let (manifest, _warnings) = registry.get_package(name, true).await?;
    Ok(Json(serde_json::to_value(manifest.dist_tags)?))
}

pub async fn get_dist_tags(
    State(registry): State<Arc<Registry>>,
    Path(p1): Path<String>,
) -> Result<Json<Value>> {
    dist_tags_of(&registry, &p1).await
}

pub async fn get_dist_tags_scoped(
    State(registry): State<Arc<Registry>>,
    Path((p1, p2)): Path<(String, String)>,
) -> Result<Json<Value>> {
    dist_tags_of(&registry, &format!("{}/{}", p1, p2)).await
}

async fn merge_dist_tags_impl(
    registry: &Registry,
    name: &str,
    tags: HashMap<String, String>,
) -> Result<Response> {
    validate_package_name(name)?;
    let tags = tags.into_iter().map(|(tag, v)| (tag, Some(v))).collect();
    registry.merge_tags(name, tags).await?;
    Ok(created("tags updated"))
}

pub async fn merge_dist_tags(
    State(registry): State<Arc<Registry>>,
    Path(p1): Path<String>,
    Json(tags): Json<HashMap<String, String>>,
) -> Result<Response> {
    merge_dist_tags_impl(&registry, &p1, tags).await
}

pub async fn merge_dist_tags_scoped(
    State(registry): State<Arc<Registry>>,
    Path((p1, p2)): Path<(String, String)>,
    Json(tags): Json<HashMap<String, String>>,
) -> Result<Response> {
    merge_dist_tags_impl(&registry, &format!("{}/{}", p1, p2), tags).await
}

async fn set_dist_tag_impl(
    registry: &Registry,
    name: &str,
    tag: String,
    body: &str,
) -> Result<Response> {
    validate_package_name(name)?;
    let version = parse_version_body(body)?;
    let mut tags = HashMap::new();
    tags.insert(tag, Some(version));
    registry.merge_tags(name, tags).await?;
    Ok(created("tags updated"))
}

pub async fn set_dist_tag(
    State(registry): State<Arc<Registry>>,
    Path((p1, tag)): Path<(String, String)>,
    body: String,
) -> Result<Response> {
    set_dist_tag_impl(&registry, &p1, tag, &body).await
}

pub async fn set_dist_tag_scoped(
    State(registry): State<Arc<Registry>>,
    Path((p1, p2, tag)): Path<(String, String, String)>,
    body: String,
) -> Result<Response> {
    set_dist_tag_impl(&registry, &format!("{}/{}", p1, p2), tag, &body).await
}

async fn delete_dist_tag_impl(registry: &Registry, name: &str, tag: String) -> Result<Response> {
    validate_package_name(name)?;
    let mut tags = HashMap::new();
    tags.insert(tag, None);
    registry.merge_tags(name, tags).await?;
    Ok(created("tags updated"))
}

pub async fn delete_dist_tag(
    State(registry): State<Arc<Registry>>,
    Path((p1, tag)): Path<(String, String)>,
) -> Result<Response> {
    delete_dist_tag_impl(&registry, &p1, tag).await
}

pub async fn delete_dist_tag_scoped(
    State(registry): State<Arc<Registry>>,
    Path((p1, p2, tag)): Path<(String, String, String)>,
) -> Result<Response> {
    delete_dist_tag_impl(&registry, &format!("{}/{}", p1, p2), tag).await
}

// Search

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub size: Option<usize>,
}

pub async fn search(
    State(registry): State<Arc<Registry>>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Value>> {
    let mut stream = Box::pin(registry.search(query.text.clone()));
    let mut objects = Vec::new();
    while let Some(item) = stream.next().await {
        let body = item?;
        objects.push(json!({
            "package": body,
            "score": { "final": 1.0 },
            "searchScore": 1.0,
        }));
        if let Some(size) = query.size {
            if objects.len() >= size {
                break;
            }
        }
    }
    Ok(Json(json!({
        "objects": objects,
        "total": objects.len(),
        "time": iso_now(),
    })))
}
