//! HTTP API server
//!
//! Thin dispatch over the federated store: route matching, request-scope
//! extraction and status mapping live here, the semantics live below.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, put};
use axum::{Json, Router};
use serde_json::json;

use crate::registry::Registry;
use crate::Error;

pub mod handlers;

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::BadData(_) | Error::BadRequest(_) | Error::Serialization(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::ContentMismatch { .. } | Error::Io(_) | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Build the API router.
///
/// Scoped packages reach us two ways: percent-encoded as a single segment
/// (`/@scope%2fname`) or raw as two segments (`/@scope/name`); the
/// two-segment routes dispatch on the leading `@`.
pub fn create_router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/-/ping", get(handlers::ping))
        .route("/-/v1/search", get(handlers::search))
        .route(
            "/-/package/:p1/dist-tags",
            get(handlers::get_dist_tags)
                .put(handlers::merge_dist_tags)
                .post(handlers::merge_dist_tags),
        )
        .route(
            "/-/package/:p1/:p2/dist-tags",
            get(handlers::get_dist_tags_scoped)
                .put(handlers::merge_dist_tags_scoped)
                .post(handlers::merge_dist_tags_scoped),
        )
        .route(
            "/-/package/:p1/dist-tags/:tag",
            put(handlers::set_dist_tag).delete(handlers::delete_dist_tag),
        )
        .route(
            "/-/package/:p1/:p2/dist-tags/:tag",
            put(handlers::set_dist_tag_scoped).delete(handlers::delete_dist_tag_scoped),
        )
        .route("/:p1", get(handlers::get_package).put(handlers::publish))
        .route(
            "/:p1/-rev/:rev",
            put(handlers::change_package).delete(handlers::remove_package),
        )
        .route("/:p1/-/:file", get(handlers::get_tarball))
        .route("/:p1/-/:file/-rev/:rev", delete(handlers::remove_tarball))
        .route("/:p1/:p2", get(handlers::get_two).put(handlers::put_two))
        .route(
            "/:p1/:p2/-rev/:rev",
            put(handlers::change_package_scoped).delete(handlers::remove_package_scoped),
        )
        .route("/:p1/:p2/-/:file", get(handlers::get_tarball_scoped))
        .route(
            "/:p1/:p2/-/:file/-rev/:rev",
            delete(handlers::remove_tarball_scoped),
        )
        .route("/:p1/:p2/:p3", get(handlers::get_three))
        .with_state(registry)
}
