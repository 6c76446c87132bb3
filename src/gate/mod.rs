//! Token-addressed artifact retrieval behind the confinement check.
//!
//! Callers hold opaque tokens, never paths. The gate resolves a token
//! through the registry and serves the bytes only when the resolved path —
//! lexically and after symlink resolution — lies under the managed temp
//! directory. Every failure is a status code; a hostile token can never
//! take the host down.

use std::path::Path;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio::fs;
use tracing::{debug, error, warn};

use crate::core::CompressionOptions;
use crate::registry::FileRegistry;
use crate::service::CompressorService;

/// Outcome of a token lookup, independent of the HTTP layer.
#[derive(Debug)]
pub enum FetchResult {
    /// No usable token in the request
    BadRequest,
    /// Unknown token or missing backing file
    NotFound,
    /// Token resolved to a path outside the managed temp directory
    Denied,
    /// Artifact bytes plus the content type inferred from its extension
    File {
        bytes: Vec<u8>,
        content_type: &'static str,
    },
}

/// Resolves `token` and reads its artifact, enforcing confinement.
pub async fn fetch(registry: &FileRegistry, token: Option<&str>) -> FetchResult {
    let Some(token) = token.map(str::trim).filter(|t| !t.is_empty()) else {
        return FetchResult::BadRequest;
    };

    let Some(artifact) = registry.resolve(token).await else {
        debug!("unknown token: {}", token);
        return FetchResult::NotFound;
    };

    // lexical check first so nothing outside the root is even touched
    if !artifact.path.starts_with(registry.root()) {
        warn!(
            "denied token {} resolving outside temp directory: {}",
            token,
            artifact.path.display()
        );
        return FetchResult::Denied;
    }

    // re-check after resolving symlinks; a missing file fails here
    let canonical = match fs::canonicalize(&artifact.path).await {
        Ok(path) => path,
        Err(e) => {
            debug!("artifact file missing for token {}: {}", token, e);
            return FetchResult::NotFound;
        }
    };
    if !canonical.starts_with(registry.root()) {
        warn!(
            "denied token {} escaping temp directory via link: {}",
            token,
            canonical.display()
        );
        return FetchResult::Denied;
    }

    match fs::read(&canonical).await {
        Ok(bytes) => FetchResult::File {
            bytes,
            content_type: content_type_for(&artifact.path),
        },
        Err(e) => {
            warn!("failed to read artifact for token {}: {}", token, e);
            FetchResult::NotFound
        }
    }
}

/// Content type for an artifact path, by extension.
pub fn content_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase());
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        Some("avif") => "image/avif",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

#[derive(Debug, Deserialize)]
struct FetchParams {
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompressParams {
    filename: Option<String>,
    quality: Option<f32>,
    max_width: Option<u32>,
    max_height: Option<u32>,
    preserve_exif: Option<bool>,
}

/// HTTP surface for service mode: artifact retrieval plus job submission.
pub fn router(service: Arc<CompressorService>) -> Router {
    Router::new()
        .route("/image", get(fetch_image))
        .route("/compress", post(compress_image))
        .with_state(service)
}

async fn fetch_image(
    State(service): State<Arc<CompressorService>>,
    Query(params): Query<FetchParams>,
) -> Response {
    match fetch(service.registry(), params.id.as_deref()).await {
        FetchResult::BadRequest => {
            (StatusCode::BAD_REQUEST, "Missing id parameter").into_response()
        }
        FetchResult::NotFound => (StatusCode::NOT_FOUND, "File not found").into_response(),
        FetchResult::Denied => (StatusCode::FORBIDDEN, "Access denied").into_response(),
        FetchResult::File {
            bytes,
            content_type,
        } => ([(header::CONTENT_TYPE, content_type)], bytes).into_response(),
    }
}

async fn compress_image(
    State(service): State<Arc<CompressorService>>,
    Query(params): Query<CompressParams>,
    body: Bytes,
) -> Response {
    let Some(filename) = params.filename.filter(|f| !f.is_empty()) else {
        return (StatusCode::BAD_REQUEST, "Missing filename parameter").into_response();
    };
    if body.is_empty() {
        return (StatusCode::BAD_REQUEST, "Empty image payload").into_response();
    }

    let options = CompressionOptions {
        quality: params.quality,
        max_width: params.max_width,
        max_height: params.max_height,
        preserve_exif: params.preserve_exif.unwrap_or(false),
    };
    match service.compress(body.to_vec(), filename, options).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => {
            error!("compression request failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}
