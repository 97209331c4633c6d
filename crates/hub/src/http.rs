//! HTTP surface of the hub
//!
//! Read-only: every mutating path is confined to the scheduler. The
//! listing reflects the committed state document; archive downloads
//! stream from the cache with single-range support, and each open
//! archive is pinned in the reader registry so retention cannot pull
//! it out from under a slow download.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::Path;
use axum::http::header::{self, HeaderMap, HeaderValue};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Extension, Json, Router};
use chrono::Local;
use futures_util::Stream;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use hubsync_core::config::is_url_safe_name;
use hubsync_core::state::StateStore;
use hubsync_core::wire::{DatasetListing, DatasetSummary};

use crate::readers::{ReaderGuard, ReaderRegistry};

const STREAM_BUFFER: usize = 64 * 1024;

/// Dependencies injected into every handler
pub struct ApiContext {
    pub store: Arc<StateStore>,
    pub readers: Arc<ReaderRegistry>,
    /// Dataset names in registry (configuration) order
    pub dataset_names: Vec<String>,
}

/// Assemble the hub router
#[must_use]
pub fn router(ctx: Arc<ApiContext>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/datasets", get(list_datasets))
        .route("/package/:file", get(download_package))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods([Method::GET]),
        )
        .layer(Extension(ctx))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn list_datasets(Extension(ctx): Extension<Arc<ApiContext>>) -> Json<DatasetListing> {
    let states = ctx.store.get_all();

    let datasets = ctx
        .dataset_names
        .iter()
        .map(|name| {
            let state = states.get(name).cloned().unwrap_or_default();
            DatasetSummary {
                name: name.clone(),
                last_updated: state.last_updated,
                file_count: state.file_count,
                total_size: state.total_size,
                package_ready: state.package_ready,
                package_size: state.package_size,
            }
        })
        .collect();

    Json(DatasetListing {
        generated_at: Local::now().fixed_offset(),
        datasets,
    })
}

async fn download_package(
    Path(file): Path<String>,
    headers: HeaderMap,
    Extension(ctx): Extension<Arc<ApiContext>>,
) -> Response {
    let Some(name) = file.strip_suffix(".zip") else {
        return error_json(StatusCode::BAD_REQUEST, "package path must end in .zip");
    };
    if !is_url_safe_name(name) {
        return error_json(StatusCode::BAD_REQUEST, "invalid dataset name");
    }

    let Some(state) = ctx.store.get(name) else {
        return error_json(StatusCode::NOT_FOUND, "unknown dataset");
    };
    let Some(package_path) = state.package_path.filter(|_| state.package_ready) else {
        return error_json(StatusCode::NOT_FOUND, "package not ready");
    };

    // Pin the archive before opening so retention defers deletion for
    // the whole stream
    let guard = ctx.readers.open(package_path.clone());

    let mut archive = match tokio::fs::File::open(&package_path).await {
        Ok(file) => file,
        Err(e) => {
            warn!("cannot open {}: {e}", package_path.display());
            return error_json(StatusCode::NOT_FOUND, "package not available");
        }
    };
    let total = match archive.metadata().await {
        Ok(m) => m.len(),
        Err(e) => {
            warn!("cannot stat {}: {e}", package_path.display());
            return error_json(StatusCode::NOT_FOUND, "package not available");
        }
    };

    let range = match headers.get(header::RANGE) {
        None => None,
        Some(value) => {
            let parsed = value
                .to_str()
                .ok()
                .and_then(|raw| parse_range(raw, total));
            match parsed {
                Some(range) => Some(range),
                None => return range_not_satisfiable(total),
            }
        }
    };

    let (status, start, end) = match range {
        Some((start, end)) => (StatusCode::PARTIAL_CONTENT, start, end),
        None => (StatusCode::OK, 0, total.saturating_sub(1)),
    };
    let content_length = if total == 0 { 0 } else { end - start + 1 };

    if start > 0 {
        if let Err(e) = archive.seek(SeekFrom::Start(start)).await {
            warn!("seek failed on {}: {e}", package_path.display());
            return error_json(StatusCode::NOT_FOUND, "package not available");
        }
    }

    let stream = GuardedStream {
        inner: ReaderStream::with_capacity(archive.take(content_length), STREAM_BUFFER),
        _guard: guard,
    };

    let mut response = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/zip")
        .header(header::CONTENT_LENGTH, content_length)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(
            header::CONTENT_DISPOSITION,
            attachment_header(&package_path),
        );
    if status == StatusCode::PARTIAL_CONTENT {
        response = response.header(
            header::CONTENT_RANGE,
            format!("bytes {start}-{end}/{total}"),
        );
    }

    response
        .body(Body::from_stream(stream))
        .unwrap_or_else(|e| {
            warn!("failed to build package response: {e}");
            error_json(StatusCode::NOT_FOUND, "package not available")
        })
}

/// Parse a single `bytes=start[-end]` range against `total`
///
/// Multi-range requests, suffix ranges and anything unparsable return
/// `None`, which the handler answers with 416. An omitted or oversized
/// `end` clamps to `total - 1`.
fn parse_range(raw: &str, total: u64) -> Option<(u64, u64)> {
    let rest = raw.strip_prefix("bytes=")?;
    if rest.contains(',') {
        return None;
    }

    let (start, end) = rest.split_once('-')?;
    let start: u64 = start.parse().ok()?;
    let end: u64 = match end {
        "" => total.checked_sub(1)?,
        explicit => explicit.parse().ok()?,
    };
    let end = end.min(total.checked_sub(1)?);

    (start <= end && start < total).then_some((start, end))
}

fn range_not_satisfiable(total: u64) -> Response {
    let mut response = error_json(StatusCode::RANGE_NOT_SATISFIABLE, "range not satisfiable");
    if let Ok(value) = HeaderValue::from_str(&format!("bytes */{total}")) {
        let _ = response.headers_mut().insert(header::CONTENT_RANGE, value);
    }
    response
}

fn error_json(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

fn attachment_header(path: &PathBuf) -> String {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("package.zip");
    format!("attachment; filename=\"{name}\"")
}

/// Response body stream that keeps its archive's reader pin alive
struct GuardedStream<S> {
    inner: S,
    _guard: ReaderGuard,
}

impl<S: Stream + Unpin> Stream for GuardedStream<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range_forms() {
        // Plain start-end
        assert_eq!(parse_range("bytes=0-99", 1000), Some((0, 99)));
        // Open end runs to the last byte
        assert_eq!(parse_range("bytes=500-", 1000), Some((500, 999)));
        // Single byte
        assert_eq!(parse_range("bytes=0-0", 1000), Some((0, 0)));
        // Oversized end clamps
        assert_eq!(parse_range("bytes=0-99999", 1000), Some((0, 999)));
    }

    #[test]
    fn test_parse_range_rejections() {
        // Start at or past the end of file
        assert_eq!(parse_range("bytes=1000-", 1000), None);
        assert_eq!(parse_range("bytes=2000-2100", 1000), None);
        // Inverted
        assert_eq!(parse_range("bytes=5-2", 1000), None);
        // Multi-range
        assert_eq!(parse_range("bytes=0-1,5-6", 1000), None);
        // Suffix form is not supported
        assert_eq!(parse_range("bytes=-500", 1000), None);
        // Garbage
        assert_eq!(parse_range("bytes=abc", 1000), None);
        assert_eq!(parse_range("items=0-1", 1000), None);
        // Empty file satisfies nothing
        assert_eq!(parse_range("bytes=0-", 0), None);
    }
}
