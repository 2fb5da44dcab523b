//! Video streaming route.

use crate::probe::ProbeError;
use crate::streaming::{SessionError, StreamContent, StreamSession};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::Response,
    routing::get,
    Router,
};
use std::path::{Component, PathBuf};

use crate::server::AppContext;

pub fn video_routes() -> Router<AppContext> {
    Router::new().route("/:share/*path", get(stream_video))
}

/// Serve one file from a share, transcoding when the device needs it.
async fn stream_video(
    State(ctx): State<AppContext>,
    Path((share, rel_path)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, StatusCode> {
    let root = ctx
        .config
        .shares
        .iter()
        .find(|s| s.name == share)
        .map(|s| s.path.clone())
        .ok_or(StatusCode::NOT_FOUND)?;

    let full_path = resolve_share_path(&root, &rel_path).ok_or(StatusCode::NOT_FOUND)?;

    let range = headers.get(header::RANGE).and_then(|h| h.to_str().ok());

    let session = StreamSession::begin(&ctx.registry, full_path, range)
        .map_err(|e| error_status(&e))?;

    let content = session
        .stream(&ctx.prober, &ctx.config.device, &ctx.encoder)
        .await
        .map_err(|e| error_status(&e))?;

    build_response(content)
}

/// Join a request path onto the share root, rejecting traversal.
fn resolve_share_path(root: &std::path::Path, rel: &str) -> Option<PathBuf> {
    let rel = rel.trim_start_matches('/');
    if rel.is_empty() {
        return None;
    }
    let rel_path = std::path::Path::new(rel);
    if rel_path
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return None;
    }
    Some(root.join(rel_path))
}

fn build_response(content: StreamContent) -> Result<Response, StatusCode> {
    let mut builder = match content.range {
        Some((start, end, total)) => Response::builder()
            .status(StatusCode::PARTIAL_CONTENT)
            .header(
                header::CONTENT_RANGE,
                format!("bytes {}-{}/{}", start, end, total),
            ),
        None => Response::builder().status(StatusCode::OK),
    };

    builder = builder.header(header::CONTENT_TYPE, content.content_type);

    // Ranges are only honorable against a source of known length
    if let Some(length) = content.content_length {
        builder = builder
            .header(header::CONTENT_LENGTH, length.to_string())
            .header(header::ACCEPT_RANGES, "bytes");
    }

    builder
        .body(Body::from_stream(content.stream))
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

/// Map pre-stream session errors to a clean error response. Errors after
/// streaming begins terminate the body instead; nothing can be injected
/// into a started stream.
fn error_status(err: &SessionError) -> StatusCode {
    match err {
        SessionError::ConcurrencyLimitExceeded => StatusCode::SERVICE_UNAVAILABLE,
        SessionError::RangeUnsatisfiable => StatusCode::RANGE_NOT_SATISFIABLE,
        SessionError::Probe(ProbeError::Unreadable { .. }) => StatusCode::NOT_FOUND,
        SessionError::Probe(ProbeError::UnrecognizedFormat { .. }) => {
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        }
        SessionError::Encoder(_) => StatusCode::BAD_GATEWAY,
        SessionError::ClientDisconnected => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
