//! HTTP request handlers
//!
//! One stream endpoint per channel selects the packaging through the
//! `format`, `seg` and `init` query parameters, plus health, version and
//! debug endpoints.

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use serde::Deserialize;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;

use crate::client::detect_capabilities;
use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::processor::{ClientRecord, FormatProcessor, MpegtsProcessor};
use crate::routing::{decide, validate_and_fix, RouteDecision};
use crate::session::SessionManager;

const CACHE_IMMUTABLE: &str = "public, max-age=31536000";
const CACHE_NONE: &str = "no-cache, no-store, must-revalidate";

/// Application state shared across all handlers
pub struct AppState {
    pub config: RelayConfig,
    pub manager: Arc<SessionManager>,
}

/// Query parameters of the stream endpoint
#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub format: Option<String>,
    pub seg: Option<u64>,
    pub init: Option<String>,
    /// Ad-hoc upstream override for channels not in the config
    pub url: Option<String>,
}

/// HTTP error type
#[derive(Debug)]
pub enum HttpError {
    NotFound(String),
    NotReady(String),
    Overloaded(String),
    BadGateway(String),
    BadRequest(String),
    InternalError(String),
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            HttpError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            HttpError::NotReady(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            HttpError::Overloaded(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            HttpError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
            HttpError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            HttpError::InternalError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, body).into_response()
    }
}

impl From<RelayError> for HttpError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::SegmentNotFound { .. }
            | RelayError::ChannelNotFound(_)
            | RelayError::SessionNotFound(_) => HttpError::NotFound(err.to_string()),
            RelayError::InitSegmentNotReady | RelayError::NoSegments | RelayError::Stopping => {
                HttpError::NotReady(err.to_string())
            }
            RelayError::MaxSessions => HttpError::Overloaded("maximum sessions reached".to_string()),
            RelayError::UpstreamFailed(_)
            | RelayError::UpstreamUnparseable(_)
            | RelayError::CircuitOpen(_)
            | RelayError::SourceUnresolved(_) => HttpError::BadGateway(err.to_string()),
            RelayError::UnsupportedOperation(_) => HttpError::BadRequest(err.to_string()),
            other => HttpError::InternalError(other.to_string()),
        }
    }
}

/// Health check endpoint
pub async fn health_check() -> &'static str {
    "OK"
}

/// Version endpoint
pub async fn version_check() -> &'static str {
    concat!("tvarr-relay v", env!("CARGO_PKG_VERSION"))
}

/// Debug endpoint - active sessions
pub async fn debug_sessions(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(state.manager.debug_json())
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn remote_addr(headers: &HeaderMap) -> String {
    header_str(headers, "x-forwarded-for")
        .map(|s| s.split(',').next().unwrap_or(s).trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn text_response(content_type: &'static str, cache: &'static str, body: String) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(cache));
    (headers, body).into_response()
}

fn bytes_response(content_type: &'static str, cache: &'static str, body: Bytes) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(cache));
    (headers, body).into_response()
}

/// Continuous stream body that unregisters its client when dropped, so a
/// disconnect removes the client even when no data is flowing.
struct ClientStream {
    rx: ReceiverStream<Bytes>,
    processor: Arc<MpegtsProcessor>,
    client_id: String,
}

impl Stream for ClientStream {
    type Item = Result<Bytes, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx).poll_next(cx).map(|item| item.map(Ok))
    }
}

impl Drop for ClientStream {
    fn drop(&mut self) {
        self.processor.unregister_client(&self.client_id);
    }
}

/// Stream endpoint
/// GET /channels/{id}/stream?format=..&seg=N&init=1
pub async fn stream_handler(
    State(state): State<Arc<AppState>>,
    Path(channel_id): Path<String>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<Response, HttpError> {
    let channel = state.config.channels.get(&channel_id);
    let url = channel
        .map(|c| c.url.clone())
        .or_else(|| query.url.clone())
        .ok_or_else(|| HttpError::NotFound(format!("channel not configured: {}", channel_id)))?;
    let profile = state.config.profile_for(&channel_id);

    let session = state
        .manager
        .get_or_create_session(&channel_id, &url, profile.clone())
        .await?;

    let caps = detect_capabilities(
        query.format.as_deref(),
        header_str(&headers, "x-tvarr-player"),
        header_str(&headers, "accept"),
        header_str(&headers, "user-agent"),
    );
    let classification = session.classification().clone();
    let decision = validate_and_fix(decide(
        classification.format,
        &classification.codecs,
        &caps,
        &profile,
    ));
    let processor = session.processor_for(&decision).await?;

    let client_id = uuid::Uuid::new_v4().to_string();
    let user_agent = header_str(&headers, "user-agent").unwrap_or("").to_string();
    let record = ClientRecord::new(
        &client_id,
        &remote_addr(&headers),
        &user_agent,
        decision.client_format,
    );

    serve(processor, record, &decision, &query, &headers).await
}

async fn serve(
    processor: FormatProcessor,
    record: ClientRecord,
    decision: &RouteDecision,
    query: &StreamQuery,
    headers: &HeaderMap,
) -> Result<Response, HttpError> {
    let wants_init = query.init.as_deref().is_some_and(|v| v != "0");
    let result = match &processor {
        FormatProcessor::Mpegts(p) => {
            if query.seg.is_some() {
                return Err(HttpError::from(RelayError::UnsupportedOperation(
                    "the continuous MPEG-TS stream has no segments",
                )));
            }
            let (client, rx) = p.register_client(record)?;
            let stream = ClientStream {
                rx: ReceiverStream::new(rx),
                processor: p.clone(),
                client_id: client.client_id.clone(),
            };
            let mut response = Response::new(Body::from_stream(stream));
            response
                .headers_mut()
                .insert(header::CONTENT_TYPE, HeaderValue::from_static("video/mp2t"));
            response
                .headers_mut()
                .insert(header::CACHE_CONTROL, HeaderValue::from_static(CACHE_NONE));
            Ok(response)
        }
        FormatProcessor::HlsTs(p) => {
            let client = p.register_client(record)?;
            let result = match query.seg {
                Some(sequence) => p.segment(sequence).map(|segment| {
                    p.add_bytes_served(segment.data.len() as u64);
                    client.add_bytes(segment.data.len() as u64);
                    bytes_response("video/mp2t", CACHE_IMMUTABLE, segment.data.clone())
                }),
                None => p.playlist().await.map(|playlist| {
                    client.add_bytes(playlist.len() as u64);
                    text_response("application/vnd.apple.mpegurl", CACHE_NONE, playlist)
                }),
            };
            p.unregister_client(&client.client_id);
            result.map_err(HttpError::from)
        }
        FormatProcessor::HlsFmp4(p) => {
            let client = p.register_client(record)?;
            let result = if wants_init {
                serve_init(p.init_segment(), headers)
            } else {
                match query.seg {
                    Some(sequence) => p
                        .segment(sequence)
                        .map(|segment| {
                            p.add_bytes_served(segment.data.len() as u64);
                            client.add_bytes(segment.data.len() as u64);
                            bytes_response("video/mp4", CACHE_IMMUTABLE, segment.data.clone())
                        })
                        .map_err(HttpError::from),
                    None => p
                        .playlist()
                        .await
                        .map(|playlist| {
                            client.add_bytes(playlist.len() as u64);
                            text_response("application/vnd.apple.mpegurl", CACHE_NONE, playlist)
                        })
                        .map_err(HttpError::from),
                }
            };
            p.unregister_client(&client.client_id);
            result
        }
        FormatProcessor::Dash(p) => {
            let client = p.register_client(record)?;
            let result = if wants_init {
                serve_init(p.init_segment(), headers)
            } else {
                match query.seg {
                    Some(sequence) => p
                        .segment(sequence)
                        .map(|segment| {
                            p.add_bytes_served(segment.data.len() as u64);
                            client.add_bytes(segment.data.len() as u64);
                            bytes_response("video/mp4", CACHE_IMMUTABLE, segment.data.clone())
                        })
                        .map_err(HttpError::from),
                    None => p
                        .manifest()
                        .await
                        .map(|manifest| {
                            client.add_bytes(manifest.len() as u64);
                            text_response("application/dash+xml", CACHE_NONE, manifest)
                        })
                        .map_err(HttpError::from),
                }
            };
            p.unregister_client(&client.client_id);
            result
        }
    };
    if let Err(e) = &result {
        tracing::debug!(
            format = decision.client_format.as_str(),
            error = ?e,
            "stream request failed"
        );
    }
    result
}

/// init.mp4 with a content-addressed ETag and 304 support.
fn serve_init(
    init: crate::error::Result<Arc<crate::mux::InitSegment>>,
    headers: &HeaderMap,
) -> Result<Response, HttpError> {
    let init = init?;
    let etag = format!("\"{}\"", init.etag);
    if header_str(headers, "if-none-match") == Some(etag.as_str()) {
        return Ok(StatusCode::NOT_MODIFIED.into_response());
    }
    let mut response = bytes_response("video/mp4", CACHE_IMMUTABLE, init.data.clone());
    response.headers_mut().insert(
        header::ETAG,
        HeaderValue::from_str(&etag).map_err(|e| HttpError::InternalError(e.to_string()))?,
    );
    Ok(response)
}
