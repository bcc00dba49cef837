// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, put},
    Router,
};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::{DefaultOnFailure, DefaultOnResponse, TraceLayer};
use tracing::{info, instrument, warn};

use castcore::auth::{AuthOutcome, AuthRequest, Authenticator};
use castcore::format::FormatType;
use castcore::listener::{CodecAdapter, IcyState, Listener, ListenerSink};
use castcore::registry::{MountRegistry, MAX_FALLBACK_DEPTH};
use castcore::source::Source;
use castcore::stats::StatsSink;

use crate::config::Config;

/// Bounded depth of one listener's write channel. A listener that cannot
/// keep up blocks on `try_send` returning `WouldBlock`, which the core's
/// listener loop treats the same as any other non-blocking write stall.
const LISTENER_CHANNEL_CAPACITY: usize = 64;

/// Non-blocking sink backed by a bounded mpsc channel; the receiving half
/// drives the axum response body stream.
struct ChannelSink(mpsc::Sender<Bytes>);

impl ListenerSink for ChannelSink {
    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.0.try_send(Bytes::copy_from_slice(buf)) {
            Ok(()) => Ok(buf.len()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                Err(io::Error::new(io::ErrorKind::WouldBlock, "listener channel full"))
            },
            Err(mpsc::error::TrySendError::Closed(_)) => {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "listener disconnected"))
            },
        }
    }
}

type ListenerSinkImpl = ChannelSink;

/// Adapts an inbound request body into the core's non-blocking,
/// timeout-bounded [`ProducerRead`](castcore::source::ProducerRead).
struct BodyProducer {
    stream: Pin<Box<dyn Stream<Item = Result<Bytes, axum::Error>> + Send>>,
    leftover: Option<Bytes>,
}

impl BodyProducer {
    fn new(body: Body) -> Self {
        Self { stream: Box::pin(body.into_data_stream()), leftover: None }
    }

    fn copy_into(&mut self, buf: &mut [u8], chunk: Bytes) -> usize {
        let n = chunk.len().min(buf.len());
        buf[..n].copy_from_slice(&chunk[..n]);
        if n < chunk.len() {
            self.leftover = Some(chunk.slice(n..));
        }
        n
    }
}

#[async_trait]
impl castcore::source::ProducerRead for BodyProducer {
    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        if let Some(chunk) = self.leftover.take() {
            return Ok(self.copy_into(buf, chunk));
        }
        match tokio::time::timeout(timeout, self.stream.next()).await {
            Ok(Some(Ok(chunk))) => Ok(self.copy_into(buf, chunk)),
            Ok(Some(Err(e))) => Err(io::Error::other(e)),
            Ok(None) => Ok(0),
            Err(_) => Err(io::Error::new(io::ErrorKind::WouldBlock, "producer poll timeout")),
        }
    }
}

/// Wraps the HTTP headers of one request so the authentication hook sees an
/// opaque, core-agnostic view of it.
struct HeaderAuthRequest<'a>(&'a HeaderMap);

impl AuthRequest for HeaderAuthRequest<'_> {
    fn header(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(|v| v.to_str().ok())
    }
}

pub struct AppState {
    pub config: Config,
    pub registry: Arc<MountRegistry<ListenerSinkImpl>>,
    pub stats: Arc<dyn StatsSink>,
    pub auth: Arc<dyn Authenticator>,
    next_listener_id: AtomicU64,
}

impl AppState {
    #[must_use]
    pub fn new(
        config: Config,
        stats: Arc<dyn StatsSink>,
        auth: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            config,
            registry: Arc::new(MountRegistry::new()),
            stats,
            auth,
            next_listener_id: AtomicU64::new(1),
        }
    }

    fn next_listener_id(&self) -> u64 {
        self.next_listener_id.fetch_add(1, Ordering::Relaxed)
    }
}

const fn egress_content_type(format_type: FormatType) -> &'static str {
    match format_type {
        FormatType::Ogg => "application/ogg",
        FormatType::Mp3 => "audio/mpeg",
        FormatType::Aac => "audio/aac",
        FormatType::Webm => "video/webm",
        FormatType::MpegTs => "video/mp2t",
        FormatType::Text => "text/plain",
        FormatType::Flv => "video/x-flv",
    }
}

async fn health_handler() -> impl IntoResponse {
    StatusCode::OK
}

/// Legacy `SOURCE` producer connections are not a method axum's router can
/// filter on directly (it only recognizes the standard HTTP method set), so
/// it is rewritten to `PUT` here, ahead of routing. `PUT` producers pass
/// through unchanged.
async fn normalize_source_method(mut req: axum::http::Request<Body>, next: Next) -> Response {
    if req.method().as_str().eq_ignore_ascii_case("SOURCE") {
        *req.method_mut() = Method::PUT;
    }
    next.run(req).await
}

/// Producer-side ingestion: `PUT`/`SOURCE` on a mount path, body is the raw
/// encoded stream. The response is only sent once the producer disconnects
/// or times out; for as long as the connection is open, this task *is* the
/// owning source task described in the concurrency model.
#[instrument(skip(state, headers, body, mount), fields(mount = %mount))]
async fn handle_producer(
    State(state): State<Arc<AppState>>,
    Path(mount): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let mount_path = format!("/{mount}");
    let auth_request = HeaderAuthRequest(&headers);
    if !matches!(state.auth.authenticate(&mount_path, &auth_request), AuthOutcome::Ok) {
        return StatusCode::FORBIDDEN.into_response();
    }

    let Some(content_type) = headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok())
    else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let Some(format_type) = FormatType::from_content_type(content_type) else {
        return StatusCode::UNSUPPORTED_MEDIA_TYPE.into_response();
    };

    if state.registry.iter().len() as u32 >= state.config.server.max_sources {
        warn!(mount = %mount_path, "refusing source: max_sources reached");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let mount_config = state
        .config
        .mounts
        .get(&mount_path)
        .cloned()
        .unwrap_or_else(|| state.config.default_mount.clone());
    let runtime_config = mount_config.to_runtime(&state.config.framer);

    let handle = match state.registry.reserve(&mount_path, format_type, runtime_config) {
        Ok(handle) => handle,
        Err(e) => {
            warn!(mount = %mount_path, error = %e, "source reservation refused");
            return StatusCode::FORBIDDEN.into_response();
        },
    };

    info!(mount = %mount_path, format = %format_type, "producer connected");
    state.stats.publish(&mount_path, "content-type", content_type);
    state.stats.publish(&mount_path, "connected", "1");

    let override_reclaim = state.registry.apply_fallback_override(&handle);
    if override_reclaim > 0 {
        info!(mount = %mount_path, reclaimed = override_reclaim, "reclaimed listeners via fallback override");
    }

    let source = Source::new(handle);
    let producer = BodyProducer::new(body);
    source.run(producer, state.registry.clone(), state.stats.clone()).await;

    StatusCode::OK.into_response()
}

/// Resolves the mount a new listener should actually attach to:
/// `fallback_when_full` is checked at admission time rather than per
/// iteration, so a listener never attaches only to be migrated away on the
/// next scheduler pass. Bounded by [`MAX_FALLBACK_DEPTH`] to match the
/// fallback-chain resolution used elsewhere.
fn resolve_admission_target(
    state: &AppState,
    mut handle: Arc<castcore::source::SourceHandle<ListenerSinkImpl>>,
) -> Option<Arc<castcore::source::SourceHandle<ListenerSinkImpl>>> {
    for _ in 0..MAX_FALLBACK_DEPTH {
        let (full, fallback_when_full, fallback_mount) = {
            #[allow(clippy::unwrap_used)]
            let shared = handle.shared.lock().unwrap();
            let full = shared.config.max_listeners.is_some_and(|max| shared.listener_count >= max);
            (full, shared.config.fallback_when_full, shared.config.fallback_mount.clone())
        };
        if !full {
            return Some(handle);
        }
        if !fallback_when_full {
            return None;
        }
        let next = state.registry.find_with_fallback(&fallback_mount?)?;
        if Arc::ptr_eq(&next, &handle) {
            return None;
        }
        handle = next;
    }
    None
}

/// Listener-side egress: `GET` on a mount path. Responds `200 OK` with
/// codec-appropriate headers and streams the body from the source's queue,
/// interleaving ICY metadata for MP3 listeners that request it.
#[instrument(skip(state, headers, mount), fields(mount = %mount))]
async fn handle_listener(
    State(state): State<Arc<AppState>>,
    Path(mount): Path<String>,
    headers: HeaderMap,
) -> Response {
    let mount_path = format!("/{mount}");
    let auth_request = HeaderAuthRequest(&headers);
    if !matches!(state.auth.authenticate(&mount_path, &auth_request), AuthOutcome::Ok) {
        return StatusCode::FORBIDDEN.into_response();
    }

    let Some(handle) = state.registry.find_with_fallback(&mount_path) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let Some(handle) = resolve_admission_target(&state, handle) else {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    let total_listeners: u32 =
        state.registry.iter().into_iter().map(|h| h.listener_count()).sum();
    if total_listeners >= state.config.server.max_clients {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let wants_icy_meta =
        headers.get("icy-metadata").and_then(|v| v.to_str().ok()) == Some("1");
    let is_icy = wants_icy_meta && handle.format_type == FormatType::Mp3;
    let adapter = if is_icy {
        CodecAdapter::Mp3Icy(IcyState::new(state.config.framer.icy_metaint))
    } else {
        CodecAdapter::Passthrough
    };

    let (tx, rx) = mpsc::channel::<Bytes>(LISTENER_CHANNEL_CAPACITY);
    let listener = Listener::new(state.next_listener_id(), ChannelSink(tx), adapter);
    if !handle.admit(listener) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let body = Body::from_stream(ReceiverStream::new(rx).map(Ok::<Bytes, io::Error>));

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, egress_content_type(handle.format_type));
    if is_icy {
        response = response.header("icy-metaint", state.config.framer.icy_metaint.to_string());
    }
    #[allow(clippy::unwrap_used)]
    response.body(body).unwrap().into_response()
}

#[must_use]
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/{mount}", put(handle_producer).get(handle_listener))
        .layer(middleware::from_fn(normalize_source_method))
        .layer(
            TraceLayer::new_for_http()
                .on_response(DefaultOnResponse::new().level(tracing::Level::DEBUG))
                .on_failure(DefaultOnFailure::new().level(tracing::Level::WARN)),
        )
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        #[allow(clippy::expect_used)]
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[allow(clippy::expect_used)]
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received CTRL-C, shutting down"),
        () = terminate => info!("received SIGTERM, shutting down"),
    }
}

/// Starts the HTTP server: binds `server.listen_address` and serves the
/// producer-ingestion/listener-egress router until a shutdown signal.
///
/// # Errors
///
/// Returns an error if the configured address cannot be parsed or bound.
pub async fn start_server(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = config.server.listen_address.parse()?;

    let stats: Arc<dyn StatsSink> = if config.telemetry.enable {
        Arc::new(crate::telemetry::CoreMetrics::new())
    } else {
        Arc::new(castcore::stats::NullStatsSink)
    };
    let state =
        Arc::new(AppState::new(config.clone(), stats, Arc::new(castcore::auth::AllowAll)));
    let router = build_router(state);

    info!(address = %addr, "starting castd server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
