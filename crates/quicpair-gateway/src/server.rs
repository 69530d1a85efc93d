//! HTTP surface: signaling, key discovery, metrics and the `/api/chat` relay.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::serve::Listener;
use axum::{Json, Router};
use http::{header, HeaderValue, Method, StatusCode};
use inference_proxy::{BackendError, ModelSnapshot, TtftSummary};
use local_guard::AdmissionGate;
use peer_session::{spawn_peer, NegotiationError, SessionContext, TransportEngine};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub gate: AdmissionGate,
    pub engine: Arc<dyn TransportEngine>,
    pub sessions: Arc<SessionContext>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/signaling/offer", post(offer))
        .route("/noise/pubkey", get(noise_pubkey))
        .route("/noise/stats", get(noise_stats))
        .route("/metrics/ttft", get(ttft_metrics))
        .route("/models", get(models))
        .route("/api/chat", post(chat))
        .layer(middleware::from_fn_with_state(state.clone(), local_origin))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Admission
// ---------------------------------------------------------------------------

/// TCP listener that drops connections from outside the local network
/// before a single byte is read.
pub struct LocalOnlyListener {
    inner: TcpListener,
    gate: AdmissionGate,
}

impl LocalOnlyListener {
    pub fn new(inner: TcpListener, gate: AdmissionGate) -> Self {
        Self { inner, gate }
    }
}

impl Listener for LocalOnlyListener {
    type Io = TcpStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            let (stream, remote) = Listener::accept(&mut self.inner).await;
            match self.gate.admit(&remote) {
                Ok(()) => return (stream, remote),
                Err(err) => {
                    warn!(%remote, %err, "rejected non-local connection");
                    drop(stream);
                }
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.inner.local_addr()
    }
}

/// Origin check followed by the CORS headers. Preflight requests stop here
/// with 204.
async fn local_origin(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let origin = match request.headers().get(header::ORIGIN) {
        None => None,
        Some(value) => match value.to_str() {
            Ok(origin) => Some(origin),
            Err(_) => return forbidden("Forbidden: malformed origin"),
        },
    };

    if let Err(rejection) = state.gate.admit_origin(origin) {
        warn!(?origin, %rejection, "origin rejected");
        return forbidden("Forbidden: non-local origin");
    }

    let mut response = if request.method() == Method::OPTIONS {
        StatusCode::NO_CONTENT.into_response()
    } else {
        next.run(request).await
    };

    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("content-type"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    response
}

fn forbidden(message: &'static str) -> Response {
    (StatusCode::FORBIDDEN, message).into_response()
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    Negotiation(NegotiationError),
    Backend(BackendError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            Self::Negotiation(err) => (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
            Self::Backend(err) => {
                let status = match err {
                    BackendError::Unavailable(_) | BackendError::Client(_) => {
                        StatusCode::SERVICE_UNAVAILABLE
                    }
                    _ => StatusCode::BAD_GATEWAY,
                };
                (status, err.to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize, Serialize)]
struct SessionDescription {
    sdp: String,
}

async fn offer(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<SessionDescription>, ApiError> {
    let offer: SessionDescription =
        serde_json::from_slice(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let negotiated = state
        .engine
        .accept_offer(&offer.sdp)
        .await
        .map_err(|err| {
            warn!(%err, "offer negotiation failed");
            ApiError::Negotiation(err)
        })?;

    let (peer_id, _task) = spawn_peer(
        Arc::clone(&state.sessions),
        negotiated.channel,
        negotiated.events,
    );
    info!(peer_id = %peer_id, "offer answered");

    Ok(Json(SessionDescription {
        sdp: negotiated.answer_sdp,
    }))
}

async fn noise_pubkey(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "public_key": state.sessions.secure.public_key_base64() }))
}

#[derive(Debug, Serialize)]
struct NoiseStats {
    active_sessions: usize,
    active_peers: usize,
    plaintext_mode: bool,
    public_key: String,
}

async fn noise_stats(State(state): State<AppState>) -> Json<NoiseStats> {
    let stats = state.sessions.secure.stats();
    Json(NoiseStats {
        active_sessions: stats.active_sessions,
        active_peers: state.sessions.registry.len(),
        plaintext_mode: stats.plaintext_mode,
        public_key: stats.public_key,
    })
}

async fn ttft_metrics(State(state): State<AppState>) -> Json<TtftSummary> {
    Json(state.sessions.proxy.metrics().summary())
}

async fn models(State(state): State<AppState>) -> Json<Vec<ModelSnapshot>> {
    Json(state.sessions.proxy.models().snapshot())
}

async fn chat(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    let body: Map<String, Value> = serde_json::from_slice(&body)
        .map_err(|_| ApiError::BadRequest("Invalid request body".into()))?;

    let lines = state
        .sessions
        .proxy
        .relay_http(body)
        .await
        .map_err(ApiError::Backend)?;

    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(lines),
    )
        .into_response())
}
