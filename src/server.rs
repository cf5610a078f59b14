//! HTTP surface of the broker.
//!
//! `/_tunnel/connect` accepts tunnel sockets over WebSocket, `/_tunnel/health`
//! reports pool occupancy, and every other path is forwarded to the peer.

use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::ws::{close_code, CloseFrame, Message, WebSocket},
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{broker::TunnelBroker, protocol::RawMessage};

pub const CONNECT_PATH: &str = "/_tunnel/connect";
pub const HEALTH_PATH: &str = "/_tunnel/health";

const PING_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone)]
struct TunnelServerState {
    broker: TunnelBroker,
    api_key: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ConnectQuery {
    #[serde(rename = "socketId")]
    socket_id_camel: Option<String>,
    #[serde(rename = "socket_id")]
    socket_id_snake: Option<String>,
}

impl ConnectQuery {
    fn socket_id(&self) -> Option<String> {
        self.socket_id_camel
            .clone()
            .or_else(|| self.socket_id_snake.clone())
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

pub fn tunnel_router(broker: TunnelBroker, api_key: Option<String>) -> axum::Router {
    use axum::{middleware, routing, Router};

    let state = TunnelServerState {
        broker,
        api_key: api_key
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty()),
    };

    let protected = Router::new()
        .route(CONNECT_PATH, routing::get(tunnel_connect))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_peer_key,
        ));

    Router::new()
        .route(HEALTH_PATH, routing::get(tunnel_health))
        .merge(protected)
        .fallback(forward_request)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

async fn tunnel_health(
    axum::extract::State(state): axum::extract::State<TunnelServerState>,
) -> axum::Json<Value> {
    let stats = state.broker.stats();
    let status = if state.broker.pool().is_ready() {
        "ready"
    } else {
        "waiting"
    };

    axum::Json(json!({
        "status": status,
        "service": "tunnel-broker",
        "version": env!("CARGO_PKG_VERSION"),
        "registeredSockets": stats.registered_sockets,
        "expectedSockets": stats.expected_sockets,
        "busySockets": stats.busy_sockets,
        "queuedRequests": stats.queued_requests,
        "pendingRequests": state.broker.pending_count(),
    }))
}

async fn forward_request(
    axum::extract::State(state): axum::extract::State<TunnelServerState>,
    request: axum::http::Request<Body>,
) -> axum::response::Response {
    state.broker.handle_request(request).await
}

/// Key a connecting peer presented, from `x-api-key` or a bearer token.
fn presented_api_key(headers: &axum::http::HeaderMap) -> Option<&str> {
    let header = move |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
    };
    header("x-api-key")
        .filter(|key| !key.is_empty())
        .or_else(|| {
            header("authorization")
                .and_then(|value| value.strip_prefix("Bearer "))
                .map(str::trim)
                .filter(|key| !key.is_empty())
        })
}

/// Guards the connect route: tunnel sockets are only accepted from peers
/// holding the broker's key.
async fn require_peer_key(
    axum::extract::State(state): axum::extract::State<TunnelServerState>,
    request: axum::http::Request<Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let Some(expected) = state.api_key.as_deref() else {
        return next.run(request).await;
    };
    if presented_api_key(request.headers()) == Some(expected) {
        return next.run(request).await;
    }

    tracing::warn!(
        target = "tunnel_broker::server",
        "tunnel connect rejected: missing or invalid API key"
    );
    let body = json!({
        "error": {
            "code": "unauthorized",
            "message": "Missing or invalid API key",
            "retryable": false,
            "statusCode": 401,
        }
    });
    (axum::http::StatusCode::UNAUTHORIZED, axum::Json(body)).into_response()
}

async fn tunnel_connect(
    ws: axum::extract::WebSocketUpgrade,
    axum::extract::State(state): axum::extract::State<TunnelServerState>,
    axum::extract::Query(query): axum::extract::Query<ConnectQuery>,
) -> impl IntoResponse {
    let socket_id = query
        .socket_id()
        .unwrap_or_else(|| format!("sock_{}", Uuid::new_v4().simple()));
    ws.on_upgrade(move |socket| run_tunnel_socket(socket, state.broker, socket_id))
}

// ---------------------------------------------------------------------------
// Tunnel socket pump
// ---------------------------------------------------------------------------

/// Register an upgraded WebSocket as a tunnel socket and pump frames until
/// either side closes.
async fn run_tunnel_socket(socket: WebSocket, broker: TunnelBroker, socket_id: String) {
    let (mut write, mut read) = socket.split();
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<String>();

    if let Err(error) = broker.register_socket(&socket_id, frame_tx) {
        tracing::warn!(
            target = "tunnel_broker::server",
            socket_id = %socket_id,
            error = %error,
            "rejecting tunnel socket"
        );
        let _ = write
            .send(Message::Close(Some(CloseFrame {
                code: close_code::POLICY,
                reason: error.to_string().into(),
            })))
            .await;
        return;
    }
    tracing::info!(target = "tunnel_broker::server", socket_id = %socket_id, "tunnel socket connected");

    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    ping_interval.tick().await;
    loop {
        tokio::select! {
            outbound = frame_rx.recv() => {
                let Some(frame) = outbound else {
                    break;
                };
                if write.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            inbound = read.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        deliver(&broker, &socket_id, RawMessage::Text(text.as_str().to_string()));
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        deliver(&broker, &socket_id, RawMessage::Binary(bytes.to_vec()));
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        tracing::warn!(target = "tunnel_broker::server", socket_id = %socket_id, error = %error, "tunnel socket read error");
                        break;
                    }
                }
            }
            _ = ping_interval.tick() => {
                if write.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    broker.deregister_socket(&socket_id);
    tracing::info!(target = "tunnel_broker::server", socket_id = %socket_id, "tunnel socket disconnected");
}

fn deliver(broker: &TunnelBroker, socket_id: &str, raw: RawMessage) {
    if let Err(error) = broker.handle_socket_message(socket_id, raw) {
        tracing::warn!(
            target = "tunnel_broker::server",
            socket_id = %socket_id,
            error = %error,
            "dropping frame from tunnel socket"
        );
    }
}
