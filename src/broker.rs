//! Request router: one inbound HTTP request becomes one tunneled round trip.
//!
//! Replies carry no request id. The socket a reply arrives on identifies the
//! request through the pool's active assignment, which only works because a
//! socket never has more than one request in flight.

use std::{collections::HashMap, sync::Arc, time::Duration};

use axum::{body::Body, http::Request, response::Response};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::{
    error::{Result, TunnelError},
    events::EventEmitter,
    http::{build_response, error_response, read_request},
    pool::{PoolStats, RemovedSocket, RequestId, SocketPool, SocketSender},
    protocol::{decode_response, encode_request, RawMessage, TunneledRequest, TunneledResponse},
};

pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    pub expected_sockets: usize,
    /// Deadline for a whole round trip, queueing included. `None` waits
    /// forever.
    pub forward_timeout: Option<Duration>,
    pub max_body_bytes: usize,
}

impl BrokerSettings {
    pub fn new(expected_sockets: usize) -> Self {
        Self {
            expected_sockets,
            forward_timeout: None,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

type ReplySender = oneshot::Sender<Result<TunneledResponse>>;

struct BrokerInner {
    settings: BrokerSettings,
    pool: SocketPool,
    pending: Mutex<HashMap<RequestId, ReplySender>>,
    events: EventEmitter,
}

#[derive(Clone)]
pub struct TunnelBroker {
    inner: Arc<BrokerInner>,
}

impl TunnelBroker {
    pub fn new(settings: BrokerSettings, events: EventEmitter) -> Self {
        let pool = SocketPool::new(settings.expected_sockets);
        Self {
            inner: Arc::new(BrokerInner {
                settings,
                pool,
                pending: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    pub fn pool(&self) -> &SocketPool {
        &self.inner.pool
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.inner.settings
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    pub fn is_pending(&self, request_id: &str) -> bool {
        self.inner.pending.lock().contains_key(request_id)
    }

    /// Register a tunnel socket whose handshake already completed.
    pub fn register_socket(&self, socket_id: &str, sender: SocketSender) -> Result<()> {
        self.inner.pool.register(socket_id, sender)?;
        let stats = self.inner.pool.stats();
        self.inner.events.emit(
            "socket_registered",
            json!({
                "socket_id": socket_id,
                "registered": stats.registered_sockets,
                "expected": stats.expected_sockets,
            }),
        );
        Ok(())
    }

    /// Remove a socket after its connection closed or a send on it failed.
    /// A request in flight on it fails with `PeerUnavailable`.
    pub fn deregister_socket(&self, socket_id: &str) -> Option<RemovedSocket> {
        let removed = self.inner.pool.deregister(socket_id)?;
        if let Some(request_id) = &removed.in_flight {
            self.settle(
                request_id,
                Err(TunnelError::PeerUnavailable(format!(
                    "tunnel socket {socket_id} closed before replying"
                ))),
            );
        }
        self.inner.events.emit(
            "socket_removed",
            json!({
                "socket_id": socket_id,
                "registered": removed.registered,
                "failed_request": removed.in_flight,
            }),
        );
        Some(removed)
    }

    pub async fn wait_until_ready(&self, timeout: Option<Duration>) -> Result<()> {
        self.inner.pool.wait_until_ready(timeout).await
    }

    /// Stop accepting work: queued and in-flight requests fail with
    /// `Shutdown`.
    pub fn shutdown(&self) {
        let queued = self.inner.pool.close();
        let in_flight: Vec<ReplySender> = self
            .inner
            .pending
            .lock()
            .drain()
            .map(|(_, reply)| reply)
            .collect();
        tracing::info!(
            target = "tunnel_broker::router",
            queued,
            in_flight = in_flight.len(),
            "tunnel broker shutting down"
        );
        for reply in in_flight {
            let _ = reply.send(Err(TunnelError::Shutdown));
        }
    }

    /// HTTP entry point. Tunnel failures become JSON error responses; the
    /// peer's own error statuses pass through untouched.
    pub async fn handle_request(&self, request: Request<Body>) -> Response {
        match self.try_handle_request(request).await {
            Ok(response) => response,
            Err(error) => error_response(&error),
        }
    }

    async fn try_handle_request(&self, request: Request<Body>) -> Result<Response> {
        let tunneled = read_request(request, self.inner.settings.max_body_bytes).await?;
        let response = self.forward(tunneled).await?;
        build_response(response)
    }

    pub async fn forward(&self, request: TunneledRequest) -> Result<TunneledResponse> {
        self.forward_with_deadline(request, self.inner.settings.forward_timeout)
            .await
    }

    /// Like [`forward`](Self::forward) with an explicit deadline covering
    /// queueing and the reply wait.
    ///
    /// On expiry the socket goes straight back to the pool. Replies carry no
    /// request id, so a late reply to the expired request is taken as the
    /// reply of whichever request holds that socket next.
    pub async fn forward_with_deadline(
        &self,
        request: TunneledRequest,
        deadline: Option<Duration>,
    ) -> Result<TunneledResponse> {
        let frame = encode_request(&request)?;
        let request_id = Uuid::new_v4().simple().to_string();
        let reply_rx = self.insert_pending(&request_id);
        let _pending = PendingGuard {
            broker: self,
            request_id: &request_id,
        };

        tracing::info!(
            target = "tunnel_broker::router",
            request_id = %request_id,
            method = %request.method,
            path = %request.path,
            "tunneling request"
        );

        let round_trip = self.round_trip(&request_id, frame, reply_rx);
        let result = match deadline {
            Some(limit) => tokio::time::timeout(limit, round_trip)
                .await
                .unwrap_or(Err(TunnelError::Timeout(limit))),
            None => round_trip.await,
        };

        match &result {
            Ok(response) => tracing::info!(
                target = "tunnel_broker::router",
                request_id = %request_id,
                status = response.status,
                "tunneled response received"
            ),
            Err(error) => {
                tracing::warn!(
                    target = "tunnel_broker::router",
                    request_id = %request_id,
                    error = %error,
                    "tunneled request failed"
                );
                self.inner.events.emit(
                    "request_failed",
                    json!({ "request_id": request_id, "code": error.code() }),
                );
            }
        }
        result
    }

    async fn round_trip(
        &self,
        request_id: &str,
        frame: String,
        reply_rx: oneshot::Receiver<Result<TunneledResponse>>,
    ) -> Result<TunneledResponse> {
        let lease = self.inner.pool.acquire(request_id).await?;
        tracing::debug!(
            target = "tunnel_broker::router",
            request_id = %request_id,
            socket_id = %lease.socket_id(),
            "tunnel socket acquired"
        );

        if let Err(error) = lease.send(frame) {
            // Remove the socket while still holding it; releasing first would
            // hand the dead socket to the next queued request.
            self.deregister_socket(lease.socket_id());
            return Err(error);
        }

        let reply = reply_rx.await.map_err(|_| {
            TunnelError::PeerUnavailable(format!(
                "reply for request {request_id} was abandoned"
            ))
        });
        // Release only after the reply settled, so the socket can never carry
        // two requests at once.
        drop(lease);
        reply?
    }

    /// Deliver a frame that arrived on `socket_id`.
    ///
    /// Malformed frames fail the request the socket is serving. A reply on a
    /// socket with no assignment, or for a request that already gave up, is
    /// returned as a protocol violation and resolves nothing.
    pub fn handle_socket_message(&self, socket_id: &str, raw: RawMessage) -> Result<()> {
        let assigned = self.inner.pool.assignment(socket_id);

        let response = match decode_response(&raw) {
            Ok(response) => response,
            Err(error) => {
                if let Some(request_id) = &assigned {
                    self.settle(request_id, Err(error.clone()));
                }
                return Err(error);
            }
        };

        let Some(request_id) = assigned else {
            let reason = if self.inner.pool.is_registered(socket_id) {
                format!("reply on tunnel socket {socket_id} with no active request")
            } else {
                format!("message on unregistered tunnel socket {socket_id}")
            };
            return Err(TunnelError::ProtocolViolation(reason));
        };

        if !self.settle(&request_id, Ok(response)) {
            return Err(TunnelError::ProtocolViolation(format!(
                "reply on tunnel socket {socket_id} for request {request_id} that is no longer pending"
            )));
        }
        Ok(())
    }

    fn insert_pending(&self, request_id: &str) -> oneshot::Receiver<Result<TunneledResponse>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .insert(request_id.to_string(), reply_tx);
        reply_rx
    }

    /// Remove the pending entry and complete it. Returns false when nothing
    /// was waiting for `request_id`.
    fn settle(&self, request_id: &str, outcome: Result<TunneledResponse>) -> bool {
        let reply = self.inner.pending.lock().remove(request_id);
        match reply {
            Some(reply) => reply.send(outcome).is_ok(),
            None => false,
        }
    }
}

/// Drops the pending entry on every exit from `forward`, including timeouts
/// and callers that abandon the future.
struct PendingGuard<'a> {
    broker: &'a TunnelBroker,
    request_id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.broker.inner.pending.lock().remove(self.request_id);
    }
}
