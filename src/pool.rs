//! Registry of tunnel sockets with exclusive, FIFO-fair checkout.
//!
//! Every socket serves at most one request at a time. A caller that finds no
//! idle socket (or finds other callers already waiting) joins the wait queue
//! and is handed the next released socket directly, so a freed socket never
//! passes through an idle state a newer caller could grab.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::{Result, TunnelError};

pub type SocketId = String;
pub type RequestId = String;

/// Send capability of a tunnel socket: one JSON text frame per message.
pub type SocketSender = mpsc::UnboundedSender<String>;

#[derive(Debug)]
struct SocketEntry {
    id: SocketId,
    sender: SocketSender,
    active: Option<RequestId>,
    // False between a hand-off and the waiter waking up: nothing has been
    // sent on the socket for `active` yet.
    claimed: bool,
}

#[derive(Debug)]
struct Waiter {
    ticket: u64,
    request_id: RequestId,
    grant: oneshot::Sender<SocketId>,
}

#[derive(Debug, Default)]
struct PoolState {
    // Registration order; the idle scan walks it front to back.
    sockets: Vec<SocketEntry>,
    queue: VecDeque<Waiter>,
    next_ticket: u64,
    closed: bool,
}

impl PoolState {
    fn position(&self, socket_id: &str) -> Option<usize> {
        self.sockets.iter().position(|entry| entry.id == socket_id)
    }

    /// Give the socket at `idx` to the longest waiter, assigning it to the
    /// waiter's request in the same critical section.
    fn hand_off(&mut self, idx: usize) -> Option<RequestId> {
        while let Some(waiter) = self.queue.pop_front() {
            let entry = &mut self.sockets[idx];
            entry.active = Some(waiter.request_id.clone());
            entry.claimed = false;
            if waiter.grant.send(entry.id.clone()).is_ok() {
                return Some(waiter.request_id);
            }
            entry.active = None;
        }
        None
    }
}

/// Snapshot of pool occupancy, reported by the health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub expected_sockets: usize,
    pub registered_sockets: usize,
    pub busy_sockets: usize,
    pub queued_requests: usize,
}

/// Outcome of removing a registered socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedSocket {
    /// Request that had already taken the socket. A queued request the socket
    /// was only just handed to is not reported; it goes back to the head of
    /// the queue instead.
    pub in_flight: Option<RequestId>,
    pub registered: usize,
}

struct PoolInner {
    expected: usize,
    state: Mutex<PoolState>,
    registered_tx: watch::Sender<usize>,
}

#[derive(Clone)]
pub struct SocketPool {
    inner: Arc<PoolInner>,
}

impl SocketPool {
    /// `expected_sockets` is the number of parallel tunnel connections the
    /// peer opens; it is also the hard registration limit.
    pub fn new(expected_sockets: usize) -> Self {
        let (registered_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(PoolInner {
                expected: expected_sockets,
                state: Mutex::new(PoolState::default()),
                registered_tx,
            }),
        }
    }

    pub fn expected_sockets(&self) -> usize {
        self.inner.expected
    }

    pub fn register(&self, socket_id: impl Into<SocketId>, sender: SocketSender) -> Result<()> {
        let socket_id = socket_id.into();
        let (registered, handed_to) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(TunnelError::Shutdown);
            }
            if state.position(&socket_id).is_some() {
                return Err(TunnelError::DuplicateSocket(socket_id));
            }
            if state.sockets.len() >= self.inner.expected {
                return Err(TunnelError::Capacity {
                    expected: self.inner.expected,
                });
            }

            state.sockets.push(SocketEntry {
                id: socket_id.clone(),
                sender,
                active: None,
                claimed: false,
            });
            let idx = state.sockets.len() - 1;
            let handed_to = state.hand_off(idx);
            (state.sockets.len(), handed_to)
        };

        self.inner.registered_tx.send_replace(registered);
        tracing::info!(
            target = "tunnel_broker::pool",
            socket_id = %socket_id,
            registered,
            expected = self.inner.expected,
            "tunnel socket registered"
        );
        if let Some(request_id) = handed_to {
            tracing::debug!(
                target = "tunnel_broker::pool",
                socket_id = %socket_id,
                request_id = %request_id,
                "new socket handed to queued request"
            );
        }
        Ok(())
    }

    /// Remove a socket. `None` when it was not registered.
    pub fn deregister(&self, socket_id: &str) -> Option<RemovedSocket> {
        let removed = {
            let mut state = self.inner.state.lock();
            let idx = state.position(socket_id)?;
            let entry = state.sockets.remove(idx);
            RemovedSocket {
                in_flight: entry.active.filter(|_| entry.claimed),
                registered: state.sockets.len(),
            }
        };

        self.inner.registered_tx.send_replace(removed.registered);
        tracing::info!(
            target = "tunnel_broker::pool",
            socket_id = %socket_id,
            in_flight = ?removed.in_flight,
            registered = removed.registered,
            "tunnel socket removed"
        );
        Some(removed)
    }

    /// Check out a socket for `request_id`, suspending until one is free.
    ///
    /// Cancel-safe: dropping the future while queued removes the waiter, and
    /// a socket handed over during cancellation is released again. A socket
    /// removed between the hand-off and the waiter waking puts the waiter
    /// back at the head of the queue.
    pub async fn acquire(&self, request_id: &str) -> Result<SocketLease> {
        let mut requeued = false;
        loop {
            let (ticket, grant_rx) = {
                let mut state = self.inner.state.lock();
                if state.closed {
                    return Err(TunnelError::Shutdown);
                }

                if state.queue.is_empty() {
                    if let Some(idx) = state.sockets.iter().position(|e| e.active.is_none()) {
                        tracing::debug!(
                            target = "tunnel_broker::pool",
                            socket_id = %state.sockets[idx].id,
                            request_id = %request_id,
                            "found idle tunnel socket"
                        );
                        state.sockets[idx].active = Some(request_id.to_string());
                        return Ok(self.claim(&mut state.sockets[idx], request_id));
                    }
                }

                let ticket = state.next_ticket;
                state.next_ticket += 1;
                let (grant_tx, grant_rx) = oneshot::channel();
                let waiter = Waiter {
                    ticket,
                    request_id: request_id.to_string(),
                    grant: grant_tx,
                };
                if requeued {
                    state.queue.push_front(waiter);
                } else {
                    state.queue.push_back(waiter);
                }
                tracing::debug!(
                    target = "tunnel_broker::pool",
                    request_id = %request_id,
                    queued = state.queue.len(),
                    requeued,
                    "waiting in queue for tunnel socket"
                );
                (ticket, grant_rx)
            };

            let mut waiter = QueuedWaiter {
                pool: self.clone(),
                ticket,
                request_id: request_id.to_string(),
                grant_rx: Some(grant_rx),
            };
            let socket_id = waiter.granted().await?;

            let mut state = self.inner.state.lock();
            if let Some(entry) = state
                .sockets
                .iter_mut()
                .find(|e| e.id == socket_id && e.active.as_deref() == Some(request_id))
            {
                return Ok(self.claim(entry, request_id));
            }
            drop(state);
            tracing::debug!(
                target = "tunnel_broker::pool",
                socket_id = %socket_id,
                request_id = %request_id,
                "granted tunnel socket removed before use"
            );
            requeued = true;
        }
    }

    fn claim(&self, entry: &mut SocketEntry, request_id: &str) -> SocketLease {
        entry.claimed = true;
        SocketLease {
            pool: self.clone(),
            socket_id: entry.id.clone(),
            request_id: request_id.to_string(),
            sender: entry.sender.clone(),
        }
    }

    /// Return a socket held by `request_id`. A queued caller, if any, gets it
    /// immediately. Calls for a request that no longer holds the socket are
    /// ignored, which makes double release harmless.
    pub fn release(&self, socket_id: &str, request_id: &str) {
        let mut state = self.inner.state.lock();
        let Some(idx) = state.position(socket_id) else {
            return;
        };
        if state.sockets[idx].active.as_deref() != Some(request_id) {
            return;
        }

        state.sockets[idx].active = None;
        match state.hand_off(idx) {
            Some(next) => tracing::debug!(
                target = "tunnel_broker::pool",
                socket_id = %socket_id,
                request_id = %next,
                queued = state.queue.len(),
                "released tunnel socket to next queued request"
            ),
            None => tracing::debug!(
                target = "tunnel_broker::pool",
                socket_id = %socket_id,
                "tunnel socket idle"
            ),
        }
    }

    /// The request currently assigned to `socket_id`.
    pub fn assignment(&self, socket_id: &str) -> Option<RequestId> {
        let state = self.inner.state.lock();
        state
            .position(socket_id)
            .and_then(|idx| state.sockets[idx].active.clone())
    }

    pub fn is_registered(&self, socket_id: &str) -> bool {
        self.inner.state.lock().position(socket_id).is_some()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            expected_sockets: self.inner.expected,
            registered_sockets: state.sockets.len(),
            busy_sockets: state
                .sockets
                .iter()
                .filter(|entry| entry.active.is_some())
                .count(),
            queued_requests: state.queue.len(),
        }
    }

    pub fn is_ready(&self) -> bool {
        *self.inner.registered_tx.borrow() >= self.inner.expected
    }

    /// Resolve once the expected number of sockets is registered.
    pub async fn wait_until_ready(&self, timeout: Option<Duration>) -> Result<()> {
        let expected = self.inner.expected;
        let mut registered_rx = self.inner.registered_tx.subscribe();
        let ready = async move {
            registered_rx
                .wait_for(|registered| *registered >= expected)
                .await
                .map(|_| ())
                .map_err(|_| TunnelError::Shutdown)
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, ready)
                .await
                .map_err(|_| TunnelError::Timeout(limit))?,
            None => ready.await,
        }
    }

    /// Stop handing out sockets. Queued callers fail with `Shutdown`.
    pub fn close(&self) -> usize {
        let mut state = self.inner.state.lock();
        state.closed = true;
        let dropped = state.queue.len();
        state.queue.clear();
        dropped
    }
}

struct QueuedWaiter {
    pool: SocketPool,
    ticket: u64,
    request_id: RequestId,
    grant_rx: Option<oneshot::Receiver<SocketId>>,
}

impl QueuedWaiter {
    async fn granted(&mut self) -> Result<SocketId> {
        let Some(grant_rx) = self.grant_rx.as_mut() else {
            return Err(TunnelError::Shutdown);
        };
        let granted = grant_rx.await;
        self.grant_rx = None;
        granted.map_err(|_| TunnelError::Shutdown)
    }
}

impl Drop for QueuedWaiter {
    fn drop(&mut self) {
        let Some(mut grant_rx) = self.grant_rx.take() else {
            return;
        };

        {
            let mut state = self.pool.inner.state.lock();
            if let Some(pos) = state.queue.iter().position(|w| w.ticket == self.ticket) {
                state.queue.remove(pos);
                tracing::debug!(
                    target = "tunnel_broker::pool",
                    request_id = %self.request_id,
                    "queued request cancelled"
                );
                return;
            }
        }

        // Not queued any more: either the pool closed or a socket was granted
        // between the last poll and the drop.
        grant_rx.close();
        if let Ok(socket_id) = grant_rx.try_recv() {
            self.pool.release(&socket_id, &self.request_id);
        }
    }
}

/// Exclusive hold on one tunnel socket. Dropping the lease releases it.
pub struct SocketLease {
    pool: SocketPool,
    socket_id: SocketId,
    request_id: RequestId,
    sender: SocketSender,
}

impl SocketLease {
    pub fn socket_id(&self) -> &str {
        &self.socket_id
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn send(&self, frame: String) -> Result<()> {
        self.sender.send(frame).map_err(|_| {
            TunnelError::PeerUnavailable(format!("tunnel socket {} is closed", self.socket_id))
        })
    }
}

impl Drop for SocketLease {
    fn drop(&mut self) {
        self.pool.release(&self.socket_id, &self.request_id);
    }
}

impl std::fmt::Debug for SocketLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketLease")
            .field("socket_id", &self.socket_id)
            .field("request_id", &self.request_id)
            .finish()
    }
}
