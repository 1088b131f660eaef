//! RPC correlation registry
//!
//! Turns push-style duplex messaging into awaitable calls: every outbound
//! request gets a fresh id and a pending slot, and the inbound side resolves
//! the slot by id. Used on both ends of the link (client RPC calls, server
//! service requests).

use dashmap::DashMap;
use std::time::Instant;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::{Result, SessionError};

pub type RpcResult = Result<serde_json::Value>;

struct PendingRpcCall {
    slot: oneshot::Sender<RpcResult>,
    created_at: Instant,
}

#[derive(Default)]
pub struct RpcCorrelationRegistry {
    pending: DashMap<Uuid, PendingRpcCall>,
}

/// Awaitable side of a registered call. Dropping it removes nothing by itself;
/// callers that give up use [`RpcCorrelationRegistry::forget`].
pub struct PendingCall {
    pub id: Uuid,
    rx: oneshot::Receiver<RpcResult>,
}

impl PendingCall {
    pub async fn wait(self) -> RpcResult {
        match self.rx.await {
            Ok(result) => result,
            // sender dropped without completing: registry itself went away
            Err(_) => Err(SessionError::ConnectionClosed("call abandoned".into())),
        }
    }
}

impl RpcCorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new call under a fresh id.
    pub fn register(&self) -> PendingCall {
        loop {
            let id = Uuid::new_v4();
            let (tx, rx) = oneshot::channel();
            // ids are never reused while pending; a v4 collision just retries
            if let dashmap::mapref::entry::Entry::Vacant(v) = self.pending.entry(id) {
                v.insert(PendingRpcCall {
                    slot: tx,
                    created_at: Instant::now(),
                });
                return PendingCall { id, rx };
            }
        }
    }

    /// Resolve the call `id`. Returns false when no such call is pending,
    /// which happens legitimately after a cancel or a reconnect.
    pub fn complete(&self, id: Uuid, result: RpcResult) -> bool {
        match self.pending.remove(&id) {
            Some((_, call)) => {
                tracing::trace!(%id, elapsed_ms = call.created_at.elapsed().as_millis() as u64, "rpc completed");
                // receiver may have given up already
                let _ = call.slot.send(result);
                true
            }
            None => {
                tracing::debug!(%id, "dropping response for unknown correlation id");
                false
            }
        }
    }

    pub fn forget(&self, id: Uuid) {
        self.pending.remove(&id);
    }

    /// Fail every pending call. Returns how many were aborted.
    pub fn abort_all(&self, make_err: impl Fn() -> SessionError) -> usize {
        let ids: Vec<Uuid> = self.pending.iter().map(|e| *e.key()).collect();
        let mut aborted = 0;
        for id in ids {
            if let Some((_, call)) = self.pending.remove(&id) {
                let _ = call.slot.send(Err(make_err()));
                aborted += 1;
            }
        }
        aborted
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Age of the oldest pending call, for diagnostics.
    pub fn oldest_pending(&self) -> Option<std::time::Duration> {
        self.pending.iter().map(|e| e.value().created_at.elapsed()).max()
    }
}
