// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The asynchronous driver boundary.
//!
//! Authentication and ACL evaluation live in external drivers. Requests go
//! out as messages carrying a request id; replies come back through
//! [`DriverClient::resolve`] and are matched to the waiting caller by that
//! id. A caller blocked on a reply is released by exactly one of: the
//! matched reply, or the configured timeout (the pending request is then
//! dropped and the call fails). The object lock is never held across a
//! driver round-trip.

use crate::error::{CoreError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::debug;

/// A driver's answer: a boolean plus free text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverReply {
    /// Whether the request was granted/verified.
    pub success: bool,
    /// Free-text detail, mostly used on failure.
    pub message: String,
}

impl DriverReply {
    /// A positive reply.
    pub fn ok() -> Self {
        Self {
            success: true,
            message: String::new(),
        }
    }

    /// A negative reply with a reason.
    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// The two request kinds drivers answer.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverCommand {
    /// Verify a user's secret with the named authentication driver.
    Authenticate {
        /// Uid of the authenticating user.
        uid: i64,
        /// Authentication driver name.
        driver: String,
        /// Login name.
        username: String,
        /// The presented secret.
        secret: String,
    },
    /// Evaluate a serialized authorization request against the ACL rules.
    Authorize {
        /// Acting uid.
        uid: i64,
        /// Acting group ids.
        gids: Vec<i64>,
        /// Serialized request ("OP KIND:OID", one token per clause).
        request: String,
        /// Whether self-authorization already ran (and was inconclusive).
        self_authorized: bool,
    },
}

/// One outbound driver message.
#[derive(Debug, Clone)]
pub struct DriverMessage {
    /// Request id; replies must echo it.
    pub id: u64,
    /// The request itself.
    pub command: DriverCommand,
}

/// Client side of the driver boundary.
pub struct DriverClient {
    tx: mpsc::Sender<DriverMessage>,
    pending: Mutex<HashMap<u64, oneshot::Sender<DriverReply>>>,
    next_id: AtomicU64,
    timeout: Duration,
}

impl DriverClient {
    /// Build a client plus the receiving end a driver pump consumes.
    pub fn new(timeout: Duration) -> (Arc<Self>, mpsc::Receiver<DriverMessage>) {
        let (tx, rx) = mpsc::channel(64);
        (
            Arc::new(Self {
                tx,
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                timeout,
            }),
            rx,
        )
    }

    /// Send a request and wait for the matched reply or the timeout.
    pub async fn call(&self, command: DriverCommand) -> Result<DriverReply> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.lock().await.insert(id, reply_tx);

        if self.tx.send(DriverMessage { id, command }).await.is_err() {
            self.pending.lock().await.remove(&id);
            return Err(CoreError::Driver {
                message: "driver channel closed".to_string(),
            });
        }

        match tokio::time::timeout(self.timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(CoreError::Driver {
                message: format!("driver dropped request [{}]", id),
            }),
            Err(_) => {
                // Mark the pending request failed; a late reply finds no waiter.
                self.pending.lock().await.remove(&id);
                Err(CoreError::Driver {
                    message: format!("driver request [{}] timed out", id),
                })
            }
        }
    }

    /// Deliver a reply to the caller waiting on `id`. Returns false when no
    /// caller waits (already timed out, or unknown id).
    pub async fn resolve(&self, id: u64, reply: DriverReply) -> bool {
        match self.pending.lock().await.remove(&id) {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    /// Number of requests currently waiting for a reply.
    pub async fn pending_requests(&self) -> usize {
        self.pending.lock().await.len()
    }
}

/// An in-process driver implementation.
#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// Answer one driver request.
    async fn handle(&self, command: &DriverCommand) -> DriverReply;
}

/// Pump messages from `rx` through `backend` into `client`.
pub fn spawn_backend(
    client: Arc<DriverClient>,
    mut rx: mpsc::Receiver<DriverMessage>,
    backend: Arc<dyn AuthBackend>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let reply = backend.handle(&message.command).await;
            if !client.resolve(message.id, reply).await {
                debug!(id = message.id, "driver reply had no waiter");
            }
        }
    })
}

/// Backend that grants everything. The default for single-tenant setups
/// where the self-authorization shortcut carries all real policy.
pub struct PermissiveBackend;

#[async_trait]
impl AuthBackend for PermissiveBackend {
    async fn handle(&self, command: &DriverCommand) -> DriverReply {
        match command {
            DriverCommand::Authenticate { secret, .. } if secret.is_empty() => {
                DriverReply::fail("empty secret")
            }
            _ => DriverReply::ok(),
        }
    }
}

/// Backend that denies everything not already self-authorized.
pub struct RestrictiveBackend;

#[async_trait]
impl AuthBackend for RestrictiveBackend {
    async fn handle(&self, command: &DriverCommand) -> DriverReply {
        match command {
            DriverCommand::Authenticate { .. } => DriverReply::fail("authentication denied"),
            DriverCommand::Authorize { request, .. } => {
                DriverReply::fail(format!("no ACL rule grants: {}", request))
            }
        }
    }
}
