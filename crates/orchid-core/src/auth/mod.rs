// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The authorization evaluator.
//!
//! Every action builds an [`AuthRequest`]: one clause per sub-resource it
//! touches, each pairing an operation with a [`PermSnapshot`] captured
//! earlier under that object's lock. Evaluation resolves each clause by
//! the self-authorization shortcut (superuser, owner bit, group bit) or,
//! when the shortcut is inconclusive, by the external ACL driver. The
//! overall request succeeds iff every clause does.
//!
//! Evaluation never short-circuits: every clause is resolved and recorded
//! even after the first failure, so the audit trail always names which
//! sub-resources passed and which did not.

pub mod driver;
pub mod session;

pub use driver::{
    AuthBackend, DriverClient, DriverCommand, DriverMessage, DriverReply, PermissiveBackend,
    RestrictiveBackend, spawn_backend,
};
pub use session::AuthContext;

use crate::error::{CoreError, Result};
use crate::objects::{AuthOp, ObjectKind, PermSnapshot};
use std::sync::Arc;
use tracing::{debug, info};

/// One (operation, permission-snapshot) pair.
#[derive(Debug, Clone)]
pub struct Clause {
    /// The requested operation class.
    pub op: AuthOp,
    /// The snapshot the clause is evaluated against.
    pub snapshot: PermSnapshot,
}

/// The closing clause of a request that creates a new object.
#[derive(Debug, Clone)]
pub struct CreateClause {
    /// Kind of the object to create.
    pub kind: ObjectKind,
    /// Serialized template of the object to be created.
    pub template: String,
}

/// An ordered multi-clause authorization request.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    /// Acting uid.
    pub uid: i64,
    /// Acting primary group.
    pub gid: i64,
    /// All acting group ids.
    pub gids: Vec<i64>,
    clauses: Vec<Clause>,
    create: Option<CreateClause>,
}

impl AuthRequest {
    /// A request for the given actor identity.
    pub fn new(uid: i64, gid: i64, gids: Vec<i64>) -> Self {
        Self {
            uid,
            gid,
            gids,
            clauses: Vec::new(),
            create: None,
        }
    }

    /// A request for a resolved session.
    pub fn for_actor(actor: &AuthContext) -> Self {
        Self::new(actor.uid, actor.gid, actor.gids.clone())
    }

    /// Append a clause.
    pub fn add(&mut self, op: AuthOp, snapshot: PermSnapshot) -> &mut Self {
        self.clauses.push(Clause { op, snapshot });
        self
    }

    /// Close the request with a create clause.
    pub fn add_create(&mut self, kind: ObjectKind, template: impl Into<String>) -> &mut Self {
        self.create = Some(CreateClause {
            kind,
            template: template.into(),
        });
        self
    }

    /// Number of clauses, create clause included.
    pub fn len(&self) -> usize {
        self.clauses.len() + usize::from(self.create.is_some())
    }

    /// Whether no clause was added.
    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty() && self.create.is_none()
    }

    fn is_superuser(&self) -> bool {
        self.uid == 0 || self.gids.contains(&0)
    }
}

/// Why a clause was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialCause {
    /// Neither self-authorization nor the ACL driver granted it.
    Permission,
    /// The object is locked at or above the requested level.
    Lock,
}

/// The recorded outcome of one clause.
#[derive(Debug, Clone)]
pub struct ClauseAudit {
    /// Object kind; the created kind for create clauses.
    pub kind: ObjectKind,
    /// Object id; absent for create clauses.
    pub oid: Option<i64>,
    /// Requested operation.
    pub op: AuthOp,
    /// Whether the clause was granted.
    pub granted: bool,
    /// Denial cause when not granted.
    pub cause: Option<DenialCause>,
}

/// The full outcome of an evaluation: every clause's audit entry plus the
/// first failure mapped to a caller-visible error.
#[derive(Debug)]
pub struct AuthVerdict {
    /// One entry per clause, in request order.
    pub audits: Vec<ClauseAudit>,
    /// The error for the first failing clause, if any failed.
    pub denial: Option<CoreError>,
}

impl AuthVerdict {
    /// Whether every clause was granted.
    pub fn granted(&self) -> bool {
        self.denial.is_none()
    }
}

/// Evaluates authorization requests.
pub struct AuthManager {
    driver: Arc<DriverClient>,
}

impl AuthManager {
    /// An evaluator forwarding inconclusive clauses to `driver`.
    pub fn new(driver: Arc<DriverClient>) -> Self {
        Self { driver }
    }

    /// The underlying driver client.
    pub fn driver(&self) -> &Arc<DriverClient> {
        &self.driver
    }

    /// Evaluate a request. Convenience wrapper that surfaces the first
    /// failing clause as the error.
    pub async fn authorize(&self, request: &AuthRequest) -> Result<()> {
        let verdict = self.evaluate(request).await;
        match verdict.denial {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// Evaluate every clause of a request, recording all outcomes.
    pub async fn evaluate(&self, request: &AuthRequest) -> AuthVerdict {
        let mut audits = Vec::with_capacity(request.len());
        let mut denial: Option<CoreError> = None;

        for clause in &request.clauses {
            let (granted, cause) = self.evaluate_clause(request, clause).await;
            audits.push(ClauseAudit {
                kind: clause.snapshot.kind,
                oid: Some(clause.snapshot.oid),
                op: clause.op,
                granted,
                cause,
            });
            if !granted && denial.is_none() {
                denial = Some(match cause {
                    Some(DenialCause::Lock) => CoreError::Locked {
                        kind: clause.snapshot.kind,
                        oid: clause.snapshot.oid,
                    },
                    _ => CoreError::authorization(format!(
                        "Not authorized to perform {} {} [{}]",
                        clause.op, clause.snapshot.kind, clause.snapshot.oid
                    )),
                });
            }
        }

        if let Some(create) = &request.create {
            let granted = self.evaluate_create(request, create).await;
            audits.push(ClauseAudit {
                kind: create.kind,
                oid: None,
                op: AuthOp::Create,
                granted,
                cause: if granted {
                    None
                } else {
                    Some(DenialCause::Permission)
                },
            });
            if !granted && denial.is_none() {
                denial = Some(CoreError::authorization(format!(
                    "Not authorized to perform CREATE {}",
                    create.kind
                )));
            }
        }

        for audit in &audits {
            info!(
                uid = request.uid,
                kind = %audit.kind,
                oid = audit.oid,
                op = %audit.op,
                granted = audit.granted,
                "authorization clause"
            );
        }

        AuthVerdict { audits, denial }
    }

    /// Resolve one clause: lock check, then the self-authorization
    /// shortcut, then the ACL driver.
    async fn evaluate_clause(
        &self,
        request: &AuthRequest,
        clause: &Clause,
    ) -> (bool, Option<DenialCause>) {
        let snap = &clause.snapshot;

        if snap.lock.blocks(clause.op) {
            return (false, Some(DenialCause::Lock));
        }

        if request.is_superuser() {
            return (true, None);
        }
        if request.uid == snap.uid && snap.perms.owner_grants(clause.op) {
            return (true, None);
        }
        if request.gids.contains(&snap.gid) && snap.perms.group_grants(clause.op) {
            return (true, None);
        }
        if snap.perms.other_grants(clause.op) {
            return (true, None);
        }

        // Self-authorization was inconclusive; ask the ACL driver.
        let serialized = format!("{} {}:{}", clause.op, snap.kind, snap.oid);
        debug!(request = %serialized, "forwarding clause to ACL driver");
        match self
            .driver
            .call(DriverCommand::Authorize {
                uid: request.uid,
                gids: request.gids.clone(),
                request: serialized,
                self_authorized: true,
            })
            .await
        {
            Ok(reply) if reply.success => (true, None),
            _ => (false, Some(DenialCause::Permission)),
        }
    }

    async fn evaluate_create(&self, request: &AuthRequest, create: &CreateClause) -> bool {
        if request.is_superuser() {
            return true;
        }
        let serialized = format!("CREATE {} {}", create.kind, create.template);
        match self
            .driver
            .call(DriverCommand::Authorize {
                uid: request.uid,
                gids: request.gids.clone(),
                request: serialized,
                self_authorized: false,
            })
            .await
        {
            Ok(reply) => reply.success,
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::{LockLevel, Permissions};
    use std::time::Duration;

    fn snapshot(kind: ObjectKind, oid: i64, uid: i64, gid: i64) -> PermSnapshot {
        PermSnapshot::new(kind, oid, uid, gid, Permissions::default())
    }

    fn manager(restrictive: bool) -> AuthManager {
        let (client, rx) = DriverClient::new(Duration::from_secs(5));
        if restrictive {
            let _ = spawn_backend(client.clone(), rx, Arc::new(RestrictiveBackend));
        } else {
            let _ = spawn_backend(client.clone(), rx, Arc::new(PermissiveBackend));
        }
        AuthManager::new(client)
    }

    #[tokio::test]
    async fn test_owner_self_authorizes() {
        let auth = manager(true);
        let mut request = AuthRequest::new(2, 1, vec![1]);
        request.add(AuthOp::Manage, snapshot(ObjectKind::Vm, 3, 2, 1));
        auth.authorize(&request).await.unwrap();
    }

    #[tokio::test]
    async fn test_non_owner_denied_by_restrictive_driver() {
        let auth = manager(true);
        let mut request = AuthRequest::new(5, 1, vec![1]);
        request.add(AuthOp::Manage, snapshot(ObjectKind::Vm, 3, 2, 2));
        let err = auth.authorize(&request).await.unwrap_err();
        assert_eq!(err.to_string(), "Not authorized to perform MANAGE VM [3]");
    }

    #[tokio::test]
    async fn test_superuser_granted() {
        let auth = manager(true);
        let mut request = AuthRequest::new(0, 0, vec![0]);
        request.add(AuthOp::Admin, snapshot(ObjectKind::Host, 1, 2, 1));
        auth.authorize(&request).await.unwrap();
    }

    #[tokio::test]
    async fn test_group_bit_grants() {
        let auth = manager(true);
        let mut snap = snapshot(ObjectKind::Image, 8, 2, 7);
        snap.perms.group_u = true;
        let mut request = AuthRequest::new(5, 7, vec![7]);
        request.add(AuthOp::Use, snap);
        auth.authorize(&request).await.unwrap();
    }

    #[tokio::test]
    async fn test_lock_denies_even_owner() {
        let auth = manager(false);
        let snap = snapshot(ObjectKind::Vm, 3, 2, 1).with_lock(LockLevel::Manage);
        let mut request = AuthRequest::new(2, 1, vec![1]);
        request.add(AuthOp::Manage, snap);
        let err = auth.authorize(&request).await.unwrap_err();
        assert!(matches!(err, CoreError::Locked { oid: 3, .. }));

        // A USE clause still passes a MANAGE-level lock.
        let snap = snapshot(ObjectKind::Vm, 3, 2, 1).with_lock(LockLevel::Manage);
        let mut request = AuthRequest::new(2, 1, vec![1]);
        request.add(AuthOp::Use, snap);
        auth.authorize(&request).await.unwrap();
    }

    #[tokio::test]
    async fn test_no_short_circuit_records_every_clause() {
        let auth = manager(true);
        let mut request = AuthRequest::new(5, 1, vec![1]);
        // Clause 0: granted (owner). Clause 1: denied. Clause 2: granted.
        request.add(AuthOp::Use, snapshot(ObjectKind::Vm, 0, 5, 1));
        request.add(AuthOp::Manage, snapshot(ObjectKind::Datastore, 1, 2, 2));
        request.add(AuthOp::Use, snapshot(ObjectKind::Image, 2, 5, 1));

        let verdict = auth.evaluate(&request).await;
        assert_eq!(verdict.audits.len(), 3, "all clauses recorded");
        assert!(verdict.audits[0].granted);
        assert!(!verdict.audits[1].granted);
        assert!(verdict.audits[2].granted);

        // The failure names the failing clause, not just "failed".
        let err = verdict.denial.unwrap();
        assert_eq!(
            err.to_string(),
            "Not authorized to perform MANAGE DATASTORE [1]"
        );
    }

    #[tokio::test]
    async fn test_create_clause() {
        let auth = manager(true);
        let mut request = AuthRequest::new(5, 1, vec![1]);
        request.add_create(ObjectKind::Vm, "{\"name\":\"x\"}");
        let verdict = auth.evaluate(&request).await;
        assert_eq!(verdict.audits.len(), 1);
        assert!(!verdict.granted());

        let mut request = AuthRequest::new(0, 0, vec![0]);
        request.add_create(ObjectKind::Vm, "{}");
        assert!(auth.evaluate(&request).await.granted());
    }
}
