// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Permission bits, lock levels and the permission snapshot.
//!
//! A [`PermSnapshot`] is captured while an object's lock is held and is the
//! only thing the authorization evaluator ever sees; the live object is
//! never consulted during clause evaluation.

use super::ObjectKind;
use serde::{Deserialize, Serialize};

/// The operation class a caller requests on an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuthOp {
    /// Read/consume the object (list, attach, instantiate).
    Use,
    /// Change the object's state or contents.
    Manage,
    /// Change ownership, permissions or infrastructure placement.
    Admin,
    /// Create a new object of some kind.
    Create,
}

impl AuthOp {
    /// Stable uppercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Use => "USE",
            Self::Manage => "MANAGE",
            Self::Admin => "ADMIN",
            Self::Create => "CREATE",
        }
    }
}

impl std::fmt::Display for AuthOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lock level of an object.
///
/// A lock at level L denies operations of class L and every class above it;
/// `All` denies everything.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum LockLevel {
    /// Not locked.
    #[default]
    None,
    /// USE and above denied.
    Use,
    /// MANAGE and ADMIN denied.
    Manage,
    /// Only ADMIN denied.
    Admin,
    /// Everything denied.
    All,
}

impl LockLevel {
    /// Whether this lock denies the given operation class.
    pub fn blocks(&self, op: AuthOp) -> bool {
        match self {
            Self::None => false,
            Self::Use | Self::All => true,
            Self::Manage => matches!(op, AuthOp::Manage | AuthOp::Admin | AuthOp::Create),
            Self::Admin => matches!(op, AuthOp::Admin),
        }
    }
}

/// Nine permission bits: owner/group/other x use/manage/admin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    /// Owner may USE.
    pub owner_u: bool,
    /// Owner may MANAGE.
    pub owner_m: bool,
    /// Owner may ADMIN.
    pub owner_a: bool,
    /// Group may USE.
    pub group_u: bool,
    /// Group may MANAGE.
    pub group_m: bool,
    /// Group may ADMIN.
    pub group_a: bool,
    /// Others may USE.
    pub other_u: bool,
    /// Others may MANAGE.
    pub other_m: bool,
    /// Others may ADMIN.
    pub other_a: bool,
}

impl Default for Permissions {
    /// The default for newly allocated objects: owner use+manage only.
    fn default() -> Self {
        Self {
            owner_u: true,
            owner_m: true,
            owner_a: false,
            group_u: false,
            group_m: false,
            group_a: false,
            other_u: false,
            other_m: false,
            other_a: false,
        }
    }
}

impl Permissions {
    /// Whether the owner bits grant the operation.
    pub fn owner_grants(&self, op: AuthOp) -> bool {
        match op {
            AuthOp::Use => self.owner_u,
            AuthOp::Manage => self.owner_m,
            AuthOp::Admin => self.owner_a,
            AuthOp::Create => false,
        }
    }

    /// Whether the group bits grant the operation.
    pub fn group_grants(&self, op: AuthOp) -> bool {
        match op {
            AuthOp::Use => self.group_u,
            AuthOp::Manage => self.group_m,
            AuthOp::Admin => self.group_a,
            AuthOp::Create => false,
        }
    }

    /// Whether the other bits grant the operation.
    pub fn other_grants(&self, op: AuthOp) -> bool {
        match op {
            AuthOp::Use => self.other_u,
            AuthOp::Manage => self.other_m,
            AuthOp::Admin => self.other_a,
            AuthOp::Create => false,
        }
    }
}

/// A compact, copyable capture of everything authorization needs.
///
/// Taken while the object is locked; never refreshed mid-evaluation, so a
/// driver round-trip can never observe a concurrently mutated object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermSnapshot {
    /// Object kind.
    pub kind: ObjectKind,
    /// Object id.
    pub oid: i64,
    /// Owning user.
    pub uid: i64,
    /// Owning group.
    pub gid: i64,
    /// Clusters the object belongs to (placement-scoped ACLs).
    pub cluster_ids: Vec<i64>,
    /// The nine permission bits.
    pub perms: Permissions,
    /// Skip owner-scoped ACL rules for this object.
    pub disable_acl_owner: bool,
    /// Skip group-scoped ACL rules for this object.
    pub disable_acl_group: bool,
    /// Skip cluster-scoped ACL rules for this object.
    pub disable_acl_cluster: bool,
    /// Lock level at capture time.
    pub lock: LockLevel,
}

impl PermSnapshot {
    /// Snapshot with default flags for an object with the given identity.
    pub fn new(kind: ObjectKind, oid: i64, uid: i64, gid: i64, perms: Permissions) -> Self {
        Self {
            kind,
            oid,
            uid,
            gid,
            cluster_ids: Vec::new(),
            perms,
            disable_acl_owner: false,
            disable_acl_group: false,
            disable_acl_cluster: false,
            lock: LockLevel::None,
        }
    }

    /// Attach the cluster membership set.
    pub fn with_clusters(mut self, cluster_ids: Vec<i64>) -> Self {
        self.cluster_ids = cluster_ids;
        self
    }

    /// Attach the lock level.
    pub fn with_lock(mut self, lock: LockLevel) -> Self {
        self.lock = lock;
        self
    }
}
