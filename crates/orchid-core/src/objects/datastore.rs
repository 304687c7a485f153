// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Datastores: typed storage backends with cluster membership and the
//! transfer-driver attributes disks inherit.

use super::disk::TmTarget;
use super::perms::{LockLevel, PermSnapshot, Permissions};
use super::{ObjectKind, PoolObject};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// What a datastore holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DatastoreType {
    /// Registered disk images.
    Image,
    /// Running VM disks.
    System,
    /// Kernels, ramdisks and context files.
    File,
    /// Backup storage.
    Backup,
}

impl DatastoreType {
    /// Stable uppercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "IMAGE",
            Self::System => "SYSTEM",
            Self::File => "FILE",
            Self::Backup => "BACKUP",
        }
    }
}

impl fmt::Display for DatastoreType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A datastore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Datastore {
    /// Pool id.
    pub id: i64,
    /// Display name.
    pub name: String,
    /// Owning user.
    pub uid: i64,
    /// Owning group.
    pub gid: i64,
    /// Permission bits.
    pub perms: Permissions,
    /// Lock level.
    #[serde(default)]
    pub lock: LockLevel,
    /// What the datastore holds.
    pub ds_type: DatastoreType,
    /// Transfer driver ("shared", "ssh", "ceph", ...).
    pub tm_driver: String,
    /// Clusters that can reach this datastore.
    pub cluster_ids: BTreeSet<i64>,
    /// Accounting target for non-persistent disks cloned from here.
    pub clone_target: TmTarget,
    /// Accounting target for persistent disks linked from here.
    pub ln_target: TmTarget,
}

impl Datastore {
    /// A new datastore. Clone/link targets default from the transfer
    /// driver the way the stock drivers behave.
    pub fn new(name: &str, ds_type: DatastoreType, tm_driver: &str) -> Self {
        let (clone_target, ln_target) = match tm_driver {
            "ssh" => (TmTarget::System, TmTarget::System),
            "ceph" => (TmTarget::SelfDs, TmTarget::None),
            // "shared" and anything shared-like
            _ => (TmTarget::System, TmTarget::None),
        };
        Self {
            id: -1,
            name: name.to_string(),
            uid: 0,
            gid: 0,
            perms: Permissions::default(),
            lock: LockLevel::None,
            ds_type,
            tm_driver: tm_driver.to_string(),
            cluster_ids: BTreeSet::new(),
            clone_target,
            ln_target,
        }
    }

    /// The accounting target a disk inherits from this datastore.
    pub fn disk_target(&self, persistent: bool) -> TmTarget {
        if persistent {
            self.ln_target
        } else {
            self.clone_target
        }
    }

    /// Whether the datastore is reachable from the given cluster.
    pub fn in_cluster(&self, cluster_id: i64) -> bool {
        self.cluster_ids.contains(&cluster_id)
    }

    /// Capture the permission snapshot.
    pub fn perm_snapshot(&self) -> PermSnapshot {
        PermSnapshot::new(
            ObjectKind::Datastore,
            self.id,
            self.uid,
            self.gid,
            self.perms,
        )
        .with_clusters(self.cluster_ids.iter().copied().collect())
        .with_lock(self.lock)
    }
}

impl PoolObject for Datastore {
    const KIND: ObjectKind = ObjectKind::Datastore;

    fn oid(&self) -> i64 {
        self.id
    }

    fn set_oid(&mut self, oid: i64) {
        self.id = oid;
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_targets() {
        let shared = Datastore::new("img", DatastoreType::Image, "shared");
        assert_eq!(shared.disk_target(false), TmTarget::System);
        assert_eq!(shared.disk_target(true), TmTarget::None);

        let ssh = Datastore::new("img", DatastoreType::Image, "ssh");
        assert_eq!(ssh.disk_target(false), TmTarget::System);
        assert_eq!(ssh.disk_target(true), TmTarget::System);

        let ceph = Datastore::new("img", DatastoreType::Image, "ceph");
        assert_eq!(ceph.disk_target(false), TmTarget::SelfDs);
        assert_eq!(ceph.disk_target(true), TmTarget::None);
    }
}
