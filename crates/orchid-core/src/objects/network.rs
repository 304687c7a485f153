// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Virtual networks: lease accounting and cluster reachability.

use super::perms::{LockLevel, PermSnapshot, Permissions};
use super::{ObjectKind, PoolObject};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A virtual network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualNetwork {
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
    /// Clusters that can reach this network.
    pub cluster_ids: BTreeSet<i64>,
    /// Total leases in the address range.
    pub total_leases: u64,
    /// Leases currently handed out.
    pub used_leases: u64,
}

impl VirtualNetwork {
    /// A new network with the given lease range size.
    pub fn new(name: &str, total_leases: u64) -> Self {
        Self {
            id: -1,
            name: name.to_string(),
            uid: 0,
            gid: 0,
            perms: Permissions::default(),
            lock: LockLevel::None,
            cluster_ids: BTreeSet::new(),
            total_leases,
            used_leases: 0,
        }
    }

    /// Hand out one lease.
    pub fn acquire_lease(&mut self) -> Result<(), String> {
        if self.used_leases >= self.total_leases {
            return Err(format!("NET [{}] has no free lease", self.id));
        }
        self.used_leases += 1;
        Ok(())
    }

    /// Return one lease.
    pub fn release_lease(&mut self) {
        self.used_leases = self.used_leases.saturating_sub(1);
    }

    /// Whether the network is reachable from the given cluster.
    pub fn in_cluster(&self, cluster_id: i64) -> bool {
        self.cluster_ids.contains(&cluster_id)
    }

    /// Capture the permission snapshot.
    pub fn perm_snapshot(&self) -> PermSnapshot {
        PermSnapshot::new(ObjectKind::Network, self.id, self.uid, self.gid, self.perms)
            .with_clusters(self.cluster_ids.iter().copied().collect())
            .with_lock(self.lock)
    }
}

impl PoolObject for VirtualNetwork {
    const KIND: ObjectKind = ObjectKind::Network;

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
