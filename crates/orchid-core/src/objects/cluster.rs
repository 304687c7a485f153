// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Clusters: membership sets plus the per-cluster VNC port bitmap.

use super::bitmap::PortBitmap;
use super::perms::{LockLevel, PermSnapshot, Permissions};
use super::{ObjectKind, PoolObject};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A cluster of hosts, datastores and virtual networks.
///
/// Membership sets are ordered so "the first system datastore of the
/// cluster" is deterministic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
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
    /// Member hosts.
    pub hosts: BTreeSet<i64>,
    /// Member datastores.
    pub datastores: BTreeSet<i64>,
    /// Member virtual networks.
    pub vnets: BTreeSet<i64>,
    /// VNC port occupancy for VMs placed in this cluster.
    pub vnc_ports: PortBitmap,
}

impl Cluster {
    /// A new empty cluster with the given VNC port range.
    pub fn new(name: &str, vnc_base_port: u16, vnc_ports: u32) -> Self {
        Self {
            id: -1,
            name: name.to_string(),
            uid: 0,
            gid: 0,
            perms: Permissions::default(),
            lock: LockLevel::None,
            hosts: BTreeSet::new(),
            datastores: BTreeSet::new(),
            vnets: BTreeSet::new(),
            vnc_ports: PortBitmap::new(vnc_base_port, vnc_ports),
        }
    }

    /// Add a host to the membership set.
    pub fn add_host(&mut self, host_id: i64) -> Result<(), String> {
        if !self.hosts.insert(host_id) {
            return Err(format!("HOST [{}] is already in the cluster", host_id));
        }
        Ok(())
    }

    /// Remove a host from the membership set.
    pub fn del_host(&mut self, host_id: i64) -> Result<(), String> {
        if !self.hosts.remove(&host_id) {
            return Err(format!("HOST [{}] is not in the cluster", host_id));
        }
        Ok(())
    }

    /// Add a datastore to the membership set.
    pub fn add_datastore(&mut self, ds_id: i64) -> Result<(), String> {
        if !self.datastores.insert(ds_id) {
            return Err(format!("DATASTORE [{}] is already in the cluster", ds_id));
        }
        Ok(())
    }

    /// Remove a datastore from the membership set.
    pub fn del_datastore(&mut self, ds_id: i64) -> Result<(), String> {
        if !self.datastores.remove(&ds_id) {
            return Err(format!("DATASTORE [{}] is not in the cluster", ds_id));
        }
        Ok(())
    }

    /// Add a virtual network to the membership set.
    pub fn add_vnet(&mut self, net_id: i64) -> Result<(), String> {
        if !self.vnets.insert(net_id) {
            return Err(format!("NET [{}] is already in the cluster", net_id));
        }
        Ok(())
    }

    /// Remove a virtual network from the membership set.
    pub fn del_vnet(&mut self, net_id: i64) -> Result<(), String> {
        if !self.vnets.remove(&net_id) {
            return Err(format!("NET [{}] is not in the cluster", net_id));
        }
        Ok(())
    }

    /// Capture the permission snapshot.
    pub fn perm_snapshot(&self) -> PermSnapshot {
        PermSnapshot::new(ObjectKind::Cluster, self.id, self.uid, self.gid, self.perms)
            .with_clusters(vec![self.id])
            .with_lock(self.lock)
    }
}

impl PoolObject for Cluster {
    const KIND: ObjectKind = ObjectKind::Cluster;

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
    fn test_membership() {
        let mut cluster = Cluster::new("default", 5900, 64);
        cluster.add_host(3).unwrap();
        assert!(cluster.add_host(3).is_err());
        cluster.del_host(3).unwrap();
        assert!(cluster.del_host(3).is_err());

        cluster.add_datastore(100).unwrap();
        cluster.add_vnet(5).unwrap();
        assert!(cluster.datastores.contains(&100));
        assert!(cluster.vnets.contains(&5));
    }
}
