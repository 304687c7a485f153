// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Hypervisor hosts and their capacity shares.

use super::perms::{LockLevel, PermSnapshot, Permissions};
use super::{ObjectKind, PoolObject};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Host monitoring state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HostState {
    /// Just added, not yet monitored.
    Init,
    /// Monitored and schedulable.
    Monitored,
    /// Monitoring failed.
    Error,
    /// Administratively disabled; keeps running VMs.
    Disabled,
    /// Offline; accepts nothing.
    Offline,
}

impl HostState {
    /// Stable uppercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Monitored => "MONITORED",
            Self::Error => "ERROR",
            Self::Disabled => "DISABLED",
            Self::Offline => "OFFLINE",
        }
    }
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The capacity share of a host: totals and current allocations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostShare {
    /// Total CPU capacity, in the same fractional unit as VM cpu.
    pub total_cpu: f64,
    /// CPU currently allocated to VMs.
    pub used_cpu: f64,
    /// Total memory in MB.
    pub total_mem_mb: u64,
    /// Memory currently allocated to VMs, in MB.
    pub used_mem_mb: u64,
    /// Number of VMs placed on the host.
    pub running_vms: u64,
}

impl HostShare {
    /// Whether the share can hold an additional (cpu, memory) request.
    pub fn test_capacity(&self, cpu: f64, mem_mb: u64) -> bool {
        self.used_cpu + cpu <= self.total_cpu && self.used_mem_mb + mem_mb <= self.total_mem_mb
    }

    /// Account a placement.
    pub fn add_capacity(&mut self, cpu: f64, mem_mb: u64) {
        self.used_cpu += cpu;
        self.used_mem_mb += mem_mb;
        self.running_vms += 1;
    }

    /// Release a placement.
    pub fn del_capacity(&mut self, cpu: f64, mem_mb: u64) {
        self.used_cpu = (self.used_cpu - cpu).max(0.0);
        self.used_mem_mb = self.used_mem_mb.saturating_sub(mem_mb);
        self.running_vms = self.running_vms.saturating_sub(1);
    }
}

/// A hypervisor host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    /// Pool id.
    pub id: i64,
    /// Hostname.
    pub name: String,
    /// Owning user (infrastructure objects belong to the superuser).
    pub uid: i64,
    /// Owning group.
    pub gid: i64,
    /// Permission bits.
    pub perms: Permissions,
    /// Lock level.
    #[serde(default)]
    pub lock: LockLevel,
    /// Monitoring state.
    pub state: HostState,
    /// Cluster this host belongs to.
    pub cluster_id: i64,
    /// Hypervisor driver ("kvm", ...).
    pub vmm_driver: String,
    /// Capacity share.
    pub share: HostShare,
}

impl Host {
    /// A new monitored host in the given cluster.
    pub fn new(name: &str, cluster_id: i64, vmm_driver: &str) -> Self {
        Self {
            id: -1,
            name: name.to_string(),
            uid: 0,
            gid: 0,
            perms: Permissions::default(),
            lock: LockLevel::None,
            state: HostState::Monitored,
            cluster_id,
            vmm_driver: vmm_driver.to_string(),
            share: HostShare::default(),
        }
    }

    /// Capture the permission snapshot.
    pub fn perm_snapshot(&self) -> PermSnapshot {
        PermSnapshot::new(ObjectKind::Host, self.id, self.uid, self.gid, self.perms)
            .with_clusters(vec![self.cluster_id])
            .with_lock(self.lock)
    }
}

impl PoolObject for Host {
    const KIND: ObjectKind = ObjectKind::Host;

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
    fn test_capacity_accounting() {
        let mut share = HostShare {
            total_cpu: 4.0,
            total_mem_mb: 8192,
            ..Default::default()
        };
        assert!(share.test_capacity(2.0, 4096));
        share.add_capacity(2.0, 4096);
        assert!(share.test_capacity(2.0, 4096));
        share.add_capacity(2.0, 4096);
        assert!(!share.test_capacity(0.5, 1));
        share.del_capacity(2.0, 4096);
        assert!(share.test_capacity(1.0, 1024));
        assert_eq!(share.running_vms, 1);
    }
}
