// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The quota ledger: per-subject counters, checked commits and
//! compensating rollbacks.
//!
//! Quota is evaluated separately for the owning user and the owning group.
//! `authorize` is all-or-nothing per call: either every named counter fits
//! and all of them are committed, or nothing is. `rollback` is the
//! compensating inverse - an unchecked subtraction, not a transactional
//! undo log; callers invoke it exactly once per committed authorize whose
//! enclosing action later fails.

pub mod reservation;

pub use reservation::Reservations;

use crate::error::{CoreError, Result};
use crate::objects::{Group, User};
use crate::pool::Pool;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// Sentinel limit: no limit enforced.
pub const LIMIT_UNLIMITED: i64 = -1;

/// An integer usage/limit pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    /// Current accumulated usage.
    pub usage: i64,
    /// Limit; [`LIMIT_UNLIMITED`] disables the check.
    pub limit: i64,
}

impl Default for Counter {
    fn default() -> Self {
        Self {
            usage: 0,
            limit: LIMIT_UNLIMITED,
        }
    }
}

impl Counter {
    fn fits(&self, delta: i64, exempt: bool) -> bool {
        delta <= 0 || exempt || self.limit == LIMIT_UNLIMITED || self.usage + delta <= self.limit
    }

    fn add(&mut self, delta: i64) {
        self.usage = (self.usage + delta).max(0);
    }

    fn sub(&mut self, delta: i64) {
        self.usage = (self.usage - delta).max(0);
    }
}

/// A fractional usage/limit pair (CPU shares).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CounterF {
    /// Current accumulated usage.
    pub usage: f64,
    /// Limit; negative disables the check.
    pub limit: f64,
}

impl Default for CounterF {
    fn default() -> Self {
        Self {
            usage: 0.0,
            limit: -1.0,
        }
    }
}

impl CounterF {
    fn fits(&self, delta: f64, exempt: bool) -> bool {
        delta <= 0.0 || exempt || self.limit < 0.0 || self.usage + delta <= self.limit
    }

    fn add(&mut self, delta: f64) {
        self.usage = (self.usage + delta).max(0.0);
    }

    fn sub(&mut self, delta: f64) {
        self.usage = (self.usage - delta).max(0.0);
    }
}

/// VM-class counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct VmQuota {
    /// Total VMs.
    pub vms: Counter,
    /// VMs in running states.
    pub running_vms: Counter,
    /// Total CPU share.
    pub cpu: CounterF,
    /// CPU share of running VMs.
    pub running_cpu: CounterF,
    /// Total memory in MB.
    pub memory_mb: Counter,
    /// Memory of running VMs in MB.
    pub running_memory_mb: Counter,
    /// System-datastore disk footprint in MB.
    pub system_disk_mb: Counter,
}

/// Per-datastore counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DatastoreQuota {
    /// Bytes (MB) used on the datastore.
    pub size_mb: Counter,
    /// Images registered on the datastore.
    pub images: Counter,
}

/// The full counter set of one subject (user or group).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuotaCounters {
    /// VM-class counters.
    pub vm: VmQuota,
    /// Per-datastore counters.
    pub datastores: BTreeMap<i64, DatastoreQuota>,
    /// Per-network lease counters.
    pub networks: BTreeMap<i64, Counter>,
    /// Per-image running-VM counters.
    pub images: BTreeMap<i64, Counter>,
}

/// A delta against the VM-class counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct VmDelta {
    /// Change in VM count.
    pub vms: i64,
    /// Change in running-VM count.
    pub running_vms: i64,
    /// Change in CPU share.
    pub cpu: f64,
    /// Change in running CPU share.
    pub running_cpu: f64,
    /// Change in memory MB.
    pub memory_mb: i64,
    /// Change in running memory MB.
    pub running_memory_mb: i64,
    /// Change in system-datastore footprint MB.
    pub system_disk_mb: i64,
}

impl VmDelta {
    /// A delta that only moves the system-disk footprint.
    pub fn system_disk(mb: i64) -> Self {
        Self {
            system_disk_mb: mb,
            ..Default::default()
        }
    }

    /// The running-state footprint of a VM with the given capacity.
    pub fn running(cpu: f64, memory_mb: i64) -> Self {
        Self {
            running_vms: 1,
            running_cpu: cpu,
            running_memory_mb: memory_mb,
            ..Default::default()
        }
    }
}

/// A delta against one datastore's counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DsDelta {
    /// The datastore charged.
    pub ds_id: i64,
    /// Change in MB used.
    pub size_mb: i64,
    /// Change in image count.
    pub images: i64,
}

/// A delta against one network's lease counter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetDelta {
    /// The network charged.
    pub net_id: i64,
    /// Change in lease count.
    pub leases: i64,
}

/// A named set of counter changes, applied or reverted as one call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QuotaDeltas {
    /// VM-class changes.
    pub vm: Option<VmDelta>,
    /// Per-datastore changes, in charge order.
    pub datastores: Vec<DsDelta>,
    /// Per-network changes.
    pub networks: Vec<NetDelta>,
}

impl QuotaDeltas {
    /// An empty delta set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delta set with a VM-class change.
    pub fn vm(delta: VmDelta) -> Self {
        Self {
            vm: Some(delta),
            ..Default::default()
        }
    }

    /// Add a datastore charge.
    pub fn with_datastore(mut self, ds_id: i64, size_mb: i64, images: i64) -> Self {
        self.datastores.push(DsDelta {
            ds_id,
            size_mb,
            images,
        });
        self
    }

    /// Add a network lease charge.
    pub fn with_network(mut self, net_id: i64, leases: i64) -> Self {
        self.networks.push(NetDelta { net_id, leases });
        self
    }

    /// Whether nothing would change.
    pub fn is_empty(&self) -> bool {
        self.vm.is_none() && self.datastores.is_empty() && self.networks.is_empty()
    }
}

/// The name and limit of the first counter a delta set does not fit.
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaViolation {
    /// Human-readable counter name ("VMS", "DATASTORE [100] SIZE", ...).
    pub counter: String,
    /// The configured limit, rendered.
    pub limit: String,
}

impl QuotaCounters {
    /// Check every counter named in `deltas`, in fixed order. Does not
    /// mutate anything.
    pub fn check(&self, deltas: &QuotaDeltas, exempt: bool) -> std::result::Result<(), QuotaViolation> {
        if let Some(vm) = &deltas.vm {
            let checks: [(&str, bool, String); 7] = [
                ("VMS", self.vm.vms.fits(vm.vms, exempt), self.vm.vms.limit.to_string()),
                (
                    "RUNNING_VMS",
                    self.vm.running_vms.fits(vm.running_vms, exempt),
                    self.vm.running_vms.limit.to_string(),
                ),
                ("CPU", self.vm.cpu.fits(vm.cpu, exempt), self.vm.cpu.limit.to_string()),
                (
                    "RUNNING_CPU",
                    self.vm.running_cpu.fits(vm.running_cpu, exempt),
                    self.vm.running_cpu.limit.to_string(),
                ),
                (
                    "MEMORY",
                    self.vm.memory_mb.fits(vm.memory_mb, exempt),
                    self.vm.memory_mb.limit.to_string(),
                ),
                (
                    "RUNNING_MEMORY",
                    self.vm.running_memory_mb.fits(vm.running_memory_mb, exempt),
                    self.vm.running_memory_mb.limit.to_string(),
                ),
                (
                    "SYSTEM_DISK_SIZE",
                    self.vm.system_disk_mb.fits(vm.system_disk_mb, exempt),
                    self.vm.system_disk_mb.limit.to_string(),
                ),
            ];
            for (name, fits, limit) in checks {
                if !fits {
                    return Err(QuotaViolation {
                        counter: name.to_string(),
                        limit,
                    });
                }
            }
        }
        for ds in &deltas.datastores {
            let counters = self.datastores.get(&ds.ds_id).copied().unwrap_or_default();
            if !counters.size_mb.fits(ds.size_mb, exempt) {
                return Err(QuotaViolation {
                    counter: format!("DATASTORE [{}] SIZE", ds.ds_id),
                    limit: counters.size_mb.limit.to_string(),
                });
            }
            if !counters.images.fits(ds.images, exempt) {
                return Err(QuotaViolation {
                    counter: format!("DATASTORE [{}] IMAGES", ds.ds_id),
                    limit: counters.images.limit.to_string(),
                });
            }
        }
        for net in &deltas.networks {
            let counter = self.networks.get(&net.net_id).copied().unwrap_or_default();
            if !counter.fits(net.leases, exempt) {
                return Err(QuotaViolation {
                    counter: format!("NET [{}] LEASES", net.net_id),
                    limit: counter.limit.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Commit a delta set. Callers check first; this never fails.
    pub fn apply(&mut self, deltas: &QuotaDeltas) {
        if let Some(vm) = &deltas.vm {
            self.vm.vms.add(vm.vms);
            self.vm.running_vms.add(vm.running_vms);
            self.vm.cpu.add(vm.cpu);
            self.vm.running_cpu.add(vm.running_cpu);
            self.vm.memory_mb.add(vm.memory_mb);
            self.vm.running_memory_mb.add(vm.running_memory_mb);
            self.vm.system_disk_mb.add(vm.system_disk_mb);
        }
        for ds in &deltas.datastores {
            let counters = self.datastores.entry(ds.ds_id).or_default();
            counters.size_mb.add(ds.size_mb);
            counters.images.add(ds.images);
        }
        for net in &deltas.networks {
            self.networks.entry(net.net_id).or_default().add(net.leases);
        }
    }

    /// Revert a delta set. Unchecked; usage floors at zero.
    pub fn revert(&mut self, deltas: &QuotaDeltas) {
        if let Some(vm) = &deltas.vm {
            self.vm.vms.sub(vm.vms);
            self.vm.running_vms.sub(vm.running_vms);
            self.vm.cpu.sub(vm.cpu);
            self.vm.running_cpu.sub(vm.running_cpu);
            self.vm.memory_mb.sub(vm.memory_mb);
            self.vm.running_memory_mb.sub(vm.running_memory_mb);
            self.vm.system_disk_mb.sub(vm.system_disk_mb);
        }
        for ds in &deltas.datastores {
            let counters = self.datastores.entry(ds.ds_id).or_default();
            counters.size_mb.sub(ds.size_mb);
            counters.images.sub(ds.images);
        }
        for net in &deltas.networks {
            self.networks.entry(net.net_id).or_default().sub(net.leases);
        }
    }
}

/// The subject pair a delta set is charged to: the resource owner's user
/// and group, never the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subject {
    /// Owning user.
    pub uid: i64,
    /// Owning group.
    pub gid: i64,
}

/// Applies quota deltas to user and group subjects through their pools.
///
/// Counters only ever change under the owning object's exclusive lock, so
/// two concurrent actions charging the same subject serialize on that
/// lock.
#[derive(Clone)]
pub struct QuotaManager {
    users: Pool<User>,
    groups: Pool<Group>,
}

impl QuotaManager {
    /// A manager over the given subject pools.
    pub fn new(users: Pool<User>, groups: Pool<Group>) -> Self {
        Self { users, groups }
    }

    /// Check-and-commit `deltas` for both subjects.
    ///
    /// The user is charged first, then the group; a group-side failure
    /// reverts the user-side commit before returning. The superuser
    /// (uid/gid 0) is exempt from limit checks but still accumulates
    /// usage.
    pub async fn authorize(&self, subject: Subject, deltas: &QuotaDeltas) -> Result<()> {
        if deltas.is_empty() {
            return Ok(());
        }

        {
            let mut user = self.users.get(subject.uid).await?;
            user.quota
                .check(deltas, subject.uid == 0)
                .map_err(|v| quota_denied("USER", subject.uid, &v))?;
            user.quota.apply(deltas);
            self.users.update(&user).await?;
        }

        let group_outcome: Result<()> = async {
            let mut group = self.groups.get(subject.gid).await?;
            group
                .quota
                .check(deltas, subject.gid == 0)
                .map_err(|v| quota_denied("GROUP", subject.gid, &v))?;
            group.quota.apply(deltas);
            self.groups.update(&group).await?;
            Ok(())
        }
        .await;

        if let Err(err) = group_outcome {
            // Compensate the user-side commit before surfacing the error.
            if let Ok(mut user) = self.users.get(subject.uid).await {
                user.quota.revert(deltas);
                let _ = self.users.update(&user).await;
            }
            return Err(err);
        }

        Ok(())
    }

    /// Compensating inverse of a committed [`authorize`](Self::authorize).
    ///
    /// Unchecked; missing subjects are logged and skipped so a compensation
    /// chain never aborts halfway.
    pub async fn rollback(&self, subject: Subject, deltas: &QuotaDeltas) -> Result<()> {
        if deltas.is_empty() {
            return Ok(());
        }

        match self.users.get(subject.uid).await {
            Ok(mut user) => {
                user.quota.revert(deltas);
                self.users.update(&user).await?;
            }
            Err(err) => {
                warn!(uid = subject.uid, %err, "quota rollback: user vanished");
            }
        }

        match self.groups.get(subject.gid).await {
            Ok(mut group) => {
                group.quota.revert(deltas);
                self.groups.update(&group).await?;
            }
            Err(err) => {
                warn!(gid = subject.gid, %err, "quota rollback: group vanished");
            }
        }

        Ok(())
    }
}

fn quota_denied(kind: &str, id: i64, violation: &QuotaViolation) -> CoreError {
    CoreError::authorization(format!(
        "quota exceeded for {} [{}]: limit of {} reached for {}",
        kind, id, violation.limit, violation.counter
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limited() -> QuotaCounters {
        let mut q = QuotaCounters::default();
        q.vm.vms.limit = 2;
        q.vm.cpu.limit = 4.0;
        q.vm.memory_mb.limit = 4096;
        q.datastores.insert(
            100,
            DatastoreQuota {
                size_mb: Counter {
                    usage: 0,
                    limit: 10_000,
                },
                images: Counter::default(),
            },
        );
        q
    }

    fn vm_deltas(vms: i64, cpu: f64, memory_mb: i64) -> QuotaDeltas {
        QuotaDeltas::vm(VmDelta {
            vms,
            cpu,
            memory_mb,
            ..Default::default()
        })
    }

    #[test]
    fn test_all_or_nothing_check() {
        let mut q = limited();
        // Memory exceeds: nothing may be committed.
        let deltas = vm_deltas(1, 1.0, 8192);
        let violation = q.check(&deltas, false).unwrap_err();
        assert_eq!(violation.counter, "MEMORY");

        // check() alone never mutates.
        assert_eq!(q.vm.vms.usage, 0);

        let ok = vm_deltas(1, 1.0, 1024);
        q.check(&ok, false).unwrap();
        q.apply(&ok);
        assert_eq!(q.vm.vms.usage, 1);
        assert_eq!(q.vm.memory_mb.usage, 1024);
    }

    #[test]
    fn test_exempt_subject_still_accumulates() {
        let mut q = limited();
        let deltas = vm_deltas(10, 100.0, 100_000);
        q.check(&deltas, true).unwrap();
        q.apply(&deltas);
        assert_eq!(q.vm.vms.usage, 10);
    }

    #[test]
    fn test_revert_restores_exactly() {
        let mut q = limited();
        let deltas = vm_deltas(1, 2.0, 2048).with_datastore(100, 5000, 0);
        let before = q.clone();
        q.check(&deltas, false).unwrap();
        q.apply(&deltas);
        assert_ne!(q, before);
        q.revert(&deltas);
        assert_eq!(q, before);
    }

    #[test]
    fn test_revert_floors_at_zero() {
        let mut q = QuotaCounters::default();
        q.revert(&vm_deltas(5, 5.0, 5000));
        assert_eq!(q.vm.vms.usage, 0);
        assert_eq!(q.vm.memory_mb.usage, 0);
    }

    #[test]
    fn test_datastore_violation_names_datastore() {
        let q = limited();
        let deltas = QuotaDeltas::new().with_datastore(100, 20_000, 0);
        let violation = q.check(&deltas, false).unwrap_err();
        assert_eq!(violation.counter, "DATASTORE [100] SIZE");
        assert_eq!(violation.limit, "10000");
    }

    #[test]
    fn test_unknown_datastore_defaults_unlimited() {
        let q = limited();
        let deltas = QuotaDeltas::new().with_datastore(999, 1 << 40, 0);
        q.check(&deltas, false).unwrap();
    }

    #[test]
    fn test_negative_delta_always_fits() {
        let mut q = limited();
        q.vm.vms.usage = 2;
        let deltas = vm_deltas(-1, 0.0, 0);
        q.check(&deltas, false).unwrap();
        q.apply(&deltas);
        assert_eq!(q.vm.vms.usage, 1);
    }
}
