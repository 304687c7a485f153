// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The virtual machine object: lifecycle state, placement history and the
//! disk set.
//!
//! # State machine
//!
//! ```text
//!                  ┌─────────┐  hold   ┌──────┐
//!                  │ PENDING │◄───────►│ HOLD │
//!                  └────┬────┘ release └──────┘
//!                deploy │
//!                       ▼
//!                  ┌────────┐ poweroff ┌──────────┐
//!        ┌────────►│ ACTIVE │─────────►│ POWEROFF │
//!        │         └───┬────┘          └─────┬────┘
//!        │    suspend  │  stop / undeploy    │ resume
//!        │             ▼                     │
//!        │  ┌───────────┐ ┌─────────┐ ┌────────────┐
//!        │  │ SUSPENDED │ │ STOPPED │ │ UNDEPLOYED │
//!        │  └─────┬─────┘ └────┬────┘ └──────┬─────┘
//!        │ resume │            │ resume      │ resume (via PENDING)
//!        └────────┴────────────┴─────────────┘
//!
//!              terminate (any state) ──► DONE
//! ```
//!
//! While ACTIVE, the lcm-state tracks the hypervisor-facing sub-state
//! (RUNNING, HOTPLUG, HOTPLUG_RESIZE, UNKNOWN, ...).

use super::disk::DiskSet;
use super::perms::{LockLevel, PermSnapshot, Permissions};
use super::{ObjectKind, PoolObject};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Top-level VM lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum VmState {
    /// Just allocated, not yet schedulable.
    Init,
    /// Waiting for placement.
    Pending,
    /// Held back from scheduling.
    Hold,
    /// Deployed on a host.
    Active,
    /// State saved to the system datastore, host released.
    Stopped,
    /// Suspended in place on its host.
    Suspended,
    /// Terminated; waiting to be reaped.
    Done,
    /// Powered off, placement kept.
    Poweroff,
    /// Powered off, host resources freed, disks kept.
    Undeployed,
}

impl VmState {
    /// Stable uppercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Pending => "PENDING",
            Self::Hold => "HOLD",
            Self::Active => "ACTIVE",
            Self::Stopped => "STOPPED",
            Self::Suspended => "SUSPENDED",
            Self::Done => "DONE",
            Self::Poweroff => "POWEROFF",
            Self::Undeployed => "UNDEPLOYED",
        }
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sub-state while the VM is ACTIVE.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LcmState {
    /// Not in a life-cycle transition.
    #[default]
    LcmInit,
    /// Transferring disks to the host.
    Prolog,
    /// Guest is running.
    Running,
    /// A device is being hotplugged.
    Hotplug,
    /// Capacity is being resized live.
    HotplugResize,
    /// Cleaning up after the guest.
    Epilog,
    /// Monitoring lost contact with the guest.
    Unknown,
}

impl LcmState {
    /// Stable uppercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LcmInit => "LCM_INIT",
            Self::Prolog => "PROLOG",
            Self::Running => "RUNNING",
            Self::Hotplug => "HOTPLUG",
            Self::HotplugResize => "HOTPLUG_RESIZE",
            Self::Epilog => "EPILOG",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for LcmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One placement of the VM: host, cluster, drivers and system datastore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Sequence number, starting at 0.
    pub seq: i64,
    /// Host the VM was placed on.
    pub host_id: i64,
    /// Cluster of that host.
    pub cluster_id: i64,
    /// Hostname at placement time.
    pub hostname: String,
    /// Hypervisor driver.
    pub vmm_driver: String,
    /// Transfer driver of the system datastore.
    pub tm_driver: String,
    /// System datastore.
    pub ds_id: i64,
    /// When the record was opened.
    pub stime: DateTime<Utc>,
    /// When the record was closed; open record when absent.
    pub etime: Option<DateTime<Utc>>,
    /// Record was reopened after a poweroff-style interruption.
    #[serde(default)]
    pub reopened: bool,
    /// VNC port kept alive in the previous cluster during a live
    /// migration's transfer window.
    #[serde(default)]
    pub prev_vnc_port: Option<u16>,
}

/// Backup bookkeeping of one VM.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackupState {
    /// A backup is currently running.
    pub in_progress: bool,
    /// Include volatile FS disks in backups.
    pub include_volatile: bool,
    /// Id of the last increment; full backup chain when absent.
    pub last_increment_id: Option<i64>,
    /// Datastore backups go to by default.
    pub datastore_id: Option<i64>,
    /// Datastore holding the in-flight backup's reservation.
    #[serde(default)]
    pub pending_ds: Option<i64>,
    /// Size reserved for the in-flight backup, in MB.
    #[serde(default)]
    pub pending_size_mb: u64,
}

/// A virtual machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vm {
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
    /// Lifecycle state.
    pub state: VmState,
    /// Sub-state while ACTIVE.
    #[serde(default)]
    pub lcm_state: LcmState,
    /// The VM was imported from an unmanaged hypervisor.
    #[serde(default)]
    pub imported: bool,
    /// Flagged for rescheduling.
    #[serde(default)]
    pub resched: bool,
    /// Fractional CPU share.
    pub cpu: f64,
    /// Virtual CPU count.
    pub vcpu: u32,
    /// Memory in MB.
    pub memory_mb: u64,
    /// NUMA-pinned VMs always enforce host capacity and cannot migrate live.
    #[serde(default)]
    pub numa_pinned: bool,
    /// Number of PCI passthrough devices.
    #[serde(default)]
    pub pci_devices: u32,
    /// VNC graphics requested.
    #[serde(default)]
    pub graphics: bool,
    /// VNC port currently assigned.
    #[serde(default)]
    pub vnc_port: Option<u16>,
    /// Device target reserved for the context CD.
    #[serde(default)]
    pub context_target: Option<String>,
    /// Networks this VM holds a lease on.
    #[serde(default)]
    pub nics: Vec<i64>,
    /// The disk set.
    #[serde(default)]
    pub disks: DiskSet,
    /// Placement history, oldest first.
    #[serde(default)]
    pub history: Vec<HistoryRecord>,
    /// Backup bookkeeping.
    #[serde(default)]
    pub backup: BackupState,
}

impl Vm {
    /// A new VM in PENDING with the given identity and capacity.
    pub fn new(name: &str, uid: i64, gid: i64, cpu: f64, vcpu: u32, memory_mb: u64) -> Self {
        Self {
            id: -1,
            name: name.to_string(),
            uid,
            gid,
            perms: Permissions::default(),
            lock: LockLevel::None,
            state: VmState::Pending,
            lcm_state: LcmState::LcmInit,
            imported: false,
            resched: false,
            cpu,
            vcpu,
            memory_mb,
            numa_pinned: false,
            pci_devices: 0,
            graphics: false,
            vnc_port: None,
            context_target: None,
            nics: Vec::new(),
            disks: DiskSet::new(),
            history: Vec::new(),
            backup: BackupState::default(),
        }
    }

    /// The open (most recent) history record, if any.
    pub fn last_history(&self) -> Option<&HistoryRecord> {
        self.history.last()
    }

    /// The open history record, mutably.
    pub fn last_history_mut(&mut self) -> Option<&mut HistoryRecord> {
        self.history.last_mut()
    }

    /// Whether the VM has ever been placed.
    pub fn has_history(&self) -> bool {
        !self.history.is_empty()
    }

    /// Append a new history record for a placement. Returns its sequence
    /// number.
    pub fn add_history(
        &mut self,
        host_id: i64,
        cluster_id: i64,
        hostname: &str,
        vmm_driver: &str,
        tm_driver: &str,
        ds_id: i64,
    ) -> i64 {
        let seq = self.history.last().map_or(0, |h| h.seq + 1);
        self.history.push(HistoryRecord {
            seq,
            host_id,
            cluster_id,
            hostname: hostname.to_string(),
            vmm_driver: vmm_driver.to_string(),
            tm_driver: tm_driver.to_string(),
            ds_id,
            stime: Utc::now(),
            etime: None,
            reopened: false,
            prev_vnc_port: None,
        });
        seq
    }

    /// Close the open history record.
    pub fn close_history(&mut self) {
        if let Some(h) = self.history.last_mut() {
            if h.etime.is_none() {
                h.etime = Some(Utc::now());
            }
        }
    }

    /// Whether the VM is in a state at all (i.e. not terminated).
    pub fn is_done(&self) -> bool {
        matches!(self.state, VmState::Done)
    }

    /// Whether the VM currently consumes running quota.
    pub fn is_running_state(&self) -> bool {
        matches!(
            self.state,
            VmState::Active | VmState::Pending | VmState::Hold
        )
    }

    /// Capture the permission snapshot. The cluster set is the current
    /// placement's cluster.
    pub fn perm_snapshot(&self) -> PermSnapshot {
        let clusters = self
            .last_history()
            .map(|h| vec![h.cluster_id])
            .unwrap_or_default();
        PermSnapshot::new(ObjectKind::Vm, self.id, self.uid, self.gid, self.perms)
            .with_clusters(clusters)
            .with_lock(self.lock)
    }
}

impl PoolObject for Vm {
    const KIND: ObjectKind = ObjectKind::Vm;

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
