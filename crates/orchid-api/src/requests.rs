// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request and response types for control-plane operations.
//!
//! Each struct corresponds to one call on the action surface. Sessions are
//! opaque `username:secret` strings resolved by the core; object ids are the
//! integer pool ids.

use crate::VmAction;
use serde::{Deserialize, Serialize};

/// NIC template for deploy-time network attachment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NicTemplate {
    /// Network to lease an address from.
    pub network_id: i64,
}

/// `vm.deploy` - place a pending VM on a host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployRequest {
    /// Caller session.
    pub session: String,
    /// Target VM.
    pub vm_id: i64,
    /// Target host.
    pub host_id: i64,
    /// Enforce host capacity checks even for non-pinned VMs.
    #[serde(default)]
    pub enforce: bool,
    /// Explicit system datastore; cluster default when absent.
    #[serde(default)]
    pub datastore_id: Option<i64>,
    /// Additional NIC attached at deploy time.
    #[serde(default)]
    pub nic: Option<NicTemplate>,
}

/// `vm.migrate` - move a deployed VM to another host and/or datastore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrateRequest {
    /// Caller session.
    pub session: String,
    /// Target VM.
    pub vm_id: i64,
    /// Destination host.
    pub host_id: i64,
    /// Live migration (guest keeps running).
    #[serde(default)]
    pub live: bool,
    /// Enforce host capacity checks.
    #[serde(default)]
    pub enforce: bool,
    /// Explicit destination system datastore; keep current when absent.
    #[serde(default)]
    pub datastore_id: Option<i64>,
    /// Power the VM off first when PCI passthrough would otherwise block
    /// the migration.
    #[serde(default)]
    pub poweroff_first: bool,
}

/// `vm.action` - a generic lifecycle action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmActionRequest {
    /// Caller session.
    pub session: String,
    /// The requested action.
    pub action: VmAction,
    /// Target VM.
    pub vm_id: i64,
}

/// Disk template for `vm.attach`.
///
/// Either `image_id` names an image to check out, or `size_mb` plus
/// `volatile_type` describe a volatile disk created on the fly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiskTemplate {
    /// Image to attach; volatile disk when absent.
    #[serde(default)]
    pub image_id: Option<i64>,
    /// Size in MB. Required for volatile disks; overrides the image size
    /// when larger.
    #[serde(default)]
    pub size_mb: Option<u64>,
    /// Volatile disk type: "fs" or "swap". Ignored for image-backed disks.
    #[serde(default)]
    pub volatile_type: Option<String>,
    /// Disk format ("raw", "qcow2"). Defaults to the image's format.
    #[serde(default)]
    pub format: Option<String>,
    /// Explicit device target (e.g. "vdc"). Probed from the device prefix
    /// when absent.
    #[serde(default)]
    pub target: Option<String>,
    /// Device prefix used for target probing ("vd", "sd", "hd").
    #[serde(default)]
    pub dev_prefix: Option<String>,
}

/// `vm.attach` - hot- or cold-plug a disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachDiskRequest {
    /// Caller session.
    pub session: String,
    /// Target VM.
    pub vm_id: i64,
    /// The disk to create.
    pub disk: DiskTemplate,
}

/// Response for `vm.attach`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachDiskResponse {
    /// Id assigned to the new disk.
    pub disk_id: i64,
    /// Device target assigned to the new disk.
    pub target: String,
}

/// `vm.detach` - remove a disk from a VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetachDiskRequest {
    /// Caller session.
    pub session: String,
    /// Target VM.
    pub vm_id: i64,
    /// Disk to remove.
    pub disk_id: i64,
}

/// `vm.resize` - change VM capacity (CPU, VCPU, memory).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResizeRequest {
    /// Caller session.
    pub session: String,
    /// Target VM.
    pub vm_id: i64,
    /// New fractional CPU share; unchanged when absent.
    #[serde(default)]
    pub cpu: Option<f64>,
    /// New virtual CPU count; unchanged when absent.
    #[serde(default)]
    pub vcpu: Option<u32>,
    /// New memory in MB; unchanged when absent.
    #[serde(default)]
    pub memory_mb: Option<u64>,
    /// Enforce host capacity for deployed VMs.
    #[serde(default)]
    pub enforce: bool,
}

/// `vm.disksnapshotcreate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskSnapshotCreateRequest {
    /// Caller session.
    pub session: String,
    /// Target VM.
    pub vm_id: i64,
    /// Disk to snapshot.
    pub disk_id: i64,
    /// Snapshot name.
    pub name: String,
}

/// Response for `vm.disksnapshotcreate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskSnapshotCreateResponse {
    /// Id assigned to the new snapshot.
    pub snapshot_id: i64,
}

/// `vm.disksnapshotrevert`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskSnapshotRevertRequest {
    /// Caller session.
    pub session: String,
    /// Target VM.
    pub vm_id: i64,
    /// Disk owning the snapshot.
    pub disk_id: i64,
    /// Snapshot to revert to.
    pub snapshot_id: i64,
}

/// `vm.disksnapshotdelete`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskSnapshotDeleteRequest {
    /// Caller session.
    pub session: String,
    /// Target VM.
    pub vm_id: i64,
    /// Disk owning the snapshot.
    pub disk_id: i64,
    /// Snapshot to delete.
    pub snapshot_id: i64,
}

/// `vm.disksnapshotrename`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskSnapshotRenameRequest {
    /// Caller session.
    pub session: String,
    /// Target VM.
    pub vm_id: i64,
    /// Disk owning the snapshot.
    pub disk_id: i64,
    /// Snapshot to rename.
    pub snapshot_id: i64,
    /// New name.
    pub new_name: String,
}

/// `vm.diskresize` - grow a disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskResizeRequest {
    /// Caller session.
    pub session: String,
    /// Target VM.
    pub vm_id: i64,
    /// Disk to grow.
    pub disk_id: i64,
    /// New size in MB; must exceed the current size.
    pub new_size_mb: u64,
}

/// `vm.backup`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRequest {
    /// Caller session.
    pub session: String,
    /// Target VM.
    pub vm_id: i64,
    /// Backup datastore; the VM's configured one when absent.
    #[serde(default)]
    pub datastore_id: Option<i64>,
    /// Reset the incremental chain and take a full backup.
    #[serde(default)]
    pub reset: bool,
}

/// Response for `vm.backup`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupResponse {
    /// Upper-bound size reserved on the backup datastore, in MB.
    pub size_mb: u64,
    /// Whether the backup runs incrementally.
    pub incremental: bool,
}

/// `vm.backupcancel`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupCancelRequest {
    /// Caller session.
    pub session: String,
    /// Target VM.
    pub vm_id: i64,
}

/// One `cluster.add*`/`cluster.del*` membership change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterMembershipRequest {
    /// Caller session.
    pub session: String,
    /// Target cluster.
    pub cluster_id: i64,
    /// Host, datastore or network to add/remove.
    pub object_id: i64,
}
