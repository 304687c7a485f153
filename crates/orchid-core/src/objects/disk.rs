// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-VM disk set: attach bookkeeping, snapshots, resize and the
//! ownership-dependent accounting rules.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Disk content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DiskType {
    /// Bootable OS image.
    Os,
    /// CD-ROM image.
    Cdrom,
    /// Generic data block device.
    Datablock,
    /// Volatile swap space.
    Swap,
    /// Volatile filesystem.
    Fs,
    /// Kernel file.
    Kernel,
    /// Ramdisk file.
    Ramdisk,
    /// Contextualization CD.
    Context,
    /// Backup image.
    Backup,
}

/// On-disk image format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    /// Raw block format.
    #[default]
    Raw,
    /// QCOW2, required for incremental backups and disk snapshots on
    /// shared storage.
    Qcow2,
}

/// The disk's accounting target, derived from its CLONE/LN target.
///
/// Decides whose quota is charged when the disk's footprint changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TmTarget {
    /// The disk lives in the system datastore.
    #[default]
    #[serde(rename = "SYSTEM")]
    System,
    /// The disk lives in its image datastore.
    #[serde(rename = "SELF")]
    SelfDs,
    /// The disk is accessed in place; nothing is copied.
    #[serde(rename = "NONE")]
    None,
}

impl TmTarget {
    /// Stable uppercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "SYSTEM",
            Self::SelfDs => "SELF",
            Self::None => "NONE",
        }
    }
}

impl fmt::Display for TmTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which quota subjects a disk space change is charged to.
///
/// The full table (owner = whose counters move when the footprint changes):
///
/// | Target | Persistent           | Non-persistent      |
/// |--------|----------------------|---------------------|
/// | SYSTEM | VM(system)           | VM(system)          |
/// | SELF   | image DS + VM(system)| VM(system)          |
/// | NONE   | image DS             | image DS            |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChargeSet {
    /// Charge the VM owner's system-disk quota.
    pub vm_system: bool,
    /// Charge the image datastore's size quota.
    pub image_datastore: bool,
}

/// Resolve the accounting table for a (target, persistent) pair.
pub fn charge_set(target: TmTarget, persistent: bool) -> ChargeSet {
    match (target, persistent) {
        (TmTarget::System, _) => ChargeSet {
            vm_system: true,
            image_datastore: false,
        },
        (TmTarget::SelfDs, true) => ChargeSet {
            vm_system: true,
            image_datastore: true,
        },
        (TmTarget::SelfDs, false) => ChargeSet {
            vm_system: true,
            image_datastore: false,
        },
        (TmTarget::None, _) => ChargeSet {
            vm_system: false,
            image_datastore: true,
        },
    }
}

/// The transient per-disk operation flags. At most one may be set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientFlag {
    /// Disk is being hotplugged.
    Attach,
    /// Disk is being resized.
    Resize,
    /// Disk's backing image is still being cloned.
    Cloning,
    /// A snapshot operation is in flight on this disk.
    SnapshotActive,
}

impl TransientFlag {
    fn name(&self) -> &'static str {
        match self {
            Self::Attach => "ATTACH",
            Self::Resize => "RESIZE",
            Self::Cloning => "CLONING",
            Self::SnapshotActive => "DISK_SNAPSHOT_ACTIVE",
        }
    }
}

/// One snapshot of a disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskSnapshot {
    /// Snapshot id, unique within the disk.
    pub id: i64,
    /// User-assigned name.
    pub name: String,
    /// Accounted size, equal to the disk size at creation.
    pub size_mb: u64,
    /// Parent snapshot, if any.
    pub parent: Option<i64>,
}

/// Ordered snapshot collection of one disk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotSet {
    snapshots: Vec<DiskSnapshot>,
    active: Option<i64>,
    next_id: i64,
    total_mb: u64,
}

impl SnapshotSet {
    /// An empty snapshot set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the set has no snapshots.
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Number of snapshots.
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    /// Total accounted snapshot size.
    pub fn total_mb(&self) -> u64 {
        self.total_mb
    }

    /// The snapshot the disk currently runs from.
    pub fn active(&self) -> Option<i64> {
        self.active
    }

    /// Look up a snapshot by id.
    pub fn get(&self, id: i64) -> Option<&DiskSnapshot> {
        self.snapshots.iter().find(|s| s.id == id)
    }

    fn get_mut(&mut self, id: i64) -> Option<&mut DiskSnapshot> {
        self.snapshots.iter_mut().find(|s| s.id == id)
    }

    /// Record a new snapshot of `size_mb`, chained onto the active one.
    /// Returns the new snapshot's id.
    pub fn create(&mut self, name: &str, size_mb: u64) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        self.snapshots.push(DiskSnapshot {
            id,
            name: name.to_string(),
            size_mb,
            parent: self.active,
        });
        self.active = Some(id);
        self.total_mb += size_mb;
        id
    }

    /// Make `id` the active snapshot.
    pub fn revert(&mut self, id: i64) -> Result<(), SnapshotError> {
        if self.get(id).is_none() {
            return Err(SnapshotError::NotFound(id));
        }
        self.active = Some(id);
        Ok(())
    }

    /// Remove a snapshot, returning its accounted size.
    ///
    /// The active snapshot and snapshots with children cannot be removed.
    pub fn delete(&mut self, id: i64) -> Result<u64, SnapshotError> {
        if self.get(id).is_none() {
            return Err(SnapshotError::NotFound(id));
        }
        if self.active == Some(id) {
            return Err(SnapshotError::Active(id));
        }
        if self.snapshots.iter().any(|s| s.parent == Some(id)) {
            return Err(SnapshotError::HasChildren(id));
        }
        let idx = self
            .snapshots
            .iter()
            .position(|s| s.id == id)
            .ok_or(SnapshotError::NotFound(id))?;
        let removed = self.snapshots.remove(idx);
        self.total_mb = self.total_mb.saturating_sub(removed.size_mb);
        Ok(removed.size_mb)
    }

    /// Rename a snapshot.
    pub fn rename(&mut self, id: i64, new_name: &str) -> Result<(), SnapshotError> {
        let snap = self.get_mut(id).ok_or(SnapshotError::NotFound(id))?;
        snap.name = new_name.to_string();
        Ok(())
    }
}

/// Snapshot bookkeeping failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotError {
    /// No snapshot with that id.
    NotFound(i64),
    /// The snapshot is the active one.
    Active(i64),
    /// The snapshot has children.
    HasChildren(i64),
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(id) => write!(f, "snapshot [{}] does not exist", id),
            Self::Active(id) => write!(f, "snapshot [{}] is the active snapshot", id),
            Self::HasChildren(id) => write!(f, "snapshot [{}] has children", id),
        }
    }
}

impl std::error::Error for SnapshotError {}

/// One disk of a VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Disk {
    /// Disk id, unique within the VM.
    pub id: i64,
    /// Content type.
    pub disk_type: DiskType,
    /// On-disk format.
    pub format: DiskFormat,
    /// Current size in MB.
    pub size_mb: u64,
    /// Backing image; volatile disk when absent.
    pub image_id: Option<i64>,
    /// Image datastore of the backing image.
    pub datastore_id: Option<i64>,
    /// Whether changes persist back to the image.
    pub persistent: bool,
    /// Device target ("vda", "sdb", ...).
    pub target: String,
    /// Accounting target.
    pub tm_target: TmTarget,
    /// ATTACH in flight.
    #[serde(default)]
    pub attach: bool,
    /// RESIZE in flight.
    #[serde(default)]
    pub resize: bool,
    /// Backing image still cloning.
    #[serde(default)]
    pub cloning: bool,
    /// Snapshot operation in flight.
    #[serde(default)]
    pub snapshot_active: bool,
    /// Snapshots of this disk.
    #[serde(default)]
    pub snapshots: SnapshotSet,
}

impl Disk {
    /// A volatile disk is created on the fly, with no backing image.
    pub fn is_volatile(&self) -> bool {
        self.image_id.is_none() && matches!(self.disk_type, DiskType::Fs | DiskType::Swap)
    }

    /// Whether the disk is swap space.
    pub fn is_swap(&self) -> bool {
        matches!(self.disk_type, DiskType::Swap)
    }

    /// Whether the disk has any snapshot.
    pub fn has_snapshots(&self) -> bool {
        !self.snapshots.is_empty()
    }

    /// The accounting targets for this disk's size changes.
    pub fn charge_set(&self) -> ChargeSet {
        charge_set(self.tm_target, self.persistent)
    }

    fn transient_in_flight(&self) -> Option<&'static str> {
        if self.attach {
            Some("ATTACH")
        } else if self.resize {
            Some("RESIZE")
        } else if self.cloning {
            Some("CLONING")
        } else if self.snapshot_active {
            Some("DISK_SNAPSHOT_ACTIVE")
        } else {
            None
        }
    }

    /// Raise a transient flag. Fails when another operation is in flight;
    /// the flags are mutually exclusive per disk.
    pub fn set_transient(&mut self, flag: TransientFlag) -> Result<(), String> {
        if let Some(current) = self.transient_in_flight() {
            return Err(format!(
                "disk [{}] has operation {} in flight, cannot start {}",
                self.id,
                current,
                flag.name()
            ));
        }
        match flag {
            TransientFlag::Attach => self.attach = true,
            TransientFlag::Resize => self.resize = true,
            TransientFlag::Cloning => self.cloning = true,
            TransientFlag::SnapshotActive => self.snapshot_active = true,
        }
        Ok(())
    }

    /// Lower every transient flag. Called on both the success and the
    /// failure path of the operation that raised one.
    pub fn clear_transient(&mut self) {
        self.attach = false;
        self.resize = false;
        self.cloning = false;
        self.snapshot_active = false;
    }
}

/// The mutable disk set of one VM.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskSet {
    disks: Vec<Disk>,
}

impl DiskSet {
    /// An empty disk set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of disks.
    pub fn len(&self) -> usize {
        self.disks.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.disks.is_empty()
    }

    /// Iterate the disks.
    pub fn iter(&self) -> impl Iterator<Item = &Disk> {
        self.disks.iter()
    }

    /// Iterate the disks mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Disk> {
        self.disks.iter_mut()
    }

    /// Look up a disk by id.
    pub fn get(&self, disk_id: i64) -> Option<&Disk> {
        self.disks.iter().find(|d| d.id == disk_id)
    }

    /// Look up a disk by id, mutably.
    pub fn get_mut(&mut self, disk_id: i64) -> Option<&mut Disk> {
        self.disks.iter_mut().find(|d| d.id == disk_id)
    }

    /// Device targets currently in use.
    pub fn used_targets(&self) -> Vec<&str> {
        self.disks.iter().map(|d| d.target.as_str()).collect()
    }

    /// Add a disk: assigns the lowest unused id above the current maximum
    /// and a free device target.
    ///
    /// Target assignment probes `prefix+a`, `prefix+b`, ... against the
    /// targets already used by this VM's disks plus `reserved` (the context
    /// device). An explicitly requested target must be free. Returns the
    /// assigned (id, target).
    pub fn attach(
        &mut self,
        mut disk: Disk,
        prefix: &str,
        reserved: Option<&str>,
    ) -> Result<(i64, String), String> {
        let mut used: Vec<&str> = self.used_targets();
        if let Some(r) = reserved {
            used.push(r);
        }

        let target = if disk.target.is_empty() {
            let mut found = None;
            for letter in b'a'..=b'z' {
                let candidate = format!("{}{}", prefix, letter as char);
                if !used.iter().any(|t| *t == candidate) {
                    found = Some(candidate);
                    break;
                }
            }
            found.ok_or_else(|| format!("no free device target with prefix '{}'", prefix))?
        } else {
            if used.iter().any(|t| *t == disk.target) {
                return Err(format!("target '{}' is already in use", disk.target));
            }
            disk.target.clone()
        };

        let id = self.disks.iter().map(|d| d.id).max().map_or(0, |m| m + 1);
        disk.id = id;
        disk.target = target.clone();
        self.disks.push(disk);
        Ok((id, target))
    }

    /// Remove a disk by id.
    pub fn remove(&mut self, disk_id: i64) -> Option<Disk> {
        let idx = self.disks.iter().position(|d| d.id == disk_id)?;
        Some(self.disks.remove(idx))
    }

    /// Upper-bound storage needed to back up (or save) this disk set:
    /// the sum of all non-swap disk sizes. Volatile FS disks are excluded
    /// unless `include_volatile` is set.
    pub fn backup_size_mb(&self, include_volatile: bool) -> u64 {
        self.disks
            .iter()
            .filter(|d| !d.is_swap())
            .filter(|d| include_volatile || !d.is_volatile())
            .map(|d| d.size_mb)
            .sum()
    }

    /// Whether the disk set qualifies for incremental backups: every
    /// included disk uses QCOW2 and carries no snapshots.
    pub fn incremental_eligible(&self, include_volatile: bool) -> bool {
        self.disks
            .iter()
            .filter(|d| !d.is_swap())
            .filter(|d| include_volatile || !d.is_volatile())
            .all(|d| d.format == DiskFormat::Qcow2 && !d.has_snapshots())
    }
}
