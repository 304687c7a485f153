// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Disk images with reference-counted check-out.

use super::disk::{DiskFormat, DiskType};
use super::perms::{LockLevel, PermSnapshot, Permissions};
use super::{ObjectKind, PoolObject};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Image lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ImageState {
    /// Registered and unused.
    Ready,
    /// Checked out by at least one VM.
    Used,
    /// A storage operation is in flight.
    Locked,
    /// Administratively disabled.
    Disabled,
    /// Registration or a storage operation failed.
    Error,
}

impl ImageState {
    /// Stable uppercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ready => "READY",
            Self::Used => "USED",
            Self::Locked => "LOCKED",
            Self::Disabled => "DISABLED",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for ImageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered disk image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
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
    /// Image datastore holding the image.
    pub datastore_id: i64,
    /// Size in MB.
    pub size_mb: u64,
    /// Persistent images admit a single writer.
    pub persistent: bool,
    /// On-disk format.
    pub format: DiskFormat,
    /// Content type when attached as a disk.
    pub disk_type: DiskType,
    /// Lifecycle state.
    pub state: ImageState,
    /// VMs currently using the image.
    pub running_vms: u32,
}

impl Image {
    /// A new READY image.
    pub fn new(name: &str, uid: i64, gid: i64, datastore_id: i64, size_mb: u64) -> Self {
        Self {
            id: -1,
            name: name.to_string(),
            uid,
            gid,
            perms: Permissions::default(),
            lock: LockLevel::None,
            datastore_id,
            size_mb,
            persistent: false,
            format: DiskFormat::Qcow2,
            disk_type: DiskType::Datablock,
            state: ImageState::Ready,
            running_vms: 0,
        }
    }

    /// Check the image out for a VM.
    ///
    /// Persistent images admit exactly one running VM; non-persistent
    /// images any number. Only READY/USED images can be acquired.
    pub fn acquire(&mut self) -> Result<(), String> {
        match self.state {
            ImageState::Ready | ImageState::Used => {}
            other => {
                return Err(format!(
                    "IMAGE [{}] is in state {}, cannot be used",
                    self.id, other
                ));
            }
        }
        if self.persistent && self.running_vms > 0 {
            return Err(format!("IMAGE [{}] is persistent and already in use", self.id));
        }
        self.running_vms += 1;
        self.state = ImageState::Used;
        Ok(())
    }

    /// Return a previously acquired reference.
    pub fn release(&mut self) {
        self.running_vms = self.running_vms.saturating_sub(1);
        if self.running_vms == 0 && self.state == ImageState::Used {
            self.state = ImageState::Ready;
        }
    }

    /// Capture the permission snapshot.
    pub fn perm_snapshot(&self) -> PermSnapshot {
        PermSnapshot::new(ObjectKind::Image, self.id, self.uid, self.gid, self.perms)
            .with_lock(self.lock)
    }
}

impl PoolObject for Image {
    const KIND: ObjectKind = ObjectKind::Image;

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
