// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Managed-object model: one module per pool-resident kind.
//!
//! Every object has an immutable integer id, an owner (uid/gid), nine
//! permission bits, a lock level, and a kind-specific lifecycle state.
//! Objects are only ever mutated through their pool's exclusive accessor.

pub mod bitmap;
pub mod cluster;
pub mod datastore;
pub mod disk;
pub mod group;
pub mod host;
pub mod image;
pub mod network;
pub mod perms;
pub mod user;
pub mod vm;

pub use bitmap::PortBitmap;
pub use cluster::Cluster;
pub use datastore::{Datastore, DatastoreType};
pub use disk::{Disk, DiskFormat, DiskSet, DiskType, SnapshotSet, TmTarget};
pub use group::Group;
pub use host::{Host, HostState};
pub use image::{Image, ImageState};
pub use network::VirtualNetwork;
pub use perms::{AuthOp, LockLevel, PermSnapshot, Permissions};
pub use user::User;
pub use vm::{HistoryRecord, LcmState, Vm, VmState};

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fmt;

/// The kind tag of a pool-resident object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, serde::Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ObjectKind {
    /// Virtual machine.
    Vm,
    /// Hypervisor host.
    Host,
    /// Cluster of hosts, datastores and networks.
    Cluster,
    /// Datastore (image, system, file or backup).
    Datastore,
    /// Virtual network.
    Network,
    /// Disk image.
    Image,
    /// VM template.
    Template,
    /// User account.
    User,
    /// User group.
    Group,
    /// Scheduled backup job.
    BackupJob,
}

impl ObjectKind {
    /// Stable uppercase name, used in messages and the store.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vm => "VM",
            Self::Host => "HOST",
            Self::Cluster => "CLUSTER",
            Self::Datastore => "DATASTORE",
            Self::Network => "NET",
            Self::Image => "IMAGE",
            Self::Template => "TEMPLATE",
            Self::User => "USER",
            Self::Group => "GROUP",
            Self::BackupJob => "BACKUPJOB",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Behaviour every pool-resident object implements.
///
/// The pool uses these to key the lock table and serialize bodies; objects
/// gain their id from [`set_oid`](PoolObject::set_oid) at allocation time
/// and never change it afterwards.
pub trait PoolObject:
    Clone + Send + Sync + Serialize + DeserializeOwned + 'static
{
    /// The kind tag for this object type.
    const KIND: ObjectKind;

    /// The object's pool id.
    fn oid(&self) -> i64;

    /// Assign the pool id. Called once, by the pool, at allocation.
    fn set_oid(&mut self, oid: i64);

    /// The object's display name.
    fn name(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(ObjectKind::Vm.as_str(), "VM");
        assert_eq!(ObjectKind::Network.as_str(), "NET");
        assert_eq!(ObjectKind::Datastore.to_string(), "DATASTORE");
    }
}
