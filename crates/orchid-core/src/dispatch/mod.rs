// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The action orchestrator.
//!
//! Every handler follows the same workflow:
//!
//! 1. resolve the caller session
//! 2. shared-fetch the target VM and capture its permission snapshot
//! 3. reject actions unsupported for imported VMs
//! 4. evaluate authorization (one clause per touched sub-resource)
//! 5. reserve quota against the resource owner, in fixed order, pushing
//!    every committed reservation onto a [`Reservations`] log
//! 6. validate placement where relevant
//! 7. mutate state under the exclusive accessor and persist
//! 8. on any failure after step 5, roll the log back in reverse order
//!
//! Handlers hold at most one exclusive guard at a time; cross-pool
//! consistency is kept by compensating completed steps, never by nested
//! locks.
//!
//! [`Reservations`]: crate::quota::Reservations

pub mod cluster_ops;
pub mod disk_ops;
pub mod placement;
pub mod vm_actions;

pub use cluster_ops::{
    handle_add_datastore, handle_add_host, handle_add_vnet, handle_del_datastore,
    handle_del_host, handle_del_vnet,
};
pub use disk_ops::{
    handle_attach_disk, handle_backup, handle_backup_cancel, handle_detach_disk,
    handle_disk_resize, handle_disk_snapshot_create, handle_disk_snapshot_delete,
    handle_disk_snapshot_rename, handle_disk_snapshot_revert,
};
pub use placement::{handle_deploy, handle_migrate};
pub use vm_actions::{handle_resize, handle_vm_action, handle_vm_allocate};

use crate::auth::{AuthContext, AuthRequest};
use crate::context::Context;
use crate::error::Result;
use crate::objects::{AuthOp, Vm};

/// Shared-fetch a VM and authorize a single-clause request on it.
///
/// The returned VM is a snapshot copy; mutation still requires an
/// exclusive fetch (and a state revalidation) afterwards.
pub(crate) async fn fetch_vm_authorized(
    ctx: &Context,
    actor: &AuthContext,
    vm_id: i64,
    op: AuthOp,
) -> Result<Vm> {
    let vm = ctx.vms.get_ro(vm_id).await?;
    let mut request = AuthRequest::for_actor(actor);
    request.add(op, vm.perm_snapshot());
    ctx.auth.authorize(&request).await?;
    Ok(vm)
}
