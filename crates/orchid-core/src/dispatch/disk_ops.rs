// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Disk attach/detach, disk resize, disk snapshots and VM backups.
//!
//! Quota ownership follows the accounting-target table in
//! [`crate::objects::disk::charge_set`]: SYSTEM-target disks charge the VM
//! owner's system-disk quota, NONE-target disks charge the image
//! datastore, SELF-target persistent disks charge both.

use super::fetch_vm_authorized;
use crate::auth::AuthRequest;
use crate::context::Context;
use crate::error::{CoreError, Result};
use crate::objects::disk::{ChargeSet, Disk, DiskFormat, DiskType, SnapshotSet, TransientFlag};
use crate::objects::{AuthOp, DatastoreType, Image, LcmState, Vm, VmState};
use crate::quota::{QuotaDeltas, Reservations, Subject, VmDelta};
use orchid_api::requests::{
    AttachDiskRequest, AttachDiskResponse, BackupCancelRequest, BackupRequest, BackupResponse,
    DetachDiskRequest, DiskResizeRequest, DiskSnapshotCreateRequest, DiskSnapshotCreateResponse,
    DiskSnapshotDeleteRequest, DiskSnapshotRenameRequest, DiskSnapshotRevertRequest, DiskTemplate,
};
use tracing::instrument;

/// Build the quota deltas for a disk space change of `size_mb`.
fn charge_deltas(charges: ChargeSet, size_mb: i64, ds_id: Option<i64>) -> QuotaDeltas {
    let mut deltas = QuotaDeltas::new();
    if charges.vm_system {
        deltas.vm = Some(VmDelta::system_disk(size_mb));
    }
    if charges.image_datastore
        && let Some(ds_id) = ds_id
    {
        deltas = deltas.with_datastore(ds_id, size_mb, 0);
    }
    deltas
}

fn owner_of(vm: &Vm) -> Subject {
    Subject {
        uid: vm.uid,
        gid: vm.gid,
    }
}

fn hotplug_or_poweroff(vm: &Vm) -> bool {
    (vm.state == VmState::Active && vm.lcm_state == LcmState::Running)
        || vm.state == VmState::Poweroff
}

fn disk_state_error(op: &str, vm: &Vm) -> CoreError {
    CoreError::action(format!(
        "{} is not valid for VM [{}] in state {}",
        op,
        vm.id,
        if vm.state == VmState::Active {
            format!("{}/{}", vm.state, vm.lcm_state)
        } else {
            vm.state.to_string()
        }
    ))
}

/// Materialize a disk from a template. Image-backed disks inherit size,
/// format, type and persistence from the image and the accounting target
/// from the image's datastore.
async fn build_disk(ctx: &Context, template: &DiskTemplate) -> Result<(Disk, Option<Image>)> {
    let format = |fallback: DiskFormat| match template.format.as_deref() {
        Some("qcow2") => DiskFormat::Qcow2,
        Some("raw") => DiskFormat::Raw,
        _ => fallback,
    };

    match template.image_id {
        Some(image_id) => {
            let image = ctx.images.get_ro(image_id).await?;
            let ds = ctx.datastores.get_ro(image.datastore_id).await?;
            let size_mb = template
                .size_mb
                .map(|s| s.max(image.size_mb))
                .unwrap_or(image.size_mb);
            let disk = Disk {
                id: 0,
                disk_type: image.disk_type,
                format: format(image.format),
                size_mb,
                image_id: Some(image_id),
                datastore_id: Some(image.datastore_id),
                persistent: image.persistent,
                target: template.target.clone().unwrap_or_default(),
                tm_target: ds.disk_target(image.persistent),
                attach: false,
                resize: false,
                cloning: false,
                snapshot_active: false,
                snapshots: SnapshotSet::new(),
            };
            Ok((disk, Some(image)))
        }
        None => {
            let size_mb = template
                .size_mb
                .ok_or_else(|| CoreError::action("SIZE is required for volatile disks"))?;
            let disk_type = match template.volatile_type.as_deref() {
                Some("swap") => DiskType::Swap,
                _ => DiskType::Fs,
            };
            let disk = Disk {
                id: 0,
                disk_type,
                format: format(DiskFormat::Raw),
                size_mb,
                image_id: None,
                datastore_id: None,
                persistent: false,
                target: template.target.clone().unwrap_or_default(),
                tm_target: crate::objects::TmTarget::System,
                attach: false,
                resize: false,
                cloning: false,
                snapshot_active: false,
                snapshots: SnapshotSet::new(),
            };
            Ok((disk, None))
        }
    }
}

async fn release_image(ctx: &Context, image_id: i64) {
    if let Ok(mut image) = ctx.images.get(image_id).await {
        image.release();
        let _ = ctx.images.update(&image).await;
    }
}

/// `vm.attach` - add a disk to a VM.
#[instrument(skip(ctx, request), fields(vm_id = request.vm_id))]
pub async fn handle_attach_disk(
    ctx: &Context,
    request: &AttachDiskRequest,
) -> Result<AttachDiskResponse> {
    let actor = ctx.authenticate(&request.session).await?;
    let vm = ctx.vms.get_ro(request.vm_id).await?;

    if vm.imported {
        return Err(CoreError::action(format!(
            "attach is not supported for imported VM [{}]",
            vm.id
        )));
    }
    if !hotplug_or_poweroff(&vm) {
        return Err(disk_state_error("attach", &vm));
    }

    let (mut disk, image) = build_disk(ctx, &request.disk).await?;

    let mut auth_request = AuthRequest::for_actor(&actor);
    auth_request.add(AuthOp::Manage, vm.perm_snapshot());
    if let Some(image) = &image {
        auth_request.add(AuthOp::Use, image.perm_snapshot());
    }
    ctx.auth.authorize(&auth_request).await?;

    // Check the image out first; every later failure releases it again.
    if let Some(image) = &image {
        let mut guard = ctx.images.get(image.id).await?;
        guard.acquire().map_err(CoreError::action)?;
        ctx.images.update(&guard).await?;
    }

    let owner = owner_of(&vm);
    let deltas = charge_deltas(disk.charge_set(), disk.size_mb as i64, disk.datastore_id);
    let mut reservations = Reservations::new();
    if let Err(err) = ctx.quota.authorize(owner, &deltas).await {
        if let Some(image) = &image {
            release_image(ctx, image.id).await;
        }
        return Err(err);
    }
    reservations.push(owner, deltas);

    let prefix = request
        .disk
        .dev_prefix
        .clone()
        .unwrap_or_else(|| ctx.config.dev_prefix.clone());

    let outcome: Result<AttachDiskResponse> = async {
        let mut guard = ctx.vms.get(request.vm_id).await?;
        if !hotplug_or_poweroff(&guard) {
            return Err(disk_state_error("attach", &guard));
        }
        // The ATTACH flag covers the hotplug window; the synchronous model
        // completes it before the commit.
        disk.set_transient(TransientFlag::Attach)
            .map_err(CoreError::action)?;
        let reserved = guard.context_target.clone();
        let (disk_id, target) = guard
            .disks
            .attach(disk, &prefix, reserved.as_deref())
            .map_err(CoreError::action)?;
        if let Some(added) = guard.disks.get_mut(disk_id) {
            added.clear_transient();
        }
        ctx.vms.update(&guard).await?;
        Ok(AttachDiskResponse { disk_id, target })
    }
    .await;

    match outcome {
        Ok(response) => {
            reservations.commit();
            Ok(response)
        }
        Err(err) => {
            // No disk was registered: the guard copy died with the error.
            reservations.rollback(&ctx.quota).await;
            if let Some(image) = &image {
                release_image(ctx, image.id).await;
            }
            Err(err)
        }
    }
}

/// `vm.detach` - remove a disk, returning its quota to the owner.
#[instrument(skip(ctx, request), fields(vm_id = request.vm_id, disk_id = request.disk_id))]
pub async fn handle_detach_disk(ctx: &Context, request: &DetachDiskRequest) -> Result<()> {
    let actor = ctx.authenticate(&request.session).await?;
    let vm = fetch_vm_authorized(ctx, &actor, request.vm_id, AuthOp::Manage).await?;

    if vm.imported {
        return Err(CoreError::action(format!(
            "detach is not supported for imported VM [{}]",
            vm.id
        )));
    }
    if !hotplug_or_poweroff(&vm) {
        return Err(disk_state_error("detach", &vm));
    }

    let removed = {
        let mut guard = ctx.vms.get(request.vm_id).await?;
        if !hotplug_or_poweroff(&guard) {
            return Err(disk_state_error("detach", &guard));
        }
        let disk = guard.disks.get(request.disk_id).ok_or_else(|| {
            CoreError::action(format!(
                "VM [{}] has no disk [{}]",
                request.vm_id, request.disk_id
            ))
        })?;
        if disk.attach || disk.resize || disk.cloning || disk.snapshot_active {
            return Err(CoreError::action(format!(
                "disk [{}] has an operation in flight",
                request.disk_id
            )));
        }
        let removed = guard
            .disks
            .remove(request.disk_id)
            .ok_or_else(|| CoreError::internal("disk vanished under the lock"))?;
        ctx.vms.update(&guard).await?;
        removed
    };

    if let Some(image_id) = removed.image_id {
        release_image(ctx, image_id).await;
    }

    // The freed space (snapshots included) goes back to whoever was
    // charged at attach/resize/snapshot time.
    let freed = (removed.size_mb + removed.snapshots.total_mb()) as i64;
    let deltas = charge_deltas(removed.charge_set(), freed, removed.datastore_id);
    let _ = ctx.quota.rollback(owner_of(&vm), &deltas).await;
    Ok(())
}

/// `vm.diskresize` - grow a disk.
///
/// Shrinking is rejected here, at the call site; the quota delta is the
/// positive growth magnitude only.
#[instrument(skip(ctx, request), fields(vm_id = request.vm_id, disk_id = request.disk_id))]
pub async fn handle_disk_resize(ctx: &Context, request: &DiskResizeRequest) -> Result<()> {
    let actor = ctx.authenticate(&request.session).await?;
    let vm = fetch_vm_authorized(ctx, &actor, request.vm_id, AuthOp::Manage).await?;

    let valid = hotplug_or_poweroff(&vm) || vm.state == VmState::Undeployed;
    if !valid {
        return Err(disk_state_error("disk resize", &vm));
    }

    let disk = vm.disks.get(request.disk_id).ok_or_else(|| {
        CoreError::action(format!(
            "VM [{}] has no disk [{}]",
            request.vm_id, request.disk_id
        ))
    })?;
    if request.new_size_mb <= disk.size_mb {
        return Err(CoreError::action(format!(
            "new size {} MB must be greater than the current {} MB",
            request.new_size_mb, disk.size_mb
        )));
    }
    if disk.has_snapshots() {
        return Err(CoreError::action(format!(
            "cannot resize disk [{}] with snapshots",
            disk.id
        )));
    }

    let owner = owner_of(&vm);
    let growth = (request.new_size_mb - disk.size_mb) as i64;
    let deltas = charge_deltas(disk.charge_set(), growth, disk.datastore_id);
    ctx.quota.authorize(owner, &deltas).await?;
    let mut reservations = Reservations::new();
    reservations.push(owner, deltas);

    let outcome: Result<()> = async {
        let mut guard = ctx.vms.get(request.vm_id).await?;
        let valid = hotplug_or_poweroff(&guard) || guard.state == VmState::Undeployed;
        if !valid {
            return Err(disk_state_error("disk resize", &guard));
        }
        let disk = guard.disks.get_mut(request.disk_id).ok_or_else(|| {
            CoreError::action(format!(
                "VM [{}] has no disk [{}]",
                request.vm_id, request.disk_id
            ))
        })?;
        if request.new_size_mb <= disk.size_mb || disk.has_snapshots() {
            return Err(CoreError::action(format!(
                "disk [{}] changed under the resize",
                disk.id
            )));
        }
        disk.set_transient(TransientFlag::Resize)
            .map_err(CoreError::action)?;
        disk.size_mb = request.new_size_mb;
        disk.clear_transient();
        ctx.vms.update(&guard).await
    }
    .await;

    if let Err(err) = outcome {
        reservations.rollback(&ctx.quota).await;
        return Err(err);
    }
    reservations.commit();
    Ok(())
}

fn snapshot_states(vm: &Vm) -> bool {
    hotplug_or_poweroff(vm) || vm.state == VmState::Suspended
}

/// `vm.disksnapshotcreate`.
///
/// The snapshot is accounted as occupying the live disk's full size, so
/// creating one doubles the disk's footprint for quota purposes.
#[instrument(skip(ctx, request), fields(vm_id = request.vm_id, disk_id = request.disk_id))]
pub async fn handle_disk_snapshot_create(
    ctx: &Context,
    request: &DiskSnapshotCreateRequest,
) -> Result<DiskSnapshotCreateResponse> {
    let actor = ctx.authenticate(&request.session).await?;
    let vm = fetch_vm_authorized(ctx, &actor, request.vm_id, AuthOp::Manage).await?;

    if !snapshot_states(&vm) {
        return Err(disk_state_error("disk snapshot", &vm));
    }

    let disk = vm.disks.get(request.disk_id).ok_or_else(|| {
        CoreError::action(format!(
            "VM [{}] has no disk [{}]",
            request.vm_id, request.disk_id
        ))
    })?;
    if disk.is_volatile() {
        return Err(CoreError::action(format!(
            "cannot snapshot volatile disk [{}]",
            disk.id
        )));
    }

    let owner = owner_of(&vm);
    let deltas = charge_deltas(disk.charge_set(), disk.size_mb as i64, disk.datastore_id);
    ctx.quota.authorize(owner, &deltas).await?;
    let mut reservations = Reservations::new();
    reservations.push(owner, deltas);

    let outcome: Result<DiskSnapshotCreateResponse> = async {
        let mut guard = ctx.vms.get(request.vm_id).await?;
        if !snapshot_states(&guard) {
            return Err(disk_state_error("disk snapshot", &guard));
        }
        let disk = guard.disks.get_mut(request.disk_id).ok_or_else(|| {
            CoreError::action(format!(
                "VM [{}] has no disk [{}]",
                request.vm_id, request.disk_id
            ))
        })?;
        disk.set_transient(TransientFlag::SnapshotActive)
            .map_err(CoreError::action)?;
        let snapshot_id = disk.snapshots.create(&request.name, disk.size_mb);
        disk.clear_transient();
        ctx.vms.update(&guard).await?;
        Ok(DiskSnapshotCreateResponse { snapshot_id })
    }
    .await;

    match outcome {
        Ok(response) => {
            reservations.commit();
            Ok(response)
        }
        Err(err) => {
            reservations.rollback(&ctx.quota).await;
            Err(err)
        }
    }
}

/// `vm.disksnapshotrevert` - make a snapshot the active disk content.
#[instrument(skip(ctx, request), fields(vm_id = request.vm_id, disk_id = request.disk_id))]
pub async fn handle_disk_snapshot_revert(
    ctx: &Context,
    request: &DiskSnapshotRevertRequest,
) -> Result<()> {
    let actor = ctx.authenticate(&request.session).await?;
    let vm = fetch_vm_authorized(ctx, &actor, request.vm_id, AuthOp::Manage).await?;

    if !matches!(vm.state, VmState::Poweroff | VmState::Suspended) {
        return Err(disk_state_error("disk snapshot revert", &vm));
    }

    let mut guard = ctx.vms.get(request.vm_id).await?;
    if !matches!(guard.state, VmState::Poweroff | VmState::Suspended) {
        return Err(disk_state_error("disk snapshot revert", &guard));
    }
    let disk = guard.disks.get_mut(request.disk_id).ok_or_else(|| {
        CoreError::action(format!(
            "VM [{}] has no disk [{}]",
            request.vm_id, request.disk_id
        ))
    })?;
    disk.set_transient(TransientFlag::SnapshotActive)
        .map_err(CoreError::action)?;
    let result = disk.snapshots.revert(request.snapshot_id);
    disk.clear_transient();
    result.map_err(|e| CoreError::action(format!("disk [{}]: {}", request.disk_id, e)))?;
    ctx.vms.update(&guard).await
}

/// `vm.disksnapshotdelete` - remove a snapshot and free its space.
#[instrument(skip(ctx, request), fields(vm_id = request.vm_id, disk_id = request.disk_id))]
pub async fn handle_disk_snapshot_delete(
    ctx: &Context,
    request: &DiskSnapshotDeleteRequest,
) -> Result<()> {
    let actor = ctx.authenticate(&request.session).await?;
    let vm = fetch_vm_authorized(ctx, &actor, request.vm_id, AuthOp::Manage).await?;

    if !snapshot_states(&vm) && vm.state != VmState::Undeployed {
        return Err(disk_state_error("disk snapshot delete", &vm));
    }

    let (freed, charges, ds_id) = {
        let mut guard = ctx.vms.get(request.vm_id).await?;
        let disk = guard.disks.get_mut(request.disk_id).ok_or_else(|| {
            CoreError::action(format!(
                "VM [{}] has no disk [{}]",
                request.vm_id, request.disk_id
            ))
        })?;
        disk.set_transient(TransientFlag::SnapshotActive)
            .map_err(CoreError::action)?;
        let result = disk.snapshots.delete(request.snapshot_id);
        disk.clear_transient();
        let freed =
            result.map_err(|e| CoreError::action(format!("disk [{}]: {}", request.disk_id, e)))?;
        let charges = disk.charge_set();
        let ds_id = disk.datastore_id;
        ctx.vms.update(&guard).await?;
        (freed, charges, ds_id)
    };

    // Freed space returns to the same owners the create charged.
    let deltas = charge_deltas(charges, freed as i64, ds_id);
    let _ = ctx.quota.rollback(owner_of(&vm), &deltas).await;
    Ok(())
}

/// `vm.disksnapshotrename`.
#[instrument(skip(ctx, request), fields(vm_id = request.vm_id, disk_id = request.disk_id))]
pub async fn handle_disk_snapshot_rename(
    ctx: &Context,
    request: &DiskSnapshotRenameRequest,
) -> Result<()> {
    let actor = ctx.authenticate(&request.session).await?;
    fetch_vm_authorized(ctx, &actor, request.vm_id, AuthOp::Manage).await?;

    let mut guard = ctx.vms.get(request.vm_id).await?;
    let disk = guard.disks.get_mut(request.disk_id).ok_or_else(|| {
        CoreError::action(format!(
            "VM [{}] has no disk [{}]",
            request.vm_id, request.disk_id
        ))
    })?;
    disk.snapshots
        .rename(request.snapshot_id, &request.new_name)
        .map_err(|e| CoreError::action(format!("disk [{}]: {}", request.disk_id, e)))?;
    ctx.vms.update(&guard).await
}

/// `vm.backup` - reserve space and start a backup.
///
/// The reserved size is the upper bound: the sum of all non-swap disk
/// sizes, with volatile FS disks excluded unless the VM opts them in.
/// Incremental backups require every included disk to be QCOW2 with no
/// snapshots, a driver that supports them, and an existing chain.
#[instrument(skip(ctx, request), fields(vm_id = request.vm_id))]
pub async fn handle_backup(ctx: &Context, request: &BackupRequest) -> Result<BackupResponse> {
    let actor = ctx.authenticate(&request.session).await?;
    let vm = ctx.vms.get_ro(request.vm_id).await?;

    let valid = (vm.state == VmState::Active && vm.lcm_state == LcmState::Running)
        || vm.state == VmState::Poweroff;
    if !valid {
        return Err(disk_state_error("backup", &vm));
    }
    if vm.backup.in_progress {
        return Err(CoreError::action(format!(
            "backup already in progress for VM [{}]",
            vm.id
        )));
    }

    let ds_id = request
        .datastore_id
        .or(vm.backup.datastore_id)
        .ok_or_else(|| {
            CoreError::action(format!("no backup datastore configured for VM [{}]", vm.id))
        })?;
    let ds = ctx.datastores.get_ro(ds_id).await?;
    if ds.ds_type != DatastoreType::Backup {
        return Err(CoreError::action(format!(
            "DATASTORE [{}] is not of type BACKUP",
            ds_id
        )));
    }

    let mut auth_request = AuthRequest::for_actor(&actor);
    auth_request.add(AuthOp::Manage, vm.perm_snapshot());
    auth_request.add(AuthOp::Use, ds.perm_snapshot());
    ctx.auth.authorize(&auth_request).await?;

    let size_mb = vm.disks.backup_size_mb(vm.backup.include_volatile);
    if size_mb == 0 {
        return Err(CoreError::action(format!(
            "VM [{}] has no disks to back up",
            vm.id
        )));
    }

    let driver = vm
        .last_history()
        .map(|h| h.vmm_driver.clone())
        .unwrap_or_default();
    let incremental = !request.reset
        && ctx.config.features(&driver).incremental_backup
        && vm.disks.incremental_eligible(vm.backup.include_volatile)
        && vm.backup.last_increment_id.is_some();

    let owner = owner_of(&vm);
    let deltas = QuotaDeltas::new().with_datastore(ds_id, size_mb as i64, 1);
    ctx.quota.authorize(owner, &deltas).await?;
    let mut reservations = Reservations::new();
    reservations.push(owner, deltas);

    let outcome: Result<()> = async {
        let mut guard = ctx.vms.get(request.vm_id).await?;
        let valid = (guard.state == VmState::Active && guard.lcm_state == LcmState::Running)
            || guard.state == VmState::Poweroff;
        if !valid || guard.backup.in_progress {
            return Err(CoreError::action(format!(
                "backup is no longer valid for VM [{}]",
                guard.id
            )));
        }
        guard.backup.in_progress = true;
        guard.backup.pending_ds = Some(ds_id);
        guard.backup.pending_size_mb = size_mb;
        guard.backup.last_increment_id = if incremental {
            guard.backup.last_increment_id.map(|i| i + 1)
        } else {
            Some(0)
        };
        ctx.vms.update(&guard).await
    }
    .await;

    if let Err(err) = outcome {
        reservations.rollback(&ctx.quota).await;
        return Err(err);
    }
    reservations.commit();
    Ok(BackupResponse {
        size_mb,
        incremental,
    })
}

/// `vm.backupcancel` - abort the in-flight backup and return the reserved
/// space.
#[instrument(skip(ctx, request), fields(vm_id = request.vm_id))]
pub async fn handle_backup_cancel(ctx: &Context, request: &BackupCancelRequest) -> Result<()> {
    let actor = ctx.authenticate(&request.session).await?;
    let vm = fetch_vm_authorized(ctx, &actor, request.vm_id, AuthOp::Manage).await?;

    let pending = {
        let mut guard = ctx.vms.get(request.vm_id).await?;
        if !guard.backup.in_progress {
            return Err(CoreError::action(format!(
                "no backup in progress for VM [{}]",
                guard.id
            )));
        }
        let pending = guard
            .backup
            .pending_ds
            .map(|ds| (ds, guard.backup.pending_size_mb));
        guard.backup.in_progress = false;
        guard.backup.pending_ds = None;
        guard.backup.pending_size_mb = 0;
        ctx.vms.update(&guard).await?;
        pending
    };

    if let Some((ds_id, size_mb)) = pending {
        let deltas = QuotaDeltas::new().with_datastore(ds_id, size_mb as i64, 1);
        let _ = ctx.quota.rollback(owner_of(&vm), &deltas).await;
    }
    Ok(())
}
