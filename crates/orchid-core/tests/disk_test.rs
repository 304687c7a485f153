// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Disk resize, disk snapshots and backups: accounting rules and guards.

mod common;

use common::*;
use orchid_api::VmAction;
use orchid_api::requests::{
    AttachDiskRequest, BackupCancelRequest, BackupRequest, DiskResizeRequest,
    DiskSnapshotCreateRequest, DiskSnapshotDeleteRequest, DiskSnapshotRevertRequest,
    DiskTemplate,
};
use orchid_core::dispatch::{
    handle_attach_disk, handle_backup, handle_backup_cancel, handle_disk_resize,
    handle_disk_snapshot_create, handle_disk_snapshot_delete, handle_disk_snapshot_revert,
};

/// A powered-off VM with one volatile FS disk of the given size.
async fn vm_with_volatile(tc: &TestContext, size_mb: u64) -> (i64, i64) {
    let vm_id = tc.running_vm("store").await;
    tc.vm_action(VmAction::Poweroff, vm_id).await.unwrap();
    let response = handle_attach_disk(
        &tc.ctx,
        &AttachDiskRequest {
            session: tc.alice(),
            vm_id,
            disk: DiskTemplate {
                size_mb: Some(size_mb),
                volatile_type: Some("fs".to_string()),
                ..Default::default()
            },
        },
    )
    .await
    .unwrap();
    (vm_id, response.disk_id)
}

/// A powered-off VM with the base image attached.
async fn vm_with_image_disk(tc: &TestContext) -> (i64, i64) {
    let vm_id = tc.running_vm("store").await;
    tc.vm_action(VmAction::Poweroff, vm_id).await.unwrap();
    let response = handle_attach_disk(
        &tc.ctx,
        &AttachDiskRequest {
            session: tc.alice(),
            vm_id,
            disk: DiskTemplate {
                image_id: Some(BASE_IMAGE),
                ..Default::default()
            },
        },
    )
    .await
    .unwrap();
    (vm_id, response.disk_id)
}

#[tokio::test]
async fn test_disk_resize_charges_growth_only() {
    let tc = TestContext::new().await;
    let (vm_id, disk_id) = vm_with_volatile(&tc, 1000).await;
    let usage_before = tc.alice_quota().await.vm.system_disk_mb.usage;

    handle_disk_resize(
        &tc.ctx,
        &DiskResizeRequest {
            session: tc.alice(),
            vm_id,
            disk_id,
            new_size_mb: 1500,
        },
    )
    .await
    .unwrap();

    let vm = tc.ctx.vms.get_ro(vm_id).await.unwrap();
    assert_eq!(vm.disks.get(disk_id).unwrap().size_mb, 1500);
    let usage = tc.alice_quota().await.vm.system_disk_mb.usage;
    assert_eq!(usage, usage_before + 500, "delta = new - current");
}

#[tokio::test]
async fn test_disk_shrink_rejected_before_quota() {
    let tc = TestContext::new().await;
    let (vm_id, disk_id) = vm_with_volatile(&tc, 1000).await;
    let before = tc.alice_quota().await;

    let err = handle_disk_resize(
        &tc.ctx,
        &DiskResizeRequest {
            session: tc.alice(),
            vm_id,
            disk_id,
            new_size_mb: 900,
        },
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("must be greater"));
    assert_eq!(tc.alice_quota().await, before, "no quota call was made");
}

#[tokio::test]
async fn test_disk_resize_rejected_with_snapshots() {
    let tc = TestContext::new().await;
    let (vm_id, disk_id) = vm_with_image_disk(&tc).await;

    handle_disk_snapshot_create(
        &tc.ctx,
        &DiskSnapshotCreateRequest {
            session: tc.alice(),
            vm_id,
            disk_id,
            name: "before-upgrade".to_string(),
        },
    )
    .await
    .unwrap();

    let err = handle_disk_resize(
        &tc.ctx,
        &DiskResizeRequest {
            session: tc.alice(),
            vm_id,
            disk_id,
            new_size_mb: 8192,
        },
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("snapshots"));
}

#[tokio::test]
async fn test_snapshot_doubles_accounting_and_delete_frees() {
    let tc = TestContext::new().await;
    let (vm_id, disk_id) = vm_with_image_disk(&tc).await;
    let usage_before = tc.alice_quota().await.vm.system_disk_mb.usage;

    // The snapshot is accounted at the live disk's size (4096).
    let response = handle_disk_snapshot_create(
        &tc.ctx,
        &DiskSnapshotCreateRequest {
            session: tc.alice(),
            vm_id,
            disk_id,
            name: "s0".to_string(),
        },
    )
    .await
    .unwrap();
    assert_eq!(
        tc.alice_quota().await.vm.system_disk_mb.usage,
        usage_before + 4096
    );

    // The active snapshot cannot be deleted.
    let err = handle_disk_snapshot_delete(
        &tc.ctx,
        &DiskSnapshotDeleteRequest {
            session: tc.alice(),
            vm_id,
            disk_id,
            snapshot_id: response.snapshot_id,
        },
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("active"));

    // Chain a second snapshot, step back to the first, delete the second.
    let second = handle_disk_snapshot_create(
        &tc.ctx,
        &DiskSnapshotCreateRequest {
            session: tc.alice(),
            vm_id,
            disk_id,
            name: "s1".to_string(),
        },
    )
    .await
    .unwrap();
    handle_disk_snapshot_revert(
        &tc.ctx,
        &DiskSnapshotRevertRequest {
            session: tc.alice(),
            vm_id,
            disk_id,
            snapshot_id: response.snapshot_id,
        },
    )
    .await
    .unwrap();
    handle_disk_snapshot_delete(
        &tc.ctx,
        &DiskSnapshotDeleteRequest {
            session: tc.alice(),
            vm_id,
            disk_id,
            snapshot_id: second.snapshot_id,
        },
    )
    .await
    .unwrap();

    assert_eq!(
        tc.alice_quota().await.vm.system_disk_mb.usage,
        usage_before + 4096,
        "the deleted snapshot's size came back"
    );
    let vm = tc.ctx.vms.get_ro(vm_id).await.unwrap();
    assert_eq!(vm.disks.get(disk_id).unwrap().snapshots.total_mb(), 4096);
}

#[tokio::test]
async fn test_snapshot_rejected_for_volatile_disk() {
    let tc = TestContext::new().await;
    let (vm_id, disk_id) = vm_with_volatile(&tc, 1024).await;

    let err = handle_disk_snapshot_create(
        &tc.ctx,
        &DiskSnapshotCreateRequest {
            session: tc.alice(),
            vm_id,
            disk_id,
            name: "nope".to_string(),
        },
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("volatile"));
}

#[tokio::test]
async fn test_snapshot_revert_requires_poweroff_or_suspended() {
    let tc = TestContext::new().await;
    let (vm_id, disk_id) = vm_with_image_disk(&tc).await;
    let snap = handle_disk_snapshot_create(
        &tc.ctx,
        &DiskSnapshotCreateRequest {
            session: tc.alice(),
            vm_id,
            disk_id,
            name: "s0".to_string(),
        },
    )
    .await
    .unwrap();

    tc.vm_action(VmAction::Resume, vm_id).await.unwrap();

    let err = handle_disk_snapshot_revert(
        &tc.ctx,
        &DiskSnapshotRevertRequest {
            session: tc.alice(),
            vm_id,
            disk_id,
            snapshot_id: snap.snapshot_id,
        },
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("not valid"));
}

#[tokio::test]
async fn test_backup_sizing_and_cancel_roundtrip() {
    let tc = TestContext::new().await;
    let (vm_id, _) = vm_with_image_disk(&tc).await;

    // Swap and volatile FS disks are excluded from the upper bound.
    for (volatile_type, size) in [("swap", 512), ("fs", 1024)] {
        handle_attach_disk(
            &tc.ctx,
            &AttachDiskRequest {
                session: tc.alice(),
                vm_id,
                disk: DiskTemplate {
                    size_mb: Some(size),
                    volatile_type: Some(volatile_type.to_string()),
                    ..Default::default()
                },
            },
        )
        .await
        .unwrap();
    }

    let response = handle_backup(
        &tc.ctx,
        &BackupRequest {
            session: tc.alice(),
            vm_id,
            datastore_id: Some(BACKUP_DS),
            reset: false,
        },
    )
    .await
    .unwrap();
    assert_eq!(response.size_mb, 4096, "image disk only");
    assert!(!response.incremental, "first backup of the chain is full");

    let alice = tc.alice_quota().await;
    let backup_quota = alice.datastores.get(&BACKUP_DS).unwrap();
    assert_eq!(backup_quota.size_mb.usage, 4096);
    assert_eq!(backup_quota.images.usage, 1);

    // A second backup is rejected while one is in flight.
    let err = handle_backup(
        &tc.ctx,
        &BackupRequest {
            session: tc.alice(),
            vm_id,
            datastore_id: Some(BACKUP_DS),
            reset: false,
        },
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("in progress"));

    // Cancel returns the reservation.
    handle_backup_cancel(
        &tc.ctx,
        &BackupCancelRequest {
            session: tc.alice(),
            vm_id,
        },
    )
    .await
    .unwrap();
    let alice = tc.alice_quota().await;
    let backup_quota = alice.datastores.get(&BACKUP_DS).unwrap();
    assert_eq!(backup_quota.size_mb.usage, 0);
    assert_eq!(backup_quota.images.usage, 0);

    // The chain exists now, every disk is QCOW2 and snapshot-free, and
    // the KVM driver supports increments.
    let response = handle_backup(
        &tc.ctx,
        &BackupRequest {
            session: tc.alice(),
            vm_id,
            datastore_id: Some(BACKUP_DS),
            reset: false,
        },
    )
    .await
    .unwrap();
    assert!(response.incremental);
}

#[tokio::test]
async fn test_backup_rejects_non_backup_datastore() {
    let tc = TestContext::new().await;
    let (vm_id, _) = vm_with_image_disk(&tc).await;

    let err = handle_backup(
        &tc.ctx,
        &BackupRequest {
            session: tc.alice(),
            vm_id,
            datastore_id: Some(SYSTEM_DS),
            reset: false,
        },
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("not of type BACKUP"));
}

#[tokio::test]
async fn test_backup_with_snapshots_falls_back_to_full() {
    let tc = TestContext::new().await;
    let (vm_id, disk_id) = vm_with_image_disk(&tc).await;

    // Seed a chain, then add a snapshot: increments are off again.
    let first = handle_backup(
        &tc.ctx,
        &BackupRequest {
            session: tc.alice(),
            vm_id,
            datastore_id: Some(BACKUP_DS),
            reset: false,
        },
    )
    .await
    .unwrap();
    assert!(!first.incremental);
    handle_backup_cancel(
        &tc.ctx,
        &BackupCancelRequest {
            session: tc.alice(),
            vm_id,
        },
    )
    .await
    .unwrap();

    handle_disk_snapshot_create(
        &tc.ctx,
        &DiskSnapshotCreateRequest {
            session: tc.alice(),
            vm_id,
            disk_id,
            name: "s0".to_string(),
        },
    )
    .await
    .unwrap();

    let second = handle_backup(
        &tc.ctx,
        &BackupRequest {
            session: tc.alice(),
            vm_id,
            datastore_id: Some(BACKUP_DS),
            reset: false,
        },
    )
    .await
    .unwrap();
    assert!(!second.incremental, "snapshots disqualify increments");
}
