// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! VM capacity resize: cold and hotplug paths.

mod common;

use common::*;
use orchid_api::requests::ResizeRequest;
use orchid_core::dispatch::handle_resize;
use orchid_core::objects::{Host, LcmState, VmState};

fn resize(tc: &TestContext, vm_id: i64, memory_mb: Option<u64>) -> ResizeRequest {
    ResizeRequest {
        session: tc.alice(),
        vm_id,
        cpu: None,
        vcpu: None,
        memory_mb,
        enforce: false,
    }
}

#[tokio::test]
async fn test_cold_resize_from_pending() {
    let tc = TestContext::new().await;
    let vm_id = tc.pending_vm("web").await;

    handle_resize(&tc.ctx, &resize(&tc, vm_id, Some(2048)))
        .await
        .unwrap();

    let vm = tc.ctx.vms.get_ro(vm_id).await.unwrap();
    assert_eq!(vm.memory_mb, 2048);
    let quota = tc.alice_quota().await;
    assert_eq!(quota.vm.memory_mb.usage, 2048);
    assert_eq!(quota.vm.running_memory_mb.usage, 2048, "PENDING counts as running");
}

#[tokio::test]
async fn test_hotplug_resize_with_capable_driver() {
    let tc = TestContext::new().await;
    let vm_id = tc.running_vm("web").await;

    // The KVM feature table advertises live resize.
    handle_resize(&tc.ctx, &resize(&tc, vm_id, Some(4096)))
        .await
        .unwrap();

    let vm = tc.ctx.vms.get_ro(vm_id).await.unwrap();
    assert_eq!(vm.memory_mb, 4096);
    assert_eq!(vm.state, VmState::Active);
    assert_eq!(vm.lcm_state, LcmState::Running);

    // The deployed host's share follows the new size.
    let host = tc.ctx.hosts.get_ro(HOST1).await.unwrap();
    assert_eq!(host.share.used_mem_mb, 4096);
}

#[tokio::test]
async fn test_hotplug_resize_requires_driver_support() {
    let tc = TestContext::new().await;

    // A host whose driver has no advertised features.
    let mut host = Host::new("node-xen", CLUSTER, "xen");
    host.share.total_cpu = 8.0;
    host.share.total_mem_mb = 16384;
    let host_id = tc.ctx.hosts.allocate(host).await.unwrap();
    {
        let mut cluster = tc.ctx.clusters.get(CLUSTER).await.unwrap();
        cluster.add_host(host_id).unwrap();
        tc.ctx.clusters.update(&cluster).await.unwrap();
    }

    let vm_id = tc.pending_vm("web").await;
    tc.deploy(vm_id, host_id).await.unwrap();

    let err = handle_resize(&tc.ctx, &resize(&tc, vm_id, Some(4096)))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("does not support live resize"));
    assert_eq!(tc.ctx.vms.get_ro(vm_id).await.unwrap().memory_mb, 1024);
}

#[tokio::test]
async fn test_resize_quota_denial_rolls_back() {
    let tc = TestContext::new().await;
    let vm_id = tc.pending_vm("web").await;
    {
        let mut alice = tc.ctx.users.get(ALICE_UID).await.unwrap();
        alice.quota.vm.memory_mb.limit = 1500;
        tc.ctx.users.update(&alice).await.unwrap();
    }

    let err = handle_resize(&tc.ctx, &resize(&tc, vm_id, Some(2048)))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("MEMORY"));

    assert_eq!(tc.ctx.vms.get_ro(vm_id).await.unwrap().memory_mb, 1024);
    assert_eq!(tc.alice_quota().await.vm.memory_mb.usage, 1024);
}

#[tokio::test]
async fn test_resize_nothing_to_do() {
    let tc = TestContext::new().await;
    let vm_id = tc.pending_vm("web").await;

    let err = handle_resize(&tc.ctx, &resize(&tc, vm_id, None))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("nothing to resize"));
}

#[tokio::test]
async fn test_shrink_frees_quota() {
    let tc = TestContext::new().await;
    let vm_id = tc.pending_vm("web").await;

    handle_resize(&tc.ctx, &resize(&tc, vm_id, Some(512)))
        .await
        .unwrap();
    assert_eq!(tc.alice_quota().await.vm.memory_mb.usage, 512);
}
