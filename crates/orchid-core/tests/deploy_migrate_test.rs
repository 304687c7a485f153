// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Placement workflows: deploy and migrate validation, capacity movement
//! and VNC port handling.

mod common;

use common::*;
use orchid_api::VmAction;
use orchid_api::requests::{DeployRequest, MigrateRequest, NicTemplate};
use orchid_core::dispatch::{handle_deploy, handle_migrate};
use orchid_core::objects::{Cluster, Host, HostState, LcmState, VmState};

fn migrate_request(tc: &TestContext, vm_id: i64, host_id: i64) -> MigrateRequest {
    MigrateRequest {
        session: tc.admin(),
        vm_id,
        host_id,
        live: false,
        enforce: false,
        datastore_id: None,
        poweroff_first: false,
    }
}

#[tokio::test]
async fn test_deploy_places_and_accounts() {
    let tc = TestContext::new().await;
    let vm_id = tc.pending_vm("web").await;
    {
        let mut guard = tc.ctx.vms.get(vm_id).await.unwrap();
        guard.graphics = true;
        tc.ctx.vms.update(&guard).await.unwrap();
    }

    tc.deploy(vm_id, HOST1).await.unwrap();

    let vm = tc.ctx.vms.get_ro(vm_id).await.unwrap();
    assert_eq!(vm.state, VmState::Active);
    assert_eq!(vm.lcm_state, LcmState::Running);

    let history = vm.last_history().unwrap();
    assert_eq!(history.host_id, HOST1);
    assert_eq!(history.ds_id, SYSTEM_DS, "default system datastore picked");
    assert_eq!(history.tm_driver, "shared");

    let host = tc.ctx.hosts.get_ro(HOST1).await.unwrap();
    assert_eq!(host.share.running_vms, 1);
    assert_eq!(host.share.used_mem_mb, 1024);

    // Preferred port: base + vm_id.
    let port = vm.vnc_port.unwrap();
    assert_eq!(port, 5900 + vm_id as u16);
    let cluster = tc.ctx.clusters.get_ro(CLUSTER).await.unwrap();
    assert!(cluster.vnc_ports.in_use(port));
}

#[tokio::test]
async fn test_deploy_rejected_while_running() {
    let tc = TestContext::new().await;
    let vm_id = tc.running_vm("web").await;

    let err = tc.deploy(vm_id, HOST1).await.unwrap_err();
    let message = err.to_string();
    assert!(message.contains("deploy is not valid"));
    assert!(message.contains("ACTIVE/RUNNING"));
}

#[tokio::test]
async fn test_deploy_rejects_offline_host() {
    let tc = TestContext::new().await;
    let vm_id = tc.pending_vm("web").await;
    {
        let mut host = tc.ctx.hosts.get(HOST2).await.unwrap();
        host.state = HostState::Offline;
        tc.ctx.hosts.update(&host).await.unwrap();
    }

    let err = tc.deploy(vm_id, HOST2).await.unwrap_err();
    assert!(err.to_string().contains("OFFLINE"));
}

#[tokio::test]
async fn test_deploy_rejects_non_system_datastore() {
    let tc = TestContext::new().await;
    let vm_id = tc.pending_vm("web").await;

    let err = handle_deploy(
        &tc.ctx,
        &DeployRequest {
            session: tc.admin(),
            vm_id,
            host_id: HOST1,
            enforce: false,
            datastore_id: Some(IMAGE_DS),
            nic: None,
        },
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("not of type SYSTEM"));
}

#[tokio::test]
async fn test_deploy_fails_without_system_datastore() {
    let tc = TestContext::new().await;
    // A fresh cluster with one host and no datastores at all.
    let cluster_id = tc
        .ctx
        .clusters
        .allocate(Cluster::new("rack2", 5900, 64))
        .await
        .unwrap();
    let host_id = tc
        .ctx
        .hosts
        .allocate(Host::new("node3", cluster_id, "kvm"))
        .await
        .unwrap();

    let vm_id = tc.pending_vm("web").await;
    let err = tc.deploy(vm_id, host_id).await.unwrap_err();
    assert!(
        err.to_string()
            .contains(&format!("no system datastore in cluster [{}]", cluster_id))
    );
}

#[tokio::test]
async fn test_deploy_enforces_capacity() {
    let tc = TestContext::new().await;
    let vm_id =
        orchid_core::dispatch::handle_vm_allocate(&tc.ctx, &tc.alice(), "big", 16.0, 8, 32768)
            .await
            .unwrap();

    let err = handle_deploy(
        &tc.ctx,
        &DeployRequest {
            session: tc.admin(),
            vm_id,
            host_id: HOST1,
            enforce: true,
            datastore_id: None,
            nic: None,
        },
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("not enough capacity"));

    // Nothing was committed.
    let vm = tc.ctx.vms.get_ro(vm_id).await.unwrap();
    assert_eq!(vm.state, VmState::Pending);
    assert!(!vm.has_history());
    let host = tc.ctx.hosts.get_ro(HOST1).await.unwrap();
    assert_eq!(host.share.running_vms, 0);
}

#[tokio::test]
async fn test_deploy_with_nic_leases_and_terminate_frees() {
    let tc = TestContext::new().await;
    let vm_id = tc.pending_vm("web").await;

    handle_deploy(
        &tc.ctx,
        &DeployRequest {
            session: tc.admin(),
            vm_id,
            host_id: HOST1,
            enforce: false,
            datastore_id: None,
            nic: Some(NicTemplate { network_id: 0 }),
        },
    )
    .await
    .unwrap();

    let net = tc.ctx.networks.get_ro(0).await.unwrap();
    assert_eq!(net.used_leases, 1);
    let quota = tc.alice_quota().await;
    assert_eq!(quota.networks.get(&0).unwrap().usage, 1);

    tc.vm_action(VmAction::Terminate, vm_id).await.unwrap();
    let net = tc.ctx.networks.get_ro(0).await.unwrap();
    assert_eq!(net.used_leases, 0);
    assert_eq!(tc.alice_quota().await.networks.get(&0).unwrap().usage, 0);
}

#[tokio::test]
async fn test_deploy_rejects_unreachable_network() {
    let tc = TestContext::new().await;
    let vm_id = tc.pending_vm("web").await;

    // A network no cluster can reach.
    let net_id = tc
        .ctx
        .networks
        .allocate(orchid_core::objects::VirtualNetwork::new("isolated", 8))
        .await
        .unwrap();

    let err = handle_deploy(
        &tc.ctx,
        &DeployRequest {
            session: tc.admin(),
            vm_id,
            host_id: HOST1,
            enforce: false,
            datastore_id: None,
            nic: Some(NicTemplate { network_id: net_id }),
        },
    )
    .await
    .unwrap_err();
    assert!(err.to_string().contains("is not in cluster"));
    assert_eq!(tc.ctx.vms.get_ro(vm_id).await.unwrap().state, VmState::Pending);
}

#[tokio::test]
async fn test_migrate_rejected_from_scheduling_states() {
    let tc = TestContext::new().await;
    let vm_id = tc.pending_vm("web").await;

    let err = handle_migrate(&tc.ctx, &migrate_request(&tc, vm_id, HOST2))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("migrate is not valid"));
    assert!(err.to_string().contains("PENDING"));

    tc.vm_action(VmAction::Hold, vm_id).await.unwrap();
    let err = handle_migrate(&tc.ctx, &migrate_request(&tc, vm_id, HOST2))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("HOLD"));

    // History untouched by either rejection.
    assert!(!tc.ctx.vms.get_ro(vm_id).await.unwrap().has_history());
}

#[tokio::test]
async fn test_migrate_cross_datastore_driver_rejection() {
    let tc = TestContext::new().await;
    let vm_id = tc.running_vm("web").await;

    // Current placement uses the "shared" driver; the requested datastore
    // uses "ssh".
    let mut request = migrate_request(&tc, vm_id, HOST2);
    request.datastore_id = Some(SYSTEM_SSH_DS);
    let err = handle_migrate(&tc.ctx, &request).await.unwrap_err();
    assert!(err.to_string().contains("transfer"));

    // No history appended, no VNC port consumed.
    let vm = tc.ctx.vms.get_ro(vm_id).await.unwrap();
    assert_eq!(vm.history.len(), 1);
    let cluster = tc.ctx.clusters.get_ro(CLUSTER).await.unwrap();
    assert_eq!(cluster.vnc_ports.reserved(), 0);
}

#[tokio::test]
async fn test_cold_migrate_moves_capacity() {
    let tc = TestContext::new().await;
    let vm_id = tc.running_vm("web").await;
    tc.vm_action(VmAction::Poweroff, vm_id).await.unwrap();

    handle_migrate(&tc.ctx, &migrate_request(&tc, vm_id, HOST2))
        .await
        .unwrap();

    let vm = tc.ctx.vms.get_ro(vm_id).await.unwrap();
    assert_eq!(vm.state, VmState::Poweroff, "state survives a cold migrate");
    assert_eq!(vm.history.len(), 2);
    assert_eq!(vm.last_history().unwrap().host_id, HOST2);
    assert!(vm.history[0].etime.is_some(), "old record closed");

    let host1 = tc.ctx.hosts.get_ro(HOST1).await.unwrap();
    let host2 = tc.ctx.hosts.get_ro(HOST2).await.unwrap();
    assert_eq!(host1.share.running_vms, 0);
    assert_eq!(host1.share.used_mem_mb, 0);
    assert_eq!(host2.share.running_vms, 1);
    assert_eq!(host2.share.used_mem_mb, 1024);
}

#[tokio::test]
async fn test_migrate_to_same_placement_rejected() {
    let tc = TestContext::new().await;
    let vm_id = tc.running_vm("web").await;

    let err = handle_migrate(&tc.ctx, &migrate_request(&tc, vm_id, HOST1))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("already running on HOST [0]"));
}

#[tokio::test]
async fn test_live_migrate_rejects_numa_pinned() {
    let tc = TestContext::new().await;
    let vm_id = tc.running_vm("web").await;
    {
        let mut guard = tc.ctx.vms.get(vm_id).await.unwrap();
        guard.numa_pinned = true;
        tc.ctx.vms.update(&guard).await.unwrap();
    }

    let mut request = migrate_request(&tc, vm_id, HOST2);
    request.live = true;
    // NUMA pinning also enforces capacity, which HOST2 satisfies; the
    // live-specific guard must fire first.
    let err = handle_migrate(&tc.ctx, &request).await.unwrap_err();
    assert!(err.to_string().contains("NUMA-pinned"));
}

#[tokio::test]
async fn test_migrate_with_pci_requires_poweroff() {
    let tc = TestContext::new().await;
    let vm_id = tc.running_vm("web").await;
    {
        let mut guard = tc.ctx.vms.get(vm_id).await.unwrap();
        guard.pci_devices = 1;
        tc.ctx.vms.update(&guard).await.unwrap();
    }

    let err = handle_migrate(&tc.ctx, &migrate_request(&tc, vm_id, HOST2))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("PCI"));

    // The explicit flag lets it through.
    let mut request = migrate_request(&tc, vm_id, HOST2);
    request.poweroff_first = true;
    handle_migrate(&tc.ctx, &request).await.unwrap();
}

#[tokio::test]
async fn test_concurrent_deploys_get_distinct_vnc_ports() {
    let tc = TestContext::new().await;

    let mut vm_ids = Vec::new();
    for i in 0..4 {
        let vm_id = tc.pending_vm(&format!("vm{}", i)).await;
        let mut guard = tc.ctx.vms.get(vm_id).await.unwrap();
        guard.graphics = true;
        tc.ctx.vms.update(&guard).await.unwrap();
        drop(guard);
        vm_ids.push(vm_id);
    }

    let deploys = vm_ids.iter().map(|vm_id| tc.deploy(*vm_id, HOST1));
    for result in futures::future::join_all(deploys).await {
        result.unwrap();
    }

    let mut ports = std::collections::HashSet::new();
    for vm_id in &vm_ids {
        let vm = tc.ctx.vms.get_ro(*vm_id).await.unwrap();
        ports.insert(vm.vnc_port.unwrap());
    }
    assert_eq!(ports.len(), vm_ids.len(), "all ports distinct");
}
