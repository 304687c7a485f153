// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deploy and migrate: cluster-aware placement validation.
//!
//! Both handlers validate everything against shared snapshots first, then
//! commit in a fixed order - VNC port, host capacity, VM history - and
//! compensate the committed prefix in reverse when a later step fails.
//! History is never mutated before every precondition holds.

use crate::auth::AuthRequest;
use crate::context::Context;
use crate::error::{CoreError, Result};
use crate::objects::{
    AuthOp, Datastore, DatastoreType, Host, HostState, LcmState, Vm, VmState,
};
use crate::quota::{QuotaDeltas, Reservations, Subject};
use orchid_api::requests::{DeployRequest, MigrateRequest};
use tracing::{debug, instrument, warn};

/// The validated placement a deploy/migrate commits.
struct Placement {
    host_id: i64,
    cluster_id: i64,
    hostname: String,
    vmm_driver: String,
    ds_id: i64,
    tm_driver: String,
}

/// Resolve and validate the system datastore for a host's cluster.
///
/// With an explicit datastore: it must be of type SYSTEM and its cluster
/// set must contain the host's cluster. Without one: the first SYSTEM
/// datastore in the cluster's membership set is picked.
async fn resolve_system_ds(
    ctx: &Context,
    host: &Host,
    requested: Option<i64>,
) -> Result<Datastore> {
    match requested {
        Some(ds_id) => {
            let ds = ctx.datastores.get_ro(ds_id).await?;
            if ds.ds_type != DatastoreType::System {
                return Err(CoreError::action(format!(
                    "DATASTORE [{}] is not of type SYSTEM",
                    ds_id
                )));
            }
            if !ds.in_cluster(host.cluster_id) {
                return Err(CoreError::action(format!(
                    "DATASTORE [{}] is not in cluster [{}] of HOST [{}]",
                    ds_id, host.cluster_id, host.id
                )));
            }
            Ok(ds)
        }
        None => {
            let cluster = ctx.clusters.get_ro(host.cluster_id).await?;
            for ds_id in &cluster.datastores {
                let ds = ctx.datastores.get_ro(*ds_id).await?;
                if ds.ds_type == DatastoreType::System {
                    debug!(ds_id, cluster_id = cluster.id, "picked default system datastore");
                    return Ok(ds);
                }
            }
            Err(CoreError::action(format!(
                "no system datastore in cluster [{}]",
                cluster.id
            )))
        }
    }
}

/// Reserve a VNC port for the VM in the given cluster.
async fn acquire_vnc_port(ctx: &Context, cluster_id: i64, vm_id: i64) -> Result<u16> {
    let mut cluster = ctx.clusters.get(cluster_id).await?;
    let port = cluster
        .vnc_ports
        .acquire(vm_id)
        .map_err(|e| CoreError::action(format!("cluster [{}]: {}", cluster_id, e)))?;
    ctx.clusters.update(&cluster).await?;
    Ok(port)
}

/// Release a VNC port in the given cluster, best effort.
async fn release_vnc_port(ctx: &Context, cluster_id: i64, port: u16) {
    match ctx.clusters.get(cluster_id).await {
        Ok(mut cluster) => {
            cluster.vnc_ports.release(port);
            if let Err(err) = ctx.clusters.update(&cluster).await {
                warn!(cluster_id, port, %err, "failed to persist released VNC port");
            }
        }
        Err(err) => warn!(cluster_id, port, %err, "cluster vanished while releasing port"),
    }
}

/// Add capacity on the host, re-running the capacity test under the host
/// lock when enforcement applies.
async fn commit_host_capacity(ctx: &Context, vm: &Vm, host_id: i64, enforce: bool) -> Result<()> {
    let mut host = ctx.hosts.get(host_id).await?;
    if (enforce || vm.numa_pinned) && !host.share.test_capacity(vm.cpu, vm.memory_mb) {
        return Err(CoreError::action(format!(
            "not enough capacity on HOST [{}] for VM [{}]",
            host_id, vm.id
        )));
    }
    host.share.add_capacity(vm.cpu, vm.memory_mb);
    ctx.hosts.update(&host).await
}

/// Subtract capacity on a host, best effort.
async fn free_host_capacity(ctx: &Context, host_id: i64, cpu: f64, mem_mb: u64) {
    match ctx.hosts.get(host_id).await {
        Ok(mut host) => {
            host.share.del_capacity(cpu, mem_mb);
            if let Err(err) = ctx.hosts.update(&host).await {
                warn!(host_id, %err, "failed to persist freed capacity");
            }
        }
        Err(err) => warn!(host_id, %err, "host vanished while freeing capacity"),
    }
}

/// `vm.deploy` - place a pending VM on a host.
#[instrument(skip(ctx, request), fields(vm_id = request.vm_id, host_id = request.host_id))]
pub async fn handle_deploy(ctx: &Context, request: &DeployRequest) -> Result<()> {
    let actor = ctx.authenticate(&request.session).await?;
    let vm = ctx.vms.get_ro(request.vm_id).await?;

    if !matches!(
        vm.state,
        VmState::Pending | VmState::Hold | VmState::Stopped | VmState::Undeployed
    ) {
        return Err(CoreError::action(format!(
            "deploy is not valid for VM [{}] in state {}",
            vm.id,
            if vm.state == VmState::Active {
                format!("{}/{}", vm.state, vm.lcm_state)
            } else {
                vm.state.to_string()
            }
        )));
    }

    let host = ctx.hosts.get_ro(request.host_id).await?;
    if host.state == HostState::Offline {
        return Err(CoreError::action(format!(
            "HOST [{}] is OFFLINE",
            host.id
        )));
    }

    let ds = resolve_system_ds(ctx, &host, request.datastore_id).await?;

    // A deploy-time NIC must come from a network the host's cluster can
    // reach.
    let nic_net = match &request.nic {
        Some(nic) => {
            let net = ctx.networks.get_ro(nic.network_id).await?;
            if !net.in_cluster(host.cluster_id) {
                return Err(CoreError::action(format!(
                    "NET [{}] is not in cluster [{}] of HOST [{}]",
                    net.id, host.cluster_id, host.id
                )));
            }
            Some(net)
        }
        None => None,
    };

    // One clause per touched sub-resource.
    let mut auth_request = AuthRequest::for_actor(&actor);
    auth_request.add(AuthOp::Admin, vm.perm_snapshot());
    auth_request.add(AuthOp::Use, host.perm_snapshot());
    if request.datastore_id.is_some() {
        auth_request.add(AuthOp::Use, ds.perm_snapshot());
    }
    if let Some(net) = &nic_net {
        auth_request.add(AuthOp::Use, net.perm_snapshot());
    }
    ctx.auth.authorize(&auth_request).await?;

    // Pre-test capacity on the snapshot; the committed test reruns under
    // the host lock.
    if (request.enforce || vm.numa_pinned) && !host.share.test_capacity(vm.cpu, vm.memory_mb) {
        return Err(CoreError::action(format!(
            "not enough capacity on HOST [{}] for VM [{}]",
            host.id, vm.id
        )));
    }

    let placement = Placement {
        host_id: host.id,
        cluster_id: host.cluster_id,
        hostname: host.name.clone(),
        vmm_driver: host.vmm_driver.clone(),
        ds_id: ds.id,
        tm_driver: ds.tm_driver.clone(),
    };

    // Lease quota is charged to the VM owner before anything commits.
    let owner = Subject {
        uid: vm.uid,
        gid: vm.gid,
    };
    let mut reservations = Reservations::new();
    if let Some(net) = &nic_net {
        let deltas = QuotaDeltas::new().with_network(net.id, 1);
        ctx.quota.authorize(owner, &deltas).await?;
        reservations.push(owner, deltas);
    }

    // Commit order: network lease, VNC port, host capacity, VM history.
    // Each failure compensates the committed prefix in reverse.
    let leased_net = if let Some(net) = &nic_net {
        let outcome: Result<()> = async {
            let mut guard = ctx.networks.get(net.id).await?;
            guard.acquire_lease().map_err(CoreError::action)?;
            ctx.networks.update(&guard).await
        }
        .await;
        if let Err(err) = outcome {
            reservations.rollback(&ctx.quota).await;
            return Err(err);
        }
        Some(net.id)
    } else {
        None
    };

    let undo_lease = |net_id: Option<i64>| async move {
        if let Some(net_id) = net_id
            && let Ok(mut guard) = ctx.networks.get(net_id).await
        {
            guard.release_lease();
            let _ = ctx.networks.update(&guard).await;
        }
    };

    let vnc_port = if vm.graphics && vm.vnc_port.is_none() {
        match acquire_vnc_port(ctx, placement.cluster_id, vm.id).await {
            Ok(port) => Some(port),
            Err(err) => {
                undo_lease(leased_net).await;
                reservations.rollback(&ctx.quota).await;
                return Err(err);
            }
        }
    } else {
        None
    };

    if let Err(err) = commit_host_capacity(ctx, &vm, placement.host_id, request.enforce).await {
        if let Some(port) = vnc_port {
            release_vnc_port(ctx, placement.cluster_id, port).await;
        }
        undo_lease(leased_net).await;
        reservations.rollback(&ctx.quota).await;
        return Err(err);
    }

    let outcome: Result<()> = async {
        let mut guard = ctx.vms.get(request.vm_id).await?;
        if !matches!(
            guard.state,
            VmState::Pending | VmState::Hold | VmState::Stopped | VmState::Undeployed
        ) {
            return Err(CoreError::action(format!(
                "deploy is not valid for VM [{}] in state {}",
                guard.id, guard.state
            )));
        }
        guard.add_history(
            placement.host_id,
            placement.cluster_id,
            &placement.hostname,
            &placement.vmm_driver,
            &placement.tm_driver,
            placement.ds_id,
        );
        if let Some(port) = vnc_port {
            guard.vnc_port = Some(port);
        }
        if let Some(net_id) = leased_net {
            guard.nics.push(net_id);
        }
        guard.state = VmState::Active;
        guard.lcm_state = LcmState::Running;
        ctx.vms.update(&guard).await
    }
    .await;

    if let Err(err) = outcome {
        free_host_capacity(ctx, placement.host_id, vm.cpu, vm.memory_mb).await;
        if let Some(port) = vnc_port {
            release_vnc_port(ctx, placement.cluster_id, port).await;
        }
        undo_lease(leased_net).await;
        reservations.rollback(&ctx.quota).await;
        return Err(err);
    }
    reservations.commit();
    Ok(())
}

/// `vm.migrate` - move a deployed VM to another host and/or datastore.
#[instrument(skip(ctx, request), fields(vm_id = request.vm_id, host_id = request.host_id, live = request.live))]
pub async fn handle_migrate(ctx: &Context, request: &MigrateRequest) -> Result<()> {
    let actor = ctx.authenticate(&request.session).await?;
    let vm = ctx.vms.get_ro(request.vm_id).await?;

    let valid_state = matches!(vm.state, VmState::Poweroff | VmState::Suspended)
        || (vm.state == VmState::Active
            && matches!(vm.lcm_state, LcmState::Running | LcmState::Unknown));
    if !valid_state {
        return Err(CoreError::action(format!(
            "migrate is not valid for VM [{}] in state {}",
            vm.id,
            if vm.state == VmState::Active {
                format!("{}/{}", vm.state, vm.lcm_state)
            } else {
                vm.state.to_string()
            }
        )));
    }

    let current = vm
        .last_history()
        .cloned()
        .ok_or_else(|| CoreError::action(format!("VM [{}] has no placement history", vm.id)))?;
    if current.reopened {
        return Err(CoreError::action(format!(
            "VM [{}] history record was reopened, redeploy instead",
            vm.id
        )));
    }

    let host = ctx.hosts.get_ro(request.host_id).await?;
    if host.state == HostState::Offline {
        return Err(CoreError::action(format!(
            "HOST [{}] is OFFLINE",
            host.id
        )));
    }

    // The destination must differ in host or system datastore.
    let ds_changes = request
        .datastore_id
        .map(|ds| ds != current.ds_id)
        .unwrap_or(false);
    if host.id == current.host_id && !ds_changes {
        return Err(CoreError::action(format!(
            "VM [{}] is already running on HOST [{}]",
            vm.id, host.id
        )));
    }

    // PCI passthrough survives neither live nor warm migration.
    if vm.pci_devices > 0 && vm.state != VmState::Poweroff && !request.poweroff_first {
        return Err(CoreError::action(format!(
            "VM [{}] has PCI devices; power it off first or set the poweroff flag",
            vm.id
        )));
    }

    // Resolve the destination system datastore, falling back to the
    // current one, which must be reachable from the new cluster.
    let ds = match request.datastore_id {
        Some(_) => resolve_system_ds(ctx, &host, request.datastore_id).await?,
        None => {
            let ds = ctx.datastores.get_ro(current.ds_id).await?;
            if !ds.in_cluster(host.cluster_id) {
                return Err(CoreError::action(format!(
                    "DATASTORE [{}] is not in cluster [{}] of HOST [{}]",
                    ds.id, host.cluster_id, host.id
                )));
            }
            ds
        }
    };

    // Cross-driver datastore migration is rejected.
    if ds.tm_driver != current.tm_driver {
        return Err(CoreError::action(format!(
            "cannot migrate between system datastores with different transfer \
             drivers ('{}' vs '{}')",
            current.tm_driver, ds.tm_driver
        )));
    }

    if request.live {
        if vm.state != VmState::Active {
            return Err(CoreError::action(format!(
                "live migration requires VM [{}] to be running",
                vm.id
            )));
        }
        if vm.numa_pinned {
            return Err(CoreError::action(format!(
                "VM [{}] is NUMA-pinned and cannot migrate live",
                vm.id
            )));
        }
        if ds.id != current.ds_id && !ctx.config.features(&host.vmm_driver).ds_live_migration {
            return Err(CoreError::action(format!(
                "hypervisor driver '{}' does not support live system-datastore \
                 migration",
                host.vmm_driver
            )));
        }
    }

    let mut auth_request = AuthRequest::for_actor(&actor);
    auth_request.add(AuthOp::Admin, vm.perm_snapshot());
    auth_request.add(AuthOp::Use, host.perm_snapshot());
    if request.datastore_id.is_some() {
        auth_request.add(AuthOp::Use, ds.perm_snapshot());
    }
    ctx.auth.authorize(&auth_request).await?;

    if (request.enforce || vm.numa_pinned) && !host.share.test_capacity(vm.cpu, vm.memory_mb) {
        return Err(CoreError::action(format!(
            "not enough capacity on HOST [{}] for VM [{}]",
            host.id, vm.id
        )));
    }

    // A cluster change re-requests the VNC port in the destination
    // cluster; failure aborts before any history mutation. Live
    // migration keeps the old port reserved until the new history is
    // committed.
    let cluster_changes = host.cluster_id != current.cluster_id;
    let new_port = if cluster_changes && vm.vnc_port.is_some() {
        Some(acquire_vnc_port(ctx, host.cluster_id, vm.id).await?)
    } else {
        None
    };

    // Capacity moves only after the test passed: subtract from the prior
    // host, then add on the destination.
    if let Err(err) = commit_host_capacity(ctx, &vm, host.id, request.enforce).await {
        if let Some(port) = new_port {
            release_vnc_port(ctx, host.cluster_id, port).await;
        }
        return Err(err);
    }
    free_host_capacity(ctx, current.host_id, vm.cpu, vm.memory_mb).await;

    let old_port = vm.vnc_port;
    let outcome: Result<()> = async {
        let mut guard = ctx.vms.get(request.vm_id).await?;
        let still_valid = matches!(guard.state, VmState::Poweroff | VmState::Suspended)
            || (guard.state == VmState::Active
                && matches!(guard.lcm_state, LcmState::Running | LcmState::Unknown));
        if !still_valid {
            return Err(CoreError::action(format!(
                "migrate is not valid for VM [{}] in state {}",
                guard.id, guard.state
            )));
        }
        guard.close_history();
        guard.add_history(
            host.id,
            host.cluster_id,
            &host.name,
            &host.vmm_driver,
            &ds.tm_driver,
            ds.id,
        );
        if let Some(port) = new_port {
            if request.live
                && let Some(h) = guard.last_history_mut()
            {
                h.prev_vnc_port = old_port;
            }
            guard.vnc_port = Some(port);
        }
        ctx.vms.update(&guard).await
    }
    .await;

    if let Err(err) = outcome {
        // Reverse order: capacity back to the source, then the new port.
        free_host_capacity(ctx, host.id, vm.cpu, vm.memory_mb).await;
        if let Err(cap_err) = commit_host_capacity(ctx, &vm, current.host_id, false).await {
            warn!(host_id = current.host_id, %cap_err, "failed to restore source capacity");
        }
        if let Some(port) = new_port {
            release_vnc_port(ctx, host.cluster_id, port).await;
        }
        return Err(err);
    }

    // The transfer window is over; the old cluster's port is released.
    if let (Some(port), true) = (old_port, cluster_changes) {
        release_vnc_port(ctx, current.cluster_id, port).await;
    }
    Ok(())
}
