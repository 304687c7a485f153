// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Generic VM action dispatch and capacity resize.
//!
//! The closed [`VmAction`] enum maps through per-action tables: required
//! authorization operation, validity against the current (state,
//! lcm-state) pair, and whether imported VMs support it. One handler
//! implements the workflow for all fifteen actions.

use super::fetch_vm_authorized;
use crate::auth::AuthRequest;
use crate::context::Context;
use crate::error::{CoreError, Result};
use crate::objects::{AuthOp, LcmState, ObjectKind, Vm, VmState};
use crate::quota::{QuotaDeltas, Reservations, Subject, VmDelta};
use orchid_api::VmAction;
use orchid_api::requests::{ResizeRequest, VmActionRequest};
use std::collections::BTreeMap;
use tracing::{instrument, warn};

/// The authorization operation an action requires.
pub fn auth_op(action: VmAction) -> AuthOp {
    match action {
        VmAction::Resched | VmAction::Unresched => AuthOp::Admin,
        _ => AuthOp::Manage,
    }
}

/// Whether an imported VM supports the action.
pub fn supported_for_imported(action: VmAction) -> bool {
    matches!(
        action,
        VmAction::Terminate
            | VmAction::TerminateHard
            | VmAction::Poweroff
            | VmAction::PoweroffHard
            | VmAction::Resched
            | VmAction::Unresched
    )
}

/// Whether the action is valid for the given (state, lcm-state) pair.
pub fn valid_in_state(action: VmAction, state: VmState, lcm: LcmState) -> bool {
    let running = state == VmState::Active && lcm == LcmState::Running;
    let running_or_unknown =
        state == VmState::Active && matches!(lcm, LcmState::Running | LcmState::Unknown);

    match action {
        VmAction::Terminate | VmAction::TerminateHard => state != VmState::Done,
        VmAction::Hold => state == VmState::Pending,
        VmAction::Release => state == VmState::Hold,
        VmAction::Stop => running || state == VmState::Suspended,
        VmAction::Suspend => running,
        VmAction::Resume => matches!(
            state,
            VmState::Stopped | VmState::Undeployed | VmState::Suspended | VmState::Poweroff
        ),
        VmAction::Reboot | VmAction::RebootHard => running,
        VmAction::Poweroff | VmAction::PoweroffHard => running_or_unknown,
        VmAction::Undeploy | VmAction::UndeployHard => {
            running_or_unknown || state == VmState::Poweroff
        }
        VmAction::Resched | VmAction::Unresched => running || state == VmState::Poweroff,
    }
}

fn state_error(action: VmAction, vm: &Vm) -> CoreError {
    let state = if vm.state == VmState::Active {
        format!("{}/{}", vm.state, vm.lcm_state)
    } else {
        vm.state.to_string()
    };
    CoreError::action(format!(
        "action '{}' is not valid for VM [{}] in state {}",
        action, vm.id, state
    ))
}

/// The running-state quota footprint of a VM.
pub(crate) fn running_deltas(vm: &Vm) -> QuotaDeltas {
    QuotaDeltas::vm(VmDelta::running(vm.cpu, vm.memory_mb as i64))
}

/// The full quota footprint freed when a VM is terminated: the base VM
/// counters, the running counters when applicable, and every disk's
/// accounted space (snapshots included) per the accounting-target table.
pub(crate) fn terminate_deltas(vm: &Vm) -> QuotaDeltas {
    let mut vm_delta = VmDelta {
        vms: 1,
        cpu: vm.cpu,
        memory_mb: vm.memory_mb as i64,
        ..Default::default()
    };
    if vm.is_running_state() {
        vm_delta.running_vms = 1;
        vm_delta.running_cpu = vm.cpu;
        vm_delta.running_memory_mb = vm.memory_mb as i64;
    }

    let mut ds_totals: BTreeMap<i64, i64> = BTreeMap::new();
    for disk in vm.disks.iter() {
        let total = (disk.size_mb + disk.snapshots.total_mb()) as i64;
        let charges = disk.charge_set();
        if charges.vm_system {
            vm_delta.system_disk_mb += total;
        }
        if charges.image_datastore
            && let Some(ds_id) = disk.datastore_id
        {
            *ds_totals.entry(ds_id).or_default() += total;
        }
    }

    let mut deltas = QuotaDeltas::vm(vm_delta);
    for (ds_id, size_mb) in ds_totals {
        deltas = deltas.with_datastore(ds_id, size_mb, 0);
    }
    let mut lease_counts: BTreeMap<i64, i64> = BTreeMap::new();
    for net_id in &vm.nics {
        *lease_counts.entry(*net_id).or_default() += 1;
    }
    for (net_id, leases) in lease_counts {
        deltas = deltas.with_network(net_id, leases);
    }
    deltas
}

/// Deferred cross-pool effects of a committed transition.
#[derive(Default)]
struct SideEffects {
    free_capacity: Option<(i64, f64, u64)>,
    release_port: Option<(i64, u16)>,
    release_images: Vec<i64>,
    release_leases: Vec<i64>,
    quota_release: Option<QuotaDeltas>,
}

/// Release the VM's placement: host capacity, VNC port, open history.
fn free_placement(vm: &mut Vm, effects: &mut SideEffects) {
    let placed = vm
        .last_history()
        .filter(|h| h.etime.is_none())
        .map(|h| (h.host_id, h.cluster_id));
    if let Some((host_id, cluster_id)) = placed {
        effects.free_capacity = Some((host_id, vm.cpu, vm.memory_mb));
        if let Some(port) = vm.vnc_port.take() {
            effects.release_port = Some((cluster_id, port));
        }
    }
    vm.close_history();
}

/// Mutate the VM for the action and collect the cross-pool effects.
fn apply_transition(vm: &mut Vm, action: VmAction, effects: &mut SideEffects) {
    match action {
        VmAction::Terminate | VmAction::TerminateHard => {
            effects.quota_release = Some(terminate_deltas(vm));
            free_placement(vm, effects);
            effects.release_images = vm.disks.iter().filter_map(|d| d.image_id).collect();
            effects.release_leases = std::mem::take(&mut vm.nics);
            vm.state = VmState::Done;
            vm.lcm_state = LcmState::LcmInit;
        }
        VmAction::Hold => vm.state = VmState::Hold,
        VmAction::Release => vm.state = VmState::Pending,
        VmAction::Stop => {
            // A suspended VM already gave its running footprint back.
            if vm.is_running_state() {
                effects.quota_release = Some(running_deltas(vm));
            }
            free_placement(vm, effects);
            vm.state = VmState::Stopped;
            vm.lcm_state = LcmState::LcmInit;
        }
        VmAction::Suspend => {
            effects.quota_release = Some(running_deltas(vm));
            vm.state = VmState::Suspended;
            vm.lcm_state = LcmState::LcmInit;
        }
        VmAction::Resume => match vm.state {
            VmState::Stopped | VmState::Undeployed => {
                vm.state = VmState::Pending;
                vm.lcm_state = LcmState::LcmInit;
            }
            _ => {
                if vm.state == VmState::Poweroff
                    && let Some(h) = vm.last_history_mut()
                {
                    h.reopened = true;
                }
                vm.state = VmState::Active;
                vm.lcm_state = LcmState::Running;
            }
        },
        VmAction::Reboot | VmAction::RebootHard => {}
        VmAction::Poweroff | VmAction::PoweroffHard => {
            effects.quota_release = Some(running_deltas(vm));
            vm.state = VmState::Poweroff;
            vm.lcm_state = LcmState::LcmInit;
        }
        VmAction::Undeploy | VmAction::UndeployHard => {
            // A powered-off VM already gave its running footprint back.
            if vm.is_running_state() {
                effects.quota_release = Some(running_deltas(vm));
            }
            free_placement(vm, effects);
            vm.state = VmState::Undeployed;
            vm.lcm_state = LcmState::LcmInit;
        }
        VmAction::Resched => vm.resched = true,
        VmAction::Unresched => vm.resched = false,
    }
}

/// Run the deferred cross-pool effects. Best effort: the VM transition is
/// already committed, so failures here are logged, not surfaced.
async fn apply_side_effects(ctx: &Context, owner: Subject, effects: SideEffects) {
    if let Some((host_id, cpu, mem)) = effects.free_capacity {
        match ctx.hosts.get(host_id).await {
            Ok(mut host) => {
                host.share.del_capacity(cpu, mem);
                if let Err(err) = ctx.hosts.update(&host).await {
                    warn!(host_id, %err, "failed to persist freed capacity");
                }
            }
            Err(err) => warn!(host_id, %err, "host vanished while freeing capacity"),
        }
    }

    if let Some((cluster_id, port)) = effects.release_port {
        match ctx.clusters.get(cluster_id).await {
            Ok(mut cluster) => {
                cluster.vnc_ports.release(port);
                if let Err(err) = ctx.clusters.update(&cluster).await {
                    warn!(cluster_id, %err, "failed to persist released VNC port");
                }
            }
            Err(err) => warn!(cluster_id, %err, "cluster vanished while releasing port"),
        }
    }

    for image_id in effects.release_images {
        match ctx.images.get(image_id).await {
            Ok(mut image) => {
                image.release();
                if let Err(err) = ctx.images.update(&image).await {
                    warn!(image_id, %err, "failed to persist image release");
                }
            }
            Err(err) => warn!(image_id, %err, "image vanished while releasing"),
        }
    }

    for net_id in effects.release_leases {
        match ctx.networks.get(net_id).await {
            Ok(mut net) => {
                net.release_lease();
                if let Err(err) = ctx.networks.update(&net).await {
                    warn!(net_id, %err, "failed to persist released lease");
                }
            }
            Err(err) => warn!(net_id, %err, "network vanished while releasing lease"),
        }
    }

    if let Some(deltas) = effects.quota_release {
        if let Err(err) = ctx.quota.rollback(owner, &deltas).await {
            warn!(uid = owner.uid, %err, "failed to release quota");
        }
    }
}

/// `vm.action` - dispatch one generic action.
#[instrument(skip(ctx, request), fields(vm_id = request.vm_id, action = %request.action))]
pub async fn handle_vm_action(ctx: &Context, request: &VmActionRequest) -> Result<()> {
    let actor = ctx.authenticate(&request.session).await?;
    let action = request.action;

    // 1. Shared fetch; NO_EXISTS when absent.
    let vm = ctx.vms.get_ro(request.vm_id).await?;

    // 2. Imported VMs support a restricted subset.
    if vm.imported && !supported_for_imported(action) {
        return Err(CoreError::action(format!(
            "action '{}' is not supported for imported VM [{}]",
            action, vm.id
        )));
    }

    // 3. Early state check against the snapshot.
    if !valid_in_state(action, vm.state, vm.lcm_state) {
        return Err(state_error(action, &vm));
    }

    // 4. Authorization with the operation the action requires.
    let mut auth_request = AuthRequest::for_actor(&actor);
    auth_request.add(auth_op(action), vm.perm_snapshot());
    ctx.auth.authorize(&auth_request).await?;

    // 5. RESUME re-reserves the running footprint. Quota is charged to the
    //    VM owner, not the caller.
    let owner = Subject {
        uid: vm.uid,
        gid: vm.gid,
    };
    let mut reservations = Reservations::new();
    if action == VmAction::Resume {
        let deltas = running_deltas(&vm);
        ctx.quota.authorize(owner, &deltas).await?;
        reservations.push(owner, deltas);
    }

    // 6. Mutate under the exclusive lock, revalidating the state.
    let mut effects = SideEffects::default();
    let outcome: Result<()> = async {
        let mut guard = ctx.vms.get(request.vm_id).await?;
        if !valid_in_state(action, guard.state, guard.lcm_state) {
            return Err(state_error(action, &guard));
        }
        apply_transition(&mut guard, action, &mut effects);
        ctx.vms.update(&guard).await
    }
    .await;

    // 7. Compensate the reservation if the mutation failed.
    if let Err(err) = outcome {
        reservations.rollback(&ctx.quota).await;
        return Err(err);
    }
    reservations.commit();

    apply_side_effects(ctx, owner, effects).await;
    Ok(())
}

/// `vm.resize` - change CPU/VCPU/memory.
///
/// Cold resize is valid from PENDING/HOLD/POWEROFF/UNDEPLOYED. The hotplug
/// path is valid only from ACTIVE/RUNNING and only when the hypervisor
/// driver advertises live resize.
#[instrument(skip(ctx, request), fields(vm_id = request.vm_id))]
pub async fn handle_resize(ctx: &Context, request: &ResizeRequest) -> Result<()> {
    let actor = ctx.authenticate(&request.session).await?;
    let vm = fetch_vm_authorized(ctx, &actor, request.vm_id, AuthOp::Manage).await?;

    if vm.imported {
        return Err(CoreError::action(format!(
            "resize is not supported for imported VM [{}]",
            vm.id
        )));
    }

    let new_cpu = request.cpu.unwrap_or(vm.cpu);
    let new_vcpu = request.vcpu.unwrap_or(vm.vcpu);
    let new_memory = request.memory_mb.unwrap_or(vm.memory_mb);
    if new_cpu <= 0.0 || new_vcpu == 0 || new_memory == 0 {
        return Err(CoreError::action("resize values must be positive"));
    }
    if new_cpu == vm.cpu && new_vcpu == vm.vcpu && new_memory == vm.memory_mb {
        return Err(CoreError::action(format!(
            "nothing to resize for VM [{}]",
            vm.id
        )));
    }

    let cold = matches!(
        vm.state,
        VmState::Pending | VmState::Hold | VmState::Poweroff | VmState::Undeployed
    );
    let hotplug = vm.state == VmState::Active && vm.lcm_state == LcmState::Running;
    if !cold && !hotplug {
        return Err(CoreError::action(format!(
            "resize is not valid for VM [{}] in state {}",
            vm.id, vm.state
        )));
    }
    if hotplug {
        let driver = vm
            .last_history()
            .map(|h| h.vmm_driver.clone())
            .unwrap_or_default();
        if !ctx.config.features(&driver).live_resize {
            return Err(CoreError::action(format!(
                "hypervisor driver '{}' does not support live resize",
                driver
            )));
        }
    }

    // Quota delta against the owner: increases are checked, decreases
    // simply free.
    let owner = Subject {
        uid: vm.uid,
        gid: vm.gid,
    };
    let cpu_delta = new_cpu - vm.cpu;
    let mem_delta = new_memory as i64 - vm.memory_mb as i64;
    let mut vm_delta = VmDelta {
        cpu: cpu_delta,
        memory_mb: mem_delta,
        ..Default::default()
    };
    if vm.is_running_state() {
        vm_delta.running_cpu = cpu_delta;
        vm_delta.running_memory_mb = mem_delta;
    }
    let deltas = QuotaDeltas::vm(vm_delta);
    ctx.quota.authorize(owner, &deltas).await?;
    let mut reservations = Reservations::new();
    reservations.push(owner, deltas);

    // Deployed VMs also move host capacity.
    let placed = vm
        .last_history()
        .filter(|h| h.etime.is_none())
        .map(|h| h.host_id)
        .filter(|_| matches!(vm.state, VmState::Active | VmState::Poweroff));
    if let Some(host_id) = placed {
        let outcome: Result<()> = async {
            let mut host = ctx.hosts.get(host_id).await?;
            if (request.enforce || vm.numa_pinned)
                && cpu_delta > 0.0
                && !host
                    .share
                    .test_capacity(cpu_delta, mem_delta.max(0) as u64)
            {
                return Err(CoreError::action(format!(
                    "not enough capacity on HOST [{}] for the new size",
                    host_id
                )));
            }
            host.share.used_cpu = (host.share.used_cpu + cpu_delta).max(0.0);
            host.share.used_mem_mb =
                (host.share.used_mem_mb as i64 + mem_delta).max(0) as u64;
            ctx.hosts.update(&host).await
        }
        .await;
        if let Err(err) = outcome {
            reservations.rollback(&ctx.quota).await;
            return Err(err);
        }
    }

    let outcome: Result<()> = async {
        let mut guard = ctx.vms.get(request.vm_id).await?;
        let still_valid = matches!(
            guard.state,
            VmState::Pending | VmState::Hold | VmState::Poweroff | VmState::Undeployed
        ) || (guard.state == VmState::Active && guard.lcm_state == LcmState::Running);
        if !still_valid {
            return Err(CoreError::action(format!(
                "resize is not valid for VM [{}] in state {}",
                guard.id, guard.state
            )));
        }
        if hotplug {
            guard.lcm_state = LcmState::HotplugResize;
        }
        guard.cpu = new_cpu;
        guard.vcpu = new_vcpu;
        guard.memory_mb = new_memory;
        if hotplug {
            guard.lcm_state = LcmState::Running;
        }
        ctx.vms.update(&guard).await
    }
    .await;

    if let Err(err) = outcome {
        // Undo the host-side adjustment, then the quota.
        if let Some(host_id) = placed
            && let Ok(mut host) = ctx.hosts.get(host_id).await
        {
            host.share.used_cpu = (host.share.used_cpu - cpu_delta).max(0.0);
            host.share.used_mem_mb =
                (host.share.used_mem_mb as i64 - mem_delta).max(0) as u64;
            let _ = ctx.hosts.update(&host).await;
        }
        reservations.rollback(&ctx.quota).await;
        return Err(err);
    }
    reservations.commit();
    Ok(())
}

/// Allocate a new VM, charging the owner's VM quota.
#[instrument(skip(ctx, session))]
pub async fn handle_vm_allocate(
    ctx: &Context,
    session: &str,
    name: &str,
    cpu: f64,
    vcpu: u32,
    memory_mb: u64,
) -> Result<i64> {
    let actor = ctx.authenticate(session).await?;

    if cpu <= 0.0 || vcpu == 0 || memory_mb == 0 {
        return Err(CoreError::action("capacity values must be positive"));
    }

    let vm = Vm::new(name, actor.uid, actor.gid, cpu, vcpu, memory_mb);

    let mut request = AuthRequest::for_actor(&actor);
    request.add_create(ObjectKind::Vm, serde_json::to_string(&vm)?);
    ctx.auth.authorize(&request).await?;

    // A new VM enters PENDING, which counts as running for quota.
    let owner = Subject {
        uid: actor.uid,
        gid: actor.gid,
    };
    let deltas = QuotaDeltas::vm(VmDelta {
        vms: 1,
        cpu,
        memory_mb: memory_mb as i64,
        running_vms: 1,
        running_cpu: cpu,
        running_memory_mb: memory_mb as i64,
        ..Default::default()
    });
    ctx.quota.authorize(owner, &deltas).await?;

    match ctx.vms.allocate(vm).await {
        Ok(oid) => Ok(oid),
        Err(err) => {
            let _ = ctx.quota.rollback(owner, &deltas).await;
            Err(err)
        }
    }
}
