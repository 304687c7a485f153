// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster membership: add/remove hosts, datastores and networks.
//!
//! One generic workflow serves all six operations through the
//! [`ClusterMember`] capability trait. The cluster side commits first; a
//! member-side failure compensates the cluster change before surfacing.

use crate::auth::AuthRequest;
use crate::context::Context;
use crate::error::{CoreError, Result};
use crate::objects::{AuthOp, Cluster, Datastore, Host, PermSnapshot, VirtualNetwork};
use crate::pool::Pool;
use orchid_api::requests::ClusterMembershipRequest;
use tracing::instrument;

/// Behaviour an object needs to join and leave clusters.
pub trait ClusterMember: crate::objects::PoolObject {
    /// Record membership on the object side.
    fn attach_to(&mut self, cluster_id: i64) -> std::result::Result<(), String>;

    /// Remove membership on the object side.
    fn detach_from(&mut self, cluster_id: i64) -> std::result::Result<(), String>;

    /// Record the object in the cluster's membership set.
    fn register(cluster: &mut Cluster, oid: i64) -> std::result::Result<(), String>;

    /// Remove the object from the cluster's membership set.
    fn deregister(cluster: &mut Cluster, oid: i64) -> std::result::Result<(), String>;

    /// Permission snapshot for the authorization clause.
    fn member_snapshot(&self) -> PermSnapshot;
}

impl ClusterMember for Host {
    fn attach_to(&mut self, cluster_id: i64) -> std::result::Result<(), String> {
        if self.cluster_id == cluster_id {
            return Err(format!("HOST [{}] is already in the cluster", self.id));
        }
        self.cluster_id = cluster_id;
        Ok(())
    }

    fn detach_from(&mut self, cluster_id: i64) -> std::result::Result<(), String> {
        if self.cluster_id != cluster_id {
            return Err(format!("HOST [{}] is not in the cluster", self.id));
        }
        // Hosts always belong to a cluster; removal moves them back to the
        // default one.
        self.cluster_id = 0;
        Ok(())
    }

    fn register(cluster: &mut Cluster, oid: i64) -> std::result::Result<(), String> {
        cluster.add_host(oid)
    }

    fn deregister(cluster: &mut Cluster, oid: i64) -> std::result::Result<(), String> {
        cluster.del_host(oid)
    }

    fn member_snapshot(&self) -> PermSnapshot {
        self.perm_snapshot()
    }
}

impl ClusterMember for Datastore {
    fn attach_to(&mut self, cluster_id: i64) -> std::result::Result<(), String> {
        if !self.cluster_ids.insert(cluster_id) {
            return Err(format!(
                "DATASTORE [{}] is already in cluster [{}]",
                self.id, cluster_id
            ));
        }
        Ok(())
    }

    fn detach_from(&mut self, cluster_id: i64) -> std::result::Result<(), String> {
        if !self.cluster_ids.remove(&cluster_id) {
            return Err(format!(
                "DATASTORE [{}] is not in cluster [{}]",
                self.id, cluster_id
            ));
        }
        Ok(())
    }

    fn register(cluster: &mut Cluster, oid: i64) -> std::result::Result<(), String> {
        cluster.add_datastore(oid)
    }

    fn deregister(cluster: &mut Cluster, oid: i64) -> std::result::Result<(), String> {
        cluster.del_datastore(oid)
    }

    fn member_snapshot(&self) -> PermSnapshot {
        self.perm_snapshot()
    }
}

impl ClusterMember for VirtualNetwork {
    fn attach_to(&mut self, cluster_id: i64) -> std::result::Result<(), String> {
        if !self.cluster_ids.insert(cluster_id) {
            return Err(format!(
                "NET [{}] is already in cluster [{}]",
                self.id, cluster_id
            ));
        }
        Ok(())
    }

    fn detach_from(&mut self, cluster_id: i64) -> std::result::Result<(), String> {
        if !self.cluster_ids.remove(&cluster_id) {
            return Err(format!(
                "NET [{}] is not in cluster [{}]",
                self.id, cluster_id
            ));
        }
        Ok(())
    }

    fn register(cluster: &mut Cluster, oid: i64) -> std::result::Result<(), String> {
        cluster.add_vnet(oid)
    }

    fn deregister(cluster: &mut Cluster, oid: i64) -> std::result::Result<(), String> {
        cluster.del_vnet(oid)
    }

    fn member_snapshot(&self) -> PermSnapshot {
        self.perm_snapshot()
    }
}

/// The shared membership workflow for all six operations.
async fn change_membership<T: ClusterMember>(
    ctx: &Context,
    pool: &Pool<T>,
    request: &ClusterMembershipRequest,
    add: bool,
) -> Result<()> {
    let actor = ctx.authenticate(&request.session).await?;

    let cluster = ctx.clusters.get_ro(request.cluster_id).await?;
    let member = pool.get_ro(request.object_id).await?;

    // Two clauses: ADMIN on the cluster, ADMIN on the member.
    let mut auth_request = AuthRequest::for_actor(&actor);
    auth_request.add(AuthOp::Admin, cluster.perm_snapshot());
    auth_request.add(AuthOp::Admin, member.member_snapshot());
    ctx.auth.authorize(&auth_request).await?;

    // Cluster side first.
    {
        let mut guard = ctx.clusters.get(request.cluster_id).await?;
        let result = if add {
            T::register(&mut guard, request.object_id)
        } else {
            T::deregister(&mut guard, request.object_id)
        };
        result.map_err(CoreError::action)?;
        ctx.clusters.update(&guard).await?;
    }

    // Member side; compensate the cluster change on failure.
    let outcome: Result<()> = async {
        let mut guard = pool.get(request.object_id).await?;
        let result = if add {
            guard.attach_to(request.cluster_id)
        } else {
            guard.detach_from(request.cluster_id)
        };
        result.map_err(CoreError::action)?;
        pool.update(&guard).await
    }
    .await;

    if let Err(err) = outcome {
        if let Ok(mut guard) = ctx.clusters.get(request.cluster_id).await {
            let _ = if add {
                T::deregister(&mut guard, request.object_id)
            } else {
                T::register(&mut guard, request.object_id)
            };
            let _ = ctx.clusters.update(&guard).await;
        }
        return Err(err);
    }
    Ok(())
}

/// `cluster.addhost`.
#[instrument(skip(ctx, request), fields(cluster_id = request.cluster_id, host_id = request.object_id))]
pub async fn handle_add_host(ctx: &Context, request: &ClusterMembershipRequest) -> Result<()> {
    change_membership::<Host>(ctx, &ctx.hosts, request, true).await
}

/// `cluster.delhost`.
#[instrument(skip(ctx, request), fields(cluster_id = request.cluster_id, host_id = request.object_id))]
pub async fn handle_del_host(ctx: &Context, request: &ClusterMembershipRequest) -> Result<()> {
    change_membership::<Host>(ctx, &ctx.hosts, request, false).await
}

/// `cluster.adddatastore`.
#[instrument(skip(ctx, request), fields(cluster_id = request.cluster_id, ds_id = request.object_id))]
pub async fn handle_add_datastore(
    ctx: &Context,
    request: &ClusterMembershipRequest,
) -> Result<()> {
    change_membership::<Datastore>(ctx, &ctx.datastores, request, true).await
}

/// `cluster.deldatastore`.
#[instrument(skip(ctx, request), fields(cluster_id = request.cluster_id, ds_id = request.object_id))]
pub async fn handle_del_datastore(
    ctx: &Context,
    request: &ClusterMembershipRequest,
) -> Result<()> {
    change_membership::<Datastore>(ctx, &ctx.datastores, request, false).await
}

/// `cluster.addvnet`.
#[instrument(skip(ctx, request), fields(cluster_id = request.cluster_id, net_id = request.object_id))]
pub async fn handle_add_vnet(ctx: &Context, request: &ClusterMembershipRequest) -> Result<()> {
    change_membership::<VirtualNetwork>(ctx, &ctx.networks, request, true).await
}

/// `cluster.delvnet`.
#[instrument(skip(ctx, request), fields(cluster_id = request.cluster_id, net_id = request.object_id))]
pub async fn handle_del_vnet(ctx: &Context, request: &ClusterMembershipRequest) -> Result<()> {
    change_membership::<VirtualNetwork>(ctx, &ctx.networks, request, false).await
}
