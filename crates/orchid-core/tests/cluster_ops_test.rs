// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Cluster membership operations through the generic workflow.

mod common;

use common::*;
use orchid_api::ErrorCode;
use orchid_api::requests::ClusterMembershipRequest;
use orchid_core::dispatch::{
    handle_add_datastore, handle_add_host, handle_add_vnet, handle_del_datastore,
    handle_del_host, handle_del_vnet,
};
use orchid_core::objects::Cluster;

fn request(session: String, cluster_id: i64, object_id: i64) -> ClusterMembershipRequest {
    ClusterMembershipRequest {
        session,
        cluster_id,
        object_id,
    }
}

#[tokio::test]
async fn test_host_membership_cycle() {
    let tc = TestContext::new().await;
    let rack2 = tc
        .ctx
        .clusters
        .allocate(Cluster::new("rack2", 5900, 64))
        .await
        .unwrap();

    // Move node2 out of the default cluster into rack2.
    handle_del_host(&tc.ctx, &request(tc.admin(), CLUSTER, HOST2))
        .await
        .unwrap();
    handle_add_host(&tc.ctx, &request(tc.admin(), rack2, HOST2))
        .await
        .unwrap();

    let default = tc.ctx.clusters.get_ro(CLUSTER).await.unwrap();
    assert!(!default.hosts.contains(&HOST2));
    let rack = tc.ctx.clusters.get_ro(rack2).await.unwrap();
    assert!(rack.hosts.contains(&HOST2));
    assert_eq!(tc.ctx.hosts.get_ro(HOST2).await.unwrap().cluster_id, rack2);

    // Double add is an ACTION failure.
    let err = handle_add_host(&tc.ctx, &request(tc.admin(), rack2, HOST2))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Action);
    assert!(err.to_string().contains("already"));
}

#[tokio::test]
async fn test_datastore_membership_cycle() {
    let tc = TestContext::new().await;
    let rack2 = tc
        .ctx
        .clusters
        .allocate(Cluster::new("rack2", 5900, 64))
        .await
        .unwrap();

    handle_add_datastore(&tc.ctx, &request(tc.admin(), rack2, IMAGE_DS))
        .await
        .unwrap();
    let ds = tc.ctx.datastores.get_ro(IMAGE_DS).await.unwrap();
    assert!(ds.in_cluster(CLUSTER) && ds.in_cluster(rack2));

    handle_del_datastore(&tc.ctx, &request(tc.admin(), rack2, IMAGE_DS))
        .await
        .unwrap();
    let ds = tc.ctx.datastores.get_ro(IMAGE_DS).await.unwrap();
    assert!(!ds.in_cluster(rack2));

    let err = handle_del_datastore(&tc.ctx, &request(tc.admin(), rack2, IMAGE_DS))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("not in the cluster"));
}

#[tokio::test]
async fn test_vnet_membership_cycle() {
    let tc = TestContext::new().await;
    let rack2 = tc
        .ctx
        .clusters
        .allocate(Cluster::new("rack2", 5900, 64))
        .await
        .unwrap();

    handle_add_vnet(&tc.ctx, &request(tc.admin(), rack2, 0))
        .await
        .unwrap();
    assert!(
        tc.ctx
            .networks
            .get_ro(0)
            .await
            .unwrap()
            .in_cluster(rack2)
    );

    handle_del_vnet(&tc.ctx, &request(tc.admin(), rack2, 0))
        .await
        .unwrap();
    assert!(
        !tc.ctx
            .networks
            .get_ro(0)
            .await
            .unwrap()
            .in_cluster(rack2)
    );
}

#[tokio::test]
async fn test_membership_requires_admin() {
    let tc = TestContext::restrictive().await;

    let err = handle_add_datastore(&tc.ctx, &request(tc.alice(), CLUSTER, IMAGE_DS))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Authorization);
    assert!(err.to_string().contains("ADMIN CLUSTER [0]"));
}

#[tokio::test]
async fn test_missing_objects_are_no_exists() {
    let tc = TestContext::new().await;

    let err = handle_add_host(&tc.ctx, &request(tc.admin(), 404, HOST1))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NoExists);

    let err = handle_add_host(&tc.ctx, &request(tc.admin(), CLUSTER, 404))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NoExists);
}
