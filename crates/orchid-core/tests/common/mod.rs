// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared test fixture: an in-memory control plane with a seeded
//! infrastructure (one cluster, hosts, datastores, an image and two
//! users).

#![allow(dead_code)]

use orchid_core::auth::{PermissiveBackend, RestrictiveBackend, spawn_backend};
use orchid_core::objects::{
    Datastore, DatastoreType, DiskFormat, Host, Image, User, VirtualNetwork,
};
use orchid_core::quota::QuotaCounters;
use orchid_core::store::MemoryStore;
use orchid_core::{Config, Context};
use std::sync::Arc;

/// Seeded object ids, for readable assertions.
pub const CLUSTER: i64 = 0;
pub const HOST1: i64 = 0;
pub const HOST2: i64 = 1;
pub const SYSTEM_DS: i64 = 0;
pub const IMAGE_DS: i64 = 1;
pub const BACKUP_DS: i64 = 2;
pub const SYSTEM_SSH_DS: i64 = 3;
pub const BASE_IMAGE: i64 = 0;
pub const ADMIN_UID: i64 = 0;
pub const ALICE_UID: i64 = 1;
pub const BOB_UID: i64 = 2;
pub const USERS_GID: i64 = 1;

/// A fully seeded in-memory control plane.
pub struct TestContext {
    /// The context under test.
    pub ctx: Context,
}

impl TestContext {
    /// Context whose ACL driver grants everything not self-authorized.
    pub async fn new() -> Self {
        Self::build(false).await
    }

    /// Context whose ACL driver denies everything not self-authorized.
    pub async fn restrictive() -> Self {
        Self::build(true).await
    }

    async fn build(restrictive: bool) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .try_init();

        let store = Arc::new(MemoryStore::new());
        let (ctx, driver_rx) = Context::init(store, Config::default())
            .await
            .expect("context init");

        if restrictive {
            let _ = spawn_backend(
                ctx.auth.driver().clone(),
                driver_rx,
                Arc::new(RestrictiveBackend),
            );
        } else {
            let _ = spawn_backend(
                ctx.auth.driver().clone(),
                driver_rx,
                Arc::new(PermissiveBackend),
            );
        }

        ctx.bootstrap("nimda").await.expect("bootstrap");

        // Users: alice and bob in group "users".
        for name in ["alice", "bob"] {
            let uid = ctx
                .users
                .allocate(User::new(name, USERS_GID, "secret"))
                .await
                .expect("allocate user");
            let mut group = ctx.groups.get(USERS_GID).await.expect("users group");
            group.users.insert(uid);
            ctx.groups.update(&group).await.expect("update group");
        }

        // Two KVM hosts in the default cluster.
        for name in ["node1", "node2"] {
            let mut host = Host::new(name, CLUSTER, "kvm");
            host.share.total_cpu = 8.0;
            host.share.total_mem_mb = 16384;
            let host_id = ctx.hosts.allocate(host).await.expect("allocate host");
            let mut cluster = ctx.clusters.get(CLUSTER).await.expect("cluster");
            cluster.add_host(host_id).expect("add host");
            ctx.clusters.update(&cluster).await.expect("update cluster");
        }

        // Datastores: system (shared), image, backup, system (ssh).
        let specs = [
            ("system", DatastoreType::System, "shared"),
            ("default", DatastoreType::Image, "shared"),
            ("backups", DatastoreType::Backup, "shared"),
            ("system-ssh", DatastoreType::System, "ssh"),
        ];
        for (name, ds_type, tm) in specs {
            let mut ds = Datastore::new(name, ds_type, tm);
            ds.cluster_ids.insert(CLUSTER);
            let ds_id = ctx.datastores.allocate(ds).await.expect("allocate ds");
            let mut cluster = ctx.clusters.get(CLUSTER).await.expect("cluster");
            cluster.add_datastore(ds_id).expect("add ds");
            ctx.clusters.update(&cluster).await.expect("update cluster");
        }

        // A network reachable from the cluster.
        let mut net = VirtualNetwork::new("private", 64);
        net.cluster_ids.insert(CLUSTER);
        ctx.networks.allocate(net).await.expect("allocate net");

        // A non-persistent QCOW2 image owned by alice.
        let mut image = Image::new("base", ALICE_UID, USERS_GID, IMAGE_DS, 4096);
        image.format = DiskFormat::Qcow2;
        ctx.images.allocate(image).await.expect("allocate image");

        Self { ctx }
    }

    /// The superuser session.
    pub fn admin(&self) -> String {
        "admin:nimda".to_string()
    }

    /// Alice's session.
    pub fn alice(&self) -> String {
        "alice:secret".to_string()
    }

    /// Bob's session.
    pub fn bob(&self) -> String {
        "bob:secret".to_string()
    }

    /// Allocate a 1 CPU / 1024 MB VM owned by alice, in PENDING.
    pub async fn pending_vm(&self, name: &str) -> i64 {
        orchid_core::dispatch::handle_vm_allocate(&self.ctx, &self.alice(), name, 1.0, 1, 1024)
            .await
            .expect("allocate vm")
    }

    /// Allocate and deploy a VM onto HOST1, leaving it ACTIVE/RUNNING.
    pub async fn running_vm(&self, name: &str) -> i64 {
        let vm_id = self.pending_vm(name).await;
        self.deploy(vm_id, HOST1).await.expect("deploy");
        vm_id
    }

    /// Insert a PENDING VM owned by alice straight into the pool, without
    /// quota or authorization. For tests exercising denial paths.
    pub async fn seeded_vm(&self, name: &str) -> i64 {
        self.ctx
            .vms
            .allocate(orchid_core::objects::Vm::new(
                name, ALICE_UID, USERS_GID, 1.0, 1, 1024,
            ))
            .await
            .expect("seed vm")
    }

    /// Deploy a VM as the superuser.
    pub async fn deploy(&self, vm_id: i64, host_id: i64) -> orchid_core::Result<()> {
        orchid_core::dispatch::handle_deploy(
            &self.ctx,
            &orchid_api::requests::DeployRequest {
                session: self.admin(),
                vm_id,
                host_id,
                enforce: false,
                datastore_id: None,
                nic: None,
            },
        )
        .await
    }

    /// Run a generic action as alice.
    pub async fn vm_action(&self, action: orchid_api::VmAction, vm_id: i64) -> orchid_core::Result<()> {
        orchid_core::dispatch::handle_vm_action(
            &self.ctx,
            &orchid_api::requests::VmActionRequest {
                session: self.alice(),
                action,
                vm_id,
            },
        )
        .await
    }

    /// Alice's current quota counters.
    pub async fn alice_quota(&self) -> QuotaCounters {
        self.ctx
            .users
            .get_ro(ALICE_UID)
            .await
            .expect("alice")
            .quota
    }
}
