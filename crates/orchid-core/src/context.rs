// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The explicit dependency context.
//!
//! One [`Context`] is constructed at startup and passed by reference into
//! every handler. It owns the typed pools, the quota manager and the
//! authorization evaluator; there is no global registry.

use crate::auth::{AuthContext, AuthManager, DriverClient, DriverMessage};
use crate::config::Config;
use crate::error::Result;
use crate::objects::{
    Cluster, Datastore, Group, Host, Image, User, VirtualNetwork, Vm,
};
use crate::pool::Pool;
use crate::quota::QuotaManager;
use crate::store::Store;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

/// Everything a handler needs, constructed once.
pub struct Context {
    /// Static configuration.
    pub config: Config,
    /// VM pool.
    pub vms: Pool<Vm>,
    /// Host pool.
    pub hosts: Pool<Host>,
    /// Cluster pool.
    pub clusters: Pool<Cluster>,
    /// Datastore pool.
    pub datastores: Pool<Datastore>,
    /// Virtual network pool.
    pub networks: Pool<VirtualNetwork>,
    /// Image pool.
    pub images: Pool<Image>,
    /// User pool.
    pub users: Pool<User>,
    /// Group pool.
    pub groups: Pool<Group>,
    /// Quota ledger over the user/group pools.
    pub quota: QuotaManager,
    /// Authorization evaluator.
    pub auth: AuthManager,
}

impl Context {
    /// Load every pool from the store and wire up the managers.
    ///
    /// Returns the context plus the driver message receiver; the embedder
    /// connects it to a real driver process or one of the in-process
    /// backends with [`crate::auth::spawn_backend`].
    pub async fn init(
        store: Arc<dyn Store>,
        config: Config,
    ) -> Result<(Self, mpsc::Receiver<DriverMessage>)> {
        let vms = Pool::load(store.clone()).await?;
        let hosts = Pool::load(store.clone()).await?;
        let clusters = Pool::load(store.clone()).await?;
        let datastores = Pool::load(store.clone()).await?;
        let networks = Pool::load(store.clone()).await?;
        let images = Pool::load(store.clone()).await?;
        let users: Pool<User> = Pool::load(store.clone()).await?;
        let groups: Pool<Group> = Pool::load(store).await?;

        let (driver, driver_rx) = DriverClient::new(config.driver_timeout);
        let quota = QuotaManager::new(users.clone(), groups.clone());
        let auth = AuthManager::new(driver);

        Ok((
            Self {
                config,
                vms,
                hosts,
                clusters,
                datastores,
                networks,
                images,
                users,
                groups,
                quota,
                auth,
            },
            driver_rx,
        ))
    }

    /// Seed the superuser group/user and the default cluster on first
    /// start. A no-op when users already exist.
    pub async fn bootstrap(&self, admin_password: &str) -> Result<()> {
        if !self.users.ids().await.is_empty() {
            return Ok(());
        }
        info!("bootstrapping initial objects");

        let admin_gid = self.groups.allocate(Group::new("admin")).await?;
        self.groups.allocate(Group::new("users")).await?;

        let mut admin = User::new("admin", admin_gid, admin_password);
        admin.groups.insert(admin_gid);
        let admin_uid = self.users.allocate(admin).await?;

        {
            let mut group = self.groups.get(admin_gid).await?;
            group.users.insert(admin_uid);
            self.groups.update(&group).await?;
        }

        self.clusters
            .allocate(Cluster::new(
                "default",
                self.config.vnc_base_port,
                self.config.vnc_ports,
            ))
            .await?;

        Ok(())
    }

    /// Resolve a caller session against the user pool.
    pub async fn authenticate(&self, session: &str) -> Result<AuthContext> {
        self.auth.authenticate(&self.users, session).await
    }
}
