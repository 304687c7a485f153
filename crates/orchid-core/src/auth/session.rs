// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Session resolution.
//!
//! Sessions are `username:secret` strings. "core"-driver users verify the
//! secret against the stored digest without leaving the process; any other
//! driver round-trips through the driver boundary.

use super::{AuthManager, DriverCommand};
use crate::error::{CoreError, Result};
use crate::objects::User;
use crate::pool::Pool;
use tracing::debug;

/// The resolved identity of a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    /// Acting uid.
    pub uid: i64,
    /// Acting primary group.
    pub gid: i64,
    /// All acting group ids.
    pub gids: Vec<i64>,
    /// Login name.
    pub uname: String,
}

impl AuthContext {
    /// Whether the caller holds superuser rights.
    pub fn is_superuser(&self) -> bool {
        self.uid == 0 || self.gids.contains(&0)
    }
}

impl AuthManager {
    /// Resolve a `username:secret` session against the user pool.
    pub async fn authenticate(&self, users: &Pool<User>, session: &str) -> Result<AuthContext> {
        let (name, secret) = session
            .split_once(':')
            .ok_or_else(|| CoreError::authentication("malformed session string"))?;

        let uid = users
            .find_by_name(name)
            .await
            .ok_or_else(|| CoreError::authentication(format!("unknown user '{}'", name)))?;
        let user = users.get_ro(uid).await?;

        if !user.enabled {
            return Err(CoreError::authentication(format!(
                "user '{}' is disabled",
                name
            )));
        }

        let verified = if user.auth_driver == "core" {
            user.verify_secret(secret)
        } else {
            debug!(driver = %user.auth_driver, uname = %name, "authenticating via driver");
            self.driver()
                .call(DriverCommand::Authenticate {
                    uid,
                    driver: user.auth_driver.clone(),
                    username: name.to_string(),
                    secret: secret.to_string(),
                })
                .await
                .map(|reply| reply.success)
                .unwrap_or(false)
        };

        if !verified {
            return Err(CoreError::authentication(format!(
                "invalid credentials for user '{}'",
                name
            )));
        }

        Ok(AuthContext {
            uid,
            gid: user.gid,
            gids: user.groups.iter().copied().collect(),
            uname: user.name.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{DriverClient, PermissiveBackend, RestrictiveBackend, spawn_backend};
    use crate::store::MemoryStore;
    use std::sync::Arc;
    use std::time::Duration;

    async fn users_with(alice_driver: &str) -> Pool<User> {
        let pool: Pool<User> = Pool::load(Arc::new(MemoryStore::new())).await.unwrap();
        // Uid 0 is the superuser; keep alice an ordinary user.
        pool.allocate(User::new("root", 0, "rootpw")).await.unwrap();
        let mut alice = User::new("alice", 1, "secret");
        alice.auth_driver = alice_driver.to_string();
        pool.allocate(alice).await.unwrap();
        pool
    }

    fn auth(restrictive: bool) -> AuthManager {
        let (client, rx) = DriverClient::new(Duration::from_secs(5));
        if restrictive {
            let _ = spawn_backend(client.clone(), rx, Arc::new(RestrictiveBackend));
        } else {
            let _ = spawn_backend(client.clone(), rx, Arc::new(PermissiveBackend));
        }
        AuthManager::new(client)
    }

    #[tokio::test]
    async fn test_core_driver_session() {
        let users = users_with("core").await;
        let auth = auth(true);

        let ctx = auth.authenticate(&users, "alice:secret").await.unwrap();
        assert_eq!(ctx.uname, "alice");
        assert_eq!(ctx.gid, 1);
        assert!(!ctx.is_superuser());

        let err = auth.authenticate(&users, "alice:wrong").await.unwrap_err();
        assert!(matches!(err, CoreError::Authentication { .. }));
    }

    #[tokio::test]
    async fn test_malformed_and_unknown() {
        let users = users_with("core").await;
        let auth = auth(false);
        assert!(auth.authenticate(&users, "no-colon").await.is_err());
        assert!(auth.authenticate(&users, "bob:pw").await.is_err());
    }

    #[tokio::test]
    async fn test_disabled_user() {
        let users = users_with("core").await;
        let auth = auth(false);
        {
            let mut guard = users.get(1).await.unwrap();
            guard.enabled = false;
            users.update(&guard).await.unwrap();
        }
        let err = auth.authenticate(&users, "alice:secret").await.unwrap_err();
        assert!(err.to_string().contains("disabled"));
    }

    #[tokio::test]
    async fn test_external_driver_session() {
        let users = users_with("ldap").await;
        // Permissive backend verifies any non-empty secret.
        let ctx = auth(false)
            .authenticate(&users, "alice:whatever")
            .await
            .unwrap();
        assert_eq!(ctx.uid, 1);
        // Restrictive backend denies.
        assert!(
            auth(true)
                .authenticate(&users, "alice:whatever")
                .await
                .is_err()
        );
    }
}
