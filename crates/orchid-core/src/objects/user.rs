// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! User accounts: identity, credentials and quota counters.

use super::{ObjectKind, PoolObject};
use crate::quota::QuotaCounters;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// A user account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Pool id. User 0 is the superuser.
    pub id: i64,
    /// Login name.
    pub name: String,
    /// Primary group.
    pub gid: i64,
    /// All groups, primary included. Membership of group 0 grants
    /// superuser rights.
    pub groups: BTreeSet<i64>,
    /// SHA-256 digest of the password, lowercase hex.
    pub password: String,
    /// Authentication driver; "core" verifies against `password` without
    /// leaving the process.
    pub auth_driver: String,
    /// Disabled users cannot authenticate.
    pub enabled: bool,
    /// A short-lived login token accepted in place of the password.
    #[serde(default)]
    pub login_token: Option<String>,
    /// Quota counters of this user.
    #[serde(default)]
    pub quota: QuotaCounters,
}

impl User {
    /// A new enabled "core"-driver user.
    pub fn new(name: &str, gid: i64, password: &str) -> Self {
        let mut groups = BTreeSet::new();
        groups.insert(gid);
        Self {
            id: -1,
            name: name.to_string(),
            gid,
            groups,
            password: digest(password),
            auth_driver: "core".to_string(),
            enabled: true,
            login_token: None,
            quota: QuotaCounters::default(),
        }
    }

    /// Whether `secret` matches the stored digest or the login token.
    pub fn verify_secret(&self, secret: &str) -> bool {
        if let Some(token) = &self.login_token {
            if token == secret {
                return true;
            }
        }
        digest(secret) == self.password
    }

    /// Generate and store a fresh login token, returning it.
    pub fn issue_login_token(&mut self) -> String {
        let token = uuid::Uuid::new_v4().simple().to_string();
        self.login_token = Some(token.clone());
        token
    }

    /// Whether this user holds superuser rights.
    pub fn is_superuser(&self) -> bool {
        self.id == 0 || self.groups.contains(&0)
    }
}

/// Lowercase hex SHA-256 of a secret.
pub fn digest(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

impl PoolObject for User {
    const KIND: ObjectKind = ObjectKind::User;

    fn oid(&self) -> i64 {
        self.id
    }

    fn set_oid(&mut self, oid: i64) {
        self.id = oid;
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_verification() {
        let user = User::new("alice", 1, "hunter2");
        assert!(user.verify_secret("hunter2"));
        assert!(!user.verify_secret("hunter3"));
    }

    #[test]
    fn test_login_token() {
        let mut user = User::new("bob", 1, "pw");
        let token = user.issue_login_token();
        assert!(user.verify_secret(&token));
        assert!(user.verify_secret("pw"), "password still valid");
    }

    #[test]
    fn test_superuser_by_group() {
        let mut user = User::new("ops", 1, "pw");
        user.id = 5;
        assert!(!user.is_superuser());
        user.groups.insert(0);
        assert!(user.is_superuser());
    }
}
