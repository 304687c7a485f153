// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! User groups: the group-side quota subject.

use super::{ObjectKind, PoolObject};
use crate::quota::QuotaCounters;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A user group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    /// Pool id. Group 0 is the superuser group.
    pub id: i64,
    /// Display name.
    pub name: String,
    /// Member users.
    pub users: BTreeSet<i64>,
    /// Quota counters of this group.
    #[serde(default)]
    pub quota: QuotaCounters,
}

impl Group {
    /// A new empty group.
    pub fn new(name: &str) -> Self {
        Self {
            id: -1,
            name: name.to_string(),
            users: BTreeSet::new(),
            quota: QuotaCounters::default(),
        }
    }
}

impl PoolObject for Group {
    const KIND: ObjectKind = ObjectKind::Group;

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
