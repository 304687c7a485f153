// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence boundary for the object pools.
//!
//! The storage engine is an external collaborator; all the pools need from
//! it is atomic row get/insert/update/delete of serialized object bodies
//! keyed by (kind, oid). [`SqliteStore`] is the durable backend;
//! [`MemoryStore`] backs tests and in-process embedding.

use crate::error::{CoreError, Result};
use crate::objects::ObjectKind;
use async_trait::async_trait;
use sqlx::Row;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tokio::sync::RwLock;

/// Atomic row operations over serialized object bodies.
#[async_trait]
pub trait Store: Send + Sync {
    /// All rows of one kind, as (oid, body) pairs.
    async fn load_all(&self, kind: ObjectKind) -> Result<Vec<(i64, String)>>;

    /// Insert a new row. Fails if (kind, oid) already exists.
    async fn insert(&self, kind: ObjectKind, oid: i64, body: &str) -> Result<()>;

    /// Replace an existing row's body.
    async fn update(&self, kind: ObjectKind, oid: i64, body: &str) -> Result<()>;

    /// Delete a row.
    async fn delete(&self, kind: ObjectKind, oid: i64) -> Result<()>;
}

/// SQLite-backed store.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

impl SqliteStore {
    /// Wrap an existing pool. Callers run migrations themselves.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a store from a database file path.
    ///
    /// Creates parent directories and the database file if needed, then
    /// runs all migrations. Safe to call on an existing database.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::Database {
                operation: "create_dir".to_string(),
                details: format!("failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| CoreError::Database {
                operation: "connect".to_string(),
                details: format!("failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        MIGRATOR.run(&pool).await.map_err(|e| CoreError::Database {
            operation: "migrate".to_string(),
            details: e.to_string(),
        })?;

        Ok(Self { pool })
    }

    /// Create an in-memory SQLite store, migrated and ready.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| CoreError::Database {
                operation: "connect".to_string(),
                details: e.to_string(),
            })?;

        MIGRATOR.run(&pool).await.map_err(|e| CoreError::Database {
            operation: "migrate".to_string(),
            details: e.to_string(),
        })?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn load_all(&self, kind: ObjectKind) -> Result<Vec<(i64, String)>> {
        let rows = sqlx::query("SELECT oid, body FROM objects WHERE kind = ? ORDER BY oid")
            .bind(kind.as_str())
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| (row.get::<i64, _>("oid"), row.get::<String, _>("body")))
            .collect())
    }

    async fn insert(&self, kind: ObjectKind, oid: i64, body: &str) -> Result<()> {
        sqlx::query("INSERT INTO objects (kind, oid, body) VALUES (?, ?, ?)")
            .bind(kind.as_str())
            .bind(oid)
            .bind(body)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update(&self, kind: ObjectKind, oid: i64, body: &str) -> Result<()> {
        let result = sqlx::query("UPDATE objects SET body = ? WHERE kind = ? AND oid = ?")
            .bind(body)
            .bind(kind.as_str())
            .bind(oid)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::Database {
                operation: "update".to_string(),
                details: format!("{} [{}] has no stored row", kind, oid),
            });
        }
        Ok(())
    }

    async fn delete(&self, kind: ObjectKind, oid: i64) -> Result<()> {
        sqlx::query("DELETE FROM objects WHERE kind = ? AND oid = ?")
            .bind(kind.as_str())
            .bind(oid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// In-memory store for tests and in-process embedding.
#[derive(Default)]
pub struct MemoryStore {
    rows: RwLock<HashMap<ObjectKind, BTreeMap<i64, String>>>,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn load_all(&self, kind: ObjectKind) -> Result<Vec<(i64, String)>> {
        let rows = self.rows.read().await;
        Ok(rows
            .get(&kind)
            .map(|m| m.iter().map(|(k, v)| (*k, v.clone())).collect())
            .unwrap_or_default())
    }

    async fn insert(&self, kind: ObjectKind, oid: i64, body: &str) -> Result<()> {
        let mut rows = self.rows.write().await;
        let table = rows.entry(kind).or_default();
        if table.contains_key(&oid) {
            return Err(CoreError::Database {
                operation: "insert".to_string(),
                details: format!("{} [{}] already stored", kind, oid),
            });
        }
        table.insert(oid, body.to_string());
        Ok(())
    }

    async fn update(&self, kind: ObjectKind, oid: i64, body: &str) -> Result<()> {
        let mut rows = self.rows.write().await;
        match rows.entry(kind).or_default().get_mut(&oid) {
            Some(slot) => {
                *slot = body.to_string();
                Ok(())
            }
            None => Err(CoreError::Database {
                operation: "update".to_string(),
                details: format!("{} [{}] has no stored row", kind, oid),
            }),
        }
    }

    async fn delete(&self, kind: ObjectKind, oid: i64) -> Result<()> {
        let mut rows = self.rows.write().await;
        if let Some(table) = rows.get_mut(&kind) {
            table.remove(&oid);
        }
        Ok(())
    }
}
