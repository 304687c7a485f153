// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Typed, lock-aware access to stored objects.
//!
//! Each pool keeps an explicit lock table keyed by object id. An exclusive
//! [`get`](Pool::get) hands out an [`ObjectGuard`]: the per-object lock is
//! held until the guard goes out of scope, serializing conflicting
//! operations on the same object while leaving unrelated objects
//! untouched. A shared [`get_ro`](Pool::get_ro) returns a plain snapshot
//! copy of the last committed state - never a handle into the live entry -
//! and is not a valid basis for a later mutation.
//!
//! Mutations happen on the guard's private copy and become visible (and
//! durable) only through [`update`](Pool::update).

use crate::error::{CoreError, Result};
use crate::objects::PoolObject;
use crate::store::Store;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

struct Entry<T> {
    lock: Arc<Mutex<()>>,
    committed: Arc<RwLock<T>>,
}

impl<T> Clone for Entry<T> {
    fn clone(&self) -> Self {
        Self {
            lock: self.lock.clone(),
            committed: self.committed.clone(),
        }
    }
}

/// An exclusive handle on one object.
///
/// Holds the object's lock for its whole lifetime and a private working
/// copy of the object. Dropping the guard releases the lock on every exit
/// path; uncommitted changes are discarded.
pub struct ObjectGuard<T: PoolObject> {
    _token: OwnedMutexGuard<()>,
    committed: Arc<RwLock<T>>,
    obj: T,
}

impl<T: PoolObject> Deref for ObjectGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.obj
    }
}

impl<T: PoolObject> DerefMut for ObjectGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.obj
    }
}

/// A typed object pool backed by the store.
pub struct Pool<T: PoolObject> {
    store: Arc<dyn Store>,
    entries: Arc<RwLock<HashMap<i64, Entry<T>>>>,
    next_id: Arc<AtomicI64>,
}

impl<T: PoolObject> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            entries: self.entries.clone(),
            next_id: self.next_id.clone(),
        }
    }
}

impl<T: PoolObject> Pool<T> {
    /// Load every stored object of this kind into the pool.
    pub async fn load(store: Arc<dyn Store>) -> Result<Self> {
        let rows = store.load_all(T::KIND).await?;
        let mut entries = HashMap::with_capacity(rows.len());
        let mut max_oid = -1;

        for (oid, body) in rows {
            let obj: T = serde_json::from_str(&body)?;
            max_oid = max_oid.max(oid);
            entries.insert(
                oid,
                Entry {
                    lock: Arc::new(Mutex::new(())),
                    committed: Arc::new(RwLock::new(obj)),
                },
            );
        }

        Ok(Self {
            store,
            entries: Arc::new(RwLock::new(entries)),
            next_id: Arc::new(AtomicI64::new(max_oid + 1)),
        })
    }

    async fn entry(&self, oid: i64) -> Result<Entry<T>> {
        self.entries
            .read()
            .await
            .get(&oid)
            .cloned()
            .ok_or(CoreError::NoExists { kind: T::KIND, oid })
    }

    /// Exclusive fetch: acquires the object's lock and returns a guard
    /// with a working copy. Blocks while another guard on the same object
    /// is alive.
    pub async fn get(&self, oid: i64) -> Result<ObjectGuard<T>> {
        let entry = self.entry(oid).await?;
        let token = entry.lock.clone().lock_owned().await;
        let obj = entry.committed.read().await.clone();
        Ok(ObjectGuard {
            _token: token,
            committed: entry.committed,
            obj,
        })
    }

    /// Shared fetch: a snapshot copy of the last committed state. Does not
    /// take the object lock.
    pub async fn get_ro(&self, oid: i64) -> Result<T> {
        let entry = self.entry(oid).await?;
        let obj = entry.committed.read().await.clone();
        Ok(obj)
    }

    /// Whether an object with this id exists.
    pub async fn exists(&self, oid: i64) -> bool {
        self.entries.read().await.contains_key(&oid)
    }

    /// Persist the guard's working copy and publish it as the committed
    /// state.
    pub async fn update(&self, guard: &ObjectGuard<T>) -> Result<()> {
        let body = serde_json::to_string(&guard.obj)?;
        self.store.update(T::KIND, guard.obj.oid(), &body).await?;
        *guard.committed.write().await = guard.obj.clone();
        Ok(())
    }

    /// Allocate a new object: assigns the next id, inserts the stored row
    /// and registers the pool entry. Returns the new id.
    pub async fn allocate(&self, mut obj: T) -> Result<i64> {
        let oid = self.next_id.fetch_add(1, Ordering::SeqCst);
        obj.set_oid(oid);
        let body = serde_json::to_string(&obj)?;

        self.store
            .insert(T::KIND, oid, &body)
            .await
            .map_err(|e| CoreError::Allocate {
                kind: T::KIND,
                reason: e.to_string(),
            })?;

        self.entries.write().await.insert(
            oid,
            Entry {
                lock: Arc::new(Mutex::new(())),
                committed: Arc::new(RwLock::new(obj)),
            },
        );
        Ok(oid)
    }

    /// Drop an object from the pool and the store. Requires the exclusive
    /// guard, which is consumed.
    pub async fn remove(&self, guard: ObjectGuard<T>) -> Result<()> {
        let oid = guard.obj.oid();
        self.store.delete(T::KIND, oid).await?;
        self.entries.write().await.remove(&oid);
        Ok(())
    }

    /// Find an object id by display name.
    pub async fn find_by_name(&self, name: &str) -> Option<i64> {
        let entries = self.entries.read().await;
        for (oid, entry) in entries.iter() {
            if entry.committed.read().await.name() == name {
                return Some(*oid);
            }
        }
        None
    }

    /// All object ids, ascending.
    pub async fn ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.entries.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
