// SPDX-License-Identifier: LGPL-2.1-or-later
// Copyright (C) 2025 Shahzad A. Bhatti <bhatti@plexobject.com>
//
// This file is part of PlexSpaces.
//
// PlexSpaces is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published by
// the Free Software Foundation, either version 2.1 of the License, or
// (at your option) any later version.
//
// PlexSpaces is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License
// along with PlexSpaces. If not, see <https://www.gnu.org/licenses/>.

//! Cluster-map lock backend.
//!
//! ## Purpose
//! Coordinates cluster tasks through a key/value map shared by every node
//! (the cluster-wide in-memory grid). The map provides the atomicity:
//! `put_if_absent` for acquisition, `replace(key, old, new)` for
//! reclaiming expired leases, `remove` for release.
//!
//! ## Availability
//! If the map provider cannot hand out the map, or the map reports that the
//! node lost cluster membership, the backend unregisters itself: every later
//! call fails with [`LockError::Unavailable`] until the backend is recreated.
//! It never falls back to node-local locking, which would silently break
//! mutual exclusion for the rest of the cluster.

use crate::backend::LockBackend;
use crate::{LockError, LockIdentity, LockResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::RwLock;
use tracing::{error, instrument};

/// Distributed map of lock keys to lease timestamps.
///
/// Every operation must be atomic cluster-wide for a given key.
#[async_trait]
pub trait ClusterMap: Send + Sync {
    /// Insert if absent; returns the existing value when present.
    async fn put_if_absent(&self, key: &str, value: i64) -> LockResult<Option<i64>>;

    async fn get(&self, key: &str) -> LockResult<Option<i64>>;

    /// Replace only if the current value equals `expected`.
    async fn replace(&self, key: &str, expected: i64, new: i64) -> LockResult<bool>;

    async fn put(&self, key: &str, value: i64) -> LockResult<()>;

    /// Remove and return the previous value.
    async fn remove(&self, key: &str) -> LockResult<Option<i64>>;
}

/// Lookup for cluster maps; `None` means the coordination service is down.
pub trait ClusterMapProvider: Send + Sync {
    fn map(&self, name: &str) -> Option<Arc<dyn ClusterMap>>;
}

/// HashMap-backed [`ClusterMap`].
///
/// Shared between simulated nodes by cloning the `Arc`; `set_available(false)`
/// simulates loss of cluster membership.
#[derive(Debug)]
pub struct InMemoryClusterMap {
    entries: RwLock<HashMap<String, i64>>,
    available: AtomicBool,
}

impl InMemoryClusterMap {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of lock records currently stored.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    fn check_available(&self) -> LockResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LockError::Unavailable("cluster map membership lost".to_string()))
        }
    }
}

impl Default for InMemoryClusterMap {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterMap for InMemoryClusterMap {
    async fn put_if_absent(&self, key: &str, value: i64) -> LockResult<Option<i64>> {
        self.check_available()?;
        let mut entries = self.entries.write().await;
        if let Some(existing) = entries.get(key) {
            return Ok(Some(*existing));
        }
        entries.insert(key.to_string(), value);
        Ok(None)
    }

    async fn get(&self, key: &str) -> LockResult<Option<i64>> {
        self.check_available()?;
        Ok(self.entries.read().await.get(key).copied())
    }

    async fn replace(&self, key: &str, expected: i64, new: i64) -> LockResult<bool> {
        self.check_available()?;
        let mut entries = self.entries.write().await;
        match entries.get_mut(key) {
            Some(current) if *current == expected => {
                *current = new;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn put(&self, key: &str, value: i64) -> LockResult<()> {
        self.check_available()?;
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> LockResult<Option<i64>> {
        self.check_available()?;
        Ok(self.entries.write().await.remove(key))
    }
}

/// Provider handing out named [`InMemoryClusterMap`]s.
#[derive(Debug)]
pub struct InMemoryClusterMapProvider {
    maps: Mutex<HashMap<String, Arc<InMemoryClusterMap>>>,
    running: AtomicBool,
}

impl InMemoryClusterMapProvider {
    pub fn new() -> Self {
        Self {
            maps: Mutex::new(HashMap::new()),
            running: AtomicBool::new(true),
        }
    }

    /// Concrete handle to a named map (created on first use).
    pub fn in_memory_map(&self, name: &str) -> Arc<InMemoryClusterMap> {
        let mut maps = self.maps.lock().unwrap_or_else(PoisonError::into_inner);
        maps.entry(name.to_string()).or_default().clone()
    }

    /// Simulate the coordination service going down or coming back.
    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }
}

impl Default for InMemoryClusterMapProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ClusterMapProvider for InMemoryClusterMapProvider {
    fn map(&self, name: &str) -> Option<Arc<dyn ClusterMap>> {
        if !self.running.load(Ordering::SeqCst) {
            return None;
        }
        Some(self.in_memory_map(name))
    }
}

/// [`LockBackend`] over a [`ClusterMap`].
pub struct ClusterMapLockBackend {
    provider: Arc<dyn ClusterMapProvider>,
    map_name: String,
    unregistered: AtomicBool,
}

impl ClusterMapLockBackend {
    pub fn new(provider: Arc<dyn ClusterMapProvider>, map_name: impl Into<String>) -> Self {
        Self {
            provider,
            map_name: map_name.into(),
            unregistered: AtomicBool::new(false),
        }
    }

    /// False once the backend has given up on the cluster map.
    pub fn is_registered(&self) -> bool {
        !self.unregistered.load(Ordering::SeqCst)
    }

    fn unregister(&self, reason: &str) {
        if !self.unregistered.swap(true, Ordering::SeqCst) {
            error!(
                map = %self.map_name,
                reason,
                "Cluster map unavailable, unregistering task lock backend"
            );
            metrics::counter!("plexspaces_task_lock_cluster_map_unregistered_total",
                "map" => self.map_name.clone()
            )
            .increment(1);
        }
    }

    fn map(&self) -> LockResult<Arc<dyn ClusterMap>> {
        if !self.is_registered() {
            return Err(LockError::Unavailable(format!(
                "cluster map {} unregistered after an earlier outage",
                self.map_name
            )));
        }
        match self.provider.map(&self.map_name) {
            Some(map) => Ok(map),
            None => {
                self.unregister("provider returned no map");
                Err(LockError::Unavailable(format!(
                    "coordination service down: cluster map {} not available",
                    self.map_name
                )))
            }
        }
    }

    /// Unregister on `Unavailable` and pass the result through.
    fn observe<T>(&self, result: LockResult<T>) -> LockResult<T> {
        if let Err(LockError::Unavailable(reason)) = &result {
            self.unregister(reason);
        }
        result
    }
}

#[async_trait]
impl LockBackend for ClusterMapLockBackend {
    fn name(&self) -> &'static str {
        "cluster-map"
    }

    #[instrument(skip(self), fields(lock = %identity))]
    async fn try_acquire(&self, identity: &LockIdentity, now: i64) -> LockResult<bool> {
        let map = self.map()?;
        let previous = self.observe(map.put_if_absent(&identity.map_key(), now).await)?;
        Ok(previous.is_none())
    }

    #[instrument(skip(self), fields(lock = %identity))]
    async fn read_timestamp(&self, identity: &LockIdentity) -> LockResult<Option<i64>> {
        let map = self.map()?;
        self.observe(map.get(&identity.map_key()).await)
    }

    #[instrument(skip(self), fields(lock = %identity))]
    async fn try_renew(&self, identity: &LockIdentity, expected: i64, new: i64) -> LockResult<bool> {
        let map = self.map()?;
        self.observe(map.replace(&identity.map_key(), expected, new).await)
    }

    /// Unconditional `put`: recreates a missing record, so never `Ok(false)`.
    #[instrument(skip(self), fields(lock = %identity))]
    async fn refresh(&self, identity: &LockIdentity, now: i64) -> LockResult<bool> {
        let map = self.map()?;
        self.observe(map.put(&identity.map_key(), now).await)?;
        Ok(true)
    }

    #[instrument(skip(self), fields(lock = %identity))]
    async fn release(&self, identity: &LockIdentity) -> LockResult<()> {
        let map = self.map()?;
        self.observe(map.remove(&identity.map_key()).await)?;
        Ok(())
    }
}
