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

//! Configuration for cluster task locks.
//!
//! ## Environment Variables
//!
//! ### Lease timing
//! - `PLEXSPACES_TASK_LOCK_LEASE_TTL_SECS`: lease TTL (default: 30)
//! - `PLEXSPACES_TASK_LOCK_REFRESH_INTERVAL_SECS`: heartbeat period (default: 20)
//! - `PLEXSPACES_TASK_LOCK_STALE_TTL_SECS`: stale-lock reaper threshold (default: 1800)
//! - `PLEXSPACES_TASK_LOCK_REAPER_PROGRESS_SECS`: reaper progress log cadence (default: 15)
//!
//! ### Backend Selection
//! - `PLEXSPACES_TASK_LOCK_BACKEND`: backend type (default: "cluster-map")
//!   - "cluster-map" | "memory" → [`ClusterMapLockBackend`](crate::cluster_map::ClusterMapLockBackend)
//!   - "sqlite" → [`SqliteLockBackend`](crate::sql::SqliteLockBackend)
//! - `PLEXSPACES_TASK_LOCK_MAP_NAME`: cluster map name (default: "plexspaces:cluster-task-locks")
//! - `PLEXSPACES_TASK_LOCK_SQLITE_PATH`: SQLite database file (default: "task_locks.db")
//!
//! ## Invariants
//! `refresh_interval < lease_ttl` so a live holder's heartbeat lands before
//! expiry, and `stale_ttl >= 10 * lease_ttl` so the reaper never touches a
//! lease the protocol may still consider valid.

use crate::backend::LockBackend;
use crate::{LockError, LockResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Reference lease TTL.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(30);
/// Reference heartbeat period.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(20);
/// Reference reaper threshold.
pub const DEFAULT_STALE_TTL: Duration = Duration::from_secs(30 * 60);
/// Reference reaper progress cadence.
pub const DEFAULT_REAPER_PROGRESS_INTERVAL: Duration = Duration::from_secs(15);

/// Minimum ratio between `stale_ttl` and `lease_ttl`.
pub const MIN_STALE_TO_LEASE_RATIO: u32 = 10;

/// Lease timing configuration shared by every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockConfig {
    /// Age after which a lease is expired and reclaimable
    pub lease_ttl: Duration,
    /// Heartbeat period while a task runs
    pub refresh_interval: Duration,
    /// Age after which the reaper deletes a record regardless of state
    pub stale_ttl: Duration,
    /// How often the reaper logs sweep progress
    pub reaper_progress_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_ttl: DEFAULT_LEASE_TTL,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            stale_ttl: DEFAULT_STALE_TTL,
            reaper_progress_interval: DEFAULT_REAPER_PROGRESS_INTERVAL,
        }
    }
}

impl LockConfig {
    /// Create a validated configuration.
    pub fn new(lease_ttl: Duration, refresh_interval: Duration, stale_ttl: Duration) -> LockResult<Self> {
        let config = Self {
            lease_ttl,
            refresh_interval,
            stale_ttl,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Create configuration from environment variables, then validate it.
    pub fn from_env() -> LockResult<Self> {
        let defaults = Self::default();
        let config = Self {
            lease_ttl: env_secs("PLEXSPACES_TASK_LOCK_LEASE_TTL_SECS", defaults.lease_ttl)?,
            refresh_interval: env_secs(
                "PLEXSPACES_TASK_LOCK_REFRESH_INTERVAL_SECS",
                defaults.refresh_interval,
            )?,
            stale_ttl: env_secs("PLEXSPACES_TASK_LOCK_STALE_TTL_SECS", defaults.stale_ttl)?,
            reaper_progress_interval: env_secs(
                "PLEXSPACES_TASK_LOCK_REAPER_PROGRESS_SECS",
                defaults.reaper_progress_interval,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the timing invariants.
    pub fn validate(&self) -> LockResult<()> {
        if self.lease_ttl.is_zero()
            || self.refresh_interval.is_zero()
            || self.stale_ttl.is_zero()
            || self.reaper_progress_interval.is_zero()
        {
            return Err(LockError::ConfigError("durations must be non-zero".to_string()));
        }
        if self.refresh_interval >= self.lease_ttl {
            return Err(LockError::ConfigError(format!(
                "refresh_interval ({:?}) must be less than lease_ttl ({:?})",
                self.refresh_interval, self.lease_ttl
            )));
        }
        let min_stale_ttl = self.lease_ttl.checked_mul(MIN_STALE_TO_LEASE_RATIO).ok_or_else(|| {
            LockError::ConfigError(format!("lease_ttl ({:?}) is too large", self.lease_ttl))
        })?;
        if self.stale_ttl < min_stale_ttl {
            return Err(LockError::ConfigError(format!(
                "stale_ttl ({:?}) must be at least {}x lease_ttl ({:?})",
                self.stale_ttl, MIN_STALE_TO_LEASE_RATIO, self.lease_ttl
            )));
        }
        Ok(())
    }
}

fn env_secs(name: &str, default: Duration) -> LockResult<Duration> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|e| LockError::ConfigError(format!("{name}={raw}: {e}"))),
        Err(_) => Ok(default),
    }
}

/// Backend type configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendType {
    /// Cluster-wide map (default)
    ClusterMap {
        /// Name of the shared map
        map_name: String,
    },
    /// SQLite backend (requires sqlite-backend feature)
    Sqlite {
        /// Path to SQLite database file
        path: String,
    },
}

impl Default for BackendType {
    fn default() -> Self {
        Self::ClusterMap {
            map_name: DEFAULT_MAP_NAME.to_string(),
        }
    }
}

/// Default cluster map name.
pub const DEFAULT_MAP_NAME: &str = "plexspaces:cluster-task-locks";

/// Backend selection plus lease timing.
#[derive(Debug, Clone, Default)]
pub struct BackendConfig {
    pub backend: BackendType,
    pub lock: LockConfig,
}

impl BackendConfig {
    /// Create configuration with explicit backend and default timing.
    pub fn new(backend: BackendType) -> Self {
        Self {
            backend,
            lock: LockConfig::default(),
        }
    }

    /// Create configuration from environment variables.
    pub fn from_env() -> LockResult<Self> {
        let backend_str = std::env::var("PLEXSPACES_TASK_LOCK_BACKEND")
            .unwrap_or_else(|_| "cluster-map".to_string())
            .to_lowercase();

        let backend = match backend_str.as_str() {
            "cluster-map" | "memory" => BackendType::ClusterMap {
                map_name: std::env::var("PLEXSPACES_TASK_LOCK_MAP_NAME")
                    .unwrap_or_else(|_| DEFAULT_MAP_NAME.to_string()),
            },
            "sqlite" => BackendType::Sqlite {
                path: std::env::var("PLEXSPACES_TASK_LOCK_SQLITE_PATH")
                    .unwrap_or_else(|_| "task_locks.db".to_string()),
            },
            other => {
                return Err(LockError::ConfigError(format!(
                    "Unknown backend type: {}. Valid options: cluster-map, sqlite",
                    other
                )));
            }
        };

        Ok(Self {
            backend,
            lock: LockConfig::from_env()?,
        })
    }
}

/// Create a lock backend from explicit configuration.
///
/// The cluster-map variant is wired to a process-local
/// [`InMemoryClusterMapProvider`](crate::cluster_map::InMemoryClusterMapProvider);
/// clustered deployments pass their own provider to
/// [`ClusterMapLockBackend::new`](crate::cluster_map::ClusterMapLockBackend::new).
pub async fn create_backend_from_config(config: &BackendConfig) -> LockResult<Arc<dyn LockBackend>> {
    config.lock.validate()?;
    match &config.backend {
        #[cfg(feature = "cluster-map-backend")]
        BackendType::ClusterMap { map_name } => {
            use crate::cluster_map::{ClusterMapLockBackend, InMemoryClusterMapProvider};
            let provider = Arc::new(InMemoryClusterMapProvider::new());
            Ok(Arc::new(ClusterMapLockBackend::new(provider, map_name.clone())))
        }

        #[cfg(not(feature = "cluster-map-backend"))]
        BackendType::ClusterMap { .. } => Err(LockError::ConfigError(
            "Cluster map backend requires 'cluster-map-backend' feature".to_string(),
        )),

        #[cfg(feature = "sqlite-backend")]
        BackendType::Sqlite { path } => {
            use crate::sql::{open_sqlite_pool, SqliteLockBackend, StaticSchemaResolver};
            let pool = open_sqlite_pool(path).await?;
            SqliteLockBackend::ensure_schema(&pool).await?;
            let resolver = StaticSchemaResolver::new().with_default_schema("main", pool);
            Ok(Arc::new(SqliteLockBackend::new(Arc::new(resolver))))
        }

        #[cfg(not(feature = "sqlite-backend"))]
        BackendType::Sqlite { .. } => Err(LockError::ConfigError(
            "SQLite backend requires 'sqlite-backend' feature".to_string(),
        )),
    }
}
