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

//! # PlexSpaces Cluster Task Locks
//!
//! ## Purpose
//! Lease-based mutual exclusion for administrative tasks (schema migrations,
//! periodic cleanups, scheduled jobs) run by a cluster of equal-rank nodes.
//! At most one node executes a given task at a time; a crashed holder's lease
//! expires and another node reclaims it.
//!
//! ## Architecture Context
//! - **[`LockCoordinator`]**: runs a [`ClusterTask`] under its lock, driven by
//!   a [`RetryPolicy`]
//! - **[`LockBackend`]**: atomic lease primitives over shared storage
//!   (cluster map or SQLite)
//! - **[`heartbeat::HeartbeatRefresher`]**: renews the lease while the task runs
//! - **`reaper::StaleLockReaper`**: out-of-band deletion of abandoned rows
//!
//! ## Design Decisions
//! - **Timestamp leases**: a lock is a `(context_id, user_id, task_name) -> timestamp`
//!   record; it is valid while `now - timestamp <= lease_ttl`
//! - **Backend is the sole arbiter**: no node-local mutex participates in
//!   cross-node exclusion
//! - **No fencing tokens**: a paused holder can overlap a reclaimer; tasks must
//!   tolerate that
//!
//! ## Backend Support
//! - **Cluster map**: in-process/in-cluster map with put-if-absent and
//!   compare-and-replace (feature: `cluster-map-backend`)
//! - **SQLite**: relational lock table per schema (feature: `sqlite-backend`)
//!
//! ## Examples
//!
//! ```rust,no_run
//! use plexspaces_task_locks::{
//!     cluster_map::{ClusterMapLockBackend, InMemoryClusterMapProvider},
//!     ClusterTask, FixedAttempts, LockConfig, LockCoordinator, TaskError,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let provider = Arc::new(InMemoryClusterMapProvider::new());
//! let backend = Arc::new(ClusterMapLockBackend::new(provider, "task-locks"));
//! let coordinator = LockCoordinator::with_system_clock(backend, LockConfig::default())?;
//!
//! let task = ClusterTask::new(1, 0, "nightly-cleanup", || async {
//!     Ok::<_, TaskError>(42)
//! })?;
//! let result = coordinator.run_task(task, &mut FixedAttempts::new(3)).await?;
//! assert_eq!(result, 42);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod heartbeat;
pub mod identity;
pub mod local;
pub mod retry;

#[cfg(feature = "cluster-map-backend")]
pub mod cluster_map;

#[cfg(feature = "sqlite-backend")]
pub mod sql;

#[cfg(feature = "sqlite-backend")]
pub mod reaper;

pub use backend::LockBackend;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{create_backend_from_config, BackendConfig, BackendType, LockConfig};
pub use coordinator::{LockCoordinator, TaskLockState};
pub use error::{LockError, LockResult, TaskError};
pub use identity::{ClusterTask, LockIdentity};
pub use local::PeriodicLocalLock;
pub use retry::{FixedAttempts, RetryPolicy, RunOnce, UnlimitedBackoff, WithDeadline};
