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

//! Lock backend trait: the atomic primitives over lock records.

use crate::clock::duration_millis;
use crate::{LockError, LockIdentity, LockResult};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

/// Trait for storage of lease records keyed by [`LockIdentity`].
///
/// ## Purpose
/// Provides the atomic primitives the coordinator builds mutual exclusion on.
/// A record holds a single timestamp (epoch millis of the last acquisition or
/// renewal); absence of a record means the lock is free.
///
/// ## Design
/// - **try_acquire**: insert-if-absent, `true` only when this call created the record
/// - **try_renew**: compare-and-swap on the timestamp, used to reclaim expired leases
/// - **refresh**: unconditional timestamp bump by the current holder (heartbeat)
/// - **release**: unconditional, idempotent delete
///
/// Implementations must make `try_acquire` and `try_renew` atomic with respect
/// to concurrent callers on every node, and must never read-modify-write a
/// record outside these calls.
#[async_trait]
pub trait LockBackend: Send + Sync {
    /// Short backend name for logs and metrics.
    fn name(&self) -> &'static str;

    /// Create the record for `identity` with timestamp `now` if none exists.
    ///
    /// ## Returns
    /// - `Ok(true)`: this call created the record
    /// - `Ok(false)`: a record already existed and was left untouched
    async fn try_acquire(&self, identity: &LockIdentity, now: i64) -> LockResult<bool>;

    /// Read the current timestamp, `None` when the lock is free.
    async fn read_timestamp(&self, identity: &LockIdentity) -> LockResult<Option<i64>>;

    /// Replace the timestamp with `new` only if it still equals `expected`.
    async fn try_renew(&self, identity: &LockIdentity, expected: i64, new: i64) -> LockResult<bool>;

    /// Unconditionally set the timestamp to `now` (heartbeat).
    ///
    /// ## Returns
    /// - `Ok(true)`: the timestamp was written
    /// - `Ok(false)`: the record no longer exists (released or reaped); only
    ///   backends that update in place report this. The cluster-map backend
    ///   puts the record back and never returns `Ok(false)`.
    async fn refresh(&self, identity: &LockIdentity, now: i64) -> LockResult<bool>;

    /// Delete the record. Releasing a free lock is not an error.
    async fn release(&self, identity: &LockIdentity) -> LockResult<()>;

    /// One bounded acquisition attempt.
    ///
    /// ## Behavior
    /// - No record: create it
    /// - Record older than `lease_ttl`: reclaim via compare-and-swap on the
    ///   timestamp just read, so two nodes racing on the same expired lease
    ///   cannot both win
    /// - Otherwise: `LockError::Busy`
    async fn acquire_lease(
        &self,
        identity: &LockIdentity,
        now: i64,
        lease_ttl: Duration,
    ) -> LockResult<()> {
        if self.try_acquire(identity, now).await? {
            return Ok(());
        }

        let timestamp = match self.read_timestamp(identity).await? {
            Some(ts) => ts,
            None => {
                // Released between the insert and the read.
                if self.try_acquire(identity, now).await? {
                    return Ok(());
                }
                return Err(LockError::Busy(format!("{identity} acquired concurrently")));
            }
        };

        let age = now.saturating_sub(timestamp);
        if age > duration_millis(lease_ttl) {
            if self.try_renew(identity, timestamp, now).await? {
                info!(
                    backend = self.name(),
                    lock = %identity,
                    age_ms = age,
                    "Reclaimed expired lease"
                );
                return Ok(());
            }
            return Err(LockError::Busy(format!("{identity} reclaimed concurrently")));
        }

        debug!(backend = self.name(), lock = %identity, age_ms = age, "Lease held by another node");
        Err(LockError::Busy(format!("{identity} held, lease age {age}ms")))
    }
}
