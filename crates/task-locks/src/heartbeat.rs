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

//! Heartbeat refresher for held leases.
//!
//! ## Purpose
//! Extends the lease of a held lock every `refresh_interval` while the
//! protected task runs.
//!
//! ## Design
//! - One spawned tokio task per held lock, driven by `tokio::time::interval`
//! - Renewal failures are logged and counted, never propagated to the task
//! - `stop()` signals the loop and waits for it to exit, so once it returns
//!   no renewal is in flight (a release issued afterwards cannot be undone
//!   by a late heartbeat)
//! - Dropping an unstopped refresher aborts its task

use crate::backend::LockBackend;
use crate::clock::{duration_millis, Clock};
use crate::LockIdentity;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, warn};

/// Counters for one refresher.
#[derive(Debug, Default)]
pub struct HeartbeatStats {
    renewals: AtomicU64,
    failures: AtomicU64,
    consecutive_failures: AtomicU64,
    last_renewed_at: AtomicI64,
}

impl HeartbeatStats {
    pub fn renewals(&self) -> u64 {
        self.renewals.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Timestamp written by the last successful renewal (or the acquisition).
    pub fn last_renewed_at(&self) -> i64 {
        self.last_renewed_at.load(Ordering::SeqCst)
    }
}

/// Periodic, cancellable lease renewal for one [`LockIdentity`].
pub struct HeartbeatRefresher {
    identity: LockIdentity,
    stats: Arc<HeartbeatStats>,
    stop_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl HeartbeatRefresher {
    /// Start renewing `identity`, first renewal one `refresh_interval` from now.
    ///
    /// `acquired_at` is the timestamp written at acquisition; `lease_ttl` is
    /// used to flag when consecutive failures have let the lease lapse.
    pub fn start(
        backend: Arc<dyn LockBackend>,
        clock: Arc<dyn Clock>,
        identity: LockIdentity,
        refresh_interval: Duration,
        lease_ttl: Duration,
        acquired_at: i64,
    ) -> Self {
        let stats = Arc::new(HeartbeatStats::default());
        stats.last_renewed_at.store(acquired_at, Ordering::SeqCst);

        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let task_identity = identity.clone();
        let task_stats = stats.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + refresh_interval, refresh_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        renew_once(backend.as_ref(), clock.as_ref(), &task_identity, &task_stats, lease_ttl).await;
                    }
                }
            }
            debug!(lock = %task_identity, "Heartbeat stopped");
        });

        Self {
            identity,
            stats,
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        }
    }

    pub fn identity(&self) -> &LockIdentity {
        &self.identity
    }

    pub fn stats(&self) -> Arc<HeartbeatStats> {
        self.stats.clone()
    }

    /// Stop renewing and wait until the loop has exited.
    pub async fn stop(mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                error!(lock = %self.identity, error = %e, "Heartbeat task ended abnormally");
            }
        }
    }
}

impl Drop for HeartbeatRefresher {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn renew_once(
    backend: &dyn LockBackend,
    clock: &dyn Clock,
    identity: &LockIdentity,
    stats: &HeartbeatStats,
    lease_ttl: Duration,
) {
    let now = clock.now_millis();
    match backend.refresh(identity, now).await {
        Ok(true) => {
            stats.renewals.fetch_add(1, Ordering::SeqCst);
            stats.consecutive_failures.store(0, Ordering::SeqCst);
            stats.last_renewed_at.store(now, Ordering::SeqCst);
            metrics::counter!("plexspaces_task_lock_heartbeats_total",
                "backend" => backend.name(),
                "result" => "ok"
            )
            .increment(1);
            debug!(lock = %identity, "Lease renewed");
        }
        Ok(false) => {
            record_failure(backend, stats);
            warn!(lock = %identity, "Heartbeat found no lease record, lock was released or reaped");
        }
        Err(e) => {
            record_failure(backend, stats);
            warn!(
                lock = %identity,
                error = %e,
                consecutive_failures = stats.consecutive_failures(),
                "Failed to renew lease"
            );
        }
    }

    let since_renewal = now.saturating_sub(stats.last_renewed_at());
    if since_renewal > duration_millis(lease_ttl) {
        error!(
            lock = %identity,
            since_renewal_ms = since_renewal,
            "Lease likely expired under a live holder, another node may reclaim it"
        );
    }
}

fn record_failure(backend: &dyn LockBackend, stats: &HeartbeatStats) {
    stats.failures.fetch_add(1, Ordering::SeqCst);
    stats.consecutive_failures.fetch_add(1, Ordering::SeqCst);
    metrics::counter!("plexspaces_task_lock_heartbeats_total",
        "backend" => backend.name(),
        "result" => "failed"
    )
    .increment(1);
}
