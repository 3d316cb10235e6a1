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

//! Stale-lock reaper.
//!
//! ## Purpose
//! Out-of-band sweep deleting lock rows older than `stale_ttl` in every
//! schema that has the lock table. It guards against leases abandoned by
//! crashed nodes that never hit the normal expiry path; it is not part of
//! the mutual-exclusion protocol.
//!
//! ## Design
//! - Only rows far older than any valid lease are touched, so sweeps are
//!   safe alongside live acquisition and renewal
//! - Idempotent: a second sweep right after the first deletes nothing
//! - A failing schema is logged and skipped; only schema enumeration itself
//!   fails the sweep
//! - Progress (percentage of schemas done) is logged at a fixed cadence,
//!   not per row

use crate::clock::{duration_millis, Clock};
use crate::config::LockConfig;
use crate::sql::{Schema, SchemaResolver, LOCK_TABLE};
use crate::{LockError, LockResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Outcome of one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Schemas enumerated
    pub schemas_total: usize,
    /// Schemas that contain the lock table
    pub schemas_with_table: usize,
    /// Rows deleted across all schemas
    pub rows_deleted: u64,
    /// Schemas whose sweep failed
    pub failed_schemas: Vec<String>,
}

impl ReapReport {
    pub fn is_clean(&self) -> bool {
        self.failed_schemas.is_empty()
    }
}

/// Batch job deleting abandoned lock rows.
pub struct StaleLockReaper {
    resolver: Arc<dyn SchemaResolver>,
    clock: Arc<dyn Clock>,
    stale_ttl: Duration,
    progress_interval: Duration,
}

impl StaleLockReaper {
    pub fn new(resolver: Arc<dyn SchemaResolver>, clock: Arc<dyn Clock>, config: &LockConfig) -> LockResult<Self> {
        config.validate()?;
        Ok(Self {
            resolver,
            clock,
            stale_ttl: config.stale_ttl,
            progress_interval: config.reaper_progress_interval,
        })
    }

    /// Sweep every schema once.
    pub async fn sweep(&self) -> LockResult<ReapReport> {
        let schemas = self.resolver.schemas().await?;
        let total = schemas.len();
        let mut report = ReapReport {
            schemas_total: total,
            ..ReapReport::default()
        };
        info!(schemas = total, stale_ttl_secs = self.stale_ttl.as_secs(), "Starting stale task lock sweep");

        let mut last_progress = Instant::now();
        for (processed, schema) in schemas.iter().enumerate() {
            match self.reap_schema(schema).await {
                Ok(Some(deleted)) => {
                    report.schemas_with_table += 1;
                    report.rows_deleted += deleted;
                    if deleted > 0 {
                        info!(schema = %schema.name, deleted, "Deleted stale task locks");
                    }
                }
                Ok(None) => {
                    debug!(schema = %schema.name, "Schema has no lock table, skipping");
                }
                Err(e) => {
                    warn!(schema = %schema.name, error = %e, "Failed to sweep schema, continuing");
                    report.failed_schemas.push(schema.name.clone());
                }
            }

            if last_progress.elapsed() >= self.progress_interval {
                let done = processed + 1;
                info!(
                    processed = done,
                    total,
                    percent = done * 100 / total.max(1),
                    "Stale task lock sweep progress"
                );
                last_progress = Instant::now();
            }
        }

        metrics::counter!("plexspaces_task_lock_reaped_total").increment(report.rows_deleted);
        if report.is_clean() {
            info!(
                schemas = total,
                with_table = report.schemas_with_table,
                deleted = report.rows_deleted,
                "Stale task lock sweep finished"
            );
        } else {
            error!(
                failed = ?report.failed_schemas,
                deleted = report.rows_deleted,
                "Stale task lock sweep finished with failures"
            );
        }
        Ok(report)
    }

    /// Delete stale rows in one schema; `None` when it has no lock table.
    async fn reap_schema(&self, schema: &Schema) -> LockResult<Option<u64>> {
        let tables: i64 = sqlx::query_scalar(
            r#"SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1"#,
        )
        .bind(LOCK_TABLE)
        .fetch_one(&schema.pool)
        .await
        .map_err(|e| LockError::BackendError(format!("inspect schema {}: {e}", schema.name)))?;
        if tables == 0 {
            return Ok(None);
        }

        let cutoff = self.clock.now_millis().saturating_sub(duration_millis(self.stale_ttl));
        let result = sqlx::query(r#"DELETE FROM cluster_task_locks WHERE timestamp < ?1"#)
            .bind(cutoff)
            .execute(&schema.pool)
            .await
            .map_err(|e| LockError::BackendError(format!("delete stale locks in {}: {e}", schema.name)))?;

        Ok(Some(result.rows_affected()))
    }

    /// Run a sweep every `period` until the returned handle is shut down.
    pub fn spawn_periodic(self: Arc<Self>, period: Duration) -> ReaperHandle {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.sweep().await {
                            error!(error = %e, "Stale task lock sweep failed");
                        }
                    }
                }
            }
        });
        ReaperHandle {
            stop_tx: Some(stop_tx),
            handle,
        }
    }
}

/// Handle of a periodic reaper.
pub struct ReaperHandle {
    stop_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl ReaperHandle {
    /// Stop after the current sweep (if any) and wait for the task to exit.
    pub async fn shutdown(mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Err(e) = self.handle.await {
            error!(error = %e, "Stale task lock reaper ended abnormally");
        }
    }
}
