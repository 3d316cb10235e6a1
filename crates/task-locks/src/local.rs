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

//! Node-local periodic lock.
//!
//! Rate-limits an action to at most one run per `period` on this node.
//! It provides no cross-node guarantee; use
//! [`LockCoordinator`](crate::coordinator::LockCoordinator) for that.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Default)]
struct Slot {
    running: tokio::sync::Mutex<()>,
    last_started: Mutex<Option<Instant>>,
}

/// Per-key local guard: one concurrent run per key, and no run sooner than
/// `period` after the previous one started.
#[derive(Debug, Default)]
pub struct PeriodicLocalLock {
    slots: Mutex<HashMap<String, Arc<Slot>>>,
}

impl PeriodicLocalLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &str) -> Arc<Slot> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.entry(key.to_string()).or_default().clone()
    }

    /// Run `f` unless `key` is already running here or last started less
    /// than `period` ago. Returns `None` when skipped.
    pub async fn try_run<F, Fut, T>(&self, key: &str, period: Duration, f: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let slot = self.slot(key);
        let Ok(_running) = slot.running.try_lock() else {
            debug!(key, "Periodic action already running on this node, skipping");
            return None;
        };

        {
            let mut last_started = slot.last_started.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(started) = *last_started {
                if started.elapsed() < period {
                    debug!(key, "Periodic action ran recently, skipping");
                    return None;
                }
            }
            *last_started = Some(Instant::now());
        }

        Some(f().await)
    }
}
