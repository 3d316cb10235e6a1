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

//! Error types for cluster task lock operations.

use thiserror::Error;

/// Result type for lock operations.
pub type LockResult<T> = Result<T, LockError>;

/// Boxed error produced by a cluster task's own work.
pub type TaskError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur while coordinating a cluster task.
#[derive(Error, Debug)]
pub enum LockError {
    /// Another node currently holds a valid lease
    #[error("Lock busy: {0}")]
    Busy(String),

    /// The retry loop was interrupted while waiting for the next attempt
    #[error("Interrupted while waiting for lock of task {task_name}")]
    Interrupted { task_name: String },

    /// The coordination backend itself cannot be reached
    #[error("Coordination service unavailable: {0}")]
    Unavailable(String),

    /// The retry policy disallowed further attempts
    #[error("Unable to acquire lock for task {task_name} after {attempts} attempt(s)")]
    Exhausted { task_name: String, attempts: u32 },

    /// Backend error (SQL, cluster map, etc.)
    #[error("Backend error: {0}")]
    BackendError(String),

    /// The task ran while holding the lock and failed
    #[error("Task {task_name} failed: {source}")]
    TaskFailed {
        task_name: String,
        #[source]
        source: TaskError,
    },

    /// Invalid lock identity
    #[error("Invalid lock identity: {0}")]
    InvalidIdentity(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl LockError {
    /// True for failures another attempt may cure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LockError::Busy(_) | LockError::Unavailable(_) | LockError::BackendError(_)
        )
    }

    /// True when the lock could not be obtained ("try later"), as opposed to
    /// a broken backend or a failed task.
    pub fn is_lock_unavailable(&self) -> bool {
        matches!(self, LockError::Busy(_) | LockError::Exhausted { .. })
    }
}

#[cfg(feature = "sqlite-backend")]
impl From<sqlx::Error> for LockError {
    fn from(err: sqlx::Error) -> Self {
        LockError::BackendError(format!("SQL error: {}", err))
    }
}
