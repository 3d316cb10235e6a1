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

//! Lock identity and the cluster task contract.

use crate::{LockError, LockResult, TaskError};
use std::fmt;
use std::future::Future;

/// Longest task name accepted (matches the relational column width).
pub const MAX_TASK_NAME_LEN: usize = 128;

/// Coordination point: `(context_id, user_id, task_name)`.
///
/// Equality and hashing are structural; two identities with the same triple
/// contend for the same lock on every node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LockIdentity {
    context_id: i32,
    user_id: i32,
    task_name: String,
}

impl LockIdentity {
    /// Create an identity, rejecting empty or oversized task names.
    pub fn new(context_id: i32, user_id: i32, task_name: impl Into<String>) -> LockResult<Self> {
        let task_name = task_name.into();
        if task_name.trim().is_empty() {
            return Err(LockError::InvalidIdentity("task name must not be empty".to_string()));
        }
        if task_name.len() > MAX_TASK_NAME_LEN {
            return Err(LockError::InvalidIdentity(format!(
                "task name exceeds {} bytes: {}",
                MAX_TASK_NAME_LEN, task_name
            )));
        }
        Ok(Self {
            context_id,
            user_id,
            task_name,
        })
    }

    pub fn context_id(&self) -> i32 {
        self.context_id
    }

    pub fn user_id(&self) -> i32 {
        self.user_id
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    /// Key used by map-based backends.
    pub fn map_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for LockIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.context_id, self.user_id, self.task_name)
    }
}

/// Unit of work executed while holding the lock for its identity.
///
/// The work is opaque to the coordinator: a zero-argument callable producing
/// a future that resolves to the task result or the task's own error.
pub struct ClusterTask<F> {
    identity: LockIdentity,
    work: F,
}

impl<F, Fut, T> ClusterTask<F>
where
    F: FnOnce() -> Fut + Send,
    Fut: Future<Output = Result<T, TaskError>> + Send,
{
    /// Build a task for `(context_id, user_id, task_name)`.
    pub fn new(
        context_id: i32,
        user_id: i32,
        task_name: impl Into<String>,
        work: F,
    ) -> LockResult<Self> {
        Ok(Self::from_parts(LockIdentity::new(context_id, user_id, task_name)?, work))
    }

    /// Build a task from an existing identity.
    pub fn from_parts(identity: LockIdentity, work: F) -> Self {
        Self { identity, work }
    }

    pub fn identity(&self) -> &LockIdentity {
        &self.identity
    }

    /// Separate identity and work for the coordinator.
    pub(crate) fn split_parts(self) -> (LockIdentity, F) {
        (self.identity, self.work)
    }
}
