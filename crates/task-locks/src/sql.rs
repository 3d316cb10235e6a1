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

//! SQL-based lock backend (SQLite).
//!
//! One row per [`LockIdentity`] in the `cluster_task_locks` table of the
//! schema that serves the identity's context:
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS cluster_task_locks (
//!   cid INTEGER NOT NULL,
//!   user_id INTEGER NOT NULL,
//!   task_name TEXT NOT NULL,
//!   timestamp INTEGER NOT NULL,
//!   PRIMARY KEY (cid, user_id, task_name)
//! );
//! ```
//!
//! - `timestamp` is epoch milliseconds and the only mutable column
//! - acquisition is `INSERT ... ON CONFLICT DO NOTHING`; SQLite reports zero
//!   affected rows for the no-op, so `rows_affected() == 1` means "created"
//! - reclaim is `UPDATE ... WHERE timestamp = <observed>`, the compare-and-swap
//!   that keeps two simultaneously expiring nodes from both winning
//!
//! Schemas are sharded per context; a [`SchemaResolver`] maps a context id to
//! its pool and enumerates every schema for the stale-lock reaper.

use crate::backend::LockBackend;
use crate::{LockError, LockIdentity, LockResult};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::instrument;

/// Lock table name.
pub const LOCK_TABLE: &str = "cluster_task_locks";

/// A named database schema and its pool.
#[derive(Debug, Clone)]
pub struct Schema {
    pub name: String,
    pub pool: SqlitePool,
}

/// Lookup of relational schemas.
#[async_trait]
pub trait SchemaResolver: Send + Sync {
    /// Pool of the schema serving `context_id`.
    async fn pool_for_context(&self, context_id: i32) -> LockResult<SqlitePool>;

    /// Every distinct schema in use (with or without the lock table).
    async fn schemas(&self) -> LockResult<Vec<Schema>>;
}

/// Fixed set of schemas with explicit context assignments and an optional
/// default schema for unassigned contexts.
#[derive(Debug, Clone, Default)]
pub struct StaticSchemaResolver {
    schemas: BTreeMap<String, SqlitePool>,
    assignments: HashMap<i32, String>,
    default_schema: Option<String>,
}

impl StaticSchemaResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a schema.
    pub fn with_schema(mut self, name: impl Into<String>, pool: SqlitePool) -> Self {
        self.schemas.insert(name.into(), pool);
        self
    }

    /// Register a schema and serve unassigned contexts from it.
    pub fn with_default_schema(mut self, name: impl Into<String>, pool: SqlitePool) -> Self {
        let name = name.into();
        self.default_schema = Some(name.clone());
        self.with_schema(name, pool)
    }

    /// Serve `context_id` from the named schema.
    pub fn assign(mut self, context_id: i32, schema: impl Into<String>) -> Self {
        self.assignments.insert(context_id, schema.into());
        self
    }
}

#[async_trait]
impl SchemaResolver for StaticSchemaResolver {
    async fn pool_for_context(&self, context_id: i32) -> LockResult<SqlitePool> {
        let name = self
            .assignments
            .get(&context_id)
            .or(self.default_schema.as_ref())
            .ok_or_else(|| {
                LockError::Unavailable(format!("no schema serves context {context_id}"))
            })?;
        self.schemas
            .get(name)
            .cloned()
            .ok_or_else(|| LockError::ConfigError(format!("context {context_id} assigned to unknown schema {name}")))
    }

    async fn schemas(&self) -> LockResult<Vec<Schema>> {
        Ok(self
            .schemas
            .iter()
            .map(|(name, pool)| Schema {
                name: name.clone(),
                pool: pool.clone(),
            })
            .collect())
    }
}

/// Open (creating if missing) a SQLite database file as a pool.
pub async fn open_sqlite_pool(path: &str) -> LockResult<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);
    SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .map_err(|e| LockError::Unavailable(format!("failed to open SQLite {path}: {e}")))
}

/// Map a driver error: connectivity problems are `Unavailable`, the rest are
/// backend errors carrying the operation and lock.
fn sql_error(op: &str, identity: &LockIdentity, err: sqlx::Error) -> LockError {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            LockError::Unavailable(format!("{op} {identity}: {err}"))
        }
        other => LockError::BackendError(format!("{op} {identity}: {other}")),
    }
}

/// SQLite-based lock backend.
#[derive(Clone)]
pub struct SqliteLockBackend {
    resolver: Arc<dyn SchemaResolver>,
}

impl SqliteLockBackend {
    pub fn new(resolver: Arc<dyn SchemaResolver>) -> Self {
        Self { resolver }
    }

    /// Create the lock table in `pool` if it does not exist yet.
    pub async fn ensure_schema(pool: &SqlitePool) -> LockResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cluster_task_locks (
              cid INTEGER NOT NULL,
              user_id INTEGER NOT NULL,
              task_name TEXT NOT NULL,
              timestamp INTEGER NOT NULL,
              PRIMARY KEY (cid, user_id, task_name)
            );
        "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_cluster_task_locks_timestamp
            ON cluster_task_locks(timestamp);
        "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    async fn pool(&self, identity: &LockIdentity) -> LockResult<SqlitePool> {
        self.resolver.pool_for_context(identity.context_id()).await
    }
}

#[async_trait]
impl LockBackend for SqliteLockBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    #[instrument(skip(self), fields(cid = identity.context_id(), user_id = identity.user_id(), task_name = identity.task_name()))]
    async fn try_acquire(&self, identity: &LockIdentity, now: i64) -> LockResult<bool> {
        let pool = self.pool(identity).await?;
        let result = sqlx::query(
            r#"INSERT INTO cluster_task_locks (cid, user_id, task_name, timestamp)
               VALUES (?1, ?2, ?3, ?4)
               ON CONFLICT (cid, user_id, task_name) DO NOTHING"#,
        )
        .bind(identity.context_id())
        .bind(identity.user_id())
        .bind(identity.task_name())
        .bind(now)
        .execute(&pool)
        .await
        .map_err(|e| sql_error("insert lock", identity, e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(cid = identity.context_id(), user_id = identity.user_id(), task_name = identity.task_name()))]
    async fn read_timestamp(&self, identity: &LockIdentity) -> LockResult<Option<i64>> {
        let pool = self.pool(identity).await?;
        sqlx::query_scalar::<_, i64>(
            r#"SELECT timestamp FROM cluster_task_locks
               WHERE cid = ?1 AND user_id = ?2 AND task_name = ?3"#,
        )
        .bind(identity.context_id())
        .bind(identity.user_id())
        .bind(identity.task_name())
        .fetch_optional(&pool)
        .await
        .map_err(|e| sql_error("select lock", identity, e))
    }

    #[instrument(skip(self), fields(cid = identity.context_id(), user_id = identity.user_id(), task_name = identity.task_name()))]
    async fn try_renew(&self, identity: &LockIdentity, expected: i64, new: i64) -> LockResult<bool> {
        let pool = self.pool(identity).await?;
        let result = sqlx::query(
            r#"UPDATE cluster_task_locks
                  SET timestamp = ?5
                WHERE cid = ?1 AND user_id = ?2 AND task_name = ?3 AND timestamp = ?4"#,
        )
        .bind(identity.context_id())
        .bind(identity.user_id())
        .bind(identity.task_name())
        .bind(expected)
        .bind(new)
        .execute(&pool)
        .await
        .map_err(|e| sql_error("renew lock", identity, e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(cid = identity.context_id(), user_id = identity.user_id(), task_name = identity.task_name()))]
    async fn refresh(&self, identity: &LockIdentity, now: i64) -> LockResult<bool> {
        let pool = self.pool(identity).await?;
        let result = sqlx::query(
            r#"UPDATE cluster_task_locks
                  SET timestamp = ?4
                WHERE cid = ?1 AND user_id = ?2 AND task_name = ?3"#,
        )
        .bind(identity.context_id())
        .bind(identity.user_id())
        .bind(identity.task_name())
        .bind(now)
        .execute(&pool)
        .await
        .map_err(|e| sql_error("refresh lock", identity, e))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(cid = identity.context_id(), user_id = identity.user_id(), task_name = identity.task_name()))]
    async fn release(&self, identity: &LockIdentity) -> LockResult<()> {
        let pool = self.pool(identity).await?;
        sqlx::query(
            r#"DELETE FROM cluster_task_locks
                WHERE cid = ?1 AND user_id = ?2 AND task_name = ?3"#,
        )
        .bind(identity.context_id())
        .bind(identity.user_id())
        .bind(identity.task_name())
        .execute(&pool)
        .await
        .map_err(|e| sql_error("delete lock", identity, e))?;

        Ok(())
    }
}
