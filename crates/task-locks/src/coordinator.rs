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

//! Lock coordinator: runs a cluster task under its cluster-wide lock.
//!
//! ## Flow
//! 1. Acquire the lease through the backend, retrying per [`RetryPolicy`]
//! 2. Start a [`HeartbeatRefresher`] for the held lease
//! 3. Run the task to completion (it is never preempted)
//! 4. Stop the heartbeat, then release the lease, on every exit path
//!    (including cancellation of the `run_task` future)
//!
//! ## States
//! `Idle -> Acquiring -> Holding -> Releasing -> Idle`, with
//! `Acquiring -> Acquiring` per retry and `Acquiring -> Failed` when the
//! policy gives up or the wait is interrupted.
//!
//! The task's own outcome is what the caller sees; a release failure is only
//! logged. A panicking task still gets its lock released before the panic
//! resumes.

use crate::backend::LockBackend;
use crate::clock::{duration_millis, Clock, SystemClock};
use crate::config::LockConfig;
use crate::heartbeat::HeartbeatRefresher;
use crate::retry::RetryPolicy;
use crate::{ClusterTask, LockError, LockIdentity, LockResult, TaskError};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Per-run lock state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskLockState {
    Idle,
    Acquiring,
    Holding,
    Releasing,
    Failed,
}

impl TaskLockState {
    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: TaskLockState) -> bool {
        use TaskLockState::*;
        matches!(
            (self, next),
            (Idle, Acquiring)
                | (Acquiring, Acquiring)
                | (Acquiring, Holding)
                | (Acquiring, Failed)
                | (Holding, Releasing)
                | (Releasing, Idle)
        )
    }
}

/// State tracker for one `run_task` call.
struct TaskRun<'a> {
    identity: &'a LockIdentity,
    state: TaskLockState,
}

impl<'a> TaskRun<'a> {
    fn new(identity: &'a LockIdentity) -> Self {
        Self {
            identity,
            state: TaskLockState::Idle,
        }
    }

    fn transition(&mut self, next: TaskLockState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal lock state transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!(lock = %self.identity, from = ?self.state, to = ?next, "Lock state transition");
        self.state = next;
    }
}

/// Runs cluster tasks under mutual exclusion across nodes.
pub struct LockCoordinator {
    backend: Arc<dyn LockBackend>,
    clock: Arc<dyn Clock>,
    config: LockConfig,
    interrupt_tx: watch::Sender<u64>,
}

impl LockCoordinator {
    /// Create a coordinator with explicit backend, clock and configuration.
    pub fn new(backend: Arc<dyn LockBackend>, clock: Arc<dyn Clock>, config: LockConfig) -> LockResult<Self> {
        config.validate()?;
        let (interrupt_tx, _) = watch::channel(0);
        Ok(Self {
            backend,
            clock,
            config,
            interrupt_tx,
        })
    }

    /// Create a coordinator on the wall clock.
    pub fn with_system_clock(backend: Arc<dyn LockBackend>, config: LockConfig) -> LockResult<Self> {
        Self::new(backend, Arc::new(SystemClock), config)
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Interrupt every acquisition loop currently waiting to retry.
    pub fn interrupt(&self) {
        self.interrupt_tx.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    /// Whether a valid lease currently exists for `identity`.
    pub async fn is_locked(&self, identity: &LockIdentity) -> LockResult<bool> {
        let now = self.clock.now_millis();
        Ok(self
            .backend
            .read_timestamp(identity)
            .await?
            .is_some_and(|ts| now.saturating_sub(ts) <= duration_millis(self.config.lease_ttl)))
    }

    /// Acquire the task's lock, run it, and release the lock.
    ///
    /// ## Returns
    /// - `Ok(T)`: the task's result
    /// - `Err(LockError::TaskFailed)`: the task ran and returned an error
    /// - `Err(LockError::Exhausted)`: the lock stayed busy until the policy gave up
    /// - `Err(LockError::Interrupted)`: [`interrupt`](Self::interrupt) was called while waiting
    /// - `Err(LockError::Unavailable | BackendError)`: the last attempt failed in the backend
    pub async fn run_task<F, Fut, T>(&self, task: ClusterTask<F>, policy: &mut dyn RetryPolicy) -> LockResult<T>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, TaskError>> + Send,
        T: Send,
    {
        let (identity, work) = task.split_parts();
        let mut run = TaskRun::new(&identity);

        let acquired_at = self.acquire(&mut run, policy).await?;
        let held = HeldLock {
            backend: self.backend.clone(),
            identity: identity.clone(),
            refresher: Some(HeartbeatRefresher::start(
                self.backend.clone(),
                self.clock.clone(),
                identity.clone(),
                self.config.refresh_interval,
                self.config.lease_ttl,
                acquired_at,
            )),
            released: false,
        };

        let outcome = AssertUnwindSafe(async move { work().await }).catch_unwind().await;

        run.transition(TaskLockState::Releasing);
        held.release().await;
        run.transition(TaskLockState::Idle);

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(LockError::TaskFailed {
                task_name: identity.task_name().to_string(),
                source,
            }),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// Acquisition loop; returns the lease timestamp written on success.
    async fn acquire(&self, run: &mut TaskRun<'_>, policy: &mut dyn RetryPolicy) -> LockResult<i64> {
        let identity = run.identity;
        let mut interrupt_rx = self.interrupt_tx.subscribe();
        let mut attempts: u32 = 0;

        loop {
            run.transition(TaskLockState::Acquiring);
            attempts = attempts.saturating_add(1);

            let now = self.clock.now_millis();
            let failure = match self.backend.acquire_lease(identity, now, self.config.lease_ttl).await {
                Ok(()) => {
                    run.transition(TaskLockState::Holding);
                    metrics::counter!("plexspaces_task_lock_acquired_total",
                        "backend" => self.backend.name()
                    )
                    .increment(1);
                    info!(lock = %identity, attempts, "Acquired cluster task lock");
                    return Ok(now);
                }
                Err(e @ LockError::Busy(_)) => {
                    metrics::counter!("plexspaces_task_lock_contended_total",
                        "backend" => self.backend.name()
                    )
                    .increment(1);
                    debug!(lock = %identity, attempts, reason = %e, "Cluster task lock busy");
                    e
                }
                Err(e) => {
                    warn!(
                        lock = %identity,
                        task_name = identity.task_name(),
                        attempts,
                        error = %e,
                        "Lock backend failure during acquisition"
                    );
                    e
                }
            };

            if !policy.is_retry_allowed() {
                run.transition(TaskLockState::Failed);
                return Err(match failure {
                    LockError::Busy(_) => {
                        metrics::counter!("plexspaces_task_lock_exhausted_total",
                            "backend" => self.backend.name()
                        )
                        .increment(1);
                        warn!(lock = %identity, attempts, "Unable to acquire cluster task lock");
                        LockError::Exhausted {
                            task_name: identity.task_name().to_string(),
                            attempts,
                        }
                    }
                    other => other,
                });
            }

            if interrupt_rx.has_changed().unwrap_or(false) {
                run.transition(TaskLockState::Failed);
                return Err(interrupted(identity));
            }

            let delay = policy.next_delay();
            if !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = interrupt_rx.changed() => {
                        run.transition(TaskLockState::Failed);
                        return Err(interrupted(identity));
                    }
                }
            }
        }
    }
}

/// A held lease and its heartbeat.
///
/// Dropped without [`release`](Self::release) (the `run_task` future was
/// cancelled), it stops the heartbeat and releases from a spawned task.
struct HeldLock {
    backend: Arc<dyn LockBackend>,
    identity: LockIdentity,
    refresher: Option<HeartbeatRefresher>,
    released: bool,
}

impl HeldLock {
    async fn release(mut self) {
        if let Some(refresher) = self.refresher.take() {
            refresher.stop().await;
        }
        release_lock(self.backend.as_ref(), &self.identity).await;
        self.released = true;
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let refresher = self.refresher.take();
        let backend = self.backend.clone();
        let identity = self.identity.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(lock = %identity, "Cluster task run cancelled while holding the lock, releasing");
                handle.spawn(async move {
                    if let Some(refresher) = refresher {
                        refresher.stop().await;
                    }
                    release_lock(backend.as_ref(), &identity).await;
                });
            }
            Err(_) => {
                error!(
                    lock = %identity,
                    "Cluster task run dropped outside a runtime, lock will expire after the lease TTL"
                );
            }
        }
    }
}

async fn release_lock(backend: &dyn LockBackend, identity: &LockIdentity) {
    match backend.release(identity).await {
        Ok(()) => info!(lock = %identity, "Released cluster task lock"),
        Err(e) => {
            metrics::counter!("plexspaces_task_lock_release_failures_total",
                "backend" => backend.name()
            )
            .increment(1);
            error!(
                lock = %identity,
                task_name = identity.task_name(),
                error = %e,
                "Failed to release cluster task lock, it will expire after the lease TTL"
            );
        }
    }
}

fn interrupted(identity: &LockIdentity) -> LockError {
    info!(lock = %identity, "Interrupted while waiting for cluster task lock");
    LockError::Interrupted {
        task_name: identity.task_name().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::retry::{FixedAttempts, RunOnce, UnlimitedBackoff};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// In-process backend with call accounting and injectable faults.
    #[derive(Default)]
    struct FakeBackend {
        records: Mutex<HashMap<LockIdentity, i64>>,
        acquire_calls: AtomicU32,
        fail_acquire: Mutex<Option<fn() -> LockError>>,
        fail_release: Mutex<bool>,
        log: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl LockBackend for FakeBackend {
        fn name(&self) -> &'static str {
            "fake"
        }
        async fn try_acquire(&self, identity: &LockIdentity, now: i64) -> LockResult<bool> {
            self.acquire_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(make) = *self.fail_acquire.lock().unwrap() {
                return Err(make());
            }
            let mut records = self.records.lock().unwrap();
            if records.contains_key(identity) {
                return Ok(false);
            }
            records.insert(identity.clone(), now);
            Ok(true)
        }
        async fn read_timestamp(&self, identity: &LockIdentity) -> LockResult<Option<i64>> {
            Ok(self.records.lock().unwrap().get(identity).copied())
        }
        async fn try_renew(&self, identity: &LockIdentity, expected: i64, new: i64) -> LockResult<bool> {
            let mut records = self.records.lock().unwrap();
            match records.get_mut(identity) {
                Some(ts) if *ts == expected => {
                    *ts = new;
                    Ok(true)
                }
                _ => Ok(false),
            }
        }
        async fn refresh(&self, identity: &LockIdentity, now: i64) -> LockResult<bool> {
            self.log.lock().unwrap().push("refresh");
            Ok(self.records.lock().unwrap().insert(identity.clone(), now).is_some())
        }
        async fn release(&self, identity: &LockIdentity) -> LockResult<()> {
            self.log.lock().unwrap().push("release");
            if *self.fail_release.lock().unwrap() {
                return Err(LockError::BackendError("connection reset".to_string()));
            }
            self.records.lock().unwrap().remove(identity);
            Ok(())
        }
    }

    fn coordinator(backend: Arc<FakeBackend>, clock: Arc<ManualClock>) -> LockCoordinator {
        LockCoordinator::new(backend, clock, LockConfig::default()).unwrap()
    }

    fn identity() -> LockIdentity {
        LockIdentity::new(1, 42, "IMPORT_USERS").unwrap()
    }

    fn hold_elsewhere(backend: &FakeBackend, at: i64) {
        backend.records.lock().unwrap().insert(identity(), at);
    }

    #[tokio::test]
    async fn test_run_task_returns_result_and_releases() {
        let backend = Arc::new(FakeBackend::default());
        let coordinator = coordinator(backend.clone(), Arc::new(ManualClock::new(0)));

        let task = ClusterTask::new(1, 42, "IMPORT_USERS", || async { Ok::<_, TaskError>(7) }).unwrap();
        let result = coordinator.run_task(task, &mut RunOnce).await.unwrap();

        assert_eq!(result, 7);
        assert!(backend.records.lock().unwrap().is_empty());
        assert!(!coordinator.is_locked(&identity()).await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_is_held_while_task_runs() {
        let backend = Arc::new(FakeBackend::default());
        let coordinator = Arc::new(coordinator(backend.clone(), Arc::new(ManualClock::new(0))));

        let observer = coordinator.clone();
        let task = ClusterTask::new(1, 42, "IMPORT_USERS", move || async move {
            Ok::<_, TaskError>(observer.is_locked(&identity()).await?)
        })
        .unwrap();

        assert!(coordinator.run_task(task, &mut RunOnce).await.unwrap());
    }

    #[tokio::test]
    async fn test_fixed_attempts_under_contention() {
        let backend = Arc::new(FakeBackend::default());
        hold_elsewhere(&backend, 0);
        let coordinator = coordinator(backend.clone(), Arc::new(ManualClock::new(1_000)));

        let task = ClusterTask::new(1, 42, "IMPORT_USERS", || async { Ok::<_, TaskError>(()) }).unwrap();
        let result = coordinator.run_task(task, &mut FixedAttempts::new(3)).await;

        match result {
            Err(LockError::Exhausted { task_name, attempts }) => {
                assert_eq!(task_name, "IMPORT_USERS");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
        assert_eq!(backend.acquire_calls.load(Ordering::SeqCst), 3);
        // The other holder's record is untouched.
        assert_eq!(backend.records.lock().unwrap().get(&identity()), Some(&0));
    }

    #[tokio::test]
    async fn test_task_error_wins_over_release_error() {
        let backend = Arc::new(FakeBackend::default());
        *backend.fail_release.lock().unwrap() = true;
        let coordinator = coordinator(backend.clone(), Arc::new(ManualClock::new(0)));

        let task = ClusterTask::new(1, 42, "IMPORT_USERS", || async {
            Err::<(), TaskError>("import file missing".into())
        })
        .unwrap();
        let result = coordinator.run_task(task, &mut RunOnce).await;

        match result {
            Err(LockError::TaskFailed { task_name, source }) => {
                assert_eq!(task_name, "IMPORT_USERS");
                assert_eq!(source.to_string(), "import file missing");
            }
            other => panic!("expected TaskFailed, got {other:?}"),
        }
        assert_eq!(*backend.log.lock().unwrap(), vec!["release"]);
    }

    #[tokio::test]
    async fn test_release_failure_does_not_mask_success() {
        let backend = Arc::new(FakeBackend::default());
        *backend.fail_release.lock().unwrap() = true;
        let coordinator = coordinator(backend.clone(), Arc::new(ManualClock::new(0)));

        let task = ClusterTask::new(1, 42, "IMPORT_USERS", || async { Ok::<_, TaskError>("done") }).unwrap();
        assert_eq!(coordinator.run_task(task, &mut RunOnce).await.unwrap(), "done");
    }

    #[tokio::test]
    async fn test_panicking_task_still_releases() {
        let backend = Arc::new(FakeBackend::default());
        let coordinator = Arc::new(coordinator(backend.clone(), Arc::new(ManualClock::new(0))));

        let runner = coordinator.clone();
        let handle = tokio::spawn(async move {
            let task = ClusterTask::new(1, 42, "IMPORT_USERS", || async {
                if true {
                    panic!("task blew up");
                }
                Ok::<_, TaskError>(())
            })
            .unwrap();
            runner.run_task(task, &mut RunOnce).await
        });

        let join = handle.await;
        assert!(join.unwrap_err().is_panic());
        assert!(backend.records.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_backend_is_not_reported_as_busy() {
        let backend = Arc::new(FakeBackend::default());
        *backend.fail_acquire.lock().unwrap() =
            Some(|| LockError::Unavailable("coordination service down".to_string()));
        let coordinator = coordinator(backend.clone(), Arc::new(ManualClock::new(0)));

        let task = ClusterTask::new(1, 42, "IMPORT_USERS", || async { Ok::<_, TaskError>(()) }).unwrap();
        let result = coordinator.run_task(task, &mut FixedAttempts::new(2)).await;

        assert!(matches!(result, Err(LockError::Unavailable(_))));
        assert_eq!(backend.acquire_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_while_waiting() {
        let backend = Arc::new(FakeBackend::default());
        hold_elsewhere(&backend, 0);
        let coordinator = Arc::new(coordinator(backend.clone(), Arc::new(ManualClock::new(0))));

        let runner = coordinator.clone();
        let handle = tokio::spawn(async move {
            let task = ClusterTask::new(1, 42, "IMPORT_USERS", || async { Ok::<_, TaskError>(()) }).unwrap();
            runner.run_task(task, &mut UnlimitedBackoff::default()).await
        });

        tokio::time::sleep(Duration::from_secs(10)).await;
        coordinator.interrupt();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(LockError::Interrupted { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_stopped_before_release() {
        let backend = Arc::new(FakeBackend::default());
        let clock = Arc::new(ManualClock::new(0));
        let coordinator = coordinator(backend.clone(), clock.clone());

        let task = ClusterTask::new(1, 42, "IMPORT_USERS", || async {
            tokio::time::sleep(Duration::from_secs(45)).await;
            Ok::<_, TaskError>(())
        })
        .unwrap();
        coordinator.run_task(task, &mut RunOnce).await.unwrap();

        // Ticks at 20s and 40s, then the release; nothing after it.
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(*backend.log.lock().unwrap(), vec!["refresh", "refresh", "release"]);
        assert!(backend.records.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_run_releases_lock() {
        let backend = Arc::new(FakeBackend::default());
        let coordinator = coordinator(backend.clone(), Arc::new(ManualClock::new(0)));

        let task = ClusterTask::new(1, 42, "IMPORT_USERS", || async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<_, TaskError>(())
        })
        .unwrap();
        let result = tokio::time::timeout(
            Duration::from_millis(50),
            coordinator.run_task(task, &mut RunOnce),
        )
        .await;
        assert!(result.is_err());

        // Release runs on a spawned task once the run is dropped.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(backend.records.lock().unwrap().is_empty());
        assert_eq!(*backend.log.lock().unwrap(), vec!["release"]);

        let task = ClusterTask::new(1, 42, "IMPORT_USERS", || async { Ok::<_, TaskError>("next") }).unwrap();
        assert_eq!(coordinator.run_task(task, &mut RunOnce).await.unwrap(), "next");
    }

    #[test]
    fn test_state_transitions() {
        use TaskLockState::*;
        assert!(Idle.can_transition_to(Acquiring));
        assert!(Acquiring.can_transition_to(Acquiring));
        assert!(Acquiring.can_transition_to(Failed));
        assert!(Holding.can_transition_to(Releasing));
        assert!(Releasing.can_transition_to(Idle));
        assert!(!Idle.can_transition_to(Holding));
        assert!(!Holding.can_transition_to(Idle));
        assert!(!Failed.can_transition_to(Acquiring));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = LockConfig {
            refresh_interval: Duration::from_secs(40),
            ..LockConfig::default()
        };
        let result = LockCoordinator::new(
            Arc::new(FakeBackend::default()),
            Arc::new(ManualClock::new(0)),
            config,
        );
        assert!(matches!(result, Err(LockError::ConfigError(_))));
    }
}
