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

//! Cluster-map coordinator integration tests.
//!
//! Several coordinators sharing one cluster map play the role of nodes.

#[cfg(feature = "cluster-map-backend")]
mod tests {
    use plexspaces_task_locks::{
        cluster_map::{ClusterMapLockBackend, InMemoryClusterMapProvider},
        ClusterTask, FixedAttempts, LockBackend, LockConfig, LockCoordinator, LockError, LockIdentity,
        ManualClock, RunOnce, TaskError, UnlimitedBackoff, WithDeadline,
    };
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::oneshot;

    const MAP: &str = "test-task-locks";

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("plexspaces_task_locks=debug")
            .with_test_writer()
            .try_init();
    }

    fn node(provider: &Arc<InMemoryClusterMapProvider>) -> (Arc<ClusterMapLockBackend>, Arc<LockCoordinator>) {
        let backend = Arc::new(ClusterMapLockBackend::new(provider.clone(), MAP));
        let coordinator = LockCoordinator::with_system_clock(backend.clone(), LockConfig::default()).unwrap();
        (backend, Arc::new(coordinator))
    }

    /// Start a task on `coordinator` that holds the lock until the returned sender fires.
    async fn hold(
        coordinator: Arc<LockCoordinator>,
        task_name: &'static str,
    ) -> (oneshot::Sender<()>, tokio::task::JoinHandle<Result<(), LockError>>) {
        let (started_tx, started_rx) = oneshot::channel::<()>();
        let (finish_tx, finish_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let task = ClusterTask::new(1, 0, task_name, move || async move {
                let _ = started_tx.send(());
                let _ = finish_rx.await;
                Ok::<_, TaskError>(())
            })
            .unwrap();
            coordinator.run_task(task, &mut RunOnce).await
        });
        started_rx.await.unwrap();
        (finish_tx, handle)
    }

    #[tokio::test]
    async fn test_only_one_node_runs_at_a_time() {
        init_tracing();
        let provider = Arc::new(InMemoryClusterMapProvider::new());
        let (_, node_a) = node(&provider);
        let (_, node_b) = node(&provider);

        let (finish, running) = hold(node_a, "rebuild-index").await;

        let ran = Arc::new(AtomicU32::new(0));
        let counter = ran.clone();
        let task = ClusterTask::new(1, 0, "rebuild-index", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, TaskError>(())
        })
        .unwrap();
        let result = node_b.run_task(task, &mut FixedAttempts::new(3)).await;
        match result {
            Err(LockError::Exhausted { task_name, attempts }) => {
                assert_eq!(task_name, "rebuild-index");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        finish.send(()).unwrap();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_different_identities_do_not_contend() {
        let provider = Arc::new(InMemoryClusterMapProvider::new());
        let (_, node_a) = node(&provider);
        let (_, node_b) = node(&provider);

        let (finish, running) = hold(node_a, "cleanup").await;
        let other_user = ClusterTask::new(1, 2, "cleanup", || async { Ok::<_, TaskError>(7) }).unwrap();
        assert_eq!(node_b.run_task(other_user, &mut RunOnce).await.unwrap(), 7);

        finish.send(()).unwrap();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_waiting_node_acquires_after_release() {
        let provider = Arc::new(InMemoryClusterMapProvider::new());
        let (_, node_a) = node(&provider);
        let (_, node_b) = node(&provider);

        let (finish, running) = hold(node_a, "compact").await;
        let waiter = tokio::spawn(async move {
            let task = ClusterTask::new(1, 0, "compact", || async { Ok::<_, TaskError>("compacted") }).unwrap();
            let mut policy = UnlimitedBackoff::new(Duration::from_millis(5), Duration::from_millis(20));
            node_b.run_task(task, &mut policy).await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        finish.send(()).unwrap();
        running.await.unwrap().unwrap();

        assert_eq!(waiter.await.unwrap().unwrap(), "compacted");
    }

    #[tokio::test]
    async fn test_deadline_bounds_waiting() {
        let provider = Arc::new(InMemoryClusterMapProvider::new());
        let (_, node_a) = node(&provider);
        let (_, node_b) = node(&provider);

        let (finish, running) = hold(node_a, "report").await;
        let task = ClusterTask::new(1, 0, "report", || async { Ok::<_, TaskError>(()) }).unwrap();
        let mut policy = WithDeadline::new(
            UnlimitedBackoff::new(Duration::from_millis(5), Duration::from_millis(20)),
            Duration::from_millis(100),
        );
        let result = node_b.run_task(task, &mut policy).await;
        assert!(matches!(result, Err(LockError::Exhausted { .. })));

        finish.send(()).unwrap();
        running.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_keeps_second_node_out() {
        init_tracing();
        let provider = Arc::new(InMemoryClusterMapProvider::new());
        let backend = Arc::new(ClusterMapLockBackend::new(provider.clone(), MAP));
        let clock = Arc::new(ManualClock::new(0));
        let node_a = Arc::new(LockCoordinator::new(backend.clone(), clock.clone(), LockConfig::default()).unwrap());
        let node_b = LockCoordinator::new(backend.clone(), clock.clone(), LockConfig::default()).unwrap();
        let start = tokio::time::Instant::now();

        let (started_tx, started_rx) = oneshot::channel::<()>();
        let running = tokio::spawn(async move {
            let task = ClusterTask::new(1, 0, "migrate", move || async move {
                let _ = started_tx.send(());
                tokio::time::sleep(Duration::from_secs(70)).await;
                Ok::<_, TaskError>(())
            })
            .unwrap();
            node_a.run_task(task, &mut RunOnce).await
        });
        started_rx.await.unwrap();

        // Node A heartbeats at 20s, 40s and 60s; node B tries 5s after each.
        for heartbeat_secs in [20u64, 40, 60] {
            tokio::time::sleep_until(start + Duration::from_secs(heartbeat_secs - 1)).await;
            clock.set((heartbeat_secs * 1000) as i64);

            let attempt_secs = heartbeat_secs + 5;
            tokio::time::sleep_until(start + Duration::from_secs(attempt_secs)).await;
            clock.set((attempt_secs * 1000) as i64);
            let task = ClusterTask::new(1, 0, "migrate", || async { Ok::<_, TaskError>(()) }).unwrap();
            let result = node_b.run_task(task, &mut RunOnce).await;
            assert!(
                matches!(result, Err(LockError::Exhausted { attempts: 1, .. })),
                "node B should be kept out at {attempt_secs}s, got {result:?}"
            );
        }

        clock.set(70_000);
        running.await.unwrap().unwrap();
        let identity = LockIdentity::new(1, 0, "migrate").unwrap();
        assert_eq!(backend.read_timestamp(&identity).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_crashed_holder_is_reclaimed() {
        init_tracing();
        let provider = Arc::new(InMemoryClusterMapProvider::new());
        let backend = Arc::new(ClusterMapLockBackend::new(provider.clone(), MAP));
        let identity = LockIdentity::new(1, 0, "migrate").unwrap();

        // Node A acquired at t=0 and died without releasing.
        assert!(backend.try_acquire(&identity, 0).await.unwrap());

        let clock = Arc::new(ManualClock::new(5));
        let node_b = LockCoordinator::new(backend.clone(), clock.clone(), LockConfig::default()).unwrap();
        let task = ClusterTask::from_parts(identity.clone(), || async { Ok::<_, TaskError>(()) });
        assert!(matches!(
            node_b.run_task(task, &mut RunOnce).await,
            Err(LockError::Exhausted { attempts: 1, .. })
        ));

        clock.set(31_000);
        let task = ClusterTask::from_parts(identity.clone(), || async { Ok::<_, TaskError>("reclaimed") });
        assert_eq!(node_b.run_task(task, &mut RunOnce).await.unwrap(), "reclaimed");
        assert_eq!(backend.read_timestamp(&identity).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_membership_loss_unregisters_node() {
        init_tracing();
        let provider = Arc::new(InMemoryClusterMapProvider::new());
        let (backend, coordinator) = node(&provider);

        provider.set_running(false);
        let task = ClusterTask::new(1, 0, "sync", || async { Ok::<_, TaskError>(()) }).unwrap();
        let result = coordinator.run_task(task, &mut FixedAttempts::new(2)).await;
        assert!(matches!(result, Err(LockError::Unavailable(_))));
        assert!(!backend.is_registered());

        // Membership recovers, but this instance stays out until recreated.
        provider.set_running(true);
        let task = ClusterTask::new(1, 0, "sync", || async { Ok::<_, TaskError>(()) }).unwrap();
        assert!(matches!(
            coordinator.run_task(task, &mut RunOnce).await,
            Err(LockError::Unavailable(_))
        ));

        let (_, fresh) = node(&provider);
        let task = ClusterTask::new(1, 0, "sync", || async { Ok::<_, TaskError>(()) }).unwrap();
        fresh.run_task(task, &mut RunOnce).await.unwrap();
    }

    #[tokio::test]
    async fn test_timed_out_node_frees_lock_for_others() {
        init_tracing();
        let provider = Arc::new(InMemoryClusterMapProvider::new());
        let (_, node_a) = node(&provider);
        let (_, node_b) = node(&provider);

        let task = ClusterTask::new(1, 0, "rebalance", || async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<_, TaskError>(())
        })
        .unwrap();
        let timed_out = tokio::time::timeout(Duration::from_millis(50), node_a.run_task(task, &mut RunOnce)).await;
        assert!(timed_out.is_err());

        // Node A's release is asynchronous; a short wait must be enough, not a full lease TTL.
        let task = ClusterTask::new(1, 0, "rebalance", || async { Ok::<_, TaskError>("rebalanced") }).unwrap();
        let mut policy = FixedAttempts::with_delay(10, Duration::from_millis(20));
        assert_eq!(node_b.run_task(task, &mut policy).await.unwrap(), "rebalanced");
    }

    #[tokio::test]
    async fn test_interrupt_cancels_waiting_node() {
        let provider = Arc::new(InMemoryClusterMapProvider::new());
        let (_, node_a) = node(&provider);
        let (_, node_b) = node(&provider);

        let (finish, running) = hold(node_a, "export").await;
        let waiter = {
            let node_b = node_b.clone();
            tokio::spawn(async move {
                let task = ClusterTask::new(1, 0, "export", || async { Ok::<_, TaskError>(()) }).unwrap();
                let mut policy = UnlimitedBackoff::new(Duration::from_millis(5), Duration::from_millis(20));
                node_b.run_task(task, &mut policy).await
            })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        node_b.interrupt();
        assert!(matches!(
            waiter.await.unwrap(),
            Err(LockError::Interrupted { .. })
        ));

        finish.send(()).unwrap();
        running.await.unwrap().unwrap();
    }
}
