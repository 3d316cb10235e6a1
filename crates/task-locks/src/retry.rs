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

//! Retry policies for lock acquisition.
//!
//! The coordinator asks the policy after every failed attempt whether it may
//! try again, and how long to wait first. Policies are stateful and meant for
//! a single `run_task` call.

use std::time::Duration;
use tokio::time::Instant;

/// Strategy deciding whether another acquisition attempt is permitted.
pub trait RetryPolicy: Send {
    /// Called after a failed attempt; `false` ends the acquisition loop.
    fn is_retry_allowed(&mut self) -> bool;

    /// Wait before the next attempt (only asked when a retry is allowed).
    fn next_delay(&mut self) -> Duration {
        Duration::ZERO
    }
}

/// Exactly one attempt.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOnce;

impl RetryPolicy for RunOnce {
    fn is_retry_allowed(&mut self) -> bool {
        false
    }
}

/// At most `max_attempts` attempts, optionally spaced by a fixed delay.
#[derive(Debug, Clone)]
pub struct FixedAttempts {
    max_attempts: u32,
    attempts: u32,
    delay: Duration,
}

impl FixedAttempts {
    pub fn new(max_attempts: u32) -> Self {
        Self::with_delay(max_attempts, Duration::ZERO)
    }

    pub fn with_delay(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            attempts: 0,
            delay,
        }
    }

    /// Failed attempts seen so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

impl RetryPolicy for FixedAttempts {
    fn is_retry_allowed(&mut self) -> bool {
        self.attempts = self.attempts.saturating_add(1);
        self.attempts < self.max_attempts
    }

    fn next_delay(&mut self) -> Duration {
        self.delay
    }
}

/// Retry forever with exponentially growing, capped delays.
///
/// For long-lived daemons that must eventually get the lock. Wrap in
/// [`WithDeadline`] when a hard timeout is needed.
#[derive(Debug, Clone)]
pub struct UnlimitedBackoff {
    next: Duration,
    max_delay: Duration,
    factor: u32,
}

impl UnlimitedBackoff {
    /// Backoff doubling from `initial_delay` up to `max_delay`.
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        // Never spin on the backend.
        let initial_delay = initial_delay.max(Duration::from_millis(1));
        Self {
            next: initial_delay,
            max_delay: max_delay.max(initial_delay),
            factor: 2,
        }
    }

    pub fn with_factor(mut self, factor: u32) -> Self {
        self.factor = factor.max(1);
        self
    }
}

impl Default for UnlimitedBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

impl RetryPolicy for UnlimitedBackoff {
    fn is_retry_allowed(&mut self) -> bool {
        true
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = self
            .next
            .checked_mul(self.factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);
        delay
    }
}

/// Caps another policy with a wall-clock deadline.
///
/// Once the deadline passes no further attempts are allowed and the
/// coordinator reports the lock as unavailable.
#[derive(Debug, Clone)]
pub struct WithDeadline<P> {
    inner: P,
    deadline: Instant,
}

impl<P: RetryPolicy> WithDeadline<P> {
    pub fn new(inner: P, timeout: Duration) -> Self {
        Self {
            inner,
            deadline: Instant::now() + timeout,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

impl<P: RetryPolicy> RetryPolicy for WithDeadline<P> {
    fn is_retry_allowed(&mut self) -> bool {
        Instant::now() < self.deadline && self.inner.is_retry_allowed()
    }

    fn next_delay(&mut self) -> Duration {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        self.inner.next_delay().min(remaining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_once_never_retries() {
        let mut policy = RunOnce;
        assert!(!policy.is_retry_allowed());
        assert!(!policy.is_retry_allowed());
    }

    #[test]
    fn test_fixed_attempts_allows_exactly_n() {
        let mut policy = FixedAttempts::new(3);
        // After attempt 1 and 2 another try is allowed, after attempt 3 not.
        assert!(policy.is_retry_allowed());
        assert!(policy.is_retry_allowed());
        assert!(!policy.is_retry_allowed());
        assert_eq!(policy.attempts(), 3);
    }

    #[test]
    fn test_fixed_attempts_zero_behaves_like_run_once() {
        let mut policy = FixedAttempts::new(0);
        assert!(!policy.is_retry_allowed());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut policy = UnlimitedBackoff::new(Duration::from_millis(100), Duration::from_millis(500));
        let delays: Vec<_> = (0..5)
            .map(|_| {
                assert!(policy.is_retry_allowed());
                policy.next_delay()
            })
            .collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
                Duration::from_millis(500),
                Duration::from_millis(500),
            ]
        );
    }

    #[test]
    fn test_backoff_never_zero() {
        let mut policy = UnlimitedBackoff::new(Duration::ZERO, Duration::ZERO);
        assert_eq!(policy.next_delay(), Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_stops_retries() {
        let mut policy = WithDeadline::new(UnlimitedBackoff::default(), Duration::from_secs(5));
        assert!(policy.is_retry_allowed());
        assert_eq!(policy.next_delay(), Duration::from_secs(1));

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(policy.is_retry_allowed());
        // Remaining time caps the inner backoff (2s).
        assert_eq!(policy.next_delay(), Duration::from_secs(1));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!policy.is_retry_allowed());
    }
}
