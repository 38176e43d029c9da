//! Counters and serializable snapshots for observability tooling.
//!
//! Components keep lock-free atomic counters and hand out plain snapshot structs;
//! exporting them is up to the application.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Snapshot of a [`ConnectionManager`](crate::ConnectionManager).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerStats {
    /// Cached connections.
    pub cached: usize,
    /// Cached connections that are currently healthy.
    pub healthy: usize,
    /// Dials started.
    pub dials: u64,
    /// Dials that failed or never became ready.
    pub dial_failures: u64,
    /// Stale cache entries closed and replaced by a new connection.
    pub replacements: u64,
    /// Unhealthy entries removed by health sweeps.
    pub evictions: u64,
}

/// Snapshot of a [`ConnectionPool`](crate::ConnectionPool).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Configured capacity.
    pub pool_size: usize,
    /// Connections counted against capacity (idle plus checked out).
    pub active: usize,
    /// Connections waiting in the free-list.
    pub idle: usize,
    /// Whether the pool has been closed.
    pub closed: bool,
    /// Connections created through the factory.
    pub created: u64,
    /// Checkouts served from the free-list.
    pub reused: u64,
    /// Connections closed because they were unhealthy or did not fit the free-list.
    pub discarded: u64,
    /// Checkouts refused because capacity was used up.
    pub exhausted: u64,
}

impl PoolStats {
    /// Connections currently checked out.
    pub fn in_use(&self) -> usize {
        self.active.saturating_sub(self.idle)
    }
}

/// Snapshot of a [`Retryer`](crate::Retryer).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryStats {
    /// Retry sequences started.
    pub calls: u64,
    /// Operation invocations across all sequences.
    pub attempts: u64,
    /// Sequences that succeeded on the first attempt.
    pub first_try_successes: u64,
    /// Sequences that succeeded after at least one failure.
    pub retried_successes: u64,
    /// Sequences that ran out of attempts.
    pub exhausted: u64,
    /// Sequences stopped by a non-retryable error.
    pub permanent_failures: u64,
    /// Sequences stopped by the caller's context.
    pub cancelled: u64,
}

#[derive(Debug, Default)]
pub(crate) struct ManagerCounters {
    pub(crate) dials: AtomicU64,
    pub(crate) dial_failures: AtomicU64,
    pub(crate) replacements: AtomicU64,
    pub(crate) evictions: AtomicU64,
}

impl ManagerCounters {
    pub(crate) fn snapshot(&self, cached: usize, healthy: usize) -> ManagerStats {
        ManagerStats {
            cached,
            healthy,
            dials: load(&self.dials),
            dial_failures: load(&self.dial_failures),
            replacements: load(&self.replacements),
            evictions: load(&self.evictions),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub(crate) created: AtomicU64,
    pub(crate) reused: AtomicU64,
    pub(crate) discarded: AtomicU64,
    pub(crate) exhausted: AtomicU64,
}

impl PoolCounters {
    pub(crate) fn snapshot(
        &self,
        pool_size: usize,
        active: usize,
        idle: usize,
        closed: bool,
    ) -> PoolStats {
        PoolStats {
            pool_size,
            active,
            idle,
            closed,
            created: load(&self.created),
            reused: load(&self.reused),
            discarded: load(&self.discarded),
            exhausted: load(&self.exhausted),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct RetryCounters {
    pub(crate) calls: AtomicU64,
    pub(crate) attempts: AtomicU64,
    pub(crate) first_try_successes: AtomicU64,
    pub(crate) retried_successes: AtomicU64,
    pub(crate) exhausted: AtomicU64,
    pub(crate) permanent_failures: AtomicU64,
    pub(crate) cancelled: AtomicU64,
}

impl RetryCounters {
    pub(crate) fn snapshot(&self) -> RetryStats {
        RetryStats {
            calls: load(&self.calls),
            attempts: load(&self.attempts),
            first_try_successes: load(&self.first_try_successes),
            retried_successes: load(&self.retried_successes),
            exhausted: load(&self.exhausted),
            permanent_failures: load(&self.permanent_failures),
            cancelled: load(&self.cancelled),
        }
    }
}

/// Bump a counter by one.
pub(crate) fn incr(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn load(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}
