//! Retry budget, backoff schedule, and failover rotation.

use std::time::Duration;

use contentpump_core::ReplicaInfo;

/// Attempts a request gets before the failure propagates.
pub const MAX_ATTEMPTS: u32 = 15;
pub const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
pub const WRITER_MAX_BACKOFF: Duration = Duration::from_secs(120);
pub const READER_MAX_BACKOFF: Duration = Duration::from_secs(30);
/// Attempts a transaction spanning several batches gets. Replaying such a
/// transaction re-sends every batch in it, so the budget is smaller.
pub const MULTI_BATCH_TXN_MAX_ATTEMPTS: u32 = 3;

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub const fn writer() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            initial_backoff: INITIAL_BACKOFF,
            max_backoff: WRITER_MAX_BACKOFF,
        }
    }

    #[must_use]
    pub const fn reader() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            initial_backoff: INITIAL_BACKOFF,
            max_backoff: READER_MAX_BACKOFF,
        }
    }

    /// Sleep before the attempt following failed attempt `failed` (1-based).
    #[must_use]
    pub fn backoff(&self, failed: u32) -> Duration {
        let shift = failed.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1_u32 << shift)
            .min(self.max_backoff)
    }
}

/// Failover position within a forest's replica list.
///
/// Advancing wraps around, so `len()` consecutive advances visit every
/// replica exactly once and return to the starting one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaCursor {
    replicas: Vec<ReplicaInfo>,
    position: usize,
}

impl ReplicaCursor {
    /// Starts at the replica served by `primary_host`, or the first replica.
    ///
    /// Returns `None` for an empty list: no failover is possible.
    #[must_use]
    pub fn new(replicas: Vec<ReplicaInfo>, primary_host: &str) -> Option<Self> {
        if replicas.is_empty() {
            return None;
        }
        let position = replicas
            .iter()
            .position(|r| r.host == primary_host)
            .unwrap_or(0);
        Some(Self { replicas, position })
    }

    #[must_use]
    pub fn current(&self) -> &ReplicaInfo {
        &self.replicas[self.position]
    }

    /// Moves to the next replica and returns it.
    pub fn advance(&mut self) -> &ReplicaInfo {
        self.position = (self.position + 1) % self.replicas.len();
        self.current()
    }

    #[must_use]
    pub fn position(&self) -> usize {
        self.position
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }
}

/// Round robin over the job's output hosts when the server places documents.
///
/// A failed host is blacklisted and skipped. Once every host is
/// blacklisted the blacklist is cleared and rotation starts over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRotation {
    hosts: Vec<String>,
    blacklist: Vec<bool>,
    current: usize,
}

impl HostRotation {
    /// Starts at `hosts[start % len]`.
    ///
    /// Returns `None` for an empty host list.
    #[must_use]
    pub fn new(hosts: Vec<String>, start: usize) -> Option<Self> {
        if hosts.is_empty() {
            return None;
        }
        let current = start % hosts.len();
        Some(Self {
            blacklist: vec![false; hosts.len()],
            hosts,
            current,
        })
    }

    #[must_use]
    pub fn current(&self) -> &str {
        &self.hosts[self.current]
    }

    /// Blacklists the current host and moves to the next usable one.
    pub fn fail_current(&mut self) -> &str {
        self.blacklist[self.current] = true;
        let n = self.hosts.len();
        let next = (1..=n)
            .map(|step| (self.current + step) % n)
            .find(|&i| !self.blacklist[i]);
        self.current = match next {
            Some(i) => i,
            None => {
                self.blacklist.fill(false);
                (self.current + 1) % n
            }
        };
        self.current()
    }
}
