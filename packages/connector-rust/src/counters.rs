//! Job counters reported back to the framework.
//!
//! Each counter is kept in an atomic for the job's own summary and mirrored
//! to the process-wide `metrics` recorder, if one is installed.

use std::sync::atomic::{AtomicU64, Ordering};

pub const ESTIMATED_INPUT_RECORDS: &str = "contentpump_estimated_input_records";
pub const OUTPUT_RECORDS_COMMITTED: &str = "contentpump_output_records_committed";
pub const OUTPUT_RECORDS_FAILED: &str = "contentpump_output_records_failed";

#[derive(Debug, Default)]
pub struct JobCounters {
    estimated_input_records: AtomicU64,
    output_records_committed: AtomicU64,
    output_records_failed: AtomicU64,
}

/// Point-in-time copy of [`JobCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub estimated_input_records: u64,
    pub output_records_committed: u64,
    pub output_records_failed: u64,
}

impl JobCounters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_estimated_input_records(&self, n: u64) {
        self.estimated_input_records.fetch_add(n, Ordering::Relaxed);
        metrics::counter!(ESTIMATED_INPUT_RECORDS).increment(n);
    }

    pub fn add_committed(&self, n: u64) {
        self.output_records_committed.fetch_add(n, Ordering::Relaxed);
        metrics::counter!(OUTPUT_RECORDS_COMMITTED).increment(n);
    }

    pub fn add_failed(&self, n: u64) {
        self.output_records_failed.fetch_add(n, Ordering::Relaxed);
        metrics::counter!(OUTPUT_RECORDS_FAILED).increment(n);
    }

    #[must_use]
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            estimated_input_records: self.estimated_input_records.load(Ordering::Relaxed),
            output_records_committed: self.output_records_committed.load(Ordering::Relaxed),
            output_records_failed: self.output_records_failed.load(Ordering::Relaxed),
        }
    }
}
