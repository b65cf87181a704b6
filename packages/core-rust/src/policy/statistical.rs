use parking_lot::Mutex;

use crate::error::AssignmentError;
use crate::uri::DocumentUri;

use super::{AssignmentPolicy, AssignmentPolicyKind};

/// Least-loaded placement with speculative accounting.
///
/// Each placement picks the forest with the lowest load (lowest index on
/// ties) and immediately charges it a full batch, so writers that place
/// before their batches flush do not all pile onto the same forest. A failed
/// batch hands its charge back through [`rollback`](AssignmentPolicy::rollback).
#[derive(Debug)]
pub struct StatisticalPolicy {
    batch_size: u64,
    loads: Mutex<Vec<u64>>,
}

impl StatisticalPolicy {
    /// Seeds the load counters from server-reported document counts.
    #[must_use]
    pub fn new(doc_counts: Vec<u64>, batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1) as u64,
            loads: Mutex::new(doc_counts),
        }
    }

    /// Current load of one placement forest.
    #[must_use]
    pub fn load(&self, index: usize) -> Option<u64> {
        self.loads.lock().get(index).copied()
    }

    /// Snapshot of all load counters.
    #[must_use]
    pub fn loads(&self) -> Vec<u64> {
        self.loads.lock().clone()
    }
}

impl AssignmentPolicy for StatisticalPolicy {
    fn kind(&self) -> AssignmentPolicyKind {
        AssignmentPolicyKind::Statistical
    }

    fn placement_index(
        &self,
        _uri: &DocumentUri,
        _partition: Option<&str>,
    ) -> Result<usize, AssignmentError> {
        let mut loads = self.loads.lock();
        let (index, load) = loads
            .iter_mut()
            .enumerate()
            .min_by_key(|(i, load)| (**load, *i))
            .ok_or(AssignmentError::NoForests)?;
        *load += self.batch_size;
        Ok(index)
    }

    fn rollback(&self, index: usize, count: u64) {
        if let Some(load) = self.loads.lock().get_mut(index) {
            *load = load.saturating_sub(count);
        }
    }
}
