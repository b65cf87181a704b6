use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::AssignmentError;
use crate::uri::DocumentUri;

use super::{AssignmentPolicy, AssignmentPolicyKind};

/// Round-robin placement that moves to the next forest once per batch.
///
/// Consecutive placements stay on one forest for `batch_size` documents so a
/// writer fills whole batches instead of scattering partial ones.
#[derive(Debug)]
pub struct BucketPolicy {
    forest_count: usize,
    batch_size: u64,
    placed: AtomicU64,
}

impl BucketPolicy {
    #[must_use]
    pub fn new(forest_count: usize, batch_size: usize) -> Self {
        Self {
            forest_count,
            batch_size: batch_size.max(1) as u64,
            placed: AtomicU64::new(0),
        }
    }
}

/// Index of the `n`-th placement when rotating over `forest_count` forests
/// in steps of `batch_size`.
#[allow(clippy::cast_possible_truncation)] // result < forest_count
pub(crate) fn rotate(n: u64, batch_size: u64, forest_count: usize) -> usize {
    ((n / batch_size) % forest_count as u64) as usize
}

impl AssignmentPolicy for BucketPolicy {
    fn kind(&self) -> AssignmentPolicyKind {
        AssignmentPolicyKind::Bucket
    }

    fn placement_index(
        &self,
        _uri: &DocumentUri,
        _partition: Option<&str>,
    ) -> Result<usize, AssignmentError> {
        if self.forest_count == 0 {
            return Err(AssignmentError::NoForests);
        }
        let n = self.placed.fetch_add(1, Ordering::Relaxed);
        Ok(rotate(n, self.batch_size, self.forest_count))
    }
}
