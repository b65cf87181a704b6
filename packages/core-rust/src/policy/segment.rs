use crate::error::AssignmentError;
use crate::hash::{segment_of, SEGMENT_COUNT};
use crate::uri::DocumentUri;

use super::{AssignmentPolicy, AssignmentPolicyKind};

/// Placement through a fixed segment space.
///
/// The URI picks one of [`SEGMENT_COUNT`] segments and each forest owns a
/// contiguous run of segments. Adding a forest only moves run boundaries, so
/// far fewer documents change forest than with plain modulo hashing.
#[derive(Debug, Clone, Copy)]
pub struct SegmentPolicy {
    forest_count: usize,
}

impl SegmentPolicy {
    #[must_use]
    pub fn new(forest_count: usize) -> Self {
        Self { forest_count }
    }
}

impl AssignmentPolicy for SegmentPolicy {
    fn kind(&self) -> AssignmentPolicyKind {
        AssignmentPolicyKind::Segment
    }

    #[allow(clippy::cast_possible_truncation)] // result < forest_count
    fn placement_index(
        &self,
        uri: &DocumentUri,
        _partition: Option<&str>,
    ) -> Result<usize, AssignmentError> {
        if self.forest_count == 0 {
            return Err(AssignmentError::NoForests);
        }
        let segment = segment_of(uri.as_str());
        Ok((segment * self.forest_count as u64 / SEGMENT_COUNT) as usize)
    }
}
