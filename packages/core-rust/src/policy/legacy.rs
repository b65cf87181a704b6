use crate::error::AssignmentError;
use crate::hash::legacy_placement;
use crate::uri::DocumentUri;

use super::{AssignmentPolicy, AssignmentPolicyKind};

/// Hash placement matching the server's own legacy algorithm.
#[derive(Debug, Clone, Copy)]
pub struct LegacyPolicy {
    forest_count: usize,
}

impl LegacyPolicy {
    #[must_use]
    pub fn new(forest_count: usize) -> Self {
        Self { forest_count }
    }
}

impl AssignmentPolicy for LegacyPolicy {
    fn kind(&self) -> AssignmentPolicyKind {
        AssignmentPolicyKind::Legacy
    }

    fn placement_index(
        &self,
        uri: &DocumentUri,
        _partition: Option<&str>,
    ) -> Result<usize, AssignmentError> {
        legacy_placement(uri.as_str(), self.forest_count).ok_or(AssignmentError::NoForests)
    }
}
