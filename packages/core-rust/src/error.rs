//! Errors raised while mapping documents onto forests.

use crate::forest::ForestId;
use crate::policy::AssignmentPolicyKind;

/// Placement failure.
///
/// Every variant is a setup or contract problem: retrying the same placement
/// cannot succeed, so callers abort the job rather than the document.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AssignmentError {
    #[error("no updatable forests are attached to the target database")]
    NoForests,
    #[error("unknown assignment policy: {0}")]
    UnknownPolicy(String),
    #[error("assignment policy {policy} requires an output partition")]
    MissingPartition { policy: AssignmentPolicyKind },
    #[error("partition {0} has not been resolved")]
    PartitionNotResolved(String),
    #[error("partition {0} has no updatable forests")]
    EmptyPartition(String),
    #[error("forest {0} is not an updatable forest of this job")]
    UnknownForest(ForestId),
}
