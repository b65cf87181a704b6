//! Assignment policies: document URI to placement-forest index.
//!
//! Every policy decides which of the `n` updatable forests of a job
//! receives a document, answering with an index in `[0, n)` into the
//! manager's placement array:
//!
//! - [`LegacyPolicy`]: URI hash modulo `n`, bit-compatible with the server
//! - [`BucketPolicy`]: round robin, advancing once per batch
//! - [`SegmentPolicy`]: URI hash into fixed segments, segments in contiguous runs
//! - [`PartitionedPolicy`]: RANGE and QUERY; server-computed partition forests
//!   rotated bucket-style
//! - [`StatisticalPolicy`]: least-loaded forest with speculative accounting

mod bucket;
mod legacy;
mod partitioned;
mod segment;
mod statistical;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AssignmentError;
use crate::uri::DocumentUri;

pub use bucket::BucketPolicy;
pub use legacy::LegacyPolicy;
pub use partitioned::{PartitionCache, PartitionForests, PartitionedPolicy, DEFAULT_PARTITION};
pub use segment::SegmentPolicy;
pub use statistical::StatisticalPolicy;

/// Names the placement algorithm in force for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentPolicyKind {
    Legacy,
    Bucket,
    Range,
    Query,
    Statistical,
    Segment,
}

impl AssignmentPolicyKind {
    /// Whether placement needs a partition name to resolve.
    #[must_use]
    pub fn is_partitioned(self) -> bool {
        matches!(self, Self::Range | Self::Query)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Legacy => "legacy",
            Self::Bucket => "bucket",
            Self::Range => "range",
            Self::Query => "query",
            Self::Statistical => "statistical",
            Self::Segment => "segment",
        }
    }
}

impl fmt::Display for AssignmentPolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssignmentPolicyKind {
    type Err = AssignmentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "legacy" => Ok(Self::Legacy),
            "bucket" => Ok(Self::Bucket),
            "range" => Ok(Self::Range),
            "query" => Ok(Self::Query),
            "statistical" => Ok(Self::Statistical),
            "segment" => Ok(Self::Segment),
            _ => Err(AssignmentError::UnknownPolicy(s.to_string())),
        }
    }
}

/// Maps a document to a placement-forest index.
///
/// Implementations are shared by every writer of a job, so any mutable
/// state they keep must be safe under concurrent placement.
pub trait AssignmentPolicy: Send + Sync + fmt::Debug {
    fn kind(&self) -> AssignmentPolicyKind;

    /// Picks the placement index for `uri`.
    ///
    /// `partition` selects the partition for RANGE and QUERY placement and is
    /// ignored by the other policies.
    ///
    /// # Errors
    ///
    /// Partitioned policies fail when no partition is given or the partition
    /// has not been resolved yet.
    fn placement_index(
        &self,
        uri: &DocumentUri,
        partition: Option<&str>,
    ) -> Result<usize, AssignmentError>;

    /// Reverts a speculative placement of `count` documents on `index`.
    fn rollback(&self, _index: usize, _count: u64) {}

    /// Partition cache of RANGE and QUERY policies.
    fn partitions(&self) -> Option<&PartitionCache> {
        None
    }

    /// Partition used when placement names none.
    fn default_partition(&self) -> Option<&str> {
        None
    }
}
