use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::AssignmentError;
use crate::uri::DocumentUri;

use super::bucket::rotate;
use super::{AssignmentPolicy, AssignmentPolicyKind};

/// Partition used by QUERY placement when the job names none.
pub const DEFAULT_PARTITION: &str = "default";

/// Placement forests of one partition, with its own rotation cursor.
#[derive(Debug)]
pub struct PartitionForests {
    forests: Vec<usize>,
    placed: AtomicU64,
}

impl PartitionForests {
    #[must_use]
    pub fn new(forests: Vec<usize>) -> Self {
        Self {
            forests,
            placed: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn forests(&self) -> &[usize] {
        &self.forests
    }
}

/// Client-side cache of server-computed partition → forest lists.
///
/// Populated lazily: the first writer that needs a partition asks the server
/// and caches the answer; everyone after that reads the cache.
#[derive(Debug, Default)]
pub struct PartitionCache {
    partitions: DashMap<String, Arc<PartitionForests>>,
}

impl PartitionCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<PartitionForests>> {
        self.partitions.get(name).map(|entry| Arc::clone(entry.value()))
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.partitions.contains_key(name)
    }

    /// Caches `forests` for `name`. A partition already cached keeps its
    /// entry (and its rotation cursor).
    pub fn insert(&self, name: &str, forests: Vec<usize>) -> Arc<PartitionForests> {
        let entry = self
            .partitions
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(PartitionForests::new(forests)));
        Arc::clone(entry.value())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}

/// RANGE and QUERY placement.
///
/// The server decides which forests make up a partition; this policy only
/// resolves the partition name and rotates bucket-style within its forests.
#[derive(Debug)]
pub struct PartitionedPolicy {
    kind: AssignmentPolicyKind,
    batch_size: u64,
    default_partition: Option<String>,
    cache: PartitionCache,
}

impl PartitionedPolicy {
    /// Creates a partitioned policy.
    ///
    /// QUERY placement falls back to [`DEFAULT_PARTITION`]; RANGE placement
    /// has no fallback and needs `default_partition`.
    ///
    /// # Errors
    ///
    /// Returns [`AssignmentError::MissingPartition`] for RANGE without a
    /// partition name.
    pub fn new(
        kind: AssignmentPolicyKind,
        batch_size: usize,
        default_partition: Option<String>,
    ) -> Result<Self, AssignmentError> {
        let default_partition = match (kind, default_partition) {
            (_, Some(name)) => Some(name),
            (AssignmentPolicyKind::Query, None) => Some(DEFAULT_PARTITION.to_string()),
            (AssignmentPolicyKind::Range, None) => {
                return Err(AssignmentError::MissingPartition { policy: kind })
            }
            (_, None) => None,
        };
        Ok(Self {
            kind,
            batch_size: batch_size.max(1) as u64,
            default_partition,
            cache: PartitionCache::new(),
        })
    }
}

impl AssignmentPolicy for PartitionedPolicy {
    fn kind(&self) -> AssignmentPolicyKind {
        self.kind
    }

    fn placement_index(
        &self,
        _uri: &DocumentUri,
        partition: Option<&str>,
    ) -> Result<usize, AssignmentError> {
        let name = partition
            .or(self.default_partition.as_deref())
            .ok_or(AssignmentError::MissingPartition { policy: self.kind })?;
        let entry = self
            .cache
            .get(name)
            .ok_or_else(|| AssignmentError::PartitionNotResolved(name.to_string()))?;
        if entry.forests.is_empty() {
            return Err(AssignmentError::EmptyPartition(name.to_string()));
        }
        let n = entry.placed.fetch_add(1, Ordering::Relaxed);
        Ok(entry.forests[rotate(n, self.batch_size, entry.forests.len())])
    }

    fn partitions(&self) -> Option<&PartitionCache> {
        Some(&self.cache)
    }

    fn default_partition(&self) -> Option<&str> {
        self.default_partition.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_requires_a_partition() {
        let err = PartitionedPolicy::new(AssignmentPolicyKind::Range, 10, None).unwrap_err();
        assert_eq!(
            err,
            AssignmentError::MissingPartition {
                policy: AssignmentPolicyKind::Range
            }
        );
    }

    #[test]
    fn query_defaults_to_default_partition() {
        let policy = PartitionedPolicy::new(AssignmentPolicyKind::Query, 10, None).unwrap();
        assert_eq!(policy.default_partition(), Some(DEFAULT_PARTITION));
    }

    #[test]
    fn unresolved_partition_is_reported() {
        let policy =
            PartitionedPolicy::new(AssignmentPolicyKind::Range, 1, Some("2024".into())).unwrap();
        assert_eq!(
            policy.placement_index(&"/a".into(), None),
            Err(AssignmentError::PartitionNotResolved("2024".into()))
        );
    }

    #[test]
    fn rotates_within_partition_per_batch() {
        let policy =
            PartitionedPolicy::new(AssignmentPolicyKind::Range, 2, Some("2024".into())).unwrap();
        policy.cache.insert("2024", vec![3, 5]);
        let seq: Vec<usize> = (0..6)
            .map(|_| policy.placement_index(&"/a".into(), None).unwrap())
            .collect();
        assert_eq!(seq, vec![3, 3, 5, 5, 3, 3]);
    }

    #[test]
    fn explicit_partition_overrides_default() {
        let policy = PartitionedPolicy::new(AssignmentPolicyKind::Query, 1, None).unwrap();
        policy.cache.insert(DEFAULT_PARTITION, vec![0]);
        policy.cache.insert("hot", vec![4]);
        assert_eq!(policy.placement_index(&"/a".into(), Some("hot")), Ok(4));
        assert_eq!(policy.placement_index(&"/a".into(), None), Ok(0));
    }

    #[test]
    fn empty_partition_is_reported() {
        let policy = PartitionedPolicy::new(AssignmentPolicyKind::Query, 1, None).unwrap();
        policy.cache.insert(DEFAULT_PARTITION, Vec::new());
        assert_eq!(
            policy.placement_index(&"/a".into(), None),
            Err(AssignmentError::EmptyPartition(DEFAULT_PARTITION.into()))
        );
    }

    #[test]
    fn cache_keeps_first_entry() {
        let cache = PartitionCache::new();
        cache.insert("p", vec![1]);
        cache.insert("p", vec![2]);
        assert_eq!(cache.get("p").unwrap().forests(), &[1]);
        assert_eq!(cache.len(), 1);
    }
}
