//! The per-job assignment context shared by every writer and reader.
//!
//! [`AssignmentManager`] is built once from the discovered topology and
//! passed around explicitly (usually as `Arc<AssignmentManager>`). After
//! construction it is read-only apart from the policy's own counters.

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::AssignmentError;
use crate::forest::{ForestId, ForestInfo, ForestTopology};
use crate::policy::{
    AssignmentPolicy, AssignmentPolicyKind, BucketPolicy, LegacyPolicy, PartitionForests,
    PartitionedPolicy, SegmentPolicy, StatisticalPolicy,
};
use crate::uri::DocumentUri;

/// Forest lookup and document placement for one job.
///
/// Placement indices returned by this type index the *placement array*: the
/// updatable forests of the topology, in topology order.
#[derive(Debug)]
pub struct AssignmentManager {
    topology: ForestTopology,
    placement: Vec<usize>,
    policy: Box<dyn AssignmentPolicy>,
    batch_size: usize,
}

impl AssignmentManager {
    /// Builds the placement array and the policy.
    ///
    /// `partition` names the output partition for RANGE and QUERY placement.
    ///
    /// # Errors
    ///
    /// - [`AssignmentError::NoForests`] when no updatable forest is attached
    /// - [`AssignmentError::MissingPartition`] for RANGE without a partition
    pub fn initialize(
        kind: AssignmentPolicyKind,
        topology: ForestTopology,
        batch_size: usize,
        partition: Option<String>,
    ) -> Result<Self, AssignmentError> {
        let placement = topology.updatable_indices();
        if placement.is_empty() {
            return Err(AssignmentError::NoForests);
        }
        let n = placement.len();
        let policy: Box<dyn AssignmentPolicy> = match kind {
            AssignmentPolicyKind::Legacy => Box::new(LegacyPolicy::new(n)),
            AssignmentPolicyKind::Bucket => Box::new(BucketPolicy::new(n, batch_size)),
            AssignmentPolicyKind::Segment => Box::new(SegmentPolicy::new(n)),
            AssignmentPolicyKind::Range | AssignmentPolicyKind::Query => {
                Box::new(PartitionedPolicy::new(kind, batch_size, partition)?)
            }
            AssignmentPolicyKind::Statistical => {
                let counts = placement
                    .iter()
                    .map(|&i| topology.forests()[i].doc_count)
                    .collect();
                Box::new(StatisticalPolicy::new(counts, batch_size))
            }
        };
        info!(
            policy = %kind,
            forests = topology.len(),
            placement_forests = n,
            batch_size,
            "assignment manager initialized"
        );
        Ok(Self {
            topology,
            placement,
            policy,
            batch_size,
        })
    }

    /// Convenience wrapper returning the manager behind an `Arc`.
    ///
    /// # Errors
    ///
    /// See [`initialize`](Self::initialize).
    pub fn shared(
        kind: AssignmentPolicyKind,
        topology: ForestTopology,
        batch_size: usize,
        partition: Option<String>,
    ) -> Result<Arc<Self>, AssignmentError> {
        Self::initialize(kind, topology, batch_size, partition).map(Arc::new)
    }

    #[must_use]
    pub fn policy_kind(&self) -> AssignmentPolicyKind {
        self.policy.kind()
    }

    #[must_use]
    pub fn topology(&self) -> &ForestTopology {
        &self.topology
    }

    #[must_use]
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Number of placement forests.
    #[must_use]
    pub fn forest_count(&self) -> usize {
        self.placement.len()
    }

    /// The forest behind a placement index.
    #[must_use]
    pub fn forest(&self, index: usize) -> Option<&ForestInfo> {
        self.placement
            .get(index)
            .map(|&i| &self.topology.forests()[i])
    }

    /// Placement index of a forest id, if the forest is updatable.
    #[must_use]
    pub fn placement_index_of(&self, id: &ForestId) -> Option<usize> {
        let topo_idx = self.topology.index_of(id)?;
        self.placement.iter().position(|&i| i == topo_idx)
    }

    /// Placement index for a document under the job's policy.
    ///
    /// # Errors
    ///
    /// Partitioned policies fail until the default partition is cached.
    pub fn placement_forest_index(&self, uri: &DocumentUri) -> Result<usize, AssignmentError> {
        self.placement_in_partition(uri, None)
    }

    /// Placement index for a document in a named partition.
    ///
    /// # Errors
    ///
    /// See [`AssignmentPolicy::placement_index`].
    pub fn placement_in_partition(
        &self,
        uri: &DocumentUri,
        partition: Option<&str>,
    ) -> Result<usize, AssignmentError> {
        let index = self.policy.placement_index(uri, partition)?;
        debug!(uri = %uri, index, "placed document");
        Ok(index)
    }

    /// Reverts a speculative placement. Only STATISTICAL keeps state to revert.
    pub fn rollback(&self, index: usize, count: u64) {
        self.policy.rollback(index, count);
    }

    /// The partition RANGE/QUERY placement falls back to.
    #[must_use]
    pub fn default_partition(&self) -> Option<&str> {
        self.policy.default_partition()
    }

    /// Whether a partition's forests are already known client-side.
    #[must_use]
    pub fn is_partition_cached(&self, name: &str) -> bool {
        self.policy
            .partitions()
            .is_some_and(|cache| cache.contains(name))
    }

    /// Caches the server-computed forests of a partition.
    ///
    /// Read-only forests reported by the server are skipped, since they can
    /// never receive documents.
    ///
    /// # Errors
    ///
    /// Returns [`AssignmentError::UnknownForest`] when the server names a
    /// forest that is not part of this job's topology.
    pub fn cache_partition(
        &self,
        name: &str,
        forest_ids: &[ForestId],
    ) -> Result<Option<Arc<PartitionForests>>, AssignmentError> {
        let Some(cache) = self.policy.partitions() else {
            return Ok(None);
        };
        let mut forests = Vec::with_capacity(forest_ids.len());
        for id in forest_ids {
            match self.placement_index_of(id) {
                Some(idx) => forests.push(idx),
                None if self.topology.get(id).is_some() => {}
                None => return Err(AssignmentError::UnknownForest(id.clone())),
            }
        }
        debug!(partition = name, forests = ?forests, "cached partition forests");
        Ok(Some(cache.insert(name, forests)))
    }
}
