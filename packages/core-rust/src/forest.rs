//! Forest topology: which host serves which forest, and where its replicas live.
//!
//! Discovered once per job from the server and immutable afterwards. The only
//! per-forest state that changes during a job is the statistical load
//! counter, which lives in the assignment policy, not here.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque forest identifier.
///
/// Servers report forest ids as unsigned 64-bit integers; older APIs report
/// them as strings. Both are kept as decimal text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ForestId(String);

impl ForestId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ForestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ForestId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<u64> for ForestId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

/// An alternate `(forest, host)` pair able to serve a forest's data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaInfo {
    pub forest_id: ForestId,
    pub host: String,
}

impl ReplicaInfo {
    #[must_use]
    pub fn new(forest_id: impl Into<ForestId>, host: impl Into<String>) -> Self {
        Self {
            forest_id: forest_id.into(),
            host: host.into(),
        }
    }
}

/// One backend storage shard.
///
/// `replicas` lists every copy that can serve the forest, the primary
/// included, in failover order. An empty list means no failover is possible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForestInfo {
    pub id: ForestId,
    pub host: String,
    pub updatable: bool,
    #[serde(default)]
    pub replicas: Vec<ReplicaInfo>,
    #[serde(default)]
    pub doc_count: u64,
}

impl ForestInfo {
    /// An updatable forest with no replicas and no load statistics.
    #[must_use]
    pub fn new(id: impl Into<ForestId>, host: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            updatable: true,
            replicas: Vec::new(),
            doc_count: 0,
        }
    }

    #[must_use]
    pub fn with_replicas(mut self, replicas: Vec<ReplicaInfo>) -> Self {
        self.replicas = replicas;
        self
    }

    #[must_use]
    pub fn with_doc_count(mut self, doc_count: u64) -> Self {
        self.doc_count = doc_count;
        self
    }

    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.updatable = false;
        self
    }
}

/// Ordered set of forests attached to the target database.
///
/// Deserializing rebuilds the id index, so a topology handed to a task
/// process answers lookups like the one it was serialized from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ForestList")]
pub struct ForestTopology {
    forests: Vec<ForestInfo>,
    #[serde(skip)]
    by_id: HashMap<ForestId, usize>,
}

#[derive(Deserialize)]
struct ForestList {
    forests: Vec<ForestInfo>,
}

impl From<ForestList> for ForestTopology {
    fn from(list: ForestList) -> Self {
        Self::new(list.forests)
    }
}

impl ForestTopology {
    #[must_use]
    pub fn new(forests: Vec<ForestInfo>) -> Self {
        let by_id = forests
            .iter()
            .enumerate()
            .map(|(i, f)| (f.id.clone(), i))
            .collect();
        Self { forests, by_id }
    }

    #[must_use]
    pub fn forests(&self) -> &[ForestInfo] {
        &self.forests
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.forests.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.forests.is_empty()
    }

    #[must_use]
    pub fn get(&self, id: &ForestId) -> Option<&ForestInfo> {
        self.index_of(id).map(|i| &self.forests[i])
    }

    #[must_use]
    pub fn index_of(&self, id: &ForestId) -> Option<usize> {
        self.by_id.get(id).copied()
    }

    /// Indices of forests that accept new documents, in topology order.
    #[must_use]
    pub fn updatable_indices(&self) -> Vec<usize> {
        self.forests
            .iter()
            .enumerate()
            .filter(|(_, f)| f.updatable)
            .map(|(i, _)| i)
            .collect()
    }

    /// Distinct primary hosts in order of first appearance.
    #[must_use]
    pub fn hosts(&self) -> Vec<&str> {
        let mut hosts: Vec<&str> = Vec::new();
        for forest in &self.forests {
            if !hosts.contains(&forest.host.as_str()) {
                hosts.push(&forest.host);
            }
        }
        hosts
    }

    /// Rewrites hosts for a client confined to `allowed_hosts`.
    ///
    /// Forests are spread over the allowlist round robin and every allowed
    /// host becomes a failover target, since any host can route a request
    /// to any forest. An empty allowlist leaves the topology unchanged.
    #[must_use]
    pub fn restrict_to_hosts(&self, allowed_hosts: &[String]) -> Self {
        if allowed_hosts.is_empty() {
            return self.clone();
        }
        let forests = self
            .forests
            .iter()
            .enumerate()
            .map(|(i, f)| {
                let host = allowed_hosts[i % allowed_hosts.len()].clone();
                let replicas = rotate_from(allowed_hosts, i % allowed_hosts.len())
                    .map(|h| ReplicaInfo::new(f.id.clone(), h.clone()))
                    .collect();
                ForestInfo {
                    host,
                    replicas,
                    ..f.clone()
                }
            })
            .collect();
        Self::new(forests)
    }
}

fn rotate_from<T>(items: &[T], start: usize) -> impl Iterator<Item = &T> {
    items.iter().cycle().skip(start).take(items.len())
}
