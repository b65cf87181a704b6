//! Split planning: forest record counts to balanced, range-bounded splits.

use std::collections::VecDeque;

use contentpump_core::{ForestId, ReplicaInfo};
use serde::{Deserialize, Serialize};

/// A range of one forest's records read by one task.
///
/// `start` is 1-based and `end` inclusive; the last split of a forest reads
/// to the end of the forest whatever its `end` says, since records may have
/// been added after the count was taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForestSplit {
    pub forest_id: ForestId,
    pub host: String,
    pub start: u64,
    /// `None` when the forest's record count was unknown.
    pub end: Option<u64>,
    pub is_last_split: bool,
    /// Failover targets, primary included; empty when there are none.
    pub replicas: Vec<ReplicaInfo>,
    pub redaction_rules: Vec<String>,
}

impl ForestSplit {
    /// Number of records in the range, if bounded.
    #[must_use]
    pub fn length(&self) -> Option<u64> {
        self.end.map(|end| (end + 1).saturating_sub(self.start))
    }
}

/// One `(forest, record count, host)` triple of the split query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForestRecordCount {
    pub forest_id: ForestId,
    pub host: String,
    /// Estimated records; zero or negative when unknown.
    pub record_count: i64,
    pub replicas: Vec<ReplicaInfo>,
}

/// Cuts one forest into chunks of at most `max_split_size` records.
///
/// A forest with an unknown count becomes one unbounded last split.
#[must_use]
pub fn split_forest(forest: &ForestRecordCount, max_split_size: u64) -> Vec<ForestSplit> {
    let split = |start: u64, end: Option<u64>, is_last_split: bool| ForestSplit {
        forest_id: forest.forest_id.clone(),
        host: forest.host.clone(),
        start,
        end,
        is_last_split,
        replicas: forest.replicas.clone(),
        redaction_rules: Vec::new(),
    };
    let Ok(count) = u64::try_from(forest.record_count) else {
        return vec![split(1, None, true)];
    };
    if count == 0 {
        return vec![split(1, None, true)];
    }
    let size = max_split_size.max(1);
    let chunks = count.div_ceil(size);
    (0..chunks)
        .map(|i| {
            let start = i * size + 1;
            let end = ((i + 1) * size).min(count);
            split(start, Some(end), i + 1 == chunks)
        })
        .collect()
}

/// Groups items by key, groups ordered by first appearance.
fn group_by<T, K: PartialEq>(items: impl IntoIterator<Item = T>, key: impl Fn(&T) -> K) -> Vec<Vec<T>> {
    let mut keys: Vec<K> = Vec::new();
    let mut groups: Vec<Vec<T>> = Vec::new();
    for item in items {
        let k = key(&item);
        match keys.iter().position(|existing| *existing == k) {
            Some(i) => groups[i].push(item),
            None => {
                keys.push(k);
                groups.push(vec![item]);
            }
        }
    }
    groups
}

/// Takes one item from each group in turn until all are drained.
fn round_robin<T>(groups: Vec<Vec<T>>) -> Vec<T> {
    let total = groups.iter().map(Vec::len).sum();
    let mut queues: Vec<VecDeque<T>> = groups.into_iter().map(VecDeque::from).collect();
    let mut out = Vec::with_capacity(total);
    while out.len() < total {
        for queue in &mut queues {
            if let Some(item) = queue.pop_front() {
                out.push(item);
            }
        }
    }
    out
}

/// Orders per-forest split lists for consumption.
///
/// Forests sharing a host are interleaved, then the hosts are interleaved,
/// so a task pool smaller than the split count spreads over every host
/// instead of draining one forest after another.
#[must_use]
pub fn interleave_splits(per_forest: Vec<Vec<ForestSplit>>) -> Vec<ForestSplit> {
    let by_host = group_by(
        per_forest.into_iter().filter(|splits| !splits.is_empty()),
        |splits| splits[0].host.clone(),
    );
    round_robin(by_host.into_iter().map(round_robin).collect())
}

/// Plans the splits of a whole job.
#[must_use]
pub fn plan_splits(
    forests: &[ForestRecordCount],
    max_split_size: u64,
    redaction_rules: &[String],
) -> Vec<ForestSplit> {
    let per_forest = forests
        .iter()
        .map(|f| {
            let mut splits = split_forest(f, max_split_size);
            for split in &mut splits {
                split.redaction_rules = redaction_rules.to_vec();
            }
            splits
        })
        .collect();
    interleave_splits(per_forest)
}
