//! Input format: split generation and per-task reader construction.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::InputConfig;
use crate::error::ConnectorError;
use crate::input::split::{plan_splits, ForestRecordCount, ForestSplit};
use crate::input::ForestRecordReader;
use crate::protocol::{ItemCursor, REDACTION_MARKER, REPLICA_MARKER};
use crate::session::{query_first_reachable, Query, ResultItem, SessionFactory};
use crate::topology::parse_replica_groups;
use crate::traits::{InputFormat, JobContext, TaskContext};

/// Answers the split stream:
///
/// 1. the resolved redaction rule URIs followed by `REDACT`, only when
///    `$redaction-rules` is non-empty
/// 2. `(forest, record count, host)` per forest
/// 3. optionally `REPLICA` and `(forest, n, n * (replica forest, host))` groups
pub const SPLIT_QUERY: &str = r#"xquery version "1.0-ml";
import module namespace hadoop = "http://marklogic.com/xdmp/hadoop" at "/MarkLogic/hadoop.xqy";
declare variable $redaction-rules as xs:string external;
hadoop:get-splits(fn:tokenize($redaction-rules, ","))"#;

/// The decoded split stream.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitStream {
    pub redaction_rules: Vec<String>,
    pub forests: Vec<ForestRecordCount>,
}

/// Decodes the answer of [`SPLIT_QUERY`].
///
/// # Errors
///
/// [`ConnectorError::Protocol`] for items of the wrong type, a missing
/// redaction marker, or replicas naming a forest absent from the stream.
pub fn parse_split_stream(
    items: &[ResultItem],
    expect_redaction: bool,
) -> Result<SplitStream, ConnectorError> {
    let mut cursor = ItemCursor::new(items);
    let mut stream = SplitStream::default();

    if expect_redaction {
        while !cursor.eat_marker(REDACTION_MARKER) {
            stream
                .redaction_rules
                .push(cursor.next_string("redaction rule")?.to_string());
        }
    }

    while !cursor.is_done() && !cursor.eat_marker(REPLICA_MARKER) {
        let forest_id = cursor.next_forest_id()?;
        let record_count = cursor.next_integer("record count")?;
        let host = cursor.next_string("forest host")?;
        stream.forests.push(ForestRecordCount {
            forest_id,
            host: host.to_string(),
            record_count,
            replicas: Vec::new(),
        });
    }

    for (id, replicas) in parse_replica_groups(&mut cursor)? {
        let forest = stream
            .forests
            .iter_mut()
            .find(|f| f.forest_id == id)
            .ok_or_else(|| ConnectorError::Protocol(format!("replicas for unknown forest {id}")))?;
        forest.replicas = replicas;
    }
    Ok(stream)
}

/// Sends every forest through the allowed input hosts, round robin.
///
/// Replica `j` of forest `i` is served by host `i + j`, so failover still
/// moves to a different host when more than one is allowed.
fn restrict_to_input_hosts(forests: &mut [ForestRecordCount], hosts: &[String]) {
    if hosts.is_empty() {
        return;
    }
    for (i, forest) in forests.iter_mut().enumerate() {
        forest.host = hosts[i % hosts.len()].clone();
        for (j, replica) in forest.replicas.iter_mut().enumerate() {
            replica.host = hosts[(i + j) % hosts.len()].clone();
        }
    }
}

/// Reads documents out of the database, one forest range per split.
pub struct ContentInputFormat {
    factory: Arc<dyn SessionFactory>,
}

impl ContentInputFormat {
    #[must_use]
    pub fn new(factory: Arc<dyn SessionFactory>) -> Self {
        Self { factory }
    }
}

#[async_trait]
impl InputFormat for ContentInputFormat {
    type Split = ForestSplit;
    type Reader = ForestRecordReader;

    async fn get_splits(&self, job: &JobContext) -> Result<Vec<ForestSplit>, ConnectorError> {
        let config = InputConfig::from_configuration(&job.configuration)?;
        let query = Query::new(SPLIT_QUERY)
            .with_variable("redaction-rules", config.redaction_rules.join(","));
        let items =
            query_first_reachable(self.factory.as_ref(), &config.hosts, config.port, &query)
                .await?;
        let stream = parse_split_stream(&items, !config.redaction_rules.is_empty())?;
        debug!(
            forests = stream.forests.len(),
            redaction_rules = stream.redaction_rules.len(),
            "decoded split stream"
        );

        let mut forests = stream.forests;
        if config.restrict_hosts {
            restrict_to_input_hosts(&mut forests, &config.hosts);
        }

        let estimated: u64 = forests
            .iter()
            .filter_map(|f| u64::try_from(f.record_count).ok())
            .sum();
        job.counters.add_estimated_input_records(estimated);

        let splits = plan_splits(&forests, config.max_split_size, &stream.redaction_rules);
        info!(
            forests = forests.len(),
            splits = splits.len(),
            estimated_records = estimated,
            max_split_size = config.max_split_size,
            "splits generated"
        );
        Ok(splits)
    }

    fn create_record_reader(&self, task: &TaskContext) -> Result<ForestRecordReader, ConnectorError> {
        let config = InputConfig::from_configuration(&task.job.configuration)?;
        Ok(ForestRecordReader::new(Arc::clone(&self.factory), config))
    }
}
