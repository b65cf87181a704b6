//! Reads one split, failing over across the forest's replicas.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use contentpump_core::{DocumentUri, ForestId};
use tracing::{debug, error, info, warn};

use crate::config::InputConfig;
use crate::content::DocumentFormat;
use crate::error::{ConnectorError, RequestError};
use crate::input::ForestSplit;
use crate::retry::{ReplicaCursor, RetryPolicy};
use crate::session::{
    close_quietly, RangeQuery, ResultItem, ResultStream, Session, SessionFactory, SessionTarget,
    TransactionMode,
};
use crate::traits::RecordReader;

/// Value half of a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRecord {
    pub format: DocumentFormat,
    pub content: Bytes,
}

/// Streams the documents of one [`ForestSplit`].
///
/// A failed stream is reopened on the next replica, resuming right after the
/// last record handed out, so no record is returned twice. A split without
/// replicas cannot fail over and any failure ends the read.
pub struct ForestRecordReader {
    factory: Arc<dyn SessionFactory>,
    config: InputConfig,
    retry: RetryPolicy,
    split: Option<ForestSplit>,
    cursor: Option<ReplicaCursor>,
    session: Option<Box<dyn Session>>,
    stream: Option<Box<dyn ResultStream>>,
    key: Option<DocumentUri>,
    value: Option<DocumentRecord>,
    records_read: u64,
    failures: u32,
    failovers: u32,
    done: bool,
}

impl ForestRecordReader {
    #[must_use]
    pub fn new(factory: Arc<dyn SessionFactory>, config: InputConfig) -> Self {
        Self {
            factory,
            config,
            retry: RetryPolicy::reader(),
            split: None,
            cursor: None,
            session: None,
            stream: None,
            key: None,
            value: None,
            records_read: 0,
            failures: 0,
            failovers: 0,
            done: false,
        }
    }

    #[must_use]
    pub fn records_read(&self) -> u64 {
        self.records_read
    }

    /// Streams reopened on another replica so far.
    #[must_use]
    pub fn failovers(&self) -> u32 {
        self.failovers
    }

    /// Forest and host the next stream is opened on.
    fn current_target(&self, split: &ForestSplit) -> (ForestId, String) {
        match &self.cursor {
            Some(cursor) => {
                let replica = cursor.current();
                (replica.forest_id.clone(), replica.host.clone())
            }
            None => (split.forest_id.clone(), split.host.clone()),
        }
    }

    /// Opens a session on the current replica and starts the range query
    /// after the records already read.
    async fn connect(&mut self) -> Result<(), RequestError> {
        let Some(split) = self.split.as_ref() else {
            return Err(RequestError::permanent("no split to read"));
        };
        let (forest_id, host) = self.current_target(split);
        let query = RangeQuery {
            forest_id: forest_id.clone(),
            start: split.start + self.records_read,
            end: if split.is_last_split { None } else { split.end },
            query: self.config.query.clone(),
            redaction_rules: split.redaction_rules.clone(),
        };
        let target = SessionTarget::forest(host, self.config.port, forest_id);
        let mut session = self.factory.open(&target, TransactionMode::Auto).await?;
        match session.query_forest(&query).await {
            Ok(stream) => {
                debug!(session = %target, start = query.start, end = ?query.end, "range query started");
                self.session = Some(session);
                self.stream = Some(stream);
                Ok(())
            }
            Err(e) => {
                close_quietly(session.as_mut()).await;
                Err(e)
            }
        }
    }

    async fn release(&mut self) {
        self.stream = None;
        if let Some(mut session) = self.session.take() {
            close_quietly(session.as_mut()).await;
        }
    }

    /// Rotates to the next replica and reconnects until a stream opens or
    /// the retry budget is spent.
    async fn recover(&mut self, mut err: RequestError) -> Result<(), ConnectorError> {
        loop {
            let forest = self
                .split
                .as_ref()
                .map(|s| s.forest_id.to_string())
                .unwrap_or_default();
            if !err.is_retryable() {
                error!(forest = %forest, error = %err, "split read failed");
                self.release().await;
                return Err(ConnectorError::Request(err));
            }
            let Some(cursor) = self.cursor.as_mut() else {
                error!(forest = %forest, error = %err, "split read failed, no replica to fail over to");
                self.release().await;
                return Err(ConnectorError::Request(err));
            };
            self.failures += 1;
            if self.failures >= self.retry.max_attempts {
                error!(forest = %forest, attempts = self.failures, error = %err, "split read retries exhausted");
                self.release().await;
                return Err(ConnectorError::RetriesExhausted {
                    operation: "split read",
                    attempts: self.failures,
                    source: err,
                });
            }
            let next = cursor.advance().clone();
            self.release().await;
            let delay = self.retry.backoff(self.failures);
            warn!(
                forest = %forest,
                replica = %next.forest_id,
                host = %next.host,
                attempt = self.failures,
                backoff_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                resume_at = self.records_read + 1,
                error = %err,
                "split read failed, failing over"
            );
            tokio::time::sleep(delay).await;
            self.failovers += 1;
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(e) => err = e,
            }
        }
    }
}

#[async_trait]
impl RecordReader for ForestRecordReader {
    type Split = ForestSplit;
    type Key = DocumentUri;
    type Value = DocumentRecord;

    async fn initialize(&mut self, split: ForestSplit) -> Result<(), ConnectorError> {
        self.release().await;
        self.cursor = ReplicaCursor::new(split.replicas.clone(), &split.host);
        self.split = Some(split);
        self.key = None;
        self.value = None;
        self.records_read = 0;
        self.failures = 0;
        self.failovers = 0;
        self.done = false;
        if let Err(e) = self.connect().await {
            self.recover(e).await?;
        }
        Ok(())
    }

    async fn next_key_value(&mut self) -> Result<bool, ConnectorError> {
        loop {
            if self.done {
                return Ok(false);
            }
            let Some(stream) = self.stream.as_mut() else {
                return Err(ConnectorError::Closed);
            };
            let item = stream.next_item().await;
            match item {
                Ok(Some(ResultItem::Document {
                    uri,
                    format,
                    content,
                })) => {
                    self.records_read += 1;
                    self.failures = 0;
                    self.key = Some(uri);
                    self.value = Some(DocumentRecord { format, content });
                    return Ok(true);
                }
                Ok(Some(other)) => {
                    return Err(ConnectorError::Protocol(format!(
                        "expected document, found {}",
                        other.type_name()
                    )));
                }
                Ok(None) => {
                    self.done = true;
                    self.key = None;
                    self.value = None;
                    self.release().await;
                    if let Some(split) = &self.split {
                        info!(
                            forest = %split.forest_id,
                            start = split.start,
                            records = self.records_read,
                            failovers = self.failovers,
                            "split read"
                        );
                    }
                    return Ok(false);
                }
                Err(e) => self.recover(e).await?,
            }
        }
    }

    fn current_key(&self) -> Option<&DocumentUri> {
        self.key.as_ref()
    }

    fn current_value(&self) -> Option<&DocumentRecord> {
        self.value.as_ref()
    }

    #[allow(clippy::cast_precision_loss)]
    fn progress(&self) -> f32 {
        if self.done {
            return 1.0;
        }
        match self.split.as_ref().and_then(ForestSplit::length) {
            Some(len) if len > 0 => (self.records_read as f32 / len as f32).min(1.0),
            _ => 0.0,
        }
    }

    async fn close(&mut self) -> Result<(), ConnectorError> {
        self.release().await;
        self.done = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use contentpump_core::ReplicaInfo;
    use tokio::time::Instant;

    use super::*;
    use crate::config::{keys, Configuration};
    use crate::test_support::{Event, MemoryCluster};

    fn reader(cluster: &MemoryCluster) -> ForestRecordReader {
        let conf = Configuration::new().with(keys::INPUT_HOST, "hostA,hostB");
        ForestRecordReader::new(
            Arc::new(cluster.clone()),
            InputConfig::from_configuration(&conf).unwrap(),
        )
    }

    fn split(start: u64, end: Option<u64>, last: bool, replicas: Vec<ReplicaInfo>) -> ForestSplit {
        ForestSplit {
            forest_id: ForestId::new("f1"),
            host: "hostA".into(),
            start,
            end,
            is_last_split: last,
            replicas,
            redaction_rules: Vec::new(),
        }
    }

    fn replicated() -> Vec<ReplicaInfo> {
        vec![ReplicaInfo::new("f1", "hostA"), ReplicaInfo::new("f1r", "hostB")]
    }

    async fn read_all(reader: &mut ForestRecordReader) -> Result<Vec<String>, ConnectorError> {
        let mut uris = Vec::new();
        while reader.next_key_value().await? {
            uris.push(reader.current_key().unwrap().as_str().to_string());
        }
        Ok(uris)
    }

    fn range_queries(cluster: &MemoryCluster) -> Vec<(String, String, u64)> {
        cluster
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Event::RangeQuery { host, forest, start } => {
                    Some((host, forest.as_str().to_string(), start))
                }
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn reads_the_whole_last_split() {
        let cluster = MemoryCluster::new();
        cluster.load_forest("f1", 4);
        let mut reader = reader(&cluster);
        // The last split reads past its end: records added after planning.
        reader.initialize(split(1, Some(3), true, replicated())).await.unwrap();
        assert_eq!(reader.progress(), 0.0);

        let uris = read_all(&mut reader).await.unwrap();
        assert_eq!(uris, vec!["/f1/1", "/f1/2", "/f1/3", "/f1/4"]);
        assert_eq!(reader.progress(), 1.0);
        assert!(reader.current_key().is_none());
        reader.close().await.unwrap();
    }

    #[tokio::test]
    async fn bounded_split_stops_at_its_end() {
        let cluster = MemoryCluster::new();
        cluster.load_forest("f1", 10);
        let mut reader = reader(&cluster);
        reader.initialize(split(3, Some(6), false, Vec::new())).await.unwrap();

        assert!(reader.next_key_value().await.unwrap());
        assert_eq!(reader.current_key().map(DocumentUri::as_str), Some("/f1/3"));
        assert_eq!(
            reader.current_value().map(|v| v.format),
            Some(DocumentFormat::Xml)
        );
        assert!(reader.next_key_value().await.unwrap());
        assert_eq!(reader.progress(), 0.5);

        let rest = read_all(&mut reader).await.unwrap();
        assert_eq!(rest, vec!["/f1/5", "/f1/6"]);
        assert_eq!(reader.records_read(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn failover_resumes_after_last_record() {
        let cluster = MemoryCluster::new();
        cluster.load_forest("f1", 6);
        cluster.mirror_forest("f1", "f1r");
        cluster.fail_stream_after("hostA", 2);
        let mut reader = reader(&cluster);
        reader.initialize(split(1, Some(6), true, replicated())).await.unwrap();
        let started = Instant::now();

        let uris = read_all(&mut reader).await.unwrap();
        assert_eq!(uris, (1..=6).map(|i| format!("/f1/{i}")).collect::<Vec<_>>());
        assert_eq!(reader.failovers(), 1);
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert_eq!(
            range_queries(&cluster),
            vec![
                ("hostA".to_string(), "f1".to_string(), 1),
                ("hostB".to_string(), "f1r".to_string(), 3),
            ]
        );
        assert!(cluster.events().contains(&Event::Close("hostA".into())));
    }

    #[tokio::test(start_paused = true)]
    async fn failure_without_replicas_is_fatal() {
        let cluster = MemoryCluster::new();
        cluster.load_forest("f1", 3);
        cluster.fail_stream_after("hostA", 1);
        let mut reader = reader(&cluster);
        reader.initialize(split(1, None, true, Vec::new())).await.unwrap();

        assert!(reader.next_key_value().await.unwrap());
        let err = reader.next_key_value().await.unwrap_err();
        assert!(matches!(err, ConnectorError::Request(e) if e.is_retryable()));
        assert_eq!(range_queries(&cluster).len(), 1);
        assert_eq!(reader.failovers(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_replicas_exhaust_retries() {
        let cluster = MemoryCluster::new();
        cluster.set_host_down("hostA");
        cluster.set_host_down("hostB");
        let mut reader = reader(&cluster);
        let started = Instant::now();

        let err = reader
            .initialize(split(1, None, true, replicated()))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ConnectorError::RetriesExhausted { attempts: 15, .. }
        ));
        let hosts = cluster.attempted_hosts();
        assert_eq!(hosts.len(), 15);
        assert!(hosts.iter().step_by(2).all(|h| h == "hostA"));
        assert!(hosts.iter().skip(1).step_by(2).all(|h| h == "hostB"));
        // 0.5 + 1 + 2 + 4 + 8 + 16 seconds, then eight sleeps at the 30s cap.
        assert!(started.elapsed() >= Duration::from_millis(271_500));
    }

    #[tokio::test(start_paused = true)]
    async fn primary_down_at_start_fails_over_immediately() {
        let cluster = MemoryCluster::new();
        cluster.load_forest("f1", 2);
        cluster.mirror_forest("f1", "f1r");
        cluster.set_host_down("hostA");
        let mut reader = reader(&cluster);
        reader.initialize(split(1, Some(2), true, replicated())).await.unwrap();

        assert_eq!(read_all(&mut reader).await.unwrap(), vec!["/f1/1", "/f1/2"]);
        assert_eq!(cluster.opened_hosts(), vec!["hostB"]);
    }

    #[tokio::test]
    async fn reading_before_initialize_is_rejected() {
        let cluster = MemoryCluster::new();
        let mut reader = reader(&cluster);
        let err = reader.next_key_value().await.unwrap_err();
        assert!(matches!(err, ConnectorError::Closed));
    }
}
