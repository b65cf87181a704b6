//! In-memory cluster implementing the session traits, with failure injection.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use contentpump_core::{DocumentUri, ForestId};
use parking_lot::Mutex;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

use crate::content::{Content, DocumentFormat};
use crate::error::RequestError;
use crate::session::{
    DocumentError, Query, RangeQuery, ResultItem, ResultStream, Session, SessionFactory,
    SessionTarget, TransactionMode,
};

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Captures formatted log output for assertions.
#[derive(Clone, Default)]
pub(crate) struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    /// Scoped subscriber writing into this buffer.
    pub(crate) fn subscriber(&self) -> impl tracing::Subscriber + Send + Sync {
        tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_ansi(false)
            .finish()
    }

    pub(crate) fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl std::io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogBuffer {
    type Writer = LogBuffer;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Event {
    Open(SessionTarget),
    OpenRefused(SessionTarget),
    Insert { host: String, docs: usize },
    Commit(String),
    Rollback(String),
    Close(String),
    RangeQuery { host: String, forest: ForestId, start: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StoredDoc {
    pub uri: DocumentUri,
    pub host: String,
    pub forest: Option<ForestId>,
}

#[derive(Debug, Default)]
struct ClusterState {
    down: HashSet<String>,
    insert_failures: HashMap<String, VecDeque<RequestError>>,
    commit_failures: HashMap<String, VecDeque<RequestError>>,
    submit_failures: HashMap<String, VecDeque<RequestError>>,
    stream_failures: HashMap<String, VecDeque<usize>>,
    reject_marker: Option<String>,
    responses: HashMap<String, Vec<ResultItem>>,
    forests: HashMap<ForestId, Vec<(DocumentUri, Bytes)>>,
    committed: BTreeMap<DocumentUri, StoredDoc>,
    events: Vec<Event>,
}

/// Shared handle; clones see the same cluster.
#[derive(Debug, Clone, Default)]
pub(crate) struct MemoryCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl MemoryCluster {
    pub(crate) fn new() -> Self {
        init_tracing();
        Self::default()
    }

    pub(crate) fn set_host_down(&self, host: &str) {
        self.state.lock().down.insert(host.to_string());
    }

    pub(crate) fn fail_next_insert(&self, host: &str, err: RequestError) {
        self.state
            .lock()
            .insert_failures
            .entry(host.to_string())
            .or_default()
            .push_back(err);
    }

    pub(crate) fn fail_next_commit(&self, host: &str, err: RequestError) {
        self.state
            .lock()
            .commit_failures
            .entry(host.to_string())
            .or_default()
            .push_back(err);
    }

    pub(crate) fn fail_next_submit(&self, host: &str, err: RequestError) {
        self.state
            .lock()
            .submit_failures
            .entry(host.to_string())
            .or_default()
            .push_back(err);
    }

    /// The next range query served by `host` drops after `items` items.
    pub(crate) fn fail_stream_after(&self, host: &str, items: usize) {
        self.state
            .lock()
            .stream_failures
            .entry(host.to_string())
            .or_default()
            .push_back(items);
    }

    /// Documents whose URI contains `marker` are rejected individually.
    pub(crate) fn reject_uris_containing(&self, marker: &str) {
        self.state.lock().reject_marker = Some(marker.to_string());
    }

    pub(crate) fn respond(&self, query: &str, items: Vec<ResultItem>) {
        self.state.lock().responses.insert(query.to_string(), items);
    }

    /// Seeds a forest with `count` readable documents `/{forest}/{i}`.
    pub(crate) fn load_forest(&self, forest: &str, count: usize) {
        let docs = (1..=count)
            .map(|i| {
                (
                    DocumentUri::new(format!("/{forest}/{i}")),
                    Bytes::from(format!("<doc n=\"{i}\"/>")),
                )
            })
            .collect();
        self.state.lock().forests.insert(ForestId::new(forest), docs);
    }

    /// Makes `replica` hold the same documents as `forest`.
    pub(crate) fn mirror_forest(&self, forest: &str, replica: &str) {
        let mut state = self.state.lock();
        let docs = state
            .forests
            .get(&ForestId::new(forest))
            .cloned()
            .unwrap_or_default();
        state.forests.insert(ForestId::new(replica), docs);
    }

    pub(crate) fn committed(&self) -> Vec<StoredDoc> {
        self.state.lock().committed.values().cloned().collect()
    }

    pub(crate) fn committed_uris(&self) -> Vec<String> {
        self.state
            .lock()
            .committed
            .keys()
            .map(|u| u.as_str().to_string())
            .collect()
    }

    pub(crate) fn events(&self) -> Vec<Event> {
        self.state.lock().events.clone()
    }

    /// Hosts of every open attempt, refused ones included.
    pub(crate) fn attempted_hosts(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Open(target) | Event::OpenRefused(target) => Some(target.host),
                _ => None,
            })
            .collect()
    }

    pub(crate) fn opened_hosts(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Open(target) => Some(target.host),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl SessionFactory for MemoryCluster {
    async fn open(
        &self,
        target: &SessionTarget,
        mode: TransactionMode,
    ) -> Result<Box<dyn Session>, RequestError> {
        let mut state = self.state.lock();
        if state.down.contains(&target.host) {
            state.events.push(Event::OpenRefused(target.clone()));
            return Err(RequestError::connection(format!(
                "connection refused: {}",
                target.host
            )));
        }
        state.events.push(Event::Open(target.clone()));
        Ok(Box::new(MemorySession {
            state: Arc::clone(&self.state),
            target: target.clone(),
            mode,
            uncommitted: Vec::new(),
        }))
    }
}

struct MemorySession {
    state: Arc<Mutex<ClusterState>>,
    target: SessionTarget,
    mode: TransactionMode,
    uncommitted: Vec<StoredDoc>,
}

impl MemorySession {
    fn host(&self) -> String {
        self.target.host.clone()
    }
}

fn pop_failure(
    failures: &mut HashMap<String, VecDeque<RequestError>>,
    host: &str,
) -> Option<RequestError> {
    failures.get_mut(host).and_then(VecDeque::pop_front)
}

#[async_trait]
impl Session for MemorySession {
    fn target(&self) -> &SessionTarget {
        &self.target
    }

    fn mode(&self) -> TransactionMode {
        self.mode
    }

    async fn insert_batch(&mut self, batch: &[Content]) -> Result<Vec<DocumentError>, RequestError> {
        let host = self.host();
        let mut state = self.state.lock();
        state.events.push(Event::Insert {
            host: host.clone(),
            docs: batch.len(),
        });
        if let Some(err) = pop_failure(&mut state.insert_failures, &host) {
            return Err(err);
        }
        let mut errors = Vec::new();
        for (index, content) in batch.iter().enumerate() {
            let rejected = state
                .reject_marker
                .as_deref()
                .is_some_and(|m| content.uri.as_str().contains(m));
            if rejected {
                errors.push(DocumentError {
                    index,
                    code: Some("XDMP-DOCROOTTEXT".into()),
                    message: format!("invalid root node in {}", content.uri),
                });
            } else {
                self.uncommitted.push(StoredDoc {
                    uri: content.uri.clone(),
                    host: host.clone(),
                    forest: self.target.forest.clone(),
                });
            }
        }
        if self.mode == TransactionMode::Auto {
            for doc in self.uncommitted.drain(..) {
                state.committed.insert(doc.uri.clone(), doc);
            }
        }
        Ok(errors)
    }

    async fn commit(&mut self) -> Result<(), RequestError> {
        let host = self.host();
        let mut state = self.state.lock();
        state.events.push(Event::Commit(host.clone()));
        if let Some(err) = pop_failure(&mut state.commit_failures, &host) {
            self.uncommitted.clear();
            return Err(err);
        }
        for doc in self.uncommitted.drain(..) {
            state.committed.insert(doc.uri.clone(), doc);
        }
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), RequestError> {
        let host = self.host();
        self.state.lock().events.push(Event::Rollback(host));
        self.uncommitted.clear();
        Ok(())
    }

    async fn submit(&mut self, query: &Query) -> Result<Vec<ResultItem>, RequestError> {
        let host = self.host();
        let mut state = self.state.lock();
        if let Some(err) = pop_failure(&mut state.submit_failures, &host) {
            return Err(err);
        }
        state
            .responses
            .get(&query.text)
            .cloned()
            .ok_or_else(|| RequestError::server("XDMP-UNDFUN", "no such query"))
    }

    async fn query_forest(
        &mut self,
        query: &RangeQuery,
    ) -> Result<Box<dyn ResultStream>, RequestError> {
        let host = self.host();
        let mut state = self.state.lock();
        state.events.push(Event::RangeQuery {
            host: host.clone(),
            forest: query.forest_id.clone(),
            start: query.start,
        });
        let docs = state.forests.get(&query.forest_id).cloned().unwrap_or_default();
        let skip = usize::try_from(query.start.saturating_sub(1)).unwrap_or(usize::MAX);
        let take = query
            .end
            .map_or(usize::MAX, |end| {
                usize::try_from((end + 1).saturating_sub(query.start)).unwrap_or(usize::MAX)
            });
        let items = docs
            .into_iter()
            .skip(skip)
            .take(take)
            .map(|(uri, content)| ResultItem::Document {
                uri,
                format: DocumentFormat::Xml,
                content,
            })
            .collect();
        let fail_after = state
            .stream_failures
            .get_mut(&host)
            .and_then(VecDeque::pop_front);
        Ok(Box::new(MemoryStream { items, fail_after }))
    }

    async fn close(&mut self) -> Result<(), RequestError> {
        let host = self.host();
        self.state.lock().events.push(Event::Close(host));
        Ok(())
    }
}

struct MemoryStream {
    items: VecDeque<ResultItem>,
    fail_after: Option<usize>,
}

#[async_trait]
impl ResultStream for MemoryStream {
    async fn next_item(&mut self) -> Result<Option<ResultItem>, RequestError> {
        match self.fail_after {
            Some(0) => {
                self.fail_after = None;
                Err(RequestError::connection("connection reset"))
            }
            Some(ref mut n) => {
                *n -= 1;
                Ok(self.items.pop_front())
            }
            None => Ok(self.items.pop_front()),
        }
    }
}
