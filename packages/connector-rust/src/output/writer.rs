//! Batched, fault-tolerant document writer.
//!
//! Documents are placed on a forest slot, collected into batches of
//! `batch_size`, and inserted one batch per request. In update mode every
//! `txn_size` batches of a slot share one transaction. A failed request
//! tears the slot's session down, backs off, moves to the next replica (or
//! the next output host), and replays whatever the lost transaction held.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use contentpump_core::{
    AssignmentManager, AssignmentPolicyKind, DocumentUri, DocumentUriWithSourceInfo, ForestId,
    ForestInfo, SourceInfo,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::OutputConfig;
use crate::content::{create_content, Content, ContentCreateOptions, ContentPayload};
use crate::counters::JobCounters;
use crate::error::{ConnectorError, ErrorClass, RequestError};
use crate::retry::{HostRotation, ReplicaCursor, RetryPolicy, MULTI_BATCH_TXN_MAX_ATTEMPTS};
use crate::session::{
    close_quietly, open_first_reachable, Session, SessionFactory, SessionTarget, TransactionMode,
};
use crate::topology::fetch_partition_forests;
use crate::traits::RecordWriter;

/// Progress of one forest slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Batching,
    Flushing,
    /// Inserted batches wait for the transaction to fill up and commit.
    CommitPending,
    Committed,
    CommitRetry,
    PermanentFailure,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub succeeded: u64,
    pub failed: u64,
    /// Failovers to another replica or output host.
    pub rotations: u64,
}

/// Where a slot's requests go.
#[derive(Debug)]
enum Route {
    /// Fastload: pinned to one forest, failing over through its replicas.
    Forest {
        id: ForestId,
        host: String,
        replicas: Option<ReplicaCursor>,
    },
    /// The server places documents; rotate over the output hosts.
    Hosts(HostRotation),
}

impl Route {
    fn target(&self, port: u16) -> SessionTarget {
        match self {
            Self::Forest {
                replicas: Some(cursor),
                ..
            } => {
                let replica = cursor.current();
                SessionTarget::forest(replica.host.as_str(), port, replica.forest_id.clone())
            }
            Self::Forest { id, host, .. } => SessionTarget::forest(host.as_str(), port, id.clone()),
            Self::Hosts(rotation) => SessionTarget::host(rotation.current(), port),
        }
    }

    /// Moves to the next failover target. `false` when there is none.
    fn rotate(&mut self) -> bool {
        match self {
            Self::Forest {
                replicas: Some(cursor),
                ..
            } if cursor.len() > 1 => {
                cursor.advance();
                true
            }
            Self::Forest { .. } => false,
            Self::Hosts(rotation) => {
                let before = rotation.current().to_string();
                rotation.fail_current() != before
            }
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forest { id, .. } => write!(f, "{id}"),
            Self::Hosts(_) => f.write_str("server-placed"),
        }
    }
}

/// Per-slot writer state. One slot per placement forest in fastload mode,
/// a single slot otherwise.
#[derive(Debug)]
pub struct ForestWriterState {
    route: Route,
    session: Option<Box<dyn Session>>,
    pending: Vec<Content>,
    /// Inserted but uncommitted documents, kept for replay.
    commit_queue: Vec<Content>,
    batches_in_txn: usize,
    /// STATISTICAL batches charged to this forest and not yet confirmed.
    charged_batches: u64,
    state: SlotState,
}

impl ForestWriterState {
    fn new(route: Route) -> Self {
        Self {
            route,
            session: None,
            pending: Vec::new(),
            commit_queue: Vec::new(),
            batches_in_txn: 0,
            charged_batches: 0,
            state: SlotState::Idle,
        }
    }

    fn for_forest(forest: &ForestInfo) -> Self {
        Self::new(Route::Forest {
            id: forest.id.clone(),
            host: forest.host.clone(),
            replicas: ReplicaCursor::new(forest.replicas.clone(), &forest.host),
        })
    }
}

/// Record writer of one output task.
pub struct ContentWriter {
    batch_id: Uuid,
    factory: Arc<dyn SessionFactory>,
    manager: Arc<AssignmentManager>,
    counters: Arc<JobCounters>,
    options: Arc<ContentCreateOptions>,
    uri_prefix: String,
    uri_suffix: String,
    partition: Option<String>,
    hosts: Vec<String>,
    port: u16,
    batch_size: usize,
    txn_size: usize,
    mode: TransactionMode,
    fast_load: bool,
    retry: RetryPolicy,
    slots: Vec<ForestWriterState>,
    /// STATISTICAL places once per batch; the slot filling up right now.
    statistical_slot: Option<usize>,
    stats: WriterStats,
    closed: bool,
}

impl ContentWriter {
    /// Creates the writer of task `task_id`.
    ///
    /// Without fastload the task starts on output host `task_id % hosts`,
    /// spreading tasks over the hosts.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::Config`] when no output host is configured.
    pub fn new(
        config: &OutputConfig,
        fast_load: bool,
        manager: Arc<AssignmentManager>,
        factory: Arc<dyn SessionFactory>,
        counters: Arc<JobCounters>,
        task_id: usize,
    ) -> Result<Self, ConnectorError> {
        let slots = if fast_load {
            (0..manager.forest_count())
                .filter_map(|i| manager.forest(i))
                .map(ForestWriterState::for_forest)
                .collect()
        } else {
            let rotation = HostRotation::new(config.hosts.clone(), task_id)
                .ok_or_else(|| ConnectorError::config("no output hosts"))?;
            vec![ForestWriterState::new(Route::Hosts(rotation))]
        };
        let mode = if config.uses_update_transactions() {
            TransactionMode::Update
        } else {
            TransactionMode::Auto
        };
        let batch_id = Uuid::new_v4();
        debug!(
            batch_id = %batch_id,
            fast_load,
            slots = slots.len(),
            batch_size = config.batch_size,
            txn_size = config.txn_size,
            "content writer created"
        );
        Ok(Self {
            batch_id,
            factory,
            manager,
            counters,
            options: Arc::new(config.content.clone()),
            uri_prefix: config.uri_prefix.clone(),
            uri_suffix: config.uri_suffix.clone(),
            partition: config.partition.clone(),
            hosts: config.hosts.clone(),
            port: config.port,
            batch_size: config.batch_size,
            txn_size: config.txn_size,
            mode,
            fast_load,
            retry: RetryPolicy::writer(),
            slots,
            statistical_slot: None,
            stats: WriterStats::default(),
            closed: false,
        })
    }

    /// Correlation token carried by every log line of this writer.
    #[must_use]
    pub fn batch_id(&self) -> Uuid {
        self.batch_id
    }

    #[must_use]
    pub fn manager(&self) -> &Arc<AssignmentManager> {
        &self.manager
    }

    #[must_use]
    pub fn stats(&self) -> WriterStats {
        self.stats
    }

    #[must_use]
    pub fn slot_state(&self, slot: usize) -> Option<SlotState> {
        self.slots.get(slot).map(|s| s.state)
    }

    /// Queues one document, flushing its slot when the batch is full.
    ///
    /// A document whose content cannot be created is counted as failed and
    /// skipped.
    ///
    /// # Errors
    ///
    /// - [`ConnectorError::Closed`] after [`close`](Self::close)
    /// - [`ConnectorError::Assignment`] when placement fails
    /// - [`ConnectorError::RetriesExhausted`] or [`ConnectorError::Request`]
    ///   when a flushed batch fails for good
    pub async fn write(
        &mut self,
        uri: DocumentUri,
        payload: ContentPayload,
    ) -> Result<(), ConnectorError> {
        self.write_sourced(uri, None, payload).await
    }

    /// Like [`write`](Self::write), keeping the document's import provenance
    /// for failure reports.
    ///
    /// # Errors
    ///
    /// See [`write`](Self::write).
    pub async fn write_with_source(
        &mut self,
        uri: DocumentUriWithSourceInfo,
        payload: ContentPayload,
    ) -> Result<(), ConnectorError> {
        let source = uri.source().clone();
        self.write_sourced(uri.into_uri(), Some(source), payload).await
    }

    async fn write_sourced(
        &mut self,
        uri: DocumentUri,
        source: Option<SourceInfo>,
        payload: ContentPayload,
    ) -> Result<(), ConnectorError> {
        if self.closed {
            return Err(ConnectorError::Closed);
        }
        let uri = uri.with_prefix_suffix(&self.uri_prefix, &self.uri_suffix);
        let content = match create_content(uri, payload, &self.options).await {
            Ok(content) => content.with_source(source),
            Err(e @ (ConnectorError::Io { .. } | ConnectorError::Content { .. })) => {
                self.stats.failed += 1;
                match source {
                    Some(source) => error!(
                        batch_id = %self.batch_id,
                        source = %source.src_id,
                        line = source.line,
                        column = source.column,
                        error = %e,
                        "skipping document"
                    ),
                    None => error!(batch_id = %self.batch_id, error = %e, "skipping document"),
                }
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let idx = self.slot_for(&content.uri).await?;
        let slot = &mut self.slots[idx];
        slot.pending.push(content);
        slot.state = SlotState::Batching;
        if slot.pending.len() >= self.batch_size {
            self.flush(idx, false).await?;
        }
        Ok(())
    }

    /// Flushes remainders, commits open transactions, and closes sessions.
    ///
    /// Every slot is drained even when one fails; the first failure is
    /// returned after the final counts are reported.
    ///
    /// # Errors
    ///
    /// See [`write`](Self::write).
    pub async fn close(&mut self) -> Result<(), ConnectorError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut first_err = None;
        for idx in 0..self.slots.len() {
            let slot = &self.slots[idx];
            if !slot.pending.is_empty() || !slot.commit_queue.is_empty() {
                if let Err(e) = self.flush(idx, true).await {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
            if let Some(mut session) = self.slots[idx].session.take() {
                close_quietly(session.as_mut()).await;
            }
        }
        self.counters.add_committed(self.stats.succeeded);
        self.counters.add_failed(self.stats.failed);
        info!(
            batch_id = %self.batch_id,
            succeeded = self.stats.succeeded,
            failed = self.stats.failed,
            rotations = self.stats.rotations,
            "content writer closed"
        );
        first_err.map_or(Ok(()), Err)
    }

    async fn slot_for(&mut self, uri: &DocumentUri) -> Result<usize, ConnectorError> {
        if !self.fast_load {
            return Ok(0);
        }
        let kind = self.manager.policy_kind();
        if kind == AssignmentPolicyKind::Statistical {
            if let Some(idx) = self.statistical_slot {
                return Ok(idx);
            }
            let idx = self.manager.placement_forest_index(uri)?;
            self.slots[idx].charged_batches += 1;
            self.statistical_slot = Some(idx);
            return Ok(idx);
        }
        if kind.is_partitioned() {
            self.resolve_partition().await?;
        }
        Ok(self
            .manager
            .placement_in_partition(uri, self.partition.as_deref())?)
    }

    /// Fetches the forests of the output partition on first use.
    async fn resolve_partition(&mut self) -> Result<(), ConnectorError> {
        let name = match self.partition.as_deref().or(self.manager.default_partition()) {
            Some(name) if !self.manager.is_partition_cached(name) => name.to_string(),
            _ => return Ok(()),
        };
        let mut session = open_first_reachable(
            self.factory.as_ref(),
            &self.hosts,
            self.port,
            TransactionMode::Auto,
        )
        .await?;
        let forests = fetch_partition_forests(session.as_mut(), &name).await;
        close_quietly(session.as_mut()).await;
        let forests = forests?;
        self.manager.cache_partition(&name, &forests)?;
        info!(batch_id = %self.batch_id, partition = %name, forests = forests.len(), "resolved output partition");
        Ok(())
    }

    async fn flush(&mut self, idx: usize, closing: bool) -> Result<(), ConnectorError> {
        if self.statistical_slot == Some(idx) {
            self.statistical_slot = None;
        }
        let slot = &mut self.slots[idx];
        let batch = std::mem::take(&mut slot.pending);
        if !batch.is_empty() {
            slot.batches_in_txn += 1;
        }
        let commit = self.mode == TransactionMode::Update
            && (closing || slot.batches_in_txn >= self.txn_size);
        slot.state = SlotState::Flushing;
        debug!(
            batch_id = %self.batch_id,
            forest = %slot.route,
            docs = batch.len(),
            batches_in_txn = slot.batches_in_txn,
            commit,
            "flushing batch"
        );
        self.run_transaction(idx, batch, commit).await
    }

    /// Inserts `batch` (and commits when `commit`), retrying per the budget.
    ///
    /// A transaction spanning several batches gets the smaller
    /// [`MULTI_BATCH_TXN_MAX_ATTEMPTS`] budget since each retry replays
    /// every batch of the transaction.
    async fn run_transaction(
        &mut self,
        idx: usize,
        mut batch: Vec<Content>,
        commit: bool,
    ) -> Result<(), ConnectorError> {
        let max_attempts = if self.txn_size > 1 {
            MULTI_BATCH_TXN_MAX_ATTEMPTS
        } else {
            self.retry.max_attempts
        };
        let mut replay = false;
        let mut attempt = 1;
        loop {
            let err = match self.attempt(idx, &mut batch, replay, commit).await {
                Ok(()) => {
                    let slot = &mut self.slots[idx];
                    if slot.commit_queue.is_empty() {
                        slot.state = SlotState::Idle;
                    }
                    return Ok(());
                }
                Err(err) => err,
            };
            if !err.is_retryable() || attempt >= max_attempts {
                return self.fail_batch(idx, batch, err, attempt).await;
            }
            let failed_target = self.slots[idx].route.target(self.port);
            self.discard_session(idx).await;
            let slot = &mut self.slots[idx];
            slot.state = SlotState::CommitRetry;
            if slot.route.rotate() {
                self.stats.rotations += 1;
            }
            let backoff = self.retry.backoff(attempt);
            warn!(
                batch_id = %self.batch_id,
                forest = %slot.route,
                host = %failed_target.host,
                next_host = %slot.route.target(self.port).host,
                attempt,
                backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "batch request failed, retrying"
            );
            tokio::time::sleep(backoff).await;
            replay = true;
            attempt += 1;
        }
    }

    /// One try: (re)open, replay the lost transaction, insert, maybe commit.
    async fn attempt(
        &mut self,
        idx: usize,
        batch: &mut Vec<Content>,
        replay: bool,
        commit: bool,
    ) -> Result<(), RequestError> {
        self.ensure_session(idx).await?;
        if replay {
            let mut queue = std::mem::take(&mut self.slots[idx].commit_queue);
            let replayed = self.insert(idx, &mut queue).await;
            self.slots[idx].commit_queue = queue;
            replayed?;
        }
        self.insert(idx, batch).await?;

        let slot = &mut self.slots[idx];
        if self.mode == TransactionMode::Auto {
            self.stats.succeeded += batch.len() as u64;
            batch.clear();
            slot.charged_batches = 0;
            slot.state = SlotState::Committed;
            return Ok(());
        }
        slot.commit_queue.append(batch);
        slot.state = SlotState::CommitPending;
        if !commit {
            return Ok(());
        }
        if let Some(session) = slot.session.as_mut() {
            session.commit().await?;
        }
        let committed = slot.commit_queue.len() as u64;
        slot.commit_queue.clear();
        slot.batches_in_txn = 0;
        slot.charged_batches = 0;
        slot.state = SlotState::Committed;
        self.stats.succeeded += committed;
        debug!(batch_id = %self.batch_id, forest = %slot.route, committed, "transaction committed");
        Ok(())
    }

    async fn ensure_session(&mut self, idx: usize) -> Result<(), RequestError> {
        let slot = &mut self.slots[idx];
        if slot.session.is_none() {
            let target = slot.route.target(self.port);
            let session = self.factory.open(&target, self.mode).await?;
            debug!(batch_id = %self.batch_id, session = %target, "session opened");
            slot.session = Some(session);
        }
        Ok(())
    }

    /// Inserts `docs`, dropping the ones the server rejects.
    async fn insert(&mut self, idx: usize, docs: &mut Vec<Content>) -> Result<(), RequestError> {
        if docs.is_empty() {
            return Ok(());
        }
        let Some(session) = self.slots[idx].session.as_mut() else {
            return Err(RequestError::connection("no open session"));
        };
        let errors = session.insert_batch(docs).await?;
        if errors.is_empty() {
            return Ok(());
        }
        let mut rejected: Vec<usize> = errors
            .iter()
            .filter_map(|e| {
                let doc = docs.get(e.index)?;
                error!(
                    batch_id = %self.batch_id,
                    document = %doc.provenance(),
                    code = e.code.as_deref().unwrap_or_default(),
                    error = %e.message,
                    "document rejected"
                );
                Some(e.index)
            })
            .collect();
        rejected.sort_unstable();
        rejected.dedup();
        self.stats.failed += rejected.len() as u64;
        for i in rejected.into_iter().rev() {
            docs.remove(i);
        }
        Ok(())
    }

    /// Rolls back and closes the slot's session, if any.
    async fn discard_session(&mut self, idx: usize) {
        let Some(mut session) = self.slots[idx].session.take() else {
            return;
        };
        if self.mode == TransactionMode::Update {
            if let Err(e) = session.rollback().await {
                debug!(batch_id = %self.batch_id, error = %e, "ignoring rollback failure");
            }
        }
        close_quietly(session.as_mut()).await;
    }

    /// Accounts every document of the batch and its transaction as failed.
    ///
    /// Permanent request errors stop here; exhausted retries and fatal
    /// errors propagate to the task.
    async fn fail_batch(
        &mut self,
        idx: usize,
        batch: Vec<Content>,
        err: RequestError,
        attempts: u32,
    ) -> Result<(), ConnectorError> {
        self.discard_session(idx).await;
        let slot = &mut self.slots[idx];
        slot.state = SlotState::PermanentFailure;
        let lost = (batch.len() + slot.commit_queue.len()) as u64;
        let documents: Vec<String> = slot
            .commit_queue
            .iter()
            .chain(&batch)
            .map(Content::provenance)
            .collect();
        slot.commit_queue.clear();
        slot.batches_in_txn = 0;
        let charged = std::mem::take(&mut slot.charged_batches);
        if charged > 0 {
            self.manager.rollback(idx, charged * self.batch_size as u64);
        }
        self.stats.failed += lost;
        error!(
            batch_id = %self.batch_id,
            forest = %slot.route,
            attempts,
            lost,
            documents = ?documents,
            error = %err,
            "batch permanently failed"
        );
        slot.state = SlotState::Idle;
        match err.class() {
            ErrorClass::Permanent => Ok(()),
            ErrorClass::Retryable => Err(ConnectorError::RetriesExhausted {
                operation: "batch write",
                attempts,
                source: err,
            }),
            ErrorClass::Fatal => Err(ConnectorError::Request(err)),
        }
    }
}

#[async_trait]
impl RecordWriter for ContentWriter {
    type Key = DocumentUri;
    type Value = ContentPayload;

    async fn write(&mut self, key: DocumentUri, value: ContentPayload) -> Result<(), ConnectorError> {
        ContentWriter::write(self, key, value).await
    }

    async fn close(&mut self) -> Result<(), ConnectorError> {
        ContentWriter::close(self).await
    }
}
