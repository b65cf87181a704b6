//! Connections to the database.
//!
//! A [`Session`] is one live connection to a host, optionally pinned to a
//! forest, owned by exactly one writer or reader at a time. The wire
//! protocol lives behind [`SessionFactory`]; this crate only drives it.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use contentpump_core::{DocumentUri, ForestId};
use tracing::{debug, warn};

use crate::content::{Content, DocumentFormat};
use crate::error::{ConnectorError, RequestError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionMode {
    /// Every request commits on its own.
    Auto,
    /// Requests join one transaction until `commit` or `rollback`.
    Update,
}

/// Where a session connects.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionTarget {
    pub host: String,
    pub port: u16,
    /// Forest requests are pinned to; `None` lets the server place documents.
    pub forest: Option<ForestId>,
}

impl SessionTarget {
    #[must_use]
    pub fn host(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            forest: None,
        }
    }

    #[must_use]
    pub fn forest(host: impl Into<String>, port: u16, forest: ForestId) -> Self {
        Self {
            host: host.into(),
            port,
            forest: Some(forest),
        }
    }
}

impl fmt::Display for SessionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)?;
        if let Some(forest) = &self.forest {
            write!(f, " (forest {forest})")?;
        }
        Ok(())
    }
}

/// A document the server rejected inside an otherwise accepted batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentError {
    /// Position of the document in the submitted batch.
    pub index: usize,
    pub code: Option<String>,
    pub message: String,
}

/// An ad hoc query with external variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub text: String,
    pub variables: Vec<(String, String)>,
}

impl Query {
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            variables: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_variable(mut self, name: &str, value: impl Into<String>) -> Self {
        self.variables.push((name.to_string(), value.into()));
        self
    }
}

/// A range query over one forest. `start` is 1-based; `end` is inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeQuery {
    pub forest_id: ForestId,
    pub start: u64,
    /// `None` reads to the end of the forest.
    pub end: Option<u64>,
    pub query: String,
    pub redaction_rules: Vec<String>,
}

/// One item of a query result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultItem {
    String(String),
    Integer(i64),
    Boolean(bool),
    Document {
        uri: DocumentUri,
        format: DocumentFormat,
        content: Bytes,
    },
}

impl ResultItem {
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Integer(_) => "integer",
            Self::Boolean(_) => "boolean",
            Self::Document { .. } => "document",
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

/// Items streamed back by a range query.
#[async_trait]
pub trait ResultStream: Send {
    /// Next item, or `None` once the stream is exhausted.
    async fn next_item(&mut self) -> Result<Option<ResultItem>, RequestError>;
}

#[async_trait]
pub trait Session: Send {
    fn target(&self) -> &SessionTarget;

    fn mode(&self) -> TransactionMode;

    /// Inserts a batch in one request.
    ///
    /// Documents the server rejects are reported individually; the rest of
    /// the batch stays inserted (and, in update mode, uncommitted).
    async fn insert_batch(&mut self, batch: &[Content]) -> Result<Vec<DocumentError>, RequestError>;

    async fn commit(&mut self) -> Result<(), RequestError>;

    async fn rollback(&mut self) -> Result<(), RequestError>;

    /// Evaluates an ad hoc query and collects its results.
    async fn submit(&mut self, query: &Query) -> Result<Vec<ResultItem>, RequestError>;

    async fn query_forest(
        &mut self,
        query: &RangeQuery,
    ) -> Result<Box<dyn ResultStream>, RequestError>;

    async fn close(&mut self) -> Result<(), RequestError>;
}

impl fmt::Debug for dyn Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Session({})", self.target())
    }
}

/// Opens sessions. Implemented by the wire-protocol client.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(
        &self,
        target: &SessionTarget,
        mode: TransactionMode,
    ) -> Result<Box<dyn Session>, RequestError>;
}

/// Opens a session on the first host that accepts one.
///
/// # Errors
///
/// Returns [`ConnectorError::NoReachableHost`] when every host refuses.
pub async fn open_first_reachable(
    factory: &dyn SessionFactory,
    hosts: &[String],
    port: u16,
    mode: TransactionMode,
) -> Result<Box<dyn Session>, ConnectorError> {
    let mut last = None;
    for host in hosts {
        match factory.open(&SessionTarget::host(host.as_str(), port), mode).await {
            Ok(session) => return Ok(session),
            Err(e) => {
                warn!(host = %host, error = %e, "host unreachable, trying next");
                last = Some(e);
            }
        }
    }
    Err(ConnectorError::NoReachableHost {
        hosts: hosts.to_vec(),
        last,
    })
}

/// Runs `query` on the first host that answers it.
///
/// A host that refuses the connection or fails the query is skipped.
///
/// # Errors
///
/// Returns [`ConnectorError::NoReachableHost`] when no host answers.
pub async fn query_first_reachable(
    factory: &dyn SessionFactory,
    hosts: &[String],
    port: u16,
    query: &Query,
) -> Result<Vec<ResultItem>, ConnectorError> {
    let mut last = None;
    for host in hosts {
        let target = SessionTarget::host(host.as_str(), port);
        let mut session = match factory.open(&target, TransactionMode::Auto).await {
            Ok(session) => session,
            Err(e) => {
                warn!(host = %host, error = %e, "host unreachable, trying next");
                last = Some(e);
                continue;
            }
        };
        let result = session.submit(query).await;
        close_quietly(session.as_mut()).await;
        match result {
            Ok(items) => return Ok(items),
            Err(e) => {
                warn!(host = %host, error = %e, "query failed, trying next host");
                last = Some(e);
            }
        }
    }
    Err(ConnectorError::NoReachableHost {
        hosts: hosts.to_vec(),
        last,
    })
}

/// Closes a session that is being discarded; failures are only logged.
pub(crate) async fn close_quietly(session: &mut dyn Session) {
    if let Err(e) = session.close().await {
        debug!(target_host = %session.target(), error = %e, "ignoring close failure");
    }
}
