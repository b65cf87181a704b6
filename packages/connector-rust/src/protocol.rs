//! Positional decoding of query result streams.
//!
//! Discovery and split queries answer with flat item sequences whose
//! meaning depends on position, with string markers separating sections.
//! An item of the wrong type where a value is expected breaks the contract
//! between client and server and is reported as a protocol error, never
//! retried.

use contentpump_core::ForestId;

use crate::error::ConnectorError;
use crate::session::ResultItem;

/// Ends the redaction-rule section of the split stream.
pub const REDACTION_MARKER: &str = "REDACT";
/// Starts the replica section of the split and replica streams.
pub const REPLICA_MARKER: &str = "REPLICA";

pub(crate) struct ItemCursor<'a> {
    items: &'a [ResultItem],
    pos: usize,
}

impl<'a> ItemCursor<'a> {
    pub(crate) fn new(items: &'a [ResultItem]) -> Self {
        Self { items, pos: 0 }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.pos >= self.items.len()
    }

    /// Items not consumed yet.
    pub(crate) fn remaining(&self) -> usize {
        self.items.len().saturating_sub(self.pos)
    }

    /// Consumes the next item if it is the string `marker`.
    pub(crate) fn eat_marker(&mut self, marker: &str) -> bool {
        let hit = self.items.get(self.pos).and_then(ResultItem::as_str) == Some(marker);
        if hit {
            self.pos += 1;
        }
        hit
    }

    fn next(&mut self, what: &str) -> Result<&'a ResultItem, ConnectorError> {
        let item = self.items.get(self.pos).ok_or_else(|| {
            ConnectorError::Protocol(format!("stream ended where {what} was expected"))
        })?;
        self.pos += 1;
        Ok(item)
    }

    fn mismatch(&self, what: &str, found: &ResultItem) -> ConnectorError {
        ConnectorError::Protocol(format!(
            "expected {what} at item {}, found {}",
            self.pos - 1,
            found.type_name()
        ))
    }

    pub(crate) fn next_string(&mut self, what: &str) -> Result<&'a str, ConnectorError> {
        match self.next(what)? {
            ResultItem::String(s) => Ok(s),
            other => Err(self.mismatch(what, other)),
        }
    }

    pub(crate) fn next_integer(&mut self, what: &str) -> Result<i64, ConnectorError> {
        match self.next(what)? {
            ResultItem::Integer(n) => Ok(*n),
            other => Err(self.mismatch(what, other)),
        }
    }

    pub(crate) fn next_bool(&mut self, what: &str) -> Result<bool, ConnectorError> {
        match self.next(what)? {
            ResultItem::Boolean(b) => Ok(*b),
            other => Err(self.mismatch(what, other)),
        }
    }

    /// Forest ids arrive as unsigned integers from current servers and as
    /// strings from older ones.
    pub(crate) fn next_forest_id(&mut self) -> Result<ForestId, ConnectorError> {
        match self.next("forest id")? {
            ResultItem::String(s) => Ok(ForestId::new(s.as_str())),
            ResultItem::Integer(n) => u64::try_from(*n)
                .map(ForestId::from)
                .map_err(|_| ConnectorError::Protocol(format!("negative forest id {n}"))),
            other => Err(self.mismatch("forest id", other)),
        }
    }

    /// A non-negative count.
    pub(crate) fn next_count(&mut self, what: &str) -> Result<usize, ConnectorError> {
        let n = self.next_integer(what)?;
        usize::try_from(n).map_err(|_| ConnectorError::Protocol(format!("invalid {what} {n}")))
    }
}
