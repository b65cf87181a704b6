//! Document identifiers used as the output key of every write.
//!
//! [`DocumentUri`] is the batching and placement key. Its identity is the URI
//! text alone. [`DocumentUriWithSourceInfo`] carries where a document came
//! from during bulk import so failures can be reported against the source
//! line; that provenance never takes part in equality or hashing.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// Identifier of one document in the target database.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentUri {
    uri: String,
}

impl DocumentUri {
    #[must_use]
    pub fn new(uri: impl Into<String>) -> Self {
        Self { uri: uri.into() }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.uri
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.uri.is_empty()
    }

    /// Returns a new URI with `prefix` prepended and `suffix` appended.
    #[must_use]
    pub fn with_prefix_suffix(&self, prefix: &str, suffix: &str) -> Self {
        if prefix.is_empty() && suffix.is_empty() {
            return self.clone();
        }
        Self {
            uri: format!("{prefix}{}{suffix}", self.uri),
        }
    }
}

impl fmt::Display for DocumentUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri)
    }
}

impl From<&str> for DocumentUri {
    fn from(uri: &str) -> Self {
        Self::new(uri)
    }
}

impl From<String> for DocumentUri {
    fn from(uri: String) -> Self {
        Self { uri }
    }
}

impl AsRef<str> for DocumentUri {
    fn as_ref(&self) -> &str {
        &self.uri
    }
}

/// Where an imported document was read from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceInfo {
    pub src_id: String,
    pub line: u64,
    pub column: u64,
}

/// A [`DocumentUri`] annotated with its import provenance.
///
/// Equality, ordering and hashing only consider the URI text, so a document
/// re-read from a different line of the same file is still the same document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentUriWithSourceInfo {
    uri: DocumentUri,
    source: SourceInfo,
}

impl DocumentUriWithSourceInfo {
    #[must_use]
    pub fn new(uri: impl Into<DocumentUri>, source: SourceInfo) -> Self {
        Self {
            uri: uri.into(),
            source,
        }
    }

    #[must_use]
    pub fn uri(&self) -> &DocumentUri {
        &self.uri
    }

    #[must_use]
    pub fn source(&self) -> &SourceInfo {
        &self.source
    }

    #[must_use]
    pub fn into_uri(self) -> DocumentUri {
        self.uri
    }
}

impl PartialEq for DocumentUriWithSourceInfo {
    fn eq(&self, other: &Self) -> bool {
        self.uri == other.uri
    }
}

impl Eq for DocumentUriWithSourceInfo {}

impl Hash for DocumentUriWithSourceInfo {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.uri.hash(state);
    }
}

impl PartialOrd for DocumentUriWithSourceInfo {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DocumentUriWithSourceInfo {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.uri.cmp(&other.uri)
    }
}

impl fmt::Display for DocumentUriWithSourceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.source.src_id.is_empty() {
            return write!(f, "{}", self.uri);
        }
        write!(
            f,
            "{} ({} line {}, column {})",
            self.uri, self.source.src_id, self.source.line, self.source.column
        )
    }
}

impl From<DocumentUriWithSourceInfo> for DocumentUri {
    fn from(value: DocumentUriWithSourceInfo) -> Self {
        value.uri
    }
}
