//! Outgoing documents.
//!
//! Producers hand the writer a [`ContentPayload`], a closed set of payload
//! kinds decided where the record is produced. [`create_content`] turns each
//! kind into a replayable [`Content`] with exactly one conversion per kind.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use contentpump_core::{DocumentUri, DocumentUriWithSourceInfo, SourceInfo};
use serde::{Deserialize, Serialize};

use crate::config::{Permission, DEFAULT_ENCODING};
use crate::error::ConnectorError;

/// Document format as stored by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Xml,
    Json,
    Text,
    Binary,
    /// Decide per document from the payload kind.
    #[default]
    Mixed,
}

impl DocumentFormat {
    /// Guesses a format from a file extension; unknown extensions are binary.
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("xml" | "xhtml" | "xsd") => Self::Xml,
            Some("json") => Self::Json,
            Some("txt" | "text" | "csv") => Self::Text,
            _ => Self::Binary,
        }
    }
}

impl FromStr for DocumentFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "xml" => Ok(Self::Xml),
            "json" => Ok(Self::Json),
            "text" => Ok(Self::Text),
            "binary" => Ok(Self::Binary),
            "mixed" => Ok(Self::Mixed),
            other => Err(format!("unknown document format `{other}`")),
        }
    }
}

/// A payload kind the connector does not know, serialized by its producer.
pub trait CustomPayload: Send + Sync + fmt::Debug {
    fn format(&self) -> DocumentFormat;

    /// Serialized document bytes.
    ///
    /// # Errors
    ///
    /// Whatever the producer's serializer reports.
    fn to_bytes(&self) -> anyhow::Result<Bytes>;
}

#[derive(Debug, Clone)]
pub enum ContentPayload {
    Text(String),
    /// Serialized XML node.
    Node(String),
    Binary(Bytes),
    /// A file streamed from disk at insert time.
    File(PathBuf),
    Json(serde_json::Value),
    Custom(Arc<dyn CustomPayload>),
}

/// Insert options shared by every document of a writer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentCreateOptions {
    pub permissions: Vec<Permission>,
    pub collections: Vec<String>,
    pub quality: i32,
    pub encoding: String,
    /// Forced format; [`DocumentFormat::Mixed`] decides per payload.
    pub format: DocumentFormat,
    pub temporal_collection: Option<String>,
}

impl Default for ContentCreateOptions {
    fn default() -> Self {
        Self {
            permissions: Vec::new(),
            collections: Vec::new(),
            quality: 0,
            encoding: DEFAULT_ENCODING.to_string(),
            format: DocumentFormat::Mixed,
            temporal_collection: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentBody {
    Bytes(Bytes),
    /// Sent by path so a retried batch can stream the file again.
    File { path: PathBuf, len: u64 },
}

impl ContentBody {
    #[must_use]
    pub fn len(&self) -> u64 {
        match self {
            Self::Bytes(bytes) => bytes.len() as u64,
            Self::File { len, .. } => *len,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One document ready to insert. Cheap to clone for replay.
#[derive(Debug, Clone)]
pub struct Content {
    pub uri: DocumentUri,
    pub body: ContentBody,
    pub format: DocumentFormat,
    pub options: Arc<ContentCreateOptions>,
    /// Import provenance, when the producer knows it.
    pub source: Option<SourceInfo>,
}

impl Content {
    #[must_use]
    pub fn with_source(mut self, source: Option<SourceInfo>) -> Self {
        self.source = source;
        self
    }

    /// The URI followed by its source file, line and column when known.
    #[must_use]
    pub fn provenance(&self) -> String {
        match &self.source {
            Some(source) => {
                DocumentUriWithSourceInfo::new(self.uri.clone(), source.clone()).to_string()
            }
            None => self.uri.to_string(),
        }
    }
}

/// Converts a payload into insertable content.
///
/// # Errors
///
/// - [`ConnectorError::Io`] when a file payload cannot be stat'ed
/// - [`ConnectorError::Content`] when a custom payload fails to serialize
pub async fn create_content(
    uri: DocumentUri,
    payload: ContentPayload,
    options: &Arc<ContentCreateOptions>,
) -> Result<Content, ConnectorError> {
    let (body, natural) = match payload {
        ContentPayload::Text(text) => (ContentBody::Bytes(Bytes::from(text)), DocumentFormat::Text),
        ContentPayload::Node(xml) => (ContentBody::Bytes(Bytes::from(xml)), DocumentFormat::Xml),
        ContentPayload::Binary(bytes) => (ContentBody::Bytes(bytes), DocumentFormat::Binary),
        ContentPayload::Json(value) => (
            ContentBody::Bytes(Bytes::from(value.to_string())),
            DocumentFormat::Json,
        ),
        ContentPayload::File(path) => {
            let meta = tokio::fs::metadata(&path)
                .await
                .map_err(|source| ConnectorError::Io {
                    path: path.clone(),
                    source,
                })?;
            let format = DocumentFormat::from_path(&path);
            (
                ContentBody::File {
                    path,
                    len: meta.len(),
                },
                format,
            )
        }
        ContentPayload::Custom(custom) => {
            let bytes = custom.to_bytes().map_err(|e| ConnectorError::Content {
                uri: uri.to_string(),
                message: format!("{e:#}"),
            })?;
            (ContentBody::Bytes(bytes), custom.format())
        }
    };
    let format = match options.format {
        DocumentFormat::Mixed => natural,
        forced => forced,
    };
    Ok(Content {
        uri,
        body,
        format,
        options: Arc::clone(options),
        source: None,
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn opts() -> Arc<ContentCreateOptions> {
        Arc::new(ContentCreateOptions::default())
    }

    #[derive(Debug)]
    struct Csv(Vec<&'static str>);

    impl CustomPayload for Csv {
        fn format(&self) -> DocumentFormat {
            DocumentFormat::Text
        }

        fn to_bytes(&self) -> anyhow::Result<Bytes> {
            anyhow::ensure!(!self.0.is_empty(), "empty row");
            Ok(Bytes::from(self.0.join(",")))
        }
    }

    #[tokio::test]
    async fn each_payload_kind_has_a_natural_format() {
        let cases = [
            (ContentPayload::Text("hi".into()), DocumentFormat::Text),
            (ContentPayload::Node("<a/>".into()), DocumentFormat::Xml),
            (ContentPayload::Binary(Bytes::from_static(b"\x00")), DocumentFormat::Binary),
            (ContentPayload::Json(serde_json::json!({"a": 1})), DocumentFormat::Json),
            (ContentPayload::Custom(Arc::new(Csv(vec!["a", "b"]))), DocumentFormat::Text),
        ];
        for (payload, expected) in cases {
            let content = create_content("/d".into(), payload, &opts()).await.unwrap();
            assert_eq!(content.format, expected);
        }
    }

    #[tokio::test]
    async fn json_payload_is_serialized() {
        let content = create_content(
            "/d.json".into(),
            ContentPayload::Json(serde_json::json!({"a": 1})),
            &opts(),
        )
        .await
        .unwrap();
        assert_eq!(content.body, ContentBody::Bytes(Bytes::from_static(b"{\"a\":1}")));
    }

    #[tokio::test]
    async fn forced_format_wins() {
        let forced = Arc::new(ContentCreateOptions {
            format: DocumentFormat::Binary,
            ..ContentCreateOptions::default()
        });
        let content = create_content("/d".into(), ContentPayload::Text("x".into()), &forced)
            .await
            .unwrap();
        assert_eq!(content.format, DocumentFormat::Binary);
    }

    #[tokio::test]
    async fn file_payload_is_sent_by_path() {
        let mut file = tempfile::Builder::new().suffix(".xml").tempfile().unwrap();
        file.write_all(b"<doc/>").unwrap();
        let content = create_content(
            "/f.xml".into(),
            ContentPayload::File(file.path().to_path_buf()),
            &opts(),
        )
        .await
        .unwrap();
        assert_eq!(content.format, DocumentFormat::Xml);
        assert_eq!(content.body.len(), 6);
        assert!(matches!(content.body, ContentBody::File { .. }));
    }

    #[tokio::test]
    async fn missing_file_is_an_io_error() {
        let err = create_content(
            "/f".into(),
            ContentPayload::File("/definitely/not/here.bin".into()),
            &opts(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ConnectorError::Io { .. }));
    }

    #[tokio::test]
    async fn custom_serialization_failure_names_the_document() {
        let err = create_content("/row".into(), ContentPayload::Custom(Arc::new(Csv(vec![]))), &opts())
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectorError::Content { uri, .. } if uri == "/row"));
    }

    #[tokio::test]
    async fn provenance_names_the_source_line() {
        let content = create_content("/row/7".into(), ContentPayload::Text("x".into()), &opts())
            .await
            .unwrap();
        assert_eq!(content.provenance(), "/row/7");
        let content = content.with_source(Some(SourceInfo {
            src_id: "people.csv".into(),
            line: 7,
            column: 1,
        }));
        assert_eq!(content.provenance(), "/row/7 (people.csv line 7, column 1)");
    }

    #[test]
    fn guesses_format_from_extension() {
        assert_eq!(DocumentFormat::from_path(Path::new("a/b.JSON")), DocumentFormat::Json);
        assert_eq!(DocumentFormat::from_path(Path::new("a/b.txt")), DocumentFormat::Text);
        assert_eq!(DocumentFormat::from_path(Path::new("a/b")), DocumentFormat::Binary);
    }
}
