//! Error taxonomy for the connector.
//!
//! Request-level failures are classified once, where they are first
//! observed, into an [`ErrorClass`]. Retry loops branch on that class and
//! never inspect messages or error types again.

use std::path::PathBuf;

use contentpump_core::AssignmentError;

/// How a failed request may be handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Connection loss or transient server trouble: back off, rotate, retry.
    Retryable,
    /// The request itself is wrong (syntax, missing module): retrying cannot help.
    Permanent,
    /// The job cannot proceed at all (credentials, privileges).
    Fatal,
}

/// Server error codes whose requests are malformed rather than unlucky.
const PERMANENT_CODES: &[&str] = &[
    "XDMP-UNEXPECTED",
    "XDMP-BADCHAR",
    "XDMP-UNDFUN",
    "XDMP-MODNOTFOUND",
    "XDMP-NOSUCHDB",
    "XDMP-DOCROOTTEXT",
    "XDMP-AS",
    "XDMP-ARGTYPE",
];

impl ErrorClass {
    /// Classifies a server-reported error code.
    #[must_use]
    pub fn from_server_code(code: &str) -> Self {
        if code.starts_with("SEC-") {
            Self::Fatal
        } else if PERMANENT_CODES.contains(&code) {
            Self::Permanent
        } else {
            Self::Retryable
        }
    }

    #[must_use]
    pub fn is_retryable(self) -> bool {
        self == Self::Retryable
    }
}

/// A failed request to the database, already classified.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}{message}", code_prefix(.code.as_deref()))]
pub struct RequestError {
    class: ErrorClass,
    code: Option<String>,
    message: String,
}

impl RequestError {
    /// The host could not be reached or the connection dropped.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Retryable,
            code: None,
            message: message.into(),
        }
    }

    /// The server answered with an error code.
    #[must_use]
    pub fn server(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        Self {
            class: ErrorClass::from_server_code(&code),
            code: Some(code),
            message: message.into(),
        }
    }

    /// A client-side failure that retrying cannot fix.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Permanent,
            code: None,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn class(&self) -> ErrorClass {
        self.class
    }

    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.class.is_retryable()
    }
}

fn code_prefix(code: Option<&str>) -> String {
    code.map(|c| format!("{c}: ")).unwrap_or_default()
}

/// Errors surfaced to the job or task driving the connector.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Assignment(#[from] AssignmentError),
    #[error("none of the hosts {hosts:?} could be reached")]
    NoReachableHost {
        hosts: Vec<String>,
        #[source]
        last: Option<RequestError>,
    },
    #[error("malformed result stream: {0}")]
    Protocol(String),
    #[error("{operation} failed after {attempts} attempts")]
    RetriesExhausted {
        operation: &'static str,
        attempts: u32,
        #[source]
        source: RequestError,
    },
    #[error("request failed")]
    Request(#[source] RequestError),
    #[error("failed to read {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot create content for {uri}: {message}")]
    Content { uri: String, message: String },
    #[error("malformed topology hand-off")]
    Topology(#[from] serde_json::Error),
    #[error("writer or reader is not open")]
    Closed,
}

impl ConnectorError {
    /// Shorthand for configuration errors.
    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_and_module_errors_are_permanent() {
        assert_eq!(ErrorClass::from_server_code("XDMP-UNEXPECTED"), ErrorClass::Permanent);
        assert_eq!(ErrorClass::from_server_code("XDMP-MODNOTFOUND"), ErrorClass::Permanent);
        assert_eq!(ErrorClass::from_server_code("XDMP-UNDFUN"), ErrorClass::Permanent);
    }

    #[test]
    fn security_errors_are_fatal() {
        assert_eq!(ErrorClass::from_server_code("SEC-PRIV"), ErrorClass::Fatal);
    }

    #[test]
    fn everything_else_is_retryable() {
        assert_eq!(ErrorClass::from_server_code("XDMP-FORESTNOTOPEN"), ErrorClass::Retryable);
        assert_eq!(ErrorClass::from_server_code("XDMP-SYNCREPLICA"), ErrorClass::Retryable);
        assert!(RequestError::connection("refused").is_retryable());
    }

    #[test]
    fn display_includes_code() {
        let e = RequestError::server("XDMP-UNDFUN", "undefined function");
        assert_eq!(e.to_string(), "XDMP-UNDFUN: undefined function");
        assert_eq!(RequestError::connection("refused").to_string(), "refused");
    }

    #[test]
    fn exhausted_error_chains_source() {
        let err = ConnectorError::RetriesExhausted {
            operation: "batch insert",
            attempts: 15,
            source: RequestError::connection("refused"),
        };
        assert_eq!(err.to_string(), "batch insert failed after 15 attempts");
        let source = std::error::Error::source(&err).map(ToString::to_string);
        assert_eq!(source.as_deref(), Some("refused"));
    }
}
