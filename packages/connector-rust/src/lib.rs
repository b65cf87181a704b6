//! contentpump connector: batched fault-tolerant document writer, forest split
//! planner, and replica-failover record reader on top of `contentpump-core`.

pub mod config;
pub mod content;
pub mod counters;
pub mod error;
pub mod input;
pub mod output;
mod protocol;
pub mod retry;
pub mod session;
pub mod topology;
pub mod traits;

#[cfg(test)]
mod test_support;

pub use config::{Configuration, ExecutionMode, InputConfig, OutputConfig};
pub use content::{ContentCreateOptions, ContentPayload, DocumentFormat};
pub use counters::{CounterSnapshot, JobCounters};
pub use error::{ConnectorError, ErrorClass, RequestError};
pub use input::{ContentInputFormat, DocumentRecord, ForestRecordReader, ForestSplit};
pub use output::{ContentOutputFormat, ContentWriter};
pub use protocol::{REDACTION_MARKER, REPLICA_MARKER};
pub use session::{Session, SessionFactory, SessionTarget, TransactionMode};
pub use traits::{InputFormat, JobContext, OutputFormat, RecordReader, RecordWriter, TaskContext};
