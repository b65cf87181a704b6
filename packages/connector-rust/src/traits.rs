//! Contracts between the connector and the job framework that drives it.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::Configuration;
use crate::counters::JobCounters;
use crate::error::ConnectorError;

/// Job-wide context handed to setup code and every task.
#[derive(Debug, Clone, Default)]
pub struct JobContext {
    pub configuration: Configuration,
    pub counters: Arc<JobCounters>,
}

impl JobContext {
    #[must_use]
    pub fn new(configuration: Configuration) -> Self {
        Self {
            configuration,
            counters: Arc::new(JobCounters::new()),
        }
    }

    /// Context of one task of this job.
    #[must_use]
    pub fn task(&self, task_id: usize) -> TaskContext {
        TaskContext {
            job: self.clone(),
            task_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskContext {
    pub job: JobContext,
    /// Position of the task within its job, used to spread initial hosts.
    pub task_id: usize,
}

/// Consumes the records of one output task.
#[async_trait]
pub trait RecordWriter: Send {
    type Key: Send;
    type Value: Send;

    async fn write(&mut self, key: Self::Key, value: Self::Value) -> Result<(), ConnectorError>;

    /// Flushes buffered records and releases connections.
    async fn close(&mut self) -> Result<(), ConnectorError>;
}

#[async_trait]
pub trait OutputFormat: Send + Sync {
    type Writer: RecordWriter;

    /// Validates the job's output settings before any task starts.
    async fn check_output_specs(&self, job: &JobContext) -> Result<(), ConnectorError>;

    async fn record_writer(&self, task: &TaskContext) -> Result<Self::Writer, ConnectorError>;
}

/// Produces the records of one input split.
#[async_trait]
pub trait RecordReader: Send {
    type Split: Send;
    type Key;
    type Value;

    async fn initialize(&mut self, split: Self::Split) -> Result<(), ConnectorError>;

    /// Advances to the next record; `false` once the split is exhausted.
    async fn next_key_value(&mut self) -> Result<bool, ConnectorError>;

    fn current_key(&self) -> Option<&Self::Key>;

    fn current_value(&self) -> Option<&Self::Value>;

    /// Fraction of the split consumed, in `[0, 1]`.
    fn progress(&self) -> f32;

    async fn close(&mut self) -> Result<(), ConnectorError>;
}

#[async_trait]
pub trait InputFormat: Send + Sync {
    type Split: Send;
    type Reader: RecordReader<Split = Self::Split>;

    /// Plans the splits of the whole job.
    async fn get_splits(&self, job: &JobContext) -> Result<Vec<Self::Split>, ConnectorError>;

    fn create_record_reader(&self, task: &TaskContext) -> Result<Self::Reader, ConnectorError>;
}
