//! Output format: job setup and per-task writer construction.

use std::sync::Arc;

use async_trait::async_trait;
use contentpump_core::AssignmentManager;
use tokio::sync::OnceCell;

use crate::config::{keys, Configuration, ExecutionMode, OutputConfig};
use crate::error::ConnectorError;
use crate::output::ContentWriter;
use crate::session::SessionFactory;
use crate::topology::{discover_output_topology, OutputTopology};
use crate::traits::{JobContext, OutputFormat, TaskContext};

struct JobSetup {
    topology: OutputTopology,
    manager: Arc<AssignmentManager>,
}

/// Writes documents into the database.
///
/// Topology discovery and manager construction happen once per job. In
/// local mode every task shares that manager; in distributed mode each task
/// builds its own from the topology handed over in the configuration.
pub struct ContentOutputFormat {
    factory: Arc<dyn SessionFactory>,
    setup: OnceCell<JobSetup>,
}

impl ContentOutputFormat {
    #[must_use]
    pub fn new(factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            factory,
            setup: OnceCell::new(),
        }
    }

    async fn setup(&self, conf: &Configuration) -> Result<&JobSetup, ConnectorError> {
        self.setup
            .get_or_try_init(|| async {
                let config = OutputConfig::from_configuration(conf)?;
                let topology = discover_output_topology(self.factory.as_ref(), &config).await?;
                let manager = AssignmentManager::shared(
                    topology.policy,
                    topology.forests.clone(),
                    config.batch_size,
                    config.partition.clone(),
                )?;
                Ok::<_, ConnectorError>(JobSetup { topology, manager })
            })
            .await
    }

    /// The topology discovered by [`check_output_specs`](OutputFormat::check_output_specs).
    #[must_use]
    pub fn topology(&self) -> Option<&OutputTopology> {
        self.setup.get().map(|s| &s.topology)
    }

    /// Stores the discovered topology in `conf` for distributed tasks.
    ///
    /// # Errors
    ///
    /// [`ConnectorError::Config`] before the output specs were checked.
    pub fn export_topology(&self, conf: &mut Configuration) -> Result<(), ConnectorError> {
        let topology = self
            .topology()
            .ok_or_else(|| ConnectorError::config("output specs have not been checked"))?;
        conf.set(keys::OUTPUT_TOPOLOGY, serde_json::to_string(topology)?);
        Ok(())
    }
}

fn import_topology(json: &str) -> Result<OutputTopology, ConnectorError> {
    Ok(serde_json::from_str(json)?)
}

#[async_trait]
impl OutputFormat for ContentOutputFormat {
    type Writer = ContentWriter;

    async fn check_output_specs(&self, job: &JobContext) -> Result<(), ConnectorError> {
        self.setup(&job.configuration).await.map(|_| ())
    }

    async fn record_writer(&self, task: &TaskContext) -> Result<ContentWriter, ConnectorError> {
        let conf = &task.job.configuration;
        let config = OutputConfig::from_configuration(conf)?;
        let (manager, fast_load) = match config.mode {
            ExecutionMode::Local => {
                let setup = self.setup(conf).await?;
                (Arc::clone(&setup.manager), setup.topology.fast_load)
            }
            ExecutionMode::Distributed => {
                let topology = match conf.get(keys::OUTPUT_TOPOLOGY) {
                    Some(json) => import_topology(json)?,
                    None => self.setup(conf).await?.topology.clone(),
                };
                let manager = AssignmentManager::shared(
                    topology.policy,
                    topology.forests,
                    config.batch_size,
                    config.partition.clone(),
                )?;
                (manager, topology.fast_load)
            }
        };
        ContentWriter::new(
            &config,
            fast_load,
            manager,
            Arc::clone(&self.factory),
            Arc::clone(&task.job.counters),
            task.task_id,
        )
    }
}
