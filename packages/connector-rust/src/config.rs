//! Job configuration: string key/value options and their typed views.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use contentpump_core::AssignmentPolicyKind;
use serde::{Deserialize, Serialize};

use crate::content::{ContentCreateOptions, DocumentFormat};
use crate::error::ConnectorError;

/// Option keys understood by the connector.
pub mod keys {
    pub const MODE: &str = "mapreduce.marklogic.mode";

    pub const OUTPUT_HOST: &str = "mapreduce.marklogic.output.host";
    pub const OUTPUT_PORT: &str = "mapreduce.marklogic.output.port";
    pub const OUTPUT_FAST_LOAD: &str = "mapreduce.marklogic.output.fastload";
    pub const ASSIGNMENT_POLICY: &str = "mapreduce.marklogic.output.assignmentpolicy";
    pub const BATCH_SIZE: &str = "mapreduce.marklogic.output.batchsize";
    pub const TXN_SIZE: &str = "mapreduce.marklogic.output.transactionsize";
    pub const OUTPUT_PERMISSION: &str = "mapreduce.marklogic.output.content.permission";
    pub const OUTPUT_COLLECTION: &str = "mapreduce.marklogic.output.content.collection";
    pub const OUTPUT_QUALITY: &str = "mapreduce.marklogic.output.content.quality";
    pub const OUTPUT_ENCODING: &str = "mapreduce.marklogic.output.content.encoding";
    pub const OUTPUT_CONTENT_TYPE: &str = "mapreduce.marklogic.output.content.type";
    pub const OUTPUT_TEMPORAL_COLLECTION: &str = "mapreduce.marklogic.output.temporalcollection";
    pub const OUTPUT_URI_PREFIX: &str = "mapreduce.marklogic.output.urlprefix";
    pub const OUTPUT_URI_SUFFIX: &str = "mapreduce.marklogic.output.urlsuffix";
    pub const OUTPUT_PARTITION: &str = "mapreduce.marklogic.output.partition";
    pub const OUTPUT_RESTRICT_HOSTS: &str = "mapreduce.marklogic.output.restricthosts";
    /// Output topology discovered at job setup, handed to distributed tasks.
    pub const OUTPUT_TOPOLOGY: &str = "mapreduce.marklogic.output.topology";

    pub const INPUT_HOST: &str = "mapreduce.marklogic.input.host";
    pub const INPUT_PORT: &str = "mapreduce.marklogic.input.port";
    pub const INPUT_MAX_SPLIT_SIZE: &str = "mapreduce.marklogic.input.maxsplitsize";
    pub const INPUT_RESTRICT_HOSTS: &str = "mapreduce.marklogic.input.restricthosts";
    pub const INPUT_QUERY: &str = "mapreduce.marklogic.input.query";
    pub const INPUT_REDACTION_RULES: &str = "mapreduce.marklogic.input.redaction.rules";
}

pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_BATCH_SIZE: usize = 100;
/// Documents per transaction the default transaction size aims for.
pub const DEFAULT_TXN_DOCUMENTS: usize = 1000;
pub const DEFAULT_MAX_SPLIT_SIZE: u64 = 50_000;
pub const DEFAULT_INPUT_QUERY: &str = "fn:collection()";
pub const DEFAULT_ENCODING: &str = "UTF-8";

/// Flat string options of a job, as handed over by the framework.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Configuration {
    values: BTreeMap<String, String>,
}

impl Configuration {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter.
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.values.insert(key.to_string(), value.into());
    }

    /// Raw value, with blank values treated as unset.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Parses a value with `FromStr`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::Config`] naming the key when the value does
    /// not parse.
    pub fn get_parsed<T>(&self, key: &str) -> Result<Option<T>, ConnectorError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        self.get(key)
            .map(|raw| {
                raw.parse::<T>()
                    .map_err(|e| ConnectorError::config(format!("{key}={raw}: {e}")))
            })
            .transpose()
    }

    /// Comma-separated list; empty when unset.
    #[must_use]
    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Whether tasks share one process with job setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// All tasks run in-process and share the job's assignment manager.
    #[default]
    Local,
    /// Tasks run elsewhere and rebuild the manager from the handed-off topology.
    Distributed,
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "distributed" => Ok(Self::Distributed),
            other => Err(format!("unknown execution mode `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    Read,
    Insert,
    Update,
    NodeUpdate,
    Execute,
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "read" => Ok(Self::Read),
            "insert" => Ok(Self::Insert),
            "update" => Ok(Self::Update),
            "node-update" => Ok(Self::NodeUpdate),
            "execute" => Ok(Self::Execute),
            other => Err(format!("unknown capability `{other}`")),
        }
    }
}

/// A role granted a capability on inserted documents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permission {
    pub role: String,
    pub capability: Capability,
}

/// Parses `role,capability[,role,capability...]`.
///
/// # Errors
///
/// Fails on an odd number of entries or an unknown capability.
pub fn parse_permissions(values: &[String]) -> Result<Vec<Permission>, ConnectorError> {
    if values.len() % 2 != 0 {
        return Err(ConnectorError::config(format!(
            "{} expects role,capability pairs",
            keys::OUTPUT_PERMISSION
        )));
    }
    values
        .chunks(2)
        .map(|pair| {
            let capability = pair[1]
                .parse()
                .map_err(|e: String| ConnectorError::config(e))?;
            Ok(Permission {
                role: pair[0].clone(),
                capability,
            })
        })
        .collect()
}

/// Settings of the output side of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Hosts tried in order for discovery and used for non-fastload writes.
    pub hosts: Vec<String>,
    pub port: u16,
    /// Explicit fastload request; `None` lets topology discovery decide.
    pub fast_load: Option<bool>,
    /// Explicit policy; `None` uses the database's configured policy.
    pub policy: Option<AssignmentPolicyKind>,
    /// Documents per insert request.
    pub batch_size: usize,
    /// Batches per transaction.
    pub txn_size: usize,
    /// Options applied to every created document.
    pub content: ContentCreateOptions,
    pub uri_prefix: String,
    pub uri_suffix: String,
    /// Output partition for RANGE and QUERY placement.
    pub partition: Option<String>,
    /// Talk only to `hosts`, never to forest hosts directly.
    pub restrict_hosts: bool,
    pub mode: ExecutionMode,
}

impl OutputConfig {
    /// Reads and validates the output options.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::Config`] for missing hosts, zero sizes, and
    /// unparsable values.
    pub fn from_configuration(conf: &Configuration) -> Result<Self, ConnectorError> {
        let hosts = conf.get_list(keys::OUTPUT_HOST);
        if hosts.is_empty() {
            return Err(ConnectorError::config(format!("{} is required", keys::OUTPUT_HOST)));
        }
        let batch_size = conf
            .get_parsed::<usize>(keys::BATCH_SIZE)?
            .unwrap_or(DEFAULT_BATCH_SIZE);
        if batch_size == 0 {
            return Err(ConnectorError::config(format!("{} must be positive", keys::BATCH_SIZE)));
        }
        let txn_size = conf
            .get_parsed::<usize>(keys::TXN_SIZE)?
            .unwrap_or_else(|| (DEFAULT_TXN_DOCUMENTS / batch_size).max(1));
        if txn_size == 0 {
            return Err(ConnectorError::config(format!("{} must be positive", keys::TXN_SIZE)));
        }
        let policy = conf
            .get(keys::ASSIGNMENT_POLICY)
            .map(str::parse::<AssignmentPolicyKind>)
            .transpose()?;

        let content = ContentCreateOptions {
            permissions: parse_permissions(&conf.get_list(keys::OUTPUT_PERMISSION))?,
            collections: conf.get_list(keys::OUTPUT_COLLECTION),
            quality: conf.get_parsed(keys::OUTPUT_QUALITY)?.unwrap_or(0),
            encoding: conf
                .get(keys::OUTPUT_ENCODING)
                .unwrap_or(DEFAULT_ENCODING)
                .to_string(),
            format: conf
                .get_parsed::<DocumentFormat>(keys::OUTPUT_CONTENT_TYPE)?
                .unwrap_or_default(),
            temporal_collection: conf
                .get(keys::OUTPUT_TEMPORAL_COLLECTION)
                .map(ToString::to_string),
        };

        Ok(Self {
            hosts,
            port: conf.get_parsed(keys::OUTPUT_PORT)?.unwrap_or(DEFAULT_PORT),
            fast_load: conf.get_parsed(keys::OUTPUT_FAST_LOAD)?,
            policy,
            batch_size,
            txn_size,
            content,
            uri_prefix: conf.get(keys::OUTPUT_URI_PREFIX).unwrap_or_default().to_string(),
            uri_suffix: conf.get(keys::OUTPUT_URI_SUFFIX).unwrap_or_default().to_string(),
            partition: conf.get(keys::OUTPUT_PARTITION).map(ToString::to_string),
            restrict_hosts: conf.get_parsed(keys::OUTPUT_RESTRICT_HOSTS)?.unwrap_or(false),
            mode: conf.get_parsed(keys::MODE)?.unwrap_or_default(),
        })
    }

    /// Whether inserts run in explicit multi-statement transactions.
    ///
    /// A job inserting one document per transaction gets auto-commit.
    #[must_use]
    pub fn uses_update_transactions(&self) -> bool {
        self.batch_size > 1 || self.txn_size > 1
    }
}

/// Settings of the input side of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputConfig {
    /// Hosts tried in order for the split query.
    pub hosts: Vec<String>,
    pub port: u16,
    /// Upper bound on records per split.
    pub max_split_size: u64,
    /// Read only through `hosts`, never from forest hosts directly.
    pub restrict_hosts: bool,
    /// Document selection evaluated against each forest range.
    pub query: String,
    /// Redaction rule collections applied server-side.
    pub redaction_rules: Vec<String>,
    pub mode: ExecutionMode,
}

impl InputConfig {
    /// Reads and validates the input options.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectorError::Config`] for missing hosts, a zero split
    /// size, and unparsable values.
    pub fn from_configuration(conf: &Configuration) -> Result<Self, ConnectorError> {
        let hosts = conf.get_list(keys::INPUT_HOST);
        if hosts.is_empty() {
            return Err(ConnectorError::config(format!("{} is required", keys::INPUT_HOST)));
        }
        let max_split_size = conf
            .get_parsed::<u64>(keys::INPUT_MAX_SPLIT_SIZE)?
            .unwrap_or(DEFAULT_MAX_SPLIT_SIZE);
        if max_split_size == 0 {
            return Err(ConnectorError::config(format!(
                "{} must be positive",
                keys::INPUT_MAX_SPLIT_SIZE
            )));
        }
        Ok(Self {
            hosts,
            port: conf.get_parsed(keys::INPUT_PORT)?.unwrap_or(DEFAULT_PORT),
            max_split_size,
            restrict_hosts: conf.get_parsed(keys::INPUT_RESTRICT_HOSTS)?.unwrap_or(false),
            query: conf
                .get(keys::INPUT_QUERY)
                .unwrap_or(DEFAULT_INPUT_QUERY)
                .to_string(),
            redaction_rules: conf.get_list(keys::INPUT_REDACTION_RULES),
            mode: conf.get_parsed(keys::MODE)?.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output_conf() -> Configuration {
        Configuration::new().with(keys::OUTPUT_HOST, "hostA, hostB")
    }

    #[test]
    fn output_defaults() {
        let cfg = OutputConfig::from_configuration(&output_conf()).unwrap();
        assert_eq!(cfg.hosts, vec!["hostA", "hostB"]);
        assert_eq!(cfg.port, 8000);
        assert_eq!(cfg.batch_size, 100);
        assert_eq!(cfg.txn_size, 10);
        assert_eq!(cfg.fast_load, None);
        assert_eq!(cfg.policy, None);
        assert_eq!(cfg.content.encoding, "UTF-8");
        assert_eq!(cfg.content.format, DocumentFormat::Mixed);
        assert_eq!(cfg.mode, ExecutionMode::Local);
        assert!(!cfg.restrict_hosts);
        assert!(cfg.uses_update_transactions());
    }

    #[test]
    fn transaction_size_default_follows_batch_size() {
        let cfg = OutputConfig::from_configuration(&output_conf().with(keys::BATCH_SIZE, "3000"))
            .unwrap();
        assert_eq!(cfg.txn_size, 1);
        let cfg = OutputConfig::from_configuration(&output_conf().with(keys::BATCH_SIZE, "1"))
            .unwrap();
        assert_eq!(cfg.txn_size, 1000);
    }

    #[test]
    fn single_document_transactions_use_auto_commit() {
        let cfg = OutputConfig::from_configuration(
            &output_conf()
                .with(keys::BATCH_SIZE, "1")
                .with(keys::TXN_SIZE, "1"),
        )
        .unwrap();
        assert!(!cfg.uses_update_transactions());
    }

    #[test]
    fn missing_host_is_rejected() {
        let err = OutputConfig::from_configuration(&Configuration::new()).unwrap_err();
        assert!(matches!(err, ConnectorError::Config(msg) if msg.contains(keys::OUTPUT_HOST)));
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let err = OutputConfig::from_configuration(&output_conf().with(keys::BATCH_SIZE, "0"))
            .unwrap_err();
        assert!(matches!(err, ConnectorError::Config(_)));
    }

    #[test]
    fn unparsable_values_name_the_key() {
        let err = OutputConfig::from_configuration(&output_conf().with(keys::BATCH_SIZE, "lots"))
            .unwrap_err();
        assert!(matches!(err, ConnectorError::Config(msg) if msg.starts_with(keys::BATCH_SIZE)));
    }

    #[test]
    fn unknown_policy_is_rejected() {
        let err = OutputConfig::from_configuration(
            &output_conf().with(keys::ASSIGNMENT_POLICY, "random"),
        )
        .unwrap_err();
        assert!(matches!(err, ConnectorError::Assignment(_)));
    }

    #[test]
    fn parses_content_options() {
        let cfg = OutputConfig::from_configuration(
            &output_conf()
                .with(keys::OUTPUT_PERMISSION, "reader,read,writer,update")
                .with(keys::OUTPUT_COLLECTION, "a,b")
                .with(keys::OUTPUT_QUALITY, "-2")
                .with(keys::OUTPUT_CONTENT_TYPE, "json")
                .with(keys::ASSIGNMENT_POLICY, "Bucket")
                .with(keys::OUTPUT_FAST_LOAD, "true"),
        )
        .unwrap();
        assert_eq!(
            cfg.content.permissions,
            vec![
                Permission { role: "reader".into(), capability: Capability::Read },
                Permission { role: "writer".into(), capability: Capability::Update },
            ]
        );
        assert_eq!(cfg.content.collections, vec!["a", "b"]);
        assert_eq!(cfg.content.quality, -2);
        assert_eq!(cfg.content.format, DocumentFormat::Json);
        assert_eq!(cfg.policy, Some(AssignmentPolicyKind::Bucket));
        assert_eq!(cfg.fast_load, Some(true));
    }

    #[test]
    fn odd_permission_list_is_rejected() {
        let err = parse_permissions(&["reader".to_string()]).unwrap_err();
        assert!(matches!(err, ConnectorError::Config(_)));
    }

    #[test]
    fn input_defaults_and_overrides() {
        let cfg = InputConfig::from_configuration(
            &Configuration::new().with(keys::INPUT_HOST, "h1"),
        )
        .unwrap();
        assert_eq!(cfg.max_split_size, 50_000);
        assert_eq!(cfg.query, "fn:collection()");
        assert!(cfg.redaction_rules.is_empty());

        let cfg = InputConfig::from_configuration(
            &Configuration::new()
                .with(keys::INPUT_HOST, "h1")
                .with(keys::INPUT_MAX_SPLIT_SIZE, "10")
                .with(keys::INPUT_REDACTION_RULES, "pii,ssn")
                .with(keys::MODE, "distributed"),
        )
        .unwrap();
        assert_eq!(cfg.max_split_size, 10);
        assert_eq!(cfg.redaction_rules, vec!["pii", "ssn"]);
        assert_eq!(cfg.mode, ExecutionMode::Distributed);
    }

    #[test]
    fn blank_values_count_as_unset() {
        let conf = output_conf().with(keys::OUTPUT_PARTITION, "  ");
        assert_eq!(OutputConfig::from_configuration(&conf).unwrap().partition, None);
    }
}
