//! One-time discovery of the output forest topology.
//!
//! Servers of different versions expose different discovery functions, so
//! discovery first asks which of them exist and falls back to the older
//! queries for the ones that do not.

use std::fmt;
use std::str::FromStr;

use contentpump_core::{AssignmentPolicyKind, ForestId, ForestInfo, ForestTopology, ReplicaInfo};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::OutputConfig;
use crate::error::ConnectorError;
use crate::protocol::ItemCursor;
use crate::session::{
    close_quietly, open_first_reachable, Query, ResultItem, Session, SessionFactory, TransactionMode,
};

pub const ASSIGNMENT_POLICY_FN: &str = "hadoop:get-assignment-policy";
pub const FOREST_HOST_INFO_FN: &str = "hadoop:get-forest-host-info";
pub const REPLICA_HOSTS_FN: &str = "hadoop:get-forest-replica-hosts";

/// Answers one boolean per name in `$functions`, in order.
pub const FUNCTION_PROBE_QUERY: &str = r#"xquery version "1.0-ml";
declare variable $functions as xs:string external;
for $f in fn:tokenize($functions, ",")
return fn:function-available($f)"#;

/// Answers the database's assignment policy name.
pub const ASSIGNMENT_POLICY_QUERY: &str = r#"xquery version "1.0-ml";
import module namespace hadoop = "http://marklogic.com/xdmp/hadoop" at "/MarkLogic/hadoop.xqy";
hadoop:get-assignment-policy()"#;

/// Answers `(forest, host, updatable, document count)` per forest.
pub const FOREST_HOST_INFO_QUERY: &str = r#"xquery version "1.0-ml";
import module namespace hadoop = "http://marklogic.com/xdmp/hadoop" at "/MarkLogic/hadoop.xqy";
hadoop:get-forest-host-info()"#;

/// Older servers: `(forest, host)` per forest, every forest updatable.
pub const LEGACY_FOREST_HOST_QUERY: &str = r#"xquery version "1.0-ml";
for $f in xdmp:database-forests(xdmp:database())
return ($f, xdmp:host-name(xdmp:forest-host($f)))"#;

/// Answers `(forest, n, n * (replica forest, host))` per forest, primary first.
pub const REPLICA_HOSTS_QUERY: &str = r#"xquery version "1.0-ml";
import module namespace hadoop = "http://marklogic.com/xdmp/hadoop" at "/MarkLogic/hadoop.xqy";
hadoop:get-forest-replica-hosts()"#;

/// Older servers: the same stream as [`REPLICA_HOSTS_QUERY`], built from
/// forest status.
pub const LEGACY_REPLICA_QUERY: &str = r#"xquery version "1.0-ml";
declare namespace fs = "http://marklogic.com/xdmp/status/forest";
for $f in xdmp:database-forests(xdmp:database())
let $status := xdmp:forest-status($f)
let $replicas := ($f, $status/fs:replica-forests/fs:replica-forest/fs:replica-forest-id ! xs:unsignedLong(.))
return ($f, fn:count($replicas),
  for $r in $replicas return ($r, xdmp:host-name(xdmp:forest-host($r))))"#;

pub const DIRECTORY_CREATION_QUERY: &str = r#"xquery version "1.0-ml";
import module namespace admin = "http://marklogic.com/xdmp/admin" at "/MarkLogic/admin.xqy";
admin:database-get-directory-creation(admin:get-configuration(), xdmp:database())"#;

/// Answers the forest ids of partition `$partition`.
pub const PARTITION_FORESTS_QUERY: &str = r#"xquery version "1.0-ml";
import module namespace hadoop = "http://marklogic.com/xdmp/hadoop" at "/MarkLogic/hadoop.xqy";
declare variable $partition as xs:string external;
hadoop:get-partition-forests($partition)"#;

/// Which discovery functions the server provides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerCapabilities {
    pub assignment_policy: bool,
    pub forest_host_info: bool,
    pub replica_hosts: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DirectoryCreation {
    Manual,
    ManualEnforced,
    Automatic,
}

impl FromStr for DirectoryCreation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "manual-enforced" => Ok(Self::ManualEnforced),
            "automatic" => Ok(Self::Automatic),
            other => Err(format!("unknown directory creation mode `{other}`")),
        }
    }
}

impl fmt::Display for DirectoryCreation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Manual => "manual",
            Self::ManualEnforced => "manual-enforced",
            Self::Automatic => "automatic",
        })
    }
}

/// Everything job setup learns from the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputTopology {
    pub policy: AssignmentPolicyKind,
    pub forests: ForestTopology,
    /// Whether writers pick forests client-side.
    pub fast_load: bool,
    pub directory_creation: DirectoryCreation,
}

/// Discovers policy, forests, and replicas through the first reachable
/// output host.
///
/// # Errors
///
/// - [`ConnectorError::NoReachableHost`] when no output host accepts a session
/// - [`ConnectorError::Request`] when a discovery query fails
/// - [`ConnectorError::Protocol`] on a malformed answer
pub async fn discover_output_topology(
    factory: &dyn SessionFactory,
    config: &OutputConfig,
) -> Result<OutputTopology, ConnectorError> {
    let mut session =
        open_first_reachable(factory, &config.hosts, config.port, TransactionMode::Auto).await?;
    let result = discover_with(session.as_mut(), config).await;
    close_quietly(session.as_mut()).await;
    result
}

async fn discover_with(
    session: &mut dyn Session,
    config: &OutputConfig,
) -> Result<OutputTopology, ConnectorError> {
    let caps = probe_capabilities(session).await?;

    let policy = if caps.assignment_policy {
        let server_policy = query_policy(session).await?;
        config.policy.unwrap_or(server_policy)
    } else {
        if config.policy.is_some_and(|p| p != AssignmentPolicyKind::Legacy) {
            warn!(requested = ?config.policy, "server predates assignment policies, using legacy");
        }
        AssignmentPolicyKind::Legacy
    };

    let mut forests = if caps.forest_host_info {
        parse_forest_host_info(&submit(session, Query::new(FOREST_HOST_INFO_QUERY)).await?)?
    } else {
        parse_legacy_forest_hosts(&submit(session, Query::new(LEGACY_FOREST_HOST_QUERY)).await?)?
    };

    let replica_query = if caps.replica_hosts {
        REPLICA_HOSTS_QUERY
    } else {
        LEGACY_REPLICA_QUERY
    };
    let replicas = parse_replica_stream(&submit(session, Query::new(replica_query)).await?)?;
    attach_replicas(&mut forests, replicas)?;

    let directory_creation = query_directory_creation(session).await?;
    let fast_load = resolve_fast_load(config, directory_creation);

    let mut forests = ForestTopology::new(forests);
    if config.restrict_hosts {
        forests = forests.restrict_to_hosts(&config.hosts);
    }

    info!(
        policy = %policy,
        forests = forests.len(),
        hosts = forests.hosts().len(),
        fast_load,
        directory_creation = %directory_creation,
        "output topology discovered"
    );
    Ok(OutputTopology {
        policy,
        forests,
        fast_load,
        directory_creation,
    })
}

/// Client-side placement needs direct forest access and no server-created
/// directories.
fn resolve_fast_load(config: &OutputConfig, directory_creation: DirectoryCreation) -> bool {
    let requested = config.fast_load;
    if config.restrict_hosts {
        if requested == Some(true) {
            warn!("fastload disabled: restrict hosts is on");
        }
        return false;
    }
    if directory_creation == DirectoryCreation::Automatic {
        if requested == Some(true) {
            warn!("fastload disabled: directory creation is automatic");
        }
        return false;
    }
    requested.unwrap_or(true)
}

async fn submit(
    session: &mut dyn Session,
    query: Query,
) -> Result<Vec<ResultItem>, ConnectorError> {
    session.submit(&query).await.map_err(ConnectorError::Request)
}

async fn probe_capabilities(session: &mut dyn Session) -> Result<ServerCapabilities, ConnectorError> {
    let names = [ASSIGNMENT_POLICY_FN, FOREST_HOST_INFO_FN, REPLICA_HOSTS_FN].join(",");
    let items = submit(
        session,
        Query::new(FUNCTION_PROBE_QUERY).with_variable("functions", names),
    )
    .await?;
    let mut cursor = ItemCursor::new(&items);
    let caps = ServerCapabilities {
        assignment_policy: cursor.next_bool(ASSIGNMENT_POLICY_FN)?,
        forest_host_info: cursor.next_bool(FOREST_HOST_INFO_FN)?,
        replica_hosts: cursor.next_bool(REPLICA_HOSTS_FN)?,
    };
    debug!(?caps, "probed server capabilities");
    Ok(caps)
}

async fn query_policy(session: &mut dyn Session) -> Result<AssignmentPolicyKind, ConnectorError> {
    let items = submit(session, Query::new(ASSIGNMENT_POLICY_QUERY)).await?;
    let name = ItemCursor::new(&items).next_string("assignment policy")?;
    name.parse()
        .map_err(|_| ConnectorError::Protocol(format!("unknown assignment policy `{name}`")))
}

async fn query_directory_creation(
    session: &mut dyn Session,
) -> Result<DirectoryCreation, ConnectorError> {
    let items = submit(session, Query::new(DIRECTORY_CREATION_QUERY)).await?;
    ItemCursor::new(&items)
        .next_string("directory creation mode")?
        .parse()
        .map_err(ConnectorError::Protocol)
}

fn parse_forest_host_info(
    items: &[ResultItem],
) -> Result<Vec<ForestInfo>, ConnectorError> {
    let mut cursor = ItemCursor::new(items);
    let mut forests = Vec::new();
    while !cursor.is_done() {
        let id = cursor.next_forest_id()?;
        let host = cursor.next_string("forest host")?;
        let updatable = cursor.next_bool("updatable flag")?;
        let doc_count = cursor.next_count("document count")? as u64;
        let mut forest = ForestInfo::new(id, host).with_doc_count(doc_count);
        forest.updatable = updatable;
        forests.push(forest);
    }
    Ok(forests)
}

fn parse_legacy_forest_hosts(
    items: &[ResultItem],
) -> Result<Vec<ForestInfo>, ConnectorError> {
    let mut cursor = ItemCursor::new(items);
    let mut forests = Vec::new();
    while !cursor.is_done() {
        let id = cursor.next_forest_id()?;
        let host = cursor.next_string("forest host")?;
        forests.push(ForestInfo::new(id, host));
    }
    Ok(forests)
}

/// Decodes `(forest, n, n * (replica forest, host))` groups.
pub(crate) fn parse_replica_groups(
    cursor: &mut ItemCursor<'_>,
) -> Result<Vec<(ForestId, Vec<ReplicaInfo>)>, ConnectorError> {
    let mut groups = Vec::new();
    while !cursor.is_done() {
        let forest = cursor.next_forest_id()?;
        let n = cursor.next_count("replica count")?;
        if n.saturating_mul(2) > cursor.remaining() {
            return Err(ConnectorError::Protocol(format!(
                "forest {forest} announces {n} replicas, {} items left",
                cursor.remaining()
            )));
        }
        let mut replicas = Vec::with_capacity(n);
        for _ in 0..n {
            let replica = cursor.next_forest_id()?;
            let host = cursor.next_string("replica host")?;
            replicas.push(ReplicaInfo::new(replica, host));
        }
        groups.push((forest, replicas));
    }
    Ok(groups)
}

fn parse_replica_stream(
    items: &[ResultItem],
) -> Result<Vec<(ForestId, Vec<ReplicaInfo>)>, ConnectorError> {
    parse_replica_groups(&mut ItemCursor::new(items))
}

fn attach_replicas(
    forests: &mut [ForestInfo],
    groups: Vec<(ForestId, Vec<ReplicaInfo>)>,
) -> Result<(), ConnectorError> {
    for (id, replicas) in groups {
        let forest = forests
            .iter_mut()
            .find(|f| f.id == id)
            .ok_or_else(|| ConnectorError::Protocol(format!("replicas for unknown forest {id}")))?;
        forest.replicas = replicas;
    }
    Ok(())
}

/// Asks the server which forests make up `partition`.
///
/// # Errors
///
/// [`ConnectorError::Request`] when the query fails, [`ConnectorError::Protocol`]
/// on a malformed answer.
pub async fn fetch_partition_forests(
    session: &mut dyn Session,
    partition: &str,
) -> Result<Vec<ForestId>, ConnectorError> {
    let items = submit(
        session,
        Query::new(PARTITION_FORESTS_QUERY).with_variable("partition", partition),
    )
    .await?;
    let mut cursor = ItemCursor::new(&items);
    let mut forests = Vec::new();
    while !cursor.is_done() {
        forests.push(cursor.next_forest_id()?);
    }
    Ok(forests)
}
