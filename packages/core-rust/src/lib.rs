//! contentpump core: document URIs, forest topology, legacy URI hashing, and
//! the assignment policies that place documents on forests.
//!
//! Everything here is synchronous and free of I/O. The connector crate
//! discovers the topology from a server and drives these types.

pub mod assignment;
pub mod error;
pub mod forest;
pub mod hash;
pub mod policy;
pub mod uri;

pub use assignment::AssignmentManager;
pub use error::AssignmentError;
pub use forest::{ForestId, ForestInfo, ForestTopology, ReplicaInfo};
pub use policy::{AssignmentPolicy, AssignmentPolicyKind};
pub use uri::{DocumentUri, DocumentUriWithSourceInfo, SourceInfo};
