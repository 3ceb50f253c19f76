//! Async Rust driver for wide-column databases speaking the native binary
//! protocol (versions 3 through 5, with vendor extensions).
//!
//! The crate is a cluster-session runtime. A [`Cluster`](client::Cluster)
//! handle bootstraps from a set of contact points, keeps a live view of the
//! topology over a dedicated control connection, and owns one multiplexed
//! connection pool per reachable node. [`Session`](client::Session)s created
//! from the handle route statements through pluggable load-balancing, retry
//! and speculative-execution policies, and manage prepared statements across
//! the fleet.
//!
//! ```rust,no_run
//! use corvus::client::{Cluster, ClusterConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = ClusterConfig::new();
//! config.add_contact_point("127.0.0.1:9042".parse()?);
//! let cluster = Cluster::connect(config).await?;
//! let session = cluster.session()?;
//!
//! session.query_unpaged("CREATE KEYSPACE ks WITH replication = \
//!     {'class': 'SimpleStrategy', 'replication_factor': 1}", ()).await?;
//! # Ok(())
//! # }
//! ```

pub mod authentication;
pub mod client;
pub mod cluster;
pub mod errors;
pub mod network;
pub mod policies;
pub mod response;
pub mod routing;
pub mod statement;

pub use corvus_cql::frame::Compression;
pub use corvus_cql::frame::ProtocolVersion;
pub use corvus_cql::{Consistency, SerialConsistency};

pub use client::{Cluster, ClusterConfig, Session};
pub use response::query_result::QueryResult;

#[cfg(test)]
pub(crate) mod test_utils;
