//! The user-facing surface: cluster configuration, the cluster handle and
//! sessions.

pub mod cluster;
pub mod config;
pub mod session;

pub(crate) mod prepared_registry;

pub use cluster::Cluster;
pub use config::{ClusterConfig, PoolingOptions, QueryOptions, SocketOptions};
pub use session::Session;
