//! The data plane: multiplexed connections and per-node connection pools.

mod connection;
mod connection_pool;
pub mod tls;

pub(crate) use connection::{
    open_connection, Connection, ConnectionConfig, ErrorReceiver, VerifiedKeyspaceName,
};
pub(crate) use connection_pool::{use_keyspace_result, NodeConnectionPool, PoolConfig};

pub use connection::SelfIdentity;
