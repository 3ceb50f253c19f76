//! The control plane: cluster topology, schema metadata and the worker
//! that keeps them current.

pub mod events;
pub mod metadata;
pub mod node;
pub mod state;

pub(crate) mod control_connection;
pub(crate) mod worker;

pub use events::{ClusterEvent, ClusterEventKind};
pub use metadata::Keyspace;
pub use node::{KnownNode, Node, NodeAddr, NodeRef};
pub use state::ClusterState;
