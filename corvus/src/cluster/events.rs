//! Notifications emitted to observers after a metadata snapshot swap.

use uuid::Uuid;

/// A change of cluster state, delivered through
/// [`Cluster::subscribe_events`](crate::client::Cluster::subscribe_events).
///
/// Every event carries the revision of the snapshot it describes; an
/// observer holding an older snapshot can reconcile by fetching the
/// current one.
#[derive(Debug, Clone)]
pub struct ClusterEvent {
    pub kind: ClusterEventKind,
    /// Revision of the metadata snapshot this event belongs to.
    pub revision: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ClusterEventKind {
    HostAdded(Uuid),
    HostRemoved(Uuid),
    HostUp(Uuid),
    HostDown(Uuid),
    SchemaChanged { keyspace: Option<String> },
    /// The control connection is down; metadata may be stale until it is
    /// re-established.
    ControlConnectionDown,
}
