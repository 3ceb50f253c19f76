//! A cluster node as seen by the driver: identity, topology attributes,
//! liveness marker and the connection pool towards it.

use std::fmt::Display;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use itertools::Itertools;
use thiserror::Error;
use tokio::net::{lookup_host, ToSocketAddrs};
use tracing::warn;
use uuid::Uuid;

use crate::cluster::metadata::{PeerEndpoint, UntranslatedEndpoint};
use crate::errors::{ConnectionPoolError, UseKeyspaceError};
use crate::network::{Connection, NodeConnectionPool, PoolConfig, VerifiedKeyspaceName};
use crate::policies::load_balancing::NodeDistance;

/// An address of a node, tagged by whether it may be subject to address
/// translation.
///
/// Addresses fetched from peer tables were broadcast by the nodes
/// themselves and may need translating before they are routable. The
/// control connection's own address is known-routable; it is also used to
/// mitigate nodes misconfigured to broadcast 0.0.0.0. Translation is never
/// applied to the `Untranslatable` variant.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodeAddr {
    /// Broadcast by the node itself; subject to the address translator.
    Translatable(SocketAddr),
    /// Derived from the control connection's address; used verbatim.
    Untranslatable(SocketAddr),
}

impl NodeAddr {
    pub(crate) fn into_inner(self) -> SocketAddr {
        match self {
            NodeAddr::Translatable(addr) | NodeAddr::Untranslatable(addr) => addr,
        }
    }

    pub fn ip(&self) -> IpAddr {
        self.into_inner().ip()
    }

    pub fn port(&self) -> u16 {
        self.into_inner().port()
    }
}

impl Display for NodeAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.into_inner())
    }
}

/// A node of the cluster, together with its connection pool.
///
/// A node that changes its broadcast address is represented by a fresh
/// instance (the pool is preserved and re-pointed).
#[derive(Debug)]
pub struct Node {
    /// Cluster-wide unique identifier of the node.
    pub host_id: Uuid,
    /// The address used to connect to the node.
    pub address: NodeAddr,
    /// Datacenter of the node, if known.
    pub datacenter: Option<String>,
    /// Rack of the node, if known.
    pub rack: Option<String>,

    /// Pool of connections towards this node. `None` when the node is
    /// Ignored by the load balancing policy.
    pool: Option<NodeConnectionPool>,

    // Set when a STATUS_CHANGE/DOWN event or repeated heartbeat failures
    // marked the node dead; cleared by an UP event or a topology refresh.
    down_marker: AtomicBool,

    // Unit tests build Nodes without pools; this flag lets them count as
    // connected so that policies can be exercised.
    #[cfg(test)]
    enabled_as_connected: AtomicBool,
}

/// The form in which Nodes are usually passed around the driver.
pub type NodeRef<'a> = &'a Arc<Node>;

impl Node {
    /// Creates a new node, whose pool starts connecting in the background.
    pub(crate) fn new(
        peer: PeerEndpoint,
        pool_config: &PoolConfig,
        distance: NodeDistance,
        keyspace_name: Option<VerifiedKeyspaceName>,
    ) -> Self {
        let host_id = peer.host_id;
        let address = peer.address;
        let datacenter = peer.datacenter.clone();
        let rack = peer.rack.clone();

        let pool = (distance != NodeDistance::Ignored).then(|| {
            NodeConnectionPool::new(
                UntranslatedEndpoint::Peer(peer),
                pool_config,
                distance,
                keyspace_name,
                None,
            )
        });

        Node {
            host_id,
            address,
            datacenter,
            rack,
            pool,
            down_marker: AtomicBool::new(false),
            #[cfg(test)]
            enabled_as_connected: AtomicBool::new(false),
        }
    }

    /// A pool-less stand-in used to ask the load balancing policy for the
    /// distance of a peer before its Node (and pool) exists. Distance is a
    /// function of the peer's datacenter and rack only.
    pub(crate) fn new_distance_probe(peer: &PeerEndpoint) -> Self {
        Node {
            host_id: peer.host_id,
            address: peer.address,
            datacenter: peer.datacenter.clone(),
            rack: peer.rack.clone(),
            pool: None,
            down_marker: AtomicBool::new(false),
            #[cfg(test)]
            enabled_as_connected: AtomicBool::new(false),
        }
    }

    /// Recreates the Node after an IP change, preserving and re-pointing
    /// the pool.
    pub(crate) fn inherit_with_ip_changed(node: &Node, endpoint: PeerEndpoint) -> Self {
        let address = endpoint.address;
        if let Some(ref pool) = node.pool {
            pool.update_endpoint(UntranslatedEndpoint::Peer(endpoint));
        }
        Self {
            address,
            datacenter: node.datacenter.clone(),
            rack: node.rack.clone(),
            host_id: node.host_id,
            pool: node.pool.clone(),
            down_marker: AtomicBool::new(node.down_marker.load(Ordering::Relaxed)),
            #[cfg(test)]
            enabled_as_connected: AtomicBool::new(
                node.enabled_as_connected.load(Ordering::Relaxed),
            ),
        }
    }

    /// Whether the node is believed to be up. Nodes start as up; only an
    /// explicit DOWN event or connection-level evidence marks them down.
    pub fn is_up(&self) -> bool {
        !self.down_marker.load(Ordering::Relaxed)
    }

    pub(crate) fn change_down_marker(&self, is_down: bool) {
        self.down_marker.store(is_down, Ordering::Relaxed);
    }

    /// Whether the driver keeps connections to this node at all.
    /// Ignored nodes have no pool.
    pub fn is_enabled(&self) -> bool {
        #[cfg(test)]
        if self.enabled_as_connected.load(Ordering::Relaxed) {
            return true;
        }
        self.pool.is_some()
    }

    /// Whether the driver currently holds at least one open connection to
    /// this node.
    pub fn is_connected(&self) -> bool {
        #[cfg(test)]
        if self.enabled_as_connected.load(Ordering::Relaxed) {
            return true;
        }
        self.pool.as_ref().is_some_and(|pool| pool.is_connected())
    }

    pub(crate) fn borrow_connection(&self) -> Result<Arc<Connection>, ConnectionPoolError> {
        self.get_pool()?.borrow_connection()
    }

    pub(crate) fn get_working_connections(
        &self,
    ) -> Result<Vec<Arc<Connection>>, ConnectionPoolError> {
        self.get_pool()?.get_working_connections()
    }

    pub(crate) async fn use_keyspace(
        &self,
        keyspace_name: VerifiedKeyspaceName,
    ) -> Result<(), UseKeyspaceError> {
        if let Some(pool) = &self.pool {
            pool.use_keyspace(keyspace_name).await?;
        }
        Ok(())
    }

    pub(crate) async fn update_distance(&self, distance: NodeDistance) {
        if let Some(pool) = &self.pool {
            pool.set_distance(distance).await;
        }
    }

    pub(crate) async fn close_pool(&self) {
        if let Some(pool) = &self.pool {
            pool.close().await;
        }
    }

    pub(crate) async fn wait_until_pool_initialized(&self) {
        if let Some(pool) = &self.pool {
            pool.wait_until_initialized().await;
        }
    }

    fn get_pool(&self) -> Result<&NodeConnectionPool, ConnectionPoolError> {
        self.pool
            .as_ref()
            .ok_or(ConnectionPoolError::HostIgnored)
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.host_id == other.host_id
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host_id.hash(state);
    }
}

/// A database server known at session startup, before resolution.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[non_exhaustive]
pub enum KnownNode {
    /// A node identified by a hostname, resolved via DNS.
    Hostname(String),
    /// A node identified by a socket address.
    Address(SocketAddr),
}

/// A contact point with its address already resolved.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedContactPoint {
    pub(crate) address: SocketAddr,
}

#[derive(Error, Debug)]
pub(crate) enum DnsLookupError {
    #[error("Failed to perform DNS lookup within {0}ms")]
    Timeout(u128),
    #[error("Empty address list returned by DNS for {0}")]
    EmptyAddressListForHost(String),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

async fn lookup_host_with_timeout(
    host: impl ToSocketAddrs,
    hostname_resolution_timeout: Option<Duration>,
) -> Result<impl Iterator<Item = SocketAddr>, DnsLookupError> {
    if let Some(timeout) = hostname_resolution_timeout {
        match tokio::time::timeout(timeout, lookup_host(host)).await {
            Ok(res) => res.map_err(Into::into),
            Err(_) => Err(DnsLookupError::Timeout(timeout.as_millis())),
        }
    } else {
        lookup_host(host).await.map_err(Into::into)
    }
}

// Resolves a hostname, preferring IPv4 addresses over IPv6 ones.
pub(crate) async fn resolve_hostname(
    hostname: &str,
    default_port: u16,
    hostname_resolution_timeout: Option<Duration>,
) -> Result<SocketAddr, DnsLookupError> {
    // `lookup_host` needs "hostname:port"; a bare hostname fails fast, in
    // which case the default port is appended and the lookup retried.
    let addrs = match lookup_host_with_timeout(hostname, hostname_resolution_timeout).await {
        Ok(addrs) => itertools::Either::Left(addrs),
        Err(DnsLookupError::Timeout(t)) => return Err(DnsLookupError::Timeout(t)),
        Err(e) => {
            let addrs =
                lookup_host_with_timeout((hostname, default_port), hostname_resolution_timeout)
                    .await
                    .or(Err(e))?;
            itertools::Either::Right(addrs)
        }
    };

    addrs
        .find_or_last(|addr| matches!(addr, SocketAddr::V4(_)))
        .ok_or_else(|| DnsLookupError::EmptyAddressListForHost(hostname.to_owned()))
}

/// Resolves the contact points into a deduplicated address list. Hostnames
/// that fail to resolve are skipped with a warning; the list of hostnames
/// is returned alongside for error reporting.
pub(crate) async fn resolve_contact_points(
    known_nodes: &[KnownNode],
    default_port: u16,
    hostname_resolution_timeout: Option<Duration>,
) -> (Vec<ResolvedContactPoint>, Vec<String>) {
    let mut initial_peers: Vec<ResolvedContactPoint> = Vec::with_capacity(known_nodes.len());
    let mut to_resolve: Vec<&String> = Vec::new();
    let mut hostnames: Vec<String> = Vec::new();

    for node in known_nodes.iter() {
        match node {
            KnownNode::Hostname(hostname) => {
                to_resolve.push(hostname);
                hostnames.push(hostname.clone());
            }
            KnownNode::Address(address) => {
                initial_peers.push(ResolvedContactPoint { address: *address })
            }
        };
    }

    let resolve_futures = to_resolve.into_iter().map(|hostname| async move {
        match resolve_hostname(hostname, default_port, hostname_resolution_timeout).await {
            Ok(address) => Some(ResolvedContactPoint { address }),
            Err(e) => {
                warn!("Hostname resolution failed for {}: {}", hostname, &e);
                None
            }
        }
    });
    let resolved: Vec<_> = futures::future::join_all(resolve_futures).await;
    initial_peers.extend(resolved.into_iter().flatten());

    // Deduplicate while preserving order.
    let mut seen = std::collections::HashSet::new();
    initial_peers.retain(|peer| seen.insert(peer.address));

    (initial_peers, hostnames)
}

#[cfg(test)]
mod tests {
    use super::*;

    impl Node {
        pub(crate) fn new_for_test(
            id: Option<Uuid>,
            address: Option<NodeAddr>,
            datacenter: Option<String>,
            rack: Option<String>,
        ) -> Self {
            Self {
                host_id: id.unwrap_or(Uuid::new_v4()),
                address: address.unwrap_or(NodeAddr::Translatable(SocketAddr::from((
                    [255, 255, 255, 255],
                    0,
                )))),
                datacenter,
                rack,
                pool: None,
                down_marker: AtomicBool::new(false),
                enabled_as_connected: AtomicBool::new(false),
            }
        }

        pub(crate) fn use_enabled_as_connected(&self) {
            self.enabled_as_connected.store(true, Ordering::Relaxed);
        }
    }

    #[test]
    fn down_marker_round_trip() {
        let node = Node::new_for_test(None, None, None, None);
        assert!(node.is_up());
        node.change_down_marker(true);
        assert!(!node.is_up());
        node.change_down_marker(false);
        assert!(node.is_up());
    }
}
