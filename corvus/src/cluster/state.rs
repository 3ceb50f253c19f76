//! An immutable snapshot of cluster topology and schema.
//!
//! Snapshots follow a read-copy-update discipline: readers (the executor,
//! policies) hold an `Arc` to a snapshot, while the cluster worker is the
//! only writer, publishing a fresh snapshot atomically and notifying
//! observers afterwards. Each snapshot carries a monotonically increasing
//! revision; a replica plan derived at revision r uses the host set of
//! revision r only.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use itertools::Itertools;
use uuid::Uuid;

use crate::cluster::metadata::{Keyspace, Metadata};
use crate::cluster::node::{Node, NodeRef};
use crate::errors::ConnectionPoolError;
use crate::network::{Connection, PoolConfig, VerifiedKeyspaceName};
use crate::policies::load_balancing::LoadBalancingPolicy;
use crate::routing::locator::ReplicaLocator;
use crate::routing::Token;

/// The state of the cluster at one revision: nodes, keyspaces and the
/// replica locator built from them.
pub struct ClusterState {
    /// All nodes known to be part of the cluster, by host id.
    /// Nonempty after a successful bootstrap.
    pub(crate) known_peers: HashMap<Uuid, Arc<Node>>,

    /// Same set of nodes as `known_peers`, in stable order.
    pub(crate) all_nodes: Vec<Arc<Node>>,

    /// All known keyspaces, by name.
    pub(crate) keyspaces: HashMap<String, Keyspace>,

    /// Maps (token, strategy) to the owning replicas.
    pub(crate) locator: ReplicaLocator,

    /// Name of the cluster, as reported by the control host.
    pub(crate) cluster_name: Option<String>,

    /// Monotonically increasing snapshot counter.
    pub(crate) revision: u64,
}

/// Debug-prints a [ClusterState] without dumping the whole ring.
pub(crate) struct ClusterStateNeatDebug<'a>(pub(crate) &'a Arc<ClusterState>);
impl std::fmt::Debug for ClusterStateNeatDebug<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cluster_state = &self.0;
        f.debug_struct("ClusterState")
            .field("revision", &cluster_state.revision)
            .field("known_peers", &cluster_state.known_peers.keys())
            .field("ring_size", &cluster_state.locator.ring().len())
            .field("keyspaces", &cluster_state.keyspaces.keys())
            .finish_non_exhaustive()
    }
}

impl ClusterState {
    /// Builds a new snapshot from freshly fetched metadata, recycling the
    /// `Node` instances (and thus the pools) of unchanged peers.
    pub(crate) async fn new(
        metadata: Metadata,
        pool_config: &PoolConfig,
        known_peers: &HashMap<Uuid, Arc<Node>>,
        used_keyspace: &Option<VerifiedKeyspaceName>,
        load_balancer: &dyn LoadBalancingPolicy,
        revision: u64,
    ) -> Self {
        let mut new_known_peers: HashMap<Uuid, Arc<Node>> =
            HashMap::with_capacity(metadata.peers.len());
        let mut all_nodes: Vec<Arc<Node>> = Vec::with_capacity(metadata.peers.len());
        let mut ring: Vec<(Token, Arc<Node>)> = Vec::new();

        for peer in metadata.peers {
            let peer_host_id = peer.host_id;
            let peer_address = peer.address;
            let peer_endpoint = peer.to_peer_endpoint();
            let peer_tokens = peer.tokens;

            let node: Arc<Node> = match known_peers.get(&peer_host_id) {
                Some(node)
                    if node.datacenter == peer_endpoint.datacenter
                        && node.rack == peer_endpoint.rack =>
                {
                    if node.address == peer_address {
                        node.clone()
                    } else {
                        // An IP change recreates the Node but preserves the
                        // pool, re-pointing it at the new address.
                        Arc::new(Node::inherit_with_ip_changed(node, peer_endpoint))
                    }
                }
                _ => {
                    // Rack or datacenter changes are rare enough that
                    // recreating the node (and its pool) is acceptable.
                    let distance =
                        load_balancer.distance(&Node::new_distance_probe(&peer_endpoint));
                    Arc::new(Node::new(
                        peer_endpoint,
                        pool_config,
                        distance,
                        used_keyspace.clone(),
                    ))
                }
            };

            // A topology refresh also resolves distance changes caused by
            // policy reconfiguration or the node moving.
            let distance = load_balancer.distance(&node);
            node.update_distance(distance).await;

            new_known_peers.insert(peer_host_id, node.clone());
            all_nodes.push(node.clone());

            for token in peer_tokens {
                ring.push((token, node.clone()));
            }
        }

        let locator = ReplicaLocator::new(ring.into_iter());

        ClusterState {
            known_peers: new_known_peers,
            all_nodes,
            keyspaces: metadata.keyspaces,
            locator,
            cluster_name: metadata.cluster_name,
            revision,
        }
    }

    pub(crate) async fn wait_until_all_pools_are_initialized(&self) {
        for node in self.all_nodes.iter() {
            node.wait_until_pool_initialized().await;
        }
    }

    /// The snapshot's revision. Monotonically increasing across snapshots
    /// of one cluster.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Name of the cluster, as reported by the control host.
    pub fn cluster_name(&self) -> Option<&str> {
        self.cluster_name.as_deref()
    }

    /// Access keyspace information collected by the driver.
    pub fn get_keyspace(&self, keyspace: impl AsRef<str>) -> Option<&Keyspace> {
        self.keyspaces.get(keyspace.as_ref())
    }

    /// Iterates over known keyspaces.
    pub fn keyspaces_iter(&self) -> impl Iterator<Item = (&str, &Keyspace)> {
        self.keyspaces.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// All nodes known to the driver.
    pub fn get_nodes_info(&self) -> &[Arc<Node>] {
        &self.all_nodes
    }

    /// The node with the given host id, if known.
    pub fn node(&self, host_id: Uuid) -> Option<NodeRef<'_>> {
        self.known_peers.get(&host_id)
    }

    /// Access replica location info.
    pub fn replica_locator(&self) -> &ReplicaLocator {
        &self.locator
    }

    /// Iterator over (host id, working connections of that host). Hosts
    /// with broken pools are filtered out, unless every pool is broken, in
    /// which case the first error is returned.
    pub(crate) fn iter_working_connections_per_node(
        &self,
    ) -> Result<
        impl Iterator<Item = (Uuid, Vec<Arc<Connection>>)> + '_,
        ConnectionPoolError,
    > {
        assert!(!self.known_peers.is_empty());
        let mut connection_pool_per_node_iter = self.known_peers.values().map(|node| {
            node.get_working_connections()
                .map(|pool| (node.host_id, pool))
        });

        let first_working_pool_or_error = connection_pool_per_node_iter
            .by_ref()
            .find_or_first(Result::is_ok)
            .expect("known_peers is nonempty");
        let first_working_pool = first_working_pool_or_error?;

        let remaining_working_pools_iter = connection_pool_per_node_iter.filter_map(Result::ok);

        Ok(std::iter::once(first_working_pool).chain(remaining_working_pools_iter))
    }

    /// A set of nodes which currently look usable, used by fleet-wide
    /// operations (re-preparation, keyspace propagation).
    pub(crate) fn up_nodes(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.all_nodes
            .iter()
            .filter(|node| node.is_up() && node.is_enabled())
    }

    #[cfg(test)]
    pub(crate) fn mock_empty() -> Self {
        ClusterState {
            known_peers: HashMap::new(),
            all_nodes: Vec::new(),
            keyspaces: HashMap::new(),
            locator: ReplicaLocator::new(std::iter::empty()),
            cluster_name: None,
            revision: 0,
        }
    }
}

/// Host ids added in `new` relative to `old`, and host ids removed.
/// Used by the worker to emit precise observer events after a swap.
pub(crate) fn diff_snapshots(old: &ClusterState, new: &ClusterState) -> (Vec<Uuid>, Vec<Uuid>) {
    let old_ids: HashSet<Uuid> = old.known_peers.keys().copied().collect();
    let new_ids: HashSet<Uuid> = new.known_peers.keys().copied().collect();

    let added = new_ids.difference(&old_ids).copied().collect();
    let removed = old_ids.difference(&new_ids).copied().collect();
    (added, removed)
}
