//! Helpers shared by unit tests.

use std::collections::HashMap;
use std::sync::Arc;

use crate::cluster::node::{Node, NodeAddr};
use crate::cluster::state::ClusterState;
use crate::routing::locator::ReplicaLocator;
use crate::routing::Token;

pub(crate) fn setup_tracing() {
    let _ = tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .without_time()
        .try_init();
}

/// Builds a cluster state of mock nodes (no real pools), one ring token
/// per node, in the given (datacenter, rack) layout. The nodes report
/// themselves as connected so that policies treat them as usable.
pub(crate) fn mock_cluster_state(layout: &[(&str, &str)]) -> ClusterState {
    let mut known_peers = HashMap::new();
    let mut all_nodes = Vec::new();
    let mut ring: Vec<(Token, Arc<Node>)> = Vec::new();

    for (i, (dc, rack)) in layout.iter().enumerate() {
        let address: std::net::SocketAddr = format!("10.0.0.{}:9042", i + 1).parse().unwrap();
        let node = Arc::new(Node::new_for_test(
            None,
            Some(NodeAddr::Translatable(address)),
            Some(dc.to_string()),
            Some(rack.to_string()),
        ));
        node.use_enabled_as_connected();
        known_peers.insert(node.host_id, node.clone());
        all_nodes.push(node.clone());
        ring.push((Token::new((i as i64 + 1) * 100), node));
    }

    let locator = ReplicaLocator::new(ring.into_iter());

    ClusterState {
        known_peers,
        all_nodes,
        keyspaces: HashMap::new(),
        locator,
        cluster_name: Some("mock".to_owned()),
        revision: 1,
    }
}
