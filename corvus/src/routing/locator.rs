//! The token ring and strategy-aware replica selection.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use uuid::Uuid;

use crate::cluster::metadata::Strategy;
use crate::cluster::node::Node;
use crate::routing::Token;

/// A sorted ring of (token, owner) entries supporting wrap-around walks.
#[derive(Debug, Clone)]
pub struct TokenRing<ElemT> {
    ring: Vec<(Token, ElemT)>,
}

impl<ElemT> TokenRing<ElemT> {
    pub(crate) fn new(ring_iter: impl Iterator<Item = (Token, ElemT)>) -> TokenRing<ElemT> {
        let mut ring: Vec<(Token, ElemT)> = ring_iter.collect();
        ring.sort_by(|a, b| a.0.cmp(&b.0));
        TokenRing { ring }
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Token, ElemT)> {
        self.ring.iter()
    }

    /// Iterates over ring members starting at the first token greater than
    /// or equal to the given one, wrapping around the ring end.
    pub fn ring_range(&self, token: Token) -> impl Iterator<Item = &ElemT> {
        let partition_point = self.ring.partition_point(|(t, _)| *t < token);
        let (before, after) = self.ring.split_at(partition_point);
        after.iter().chain(before.iter()).map(|(_, e)| e)
    }
}

/// Finds the set of nodes owning a replica of the partition identified by a
/// token, under a keyspace's replication strategy.
///
/// Rebuilt from scratch on every topology refresh; therefore it holds plain
/// data and no locks.
#[derive(Debug, Clone)]
pub struct ReplicaLocator {
    ring: TokenRing<Arc<Node>>,
    unique_nodes: Vec<Arc<Node>>,
    /// Number of distinct racks per datacenter, used by rack-aware selection.
    racks_per_datacenter: HashMap<String, usize>,
}

impl ReplicaLocator {
    pub(crate) fn new(ring_iter: impl Iterator<Item = (Token, Arc<Node>)>) -> Self {
        let ring = TokenRing::new(ring_iter);

        let mut unique_nodes: Vec<Arc<Node>> = Vec::new();
        let mut seen: HashSet<Uuid> = HashSet::new();
        let mut datacenter_racks: HashMap<String, HashSet<Option<&str>>> = HashMap::new();
        for (_, node) in ring.iter() {
            if seen.insert(node.host_id) {
                unique_nodes.push(node.clone());
            }
        }
        for node in unique_nodes.iter() {
            if let Some(dc) = node.datacenter.as_deref() {
                datacenter_racks
                    .entry(dc.to_owned())
                    .or_default()
                    .insert(node.rack.as_deref());
            }
        }

        let racks_per_datacenter = datacenter_racks
            .into_iter()
            .map(|(dc, racks)| (dc, racks.len()))
            .collect();

        Self {
            ring,
            unique_nodes,
            racks_per_datacenter,
        }
    }

    /// The global token ring.
    pub fn ring(&self) -> &TokenRing<Arc<Node>> {
        &self.ring
    }

    /// Every node owning at least one token, in ring order of first
    /// appearance.
    pub fn unique_nodes(&self) -> &[Arc<Node>] {
        &self.unique_nodes
    }

    /// Replicas of the partition owned by `token`, in replication order.
    /// The first returned node is the primary replica.
    pub fn replicas_for_token(&self, token: Token, strategy: &Strategy) -> Vec<&Arc<Node>> {
        match strategy {
            Strategy::SimpleStrategy { replication_factor } => {
                self.simple_strategy_replicas(token, *replication_factor)
            }
            Strategy::NetworkTopologyStrategy {
                datacenter_repfactors,
            } => self.network_topology_strategy_replicas(token, datacenter_repfactors),
            // Local/unknown strategies degrade to "the primary replica only".
            Strategy::LocalStrategy | Strategy::Other { .. } => {
                self.simple_strategy_replicas(token, 1)
            }
        }
    }

    fn simple_strategy_replicas(
        &self,
        token: Token,
        replication_factor: usize,
    ) -> Vec<&Arc<Node>> {
        let mut replicas = Vec::with_capacity(replication_factor);
        let mut seen: HashSet<Uuid> = HashSet::new();
        for node in self.ring.ring_range(token) {
            if replicas.len() >= replication_factor {
                break;
            }
            if seen.insert(node.host_id) {
                replicas.push(node);
            }
            if seen.len() == self.unique_nodes.len() {
                break;
            }
        }
        replicas
    }

    fn network_topology_strategy_replicas(
        &self,
        token: Token,
        datacenter_repfactors: &HashMap<String, usize>,
    ) -> Vec<&Arc<Node>> {
        struct DcState<'a> {
            replication_factor: usize,
            picked: Vec<&'a Arc<Node>>,
            racks_used: HashSet<Option<&'a str>>,
            total_racks: usize,
            // Nodes whose rack was already represented when encountered.
            // They fill the remaining slots once every rack was seen.
            skipped: Vec<&'a Arc<Node>>,
        }

        let mut per_dc: HashMap<&str, DcState> = datacenter_repfactors
            .iter()
            .map(|(dc, rf)| {
                (
                    dc.as_str(),
                    DcState {
                        replication_factor: *rf,
                        picked: Vec::with_capacity(*rf),
                        racks_used: HashSet::new(),
                        total_racks: self.racks_per_datacenter.get(dc).copied().unwrap_or(0),
                        skipped: Vec::new(),
                    },
                )
            })
            .collect();

        let mut considered: HashSet<Uuid> = HashSet::new();
        let mut picked_in_ring_order: Vec<&Arc<Node>> = Vec::new();

        for node in self.ring.ring_range(token) {
            if considered.len() == self.unique_nodes.len() {
                break;
            }
            if !considered.insert(node.host_id) {
                continue;
            }
            let Some(dc) = node.datacenter.as_deref() else {
                continue;
            };
            let Some(state) = per_dc.get_mut(dc) else {
                continue;
            };
            if state.picked.len() >= state.replication_factor {
                continue;
            }

            let rack = node.rack.as_deref();
            if state.racks_used.contains(&rack) && state.racks_used.len() < state.total_racks {
                state.skipped.push(node);
            } else {
                state.racks_used.insert(rack);
                state.picked.push(node);
                picked_in_ring_order.push(node);
            }
        }

        // Top up each datacenter from its skipped nodes, in ring order.
        for state in per_dc.values_mut() {
            let mut skipped = std::mem::take(&mut state.skipped).into_iter();
            while state.picked.len() < state.replication_factor {
                match skipped.next() {
                    Some(node) => {
                        state.picked.push(node);
                        picked_in_ring_order.push(node);
                    }
                    None => break,
                }
            }
        }

        picked_in_ring_order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::node::{Node, NodeAddr};

    fn mock_node(dc: &str, rack: &str) -> Arc<Node> {
        Arc::new(Node::new_for_test(
            None,
            Some(NodeAddr::Translatable("255.255.255.255:9042".parse().unwrap())),
            Some(dc.to_owned()),
            Some(rack.to_owned()),
        ))
    }

    // Three nodes in one DC, tokens 100/200/300.
    fn three_node_locator() -> (ReplicaLocator, [Arc<Node>; 3]) {
        let a = mock_node("dc1", "r1");
        let b = mock_node("dc1", "r2");
        let c = mock_node("dc1", "r3");
        let ring = vec![
            (Token::new(100), a.clone()),
            (Token::new(200), b.clone()),
            (Token::new(300), c.clone()),
        ];
        (ReplicaLocator::new(ring.into_iter()), [a, b, c])
    }

    #[test]
    fn ring_range_wraps_around() {
        let (locator, [a, b, c]) = three_node_locator();
        let walked: Vec<Uuid> = locator
            .ring()
            .ring_range(Token::new(250))
            .map(|n| n.host_id)
            .collect();
        assert_eq!(walked, vec![c.host_id, a.host_id, b.host_id]);
        let _ = b;
    }

    #[test]
    fn simple_strategy_takes_successors() {
        let (locator, [a, b, c]) = three_node_locator();
        let replicas = locator.replicas_for_token(
            Token::new(150),
            &Strategy::SimpleStrategy {
                replication_factor: 2,
            },
        );
        let ids: Vec<Uuid> = replicas.iter().map(|n| n.host_id).collect();
        assert_eq!(ids, vec![b.host_id, c.host_id]);
        let _ = a;
    }

    #[test]
    fn simple_strategy_dedups_vnodes() {
        let a = mock_node("dc1", "r1");
        let b = mock_node("dc1", "r1");
        let ring = vec![
            (Token::new(100), a.clone()),
            (Token::new(150), a.clone()),
            (Token::new(200), b.clone()),
        ];
        let locator = ReplicaLocator::new(ring.into_iter());
        let replicas = locator.replicas_for_token(
            Token::new(0),
            &Strategy::SimpleStrategy {
                replication_factor: 2,
            },
        );
        assert_eq!(replicas.len(), 2);
        assert_ne!(replicas[0].host_id, replicas[1].host_id);
    }

    #[test]
    fn replication_factor_above_node_count_saturates() {
        let (locator, _) = three_node_locator();
        let replicas = locator.replicas_for_token(
            Token::new(0),
            &Strategy::SimpleStrategy {
                replication_factor: 7,
            },
        );
        assert_eq!(replicas.len(), 3);
    }

    #[test]
    fn network_topology_strategy_prefers_distinct_racks() {
        let a1 = mock_node("dc1", "r1");
        let a2 = mock_node("dc1", "r1");
        let b = mock_node("dc1", "r2");
        let ring = vec![
            (Token::new(100), a1.clone()),
            (Token::new(200), a2.clone()),
            (Token::new(300), b.clone()),
        ];
        let locator = ReplicaLocator::new(ring.into_iter());

        let mut repfactors = HashMap::new();
        repfactors.insert("dc1".to_owned(), 2);
        let replicas = locator.replicas_for_token(
            Token::new(0),
            &Strategy::NetworkTopologyStrategy {
                datacenter_repfactors: repfactors,
            },
        );
        let ids: Vec<Uuid> = replicas.iter().map(|n| n.host_id).collect();
        // a1 is the primary; a2 shares its rack, so b (rack r2) is preferred.
        assert_eq!(ids, vec![a1.host_id, b.host_id]);
    }

    #[test]
    fn network_topology_strategy_ignores_foreign_datacenters() {
        let a = mock_node("dc1", "r1");
        let b = mock_node("dc2", "r1");
        let ring = vec![(Token::new(100), a.clone()), (Token::new(200), b.clone())];
        let locator = ReplicaLocator::new(ring.into_iter());

        let mut repfactors = HashMap::new();
        repfactors.insert("dc1".to_owned(), 2);
        let replicas = locator.replicas_for_token(
            Token::new(0),
            &Strategy::NetworkTopologyStrategy {
                datacenter_repfactors: repfactors,
            },
        );
        assert_eq!(replicas.len(), 1);
        assert_eq!(replicas[0].host_id, a.host_id);
    }
}
