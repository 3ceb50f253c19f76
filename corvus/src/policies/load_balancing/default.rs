use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::cluster::node::{Node, NodeRef};
use crate::cluster::state::ClusterState;

use super::{FallbackPlan, LoadBalancingPolicy, NodeDistance, RoutingInfo};

/// The default load balancing policy: token-aware on top of
/// datacenter-aware round robin.
///
/// Plans are ordered: alive local replicas, then alive remote replicas (when
/// datacenter failover is permitted), then the remaining alive local nodes,
/// then the remaining alive remote nodes. Within each group, hosts rotate
/// round-robin across consecutive requests. For confirmed lightweight
/// transactions the replica order is kept stable instead, so that
/// contending clients pick the same leader.
#[derive(Debug)]
pub struct DefaultPolicy {
    preferred_datacenter: Option<String>,
    is_token_aware: bool,
    permit_dc_failover: bool,
    index: AtomicUsize,
}

impl DefaultPolicy {
    pub fn builder() -> DefaultPolicyBuilder {
        DefaultPolicyBuilder::new()
    }

    fn is_alive(node: NodeRef<'_>) -> bool {
        node.is_up() && node.is_enabled()
    }

    fn is_local(&self, node: &Node) -> bool {
        match &self.preferred_datacenter {
            Some(dc) => node.datacenter.as_deref() == Some(dc.as_str()),
            // With no preferred datacenter, every node counts as local.
            None => true,
        }
    }

    fn replicas<'a>(
        &'a self,
        request: &'a RoutingInfo,
        cluster: &'a ClusterState,
    ) -> Vec<NodeRef<'a>> {
        if !self.is_token_aware {
            return Vec::new();
        }
        let (Some(token), Some(keyspace)) = (request.token, request.keyspace) else {
            return Vec::new();
        };
        let Some(keyspace_info) = cluster.get_keyspace(keyspace) else {
            return Vec::new();
        };
        cluster
            .replica_locator()
            .replicas_for_token(token, &keyspace_info.strategy)
    }

    fn rotation_start(&self, group_len: usize) -> usize {
        if group_len == 0 {
            0
        } else {
            self.index.fetch_add(1, Ordering::Relaxed) % group_len
        }
    }

    fn rotated<'a>(
        &self,
        group: Vec<NodeRef<'a>>,
        rotate: bool,
    ) -> impl Iterator<Item = NodeRef<'a>> {
        let start = if rotate { self.rotation_start(group.len()) } else { 0 };
        let len = group.len();
        (0..len).map(move |i| group[(start + i) % len])
    }
}

impl LoadBalancingPolicy for DefaultPolicy {
    fn pick<'a>(
        &'a self,
        request: &'a RoutingInfo,
        cluster: &'a ClusterState,
    ) -> Option<NodeRef<'a>> {
        let replicas = self.replicas(request, cluster);
        if !replicas.is_empty() {
            let local_alive: Vec<NodeRef<'a>> = replicas
                .iter()
                .copied()
                .filter(|node| Self::is_alive(node) && self.is_local(node))
                .collect();
            if !local_alive.is_empty() {
                // LWTs go to the primary replica for leader stability.
                return if request.is_confirmed_lwt {
                    local_alive.first().copied()
                } else {
                    self.rotated(local_alive, true).next()
                };
            }
            // No local replica alive; defer host choice to fallback.
            return None;
        }

        let local_alive: Vec<NodeRef<'a>> = cluster
            .get_nodes_info()
            .iter()
            .filter(|node| Self::is_alive(node) && self.is_local(node))
            .collect();
        self.rotated(local_alive, true).next()
    }

    fn fallback<'a>(
        &'a self,
        request: &'a RoutingInfo,
        cluster: &'a ClusterState,
    ) -> FallbackPlan<'a> {
        let replicas = self.replicas(request, cluster);
        let rotate_replicas = !request.is_confirmed_lwt;

        let (local_replicas, remote_replicas): (Vec<_>, Vec<_>) = replicas
            .iter()
            .copied()
            .filter(|node| Self::is_alive(node))
            .partition(|node| self.is_local(node));

        let is_replica = move |node: NodeRef<'a>, replicas: &[NodeRef<'a>]| {
            replicas.iter().any(|replica| replica == &node)
        };
        let all_replicas = replicas.clone();

        let (local_rest, remote_rest): (Vec<_>, Vec<_>) = cluster
            .get_nodes_info()
            .iter()
            .filter(move |node| Self::is_alive(node) && !is_replica(node, &all_replicas))
            .partition(|node| self.is_local(node));

        let permit_remote = self.permit_dc_failover;

        let plan = self
            .rotated(local_replicas, rotate_replicas)
            .chain(self.rotated(remote_replicas, rotate_replicas))
            .filter(move |node| self.is_local(node) || permit_remote)
            .chain(self.rotated(local_rest, true))
            .chain(
                self.rotated(remote_rest, true)
                    .filter(move |_| permit_remote),
            );

        Box::new(plan)
    }

    fn distance(&self, node: &Node) -> NodeDistance {
        if self.is_local(node) {
            NodeDistance::Local
        } else if self.permit_dc_failover {
            NodeDistance::Remote
        } else {
            NodeDistance::Ignored
        }
    }

    fn name(&self) -> String {
        "DefaultPolicy".to_string()
    }
}

impl Default for DefaultPolicy {
    fn default() -> Self {
        DefaultPolicyBuilder::new().build_inner()
    }
}

/// Builder of [DefaultPolicy] instances.
#[derive(Debug, Clone)]
pub struct DefaultPolicyBuilder {
    preferred_datacenter: Option<String>,
    is_token_aware: bool,
    permit_dc_failover: bool,
}

impl DefaultPolicyBuilder {
    pub fn new() -> Self {
        Self {
            preferred_datacenter: None,
            is_token_aware: true,
            permit_dc_failover: false,
        }
    }

    /// Restricts the "local" classification to the given datacenter.
    /// Without a preference, every node is local.
    pub fn prefer_datacenter(mut self, datacenter: impl Into<String>) -> Self {
        self.preferred_datacenter = Some(datacenter.into());
        self
    }

    /// Enables or disables routing to partition replicas first.
    pub fn token_aware(mut self, is_token_aware: bool) -> Self {
        self.is_token_aware = is_token_aware;
        self
    }

    /// Allows contacting remote-datacenter nodes when locals are exhausted.
    /// Off by default: a misrouted request to a remote datacenter usually
    /// costs more than a failed one.
    pub fn permit_dc_failover(mut self, permit: bool) -> Self {
        self.permit_dc_failover = permit;
        self
    }

    pub fn build(self) -> Arc<dyn LoadBalancingPolicy> {
        Arc::new(self.build_inner())
    }

    fn build_inner(self) -> DefaultPolicy {
        DefaultPolicy {
            preferred_datacenter: self.preferred_datacenter,
            is_token_aware: self.is_token_aware,
            permit_dc_failover: self.permit_dc_failover,
            index: AtomicUsize::new(0),
        }
    }
}

impl Default for DefaultPolicyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policies::load_balancing::Plan;
    use crate::test_utils::{mock_cluster_state, setup_tracing};
    use uuid::Uuid;

    fn collect_plan<'a>(
        policy: &'a DefaultPolicy,
        routing_info: &'a RoutingInfo<'a>,
        cluster: &'a ClusterState,
    ) -> Vec<Uuid> {
        Plan::new(policy, routing_info, cluster)
            .map(|node| node.host_id)
            .collect()
    }

    #[test]
    fn plan_visits_every_alive_node_exactly_once() {
        setup_tracing();
        let cluster = mock_cluster_state(&[("dc1", "r1"), ("dc1", "r2"), ("dc1", "r3")]);
        let policy = DefaultPolicy::default();
        let routing_info = RoutingInfo::default();

        let plan = collect_plan(&policy, &routing_info, &cluster);
        assert_eq!(plan.len(), 3);
        let unique: std::collections::HashSet<_> = plan.iter().collect();
        assert_eq!(unique.len(), 3);
    }

    #[test]
    fn consecutive_plans_rotate() {
        setup_tracing();
        let cluster = mock_cluster_state(&[("dc1", "r1"), ("dc1", "r2"), ("dc1", "r3")]);
        let policy = DefaultPolicy::default();
        let routing_info = RoutingInfo::default();

        let first = collect_plan(&policy, &routing_info, &cluster);
        let second = collect_plan(&policy, &routing_info, &cluster);
        assert_ne!(first[0], second[0]);
    }

    #[test]
    fn remote_nodes_are_excluded_without_failover() {
        setup_tracing();
        let cluster = mock_cluster_state(&[("dc1", "r1"), ("dc2", "r1")]);
        let policy = DefaultPolicy::builder()
            .prefer_datacenter("dc1")
            .build_inner();
        let routing_info = RoutingInfo::default();

        let plan = collect_plan(&policy, &routing_info, &cluster);
        assert_eq!(plan.len(), 1);

        let with_failover = DefaultPolicy::builder()
            .prefer_datacenter("dc1")
            .permit_dc_failover(true)
            .build_inner();
        let plan = collect_plan(&with_failover, &routing_info, &cluster);
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn distance_follows_datacenter_preference() {
        setup_tracing();
        let cluster = mock_cluster_state(&[("dc1", "r1"), ("dc2", "r1")]);
        let policy = DefaultPolicy::builder()
            .prefer_datacenter("dc1")
            .permit_dc_failover(true)
            .build_inner();

        let nodes = cluster.get_nodes_info();
        let dc1_node = nodes
            .iter()
            .find(|n| n.datacenter.as_deref() == Some("dc1"))
            .unwrap();
        let dc2_node = nodes
            .iter()
            .find(|n| n.datacenter.as_deref() == Some("dc2"))
            .unwrap();
        assert_eq!(policy.distance(dc1_node), NodeDistance::Local);
        assert_eq!(policy.distance(dc2_node), NodeDistance::Remote);

        let no_failover = DefaultPolicy::builder().prefer_datacenter("dc1").build_inner();
        assert_eq!(no_failover.distance(dc2_node), NodeDistance::Ignored);
    }
}
