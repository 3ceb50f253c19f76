use tracing::error;

use super::{FallbackPlan, LoadBalancingPolicy, NodeRef, RoutingInfo};
use crate::cluster::state::ClusterState;

enum PlanState<'a> {
    Created,
    // No host satisfied the policy's requirements; the plan is empty.
    PickedNone,
    Picked(NodeRef<'a>),
    Fallback {
        iter: FallbackPlan<'a>,
        node_to_filter_out: NodeRef<'a>,
    },
}

/// The sequence of hosts constituting the query plan.
///
/// The first host is computed eagerly by the policy's `pick`; the rest is
/// materialized on demand by `fallback`, so the happy path allocates
/// nothing. A plan yields each host at most once and is not restartable:
/// exhaustion is terminal.
pub struct Plan<'a> {
    policy: &'a dyn LoadBalancingPolicy,
    routing_info: &'a RoutingInfo<'a>,
    cluster: &'a ClusterState,

    state: PlanState<'a>,
}

impl<'a> Plan<'a> {
    pub fn new(
        policy: &'a dyn LoadBalancingPolicy,
        routing_info: &'a RoutingInfo<'a>,
        cluster: &'a ClusterState,
    ) -> Self {
        Self {
            policy,
            routing_info,
            cluster,
            state: PlanState::Created,
        }
    }
}

impl<'a> Iterator for Plan<'a> {
    type Item = NodeRef<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.state {
            PlanState::Created => {
                let picked = self.policy.pick(self.routing_info, self.cluster);
                if let Some(picked) = picked {
                    self.state = PlanState::Picked(picked);
                    Some(picked)
                } else {
                    // `pick` returning None does not imply an empty plan;
                    // the fallback may still know further hosts.
                    let mut iter = self.policy.fallback(self.routing_info, self.cluster);
                    let first_fallback_node = iter.next();
                    if let Some(node) = first_fallback_node {
                        self.state = PlanState::Fallback {
                            iter,
                            node_to_filter_out: node,
                        };
                        Some(node)
                    } else {
                        error!(
                            "Load balancing policy returned an empty plan! The request cannot be executed. Routing info: {:?}",
                            self.routing_info
                        );
                        self.state = PlanState::PickedNone;
                        None
                    }
                }
            }
            PlanState::Picked(node) => {
                self.state = PlanState::Fallback {
                    iter: self.policy.fallback(self.routing_info, self.cluster),
                    node_to_filter_out: node,
                };
                self.next()
            }
            PlanState::Fallback {
                iter,
                node_to_filter_out,
            } => {
                for node in iter {
                    if node == *node_to_filter_out {
                        continue;
                    }
                    return Some(node);
                }
                None
            }
            PlanState::PickedNone => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cluster::node::{Node, NodeAddr, NodeRef};
    use crate::policies::load_balancing::NodeDistance;

    fn expected_nodes() -> Vec<Arc<Node>> {
        vec![Arc::new(Node::new_for_test(
            None,
            Some(NodeAddr::Translatable("127.0.0.1:9042".parse().unwrap())),
            None,
            None,
        ))]
    }

    #[derive(Debug)]
    struct PickingNonePolicy {
        expected_nodes: Vec<Arc<Node>>,
    }

    impl LoadBalancingPolicy for PickingNonePolicy {
        fn pick<'a>(
            &'a self,
            _request: &'a RoutingInfo,
            _cluster: &'a ClusterState,
        ) -> Option<NodeRef<'a>> {
            None
        }

        fn fallback<'a>(
            &'a self,
            _request: &'a RoutingInfo,
            _cluster: &'a ClusterState,
        ) -> FallbackPlan<'a> {
            Box::new(self.expected_nodes.iter())
        }

        fn distance(&self, _node: &Node) -> NodeDistance {
            NodeDistance::Local
        }

        fn name(&self) -> String {
            "PickingNone".into()
        }
    }

    #[test]
    fn plan_calls_fallback_even_if_pick_returned_none() {
        let policy = PickingNonePolicy {
            expected_nodes: expected_nodes(),
        };
        let cluster_state = ClusterState::mock_empty();
        let routing_info = RoutingInfo::default();
        let plan = Plan::new(&policy, &routing_info, &cluster_state);
        let plan_nodes: Vec<Arc<Node>> = plan.cloned().collect();
        assert_eq!(plan_nodes, policy.expected_nodes);
    }

    #[test]
    fn plan_yields_each_host_at_most_once_and_is_terminal() {
        #[derive(Debug)]
        struct TwoNodePolicy {
            nodes: Vec<Arc<Node>>,
        }

        impl LoadBalancingPolicy for TwoNodePolicy {
            fn pick<'a>(
                &'a self,
                _request: &'a RoutingInfo,
                _cluster: &'a ClusterState,
            ) -> Option<NodeRef<'a>> {
                self.nodes.first()
            }

            fn fallback<'a>(
                &'a self,
                _request: &'a RoutingInfo,
                _cluster: &'a ClusterState,
            ) -> FallbackPlan<'a> {
                // The fallback deliberately repeats the picked node; the
                // plan must filter it out.
                Box::new(self.nodes.iter())
            }

            fn distance(&self, _node: &Node) -> NodeDistance {
                NodeDistance::Local
            }

            fn name(&self) -> String {
                "TwoNode".into()
            }
        }

        let policy = TwoNodePolicy {
            nodes: vec![
                Arc::new(Node::new_for_test(None, None, None, None)),
                Arc::new(Node::new_for_test(None, None, None, None)),
            ],
        };
        let cluster_state = ClusterState::mock_empty();
        let routing_info = RoutingInfo::default();
        let mut plan = Plan::new(&policy, &routing_info, &cluster_state);

        let first = plan.next().unwrap().host_id;
        let second = plan.next().unwrap().host_id;
        assert_ne!(first, second);
        assert!(plan.next().is_none());
        // Exhaustion is terminal.
        assert!(plan.next().is_none());
    }
}
