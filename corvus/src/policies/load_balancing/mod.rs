//! Load balancing: turning a statement plus the current topology snapshot
//! into an ordered, lazy sequence of hosts to try.

use crate::cluster::node::{Node, NodeRef};
use crate::cluster::state::ClusterState;
use crate::errors::RequestAttemptError;
use crate::routing::Token;
use corvus_cql::frame::types;

use std::time::Duration;

mod default;
mod plan;
pub use default::{DefaultPolicy, DefaultPolicyBuilder};
pub use plan::Plan;

/// Policy-derived classification of a host, controlling the size of its
/// connection pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeDistance {
    /// Full-size pool; preferred coordinator.
    Local,
    /// Smaller pool; used when locals are unavailable.
    Remote,
    /// No pool at all; never contacted.
    Ignored,
}

/// Routing-relevant facts about the statement being executed.
#[derive(Default, Clone, Debug)]
pub struct RoutingInfo<'a> {
    /// Consistency requested for the execution; lets policies avoid
    /// datacenters that cannot satisfy a LOCAL_* consistency.
    pub consistency: types::Consistency,
    pub serial_consistency: Option<types::SerialConsistency>,

    /// The ring position of the partition the statement touches, when it
    /// could be derived from the bound values.
    pub token: Option<Token>,
    /// The keyspace whose replication strategy governs replica placement.
    pub keyspace: Option<&'a str>,

    /// True when the statement was reported to be a lightweight transaction
    /// at prepare time. LWTs favor a stable replica order to avoid Paxos
    /// contention.
    pub is_confirmed_lwt: bool,
}

/// The rest of the query plan, produced when the picked host failed
/// (or when speculative executions need further hosts).
pub type FallbackPlan<'a> = Box<dyn Iterator<Item = NodeRef<'a>> + Send + Sync + 'a>;

/// Produces query plans: for each request, an ordered sequence of hosts to
/// attempt, best candidates first.
///
/// Most requests succeed on the first host, so the interface is split:
/// `pick` cheaply returns the preferred target, and `fallback` materializes
/// the remainder of the plan only when it is actually needed.
///
/// Policies are consulted with an immutable [ClusterState] snapshot and
/// must not block.
pub trait LoadBalancingPolicy: Send + Sync + std::fmt::Debug {
    /// Called once when the policy is attached to a freshly initialized
    /// cluster, before any plan is requested.
    fn initialize(&self, _cluster: &ClusterState) {}

    /// Returns the first host to contact for the request.
    fn pick<'a>(&'a self, request: &'a RoutingInfo, cluster: &'a ClusterState)
        -> Option<NodeRef<'a>>;

    /// Returns the remaining hosts of the plan, in order.
    fn fallback<'a>(
        &'a self,
        request: &'a RoutingInfo,
        cluster: &'a ClusterState,
    ) -> FallbackPlan<'a>;

    /// Classifies a host, determining its pool size.
    fn distance(&self, node: &Node) -> NodeDistance;

    /// Invoked each time a request succeeds.
    fn on_request_success(&self, _request: &RoutingInfo, _latency: Duration, _node: NodeRef<'_>) {}

    /// Invoked each time a request fails.
    fn on_request_failure(
        &self,
        _request: &RoutingInfo,
        _latency: Duration,
        _node: NodeRef<'_>,
        _error: &RequestAttemptError,
    ) {
    }

    /// Name of the policy, for logs.
    fn name(&self) -> String;
}
