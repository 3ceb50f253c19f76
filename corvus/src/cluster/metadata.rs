//! Cluster metadata as fetched from the system tables: peers with their
//! tokens, and keyspaces with their replication strategies. The
//! [MetadataReader] owns the control connection used to fetch it.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use rand::rng;
use rand::seq::{IndexedRandom, SliceRandom};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use uuid::Uuid;

use corvus_cql::frame::response::event::Event;

use crate::cluster::control_connection::ControlConnection;
use crate::cluster::node::{
    resolve_contact_points, KnownNode, NodeAddr, ResolvedContactPoint,
};
use crate::errors::{MetadataError, NewSessionError};
use crate::network::{ConnectionConfig, NodeConnectionPool, PoolConfig};
use crate::policies::load_balancing::NodeDistance;
use crate::policies::reconnection::ReconnectionPolicy;
use crate::routing::Token;

/// Everything read from the cluster in one metadata refresh.
pub(crate) struct Metadata {
    pub(crate) peers: Vec<Peer>,
    pub(crate) keyspaces: HashMap<String, Keyspace>,
    pub(crate) cluster_name: Option<String>,
}

/// A node as described by `system.local` / `system.peers`.
#[non_exhaustive]
pub struct Peer {
    pub host_id: Uuid,
    pub address: NodeAddr,
    pub tokens: Vec<Token>,
    pub datacenter: Option<String>,
    pub rack: Option<String>,
}

/// An endpoint the driver may connect to, possibly after address
/// translation.
#[derive(Clone, Debug)]
pub(crate) enum UntranslatedEndpoint {
    /// Supplied by the user as a contact point; never translated and never
    /// treated as authoritative topology.
    ContactPoint(ResolvedContactPoint),
    /// Discovered from the peer tables.
    Peer(PeerEndpoint),
}

impl UntranslatedEndpoint {
    pub(crate) fn address(&self) -> NodeAddr {
        match *self {
            UntranslatedEndpoint::ContactPoint(ResolvedContactPoint { address, .. }) => {
                NodeAddr::Untranslatable(address)
            }
            UntranslatedEndpoint::Peer(PeerEndpoint { address, .. }) => address,
        }
    }
}

/// Connection-relevant attributes of a peer.
#[derive(Clone, Debug)]
pub(crate) struct PeerEndpoint {
    pub(crate) host_id: Uuid,
    pub(crate) address: NodeAddr,
    pub(crate) datacenter: Option<String>,
    pub(crate) rack: Option<String>,
}

impl Peer {
    pub(crate) fn to_peer_endpoint(&self) -> PeerEndpoint {
        PeerEndpoint {
            host_id: self.host_id,
            address: self.address,
            datacenter: self.datacenter.clone(),
            rack: self.rack.clone(),
        }
    }
}

/// A keyspace descriptor; what the driver needs of it is the replication
/// strategy that governs replica placement.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub struct Keyspace {
    pub strategy: Strategy,
}

/// Replication strategy of a keyspace.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Strategy {
    /// Places replicas on consecutive ring positions, topology-blind.
    SimpleStrategy { replication_factor: usize },
    /// Places a configured number of replicas in each named datacenter,
    /// spreading them across racks.
    NetworkTopologyStrategy {
        datacenter_repfactors: HashMap<String, usize>,
    },
    /// Used by internal system keyspaces; effectively RF 1, local.
    LocalStrategy,
    /// A strategy this driver does not understand; kept for diagnostics.
    Other {
        name: String,
        data: HashMap<String, String>,
    },
}

impl Strategy {
    /// Parses the `replication` map of `system_schema.keyspaces`.
    pub(crate) fn from_replication_map(mut replication: HashMap<String, String>) -> Strategy {
        let Some(class) = replication.remove("class") else {
            return Strategy::Other {
                name: String::new(),
                data: replication,
            };
        };

        if class.ends_with("SimpleStrategy") {
            let replication_factor = replication
                .get("replication_factor")
                .and_then(|rf| rf.parse::<usize>().ok());
            match replication_factor {
                Some(replication_factor) => Strategy::SimpleStrategy { replication_factor },
                None => Strategy::Other {
                    name: class,
                    data: replication,
                },
            }
        } else if class.ends_with("NetworkTopologyStrategy") {
            let mut datacenter_repfactors = HashMap::with_capacity(replication.len());
            for (datacenter, repfactor) in replication.iter() {
                match repfactor.parse::<usize>() {
                    Ok(repfactor) => {
                        datacenter_repfactors.insert(datacenter.clone(), repfactor);
                    }
                    Err(_) => {
                        // Unparsable per-datacenter options make the whole
                        // strategy unusable for replica computation.
                        return Strategy::Other {
                            name: class,
                            data: replication,
                        };
                    }
                }
            }
            Strategy::NetworkTopologyStrategy {
                datacenter_repfactors,
            }
        } else if class.ends_with("LocalStrategy") {
            Strategy::LocalStrategy
        } else {
            Strategy::Other {
                name: class,
                data: replication,
            }
        }
    }
}

impl Metadata {
    /// Dummy metadata built from the initial peer list, used when the very
    /// first metadata read fails. The ring is divided evenly between the
    /// peers so that token-aware routing at least functions.
    pub(crate) fn new_dummy(initial_peers: &[UntranslatedEndpoint]) -> Self {
        let peers = initial_peers
            .iter()
            .enumerate()
            .map(|(id, endpoint)| {
                let token = ((id as u128) << 64) / initial_peers.len() as u128;
                Peer {
                    address: endpoint.address(),
                    tokens: vec![Token::new(token as i64)],
                    datacenter: None,
                    rack: None,
                    host_id: Uuid::new_v4(),
                }
            })
            .collect();

        Metadata {
            peers,
            keyspaces: HashMap::new(),
            cluster_name: None,
        }
    }
}

/// Reads cluster metadata over a dedicated control connection, reconnecting
/// to other peers when the current control host fails.
pub(crate) struct MetadataReader {
    control_connection_pool_config: PoolConfig,

    control_connection_endpoint: UntranslatedEndpoint,
    control_connection: NodeConnectionPool,

    /// Candidates for the control connection after a failure, refreshed on
    /// every successful metadata read.
    known_peers: Vec<UntranslatedEndpoint>,
    fetch_schema: bool,

    /// When no known peer is reachable, the initial contact points are
    /// re-resolved as a last resort (DNS may return fresh addresses).
    initial_known_nodes: Vec<KnownNode>,
    default_port: u16,
    hostname_resolution_timeout: Option<Duration>,

    /// Signalled by the control pool when its connection breaks, so that
    /// the cluster worker attempts an immediate repair.
    control_connection_repair_requester: mpsc::Sender<()>,
}

impl MetadataReader {
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn new(
        initial_known_nodes: Vec<KnownNode>,
        default_port: u16,
        hostname_resolution_timeout: Option<Duration>,
        control_connection_repair_requester: mpsc::Sender<()>,
        mut connection_config: ConnectionConfig,
        reconnection_policy: Arc<dyn ReconnectionPolicy>,
        server_event_sender: mpsc::Sender<Event>,
        fetch_schema: bool,
    ) -> Result<Self, NewSessionError> {
        let (initial_peers, resolved_hostnames) = resolve_contact_points(
            &initial_known_nodes,
            default_port,
            hostname_resolution_timeout,
        )
        .await;
        if initial_peers.is_empty() {
            return Err(NewSessionError::FailedToResolveAnyHostname(
                resolved_hostnames,
            ));
        }

        let control_connection_endpoint = UntranslatedEndpoint::ContactPoint(
            initial_peers
                .choose(&mut rng())
                .expect("initial_peers is nonempty")
                .clone(),
        );

        // An event sender on the connection config makes the connection
        // REGISTER for server events during setup and forward them here.
        connection_config.event_sender = Some(server_event_sender);

        let one = NonZeroUsize::new(1).unwrap();
        let control_connection_pool_config = PoolConfig {
            connection_config,
            // Exactly one connection receives events.
            core_local: one,
            core_remote: one,
            max_local: one,
            max_remote: one,
            reconnection_policy,
        };

        let control_connection = Self::make_control_connection_pool(
            control_connection_endpoint.clone(),
            &control_connection_pool_config,
            control_connection_repair_requester.clone(),
        );

        Ok(MetadataReader {
            control_connection_pool_config,
            control_connection_endpoint,
            control_connection,
            known_peers: initial_peers
                .into_iter()
                .map(UntranslatedEndpoint::ContactPoint)
                .collect(),
            fetch_schema,
            initial_known_nodes,
            default_port,
            hostname_resolution_timeout,
            control_connection_repair_requester,
        })
    }

    /// Fetches current metadata, walking over known peers (and ultimately
    /// re-resolved contact points) when the control connection fails.
    pub(crate) async fn read_metadata(&mut self, initial: bool) -> Result<Metadata, MetadataError> {
        let mut result = self.fetch_metadata(initial).await;
        let prev_err = match result {
            Ok(metadata) => {
                debug!("Fetched new metadata");
                self.update_known_peers(&metadata);
                return Ok(metadata);
            }
            Err(err) => err,
        };

        // The current control connection failed; try the other known peers
        // in random order.
        self.known_peers.shuffle(&mut rng());

        let address_of_failed = self.control_connection_endpoint.address();
        let candidates: Vec<UntranslatedEndpoint> = self
            .known_peers
            .clone()
            .into_iter()
            .filter(|peer| peer.address() != address_of_failed)
            .collect();

        result = self
            .retry_fetch_metadata_on_nodes(initial, candidates.into_iter(), prev_err)
            .await;

        if let Err(prev_err) = result {
            if !initial {
                // No known peer was reachable; fall back to re-resolving the
                // initial contact points in hope of fresh addresses.
                warn!(
                    "Failed to establish a control connection on every known peer. \
                    Falling back to the initial contact points."
                );
                let (initial_peers, _hostnames) = resolve_contact_points(
                    &self.initial_known_nodes,
                    self.default_port,
                    self.hostname_resolution_timeout,
                )
                .await;
                result = self
                    .retry_fetch_metadata_on_nodes(
                        initial,
                        initial_peers
                            .into_iter()
                            .map(UntranslatedEndpoint::ContactPoint),
                        prev_err,
                    )
                    .await;
            } else {
                result = Err(prev_err);
            }
        }

        match &result {
            Ok(metadata) => {
                self.update_known_peers(metadata);
                debug!("Fetched new metadata");
            }
            Err(error) => {
                let target = self.control_connection_endpoint.address().into_inner();
                error!(
                    error = %error,
                    target = %target,
                    "Could not fetch metadata"
                )
            }
        }

        result
    }

    async fn retry_fetch_metadata_on_nodes(
        &mut self,
        initial: bool,
        nodes: impl Iterator<Item = UntranslatedEndpoint>,
        prev_err: MetadataError,
    ) -> Result<Metadata, MetadataError> {
        let mut result = Err(prev_err);
        for peer in nodes {
            let err = match result {
                Ok(_) => break,
                Err(err) => err,
            };

            warn!(
                control_connection_address =
                    tracing::field::display(self.control_connection_endpoint.address()),
                error = %err,
                "Failed to fetch metadata using the current control connection"
            );

            self.control_connection_endpoint = peer.clone();
            self.control_connection = Self::make_control_connection_pool(
                self.control_connection_endpoint.clone(),
                &self.control_connection_pool_config,
                self.control_connection_repair_requester.clone(),
            );

            debug!(
                "Retrying to establish the control connection on {}",
                self.control_connection_endpoint.address()
            );
            result = self.fetch_metadata(initial).await;
        }
        result
    }

    async fn fetch_metadata(&self, initial: bool) -> Result<Metadata, MetadataError> {
        self.control_connection.wait_until_initialized().await;
        let conn = ControlConnection::new(self.control_connection.borrow_connection()?);

        let res = conn
            .query_metadata(
                self.control_connection_endpoint.address().port(),
                self.fetch_schema,
            )
            .await;

        if initial {
            if let Err(err) = res {
                warn!(
                    error = ?err,
                    "Initial metadata read failed, proceeding with metadata \
                    consisting only of the initial peer list and dummy tokens. \
                    This might result in suboptimal performance and schema \
                    information not being available."
                );
                return Ok(Metadata::new_dummy(&self.known_peers));
            }
        }

        res
    }

    fn update_known_peers(&mut self, metadata: &Metadata) {
        self.known_peers = metadata
            .peers
            .iter()
            .map(|peer| UntranslatedEndpoint::Peer(peer.to_peer_endpoint()))
            .collect();
    }

    fn make_control_connection_pool(
        endpoint: UntranslatedEndpoint,
        pool_config: &PoolConfig,
        refresh_requester: mpsc::Sender<()>,
    ) -> NodeConnectionPool {
        NodeConnectionPool::new(
            endpoint,
            pool_config,
            NodeDistance::Local,
            None,
            Some(refresh_requester),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replication(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parses_simple_strategy() {
        let strategy = Strategy::from_replication_map(replication(&[
            ("class", "org.apache.cassandra.locator.SimpleStrategy"),
            ("replication_factor", "3"),
        ]));
        assert_eq!(
            strategy,
            Strategy::SimpleStrategy {
                replication_factor: 3
            }
        );
    }

    #[test]
    fn parses_network_topology_strategy() {
        let strategy = Strategy::from_replication_map(replication(&[
            ("class", "NetworkTopologyStrategy"),
            ("dc1", "3"),
            ("dc2", "2"),
        ]));
        let Strategy::NetworkTopologyStrategy {
            datacenter_repfactors,
        } = strategy
        else {
            panic!("expected NetworkTopologyStrategy");
        };
        assert_eq!(datacenter_repfactors.get("dc1"), Some(&3));
        assert_eq!(datacenter_repfactors.get("dc2"), Some(&2));
    }

    #[test]
    fn unknown_strategy_is_preserved() {
        let strategy = Strategy::from_replication_map(replication(&[
            ("class", "com.example.ExoticStrategy"),
            ("foo", "bar"),
        ]));
        assert!(matches!(strategy, Strategy::Other { name, .. } if name.ends_with("ExoticStrategy")));
    }

    #[test]
    fn dummy_metadata_divides_the_ring() {
        let endpoints: Vec<UntranslatedEndpoint> = (0..3)
            .map(|i| {
                UntranslatedEndpoint::ContactPoint(ResolvedContactPoint {
                    address: format!("10.0.0.{}:9042", i + 1).parse().unwrap(),
                })
            })
            .collect();
        let metadata = Metadata::new_dummy(&endpoints);
        assert_eq!(metadata.peers.len(), 3);
        let tokens: Vec<i64> = metadata
            .peers
            .iter()
            .map(|p| p.tokens[0].value())
            .collect();
        // Distinct, evenly spread tokens.
        assert_eq!(tokens.len(), 3);
        assert!(tokens.windows(2).all(|w| w[0] != w[1]));
    }
}
