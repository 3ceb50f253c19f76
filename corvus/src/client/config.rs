//! Cluster configuration. Plain data with documented defaults; the fluent
//! builder surface lives outside the core.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use corvus_cql::frame::{Compression, ProtocolVersion};
use corvus_cql::Consistency;

use crate::authentication::AuthenticatorProvider;
use crate::cluster::KnownNode;
use crate::network::tls::TlsWrapper;
use crate::network::SelfIdentity;
use crate::policies::address_translator::AddressTranslator;
use crate::policies::load_balancing::{DefaultPolicy, LoadBalancingPolicy};
use crate::policies::reconnection::{ExponentialReconnectionPolicy, ReconnectionPolicy};
use crate::policies::retry::{DefaultRetryPolicy, RetryPolicy};
use crate::policies::speculative_execution::SpeculativeExecutionPolicy;
use crate::policies::timestamp_generator::{MonotonicTimestampGenerator, TimestampGenerator};

/// The default native-protocol port.
pub const DEFAULT_PORT: u16 = 9042;

/// Sizing of per-node connection pools.
#[derive(Clone, Debug)]
pub struct PoolingOptions {
    /// Connections eagerly kept towards each Local node.
    pub core_local: usize,
    /// Connections eagerly kept towards each Remote node.
    pub core_remote: usize,
    /// Growth cap of Local pools under stream-id pressure.
    pub max_local: usize,
    /// Growth cap of Remote pools under stream-id pressure.
    pub max_remote: usize,
    /// Interval of protocol-level heartbeats on idle connections.
    /// `None` disables them.
    pub heartbeat_interval: Option<Duration>,
}

impl Default for PoolingOptions {
    fn default() -> Self {
        Self {
            core_local: 1,
            core_remote: 1,
            max_local: 2,
            max_remote: 1,
            heartbeat_interval: Some(Duration::from_secs(30)),
        }
    }
}

/// TCP- and timing-related options.
#[derive(Clone, Debug)]
pub struct SocketOptions {
    /// Per-socket connect timeout.
    pub connect_timeout: Duration,
    /// Per-attempt response deadline. An attempt exceeding it orphans its
    /// stream id and the executor moves on per the retry policy.
    pub read_timeout: Duration,
    /// TCP-level keepalive idle time; `None` leaves it off.
    pub keep_alive: Option<Duration>,
    pub tcp_nodelay: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(12),
            keep_alive: None,
            tcp_nodelay: true,
        }
    }
}

/// Request-level defaults, overridable per statement.
#[derive(Clone, Debug)]
pub struct QueryOptions {
    pub consistency: Consistency,
    pub serial_consistency: Option<corvus_cql::SerialConsistency>,
    pub page_size: i32,
    /// Re-prepare every cached statement on a host that transitioned
    /// Down -> Up, so that the first request after recovery does not pay an
    /// UNPREPARED round trip.
    pub reprepare_on_up: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            consistency: Consistency::LocalOne,
            serial_consistency: None,
            page_size: 5000,
            reprepare_on_up: true,
        }
    }
}

/// Everything needed to bootstrap a [Cluster](crate::client::Cluster).
#[derive(Clone)]
pub struct ClusterConfig {
    /// Initial endpoints used only for bootstrap. All must share a port.
    /// When empty, a single loopback candidate on `port` is assumed.
    pub contact_points: Vec<KnownNode>,
    /// Port applied when resolving bare hostnames and the implicit
    /// loopback contact point.
    pub port: u16,

    /// Forces a protocol version; `None` negotiates the highest supported.
    pub protocol_version: Option<ProtocolVersion>,
    /// Opts into the server's beta protocol features.
    pub allow_beta_protocol: bool,
    pub compression: Option<Compression>,
    pub tls: Option<Arc<dyn TlsWrapper>>,
    pub authenticator: Option<Arc<dyn AuthenticatorProvider>>,

    pub load_balancing_policy: Arc<dyn LoadBalancingPolicy>,
    pub retry_policy: Arc<dyn RetryPolicy>,
    pub speculative_execution_policy: Option<Arc<dyn SpeculativeExecutionPolicy>>,
    pub reconnection_policy: Arc<dyn ReconnectionPolicy>,
    pub address_translator: Option<Arc<dyn AddressTranslator>>,
    pub timestamp_generator: Option<Arc<dyn TimestampGenerator>>,

    pub pooling: PoolingOptions,
    pub socket: SocketOptions,
    pub query: QueryOptions,

    /// Advertised in STARTUP options and server-side client registries.
    pub application_name: Option<String>,
    pub application_version: Option<String>,
    /// Stable identifier of this client instance.
    pub cluster_id: Option<String>,

    /// Prefix of generated session names (`<prefix><counter>`).
    pub session_name: String,

    /// Whether to read schema metadata (keyspaces and their strategies).
    /// Disabling it turns off token-aware routing.
    pub fetch_schema_metadata: bool,
    /// Period of full metadata refreshes, independent of events.
    pub metadata_refresh_interval: Duration,
    pub hostname_resolution_timeout: Option<Duration>,
    /// Lower bound of the initialization timeout
    /// (`2 x connect_timeout x contact point count`, but at least this).
    pub init_timeout_floor: Duration,

    /// Frames above this size are rejected as a protocol violation.
    pub max_frame_length: usize,
}

impl ClusterConfig {
    pub fn new() -> Self {
        Self {
            contact_points: Vec::new(),
            port: DEFAULT_PORT,
            protocol_version: None,
            allow_beta_protocol: false,
            compression: None,
            tls: None,
            authenticator: None,
            load_balancing_policy: Arc::new(DefaultPolicy::default()),
            retry_policy: Arc::new(DefaultRetryPolicy::new()),
            speculative_execution_policy: None,
            reconnection_policy: Arc::new(ExponentialReconnectionPolicy::default()),
            address_translator: None,
            timestamp_generator: Some(Arc::new(MonotonicTimestampGenerator::new())),
            pooling: PoolingOptions::default(),
            socket: SocketOptions::default(),
            query: QueryOptions::default(),
            application_name: None,
            application_version: None,
            cluster_id: None,
            session_name: "session".to_owned(),
            fetch_schema_metadata: true,
            metadata_refresh_interval: Duration::from_secs(60),
            hostname_resolution_timeout: Some(Duration::from_secs(5)),
            init_timeout_floor: Duration::from_secs(5),
            max_frame_length: corvus_cql::frame::DEFAULT_MAX_FRAME_LENGTH,
        }
    }

    /// Adds a resolved contact point.
    pub fn add_contact_point(&mut self, address: SocketAddr) {
        self.contact_points.push(KnownNode::Address(address));
    }

    /// Adds a contact point by hostname, resolved at connect time.
    pub fn add_known_node(&mut self, hostname: impl Into<String>) {
        self.contact_points.push(KnownNode::Hostname(hostname.into()));
    }

    /// The effective contact points: the configured ones, or the implicit
    /// loopback candidate when none were given.
    pub(crate) fn effective_contact_points(&self) -> (Vec<KnownNode>, bool) {
        if self.contact_points.is_empty() {
            (
                vec![KnownNode::Address(SocketAddr::new(
                    Ipv4Addr::LOCALHOST.into(),
                    self.port,
                ))],
                true,
            )
        } else {
            (self.contact_points.clone(), false)
        }
    }

    /// Validates that explicitly-addressed contact points agree on a port.
    pub(crate) fn validate(&self) -> Result<(), crate::errors::NewSessionError> {
        let mut ports = self.contact_points.iter().filter_map(|node| match node {
            KnownNode::Address(addr) => Some(addr.port()),
            KnownNode::Hostname(_) => None,
        });
        if let Some(first) = ports.next() {
            for port in ports {
                if port != first {
                    return Err(crate::errors::NewSessionError::MixedContactPointPorts(
                        first, port,
                    ));
                }
            }
        }
        Ok(())
    }

    pub(crate) fn self_identity(&self) -> SelfIdentity {
        let mut identity = SelfIdentity::new();
        if let Some(name) = &self.application_name {
            identity.set_application_name(name.clone());
        }
        if let Some(version) = &self.application_version {
            identity.set_application_version(version.clone());
        }
        if let Some(id) = &self.cluster_id {
            identity.set_client_id(id.clone());
        }
        identity
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_contact_points_default_to_loopback() {
        let config = ClusterConfig::new();
        let (points, implicit) = config.effective_contact_points();
        assert!(implicit);
        assert_eq!(
            points,
            vec![KnownNode::Address("127.0.0.1:9042".parse().unwrap())]
        );
    }

    #[test]
    fn mixed_ports_are_rejected() {
        let mut config = ClusterConfig::new();
        config.add_contact_point("10.0.0.1:9042".parse().unwrap());
        config.add_contact_point("10.0.0.2:19042".parse().unwrap());
        assert!(config.validate().is_err());

        let mut config = ClusterConfig::new();
        config.add_contact_point("10.0.0.1:9042".parse().unwrap());
        config.add_contact_point("10.0.0.2:9042".parse().unwrap());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn defaults_match_documentation() {
        let config = ClusterConfig::new();
        assert_eq!(config.port, 9042);
        assert_eq!(config.socket.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.socket.read_timeout, Duration::from_secs(12));
        assert_eq!(config.query.page_size, 5000);
        assert_eq!(config.query.consistency, Consistency::LocalOne);
        assert!(config.query.reprepare_on_up);
        assert_eq!(
            config.pooling.heartbeat_interval,
            Some(Duration::from_secs(30))
        );
    }
}
