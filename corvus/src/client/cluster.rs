//! The cluster handle: an explicit, owned runtime shared by sessions.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::num::NonZeroUsize;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use futures::FutureExt;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cluster::events::{ClusterEvent, ClusterEventKind};
use crate::cluster::state::ClusterState;
use crate::cluster::worker;
use crate::errors::{MetadataError, NewSessionError};
use crate::network::{ConnectionConfig, PoolConfig, VerifiedKeyspaceName};

use super::config::ClusterConfig;
use super::prepared_registry::PreparedStatementRegistry;
use super::session::Session;

/// A handle to one logical cluster: the bootstrapped control plane, the
/// per-node pools, the policies and the prepared-statement registry.
///
/// Cheap to clone; all clones drive the same runtime. Sessions are created
/// from the handle and share its resources. Shutdown is explicit and
/// idempotent; a disposed handle refuses to create sessions.
#[derive(Clone)]
pub struct Cluster {
    pub(crate) inner: Arc<ClusterInner>,
    // Keeps the re-preparation listener alive as long as any handle or
    // session exists.
    _reprepare_worker: Arc<futures::future::RemoteHandle<()>>,
}

pub(crate) struct ClusterInner {
    pub(crate) runtime: worker::Cluster,
    pub(crate) config: ClusterConfig,
    pub(crate) registry: PreparedStatementRegistry,
    pub(crate) keyspace_name: ArcSwapOption<VerifiedKeyspaceName>,
    disposed: AtomicBool,
    session_counter: AtomicUsize,
}

impl ClusterInner {
    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

impl Cluster {
    /// Bootstraps the cluster: resolves contact points, opens the control
    /// connection, reads the initial metadata and fills the pools.
    ///
    /// The whole initialization is bounded by
    /// `max(init_timeout_floor, 2 x connect_timeout x contact point count)`.
    pub async fn connect(config: ClusterConfig) -> Result<Cluster, NewSessionError> {
        config.validate()?;
        let (contact_points, implicit) = config.effective_contact_points();
        if implicit {
            info!(
                "No contact points configured; assuming a single node on localhost:{}",
                config.port
            );
        }

        let connection_config = ConnectionConfig {
            compression: config.compression,
            tcp_nodelay: config.socket.tcp_nodelay,
            tcp_keepalive_interval: config.socket.keep_alive,
            timestamp_generator: config.timestamp_generator.clone(),
            tls_wrapper: config.tls.clone(),
            connect_timeout: config.socket.connect_timeout,
            event_sender: None,
            default_consistency: config.query.consistency,
            authenticator: config.authenticator.clone(),
            address_translator: config.address_translator.clone(),
            keepalive_interval: config.pooling.heartbeat_interval,
            keepalive_timeout: Some(config.socket.read_timeout),
            protocol_version: config.protocol_version,
            allow_beta_protocol: config.allow_beta_protocol,
            max_frame_length: config.max_frame_length,
            identity: config.self_identity(),
        };

        let nonzero = |n: usize| NonZeroUsize::new(n.max(1)).expect("clamped to be positive");
        let pool_config = PoolConfig {
            connection_config,
            core_local: nonzero(config.pooling.core_local),
            core_remote: nonzero(config.pooling.core_remote),
            max_local: nonzero(config.pooling.max_local.max(config.pooling.core_local)),
            max_remote: nonzero(config.pooling.max_remote.max(config.pooling.core_remote)),
            reconnection_policy: config.reconnection_policy.clone(),
        };

        let init_timeout = config
            .init_timeout_floor
            .max(config.socket.connect_timeout * 2 * contact_points.len() as u32);

        let runtime = tokio::time::timeout(
            init_timeout,
            worker::Cluster::new(
                contact_points,
                pool_config,
                config.port,
                config.hostname_resolution_timeout,
                config.load_balancing_policy.clone(),
                config.reconnection_policy.clone(),
                config.fetch_schema_metadata,
                config.metadata_refresh_interval,
            ),
        )
        .await
        .map_err(|_| NewSessionError::InitTimeout(init_timeout))??;

        // The policy sees the first complete snapshot before any plan is
        // requested from it.
        config
            .load_balancing_policy
            .initialize(&runtime.get_state());

        let inner = Arc::new(ClusterInner {
            runtime,
            config,
            registry: PreparedStatementRegistry::new(),
            keyspace_name: ArcSwapOption::empty(),
            disposed: AtomicBool::new(false),
            session_counter: AtomicUsize::new(0),
        });

        let reprepare_worker = Self::spawn_reprepare_worker(&inner);

        Ok(Cluster {
            inner,
            _reprepare_worker: Arc::new(reprepare_worker),
        })
    }

    // Listens for Down -> Up transitions and re-prepares the statement
    // cache on the returning host.
    fn spawn_reprepare_worker(
        inner: &Arc<ClusterInner>,
    ) -> futures::future::RemoteHandle<()> {
        let mut events = inner.runtime.subscribe_events();
        let weak: Weak<ClusterInner> = Arc::downgrade(inner);
        let enabled = inner.config.query.reprepare_on_up;

        let (task, handle) = async move {
            if !enabled {
                return;
            }
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!("Re-preparation listener lagged by {} events", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                };
                let ClusterEventKind::HostUp(host_id) = event.kind else {
                    continue;
                };
                let Some(inner) = weak.upgrade() else { return };
                let state = inner.runtime.get_state();
                if let Some(node) = state.node(host_id) {
                    inner.registry.reprepare_all_on_node(node).await;
                }
            }
        }
        .remote_handle();
        tokio::spawn(task);
        handle
    }

    /// Creates a new session sharing this handle's pools and policies.
    /// Fails once the cluster was shut down.
    pub fn session(&self) -> Result<Session, NewSessionError> {
        if self.inner.is_disposed() {
            return Err(NewSessionError::Disposed);
        }
        let ordinal = self.inner.session_counter.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}{}", self.inner.config.session_name, ordinal);
        Ok(Session::new(self.clone(), Uuid::new_v4(), name))
    }

    /// The current metadata snapshot.
    pub fn state(&self) -> Arc<ClusterState> {
        self.inner.runtime.get_state()
    }

    /// Subscribes to host and schema change notifications.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ClusterEvent> {
        self.inner.runtime.subscribe_events()
    }

    /// Forces an immediate metadata refresh.
    pub async fn refresh_metadata(&self) -> Result<(), MetadataError> {
        self.inner.runtime.refresh_metadata().await
    }

    /// Shuts the cluster down: closes every pool (pending requests fail
    /// with "cluster closing") and marks the handle disposed. Idempotent.
    /// Returns whether the close finished within the given timeout.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            // Already disposed.
            return true;
        }
        debug!("Shutting down the cluster");
        match tokio::time::timeout(timeout, self.inner.runtime.close_all_pools()).await {
            Ok(()) => true,
            Err(_) => {
                warn!("Cluster shutdown did not finish within {:?}", timeout);
                false
            }
        }
    }

    pub(crate) fn set_keyspace_name(&self, keyspace: VerifiedKeyspaceName) {
        self.inner.keyspace_name.store(Some(Arc::new(keyspace)));
    }
}
