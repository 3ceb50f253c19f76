//! The cluster worker: a background task that owns metadata mutation.
//!
//! All writes to the [ClusterState] snapshot happen here, serialized by
//! construction. Server events, explicit refresh requests and a periodic
//! timer all funnel into one refresh path; observers are notified after
//! the snapshot swap, outside any critical section.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::future::join_all;
use futures::{future::RemoteHandle, FutureExt};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, warn};

use corvus_cql::frame::response::event::{Event, StatusChangeEvent};

use crate::cluster::events::{ClusterEvent, ClusterEventKind};
use crate::cluster::metadata::MetadataReader;
use crate::cluster::node::{KnownNode, NodeAddr};
use crate::cluster::state::{diff_snapshots, ClusterState, ClusterStateNeatDebug};
use crate::errors::{MetadataError, NewSessionError, UseKeyspaceError};
use crate::network::{use_keyspace_result, PoolConfig, VerifiedKeyspaceName};
use crate::policies::load_balancing::LoadBalancingPolicy;
use crate::policies::reconnection::ReconnectionPolicy;

/// Topology and schema events are coalesced for this long before a refresh
/// is performed, so that an event storm (rolling restart, schema migration)
/// results in a handful of refreshes instead of hundreds.
const EVENT_DEBOUNCE_INTERVAL: Duration = Duration::from_secs(1);

/// While the control connection is down, repair is attempted this often.
const CONTROL_CONNECTION_REPAIR_INTERVAL: Duration = Duration::from_secs(1);

/// Capacity of the observer event channel. Slow observers lose oldest
/// events and reconcile via the snapshot, so a small buffer suffices.
const EVENT_CHANNEL_CAPACITY: usize = 128;

/// The driver-internal handle to cluster state and its maintaining worker.
#[derive(Clone)]
pub(crate) struct Cluster {
    state: Arc<ArcSwap<ClusterState>>,

    refresh_channel: mpsc::Sender<RefreshRequest>,
    use_keyspace_channel: mpsc::Sender<UseKeyspaceRequest>,
    events_sender: broadcast::Sender<ClusterEvent>,

    _worker_handle: Arc<RemoteHandle<()>>,
}

struct RefreshRequest {
    response_chan: oneshot::Sender<Result<(), MetadataError>>,
}

struct UseKeyspaceRequest {
    keyspace_name: VerifiedKeyspaceName,
    response_chan: oneshot::Sender<Result<(), UseKeyspaceError>>,
}

impl Cluster {
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn new(
        known_nodes: Vec<KnownNode>,
        pool_config: PoolConfig,
        default_port: u16,
        hostname_resolution_timeout: Option<Duration>,
        load_balancer: Arc<dyn LoadBalancingPolicy>,
        reconnection_policy: Arc<dyn ReconnectionPolicy>,
        fetch_schema_metadata: bool,
        metadata_refresh_interval: Duration,
    ) -> Result<Cluster, NewSessionError> {
        let (refresh_sender, refresh_receiver) = mpsc::channel(32);
        let (use_keyspace_sender, use_keyspace_receiver) = mpsc::channel(32);
        let (server_events_sender, server_events_receiver) = mpsc::channel(32);
        let (control_connection_repair_sender, control_connection_repair_receiver) =
            mpsc::channel(32);
        let (events_sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let mut metadata_reader = MetadataReader::new(
            known_nodes,
            default_port,
            hostname_resolution_timeout,
            control_connection_repair_sender,
            pool_config.connection_config.clone(),
            reconnection_policy,
            server_events_sender,
            fetch_schema_metadata,
        )
        .await?;

        // Listeners were registered by the control connection setup before
        // this first refresh, so no event can fall into a gap between the
        // two.
        let metadata = metadata_reader.read_metadata(true).await?;
        let cluster_state = ClusterState::new(
            metadata,
            &pool_config,
            &HashMap::new(),
            &None,
            load_balancer.as_ref(),
            1,
        )
        .await;
        cluster_state.wait_until_all_pools_are_initialized().await;
        let state: Arc<ArcSwap<ClusterState>> = Arc::new(ArcSwap::from(Arc::new(cluster_state)));

        let worker = ClusterWorker {
            cluster_state: state.clone(),
            metadata_reader,
            pool_config,
            load_balancer,
            refresh_channel: refresh_receiver,
            use_keyspace_channel: use_keyspace_receiver,
            server_events_channel: server_events_receiver,
            control_connection_repair_channel: control_connection_repair_receiver,
            used_keyspace: None,
            metadata_refresh_interval,
            events_sender: events_sender.clone(),
        };

        let (fut, worker_handle) = worker.work().remote_handle();
        tokio::spawn(fut);

        Ok(Cluster {
            state,
            refresh_channel: refresh_sender,
            use_keyspace_channel: use_keyspace_sender,
            events_sender,
            _worker_handle: Arc::new(worker_handle),
        })
    }

    pub(crate) fn get_state(&self) -> Arc<ClusterState> {
        self.state.load_full()
    }

    pub(crate) fn subscribe_events(&self) -> broadcast::Receiver<ClusterEvent> {
        self.events_sender.subscribe()
    }

    pub(crate) async fn refresh_metadata(&self) -> Result<(), MetadataError> {
        let (response_sender, response_receiver) = oneshot::channel();

        self.refresh_channel
            .send(RefreshRequest {
                response_chan: response_sender,
            })
            .await
            .expect("the worker lives at least as long as the Cluster handle");

        response_receiver
            .await
            .expect("the worker always responds to refresh requests")
    }

    pub(crate) async fn use_keyspace(
        &self,
        keyspace_name: VerifiedKeyspaceName,
    ) -> Result<(), UseKeyspaceError> {
        let (response_sender, response_receiver) = oneshot::channel();

        self.use_keyspace_channel
            .send(UseKeyspaceRequest {
                keyspace_name,
                response_chan: response_sender,
            })
            .await
            .expect("the worker lives at least as long as the Cluster handle");

        response_receiver
            .await
            .expect("the worker always responds to keyspace requests")
    }

    /// Closes every node pool. Called by the session handle on shutdown;
    /// the worker task itself stops when the Cluster handle is dropped.
    pub(crate) async fn close_all_pools(&self) {
        let state = self.get_state();
        for node in state.get_nodes_info() {
            node.close_pool().await;
        }
    }
}

struct ClusterWorker {
    cluster_state: Arc<ArcSwap<ClusterState>>,

    metadata_reader: MetadataReader,
    pool_config: PoolConfig,
    load_balancer: Arc<dyn LoadBalancingPolicy>,

    refresh_channel: mpsc::Receiver<RefreshRequest>,
    use_keyspace_channel: mpsc::Receiver<UseKeyspaceRequest>,
    server_events_channel: mpsc::Receiver<Event>,
    control_connection_repair_channel: mpsc::Receiver<()>,

    used_keyspace: Option<VerifiedKeyspaceName>,
    metadata_refresh_interval: Duration,

    events_sender: broadcast::Sender<ClusterEvent>,
}

impl ClusterWorker {
    async fn work(mut self) {
        use tokio::time::Instant;

        let mut last_refresh_time = Instant::now();
        let mut control_connection_works = true;
        // Deadline of the pending debounced refresh, if any.
        let mut debounce_deadline: Option<Instant> = None;
        // Keyspaces named by schema events since the last refresh.
        let mut pending_schema_changes: Vec<Option<String>> = Vec::new();

        loop {
            let mut cur_request: Option<RefreshRequest> = None;

            let periodic_deadline = last_refresh_time
                .checked_add(if control_connection_works {
                    self.metadata_refresh_interval
                } else {
                    CONTROL_CONNECTION_REPAIR_INTERVAL
                })
                .unwrap_or_else(Instant::now);
            let sleep_until: Instant = match debounce_deadline {
                Some(deadline) => deadline.min(periodic_deadline),
                None => periodic_deadline,
            };

            let sleep_future = tokio::time::sleep_until(sleep_until);
            tokio::pin!(sleep_future);

            tokio::select! {
                _ = sleep_future => {}
                recv_res = self.refresh_channel.recv() => {
                    match recv_res {
                        Some(request) => cur_request = Some(request),
                        // The Cluster handle was dropped; stop working.
                        None => return,
                    }
                }
                recv_res = self.server_events_channel.recv() => {
                    if let Some(event) = recv_res {
                        debug!("Received server event: {:?}", event);
                        match event {
                            Event::TopologyChange(_) => {
                                // Refresh soon, coalescing a possible storm.
                                debounce_deadline.get_or_insert_with(|| {
                                    Instant::now() + EVENT_DEBOUNCE_INTERVAL
                                });
                            }
                            Event::StatusChange(status) => {
                                // Up/down markers can be flipped right away;
                                // they do not change the host set.
                                match status {
                                    StatusChangeEvent::Down(addr) => {
                                        self.change_node_down_marker(addr, true)
                                    }
                                    StatusChangeEvent::Up(addr) => {
                                        self.change_node_down_marker(addr, false)
                                    }
                                }
                            }
                            Event::SchemaChange(schema_change) => {
                                pending_schema_changes
                                    .push(Some(schema_change.keyspace_name().to_owned()));
                                debounce_deadline.get_or_insert_with(|| {
                                    Instant::now() + EVENT_DEBOUNCE_INTERVAL
                                });
                            }
                        }
                        continue;
                    } else {
                        // MetadataReader dropped; nothing left to do.
                        return;
                    }
                }
                recv_res = self.use_keyspace_channel.recv() => {
                    match recv_res {
                        Some(request) => {
                            self.used_keyspace = Some(request.keyspace_name.clone());

                            let cluster_state = self.cluster_state.load_full();
                            tokio::spawn(Self::handle_use_keyspace_request(cluster_state, request));
                        },
                        None => return,
                    }
                    continue;
                }
                recv_res = self.control_connection_repair_channel.recv() => {
                    match recv_res {
                        Some(()) => {
                            // The control connection broke. Attempt an
                            // immediate repair-by-refresh below; further
                            // attempts follow every second.
                            if control_connection_works {
                                control_connection_works = false;
                                self.emit_event(ClusterEventKind::ControlConnectionDown);
                            }
                        }
                        None => return,
                    }
                }
            }

            // Whatever woke us up, the refresh below satisfies any pending
            // debounced events.
            debounce_deadline = None;

            debug!("Requesting topology refresh");
            last_refresh_time = Instant::now();
            let refresh_res = self
                .perform_refresh(std::mem::take(&mut pending_schema_changes))
                .await;

            let previously_worked = control_connection_works;
            control_connection_works = refresh_res.is_ok();
            if control_connection_works && !previously_worked {
                debug!("Control connection re-established");
            }

            if let Some(request) = cur_request {
                // Nobody waiting for the response is fine.
                let _ = request.response_chan.send(refresh_res);
            }
        }
    }

    fn change_node_down_marker(&mut self, addr: SocketAddr, is_down: bool) {
        let cluster_state = self.cluster_state.load_full();

        // Linear scan; clusters rarely exceed a few hundred nodes, and
        // status changes are infrequent.
        let node = match cluster_state
            .known_peers
            .values()
            .find(|&peer| peer.address == NodeAddr::Translatable(addr))
        {
            Some(node) => node,
            None => {
                warn!("Unknown node address {}", addr);
                return;
            }
        };

        node.change_down_marker(is_down);
        self.emit_event(if is_down {
            ClusterEventKind::HostDown(node.host_id)
        } else {
            ClusterEventKind::HostUp(node.host_id)
        });
    }

    async fn handle_use_keyspace_request(
        cluster_state: Arc<ClusterState>,
        request: UseKeyspaceRequest,
    ) {
        let result = Self::send_use_keyspace(cluster_state, &request.keyspace_name).await;
        let _ = request.response_chan.send(result);
    }

    async fn send_use_keyspace(
        cluster_state: Arc<ClusterState>,
        keyspace_name: &VerifiedKeyspaceName,
    ) -> Result<(), UseKeyspaceError> {
        let use_keyspace_futures = cluster_state
            .known_peers
            .values()
            .map(|node| node.use_keyspace(keyspace_name.clone()));
        let use_keyspace_results: Vec<Result<(), UseKeyspaceError>> =
            join_all(use_keyspace_futures).await;

        use_keyspace_result(use_keyspace_results.into_iter())
    }

    async fn perform_refresh(
        &mut self,
        pending_schema_changes: Vec<Option<String>>,
    ) -> Result<(), MetadataError> {
        let metadata = self.metadata_reader.read_metadata(false).await?;
        let old_state: Arc<ClusterState> = self.cluster_state.load_full();

        let new_state = Arc::new(
            ClusterState::new(
                metadata,
                &self.pool_config,
                &old_state.known_peers,
                &self.used_keyspace,
                self.load_balancer.as_ref(),
                old_state.revision + 1,
            )
            .await,
        );

        new_state.wait_until_all_pools_are_initialized().await;

        let (added, removed) = diff_snapshots(&old_state, &new_state);

        // Publish the snapshot first; only then notify observers, so that
        // every observer reacting to an event already sees the new state.
        self.cluster_state.store(new_state.clone());
        debug!(
            "New cluster state: {:?}",
            ClusterStateNeatDebug(&new_state)
        );

        for host_id in added {
            self.emit_event(ClusterEventKind::HostAdded(host_id));
        }
        for host_id in removed {
            self.emit_event(ClusterEventKind::HostRemoved(host_id));
        }
        for keyspace in pending_schema_changes {
            self.emit_event(ClusterEventKind::SchemaChanged { keyspace });
        }

        Ok(())
    }

    fn emit_event(&self, kind: ClusterEventKind) {
        let revision = self.cluster_state.load().revision;
        // An error only means there are no subscribers right now.
        let _ = self.events_sender.send(ClusterEvent { kind, revision });
    }
}
