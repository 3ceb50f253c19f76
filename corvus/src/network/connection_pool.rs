//! Per-node connection pools.
//!
//! Each node gets a fixed-size set of connections, sized by the node's
//! distance. A background refiller task opens missing connections with
//! policy-driven backoff, replays the session keyspace onto fresh
//! connections, and reacts to distance changes from topology refreshes.

use std::num::NonZeroUsize;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

use arc_swap::ArcSwap;
use futures::{future::RemoteHandle, stream::FuturesUnordered, Future, FutureExt, StreamExt};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, trace, warn};

use crate::cluster::metadata::UntranslatedEndpoint;
use crate::cluster::node::NodeAddr;
use crate::errors::{
    BrokenConnectionErrorKind, ConnectionError, ConnectionPoolError, UseKeyspaceError,
};
use crate::policies::load_balancing::NodeDistance;
use crate::policies::reconnection::{ReconnectionPolicy, ReconnectionSchedule};

use super::connection::{
    open_connection, Connection, ConnectionConfig, ErrorReceiver, VerifiedKeyspaceName,
};

/// Sizing parameters of per-node pools, fixed at session creation.
#[derive(Clone)]
pub(crate) struct PoolConfig {
    pub(crate) connection_config: ConnectionConfig,
    /// Pool size eagerly maintained towards Local nodes.
    pub(crate) core_local: NonZeroUsize,
    /// Pool size eagerly maintained towards Remote nodes.
    pub(crate) core_remote: NonZeroUsize,
    /// Growth cap for Local pools under stream-id pressure.
    pub(crate) max_local: NonZeroUsize,
    /// Growth cap for Remote pools under stream-id pressure.
    pub(crate) max_remote: NonZeroUsize,
    pub(crate) reconnection_policy: Arc<dyn ReconnectionPolicy>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let one = NonZeroUsize::new(1).unwrap();
        let two = NonZeroUsize::new(2).unwrap();
        Self {
            connection_config: ConnectionConfig::default(),
            core_local: one,
            core_remote: one,
            max_local: two,
            max_remote: one,
            reconnection_policy: Arc::new(
                crate::policies::reconnection::ExponentialReconnectionPolicy::default(),
            ),
        }
    }
}

impl PoolConfig {
    fn core_size(&self, distance: NodeDistance) -> usize {
        match distance {
            NodeDistance::Local => self.core_local.get(),
            NodeDistance::Remote => self.core_remote.get(),
            NodeDistance::Ignored => 0,
        }
    }

    fn max_size(&self, distance: NodeDistance) -> usize {
        match distance {
            NodeDistance::Local => self.max_local.get(),
            NodeDistance::Remote => self.max_remote.get(),
            NodeDistance::Ignored => 0,
        }
    }
}

enum MaybePoolConnections {
    /// The pool is being filled for the first time.
    Initializing,
    /// Initial filling failed or all connections broke; a refill is
    /// scheduled. Carries the error of the last connection attempt.
    Broken(ConnectionError),
    /// The node is Ignored by the load balancing policy; no connections
    /// are kept.
    Ignored,
    /// The pool was shut down; no further connections will be opened.
    Closed,
    /// At least one usable connection. Invariant: the vector is nonempty.
    Ready(Vec<Arc<Connection>>),
}

impl std::fmt::Debug for MaybePoolConnections {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MaybePoolConnections::Initializing => write!(f, "Initializing"),
            MaybePoolConnections::Broken(err) => write!(f, "Broken({err:?})"),
            MaybePoolConnections::Ignored => write!(f, "Ignored"),
            MaybePoolConnections::Closed => write!(f, "Closed"),
            MaybePoolConnections::Ready(conns) => write!(f, "Ready({} connections)", conns.len()),
        }
    }
}

enum PoolCommand {
    UseKeyspace {
        keyspace_name: VerifiedKeyspaceName,
        response_sender: oneshot::Sender<Result<(), UseKeyspaceError>>,
    },
    SetDistance(NodeDistance),
    /// Borrowing found every connection at stream-id capacity; grow the
    /// pool towards its max size.
    Grow,
    Close,
}

/// A handle to one node's pool. Clonable; all clones drive the same
/// refiller task.
#[derive(Clone)]
pub(crate) struct NodeConnectionPool {
    conns: Arc<ArcSwap<MaybePoolConnections>>,
    command_sender: mpsc::Sender<PoolCommand>,
    round_robin: Arc<AtomicUsize>,
    _refiller_handle: Arc<RemoteHandle<()>>,
    pool_updated_notify: Arc<Notify>,
    endpoint: Arc<RwLock<UntranslatedEndpoint>>,
}

impl std::fmt::Debug for NodeConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeConnectionPool")
            .field("conns", &self.conns)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl NodeConnectionPool {
    pub(crate) fn new(
        endpoint: UntranslatedEndpoint,
        pool_config: &PoolConfig,
        distance: NodeDistance,
        current_keyspace: Option<VerifiedKeyspaceName>,
        pool_empty_notifier: Option<mpsc::Sender<()>>,
    ) -> Self {
        let (command_sender, command_receiver) = mpsc::channel(8);
        let pool_updated_notify = Arc::new(Notify::new());
        let arced_endpoint = Arc::new(RwLock::new(endpoint));

        let refiller = PoolRefiller::new(
            arced_endpoint.clone(),
            pool_config.clone(),
            distance,
            current_keyspace,
            pool_updated_notify.clone(),
            pool_empty_notifier,
        );

        let conns = refiller.get_shared_connections();
        let (fut, refiller_handle) = refiller.run(command_receiver).remote_handle();
        tokio::spawn(fut);

        Self {
            conns,
            command_sender,
            round_robin: Arc::new(AtomicUsize::new(0)),
            _refiller_handle: Arc::new(refiller_handle),
            pool_updated_notify,
            endpoint: arced_endpoint,
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        matches!(**self.conns.load(), MaybePoolConnections::Ready(_))
    }

    pub(crate) fn update_endpoint(&self, new_endpoint: UntranslatedEndpoint) {
        *self.endpoint.write().unwrap() = new_endpoint;
    }

    /// Borrows a connection round-robin, skipping connections with no free
    /// stream id. When every connection is at capacity the host is "busy":
    /// the caller moves on to the next host in its plan, and the pool is
    /// nudged to grow towards its max size.
    pub(crate) fn borrow_connection(&self) -> Result<Arc<Connection>, ConnectionPoolError> {
        let conns = self.conns.load_full();
        let conns = match &*conns {
            MaybePoolConnections::Ready(conns) => conns,
            MaybePoolConnections::Broken(err) => {
                return Err(ConnectionPoolError::Broken {
                    last_connection_error: err.clone(),
                })
            }
            MaybePoolConnections::Initializing => return Err(ConnectionPoolError::Initializing),
            MaybePoolConnections::Ignored => return Err(ConnectionPoolError::HostIgnored),
            MaybePoolConnections::Closed => return Err(ConnectionPoolError::ClusterClosing),
        };

        let len = conns.len();
        let start = self.round_robin.fetch_add(1, Ordering::Relaxed) % len;
        for i in 0..len {
            let conn = &conns[(start + i) % len];
            if conn.has_free_stream_ids() {
                return Ok(conn.clone());
            }
        }

        // Every connection is saturated; ask the refiller for more.
        let _ = self.command_sender.try_send(PoolCommand::Grow);
        Err(ConnectionPoolError::HostBusy)
    }

    /// All usable connections, for operations that fan out per connection.
    pub(crate) fn get_working_connections(
        &self,
    ) -> Result<Vec<Arc<Connection>>, ConnectionPoolError> {
        match &**self.conns.load() {
            MaybePoolConnections::Ready(conns) => Ok(conns.clone()),
            MaybePoolConnections::Broken(err) => Err(ConnectionPoolError::Broken {
                last_connection_error: err.clone(),
            }),
            MaybePoolConnections::Initializing => Err(ConnectionPoolError::Initializing),
            MaybePoolConnections::Ignored => Err(ConnectionPoolError::HostIgnored),
            MaybePoolConnections::Closed => Err(ConnectionPoolError::ClusterClosing),
        }
    }

    pub(crate) async fn use_keyspace(
        &self,
        keyspace_name: VerifiedKeyspaceName,
    ) -> Result<(), UseKeyspaceError> {
        let (response_sender, response_receiver) = oneshot::channel();
        self.command_sender
            .send(PoolCommand::UseKeyspace {
                keyspace_name,
                response_sender,
            })
            .await
            .expect("PoolRefiller is dropped only when NodeConnectionPool is");
        response_receiver.await.expect("PoolRefiller always responds")
    }

    pub(crate) async fn set_distance(&self, distance: NodeDistance) {
        let _ = self.command_sender.send(PoolCommand::SetDistance(distance)).await;
    }

    /// Cancels reconnection and closes every connection. Pending requests
    /// on them fail with retriable errors, which the session surfaces as
    /// "cluster closing" during shutdown.
    pub(crate) async fn close(&self) {
        let _ = self.command_sender.send(PoolCommand::Close).await;
    }

    /// Waits until the pool either has its first connection or has finished
    /// its first (possibly failed) filling round.
    pub(crate) async fn wait_until_initialized(&self) {
        // Register for the notification first, so none is missed.
        let notified = self.pool_updated_notify.notified();
        if let MaybePoolConnections::Initializing = **self.conns.load() {
            notified.await;
        }
    }
}

struct PoolRefiller {
    pool_config: PoolConfig,
    distance: NodeDistance,
    // Grows from core towards max under stream-id pressure; reset on
    // distance changes.
    target_size: usize,

    // Subject to updates on topology refresh (an IP change preserves the pool).
    endpoint: Arc<RwLock<UntranslatedEndpoint>>,

    // `shared_conns` is published after each `conns` change.
    shared_conns: Arc<ArcSwap<MaybePoolConnections>>,
    conns: Vec<Arc<Connection>>,

    had_error_since_last_refill: bool,
    // Some while a reconnection episode is in progress.
    reconnect_schedule: Option<Box<dyn ReconnectionSchedule + Send + Sync>>,

    ready_connections:
        FuturesUnordered<Pin<Box<dyn Future<Output = OpenedConnectionEvent> + Send + 'static>>>,
    connection_errors:
        FuturesUnordered<Pin<Box<dyn Future<Output = BrokenConnectionEvent> + Send + 'static>>>,

    current_keyspace: Option<VerifiedKeyspaceName>,

    pool_updated_notify: Arc<Notify>,
    pool_empty_notifier: Option<mpsc::Sender<()>>,
}

impl PoolRefiller {
    fn new(
        endpoint: Arc<RwLock<UntranslatedEndpoint>>,
        pool_config: PoolConfig,
        distance: NodeDistance,
        current_keyspace: Option<VerifiedKeyspaceName>,
        pool_updated_notify: Arc<Notify>,
        pool_empty_notifier: Option<mpsc::Sender<()>>,
    ) -> Self {
        let initial = if distance == NodeDistance::Ignored {
            MaybePoolConnections::Ignored
        } else {
            MaybePoolConnections::Initializing
        };
        let target_size = pool_config.core_size(distance);

        Self {
            target_size,
            distance,
            pool_config,
            endpoint,
            shared_conns: Arc::new(ArcSwap::new(Arc::new(initial))),
            conns: Vec::new(),
            had_error_since_last_refill: false,
            reconnect_schedule: None,
            ready_connections: FuturesUnordered::new(),
            connection_errors: FuturesUnordered::new(),
            current_keyspace,
            pool_updated_notify,
            pool_empty_notifier,
        }
    }

    fn endpoint_description(&self) -> NodeAddr {
        self.endpoint.read().unwrap().address()
    }

    fn get_shared_connections(&self) -> Arc<ArcSwap<MaybePoolConnections>> {
        self.shared_conns.clone()
    }

    async fn run(mut self, mut command_receiver: mpsc::Receiver<PoolCommand>) {
        debug!(
            "[{}] Started asynchronous pool worker",
            self.endpoint_description()
        );

        let mut next_refill_time = tokio::time::Instant::now();
        let mut refill_scheduled = self.distance != NodeDistance::Ignored;

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(next_refill_time), if refill_scheduled => {
                    self.had_error_since_last_refill = false;
                    self.start_filling();
                    refill_scheduled = false;
                }

                evt = self.ready_connections.select_next_some(), if !self.ready_connections.is_empty() => {
                    self.handle_ready_connection(evt);
                }

                evt = self.connection_errors.select_next_some(), if !self.connection_errors.is_empty() => {
                    if let Some(conn) = evt.connection.upgrade() {
                        debug!(
                            "[{}] Got error for connection {:p}: {:?}",
                            self.endpoint_description(),
                            Arc::as_ptr(&conn),
                            evt.error
                        );
                        self.remove_connection(conn, evt.error);
                    }
                }

                cmd = command_receiver.recv() => {
                    match cmd {
                        Some(PoolCommand::UseKeyspace { keyspace_name, response_sender }) => {
                            debug!(
                                "[{}] Requested keyspace change: {}",
                                self.endpoint_description(),
                                keyspace_name.as_str()
                            );
                            self.use_keyspace(keyspace_name, response_sender);
                        }
                        Some(PoolCommand::SetDistance(distance)) => {
                            self.set_distance(distance);
                        }
                        Some(PoolCommand::Grow) => {
                            let max = self.pool_config.max_size(self.distance);
                            if self.target_size < max {
                                self.target_size += 1;
                                debug!(
                                    "[{}] Growing pool under load to {} connections",
                                    self.endpoint_description(),
                                    self.target_size
                                );
                            }
                        }
                        Some(PoolCommand::Close) | None => {
                            // Dropping the connections closes them; pending
                            // requests fail and are surfaced by the session.
                            trace!(
                                "[{}] Closing pool worker",
                                self.endpoint_description()
                            );
                            self.conns.clear();
                            self.shared_conns.store(Arc::new(MaybePoolConnections::Closed));
                            self.pool_updated_notify.notify_waiters();
                            return;
                        }
                    }
                }
            }

            // Schedule the next refill if the pool needs one.
            if !refill_scheduled && self.need_filling() {
                let delay = if self.had_error_since_last_refill {
                    self.reconnect_schedule
                        .get_or_insert_with(|| {
                            self.pool_config.reconnection_policy.new_schedule()
                        })
                        .next_delay()
                } else {
                    // The reconnection episode (if any) is over.
                    self.reconnect_schedule = None;
                    std::time::Duration::ZERO
                };
                debug!(
                    "[{}] Scheduling next refill in {} ms",
                    self.endpoint_description(),
                    delay.as_millis(),
                );
                next_refill_time = tokio::time::Instant::now() + delay;
                refill_scheduled = true;
            }
        }
    }

    fn is_filling(&self) -> bool {
        !self.ready_connections.is_empty()
    }

    fn is_full(&self) -> bool {
        self.conns.len() >= self.target_size
    }

    fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    fn need_filling(&self) -> bool {
        self.distance != NodeDistance::Ignored && !self.is_filling() && !self.is_full()
    }

    fn set_distance(&mut self, distance: NodeDistance) {
        if distance == self.distance {
            return;
        }
        debug!(
            "[{}] Node distance changed to {:?}",
            self.endpoint_description(),
            distance
        );
        self.distance = distance;
        self.target_size = self.pool_config.core_size(distance);

        if distance == NodeDistance::Ignored {
            self.conns.clear();
            self.shared_conns
                .store(Arc::new(MaybePoolConnections::Ignored));
            self.pool_updated_notify.notify_waiters();
        } else {
            // Shrink an oversized pool; missing connections are opened by
            // the refill scheduling in the main loop.
            if self.conns.len() > self.target_size {
                self.conns.truncate(self.target_size);
            }
            self.update_shared_conns(None);
        }
    }

    // Starts opening as many connections as are missing from the target.
    fn start_filling(&mut self) {
        if self.distance == NodeDistance::Ignored {
            return;
        }
        let to_open_count = if self.is_empty() {
            // If the pool is empty the node may well be down; probing with
            // a single connection avoids a useless connection storm.
            1
        } else {
            self.target_size.saturating_sub(self.conns.len())
        };
        trace!(
            "[{}] Will open {} connections",
            self.endpoint_description(),
            to_open_count,
        );
        for _ in 0..to_open_count {
            self.start_opening_connection();
        }
    }

    fn handle_ready_connection(&mut self, evt: OpenedConnectionEvent) {
        match evt.result {
            Err(err) => {
                self.had_error_since_last_refill = true;
                debug!(
                    "[{}] Failed to open connection: {:?}",
                    self.endpoint_description(),
                    err,
                );
                if !self.is_filling() && self.is_empty() {
                    self.update_shared_conns(Some(err));
                    if let Some(notifier) = self.pool_empty_notifier.as_ref() {
                        let _ = notifier.try_send(());
                    }
                }
            }
            Ok((connection, error_receiver)) => {
                // Replay the session keyspace before admitting the
                // connection to the pool.
                if let Some(keyspace) = &self.current_keyspace {
                    if evt.keyspace_name.as_ref() != Some(keyspace) {
                        self.start_setting_keyspace_for_connection(connection, error_receiver);
                        return;
                    }
                }

                if self.conns.len() < self.target_size {
                    let conn = Arc::new(connection);
                    trace!(
                        "[{}] Adding connection {:p} to the pool, now {} in total",
                        self.endpoint_description(),
                        Arc::as_ptr(&conn),
                        self.conns.len() + 1,
                    );
                    self.connection_errors
                        .push(wait_for_error(Arc::downgrade(&conn), error_receiver).boxed());
                    self.conns.push(conn);
                    self.update_shared_conns(None);
                }
                // A surplus connection (target shrank mid-open) is dropped
                // on the floor, closing it.
            }
        }
    }

    fn start_opening_connection(&self) {
        let cfg: ConnectionConfig = self.pool_config.connection_config.clone();
        let endpoint = self.endpoint.read().unwrap().clone();
        let keyspace_name = None;
        self.ready_connections.push(
            async move {
                let result = open_connection(&endpoint, &cfg).await;
                OpenedConnectionEvent {
                    result,
                    keyspace_name,
                }
            }
            .boxed(),
        );
    }

    fn update_shared_conns(&mut self, last_error: Option<ConnectionError>) {
        let new_conns = if self.distance == NodeDistance::Ignored {
            Arc::new(MaybePoolConnections::Ignored)
        } else if self.is_empty() {
            Arc::new(MaybePoolConnections::Broken(last_error.unwrap_or(
                ConnectionError::BrokenConnection(
                    BrokenConnectionErrorKind::ChannelError.into(),
                ),
            )))
        } else {
            Arc::new(MaybePoolConnections::Ready(self.conns.clone()))
        };
        self.shared_conns.store(new_conns);
        self.pool_updated_notify.notify_waiters();
    }

    fn remove_connection(&mut self, connection: Arc<Connection>, last_error: ConnectionError) {
        let ptr = Arc::as_ptr(&connection);

        let maybe_idx = self
            .conns
            .iter()
            .position(|other_conn| Arc::ptr_eq(&connection, other_conn));
        match maybe_idx {
            Some(idx) => {
                self.conns.swap_remove(idx);
                trace!(
                    "[{}] Connection {:p} removed from the pool, {} remain",
                    self.endpoint_description(),
                    ptr,
                    self.conns.len(),
                );
                if self.is_empty() {
                    if let Some(notifier) = self.pool_empty_notifier.as_ref() {
                        let _ = notifier.try_send(());
                    }
                }
                self.update_shared_conns(Some(last_error));
            }
            None => {
                trace!(
                    "[{}] Connection {:p} was already removed",
                    self.endpoint_description(),
                    ptr,
                );
            }
        }
    }

    // Sets the keyspace on all current connections. Connections that are
    // still being opened will have it replayed when they become ready.
    fn use_keyspace(
        &mut self,
        keyspace_name: VerifiedKeyspaceName,
        response_sender: oneshot::Sender<Result<(), UseKeyspaceError>>,
    ) {
        self.current_keyspace = Some(keyspace_name.clone());

        let conns = self.conns.clone();
        let address = self.endpoint.read().unwrap().address();
        let connect_timeout = self.pool_config.connection_config.connect_timeout;

        let fut = async move {
            if conns.is_empty() {
                return Ok(());
            }

            let mut use_keyspace_futures = Vec::new();
            for conn in conns.iter() {
                use_keyspace_futures.push(conn.use_keyspace(&keyspace_name));
            }

            let use_keyspace_results: Vec<Result<(), UseKeyspaceError>> = tokio::time::timeout(
                connect_timeout,
                futures::future::join_all(use_keyspace_futures),
            )
            .await
            .map_err(|_| UseKeyspaceError::RequestTimeout(connect_timeout))?;

            use_keyspace_result(use_keyspace_results.into_iter())
        };

        tokio::task::spawn(async move {
            let res = fut.await;
            match &res {
                Ok(()) => debug!("[{}] Successfully changed current keyspace", address),
                Err(err) => warn!("[{}] Failed to change keyspace: {:?}", address, err),
            }
            let _ = response_sender.send(res);
        });
    }

    fn start_setting_keyspace_for_connection(
        &mut self,
        connection: Connection,
        error_receiver: ErrorReceiver,
    ) {
        let keyspace_name = self
            .current_keyspace
            .as_ref()
            .cloned()
            .expect("caller guarantees the keyspace is set");
        self.ready_connections.push(
            async move {
                let result = connection.use_keyspace(&keyspace_name).await;
                if let Err(err) = result {
                    warn!(
                        "[{}] Failed to set keyspace for new connection: {}",
                        connection.get_connect_address().ip(),
                        err,
                    );
                }
                OpenedConnectionEvent {
                    result: Ok((connection, error_receiver)),
                    keyspace_name: Some(keyspace_name),
                }
            }
            .boxed(),
        );
    }
}

/// Combines per-connection USE results: as long as one connection confirmed
/// the keyspace, broken-connection failures are tolerated (the keyspace is
/// replayed on reconnect); any other failure is real.
pub(crate) fn use_keyspace_result(
    use_keyspace_results: impl Iterator<Item = Result<(), UseKeyspaceError>>,
) -> Result<(), UseKeyspaceError> {
    let mut was_ok = false;
    let mut broken_conn_error: Option<UseKeyspaceError> = None;

    for result in use_keyspace_results {
        match result {
            Ok(()) => was_ok = true,
            Err(err) => match err {
                UseKeyspaceError::RequestError(
                    crate::errors::RequestAttemptError::BrokenConnectionError(_),
                ) => broken_conn_error = Some(err),
                _ => return Err(err),
            },
        }
    }

    if was_ok {
        return Ok(());
    }

    // The results iterator is nonempty by contract.
    Err(broken_conn_error.expect("use_keyspace_results must be nonempty"))
}

struct BrokenConnectionEvent {
    connection: Weak<Connection>,
    error: ConnectionError,
}

async fn wait_for_error(
    connection: Weak<Connection>,
    error_receiver: ErrorReceiver,
) -> BrokenConnectionEvent {
    BrokenConnectionEvent {
        connection,
        error: error_receiver.await.unwrap_or_else(|_| {
            ConnectionError::BrokenConnection(BrokenConnectionErrorKind::ChannelError.into())
        }),
    }
}

struct OpenedConnectionEvent {
    result: Result<(Connection, ErrorReceiver), ConnectionError>,
    keyspace_name: Option<VerifiedKeyspaceName>,
}
