//! A single multiplexed connection to one node.
//!
//! One TCP (or TLS-wrapped) stream carries many concurrent requests, paired
//! to responses by stream id. A background router task owns the socket and
//! splits into four cooperating loops: writer (requests out), reader
//! (responses in, demultiplexed by stream id), orphaner (reclaims stream ids
//! of abandoned requests) and keepaliver (heartbeats on idle connections).

use std::borrow::Cow;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use bytes::Bytes;
use futures::{future::RemoteHandle, FutureExt};
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use corvus_cql::frame::frame_errors::FrameError;
use corvus_cql::frame::protocol_features::ProtocolFeatures;
use corvus_cql::frame::request::{self, batch, execute, query, register, SerializableRequest};
use corvus_cql::frame::response::event::Event;
use corvus_cql::frame::response::{result, Error, Response, ResponseOpcode};
use corvus_cql::frame::segment::{segment_frame, Segment};
use corvus_cql::frame::server_event_type::EventType;
use corvus_cql::frame::{
    self, Compression, FrameParams, ProtocolVersion, SerializedRequest,
};
use corvus_cql::frame::types::SerialConsistency;
use corvus_cql::serialize::SerializedValues;
use corvus_cql::{Consistency, DbError};

use crate::authentication::AuthenticatorProvider;
use crate::cluster::metadata::UntranslatedEndpoint;
use crate::errors::{
    BadKeyspaceName, BrokenConnectionError, BrokenConnectionErrorKind, ConnectionError,
    ConnectionSetupRequestError, ConnectionSetupRequestErrorKind, InternalRequestError,
    RequestAttemptError, TranslationError,
};
use crate::network::tls::{SessionStream, TlsWrapper};
use crate::policies::address_translator::{AddressTranslator, UntranslatedPeer};
use crate::policies::timestamp_generator::TimestampGenerator;
use crate::response::query_result::QueryResult;
use crate::response::{NonErrorAuthResponse, NonErrorStartupResponse, QueryResponse};
use crate::statement::batch::{Batch, BatchStatement};
use crate::statement::prepared::PreparedStatement;
use crate::statement::unprepared::Statement;
use crate::statement::PageSize;

use corvus_cql::frame::request::query::PagingState;
use corvus_cql::frame::response::authenticate::Authenticate;

// Statement used for schema-agreement checks.
const LOCAL_VERSION: &str = "SELECT schema_version FROM system.local WHERE key='local'";

// A stream id is "orphaned" when the request that owned it was abandoned
// (deadline, cancellation) before the response arrived. The id must not be
// reused until the server answers, or responses would cross talk. A
// connection accumulating more than this many old orphans is reset.
const OLD_ORPHAN_COUNT_THRESHOLD: usize = 16;
const OLD_AGE_ORPHAN_THRESHOLD: Duration = Duration::from_secs(1);

/// Identity advertised to the server in STARTUP options and visible in the
/// server-side client registry.
#[derive(Debug, Clone, Default)]
pub struct SelfIdentity {
    custom_driver_name: Option<String>,
    custom_driver_version: Option<String>,
    application_name: Option<String>,
    application_version: Option<String>,
    client_id: Option<String>,
}

impl SelfIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_application_name(&mut self, name: impl Into<String>) {
        self.application_name = Some(name.into());
    }

    pub fn set_application_version(&mut self, version: impl Into<String>) {
        self.application_version = Some(version.into());
    }

    pub fn set_client_id(&mut self, id: impl Into<String>) {
        self.client_id = Some(id.into());
    }

    pub fn set_custom_driver_name(&mut self, name: impl Into<String>) {
        self.custom_driver_name = Some(name.into());
    }

    pub fn set_custom_driver_version(&mut self, version: impl Into<String>) {
        self.custom_driver_version = Some(version.into());
    }

    fn add_startup_options(&self, options: &mut HashMap<Cow<'_, str>, Cow<'_, str>>) {
        let driver_name = self
            .custom_driver_name
            .clone()
            .unwrap_or_else(|| request::startup::DEFAULT_DRIVER_NAME.into());
        options.insert(
            Cow::Borrowed(request::startup::DRIVER_NAME),
            Cow::Owned(driver_name),
        );

        let driver_version = self
            .custom_driver_version
            .clone()
            .unwrap_or_else(|| request::startup::DEFAULT_DRIVER_VERSION.into());
        options.insert(
            Cow::Borrowed(request::startup::DRIVER_VERSION),
            Cow::Owned(driver_version),
        );

        if let Some(application_name) = &self.application_name {
            options.insert(
                Cow::Borrowed(request::startup::APPLICATION_NAME),
                Cow::Owned(application_name.clone()),
            );
        }
        if let Some(application_version) = &self.application_version {
            options.insert(
                Cow::Borrowed(request::startup::APPLICATION_VERSION),
                Cow::Owned(application_version.clone()),
            );
        }
        if let Some(client_id) = &self.client_id {
            options.insert(
                Cow::Borrowed(request::startup::CLIENT_ID),
                Cow::Owned(client_id.clone()),
            );
        }
    }
}

/// Configuration shared by all connections the session opens.
#[derive(Clone)]
pub(crate) struct ConnectionConfig {
    pub(crate) compression: Option<Compression>,
    pub(crate) tcp_nodelay: bool,
    pub(crate) tcp_keepalive_interval: Option<Duration>,
    pub(crate) timestamp_generator: Option<Arc<dyn TimestampGenerator>>,
    pub(crate) tls_wrapper: Option<Arc<dyn TlsWrapper>>,
    pub(crate) connect_timeout: Duration,
    // Set only on the control connection; makes setup REGISTER for events
    // and the reader forward them into this channel.
    pub(crate) event_sender: Option<mpsc::Sender<Event>>,
    pub(crate) default_consistency: Consistency,
    pub(crate) authenticator: Option<Arc<dyn AuthenticatorProvider>>,
    pub(crate) address_translator: Option<Arc<dyn AddressTranslator>>,
    pub(crate) keepalive_interval: Option<Duration>,
    pub(crate) keepalive_timeout: Option<Duration>,
    /// Forces a protocol version instead of negotiating one.
    pub(crate) protocol_version: Option<ProtocolVersion>,
    pub(crate) allow_beta_protocol: bool,
    pub(crate) max_frame_length: usize,
    pub(crate) identity: SelfIdentity,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            compression: None,
            tcp_nodelay: true,
            tcp_keepalive_interval: None,
            timestamp_generator: None,
            tls_wrapper: None,
            connect_timeout: Duration::from_secs(5),
            event_sender: None,
            default_consistency: Consistency::default(),
            authenticator: None,
            address_translator: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_timeout: Some(Duration::from_secs(30)),
            protocol_version: None,
            allow_beta_protocol: false,
            max_frame_length: frame::DEFAULT_MAX_FRAME_LENGTH,
            identity: SelfIdentity::default(),
        }
    }
}

/// Negotiated per-connection facts, fixed once setup finishes.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ConnectionFeatures {
    pub(crate) protocol_version: ProtocolVersion,
    pub(crate) protocol_features: ProtocolFeatures,
}

impl Default for ConnectionFeatures {
    fn default() -> Self {
        Self {
            protocol_version: ProtocolVersion::V4,
            protocol_features: ProtocolFeatures::default(),
        }
    }
}

type RequestId = u64;

pub(crate) struct Connection {
    _worker_handle: RemoteHandle<()>,

    connect_address: SocketAddr,
    config: ConnectionConfig,
    features: ConnectionFeatures,
    router_handle: Arc<RouterHandle>,
    // Flipped once, right after STARTUP succeeds on a v5 connection.
    segment_mode: Arc<AtomicBool>,
}

struct RouterHandle {
    submit_channel: mpsc::Sender<Task>,

    // Each request gets a process-unique id, used to match late orphan
    // notifications to stream ids.
    request_id_generator: AtomicU64,
    // Number of stream ids currently claimed (in-flight + orphaned).
    used_stream_ids: Arc<AtomicUsize>,
    // Total stream ids available on this connection.
    stream_id_capacity: AtomicUsize,
    // Unbounded so that Drop impls can push without awaiting.
    orphan_notification_sender: mpsc::UnboundedSender<RequestId>,
}

impl RouterHandle {
    fn allocate_request_id(&self) -> RequestId {
        self.request_id_generator.fetch_add(1, Ordering::Relaxed)
    }

    async fn send_request(
        &self,
        serialized_request: SerializedRequest,
    ) -> Result<TaskResponse, InternalRequestError> {
        let request_id = self.allocate_request_id();
        let (response_sender, receiver) = oneshot::channel();
        let response_handler = ResponseHandler {
            response_sender,
            request_id,
        };

        // Dropping the notifier before `disable()` marks the stream id
        // associated with this request as orphaned.
        let notifier = OrphanhoodNotifier::new(request_id, &self.orphan_notification_sender);

        self.submit_channel
            .send(Task {
                serialized_request,
                response_handler,
            })
            .await
            .map_err(|_| -> BrokenConnectionError {
                BrokenConnectionErrorKind::ChannelError.into()
            })?;

        let task_response = receiver.await.map_err(|_| -> BrokenConnectionError {
            BrokenConnectionErrorKind::ChannelError.into()
        })?;

        // The response arrived; no orphaning needed.
        notifier.disable();

        task_response
    }
}

struct ResponseHandler {
    response_sender: oneshot::Sender<Result<TaskResponse, InternalRequestError>>,
    request_id: RequestId,
}

// Notifies the router about a `send_request` future dropped before its
// response arrived.
struct OrphanhoodNotifier<'a> {
    enabled: bool,
    request_id: RequestId,
    notification_sender: &'a mpsc::UnboundedSender<RequestId>,
}

impl<'a> OrphanhoodNotifier<'a> {
    fn new(
        request_id: RequestId,
        notification_sender: &'a mpsc::UnboundedSender<RequestId>,
    ) -> Self {
        Self {
            enabled: true,
            request_id,
            notification_sender,
        }
    }

    fn disable(mut self) {
        self.enabled = false;
    }
}

impl Drop for OrphanhoodNotifier<'_> {
    fn drop(&mut self) {
        if self.enabled {
            let _ = self.notification_sender.send(self.request_id);
        }
    }
}

struct Task {
    serialized_request: SerializedRequest,
    response_handler: ResponseHandler,
}

struct TaskResponse {
    params: FrameParams,
    opcode: ResponseOpcode,
    body: Bytes,
}

/// Listens for the fatal error that killed a connection.
pub(crate) type ErrorReceiver = oneshot::Receiver<ConnectionError>;

impl Connection {
    /// Opens the transport and spawns the router; no frames are exchanged
    /// yet (the caller drives the OPTIONS/STARTUP handshake).
    async fn new(
        connect_address: SocketAddr,
        version: ProtocolVersion,
        config: ConnectionConfig,
    ) -> Result<(Self, ErrorReceiver), ConnectionError> {
        let stream = match tokio::time::timeout(
            config.connect_timeout,
            connect_tcp(connect_address),
        )
        .await
        {
            Ok(stream) => stream?,
            Err(_) => return Err(ConnectionError::ConnectTimeout),
        };
        stream.set_nodelay(config.tcp_nodelay)?;

        if let Some(tcp_keepalive_interval) = config.tcp_keepalive_interval {
            Self::setup_tcp_keepalive(&stream, tcp_keepalive_interval)?;
        }

        let stream: Box<dyn SessionStream> = match &config.tls_wrapper {
            Some(wrapper) => wrapper.wrap(stream).await?,
            None => Box::new(stream),
        };

        let (sender, receiver) = mpsc::channel(1024);
        let (error_sender, error_receiver) = oneshot::channel();
        let (orphan_notification_sender, orphan_notification_receiver) = mpsc::unbounded_channel();

        let used_stream_ids = Arc::new(AtomicUsize::new(0));
        let segment_mode = Arc::new(AtomicBool::new(false));

        let router_handle = Arc::new(RouterHandle {
            submit_channel: sender,
            request_id_generator: AtomicU64::new(0),
            used_stream_ids: used_stream_ids.clone(),
            stream_id_capacity: AtomicUsize::new(version.stream_id_pool_size()),
            orphan_notification_sender,
        });

        let (task, _worker_handle) = Self::router(
            config.clone(),
            stream,
            version,
            segment_mode.clone(),
            used_stream_ids,
            receiver,
            error_sender,
            orphan_notification_receiver,
            router_handle.clone(),
        )
        .remote_handle();
        tokio::task::spawn(task);

        let connection = Connection {
            _worker_handle,
            connect_address,
            config,
            features: ConnectionFeatures {
                protocol_version: version,
                protocol_features: ProtocolFeatures::default(),
            },
            router_handle,
            segment_mode,
        };

        Ok((connection, error_receiver))
    }

    fn setup_tcp_keepalive(
        stream: &TcpStream,
        tcp_keepalive_interval: Duration,
    ) -> std::io::Result<()> {
        // `with_time` is the idle time before keepalives start; probes are
        // then sent every second.
        let mut tcp_keepalive = TcpKeepalive::new().with_time(tcp_keepalive_interval);

        #[cfg(any(
            target_os = "android",
            target_os = "dragonfly",
            target_os = "freebsd",
            target_os = "fuchsia",
            target_os = "illumos",
            target_os = "ios",
            target_os = "linux",
            target_os = "macos",
            target_os = "netbsd",
            target_os = "tvos",
            target_os = "watchos",
            target_os = "windows",
        ))]
        {
            tcp_keepalive = tcp_keepalive.with_interval(Duration::from_secs(1));
        }

        let sf = SockRef::from(&stream);
        sf.set_tcp_keepalive(&tcp_keepalive)
    }

    pub(crate) fn get_connect_address(&self) -> SocketAddr {
        self.connect_address
    }

    /// Whether at least one stream id is free right now. Purely advisory:
    /// the race with concurrent senders is resolved at send time, which
    /// fails with [InternalRequestError::UnableToAllocStreamId].
    pub(crate) fn has_free_stream_ids(&self) -> bool {
        self.router_handle.used_stream_ids.load(Ordering::Relaxed)
            < self.router_handle.stream_id_capacity.load(Ordering::Relaxed)
    }

    fn set_features(&mut self, features: ConnectionFeatures) {
        self.features = features;
    }

    async fn send_request(
        &self,
        request: &impl SerializableRequest,
        compress: bool,
        tracing: bool,
    ) -> Result<QueryResponse, InternalRequestError> {
        let compression = if compress { self.config.compression } else { None };
        let mut serialized_request = SerializedRequest::make(
            request,
            self.features.protocol_version,
            compression,
            tracing,
        )?;
        if self.config.allow_beta_protocol {
            serialized_request.set_beta();
        }

        let task_response = self.router_handle.send_request(serialized_request).await?;

        let response = Self::parse_response(
            task_response,
            self.features.protocol_version,
            self.config.compression,
            &self.features.protocol_features,
        )?;
        Ok(response)
    }

    fn parse_response(
        task_response: TaskResponse,
        version: ProtocolVersion,
        compression: Option<Compression>,
        features: &ProtocolFeatures,
    ) -> Result<QueryResponse, InternalRequestError> {
        let body_with_ext = frame::parse_response_body_extensions(
            task_response.params.flags,
            compression,
            task_response.body,
        )?;

        for warn_description in &body_with_ext.warnings {
            warn!(
                warning = warn_description.as_str(),
                "Response from the database contains a warning",
            );
        }

        let response = Response::deserialize(
            features,
            version,
            task_response.opcode,
            &mut &*body_with_ext.body,
        )?;

        Ok(QueryResponse {
            response,
            warnings: body_with_ext.warnings,
            tracing_id: body_with_ext.trace_id,
            custom_payload: body_with_ext.custom_payload,
        })
    }

    /* Setup-sequence requests. */

    async fn get_options(
        &self,
    ) -> Result<corvus_cql::frame::response::Supported, ConnectionSetupRequestError> {
        let err =
            |kind: ConnectionSetupRequestErrorKind| ConnectionSetupRequestError::new("OPTIONS", kind);

        match self.send_request(&request::Options, false, false).await {
            Ok(response) => match response.response {
                Response::Supported(supported) => Ok(supported),
                Response::Error(Error { error, reason }) => {
                    Err(err(ConnectionSetupRequestErrorKind::DbError(error, reason)))
                }
                other => Err(err(ConnectionSetupRequestErrorKind::UnexpectedResponse(
                    other.to_response_kind(),
                ))),
            },
            Err(e) => Err(err(e.into())),
        }
    }

    async fn startup(
        &self,
        options: HashMap<Cow<'_, str>, Cow<'_, str>>,
    ) -> Result<NonErrorStartupResponse, ConnectionSetupRequestError> {
        let err =
            |kind: ConnectionSetupRequestErrorKind| ConnectionSetupRequestError::new("STARTUP", kind);

        match self.send_request(&request::Startup { options }, false, false).await {
            Ok(response) => match response.response {
                Response::Ready => Ok(NonErrorStartupResponse::Ready),
                Response::Authenticate(auth) => Ok(NonErrorStartupResponse::Authenticate(auth)),
                Response::Error(Error { error, reason }) => {
                    Err(err(ConnectionSetupRequestErrorKind::DbError(error, reason)))
                }
                other => Err(err(ConnectionSetupRequestErrorKind::UnexpectedResponse(
                    other.to_response_kind(),
                ))),
            },
            Err(e) => Err(err(e.into())),
        }
    }

    async fn perform_authenticate(
        &self,
        authenticate: &Authenticate,
    ) -> Result<(), ConnectionSetupRequestError> {
        let err = |kind: ConnectionSetupRequestErrorKind| {
            ConnectionSetupRequestError::new("AUTH_RESPONSE", kind)
        };

        let authenticator = &authenticate.authenticator_name as &str;

        match self.config.authenticator {
            Some(ref authenticator_provider) => {
                let (mut response, mut auth_session) = authenticator_provider
                    .start_authentication_session(authenticator)
                    .await
                    .map_err(|e| err(ConnectionSetupRequestErrorKind::StartAuthSessionError(e)))?;

                loop {
                    match self.authenticate_response(response).await? {
                        NonErrorAuthResponse::AuthChallenge(challenge) => {
                            response = auth_session
                                .evaluate_challenge(challenge.authenticate_message.as_deref())
                                .await
                                .map_err(|e| {
                                    err(ConnectionSetupRequestErrorKind::AuthChallengeEvaluationError(e))
                                })?;
                        }
                        NonErrorAuthResponse::AuthSuccess(success) => {
                            auth_session
                                .success(success.success_message.as_deref())
                                .await
                                .map_err(|e| {
                                    err(ConnectionSetupRequestErrorKind::AuthFinishError(e))
                                })?;
                            break;
                        }
                    }
                }
            }
            None => return Err(err(ConnectionSetupRequestErrorKind::MissingAuthentication)),
        }

        Ok(())
    }

    async fn authenticate_response(
        &self,
        response: Option<Vec<u8>>,
    ) -> Result<NonErrorAuthResponse, ConnectionSetupRequestError> {
        let err = |kind: ConnectionSetupRequestErrorKind| {
            ConnectionSetupRequestError::new("AUTH_RESPONSE", kind)
        };

        match self
            .send_request(&request::AuthResponse { response }, false, false)
            .await
        {
            Ok(r) => match r.response {
                Response::AuthSuccess(auth_success) => {
                    Ok(NonErrorAuthResponse::AuthSuccess(auth_success))
                }
                Response::AuthChallenge(auth_challenge) => {
                    Ok(NonErrorAuthResponse::AuthChallenge(auth_challenge))
                }
                Response::Error(Error { error, reason }) => {
                    Err(err(ConnectionSetupRequestErrorKind::DbError(error, reason)))
                }
                other => Err(err(ConnectionSetupRequestErrorKind::UnexpectedResponse(
                    other.to_response_kind(),
                ))),
            },
            Err(e) => Err(err(e.into())),
        }
    }

    async fn register(
        &self,
        event_types_to_register_for: Vec<EventType>,
    ) -> Result<(), ConnectionSetupRequestError> {
        let err = |kind: ConnectionSetupRequestErrorKind| {
            ConnectionSetupRequestError::new("REGISTER", kind)
        };

        let register_frame = register::Register {
            event_types_to_register_for,
        };

        match self.send_request(&register_frame, true, false).await {
            Ok(r) => match r.response {
                Response::Ready => Ok(()),
                Response::Error(Error { error, reason }) => {
                    Err(err(ConnectionSetupRequestErrorKind::DbError(error, reason)))
                }
                other => Err(err(ConnectionSetupRequestErrorKind::UnexpectedResponse(
                    other.to_response_kind(),
                ))),
            },
            Err(e) => Err(err(e.into())),
        }
    }

    /* Data requests. */

    fn get_timestamp(&self, statement_timestamp: Option<i64>) -> Option<i64> {
        statement_timestamp.or_else(|| {
            self.config
                .timestamp_generator
                .as_ref()
                .map(|generator| generator.next_timestamp())
        })
    }

    pub(crate) async fn query_raw_with_consistency(
        &self,
        statement: &Statement,
        values: &SerializedValues,
        consistency: Consistency,
        serial_consistency: Option<SerialConsistency>,
        page_size: Option<PageSize>,
        paging_state: PagingState,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let timestamp = self.get_timestamp(statement.get_timestamp());

        let query_frame = query::Query {
            contents: Cow::Borrowed(&statement.contents),
            parameters: query::QueryParameters {
                consistency,
                serial_consistency,
                values: Cow::Borrowed(values),
                page_size: page_size.map(|ps| ps.inner()),
                paging_state,
                skip_metadata: false,
                timestamp,
            },
        };

        let response = self
            .send_request(&query_frame, true, statement.config.tracing)
            .await?;
        Ok(response)
    }

    pub(crate) async fn execute_raw_with_consistency(
        &self,
        prepared_statement: &PreparedStatement,
        values: &SerializedValues,
        consistency: Consistency,
        serial_consistency: Option<SerialConsistency>,
        page_size: Option<PageSize>,
        paging_state: PagingState,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let timestamp = self.get_timestamp(prepared_statement.config.timestamp);

        // v5 requires echoing the result metadata id the client has cached.
        let result_metadata_id = (self.features.protocol_version >= ProtocolVersion::V5)
            .then(|| {
                prepared_statement
                    .get_result_metadata_id()
                    .map(|id| (*id).clone())
                    // Prepared on an older-protocol connection; an empty id
                    // makes the server send fresh metadata.
                    .unwrap_or_else(Bytes::new)
            });

        let execute_frame = execute::Execute {
            id: prepared_statement.get_id().clone(),
            result_metadata_id,
            parameters: query::QueryParameters {
                consistency,
                serial_consistency,
                values: Cow::Borrowed(values),
                page_size: page_size.map(|ps| ps.inner()),
                paging_state: paging_state.clone(),
                skip_metadata: false,
                timestamp,
            },
        };

        let query_response = self
            .send_request(&execute_frame, true, prepared_statement.config.tracing)
            .await?;

        Self::note_result_metadata_change(prepared_statement, &query_response);

        match &query_response.response {
            Response::Error(Error {
                error: DbError::Unprepared { statement_id },
                ..
            }) => {
                debug!(
                    "Connection::execute: the statement with id {:?} is unprepared on this node; re-preparing",
                    statement_id
                );
                // Re-prepare on the same connection, then retry once.
                self.reprepare(prepared_statement.get_statement(), prepared_statement)
                    .await?;
                let new_response = self
                    .send_request(&execute_frame, true, prepared_statement.config.tracing)
                    .await?;
                Self::note_result_metadata_change(prepared_statement, &new_response);
                Ok(new_response)
            }
            _ => Ok(query_response),
        }
    }

    // A v5+ server reports a changed result metadata id inside the rows
    // metadata; cache the fresh metadata for subsequent EXECUTEs.
    fn note_result_metadata_change(
        prepared_statement: &PreparedStatement,
        query_response: &QueryResponse,
    ) {
        if let Response::Result(result::Result::Rows(rows)) = &query_response.response {
            if let Some(new_id) = rows.metadata.new_metadata_id.as_ref() {
                prepared_statement
                    .update_result_metadata(Some(new_id.clone()), rows.metadata.clone());
            }
        }
    }

    pub(crate) async fn batch_with_consistency(
        &self,
        init_batch: &Batch,
        values: &[SerializedValues],
        consistency: Consistency,
        serial_consistency: Option<SerialConsistency>,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let batch = self.prepare_batch(init_batch, values).await?;
        let timestamp = self.get_timestamp(batch.get_timestamp());

        let statements: Vec<batch::BatchStatement<'_>> = batch
            .statements
            .iter()
            .map(|s| match s {
                BatchStatement::Query(q) => batch::BatchStatement::Query {
                    text: Cow::Borrowed(q.contents.as_str()),
                },
                BatchStatement::PreparedStatement(p) => batch::BatchStatement::Prepared {
                    id: Cow::Borrowed(p.get_id()),
                },
            })
            .collect();

        let batch_frame = batch::Batch {
            statements: Cow::Owned(statements),
            batch_type: batch.get_type(),
            consistency,
            serial_consistency,
            timestamp,
            values: values.to_vec(),
        };

        loop {
            let query_response = self
                .send_request(&batch_frame, true, batch.config.tracing)
                .await?;

            return match query_response.response {
                Response::Error(err) => match err.error {
                    DbError::Unprepared { statement_id } => {
                        debug!(
                            "Connection::batch: the statement with id {:?} is unprepared on this node; re-preparing",
                            statement_id
                        );
                        let prepared_statement = batch.statements.iter().find_map(|s| match s {
                            BatchStatement::PreparedStatement(s)
                                if *s.get_id() == statement_id =>
                            {
                                Some(s)
                            }
                            _ => None,
                        });
                        if let Some(p) = prepared_statement {
                            self.reprepare(p.get_statement(), p).await?;
                            continue;
                        } else {
                            return Err(RequestAttemptError::RepreparedIdMissingInBatch);
                        }
                    }
                    _ => Err(err.into()),
                },
                Response::Result(_) => Ok(query_response),
                other => Err(RequestAttemptError::UnexpectedResponse(
                    other.to_response_kind(),
                )),
            };
        }
    }

    // Prepares every unprepared statement of the batch that has bound
    // values, on this connection, so that the server can bind them.
    async fn prepare_batch<'b>(
        &self,
        init_batch: &'b Batch,
        values: &[SerializedValues],
    ) -> Result<Cow<'b, Batch>, RequestAttemptError> {
        let mut to_prepare = HashSet::<&str>::new();

        for (statement, statement_values) in init_batch.statements.iter().zip(values.iter()) {
            if let BatchStatement::Query(query) = statement {
                if !statement_values.is_empty() {
                    to_prepare.insert(&query.contents);
                }
            }
        }

        if to_prepare.is_empty() {
            return Ok(Cow::Borrowed(init_batch));
        }

        let mut prepared_queries = HashMap::<&str, PreparedStatement>::new();
        for query in &to_prepare {
            let prepared = self.prepare(&Statement::new(query.to_string())).await?;
            prepared_queries.insert(*query, prepared);
        }

        let mut batch: Cow<Batch> = Cow::Owned(Batch::new_from(init_batch));
        for statement in &init_batch.statements {
            match statement {
                BatchStatement::Query(query) => {
                    match prepared_queries.get(query.contents.as_str()) {
                        Some(prepared) => batch.to_mut().append_statement(prepared.clone()),
                        None => batch.to_mut().append_statement(query.clone()),
                    }
                }
                BatchStatement::PreparedStatement(prepared) => {
                    batch.to_mut().append_statement(prepared.clone());
                }
            }
        }

        Ok(batch)
    }

    pub(crate) async fn prepare(
        &self,
        statement: &Statement,
    ) -> Result<PreparedStatement, RequestAttemptError> {
        let query_response = self
            .send_request(
                &request::Prepare {
                    query: &statement.contents,
                },
                true,
                statement.config.tracing,
            )
            .await?;

        match query_response.response {
            Response::Error(Error { error, reason }) => {
                Err(RequestAttemptError::DbError(error, reason))
            }
            Response::Result(result::Result::Prepared(p)) => {
                let keyspace_hint = p
                    .prepared_metadata
                    .col_specs
                    .first()
                    .map(|spec| spec.table_spec.ks_name.clone());
                Ok(PreparedStatement::new(
                    p.id,
                    statement,
                    keyspace_hint,
                    p.prepared_metadata,
                    p.result_metadata_id,
                    p.result_metadata,
                    Default::default(),
                ))
            }
            _ => Err(RequestAttemptError::UnexpectedResponse(
                query_response.response.to_response_kind(),
            )),
        }
    }

    pub(crate) async fn reprepare(
        &self,
        statement_text: impl Into<Statement>,
        previous_prepared: &PreparedStatement,
    ) -> Result<(), RequestAttemptError> {
        let reprepare_statement: Statement = statement_text.into();
        let reprepared = self.prepare(&reprepare_statement).await?;
        // The statement id is a digest of the statement text, so it must
        // not change across re-preparations.
        if reprepared.get_id() != previous_prepared.get_id() {
            return Err(RequestAttemptError::RepreparedIdChanged {
                statement: reprepare_statement.contents,
                expected_id: previous_prepared.get_id().to_vec(),
                reprepared_id: reprepared.get_id().to_vec(),
            });
        }

        Ok(())
    }

    /// Executes a statement with default options, for the driver's own
    /// control queries.
    pub(crate) async fn query_unpaged(
        &self,
        statement: impl Into<Statement>,
    ) -> Result<QueryResult, RequestAttemptError> {
        let statement: Statement = statement.into();
        let consistency = statement
            .config
            .determine_consistency(self.config.default_consistency);
        let serial_consistency = statement.config.serial_consistency.flatten();

        self.query_raw_with_consistency(
            &statement,
            SerializedValues::EMPTY,
            consistency,
            serial_consistency,
            None,
            PagingState::start(),
        )
        .await
        .and_then(|response| {
            response
                .into_non_error_query_response()?
                .into_query_result()
        })
    }

    pub(crate) async fn use_keyspace(
        &self,
        keyspace_name: &VerifiedKeyspaceName,
    ) -> Result<(), crate::errors::UseKeyspaceError> {
        // A keyspace name cannot be a bound value; the USE statement is
        // assembled textually from the (already validated) name.
        let statement: Statement = match keyspace_name.is_case_sensitive {
            true => format!("USE \"{}\"", keyspace_name.as_str()).into(),
            false => format!("USE {}", keyspace_name.as_str()).into(),
        };

        let consistency = self.config.default_consistency;
        let query_response = self
            .query_raw_with_consistency(
                &statement,
                SerializedValues::EMPTY,
                consistency,
                None,
                None,
                PagingState::start(),
            )
            .await
            .map_err(crate::errors::UseKeyspaceError::RequestError)?;

        match query_response.response {
            Response::Result(result::Result::SetKeyspace(set_keyspace)) => {
                if !set_keyspace
                    .keyspace_name
                    .eq_ignore_ascii_case(keyspace_name.as_str())
                {
                    return Err(crate::errors::UseKeyspaceError::KeyspaceNameMismatch {
                        expected_keyspace_name_lowercase: keyspace_name.as_str().to_lowercase(),
                        result_keyspace_name_lowercase: set_keyspace.keyspace_name.to_lowercase(),
                    });
                }
                Ok(())
            }
            Response::Error(err) => Err(crate::errors::UseKeyspaceError::RequestError(
                RequestAttemptError::DbError(err.error, err.reason),
            )),
            other => Err(crate::errors::UseKeyspaceError::RequestError(
                RequestAttemptError::UnexpectedResponse(other.to_response_kind()),
            )),
        }
    }

    pub(crate) async fn fetch_schema_version(&self) -> Result<Uuid, RequestAttemptError> {
        let result = self.query_unpaged(LOCAL_VERSION).await?;
        let row = result.single_row().map_err(|_| {
            RequestAttemptError::UnexpectedResponse(
                corvus_cql::frame::response::CqlResponseKind::Result,
            )
        })?;
        row.get::<Uuid>(0).map_err(|_| {
            RequestAttemptError::UnexpectedResponse(
                corvus_cql::frame::response::CqlResponseKind::Result,
            )
        })
    }

    /* The background router. */

    #[allow(clippy::too_many_arguments)]
    async fn router(
        config: ConnectionConfig,
        stream: Box<dyn SessionStream>,
        version: ProtocolVersion,
        segment_mode: Arc<AtomicBool>,
        used_stream_ids: Arc<AtomicUsize>,
        receiver: mpsc::Receiver<Task>,
        error_sender: oneshot::Sender<ConnectionError>,
        orphan_notification_receiver: mpsc::UnboundedReceiver<RequestId>,
        router_handle: Arc<RouterHandle>,
    ) {
        let (read_half, write_half) = split(stream);

        // The handler map is shared between the reader and writer halves,
        // which run on the same task; the mutex is never contended and never
        // held across an await point.
        let handler_map = StdMutex::new(ResponseHandlerMap::new(
            version.stream_id_pool_size(),
            used_stream_ids,
        ));

        let r = Self::reader(
            BufReader::with_capacity(8192, read_half),
            &handler_map,
            &segment_mode,
            config.event_sender,
            config.compression,
            config.max_frame_length,
            version,
        );
        let w = Self::writer(
            BufWriter::with_capacity(8192, write_half),
            &handler_map,
            &segment_mode,
            receiver,
        );
        let o = Self::orphaner(&handler_map, orphan_notification_receiver);
        let k = Self::keepaliver(
            router_handle,
            config.keepalive_interval,
            config.keepalive_timeout,
            version,
        );

        let result = futures::try_join!(r, w, o, k);

        let error: BrokenConnectionError = match result {
            Ok(_) => return, // The connection was dropped; nothing to clean up.
            Err(err) => err,
        };

        // Fail all pending requests with a (retriable) broken-connection error.
        let response_handlers: HashMap<i16, ResponseHandler> =
            handler_map.into_inner().unwrap().into_handlers();
        for (_, handler) in response_handlers {
            // Send errors mean the requester is gone; that is fine.
            let _ = handler.response_sender.send(Err(error.clone().into()));
        }

        // Notify the owner (pool or control layer) about the death.
        let _ = error_sender.send(error.into());
    }

    async fn reader(
        mut read_half: impl AsyncRead + Unpin,
        handler_map: &StdMutex<ResponseHandlerMap>,
        segment_mode: &AtomicBool,
        event_sender: Option<mpsc::Sender<Event>>,
        compression: Option<Compression>,
        max_frame_length: usize,
        version: ProtocolVersion,
    ) -> Result<(), BrokenConnectionError> {
        // Frames extracted from segments but not yet returned (v5 only).
        let mut segment_buffer: Vec<u8> = Vec::new();

        loop {
            let (params, opcode, body) = Self::read_frame(
                &mut read_half,
                segment_mode,
                &mut segment_buffer,
                max_frame_length,
            )
            .await
            .map_err(BrokenConnectionErrorKind::FrameError)?;
            let response = TaskResponse {
                params,
                opcode,
                body,
            };

            match params.stream.cmp(&-1) {
                CmpOrdering::Less => {
                    // Negative stream ids are reserved for server-generated
                    // frames; only -1 is in use today, so ignore the rest.
                    continue;
                }
                CmpOrdering::Equal => {
                    if let Some(event_sender) = event_sender.as_ref() {
                        Self::handle_event(response, version, compression, event_sender).await?;
                    }
                    continue;
                }
                _ => {}
            }

            let handler_lookup_res = {
                // Never contended, see `router`.
                let mut handler_map_guard = handler_map.try_lock().unwrap();
                handler_map_guard.lookup(params.stream)
            };

            match handler_lookup_res {
                HandlerLookupResult::Handler(handler) => {
                    // A failed send means the requester gave up; ignore.
                    let _ = handler.response_sender.send(Ok(response));
                }
                HandlerLookupResult::Missing => {
                    // An unsolicited frame indicates a server bug or stream
                    // corruption; the connection cannot be trusted anymore.
                    debug!("Received response with unexpected stream id {}", params.stream);
                    return Err(
                        BrokenConnectionErrorKind::UnexpectedStreamId(params.stream).into()
                    );
                }
                HandlerLookupResult::Orphaned => {
                    // The request owning this stream id was abandoned; the
                    // response is dropped and the id becomes reusable.
                }
            }
        }
    }

    async fn read_frame(
        read_half: &mut (impl AsyncRead + Unpin),
        segment_mode: &AtomicBool,
        segment_buffer: &mut Vec<u8>,
        max_frame_length: usize,
    ) -> Result<(FrameParams, ResponseOpcode, Bytes), FrameError> {
        if !segment_mode.load(Ordering::Relaxed) {
            return frame::read_response_frame(read_half, max_frame_length).await;
        }

        // v5: frames are enveloped in checksummed segments, one or more
        // frames per segment, large frames sliced over several segments.
        loop {
            if segment_buffer.len() >= 9 {
                let body_len =
                    u32::from_be_bytes([segment_buffer[5], segment_buffer[6], segment_buffer[7], segment_buffer[8]])
                        as usize;
                if body_len > max_frame_length {
                    return Err(FrameError::FrameTooLarge {
                        length: body_len,
                        limit: max_frame_length,
                    });
                }
                if segment_buffer.len() >= 9 + body_len {
                    let frame_bytes: Vec<u8> = segment_buffer.drain(..9 + body_len).collect();
                    return frame::read_response_frame(&mut &frame_bytes[..], max_frame_length)
                        .await;
                }
            }
            let segment = Segment::read(read_half).await?;
            segment_buffer.extend_from_slice(&segment.payload);
        }
    }

    fn alloc_stream_id(
        handler_map: &StdMutex<ResponseHandlerMap>,
        response_handler: ResponseHandler,
    ) -> Option<i16> {
        // Never contended, see `router`.
        let mut handler_map_guard = handler_map.try_lock().unwrap();
        match handler_map_guard.allocate(response_handler) {
            Ok(stream_id) => Some(stream_id),
            Err(response_handler) => {
                error!("Could not allocate stream id");
                let _ = response_handler
                    .response_sender
                    .send(Err(InternalRequestError::UnableToAllocStreamId));
                None
            }
        }
    }

    async fn writer(
        mut write_half: impl AsyncWrite + Unpin,
        handler_map: &StdMutex<ResponseHandlerMap>,
        segment_mode: &AtomicBool,
        mut task_receiver: mpsc::Receiver<Task>,
    ) -> Result<(), BrokenConnectionError> {
        // When the Connection object is dropped, the sender half of the
        // channel closes, this loop ends and the router stops.
        while let Some(mut task) = task_receiver.recv().await {
            let mut num_requests = 0;
            while let Some(stream_id) = Self::alloc_stream_id(handler_map, task.response_handler) {
                let mut req = task.serialized_request;
                req.set_stream(stream_id);
                num_requests += 1;

                if segment_mode.load(Ordering::Relaxed) {
                    for segment in segment_frame(req.get_data()) {
                        let mut wire = Vec::with_capacity(segment.payload.len() + 16);
                        segment
                            .serialize(&mut wire)
                            .map_err(BrokenConnectionErrorKind::FrameError)?;
                        write_half
                            .write_all(&wire)
                            .await
                            .map_err(BrokenConnectionErrorKind::WriteError)?;
                    }
                } else {
                    write_half
                        .write_all(req.get_data())
                        .await
                        .map_err(BrokenConnectionErrorKind::WriteError)?;
                }

                // Coalesce writes: drain whatever queued while serializing,
                // yielding once to let producers catch up.
                task = match task_receiver.try_recv() {
                    Ok(t) => t,
                    Err(_) => {
                        tokio::task::yield_now().await;
                        match task_receiver.try_recv() {
                            Ok(t) => t,
                            Err(_) => break,
                        }
                    }
                }
            }
            trace!("Sending {} requests", num_requests);
            write_half
                .flush()
                .await
                .map_err(BrokenConnectionErrorKind::WriteError)?;
        }

        Ok(())
    }

    // Receives orphan notifications and frees the handlers of abandoned
    // requests. A connection holding too many old orphaned stream ids is
    // broken on purpose, as the server is evidently not answering them.
    async fn orphaner(
        handler_map: &StdMutex<ResponseHandlerMap>,
        mut orphan_receiver: mpsc::UnboundedReceiver<RequestId>,
    ) -> Result<(), BrokenConnectionError> {
        let mut interval = tokio::time::interval(OLD_AGE_ORPHAN_THRESHOLD);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    // Never contended, see `router`.
                    let handler_map_guard = handler_map.try_lock().unwrap();
                    let old_orphan_count = handler_map_guard.old_orphans_count();
                    if old_orphan_count > OLD_ORPHAN_COUNT_THRESHOLD {
                        warn!(
                            "Too many old orphaned stream ids: {}",
                            old_orphan_count,
                        );
                        return Err(BrokenConnectionErrorKind::TooManyOrphanedStreamIds(
                            old_orphan_count as u16
                        ).into());
                    }
                }
                Some(request_id) = orphan_receiver.recv() => {
                    trace!(
                        "Trying to orphan stream id associated with request_id = {}",
                        request_id,
                    );
                    let mut handler_map_guard = handler_map.try_lock().unwrap();
                    handler_map_guard.orphan(request_id);
                }
                else => break,
            }
        }

        Ok(())
    }

    // Sends OPTIONS on an idle connection so that both sides can tell a
    // quiet connection from a dead one.
    async fn keepaliver(
        router_handle: Arc<RouterHandle>,
        keepalive_interval: Option<Duration>,
        keepalive_timeout: Option<Duration>,
        version: ProtocolVersion,
    ) -> Result<(), BrokenConnectionError> {
        async fn issue_keepalive_request(
            router_handle: &RouterHandle,
            version: ProtocolVersion,
        ) -> Result<(), BrokenConnectionError> {
            let serialized = SerializedRequest::make(&request::Options, version, None, false)
                .map_err(BrokenConnectionErrorKind::FrameError)?;
            router_handle
                .send_request(serialized)
                .await
                .map(|_| ())
                .map_err(|req_err| match req_err {
                    InternalRequestError::BrokenConnection(e) => {
                        BrokenConnectionErrorKind::KeepaliveQueryError(Box::new(e)).into()
                    }
                    _ => BrokenConnectionErrorKind::ChannelError.into(),
                })
        }

        let Some(keepalive_interval) = keepalive_interval else {
            return Ok(());
        };

        let mut interval = tokio::time::interval(keepalive_interval);
        interval.tick().await; // Consume the immediate first tick.
        // Burst catch-up would hammer the connection after a stall.
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            let keepalive_request = issue_keepalive_request(&router_handle, version);
            let result = if let Some(timeout) = keepalive_timeout {
                match tokio::time::timeout(timeout, keepalive_request).await {
                    Ok(res) => res,
                    Err(_) => {
                        warn!("Timed out while waiting for response to a keepalive request");
                        return Err(BrokenConnectionErrorKind::KeepaliveTimeout.into());
                    }
                }
            } else {
                keepalive_request.await
            };
            if let Err(err) = result {
                warn!("Failed to execute keepalive request: {}", err);
                return Err(err);
            }

            trace!("Keepalive request successful");
        }
    }

    async fn handle_event(
        task_response: TaskResponse,
        version: ProtocolVersion,
        compression: Option<Compression>,
        event_sender: &mpsc::Sender<Event>,
    ) -> Result<(), BrokenConnectionError> {
        let features = ProtocolFeatures::default();
        let event = match Self::parse_response(task_response, version, compression, &features) {
            Ok(r) => match r.response {
                Response::Event(event) => event,
                _ => {
                    error!("Expected to receive Event response, got {:?}", r.response);
                    return Err(BrokenConnectionErrorKind::EventHandlingError(
                        corvus_cql::frame::frame_errors::ResponseParseError::UnknownEventType(
                            format!("{}", r.response.to_response_kind()),
                        ),
                    )
                    .into());
                }
            },
            Err(InternalRequestError::ResponseParse(e)) => {
                return Err(BrokenConnectionErrorKind::EventHandlingError(e).into())
            }
            Err(InternalRequestError::Frame(e)) => {
                return Err(BrokenConnectionErrorKind::FrameError(e).into())
            }
            Err(_) => return Err(BrokenConnectionErrorKind::ChannelError.into()),
        };

        event_sender
            .send(event)
            .await
            .map_err(|_| BrokenConnectionErrorKind::ChannelError.into())
    }
}

async fn connect_tcp(connect_address: SocketAddr) -> Result<TcpStream, std::io::Error> {
    let socket = match connect_address {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.connect(connect_address).await
}

struct OrphanageTracker {
    orphans: HashMap<i16, Instant>,
    by_orphaning_times: BTreeSet<(Instant, i16)>,
}

impl OrphanageTracker {
    fn new() -> Self {
        Self {
            orphans: HashMap::new(),
            by_orphaning_times: BTreeSet::new(),
        }
    }

    fn insert(&mut self, stream_id: i16) {
        let now = Instant::now();
        self.orphans.insert(stream_id, now);
        self.by_orphaning_times.insert((now, stream_id));
    }

    fn remove(&mut self, stream_id: i16) {
        if let Some(time) = self.orphans.remove(&stream_id) {
            self.by_orphaning_times.remove(&(time, stream_id));
        }
    }

    fn contains(&self, stream_id: i16) -> bool {
        self.orphans.contains_key(&stream_id)
    }

    fn orphans_older_than(&self, age: Duration) -> usize {
        let minimal_age = Instant::now() - age;
        // Linear in the number of OLD orphans only; a healthy connection
        // computes this in O(1).
        self.by_orphaning_times
            .range(..(minimal_age, i16::MAX))
            .count()
    }
}

struct ResponseHandlerMap {
    stream_set: StreamIdSet,
    handlers: HashMap<i16, ResponseHandler>,
    request_to_stream: HashMap<RequestId, i16>,
    orphanage_tracker: OrphanageTracker,
    used_stream_ids: Arc<AtomicUsize>,
}

enum HandlerLookupResult {
    Orphaned,
    Handler(ResponseHandler),
    Missing,
}

impl ResponseHandlerMap {
    fn new(pool_size: usize, used_stream_ids: Arc<AtomicUsize>) -> Self {
        Self {
            stream_set: StreamIdSet::new(pool_size),
            handlers: HashMap::new(),
            request_to_stream: HashMap::new(),
            orphanage_tracker: OrphanageTracker::new(),
            used_stream_ids,
        }
    }

    fn allocate(&mut self, response_handler: ResponseHandler) -> Result<i16, ResponseHandler> {
        if let Some(stream_id) = self.stream_set.allocate() {
            self.request_to_stream
                .insert(response_handler.request_id, stream_id);
            let prev_handler = self.handlers.insert(stream_id, response_handler);
            assert!(prev_handler.is_none());
            self.used_stream_ids.fetch_add(1, Ordering::Relaxed);
            Ok(stream_id)
        } else {
            Err(response_handler)
        }
    }

    // Frees the handler of an abandoned request. The stream id itself stays
    // claimed until the server responds (or the connection dies), because
    // reusing it earlier would pair the late response with a new request.
    fn orphan(&mut self, request_id: RequestId) {
        if let Some(stream_id) = self.request_to_stream.get(&request_id) {
            debug!(
                "Orphaning stream_id = {} associated with request_id = {}",
                stream_id, request_id
            );
            self.orphanage_tracker.insert(*stream_id);
            self.handlers.remove(stream_id);
            self.request_to_stream.remove(&request_id);
        }
    }

    fn old_orphans_count(&self) -> usize {
        self.orphanage_tracker
            .orphans_older_than(OLD_AGE_ORPHAN_THRESHOLD)
    }

    fn lookup(&mut self, stream_id: i16) -> HandlerLookupResult {
        if self.stream_set.free(stream_id) {
            self.used_stream_ids.fetch_sub(1, Ordering::Relaxed);
        }

        if self.orphanage_tracker.contains(stream_id) {
            self.orphanage_tracker.remove(stream_id);
            // This stream id had been orphaned; its handler is long gone,
            // which is a valid state (unlike a missing handler).
            return HandlerLookupResult::Orphaned;
        }

        if let Some(handler) = self.handlers.remove(&stream_id) {
            // Remove the request-to-stream mapping, so that a late orphan
            // notification cannot orphan the now-free stream id.
            self.request_to_stream.remove(&handler.request_id);
            HandlerLookupResult::Handler(handler)
        } else {
            HandlerLookupResult::Missing
        }
    }

    // Used after the connection breaks, to answer every pending request
    // with an error.
    fn into_handlers(self) -> HashMap<i16, ResponseHandler> {
        self.handlers
    }
}

// A bitmap of claimed stream ids. Capacity depends on the protocol version:
// 128 ids on v3/v4, the full positive i16 range on v5.
struct StreamIdSet {
    used_bitmap: Box<[u64]>,
    pool_size: usize,
}

impl StreamIdSet {
    fn new(pool_size: usize) -> Self {
        let words = pool_size.div_ceil(64);
        Self {
            used_bitmap: vec![0; words].into_boxed_slice(),
            pool_size,
        }
    }

    fn allocate(&mut self) -> Option<i16> {
        for (block_id, block) in self.used_bitmap.iter_mut().enumerate() {
            if *block != !0 {
                let off = block.trailing_ones() as usize;
                let stream_id = block_id * 64 + off;
                if stream_id >= self.pool_size {
                    return None;
                }
                *block |= 1u64 << off;
                return Some(stream_id as i16);
            }
        }
        None
    }

    /// Returns whether the id was actually claimed.
    fn free(&mut self, stream_id: i16) -> bool {
        let block_id = stream_id as usize / 64;
        let off = stream_id as usize % 64;
        let Some(block) = self.used_bitmap.get_mut(block_id) else {
            return false;
        };
        let was_set = *block & (1 << off) != 0;
        *block &= !(1 << off);
        was_set
    }
}

/// A keyspace name verified to be usable in a USE statement.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct VerifiedKeyspaceName {
    name: Arc<String>,
    pub(crate) is_case_sensitive: bool,
}

impl VerifiedKeyspaceName {
    pub(crate) fn new(
        keyspace_name: String,
        case_sensitive: bool,
    ) -> Result<Self, BadKeyspaceName> {
        Self::verify_keyspace_name_is_valid(&keyspace_name)?;
        Ok(VerifiedKeyspaceName {
            name: Arc::new(keyspace_name),
            is_case_sensitive: case_sensitive,
        })
    }

    pub(crate) fn as_str(&self) -> &str {
        self.name.as_str()
    }

    // Keyspace names are up to 48 alphanumeric-or-underscore characters.
    fn verify_keyspace_name_is_valid(keyspace_name: &str) -> Result<(), BadKeyspaceName> {
        if keyspace_name.is_empty() {
            return Err(BadKeyspaceName::Empty);
        }

        let keyspace_name_len = keyspace_name.chars().count();
        if keyspace_name_len > 48 {
            return Err(BadKeyspaceName::TooLong(
                keyspace_name.to_string(),
                keyspace_name_len,
            ));
        }

        for character in keyspace_name.chars() {
            if !character.is_ascii_alphanumeric() && character != '_' {
                return Err(BadKeyspaceName::IllegalCharacter(
                    keyspace_name.to_string(),
                    character,
                ));
            }
        }

        Ok(())
    }
}

async fn maybe_translated_addr(
    endpoint: &UntranslatedEndpoint,
    address_translator: Option<&dyn AddressTranslator>,
) -> Result<SocketAddr, TranslationError> {
    match endpoint {
        UntranslatedEndpoint::ContactPoint(addr) => Ok(addr.address),
        UntranslatedEndpoint::Peer(peer) => match peer.address {
            crate::cluster::node::NodeAddr::Translatable(addr) => {
                if let Some(translator) = address_translator {
                    let res = translator
                        .translate_address(&UntranslatedPeer {
                            host_id: peer.host_id,
                            untranslated_address: addr,
                            datacenter: peer.datacenter.as_deref(),
                            rack: peer.rack.as_deref(),
                        })
                        .await;
                    if let Err(ref err) = res {
                        error!("Address translation failed for addr {}: {}", addr, err);
                    }
                    res
                } else {
                    Ok(addr)
                }
            }
            // The control connection's own address is already routable.
            crate::cluster::node::NodeAddr::Untranslatable(addr) => Ok(addr),
        },
    }
}

/// Opens a connection and makes it Ready:
/// translates the address, connects the transport, performs the
/// OPTIONS/SUPPORTED exchange, negotiates the protocol version (downgrading
/// on a STARTUP-phase protocol error), sends STARTUP, drives authentication
/// if challenged, and REGISTERs for events on control connections.
pub(crate) async fn open_connection(
    endpoint: &UntranslatedEndpoint,
    config: &ConnectionConfig,
) -> Result<(Connection, ErrorReceiver), ConnectionError> {
    let addr = maybe_translated_addr(endpoint, config.address_translator.as_deref()).await?;

    let mut version = config.protocol_version.unwrap_or(ProtocolVersion::LATEST);
    let version_is_forced = config.protocol_version.is_some();

    loop {
        match open_connection_to_version(addr, version, config).await {
            Err(ConnectionError::ConnectionSetupRequestError(err))
                if !version_is_forced && is_protocol_version_rejection(&err) =>
            {
                match version.downgrade() {
                    Some(downgraded) => {
                        debug!(
                            "[{}] Server rejected protocol {}; retrying with {}",
                            addr, version, downgraded
                        );
                        version = downgraded;
                        continue;
                    }
                    None => {
                        return Err(ConnectionError::ExhaustedProtocolVersions {
                            rejected: version,
                        })
                    }
                }
            }
            other => return other,
        }
    }
}

fn is_protocol_version_rejection(err: &ConnectionSetupRequestError) -> bool {
    matches!(
        err.kind,
        ConnectionSetupRequestErrorKind::DbError(DbError::ProtocolError(_), _)
    )
}

async fn open_connection_to_version(
    addr: SocketAddr,
    version: ProtocolVersion,
    config: &ConnectionConfig,
) -> Result<(Connection, ErrorReceiver), ConnectionError> {
    /* Open the transport and spawn the router. */
    let (mut connection, error_receiver) =
        Connection::new(addr, version, config.clone()).await?;

    /* Ask which options the server supports. */
    let mut supported = connection.get_options().await?;

    let supported_compression = supported
        .options
        .remove(request::startup::COMPRESSION)
        .unwrap_or_default();

    // Parse vendor protocol extensions advertised in SUPPORTED.
    let protocol_features = ProtocolFeatures::parse_from_supported(&supported.options);
    connection.set_features(ConnectionFeatures {
        protocol_version: version,
        protocol_features,
    });

    /* Assemble STARTUP options. */
    let mut options = HashMap::new();
    protocol_features.add_startup_options(&mut options);
    options.insert(
        Cow::Borrowed(request::startup::CQL_VERSION),
        Cow::Borrowed(request::startup::DEFAULT_CQL_PROTOCOL_VERSION),
    );
    config.identity.add_startup_options(&mut options);

    if let Some(compression) = &config.compression {
        let compression_str = compression.as_str();
        if supported_compression.iter().any(|c| c == compression_str) {
            options.insert(
                Cow::Borrowed(request::startup::COMPRESSION),
                Cow::Borrowed(compression_str),
            );
        } else {
            // Proceed uncompressed rather than fail the connection.
            warn!(
                "Requested compression <{}> is not supported by the cluster. Falling back to no compression",
                compression_str
            );
            connection.config.compression = None;
        }
    }

    /* STARTUP and authentication. */
    let startup_result = connection.startup(options).await?;

    // From this point on, a v5 connection speaks the segment layer.
    if version.uses_segment_layer() {
        connection.segment_mode.store(true, Ordering::Relaxed);
    }

    match startup_result {
        NonErrorStartupResponse::Ready => {}
        NonErrorStartupResponse::Authenticate(authenticate) => {
            connection.perform_authenticate(&authenticate).await?;
        }
    }

    /* Control connections REGISTER for all event types. */
    if connection.config.event_sender.is_some() {
        let all_event_types = vec![
            EventType::TopologyChange,
            EventType::StatusChange,
            EventType::SchemaChange,
        ];
        connection.register(all_event_types).await?;
    }

    Ok((connection, error_receiver))
}
