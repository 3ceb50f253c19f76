//! The driver's error taxonomy.
//!
//! Errors are layered the same way requests flow through the runtime:
//! frame-level and transport-level failures ([`BrokenConnectionError`],
//! [`ConnectionError`]) are wrapped into per-attempt failures
//! ([`RequestAttemptError`]), which the retry and speculative machinery
//! either recovers from or surfaces as an [`ExecutionError`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

pub use corvus_cql::errors::{DbError, OperationType, WriteType};
use corvus_cql::frame::frame_errors::{FrameError, ResponseParseError};
use corvus_cql::frame::response::CqlResponseKind;
use corvus_cql::serialize::SerializeValuesError;

/// An error surfaced to the caller of a request-executing operation.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ExecutionError {
    /// The statement or its bound values were rejected before any network
    /// attempt was made.
    #[error(transparent)]
    BadQuery(#[from] BadQuery),

    /// Every host in the query plan was tried and failed.
    #[error(transparent)]
    NoHostAvailable(#[from] NoHostAvailableError),

    /// The last (or only) attempt failed and the retry policy decided not
    /// to retry.
    #[error(transparent)]
    LastAttemptError(#[from] RequestAttemptError),

    /// The client-side request deadline elapsed before any response arrived.
    #[error("Request exceeded its deadline of {0:?}")]
    RequestTimeout(Duration),

    /// The cluster is shutting down; pending and new requests are refused.
    #[error("Cluster is closing")]
    ClusterClosing,

    /// Following a USE-keyspace response or schema agreement failed.
    #[error(transparent)]
    UseKeyspaceError(#[from] UseKeyspaceError),

    /// Metadata could not be refreshed when the operation required it.
    #[error(transparent)]
    MetadataError(#[from] MetadataError),
}

/// Terminal failure of a request: every host in the plan was exhausted.
/// Carries the last error observed per host, keyed by endpoint.
#[derive(Error, Debug, Clone)]
pub struct NoHostAvailableError {
    pub errors: Vec<(SocketAddr, RequestAttemptError)>,
}

impl std::fmt::Display for NoHostAvailableError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "No host could serve the request; attempted {} host(s)", self.errors.len())?;
        for (addr, err) in &self.errors {
            write!(f, "\n  {}: {}", addr, err)?;
        }
        Ok(())
    }
}

/// An invalid statement or bind, detected client-side.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum BadQuery {
    #[error("Serializing bound values failed: {0}")]
    SerializeValuesError(#[from] SerializeValuesError),

    #[error("Number of bound values ({got}) does not match the number of statement variables ({expected})")]
    ValueCountMismatch { got: usize, expected: usize },

    #[error("Failed to derive the routing key: {0}")]
    PartitionKeyDerivation(#[from] crate::statement::prepared::PartitionKeyError),

    #[error(transparent)]
    BadKeyspaceName(#[from] BadKeyspaceName),
}

/// A keyspace name that cannot be used in a USE request.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum BadKeyspaceName {
    #[error("Keyspace name is empty")]
    Empty,
    #[error("Keyspace name {0} has length {1}, which exceeds the limit of 48")]
    TooLong(String, usize),
    #[error("Keyspace name {0} contains illegal character {1:?}")]
    IllegalCharacter(String, char),
}

/// An error of a single attempt on a single connection. The retry policy
/// classifies these into retriable and terminal failures.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum RequestAttemptError {
    /// The database responded with an ERROR frame.
    #[error("Database returned an error: {0}, Error message: {1}")]
    DbError(DbError, String),

    /// Failed to serialize the request frame.
    #[error("Failed to serialize the request: {0}")]
    SerializationError(#[from] FrameError),

    /// Failed to deserialize the response frame.
    #[error("Failed to deserialize the response: {0}")]
    ResponseParseError(#[from] ResponseParseError),

    /// Received a response kind that makes no sense for the request.
    #[error("Unexpected response {0}, expected RESULT or ERROR")]
    UnexpectedResponse(CqlResponseKind),

    /// The connection died while the request was in flight. Retriable.
    #[error(transparent)]
    BrokenConnectionError(#[from] BrokenConnectionError),

    /// Every stream id on the connection was taken. The executor treats the
    /// host as busy and advances to the next one.
    #[error("Unable to allocate a stream id, connection is at capacity")]
    UnableToAllocStreamId,

    /// No connection could be borrowed from the host's pool; nothing was
    /// sent to this host.
    #[error(transparent)]
    ConnectionPoolError(#[from] ConnectionPoolError),

    /// The attempt did not complete within the per-attempt deadline. Its
    /// stream id stays orphaned until the server answers or the connection
    /// closes.
    #[error("The attempt did not complete within its deadline of {0:?}")]
    AttemptTimeout(Duration),

    /// Re-preparing after UNPREPARED produced a different statement id.
    #[error("Re-prepared statement changed its id (expected {expected_id:?}, got {reprepared_id:?})")]
    RepreparedIdChanged {
        statement: String,
        expected_id: Vec<u8>,
        reprepared_id: Vec<u8>,
    },

    /// UNPREPARED referred to a statement id absent from the batch.
    #[error("UNPREPARED error refers to a statement id missing from the executed batch")]
    RepreparedIdMissingInBatch,
}

impl RequestAttemptError {
    /// Whether this error proves nothing about other nodes, which makes a
    /// speculative attempt on a different host worthwhile.
    pub(crate) fn can_speculative_retry(&self) -> bool {
        match self {
            RequestAttemptError::BrokenConnectionError(_)
            | RequestAttemptError::UnableToAllocStreamId
            | RequestAttemptError::ConnectionPoolError(_)
            | RequestAttemptError::AttemptTimeout(_) => true,
            RequestAttemptError::DbError(db_error, _) => db_error.can_speculative_retry(),
            _ => false,
        }
    }
}

impl From<corvus_cql::frame::response::Error> for RequestAttemptError {
    fn from(error: corvus_cql::frame::response::Error) -> Self {
        RequestAttemptError::DbError(error.error, error.reason)
    }
}

impl From<InternalRequestError> for RequestAttemptError {
    fn from(error: InternalRequestError) -> Self {
        match error {
            InternalRequestError::Frame(e) => RequestAttemptError::SerializationError(e),
            InternalRequestError::ResponseParse(e) => RequestAttemptError::ResponseParseError(e),
            InternalRequestError::BrokenConnection(e) => {
                RequestAttemptError::BrokenConnectionError(e)
            }
            InternalRequestError::UnableToAllocStreamId => {
                RequestAttemptError::UnableToAllocStreamId
            }
        }
    }
}

/// An error of a request issued on a connection, before mapping to the
/// user-visible taxonomy.
#[derive(Error, Debug)]
pub(crate) enum InternalRequestError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    ResponseParse(#[from] ResponseParseError),
    #[error(transparent)]
    BrokenConnection(#[from] BrokenConnectionError),
    #[error("Unable to allocate stream id")]
    UnableToAllocStreamId,
}

/// A previously healthy connection stopped working.
#[derive(Error, Debug, Clone)]
#[error(transparent)]
pub struct BrokenConnectionError(Arc<BrokenConnectionErrorKind>);

impl BrokenConnectionError {
    pub fn kind(&self) -> &BrokenConnectionErrorKind {
        &self.0
    }
}

/// The reason a connection broke.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BrokenConnectionErrorKind {
    #[error("Timed out while waiting for a response to a heartbeat request")]
    KeepaliveTimeout,

    #[error("Heartbeat request failed: {0}")]
    KeepaliveQueryError(#[from] Box<BrokenConnectionError>),

    #[error("Failed to deserialize a frame: {0}")]
    FrameError(#[from] FrameError),

    #[error("Failed to handle a server event: {0}")]
    EventHandlingError(#[from] ResponseParseError),

    #[error("Received a frame with unexpected stream id {0}")]
    UnexpectedStreamId(i16),

    #[error("Failed to write a frame: {0}")]
    WriteError(std::io::Error),

    #[error("Too many orphaned stream ids: {0}")]
    TooManyOrphanedStreamIds(u16),

    #[error("Internal driver channel was unexpectedly closed")]
    ChannelError,
}

impl From<BrokenConnectionErrorKind> for BrokenConnectionError {
    fn from(kind: BrokenConnectionErrorKind) -> Self {
        BrokenConnectionError(Arc::new(kind))
    }
}

/// An error while opening and setting up a new connection.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionError {
    #[error("Connect timeout elapsed")]
    ConnectTimeout,

    #[error("IO error: {0}")]
    IoError(Arc<std::io::Error>),

    #[error("Address translation failed: {0}")]
    TranslationError(#[from] TranslationError),

    #[error(transparent)]
    ConnectionSetupRequestError(#[from] ConnectionSetupRequestError),

    #[error(transparent)]
    BrokenConnection(#[from] BrokenConnectionError),

    #[error("No protocol version left to downgrade to after the server rejected {rejected}")]
    ExhaustedProtocolVersions { rejected: corvus_cql::ProtocolVersion },
}

impl From<std::io::Error> for ConnectionError {
    fn from(value: std::io::Error) -> Self {
        ConnectionError::IoError(Arc::new(value))
    }
}

impl ConnectionError {
    /// True for local socket errors that suggest trying a different source
    /// port rather than giving up on the host.
    pub(crate) fn is_address_unavailable_for_use(&self) -> bool {
        if let ConnectionError::IoError(io_error) = self {
            matches!(
                io_error.kind(),
                std::io::ErrorKind::AddrInUse | std::io::ErrorKind::AddrNotAvailable
            )
        } else {
            false
        }
    }
}

/// A failure of one of the fixed setup-sequence requests
/// (OPTIONS → STARTUP → AUTH* → REGISTER). All of these make the
/// connection unusable.
#[derive(Error, Debug, Clone)]
#[error("Failed to perform a {request_kind} request during connection setup: {kind}")]
pub struct ConnectionSetupRequestError {
    pub request_kind: &'static str,
    pub kind: ConnectionSetupRequestErrorKind,
}

#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionSetupRequestErrorKind {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    ResponseParse(#[from] ResponseParseError),

    #[error("Database returned an error: {0}, Error message: {1}")]
    DbError(DbError, String),

    #[error("Received unexpected response: {0}")]
    UnexpectedResponse(CqlResponseKind),

    #[error(transparent)]
    BrokenConnection(#[from] BrokenConnectionError),

    #[error("Unable to allocate stream id")]
    UnableToAllocStreamId,

    #[error("The server requested authentication, but no authenticator was configured")]
    MissingAuthentication,

    #[error("Starting the authentication session failed: {0}")]
    StartAuthSessionError(String),

    #[error("Evaluating an authentication challenge failed: {0}")]
    AuthChallengeEvaluationError(String),

    #[error("Finishing the authentication exchange failed: {0}")]
    AuthFinishError(String),
}

impl ConnectionSetupRequestError {
    pub(crate) fn new(request_kind: &'static str, kind: ConnectionSetupRequestErrorKind) -> Self {
        ConnectionSetupRequestError { request_kind, kind }
    }
}

impl From<InternalRequestError> for ConnectionSetupRequestErrorKind {
    fn from(error: InternalRequestError) -> Self {
        match error {
            InternalRequestError::Frame(e) => e.into(),
            InternalRequestError::ResponseParse(e) => e.into(),
            InternalRequestError::BrokenConnection(e) => e.into(),
            InternalRequestError::UnableToAllocStreamId => {
                ConnectionSetupRequestErrorKind::UnableToAllocStreamId
            }
        }
    }
}

/// A raw endpoint could not be mapped to a routable one.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum TranslationError {
    #[error("No rule for address {0}")]
    NoRuleForAddress(SocketAddr),
    #[error("Translator failed: {0}")]
    TranslatorFailed(String),
}

/// Borrowing a connection from a host pool failed.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionPoolError {
    #[error("The pool is still being filled")]
    Initializing,

    #[error("The pool is broken; last connection failed with: {last_connection_error}")]
    Broken {
        last_connection_error: ConnectionError,
    },

    #[error("Host is busy: every connection has all stream ids in use")]
    HostBusy,

    #[error("The host is ignored by the load balancing policy; its pool is empty")]
    HostIgnored,

    #[error("Cluster is closing")]
    ClusterClosing,
}

/// Reading or refreshing cluster metadata failed.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum MetadataError {
    #[error(transparent)]
    ConnectionPoolError(#[from] ConnectionPoolError),

    #[error("Control request failed: {0}")]
    FetchError(#[from] RequestAttemptError),

    #[error("system.local returned no rows")]
    LocalAbsent,

    #[error("Column {column} in {table} has unexpected contents: {reason}")]
    MalformedSystemRow {
        table: &'static str,
        column: &'static str,
        reason: String,
    },

    #[error("Initial metadata fetch timed out after {0:?}")]
    Timeout(Duration),
}

/// An error during session/cluster construction.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum NewSessionError {
    #[error("Couldn't resolve any hostname: {0:?}")]
    FailedToResolveAnyHostname(Vec<String>),

    #[error("Contact points use differing ports: {0} vs {1}")]
    MixedContactPointPorts(u16, u16),

    #[error(transparent)]
    MetadataError(#[from] MetadataError),

    #[error(transparent)]
    ConnectionError(#[from] ConnectionError),

    #[error("Cluster initialization timed out after {0:?}")]
    InitTimeout(Duration),

    #[error("Cluster handle was disposed")]
    Disposed,
}

/// Setting a session-wide keyspace failed.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum UseKeyspaceError {
    #[error(transparent)]
    BadKeyspaceName(#[from] BadKeyspaceName),

    #[error(transparent)]
    RequestError(#[from] RequestAttemptError),

    #[error("Server responded with a keyspace other than the requested one: expected {expected_keyspace_name_lowercase}, got {result_keyspace_name_lowercase}")]
    KeyspaceNameMismatch {
        expected_keyspace_name_lowercase: String,
        result_keyspace_name_lowercase: String,
    },

    #[error("USE request timed out after {0:?}")]
    RequestTimeout(Duration),
}

/// Preparing a statement failed.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum PrepareError {
    #[error(transparent)]
    ConnectionPoolError(#[from] ConnectionPoolError),

    #[error("Preparation failed on every attempted connection; last error: {0}")]
    AllAttemptsFailed(RequestAttemptError),

    #[error("Cluster is closing")]
    ClusterClosing,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_host_available_lists_hosts() {
        let err = NoHostAvailableError {
            errors: vec![(
                "127.0.0.1:9042".parse().unwrap(),
                RequestAttemptError::UnableToAllocStreamId,
            )],
        };
        let text = err.to_string();
        assert!(text.contains("127.0.0.1:9042"));
        assert!(text.contains("attempted 1 host(s)"));
    }
}
