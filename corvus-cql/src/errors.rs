//! The server-side error taxonomy, as carried by ERROR response frames.

use thiserror::Error;

use crate::frame::types::Consistency;

/// An error sent by the database in an ERROR response.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DbError {
    /// Something unexpected happened server-side.
    #[error("Internal server error")]
    ServerError,

    /// The frame violated the protocol; the server gives up on the connection.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Authentication failed - bad credentials.
    #[error("Authentication failed - bad credentials")]
    AuthenticationError,

    /// Not enough replicas are alive to satisfy the required consistency.
    #[error(
        "Not enough nodes are alive to satisfy required consistency level \
        (consistency: {consistency}, required: {required}, alive: {alive})"
    )]
    Unavailable {
        consistency: Consistency,
        required: i32,
        alive: i32,
    },

    /// The coordinator is overloaded and sheds the request.
    #[error("The request cannot be processed because the coordinator node is overloaded")]
    Overloaded,

    /// The coordinator is still bootstrapping and cannot serve reads.
    #[error("The coordinator node is still bootstrapping")]
    IsBootstrapping,

    /// An error during a truncate operation.
    #[error("Error during truncate operation")]
    TruncateError,

    /// Not enough replicas responded to a read in time.
    #[error(
        "Not enough nodes responded to the read request in time to satisfy required consistency level \
        (consistency: {consistency}, received: {received}, required: {required}, data_present: {data_present})"
    )]
    ReadTimeout {
        consistency: Consistency,
        received: i32,
        required: i32,
        data_present: bool,
    },

    /// Not enough replicas responded to a write in time.
    #[error(
        "Not enough nodes responded to the write request in time to satisfy required consistency level \
        (consistency: {consistency}, received: {received}, required: {required}, write_type: {write_type})"
    )]
    WriteTimeout {
        consistency: Consistency,
        received: i32,
        required: i32,
        write_type: WriteType,
    },

    /// A non-timeout failure on replicas during a read.
    #[error(
        "A non-timeout error during a read request \
        (consistency: {consistency}, received: {received}, required: {required}, numfailures: {numfailures}, data_present: {data_present})"
    )]
    ReadFailure {
        consistency: Consistency,
        received: i32,
        required: i32,
        numfailures: i32,
        data_present: bool,
    },

    /// A non-timeout failure on replicas during a write.
    #[error(
        "A non-timeout error during a write request \
        (consistency: {consistency}, received: {received}, required: {required}, numfailures: {numfailures}, write_type: {write_type})"
    )]
    WriteFailure {
        consistency: Consistency,
        received: i32,
        required: i32,
        numfailures: i32,
        write_type: WriteType,
    },

    /// A user defined function failed during execution.
    #[error(
        "User defined function failed during execution \
        (keyspace: {keyspace}, function: {function}, arg_types: {arg_types:?})"
    )]
    FunctionFailure {
        keyspace: String,
        function: String,
        arg_types: Vec<String>,
    },

    /// The submitted statement has a syntax error.
    #[error("The submitted query has a syntax error")]
    SyntaxError,

    /// The logged user is not permitted to perform the operation.
    #[error("The logged user doesn't have the right to perform the query")]
    Unauthorized,

    /// The statement is syntactically correct but invalid.
    #[error("The query is syntactically correct but invalid")]
    Invalid,

    /// The statement is invalid because of a configuration issue.
    #[error("The query is invalid because of some configuration issue")]
    ConfigError,

    /// The created keyspace/table already exists.
    #[error(
        "Attempted to create a keyspace or a table that was already existing \
        (keyspace: {keyspace}, table: {table})"
    )]
    AlreadyExists { keyspace: String, table: String },

    /// The coordinator does not know the prepared statement id; the driver
    /// must re-prepare and retry.
    #[error("Prepared statement with id {statement_id:?} is unknown to this node")]
    Unprepared { statement_id: bytes::Bytes },

    /// The coordinator rejected the request due to per-partition rate limiting
    /// (vendor extension).
    #[error("Rate limit was exceeded for a partition affected by the request")]
    RateLimitReached { op_type: OperationType, rejected_by_coordinator: bool },

    /// An error code this driver does not recognize.
    #[error("Unrecognized error code {0:#010x}")]
    Other(i32),
}

impl DbError {
    pub fn code(&self) -> i32 {
        match self {
            DbError::ServerError => 0x0000,
            DbError::ProtocolError(_) => 0x000A,
            DbError::AuthenticationError => 0x0100,
            DbError::Unavailable { .. } => 0x1000,
            DbError::Overloaded => 0x1001,
            DbError::IsBootstrapping => 0x1002,
            DbError::TruncateError => 0x1003,
            DbError::WriteTimeout { .. } => 0x1100,
            DbError::ReadTimeout { .. } => 0x1200,
            DbError::ReadFailure { .. } => 0x1300,
            DbError::FunctionFailure { .. } => 0x1400,
            DbError::WriteFailure { .. } => 0x1500,
            DbError::RateLimitReached { .. } => 0x4321,
            DbError::SyntaxError => 0x2000,
            DbError::Unauthorized => 0x2100,
            DbError::Invalid => 0x2200,
            DbError::ConfigError => 0x2300,
            DbError::AlreadyExists { .. } => 0x2400,
            DbError::Unprepared { .. } => 0x2500,
            DbError::Other(code) => *code,
        }
    }

    /// Whether a speculative execution on another node may still succeed
    /// after this error was returned by the current one.
    pub fn can_speculative_retry(&self) -> bool {
        matches!(
            self,
            DbError::Overloaded
                | DbError::IsBootstrapping
                | DbError::TruncateError
                | DbError::ServerError
                | DbError::RateLimitReached { .. }
        )
    }
}

/// Type of the write operation reported in WriteTimeout/WriteFailure errors.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum WriteType {
    /// Non-batched, non-counter write.
    Simple,
    /// Logged batch write. If this type is received, it means the batch log
    /// has been successfully written (otherwise BatchLog is returned).
    Batch,
    /// Unlogged batch.
    UnloggedBatch,
    /// Counter write (batched or not).
    Counter,
    /// Timeout occurred during the write to the batch log when a logged batch
    /// was requested.
    BatchLog,
    /// Timeout occurred during the Compare And Set write/update.
    Cas,
    /// Write involves a VIEW update and failure to acquire local view (MV) lock.
    View,
    /// Timeout occurred when a cdc_total_space_in_mb is exceeded when doing a
    /// write to data tracked by cdc.
    Cdc,
    /// Unrecognized write type.
    Other(String),
}

impl std::fmt::Display for WriteType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl WriteType {
    pub fn as_str(&self) -> &str {
        match self {
            WriteType::Simple => "SIMPLE",
            WriteType::Batch => "BATCH",
            WriteType::UnloggedBatch => "UNLOGGED_BATCH",
            WriteType::Counter => "COUNTER",
            WriteType::BatchLog => "BATCH_LOG",
            WriteType::Cas => "CAS",
            WriteType::View => "VIEW",
            WriteType::Cdc => "CDC",
            WriteType::Other(name) => name.as_str(),
        }
    }
}

impl From<&str> for WriteType {
    fn from(write_type_str: &str) -> WriteType {
        match write_type_str {
            "SIMPLE" => WriteType::Simple,
            "BATCH" => WriteType::Batch,
            "UNLOGGED_BATCH" => WriteType::UnloggedBatch,
            "COUNTER" => WriteType::Counter,
            "BATCH_LOG" => WriteType::BatchLog,
            "CAS" => WriteType::Cas,
            "VIEW" => WriteType::View,
            "CDC" => WriteType::Cdc,
            other => WriteType::Other(other.to_owned()),
        }
    }
}

/// Kind of the operation rejected by rate limiting (vendor extension).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationType {
    Read,
    Write,
    Other(u8),
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<u8> for OperationType {
    fn from(operation_type: u8) -> OperationType {
        match operation_type {
            0 => OperationType::Read,
            1 => OperationType::Write,
            other => OperationType::Other(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_type_from_str() {
        let test_cases: [(&str, WriteType); 9] = [
            ("SIMPLE", WriteType::Simple),
            ("BATCH", WriteType::Batch),
            ("UNLOGGED_BATCH", WriteType::UnloggedBatch),
            ("COUNTER", WriteType::Counter),
            ("BATCH_LOG", WriteType::BatchLog),
            ("CAS", WriteType::Cas),
            ("VIEW", WriteType::View),
            ("CDC", WriteType::Cdc),
            ("SOMEOTHER", WriteType::Other("SOMEOTHER".to_string())),
        ];
        for (write_type_str, expected_write_type) in &test_cases {
            assert_eq!(WriteType::from(*write_type_str), *expected_write_type);
        }
    }

    #[test]
    fn dberror_displays_parameters() {
        let db_error = DbError::Unavailable {
            consistency: Consistency::Three,
            required: 3,
            alive: 2,
        };
        let displayed = format!("{}", db_error);
        assert!(displayed.contains("consistency: Three"));
        assert!(displayed.contains("required: 3"));
        assert!(displayed.contains("alive: 2"));
    }
}
