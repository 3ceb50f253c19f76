use std::time::Duration;

pub use corvus_cql::frame::request::batch::BatchType;

use super::prepared::PreparedStatement;
use super::unprepared::Statement;
use super::{Consistency, SerialConsistency, StatementConfig};

/// A list of statements executed as one logical unit, sharing consistency,
/// timestamp and idempotence settings.
#[derive(Clone)]
pub struct Batch {
    pub(crate) config: StatementConfig,
    batch_type: BatchType,
    pub statements: Vec<BatchStatement>,
}

/// One entry of a [Batch].
#[derive(Clone)]
pub enum BatchStatement {
    Query(Statement),
    PreparedStatement(PreparedStatement),
}

impl Batch {
    pub fn new(batch_type: BatchType) -> Self {
        Self {
            batch_type,
            config: Default::default(),
            statements: Vec::new(),
        }
    }

    /// Creates an empty batch with the same type and options as the given
    /// one, for rebuilding its statement list.
    pub(crate) fn new_from(batch: &Batch) -> Batch {
        Batch {
            batch_type: batch.batch_type,
            config: batch.config.clone(),
            statements: Vec::with_capacity(batch.statements.len()),
        }
    }

    pub fn append_statement(&mut self, statement: impl Into<BatchStatement>) {
        self.statements.push(statement.into());
    }

    pub fn get_type(&self) -> BatchType {
        self.batch_type
    }

    pub fn set_consistency(&mut self, c: Consistency) {
        self.config.consistency = Some(c);
    }

    pub fn get_consistency(&self) -> Option<Consistency> {
        self.config.consistency
    }

    pub fn set_serial_consistency(&mut self, sc: Option<SerialConsistency>) {
        self.config.serial_consistency = Some(sc);
    }

    /// Marks the whole batch as idempotent. A batch mixing idempotent and
    /// non-idempotent statements must be left non-idempotent.
    pub fn set_is_idempotent(&mut self, is_idempotent: bool) {
        self.config.is_idempotent = is_idempotent;
    }

    pub fn get_is_idempotent(&self) -> bool {
        self.config.is_idempotent
    }

    pub fn set_tracing(&mut self, should_trace: bool) {
        self.config.tracing = should_trace;
    }

    pub fn set_timestamp(&mut self, timestamp: Option<i64>) {
        self.config.timestamp = timestamp;
    }

    pub fn get_timestamp(&self) -> Option<i64> {
        self.config.timestamp
    }

    pub fn set_request_timeout(&mut self, timeout: Option<Duration>) {
        self.config.request_timeout = timeout;
    }
}

impl Default for Batch {
    fn default() -> Self {
        Self::new(BatchType::Logged)
    }
}

impl From<Statement> for BatchStatement {
    fn from(query: Statement) -> Self {
        BatchStatement::Query(query)
    }
}

impl From<PreparedStatement> for BatchStatement {
    fn from(prepared: PreparedStatement) -> Self {
        BatchStatement::PreparedStatement(prepared)
    }
}

impl From<&str> for BatchStatement {
    fn from(text: &str) -> Self {
        BatchStatement::Query(Statement::new(text))
    }
}
