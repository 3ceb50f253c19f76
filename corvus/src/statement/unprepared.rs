use std::time::Duration;

use super::{Consistency, PageSize, SerialConsistency, StatementConfig};

/// An unprepared statement: raw request text plus execution options.
/// The text is opaque to the driver; it is shipped to the server verbatim.
#[derive(Clone)]
pub struct Statement {
    pub contents: String,
    pub(crate) config: StatementConfig,
    page_size: PageSize,
}

impl Statement {
    pub fn new(contents: impl Into<String>) -> Self {
        Self {
            contents: contents.into(),
            config: Default::default(),
            page_size: PageSize::default(),
        }
    }

    /// Returns self with the new page size, builder-style.
    pub fn with_page_size(mut self, page_size: i32) -> Self {
        self.set_page_size(page_size);
        self
    }

    pub fn set_page_size(&mut self, page_size: i32) {
        self.page_size = PageSize::new(page_size);
    }

    pub(crate) fn get_validated_page_size(&self) -> PageSize {
        self.page_size
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

    pub fn get_serial_consistency(&self) -> Option<SerialConsistency> {
        self.config.serial_consistency.flatten()
    }

    /// Marks the statement as idempotent. Only idempotent statements are
    /// eligible for speculative execution and transparent transport-error
    /// retries.
    pub fn set_is_idempotent(&mut self, is_idempotent: bool) {
        self.config.is_idempotent = is_idempotent;
    }

    pub fn get_is_idempotent(&self) -> bool {
        self.config.is_idempotent
    }

    pub fn set_tracing(&mut self, should_trace: bool) {
        self.config.tracing = should_trace;
    }

    pub fn get_tracing(&self) -> bool {
        self.config.tracing
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

    pub fn get_request_timeout(&self) -> Option<Duration> {
        self.config.request_timeout
    }
}

impl std::fmt::Debug for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Statement")
            .field("contents", &self.contents)
            .finish_non_exhaustive()
    }
}

impl From<String> for Statement {
    fn from(s: String) -> Statement {
        Statement::new(s)
    }
}

impl From<&str> for Statement {
    fn from(s: &str) -> Statement {
        Statement::new(s.to_owned())
    }
}
