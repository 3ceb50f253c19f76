//! Statement kinds (unprepared, prepared, batch) and their per-statement
//! execution options.

pub mod batch;
pub mod prepared;
pub mod unprepared;

pub use corvus_cql::frame::types::{Consistency, SerialConsistency};

use std::num::NonZeroI32;
use std::time::Duration;

/// The default number of rows fetched in one page.
pub const DEFAULT_PAGE_SIZE: PageSize = PageSize(match NonZeroI32::new(5000) {
    Some(page_size) => page_size,
    None => unreachable!(),
});

/// A positive page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSize(NonZeroI32);

impl PageSize {
    /// Clamps the argument into a valid page size; non-positive values
    /// become 1.
    pub fn new(size: i32) -> Self {
        Self(NonZeroI32::new(size.max(1)).expect("clamped to be positive"))
    }

    pub fn inner(&self) -> i32 {
        self.0.get()
    }
}

impl Default for PageSize {
    fn default() -> Self {
        DEFAULT_PAGE_SIZE
    }
}

/// Options every statement kind carries; unset fields fall back to the
/// cluster-wide defaults at execution time.
#[derive(Debug, Clone, Default)]
pub(crate) struct StatementConfig {
    pub(crate) consistency: Option<Consistency>,
    pub(crate) serial_consistency: Option<Option<SerialConsistency>>,

    pub(crate) is_idempotent: bool,

    pub(crate) tracing: bool,
    pub(crate) timestamp: Option<i64>,
    pub(crate) request_timeout: Option<Duration>,
}

impl StatementConfig {
    pub(crate) fn determine_consistency(&self, default_consistency: Consistency) -> Consistency {
        self.consistency.unwrap_or(default_consistency)
    }
}
