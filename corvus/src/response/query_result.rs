use thiserror::Error;
use uuid::Uuid;

use corvus_cql::frame::request::query::PagingStateResponse;
use corvus_cql::frame::response::result::{CellParseError, FromCqlCell, Row, Rows};

/// The result of a successfully executed request.
///
/// Row cells stay raw; callers pull native values out per column with
/// [Row::get] or the typed helpers here. Requests that do not return rows
/// (INSERT, DDL, ...) produce a result with no row set.
pub struct QueryResult {
    rows: Option<Rows>,
    paging_state_response: PagingStateResponse,
    tracing_id: Option<Uuid>,
    warnings: Vec<String>,
}

impl QueryResult {
    pub(crate) fn new(
        rows: Option<Rows>,
        paging_state_response: PagingStateResponse,
        tracing_id: Option<Uuid>,
        warnings: Vec<String>,
    ) -> Self {
        Self {
            rows,
            paging_state_response,
            tracing_id,
            warnings,
        }
    }

    /// Whether the response carried a row set at all (even an empty one).
    pub fn is_rows(&self) -> bool {
        self.rows.is_some()
    }

    /// The returned rows; `None` for non-row results.
    pub fn rows(&self) -> Option<&Rows> {
        self.rows.as_ref()
    }

    pub fn rows_num(&self) -> usize {
        self.rows.as_ref().map(|rows| rows.rows_count).unwrap_or(0)
    }

    /// Server-side trace id, present when tracing was requested.
    pub fn tracing_id(&self) -> Option<Uuid> {
        self.tracing_id
    }

    /// Warnings attached to the response frame.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Whether (and where from) the result can be continued with a paged
    /// follow-up request.
    pub fn paging_state_response(&self) -> &PagingStateResponse {
        &self.paging_state_response
    }

    /// The first row, if the result has rows and is nonempty.
    pub fn maybe_first_row(&self) -> Option<&Row> {
        self.rows.as_ref().and_then(|rows| rows.rows.first())
    }

    /// Exactly one row, or an error describing what was found instead.
    pub fn single_row(&self) -> Result<&Row, SingleRowError> {
        let rows = self.rows.as_ref().ok_or(SingleRowError::NotRows)?;
        match rows.rows.as_slice() {
            [row] => Ok(row),
            other => Err(SingleRowError::BadNumberOfRows(other.len())),
        }
    }

    /// Decodes the single row's single-column-indexed cells as a shortcut
    /// for control queries of the `SELECT a, b FROM ...` shape.
    pub fn single_row_typed<T: FromCqlCell>(
        &self,
        column: usize,
    ) -> Result<T, SingleRowTypedError> {
        let row = self.single_row()?;
        Ok(row.get::<T>(column)?)
    }
}

/// The result was expected to have exactly one row, but had not.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SingleRowError {
    #[error("The response is not of Rows kind")]
    NotRows,
    #[error("Expected exactly one row, got {0}")]
    BadNumberOfRows(usize),
}

/// The single expected row was absent or a cell failed to decode.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SingleRowTypedError {
    #[error(transparent)]
    SingleRow(#[from] SingleRowError),
    #[error(transparent)]
    CellParse(#[from] CellParseError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows_result(row_count: usize) -> QueryResult {
        use corvus_cql::frame::response::result::ResultMetadata;
        use std::sync::Arc;

        let rows = Rows {
            metadata: Arc::new(ResultMetadata::mock_empty()),
            paging_state_response: PagingStateResponse::NoMorePages,
            rows_count: row_count,
            rows: (0..row_count).map(|_| Row::default()).collect(),
        };
        QueryResult::new(
            Some(rows),
            PagingStateResponse::NoMorePages,
            None,
            Vec::new(),
        )
    }

    #[test]
    fn single_row_requires_exactly_one() {
        assert!(rows_result(1).single_row().is_ok());
        assert_eq!(
            rows_result(0).single_row().unwrap_err(),
            SingleRowError::BadNumberOfRows(0)
        );
        assert_eq!(
            rows_result(2).single_row().unwrap_err(),
            SingleRowError::BadNumberOfRows(2)
        );
    }

    #[test]
    fn void_result_has_no_rows() {
        let result = QueryResult::new(None, PagingStateResponse::NoMorePages, None, Vec::new());
        assert!(!result.is_rows());
        assert_eq!(result.rows_num(), 0);
        assert_eq!(result.single_row().unwrap_err(), SingleRowError::NotRows);
    }
}
