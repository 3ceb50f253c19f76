use std::collections::HashMap;

use bytes::Bytes;
use uuid::Uuid;

use corvus_cql::frame::response::event::SchemaChangeEvent;
use corvus_cql::frame::response::result::SetKeyspace;
use corvus_cql::frame::response::{result, CqlResponseKind, Response};

use crate::errors::RequestAttemptError;
use crate::response::query_result::QueryResult;

/// A deserialized response frame together with its frame-level extensions.
pub(crate) struct QueryResponse {
    pub(crate) response: Response,
    pub(crate) tracing_id: Option<Uuid>,
    pub(crate) warnings: Vec<String>,
    pub(crate) custom_payload: Option<HashMap<String, Bytes>>,
}

/// A [QueryResponse] guaranteed not to be an ERROR.
pub(crate) struct NonErrorQueryResponse {
    pub(crate) response: NonErrorResponse,
    pub(crate) tracing_id: Option<Uuid>,
    pub(crate) warnings: Vec<String>,
}

/// A response with the ERROR variant factored out.
pub(crate) enum NonErrorResponse {
    Ready,
    Result(result::Result),
    Supported,
    Authenticate,
    AuthSuccess,
    AuthChallenge,
    Event,
}

impl NonErrorResponse {
    fn to_response_kind(&self) -> CqlResponseKind {
        match self {
            NonErrorResponse::Ready => CqlResponseKind::Ready,
            NonErrorResponse::Result(_) => CqlResponseKind::Result,
            NonErrorResponse::Supported => CqlResponseKind::Supported,
            NonErrorResponse::Authenticate => CqlResponseKind::Authenticate,
            NonErrorResponse::AuthSuccess => CqlResponseKind::AuthSuccess,
            NonErrorResponse::AuthChallenge => CqlResponseKind::AuthChallenge,
            NonErrorResponse::Event => CqlResponseKind::Event,
        }
    }
}

impl QueryResponse {
    pub(crate) fn into_non_error_query_response(
        self,
    ) -> Result<NonErrorQueryResponse, RequestAttemptError> {
        let response = match self.response {
            Response::Error(error) => return Err(error.into()),
            Response::Ready => NonErrorResponse::Ready,
            Response::Result(res) => NonErrorResponse::Result(res),
            Response::Supported(_) => NonErrorResponse::Supported,
            Response::Authenticate(_) => NonErrorResponse::Authenticate,
            Response::AuthSuccess(_) => NonErrorResponse::AuthSuccess,
            Response::AuthChallenge(_) => NonErrorResponse::AuthChallenge,
            Response::Event(_) => NonErrorResponse::Event,
        };

        Ok(NonErrorQueryResponse {
            response,
            tracing_id: self.tracing_id,
            warnings: self.warnings,
        })
    }
}

impl NonErrorQueryResponse {
    pub(crate) fn as_set_keyspace(&self) -> Option<&SetKeyspace> {
        match &self.response {
            NonErrorResponse::Result(result::Result::SetKeyspace(sk)) => Some(sk),
            _ => None,
        }
    }

    pub(crate) fn as_schema_change(&self) -> Option<&SchemaChangeEvent> {
        match &self.response {
            NonErrorResponse::Result(result::Result::SchemaChange(sc)) => Some(sc),
            _ => None,
        }
    }

    /// Converts the response into a [QueryResult], rejecting response kinds
    /// that cannot conclude a QUERY/EXECUTE/BATCH request.
    pub(crate) fn into_query_result(self) -> Result<QueryResult, RequestAttemptError> {
        let (rows, paging_state_response) = match self.response {
            NonErrorResponse::Result(result::Result::Rows(rows)) => {
                let paging_state_response = rows.paging_state_response.clone();
                (Some(rows), paging_state_response)
            }
            NonErrorResponse::Result(_) => (
                None,
                corvus_cql::frame::request::query::PagingStateResponse::NoMorePages,
            ),
            other => {
                return Err(RequestAttemptError::UnexpectedResponse(
                    other.to_response_kind(),
                ))
            }
        };

        Ok(QueryResult::new(
            rows,
            paging_state_response,
            self.tracing_id,
            self.warnings,
        ))
    }
}
