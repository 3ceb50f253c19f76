//! Response envelopes produced by request execution.

pub mod query_result;
pub mod request_response;

pub use query_result::QueryResult;
pub(crate) use request_response::{NonErrorQueryResponse, QueryResponse};

use corvus_cql::frame::response::authenticate::{Authenticate, AuthChallenge, AuthSuccess};

/// Non-error responses valid during the STARTUP phase.
pub(crate) enum NonErrorStartupResponse {
    Ready,
    Authenticate(Authenticate),
}

/// Non-error responses valid during the authentication exchange.
pub(crate) enum NonErrorAuthResponse {
    AuthChallenge(AuthChallenge),
    AuthSuccess(AuthSuccess),
}
