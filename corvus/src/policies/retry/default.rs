use super::{RequestInfo, RetryDecision, RetryPolicy, RetrySession};
use crate::errors::{DbError, RequestAttemptError, WriteType};

/// The default retry policy.
///
/// Retries when there is a high chance of success: transient transport
/// failures on idempotent statements, a single coordinator-unavailability
/// bounce to a different node, and read timeouts where enough replicas
/// responded but data was absent. Never retries a non-idempotent statement
/// after its frame may have reached a server.
#[derive(Debug, Default)]
pub struct DefaultRetryPolicy;

impl DefaultRetryPolicy {
    pub fn new() -> DefaultRetryPolicy {
        DefaultRetryPolicy
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    fn new_session(&self) -> Box<dyn RetrySession> {
        Box::new(DefaultRetrySession::new())
    }
}

/// Implementation of [RetrySession] for [DefaultRetryPolicy].
pub struct DefaultRetrySession {
    was_unavailable_retry: bool,
    was_read_timeout_retry: bool,
    was_write_timeout_retry: bool,
}

impl DefaultRetrySession {
    pub fn new() -> DefaultRetrySession {
        DefaultRetrySession {
            was_unavailable_retry: false,
            was_read_timeout_retry: false,
            was_write_timeout_retry: false,
        }
    }
}

impl Default for DefaultRetrySession {
    fn default() -> Self {
        Self::new()
    }
}

impl RetrySession for DefaultRetrySession {
    fn decide_should_retry(&mut self, request_info: RequestInfo) -> RetryDecision {
        match request_info.error {
            // The request may have reached a server before the connection
            // broke, so a retry is safe only for idempotent statements.
            RequestAttemptError::BrokenConnectionError(_) => {
                if request_info.is_idempotent {
                    RetryDecision::RetryNextTarget(None)
                } else {
                    RetryDecision::DontRetry
                }
            }
            // The request never left the driver; the host is merely busy
            // or unreachable. The executor advances to the next host.
            RequestAttemptError::UnableToAllocStreamId
            | RequestAttemptError::ConnectionPoolError(_) => RetryDecision::RetryNextTarget(None),
            // The frame may have reached the server, like a broken
            // connection; the response simply never came back in time.
            RequestAttemptError::AttemptTimeout(_) => {
                if request_info.is_idempotent {
                    RetryDecision::RetryNextTarget(None)
                } else {
                    RetryDecision::DontRetry
                }
            }
            // Unavailable is the coordinator's local view; another
            // coordinator might see enough replicas alive.
            RequestAttemptError::DbError(DbError::Unavailable { .. }, _) => {
                if !self.was_unavailable_retry {
                    self.was_unavailable_retry = true;
                    RetryDecision::RetryNextTarget(None)
                } else {
                    RetryDecision::DontRetry
                }
            }
            // Enough replicas answered, just not the data-bearing one;
            // a single same-node retry is likely to succeed.
            RequestAttemptError::DbError(
                DbError::ReadTimeout {
                    received,
                    required,
                    data_present,
                    ..
                },
                _,
            ) => {
                if !self.was_read_timeout_retry && received >= required && !data_present {
                    self.was_read_timeout_retry = true;
                    RetryDecision::RetrySameTarget(None)
                } else {
                    RetryDecision::DontRetry
                }
            }
            // A timed-out batch-log write proves the batch was not applied.
            RequestAttemptError::DbError(DbError::WriteTimeout { write_type, .. }, _) => {
                if !self.was_write_timeout_retry
                    && request_info.is_idempotent
                    && *write_type == WriteType::BatchLog
                {
                    self.was_write_timeout_retry = true;
                    RetryDecision::RetrySameTarget(None)
                } else {
                    RetryDecision::DontRetry
                }
            }
            RequestAttemptError::DbError(DbError::IsBootstrapping, _) => {
                RetryDecision::RetryNextTarget(None)
            }
            RequestAttemptError::DbError(DbError::Overloaded, _)
            | RequestAttemptError::DbError(DbError::ServerError, _)
            | RequestAttemptError::DbError(DbError::TruncateError, _) => {
                if request_info.is_idempotent {
                    RetryDecision::RetryNextTarget(None)
                } else {
                    RetryDecision::DontRetry
                }
            }
            _ => RetryDecision::DontRetry,
        }
    }

    fn reset(&mut self) {
        *self = DefaultRetrySession::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{BrokenConnectionErrorKind, RequestAttemptError};
    use corvus_cql::Consistency;

    fn make_request_info(error: &RequestAttemptError, is_idempotent: bool) -> RequestInfo<'_> {
        RequestInfo {
            error,
            is_idempotent,
            consistency: Consistency::LocalOne,
        }
    }

    fn broken_connection() -> RequestAttemptError {
        RequestAttemptError::BrokenConnectionError(
            BrokenConnectionErrorKind::ChannelError.into(),
        )
    }

    #[test]
    fn transport_error_retried_only_when_idempotent() {
        let error = broken_connection();

        let mut session = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            session.decide_should_retry(make_request_info(&error, true)),
            RetryDecision::RetryNextTarget(None)
        );

        let mut session = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            session.decide_should_retry(make_request_info(&error, false)),
            RetryDecision::DontRetry
        );
    }

    #[test]
    fn unavailable_retried_once_on_next_node() {
        let error = RequestAttemptError::DbError(
            DbError::Unavailable {
                consistency: Consistency::Two,
                required: 2,
                alive: 1,
            },
            "not enough replicas".into(),
        );
        let mut session = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            session.decide_should_retry(make_request_info(&error, false)),
            RetryDecision::RetryNextTarget(None)
        );
        assert_eq!(
            session.decide_should_retry(make_request_info(&error, false)),
            RetryDecision::DontRetry
        );
    }

    #[test]
    fn read_timeout_retried_when_data_absent() {
        let retriable = RequestAttemptError::DbError(
            DbError::ReadTimeout {
                consistency: Consistency::Two,
                received: 2,
                required: 2,
                data_present: false,
            },
            "rt".into(),
        );
        let mut session = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            session.decide_should_retry(make_request_info(&retriable, false)),
            RetryDecision::RetrySameTarget(None)
        );
        // Only one such retry per request.
        assert_eq!(
            session.decide_should_retry(make_request_info(&retriable, false)),
            RetryDecision::DontRetry
        );

        let data_present = RequestAttemptError::DbError(
            DbError::ReadTimeout {
                consistency: Consistency::Two,
                received: 2,
                required: 2,
                data_present: true,
            },
            "rt".into(),
        );
        let mut session = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            session.decide_should_retry(make_request_info(&data_present, true)),
            RetryDecision::DontRetry
        );
    }

    #[test]
    fn write_timeout_retried_only_for_idempotent_batch_log() {
        let batch_log = RequestAttemptError::DbError(
            DbError::WriteTimeout {
                consistency: Consistency::Two,
                received: 1,
                required: 2,
                write_type: WriteType::BatchLog,
            },
            "wt".into(),
        );
        let mut session = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            session.decide_should_retry(make_request_info(&batch_log, true)),
            RetryDecision::RetrySameTarget(None)
        );

        let mut session = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            session.decide_should_retry(make_request_info(&batch_log, false)),
            RetryDecision::DontRetry
        );

        let simple = RequestAttemptError::DbError(
            DbError::WriteTimeout {
                consistency: Consistency::Two,
                received: 1,
                required: 2,
                write_type: WriteType::Simple,
            },
            "wt".into(),
        );
        let mut session = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            session.decide_should_retry(make_request_info(&simple, true)),
            RetryDecision::DontRetry
        );
    }

    #[test]
    fn invalid_query_is_never_retried() {
        let error = RequestAttemptError::DbError(DbError::Invalid, "bad".into());
        let mut session = DefaultRetryPolicy::new().new_session();
        assert_eq!(
            session.decide_should_retry(make_request_info(&error, true)),
            RetryDecision::DontRetry
        );
    }
}
