//! Retry decisions for failed attempts.

use cql_core::{DriverError, ErrorCode, ErrorDetails, WriteType};

/// What to do after an attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryDecision {
    /// Send the request again to the same node.
    RetrySameNode,
    /// Send the request to the next node of the plan.
    RetryNextNode,
    /// Fail the request with this error.
    Rethrow,
    /// Complete the request successfully with an empty result.
    Ignore,
}

/// Inputs of a retry decision.
#[derive(Debug, Clone, Copy)]
pub struct RetryContext<'a> {
    /// The failure of the attempt.
    pub error: &'a DriverError,
    /// Whether the request may safely be applied more than once.
    pub idempotent: bool,
    /// Retries already performed by this execution.
    pub retry_count: u32,
}

/// Classifies failed attempts. Implementations must be pure.
///
/// Connection-level failures never reach the policy: they always move the
/// request to the next node.
pub trait RetryPolicy: Send + Sync {
    /// Decides after an error response or a failed attempt.
    fn on_error(&self, context: &RetryContext<'_>) -> RetryDecision;

    /// Decides after an attempt got no answer within the request timeout.
    fn on_request_timeout(&self, context: &RetryContext<'_>) -> RetryDecision {
        self.on_error(context)
    }
}

impl std::fmt::Debug for dyn RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RetryPolicy")
    }
}

/// Conservative retries that never risk applying a non-idempotent request twice.
#[derive(Debug, Clone, Default)]
pub struct DefaultRetryPolicy {
    retry_server_errors: bool,
}

impl DefaultRetryPolicy {
    /// Creates the default policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Retries idempotent requests on the next node after `SERVER_ERROR`.
    pub fn with_server_error_retries(mut self, retry: bool) -> Self {
        self.retry_server_errors = retry;
        self
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    fn on_error(&self, context: &RetryContext<'_>) -> RetryDecision {
        let first_attempt = context.retry_count == 0;

        let error = match context.error {
            DriverError::Server { error, .. } => error,
            DriverError::RequestTimeout { .. } => {
                return if context.idempotent {
                    RetryDecision::RetryNextNode
                } else {
                    RetryDecision::Rethrow
                };
            }
            other if other.is_connection_level() => return RetryDecision::RetryNextNode,
            _ => return RetryDecision::Rethrow,
        };

        match (&error.code, &error.details) {
            (ErrorCode::Unavailable, _) if first_attempt => RetryDecision::RetryNextNode,
            (ErrorCode::Overloaded | ErrorCode::IsBootstrapping, _) => RetryDecision::RetryNextNode,
            (
                ErrorCode::ReadTimeout,
                ErrorDetails::ReadTimeout {
                    received,
                    block_for,
                    data_present,
                    ..
                },
            ) if context.idempotent && first_attempt && received >= block_for && !data_present => {
                RetryDecision::RetrySameNode
            }
            (
                ErrorCode::WriteTimeout,
                ErrorDetails::WriteTimeout {
                    write_type: WriteType::BatchLog,
                    ..
                },
            ) if context.idempotent && first_attempt => RetryDecision::RetrySameNode,
            (ErrorCode::ServerError, _) if self.retry_server_errors && context.idempotent => {
                RetryDecision::RetryNextNode
            }
            _ => RetryDecision::Rethrow,
        }
    }
}

/// Never retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct FallthroughRetryPolicy;

impl RetryPolicy for FallthroughRetryPolicy {
    fn on_error(&self, _context: &RetryContext<'_>) -> RetryDecision {
        RetryDecision::Rethrow
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::time::Duration;

    use cql_core::{NodeErrors, ServerError};

    use super::*;

    fn server(error: ServerError) -> DriverError {
        DriverError::Server {
            address: SocketAddr::from(([127, 0, 0, 1], 9042)),
            error,
            attempts: NodeErrors::new(),
        }
    }

    fn decide(policy: &dyn RetryPolicy, error: &DriverError, idempotent: bool, retries: u32) -> RetryDecision {
        policy.on_error(&RetryContext {
            error,
            idempotent,
            retry_count: retries,
        })
    }

    fn read_timeout(received: i32, block_for: i32, data_present: bool) -> DriverError {
        server(
            ServerError::new(ErrorCode::ReadTimeout, "timeout").with_details(ErrorDetails::ReadTimeout {
                consistency: 1,
                received,
                block_for,
                data_present,
            }),
        )
    }

    fn write_timeout(write_type: WriteType) -> DriverError {
        server(
            ServerError::new(ErrorCode::WriteTimeout, "timeout").with_details(ErrorDetails::WriteTimeout {
                consistency: 1,
                received: 0,
                block_for: 1,
                write_type,
            }),
        )
    }

    fn request_timeout() -> DriverError {
        DriverError::RequestTimeout {
            elapsed: Duration::from_millis(500),
            attempts: NodeErrors::new(),
        }
    }

    #[test]
    fn test_unavailable_retries_next_once() {
        let policy = DefaultRetryPolicy::new();
        let err = server(ServerError::new(ErrorCode::Unavailable, "unavailable"));
        assert_eq!(decide(&policy, &err, false, 0), RetryDecision::RetryNextNode);
        assert_eq!(decide(&policy, &err, false, 1), RetryDecision::Rethrow);
    }

    #[test]
    fn test_overloaded_and_bootstrapping_move_on() {
        let policy = DefaultRetryPolicy::new();
        for code in [ErrorCode::Overloaded, ErrorCode::IsBootstrapping] {
            let err = server(ServerError::new(code, "busy"));
            assert_eq!(decide(&policy, &err, false, 3), RetryDecision::RetryNextNode);
        }
    }

    #[test]
    fn test_read_timeout_retries_same_node_when_data_missing() {
        let policy = DefaultRetryPolicy::new();
        assert_eq!(
            decide(&policy, &read_timeout(2, 2, false), true, 0),
            RetryDecision::RetrySameNode
        );
        assert_eq!(decide(&policy, &read_timeout(2, 2, true), true, 0), RetryDecision::Rethrow);
        assert_eq!(decide(&policy, &read_timeout(1, 2, false), true, 0), RetryDecision::Rethrow);
        assert_eq!(decide(&policy, &read_timeout(2, 2, false), true, 1), RetryDecision::Rethrow);
    }

    #[test]
    fn test_batch_log_write_timeout_retried_when_idempotent() {
        let policy = DefaultRetryPolicy::new();
        assert_eq!(
            decide(&policy, &write_timeout(WriteType::BatchLog), true, 0),
            RetryDecision::RetrySameNode
        );
        assert_eq!(
            decide(&policy, &write_timeout(WriteType::Simple), true, 0),
            RetryDecision::Rethrow
        );
    }

    #[test]
    fn test_non_idempotent_timeouts_are_never_retried() {
        let policies: [&dyn RetryPolicy; 2] = [
            &DefaultRetryPolicy::new(),
            &DefaultRetryPolicy::new().with_server_error_retries(true),
        ];
        let errors = [
            read_timeout(2, 2, false),
            write_timeout(WriteType::BatchLog),
            write_timeout(WriteType::Simple),
            request_timeout(),
        ];
        for policy in policies {
            for error in &errors {
                for retries in 0..3 {
                    let decision = decide(policy, error, false, retries);
                    assert!(
                        matches!(decision, RetryDecision::Rethrow | RetryDecision::Ignore),
                        "{error:?} gave {decision:?}"
                    );
                    let on_timeout = policy.on_request_timeout(&RetryContext {
                        error,
                        idempotent: false,
                        retry_count: retries,
                    });
                    assert_ne!(on_timeout, RetryDecision::RetrySameNode);
                    assert_ne!(on_timeout, RetryDecision::RetryNextNode);
                }
            }
        }
    }

    #[test]
    fn test_idempotent_request_timeout_moves_on() {
        let policy = DefaultRetryPolicy::new();
        assert_eq!(decide(&policy, &request_timeout(), true, 0), RetryDecision::RetryNextNode);
    }

    #[test]
    fn test_server_error_is_configurable() {
        let err = server(ServerError::new(ErrorCode::ServerError, "boom"));
        assert_eq!(decide(&DefaultRetryPolicy::new(), &err, true, 0), RetryDecision::Rethrow);
        let retrying = DefaultRetryPolicy::new().with_server_error_retries(true);
        assert_eq!(decide(&retrying, &err, true, 0), RetryDecision::RetryNextNode);
        assert_eq!(decide(&retrying, &err, false, 0), RetryDecision::Rethrow);
    }

    #[test]
    fn test_failures_and_request_errors_rethrow() {
        let policy = DefaultRetryPolicy::new();
        for code in [
            ErrorCode::ReadFailure,
            ErrorCode::WriteFailure,
            ErrorCode::SyntaxError,
            ErrorCode::Invalid,
            ErrorCode::Unauthorized,
        ] {
            let err = server(ServerError::new(code, "no"));
            assert_eq!(decide(&policy, &err, true, 0), RetryDecision::Rethrow);
        }
        assert_eq!(decide(&policy, &DriverError::Cancelled, true, 0), RetryDecision::Rethrow);
    }

    #[test]
    fn test_fallthrough_never_retries() {
        let err = server(ServerError::new(ErrorCode::Unavailable, "unavailable"));
        assert_eq!(decide(&FallthroughRetryPolicy, &err, true, 0), RetryDecision::Rethrow);
    }
}
