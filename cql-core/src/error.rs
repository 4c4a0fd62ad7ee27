//! Error types for driver operations.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Error codes carried by an `ERROR` response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Unexpected server-side failure.
    ServerError,
    /// The server rejected the frame as malformed.
    ProtocolError,
    /// Authentication rejected.
    BadCredentials,
    /// Not enough live replicas to honor the consistency level.
    Unavailable,
    /// The coordinator is overloaded.
    Overloaded,
    /// The coordinator is still bootstrapping.
    IsBootstrapping,
    /// A truncation failed.
    TruncateError,
    /// Replicas did not acknowledge a write in time.
    WriteTimeout,
    /// Replicas did not answer a read in time.
    ReadTimeout,
    /// A replica failed a read.
    ReadFailure,
    /// A user function failed.
    FunctionFailure,
    /// A replica failed a write.
    WriteFailure,
    /// Query syntax error.
    SyntaxError,
    /// Missing permission.
    Unauthorized,
    /// Query is syntactically valid but invalid.
    Invalid,
    /// Query conflicts with the server configuration.
    ConfigError,
    /// Keyspace or table already exists.
    AlreadyExists,
    /// Prepared statement id unknown to the coordinator.
    Unprepared,
    /// A code this driver does not know.
    Unknown(i32),
}

impl ErrorCode {
    /// Creates an error code from its wire value.
    pub fn from_code(code: i32) -> Self {
        match code {
            0x0000 => Self::ServerError,
            0x000A => Self::ProtocolError,
            0x0100 => Self::BadCredentials,
            0x1000 => Self::Unavailable,
            0x1001 => Self::Overloaded,
            0x1002 => Self::IsBootstrapping,
            0x1003 => Self::TruncateError,
            0x1100 => Self::WriteTimeout,
            0x1200 => Self::ReadTimeout,
            0x1300 => Self::ReadFailure,
            0x1400 => Self::FunctionFailure,
            0x1500 => Self::WriteFailure,
            0x2000 => Self::SyntaxError,
            0x2100 => Self::Unauthorized,
            0x2200 => Self::Invalid,
            0x2300 => Self::ConfigError,
            0x2400 => Self::AlreadyExists,
            0x2500 => Self::Unprepared,
            other => Self::Unknown(other),
        }
    }

    /// Returns the wire value of this code.
    pub fn code(self) -> i32 {
        match self {
            Self::ServerError => 0x0000,
            Self::ProtocolError => 0x000A,
            Self::BadCredentials => 0x0100,
            Self::Unavailable => 0x1000,
            Self::Overloaded => 0x1001,
            Self::IsBootstrapping => 0x1002,
            Self::TruncateError => 0x1003,
            Self::WriteTimeout => 0x1100,
            Self::ReadTimeout => 0x1200,
            Self::ReadFailure => 0x1300,
            Self::FunctionFailure => 0x1400,
            Self::WriteFailure => 0x1500,
            Self::SyntaxError => 0x2000,
            Self::Unauthorized => 0x2100,
            Self::Invalid => 0x2200,
            Self::ConfigError => 0x2300,
            Self::AlreadyExists => 0x2400,
            Self::Unprepared => 0x2500,
            Self::Unknown(code) => code,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ServerError => "SERVER_ERROR",
            Self::ProtocolError => "PROTOCOL_ERROR",
            Self::BadCredentials => "BAD_CREDENTIALS",
            Self::Unavailable => "UNAVAILABLE",
            Self::Overloaded => "OVERLOADED",
            Self::IsBootstrapping => "IS_BOOTSTRAPPING",
            Self::TruncateError => "TRUNCATE_ERROR",
            Self::WriteTimeout => "WRITE_TIMEOUT",
            Self::ReadTimeout => "READ_TIMEOUT",
            Self::ReadFailure => "READ_FAILURE",
            Self::FunctionFailure => "FUNCTION_FAILURE",
            Self::WriteFailure => "WRITE_FAILURE",
            Self::SyntaxError => "SYNTAX_ERROR",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::Invalid => "INVALID",
            Self::ConfigError => "CONFIG_ERROR",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::Unprepared => "UNPREPARED",
            Self::Unknown(_) => "UNKNOWN",
        };
        write!(f, "{} (0x{:04X})", name, self.code())
    }
}

/// Kind of write reported by write timeouts and failures.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WriteType {
    /// Single-partition write.
    Simple,
    /// Logged batch, written after the batch log.
    Batch,
    /// Unlogged batch.
    UnloggedBatch,
    /// Counter update.
    Counter,
    /// Write to the batch log itself.
    BatchLog,
    /// Compare-and-set write.
    Cas,
    /// Materialized view update.
    View,
    /// Change-data-capture write.
    Cdc,
    /// A write type this driver does not know.
    Other(String),
}

impl WriteType {
    /// Parses the write type string sent by the server.
    pub fn parse(value: &str) -> Self {
        match value {
            "SIMPLE" => Self::Simple,
            "BATCH" => Self::Batch,
            "UNLOGGED_BATCH" => Self::UnloggedBatch,
            "COUNTER" => Self::Counter,
            "BATCH_LOG" => Self::BatchLog,
            "CAS" => Self::Cas,
            "VIEW" => Self::View,
            "CDC" => Self::Cdc,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Structured fields of error responses that carry more than a message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ErrorDetails {
    /// No additional fields.
    #[default]
    None,
    /// Fields of an `UNAVAILABLE` error.
    Unavailable {
        /// Consistency level of the request.
        consistency: u16,
        /// Replicas required.
        required: i32,
        /// Replicas known alive.
        alive: i32,
    },
    /// Fields of a `READ_TIMEOUT` error.
    ReadTimeout {
        /// Consistency level of the request.
        consistency: u16,
        /// Replicas that answered.
        received: i32,
        /// Replicas required.
        block_for: i32,
        /// Whether the data replica answered.
        data_present: bool,
    },
    /// Fields of a `WRITE_TIMEOUT` error.
    WriteTimeout {
        /// Consistency level of the request.
        consistency: u16,
        /// Replicas that acknowledged.
        received: i32,
        /// Replicas required.
        block_for: i32,
        /// Kind of write that timed out.
        write_type: WriteType,
    },
    /// Fields of a `READ_FAILURE` error.
    ReadFailure {
        /// Consistency level of the request.
        consistency: u16,
        /// Replicas that answered.
        received: i32,
        /// Replicas required.
        block_for: i32,
        /// Replicas that failed.
        failures: i32,
        /// Whether the data replica answered.
        data_present: bool,
    },
    /// Fields of a `WRITE_FAILURE` error.
    WriteFailure {
        /// Consistency level of the request.
        consistency: u16,
        /// Replicas that acknowledged.
        received: i32,
        /// Replicas required.
        block_for: i32,
        /// Replicas that failed.
        failures: i32,
        /// Kind of write that failed.
        write_type: WriteType,
    },
    /// Fields of a `FUNCTION_FAILURE` error.
    FunctionFailure {
        /// Keyspace of the function.
        keyspace: String,
        /// Function name.
        function: String,
        /// Argument types.
        arg_types: Vec<String>,
    },
    /// Fields of an `ALREADY_EXISTS` error.
    AlreadyExists {
        /// Keyspace that exists, or the keyspace of the table.
        keyspace: String,
        /// Table that exists; empty for a keyspace.
        table: String,
    },
    /// Fields of an `UNPREPARED` error.
    Unprepared {
        /// Statement id the coordinator did not recognize.
        id: Vec<u8>,
    },
}

/// An error response returned by a coordinator node.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human readable message from the server.
    pub message: String,
    /// Code-specific fields.
    pub details: ErrorDetails,
}

impl ServerError {
    /// Creates a server error without structured details.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: ErrorDetails::None,
        }
    }

    /// Attaches structured details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }
}

/// Root cause of a failure to open or keep a channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// Host name resolution failed.
    #[error("failed to resolve {0}")]
    Resolve(String),

    /// Socket level failure.
    #[error("I/O failure: {0}")]
    Io(String),

    /// Connecting or handshaking took too long.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The server rejected our credentials or no authenticator is configured.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The server does not speak the requested protocol version.
    #[error("protocol version {version} rejected: {message}")]
    ProtocolMismatch {
        /// Version that was requested.
        version: u8,
        /// Message returned by the server.
        message: String,
    },

    /// The server answered the handshake with something unexpected.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// A heartbeat got no answer.
    #[error("heartbeat failed: {0}")]
    HeartbeatTimeout(String),
}

/// Ordered record of every failure seen while executing one request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeErrors(Vec<(SocketAddr, DriverError)>);

impl NodeErrors {
    /// Creates an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a failure on a node.
    pub fn push(&mut self, address: SocketAddr, error: DriverError) {
        self.0.push((address, error));
    }

    /// Returns the number of recorded failures.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if no failure was recorded.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the first failure recorded for the given node.
    pub fn get(&self, address: &SocketAddr) -> Option<&DriverError> {
        self.0
            .iter()
            .find(|(addr, _)| addr == address)
            .map(|(_, err)| err)
    }

    /// Iterates failures in the order they happened.
    pub fn iter(&self) -> impl Iterator<Item = &(SocketAddr, DriverError)> {
        self.0.iter()
    }
}

impl fmt::Display for NodeErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, (address, error)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}: {}", address, error)?;
        }
        f.write_str("]")
    }
}

/// The main error type for driver operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DriverError {
    /// A channel could not be opened or was torn down.
    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// The channel carrying a request closed before the response arrived.
    #[error("channel closed: {0}")]
    ChannelClosed(String),

    /// Every stream id of the channel is in use.
    #[error("no free stream id on {0}")]
    Busy(SocketAddr),

    /// The node has no open channel right now.
    #[error("node {0} has no open channel")]
    NodeUnavailable(SocketAddr),

    /// Malformed frame or unexpected response.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A frame with an opcode this driver does not understand.
    #[error("unsupported frame: opcode 0x{opcode:02X} on stream {stream}")]
    UnsupportedFrame {
        /// Opcode received.
        opcode: u8,
        /// Stream id of the frame.
        stream: i16,
    },

    /// The coordinator answered with an error response.
    #[error("server error from {address}: {error}")]
    Server {
        /// Coordinator that answered.
        address: SocketAddr,
        /// Error response.
        error: ServerError,
        /// Failures seen on earlier attempts of the same request.
        attempts: NodeErrors,
    },

    /// No response arrived in time.
    #[error("request timed out after {elapsed:?}")]
    RequestTimeout {
        /// Time waited.
        elapsed: Duration,
        /// Failures seen on earlier attempts of the same request.
        attempts: NodeErrors,
    },

    /// Every node of the query plan was tried without success.
    #[error("no node was able to answer the request: {0}")]
    NoNodeAvailable(NodeErrors),

    /// The caller cancelled the request.
    #[error("request cancelled")]
    Cancelled,

    /// Invalid driver or request configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// I/O errors from the standard library.
    #[error("I/O error: {0}")]
    Io(String),
}

impl DriverError {
    /// Returns true for failures of the transport rather than of the request.
    ///
    /// These always move a request to the next node of its plan.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            Self::Connection(_)
                | Self::ChannelClosed(_)
                | Self::Busy(_)
                | Self::NodeUnavailable(_)
                | Self::Protocol(_)
                | Self::UnsupportedFrame { .. }
                | Self::Io(_)
        )
    }

    /// Returns the server error carried by this error, if any.
    pub fn server_error(&self) -> Option<&ServerError> {
        match self {
            Self::Server { error, .. } => Some(error),
            _ => None,
        }
    }

    /// Attaches the failures of earlier attempts to a terminal error.
    pub fn with_attempts(self, history: NodeErrors) -> Self {
        match self {
            Self::Server { address, error, .. } => Self::Server {
                address,
                error,
                attempts: history,
            },
            Self::RequestTimeout { elapsed, .. } => Self::RequestTimeout {
                elapsed,
                attempts: history,
            },
            other => other,
        }
    }
}

impl From<io::Error> for DriverError {
    fn from(err: io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// A specialized `Result` type for driver operations.
pub type Result<T> = std::result::Result<T, DriverError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_error_code_round_trip_known_codes() {
        for code in [0x0000, 0x000A, 0x1000, 0x1001, 0x1100, 0x1200, 0x2200, 0x2500] {
            assert_eq!(ErrorCode::from_code(code).code(), code);
        }
        assert_eq!(ErrorCode::from_code(0x1000), ErrorCode::Unavailable);
    }

    #[test]
    fn test_unknown_error_code_is_kept() {
        let code = ErrorCode::from_code(0x7777);
        assert_eq!(code, ErrorCode::Unknown(0x7777));
        assert_eq!(code.code(), 0x7777);
    }

    #[test]
    fn test_server_error_display() {
        let err = ServerError::new(ErrorCode::Unavailable, "not enough replicas");
        assert_eq!(err.to_string(), "UNAVAILABLE (0x1000): not enough replicas");
    }

    #[test]
    fn test_write_type_parse() {
        assert_eq!(WriteType::parse("BATCH_LOG"), WriteType::BatchLog);
        assert_eq!(WriteType::parse("SIMPLE"), WriteType::Simple);
        assert_eq!(
            WriteType::parse("SOMETHING"),
            WriteType::Other("SOMETHING".to_string())
        );
    }

    #[test]
    fn test_connection_error_display() {
        let err = DriverError::from(ConnectionError::Authentication("bad password".to_string()));
        assert_eq!(
            err.to_string(),
            "connection error: authentication failed: bad password"
        );
    }

    #[test]
    fn test_unsupported_frame_display() {
        let err = DriverError::UnsupportedFrame {
            opcode: 0x42,
            stream: 7,
        };
        assert_eq!(err.to_string(), "unsupported frame: opcode 0x42 on stream 7");
    }

    #[test]
    fn test_node_errors_keep_order() {
        let mut errors = NodeErrors::new();
        errors.push(addr(1), DriverError::NodeUnavailable(addr(1)));
        errors.push(addr(2), DriverError::ChannelClosed("reset".to_string()));

        assert_eq!(errors.len(), 2);
        let order: Vec<_> = errors.iter().map(|(a, _)| a.port()).collect();
        assert_eq!(order, vec![1, 2]);
        assert!(matches!(errors.get(&addr(2)), Some(DriverError::ChannelClosed(_))));
        assert!(errors.get(&addr(3)).is_none());
    }

    #[test]
    fn test_no_node_available_lists_every_node() {
        let mut errors = NodeErrors::new();
        errors.push(addr(1), DriverError::NodeUnavailable(addr(1)));
        errors.push(addr(2), DriverError::NodeUnavailable(addr(2)));
        let message = DriverError::NoNodeAvailable(errors).to_string();
        assert!(message.contains("127.0.0.1:1"));
        assert!(message.contains("127.0.0.1:2"));
    }

    #[test]
    fn test_connection_level_classification() {
        assert!(DriverError::Busy(addr(1)).is_connection_level());
        assert!(DriverError::ChannelClosed("x".to_string()).is_connection_level());
        assert!(!DriverError::Cancelled.is_connection_level());
        let server = DriverError::Server {
            address: addr(1),
            error: ServerError::new(ErrorCode::Overloaded, "busy"),
            attempts: NodeErrors::new(),
        };
        assert!(!server.is_connection_level());
        assert_eq!(server.server_error().map(|e| e.code), Some(ErrorCode::Overloaded));
    }

    #[test]
    fn test_with_attempts_attaches_history() {
        let mut history = NodeErrors::new();
        history.push(addr(1), DriverError::NodeUnavailable(addr(1)));
        let err = DriverError::RequestTimeout {
            elapsed: Duration::from_millis(10),
            attempts: NodeErrors::new(),
        }
        .with_attempts(history);

        match err {
            DriverError::RequestTimeout { attempts, .. } => assert_eq!(attempts.len(), 1),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused");
        let err: DriverError = io_err.into();
        assert!(matches!(err, DriverError::Io(_)));
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<DriverError>();
    }
}
