//! Parsing of the response bodies the execution core needs to understand.
//!
//! Only ERROR, EVENT and the authentication responses are inspected here.
//! RESULT bodies stay opaque.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

use bytes::{BufMut, Bytes, BytesMut};

use super::body::*;
use super::constants::*;
use crate::error::{DriverError, ErrorCode, ErrorDetails, Result, ServerError, WriteType};

/// Kind of a topology change push event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopologyChangeType {
    /// A node joined the ring.
    NewNode,
    /// A node left the ring.
    RemovedNode,
    /// A node moved its tokens.
    MovedNode,
}

/// Kind of a status change push event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusChangeType {
    /// The node is reachable again.
    Up,
    /// The node became unreachable.
    Down,
}

/// A notification pushed by the server on a registered channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// Ring membership change.
    TopologyChange {
        /// What happened.
        change: TopologyChangeType,
        /// RPC address of the node concerned.
        address: SocketAddr,
    },
    /// Node liveness change.
    StatusChange {
        /// What happened.
        change: StatusChangeType,
        /// RPC address of the node concerned.
        address: SocketAddr,
    },
    /// Schema modification.
    SchemaChange {
        /// `CREATED`, `UPDATED` or `DROPPED`.
        change: String,
        /// `KEYSPACE`, `TABLE`, `TYPE`, `FUNCTION` or `AGGREGATE`.
        target: String,
        /// Affected keyspace.
        keyspace: String,
        /// Affected element inside the keyspace.
        name: Option<String>,
        /// Argument types for functions and aggregates.
        arguments: Vec<String>,
    },
}

impl fmt::Display for ServerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TopologyChange { change, address } => {
                write!(f, "TOPOLOGY_CHANGE {:?} {}", change, address)
            }
            Self::StatusChange { change, address } => {
                write!(f, "STATUS_CHANGE {:?} {}", change, address)
            }
            Self::SchemaChange {
                change,
                target,
                keyspace,
                ..
            } => write!(f, "SCHEMA_CHANGE {} {} {}", change, target, keyspace),
        }
    }
}

impl ServerEvent {
    /// Parses an EVENT body.
    pub fn parse(mut body: Bytes) -> Result<Self> {
        let kind = read_string(&mut body)?;
        match kind.as_str() {
            EVENT_TOPOLOGY_CHANGE => {
                let change = match read_string(&mut body)?.as_str() {
                    "NEW_NODE" => TopologyChangeType::NewNode,
                    "REMOVED_NODE" => TopologyChangeType::RemovedNode,
                    "MOVED_NODE" => TopologyChangeType::MovedNode,
                    other => {
                        return Err(DriverError::Protocol(format!(
                            "unknown topology change {}",
                            other
                        )))
                    }
                };
                let address = read_inet(&mut body)?;
                Ok(Self::TopologyChange { change, address })
            }
            EVENT_STATUS_CHANGE => {
                let change = match read_string(&mut body)?.as_str() {
                    "UP" => StatusChangeType::Up,
                    "DOWN" => StatusChangeType::Down,
                    other => {
                        return Err(DriverError::Protocol(format!(
                            "unknown status change {}",
                            other
                        )))
                    }
                };
                let address = read_inet(&mut body)?;
                Ok(Self::StatusChange { change, address })
            }
            EVENT_SCHEMA_CHANGE => {
                let change = read_string(&mut body)?;
                let target = read_string(&mut body)?;
                let keyspace = read_string(&mut body)?;
                let (name, arguments) = match target.as_str() {
                    "KEYSPACE" => (None, Vec::new()),
                    "TABLE" | "TYPE" => (Some(read_string(&mut body)?), Vec::new()),
                    _ => (Some(read_string(&mut body)?), read_string_list(&mut body)?),
                };
                Ok(Self::SchemaChange {
                    change,
                    target,
                    keyspace,
                    name,
                    arguments,
                })
            }
            other => Err(DriverError::Protocol(format!(
                "unknown event type {}",
                other
            ))),
        }
    }

    /// Encodes this event as an EVENT body.
    pub fn to_body(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Self::TopologyChange { change, address } => {
                write_string(&mut buf, EVENT_TOPOLOGY_CHANGE);
                write_string(
                    &mut buf,
                    match change {
                        TopologyChangeType::NewNode => "NEW_NODE",
                        TopologyChangeType::RemovedNode => "REMOVED_NODE",
                        TopologyChangeType::MovedNode => "MOVED_NODE",
                    },
                );
                write_inet(&mut buf, *address);
            }
            Self::StatusChange { change, address } => {
                write_string(&mut buf, EVENT_STATUS_CHANGE);
                write_string(
                    &mut buf,
                    match change {
                        StatusChangeType::Up => "UP",
                        StatusChangeType::Down => "DOWN",
                    },
                );
                write_inet(&mut buf, *address);
            }
            Self::SchemaChange {
                change,
                target,
                keyspace,
                name,
                arguments,
            } => {
                write_string(&mut buf, EVENT_SCHEMA_CHANGE);
                write_string(&mut buf, change);
                write_string(&mut buf, target);
                write_string(&mut buf, keyspace);
                if let Some(name) = name {
                    write_string(&mut buf, name);
                }
                if target == "FUNCTION" || target == "AGGREGATE" {
                    let args: Vec<&str> = arguments.iter().map(String::as_str).collect();
                    write_string_list(&mut buf, &args);
                }
            }
        }
        buf.freeze()
    }
}

/// Parses an ERROR body into a [`ServerError`].
pub fn parse_error(mut body: Bytes) -> Result<ServerError> {
    let code = ErrorCode::from_code(read_int(&mut body)?);
    let message = read_string(&mut body)?;
    let details = match code {
        ErrorCode::Unavailable => ErrorDetails::Unavailable {
            consistency: read_short(&mut body)?,
            required: read_int(&mut body)?,
            alive: read_int(&mut body)?,
        },
        ErrorCode::ReadTimeout => ErrorDetails::ReadTimeout {
            consistency: read_short(&mut body)?,
            received: read_int(&mut body)?,
            block_for: read_int(&mut body)?,
            data_present: read_byte(&mut body)? != 0,
        },
        ErrorCode::WriteTimeout => ErrorDetails::WriteTimeout {
            consistency: read_short(&mut body)?,
            received: read_int(&mut body)?,
            block_for: read_int(&mut body)?,
            write_type: WriteType::parse(&read_string(&mut body)?),
        },
        ErrorCode::ReadFailure => ErrorDetails::ReadFailure {
            consistency: read_short(&mut body)?,
            received: read_int(&mut body)?,
            block_for: read_int(&mut body)?,
            failures: read_int(&mut body)?,
            data_present: read_byte(&mut body)? != 0,
        },
        ErrorCode::WriteFailure => ErrorDetails::WriteFailure {
            consistency: read_short(&mut body)?,
            received: read_int(&mut body)?,
            block_for: read_int(&mut body)?,
            failures: read_int(&mut body)?,
            write_type: WriteType::parse(&read_string(&mut body)?),
        },
        ErrorCode::FunctionFailure => ErrorDetails::FunctionFailure {
            keyspace: read_string(&mut body)?,
            function: read_string(&mut body)?,
            arg_types: read_string_list(&mut body)?,
        },
        ErrorCode::AlreadyExists => ErrorDetails::AlreadyExists {
            keyspace: read_string(&mut body)?,
            table: read_string(&mut body)?,
        },
        ErrorCode::Unprepared => ErrorDetails::Unprepared {
            id: read_short_bytes(&mut body)?.to_vec(),
        },
        _ => ErrorDetails::None,
    };
    Ok(ServerError {
        code,
        message,
        details,
    })
}

/// Encodes a [`ServerError`] as an ERROR body.
pub fn error_body(error: &ServerError) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_i32(error.code.code());
    write_string(&mut buf, &error.message);
    match &error.details {
        ErrorDetails::None => {}
        ErrorDetails::Unavailable {
            consistency,
            required,
            alive,
        } => {
            buf.put_u16(*consistency);
            buf.put_i32(*required);
            buf.put_i32(*alive);
        }
        ErrorDetails::ReadTimeout {
            consistency,
            received,
            block_for,
            data_present,
        } => {
            buf.put_u16(*consistency);
            buf.put_i32(*received);
            buf.put_i32(*block_for);
            buf.put_u8(u8::from(*data_present));
        }
        ErrorDetails::WriteTimeout {
            consistency,
            received,
            block_for,
            write_type,
        } => {
            buf.put_u16(*consistency);
            buf.put_i32(*received);
            buf.put_i32(*block_for);
            write_string(&mut buf, write_type_name(write_type));
        }
        ErrorDetails::ReadFailure {
            consistency,
            received,
            block_for,
            failures,
            data_present,
        } => {
            buf.put_u16(*consistency);
            buf.put_i32(*received);
            buf.put_i32(*block_for);
            buf.put_i32(*failures);
            buf.put_u8(u8::from(*data_present));
        }
        ErrorDetails::WriteFailure {
            consistency,
            received,
            block_for,
            failures,
            write_type,
        } => {
            buf.put_u16(*consistency);
            buf.put_i32(*received);
            buf.put_i32(*block_for);
            buf.put_i32(*failures);
            write_string(&mut buf, write_type_name(write_type));
        }
        ErrorDetails::FunctionFailure {
            keyspace,
            function,
            arg_types,
        } => {
            write_string(&mut buf, keyspace);
            write_string(&mut buf, function);
            let args: Vec<&str> = arg_types.iter().map(String::as_str).collect();
            write_string_list(&mut buf, &args);
        }
        ErrorDetails::AlreadyExists { keyspace, table } => {
            write_string(&mut buf, keyspace);
            write_string(&mut buf, table);
        }
        ErrorDetails::Unprepared { id } => {
            buf.put_u16(id.len() as u16);
            buf.put_slice(id);
        }
    }
    buf.freeze()
}

fn write_type_name(write_type: &WriteType) -> &str {
    match write_type {
        WriteType::Simple => "SIMPLE",
        WriteType::Batch => "BATCH",
        WriteType::UnloggedBatch => "UNLOGGED_BATCH",
        WriteType::Counter => "COUNTER",
        WriteType::BatchLog => "BATCH_LOG",
        WriteType::Cas => "CAS",
        WriteType::View => "VIEW",
        WriteType::Cdc => "CDC",
        WriteType::Other(name) => name,
    }
}

/// Parses an AUTHENTICATE body, returning the server's authenticator class.
pub fn parse_authenticate(mut body: Bytes) -> Result<String> {
    read_string(&mut body)
}

/// Parses an AUTH_CHALLENGE or AUTH_SUCCESS body.
pub fn parse_auth_token(mut body: Bytes) -> Result<Option<Bytes>> {
    read_bytes(&mut body)
}

/// Parses a SUPPORTED body.
pub fn parse_supported(mut body: Bytes) -> Result<HashMap<String, Vec<String>>> {
    read_string_multimap(&mut body)
}
