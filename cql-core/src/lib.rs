//! Core types and protocols for the CQL native protocol.

#![warn(missing_docs)]

pub mod error;
pub mod protocol;
pub mod token;

pub use error::{
    ConnectionError, DriverError, ErrorCode, ErrorDetails, NodeErrors, Result, ServerError,
    WriteType,
};
pub use token::{Murmur3Partitioner, Token};
