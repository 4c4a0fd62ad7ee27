//! CQL native protocol implementation.
//!
//! This module provides the frame layer, the body notation and the parsers
//! for the responses the execution core inspects.

pub mod body;
mod codec;
pub mod constants;
mod frame;
pub mod response;

pub use codec::FrameCodec;
pub use constants::*;
pub use frame::{Decoded, Frame, FrameHeader, Opcode};
pub use response::{ServerEvent, StatusChangeType, TopologyChangeType};
