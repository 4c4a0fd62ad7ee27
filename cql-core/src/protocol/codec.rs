//! Codec implementation for encoding/decoding CQL frames on a byte stream.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use super::frame::{Decoded, Frame};
use crate::error::{DriverError, Result};

/// Codec for encoding and decoding CQL frames.
///
/// Implements the `tokio_util::codec::{Encoder, Decoder}` traits for use
/// with tokio's framed I/O.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    /// Creates a new codec instance.
    pub fn new() -> Self {
        Self
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = DriverError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<()> {
        item.encode(dst)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = DriverError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match Frame::decode(src)? {
            Decoded::Frame(frame) => Ok(Some(frame)),
            Decoded::NeedMoreData(missing) => {
                src.reserve(missing);
                Ok(None)
            }
        }
    }
}
