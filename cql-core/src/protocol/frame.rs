//! Frame type for the CQL native protocol.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::constants::*;
use crate::error::{DriverError, Result};

/// Operation carried by a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Error response.
    Error,
    /// Connection initialization request.
    Startup,
    /// Connection is ready.
    Ready,
    /// Server requires authentication.
    Authenticate,
    /// Supported options request; also used as the heartbeat.
    Options,
    /// Answer to `Options`.
    Supported,
    /// Unprepared query request.
    Query,
    /// Result of a query, prepare, execute or batch.
    Result,
    /// Prepare request.
    Prepare,
    /// Execute a prepared statement.
    Execute,
    /// Subscribe to push events.
    Register,
    /// Server push event.
    Event,
    /// Batch request.
    Batch,
    /// SASL challenge from the server.
    AuthChallenge,
    /// SASL response from the client.
    AuthResponse,
    /// Authentication completed.
    AuthSuccess,
    /// An opcode this driver does not understand.
    Unknown(u8),
}

impl Opcode {
    /// Creates an opcode from its wire value.
    pub fn from_u8(value: u8) -> Self {
        match value {
            OPCODE_ERROR => Self::Error,
            OPCODE_STARTUP => Self::Startup,
            OPCODE_READY => Self::Ready,
            OPCODE_AUTHENTICATE => Self::Authenticate,
            OPCODE_OPTIONS => Self::Options,
            OPCODE_SUPPORTED => Self::Supported,
            OPCODE_QUERY => Self::Query,
            OPCODE_RESULT => Self::Result,
            OPCODE_PREPARE => Self::Prepare,
            OPCODE_EXECUTE => Self::Execute,
            OPCODE_REGISTER => Self::Register,
            OPCODE_EVENT => Self::Event,
            OPCODE_BATCH => Self::Batch,
            OPCODE_AUTH_CHALLENGE => Self::AuthChallenge,
            OPCODE_AUTH_RESPONSE => Self::AuthResponse,
            OPCODE_AUTH_SUCCESS => Self::AuthSuccess,
            other => Self::Unknown(other),
        }
    }

    /// Returns the wire value of this opcode.
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Error => OPCODE_ERROR,
            Self::Startup => OPCODE_STARTUP,
            Self::Ready => OPCODE_READY,
            Self::Authenticate => OPCODE_AUTHENTICATE,
            Self::Options => OPCODE_OPTIONS,
            Self::Supported => OPCODE_SUPPORTED,
            Self::Query => OPCODE_QUERY,
            Self::Result => OPCODE_RESULT,
            Self::Prepare => OPCODE_PREPARE,
            Self::Execute => OPCODE_EXECUTE,
            Self::Register => OPCODE_REGISTER,
            Self::Event => OPCODE_EVENT,
            Self::Batch => OPCODE_BATCH,
            Self::AuthChallenge => OPCODE_AUTH_CHALLENGE,
            Self::AuthResponse => OPCODE_AUTH_RESPONSE,
            Self::AuthSuccess => OPCODE_AUTH_SUCCESS,
            Self::Unknown(value) => value,
        }
    }
}

/// The fixed-size header that precedes every frame body.
///
/// Layout (big-endian):
/// - 1 byte version, high bit set for responses
/// - 1 byte flags
/// - 2 byte signed stream id
/// - 1 byte opcode
/// - 4 byte body length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Protocol version without the direction bit.
    pub version: u8,
    /// Whether the frame travels from server to client.
    pub is_response: bool,
    /// Flag byte.
    pub flags: u8,
    /// Stream id; negative ids are reserved for server push frames.
    pub stream: i16,
    /// Opcode.
    pub opcode: Opcode,
    /// Exact length of the body that follows.
    pub length: u32,
}

impl FrameHeader {
    /// Parses a header from the start of `src` without consuming it.
    ///
    /// Returns `None` if fewer than [`FRAME_HEADER_SIZE`] bytes are available.
    pub fn peek(src: &[u8]) -> Option<Self> {
        if src.len() < FRAME_HEADER_SIZE {
            return None;
        }
        Some(Self {
            version: src[0] & VERSION_MASK,
            is_response: src[0] & RESPONSE_DIRECTION_BIT != 0,
            flags: src[1],
            stream: i16::from_be_bytes([src[2], src[3]]),
            opcode: Opcode::from_u8(src[4]),
            length: u32::from_be_bytes([src[5], src[6], src[7], src[8]]),
        })
    }

    fn write_to(&self, dst: &mut BytesMut) {
        let direction = if self.is_response {
            RESPONSE_DIRECTION_BIT
        } else {
            0
        };
        dst.put_u8((self.version & VERSION_MASK) | direction);
        dst.put_u8(self.flags);
        dst.put_i16(self.stream);
        dst.put_u8(self.opcode.as_u8());
        dst.put_u32(self.length);
    }
}

/// Outcome of an incremental decode attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A complete frame was consumed from the buffer.
    Frame(Frame),
    /// The buffer holds a partial frame; this many more bytes are required.
    NeedMoreData(usize),
}

/// A single frame of the CQL native protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Protocol version without the direction bit.
    pub version: u8,
    /// Whether the frame travels from server to client.
    pub is_response: bool,
    /// Flag byte.
    pub flags: u8,
    /// Stream id.
    pub stream: i16,
    /// Opcode.
    pub opcode: Opcode,
    /// Opaque, opcode specific body.
    pub body: Bytes,
}

impl Frame {
    /// Creates a client-to-server frame.
    pub fn request(version: u8, stream: i16, opcode: Opcode, body: Bytes) -> Self {
        Self {
            version,
            is_response: false,
            flags: 0,
            stream,
            opcode,
            body,
        }
    }

    /// Creates a server-to-client frame.
    pub fn response(version: u8, stream: i16, opcode: Opcode, body: Bytes) -> Self {
        Self {
            is_response: true,
            ..Self::request(version, stream, opcode, body)
        }
    }

    /// Sets the flag byte.
    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    /// Returns the header describing this frame.
    pub fn header(&self) -> FrameHeader {
        FrameHeader {
            version: self.version,
            is_response: self.is_response,
            flags: self.flags,
            stream: self.stream,
            opcode: self.opcode,
            length: self.body.len() as u32,
        }
    }

    /// Returns true if the body is compressed.
    pub fn is_compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSION != 0
    }

    /// Returns true if the tracing flag is set.
    pub fn has_tracing(&self) -> bool {
        self.flags & FLAG_TRACING != 0
    }

    /// Returns true if the response carries warnings.
    pub fn has_warnings(&self) -> bool {
        self.flags & FLAG_WARNING != 0
    }

    /// Returns true if this is a server push frame.
    pub fn is_push(&self) -> bool {
        self.stream < 0
    }

    /// Returns the size of this frame on the wire.
    pub fn wire_size(&self) -> usize {
        FRAME_HEADER_SIZE + self.body.len()
    }

    /// Writes this frame to the given buffer.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        if self.body.len() > MAX_BODY_LENGTH {
            return Err(DriverError::Protocol(format!(
                "frame body of {} bytes exceeds the {} byte limit",
                self.body.len(),
                MAX_BODY_LENGTH
            )));
        }
        dst.reserve(self.wire_size());
        self.header().write_to(dst);
        dst.put_slice(&self.body);
        Ok(())
    }

    /// Reads one frame from the start of `src`.
    ///
    /// A complete frame is removed from the buffer. A partial frame is left
    /// untouched and the number of missing bytes is reported. A complete frame
    /// with an unknown opcode is removed and reported as
    /// [`DriverError::UnsupportedFrame`].
    pub fn decode(src: &mut BytesMut) -> Result<Decoded> {
        let header = match FrameHeader::peek(src) {
            Some(header) => header,
            None => return Ok(Decoded::NeedMoreData(FRAME_HEADER_SIZE - src.len())),
        };

        let body_length = header.length as usize;
        if body_length > MAX_BODY_LENGTH {
            return Err(DriverError::Protocol(format!(
                "frame body of {} bytes exceeds the {} byte limit",
                body_length, MAX_BODY_LENGTH
            )));
        }

        let total = FRAME_HEADER_SIZE + body_length;
        if src.len() < total {
            return Ok(Decoded::NeedMoreData(total - src.len()));
        }

        src.advance(FRAME_HEADER_SIZE);
        let body = src.split_to(body_length).freeze();

        if let Opcode::Unknown(opcode) = header.opcode {
            return Err(DriverError::UnsupportedFrame {
                opcode,
                stream: header.stream,
            });
        }

        Ok(Decoded::Frame(Self {
            version: header.version,
            is_response: header.is_response,
            flags: header.flags,
            stream: header.stream,
            opcode: header.opcode,
            body,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(frame: &Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_opcode_values() {
        for value in 0u8..=0x10 {
            let opcode = Opcode::from_u8(value);
            assert_eq!(opcode.as_u8(), value);
        }
        assert_eq!(Opcode::from_u8(0x04), Opcode::Unknown(0x04));
        assert_eq!(Opcode::from_u8(0x07), Opcode::Query);
    }

    #[test]
    fn test_header_layout() {
        let frame = Frame::request(4, 0x0102, Opcode::Query, Bytes::from_static(b"abc"))
            .with_flags(FLAG_TRACING);
        let buf = encoded(&frame);

        assert_eq!(buf.len(), 12);
        assert_eq!(&buf[..9], &[0x04, 0x02, 0x01, 0x02, 0x07, 0x00, 0x00, 0x00, 0x03]);
        assert_eq!(&buf[9..], b"abc");
    }

    #[test]
    fn test_response_sets_direction_bit() {
        let frame = Frame::response(4, 1, Opcode::Ready, Bytes::new());
        let buf = encoded(&frame);
        assert_eq!(buf[0], 0x84);

        let header = FrameHeader::peek(&buf).unwrap();
        assert!(header.is_response);
        assert_eq!(header.version, 4);
    }

    #[test]
    fn test_encode_then_decode_preserves_fields() {
        let frame = Frame::response(4, -1, Opcode::Event, Bytes::from_static(&[9, 8, 7]))
            .with_flags(FLAG_WARNING | FLAG_CUSTOM_PAYLOAD);
        let mut buf = encoded(&frame);

        let decoded = match Frame::decode(&mut buf).unwrap() {
            Decoded::Frame(f) => f,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(decoded, frame);
        assert!(decoded.is_push());
        assert!(decoded.has_warnings());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_reports_missing_header_bytes() {
        let mut buf = BytesMut::from(&[0x84, 0x00, 0x00][..]);
        assert_eq!(Frame::decode(&mut buf).unwrap(), Decoded::NeedMoreData(6));
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn test_decode_reports_missing_body_bytes() {
        let frame = Frame::response(4, 3, Opcode::Result, Bytes::from(vec![0u8; 20]));
        let full = encoded(&frame);
        let mut partial = BytesMut::from(&full[..15]);

        assert_eq!(Frame::decode(&mut partial).unwrap(), Decoded::NeedMoreData(14));
        assert_eq!(partial.len(), 15);

        partial.extend_from_slice(&full[15..]);
        assert!(matches!(Frame::decode(&mut partial).unwrap(), Decoded::Frame(_)));
    }

    #[test]
    fn test_decode_leaves_following_frame_in_buffer() {
        let first = Frame::response(4, 1, Opcode::Ready, Bytes::new());
        let second = Frame::response(4, 2, Opcode::Result, Bytes::from_static(b"x"));
        let mut buf = encoded(&first);
        buf.extend_from_slice(&encoded(&second));

        match Frame::decode(&mut buf).unwrap() {
            Decoded::Frame(f) => assert_eq!(f.stream, 1),
            other => panic!("unexpected {other:?}"),
        }
        match Frame::decode(&mut buf).unwrap() {
            Decoded::Frame(f) => assert_eq!(f.stream, 2),
            other => panic!("unexpected {other:?}"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_unknown_opcode_is_consumed_and_reported() {
        let frame = Frame::response(4, 5, Opcode::Unknown(0x42), Bytes::from_static(b"zz"));
        let mut buf = encoded(&frame);
        buf.extend_from_slice(&encoded(&Frame::response(4, 6, Opcode::Ready, Bytes::new())));

        let err = Frame::decode(&mut buf).unwrap_err();
        assert_eq!(
            err,
            DriverError::UnsupportedFrame {
                opcode: 0x42,
                stream: 5
            }
        );
        match Frame::decode(&mut buf).unwrap() {
            Decoded::Frame(f) => assert_eq!(f.stream, 6),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_oversized_body_rejected() {
        let mut buf = BytesMut::from(&[0x84, 0x00, 0x00, 0x01, 0x08, 0x7F, 0xFF, 0xFF, 0xFF][..]);
        assert!(matches!(
            Frame::decode(&mut buf),
            Err(DriverError::Protocol(_))
        ));
    }

    #[test]
    fn test_wire_size() {
        let frame = Frame::request(4, 0, Opcode::Options, Bytes::new());
        assert_eq!(frame.wire_size(), 9);
        assert_eq!(encoded(&frame).len(), 9);
    }
}
