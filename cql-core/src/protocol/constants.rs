//! Protocol constants for the CQL native protocol (v3/v4 framing).

/// Size of the fixed frame header in bytes.
pub const FRAME_HEADER_SIZE: usize = 9;

/// Bit set in the version byte of every response frame.
pub const RESPONSE_DIRECTION_BIT: u8 = 0x80;

/// Mask extracting the protocol version from the version byte.
pub const VERSION_MASK: u8 = 0x7F;

/// Largest body length accepted by the decoder (256 MiB).
pub const MAX_BODY_LENGTH: usize = 256 * 1024 * 1024;

/// Number of usable stream ids per connection in protocol v3 and later.
pub const MAX_STREAM_IDS: usize = 32768;

/// Stream id used by the server for pushed EVENT frames.
pub const EVENT_STREAM_ID: i16 = -1;

/// Frame body is compressed.
pub const FLAG_COMPRESSION: u8 = 0x01;
/// Tracing requested or tracing id present.
pub const FLAG_TRACING: u8 = 0x02;
/// Custom payload present.
pub const FLAG_CUSTOM_PAYLOAD: u8 = 0x04;
/// Warnings present in a response.
pub const FLAG_WARNING: u8 = 0x08;
/// Beta protocol version in use.
pub const FLAG_USE_BETA: u8 = 0x10;

/// `ERROR` opcode.
pub const OPCODE_ERROR: u8 = 0x00;
/// `STARTUP` opcode.
pub const OPCODE_STARTUP: u8 = 0x01;
/// `READY` opcode.
pub const OPCODE_READY: u8 = 0x02;
/// `AUTHENTICATE` opcode.
pub const OPCODE_AUTHENTICATE: u8 = 0x03;
/// `OPTIONS` opcode.
pub const OPCODE_OPTIONS: u8 = 0x05;
/// `SUPPORTED` opcode.
pub const OPCODE_SUPPORTED: u8 = 0x06;
/// `QUERY` opcode.
pub const OPCODE_QUERY: u8 = 0x07;
/// `RESULT` opcode.
pub const OPCODE_RESULT: u8 = 0x08;
/// `PREPARE` opcode.
pub const OPCODE_PREPARE: u8 = 0x09;
/// `EXECUTE` opcode.
pub const OPCODE_EXECUTE: u8 = 0x0A;
/// `REGISTER` opcode.
pub const OPCODE_REGISTER: u8 = 0x0B;
/// `EVENT` opcode.
pub const OPCODE_EVENT: u8 = 0x0C;
/// `BATCH` opcode.
pub const OPCODE_BATCH: u8 = 0x0D;
/// `AUTH_CHALLENGE` opcode.
pub const OPCODE_AUTH_CHALLENGE: u8 = 0x0E;
/// `AUTH_RESPONSE` opcode.
pub const OPCODE_AUTH_RESPONSE: u8 = 0x0F;
/// `AUTH_SUCCESS` opcode.
pub const OPCODE_AUTH_SUCCESS: u8 = 0x10;

/// Key of the mandatory STARTUP option.
pub const STARTUP_CQL_VERSION_KEY: &str = "CQL_VERSION";
/// CQL language version announced in STARTUP.
pub const STARTUP_CQL_VERSION: &str = "3.0.0";

/// Topology change push event name.
pub const EVENT_TOPOLOGY_CHANGE: &str = "TOPOLOGY_CHANGE";
/// Status change push event name.
pub const EVENT_STATUS_CHANGE: &str = "STATUS_CHANGE";
/// Schema change push event name.
pub const EVENT_SCHEMA_CHANGE: &str = "SCHEMA_CHANGE";
