//! Primitive body notation of the native protocol and request body builders.
//!
//! Readers consume from a [`Bytes`] cursor and fail with
//! [`DriverError::Protocol`] when the body is truncated.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::constants::*;
use crate::error::{DriverError, Result};

fn ensure(src: &Bytes, needed: usize, what: &str) -> Result<()> {
    if src.remaining() < needed {
        return Err(DriverError::Protocol(format!(
            "truncated {}: need {} bytes, {} left",
            what,
            needed,
            src.remaining()
        )));
    }
    Ok(())
}

/// Reads a `[byte]`.
pub fn read_byte(src: &mut Bytes) -> Result<u8> {
    ensure(src, 1, "byte")?;
    Ok(src.get_u8())
}

/// Reads a `[short]`.
pub fn read_short(src: &mut Bytes) -> Result<u16> {
    ensure(src, 2, "short")?;
    Ok(src.get_u16())
}

/// Reads an `[int]`.
pub fn read_int(src: &mut Bytes) -> Result<i32> {
    ensure(src, 4, "int")?;
    Ok(src.get_i32())
}

/// Reads a `[string]`: a short length followed by UTF-8 bytes.
pub fn read_string(src: &mut Bytes) -> Result<String> {
    let len = read_short(src)? as usize;
    read_utf8(src, len)
}

/// Reads a `[long string]`: an int length followed by UTF-8 bytes.
pub fn read_long_string(src: &mut Bytes) -> Result<String> {
    let len = read_int(src)?;
    if len < 0 {
        return Err(DriverError::Protocol(format!(
            "negative long string length {}",
            len
        )));
    }
    read_utf8(src, len as usize)
}

fn read_utf8(src: &mut Bytes, len: usize) -> Result<String> {
    ensure(src, len, "string")?;
    let raw = src.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|e| DriverError::Protocol(format!("invalid UTF-8 in string: {}", e)))
}

/// Reads a `[string list]`.
pub fn read_string_list(src: &mut Bytes) -> Result<Vec<String>> {
    let count = read_short(src)? as usize;
    (0..count).map(|_| read_string(src)).collect()
}

/// Reads a `[string map]`.
pub fn read_string_map(src: &mut Bytes) -> Result<HashMap<String, String>> {
    let count = read_short(src)? as usize;
    let mut map = HashMap::with_capacity(count);
    for _ in 0..count {
        let key = read_string(src)?;
        let value = read_string(src)?;
        map.insert(key, value);
    }
    Ok(map)
}

/// Reads a `[string multimap]`.
pub fn read_string_multimap(src: &mut Bytes) -> Result<HashMap<String, Vec<String>>> {
    let count = read_short(src)? as usize;
    let mut map = HashMap::with_capacity(count);
    for _ in 0..count {
        let key = read_string(src)?;
        let values = read_string_list(src)?;
        map.insert(key, values);
    }
    Ok(map)
}

/// Reads `[bytes]`; a negative length means null.
pub fn read_bytes(src: &mut Bytes) -> Result<Option<Bytes>> {
    let len = read_int(src)?;
    if len < 0 {
        return Ok(None);
    }
    ensure(src, len as usize, "bytes")?;
    Ok(Some(src.split_to(len as usize)))
}

/// Reads `[short bytes]`.
pub fn read_short_bytes(src: &mut Bytes) -> Result<Bytes> {
    let len = read_short(src)? as usize;
    ensure(src, len, "short bytes")?;
    Ok(src.split_to(len))
}

/// Reads an `[inet]`: address size, address bytes and an int port.
pub fn read_inet(src: &mut Bytes) -> Result<SocketAddr> {
    let size = read_byte(src)? as usize;
    ensure(src, size, "inet address")?;
    let ip = match size {
        4 => {
            let mut octets = [0u8; 4];
            src.copy_to_slice(&mut octets);
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        16 => {
            let mut octets = [0u8; 16];
            src.copy_to_slice(&mut octets);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        other => {
            return Err(DriverError::Protocol(format!(
                "invalid inet address length {}",
                other
            )))
        }
    };
    let port = read_int(src)?;
    let port = u16::try_from(port)
        .map_err(|_| DriverError::Protocol(format!("invalid inet port {}", port)))?;
    Ok(SocketAddr::new(ip, port))
}

/// Writes a `[string]`.
pub fn write_string(dst: &mut BytesMut, value: &str) {
    dst.put_u16(value.len() as u16);
    dst.put_slice(value.as_bytes());
}

/// Writes a `[long string]`.
pub fn write_long_string(dst: &mut BytesMut, value: &str) {
    dst.put_i32(value.len() as i32);
    dst.put_slice(value.as_bytes());
}

/// Writes a `[string list]`.
pub fn write_string_list(dst: &mut BytesMut, values: &[&str]) {
    dst.put_u16(values.len() as u16);
    for value in values {
        write_string(dst, value);
    }
}

/// Writes a `[string map]` with keys in the given order.
pub fn write_string_map(dst: &mut BytesMut, entries: &[(&str, &str)]) {
    dst.put_u16(entries.len() as u16);
    for (key, value) in entries {
        write_string(dst, key);
        write_string(dst, value);
    }
}

/// Writes `[bytes]`; `None` is encoded as null.
pub fn write_bytes(dst: &mut BytesMut, value: Option<&[u8]>) {
    match value {
        Some(bytes) => {
            dst.put_i32(bytes.len() as i32);
            dst.put_slice(bytes);
        }
        None => dst.put_i32(-1),
    }
}

/// Writes an `[inet]`.
pub fn write_inet(dst: &mut BytesMut, address: SocketAddr) {
    match address.ip() {
        IpAddr::V4(ip) => {
            dst.put_u8(4);
            dst.put_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            dst.put_u8(16);
            dst.put_slice(&ip.octets());
        }
    }
    dst.put_i32(address.port() as i32);
}

/// Body of a STARTUP request announcing the CQL version.
pub fn startup_body() -> Bytes {
    let mut buf = BytesMut::new();
    write_string_map(&mut buf, &[(STARTUP_CQL_VERSION_KEY, STARTUP_CQL_VERSION)]);
    buf.freeze()
}

/// Body of a REGISTER request subscribing to the given push events.
pub fn register_body(events: &[&str]) -> Bytes {
    let mut buf = BytesMut::new();
    write_string_list(&mut buf, events);
    buf.freeze()
}

/// Body of an AUTH_RESPONSE request.
pub fn auth_response_body(token: Option<&[u8]>) -> Bytes {
    let mut buf = BytesMut::new();
    write_bytes(&mut buf, token);
    buf.freeze()
}

/// Body of a QUERY request without bound values or paging.
pub fn query_body(query: &str, consistency: u16) -> Bytes {
    let mut buf = BytesMut::with_capacity(query.len() + 7);
    write_long_string(&mut buf, query);
    buf.put_u16(consistency);
    buf.put_u8(0);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_round_trip() {
        let mut buf = BytesMut::new();
        write_string(&mut buf, "hello");
        write_long_string(&mut buf, "world");
        let mut src = buf.freeze();

        assert_eq!(read_string(&mut src).unwrap(), "hello");
        assert_eq!(read_long_string(&mut src).unwrap(), "world");
        assert!(src.is_empty());
    }

    #[test]
    fn test_truncated_string_is_protocol_error() {
        let mut src = Bytes::from_static(&[0x00, 0x05, b'a', b'b']);
        assert!(matches!(read_string(&mut src), Err(DriverError::Protocol(_))));
    }

    #[test]
    fn test_startup_body_layout() {
        let mut body = startup_body();
        let map = read_string_map(&mut body).unwrap();
        assert_eq!(map.get("CQL_VERSION").map(String::as_str), Some("3.0.0"));
    }

    #[test]
    fn test_register_body_lists_events() {
        let mut body = register_body(&[EVENT_TOPOLOGY_CHANGE, EVENT_STATUS_CHANGE]);
        assert_eq!(
            read_string_list(&mut body).unwrap(),
            vec!["TOPOLOGY_CHANGE", "STATUS_CHANGE"]
        );
    }

    #[test]
    fn test_null_bytes() {
        let mut body = auth_response_body(None);
        assert_eq!(read_bytes(&mut body).unwrap(), None);

        let mut body = auth_response_body(Some(b"\0user\0pass"));
        assert_eq!(
            read_bytes(&mut body).unwrap().as_deref(),
            Some(&b"\0user\0pass"[..])
        );
    }

    #[test]
    fn test_inet_v4_and_v6() {
        let v4: SocketAddr = "10.1.2.3:9042".parse().unwrap();
        let v6: SocketAddr = "[::1]:9043".parse().unwrap();
        let mut buf = BytesMut::new();
        write_inet(&mut buf, v4);
        write_inet(&mut buf, v6);
        let mut src = buf.freeze();

        assert_eq!(read_inet(&mut src).unwrap(), v4);
        assert_eq!(read_inet(&mut src).unwrap(), v6);
    }

    #[test]
    fn test_inet_with_bad_length() {
        let mut src = Bytes::from_static(&[3, 1, 2, 3, 0, 0, 0, 1]);
        assert!(read_inet(&mut src).is_err());
    }

    #[test]
    fn test_string_multimap() {
        let mut buf = BytesMut::new();
        buf.put_u16(1);
        write_string(&mut buf, "COMPRESSION");
        write_string_list(&mut buf, &["lz4", "snappy"]);
        let map = read_string_multimap(&mut buf.freeze()).unwrap();
        assert_eq!(map["COMPRESSION"], vec!["lz4", "snappy"]);
    }

    #[test]
    fn test_query_body() {
        let mut body = query_body("SELECT now() FROM system.local", 0x0001);
        assert_eq!(
            read_long_string(&mut body).unwrap(),
            "SELECT now() FROM system.local"
        );
        assert_eq!(read_short(&mut body).unwrap(), 1);
        assert_eq!(read_byte(&mut body).unwrap(), 0);
    }
}
