#![no_main]

use bytes::Bytes;
use libfuzzer_sys::fuzz_target;

use cql_core::protocol::response::{parse_error, parse_supported};
use cql_core::protocol::ServerEvent;

fuzz_target!(|data: &[u8]| {
    let body = Bytes::copy_from_slice(data);
    let _ = parse_error(body.clone());
    let _ = ServerEvent::parse(body.clone());
    let _ = parse_supported(body);
});
