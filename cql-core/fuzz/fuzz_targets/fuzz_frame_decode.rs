#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;

use cql_core::protocol::{Decoded, Frame};

fuzz_target!(|data: &[u8]| {
    let mut buf = BytesMut::from(data);

    while !buf.is_empty() {
        match Frame::decode(&mut buf) {
            Ok(Decoded::Frame(frame)) => {
                let _ = frame.is_push();
                let _ = frame.has_warnings();
                let _ = frame.wire_size();
            }
            Ok(Decoded::NeedMoreData(_)) => break,
            Err(cql_core::DriverError::UnsupportedFrame { .. }) => continue,
            Err(_) => break,
        }
    }
});
