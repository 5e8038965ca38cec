#![no_main]

use libfuzzer_sys::fuzz_target;
use std::net::SocketAddr;

use keel_transport::wire::{frame_payload, FrameKind, Header};

/// Fuzz frame classification and header decoding.
///
/// The decoder must never panic on any input; malformed data is an error.
/// A successful decode must leave a payload slice inside the datagram.
fuzz_target!(|data: &[u8]| {
    let from = SocketAddr::from(([127, 0, 0, 1], 9000));
    if let Some(&flags) = data.first() {
        let _ = FrameKind::from_flags(flags);
    }
    if let Ok(header) = Header::decode(data, from) {
        let payload = frame_payload(data, &header);
        assert!(payload.len() + header.kind.header_len() == data.len());

        let mut buf = Vec::new();
        header.encode(&mut buf);
        assert_eq!(&buf[..], &data[..header.kind.header_len()]);
    }
});
