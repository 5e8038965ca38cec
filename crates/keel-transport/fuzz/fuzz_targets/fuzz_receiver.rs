#![no_main]

use libfuzzer_sys::fuzz_target;
use std::net::SocketAddr;

use keel_transport::pool::BufferPool;
use keel_transport::receiver::IncomingHandler;
use keel_transport::wire::{frame_payload, FrameKind, Header, MTU};

/// Fuzz the incoming reliable handler with arbitrary datagram streams.
///
/// The input is split into MTU-bounded chunks; every chunk that decodes as
/// a reliable frame is fed to the same handler. The handler must never
/// panic and must return every buffer it rented.
fuzz_target!(|data: &[u8]| {
    let from = SocketAddr::from(([127, 0, 0, 1], 9000));
    let pool = BufferPool::new(8);
    let mut rx = IncomingHandler::new(pool.clone());

    for chunk in data.chunks(MTU) {
        let Ok(header) = Header::decode(chunk, from) else {
            continue;
        };
        if header.kind == FrameKind::Reliable {
            let _ = rx.on_slice(&header, frame_payload(chunk, &header));
        }
    }

    drop(rx);
    assert_eq!(pool.outstanding(), 0);
});
