// Copyright (c) 2026 Myco
// Licensed under the Apache License, Version 2.0

#![no_main]
#![forbid(unsafe_code)]

use libfuzzer_sys::fuzz_target;
use myco::core::types::NodeId;
use myco::core::wire::channel::SecureChannel;
use myco::core::wire::frame::{RawFrame, FRAME_LEN};

// A channel with a fixed, known key fuzzing arbitrary 1024-byte datagrams
// through open(): AEAD tag checks, header validation, and replay-window
// bookkeeping must all reject cleanly, never panic.
fuzz_target!(|data: &[u8]| {
    if data.len() != FRAME_LEN {
        return;
    }
    let mut bytes = [0u8; FRAME_LEN];
    bytes.copy_from_slice(data);
    let frame = RawFrame(bytes);

    let local = NodeId::from_bytes([1; 32]);
    let remote = NodeId::from_bytes([2; 32]);
    let Ok(mut channel) = SecureChannel::new(local, remote, b"fuzz-psk", 1) else {
        return;
    };
    let _ = channel.open(&frame);
});
