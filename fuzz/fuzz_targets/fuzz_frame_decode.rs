// Copyright (c) 2026 Myco
// Licensed under the Apache License, Version 2.0

#![no_main]
#![forbid(unsafe_code)]

use libfuzzer_sys::fuzz_target;
use myco::core::wire::frame::RawFrame;

// Untrusted UDP datagrams hit RawFrame::from_datagram before any crypto is
// involved; it must never panic on adversarial input, only return Err.
fuzz_target!(|data: &[u8]| {
    let _ = RawFrame::from_datagram(data);
});
