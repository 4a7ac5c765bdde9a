//! Fuzz target for the full unbundle pipeline.
//!
//! Arbitrary bytes are fed in as a bundle stream under a fixed key. Every
//! run must end in a classified error or a clean result, never a hang.
//!
//! Run with: cargo +nightly fuzz run unbundle_stream

#![no_main]

use libfuzzer_sys::fuzz_target;
use std::io::Cursor;

fuzz_target!(|data: &[u8]| {
    let ctx = imgbundle::EncryptionContext::new([0x2b; 16], [0x00; 16]);
    let mut dest = Vec::new();
    let _ = imgbundle::Unbundler::new(ctx)
        .max_bytes(Some(1 << 20))
        .unbundle_stream(Cursor::new(data.to_vec()), &mut dest);
    assert!(dest.len() <= 1 << 20);
});
