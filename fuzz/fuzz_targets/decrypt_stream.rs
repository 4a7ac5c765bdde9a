//! Fuzz target for the AES-128-CBC decoder.
//!
//! The first 32 bytes of the input are the key and IV; the rest is the
//! ciphertext. Bad padding and truncated blocks must surface as errors.
//!
//! Run with: cargo +nightly fuzz run decrypt_stream

#![no_main]

use libfuzzer_sys::fuzz_target;
use std::io::{Cursor, Read};

fuzz_target!(|data: &[u8]| {
    if data.len() < 32 {
        return;
    }
    let (material, ciphertext) = data.split_at(32);
    let mut key = [0u8; 16];
    let mut iv = [0u8; 16];
    key.copy_from_slice(&material[..16]);
    iv.copy_from_slice(&material[16..]);
    let ctx = imgbundle::EncryptionContext::new(key, iv);

    let chunk_size = 1 + (ciphertext.first().copied().unwrap_or(0) as usize);
    let mut decoder =
        imgbundle::crypto::Aes128CbcDecoder::new(Cursor::new(ciphertext), &ctx, chunk_size);
    let mut plain = Vec::new();
    if decoder.read_to_end(&mut plain).is_ok() {
        assert!(plain.len() < ciphertext.len());
        assert_eq!(ciphertext.len() % 16, 0);
    }
});
