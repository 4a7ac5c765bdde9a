//! Fuzz target for the tar extraction stage with arbitrary byte input.
//!
//! Run with: cargo +nightly fuzz run extract_archive

#![no_main]

use libfuzzer_sys::fuzz_target;
use std::io::{Cursor, Write};

/// Refuses to grow past a fixed size so huge declared entries stay cheap.
struct Capped(Vec<u8>);

impl Write for Capped {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.0.len() + buf.len() > 1 << 20 {
            return Err(std::io::Error::other("capped"));
        }
        self.0.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fuzz_target!(|data: &[u8]| {
    let extractor = imgbundle::Extractor::new(512);
    let _ = extractor.extract(Cursor::new(data), Capped(Vec::new()));
});
