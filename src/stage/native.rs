//! In-process implementations of the compression and cipher stages.

use std::io::{BufReader, Read, Write};

use flate2::Compression;
use flate2::bufread::MultiGzDecoder;
use flate2::write::GzEncoder;

use crate::Result;
use crate::copy::copy_chunked;
use crate::crypto::{Aes128CbcDecoder, Aes128CbcEncoder, EncryptionContext};

pub(super) fn gzip<R: Read, W: Write>(
    mut input: R,
    output: W,
    level: u32,
    chunk_size: usize,
) -> Result<()> {
    let mut encoder = GzEncoder::new(output, Compression::new(level.min(9)));
    let n = copy_chunked(&mut input, &mut encoder, chunk_size)?;
    let mut output = encoder.finish()?;
    output.flush()?;
    log::debug!("gzip: compressed {n} bytes");
    Ok(())
}

/// Accepts concatenated members, like `gzip -d`.
pub(super) fn gunzip<R: Read, W: Write>(input: R, mut output: W, chunk_size: usize) -> Result<()> {
    let mut decoder = MultiGzDecoder::new(BufReader::with_capacity(chunk_size.max(1), input));
    let n = copy_chunked(&mut decoder, &mut output, chunk_size)?;
    output.flush()?;
    log::debug!("gzip: decompressed {n} bytes");
    Ok(())
}

pub(super) fn encrypt<R: Read, W: Write>(
    mut input: R,
    output: W,
    ctx: &EncryptionContext,
    chunk_size: usize,
) -> Result<()> {
    let mut encoder = Aes128CbcEncoder::new(output, ctx);
    copy_chunked(&mut input, &mut encoder, chunk_size)?;
    encoder.finish()?;
    Ok(())
}

pub(super) fn decrypt<R: Read, W: Write>(
    input: R,
    mut output: W,
    ctx: &EncryptionContext,
    chunk_size: usize,
) -> Result<()> {
    let mut decoder = Aes128CbcDecoder::new(input, ctx, chunk_size);
    copy_chunked(&mut decoder, &mut output, chunk_size)?;
    output.flush()?;
    Ok(())
}
