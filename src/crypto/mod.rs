//! AES-128-CBC streaming cipher for the native cipher stage.
//!
//! The output format is the one `openssl enc -aes-128-cbc -K <key> -iv <iv>`
//! produces: raw CBC ciphertext with PKCS#7 padding and no salt header, so
//! bundles written natively can be decrypted by the external tool and vice
//! versa.

mod context;

use std::io::{self, Read, Write};

use aes::Aes128;
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use zeroize::Zeroizing;

use crate::copy::read_chunk;

pub use context::{EncryptionAlgorithm, EncryptionContext};

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;

fn bad_decrypt(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("bad decrypt: {msg}"))
}

/// Encrypting writer.
///
/// Complete blocks are encrypted and forwarded on every `write`; at most 15
/// plaintext bytes are held back. [`finish`](Self::finish) pads and writes
/// the final block.
pub struct Aes128CbcEncoder<W> {
    inner: W,
    buffer: Vec<u8>,
    key: Zeroizing<[u8; 16]>,
    iv: [u8; 16],
}

impl<W> std::fmt::Debug for Aes128CbcEncoder<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aes128CbcEncoder").finish_non_exhaustive()
    }
}

impl<W: Write> Aes128CbcEncoder<W> {
    /// Creates an encoder writing ciphertext to `output`.
    pub fn new(output: W, ctx: &EncryptionContext) -> Self {
        Self {
            inner: output,
            buffer: Vec::with_capacity(BLOCK_SIZE),
            key: Zeroizing::new(*ctx.key()),
            iv: *ctx.iv(),
        }
    }

    fn encrypt_complete_blocks(&mut self) -> io::Result<()> {
        let complete = (self.buffer.len() / BLOCK_SIZE) * BLOCK_SIZE;
        if complete == 0 {
            return Ok(());
        }

        let encryptor = Aes128CbcEnc::new(&(*self.key).into(), &self.iv.into());
        let encrypted = encryptor
            .encrypt_padded_mut::<NoPadding>(&mut self.buffer[..complete], complete)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        self.inner.write_all(encrypted)?;

        // CBC chaining continues from the last ciphertext block.
        self.iv
            .copy_from_slice(&self.buffer[complete - BLOCK_SIZE..complete]);
        self.buffer.drain(..complete);
        Ok(())
    }

    /// Pads and encrypts the final block, returning the inner writer.
    pub fn finish(mut self) -> io::Result<W> {
        self.encrypt_complete_blocks()?;

        let pad_len = BLOCK_SIZE - self.buffer.len();
        self.buffer.extend(std::iter::repeat_n(pad_len as u8, pad_len));
        self.encrypt_complete_blocks()?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for Aes128CbcEncoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        self.encrypt_complete_blocks()?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Decrypting reader.
///
/// The last ciphertext block is held back until end of input so its PKCS#7
/// padding can be checked and stripped. A bad pad or a ciphertext length
/// that is not a whole number of blocks is reported as
/// [`io::ErrorKind::InvalidData`].
pub struct Aes128CbcDecoder<R> {
    inner: R,
    key: Zeroizing<[u8; 16]>,
    iv: [u8; 16],
    chunk_size: usize,
    pending: Vec<u8>,
    plain: Vec<u8>,
    pos: usize,
    finished: bool,
}

impl<R> std::fmt::Debug for Aes128CbcDecoder<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aes128CbcDecoder")
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl<R: Read> Aes128CbcDecoder<R> {
    /// Creates a decoder reading ciphertext from `input` in `chunk_size` reads.
    pub fn new(input: R, ctx: &EncryptionContext, chunk_size: usize) -> Self {
        Self {
            inner: input,
            key: Zeroizing::new(*ctx.key()),
            iv: *ctx.iv(),
            chunk_size: chunk_size.max(BLOCK_SIZE),
            pending: Vec::new(),
            plain: Vec::new(),
            pos: 0,
            finished: false,
        }
    }

    fn decrypt_blocks(&mut self, len: usize) -> io::Result<()> {
        let mut blocks: Vec<u8> = self.pending.drain(..len).collect();
        let next_iv: [u8; 16] = blocks[len - BLOCK_SIZE..]
            .try_into()
            .map_err(|_| bad_decrypt("block split"))?;
        let decryptor = Aes128CbcDec::new(&(*self.key).into(), &self.iv.into());
        let plain = decryptor
            .decrypt_padded_mut::<NoPadding>(&mut blocks)
            .map_err(|e| bad_decrypt(&e.to_string()))?;
        self.plain.clear();
        self.plain.extend_from_slice(plain);
        self.pos = 0;
        self.iv = next_iv;
        Ok(())
    }

    fn refill(&mut self) -> io::Result<()> {
        let mut chunk = vec![0u8; self.chunk_size];
        loop {
            let n = read_chunk(&mut self.inner, &mut chunk)?;
            if n == 0 {
                return self.finish_stream();
            }
            self.pending.extend_from_slice(&chunk[..n]);
            // Everything but the final block, which may carry the padding.
            let ready = ((self.pending.len() - 1) / BLOCK_SIZE) * BLOCK_SIZE;
            if ready > 0 {
                return self.decrypt_blocks(ready);
            }
        }
    }

    fn finish_stream(&mut self) -> io::Result<()> {
        self.finished = true;
        if self.pending.len() != BLOCK_SIZE {
            return Err(bad_decrypt(&format!(
                "incomplete final block ({} bytes)",
                self.pending.len()
            )));
        }
        self.decrypt_blocks(BLOCK_SIZE)?;

        let pad = self.plain[BLOCK_SIZE - 1] as usize;
        let valid = (1..=BLOCK_SIZE).contains(&pad)
            && self.plain[BLOCK_SIZE - pad..]
                .iter()
                .all(|&b| b as usize == pad);
        if !valid {
            self.plain.clear();
            return Err(bad_decrypt("invalid padding"));
        }
        self.plain.truncate(BLOCK_SIZE - pad);
        Ok(())
    }
}

impl<R: Read> Read for Aes128CbcDecoder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.plain.len() {
            if self.finished {
                return Ok(0);
            }
            self.refill()?;
        }
        let n = buf.len().min(self.plain.len() - self.pos);
        buf[..n].copy_from_slice(&self.plain[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
