//! SHA-1 digests and the relaying digester stage.
//!
//! Every digest the pipeline exchanges is a 160-bit SHA-1 value rendered as
//! 40 lowercase hex characters. Two of them matter: the whole-image digest,
//! computed by [`ByteDigester`] on the archive stream, and one digest per
//! on-disk part.
//!
//! # Example
//!
//! ```rust
//! use imgbundle::digest::Sha1Digest;
//!
//! let digest = Sha1Digest::compute(b"");
//! assert_eq!(digest.to_string(), "da39a3ee5e6b4b0d3255bfef95601890afd80709");
//!
//! let parsed: Sha1Digest = "0xDA39A3EE5E6B4B0D3255BFEF95601890AFD80709".parse().unwrap();
//! assert_eq!(parsed, digest);
//! ```

use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use crossbeam_channel::Sender;
use sha1::{Digest as _, Sha1};

use crate::copy::read_chunk;
use crate::{Error, Result};

/// Digest algorithm identifier recorded in manifests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DigestAlgorithm {
    /// SHA-1, the only algorithm bundles use.
    #[default]
    Sha1,
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha1 => write!(f, "SHA1"),
        }
    }
}

impl FromStr for DigestAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("sha1") || s.eq_ignore_ascii_case("sha-1") {
            Ok(Self::Sha1)
        } else {
            Err(Error::InvalidDigest(format!("unsupported algorithm '{s}'")))
        }
    }
}

/// A SHA-1 digest value.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sha1Digest([u8; 20]);

impl Sha1Digest {
    /// Wraps raw digest bytes.
    pub const fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Returns the raw digest bytes.
    pub const fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Computes the digest of a byte slice.
    pub fn compute(data: &[u8]) -> Self {
        Self(Sha1::digest(data).into())
    }

    /// Computes the digest of everything `reader` yields.
    pub fn compute_reader<R: Read>(reader: &mut R, chunk_size: usize) -> io::Result<Self> {
        let mut hasher = Sha1::new();
        let mut buf = vec![0u8; chunk_size.max(1)];
        loop {
            let n = read_chunk(reader, &mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Self(hasher.finalize().into()))
    }

    /// Returns the 40-character lowercase hex form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<Sha1> for Sha1Digest {
    fn from(hasher: Sha1) -> Self {
        Self(hasher.finalize().into())
    }
}

impl fmt::Display for Sha1Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Sha1Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha1Digest({})", self.to_hex())
    }
}

impl FromStr for Sha1Digest {
    type Err = Error;

    /// Parses 40 hex characters, in either case, with an optional `0x`.
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        let hex_part = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        if hex_part.len() != 40 {
            return Err(Error::InvalidDigest(format!(
                "expected 40 hex characters, got {}",
                hex_part.len()
            )));
        }
        let mut bytes = [0u8; 20];
        hex::decode_to_slice(hex_part, &mut bytes)
            .map_err(|e| Error::InvalidDigest(e.to_string()))?;
        Ok(Self(bytes))
    }
}

/// Relays a byte stream unchanged while computing its SHA-1.
///
/// Holds at most one chunk at a time, so a slow sink stalls the source
/// instead of growing memory.
#[derive(Debug, Clone)]
pub struct ByteDigester {
    chunk_size: usize,
}

impl ByteDigester {
    /// Creates a digester that moves `chunk_size` bytes per read.
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    /// Copies `source` into `sink` and sends the digest once `source` ends.
    ///
    /// The source, sink, and sender are all dropped on return, which closes
    /// the underlying pipe ends. No digest is sent if copying fails.
    pub fn relay<R, W>(
        &self,
        mut source: R,
        mut sink: W,
        digest_out: Sender<Sha1Digest>,
    ) -> Result<()>
    where
        R: Read,
        W: Write,
    {
        let mut hasher = Sha1::new();
        let mut buf = vec![0u8; self.chunk_size];
        let mut total = 0u64;
        loop {
            let n = read_chunk(&mut source, &mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            sink.write_all(&buf[..n])?;
            total += n as u64;
        }
        sink.flush()?;
        drop(sink);

        let digest = Sha1Digest::from(hasher);
        log::debug!("digested {total} bytes: {digest}");
        // A dropped receiver means nobody asked for the value.
        let _ = digest_out.send(digest);
        Ok(())
    }
}

#[derive(Default)]
struct TapState {
    hasher: Sha1,
    bytes: u64,
}

/// A reader adapter that hashes and counts everything read through it.
///
/// The running totals are shared with a [`DigestTap`], so the reader can be
/// moved into a stage thread while the caller keeps the tap.
pub struct DigestReader<R> {
    inner: R,
    state: Arc<Mutex<TapState>>,
}

/// Read-only handle on a [`DigestReader`]'s running totals.
#[derive(Clone)]
pub struct DigestTap {
    state: Arc<Mutex<TapState>>,
}

impl<R> DigestReader<R> {
    /// Wraps `inner`.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            state: Arc::new(Mutex::new(TapState::default())),
        }
    }

    /// Returns a handle on the running totals.
    pub fn tap(&self) -> DigestTap {
        DigestTap {
            state: Arc::clone(&self.state),
        }
    }
}

impl<R: Read> Read for DigestReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.hasher.update(&buf[..n]);
        state.bytes += n as u64;
        Ok(n)
    }
}

impl DigestTap {
    /// Bytes read so far.
    pub fn bytes(&self) -> u64 {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .bytes
    }

    /// Digest of the bytes read so far.
    pub fn digest(&self) -> Sha1Digest {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Sha1Digest::from(state.hasher.clone())
    }
}

impl fmt::Debug for DigestTap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DigestTap")
            .field("bytes", &self.bytes())
            .finish_non_exhaustive()
    }
}

/// A writer adapter that hashes and counts everything written through it.
pub struct DigestWriter<W> {
    inner: W,
    hasher: Sha1,
    bytes: u64,
}

impl<W> DigestWriter<W> {
    /// Wraps `inner`.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha1::new(),
            bytes: 0,
        }
    }

    /// Bytes written so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }

    /// Digest of the bytes written so far.
    pub fn digest(&self) -> Sha1Digest {
        Sha1Digest::from(self.hasher.clone())
    }

    /// Consumes the adapter, returning the inner writer.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W> fmt::Debug for DigestWriter<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DigestWriter")
            .field("bytes", &self.bytes)
            .finish_non_exhaustive()
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
