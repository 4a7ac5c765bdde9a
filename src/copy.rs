//! Chunked copying with a byte ceiling.
//!
//! [`copy_with_limit`] drives the last leg of an unbundle: it pulls the
//! extracted image out of the pipeline and writes it to the caller's
//! destination, enforcing an optional maximum byte count and reporting
//! progress from the calling thread.

use std::io::{self, Read, Write};

use crate::progress::ProgressReporter;
use crate::{Error, Result};

/// Reads into `buf` once, retrying on [`io::ErrorKind::Interrupted`].
pub(crate) fn read_chunk<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match reader.read(buf) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// Copies `reader` into `writer` one chunk at a time.
///
/// Unlike [`io::copy`], the buffer never exceeds `chunk_size`.
pub(crate) fn copy_chunked<R, W>(
    reader: &mut R,
    writer: &mut W,
    chunk_size: usize,
) -> io::Result<u64>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut total = 0u64;
    loop {
        let n = read_chunk(reader, &mut buf)?;
        if n == 0 {
            return Ok(total);
        }
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
}

/// Options for [`copy_with_limit`].
#[derive(Debug, Clone, Copy)]
pub struct CopyLimit {
    /// Bytes per read/write.
    pub chunk_size: usize,
    /// Ceiling on bytes written; `None` is unbounded.
    pub max_bytes: Option<u64>,
    /// Expected byte count reported to the progress callback.
    pub expected_bytes: Option<u64>,
}

impl CopyLimit {
    /// Creates unbounded options with the given chunk size.
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            max_bytes: None,
            expected_bytes: None,
        }
    }

    /// Sets the byte ceiling.
    pub fn max_bytes(mut self, max_bytes: Option<u64>) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Sets the expected byte count.
    pub fn expected_bytes(mut self, expected: Option<u64>) -> Self {
        self.expected_bytes = expected;
        self
    }
}

/// Copies `source` into `dest`, refusing to exceed `limit.max_bytes`.
///
/// Before each write, if the chunk would take the total past the ceiling the
/// copy fails with [`Error::QuotaExceeded`] and the chunk is not written.
/// `source` is consumed and therefore closed on every exit path; `dest` is
/// only borrowed and stays open for the caller to inspect.
///
/// Returns the number of bytes written.
///
/// # Example
///
/// ```rust
/// use imgbundle::copy::{copy_with_limit, CopyLimit};
/// use imgbundle::progress::NoProgress;
/// use imgbundle::Error;
///
/// let mut dest = Vec::new();
/// let limit = CopyLimit::new(64).max_bytes(Some(100));
/// let err = copy_with_limit(&[0u8; 150][..], &mut dest, limit, &mut NoProgress).unwrap_err();
/// assert!(matches!(err, Error::QuotaExceeded { limit: 100, .. }));
/// assert!(dest.len() <= 100);
/// ```
pub fn copy_with_limit<R, W, P>(
    mut source: R,
    dest: &mut W,
    limit: CopyLimit,
    progress: &mut P,
) -> Result<u64>
where
    R: Read,
    W: Write + ?Sized,
    P: ProgressReporter + ?Sized,
{
    let total = limit.expected_bytes.or(limit.max_bytes);
    progress.on_total(total);

    let mut buf = vec![0u8; limit.chunk_size.max(1)];
    let mut written = 0u64;
    loop {
        let n = read_chunk(&mut source, &mut buf).map_err(Error::from_io)?;
        if n == 0 {
            break;
        }
        let attempted = written + n as u64;
        if let Some(max) = limit.max_bytes {
            if attempted > max {
                log::error!("refusing to write past {max} bytes ({attempted} requested)");
                return Err(Error::QuotaExceeded {
                    limit: max,
                    attempted,
                });
            }
        }
        dest.write_all(&buf[..n])?;
        written = attempted;
        progress.on_progress(written, total);
    }
    dest.flush()?;
    Ok(written)
}
