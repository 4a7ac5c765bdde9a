//! Single-entry archive container for raw images.
//!
//! [`Archiver`] wraps one image stream in a tar container (GNU header,
//! regular file, mode 0644, mtime 0) so that the image name and size travel
//! with the bytes. [`Extractor`] reverses it, yielding the first entry and
//! ignoring anything after it.

use std::io::{self, Read, Write};
use std::path::Path;

use crate::copy::copy_chunked;
use crate::{Error, Result};

/// Entry name used when the caller supplies a name without a file component.
pub const FALLBACK_ENTRY_NAME: &str = "image";

/// Wraps an image stream in a single-entry tar container.
#[derive(Debug, Clone)]
pub struct Archiver {
    chunk_size: usize,
    strict: bool,
}

impl Archiver {
    /// Creates an archiver.
    ///
    /// With `strict` set, a source that ends before its declared size is an
    /// error; otherwise the stage stops quietly and leaves detection to the
    /// downstream digest and size checks.
    pub fn new(chunk_size: usize, strict: bool) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            strict,
        }
    }

    /// Writes a container holding exactly `size` bytes of `source` to `sink`.
    ///
    /// Bytes beyond `size` are not read. Both streams are dropped on return.
    pub fn archive<R, W>(&self, name: &str, size: u64, source: R, sink: W) -> Result<()>
    where
        R: Read,
        W: Write,
    {
        let entry_name = entry_name(name);
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(size);
        header.set_mode(0o644);
        header.set_mtime(0);

        let mut body = ExactReader {
            inner: source,
            remaining: size,
            chunk_size: self.chunk_size,
        };
        let mut builder = tar::Builder::new(sink);
        match builder.append_data(&mut header, entry_name, &mut body) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof && !self.strict => {
                log::warn!(
                    "image source ended {} bytes short of its declared {size} bytes",
                    body.remaining
                );
                return Ok(());
            }
            Err(e) => return Err(Error::from_io(e)),
        }
        let mut sink = builder.into_inner()?;
        sink.flush()?;
        log::debug!("archived {size} bytes as '{entry_name}'");
        Ok(())
    }
}

pub(crate) fn entry_name(name: &str) -> &str {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .unwrap_or(FALLBACK_ENTRY_NAME)
}

/// Yields exactly `remaining` bytes, failing if the source ends early.
struct ExactReader<R> {
    inner: R,
    remaining: u64,
    chunk_size: usize,
}

impl<R: Read> Read for ExactReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(self.remaining).min(self.chunk_size as u64) as usize;
        let n = self.inner.read(&mut buf[..want])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("image source ended with {} bytes outstanding", self.remaining),
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// Reads the first entry out of a tar container.
#[derive(Debug, Clone)]
pub struct Extractor {
    chunk_size: usize,
}

impl Extractor {
    /// Creates an extractor.
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    /// Copies the first entry of `source` into `dest` and returns its name.
    ///
    /// Further entries are ignored, but the rest of `source` is still read
    /// to its end so an upstream digester observes the whole stream. `dest`
    /// is closed before draining begins.
    pub fn extract<R, W>(&self, source: R, mut dest: W) -> Result<String>
    where
        R: Read,
        W: Write,
    {
        let mut archive = tar::Archive::new(source);
        let name = {
            let mut entries = archive.entries().map_err(malformed)?;
            let mut entry = match entries.next() {
                Some(entry) => entry.map_err(malformed)?,
                None => {
                    return Err(Error::MalformedArchive(
                        "archive contains no entry".into(),
                    ));
                }
            };
            let name = entry
                .path()
                .map_err(malformed)?
                .to_string_lossy()
                .into_owned();
            let declared = entry.size();
            let copied = copy_chunked(&mut entry, &mut dest, self.chunk_size)?;
            if copied != declared {
                return Err(Error::MalformedArchive(format!(
                    "entry '{name}' truncated: {copied} of {declared} bytes"
                )));
            }
            dest.flush()?;
            name
        };
        drop(dest);

        let mut rest = archive.into_inner();
        let trailing = copy_chunked(&mut rest, &mut io::sink(), self.chunk_size)?;
        log::debug!("extracted '{name}', drained {trailing} trailing bytes");
        Ok(name)
    }
}

fn malformed(err: io::Error) -> Error {
    match Error::from_io(err) {
        Error::Io(e) if e.kind() == io::ErrorKind::BrokenPipe => Error::Io(e),
        Error::Io(e) => Error::MalformedArchive(e.to_string()),
        other => other,
    }
}
