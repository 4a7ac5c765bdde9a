//! Reading a bundle back from its part files.
//!
//! [`PartReader`] streams the parts in index order as one byte stream and
//! checks each part's size and SHA-1 as its last byte goes by, so a corrupt
//! part fails the read before anything after it is delivered.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};

use super::BundlePart;
use crate::digest::Sha1Digest;
use crate::error::{IntegrityFailure, IntegritySubject};
use crate::{Error, Result};

struct OpenPart {
    file: File,
    hasher: Sha1,
    read: u64,
}

/// Reads on-disk parts back as one concatenated stream.
///
/// Each part's size and SHA-1 are checked as soon as the part has been read
/// in full. A mismatch surfaces as an [`io::Error`] wrapping
/// [`Error::Integrity`], which [`Error::from_io`] unwraps.
pub struct PartReader {
    dir: PathBuf,
    parts: Vec<BundlePart>,
    next: usize,
    current: Option<OpenPart>,
}

impl PartReader {
    /// Prepares to read `parts` from `dir`, looked up by file name.
    ///
    /// Fails with [`Error::InvalidManifest`] if the indices are not
    /// contiguous from 0, and with a `NotFound` I/O error naming the first
    /// missing file.
    pub fn new(dir: impl AsRef<Path>, parts: &[BundlePart]) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        for (position, part) in parts.iter().enumerate() {
            if part.index as usize != position {
                return Err(Error::InvalidManifest(format!(
                    "part at position {position} has index {}",
                    part.index
                )));
            }
            let path = dir.join(part.filename());
            if !path.is_file() {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("part {} not found", path.display()),
                )));
            }
        }
        Ok(Self {
            dir,
            parts: parts.to_vec(),
            next: 0,
            current: None,
        })
    }

    /// Total bytes the parts should add up to.
    pub fn total_size(&self) -> u64 {
        self.parts.iter().map(|p| p.size).sum()
    }

    fn open_next(&mut self) -> io::Result<bool> {
        let Some(part) = self.parts.get(self.next) else {
            return Ok(false);
        };
        let file = File::open(self.dir.join(part.filename()))?;
        self.current = Some(OpenPart {
            file,
            hasher: Sha1::new(),
            read: 0,
        });
        Ok(true)
    }

    fn verify(&self, part: &BundlePart, open: OpenPart) -> io::Result<()> {
        if open.read != part.size {
            return Err(mismatch(
                IntegritySubject::PartSize { index: part.index },
                part.size.to_string(),
                open.read.to_string(),
            ));
        }
        let digest = Sha1Digest::from(open.hasher);
        if digest != part.digest {
            return Err(mismatch(
                IntegritySubject::PartDigest { index: part.index },
                part.digest.to_string(),
                digest.to_string(),
            ));
        }
        log::debug!("verified part {} ({} bytes)", part.filename(), part.size);
        Ok(())
    }
}

fn mismatch(subject: IntegritySubject, expected: String, actual: String) -> io::Error {
    log::error!("{subject} mismatch: expected {expected}, got {actual}");
    Error::from(IntegrityFailure::new(subject, expected, Some(actual))).into_io()
}

impl Read for PartReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.current.is_none() && !self.open_next()? {
                return Ok(0);
            }
            let part = &self.parts[self.next];
            let Some(open) = self.current.as_mut() else {
                continue;
            };
            let n = open.file.read(buf)?;
            if n > 0 {
                open.read += n as u64;
                if open.read > part.size {
                    return Err(mismatch(
                        IntegritySubject::PartSize { index: part.index },
                        part.size.to_string(),
                        format!("at least {}", open.read),
                    ));
                }
                open.hasher.update(&buf[..n]);
                return Ok(n);
            }

            let part = part.clone();
            if let Some(open) = self.current.take() {
                self.verify(&part, open)?;
            }
            self.next += 1;
        }
    }
}

impl std::fmt::Debug for PartReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartReader")
            .field("dir", &self.dir)
            .field("parts", &self.parts.len())
            .field("next", &self.next)
            .finish_non_exhaustive()
    }
}
