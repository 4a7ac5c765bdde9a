//! Splitting a bundle stream into numbered, individually digested parts.
//!
//! [`PartWriter`] turns one byte stream into `{prefix}.part.00`,
//! `{prefix}.part.01`, ... files of `part_size` bytes each (the last one
//! shorter) and yields a [`BundlePart`] record for every completed file.
//! [`fittings`] holds the consumers that collect, delete, and throttle
//! those records; [`PartReader`] concatenates parts back into a stream.

mod fittings;
mod reader;

pub use fittings::{
    PartGate, PartPermit, aggregate, delete_parts, spawn_aggregator, spawn_deleter,
    spawn_part_writer,
};
pub use reader::PartReader;

use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::{Error, Result};
use crate::copy::read_chunk;
use crate::digest::{DigestAlgorithm, DigestWriter, Sha1Digest};

/// One completed part of a bundle.
///
/// Immutable once emitted. Indices start at 0 and are contiguous.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundlePart {
    /// Position of the part in the bundle stream.
    pub index: u32,
    /// Where the part was written.
    pub path: PathBuf,
    /// SHA-1 of the part's bytes as stored on disk.
    pub digest: Sha1Digest,
    /// Always [`DigestAlgorithm::Sha1`].
    pub digest_algorithm: DigestAlgorithm,
    /// Byte count of the part.
    pub size: u64,
}

impl BundlePart {
    /// File name of the part, as recorded in manifests.
    pub fn filename(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Returns the path of part `index`: `{prefix}.part.{index:02}`.
///
/// ```rust
/// use imgbundle::part::part_path;
///
/// assert_eq!(part_path("out/disk.img", 3).to_str(), Some("out/disk.img.part.03"));
/// assert_eq!(part_path("disk", 123).to_str(), Some("disk.part.123"));
/// ```
pub fn part_path(prefix: impl AsRef<Path>, index: u32) -> PathBuf {
    let mut name = prefix.as_ref().as_os_str().to_owned();
    name.push(format!(".part.{index:02}"));
    PathBuf::from(name)
}

/// Splits a stream into part files, one [`BundlePart`] per iteration.
///
/// The sequence ends after the first part shorter than `part_size`. A
/// stream whose length is an exact multiple of `part_size` ends without an
/// empty terminal part, except that an empty stream yields exactly one
/// empty part. A read or write failure yields one `Err`, removes the
/// partially written file, and ends the sequence.
pub struct PartWriter<R> {
    source: R,
    prefix: PathBuf,
    part_size: u64,
    buf: Vec<u8>,
    index: u32,
    done: bool,
    gate: Option<PartGate>,
    stop: Option<Arc<AtomicBool>>,
}

impl<R: Read> PartWriter<R> {
    /// Creates a writer producing parts named after `prefix`.
    pub fn new(source: R, prefix: impl Into<PathBuf>, part_size: u64, chunk_size: usize) -> Self {
        let chunk = (chunk_size.max(1) as u64).min(part_size.max(1)) as usize;
        Self {
            source,
            prefix: prefix.into(),
            part_size: part_size.max(1),
            buf: vec![0u8; chunk],
            index: 0,
            done: false,
            gate: None,
            stop: None,
        }
    }

    /// Acquires a permit from `gate` before starting each part.
    ///
    /// The permit travels with the emitted part; the consumer releases it
    /// with [`PartGate::release`] once it is done with the part.
    pub fn with_gate(mut self, gate: PartGate) -> Self {
        self.gate = Some(gate);
        self
    }

    /// Stops before the next part once `stop` is set.
    pub fn with_stop(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = Some(stop);
        self
    }

    fn stopped(&self) -> bool {
        self.stop.as_ref().is_some_and(|s| s.load(Ordering::Acquire))
    }

    fn write_part(&mut self) -> Result<Option<BundlePart>> {
        // Look ahead one chunk so a stream ending on a part boundary does
        // not leave an empty file behind.
        let first = read_chunk(&mut self.source, &mut self.buf)?;
        if first == 0 && self.index > 0 {
            return Ok(None);
        }

        let path = part_path(&self.prefix, self.index);
        let file = File::create(&path)?;
        let mut out = DigestWriter::new(BufWriter::with_capacity(self.buf.len(), file));
        let written = self.fill(&mut out, first);
        let written = match written.and_then(|n| {
            out.flush()?;
            Ok(n)
        }) {
            Ok(n) => n,
            Err(e) => {
                drop(out);
                abandon(&path);
                return Err(Error::from_io(e));
            }
        };

        if written < self.part_size {
            self.done = true;
        }
        let part = BundlePart {
            index: self.index,
            path,
            digest: out.digest(),
            digest_algorithm: DigestAlgorithm::Sha1,
            size: written,
        };
        log::info!("wrote part {} ({} bytes)", part.filename(), part.size);
        self.index += 1;
        Ok(Some(part))
    }

    /// Copies `first` lookahead bytes plus up to the rest of one part.
    fn fill<W: Write>(&mut self, out: &mut W, first: usize) -> std::io::Result<u64> {
        out.write_all(&self.buf[..first])?;
        let mut written = first as u64;
        if first == 0 {
            return Ok(0);
        }
        while written < self.part_size {
            let want = (self.part_size - written).min(self.buf.len() as u64) as usize;
            let n = read_chunk(&mut self.source, &mut self.buf[..want])?;
            if n == 0 {
                break;
            }
            out.write_all(&self.buf[..n])?;
            written += n as u64;
        }
        Ok(written)
    }
}

fn abandon(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        log::warn!("could not remove incomplete part {}: {e}", path.display());
    }
}

impl<R: Read> Iterator for PartWriter<R> {
    type Item = Result<BundlePart>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.stopped() {
            self.done = true;
            return None;
        }
        let permit = self.gate.as_ref().map(PartGate::acquire);
        match self.write_part() {
            Ok(Some(part)) => {
                if let Some(permit) = permit {
                    permit.hand_off();
                }
                Some(Ok(part))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                log::error!("part {} failed: {e}", self.index);
                Some(Err(e))
            }
        }
    }
}

impl<R> std::fmt::Debug for PartWriter<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartWriter")
            .field("prefix", &self.prefix)
            .field("part_size", &self.part_size)
            .field("index", &self.index)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}
