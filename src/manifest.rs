//! The record a bundle is described by.
//!
//! [`BundleManifest`] carries exactly the fields an external manifest format
//! needs from the pipeline: the ordered part list, image size and digest,
//! bundled size, and the algorithm identifiers. Serializing it is the
//! caller's business.

use std::fs::File;
use std::path::Path;

use crate::crypto::EncryptionAlgorithm;
use crate::digest::{DigestAlgorithm, Sha1Digest};
use crate::error::{IntegrityFailure, IntegritySubject};
use crate::part::BundlePart;
use crate::{Error, Result};

/// Description of a finished bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleManifest {
    /// Name of the archived image entry.
    pub image_name: String,
    /// Size of the raw image in bytes.
    pub image_size: u64,
    /// Total size of the compressed and encrypted stream.
    pub bundled_size: u64,
    /// SHA-1 of the archive stream before compression.
    pub image_digest: Sha1Digest,
    /// Algorithm of every digest in the manifest.
    pub digest_algorithm: DigestAlgorithm,
    /// Cipher the bundle was encrypted with.
    pub encryption_algorithm: EncryptionAlgorithm,
    /// Parts in index order.
    pub parts: Vec<BundlePart>,
}

impl BundleManifest {
    /// Checks that indices run 0, 1, 2, ... and the part sizes add up to
    /// `bundled_size`.
    pub fn validate(&self) -> Result<()> {
        if self.parts.is_empty() {
            return Err(Error::InvalidManifest("no parts".into()));
        }
        for (position, part) in self.parts.iter().enumerate() {
            if part.index as usize != position {
                return Err(Error::InvalidManifest(format!(
                    "expected part {position}, found part {}",
                    part.index
                )));
            }
            if part.digest_algorithm != self.digest_algorithm {
                return Err(Error::InvalidManifest(format!(
                    "part {} uses {}, manifest uses {}",
                    part.index, part.digest_algorithm, self.digest_algorithm
                )));
            }
        }
        let total: u64 = self.parts.iter().map(|p| p.size).sum();
        if total != self.bundled_size {
            return Err(Error::InvalidManifest(format!(
                "parts add up to {total} bytes, bundled size is {}",
                self.bundled_size
            )));
        }
        Ok(())
    }

    /// Re-hashes every part found in `dir` and compares it with the record.
    ///
    /// Stops at the first part whose size or digest differs.
    pub fn verify_parts(&self, dir: impl AsRef<Path>) -> Result<()> {
        self.validate()?;
        let dir = dir.as_ref();
        for part in &self.parts {
            let path = dir.join(part.filename());
            let size = path.metadata()?.len();
            if size != part.size {
                return Err(IntegrityFailure::new(
                    IntegritySubject::PartSize { index: part.index },
                    part.size.to_string(),
                    Some(size.to_string()),
                )
                .into());
            }
            let digest = Sha1Digest::compute_reader(&mut File::open(&path)?, 64 * 1024)?;
            if digest != part.digest {
                return Err(IntegrityFailure::new(
                    IntegritySubject::PartDigest { index: part.index },
                    part.digest.to_string(),
                    Some(digest.to_string()),
                )
                .into());
            }
        }
        log::debug!("verified {} parts in {}", self.parts.len(), dir.display());
        Ok(())
    }

    /// File names of the parts in order.
    pub fn part_filenames(&self) -> Vec<String> {
        self.parts.iter().map(BundlePart::filename).collect()
    }
}
