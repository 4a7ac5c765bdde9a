//! High-level bundle and unbundle drivers.
//!
//! [`Bundler`] turns an image stream into a directory of parts plus a
//! [`BundleManifest`]; [`Unbundler`] turns parts (or any bundle stream) back
//! into the image, checking it against the trusted digest and size.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::fs::File;
//! use imgbundle::{Bundler, EncryptionContext, Unbundler};
//!
//! let ctx = EncryptionContext::generate()?;
//! let image = File::open("disk.img")?;
//! let size = image.metadata()?.len();
//!
//! let result = Bundler::new(ctx.clone(), "bundle/")
//!     .bundle_with(image, "disk.img", size, |part| {
//!         println!("ready to upload {}", part.path.display());
//!         Ok(())
//!     })?;
//!
//! let mut restored = File::create("restored.img")?;
//! Unbundler::new(ctx).unbundle_manifest(&result.manifest, "bundle/", &mut restored)?;
//! # Ok::<(), imgbundle::Error>(())
//! ```

use std::fmt;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::unbounded;

use crate::archive::entry_name;
use crate::config::{IMPORT_SIZE_WARNING, PipelineConfig};
use crate::copy::{CopyLimit, copy_with_limit};
use crate::crypto::EncryptionContext;
use crate::digest::{DigestAlgorithm, DigestReader, DigestWriter, Sha1Digest};
use crate::error::{IntegrityFailure, IntegritySubject};
use crate::manifest::BundleManifest;
use crate::part::{
    BundlePart, PartGate, PartReader, spawn_aggregator, spawn_deleter, spawn_part_writer,
};
use crate::pipeline::{
    PipelineHandle, attach_exits, create_bundle_pipeline, create_unbundle_pipeline,
};
use crate::progress::{
    DEFAULT_PROGRESS_STEP, NoProgress, ProgressReporter, ThrottledProgress, format_bytes_iec,
};
use crate::stage::{StageId, StageInput, StageOutput};
use crate::{Error, Result};

/// Result of a successful bundle.
#[derive(Debug, Clone)]
pub struct BundleResult {
    /// Everything needed to unbundle.
    pub manifest: BundleManifest,
    /// SHA-1 of the raw image bytes, before archiving.
    pub source_digest: Sha1Digest,
}

impl BundleResult {
    /// Returns bundled size divided by image size.
    pub fn compression_ratio(&self) -> f64 {
        if self.manifest.image_size == 0 {
            1.0
        } else {
            self.manifest.bundled_size as f64 / self.manifest.image_size as f64
        }
    }
}

/// Releases one gate slot when dropped, so a panicking consumer still
/// frees it.
struct SlotGuard<'a>(Option<&'a PartGate>);

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if let Some(gate) = self.0 {
            gate.release();
        }
    }
}

/// Bundles images into a directory of encrypted parts.
pub struct Bundler {
    ctx: EncryptionContext,
    dir: PathBuf,
    prefix: Option<String>,
    config: PipelineConfig,
    progress: Box<dyn ProgressReporter>,
}

impl fmt::Debug for Bundler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bundler")
            .field("dir", &self.dir)
            .field("prefix", &self.prefix)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Bundler {
    /// Creates a bundler writing parts into `dir`.
    pub fn new(ctx: EncryptionContext, dir: impl Into<PathBuf>) -> Self {
        Self {
            ctx,
            dir: dir.into(),
            prefix: None,
            config: PipelineConfig::default(),
            progress: Box::new(NoProgress),
        }
    }

    /// Sets the pipeline configuration.
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the part file prefix. Defaults to the image's file name.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Sets the progress reporter.
    pub fn progress(mut self, progress: impl ProgressReporter + 'static) -> Self {
        self.progress = Box::new(progress);
        self
    }

    /// Bundles `size` bytes of `image` under the entry name `name`.
    pub fn bundle<R>(&mut self, image: R, name: &str, size: u64) -> Result<BundleResult>
    where
        R: Read + Send + 'static,
    {
        self.bundle_with(image, name, size, |_| Ok(()))
    }

    /// Bundles like [`bundle`](Self::bundle), calling `consumer` with each
    /// part in index order as soon as it is written.
    ///
    /// The consumer is where parts get uploaded. With
    /// [`max_pending_parts`](PipelineConfig::max_pending_parts) set, at most
    /// that many parts wait for it before bundling pauses. When parts are
    /// not preserved, each one is deleted after its consumer call returns.
    /// A consumer error stops bundling and is returned once every stage has
    /// been drained.
    pub fn bundle_with<R, F>(
        &mut self,
        image: R,
        name: &str,
        size: u64,
        mut consumer: F,
    ) -> Result<BundleResult>
    where
        R: Read + Send + 'static,
        F: FnMut(&BundlePart) -> Result<()>,
    {
        self.config.validate()?;
        self.check_size(size);
        fs::create_dir_all(&self.dir)?;
        let entry = entry_name(name).to_owned();
        let prefix = self.dir.join(self.prefix.as_deref().unwrap_or(&entry));
        log::info!(
            "bundling '{entry}' ({}) into {}",
            format_bytes_iec(size),
            self.dir.display()
        );

        let reader = DigestReader::new(image);
        let tap = reader.tap();
        let (sink_r, sink_w) = io::pipe()?;
        let mut handle = create_bundle_pipeline(
            &self.config,
            &self.ctx,
            name,
            size,
            StageInput::reader(reader),
            StageOutput::Pipe(sink_w),
        )?;

        let gate = self.config.resolved_max_pending_parts().map(PartGate::new);
        let stop = Arc::new(AtomicBool::new(false));
        let (agg_tx, agg_rx) = unbounded();
        let fittings = attach_fittings(
            &mut handle,
            &self.config,
            sink_r,
            prefix,
            gate.clone(),
            Arc::clone(&stop),
            agg_rx,
        );
        let (parts_rx, result_rx) = match fittings {
            Ok(channels) => channels,
            Err(e) => {
                drop(agg_tx);
                let _ = handle.finish();
                return Err(e);
            }
        };

        self.progress.on_total(Some(size));
        let mut consumer_error = None;
        for part in &parts_rx {
            let _slot = SlotGuard(gate.as_ref());
            if consumer_error.is_some() {
                continue;
            }
            match consumer(&part) {
                Ok(()) => {
                    self.progress.on_part(part.index, part.size);
                    self.progress.on_progress(tap.bytes(), Some(size));
                    let _ = agg_tx.send(part);
                }
                Err(e) => {
                    log::error!("consumer rejected part {}: {e}", part.index);
                    stop.store(true, Ordering::Release);
                    consumer_error = Some(e);
                }
            }
        }
        drop(agg_tx);

        let mut outcome = handle.finish();
        if let Some(e) = consumer_error {
            return Err(e);
        }

        let read = tap.bytes();
        let mut cause = None;
        if let Some(failure) = outcome.take_primary_failure() {
            if failure.stage == StageId::Archive && read < size {
                cause = Some(Box::new(failure.error));
            } else {
                return Err(attach_exits(failure.error, outcome.exits));
            }
        }
        // Any non-zero exit leaves the parts unrestorable. A short read with
        // no archive failure is then only a symptom of the broken chain.
        if cause.is_none() {
            if let Some(exit) = outcome.primary_exit() {
                log::error!("bundle stage failed: {exit}");
                return Err(Error::StageExited(exit.clone()));
            }
        }
        if read < size {
            let mut failure = IntegrityFailure::new(
                IntegritySubject::ShortInput,
                size.to_string(),
                Some(read.to_string()),
            );
            failure.cause = cause;
            failure.contributing = outcome.exits;
            log::error!("{failure}");
            return Err(failure.into());
        }

        let image_digest = outcome.digest.ok_or(Error::Interrupted {
            stage: StageId::Digest,
        })?;
        let parts = result_rx.try_recv().map_err(|_| Error::Interrupted {
            stage: StageId::AggregateParts,
        })?;
        let manifest = BundleManifest {
            image_name: entry,
            image_size: size,
            bundled_size: parts.iter().map(|p| p.size).sum(),
            image_digest,
            digest_algorithm: DigestAlgorithm::Sha1,
            encryption_algorithm: self.ctx.algorithm(),
            parts,
        };
        manifest.validate()?;

        self.progress.on_complete(size);
        log::info!(
            "bundled '{}' into {} parts ({}), image digest {}",
            manifest.image_name,
            manifest.parts.len(),
            format_bytes_iec(manifest.bundled_size),
            manifest.image_digest
        );
        Ok(BundleResult {
            manifest,
            source_digest: tap.digest(),
        })
    }

    fn check_size(&mut self, size: u64) {
        let warning = if size == 0 {
            Some("image is empty; the bundle will hold a single empty entry".to_string())
        } else if size > IMPORT_SIZE_WARNING {
            Some(format!(
                "image is {}, larger than the {} import limit of some cloud targets",
                format_bytes_iec(size),
                format_bytes_iec(IMPORT_SIZE_WARNING)
            ))
        } else {
            None
        };
        if let Some(message) = warning {
            log::warn!("{message}");
            self.progress.on_warning(&message);
        }
    }
}

type FittingChannels = (
    crossbeam_channel::Receiver<BundlePart>,
    crossbeam_channel::Receiver<Vec<BundlePart>>,
);

/// Attaches the part writer, the deleter when parts are not preserved, and
/// the aggregator.
fn attach_fittings(
    handle: &mut PipelineHandle,
    config: &PipelineConfig,
    sink: io::PipeReader,
    prefix: PathBuf,
    gate: Option<PartGate>,
    stop: Arc<AtomicBool>,
    consumed: crossbeam_channel::Receiver<BundlePart>,
) -> Result<FittingChannels> {
    let parts_rx = spawn_part_writer(
        handle,
        sink,
        prefix,
        config.part_size,
        config.chunk_size,
        gate,
        stop,
    )?;
    let tee = if config.preserve_parts {
        None
    } else {
        let (del_tx, del_rx) = unbounded();
        spawn_deleter(handle, del_rx, None)?;
        Some(del_tx)
    };
    let result_rx = spawn_aggregator(handle, consumed, tee)?;
    Ok((parts_rx, result_rx))
}

/// Result of a successful unbundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnbundleResult {
    /// SHA-1 of the decompressed archive stream; matches the manifest's
    /// image digest.
    pub image_digest: Sha1Digest,
    /// SHA-1 of the bytes written to the destination.
    pub source_digest: Sha1Digest,
    /// Bytes written to the destination.
    pub bytes_written: u64,
    /// Name of the archived entry.
    pub entry_name: String,
}

/// Restores images from bundles.
pub struct Unbundler {
    ctx: EncryptionContext,
    config: PipelineConfig,
    expected_digest: Option<Sha1Digest>,
    expected_size: Option<u64>,
    max_bytes: Option<u64>,
    progress: Box<dyn ProgressReporter>,
}

impl fmt::Debug for Unbundler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unbundler")
            .field("config", &self.config)
            .field("expected_digest", &self.expected_digest)
            .field("expected_size", &self.expected_size)
            .field("max_bytes", &self.max_bytes)
            .finish_non_exhaustive()
    }
}

impl Unbundler {
    /// Creates an unbundler for bundles encrypted with `ctx`.
    pub fn new(ctx: EncryptionContext) -> Self {
        Self {
            ctx,
            config: PipelineConfig::default(),
            expected_digest: None,
            expected_size: None,
            max_bytes: None,
            progress: Box::new(NoProgress),
        }
    }

    /// Sets the pipeline configuration.
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the trusted image digest. A mismatch fails the unbundle.
    pub fn expected_digest(mut self, digest: Sha1Digest) -> Self {
        self.expected_digest = Some(digest);
        self
    }

    /// Sets the trusted image size. A mismatch fails the unbundle.
    pub fn expected_size(mut self, size: u64) -> Self {
        self.expected_size = Some(size);
        self
    }

    /// Caps the bytes written to the destination.
    pub fn max_bytes(mut self, max_bytes: Option<u64>) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Sets the progress reporter.
    pub fn progress(mut self, progress: impl ProgressReporter + 'static) -> Self {
        self.progress = Box::new(progress);
        self
    }

    /// Restores the image described by `manifest` from the parts in `dir`.
    ///
    /// The manifest's digest and size are checked unless overridden with
    /// [`expected_digest`](Self::expected_digest) and
    /// [`expected_size`](Self::expected_size).
    pub fn unbundle_manifest<W>(
        &mut self,
        manifest: &BundleManifest,
        dir: impl AsRef<Path>,
        dest: &mut W,
    ) -> Result<UnbundleResult>
    where
        W: Write + ?Sized,
    {
        manifest.validate()?;
        let reader = PartReader::new(dir, &manifest.parts)?;
        let digest = self.expected_digest.or(Some(manifest.image_digest));
        let size = self.expected_size.or(Some(manifest.image_size));
        self.run(StageInput::reader(reader), dest, digest, size)
    }

    /// Restores an image from `parts` in `dir`, verifying each part.
    pub fn unbundle_parts<W>(
        &mut self,
        dir: impl AsRef<Path>,
        parts: &[BundlePart],
        dest: &mut W,
    ) -> Result<UnbundleResult>
    where
        W: Write + ?Sized,
    {
        let reader = PartReader::new(dir, parts)?;
        self.run(
            StageInput::reader(reader),
            dest,
            self.expected_digest,
            self.expected_size,
        )
    }

    /// Restores an image from a concatenated bundle stream.
    pub fn unbundle_stream<R, W>(&mut self, source: R, dest: &mut W) -> Result<UnbundleResult>
    where
        R: Read + Send + 'static,
        W: Write + ?Sized,
    {
        self.run(
            StageInput::reader(source),
            dest,
            self.expected_digest,
            self.expected_size,
        )
    }

    fn run<W>(
        &mut self,
        source: StageInput,
        dest: &mut W,
        expected_digest: Option<Sha1Digest>,
        expected_size: Option<u64>,
    ) -> Result<UnbundleResult>
    where
        W: Write + ?Sized,
    {
        self.config.validate()?;
        let (out_r, out_w) = io::pipe()?;
        let handle =
            create_unbundle_pipeline(&self.config, &self.ctx, source, StageOutput::Pipe(out_w))?;

        let limit = CopyLimit::new(self.config.chunk_size)
            .max_bytes(self.max_bytes)
            .expected_bytes(expected_size);
        let mut writer = DigestWriter::new(dest);
        let mut progress = ThrottledProgress::new(&mut self.progress, DEFAULT_PROGRESS_STEP);
        let copied = copy_with_limit(out_r, &mut writer, limit, &mut progress);
        let source_digest = writer.digest();
        let bytes_written = writer.bytes_written();

        let mut outcome = handle.finish();
        let copy_error = match copied {
            Ok(_) => None,
            Err(e @ Error::QuotaExceeded { .. }) => return Err(e),
            Err(e) => Some(e),
        };

        let stage_error = match outcome.take_primary_failure() {
            Some(failure) if failure.error.is_integrity() => {
                return Err(attach_exits(failure.error, outcome.exits));
            }
            Some(failure) => Some(failure.error),
            None => None,
        };
        if let Some(error) = copy_error {
            return Err(error);
        }

        // With a trusted digest, any data-path failure means the image
        // could not be verified.
        if let Some(expected) = expected_digest {
            if stage_error.is_some() || outcome.digest != Some(expected) {
                let mut failure = IntegrityFailure::new(
                    IntegritySubject::ImageDigest,
                    expected.to_string(),
                    outcome
                        .digest
                        .filter(|d| *d != expected)
                        .map(|d| d.to_string()),
                );
                failure.cause = stage_error.map(Box::new);
                failure.contributing = outcome.exits;
                log::error!("{failure}");
                return Err(failure.into());
            }
        }
        if let Some(error) = stage_error {
            return Err(error);
        }

        let image_digest = outcome.digest.ok_or(Error::Interrupted {
            stage: StageId::Digest,
        })?;
        if let Some(expected) = expected_size {
            if bytes_written != expected {
                let failure = IntegrityFailure::new(
                    IntegritySubject::ImageSize,
                    expected.to_string(),
                    Some(bytes_written.to_string()),
                );
                log::error!("{failure}");
                return Err(failure.into());
            }
        }
        let entry_name = outcome.entry_name.take().ok_or(Error::Interrupted {
            stage: StageId::Extract,
        })?;

        self.progress.on_complete(bytes_written);
        log::info!(
            "unbundled '{entry_name}' ({}), image digest {image_digest}",
            format_bytes_iec(bytes_written)
        );
        Ok(UnbundleResult {
            image_digest,
            source_digest,
            bytes_written,
            entry_name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn ctx() -> EncryptionContext {
        EncryptionContext::new([0x5a; 16], [0xa5; 16])
    }

    fn image(len: usize) -> Vec<u8> {
        let mut state = 0x2545_f491u32;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                state as u8
            })
            .collect()
    }

    fn small_parts() -> PipelineConfig {
        PipelineConfig::default().part_size(4096)
    }

    #[test]
    fn test_bundle_and_unbundle_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let data = image(20_000);
        let result = Bundler::new(ctx(), dir.path())
            .config(small_parts())
            .bundle(Cursor::new(data.clone()), "/dev/disk.raw", data.len() as u64)
            .unwrap();
        let manifest = &result.manifest;
        assert_eq!(manifest.image_name, "disk.raw");
        assert_eq!(manifest.image_size, 20_000);
        assert!(manifest.parts.len() >= 5);
        assert_eq!(manifest.parts[0].filename(), "disk.raw.part.00");
        assert_eq!(result.source_digest, Sha1Digest::compute(&data));

        let mut restored = Vec::new();
        let out = Unbundler::new(ctx())
            .unbundle_manifest(manifest, dir.path(), &mut restored)
            .unwrap();
        assert_eq!(restored, data);
        assert_eq!(out.image_digest, manifest.image_digest);
        assert_eq!(out.source_digest, result.source_digest);
        assert_eq!(out.entry_name, "disk.raw");
    }

    #[test]
    fn test_consumer_sees_parts_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut seen = Vec::new();
        let result = Bundler::new(ctx(), dir.path())
            .config(small_parts().max_pending_parts(Some(1)))
            .bundle_with(Cursor::new(image(30_000)), "img", 30_000, |part| {
                assert!(part.path.exists());
                seen.push(part.index);
                Ok(())
            })
            .unwrap();
        let expected: Vec<u32> = (0..result.manifest.parts.len() as u32).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn test_parts_deleted_when_not_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let result = Bundler::new(ctx(), dir.path())
            .config(small_parts().preserve_parts(false))
            .bundle(Cursor::new(image(10_000)), "img", 10_000)
            .unwrap();
        for part in &result.manifest.parts {
            assert!(!part.path.exists(), "{} still exists", part.path.display());
        }
    }

    #[test]
    fn test_consumer_error_stops_bundling() {
        let dir = tempfile::tempdir().unwrap();
        let mut calls = 0;
        let err = Bundler::new(ctx(), dir.path())
            .config(small_parts().max_pending_parts(Some(2)))
            .bundle_with(Cursor::new(image(200_000)), "img", 200_000, |_| {
                calls += 1;
                Err(Error::InvalidConfig("upload refused".into()))
            })
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_short_input_is_integrity_failure() {
        let dir = tempfile::tempdir().unwrap();
        let err = Bundler::new(ctx(), dir.path())
            .bundle(Cursor::new(vec![1u8; 100]), "img", 1000)
            .unwrap_err();
        match err {
            Error::Integrity(f) => {
                assert_eq!(f.subject, IntegritySubject::ShortInput);
                assert_eq!(f.expected, "1000");
                assert_eq!(f.actual.as_deref(), Some("100"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[derive(Clone, Default)]
    struct Warnings(Arc<std::sync::Mutex<Vec<String>>>);

    impl ProgressReporter for Warnings {
        fn on_warning(&mut self, message: &str) {
            self.0.lock().unwrap().push(message.to_string());
        }
    }

    #[test]
    fn test_empty_image_warns() {
        let dir = tempfile::tempdir().unwrap();
        let warnings = Warnings::default();
        let mut bundler = Bundler::new(ctx(), dir.path()).progress(warnings.clone());
        let result = bundler.bundle(Cursor::new(Vec::new()), "empty", 0).unwrap();
        assert_eq!(result.manifest.parts.len(), 1);
        assert_eq!(result.source_digest, Sha1Digest::compute(b""));
        assert_eq!(result.compression_ratio(), 1.0);
        assert_eq!(warnings.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_wrong_digest_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let data = image(5000);
        let result = Bundler::new(ctx(), dir.path())
            .bundle(Cursor::new(data), "img", 5000)
            .unwrap();
        let bogus = Sha1Digest::compute(b"something else");
        let err = Unbundler::new(ctx())
            .expected_digest(bogus)
            .unbundle_manifest(&result.manifest, dir.path(), &mut io::sink())
            .unwrap_err();
        match err {
            Error::Integrity(f) => {
                assert_eq!(f.subject, IntegritySubject::ImageDigest);
                assert_eq!(f.expected, bogus.to_string());
                assert_eq!(f.actual, Some(result.manifest.image_digest.to_string()));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_wrong_size_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let result = Bundler::new(ctx(), dir.path())
            .bundle(Cursor::new(image(3000)), "img", 3000)
            .unwrap();
        let err = Unbundler::new(ctx())
            .expected_size(2999)
            .unbundle_manifest(&result.manifest, dir.path(), &mut Vec::new())
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Integrity(IntegrityFailure {
                subject: IntegritySubject::ImageSize,
                ..
            })
        ));
    }
}
