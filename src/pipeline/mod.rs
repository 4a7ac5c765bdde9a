//! Building, running, and draining bundle and unbundle pipelines.
//!
//! A pipeline is a chain of stages joined by kernel pipes:
//!
//! ```text
//! bundle:   image -> archive -> digest -> compress -> encrypt -> sink
//! unbundle: source -> decrypt -> decompress -> digest -> extract -> output
//! ```
//!
//! [`create_bundle_pipeline`] and [`create_unbundle_pipeline`] spawn every
//! stage in data-flow order and hand each stage sole ownership of its pipe
//! ends, so end-of-stream propagates as soon as a writer finishes. The
//! returned [`PipelineHandle`] is in the [`Running`](PipelineState::Running)
//! state; [`PipelineHandle::finish`] waits for every stage and reports the
//! whole-stream digest together with any stage failures.
//!
//! If a stage cannot be started, the stages already running are unwound by
//! closing their pipes and reaped before the error is returned.

mod reaper;

use std::fmt;
use std::io::{self, Write};

use crossbeam_channel::{Receiver, Sender, bounded};

use crate::archive::{Archiver, Extractor};
use crate::config::{PipelineConfig, StageBackend};
use crate::copy::copy_chunked;
use crate::crypto::EncryptionContext;
use crate::digest::{ByteDigester, Sha1Digest};
use crate::error::ExitFailure;
use crate::stage::process::{ProcessInput, ProcessOutput, spawn_first};
use crate::stage::{CipherStage, CompressionStage, StageId, StageInput, StageOutput};
use crate::{Error, Result};

use reaper::{ExitReport, Reaper};

/// Lifecycle of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Pipes are being allocated and stages started.
    Building,
    /// All stages are running.
    Running,
    /// Waiting for every stage to exit.
    Draining,
    /// Every stage has been reaped.
    Done,
}

/// A fatal failure reported by one stage.
#[derive(Debug)]
pub struct StageFailure {
    /// The stage that failed.
    pub stage: StageId,
    /// What went wrong.
    pub error: Error,
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} stage: {}", self.stage, self.error)
    }
}

/// What a drained pipeline produced.
#[derive(Debug)]
pub struct PipelineOutcome {
    /// Whole-stream digest, if the digest stage reached end of stream.
    pub digest: Option<Sha1Digest>,
    /// Name of the extracted entry (unbundle pipelines only).
    pub entry_name: Option<String>,
    /// Fatal stage failures in the order they were reported.
    pub failures: Vec<StageFailure>,
    /// Non-zero exits of external stages.
    pub exits: Vec<ExitFailure>,
}

impl PipelineOutcome {
    /// Returns `true` if no stage failed and the digest is available.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.digest.is_some()
    }

    /// Removes and returns the failure to report: the first integrity
    /// failure if any stage raised one, otherwise the earliest failure.
    pub fn take_primary_failure(&mut self) -> Option<StageFailure> {
        if self.failures.is_empty() {
            return None;
        }
        let index = self
            .failures
            .iter()
            .position(|f| f.error.is_integrity())
            .unwrap_or(0);
        Some(self.failures.remove(index))
    }

    /// The non-zero exit furthest downstream.
    ///
    /// Upstream processes usually fail only because a later one stopped
    /// reading, so this is the exit that names the cause.
    pub fn primary_exit(&self) -> Option<&ExitFailure> {
        self.exits.last()
    }

    /// Converts into the digest, or the error that prevented it.
    ///
    /// Integrity failures carry the collected exit statuses as contributing
    /// causes.
    pub fn into_digest(mut self) -> Result<Sha1Digest> {
        if let Some(failure) = self.take_primary_failure() {
            return Err(attach_exits(failure.error, self.exits));
        }
        self.digest.ok_or(Error::Interrupted {
            stage: StageId::Digest,
        })
    }
}

/// Adds exit failures to an integrity error as contributing causes.
pub(crate) fn attach_exits(error: Error, exits: Vec<ExitFailure>) -> Error {
    match error {
        Error::Integrity(mut failure) => {
            failure.contributing.extend(exits);
            Error::Integrity(failure)
        }
        other => other,
    }
}

/// A running pipeline.
///
/// Holds the exit channel shared by all stages and the receiving end of
/// the digest channel. Pipe ends are owned by the stages themselves, never
/// by the handle.
pub struct PipelineHandle {
    state: PipelineState,
    reaper: Reaper,
    digest_rx: Receiver<Sha1Digest>,
    entry_rx: Option<Receiver<String>>,
    debug: bool,
}

impl fmt::Debug for PipelineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineHandle")
            .field("state", &self.state)
            .field("stages", &self.reaper.stages())
            .finish_non_exhaustive()
    }
}

impl PipelineHandle {
    /// Current lifecycle state.
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Stages started so far, in spawn order.
    pub fn stages(&self) -> &[StageId] {
        self.reaper.stages()
    }

    /// Runs an additional stage whose exit is collected with the others.
    ///
    /// Part fittings attach themselves this way so that [`finish`](Self::finish)
    /// also waits for them.
    pub fn attach<F>(&mut self, stage: StageId, work: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.reaper.spawn_thread(stage, work)
    }

    /// Waits for every stage to exit and classifies what happened.
    ///
    /// Broken pipes are absorbed unless the pipeline runs in debug mode.
    pub fn finish(mut self) -> PipelineOutcome {
        self.state = PipelineState::Draining;
        log::debug!("draining {} stages", self.reaper.stages().len());

        let mut failures = Vec::new();
        let mut exits = Vec::new();
        for exit in self.reaper.drain() {
            let stage = exit.stage;
            match exit.report {
                ExitReport::Thread(Ok(())) => log::debug!("{stage} stage finished"),
                ExitReport::Thread(Err(error)) => {
                    if let Some(error) = classify(stage, error.flatten(), self.debug) {
                        log::error!("{stage} stage failed: {error}");
                        failures.push(StageFailure { stage, error });
                    }
                }
                ExitReport::Panicked => {
                    log::error!("{stage} stage panicked");
                    failures.push(StageFailure {
                        stage,
                        error: Error::StagePanicked { stage },
                    });
                }
                ExitReport::Process {
                    program,
                    status: Ok(status),
                } => {
                    if !status.success() {
                        exits.push(ExitFailure {
                            stage,
                            program,
                            status,
                        });
                    }
                }
                ExitReport::Process { status: Err(_), .. } => {}
            }
        }

        // Spawn order is data-flow order.
        let order = self.reaper.stages();
        exits.sort_by_key(|exit: &ExitFailure| order.iter().position(|s| *s == exit.stage));

        self.state = PipelineState::Done;
        let digest = self.digest_rx.try_recv().ok();
        let entry_name = self.entry_rx.as_ref().and_then(|rx| rx.try_recv().ok());
        log::debug!(
            "pipeline done: digest {}, {} failures, {} non-zero exits",
            digest.map_or_else(|| "missing".to_string(), |d| d.to_string()),
            failures.len(),
            exits.len()
        );
        PipelineOutcome {
            digest,
            entry_name,
            failures,
            exits,
        }
    }
}

fn classify(stage: StageId, error: Error, debug: bool) -> Option<Error> {
    match error {
        Error::Io(source) if source.kind() == io::ErrorKind::BrokenPipe => {
            if debug {
                Some(Error::PipeFailure { stage, source })
            } else {
                log::debug!("{stage} stage: downstream closed early");
                None
            }
        }
        other => Some(other),
    }
}

/// Collects stages while a pipeline is being built.
struct Builder {
    reaper: Reaper,
    chunk_size: usize,
}

impl Builder {
    fn new(chunk_size: usize) -> Self {
        Self {
            reaper: Reaper::new(),
            chunk_size,
        }
    }

    fn thread<F>(&mut self, stage: StageId, work: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.reaper.spawn_thread(stage, work)
    }

    fn process(
        &mut self,
        stage: StageId,
        candidates: &[&str],
        args: &[String],
        stdin: ProcessInput,
        stdout: ProcessOutput,
    ) -> Result<()> {
        let spawned = spawn_first(candidates, args, stdin, stdout)?;
        self.reaper
            .watch_process(stage, spawned.program, spawned.child)
    }

    /// Turns a pipeline input into something a child can read, pumping
    /// arbitrary readers through an extra pipe.
    fn process_input(&mut self, input: StageInput) -> Result<ProcessInput> {
        match input {
            StageInput::Pipe(pipe) => Ok(ProcessInput::Pipe(pipe)),
            StageInput::File(file) => Ok(ProcessInput::File(file)),
            StageInput::Reader(mut reader) => {
                let (pipe_r, mut pipe_w) = io::pipe()?;
                let chunk_size = self.chunk_size;
                self.thread(StageId::Feed, move || {
                    copy_chunked(&mut reader, &mut pipe_w, chunk_size)?;
                    Ok(())
                })?;
                Ok(ProcessInput::Pipe(pipe_r))
            }
        }
    }

    /// Turns a pipeline output into something a child can write, pumping
    /// into arbitrary writers through an extra pipe.
    fn process_output(&mut self, output: StageOutput) -> Result<ProcessOutput> {
        match output {
            StageOutput::Pipe(pipe) => Ok(ProcessOutput::Pipe(pipe)),
            StageOutput::File(file) => Ok(ProcessOutput::File(file)),
            StageOutput::Writer(mut writer) => {
                let (mut pipe_r, pipe_w) = io::pipe()?;
                let chunk_size = self.chunk_size;
                self.thread(StageId::Drain, move || {
                    copy_chunked(&mut pipe_r, &mut writer, chunk_size)?;
                    writer.flush()?;
                    Ok(())
                })?;
                Ok(ProcessOutput::Pipe(pipe_w))
            }
        }
    }

    fn finish(
        mut self,
        built: Result<()>,
        digest_rx: Receiver<Sha1Digest>,
        entry_rx: Option<Receiver<String>>,
        debug: bool,
    ) -> Result<PipelineHandle> {
        match built {
            Ok(()) => {
                log::debug!("pipeline running: {:?}", self.reaper.stages());
                Ok(PipelineHandle {
                    state: PipelineState::Running,
                    reaper: self.reaper,
                    digest_rx,
                    entry_rx,
                    debug,
                })
            }
            Err(error) => {
                log::error!("pipeline could not be built: {error}");
                // Unspawned pipe ends are gone by now; running stages see
                // end-of-stream or a broken pipe and exit.
                let _ = self.reaper.drain();
                Err(error)
            }
        }
    }
}

/// Builds the bundling pipeline:
/// `image -> archive -> digest -> compress -> encrypt -> sink`.
///
/// `name` and `size` describe the single archive entry. The handle's digest
/// is the SHA-1 of the archive stream, taken before compression.
pub fn create_bundle_pipeline(
    config: &PipelineConfig,
    ctx: &EncryptionContext,
    name: &str,
    size: u64,
    image: StageInput,
    sink: StageOutput,
) -> Result<PipelineHandle> {
    config.validate()?;
    let (digest_tx, digest_rx) = bounded(1);
    let mut builder = Builder::new(config.chunk_size);
    let built = build_bundle(&mut builder, config, ctx, name, size, image, sink, digest_tx);
    builder.finish(built, digest_rx, None, config.debug)
}

#[allow(clippy::too_many_arguments)]
fn build_bundle(
    b: &mut Builder,
    config: &PipelineConfig,
    ctx: &EncryptionContext,
    name: &str,
    size: u64,
    image: StageInput,
    sink: StageOutput,
    digest_tx: Sender<Sha1Digest>,
) -> Result<()> {
    let chunk_size = config.chunk_size;

    let (archive_r, archive_w) = io::pipe()?;
    let archiver = Archiver::new(chunk_size, config.debug);
    let name = name.to_owned();
    let image = image.into_reader();
    b.thread(StageId::Archive, move || {
        archiver.archive(&name, size, image, archive_w)
    })?;

    let (digest_r, digest_w) = io::pipe()?;
    let digester = ByteDigester::new(chunk_size);
    b.thread(StageId::Digest, move || {
        digester.relay(archive_r, digest_w, digest_tx)
    })?;

    let compression = CompressionStage::compress(config.compression_level);
    let cipher = CipherStage::encrypt(ctx.clone());
    let (packed_r, packed_w) = io::pipe()?;
    match config.backend {
        StageBackend::Native => {
            b.thread(compression.id(), move || {
                compression.run(digest_r, packed_w, chunk_size)
            })?;
            let out = sink.into_writer();
            b.thread(cipher.id(), move || cipher.run(packed_r, out, chunk_size))?;
        }
        StageBackend::External => {
            b.process(
                compression.id(),
                &compression.programs(&config.programs),
                &compression.args(),
                ProcessInput::Pipe(digest_r),
                ProcessOutput::Pipe(packed_w),
            )?;
            let stdout = b.process_output(sink)?;
            b.process(
                cipher.id(),
                &[config.programs.cipher.as_str()],
                &cipher.args(),
                ProcessInput::Pipe(packed_r),
                stdout,
            )?;
        }
    }
    Ok(())
}

/// Builds the unbundling pipeline:
/// `source -> decrypt -> decompress -> digest -> extract -> output`.
///
/// The handle's digest covers the decompressed archive stream, which is what
/// a manifest's image digest records. The extracted entry's bytes are
/// written to `output`; the caller usually reads them back through a pipe
/// with [`copy_with_limit`](crate::copy::copy_with_limit).
pub fn create_unbundle_pipeline(
    config: &PipelineConfig,
    ctx: &EncryptionContext,
    source: StageInput,
    output: StageOutput,
) -> Result<PipelineHandle> {
    config.validate()?;
    let (digest_tx, digest_rx) = bounded(1);
    let (entry_tx, entry_rx) = bounded(1);
    let mut builder = Builder::new(config.chunk_size);
    let built = build_unbundle(&mut builder, config, ctx, source, output, digest_tx, entry_tx);
    builder.finish(built, digest_rx, Some(entry_rx), config.debug)
}

fn build_unbundle(
    b: &mut Builder,
    config: &PipelineConfig,
    ctx: &EncryptionContext,
    source: StageInput,
    output: StageOutput,
    digest_tx: Sender<Sha1Digest>,
    entry_tx: Sender<String>,
) -> Result<()> {
    let chunk_size = config.chunk_size;
    let cipher = CipherStage::decrypt(ctx.clone());
    let compression = CompressionStage::decompress();

    let (packed_r, packed_w) = io::pipe()?;
    let (plain_r, plain_w) = io::pipe()?;
    match config.backend {
        StageBackend::Native => {
            let input = source.into_reader();
            b.thread(cipher.id(), move || cipher.run(input, packed_w, chunk_size))?;
            b.thread(compression.id(), move || {
                compression.run(packed_r, plain_w, chunk_size)
            })?;
        }
        StageBackend::External => {
            let stdin = b.process_input(source)?;
            b.process(
                cipher.id(),
                &[config.programs.cipher.as_str()],
                &cipher.args(),
                stdin,
                ProcessOutput::Pipe(packed_w),
            )?;
            b.process(
                compression.id(),
                &compression.programs(&config.programs),
                &compression.args(),
                ProcessInput::Pipe(packed_r),
                ProcessOutput::Pipe(plain_w),
            )?;
        }
    }

    let (archive_r, archive_w) = io::pipe()?;
    let digester = ByteDigester::new(chunk_size);
    b.thread(StageId::Digest, move || {
        digester.relay(plain_r, archive_w, digest_tx)
    })?;

    let extractor = Extractor::new(chunk_size);
    let dest = output.into_writer();
    b.thread(StageId::Extract, move || {
        let name = extractor.extract(archive_r, dest)?;
        let _ = entry_tx.send(name);
        Ok(())
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExternalPrograms;
    use std::io::{Cursor, Read};
    use std::sync::{Arc, Mutex};

    fn ctx() -> EncryptionContext {
        EncryptionContext::new([0x11; 16], [0x22; 16])
    }

    /// A writer that collects into a shared buffer.
    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Shared {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn bundle_bytes(config: &PipelineConfig, data: &[u8]) -> (Vec<u8>, Sha1Digest) {
        let sink = Shared::default();
        let handle = create_bundle_pipeline(
            config,
            &ctx(),
            "disk.img",
            data.len() as u64,
            StageInput::reader(Cursor::new(data.to_vec())),
            StageOutput::writer(sink.clone()),
        )
        .unwrap();
        assert_eq!(handle.state(), PipelineState::Running);
        let digest = handle.finish().into_digest().unwrap();
        let bytes = sink.0.lock().unwrap().clone();
        (bytes, digest)
    }

    fn unbundle_bytes(config: &PipelineConfig, bundle: Vec<u8>) -> (Vec<u8>, PipelineOutcome) {
        let (mut out_r, out_w) = io::pipe().unwrap();
        let handle = create_unbundle_pipeline(
            config,
            &ctx(),
            StageInput::reader(Cursor::new(bundle)),
            StageOutput::Pipe(out_w),
        )
        .unwrap();
        let mut image = Vec::new();
        out_r.read_to_end(&mut image).unwrap();
        (image, handle.finish())
    }

    #[test]
    fn test_bundle_stage_order() {
        let sink = Shared::default();
        let handle = create_bundle_pipeline(
            &PipelineConfig::default(),
            &ctx(),
            "a",
            1,
            StageInput::reader(Cursor::new(vec![1u8])),
            StageOutput::writer(sink),
        )
        .unwrap();
        assert_eq!(
            handle.stages(),
            &[StageId::Archive, StageId::Digest, StageId::Compress, StageId::Encrypt]
        );
        assert!(handle.finish().is_clean());
    }

    #[test]
    fn test_native_round_trip() {
        let config = PipelineConfig::default();
        let data: Vec<u8> = (0..300_000u32)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 24) as u8)
            .collect();
        let (bundle, bundle_digest) = bundle_bytes(&config, &data);
        assert_eq!(bundle.len() % 16, 0);

        let (image, outcome) = unbundle_bytes(&config, bundle);
        assert_eq!(image, data);
        assert_eq!(outcome.entry_name.as_deref(), Some("disk.img"));
        assert_eq!(outcome.into_digest().unwrap(), bundle_digest);
    }

    #[test]
    fn test_digest_is_deterministic() {
        let config = PipelineConfig::default();
        let data = vec![9u8; 50_000];
        let (first, d1) = bundle_bytes(&config, &data);
        let (second, d2) = bundle_bytes(&config, &data);
        assert_eq!(d1, d2);
        assert_eq!(first, second);
    }

    #[test]
    fn test_wrong_key_fails_unbundle() {
        let config = PipelineConfig::default();
        let (bundle, digest) = bundle_bytes(&config, &[5u8; 10_000]);

        let (mut out_r, out_w) = io::pipe().unwrap();
        let handle = create_unbundle_pipeline(
            &config,
            &EncryptionContext::new([0x33; 16], [0x22; 16]),
            StageInput::reader(Cursor::new(bundle)),
            StageOutput::Pipe(out_w),
        )
        .unwrap();
        let mut sink = Vec::new();
        let _ = copy_chunked(&mut out_r, &mut sink, 8192);
        let outcome = handle.finish();
        assert_ne!(outcome.digest, Some(digest));
        assert!(outcome.into_digest().is_err());
    }

    #[test]
    fn test_spawn_failure_unwinds() {
        let config = PipelineConfig::default()
            .backend(StageBackend::External)
            .programs(ExternalPrograms {
                parallel_compressor: "imgbundle-missing-pigz".into(),
                compressor: "imgbundle-missing-gzip".into(),
                cipher: "imgbundle-missing-openssl".into(),
            });
        let err = create_bundle_pipeline(
            &config,
            &ctx(),
            "a",
            4,
            StageInput::reader(Cursor::new(vec![1u8; 4])),
            StageOutput::writer(io::sink()),
        )
        .unwrap_err();
        match err {
            Error::SpawnFailure { program, .. } => assert_eq!(program, "imgbundle-missing-gzip"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_broken_pipe_absorbed_unless_debug() {
        let err = Error::Io(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(classify(StageId::Digest, err, false).is_none());
        let err = Error::Io(io::Error::from(io::ErrorKind::BrokenPipe));
        assert!(matches!(
            classify(StageId::Digest, err, true),
            Some(Error::PipeFailure { stage: StageId::Digest, .. })
        ));
        let err = Error::MalformedArchive("x".into());
        assert!(classify(StageId::Extract, err, false).is_some());
    }

    #[test]
    fn test_primary_failure_prefers_integrity() {
        use crate::error::{IntegrityFailure, IntegritySubject};
        let mut outcome = PipelineOutcome {
            digest: None,
            entry_name: None,
            failures: vec![
                StageFailure {
                    stage: StageId::Decompress,
                    error: Error::MalformedArchive("late".into()),
                },
                StageFailure {
                    stage: StageId::Feed,
                    error: IntegrityFailure::new(
                        IntegritySubject::PartDigest { index: 1 },
                        "a",
                        None,
                    )
                    .into(),
                },
            ],
            exits: Vec::new(),
        };
        let primary = outcome.take_primary_failure().unwrap();
        assert_eq!(primary.stage, StageId::Feed);
        assert_eq!(outcome.failures.len(), 1);
    }

    #[test]
    fn test_missing_digest_is_interrupted() {
        let outcome = PipelineOutcome {
            digest: None,
            entry_name: None,
            failures: Vec::new(),
            exits: Vec::new(),
        };
        assert!(matches!(
            outcome.into_digest(),
            Err(Error::Interrupted { stage: StageId::Digest })
        ));
    }
}
