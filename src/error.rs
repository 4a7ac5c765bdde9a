//! Error types for bundle and unbundle pipelines.
//!
//! This module provides the [`Error`] enum which represents every terminal
//! failure a pipeline can report, along with a convenient [`Result<T>`]
//! type alias.
//!
//! # Error Handling
//!
//! A pipeline runs many stages concurrently, but the caller always receives
//! a single classified error. Stages that fail after the first fatal error
//! are still reaped; their failures are logged and, where relevant, attached
//! to an [`IntegrityFailure`] as contributing causes.
//!
//! ```rust,no_run
//! use imgbundle::{Error, IntegritySubject};
//!
//! fn explain(error: &Error) {
//!     match error {
//!         Error::SpawnFailure { program, .. } => {
//!             eprintln!("'{program}' is not installed");
//!         }
//!         Error::Integrity(failure) if failure.subject == IntegritySubject::ImageDigest => {
//!             eprintln!("wrong key or corrupted bundle: {failure}");
//!         }
//!         Error::QuotaExceeded { limit, .. } => {
//!             eprintln!("image is larger than the {limit}-byte destination");
//!         }
//!         _ => eprintln!("error: {error}"),
//!     }
//! }
//! ```

use std::fmt;
use std::io;
use std::process::ExitStatus;

use crate::stage::StageId;

/// What an [`IntegrityFailure`] was checking when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum IntegritySubject {
    /// The whole-image digest recomputed by the pipeline.
    ImageDigest,
    /// The digest of one on-disk part.
    PartDigest {
        /// Index of the part.
        index: u32,
    },
    /// The byte count of one on-disk part.
    PartSize {
        /// Index of the part.
        index: u32,
    },
    /// The number of image bytes reconstructed by an unbundle.
    ImageSize,
    /// The image source ended before its declared size.
    ShortInput,
}

impl fmt::Display for IntegritySubject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ImageDigest => write!(f, "image digest"),
            Self::PartDigest { index } => write!(f, "digest of part {index}"),
            Self::PartSize { index } => write!(f, "size of part {index}"),
            Self::ImageSize => write!(f, "image size"),
            Self::ShortInput => write!(f, "image source length"),
        }
    }
}

/// A non-zero exit status collected from an external stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitFailure {
    /// The stage the process was serving.
    pub stage: StageId,
    /// Program name the process was started from.
    pub program: String,
    /// Exit status reported by the operating system.
    pub status: ExitStatus,
}

impl fmt::Display for ExitFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} stage ({}) {}", self.stage, self.program, self.status)
    }
}

/// Details of a failed integrity check.
///
/// `expected` and `actual` are rendered the same way (lowercase hex for
/// digests, decimal for sizes) so callers can print them side by side.
/// `actual` is `None` when the pipeline broke down before the value could
/// be computed.
#[derive(Debug)]
pub struct IntegrityFailure {
    /// What was being checked.
    pub subject: IntegritySubject,
    /// The trusted value.
    pub expected: String,
    /// The value the pipeline observed, if it got that far.
    pub actual: Option<String>,
    /// Non-zero exits of external stages collected while draining.
    pub contributing: Vec<ExitFailure>,
    /// The first fatal stage error, when one preceded the check.
    pub cause: Option<Box<Error>>,
}

impl IntegrityFailure {
    /// Creates a failure for `subject` with no contributing causes.
    pub fn new(
        subject: IntegritySubject,
        expected: impl Into<String>,
        actual: Option<String>,
    ) -> Self {
        Self {
            subject,
            expected: expected.into(),
            actual,
            contributing: Vec::new(),
            cause: None,
        }
    }
}

impl fmt::Display for IntegrityFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} mismatch: expected {}", self.subject, self.expected)?;
        match &self.actual {
            Some(actual) => write!(f, ", got {actual}")?,
            None => write!(f, ", got nothing")?,
        }
        if let Some(cause) = &self.cause {
            write!(f, " ({cause})")?;
        }
        for exit in &self.contributing {
            write!(f, "; {exit}")?;
        }
        Ok(())
    }
}

impl std::error::Error for IntegrityFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// The main error type for bundle and unbundle operations.
///
/// # Error Categories
///
/// | Category | Variants | Typical Cause |
/// |----------|----------|---------------|
/// | I/O | [`Io`][Self::Io] | Disk or pipe failures |
/// | Processes | [`SpawnFailure`][Self::SpawnFailure] | Missing `gzip`/`openssl` binaries |
/// | Integrity | [`Integrity`][Self::Integrity] | Wrong key, corrupted or truncated data |
/// | Limits | [`QuotaExceeded`][Self::QuotaExceeded] | Destination ceiling reached |
/// | Pipes | [`PipeFailure`][Self::PipeFailure] | Downstream stage exited early (debug mode only) |
/// | Input | [`InvalidKey`][Self::InvalidKey], [`InvalidDigest`][Self::InvalidDigest], [`InvalidConfig`][Self::InvalidConfig], [`InvalidManifest`][Self::InvalidManifest] | Caller-supplied values |
/// | Stages | [`MalformedArchive`][Self::MalformedArchive], [`StagePanicked`][Self::StagePanicked], [`StageExited`][Self::StageExited], [`Interrupted`][Self::Interrupted] | A stage broke down |
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// An I/O error occurred while reading, writing, or creating files.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// An external process could not be started.
    ///
    /// Fatal to the whole pipeline. The parallel compressor falls back to
    /// the single-threaded one before this is reported.
    #[error("failed to start '{program}': {source}")]
    SpawnFailure {
        /// The program that could not be started.
        program: String,
        /// The error returned by the operating system.
        #[source]
        source: io::Error,
    },

    /// A digest or size check failed.
    ///
    /// Always fatal and never retried. See [`IntegrityFailure`] for the
    /// expected and observed values.
    #[error("integrity check failed: {0}")]
    Integrity(#[from] IntegrityFailure),

    /// The unbundle destination would have exceeded its byte ceiling.
    ///
    /// Bytes already written are left in place.
    #[error("writing {attempted} bytes would exceed the {limit}-byte limit")]
    QuotaExceeded {
        /// The configured ceiling.
        limit: u64,
        /// Total bytes the rejected write would have produced.
        attempted: u64,
    },

    /// A stage hit a broken pipe.
    ///
    /// Only reported in debug mode. Otherwise broken pipes are expected
    /// whenever a downstream stage exits early and are absorbed.
    #[error("broken pipe in {stage} stage: {source}")]
    PipeFailure {
        /// The stage that observed the broken pipe.
        stage: StageId,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The archive stream had no entry or could not be parsed.
    #[error("malformed archive: {0}")]
    MalformedArchive(String),

    /// The encryption key or IV is not 32 hex characters.
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    /// A digest string is not 40 hex characters.
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    /// A [`PipelineConfig`](crate::PipelineConfig) value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A manifest's part list is inconsistent.
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// A stage thread panicked.
    #[error("{stage} stage panicked")]
    StagePanicked {
        /// The stage whose thread panicked.
        stage: StageId,
    },

    /// An external stage exited with a non-zero status while bundling.
    ///
    /// The parts written so far cannot be unbundled.
    #[error("{0}")]
    StageExited(ExitFailure),

    /// A stage ended without delivering its result.
    #[error("{stage} stage ended without producing a result")]
    Interrupted {
        /// The stage whose result channel closed early.
        stage: StageId,
    },
}

/// A specialized Result type for bundle operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Recovers a crate error that travelled through an [`io::Error`].
    ///
    /// `Read`/`Write` adapters report typed failures with
    /// [`io::Error::other`]; this undoes the wrapping so the caller sees the
    /// original variant. Any other I/O error becomes [`Error::Io`].
    pub fn from_io(err: io::Error) -> Self {
        if err.get_ref().is_some_and(|inner| inner.is::<Error>()) {
            if let Some(inner) = err.into_inner() {
                if let Ok(inner) = inner.downcast::<Error>() {
                    return *inner;
                }
            }
            return Error::Io(io::Error::other("wrapped error lost"));
        }
        Error::Io(err)
    }

    /// Flattens an [`Error::Io`] that carries a wrapped crate error.
    pub(crate) fn flatten(self) -> Self {
        match self {
            Error::Io(err) => Error::from_io(err),
            other => other,
        }
    }

    /// Returns `true` for errors caused by a peer closing its end of a pipe.
    pub fn is_broken_pipe(&self) -> bool {
        match self {
            Error::Io(e) => e.kind() == io::ErrorKind::BrokenPipe,
            Error::PipeFailure { .. } => true,
            _ => false,
        }
    }

    /// Returns `true` for [`Error::Integrity`].
    pub fn is_integrity(&self) -> bool {
        matches!(self, Error::Integrity(_))
    }

    /// Wraps this error for transport through an [`io::Error`].
    pub(crate) fn into_io(self) -> io::Error {
        match self {
            Error::Io(err) => err,
            other => io::Error::other(other),
        }
    }
}
