//! Configuration for bundle and unbundle pipelines.
//!
//! This module provides [`PipelineConfig`], the single value threaded into
//! every stage constructor: chunk size, part size, admission control, which
//! backend runs the compression and cipher stages, and how strictly broken
//! pipes are treated.

/// Reference chunk size for every copying stage (8 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 8192;

/// Default size of one bundle part (10 MiB).
pub const DEFAULT_PART_SIZE: u64 = 10 * 1024 * 1024;

/// Default gzip compression level.
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

/// Images above this size cannot be imported by the historical cloud target.
pub const IMPORT_SIZE_WARNING: u64 = 10 * 1024 * 1024 * 1024;

/// Which implementation runs the compression and cipher stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StageBackend {
    /// In-process threads: gzip via flate2, AES-128-CBC via the `aes` crate.
    ///
    /// Produces streams the external programs can read, and reads theirs.
    #[default]
    Native,
    /// External processes (`pigz`/`gzip` and `openssl enc`) connected with
    /// kernel pipes.
    External,
}

/// Program names used by [`StageBackend::External`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalPrograms {
    /// Multi-threaded compressor tried first. Default: `pigz`.
    pub parallel_compressor: String,
    /// Single-threaded fallback with the same flags. Default: `gzip`.
    pub compressor: String,
    /// Cipher tool invoked as `enc -e|-d -aes-128-cbc`. Default: `openssl`.
    pub cipher: String,
}

impl Default for ExternalPrograms {
    fn default() -> Self {
        Self {
            parallel_compressor: "pigz".into(),
            compressor: "gzip".into(),
            cipher: "openssl".into(),
        }
    }
}

/// Configuration for a bundle or unbundle pipeline.
///
/// # Example
///
/// ```rust
/// use imgbundle::{PipelineConfig, StageBackend};
///
/// let config = PipelineConfig::new()
///     .part_size(5 * 1024 * 1024)
///     .max_pending_parts(Some(4))
///     .backend(StageBackend::External);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Bytes moved per read/write by every copying stage.
    ///
    /// A tuning parameter; no stage buffers more than one chunk.
    /// Default: 8 KiB.
    pub chunk_size: usize,

    /// Size of each bundle part in bytes. Default: 10 MiB.
    pub part_size: u64,

    /// Maximum number of written parts awaiting consumption.
    ///
    /// `None` disables admission control. Values below 1 are treated as 1.
    /// Default: `None`.
    pub max_pending_parts: Option<usize>,

    /// Backend for the compression and cipher stages. Default: native.
    pub backend: StageBackend,

    /// Report broken pipes and short image sources as errors instead of
    /// absorbing them. Default: false.
    pub debug: bool,

    /// Keep part files after the consumer has handled them.
    ///
    /// When false, parts are deleted as soon as the part consumer returns.
    /// Default: true.
    pub preserve_parts: bool,

    /// Gzip level, 0 through 9. Default: 6.
    ///
    /// Only [`StageBackend::Native`] honors this; the external compressor
    /// always runs with its own default level.
    pub compression_level: u32,

    /// Programs used by the external backend.
    pub programs: ExternalPrograms,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            part_size: DEFAULT_PART_SIZE,
            max_pending_parts: None,
            backend: StageBackend::default(),
            debug: false,
            preserve_parts: true,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            programs: ExternalPrograms::default(),
        }
    }
}

impl PipelineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-stage chunk size.
    pub fn chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes;
        self
    }

    /// Sets the part size.
    pub fn part_size(mut self, bytes: u64) -> Self {
        self.part_size = bytes;
        self
    }

    /// Bounds the number of parts awaiting consumption.
    pub fn max_pending_parts(mut self, count: Option<usize>) -> Self {
        self.max_pending_parts = count;
        self
    }

    /// Selects the stage backend.
    pub fn backend(mut self, backend: StageBackend) -> Self {
        self.backend = backend;
        self
    }

    /// Enables or disables debug mode.
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Keeps or deletes parts after consumption.
    pub fn preserve_parts(mut self, preserve: bool) -> Self {
        self.preserve_parts = preserve;
        self
    }

    /// Sets the gzip compression level used by the native backend.
    pub fn compression_level(mut self, level: u32) -> Self {
        self.compression_level = level;
        self
    }

    /// Overrides the external program names.
    pub fn programs(mut self, programs: ExternalPrograms) -> Self {
        self.programs = programs;
        self
    }

    /// Returns the admission-control capacity, if any, clamped to at least 1.
    pub fn resolved_max_pending_parts(&self) -> Option<usize> {
        self.max_pending_parts.map(|n| n.max(1))
    }

    /// Validates the configuration.
    pub fn validate(&self) -> crate::Result<()> {
        if self.chunk_size == 0 {
            return Err(crate::Error::InvalidConfig(
                "chunk_size must be greater than 0".into(),
            ));
        }

        if self.part_size == 0 {
            return Err(crate::Error::InvalidConfig(
                "part_size must be greater than 0".into(),
            ));
        }

        if self.compression_level > 9 {
            return Err(crate::Error::InvalidConfig(format!(
                "compression_level must be between 0 and 9, got {}",
                self.compression_level
            )));
        }

        Ok(())
    }
}
