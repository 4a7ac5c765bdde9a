//! Transformation stages and the byte endpoints that connect them.
//!
//! A stage is one unit of a pipeline: a thread inside this process or an
//! external program. [`CompressionStage`] and [`CipherStage`] can run either
//! way, selected by [`StageBackend`](crate::StageBackend); the archive,
//! digest, and part stages always run as threads.

mod native;
pub(crate) mod process;

use std::fmt;
use std::fs::File;
use std::io::{PipeReader, PipeWriter, Read, Write};

use crate::Result;
use crate::config::ExternalPrograms;
use crate::crypto::EncryptionContext;

/// Identifies a stage in logs, errors, and [`PipelineHandle::stages`].
///
/// [`PipelineHandle::stages`]: crate::pipeline::PipelineHandle::stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum StageId {
    /// Wraps the image in a tar container.
    Archive,
    /// Digests the archive stream.
    Digest,
    /// Compresses the archive stream.
    Compress,
    /// Decompresses the bundle stream.
    Decompress,
    /// Encrypts the compressed stream.
    Encrypt,
    /// Decrypts the bundle stream.
    Decrypt,
    /// Pulls the image out of the tar container.
    Extract,
    /// Pumps a caller-supplied reader into an external process.
    Feed,
    /// Pumps an external process's output into a caller-supplied writer.
    Drain,
    /// Splits the bundle stream into parts.
    SplitParts,
    /// Deletes consumed parts.
    DeleteParts,
    /// Collects part records.
    AggregateParts,
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Archive => "archive",
            Self::Digest => "digest",
            Self::Compress => "compress",
            Self::Decompress => "decompress",
            Self::Encrypt => "encrypt",
            Self::Decrypt => "decrypt",
            Self::Extract => "extract",
            Self::Feed => "feed",
            Self::Drain => "drain",
            Self::SplitParts => "split",
            Self::DeleteParts => "delete",
            Self::AggregateParts => "aggregate",
        };
        f.write_str(name)
    }
}

/// Where a pipeline reads its input from.
pub enum StageInput {
    /// The read end of a kernel pipe.
    Pipe(PipeReader),
    /// An open file.
    File(File),
    /// Any other reader.
    ///
    /// Connected to external processes through an extra pump thread.
    Reader(Box<dyn Read + Send>),
}

impl StageInput {
    /// Boxes an arbitrary reader.
    pub fn reader<R: Read + Send + 'static>(reader: R) -> Self {
        Self::Reader(Box::new(reader))
    }

    pub(crate) fn into_reader(self) -> Box<dyn Read + Send> {
        match self {
            Self::Pipe(pipe) => Box::new(pipe),
            Self::File(file) => Box::new(file),
            Self::Reader(reader) => reader,
        }
    }
}

impl From<PipeReader> for StageInput {
    fn from(pipe: PipeReader) -> Self {
        Self::Pipe(pipe)
    }
}

impl From<File> for StageInput {
    fn from(file: File) -> Self {
        Self::File(file)
    }
}

impl fmt::Debug for StageInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pipe(pipe) => f.debug_tuple("Pipe").field(pipe).finish(),
            Self::File(file) => f.debug_tuple("File").field(file).finish(),
            Self::Reader(_) => f.write_str("Reader(..)"),
        }
    }
}

/// Where a pipeline writes its output to.
pub enum StageOutput {
    /// The write end of a kernel pipe.
    Pipe(PipeWriter),
    /// An open file.
    File(File),
    /// Any other writer.
    ///
    /// Connected to external processes through an extra pump thread.
    Writer(Box<dyn Write + Send>),
}

impl StageOutput {
    /// Boxes an arbitrary writer.
    pub fn writer<W: Write + Send + 'static>(writer: W) -> Self {
        Self::Writer(Box::new(writer))
    }

    pub(crate) fn into_writer(self) -> Box<dyn Write + Send> {
        match self {
            Self::Pipe(pipe) => Box::new(pipe),
            Self::File(file) => Box::new(file),
            Self::Writer(writer) => writer,
        }
    }
}

impl From<PipeWriter> for StageOutput {
    fn from(pipe: PipeWriter) -> Self {
        Self::Pipe(pipe)
    }
}

impl From<File> for StageOutput {
    fn from(file: File) -> Self {
        Self::File(file)
    }
}

impl fmt::Debug for StageOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pipe(pipe) => f.debug_tuple("Pipe").field(pipe).finish(),
            Self::File(file) => f.debug_tuple("File").field(file).finish(),
            Self::Writer(_) => f.write_str("Writer(..)"),
        }
    }
}

/// Direction of a reversible stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Compress or encrypt.
    Forward,
    /// Decompress or decrypt.
    Reverse,
}

/// Gzip compression or decompression.
#[derive(Debug, Clone)]
pub struct CompressionStage {
    direction: Direction,
    level: u32,
}

impl CompressionStage {
    /// A compressing stage at `level` (0 through 9).
    pub fn compress(level: u32) -> Self {
        Self {
            direction: Direction::Forward,
            level,
        }
    }

    /// A decompressing stage.
    pub fn decompress() -> Self {
        Self {
            direction: Direction::Reverse,
            level: crate::config::DEFAULT_COMPRESSION_LEVEL,
        }
    }

    /// The stage's identifier.
    pub fn id(&self) -> StageId {
        match self.direction {
            Direction::Forward => StageId::Compress,
            Direction::Reverse => StageId::Decompress,
        }
    }

    /// Programs to try, most preferred first.
    pub fn programs<'a>(&self, programs: &'a ExternalPrograms) -> [&'a str; 2] {
        [&programs.parallel_compressor, &programs.compressor]
    }

    /// Arguments shared by the parallel and single-threaded compressor.
    pub fn args(&self) -> Vec<String> {
        match self.direction {
            Direction::Forward => vec!["-c".into()],
            Direction::Reverse => vec!["-c".into(), "-d".into()],
        }
    }

    /// Runs the stage in-process until `input` ends.
    pub fn run<R: Read, W: Write>(&self, input: R, output: W, chunk_size: usize) -> Result<()> {
        match self.direction {
            Direction::Forward => native::gzip(input, output, self.level, chunk_size),
            Direction::Reverse => native::gunzip(input, output, chunk_size),
        }
    }
}

/// AES-128-CBC encryption or decryption.
#[derive(Debug, Clone)]
pub struct CipherStage {
    direction: Direction,
    ctx: EncryptionContext,
}

impl CipherStage {
    /// An encrypting stage.
    pub fn encrypt(ctx: EncryptionContext) -> Self {
        Self {
            direction: Direction::Forward,
            ctx,
        }
    }

    /// A decrypting stage.
    pub fn decrypt(ctx: EncryptionContext) -> Self {
        Self {
            direction: Direction::Reverse,
            ctx,
        }
    }

    /// The stage's identifier.
    pub fn id(&self) -> StageId {
        match self.direction {
            Direction::Forward => StageId::Encrypt,
            Direction::Reverse => StageId::Decrypt,
        }
    }

    /// Arguments for `openssl`.
    ///
    /// The key appears on the child's command line, as the tool requires.
    pub fn args(&self) -> Vec<String> {
        let flag = match self.direction {
            Direction::Forward => "-e",
            Direction::Reverse => "-d",
        };
        vec![
            "enc".into(),
            flag.into(),
            format!("-{}", self.ctx.algorithm().openssl_name()),
            "-K".into(),
            self.ctx.key_hex().as_str().to_owned(),
            "-iv".into(),
            self.ctx.iv_hex(),
        ]
    }

    /// Runs the stage in-process until `input` ends.
    pub fn run<R: Read, W: Write>(&self, input: R, output: W, chunk_size: usize) -> Result<()> {
        match self.direction {
            Direction::Forward => native::encrypt(input, output, &self.ctx, chunk_size),
            Direction::Reverse => native::decrypt(input, output, &self.ctx, chunk_size),
        }
    }
}
