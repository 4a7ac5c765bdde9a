//! # imgbundle
//!
//! Streaming bundle/unbundle pipelines for raw disk images.
//!
//! Bundling wraps an image in a single-entry tar container, digests the
//! container stream with SHA-1, compresses it with gzip, encrypts it with
//! AES-128-CBC, and splits the result into fixed-size parts, each with its
//! own SHA-1. Unbundling runs the chain backwards and checks the recomputed
//! image digest against the trusted one.
//!
//! Every stage runs concurrently and moves at most one chunk at a time, so
//! memory stays bounded and a slow consumer stalls the producer instead of
//! piling up data.
//!
//! ## Quick Start
//!
//! ### Bundling an Image
//!
//! ```rust,no_run
//! use std::fs::File;
//! use imgbundle::{Bundler, EncryptionContext, PipelineConfig, Result};
//!
//! fn main() -> Result<()> {
//!     let ctx = EncryptionContext::generate()?;
//!     let image = File::open("disk.img")?;
//!     let size = image.metadata()?.len();
//!
//!     let result = Bundler::new(ctx, "out/")
//!         .config(PipelineConfig::new().max_pending_parts(Some(4)))
//!         .bundle_with(image, "disk.img", size, |part| {
//!             // Upload the part here; returning frees its admission slot.
//!             println!("{} {} {}", part.filename(), part.size, part.digest);
//!             Ok(())
//!         })?;
//!
//!     println!(
//!         "{} parts, image digest {}",
//!         result.manifest.parts.len(),
//!         result.manifest.image_digest
//!     );
//!     Ok(())
//! }
//! ```
//!
//! ### Restoring an Image
//!
//! ```rust,no_run
//! use std::fs::File;
//! use imgbundle::{BundleManifest, EncryptionContext, Result, Unbundler};
//!
//! fn restore(manifest: &BundleManifest, ctx: EncryptionContext) -> Result<()> {
//!     let mut dest = File::create("restored.img")?;
//!     let result = Unbundler::new(ctx)
//!         .max_bytes(Some(64 * 1024 * 1024 * 1024))
//!         .unbundle_manifest(manifest, "out/", &mut dest)?;
//!     println!("restored {} bytes of '{}'", result.bytes_written, result.entry_name);
//!     Ok(())
//! }
//! # fn main() {}
//! ```
//!
//! ## Backends
//!
//! The compression and cipher stages run in-process by default
//! ([`StageBackend::Native`]). [`StageBackend::External`] runs `pigz` (or
//! `gzip`) and `openssl enc` as child processes connected by kernel pipes.
//! Both produce streams the other can read.
//!
//! ## Error Handling
//!
//! All operations return [`Result<T>`]. Digest and size mismatches are
//! reported as [`Error::Integrity`] with the expected and observed values:
//!
//! ```rust,no_run
//! use imgbundle::{Error, IntegritySubject};
//!
//! fn explain(err: &Error) {
//!     match err {
//!         Error::Integrity(f) if f.subject == IntegritySubject::ImageDigest => {
//!             eprintln!("wrong key or corrupt bundle: {f}");
//!         }
//!         Error::QuotaExceeded { limit, .. } => eprintln!("image larger than {limit} bytes"),
//!         other => eprintln!("{other}"),
//!     }
//! }
//! # fn main() {}
//! ```
//!
//! ## Logging
//!
//! Diagnostics go through the [`log`] facade. No logger is installed by the
//! library; key material is never logged.
//!
//! ## Minimum Supported Rust Version (MSRV)
//!
//! This crate requires **Rust 1.87** or later.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod archive;
pub mod bundle;
pub mod config;
pub mod copy;
pub mod crypto;
pub mod digest;
pub mod error;
pub mod manifest;
pub mod part;
pub mod pipeline;
pub mod progress;
pub mod stage;

pub use archive::{Archiver, Extractor};
pub use bundle::{BundleResult, Bundler, UnbundleResult, Unbundler};
pub use config::{ExternalPrograms, PipelineConfig, StageBackend};
pub use copy::{CopyLimit, copy_with_limit};
pub use crypto::{EncryptionAlgorithm, EncryptionContext};
pub use digest::{ByteDigester, DigestAlgorithm, Sha1Digest};
pub use error::{Error, ExitFailure, IntegrityFailure, IntegritySubject, Result};
pub use manifest::BundleManifest;
pub use part::{BundlePart, PartGate, PartReader, PartWriter};
pub use pipeline::{
    PipelineHandle, PipelineOutcome, PipelineState, StageFailure, create_bundle_pipeline,
    create_unbundle_pipeline,
};
pub use progress::{
    NoProgress, ProgressReporter, StatisticsProgress, ThrottledProgress, progress_fn,
};
pub use stage::{CipherStage, CompressionStage, StageId, StageInput, StageOutput};
