//! Shared test utilities for integration tests.
//!
//! Note: `#![allow(dead_code)]` is required because each integration test file
//! compiles as a separate crate and may only use a subset of these helpers.

#![allow(dead_code)]

use std::io::Cursor;
use std::path::Path;
use std::process::{Command, Stdio};

use imgbundle::{
    BundleResult, Bundler, EncryptionContext, PipelineConfig, UnbundleResult, Unbundler,
};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

pub const MIB: usize = 1024 * 1024;

/// A fixed key/IV pair so bundles are reproducible across runs.
pub fn test_context() -> EncryptionContext {
    EncryptionContext::from_hex(
        "2b7e151628aed2a6abf7158809cf4f3c",
        "000102030405060708090a0b0c0d0e0f",
    )
    .unwrap()
}

/// Pseudo-random, incompressible image bytes, deterministic per seed.
pub fn random_image(len: usize, seed: u64) -> Vec<u8> {
    let mut data = vec![0u8; len];
    StdRng::seed_from_u64(seed).fill_bytes(&mut data);
    data
}

/// Highly compressible image bytes: a repeating sector pattern.
pub fn sparse_image(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| if i % 4096 < 16 { (i / 4096) as u8 } else { 0 })
        .collect()
}

/// Bundles `data` into `dir` under the entry name `name`.
pub fn bundle_into(
    dir: &Path,
    config: PipelineConfig,
    name: &str,
    data: &[u8],
) -> imgbundle::Result<BundleResult> {
    Bundler::new(test_context(), dir)
        .config(config)
        .bundle(Cursor::new(data.to_vec()), name, data.len() as u64)
}

/// Restores the bundle described by `result` from `dir` into memory.
pub fn unbundle_from(
    dir: &Path,
    config: PipelineConfig,
    result: &BundleResult,
) -> imgbundle::Result<(Vec<u8>, UnbundleResult)> {
    let mut restored = Vec::new();
    let out = Unbundler::new(test_context())
        .config(config)
        .unbundle_manifest(&result.manifest, dir, &mut restored)?;
    Ok((restored, out))
}

/// Returns true if every program can be spawned.
pub fn programs_available(programs: &[&str]) -> bool {
    programs.iter().all(|program| {
        Command::new(program)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok()
    })
}

/// Flips one bit of the file at `path`.
pub fn flip_bit(path: &Path, offset: usize, bit: u8) {
    let mut bytes = std::fs::read(path).unwrap();
    let offset = offset % bytes.len();
    bytes[offset] ^= 1 << (bit % 8);
    std::fs::write(path, bytes).unwrap();
}
