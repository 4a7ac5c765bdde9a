//! Corruption, wrong-key, and truncation detection tests.
//!
//! Every failure here must surface as `Error::Integrity` with enough context
//! to tell what was expected and what was observed.

mod common;

use std::fs::{self, File};
use std::io::{Cursor, Read};

use common::{bundle_into, flip_bit, random_image, sparse_image, test_context, unbundle_from};
use imgbundle::{
    EncryptionContext, Error, IntegrityFailure, IntegritySubject, PipelineConfig, Unbundler,
};

fn concatenate(parts: &[imgbundle::BundlePart]) -> Vec<u8> {
    let mut stream = Vec::new();
    for part in parts {
        File::open(&part.path).unwrap().read_to_end(&mut stream).unwrap();
    }
    stream
}

fn integrity(err: Error) -> IntegrityFailure {
    match err {
        Error::Integrity(failure) => failure,
        other => panic!("expected an integrity failure, got {other:?}"),
    }
}

// =============================================================================
// Part Verification
// =============================================================================

#[test]
fn test_flipped_bit_in_any_part_is_detected() {
    let data = random_image(60_000, 31);
    let config = PipelineConfig::default().part_size(16 * 1024);
    let scratch = tempfile::tempdir().unwrap();
    let count = bundle_into(scratch.path(), config.clone(), "f.img", &data)
        .unwrap()
        .manifest
        .parts
        .len();

    for index in 0..count {
        let dir = tempfile::tempdir().unwrap();
        let result = bundle_into(dir.path(), config.clone(), "f.img", &data).unwrap();
        flip_bit(&result.manifest.parts[index].path, 1000 + index * 37, index as u8);

        // Either the part check fires, or a downstream stage chokes on the
        // corrupted bytes first and the image digest check catches it.
        let failure = integrity(unbundle_from(dir.path(), config.clone(), &result).unwrap_err());
        match failure.subject {
            IntegritySubject::PartDigest { index: i } => {
                assert_eq!(i, index as u32);
                assert_eq!(failure.expected, result.manifest.parts[index].digest.to_string());
            }
            IntegritySubject::ImageDigest => {
                assert_eq!(failure.expected, result.manifest.image_digest.to_string());
            }
            other => panic!("unexpected subject {other}"),
        }
    }
}

#[test]
fn test_truncated_part_is_detected() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig::default().part_size(16 * 1024);
    let data = random_image(50_000, 2);
    let result = bundle_into(dir.path(), config.clone(), "t.img", &data).unwrap();
    let path = &result.manifest.parts[1].path;
    let bytes = fs::read(path).unwrap();
    fs::write(path, &bytes[..bytes.len() - 100]).unwrap();

    let failure = integrity(unbundle_from(dir.path(), config, &result).unwrap_err());
    assert_eq!(failure.subject, IntegritySubject::PartSize { index: 1 });
    assert_eq!(failure.expected, (16 * 1024).to_string());
}

#[test]
fn test_missing_part_is_reported_before_starting() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig::default().part_size(16 * 1024);
    let data = random_image(50_000, 3);
    let result = bundle_into(dir.path(), config.clone(), "m.img", &data).unwrap();
    fs::remove_file(&result.manifest.parts[2].path).unwrap();

    match unbundle_from(dir.path(), config, &result).unwrap_err() {
        Error::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::NotFound),
        other => panic!("unexpected error: {other:?}"),
    }
}

// =============================================================================
// Whole-Image Digest
// =============================================================================

#[test]
fn test_flipped_bit_in_stream_fails_image_digest() {
    let dir = tempfile::tempdir().unwrap();
    let data = sparse_image(400_000);
    let result = bundle_into(dir.path(), PipelineConfig::default(), "s.img", &data).unwrap();

    let stream = concatenate(&result.manifest.parts);
    for offset in [0, 17, stream.len() / 2, stream.len() - 20, stream.len() - 1] {
        let mut corrupted = stream.clone();
        corrupted[offset] ^= 0x04;

        let err = Unbundler::new(test_context())
            .expected_digest(result.manifest.image_digest)
            .unbundle_stream(Cursor::new(corrupted), &mut Vec::new())
            .unwrap_err();
        let failure = integrity(err);
        assert_eq!(failure.subject, IntegritySubject::ImageDigest, "offset {offset}");
        assert_eq!(failure.expected, result.manifest.image_digest.to_string());
    }
}

#[test]
fn test_wrong_key_fails_image_digest() {
    let dir = tempfile::tempdir().unwrap();
    let data = random_image(30_000, 5);
    let result = bundle_into(dir.path(), PipelineConfig::default(), "k.img", &data).unwrap();
    let wrong = EncryptionContext::from_hex(
        "00000000000000000000000000000000",
        "000102030405060708090a0b0c0d0e0f",
    )
    .unwrap();

    let err = Unbundler::new(wrong)
        .unbundle_manifest(&result.manifest, dir.path(), &mut Vec::new())
        .unwrap_err();
    let failure = integrity(err);
    assert_eq!(failure.subject, IntegritySubject::ImageDigest);
    assert_ne!(failure.actual, Some(failure.expected.clone()));
    // The decrypt or decompress stage failed before the digest was checked.
    assert!(failure.cause.is_some());
    assert!(failure.to_string().contains(&result.manifest.image_digest.to_string()));
}

#[test]
fn test_wrong_iv_only_corrupts_first_block() {
    // CBC with a wrong IV garbles only the first plaintext block, which is
    // the gzip header; the pipeline must still refuse the result.
    let dir = tempfile::tempdir().unwrap();
    let data = sparse_image(50_000);
    let result = bundle_into(dir.path(), PipelineConfig::default(), "iv.img", &data).unwrap();
    let ctx = test_context();
    let wrong_iv = EncryptionContext::from_hex(
        ctx.key_hex().as_str(),
        "ffffffffffffffffffffffffffffffff",
    )
    .unwrap();

    let err = Unbundler::new(wrong_iv)
        .unbundle_manifest(&result.manifest, dir.path(), &mut Vec::new())
        .unwrap_err();
    assert_eq!(integrity(err).subject, IntegritySubject::ImageDigest);
}

#[test]
fn test_stream_without_expected_digest_reports_stage_error() {
    let mut garbage = random_image(4096, 77);
    garbage.truncate(4096 - 5);
    let err = Unbundler::new(test_context())
        .unbundle_stream(Cursor::new(garbage), &mut Vec::new())
        .unwrap_err();
    assert!(!err.is_broken_pipe());
    assert!(!err.is_integrity());
}

#[test]
fn test_truncated_stream_fails_image_digest() {
    let dir = tempfile::tempdir().unwrap();
    let data = random_image(80_000, 8);
    let result = bundle_into(dir.path(), PipelineConfig::default(), "tr.img", &data).unwrap();
    let mut stream = concatenate(&result.manifest.parts);
    stream.truncate(stream.len() / 2);

    let mut dest = Vec::new();
    let err = Unbundler::new(test_context())
        .expected_digest(result.manifest.image_digest)
        .expected_size(80_000)
        .unbundle_stream(Cursor::new(stream), &mut dest)
        .unwrap_err();
    let failure = integrity(err);
    assert_eq!(failure.subject, IntegritySubject::ImageDigest);
    assert!(dest.len() < 80_000);
}
