//! Bundle/unbundle round-trip tests.
//!
//! These tests bundle images of various shapes into a temporary directory
//! and verify that unbundling reproduces them bit for bit.

mod common;

use std::fs::File;
use std::io::{Cursor, Read};
use std::sync::{Arc, Mutex};

use common::{MIB, bundle_into, random_image, sparse_image, test_context, unbundle_from};
use imgbundle::{
    Archiver, BundlePart, Bundler, PipelineConfig, ProgressReporter, Sha1Digest, Unbundler,
    progress_fn,
};

fn roundtrip(config: PipelineConfig, name: &str, data: &[u8]) {
    let dir = tempfile::tempdir().unwrap();
    let result = bundle_into(dir.path(), config.clone(), name, data).unwrap();
    assert_eq!(result.manifest.image_size, data.len() as u64);
    assert_eq!(result.source_digest, Sha1Digest::compute(data));

    let (restored, out) = unbundle_from(dir.path(), config, &result).unwrap();
    assert_eq!(restored.len(), data.len());
    assert!(restored == data, "restored image differs");
    assert_eq!(out.image_digest, result.manifest.image_digest);
    assert_eq!(out.bytes_written, data.len() as u64);
}

// =============================================================================
// Image Shapes
// =============================================================================

#[test]
fn test_roundtrip_single_byte() {
    roundtrip(PipelineConfig::default(), "one.img", &[0x42]);
}

#[test]
fn test_roundtrip_around_tar_block_size() {
    for len in [511, 512, 513, 1023, 1024, 1025] {
        roundtrip(PipelineConfig::default(), "block.img", &random_image(len, len as u64));
    }
}

#[test]
fn test_roundtrip_sparse_image() {
    roundtrip(PipelineConfig::default(), "sparse.img", &sparse_image(3 * MIB));
}

#[test]
fn test_roundtrip_random_image_small_parts() {
    let config = PipelineConfig::default().part_size(64 * 1024);
    roundtrip(config, "random.img", &random_image(MIB, 7));
}

#[test]
fn test_roundtrip_tiny_chunks() {
    let config = PipelineConfig::default().chunk_size(100).part_size(10_000);
    roundtrip(config, "chunks.img", &random_image(50_000, 3));
}

#[test]
fn test_roundtrip_admission_control() {
    let config = PipelineConfig::default()
        .part_size(16 * 1024)
        .max_pending_parts(Some(1));
    roundtrip(config, "gated.img", &random_image(200_000, 11));
}

#[test]
fn test_roundtrip_compression_level_zero() {
    let config = PipelineConfig::default().compression_level(0);
    roundtrip(config, "stored.img", &sparse_image(200_000));
}

// =============================================================================
// Entry Names and Sources
// =============================================================================

#[test]
fn test_entry_name_is_basename() {
    let dir = tempfile::tempdir().unwrap();
    let result = bundle_into(
        dir.path(),
        PipelineConfig::default(),
        "/var/lib/images/vm-01.raw",
        b"image",
    )
    .unwrap();
    assert_eq!(result.manifest.image_name, "vm-01.raw");
    assert_eq!(result.manifest.parts[0].filename(), "vm-01.raw.part.00");

    let (_, out) = unbundle_from(dir.path(), PipelineConfig::default(), &result).unwrap();
    assert_eq!(out.entry_name, "vm-01.raw");
}

#[test]
fn test_custom_prefix() {
    let dir = tempfile::tempdir().unwrap();
    let result = Bundler::new(test_context(), dir.path())
        .prefix("snapshot")
        .bundle(Cursor::new(vec![1u8; 10]), "disk.img", 10)
        .unwrap();
    assert_eq!(result.manifest.parts[0].filename(), "snapshot.part.00");
    assert_eq!(result.manifest.image_name, "disk.img");
}

#[test]
fn test_bundle_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let data = random_image(300_000, 21);
    let image_path = dir.path().join("source.img");
    std::fs::write(&image_path, &data).unwrap();

    let out_dir = dir.path().join("bundle");
    let image = File::open(&image_path).unwrap();
    let result = Bundler::new(test_context(), &out_dir)
        .bundle(image, image_path.to_str().unwrap(), data.len() as u64)
        .unwrap();
    assert_eq!(result.manifest.image_name, "source.img");

    let restored_path = dir.path().join("restored.img");
    let mut restored = File::create(&restored_path).unwrap();
    Unbundler::new(test_context())
        .unbundle_manifest(&result.manifest, &out_dir, &mut restored)
        .unwrap();
    drop(restored);
    assert!(std::fs::read(&restored_path).unwrap() == data);
}

#[test]
fn test_unbundle_concatenated_stream() {
    let dir = tempfile::tempdir().unwrap();
    let data = random_image(100_000, 5);
    let config = PipelineConfig::default().part_size(30_000);
    let result = bundle_into(dir.path(), config, "stream.img", &data).unwrap();

    let mut stream = Vec::new();
    for part in &result.manifest.parts {
        File::open(&part.path).unwrap().read_to_end(&mut stream).unwrap();
    }
    assert_eq!(stream.len() as u64, result.manifest.bundled_size);

    let mut restored = Vec::new();
    let out = Unbundler::new(test_context())
        .expected_digest(result.manifest.image_digest)
        .expected_size(data.len() as u64)
        .unbundle_stream(Cursor::new(stream), &mut restored)
        .unwrap();
    assert!(restored == data);
    assert_eq!(out.source_digest, result.source_digest);
}

#[test]
fn test_unbundle_parts_without_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let data = sparse_image(500_000);
    let result = bundle_into(dir.path(), PipelineConfig::default(), "p.img", &data).unwrap();
    let parts: Vec<BundlePart> = result.manifest.parts.clone();

    let mut restored = Vec::new();
    Unbundler::new(test_context())
        .unbundle_parts(dir.path(), &parts, &mut restored)
        .unwrap();
    assert!(restored == data);
}

// =============================================================================
// Digests
// =============================================================================

#[test]
fn test_image_digest_covers_archive_stream() {
    let dir = tempfile::tempdir().unwrap();
    let data = random_image(70_000, 9);
    let result = bundle_into(dir.path(), PipelineConfig::default(), "d.img", &data).unwrap();

    let mut archive = Vec::new();
    Archiver::new(8192, true)
        .archive("d.img", data.len() as u64, Cursor::new(&data), &mut archive)
        .unwrap();
    assert_eq!(result.manifest.image_digest, Sha1Digest::compute(&archive));
    assert_ne!(result.manifest.image_digest, result.source_digest);
}

#[test]
fn test_bundling_is_deterministic() {
    let data = random_image(150_000, 13);
    let config = PipelineConfig::default().part_size(40_000);

    let first_dir = tempfile::tempdir().unwrap();
    let first = bundle_into(first_dir.path(), config.clone(), "same.img", &data).unwrap();
    let second_dir = tempfile::tempdir().unwrap();
    let second = bundle_into(second_dir.path(), config, "same.img", &data).unwrap();

    assert_eq!(first.manifest.image_digest, second.manifest.image_digest);
    let digests = |parts: &[BundlePart]| parts.iter().map(|p| p.digest).collect::<Vec<_>>();
    assert_eq!(digests(&first.manifest.parts), digests(&second.manifest.parts));
}

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<(Option<u64>, u64, Option<u64>)>>);

impl ProgressReporter for Recorder {
    fn on_total(&mut self, total: Option<u64>) {
        self.0.lock().unwrap().0 = total;
    }

    fn on_progress(&mut self, done: u64, _total: Option<u64>) {
        let mut state = self.0.lock().unwrap();
        assert!(done >= state.1, "progress went backwards");
        state.1 = done;
    }

    fn on_complete(&mut self, done: u64) {
        self.0.lock().unwrap().2 = Some(done);
    }
}

#[test]
fn test_progress_reaches_total() {
    let dir = tempfile::tempdir().unwrap();
    let data = random_image(80_000, 17);
    let result = bundle_into(dir.path(), PipelineConfig::default(), "p.img", &data).unwrap();

    let recorder = Recorder::default();
    let mut restored = Vec::new();
    Unbundler::new(test_context())
        .progress(recorder.clone())
        .unbundle_manifest(&result.manifest, dir.path(), &mut restored)
        .unwrap();

    let (total, done, complete) = *recorder.0.lock().unwrap();
    assert_eq!(total, Some(80_000));
    assert_eq!(done, 80_000);
    assert_eq!(complete, Some(80_000));
}

#[test]
fn test_unbundle_progress_is_throttled() {
    let dir = tempfile::tempdir().unwrap();
    let data = random_image(3 * MIB, 23);
    let result = bundle_into(dir.path(), PipelineConfig::default(), "t.img", &data).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let mut restored = Vec::new();
    Unbundler::new(test_context())
        .progress(progress_fn(move |done, _| sink.lock().unwrap().push(done)))
        .unbundle_manifest(&result.manifest, dir.path(), &mut restored)
        .unwrap();

    let seen = seen.lock().unwrap();
    assert!(seen.len() <= 4, "too many progress calls: {}", seen.len());
    assert_eq!(seen.last().copied(), Some(data.len() as u64));
}
