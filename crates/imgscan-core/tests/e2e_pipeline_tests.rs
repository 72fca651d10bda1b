use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use tempfile::tempdir;

use image::{ImageBuffer, Luma, Rgb};
use imgscan_core::analysis::{find_duplicates, ClusterKind};
use imgscan_core::config::{ClusterConfig, ScanConfig};
use imgscan_core::storage::ManifestStore;
use imgscan_core::{ScanControl, ScanEngine, ScanStatus, SilentReporter};

/// Create a small image collection.
/// Layout:
///   root/
///     a.jpg   (smooth gradient)
///     b.jpg   (byte copy of a.jpg)
///     c.jpg   (seeded noise)
fn create_test_tree(root: &Path) {
    fs::create_dir_all(root).unwrap();
    ImageBuffer::from_fn(64, 64, |x, y| Rgb([(x * 4) as u8, (y * 4) as u8, ((x + y) * 2) as u8]))
        .save(root.join("a.jpg"))
        .unwrap();
    fs::copy(root.join("a.jpg"), root.join("b.jpg")).unwrap();
    write_noise(&root.join("c.jpg"), 0x1234_5678);
}

fn write_noise(path: &Path, seed: u64) {
    let mut state = seed;
    ImageBuffer::from_fn(64, 64, |_, _| {
        state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        Luma([(state >> 56) as u8])
    })
    .save(path)
    .unwrap();
}

fn scan_config() -> ScanConfig {
    ScanConfig {
        workers: 2,
        batch_size: 2,
        ..ScanConfig::default()
    }
}

#[test]
fn test_three_file_scenario() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().join("images");
    create_test_tree(&root);
    let manifest_path = tmp.path().join("manifest.jsonl");

    let result = ScanEngine::new(scan_config())
        .with_manifest_path(&manifest_path)
        .scan(&root, &SilentReporter)
        .unwrap();
    assert_eq!(result.status(), ScanStatus::Completed);
    assert_eq!(result.outcome.discovered, 3);
    assert_eq!(result.outcome.ok, 3);
    assert_eq!(result.outcome.records_written, 3);

    let manifest = ManifestStore::new(&manifest_path).read_all().unwrap();
    let header = manifest.header.clone().unwrap();
    assert_eq!(header.total_files, 3);
    assert_eq!(header.last_scan.unwrap().status, ScanStatus::Completed);

    let records = manifest.into_latest();
    assert_eq!(records.len(), 3);
    let a = records[0].fingerprint().unwrap();
    let b = records[1].fingerprint().unwrap();
    assert_eq!(a.content_hash, b.content_hash);
    assert_eq!(a.phash, b.phash);
    assert_eq!((a.width, a.height, a.format.as_str()), (64, 64, "jpeg"));

    let report = find_duplicates(&records, &ClusterConfig::default()).unwrap();
    assert_eq!(report.clusters.len(), 1);
    let cluster = &report.clusters[0];
    assert_eq!(cluster.kind, ClusterKind::Exact);
    assert_eq!(cluster.members.len(), 2);
    assert!(cluster.members[0].ends_with("a.jpg"));
    assert!(cluster.members[1].ends_with("b.jpg"));
}

#[test]
fn test_rescan_is_idempotent_and_detects_changes() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().join("images");
    create_test_tree(&root);
    let manifest_path = tmp.path().join("manifest.jsonl");
    let engine = ScanEngine::new(scan_config()).with_manifest_path(&manifest_path);

    engine.scan(&root, &SilentReporter).unwrap();
    let again = engine.scan(&root, &SilentReporter).unwrap();
    assert!(again.resumed);
    assert_eq!(again.prior_records, 3);
    assert_eq!(again.outcome.skipped, 3);
    assert_eq!(again.outcome.analyzed(), 0);
    assert_eq!(ManifestStore::new(&manifest_path).read_all().unwrap().records.len(), 3);

    ImageBuffer::from_fn(80, 40, |x, _| Luma([(x * 3) as u8]))
        .save(root.join("c.jpg"))
        .unwrap();
    let changed = engine.scan(&root, &SilentReporter).unwrap();
    assert_eq!(changed.outcome.skipped, 2);
    assert_eq!(changed.outcome.analyzed(), 1);

    let manifest = ManifestStore::new(&manifest_path).read_all().unwrap();
    assert_eq!(manifest.records.len(), 4);
    let latest = manifest.into_latest();
    assert_eq!(latest.len(), 3);
    assert_eq!(latest[2].fingerprint().unwrap().width, 80);

    // Four records on disk, three files: the superseded c.jpg counts once.
    let third = engine.scan(&root, &SilentReporter).unwrap();
    assert_eq!(third.prior_records, 3);
    assert_eq!(third.outcome.skipped, 3);
}

#[test]
fn test_corrupt_file_is_recorded_not_fatal() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().join("images");
    create_test_tree(&root);
    fs::write(root.join("d.png"), b"\x89PNG\r\n\x1a\nthen garbage").unwrap();
    let manifest_path = tmp.path().join("manifest.jsonl");

    let result = ScanEngine::new(scan_config())
        .with_manifest_path(&manifest_path)
        .scan(&root, &SilentReporter)
        .unwrap();
    assert_eq!(result.outcome.ok, 3);
    assert_eq!(result.outcome.corrupt, 1);

    let records = ManifestStore::new(&manifest_path).read_all().unwrap().into_latest();
    let report = find_duplicates(&records, &ClusterConfig::default()).unwrap();
    assert_eq!(report.excluded.len(), 1);
    assert!(report.excluded[0].path.ends_with("d.png"));
}

#[test]
fn test_torn_manifest_tail_is_recomputed() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().join("images");
    create_test_tree(&root);
    let manifest_path = tmp.path().join("manifest.jsonl");
    let engine = ScanEngine::new(scan_config()).with_manifest_path(&manifest_path);
    engine.scan(&root, &SilentReporter).unwrap();

    // Simulate a crash mid-append: cut the last record line in half.
    let bytes = fs::read(&manifest_path).unwrap();
    let body = &bytes[..bytes.len() - 1];
    let last_start = body.iter().rposition(|b| *b == b'\n').unwrap() + 1;
    let cut = last_start + (body.len() - last_start) / 2;
    fs::write(&manifest_path, &bytes[..cut]).unwrap();

    let recovered = ManifestStore::new(&manifest_path).read_all().unwrap();
    assert_eq!(recovered.records.len(), 2);
    assert!(recovered.discarded_tail.is_some());

    let result = engine.scan(&root, &SilentReporter).unwrap();
    assert!(result.truncated_bytes > 0);
    assert_eq!(result.outcome.skipped, 2);
    assert_eq!(result.outcome.analyzed(), 1);

    let manifest = ManifestStore::new(&manifest_path).read_all().unwrap();
    assert!(manifest.discarded_tail.is_none());
    assert_eq!(manifest.records.len(), 3);
}

#[test]
fn test_interrupted_scan_resumes() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().join("images");
    create_test_tree(&root);
    let manifest_path = tmp.path().join("manifest.jsonl");

    let control = ScanControl::new();
    control.request_drain();
    let interrupted = ScanEngine::new(scan_config())
        .with_manifest_path(&manifest_path)
        .with_control(control)
        .scan(&root, &SilentReporter)
        .unwrap();
    assert_eq!(interrupted.status(), ScanStatus::Interrupted);
    let header = ManifestStore::new(&manifest_path)
        .read_all()
        .unwrap()
        .header
        .unwrap();
    assert_eq!(header.last_scan.unwrap().status, ScanStatus::Interrupted);

    let resumed = ScanEngine::new(scan_config())
        .with_manifest_path(&manifest_path)
        .scan(&root, &SilentReporter)
        .unwrap();
    assert_eq!(resumed.status(), ScanStatus::Completed);
    assert_eq!(resumed.outcome.records_written, 3);
}

#[test]
fn test_force_starts_over_and_root_mismatch_is_rejected() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().join("images");
    let other = tmp.path().join("other");
    create_test_tree(&root);
    create_test_tree(&other);
    let manifest_path = tmp.path().join("manifest.jsonl");

    ScanEngine::new(scan_config())
        .with_manifest_path(&manifest_path)
        .scan(&root, &SilentReporter)
        .unwrap();

    let mismatch = ScanEngine::new(scan_config())
        .with_manifest_path(&manifest_path)
        .scan(&other, &SilentReporter);
    assert!(mismatch.is_err());

    let forced = ScanEngine::new(ScanConfig {
        force: true,
        ..scan_config()
    })
    .with_manifest_path(&manifest_path)
    .scan(&other, &SilentReporter)
    .unwrap();
    assert_eq!(forced.outcome.records_written, 3);
    assert_eq!(ManifestStore::new(&manifest_path).read_all().unwrap().records.len(), 3);
}

#[test]
fn test_missing_root_is_invalid_path() {
    let tmp = tempdir().unwrap();
    let result = ScanEngine::new(scan_config())
        .with_manifest_path(tmp.path().join("m.jsonl"))
        .scan(&tmp.path().join("nope"), &SilentReporter);
    assert!(matches!(result, Err(imgscan_core::Error::InvalidPath(_))));
}

#[test]
fn test_header_only_manifest_is_appended_to() {
    let tmp = tempdir().unwrap();
    let root = tmp.path().join("images");
    create_test_tree(&root);
    let manifest_path = tmp.path().join("manifest.jsonl");
    ScanEngine::new(scan_config())
        .with_manifest_path(&manifest_path)
        .with_control({
            let control = ScanControl::new();
            control.request_drain();
            control
        })
        .scan(&root, &SilentReporter)
        .unwrap();

    // Trailing whitespace after the header must not break the next append.
    let mut file = OpenOptions::new().append(true).open(&manifest_path).unwrap();
    file.write_all(b"\n\n").unwrap();
    drop(file);

    ScanEngine::new(scan_config())
        .with_manifest_path(&manifest_path)
        .scan(&root, &SilentReporter)
        .unwrap();
    assert_eq!(ManifestStore::new(&manifest_path).read_all().unwrap().records.len(), 3);
}
