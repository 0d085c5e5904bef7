//! Integration tests for deepscan

mod common;

use std::sync::Arc;

use common::*;
use deepscan::{
    start_recovery, BlockReader, ErrorKind, Outcome, OverwritePolicy, RecoveryEvent,
    RecoveryOptions, RecoverySession, SessionState, SignatureCatalog,
};
use tempfile::tempdir;

const MIB: usize = 1024 * 1024;

#[tokio::test]
async fn test_recovers_embedded_files_from_image() {
    let dir = tempdir().unwrap();
    let photo = jpeg(20_000);
    let archive = zip(None);
    let data = image(10 * MIB, &[(1024, &photo), (500_000, &archive)]);
    let source = write_image(dir.path(), &data);
    let out = dir.path().join("out");

    let (mut session, events) = start_recovery(&source, &out, RecoveryOptions::default()).unwrap();
    let events = collect(events).await;
    assert_eq!(session.wait().unwrap(), SessionState::Completed);

    let report = final_report(&events);
    assert_eq!(report.recovered, 2);
    assert_eq!(report.rejected, 0);
    assert_eq!(report.total_bytes, (10 * MIB) as u64);
    assert_eq!(report.bytes_scanned, report.total_bytes);

    let types: Vec<&str> = report.files.iter().map(|f| f.type_id.as_str()).collect();
    assert_eq!(types, vec!["jpeg", "zip"]);

    let (a, b) = (&report.files[0], &report.files[1]);
    assert!(a.source_end <= b.source_start);
    assert_eq!(a.source_start, 1024);
    assert_eq!(b.source_start, 500_000);

    assert_eq!(std::fs::read(&a.path).unwrap(), photo);
    assert_eq!(std::fs::read(&b.path).unwrap(), archive);
    assert_eq!(a.blake3, blake3::hash(&photo).to_hex().to_string());
    assert!(out.join("recovery_report.json").exists());

    let files_seen = events
        .iter()
        .filter(|e| matches!(e, RecoveryEvent::FileRecovered { .. }))
        .count();
    assert_eq!(files_seen, 2);
}

#[tokio::test]
async fn test_random_filler_yields_no_false_rejections() {
    let dir = tempdir().unwrap();
    let photo = jpeg(20_000);
    let archive = zip(None);
    let data = noisy_image(10 * MIB, 0x5EED_CAFE, &[(1024, &photo), (500_000, &archive)]);
    assert!(data.windows(2).filter(|w| *w == b"BM").count() > 50);
    let source = write_image(dir.path(), &data);

    let (mut session, events) =
        start_recovery(&source, dir.path().join("out"), RecoveryOptions::default()).unwrap();
    let events = collect(events).await;
    assert_eq!(session.wait().unwrap(), SessionState::Completed);

    let report = final_report(&events);
    assert_eq!(report.recovered, 2);
    assert_eq!(report.rejected, 0, "{:?}", report.rejections);
    assert!(report.rejections.is_empty());
    assert_eq!(report.files[0].source_start, 1024);
    assert_eq!(report.files[1].source_start, 500_000);
    assert_eq!(std::fs::read(&report.files[0].path).unwrap(), photo);
    assert_eq!(std::fs::read(&report.files[1].path).unwrap(), archive);
}

#[tokio::test]
async fn test_corrupt_zip_directory_recovered_with_warnings() {
    let dir = tempdir().unwrap();
    let archive = zip(Some(0x00FF_FFF0));
    let data = image(256 * 1024, &[(8192, &archive)]);
    let out = dir.path().join("out");

    let mut session = RecoverySession::new(
        Arc::new(SignatureCatalog::builtin()),
        RecoveryOptions::default(),
    );
    let events = collect(
        session
            .start_with_reader(BlockReader::from_bytes(data), &out)
            .unwrap(),
    )
    .await;
    session.wait().unwrap();

    let report = final_report(&events);
    assert_eq!(report.recovered, 1);
    assert_eq!(report.with_warnings, 1);
    let file = &report.files[0];
    assert_eq!(file.outcome, Outcome::AcceptedWithWarnings);
    assert!(file
        .warnings
        .iter()
        .any(|w| w.contains("central directory offset")));
    assert_eq!(std::fs::read(&file.path).unwrap(), archive);
}

#[tokio::test]
async fn test_truncated_file_at_end_is_rejected() {
    let dir = tempdir().unwrap();
    let mut data = filler(64 * 1024);
    let photo = jpeg(4000);
    let cut = &photo[..photo.len() - 2];
    let at = data.len() - cut.len();
    data[at..].copy_from_slice(cut);

    let mut session = RecoverySession::new(
        Arc::new(SignatureCatalog::builtin()),
        RecoveryOptions::default(),
    );
    let events = collect(
        session
            .start_with_reader(BlockReader::from_bytes(data), dir.path())
            .unwrap(),
    )
    .await;
    session.wait().unwrap();

    let report = final_report(&events);
    assert_eq!(report.recovered, 0);
    assert_eq!(report.rejected, 1);
    assert_eq!(report.rejections[0].offset, at as u64);
    assert_eq!(report.rejections[0].kind, ErrorKind::NoFooterFound);
}

#[tokio::test]
async fn test_cancel_keeps_completed_files() {
    let dir = tempdir().unwrap();
    let photo = jpeg(10_000);
    let data = image(8 * MIB, &[(4096, &photo), (6 * MIB, &photo)]);
    let out = dir.path().join("out");

    let mut session = RecoverySession::new(
        Arc::new(SignatureCatalog::builtin()),
        RecoveryOptions::default(),
    );
    let gate = GatedSource::new(data, 2 * MIB as u64, session.cancel_token());
    let mut events = session
        .start_with_reader(BlockReader::from_source("gated.img", gate), &out)
        .unwrap();

    let mut seen = Vec::new();
    while let Some(event) = events.recv().await {
        if matches!(event, RecoveryEvent::FileRecovered { .. }) {
            session.cancel().unwrap();
        }
        seen.push(event);
    }
    assert_eq!(session.wait().unwrap(), SessionState::Cancelled);

    let report = final_report(&seen);
    assert_eq!(report.state, SessionState::Cancelled);
    assert_eq!(report.recovered, 1);
    assert!(report.bytes_scanned < report.total_bytes);
    assert_eq!(std::fs::read(&report.files[0].path).unwrap(), photo);
    assert_eq!(partial_files(&out), 0);

    let on_disk = deepscan::RecoveryReport::load(&out.join("recovery_report.json")).unwrap();
    assert_eq!(on_disk.state, SessionState::Cancelled);
}

#[tokio::test]
async fn test_repeat_runs_are_identical() {
    let dir = tempdir().unwrap();
    let photo = jpeg(3000);
    let archive = zip(None);
    let data = image(MIB, &[(0, &photo), (300_000, &archive), (700_001, &photo)]);
    let source = write_image(dir.path(), &data);

    let mut reports = Vec::new();
    for run in ["first", "second"] {
        let (mut session, events) =
            start_recovery(&source, dir.path().join(run), RecoveryOptions::default()).unwrap();
        let events = collect(events).await;
        session.wait().unwrap();
        reports.push(final_report(&events).clone());
    }

    assert_eq!(reports[0].recovered, 3);
    assert_eq!(reports[0].recovered, reports[1].recovered);
    assert_eq!(reports[0].rejected, reports[1].rejected);
    assert_eq!(hashes(&reports[0]), hashes(&reports[1]));
}

#[tokio::test]
async fn test_sector_aligned_skips_unaligned_headers() {
    let dir = tempdir().unwrap();
    let photo = jpeg(2000);
    let data = image(256 * 1024, &[(1024, &photo), (50_001, &photo)]);
    let source = write_image(dir.path(), &data);

    let mut options = RecoveryOptions::default();
    options.scan.stride = 512;
    let (mut session, events) = start_recovery(&source, dir.path().join("out"), options).unwrap();
    let events = collect(events).await;
    session.wait().unwrap();

    let report = final_report(&events);
    assert_eq!(report.recovered, 1);
    assert_eq!(report.files[0].source_start, 1024);
}

#[tokio::test]
async fn test_mmap_source_matches_positioned_reads() {
    let dir = tempdir().unwrap();
    let photo = jpeg(5000);
    let data = image(2 * MIB, &[(100_000, &photo)]);
    let source = write_image(dir.path(), &data);

    let options = RecoveryOptions {
        use_mmap: true,
        ..Default::default()
    };
    let (mut session, events) = start_recovery(&source, dir.path().join("out"), options).unwrap();
    let events = collect(events).await;
    assert_eq!(session.wait().unwrap(), SessionState::Completed);
    assert_eq!(final_report(&events).recovered, 1);
}

#[tokio::test]
async fn test_refuse_policy_fails_on_non_empty_destination() {
    let dir = tempdir().unwrap();
    let out = dir.path().join("out");
    std::fs::create_dir_all(&out).unwrap();
    std::fs::write(out.join("keep.txt"), b"mine").unwrap();

    let options = RecoveryOptions {
        overwrite: OverwritePolicy::Refuse,
        ..Default::default()
    };
    let mut session = RecoverySession::new(Arc::new(SignatureCatalog::builtin()), options);
    let events = collect(
        session
            .start_with_reader(BlockReader::from_bytes(image(4096, &[])), &out)
            .unwrap(),
    )
    .await;
    assert_eq!(session.wait().unwrap(), SessionState::Failed);
    assert!(matches!(
        events.last(),
        Some(RecoveryEvent::Failed {
            kind: ErrorKind::DestinationUnwritable,
            ..
        })
    ));
    assert_eq!(std::fs::read(out.join("keep.txt")).unwrap(), b"mine");
}

#[test]
fn test_events_serialize_as_tagged_json() {
    let event = RecoveryEvent::Progress {
        scanned_bytes: 512,
        total_bytes: 1024,
        files_recovered: 0,
    };
    let line = serde_json::to_string(&event).unwrap();
    assert!(line.starts_with(r#"{"event":"progress""#));
    let back: RecoveryEvent = serde_json::from_str(&line).unwrap();
    assert_eq!(back.percent(), Some(50.0));
}
