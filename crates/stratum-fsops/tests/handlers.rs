use std::fs;
use std::sync::Arc;

use stratum_cache::{CacheConfiguration, CacheEntryKind, CacheStore};
use stratum_core::{
    BatchFileTransfer, BulkArchiveKind, BulkArchiveOperation, CancelSignal, DirectoryTransfer,
    ExtractFilter, OperationHandler, OperationPayload, cancel_pair,
};
use stratum_fsops::{
    ArchiveCatalog, ArchiveEngine, ArchiveHandler, Locations, TransferEngine, TransferHandler,
    archive_cache_key,
};
use stratum_test_support::{bulk_archive, file_transfer, temp_dir, write_file};
use tempfile::TempDir;

struct Sites {
    _dir: TempDir,
    locations: Locations,
    scratch: std::path::PathBuf,
    work: std::path::PathBuf,
    cache_root: std::path::PathBuf,
}

fn sites() -> anyhow::Result<Sites> {
    let dir = temp_dir()?;
    let scratch = dir.path().join("scratch");
    let work = dir.path().join("work");
    fs::create_dir_all(&scratch)?;
    fs::create_dir_all(&work)?;
    let locations = Locations::new()
        .with_location("scratch", &scratch)
        .with_location("work", &work);
    Ok(Sites {
        cache_root: dir.path().join("cache"),
        _dir: dir,
        locations,
        scratch,
        work,
    })
}

fn transfer_handler(sites: &Sites) -> TransferHandler {
    TransferHandler::new(Arc::new(TransferEngine::new(sites.locations.clone())))
}

fn tar_archive(members: &[(&str, &[u8])]) -> anyhow::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, bytes) in members {
        let mut header = tar::Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, name, *bytes)?;
    }
    Ok(builder.into_inner()?)
}

#[tokio::test]
async fn file_transfer_copies_and_verifies() -> anyhow::Result<()> {
    let sites = sites()?;
    write_file(&sites.scratch, "run1/atm.nc", b"atmosphere")?;
    let handler = transfer_handler(&sites);

    let payload =
        OperationPayload::FileTransfer(file_transfer("scratch", "run1/atm.nc", "work", "in/atm.nc"));
    let outcome = handler.execute(&payload, CancelSignal::never()).await?;

    assert!(outcome.is_success());
    assert_eq!(outcome.bytes_moved, 10);
    assert_eq!(fs::read(sites.work.join("in/atm.nc"))?, b"atmosphere");
    Ok(())
}

#[tokio::test]
async fn oversized_chunk_size_is_clamped() -> anyhow::Result<()> {
    let sites = sites()?;
    write_file(&sites.scratch, "run1/ocn.nc", b"ocean")?;
    let handler = transfer_handler(&sites);

    let mut transfer = file_transfer("scratch", "run1/ocn.nc", "work", "ocn.nc");
    transfer.chunk_size = Some(usize::MAX);
    let outcome = handler
        .execute(&OperationPayload::FileTransfer(transfer), CancelSignal::never())
        .await?;

    assert!(outcome.is_success());
    assert_eq!(fs::read(sites.work.join("ocn.nc"))?, b"ocean");
    Ok(())
}

#[tokio::test]
async fn existing_destination_needs_overwrite() -> anyhow::Result<()> {
    let sites = sites()?;
    write_file(&sites.scratch, "a.nc", b"new")?;
    write_file(&sites.work, "a.nc", b"old")?;
    let handler = transfer_handler(&sites);

    let mut transfer = file_transfer("scratch", "a.nc", "work", "a.nc");
    let outcome = handler
        .execute(
            &OperationPayload::FileTransfer(transfer.clone()),
            CancelSignal::never(),
        )
        .await?;
    assert!(!outcome.is_success());
    assert_eq!(
        outcome.failed,
        vec!["a.nc: destination already exists: a.nc".to_string()]
    );
    assert_eq!(fs::read(sites.work.join("a.nc"))?, b"old");

    transfer.overwrite = true;
    let outcome = handler
        .execute(&OperationPayload::FileTransfer(transfer), CancelSignal::never())
        .await?;
    assert!(outcome.is_success());
    assert_eq!(fs::read(sites.work.join("a.nc"))?, b"new");
    Ok(())
}

#[tokio::test]
async fn batch_records_per_file_failures() -> anyhow::Result<()> {
    let sites = sites()?;
    write_file(&sites.scratch, "a.nc", b"aa")?;
    write_file(&sites.scratch, "b.nc", b"bbb")?;
    let handler = transfer_handler(&sites);

    let payload = OperationPayload::BatchFileTransfer(BatchFileTransfer {
        transfers: vec![
            file_transfer("scratch", "a.nc", "work", "a.nc"),
            file_transfer("scratch", "missing.nc", "work", "missing.nc"),
            file_transfer("scratch", "b.nc", "work", "b.nc"),
            file_transfer("scratch", "a.nc", "tape", "a.nc"),
        ],
        parallel_transfers: 2,
        stop_on_error: false,
        verify_all_checksums: true,
    });
    let outcome = handler.execute(&payload, CancelSignal::never()).await?;

    assert_eq!(outcome.sub_failures, 2);
    assert_eq!(outcome.bytes_moved, 5);
    assert_eq!(outcome.succeeded, vec!["a.nc".to_string(), "b.nc".to_string()]);
    assert!(
        outcome
            .failed
            .iter()
            .any(|entry| entry == "missing.nc: not found: missing.nc")
    );
    assert!(
        outcome
            .failed
            .iter()
            .any(|entry| entry == "a.nc: unknown storage location: tape")
    );
    assert!(!sites.work.join("missing.nc").exists());
    Ok(())
}

#[tokio::test]
async fn directory_transfer_applies_patterns() -> anyhow::Result<()> {
    let sites = sites()?;
    write_file(&sites.scratch, "run1/atm.nc", b"a")?;
    write_file(&sites.scratch, "run1/sub/ocn.nc", b"oo")?;
    write_file(&sites.scratch, "run1/restart/atm.nc", b"rrr")?;
    write_file(&sites.scratch, "run1/run.log", b"log")?;
    let handler = transfer_handler(&sites);

    let payload = OperationPayload::DirectoryTransfer(DirectoryTransfer {
        source_location: "scratch".into(),
        source_path: "run1".into(),
        dest_location: "work".into(),
        dest_path: "copy".into(),
        recursive: true,
        overwrite: false,
        verify_checksums: true,
        include_patterns: vec!["**/*.nc".into()],
        exclude_patterns: vec!["restart/**".into()],
    });
    let outcome = handler.execute(&payload, CancelSignal::never()).await?;

    assert!(outcome.is_success());
    assert_eq!(outcome.bytes_moved, 3);
    assert!(sites.work.join("copy/atm.nc").exists());
    assert!(sites.work.join("copy/sub/ocn.nc").exists());
    assert!(!sites.work.join("copy/restart/atm.nc").exists());
    assert!(!sites.work.join("copy/run.log").exists());
    Ok(())
}

#[tokio::test]
async fn cancelled_transfer_is_an_error() -> anyhow::Result<()> {
    let sites = sites()?;
    write_file(&sites.scratch, "a.nc", b"aa")?;
    let handler = transfer_handler(&sites);
    let (handle, signal) = cancel_pair();
    handle.cancel();

    let payload = OperationPayload::BatchFileTransfer(BatchFileTransfer {
        transfers: vec![file_transfer("scratch", "a.nc", "work", "a.nc")],
        parallel_transfers: 1,
        stop_on_error: false,
        verify_all_checksums: false,
    });
    assert!(handler.execute(&payload, signal).await.is_err());
    assert!(!sites.work.join("a.nc").exists());
    Ok(())
}

fn archive_handler(sites: &Sites, catalog: ArchiveCatalog) -> anyhow::Result<(ArchiveHandler, Arc<CacheStore>)> {
    let cache = Arc::new(CacheStore::open(CacheConfiguration::at(&sites.cache_root))?);
    let engine = ArchiveEngine::new(sites.locations.clone(), catalog, Arc::clone(&cache));
    Ok((ArchiveHandler::new(Arc::new(engine)), cache))
}

#[tokio::test]
async fn bulk_copy_reads_through_the_cache() -> anyhow::Result<()> {
    let sites = sites()?;
    write_file(&sites.scratch, "tape/run-1.tar", b"archive-one")?;
    let catalog = ArchiveCatalog::new().with_archive("run-1", "scratch", "tape/run-1.tar");
    let (handler, cache) = archive_handler(&sites, catalog)?;

    let payload = bulk_archive(BulkArchiveKind::Copy, &["run-1"], "work");
    let outcome = handler.execute(&payload, CancelSignal::never()).await?;
    assert!(outcome.is_success());
    assert_eq!(outcome.bytes_moved, 11);
    assert_eq!(fs::read(sites.work.join("run-1.tar"))?, b"archive-one");

    let key = archive_cache_key("run-1");
    let first = cache.get(&key).ok_or_else(|| anyhow::anyhow!("archive not cached"))?;
    assert_eq!(first.kind, CacheEntryKind::Archive);
    assert!(first.tags.contains("archive"));

    fs::remove_file(sites.work.join("run-1.tar"))?;
    let outcome = handler.execute(&payload, CancelSignal::never()).await?;
    assert!(outcome.is_success());
    let second = cache.get(&key).ok_or_else(|| anyhow::anyhow!("archive evicted"))?;
    assert!(second.access_count > first.access_count);
    Ok(())
}

#[tokio::test]
async fn bulk_move_removes_the_source() -> anyhow::Result<()> {
    let sites = sites()?;
    write_file(&sites.scratch, "run-2.tar", b"two")?;
    let catalog = ArchiveCatalog::new().with_archive("run-2", "scratch", "run-2.tar");
    let (handler, _cache) = archive_handler(&sites, catalog)?;

    let outcome = handler
        .execute(
            &bulk_archive(BulkArchiveKind::Move, &["run-2"], "work"),
            CancelSignal::never(),
        )
        .await?;

    assert!(outcome.is_success());
    assert!(sites.work.join("run-2.tar").exists());
    assert!(!sites.scratch.join("run-2.tar").exists());
    Ok(())
}

#[tokio::test]
async fn bulk_extract_filters_members_and_reports_missing_archives() -> anyhow::Result<()> {
    let sites = sites()?;
    let tar = tar_archive(&[("out/atm.nc", b"atmosphere"), ("out/run.log", b"log")])?;
    write_file(&sites.scratch, "run-3.tar", &tar)?;
    let catalog = ArchiveCatalog::new()
        .with_archive("run-3", "scratch", "run-3.tar")
        .with_archive("run-gone", "scratch", "run-gone.tar");
    let (handler, _cache) = archive_handler(&sites, catalog)?;

    let mut op = BulkArchiveOperation::new(
        BulkArchiveKind::Extract,
        vec!["run-3".into(), "run-gone".into(), "run-unknown".into()],
        "work",
    );
    op.extract_filter = ExtractFilter {
        include_patterns: vec!["**/*.nc".into()],
        exclude_patterns: Vec::new(),
    };
    let outcome = handler
        .execute(&OperationPayload::BulkArchive(op), CancelSignal::never())
        .await?;

    assert_eq!(outcome.succeeded, vec!["run-3".to_string()]);
    assert_eq!(outcome.sub_failures, 2);
    assert_eq!(
        outcome.failed,
        vec![
            "run-gone: archive not found: run-gone".to_string(),
            "run-unknown: archive not found: run-unknown".to_string(),
        ]
    );
    assert_eq!(outcome.bytes_moved, 10);
    assert_eq!(fs::read(sites.work.join("run-3/out/atm.nc"))?, b"atmosphere");
    assert!(!sites.work.join("run-3/out/run.log").exists());
    Ok(())
}

#[tokio::test]
async fn stop_on_error_skips_work_after_missing_archive() -> anyhow::Result<()> {
    let sites = sites()?;
    write_file(&sites.scratch, "run-4.tar", b"four")?;
    let catalog = ArchiveCatalog::new().with_archive("run-4", "scratch", "run-4.tar");
    let (handler, cache) = archive_handler(&sites, catalog)?;

    let mut op = BulkArchiveOperation::new(
        BulkArchiveKind::Copy,
        vec!["missing".into(), "run-4".into()],
        "work",
    );
    op.stop_on_error = true;
    let outcome = handler
        .execute(&OperationPayload::BulkArchive(op), CancelSignal::never())
        .await?;

    assert_eq!(outcome.sub_failures, 1);
    assert!(outcome.succeeded.is_empty());
    assert!(!sites.work.join("run-4.tar").exists());
    assert!(!cache.contains(&archive_cache_key("run-4")));
    Ok(())
}

#[tokio::test]
async fn unknown_destination_fails_the_operation() -> anyhow::Result<()> {
    let sites = sites()?;
    let (handler, _cache) = archive_handler(&sites, ArchiveCatalog::new())?;
    let result = handler
        .execute(
            &bulk_archive(BulkArchiveKind::Copy, &["run-1"], "tape"),
            CancelSignal::never(),
        )
        .await;
    let err = result.err().ok_or_else(|| anyhow::anyhow!("expected failure"))?;
    assert_eq!(format!("{err}"), "unknown storage location");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_archives_survive_eviction_of_their_cached_copy() -> anyhow::Result<()> {
    let sites = sites()?;
    let ids: Vec<String> = (0..6).map(|n| format!("run-{n}")).collect();
    let mut catalog = ArchiveCatalog::new();
    for (n, id) in ids.iter().enumerate() {
        let path = format!("tape/{id}.tar");
        write_file(&sites.scratch, &path, format!("archive-{n:04}").as_bytes())?;
        catalog = catalog.with_archive(id, "scratch", &path);
    }
    let mut config = CacheConfiguration::at(&sites.cache_root);
    config.archive_size_limit = 16;
    let cache = Arc::new(CacheStore::open(config)?);
    let engine = ArchiveEngine::new(sites.locations.clone(), catalog, Arc::clone(&cache));
    let handler = ArchiveHandler::new(Arc::new(engine));

    let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    let mut payload = bulk_archive(BulkArchiveKind::Copy, &refs, "work");
    if let OperationPayload::BulkArchive(op) = &mut payload {
        op.parallel_operations = ids.len();
    }
    let outcome = handler.execute(&payload, CancelSignal::never()).await?;

    assert!(outcome.is_success(), "{outcome:?}");
    assert_eq!(outcome.bytes_moved, 72);
    for (n, id) in ids.iter().enumerate() {
        assert_eq!(
            fs::read(sites.work.join(format!("{id}.tar")))?,
            format!("archive-{n:04}").as_bytes()
        );
    }
    assert!(cache.status_for(CacheEntryKind::Archive).used <= 16);
    Ok(())
}
