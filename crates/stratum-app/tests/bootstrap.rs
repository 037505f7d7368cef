use std::fs;
use std::time::Duration;

use stratum_app::{Services, run_until};
use stratum_config::{ArchiveSource, CacheConfiguration, StratumConfig};
use stratum_core::{BulkArchiveKind, OperationPayload, OperationStatus, Priority};
use stratum_queue::SubmitOptions;
use stratum_test_support::{bulk_archive, file_transfer, temp_dir, write_file};

#[tokio::test]
async fn submitted_payloads_run_to_completion() -> anyhow::Result<()> {
    let dir = temp_dir()?;
    let scratch = dir.path().join("scratch");
    let work = dir.path().join("work");
    fs::create_dir_all(&work)?;
    write_file(&scratch, "runs/atm.nc", b"atmosphere")?;
    write_file(&scratch, "tape/exp1.tar", b"archived bytes")?;

    let mut config = StratumConfig {
        cache: CacheConfiguration::at(dir.path().join("cache")),
        ..StratumConfig::default()
    };
    config.storage.locations.insert("scratch".into(), scratch);
    config.storage.locations.insert("work".into(), work.clone());
    config.storage.archives.insert(
        "exp1".into(),
        ArchiveSource {
            location: "scratch".into(),
            path: "tape/exp1.tar".into(),
        },
    );
    let services = Services::build(config)?;

    let transfer = services.queue.submit(
        OperationPayload::FileTransfer(file_transfer("scratch", "runs/atm.nc", "work", "atm.nc")),
        SubmitOptions::default().tag("app-test"),
    )?;
    let copy = services.queue.submit(
        bulk_archive(BulkArchiveKind::Copy, &["exp1"], "work"),
        SubmitOptions::default().priority(Priority::High),
    )?;

    tokio::time::timeout(Duration::from_secs(10), services.wait_idle()).await?;
    run_until(&services, async {}).await;

    for id in [transfer, copy] {
        let snapshot = services
            .queue
            .get(id)
            .ok_or_else(|| anyhow::anyhow!("operation {id} missing"))?;
        assert_eq!(snapshot.status, OperationStatus::Completed, "{snapshot:?}");
    }
    assert_eq!(fs::read(work.join("atm.nc"))?, b"atmosphere");
    assert_eq!(fs::read(work.join("exp1.tar"))?, b"archived bytes");
    assert_eq!(services.cache.entries().len(), 1);

    let stats = services.queue.stats();
    assert_eq!(stats.total_processed, 2);
    assert_eq!(stats.total_bytes_processed, 24);
    Ok(())
}

#[tokio::test]
async fn unknown_locations_fail_the_operation() -> anyhow::Result<()> {
    let dir = temp_dir()?;
    let config = StratumConfig {
        cache: CacheConfiguration::at(dir.path().join("cache")),
        ..StratumConfig::default()
    };
    let services = Services::build(config)?;

    let id = services.queue.submit(
        bulk_archive(BulkArchiveKind::Extract, &["exp1"], "nowhere"),
        SubmitOptions::default(),
    )?;
    tokio::time::timeout(Duration::from_secs(10), services.wait_idle()).await?;
    run_until(&services, async {}).await;

    let snapshot = services
        .queue
        .get(id)
        .ok_or_else(|| anyhow::anyhow!("operation missing"))?;
    assert_eq!(snapshot.status, OperationStatus::Failed);
    assert!(
        snapshot
            .error_message
            .as_deref()
            .is_some_and(|message| message.contains("unknown storage location"))
    );
    Ok(())
}
