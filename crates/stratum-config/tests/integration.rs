use std::fs;

use stratum_config::{CleanupPolicy, ConfigError, ConfigLoader};
use stratum_core::Priority;

#[test]
fn yaml_file_then_env_overrides() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("stratum.yaml");
    fs::write(
        &path,
        r"
queue:
  max_concurrent: 2
  default_priority: high
cache:
  directory: /scratch/cache
  archive_size_limit: 1000
  file_size_limit: 200
  cleanup_policy: manual
  unified_cache: true
hsm:
  api_url: https://hsm.example/v1
  account: esm
  stage_timeout_secs: 60
",
    )?;

    let config = ConfigLoader::new()
        .with_file(&path)
        .with_env("STRATUM_CACHE_DIR", "/fast/cache")
        .with_env("STRATUM_HSM_PASSWORD", "secret")
        .load()?;

    assert_eq!(config.queue.max_concurrent, 2);
    assert_eq!(config.queue.default_priority, Priority::High);
    assert_eq!(config.queue.idle_poll_ms, 250);
    assert_eq!(config.cache.directory.to_str(), Some("/fast/cache"));
    assert_eq!(config.cache.archive_size_limit, 1000);
    assert_eq!(config.cache.cleanup_policy, CleanupPolicy::Manual);
    assert!(config.cache.unified_cache);
    assert_eq!(config.hsm.account.as_deref(), Some("esm"));
    assert_eq!(config.hsm.password.as_deref(), Some("secret"));
    assert_eq!(config.hsm.stage_timeout_secs, 60);
    assert_eq!(config.hsm.poll_interval_ms, 1_000);
    Ok(())
}

#[test]
fn unknown_keys_are_rejected() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("stratum.yaml");
    fs::write(&path, "queue:\n  max_concurency: 4\n")?;

    let err = ConfigLoader::new()
        .with_file(&path)
        .load()
        .expect_err("typo should fail");
    assert!(matches!(err, ConfigError::Yaml { .. }));
    Ok(())
}

#[test]
fn empty_file_yields_defaults() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("stratum.yaml");
    fs::write(&path, "\n")?;

    let config = ConfigLoader::new().with_file(&path).load()?;
    assert_eq!(config.queue.max_concurrent, 3);
    assert_eq!(config.cache.cleanup_policy, CleanupPolicy::Lru);
    Ok(())
}
