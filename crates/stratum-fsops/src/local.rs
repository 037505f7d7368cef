//! Local filesystem storage rooted at a directory, and the registry of named
//! locations that transfer payloads refer to.
//!
//! # Design
//! - Paths are interpreted relative to the location root; a leading `/` is ignored.
//! - Parent-directory segments are rejected so a payload cannot escape its root.
//! - Blocking filesystem calls go through `tokio::fs`.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use stratum_core::{
    ByteSink, ByteStream, CoreError, CoreResult, EntryInfo, StorageCapability, StorageSink,
};
use tokio::fs;

use crate::error::{FsOpsError, FsOpsResult};

/// Storage backend over one local directory tree.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    /// Serve `root` and everything below it.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory of this location.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path for `path` inside the root.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidPayload`] when `path` contains `..` segments.
    pub fn resolve(&self, path: &str) -> CoreResult<PathBuf> {
        let mut resolved = self.root.clone();
        for component in Path::new(path).components() {
            match component {
                Component::Normal(segment) => resolved.push(segment),
                Component::RootDir | Component::CurDir => {}
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(CoreError::InvalidPayload {
                        field: "path",
                        reason: "must stay inside the location root",
                        value: Some(path.to_string()),
                    });
                }
            }
        }
        Ok(resolved)
    }

    fn relative(&self, absolute: &Path) -> String {
        absolute
            .strip_prefix(&self.root)
            .unwrap_or(absolute)
            .to_string_lossy()
            .into_owned()
    }

    fn describe(&self, absolute: &Path, metadata: &std::fs::Metadata) -> EntryInfo {
        EntryInfo {
            path: self.relative(absolute),
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            is_directory: metadata.is_dir(),
            modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            metadata: BTreeMap::new(),
        }
    }
}

#[async_trait]
impl StorageCapability for LocalStorage {
    async fn list(&self, path: &str) -> CoreResult<Vec<EntryInfo>> {
        let dir = self.resolve(path)?;
        let mut reader = fs::read_dir(&dir)
            .await
            .map_err(|err| CoreError::storage("local.list", path, err))?;
        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|err| CoreError::storage("local.list.entry", path, err))?
        {
            let metadata = entry
                .metadata()
                .await
                .map_err(|err| CoreError::storage("local.list.metadata", path, err))?;
            entries.push(self.describe(&entry.path(), &metadata));
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    async fn info(&self, path: &str) -> CoreResult<EntryInfo> {
        let absolute = self.resolve(path)?;
        let metadata = fs::metadata(&absolute)
            .await
            .map_err(|err| CoreError::storage("local.info", path, err))?;
        Ok(self.describe(&absolute, &metadata))
    }

    async fn open(&self, path: &str) -> CoreResult<ByteStream> {
        let absolute = self.resolve(path)?;
        let file = fs::File::open(&absolute)
            .await
            .map_err(|err| CoreError::storage("local.open", path, err))?;
        Ok(Box::new(file))
    }
}

#[async_trait]
impl StorageSink for LocalStorage {
    async fn create(&self, path: &str, overwrite: bool) -> CoreResult<ByteSink> {
        let absolute = self.resolve(path)?;
        if let Some(parent) = absolute.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|err| CoreError::storage("local.create.parent", path, err))?;
        }
        let mut options = fs::OpenOptions::new();
        options.write(true);
        if overwrite {
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }
        let file = options
            .open(&absolute)
            .await
            .map_err(|err| CoreError::storage("local.create", path, err))?;
        Ok(Box::new(file))
    }

    async fn create_dir_all(&self, path: &str) -> CoreResult<()> {
        let absolute = self.resolve(path)?;
        fs::create_dir_all(&absolute)
            .await
            .map_err(|err| CoreError::storage("local.create_dir", path, err))
    }

    async fn remove(&self, path: &str) -> CoreResult<()> {
        let absolute = self.resolve(path)?;
        let metadata = fs::metadata(&absolute)
            .await
            .map_err(|err| CoreError::storage("local.remove", path, err))?;
        let removed = if metadata.is_dir() {
            fs::remove_dir_all(&absolute).await
        } else {
            fs::remove_file(&absolute).await
        };
        removed.map_err(|err| CoreError::storage("local.remove", path, err))
    }
}

/// Named storage locations.
#[derive(Debug, Clone, Default)]
pub struct Locations {
    entries: BTreeMap<String, Arc<LocalStorage>>,
}

impl Locations {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a name-to-root map.
    #[must_use]
    pub fn from_roots<'a>(roots: impl IntoIterator<Item = (&'a String, &'a PathBuf)>) -> Self {
        roots
            .into_iter()
            .fold(Self::new(), |locations, (name, root)| {
                locations.with_location(name, root)
            })
    }

    /// Register or replace a location.
    #[must_use]
    pub fn with_location(mut self, name: &str, root: impl Into<PathBuf>) -> Self {
        self.entries
            .insert(name.to_string(), Arc::new(LocalStorage::new(root)));
        self
    }

    /// Storage for `name`.
    ///
    /// # Errors
    ///
    /// Returns [`FsOpsError::UnknownLocation`] for unregistered names.
    pub fn get(&self, name: &str) -> FsOpsResult<&Arc<LocalStorage>> {
        self.entries
            .get(name)
            .ok_or_else(|| FsOpsError::UnknownLocation {
                name: name.to_string(),
            })
    }

    /// Registered names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Number of registered locations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no location is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratum_test_support::{temp_dir, write_file};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn lists_and_describes_entries() -> anyhow::Result<()> {
        let dir = temp_dir()?;
        write_file(dir.path(), "run/a.nc", b"abc")?;
        write_file(dir.path(), "run/sub/b.nc", b"d")?;
        let storage = LocalStorage::new(dir.path());

        let listed = storage.list("run").await?;
        let names: Vec<(&str, bool)> = listed
            .iter()
            .map(|entry| (entry.path.as_str(), entry.is_directory))
            .collect();
        assert_eq!(names, vec![("run/a.nc", false), ("run/sub", true)]);

        let info = storage.info("/run/a.nc").await?;
        assert_eq!(info.size, 3);
        assert!(info.modified.is_some());
        assert!(!storage.exists("run/missing.nc").await?);
        assert!(matches!(
            storage.info("run/missing.nc").await,
            Err(CoreError::NotFound { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn create_respects_overwrite() -> anyhow::Result<()> {
        let dir = temp_dir()?;
        let storage = LocalStorage::new(dir.path());

        let mut sink = storage.create("out/x.bin", false).await?;
        sink.write_all(b"first").await?;
        sink.shutdown().await?;
        assert!(storage.create("out/x.bin", false).await.is_err());

        let mut sink = storage.create("out/x.bin", true).await?;
        sink.write_all(b"2").await?;
        sink.shutdown().await?;

        let mut bytes = Vec::new();
        storage.open("out/x.bin").await?.read_to_end(&mut bytes).await?;
        assert_eq!(bytes, b"2");

        storage.remove("out").await?;
        assert!(!storage.exists("out").await?);
        Ok(())
    }

    #[test]
    fn resolve_rejects_parent_segments() {
        let storage = LocalStorage::new("/data");
        assert_eq!(
            storage.resolve("/run/./a.nc").ok(),
            Some(PathBuf::from("/data/run/a.nc"))
        );
        assert!(storage.resolve("../etc/passwd").is_err());
        assert!(storage.resolve("run/../../x").is_err());
    }

    #[test]
    fn unknown_locations_are_reported() {
        let locations = Locations::new()
            .with_location("scratch", "/scratch")
            .with_location("work", "/work");
        assert_eq!(locations.names().collect::<Vec<_>>(), vec!["scratch", "work"]);
        assert!(locations.get("work").is_ok());
        assert!(matches!(
            locations.get("tape"),
            Err(FsOpsError::UnknownLocation { .. })
        ));
    }
}
