//! In-memory collaborators for queue, staging, and handler tests.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use stratum_core::{
    ByteStream, CancelSignal, CoreError, CoreResult, EntryInfo, OperationHandler, OperationKind,
    OperationOutcome, OperationPayload, StorageCapability,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Read-only storage backed by a path-to-bytes map.
///
/// Directories are implied by file paths: `/a/b.nc` makes `/a` a directory.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    opens: AtomicUsize,
}

impl MemoryStorage {
    /// Empty storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`MemoryStorage::insert`].
    #[must_use]
    pub fn with_file(self, path: &str, bytes: Vec<u8>) -> Self {
        self.insert(path, bytes);
        self
    }

    /// Add or replace a file.
    pub fn insert(&self, path: &str, bytes: Vec<u8>) {
        lock(&self.files).insert(normalize(path), bytes);
    }

    /// Number of successful `open` calls.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    fn is_directory(files: &BTreeMap<String, Vec<u8>>, path: &str) -> bool {
        let prefix = dir_prefix(path);
        files.keys().any(|key| key.starts_with(&prefix))
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn dir_prefix(path: &str) -> String {
    let normalized = normalize(path);
    if normalized == "/" {
        normalized
    } else {
        format!("{normalized}/")
    }
}

fn entry(path: String, size: u64, is_directory: bool) -> EntryInfo {
    EntryInfo {
        path,
        size,
        is_directory,
        modified: None,
        metadata: BTreeMap::new(),
    }
}

#[async_trait]
impl StorageCapability for MemoryStorage {
    async fn list(&self, path: &str) -> CoreResult<Vec<EntryInfo>> {
        let files = lock(&self.files);
        let prefix = dir_prefix(path);
        if !Self::is_directory(&files, path) {
            return Err(CoreError::NotFound {
                path: path.to_string(),
            });
        }
        let mut seen_dirs = BTreeSet::new();
        let mut entries = Vec::new();
        for (key, bytes) in files.range(prefix.clone()..) {
            let Some(rest) = key.strip_prefix(&prefix) else {
                break;
            };
            match rest.split_once('/') {
                Some((dir, _)) => {
                    if seen_dirs.insert(dir.to_string()) {
                        entries.push(entry(format!("{prefix}{dir}"), 0, true));
                    }
                }
                None => entries.push(entry(key.clone(), bytes.len() as u64, false)),
            }
        }
        Ok(entries)
    }

    async fn info(&self, path: &str) -> CoreResult<EntryInfo> {
        let files = lock(&self.files);
        let key = normalize(path);
        if let Some(bytes) = files.get(&key) {
            return Ok(entry(key, bytes.len() as u64, false));
        }
        if Self::is_directory(&files, path) {
            return Ok(entry(key, 0, true));
        }
        Err(CoreError::NotFound {
            path: path.to_string(),
        })
    }

    async fn open(&self, path: &str) -> CoreResult<ByteStream> {
        let bytes = lock(&self.files)
            .get(&normalize(path))
            .cloned()
            .ok_or_else(|| CoreError::NotFound {
                path: path.to_string(),
            })?;
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(Cursor::new(bytes)))
    }
}

#[derive(Debug, Clone)]
enum Script {
    Succeed { bytes: u64 },
    SubFailure { reason: String },
    Error { message: String },
    PanicOn { label: String, bytes: u64 },
}

/// Operation handler with scripted results that records concurrency and order.
#[derive(Debug)]
pub struct ScriptedHandler {
    accepts: Option<Vec<OperationKind>>,
    delay: Duration,
    script: Script,
    running: AtomicUsize,
    peak: AtomicUsize,
    executed: AtomicUsize,
    started: Mutex<Vec<String>>,
}

impl ScriptedHandler {
    fn with_script(script: Script) -> Self {
        Self {
            accepts: None,
            delay: Duration::ZERO,
            script,
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            executed: AtomicUsize::new(0),
            started: Mutex::new(Vec::new()),
        }
    }

    /// Every execution succeeds, reporting `bytes` moved.
    #[must_use]
    pub fn succeeding(bytes: u64) -> Self {
        Self::with_script(Script::Succeed { bytes })
    }

    /// Every execution returns an outcome with one failed sub-item.
    #[must_use]
    pub fn with_sub_failure(reason: &str) -> Self {
        Self::with_script(Script::SubFailure {
            reason: reason.to_string(),
        })
    }

    /// Every execution returns an error.
    #[must_use]
    pub fn erroring(message: &str) -> Self {
        Self::with_script(Script::Error {
            message: message.to_string(),
        })
    }

    /// Panic when the payload label is `label`; succeed with `bytes` otherwise.
    #[must_use]
    pub fn panicking_on(label: &str, bytes: u64) -> Self {
        Self::with_script(Script::PanicOn {
            label: label.to_string(),
            bytes,
        })
    }

    /// Hold each execution for `delay` (cancellation cuts it short).
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Only accept the given kinds.
    #[must_use]
    pub fn accepting(mut self, kinds: &[OperationKind]) -> Self {
        self.accepts = Some(kinds.to_vec());
        self
    }

    /// Highest number of simultaneous executions observed.
    #[must_use]
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Executions currently in flight.
    #[must_use]
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Executions that returned.
    #[must_use]
    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::SeqCst)
    }

    /// Labels of executed payloads in start order (first archive id or source path).
    #[must_use]
    pub fn started_order(&self) -> Vec<String> {
        lock(&self.started).clone()
    }
}

/// Short label identifying a payload in assertions.
#[must_use]
pub fn payload_label(payload: &OperationPayload) -> String {
    match payload {
        OperationPayload::BulkArchive(op) => op.archive_ids.first().cloned().unwrap_or_default(),
        OperationPayload::FileTransfer(t) => t.source_path.clone(),
        OperationPayload::BatchFileTransfer(batch) => batch
            .transfers
            .first()
            .map(|t| t.source_path.clone())
            .unwrap_or_default(),
        OperationPayload::DirectoryTransfer(t) => t.source_path.clone(),
    }
}

struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl OperationHandler for ScriptedHandler {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn can_handle(&self, payload: &OperationPayload) -> bool {
        self.accepts
            .as_ref()
            .is_none_or(|kinds| kinds.contains(&payload.kind()))
    }

    async fn execute(
        &self,
        payload: &OperationPayload,
        mut cancel: CancelSignal,
    ) -> anyhow::Result<OperationOutcome> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = RunningGuard(&self.running);
        self.peak.fetch_max(now, Ordering::SeqCst);
        lock(&self.started).push(payload_label(payload));

        if !self.delay.is_zero() {
            tokio::select! {
                () = tokio::time::sleep(self.delay) => {}
                () = cancel.cancelled() => {
                    self.executed.fetch_add(1, Ordering::SeqCst);
                    return Err(anyhow!("cancelled while running"));
                }
            }
        }
        self.executed.fetch_add(1, Ordering::SeqCst);

        match &self.script {
            Script::Succeed { bytes } => Ok(OperationOutcome::success(*bytes)
                .with_message(format!("handled {}", payload_label(payload)))),
            Script::SubFailure { reason } => Ok(OperationOutcome::from_items(
                Vec::new(),
                vec![format!("{}: {reason}", payload_label(payload))],
                0,
            )),
            Script::Error { message } => Err(anyhow!(message.clone())),
            Script::PanicOn { label, bytes } => {
                if payload_label(payload) == *label {
                    panic!("scripted panic for {label}");
                }
                Ok(OperationOutcome::success(*bytes))
            }
        }
    }
}
