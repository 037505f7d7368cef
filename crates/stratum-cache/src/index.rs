//! On-disk index and key-to-path mapping.

use std::collections::HashMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use stratum_core::CacheEntryKind;
use tracing::warn;

use crate::entry::CacheEntry;
use crate::error::{CacheError, CacheResult};

pub(crate) const INDEX_FILE: &str = "cache_index.json";
const INDEX_VERSION: u32 = 1;
const MAX_KEY_LEN: usize = 512;

#[derive(Debug, Serialize, Deserialize)]
struct IndexDocument {
    version: u32,
    entries: Vec<CacheEntry>,
}

/// Load the index, discarding it when unreadable or corrupted.
pub(crate) fn load(root: &Path) -> HashMap<String, CacheEntry> {
    let path = root.join(INDEX_FILE);
    let raw = match fs::read(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return HashMap::new(),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "cache index unreadable; starting empty");
            return HashMap::new();
        }
    };
    let document: IndexDocument = match serde_json::from_slice(&raw) {
        Ok(document) => document,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "cache index corrupted; starting empty");
            return HashMap::new();
        }
    };
    document
        .entries
        .into_iter()
        .filter(|entry| {
            let present = entry
                .location
                .as_ref()
                .is_none_or(|relative| root.join(relative).exists());
            if !present {
                warn!(key = %entry.key, "cached bytes missing; dropping index entry");
            }
            present
        })
        .map(|entry| (entry.key.clone(), entry))
        .collect()
}

/// Persist the index atomically (temp file then rename).
pub(crate) fn save(root: &Path, entries: &HashMap<String, CacheEntry>) -> CacheResult<()> {
    let path = root.join(INDEX_FILE);
    let mut ordered: Vec<CacheEntry> = entries.values().cloned().collect();
    ordered.sort_by(|a, b| a.key.cmp(&b.key));
    let document = IndexDocument {
        version: INDEX_VERSION,
        entries: ordered,
    };
    let bytes = serde_json::to_vec_pretty(&document).map_err(|source| CacheError::Json {
        operation: "cache.index.serialize",
        path: path.clone(),
        source,
    })?;
    write_atomic(&path, &bytes)
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> CacheResult<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|err| CacheError::io("cache.mkdir", parent, err))?;
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("entry");
    let tmp = parent.join(format!(".{file_name}.tmp.{}", std::process::id()));
    {
        let mut file =
            fs::File::create(&tmp).map_err(|err| CacheError::io("cache.tmp.create", &tmp, err))?;
        file.write_all(bytes)
            .map_err(|err| CacheError::io("cache.tmp.write", &tmp, err))?;
        file.sync_all()
            .map_err(|err| CacheError::io("cache.tmp.sync", &tmp, err))?;
    }
    fs::rename(&tmp, path).map_err(|err| CacheError::io("cache.tmp.rename", path, err))
}

pub(crate) fn validate_key(key: &str) -> CacheResult<()> {
    let reason = if key.trim().is_empty() {
        Some("must not be empty")
    } else if key.len() > MAX_KEY_LEN {
        Some("too long")
    } else if key.chars().any(char::is_control) {
        Some("must not contain control characters")
    } else {
        None
    };
    reason.map_or(Ok(()), |reason| {
        Err(CacheError::InvalidKey {
            key: key.to_string(),
            reason,
        })
    })
}

/// Relative path for a key's materialised bytes: a readable stem plus a digest suffix.
pub(crate) fn relative_path(kind: CacheEntryKind, key: &str) -> PathBuf {
    let stem: String = key
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
                ch
            } else {
                '_'
            }
        })
        .take(96)
        .collect();
    let digest = hex_digest(key.as_bytes());
    PathBuf::from(kind.directory()).join(format!("{stem}-{}", &digest[..12]))
}

pub(crate) fn hex_digest(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}
