use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;
use stratum_core::{OperationPayload, Priority};

use crate::error::{AppError, AppResult};

/// Run the Stratum operation queue.
#[derive(Debug, Clone, Parser)]
#[command(name = "stratum", version, about)]
pub struct Cli {
    /// YAML configuration file.
    #[arg(long, env = "STRATUM_CONFIG")]
    pub config: Option<PathBuf>,
    /// Priority for submitted payloads; the configured default when absent.
    #[arg(long, value_parser = parse_priority)]
    pub priority: Option<Priority>,
    /// Exit once every submitted operation has finished instead of waiting for Ctrl-C.
    #[arg(long)]
    pub exit_when_idle: bool,
    /// JSON payload files to submit at startup.
    #[arg(value_name = "PAYLOAD")]
    pub payloads: Vec<PathBuf>,
}

fn parse_priority(value: &str) -> Result<Priority, String> {
    value.parse().map_err(|_| format!("unknown priority: {value}"))
}

/// Read one operation payload from a JSON file.
///
/// # Errors
///
/// Returns an error when the file cannot be read or is not a payload.
pub fn read_payload(path: &Path) -> AppResult<OperationPayload> {
    let raw = fs::read_to_string(path).map_err(|source| AppError::Io {
        operation: "payload.read",
        path: Some(path.to_path_buf()),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| AppError::Payload {
        path: path.to_path_buf(),
        source,
    })
}
