use crate::paths::AppPaths;
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const ENV_WORKER: &str = "TUBECONV_WORKER";
pub const ENV_INTERPRETER: &str = "TUBECONV_INTERPRETER";

const DEFAULT_POLL_INTERVAL_MS: u64 = 200;
const DEFAULT_RESULT_GRACE_MS: u64 = 5_000;
const DEFAULT_READ_CHUNK_BYTES: usize = 8192;
const DEFAULT_EXIT_DRAIN_MS: u64 = 1_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker executable, or the worker script when `interpreter` is set.
    pub worker_program: PathBuf,
    pub interpreter: Option<PathBuf>,
    pub poll_interval_ms: u64,
    /// How long a worker may keep running after it reported its result.
    pub result_grace_ms: u64,
    pub read_chunk_bytes: usize,
    /// How long buffered output is still read after the worker exited.
    pub exit_drain_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_program: PathBuf::from("tubeconv-worker"),
            interpreter: None,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            result_grace_ms: DEFAULT_RESULT_GRACE_MS,
            read_chunk_bytes: DEFAULT_READ_CHUNK_BYTES,
            exit_drain_ms: DEFAULT_EXIT_DRAIN_MS,
        }
    }
}

impl EngineConfig {
    pub fn for_paths(paths: &AppPaths) -> Self {
        Self {
            worker_program: paths.worker_cmd(),
            ..Self::default()
        }
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Some(worker) = non_empty_env(ENV_WORKER) {
            self.worker_program = PathBuf::from(worker);
        }
        if let Some(interpreter) = non_empty_env(ENV_INTERPRETER) {
            self.interpreter = Some(PathBuf::from(interpreter));
        }
        self
    }

    pub(crate) fn sanitized(mut self) -> Self {
        self.poll_interval_ms = self.poll_interval_ms.clamp(10, 5_000);
        self.read_chunk_bytes = self.read_chunk_bytes.clamp(256, 1024 * 1024);
        self.exit_drain_ms = self.exit_drain_ms.min(60_000);
        self
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    let value = std::env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn load_engine_config(paths: &AppPaths) -> Result<EngineConfig> {
    let path = paths.engine_config_path();
    if !path.exists() {
        return Ok(EngineConfig::for_paths(paths));
    }
    let bytes = std::fs::read(&path)?;
    let parsed: EngineConfig = serde_json::from_slice(&bytes).map_err(|e| {
        EngineError::ConfigInvalid(format!(
            "failed to parse engine config at {}: {e}",
            path.to_string_lossy()
        ))
    })?;
    Ok(parsed)
}

pub fn save_engine_config(paths: &AppPaths, config: &EngineConfig) -> Result<()> {
    let path = paths.engine_config_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(config)?;
    std::fs::write(&path, format!("{json}\n"))?;
    Ok(())
}
