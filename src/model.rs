use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Mp3,
    M4a,
    Flac,
    Wav,
    Opus,
    Best,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Mp3 => "mp3",
            OutputFormat::M4a => "m4a",
            OutputFormat::Flac => "flac",
            OutputFormat::Wav => "wav",
            OutputFormat::Opus => "opus",
            OutputFormat::Best => "best",
        }
    }

    /// Extension of the converted file; `Best` keeps whatever the source container is.
    pub fn extension(&self) -> Option<&'static str> {
        match self {
            OutputFormat::Best => None,
            other => Some(other.as_str()),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = EngineError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mp3" => Ok(OutputFormat::Mp3),
            "m4a" => Ok(OutputFormat::M4a),
            "flac" => Ok(OutputFormat::Flac),
            "wav" => Ok(OutputFormat::Wav),
            "opus" => Ok(OutputFormat::Opus),
            "best" => Ok(OutputFormat::Best),
            other => Err(EngineError::InvalidRequest(format!(
                "unsupported output format: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    /// URL or free-text search query.
    pub source: String,
    pub output_directory: PathBuf,
    pub format: OutputFormat,
    /// Bitrate for audio formats, resolution for video; meaning is up to the worker.
    pub quality_hint: Option<String>,
    pub process_playlist: bool,
    pub skip_existing: bool,
    /// 0 disables the timeout.
    pub timeout_seconds: u64,
}

impl JobRequest {
    pub fn new(source: impl Into<String>, output_directory: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            output_directory: output_directory.into(),
            format: OutputFormat::default(),
            quality_hint: None,
            process_playlist: false,
            skip_existing: false,
            timeout_seconds: 0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.source.trim().is_empty() {
            return Err(EngineError::InvalidRequest(
                "source URL or search query is empty".to_string(),
            ));
        }
        if let Some(q) = &self.quality_hint {
            if q.trim().is_empty() {
                return Err(EngineError::InvalidRequest(
                    "quality hint is present but empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    #[default]
    Ready,
    Starting,
    Downloading,
    Converting,
    Finished,
    Error,
    Cancelled,
}

impl ProgressStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressStatus::Ready => "ready",
            ProgressStatus::Starting => "starting",
            ProgressStatus::Downloading => "downloading",
            ProgressStatus::Converting => "converting",
            ProgressStatus::Finished => "finished",
            ProgressStatus::Error => "error",
            ProgressStatus::Cancelled => "cancelled",
        }
    }

    /// Statuses a worker may report. `ready` and `cancelled` belong to the engine.
    pub fn from_worker_str(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "starting" => Some(ProgressStatus::Starting),
            "downloading" => Some(ProgressStatus::Downloading),
            "converting" | "processing" | "postprocessing" => Some(ProgressStatus::Converting),
            "finished" | "complete" | "completed" | "skipped" => Some(ProgressStatus::Finished),
            "error" | "failed" => Some(ProgressStatus::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressStatus::Finished | ProgressStatus::Error | ProgressStatus::Cancelled
        )
    }
}

impl fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remaining time; serialized as seconds or `null` when unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Option<u64>", into = "Option<u64>")]
pub enum Eta {
    Seconds(u64),
    #[default]
    Unknown,
}

impl From<Option<u64>> for Eta {
    fn from(value: Option<u64>) -> Self {
        match value {
            Some(s) => Eta::Seconds(s),
            None => Eta::Unknown,
        }
    }
}

impl From<Eta> for Option<u64> {
    fn from(value: Eta) -> Self {
        match value {
            Eta::Seconds(s) => Some(s),
            Eta::Unknown => None,
        }
    }
}

impl fmt::Display for Eta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Eta::Unknown => f.write_str("--:--"),
            Eta::Seconds(total) => {
                let hours = total / 3600;
                let minutes = (total % 3600) / 60;
                let seconds = total % 60;
                if hours > 0 {
                    write!(f, "{hours}:{minutes:02}:{seconds:02}")
                } else {
                    write!(f, "{minutes:02}:{seconds:02}")
                }
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub status: ProgressStatus,
    pub percentage: f64,
    pub downloaded_bytes: u64,
    /// 0 means unknown.
    pub total_bytes: u64,
    pub speed_bytes_per_second: u64,
    pub speed_text: String,
    pub eta_seconds: Eta,
    pub message: String,
    pub current_file_name: String,
    pub is_playlist: bool,
    pub current_item_index: u32,
    pub total_item_count: u32,
    pub playlist_name: String,
    /// Milliseconds since the job started, taken from a monotonic clock.
    pub timestamp_millis: u64,
}

impl ProgressEvent {
    pub fn ready() -> Self {
        Self {
            speed_text: "0 B/s".to_string(),
            ..Self::default()
        }
    }

    /// `ready` with nothing to report; consumers should render nothing.
    pub fn is_idle(&self) -> bool {
        self.status == ProgressStatus::Ready && self.percentage == 0.0 && self.message.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub success: bool,
    pub output_path: Option<String>,
    pub error_message: Option<String>,
}

impl JobResult {
    pub fn succeeded(output_path: impl Into<String>) -> Self {
        Self {
            success: true,
            output_path: Some(output_path.into()),
            error_message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output_path: None,
            error_message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum JobEvent {
    Progress(ProgressEvent),
    Finished(JobResult),
}
