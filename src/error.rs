use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("output folder path is empty")]
    OutputDirEmpty,

    #[error("output folder cannot be created: {path} ({source})")]
    OutputDirNotCreatable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("output path is not a folder: {path}")]
    OutputDirNotADirectory { path: PathBuf },

    #[error("output folder is not writable: {path} ({source})")]
    OutputDirNotWritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("worker could not start: {program} ({source})")]
    WorkerSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid engine config: {0}")]
    ConfigInvalid(String),

    #[error("invalid job request: {0}")]
    InvalidRequest(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
