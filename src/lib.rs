pub mod classify;
pub mod config;
mod error;
pub mod lines;
pub mod model;
pub mod output_dir;
pub mod paths;
pub mod progress;
pub mod supervisor;
pub mod worker;

pub use error::{EngineError, Result};
pub use model::{JobEvent, JobRequest, JobResult, OutputFormat, ProgressEvent, ProgressStatus};
pub use supervisor::{CancelHandle, JobHandle, JobSupervisor};
