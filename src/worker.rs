use crate::config::EngineConfig;
use crate::model::{JobRequest, OutputFormat};
use crate::{EngineError, Result};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

pub const ENV_SKIP_EXISTING: &str = "TUBECONV_SKIP_EXISTING";

/// Fully resolved worker command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInvocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl WorkerInvocation {
    pub fn new(config: &EngineConfig, request: &JobRequest, output_dir: &Path) -> Self {
        let mut args = Vec::new();
        let program = match &config.interpreter {
            Some(interpreter) => {
                args.push(config.worker_program.to_string_lossy().to_string());
                interpreter.clone()
            }
            None => config.worker_program.clone(),
        };
        args.extend(worker_args(request, output_dir));

        let env = vec![
            (
                ENV_SKIP_EXISTING.to_string(),
                if request.skip_existing { "1" } else { "0" }.to_string(),
            ),
            ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
        ];

        Self { program, args, env }
    }

    pub fn display_program(&self) -> String {
        self.program.to_string_lossy().to_string()
    }

    pub fn spawn(&self) -> Result<Child> {
        let mut cmd = command(&self.program);
        cmd.args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd.spawn().map_err(|source| EngineError::WorkerSpawn {
            program: self.display_program(),
            source,
        })
    }
}

/// `<source> <outputDirectory> [--format f] [--quality q] [--process-playlist]`
///
/// Flags only appear when they differ from the worker's defaults.
pub fn worker_args(request: &JobRequest, output_dir: &Path) -> Vec<String> {
    let mut args = vec![
        request.source.clone(),
        output_dir.to_string_lossy().to_string(),
    ];
    if request.format != OutputFormat::default() {
        args.push("--format".to_string());
        args.push(request.format.as_str().to_string());
    }
    if let Some(quality) = request.quality_hint.as_deref().map(str::trim) {
        if !quality.is_empty() {
            args.push("--quality".to_string());
            args.push(quality.to_string());
        }
    }
    if request.process_playlist {
        args.push("--process-playlist".to_string());
    }
    args
}

fn command(program: impl AsRef<std::ffi::OsStr>) -> Command {
    let mut cmd = Command::new(program);
    configure_for_background(&mut cmd);
    cmd
}

#[cfg(windows)]
fn configure_for_background(cmd: &mut Command) {
    use std::os::windows::process::CommandExt;

    // Keep the worker from opening a console window.
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    cmd.creation_flags(CREATE_NO_WINDOW);
}

#[cfg(unix)]
fn configure_for_background(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;

    // The worker leads its own group so helpers it forks go down with it.
    cmd.process_group(0);
}

#[cfg(not(any(windows, unix)))]
fn configure_for_background(_cmd: &mut Command) {}

/// Terminates the worker together with every process it started.
pub(crate) fn kill_worker(child: &mut Child) {
    kill_worker_tree(child.id());
    let _ = child.kill();
}

/// Tree kill by pid; also reaches helpers left behind by a worker that already exited.
pub(crate) fn kill_worker_tree(pid: u32) {
    let pid = pid.to_string();

    #[cfg(windows)]
    {
        let _ = command("taskkill").args(["/PID", &pid, "/T", "/F"]).status();
    }

    #[cfg(unix)]
    {
        // Negative pid: the worker's whole process group.
        let _ = command("/bin/sh")
            .args(["-c", "kill -s KILL -- -\"$1\"", "sh", &pid])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }

    #[cfg(not(any(windows, unix)))]
    let _ = pid;
}
