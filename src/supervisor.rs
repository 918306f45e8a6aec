use crate::classify::{classify_line, error_marker_text, Classified, DiagnosticLevel, RawResult, WorkerPayload};
use crate::config::EngineConfig;
use crate::lines::{Channel, LineBuffer};
use crate::model::{Eta, JobEvent, JobRequest, JobResult, OutputFormat, ProgressEvent, ProgressStatus};
use crate::output_dir::prepare_output_dir;
use crate::progress::{normalize_progress, ProgressTracker};
use crate::worker::{kill_worker, kill_worker_tree, WorkerInvocation};
use std::io::{ErrorKind, Read};
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CANCELLED_BY_USER: &str = "cancelled by user";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Cancelled,
    TimedOut(u64),
}

impl StopReason {
    fn message(&self) -> String {
        match self {
            StopReason::Cancelled => CANCELLED_BY_USER.to_string(),
            StopReason::TimedOut(secs) => format!("timed out after {secs}s"),
        }
    }
}

#[derive(Debug, Default)]
struct JobState {
    tx: Option<Sender<JobEvent>>,
    tracker: ProgressTracker,
    /// A terminal progress status was delivered; later progress is dropped.
    progress_closed: bool,
    stop: Option<StopReason>,
    worker_error: Option<String>,
    diagnostic_error: Option<String>,
    resolved: Option<JobResult>,
    resolved_at: Option<Instant>,
}

/// Per-job state shared by the control thread, both pipe readers and the handle.
///
/// Every event goes out while `state` is held, and nothing goes out once
/// `resolved` is set, so the `Finished` event is always the last one.
#[derive(Debug)]
struct JobShared {
    id: Uuid,
    format: OutputFormat,
    output_dir: Mutex<Option<PathBuf>>,
    started: Instant,
    state: Mutex<JobState>,
}

impl JobShared {
    fn lock(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis().min(u64::MAX as u128) as u64
    }

    fn is_resolved(&self) -> bool {
        self.lock().resolved.is_some()
    }

    fn resolved_for(&self) -> Option<Duration> {
        self.lock().resolved_at.map(|at| at.elapsed())
    }

    fn request_stop(&self, reason: StopReason) -> bool {
        let mut state = self.lock();
        if state.resolved.is_some() {
            return false;
        }
        if state.stop.is_none() {
            state.stop = Some(reason);
        }
        true
    }

    fn pending_stop(&self) -> Option<StopReason> {
        let state = self.lock();
        if state.resolved.is_some() {
            None
        } else {
            state.stop
        }
    }

    fn deliver_progress(&self, event: ProgressEvent) {
        let mut state = self.lock();
        if state.resolved.is_some() || state.progress_closed {
            debug!(job_id = %self.id, status = %event.status, "dropping late progress");
            return;
        }
        let mut event = state.tracker.apply(event);
        event.timestamp_millis = self.elapsed_ms();
        if event.status.is_terminal() {
            state.progress_closed = true;
        }
        if event.status == ProgressStatus::Error && !event.message.is_empty() && state.worker_error.is_none() {
            state.worker_error = Some(event.message.clone());
        }
        if let Some(tx) = &state.tx {
            let _ = tx.send(JobEvent::Progress(event));
        }
    }

    fn record_worker_error(&self, message: String) {
        let mut state = self.lock();
        if state.resolved.is_none() {
            state.worker_error = Some(message);
        }
    }

    fn record_diagnostic_error(&self, message: String) {
        let mut state = self.lock();
        if state.resolved.is_none() {
            state.diagnostic_error = Some(message);
        }
    }

    fn worker_error(&self) -> Option<String> {
        self.lock().worker_error.clone()
    }

    fn explicit_error(&self) -> Option<String> {
        let state = self.lock();
        state.worker_error.clone().or_else(|| state.diagnostic_error.clone())
    }

    fn resolve(&self, result: JobResult) -> bool {
        let mut state = self.lock();
        if state.resolved.is_some() {
            return false;
        }
        Self::finish_locked(&mut state, result);
        true
    }

    fn resolve_stopped(&self, reason: StopReason) -> bool {
        let mut state = self.lock();
        if state.resolved.is_some() {
            return false;
        }
        let message = reason.message();
        let mut event = state.tracker.last().cloned().unwrap_or_else(ProgressEvent::ready);
        event.status = ProgressStatus::Cancelled;
        event.message = message.clone();
        event.speed_bytes_per_second = 0;
        event.speed_text = "0 B/s".to_string();
        event.eta_seconds = Eta::Unknown;
        let mut event = state.tracker.apply(event);
        event.timestamp_millis = self.elapsed_ms();
        state.progress_closed = true;
        if let Some(tx) = &state.tx {
            let _ = tx.send(JobEvent::Progress(event));
        }
        Self::finish_locked(&mut state, JobResult::failed(message));
        true
    }

    fn finish_locked(state: &mut JobState, result: JobResult) {
        state.resolved = Some(result.clone());
        state.resolved_at = Some(Instant::now());
        if let Some(tx) = state.tx.take() {
            let _ = tx.send(JobEvent::Finished(result));
        }
    }

    fn output_dir_string(&self) -> String {
        self.output_dir
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|p| p.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// Runs one worker per [`JobSupervisor::start`] call.
#[derive(Debug, Clone)]
pub struct JobSupervisor {
    config: EngineConfig,
}

impl JobSupervisor {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config: config.sanitized(),
        }
    }

    /// Returns at once. When the request or its output folder is unusable the
    /// handle is already resolved with a failed [`JobResult`] and no worker runs.
    pub fn start(&self, request: JobRequest) -> JobHandle {
        let (tx, rx) = mpsc::channel();
        let shared = Arc::new(JobShared {
            id: Uuid::new_v4(),
            format: request.format,
            output_dir: Mutex::new(None),
            started: Instant::now(),
            state: Mutex::new(JobState {
                tx: Some(tx),
                ..JobState::default()
            }),
        });
        let handle = JobHandle {
            shared: Arc::clone(&shared),
            events: rx,
        };

        let output_dir = match request
            .validate()
            .and_then(|_| prepare_output_dir(&request.output_directory))
        {
            Ok(dir) => dir,
            Err(err) => {
                warn!(job_id = %shared.id, error = %err, "job rejected before spawn");
                shared.resolve(JobResult::failed(err.to_string()));
                return handle;
            }
        };
        *shared.output_dir.lock().unwrap_or_else(PoisonError::into_inner) = Some(output_dir.clone());

        let invocation = WorkerInvocation::new(&self.config, &request, &output_dir);
        let config = self.config.clone();
        let timeout_secs = request.timeout_seconds;
        let job = Arc::clone(&shared);
        let spawned = thread::Builder::new()
            .name(format!("tubeconv-job-{}", shared.id.simple()))
            .spawn(move || run_job(job, config, invocation, timeout_secs));
        if let Err(err) = spawned {
            shared.resolve(JobResult::failed(format!("could not start job thread: {err}")));
        }
        handle
    }

    pub fn cancel(&self, handle: &JobHandle) -> bool {
        handle.cancel()
    }
}

fn run_job(shared: Arc<JobShared>, config: EngineConfig, invocation: WorkerInvocation, timeout_secs: u64) {
    if let Some(reason) = shared.pending_stop() {
        shared.resolve_stopped(reason);
        return;
    }

    let mut child = match invocation.spawn() {
        Ok(child) => child,
        Err(err) => {
            warn!(job_id = %shared.id, error = %err, "worker spawn failed");
            shared.resolve(JobResult::failed(err.to_string()));
            return;
        }
    };
    info!(
        job_id = %shared.id,
        program = %invocation.display_program(),
        args = ?invocation.args,
        pid = child.id(),
        "worker started"
    );

    let chunk = config.read_chunk_bytes;
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        let job = Arc::clone(&shared);
        readers.push(thread::spawn(move || pump_channel(&job, Channel::Stdout, stdout, chunk)));
    }
    if let Some(stderr) = child.stderr.take() {
        let job = Arc::clone(&shared);
        readers.push(thread::spawn(move || pump_channel(&job, Channel::Stderr, stderr, chunk)));
    }

    let pid = child.id();
    let poll = Duration::from_millis(config.poll_interval_ms);
    let grace = Duration::from_millis(config.result_grace_ms);
    let drain = Duration::from_millis(config.exit_drain_ms);
    let mut killed = false;
    let mut exited: Option<(ExitStatus, Instant)> = None;

    // Stop requests stay live until the exit result is out, including while
    // the pipes drain after the worker itself is gone.
    loop {
        if !killed {
            if let Some(reason) = shared.pending_stop() {
                info!(job_id = %shared.id, reason = %reason.message(), "stopping worker");
                kill_worker(&mut child);
                killed = true;
                shared.resolve_stopped(reason);
            }
        }
        if !killed
            && timeout_secs > 0
            && shared.started.elapsed() >= Duration::from_secs(timeout_secs)
            && shared.request_stop(StopReason::TimedOut(timeout_secs))
        {
            continue;
        }
        if !killed && shared.resolved_for().is_some_and(|since| since >= grace) {
            warn!(job_id = %shared.id, "worker still running after reporting its result; killing it");
            kill_worker(&mut child);
            killed = true;
        }

        if exited.is_none() {
            match child.try_wait() {
                Ok(Some(status)) => {
                    info!(job_id = %shared.id, code = ?status.code(), "worker exited");
                    exited = Some((status, Instant::now()));
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(job_id = %shared.id, error = %err, "failed to poll worker");
                    kill_worker(&mut child);
                    let _ = child.wait();
                    shared.resolve(JobResult::failed(format!("failed while waiting for worker: {err}")));
                    break;
                }
            }
        }

        if let Some((status, at)) = exited {
            let drained = readers.iter().all(|reader| reader.is_finished());
            if drained || shared.is_resolved() || at.elapsed() >= drain {
                if !drained {
                    warn!(job_id = %shared.id, "worker output still open after exit; killing leftover helpers");
                }
                resolve_from_exit(&shared, status);
                break;
            }
        }
        thread::sleep(poll);
    }

    if readers.iter().any(|reader| !reader.is_finished()) {
        kill_worker_tree(pid);
    }
    // Readers still blocked end on their own once the pipes close; the job is already resolved.
    for reader in readers {
        if reader.is_finished() {
            let _ = reader.join();
        }
    }
}

fn resolve_from_exit(shared: &JobShared, status: ExitStatus) {
    if shared.is_resolved() {
        return;
    }
    let result = if status.success() {
        match shared.worker_error() {
            Some(detail) => JobResult::failed(detail),
            None => JobResult::succeeded(shared.output_dir_string()),
        }
    } else {
        let base = match status.code() {
            Some(code) => format!("worker exited with code {code}"),
            None => "worker process exited without a status code".to_string(),
        };
        match shared.explicit_error() {
            Some(detail) => JobResult::failed(format!("{base}: {detail}")),
            None => JobResult::failed(base),
        }
    };
    shared.resolve(result);
}

fn pump_channel(shared: &JobShared, channel: Channel, mut pipe: impl Read, chunk: usize) {
    let mut buf = vec![0_u8; chunk];
    let mut lines = LineBuffer::new();
    loop {
        match pipe.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                for line in lines.push(&buf[..n]) {
                    route_line(shared, channel, &line);
                }
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                debug!(job_id = %shared.id, %channel, error = %err, "worker pipe read failed");
                break;
            }
        }
    }
    if let Some(line) = lines.finish() {
        route_line(shared, channel, &line);
    }
}

fn route_line(shared: &JobShared, channel: Channel, line: &str) {
    if shared.is_resolved() {
        return;
    }
    match classify_line(channel, line) {
        Classified::Blank => {}
        Classified::Diagnostic { level, text } => {
            if level == DiagnosticLevel::Error {
                warn!(job_id = %shared.id, %channel, "{text}");
                shared.record_diagnostic_error(error_marker_text(&text).unwrap_or(text));
            } else {
                debug!(job_id = %shared.id, %channel, "{text}");
            }
        }
        Classified::Malformed(reason) => {
            warn!(job_id = %shared.id, %channel, %reason, "ignoring malformed worker payload");
        }
        Classified::Payload(WorkerPayload::Progress(raw)) => {
            shared.deliver_progress(normalize_progress(&raw, shared.format));
        }
        Classified::Payload(WorkerPayload::Result(raw)) => {
            let result = result_from_worker(&raw, &shared.output_dir_string(), shared.explicit_error());
            info!(job_id = %shared.id, success = result.success, "worker reported result");
            shared.resolve(result);
        }
        Classified::Payload(WorkerPayload::Error(message)) => {
            warn!(job_id = %shared.id, %channel, "worker error: {message}");
            shared.record_worker_error(message);
        }
        Classified::Payload(WorkerPayload::Unknown(kind)) => {
            warn!(job_id = %shared.id, %channel, %kind, "ignoring unknown payload type");
        }
    }
}

fn result_from_worker(raw: &RawResult, output_dir: &str, explicit: Option<String>) -> JobResult {
    if raw.success {
        let path = raw.output_path.clone().unwrap_or_else(|| output_dir.to_string());
        return JobResult::succeeded(path);
    }
    let message = raw
        .failure_message()
        .map(str::to_string)
        .or(explicit)
        .unwrap_or_else(|| "worker reported failure".to_string());
    JobResult::failed(message)
}

/// Caller's side of a running job: the event stream plus cancellation.
///
/// The stream ends with exactly one [`JobEvent::Finished`]; the channel is
/// closed right after it.
#[derive(Debug)]
pub struct JobHandle {
    shared: Arc<JobShared>,
    events: Receiver<JobEvent>,
}

impl JobHandle {
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Asks the worker to stop. Returns `false` (and does nothing) when the job
    /// has already resolved.
    pub fn cancel(&self) -> bool {
        self.shared.request_stop(StopReason::Cancelled)
    }

    pub fn canceller(&self) -> CancelHandle {
        CancelHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn recv(&self) -> Option<JobEvent> {
        self.events.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> std::result::Result<JobEvent, RecvTimeoutError> {
        self.events.recv_timeout(timeout)
    }

    pub fn iter(&self) -> mpsc::Iter<'_, JobEvent> {
        self.events.iter()
    }

    /// Drains the stream, handing each progress event to `on_progress`.
    pub fn wait(self, mut on_progress: impl FnMut(&ProgressEvent)) -> JobResult {
        for event in self.events.iter() {
            match event {
                JobEvent::Progress(progress) => on_progress(&progress),
                JobEvent::Finished(result) => return result,
            }
        }
        self.result()
            .unwrap_or_else(|| JobResult::failed("job ended without a result"))
    }

    pub fn last_progress(&self) -> Option<ProgressEvent> {
        self.shared.lock().tracker.last().cloned()
    }

    pub fn is_finished(&self) -> bool {
        self.shared.is_resolved()
    }

    pub fn result(&self) -> Option<JobResult> {
        self.shared.lock().resolved.clone()
    }
}

/// Cloneable cancel trigger for use from another thread.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    shared: Arc<JobShared>,
}

impl CancelHandle {
    pub fn cancel(&self) -> bool {
        self.shared.request_stop(StopReason::Cancelled)
    }
}
