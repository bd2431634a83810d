//! Job and output model.
//!
//! A [`Job`] is one unit of work against a single source file and owns one or
//! more [`Output`]s, each producing one artifact. Outputs carry their own
//! status, progress and live process handle; the job-level status is always
//! derived from them, never stored.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::process::ProcessControl;

/// Media kind of a source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Video,
    Audio,
    Image,
    Gif,
}

/// Status of a single output task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStatus {
    Pending,
    Running,
    Paused,
    Done,
    Error,
    Cancelled,
}

impl OutputStatus {
    /// Terminal statuses admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OutputStatus::Done | OutputStatus::Error | OutputStatus::Cancelled
        )
    }
}

impl std::fmt::Display for OutputStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputStatus::Pending => write!(f, "pending"),
            OutputStatus::Running => write!(f, "running"),
            OutputStatus::Paused => write!(f, "paused"),
            OutputStatus::Done => write!(f, "done"),
            OutputStatus::Error => write!(f, "error"),
            OutputStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Derived whole-job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Done,
    Error,
    Cancelled,
    /// Outputs are in a non-uniform, non-active combination (e.g. some
    /// pending, some done).
    Mixed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Paused => write!(f, "paused"),
            JobStatus::Done => write!(f, "done"),
            JobStatus::Error => write!(f, "error"),
            JobStatus::Cancelled => write!(f, "cancelled"),
            JobStatus::Mixed => write!(f, "mixed"),
        }
    }
}

/// Encoding parameters carried by an output.
///
/// Opaque to the pool and the scheduler: they are only handed through to the
/// injected command builder.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EncodeParams {
    pub encoder: String,
    pub container: String,
    pub quality: String,
    pub preset: String,
    pub extra_args: Vec<String>,
}

/// One artifact-producing task within a job.
pub struct Output {
    /// Unique output identifier (UUID).
    pub id: String,
    /// Target path of the produced artifact.
    pub dst_path: PathBuf,
    /// Encoding parameters, passed through to the command builder.
    pub params: EncodeParams,
    status: Mutex<OutputStatus>,
    progress: Mutex<f32>,
    error: Mutex<Option<String>>,
    remote_job: Mutex<Option<String>>,
    pub(crate) process: Mutex<Option<Box<dyn ProcessControl>>>,
    pub(crate) in_flight: AtomicBool,
}

impl Output {
    pub fn new(dst_path: PathBuf, params: EncodeParams) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            dst_path,
            params,
            status: Mutex::new(OutputStatus::Pending),
            progress: Mutex::new(0.0),
            error: Mutex::new(None),
            remote_job: Mutex::new(None),
            process: Mutex::new(None),
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn status(&self) -> OutputStatus {
        self.status
            .lock()
            .map(|s| *s)
            .unwrap_or(OutputStatus::Error)
    }

    pub fn set_status(&self, status: OutputStatus) {
        if let Ok(mut s) = self.status.lock() {
            *s = status;
        }
    }

    /// Progress fraction in [0, 1].
    pub fn progress(&self) -> f32 {
        self.progress.lock().map(|p| *p).unwrap_or(0.0)
    }

    pub fn set_progress(&self, fraction: f32) {
        if let Ok(mut p) = self.progress.lock() {
            *p = fraction.clamp(0.0, 1.0);
        }
    }

    /// Diagnostic text captured when the output failed.
    pub fn error(&self) -> Option<String> {
        self.error.lock().ok().and_then(|e| e.clone())
    }

    pub fn set_error(&self, message: String) {
        if let Ok(mut e) = self.error.lock() {
            *e = Some(message);
        }
    }

    /// Remote job id when this output was dispatched to an encode server.
    pub fn remote_job(&self) -> Option<String> {
        self.remote_job.lock().ok().and_then(|r| r.clone())
    }

    pub fn set_remote_job(&self, job_id: Option<String>) {
        if let Ok(mut r) = self.remote_job.lock() {
            *r = job_id;
        }
    }

    /// Whether a live process handle is currently attached.
    pub fn has_live_process(&self) -> bool {
        self.process.lock().map(|p| p.is_some()).unwrap_or(false)
    }

    pub(crate) fn clear_process(&self) {
        if let Ok(mut p) = self.process.lock() {
            *p = None;
        }
    }
}

impl std::fmt::Debug for Output {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Output")
            .field("id", &self.id)
            .field("dst_path", &self.dst_path)
            .field("status", &self.status())
            .field("progress", &self.progress())
            .finish()
    }
}

/// A unit of work against one source file, owning one or more outputs.
pub struct Job {
    /// Unique job identifier (UUID unless supplied by the caller).
    pub id: String,
    /// Path to the source media file.
    pub src_path: PathBuf,
    /// Media kind of the source.
    pub kind: MediaKind,
    /// Outputs produced from this source. Never shared between jobs.
    pub outputs: Vec<Arc<Output>>,
    duration: Mutex<Option<f64>>,
    cancelled: AtomicBool,
    assigned_server: Mutex<Option<String>>,
}

impl Job {
    pub fn new(src_path: PathBuf, kind: MediaKind) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), src_path, kind)
    }

    pub fn with_id(id: String, src_path: PathBuf, kind: MediaKind) -> Self {
        Self {
            id,
            src_path,
            kind,
            outputs: Vec::new(),
            duration: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            assigned_server: Mutex::new(None),
        }
    }

    pub fn add_output(&mut self, output: Output) -> Arc<Output> {
        let output = Arc::new(output);
        self.outputs.push(output.clone());
        output
    }

    /// Cached source duration in seconds, probed once per job.
    pub fn duration(&self) -> Option<f64> {
        self.duration.lock().ok().and_then(|d| *d)
    }

    pub fn set_duration(&self, secs: f64) {
        if let Ok(mut d) = self.duration.lock() {
            *d = Some(secs);
        }
    }

    /// The cancellation flag applies to every output of this job.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn mark_cancelled(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Server this job was last dispatched to, if any.
    pub fn assigned_server(&self) -> Option<String> {
        self.assigned_server.lock().ok().and_then(|s| s.clone())
    }

    pub fn set_assigned_server(&self, server_id: Option<String>) {
        if let Ok(mut s) = self.assigned_server.lock() {
            *s = server_id;
        }
    }

    pub fn output(&self, output_id: &str) -> Option<Arc<Output>> {
        self.outputs.iter().find(|o| o.id == output_id).cloned()
    }

    /// Derive the whole-job status from the output statuses and the
    /// cancellation flag.
    ///
    /// A done+cancelled mix with nothing pending/running/error resolves to
    /// `Done`.
    pub fn overall_status(&self) -> JobStatus {
        if self.outputs.is_empty() {
            return JobStatus::Pending;
        }
        if self.is_cancelled() {
            return JobStatus::Cancelled;
        }

        let statuses: Vec<OutputStatus> = self.outputs.iter().map(|o| o.status()).collect();

        if statuses.iter().any(|s| *s == OutputStatus::Running) {
            return JobStatus::Running;
        }
        if statuses.iter().any(|s| *s == OutputStatus::Paused) {
            return JobStatus::Paused;
        }
        if statuses.iter().all(|s| *s == OutputStatus::Done) {
            return JobStatus::Done;
        }
        if statuses.iter().all(|s| *s == OutputStatus::Pending) {
            return JobStatus::Pending;
        }
        if statuses.iter().all(|s| s.is_terminal()) {
            if statuses.iter().any(|s| *s == OutputStatus::Error) {
                return JobStatus::Error;
            }
            if statuses.iter().any(|s| *s == OutputStatus::Done) {
                return JobStatus::Done;
            }
            return JobStatus::Cancelled;
        }

        JobStatus::Mixed
    }

    /// Mean progress over all outputs, in [0, 1].
    pub fn overall_progress(&self) -> f32 {
        if self.outputs.is_empty() {
            return 0.0;
        }
        let total: f32 = self.outputs.iter().map(|o| o.progress()).sum();
        total / self.outputs.len() as f32
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("src_path", &self.src_path)
            .field("outputs", &self.outputs.len())
            .field("status", &self.overall_status())
            .finish()
    }
}
