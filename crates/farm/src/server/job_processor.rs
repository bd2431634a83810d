//! Remote job processor.
//!
//! Executes one received job configuration as an ffmpeg subprocess,
//! parses progress markers out of its stderr stream, and always emits
//! exactly one terminal result, even when the process never started.

use regex::Regex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::messages::{JobProgress, JobResult, JobSpec, RemoteJobStatus};
use crate::protocol::unix_now;

/// Trailing stderr lines kept for the failure message.
const STDERR_TAIL_LINES: usize = 24;

/// Error type for processor-internal failures
#[derive(Debug, Error)]
enum ProcessorError {
    #[error("Failed to spawn ffmpeg: {0}")]
    Spawn(std::io::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Stream of updates emitted while a job runs. `Finished` is always the
/// last update, exactly once.
#[derive(Debug)]
pub enum ProcessorUpdate {
    Progress(JobProgress),
    Finished(JobResult),
}

/// Executes one job configuration as a subprocess.
pub struct JobProcessor {
    spec: JobSpec,
    server_id: String,
    ffmpeg_path: String,
    work_dir: PathBuf,
    grace_period: Duration,
    cancelled: AtomicBool,
    child_pid: Mutex<Option<u32>>,
}

impl JobProcessor {
    pub fn new(
        spec: JobSpec,
        server_id: String,
        ffmpeg_path: String,
        work_dir: PathBuf,
        grace_period: Duration,
    ) -> Self {
        Self {
            spec,
            server_id,
            ffmpeg_path,
            work_dir,
            grace_period,
            cancelled: AtomicBool::new(false),
            child_pid: Mutex::new(None),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.spec.job_id
    }

    /// Where a transferred input file for this job lives.
    pub fn input_path(&self) -> PathBuf {
        self.work_dir.join(format!("{}_input", self.spec.job_id))
    }

    /// Where the produced artifact is written.
    pub fn output_path(&self) -> PathBuf {
        let name = Path::new(&self.spec.output_file)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}_output", self.spec.job_id));
        self.work_dir.join(name)
    }

    /// `ffmpeg -i <input> <opaque args> <output>`.
    pub fn build_command(&self, input: &Path, output: &Path) -> Vec<String> {
        let mut argv = vec![
            self.ffmpeg_path.clone(),
            "-i".to_string(),
            input.to_string_lossy().into_owned(),
        ];
        argv.extend(self.spec.ffmpeg_args.iter().cloned());
        argv.push(output.to_string_lossy().into_owned());
        argv
    }

    /// Run the job to completion. Emits progress updates while the
    /// process runs and exactly one `Finished` update at the end, then
    /// removes any transferred input file.
    pub async fn run(self: Arc<Self>, updates: mpsc::UnboundedSender<ProcessorUpdate>) {
        let result = match self.execute(&updates).await {
            Ok(result) => result,
            Err(e) => {
                warn!(job = %self.spec.job_id, error = %e, "job processing failed internally");
                self.terminal_result(RemoteJobStatus::Failed, 0.0, 0.0, Some(e.to_string()))
            }
        };

        info!(job = %self.spec.job_id, status = ?result.status, "job finished");
        let _ = updates.send(ProcessorUpdate::Finished(result));

        // Transferred inputs are always cleaned up, success or not.
        let _ = tokio::fs::remove_file(self.input_path()).await;
    }

    async fn execute(
        &self,
        updates: &mpsc::UnboundedSender<ProcessorUpdate>,
    ) -> Result<JobResult, ProcessorError> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Ok(self.terminal_result(
                RemoteJobStatus::Cancelled,
                0.0,
                0.0,
                Some("job cancelled".to_string()),
            ));
        }

        let transferred = self.input_path();
        let input = if transferred.exists() {
            transferred
        } else {
            PathBuf::from(&self.spec.input_file)
        };
        let output = self.output_path();
        let argv = self.build_command(&input, &output);
        info!(job = %self.spec.job_id, command = ?argv, "starting ffmpeg");

        let mut child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(ProcessorError::Spawn)?;

        if let Ok(mut pid) = self.child_pid.lock() {
            *pid = child.id();
        }
        let started = Instant::now();

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ProcessorError::Spawn(std::io::Error::other("stderr not captured")))?;
        let mut lines = BufReader::new(stderr).lines();
        let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
        let mut last_fps = 0.0f64;

        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if !line.trim().is_empty() {
                        if tail.len() == STDERR_TAIL_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(line.clone());
                    }
                    if let Some(progress) = parse_progress_line(&line, &self.spec, &self.server_id)
                    {
                        if let Some(fps) = progress.fps {
                            last_fps = fps;
                        }
                        let _ = updates.send(ProcessorUpdate::Progress(progress));
                    }
                    if self.cancelled.load(Ordering::SeqCst) {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(job = %self.spec.job_id, error = %e, "stderr read ended");
                    break;
                }
            }
        }

        let status = child.wait().await?;
        if let Ok(mut pid) = self.child_pid.lock() {
            *pid = None;
        }
        let elapsed = started.elapsed().as_secs_f64();

        if self.cancelled.load(Ordering::SeqCst) {
            return Ok(self.terminal_result(
                RemoteJobStatus::Cancelled,
                elapsed,
                last_fps,
                Some("job cancelled".to_string()),
            ));
        }
        if !status.success() {
            let mut message = match status.code() {
                Some(code) => format!("ffmpeg exited with code {code}"),
                None => "ffmpeg terminated by signal".to_string(),
            };
            if !tail.is_empty() {
                let lines: Vec<String> = tail.iter().cloned().collect();
                message.push_str(": ");
                message.push_str(&lines.join("\n"));
            }
            return Ok(self.terminal_result(
                RemoteJobStatus::Failed,
                elapsed,
                last_fps,
                Some(message),
            ));
        }

        Ok(self.terminal_result(RemoteJobStatus::Completed, elapsed, last_fps, None))
    }

    /// Request graceful termination; force-kill when the process is still
    /// alive after the grace period.
    pub async fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);

        let pid = self.child_pid.lock().map(|p| *p).unwrap_or(None);
        let Some(pid) = pid else {
            return;
        };

        #[cfg(unix)]
        let _ = crate::process::terminate_pid(pid);

        let deadline = Instant::now() + self.grace_period;
        while Instant::now() < deadline {
            if self.child_pid.lock().map(|p| *p).unwrap_or(None) != Some(pid) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        if self.child_pid.lock().map(|p| *p).unwrap_or(None) == Some(pid) {
            warn!(job = %self.spec.job_id, "process survived the grace period, force-killing");
            #[cfg(unix)]
            let _ = crate::process::kill_pid(pid);
        }
    }

    /// Suspend the live process. `false` when nothing is running.
    pub fn pause(&self) -> bool {
        let pid = self.child_pid.lock().map(|p| *p).unwrap_or(None);
        match pid {
            #[cfg(unix)]
            Some(pid) => crate::process::suspend_pid(pid).is_ok(),
            _ => false,
        }
    }

    /// Continue a suspended process.
    pub fn resume(&self) -> bool {
        let pid = self.child_pid.lock().map(|p| *p).unwrap_or(None);
        match pid {
            #[cfg(unix)]
            Some(pid) => crate::process::resume_pid(pid).is_ok(),
            _ => false,
        }
    }

    fn terminal_result(
        &self,
        status: RemoteJobStatus,
        duration: f64,
        average_fps: f64,
        error_message: Option<String>,
    ) -> JobResult {
        let output = self.output_path();
        let (output_file, file_size) = match std::fs::metadata(&output) {
            Ok(metadata) => (output.to_string_lossy().into_owned(), metadata.len()),
            Err(_) => (String::new(), 0),
        };

        JobResult {
            job_id: self.spec.job_id.clone(),
            output_id: None,
            status,
            output_file,
            file_size,
            duration,
            average_fps,
            error_message,
            server_id: self.server_id.clone(),
            completed_at: unix_now(),
        }
    }
}

fn frame_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"frame=\s*(\d+)").unwrap())
}

fn fps_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"fps=\s*([\d.]+)").unwrap())
}

fn time_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"time=(\d{2}):(\d{2}):(\d{2})\.(\d+)").unwrap())
}

fn bitrate_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"bitrate=\s*([\d.]+\s*\w?bits/s)").unwrap())
}

fn speed_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"speed=\s*([\d.]+x)").unwrap())
}

/// Parse one ffmpeg stderr stats line into a progress report.
///
/// Lines without a frame counter are ignored. The fraction comes from the
/// frame count against a total-frame estimate when one can be derived
/// (estimated duration x fps), falling back to elapsed stream time over
/// the estimated duration.
pub(crate) fn parse_progress_line(
    line: &str,
    spec: &JobSpec,
    server_id: &str,
) -> Option<JobProgress> {
    if !line.contains("frame=") {
        return None;
    }

    let current_frame = frame_re()
        .captures(line)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<u64>().ok())?;
    let fps = fps_re()
        .captures(line)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .filter(|f| *f > 0.0);
    let bitrate = bitrate_re()
        .captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string());
    let speed = speed_re()
        .captures(line)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string());
    let elapsed_secs = time_re().captures(line).and_then(|c| {
        let hours = c.get(1)?.as_str().parse::<f64>().ok()?;
        let minutes = c.get(2)?.as_str().parse::<f64>().ok()?;
        let seconds = c.get(3)?.as_str().parse::<f64>().ok()?;
        Some(hours * 3600.0 + minutes * 60.0 + seconds)
    });

    let total_frames = match (spec.estimated_duration, fps) {
        (Some(duration), Some(fps)) if duration > 0.0 => Some((duration * fps) as u64),
        _ => None,
    };

    let progress = match (total_frames, spec.estimated_duration, elapsed_secs) {
        (Some(total), _, _) if total > 0 => {
            (current_frame as f64 / total as f64).clamp(0.0, 1.0)
        }
        (_, Some(duration), Some(elapsed)) if duration > 0.0 => {
            (elapsed / duration).clamp(0.0, 1.0)
        }
        _ => 0.0,
    };

    let eta = match (total_frames, fps) {
        (Some(total), Some(fps)) if total > current_frame => {
            Some(((total - current_frame) as f64 / fps) as u64)
        }
        _ => None,
    };

    Some(JobProgress {
        job_id: spec.job_id.clone(),
        output_id: None,
        progress,
        current_frame: Some(current_frame),
        total_frames,
        fps,
        bitrate,
        speed,
        eta,
        server_id: server_id.to_string(),
    })
}
