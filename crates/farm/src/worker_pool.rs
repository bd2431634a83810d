//! Local worker pool.
//!
//! A fixed set of OS worker threads pulls `(job, output)` tasks from an
//! unbounded FIFO queue and supervises one transcode subprocess per task.
//! The worker count is the admission-control boundary: it bounds concurrent
//! execution, the queue bounds nothing.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::jobs::{Job, Output, OutputStatus};
use crate::probe::DurationProbe;
use crate::process::{self, ProcessError};

/// How long a worker blocks on the queue before re-checking for shutdown.
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(200);

/// How many trailing stderr lines are kept for error reporting.
const STDERR_TAIL_LINES: usize = 24;

/// Builds the subprocess argument list for one `(job, output)` pair.
///
/// Element 0 is the program. The builder owns all encoding policy; the pool
/// only parses the resulting progress stream.
pub type CommandBuilder = Arc<dyn Fn(&Job, &Output) -> Vec<String> + Send + Sync>;

/// Invoked on every progress update and exactly once after an output
/// reaches a terminal status.
pub type PoolProgressCallback = Arc<dyn Fn(&Job, &Output) + Send + Sync>;

/// Error type for pool submissions
#[derive(Debug, Error)]
pub enum PoolError {
    /// Pool is not running
    #[error("Worker pool is not running")]
    Stopped,
}

struct Task {
    job: Arc<Job>,
    output: Arc<Output>,
    builder: CommandBuilder,
}

struct PoolShared {
    running: AtomicBool,
    probe: Box<dyn DurationProbe>,
    progress: PoolProgressCallback,
    grace_period: Duration,
}

/// Fixed-concurrency local executor of output tasks as OS processes.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    sender: Mutex<Option<Sender<Task>>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        probe: Box<dyn DurationProbe>,
        progress: PoolProgressCallback,
        grace_period: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                running: AtomicBool::new(false),
                probe,
                progress,
                grace_period,
            }),
            sender: Mutex::new(None),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Spawn `workers` worker threads. Idempotent while running, and valid
    /// again after [`stop`](Self::stop).
    pub fn start(&self, workers: usize) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let (tx, rx) = mpsc::channel::<Task>();
        if let Ok(mut sender) = self.sender.lock() {
            *sender = Some(tx);
        }

        let rx = Arc::new(Mutex::new(rx));
        if let Ok(mut threads) = self.threads.lock() {
            for _ in 0..workers.max(1) {
                let shared = self.shared.clone();
                let rx = rx.clone();
                threads.push(thread::spawn(move || worker_loop(shared, rx)));
            }
        }
        info!(workers, "worker pool started");
    }

    /// Signal all workers to exit after their current task. Queued tasks
    /// are abandoned; the pool can be started again afterwards.
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Ok(mut sender) = self.sender.lock() {
            *sender = None;
        }
        if let Ok(mut threads) = self.threads.lock() {
            for handle in threads.drain(..) {
                let _ = handle.join();
            }
        }
        info!("worker pool stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Enqueue one output task. Never blocks; accepted even while all
    /// workers are busy.
    pub fn submit(
        &self,
        job: Arc<Job>,
        output: Arc<Output>,
        builder: CommandBuilder,
    ) -> Result<(), PoolError> {
        let sender = self.sender.lock().map_err(|_| PoolError::Stopped)?;
        match sender.as_ref() {
            Some(tx) => tx
                .send(Task {
                    job,
                    output,
                    builder,
                })
                .map_err(|_| PoolError::Stopped),
            None => Err(PoolError::Stopped),
        }
    }

    /// Suspend a running output's process. No-op (returns `false`) unless
    /// the output is currently `Running` with a live process.
    pub fn pause_output(&self, output: &Output) -> bool {
        if output.status() != OutputStatus::Running {
            return false;
        }
        let Ok(mut guard) = output.process.lock() else {
            return false;
        };
        let Some(process) = guard.as_mut() else {
            return false;
        };
        match process.suspend() {
            Ok(()) => {
                output.set_status(OutputStatus::Paused);
                debug!(output = %output.id, "output paused");
                true
            }
            Err(e) => {
                warn!(output = %output.id, error = %e, "pause failed");
                false
            }
        }
    }

    /// Continue a paused output's process. Requires the output to
    /// currently be `Paused`.
    pub fn resume_output(&self, output: &Output) -> bool {
        if output.status() != OutputStatus::Paused {
            return false;
        }
        let Ok(mut guard) = output.process.lock() else {
            return false;
        };
        let Some(process) = guard.as_mut() else {
            return false;
        };
        match process.resume() {
            Ok(()) => {
                output.set_status(OutputStatus::Running);
                debug!(output = %output.id, "output resumed");
                true
            }
            Err(e) => {
                warn!(output = %output.id, error = %e, "resume failed");
                false
            }
        }
    }

    /// Cancel a job: set the cancellation flag, mark every output
    /// cancelled, and terminate live processes (gracefully first,
    /// force-killed after the grace period). Always converges; termination
    /// errors are swallowed.
    pub fn cancel_job(&self, job: &Job) {
        job.mark_cancelled();

        for output in &job.outputs {
            output.set_status(OutputStatus::Cancelled);

            let signalled = match output.process.lock() {
                Ok(mut guard) => match guard.as_mut() {
                    Some(process) => {
                        let _ = process.terminate();
                        true
                    }
                    None => false,
                },
                Err(_) => false,
            };
            if !signalled {
                continue;
            }

            let deadline = Instant::now() + self.shared.grace_period;
            let mut exited = false;
            while !exited && Instant::now() < deadline {
                if let Ok(mut guard) = output.process.lock() {
                    exited = match guard.as_mut() {
                        Some(process) => matches!(process.try_wait(), Ok(Some(_)) | Err(_)),
                        None => true,
                    };
                }
                if !exited {
                    thread::sleep(Duration::from_millis(50));
                }
            }

            if !exited {
                if let Ok(mut guard) = output.process.lock() {
                    if let Some(process) = guard.as_mut() {
                        let _ = process.kill();
                    }
                }
                debug!(output = %output.id, "force-killed after grace period");
            }
        }
        info!(job = %job.id, "job cancelled");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(shared: Arc<PoolShared>, rx: Arc<Mutex<Receiver<Task>>>) {
    loop {
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }

        let task = {
            let Ok(guard) = rx.lock() else {
                break;
            };
            guard.recv_timeout(DEQUEUE_TIMEOUT)
        };

        match task {
            Ok(task) => run_task(&shared, task),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn run_task(shared: &PoolShared, task: Task) {
    let Task {
        job,
        output,
        builder,
    } = task;

    // At most one live execution per output; a duplicate submission is
    // rejected here rather than double-executed.
    if output.in_flight.swap(true, Ordering::SeqCst) {
        warn!(job = %job.id, output = %output.id, "output already executing, duplicate dropped");
        return;
    }

    if let Err(e) = execute_output(shared, &job, &output, &builder) {
        if !job.is_cancelled() && !output.status().is_terminal() {
            output.set_status(OutputStatus::Error);
            output.set_error(e.to_string());
        }
        warn!(job = %job.id, output = %output.id, error = %e, "task failed");
    }

    output.clear_process();
    output.in_flight.store(false, Ordering::SeqCst);
    // Final callback, fired on every exit path so observers are never left
    // hanging.
    (shared.progress)(&job, &output);
}

#[derive(Debug, Error)]
enum TaskError {
    #[error("{0}")]
    Process(#[from] ProcessError),
}

fn execute_output(
    shared: &PoolShared,
    job: &Arc<Job>,
    output: &Arc<Output>,
    builder: &CommandBuilder,
) -> Result<(), TaskError> {
    if job.is_cancelled() {
        output.set_status(OutputStatus::Cancelled);
        return Ok(());
    }

    if job.duration().is_none() {
        if let Some(secs) = shared.probe.duration_secs(&job.src_path) {
            debug!(job = %job.id, secs, "source duration detected");
            job.set_duration(secs);
        }
    }

    let argv = builder(job, output);
    debug!(job = %job.id, output = %output.id, command = ?argv, "starting transcode");

    let (process, stdout, stderr) = process::spawn(&argv)?;
    if let Ok(mut guard) = output.process.lock() {
        *guard = Some(Box::new(process));
    }
    // A cancel between the pre-spawn check and the handle store would
    // otherwise leave the process running with nobody to signal it.
    if job.is_cancelled() {
        if let Ok(mut guard) = output.process.lock() {
            if let Some(process) = guard.as_mut() {
                let _ = process.terminate();
            }
        }
    }
    output.set_status(OutputStatus::Running);
    output.set_progress(0.0);
    (shared.progress)(job, output);

    // Second reader: diagnostic stream, drained concurrently and kept as a
    // bounded tail for error reporting.
    let tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
    let stderr_thread = {
        let tail = tail.clone();
        let job_id = job.id.clone();
        let output_id = output.id.clone();
        thread::spawn(move || {
            for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                if line.is_empty() {
                    continue;
                }
                debug!(job = %job_id, output = %output_id, "{line}");
                if let Ok(mut tail) = tail.lock() {
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }
        })
    };

    // First reader: structured progress stream.
    for line in BufReader::new(stdout).lines() {
        let Ok(line) = line else { break };

        if job.is_cancelled() {
            if let Ok(mut guard) = output.process.lock() {
                if let Some(process) = guard.as_mut() {
                    let _ = process.terminate();
                }
            }
            break;
        }

        apply_progress_line(&line, job, output, &shared.progress);
    }

    let exit = wait_for_exit(output);
    let _ = stderr_thread.join();

    if job.is_cancelled() {
        output.set_status(OutputStatus::Cancelled);
    } else if exit.as_ref().map(|s| s.success()).unwrap_or(false) {
        output.set_progress(1.0);
        output.set_status(OutputStatus::Done);
        debug!(job = %job.id, output = %output.id, "output completed");
    } else {
        let code = exit.and_then(|s| s.code());
        let mut message = match code {
            Some(code) => format!("process exited with code {code}"),
            None => "process terminated by signal".to_string(),
        };
        if let Ok(tail) = tail.lock() {
            if !tail.is_empty() {
                let lines: Vec<String> = tail.iter().cloned().collect();
                message.push_str(": ");
                message.push_str(&lines.join("\n"));
            }
        }
        output.set_status(OutputStatus::Error);
        output.set_error(message);
    }

    Ok(())
}

/// Poll for process exit without holding the handle lock, so concurrent
/// cancel/pause calls can still reach the process.
fn wait_for_exit(output: &Output) -> Option<std::process::ExitStatus> {
    loop {
        {
            let Ok(mut guard) = output.process.lock() else {
                return None;
            };
            match guard.as_mut() {
                Some(process) => match process.try_wait() {
                    Ok(Some(status)) => return Some(status),
                    Ok(None) => {}
                    Err(_) => return None,
                },
                None => return None,
            }
        }
        thread::sleep(Duration::from_millis(50));
    }
}

/// Parse one line of the `key=value` progress stream.
///
/// `out_time_ms` is converted to a fraction of the cached source duration;
/// the `progress=end` marker forces 1.0. Malformed lines are ignored.
fn apply_progress_line(
    line: &str,
    job: &Job,
    output: &Output,
    progress: &PoolProgressCallback,
) {
    let line = line.trim();
    if let Some(value) = line.strip_prefix("out_time_ms=") {
        let value = value.trim();
        if value == "N/A" {
            return;
        }
        let Ok(micros) = value.parse::<i64>() else {
            return;
        };
        if let Some(duration) = job.duration().filter(|d| *d > 0.0) {
            let fraction = (micros as f64 / 1_000_000.0 / duration).clamp(0.0, 1.0);
            output.set_progress(fraction as f32);
            progress(job, output);
        }
    } else if line.strip_prefix("progress=").map(str::trim) == Some("end") {
        output.set_progress(1.0);
        progress(job, output);
    }
}
