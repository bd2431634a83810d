//! Job scheduler: the single entry point callers use to run a job.
//!
//! Picks an execution target per job (a capable remote encode server, or
//! the local worker pool), dispatches, and fans progress/completion back
//! to the per-job callbacks. Holds no encoding policy of its own; it is a
//! routing and bookkeeping layer over the pool and the connection
//! manager.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::client::{CompletionCallback, ConnectionManager, ProgressCallback};
use crate::jobs::{EncodeParams, Job, MediaKind, Output, OutputStatus};
use crate::matcher::CapabilityMatcher;
use crate::messages::{JobProgress, JobResult, JobSpec, RemoteJobStatus};
use crate::probe::DurationProbe;
use crate::protocol::unix_now;
use crate::worker_pool::{CommandBuilder, PoolProgressCallback, WorkerPool};

/// Server id used in results produced by the local pool.
const LOCAL_SERVER_ID: &str = "local";

#[derive(Clone)]
enum DispatchTarget {
    Local(Arc<Job>),
    Remote(String),
}

struct JobEntry {
    target: DispatchTarget,
    progress: ProgressCallback,
    completion: CompletionCallback,
}

/// Snapshot of one pool callback, carried from the worker thread into the
/// async layer.
struct LocalEvent {
    job_id: String,
    output_id: String,
    dst_path: PathBuf,
    status: OutputStatus,
    progress: f32,
    error: Option<String>,
}

impl LocalEvent {
    fn capture(job: &Job, output: &Output) -> Self {
        Self {
            job_id: job.id.clone(),
            output_id: output.id.clone(),
            dst_path: output.dst_path.clone(),
            status: output.status(),
            progress: output.progress(),
            error: output.error(),
        }
    }
}

struct SchedulerInner {
    pool: Arc<WorkerPool>,
    client: Arc<ConnectionManager>,
    matcher: CapabilityMatcher,
    ffmpeg_path: String,
    jobs: Mutex<HashMap<String, JobEntry>>,
}

/// Routes jobs to the local pool or a remote server and relays
/// progress/completion to the caller's callbacks.
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Build a scheduler owning its local worker pool.
    ///
    /// Must be called from within a tokio runtime: a background task
    /// bridges pool callbacks into the async callback layer.
    pub fn new(
        client: Arc<ConnectionManager>,
        probe: Box<dyn DurationProbe>,
        ffmpeg_path: String,
        grace_period: Duration,
    ) -> Self {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<LocalEvent>();
        let pool_callback: PoolProgressCallback = Arc::new(move |job, output| {
            let _ = event_tx.send(LocalEvent::capture(job, output));
        });
        let pool = Arc::new(WorkerPool::new(probe, pool_callback, grace_period));

        let inner = Arc::new(SchedulerInner {
            pool,
            client,
            matcher: CapabilityMatcher::new(),
            ffmpeg_path,
            jobs: Mutex::new(HashMap::new()),
        });

        let drain = inner.clone();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                handle_local_event(&drain, event);
            }
        });

        Self { inner }
    }

    /// Start the local pool's worker threads.
    pub fn start_local_pool(&self, workers: usize) {
        self.inner.pool.start(workers);
    }

    /// Stop the local pool (in-flight tasks finish, queued ones are
    /// abandoned).
    pub fn stop_local_pool(&self) {
        self.inner.pool.stop();
    }

    /// Accept a job: pick a target and dispatch.
    ///
    /// A remote server is chosen when a connected, online server offers
    /// every required encoder; otherwise the job runs on the local pool.
    /// Dispatch failures surface as a `Failed` result through
    /// `completion`; this method never panics the caller.
    pub async fn add_job(
        &self,
        spec: JobSpec,
        progress: ProgressCallback,
        completion: CompletionCallback,
    ) {
        let servers = self.inner.client.connected_servers().await;
        let matches = self.inner.matcher.find_best_servers(&spec, &servers, 3);
        let capable = matches
            .into_iter()
            .find(|m| m.missing_capabilities.is_empty());

        if let Some(target) = capable {
            self.dispatch_remote(target.server_id, spec, progress, completion)
                .await;
        } else {
            self.dispatch_local(spec, progress, completion);
        }
    }

    async fn dispatch_remote(
        &self,
        server_id: String,
        spec: JobSpec,
        progress: ProgressCallback,
        completion: CompletionCallback,
    ) {
        let job_id = spec.job_id.clone();
        info!(job = %job_id, server = %server_id, "dispatching to remote server");

        if let Ok(mut jobs) = self.inner.jobs.lock() {
            jobs.insert(
                job_id.clone(),
                JobEntry {
                    target: DispatchTarget::Remote(server_id.clone()),
                    progress: progress.clone(),
                    completion: completion.clone(),
                },
            );
        }

        // The connection manager deregisters its own callbacks on the
        // terminal result; this wrapper retires the scheduler's entry.
        let entry_owner = self.inner.clone();
        let wrapped_job_id = job_id.clone();
        let caller_completion = completion.clone();
        let wrapped_completion: CompletionCallback = Arc::new(move |result: JobResult| {
            if let Ok(mut jobs) = entry_owner.jobs.lock() {
                jobs.remove(&wrapped_job_id);
            }
            caller_completion(result);
        });

        let submitted = self
            .inner
            .client
            .submit_job(&server_id, spec, progress, wrapped_completion)
            .await;

        if let Err(e) = submitted {
            warn!(job = %job_id, server = %server_id, error = %e, "remote dispatch failed");
            if let Ok(mut jobs) = self.inner.jobs.lock() {
                jobs.remove(&job_id);
            }
            completion(failed_result(
                &job_id,
                &server_id,
                format!("dispatch failed: {e}"),
            ));
        }
    }

    fn dispatch_local(
        &self,
        spec: JobSpec,
        progress: ProgressCallback,
        completion: CompletionCallback,
    ) {
        let job_id = spec.job_id.clone();
        info!(job = %job_id, "dispatching to local pool");

        let mut job = Job::with_id(
            job_id.clone(),
            PathBuf::from(&spec.input_file),
            MediaKind::Video,
        );
        let output = job.add_output(Output::new(
            PathBuf::from(&spec.output_file),
            EncodeParams {
                encoder: spec.encoder.clone(),
                container: spec.container.clone(),
                quality: spec.quality_value.clone(),
                preset: spec.preset.clone().unwrap_or_default(),
                extra_args: spec.ffmpeg_args.clone(),
            },
        ));
        if let Some(duration) = spec.estimated_duration {
            job.set_duration(duration);
        }
        let job = Arc::new(job);

        // The local command builder: input, the spec's opaque arguments,
        // then the structured progress stream on stdout.
        let ffmpeg_path = self.inner.ffmpeg_path.clone();
        let builder: CommandBuilder = Arc::new(move |job: &Job, output: &Output| {
            let mut argv = vec![
                ffmpeg_path.clone(),
                "-i".to_string(),
                job.src_path.to_string_lossy().into_owned(),
            ];
            argv.extend(output.params.extra_args.iter().cloned());
            argv.push("-progress".to_string());
            argv.push("-".to_string());
            argv.push("-nostats".to_string());
            argv.push(output.dst_path.to_string_lossy().into_owned());
            argv
        });

        if let Ok(mut jobs) = self.inner.jobs.lock() {
            jobs.insert(
                job_id.clone(),
                JobEntry {
                    target: DispatchTarget::Local(job.clone()),
                    progress,
                    completion: completion.clone(),
                },
            );
        }

        if let Err(e) = self.inner.pool.submit(job, output, builder) {
            warn!(job = %job_id, error = %e, "local dispatch failed");
            if let Ok(mut jobs) = self.inner.jobs.lock() {
                jobs.remove(&job_id);
            }
            completion(failed_result(
                &job_id,
                LOCAL_SERVER_ID,
                format!("dispatch failed: {e}"),
            ));
        }
    }

    /// Request cancellation of a dispatched job. The status transition
    /// lands when the pool or the remote server confirms it.
    pub async fn cancel_job(&self, job_id: &str) {
        match self.target_of(job_id) {
            Some(DispatchTarget::Local(job)) => {
                let pool = self.inner.pool.clone();
                let _ = tokio::task::spawn_blocking(move || pool.cancel_job(&job)).await;
            }
            Some(DispatchTarget::Remote(server_id)) => {
                if let Err(e) = self.inner.client.cancel_remote(&server_id, job_id).await {
                    warn!(job = job_id, error = %e, "remote cancel failed");
                }
            }
            None => warn!(job = job_id, "cancel requested for unknown job"),
        }
    }

    /// Request a pause of a dispatched job.
    pub async fn pause_job(&self, job_id: &str) {
        match self.target_of(job_id) {
            Some(DispatchTarget::Local(job)) => {
                for output in &job.outputs {
                    self.inner.pool.pause_output(output);
                }
            }
            Some(DispatchTarget::Remote(server_id)) => {
                if let Err(e) = self.inner.client.pause_remote(&server_id, job_id).await {
                    warn!(job = job_id, error = %e, "remote pause failed");
                }
            }
            None => warn!(job = job_id, "pause requested for unknown job"),
        }
    }

    /// Request a resume of a paused job.
    pub async fn resume_job(&self, job_id: &str) {
        match self.target_of(job_id) {
            Some(DispatchTarget::Local(job)) => {
                for output in &job.outputs {
                    self.inner.pool.resume_output(output);
                }
            }
            Some(DispatchTarget::Remote(server_id)) => {
                if let Err(e) = self.inner.client.resume_remote(&server_id, job_id).await {
                    warn!(job = job_id, error = %e, "remote resume failed");
                }
            }
            None => warn!(job = job_id, "resume requested for unknown job"),
        }
    }

    /// Ids of jobs currently dispatched and not yet retired.
    pub fn active_jobs(&self) -> Vec<String> {
        self.inner
            .jobs
            .lock()
            .map(|jobs| jobs.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn target_of(&self, job_id: &str) -> Option<DispatchTarget> {
        self.inner
            .jobs
            .lock()
            .ok()
            .and_then(|jobs| jobs.get(job_id).map(|entry| entry.target.clone()))
    }
}

fn failed_result(job_id: &str, server_id: &str, message: String) -> JobResult {
    JobResult {
        job_id: job_id.to_string(),
        output_id: None,
        status: RemoteJobStatus::Failed,
        output_file: String::new(),
        file_size: 0,
        duration: 0.0,
        average_fps: 0.0,
        error_message: Some(message),
        server_id: server_id.to_string(),
        completed_at: unix_now(),
    }
}

/// Relay one pool callback to the job's registered callbacks; on a
/// terminal status, deliver the result exactly once and retire the entry.
fn handle_local_event(inner: &Arc<SchedulerInner>, event: LocalEvent) {
    let callbacks = inner
        .jobs
        .lock()
        .ok()
        .and_then(|jobs| {
            jobs.get(&event.job_id)
                .map(|entry| (entry.progress.clone(), entry.completion.clone()))
        });
    let Some((progress_cb, completion_cb)) = callbacks else {
        return;
    };

    progress_cb(JobProgress {
        job_id: event.job_id.clone(),
        output_id: Some(event.output_id.clone()),
        progress: event.progress as f64,
        current_frame: None,
        total_frames: None,
        fps: None,
        bitrate: None,
        speed: None,
        eta: None,
        server_id: LOCAL_SERVER_ID.to_string(),
    });

    if !event.status.is_terminal() {
        return;
    }

    let removed = inner
        .jobs
        .lock()
        .map(|mut jobs| jobs.remove(&event.job_id).is_some())
        .unwrap_or(false);
    if !removed {
        return;
    }

    let status = match event.status {
        OutputStatus::Done => RemoteJobStatus::Completed,
        OutputStatus::Cancelled => RemoteJobStatus::Cancelled,
        _ => RemoteJobStatus::Failed,
    };
    let file_size = std::fs::metadata(&event.dst_path)
        .map(|m| m.len())
        .unwrap_or(0);

    completion_cb(JobResult {
        job_id: event.job_id,
        output_id: Some(event.output_id),
        status,
        output_file: event.dst_path.to_string_lossy().into_owned(),
        file_size,
        duration: 0.0,
        average_fps: 0.0,
        error_message: event.error,
        server_id: LOCAL_SERVER_ID.to_string(),
        completed_at: unix_now(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientConfig;
    use crate::messages::EncoderKind;
    use crate::protocol::{Message, MessageBody};
    use futures::{SinkExt, StreamExt};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    fn no_probe() -> Box<dyn DurationProbe> {
        Box::new(|_: &Path| -> Option<f64> { None })
    }

    fn fast_client() -> Arc<ConnectionManager> {
        Arc::new(ConnectionManager::new(ClientConfig {
            connect_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(2),
            reconnect_initial_delay: Duration::from_millis(50),
            reconnect_max_delay: Duration::from_millis(200),
            ..ClientConfig::default()
        }))
    }

    /// Spec whose local command ends up as `env -i sh -c <script> ...`,
    /// which lets tests drive the full local path without ffmpeg.
    fn shell_spec(job_id: &str, script: &str) -> JobSpec {
        JobSpec {
            job_id: job_id.to_string(),
            input_file: "sh".to_string(),
            output_file: "/tmp/encode-farm-test-output.mkv".to_string(),
            encoder: "libx264".to_string(),
            encoder_type: EncoderKind::Software,
            preset: None,
            quality_mode: "crf".to_string(),
            quality_value: "23".to_string(),
            filters: vec![],
            ffmpeg_args: vec!["-c".to_string(), script.to_string()],
            required_capabilities: vec![],
            priority: 5,
            estimated_duration: None,
            file_size: 0,
            resolution: "1920x1080".to_string(),
            codec: "h264".to_string(),
            container: "mkv".to_string(),
        }
    }

    fn completion_channel() -> (CompletionCallback, oneshot::Receiver<JobResult>) {
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let callback: CompletionCallback = Arc::new(move |result| {
            if let Ok(mut slot) = slot.lock() {
                if let Some(tx) = slot.take() {
                    let _ = tx.send(result);
                }
            }
        });
        (callback, rx)
    }

    #[tokio::test]
    async fn test_local_job_completes() {
        let scheduler = Scheduler::new(
            fast_client(),
            no_probe(),
            "env".to_string(),
            Duration::from_secs(5),
        );
        scheduler.start_local_pool(1);

        let progress_count = Arc::new(AtomicUsize::new(0));
        let seen = progress_count.clone();
        let progress: ProgressCallback = Arc::new(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let (completion, done) = completion_channel();

        scheduler
            .add_job(
                shell_spec("job-local", "printf 'progress=end\\n'"),
                progress,
                completion,
            )
            .await;

        let result = tokio::time::timeout(Duration::from_secs(10), done)
            .await
            .expect("completion should arrive")
            .unwrap();
        assert_eq!(result.status, RemoteJobStatus::Completed);
        assert_eq!(result.server_id, "local");
        assert!(progress_count.load(Ordering::SeqCst) >= 1);
        assert!(scheduler.active_jobs().is_empty());

        scheduler.stop_local_pool();
    }

    #[tokio::test]
    async fn test_local_job_failure_reports_error() {
        let scheduler = Scheduler::new(
            fast_client(),
            no_probe(),
            "env".to_string(),
            Duration::from_secs(5),
        );
        scheduler.start_local_pool(1);

        let (completion, done) = completion_channel();
        scheduler
            .add_job(
                shell_spec("job-fail", "echo kaput >&2; exit 9"),
                Arc::new(|_| {}),
                completion,
            )
            .await;

        let result = tokio::time::timeout(Duration::from_secs(10), done)
            .await
            .expect("completion should arrive")
            .unwrap();
        assert_eq!(result.status, RemoteJobStatus::Failed);
        let message = result.error_message.expect("diagnostics expected");
        assert!(message.contains("kaput"), "message: {message}");

        scheduler.stop_local_pool();
    }

    #[tokio::test]
    async fn test_cancel_local_job() {
        let scheduler = Scheduler::new(
            fast_client(),
            no_probe(),
            "env".to_string(),
            Duration::from_secs(5),
        );
        scheduler.start_local_pool(1);

        let (completion, done) = completion_channel();
        // Builtin-only busy loop: `env -i` clears PATH, so external
        // commands may not resolve inside the script.
        scheduler
            .add_job(
                shell_spec("job-cxl", "while :; do :; done"),
                Arc::new(|_| {}),
                completion,
            )
            .await;

        // Give the worker a moment to start the process, then cancel.
        tokio::time::sleep(Duration::from_millis(300)).await;
        scheduler.cancel_job("job-cxl").await;

        let result = tokio::time::timeout(Duration::from_secs(10), done)
            .await
            .expect("completion should arrive")
            .unwrap();
        assert_eq!(result.status, RemoteJobStatus::Cancelled);
        assert!(scheduler.active_jobs().is_empty());

        scheduler.stop_local_pool();
    }

    #[tokio::test]
    async fn test_dispatch_failure_surfaces_failed_result() {
        let scheduler = Scheduler::new(
            fast_client(),
            no_probe(),
            "env".to_string(),
            Duration::from_secs(5),
        );
        // Pool intentionally not started: local submission fails.

        let (completion, done) = completion_channel();
        scheduler
            .add_job(shell_spec("job-nopool", "true"), Arc::new(|_| {}), completion)
            .await;

        let result = tokio::time::timeout(Duration::from_secs(5), done)
            .await
            .expect("failure result should arrive")
            .unwrap();
        assert_eq!(result.status, RemoteJobStatus::Failed);
        assert!(result.error_message.unwrap().contains("dispatch failed"));
        assert!(scheduler.active_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_remote_dispatch_and_completion() {
        use crate::messages::{JobResult as WireResult, ServerCapabilities, ServerInfo, ServerStatus};
        use std::collections::BTreeMap;
        use tokio::net::TcpListener;
        use tokio_tungstenite::{accept_async, MaybeTlsStream};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(MaybeTlsStream::Plain(stream)).await.unwrap();

            // Handshake.
            let frame = ws.next().await.unwrap().unwrap();
            let hello = Message::from_frame(&frame).unwrap().unwrap();
            assert!(matches!(hello.body, MessageBody::Hello { .. }));
            let info = ServerInfo {
                server_id: "srv-remote".to_string(),
                name: "remote".to_string(),
                ip: "0.0.0.0".to_string(),
                port: 0,
                status: ServerStatus::Online,
                capabilities: ServerCapabilities {
                    hostname: "remote".to_string(),
                    os: "linux".to_string(),
                    cpu_cores: 8,
                    memory_gb: 16.0,
                    disk_space_gb: 200.0,
                    software_encoders: vec!["libx264".to_string()],
                    hardware_encoders: BTreeMap::new(),
                    estimated_performance: 800.0,
                    current_load: 0.0,
                    max_resolution: "4K".to_string(),
                    supported_formats: vec!["mkv".to_string()],
                    max_file_size_gb: 100.0,
                },
                max_jobs: 2,
                current_jobs: 0,
                uptime: 5.0,
                last_seen: unix_now(),
            };
            ws.send(
                Message::new(MessageBody::ServerInfo(info))
                    .to_frame()
                    .unwrap(),
            )
            .await
            .unwrap();

            // Job submission arrives here, not on the local pool.
            let frame = ws.next().await.unwrap().unwrap();
            let submit = Message::from_frame(&frame).unwrap().unwrap();
            let MessageBody::JobSubmit(spec) = submit.body else {
                panic!("expected job_submit, got {}", submit.body.kind());
            };
            assert_eq!(spec.job_id, "job-remote");

            ws.send(
                Message::new(MessageBody::JobCompleted(WireResult {
                    job_id: spec.job_id,
                    output_id: None,
                    status: RemoteJobStatus::Completed,
                    output_file: "/srv/out.mkv".to_string(),
                    file_size: 2048,
                    duration: 3.0,
                    average_fps: 30.0,
                    error_message: None,
                    server_id: "srv-remote".to_string(),
                    completed_at: unix_now(),
                }))
                .to_frame()
                .unwrap(),
            )
            .await
            .unwrap();

            let _ = ws.next().await;
        });

        let client = fast_client();
        client.connect(&address).await.expect("should connect");

        let scheduler = Scheduler::new(
            client,
            no_probe(),
            "env".to_string(),
            Duration::from_secs(5),
        );
        // Local pool never started: a local fallback would fail, so a
        // completed result proves the remote path was taken.

        let (completion, done) = completion_channel();
        scheduler
            .add_job(shell_spec("job-remote", "true"), Arc::new(|_| {}), completion)
            .await;

        let result = tokio::time::timeout(Duration::from_secs(5), done)
            .await
            .expect("completion should arrive")
            .unwrap();
        assert_eq!(result.status, RemoteJobStatus::Completed);
        assert_eq!(result.server_id, "srv-remote");
        assert!(scheduler.active_jobs().is_empty());

        server.abort();
    }
}
