//! Connection manager for remote encode servers.
//!
//! Owns one persistent WebSocket connection per server address. Each
//! connection gets a dedicated listen loop that dispatches directory
//! updates, per-job progress/completion callbacks, pending-request
//! replies and the chunked file-download state machine. Lost connections
//! are retried with exponential backoff.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::messages::{CapabilityReport, JobProgress, JobResult, JobSpec, ServerInfo};
use crate::protocol::{unix_now, Message, MessageBody, ProtocolError};

/// Invoked for every progress push of a submitted job.
pub type ProgressCallback = Arc<dyn Fn(JobProgress) + Send + Sync>;
/// Invoked once with the terminal result of a submitted job.
pub type CompletionCallback = Arc<dyn Fn(JobResult) + Send + Sync>;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Error type for client operations
#[derive(Debug, Error)]
pub enum ClientError {
    /// No active connection for this server
    #[error("No active connection to server {0}")]
    NotConnected(String),

    /// Server id is not in the directory
    #[error("Unknown server {0}")]
    UnknownServer(String),

    /// No reply arrived within the request timeout
    #[error("Request timed out")]
    Timeout,

    /// Connection dropped before the reply arrived
    #[error("Connection closed before the reply arrived")]
    ConnectionClosed,

    /// Server answered with an error/validation_error message
    #[error("Server rejected the request: {0}")]
    Rejected(String),

    /// Message could not be encoded or decoded
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Tunables for the connection manager.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Name announced in the hello handshake.
    pub client_name: String,
    /// Timeout for connecting and for the server_info handshake reply.
    pub connect_timeout: Duration,
    /// Timeout for request/response exchanges (ping, capabilities).
    pub request_timeout: Duration,
    /// First reconnect delay; doubles after every failed attempt.
    pub reconnect_initial_delay: Duration,
    /// Upper bound for the reconnect delay.
    pub reconnect_max_delay: Duration,
    /// Maximum reconnect attempts per address; negative = unbounded.
    pub reconnect_max_attempts: i64,
    /// Directory that received result files are written into.
    pub download_dir: PathBuf,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_name: "encode-farm".to_string(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            reconnect_initial_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(60),
            reconnect_max_attempts: -1,
            download_dir: std::env::temp_dir().join("encode-farm-downloads"),
        }
    }
}

impl ClientConfig {
    /// Build from the persisted `[distributed]` configuration section.
    pub fn from_distributed(cfg: &encode_farm_config::DistributedConfig) -> Self {
        Self {
            connect_timeout: Duration::from_secs(cfg.connect_timeout_secs),
            request_timeout: Duration::from_secs(cfg.request_timeout_secs),
            reconnect_initial_delay: Duration::from_millis(cfg.reconnect_initial_delay_ms),
            reconnect_max_delay: Duration::from_millis(cfg.reconnect_max_delay_ms),
            reconnect_max_attempts: cfg.reconnect_max_attempts,
            ..Self::default()
        }
    }
}

/// The next backoff delay: doubled, capped at `max`.
pub(crate) fn next_delay(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}

struct ConnectionHandle {
    outbound: mpsc::UnboundedSender<WsMessage>,
    listen_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

struct DownloadState {
    file: tokio::fs::File,
    path: PathBuf,
    received: u64,
    declared: u64,
}

struct ClientInner {
    config: ClientConfig,
    /// Directory of known servers, keyed by server id.
    servers: Mutex<HashMap<String, ServerInfo>>,
    /// Active connections, keyed by "ip:port".
    connections: Mutex<HashMap<String, ConnectionHandle>>,
    /// Pending request slots, keyed by the request message id.
    pending: Mutex<HashMap<String, oneshot::Sender<Result<Message, ClientError>>>>,
    progress_callbacks: Mutex<HashMap<String, ProgressCallback>>,
    completion_callbacks: Mutex<HashMap<String, CompletionCallback>>,
    downloads: Mutex<HashMap<String, DownloadState>>,
    reconnect_tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

/// Distributed client owning all remote-server connections.
pub struct ConnectionManager {
    inner: Arc<ClientInner>,
}

impl ConnectionManager {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config,
                servers: Mutex::new(HashMap::new()),
                connections: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                progress_callbacks: Mutex::new(HashMap::new()),
                completion_callbacks: Mutex::new(HashMap::new()),
                downloads: Mutex::new(HashMap::new()),
                reconnect_tasks: Mutex::new(HashMap::new()),
                shutting_down: AtomicBool::new(false),
            }),
        }
    }

    /// Connect to `address` ("host:port"), run the hello/server_info
    /// handshake and start the listen loop.
    ///
    /// Expected failures (unreachable host, handshake timeout, unexpected
    /// reply) return `None`; no connection is registered and no reconnect
    /// task is started.
    pub async fn connect(&self, address: &str) -> Option<ServerInfo> {
        connect_inner(self.inner.clone(), address).await
    }

    /// Submit a job to a connected server. Callbacks are registered under
    /// the job id before the submit message is sent and unwound again if
    /// the send fails.
    pub async fn submit_job(
        &self,
        server_id: &str,
        spec: JobSpec,
        progress: ProgressCallback,
        completion: CompletionCallback,
    ) -> Result<(), ClientError> {
        let address = self.address_for(server_id).await?;
        let job_id = spec.job_id.clone();

        self.inner
            .progress_callbacks
            .lock()
            .await
            .insert(job_id.clone(), progress);
        self.inner
            .completion_callbacks
            .lock()
            .await
            .insert(job_id.clone(), completion);

        let message = Message::new(MessageBody::JobSubmit(spec));
        match self.send_to(&address, message).await {
            Ok(()) => {
                info!(job = %job_id, server = server_id, "job submitted");
                Ok(())
            }
            Err(e) => {
                self.inner.progress_callbacks.lock().await.remove(&job_id);
                self.inner.completion_callbacks.lock().await.remove(&job_id);
                Err(e)
            }
        }
    }

    /// Ping a server; `false` on timeout, missing connection or error
    /// reply.
    pub async fn ping(&self, server_id: &str) -> bool {
        let body = MessageBody::Ping {
            timestamp: unix_now(),
        };
        match self.request(server_id, body).await {
            Ok(reply) => matches!(reply.body, MessageBody::Pong { .. }),
            Err(e) => {
                warn!(server = server_id, error = %e, "ping failed");
                false
            }
        }
    }

    /// Ask a server which of `encoders_needed` it supports.
    pub async fn request_capabilities(
        &self,
        server_id: &str,
        encoders_needed: Vec<String>,
    ) -> Option<CapabilityReport> {
        let body = MessageBody::CapabilityRequest { encoders_needed };
        match self.request(server_id, body).await {
            Ok(reply) => match reply.body {
                MessageBody::CapabilityResponse(report) => Some(report),
                other => {
                    warn!(server = server_id, kind = other.kind(), "unexpected capability reply");
                    None
                }
            },
            Err(e) => {
                warn!(server = server_id, error = %e, "capability request failed");
                None
            }
        }
    }

    /// Ask a server to cancel a job it is running.
    pub async fn cancel_remote(&self, server_id: &str, job_id: &str) -> Result<(), ClientError> {
        let address = self.address_for(server_id).await?;
        self.send_to(
            &address,
            Message::new(MessageBody::JobCancel {
                job_id: job_id.to_string(),
            }),
        )
        .await
    }

    /// Ask a server to pause a job it is running.
    pub async fn pause_remote(&self, server_id: &str, job_id: &str) -> Result<(), ClientError> {
        let address = self.address_for(server_id).await?;
        self.send_to(
            &address,
            Message::new(MessageBody::JobPause {
                job_id: job_id.to_string(),
            }),
        )
        .await
    }

    /// Ask a server to resume a paused job.
    pub async fn resume_remote(&self, server_id: &str, job_id: &str) -> Result<(), ClientError> {
        let address = self.address_for(server_id).await?;
        self.send_to(
            &address,
            Message::new(MessageBody::JobResume {
                job_id: job_id.to_string(),
            }),
        )
        .await
    }

    /// Servers with a live connection right now.
    pub async fn connected_servers(&self) -> Vec<ServerInfo> {
        let connections = self.inner.connections.lock().await;
        self.inner
            .servers
            .lock()
            .await
            .values()
            .filter(|info| connections.contains_key(&info.address()))
            .cloned()
            .collect()
    }

    /// Every server seen so far, connected or not.
    pub async fn all_servers(&self) -> Vec<ServerInfo> {
        self.inner.servers.lock().await.values().cloned().collect()
    }

    pub async fn server(&self, server_id: &str) -> Option<ServerInfo> {
        self.inner.servers.lock().await.get(server_id).cloned()
    }

    pub async fn is_connected(&self, address: &str) -> bool {
        self.inner.connections.lock().await.contains_key(address)
    }

    pub async fn has_reconnect_task(&self, address: &str) -> bool {
        self.inner.reconnect_tasks.lock().await.contains_key(address)
    }

    /// Close the connection to one server and cancel its reconnect task.
    pub async fn disconnect(&self, server_id: &str) {
        let Ok(address) = self.address_for(server_id).await else {
            return;
        };
        if let Some(handle) = self.inner.connections.lock().await.remove(&address) {
            handle.listen_task.abort();
            handle.writer_task.abort();
            info!(server = server_id, "disconnected");
        }
        if let Some(task) = self.inner.reconnect_tasks.lock().await.remove(&address) {
            task.abort();
        }
    }

    /// Drop a server from the directory entirely.
    pub async fn forget_server(&self, server_id: &str) {
        self.inner.servers.lock().await.remove(server_id);
    }

    /// Close every connection, cancel every reconnect task and fail all
    /// in-flight requests. Idempotent.
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);

        for (_, handle) in self.inner.connections.lock().await.drain() {
            handle.listen_task.abort();
            handle.writer_task.abort();
        }
        for (_, task) in self.inner.reconnect_tasks.lock().await.drain() {
            task.abort();
        }
        for (_, slot) in self.inner.pending.lock().await.drain() {
            let _ = slot.send(Err(ClientError::ConnectionClosed));
        }
        self.inner.progress_callbacks.lock().await.clear();
        self.inner.completion_callbacks.lock().await.clear();
        self.inner.downloads.lock().await.clear();
        info!("distributed client shut down");
    }

    async fn address_for(&self, server_id: &str) -> Result<String, ClientError> {
        self.inner
            .servers
            .lock()
            .await
            .get(server_id)
            .map(|info| info.address())
            .ok_or_else(|| ClientError::UnknownServer(server_id.to_string()))
    }

    /// Send one message over the active connection for `address`.
    async fn send_to(&self, address: &str, message: Message) -> Result<(), ClientError> {
        let frame = message.to_frame()?;
        let connections = self.inner.connections.lock().await;
        let handle = connections
            .get(address)
            .ok_or_else(|| ClientError::NotConnected(address.to_string()))?;
        handle
            .outbound
            .send(frame)
            .map_err(|_| ClientError::NotConnected(address.to_string()))
    }

    /// Request/response helper: register a pending slot, send, await the
    /// reply with a timeout, and always deregister the slot.
    async fn request(&self, server_id: &str, body: MessageBody) -> Result<Message, ClientError> {
        let address = self.address_for(server_id).await?;
        let message = Message::new(body);
        let message_id = message.message_id.clone();

        let (tx, rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .await
            .insert(message_id.clone(), tx);

        let outcome = match self.send_to(&address, message).await {
            Ok(()) => match tokio::time::timeout(self.inner.config.request_timeout, rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(ClientError::ConnectionClosed),
                Err(_) => Err(ClientError::Timeout),
            },
            Err(e) => Err(e),
        };

        // Cleanup happens regardless of how the request ended.
        self.inner.pending.lock().await.remove(&message_id);
        outcome
    }
}

/// Parse "host:port" and overwrite the endpoint fields the server cannot
/// know about itself.
fn fill_endpoint(info: &mut ServerInfo, address: &str) {
    if let Some((host, port)) = address.rsplit_once(':') {
        info.ip = host.to_string();
        if let Ok(port) = port.parse::<u16>() {
            info.port = port;
        }
    }
}

async fn connect_inner(inner: Arc<ClientInner>, address: &str) -> Option<ServerInfo> {
    let url = format!("ws://{}", address);
    debug!(%address, "connecting");

    let connected =
        tokio::time::timeout(inner.config.connect_timeout, connect_async(url.as_str())).await;
    let ws = match connected {
        Ok(Ok((ws, _response))) => ws,
        Ok(Err(e)) => {
            warn!(%address, error = %e, "connection failed");
            return None;
        }
        Err(_) => {
            warn!(%address, "connection timed out");
            return None;
        }
    };

    let (mut sink, mut source) = ws.split();

    let hello = Message::new(MessageBody::Hello {
        client_name: inner.config.client_name.clone(),
    });
    let frame = match hello.to_frame() {
        Ok(frame) => frame,
        Err(e) => {
            error!(error = %e, "failed to encode hello");
            return None;
        }
    };
    if let Err(e) = sink.send(frame).await {
        warn!(%address, error = %e, "hello send failed");
        return None;
    }

    let reply = tokio::time::timeout(inner.config.connect_timeout, next_message(&mut source)).await;
    let mut info = match reply {
        Ok(Some(message)) => match message.body {
            MessageBody::ServerInfo(info) => info,
            other => {
                warn!(%address, kind = other.kind(), "unexpected handshake reply");
                let _ = sink.close().await;
                return None;
            }
        },
        Ok(None) => {
            warn!(%address, "connection closed during handshake");
            return None;
        }
        Err(_) => {
            warn!(%address, "handshake timed out");
            let _ = sink.close().await;
            return None;
        }
    };
    fill_endpoint(&mut info, address);

    let (outbound, outbound_rx) = mpsc::unbounded_channel::<WsMessage>();
    let writer_task = tokio::spawn(writer_loop(sink, outbound_rx));
    let listen_task = tokio::spawn(listen_loop(
        inner.clone(),
        address.to_string(),
        source,
        outbound.clone(),
    ));

    // Replace any stale connection for this address.
    if let Some(old) = inner.connections.lock().await.insert(
        address.to_string(),
        ConnectionHandle {
            outbound,
            listen_task,
            writer_task,
        },
    ) {
        old.listen_task.abort();
        old.writer_task.abort();
    }

    inner
        .servers
        .lock()
        .await
        .insert(info.server_id.clone(), info.clone());

    info!(%address, server = %info.server_id, name = %info.name, "connected");
    Some(info)
}

/// Pull the next protocol message, skipping transport control frames.
async fn next_message(source: &mut WsSource) -> Option<Message> {
    while let Some(frame) = source.next().await {
        match frame {
            Ok(WsMessage::Close(_)) => return None,
            Ok(frame) => match Message::from_frame(&frame) {
                Ok(Some(message)) => return Some(message),
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, "discarding malformed frame");
                    continue;
                }
            },
            Err(_) => return None,
        }
    }
    None
}

async fn writer_loop(mut sink: WsSink, mut outbound_rx: mpsc::UnboundedReceiver<WsMessage>) {
    while let Some(frame) = outbound_rx.recv().await {
        if sink.send(frame).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

/// One listen loop per connection, for its whole lifetime. When the loop
/// ends the connection is dropped from the active set and a reconnect
/// task is started unless one is already running.
async fn listen_loop(
    inner: Arc<ClientInner>,
    address: String,
    mut source: WsSource,
    outbound: mpsc::UnboundedSender<WsMessage>,
) {
    loop {
        match source.next().await {
            Some(Ok(WsMessage::Close(_))) | None => break,
            Some(Ok(frame)) => match Message::from_frame(&frame) {
                Ok(Some(message)) => dispatch(&inner, &address, message, &outbound).await,
                Ok(None) => {}
                Err(e) => warn!(%address, error = %e, "discarding malformed frame"),
            },
            Some(Err(e)) => {
                warn!(%address, error = %e, "connection error");
                break;
            }
        }
    }

    info!(%address, "listen loop ended");
    inner.connections.lock().await.remove(&address);

    if !inner.shutting_down.load(Ordering::SeqCst) {
        spawn_reconnect(inner.clone(), address).await;
    }
}

async fn dispatch(
    inner: &Arc<ClientInner>,
    address: &str,
    message: Message,
    outbound: &mpsc::UnboundedSender<WsMessage>,
) {
    let Message {
        body,
        message_id,
        timestamp,
        reply_to,
    } = message;
    debug!(%address, kind = body.kind(), "message received");

    match body {
        MessageBody::ServerInfo(mut info) => {
            fill_endpoint(&mut info, address);
            debug!(server = %info.server_id, status = %info.status, "server info updated");
            inner
                .servers
                .lock()
                .await
                .insert(info.server_id.clone(), info);
        }

        MessageBody::JobProgress(progress) => {
            let callback = inner
                .progress_callbacks
                .lock()
                .await
                .get(&progress.job_id)
                .cloned();
            if let Some(callback) = callback {
                callback(progress);
            }
        }

        MessageBody::JobCompleted(result) | MessageBody::JobFailed(result) => {
            // Terminal result: deliver once, then deregister both
            // callbacks for this job.
            let completion = inner
                .completion_callbacks
                .lock()
                .await
                .remove(&result.job_id);
            inner.progress_callbacks.lock().await.remove(&result.job_id);
            if let Some(callback) = completion {
                callback(result);
            }
        }

        MessageBody::Error { error } | MessageBody::ValidationError { error } => {
            error!(%address, %error, "server reported an error");
            if let Some(request_id) = reply_to {
                if let Some(slot) = inner.pending.lock().await.remove(&request_id) {
                    let _ = slot.send(Err(ClientError::Rejected(error)));
                }
            }
        }

        MessageBody::FileDownloadStart {
            job_id,
            file_name,
            file_size,
        } => {
            if let Err(e) = begin_download(inner, &job_id, &file_name, file_size).await {
                warn!(job = %job_id, error = %e, "could not open download target");
            }
        }

        MessageBody::FileChunk { job_id, chunk } => {
            match append_chunk(inner, &job_id, &chunk).await {
                Ok(true) => {
                    // Full file received: acknowledge so the sender can
                    // clean up its copy.
                    let cleanup = Message::new(MessageBody::FileCleanup {
                        job_id: job_id.clone(),
                    });
                    if let Ok(frame) = cleanup.to_frame() {
                        let _ = outbound.send(frame);
                    }
                    info!(job = %job_id, "download complete");
                }
                Ok(false) => {}
                Err(e) => warn!(job = %job_id, error = %e, "chunk write failed"),
            }
        }

        MessageBody::FileCleanup { job_id } => {
            debug!(job = %job_id, "peer confirmed file delivery");
        }

        other => {
            // Generic request/response resolution for replies that need
            // no special handling (pong, capability_response, ...).
            if let Some(request_id) = reply_to.clone() {
                if let Some(slot) = inner.pending.lock().await.remove(&request_id) {
                    let _ = slot.send(Ok(Message {
                        body: other,
                        message_id,
                        timestamp,
                        reply_to,
                    }));
                    return;
                }
            }
            debug!(%address, kind = other.kind(), "unhandled message");
        }
    }
}

async fn begin_download(
    inner: &Arc<ClientInner>,
    job_id: &str,
    file_name: &str,
    file_size: u64,
) -> std::io::Result<()> {
    tokio::fs::create_dir_all(&inner.config.download_dir).await?;
    // Strip any path components the sender may have included.
    let safe_name = std::path::Path::new(file_name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("{job_id}_result"));
    let path = inner.config.download_dir.join(safe_name);
    let file = tokio::fs::File::create(&path).await?;

    inner.downloads.lock().await.insert(
        job_id.to_string(),
        DownloadState {
            file,
            path,
            received: 0,
            declared: file_size,
        },
    );
    Ok(())
}

/// Append one chunk; `Ok(true)` once the declared size is reached and the
/// file has been closed.
async fn append_chunk(
    inner: &Arc<ClientInner>,
    job_id: &str,
    chunk: &[u8],
) -> std::io::Result<bool> {
    let mut downloads = inner.downloads.lock().await;
    let Some(state) = downloads.get_mut(job_id) else {
        return Ok(false);
    };

    state.file.write_all(chunk).await?;
    state.received += chunk.len() as u64;

    if state.received >= state.declared {
        let state = downloads.remove(job_id);
        if let Some(state) = state {
            let mut file = state.file;
            file.flush().await?;
            debug!(job = %job_id, path = %state.path.display(), "download closed");
        }
        return Ok(true);
    }
    Ok(false)
}

async fn spawn_reconnect(inner: Arc<ClientInner>, address: String) {
    let mut tasks = inner.reconnect_tasks.lock().await;
    if tasks.contains_key(&address) {
        return;
    }
    let task_inner = inner.clone();
    let task_address = address.clone();
    let handle = tokio::spawn(async move {
        reconnect_loop(task_inner, task_address).await;
    });
    tasks.insert(address, handle);
}

/// Exponential backoff reconnect: initial delay doubling up to the
/// configured maximum, with an optional attempt cap.
///
/// Returns a boxed future with an explicit `Send` bound to break the
/// auto-trait inference cycle between `reconnect_loop`, `connect_inner`
/// and the spawned `listen_loop`/`spawn_reconnect` chain.
fn reconnect_loop(
    inner: Arc<ClientInner>,
    address: String,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
    Box::pin(async move {
    let mut delay = inner.config.reconnect_initial_delay;
    let mut attempts: i64 = 0;

    loop {
        if inner.shutting_down.load(Ordering::SeqCst) {
            break;
        }
        if inner.config.reconnect_max_attempts >= 0
            && attempts >= inner.config.reconnect_max_attempts
        {
            warn!(%address, attempts, "reconnect attempts exhausted, abandoning address");
            break;
        }

        attempts += 1;
        info!(%address, attempt = attempts, delay_ms = delay.as_millis() as u64, "reconnecting");
        tokio::time::sleep(delay).await;

        if connect_inner(inner.clone(), &address).await.is_some() {
            info!(%address, "reconnected");
            break;
        }
        delay = next_delay(delay, inner.config.reconnect_max_delay);
    }

    inner.reconnect_tasks.lock().await.remove(&address);
    })
}
