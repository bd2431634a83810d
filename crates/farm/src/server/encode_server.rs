//! Encode server: the remote execution endpoint.
//!
//! Accepts WebSocket connections, answers the hello/ping/capability
//! exchanges, validates and runs submitted jobs on [`JobProcessor`]s, and
//! streams their progress and results back as push messages.

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{accept_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::detect::detect_capabilities;
use crate::messages::{CapabilityReport, ServerCapabilities, ServerInfo, ServerStatus};
use crate::protocol::{unix_now, Message, MessageBody};
use crate::server::file_store::FileStore;
use crate::server::job_processor::{JobProcessor, ProcessorUpdate};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// Error type for server operations
#[derive(Debug, Error)]
pub enum ServerError {
    /// Listener or connection IO failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Runtime settings for one encode server.
#[derive(Debug, Clone)]
pub struct EncodeServerConfig {
    /// Name announced in server_info.
    pub name: String,
    /// Bind address for the listener.
    pub bind: String,
    /// Listener port.
    pub port: u16,
    /// Maximum concurrent jobs.
    pub max_jobs: u32,
    /// ffmpeg executable.
    pub ffmpeg_path: String,
    /// Directory for transferred inputs and produced outputs.
    pub work_dir: PathBuf,
    /// Grace period before a cancelled job is force-killed.
    pub grace_period: Duration,
}

impl Default for EncodeServerConfig {
    fn default() -> Self {
        Self {
            name: "encode-server".to_string(),
            bind: "0.0.0.0".to_string(),
            port: 8765,
            max_jobs: 2,
            ffmpeg_path: "ffmpeg".to_string(),
            work_dir: std::env::temp_dir().join("encode-farm-server"),
            grace_period: Duration::from_secs(5),
        }
    }
}

impl From<&encode_farm_config::Config> for EncodeServerConfig {
    fn from(config: &encode_farm_config::Config) -> Self {
        let work_dir = if config.server.work_dir.is_empty() {
            std::env::temp_dir().join("encode-farm-server")
        } else {
            PathBuf::from(&config.server.work_dir)
        };
        Self {
            name: config.server.name.clone(),
            bind: config.server.bind.clone(),
            port: config.server.port,
            max_jobs: config.server.max_jobs,
            ffmpeg_path: config.server.ffmpeg_path.clone(),
            work_dir,
            grace_period: Duration::from_secs(config.pool.grace_period_secs),
        }
    }
}

struct ServerInner {
    config: EncodeServerConfig,
    server_id: String,
    capabilities: ServerCapabilities,
    active: Mutex<HashMap<String, Arc<JobProcessor>>>,
    files: FileStore,
    started_at: Instant,
}

/// WebSocket encode server executing jobs for remote clients.
pub struct EncodeServer {
    inner: Arc<ServerInner>,
}

impl EncodeServer {
    pub fn new(config: EncodeServerConfig) -> Self {
        let capabilities = detect_capabilities(&config.ffmpeg_path);
        let files = FileStore::new(config.work_dir.clone());
        Self {
            inner: Arc::new(ServerInner {
                server_id: Uuid::new_v4().to_string(),
                capabilities,
                active: Mutex::new(HashMap::new()),
                files,
                started_at: Instant::now(),
                config,
            }),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.inner.server_id
    }

    /// Bind the configured address and serve until the task is aborted.
    pub async fn run(&self) -> Result<(), ServerError> {
        let address = format!("{}:{}", self.inner.config.bind, self.inner.config.port);
        let listener = TcpListener::bind(&address).await?;
        self.run_on(listener).await
    }

    /// Serve on an already-bound listener.
    pub async fn run_on(&self, listener: TcpListener) -> Result<(), ServerError> {
        info!(
            address = %listener.local_addr()?,
            server = %self.inner.server_id,
            name = %self.inner.config.name,
            "encode server listening"
        );
        loop {
            let (stream, peer) = listener.accept().await?;
            let inner = self.inner.clone();
            tokio::spawn(async move {
                handle_connection(inner, stream, peer).await;
            });
        }
    }
}

async fn handle_connection(inner: Arc<ServerInner>, stream: TcpStream, peer: SocketAddr) {
    let ws = match accept_async(MaybeTlsStream::Plain(stream)).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%peer, error = %e, "websocket handshake failed");
            return;
        }
    };
    info!(%peer, "client connected");

    let (sink, mut source) = ws.split();
    let (outbound, outbound_rx) = mpsc::unbounded_channel::<WsMessage>();
    let writer = tokio::spawn(writer_loop(sink, outbound_rx));

    // Processor updates from every job started over this connection are
    // pumped into push messages.
    let (updates, mut updates_rx) = mpsc::unbounded_channel::<ProcessorUpdate>();
    let pump_inner = inner.clone();
    let pump_outbound = outbound.clone();
    let pump = tokio::spawn(async move {
        while let Some(update) = updates_rx.recv().await {
            match update {
                ProcessorUpdate::Progress(progress) => {
                    send(&pump_outbound, Message::new(MessageBody::JobProgress(progress)));
                }
                ProcessorUpdate::Finished(result) => {
                    pump_inner.active.lock().await.remove(&result.job_id);
                    let body = match result.status {
                        crate::messages::RemoteJobStatus::Failed => {
                            MessageBody::JobFailed(result)
                        }
                        _ => MessageBody::JobCompleted(result),
                    };
                    send(&pump_outbound, Message::new(body));
                    // Job slots changed: republish our directory entry.
                    let info = server_info(&pump_inner).await;
                    send(&pump_outbound, Message::new(MessageBody::ServerInfo(info)));
                }
            }
        }
    });

    while let Some(frame) = source.next().await {
        match frame {
            Ok(WsMessage::Close(_)) => break,
            Ok(frame) => match Message::from_frame(&frame) {
                Ok(Some(message)) => {
                    handle_message(&inner, message, &outbound, &updates).await;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(%peer, error = %e, "malformed message");
                    send(
                        &outbound,
                        Message::new(MessageBody::ValidationError {
                            error: format!("invalid message: {e}"),
                        }),
                    );
                }
            },
            Err(e) => {
                warn!(%peer, error = %e, "connection error");
                break;
            }
        }
    }

    info!(%peer, "client disconnected");
    pump.abort();
    writer.abort();
}

async fn handle_message(
    inner: &Arc<ServerInner>,
    message: Message,
    outbound: &mpsc::UnboundedSender<WsMessage>,
    updates: &mpsc::UnboundedSender<ProcessorUpdate>,
) {
    debug!(kind = message.body.kind(), "message received");
    let request_id = message.message_id.clone();

    match message.body {
        MessageBody::Hello { client_name } => {
            info!(client = %client_name, "hello received");
            let info = server_info(inner).await;
            send(
                outbound,
                Message::reply_to(MessageBody::ServerInfo(info), &request_id),
            );
        }

        MessageBody::Ping { .. } => {
            send(
                outbound,
                Message::reply_to(
                    MessageBody::Pong {
                        timestamp: unix_now(),
                    },
                    &request_id,
                ),
            );
        }

        MessageBody::CapabilityRequest { encoders_needed } => {
            let (supported, missing): (Vec<String>, Vec<String>) = encoders_needed
                .into_iter()
                .partition(|encoder| inner.capabilities.supports_encoder(encoder));
            send(
                outbound,
                Message::reply_to(
                    MessageBody::CapabilityResponse(CapabilityReport {
                        supported,
                        missing,
                        capabilities: inner.capabilities.clone(),
                    }),
                    &request_id,
                ),
            );
        }

        MessageBody::JobSubmit(spec) => {
            let job_id = spec.job_id.clone();
            let mut active = inner.active.lock().await;

            if active.len() as u32 >= inner.config.max_jobs {
                warn!(job = %job_id, "rejected: server at capacity");
                send(
                    outbound,
                    Message::reply_to(
                        MessageBody::ValidationError {
                            error: "server at capacity".to_string(),
                        },
                        &request_id,
                    ),
                );
                return;
            }
            if !inner.capabilities.supports_encoder(&spec.encoder) {
                warn!(job = %job_id, encoder = %spec.encoder, "rejected: unsupported encoder");
                send(
                    outbound,
                    Message::reply_to(
                        MessageBody::ValidationError {
                            error: format!("unsupported encoder: {}", spec.encoder),
                        },
                        &request_id,
                    ),
                );
                return;
            }

            let processor = Arc::new(JobProcessor::new(
                spec,
                inner.server_id.clone(),
                inner.config.ffmpeg_path.clone(),
                inner.config.work_dir.clone(),
                inner.config.grace_period,
            ));
            active.insert(job_id.clone(), processor.clone());
            drop(active);

            info!(job = %job_id, "job accepted");
            let job_updates = updates.clone();
            tokio::spawn(async move {
                processor.run(job_updates).await;
            });

            let info = server_info(inner).await;
            send(outbound, Message::new(MessageBody::ServerInfo(info)));
        }

        MessageBody::JobCancel { job_id } => {
            let processor = inner.active.lock().await.get(&job_id).cloned();
            match processor {
                Some(processor) => {
                    info!(job = %job_id, "cancel requested");
                    tokio::spawn(async move {
                        processor.cancel().await;
                    });
                }
                None => debug!(job = %job_id, "cancel for unknown job"),
            }
        }

        MessageBody::JobPause { job_id } => {
            if let Some(processor) = inner.active.lock().await.get(&job_id).cloned() {
                if processor.pause() {
                    info!(job = %job_id, "job paused");
                }
            }
        }

        MessageBody::JobResume { job_id } => {
            if let Some(processor) = inner.active.lock().await.get(&job_id).cloned() {
                if processor.resume() {
                    info!(job = %job_id, "job resumed");
                }
            }
        }

        MessageBody::FileDownloadStart {
            job_id, file_size, ..
        } => {
            if let Err(e) = inner.files.begin_receive(&job_id, file_size).await {
                warn!(job = %job_id, error = %e, "could not open transfer target");
            }
        }

        MessageBody::FileChunk { job_id, chunk } => {
            match inner.files.receive_chunk(&job_id, &chunk).await {
                Ok(true) => {
                    send(
                        outbound,
                        Message::new(MessageBody::FileCleanup {
                            job_id: job_id.clone(),
                        }),
                    );
                }
                Ok(false) => {}
                Err(e) => warn!(job = %job_id, error = %e, "chunk write failed"),
            }
        }

        MessageBody::FileCleanup { job_id } => {
            inner.files.cleanup(&job_id).await;
        }

        other => {
            debug!(kind = other.kind(), "ignoring unexpected message");
        }
    }
}

async fn server_info(inner: &Arc<ServerInner>) -> ServerInfo {
    let current_jobs = inner.active.lock().await.len() as u32;
    let status = if current_jobs >= inner.config.max_jobs {
        ServerStatus::Busy
    } else {
        ServerStatus::Online
    };

    ServerInfo {
        server_id: inner.server_id.clone(),
        name: inner.config.name.clone(),
        ip: inner.config.bind.clone(),
        port: inner.config.port,
        status,
        capabilities: inner.capabilities.clone(),
        max_jobs: inner.config.max_jobs,
        current_jobs,
        uptime: inner.started_at.elapsed().as_secs_f64(),
        last_seen: unix_now(),
    }
}

fn send(outbound: &mpsc::UnboundedSender<WsMessage>, message: Message) {
    match message.to_frame() {
        Ok(frame) => {
            let _ = outbound.send(frame);
        }
        Err(e) => warn!(error = %e, "failed to encode outgoing message"),
    }
}

async fn writer_loop(mut sink: WsSink, mut outbound_rx: mpsc::UnboundedReceiver<WsMessage>) {
    while let Some(frame) = outbound_rx.recv().await {
        if sink.send(frame).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}
