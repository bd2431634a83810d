//! Server discovery and health monitoring.
//!
//! Connects to the persisted auto-connect list at startup, then runs a
//! fixed-interval loop that pings connected servers, kicks off
//! reconnection for lost ones, and republishes the connected-server
//! snapshot to a registered observer.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::ConnectionManager;
use crate::messages::ServerInfo;
use encode_farm_config::Config;

/// Observer invoked with the connected-server snapshot after every
/// monitoring pass and after add/remove operations.
pub type SnapshotCallback = Arc<dyn Fn(Vec<ServerInfo>) + Send + Sync>;

struct DiscoveryInner {
    client: Arc<ConnectionManager>,
    config: Mutex<Config>,
    config_path: PathBuf,
    interval: Duration,
    update_callback: Mutex<Option<SnapshotCallback>>,
    monitor_task: Mutex<Option<JoinHandle<()>>>,
}

/// Maintains liveness of the known-server set.
pub struct ServerDiscovery {
    inner: Arc<DiscoveryInner>,
}

impl ServerDiscovery {
    pub fn new(client: Arc<ConnectionManager>, config: Config, config_path: PathBuf) -> Self {
        let interval = Duration::from_secs(config.distributed.ping_interval_secs.max(1));
        Self {
            inner: Arc::new(DiscoveryInner {
                client,
                config: Mutex::new(config),
                config_path,
                interval,
                update_callback: Mutex::new(None),
                monitor_task: Mutex::new(None),
            }),
        }
    }

    /// Register the snapshot observer.
    pub async fn register_update_callback(&self, callback: SnapshotCallback) {
        *self.inner.update_callback.lock().await = Some(callback);
    }

    /// Connect to every persisted auto-connect address, then start the
    /// periodic monitoring task. Idempotent while running.
    pub async fn start(&self) {
        let addresses = {
            let config = self.inner.config.lock().await;
            config.distributed.auto_connect.clone()
        };
        for address in addresses {
            if self.inner.client.connect(&address).await.is_none() {
                warn!(%address, "auto-connect failed");
            }
        }
        publish(&self.inner).await;

        let mut task = self.inner.monitor_task.lock().await;
        if task.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            return;
        }
        let inner = self.inner.clone();
        *task = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(inner.interval).await;
                monitor_pass(&inner).await;
            }
        }));
        info!("server discovery started");
    }

    /// Stop monitoring and shut the client down.
    pub async fn stop(&self) {
        if let Some(task) = self.inner.monitor_task.lock().await.take() {
            task.abort();
        }
        self.inner.client.shutdown().await;
        info!("server discovery stopped");
    }

    /// Connect to a new server and persist it in the auto-connect list.
    pub async fn add_server(&self, address: &str) -> Option<ServerInfo> {
        let info = self.inner.client.connect(address).await?;

        {
            let mut config = self.inner.config.lock().await;
            let entry = address.to_string();
            if !config.distributed.auto_connect.contains(&entry) {
                config.distributed.auto_connect.push(entry);
                if let Err(e) = config.save(&self.inner.config_path) {
                    warn!(error = %e, "could not persist auto-connect list");
                }
            }
        }

        publish(&self.inner).await;
        Some(info)
    }

    /// Disconnect a server and remove it from the auto-connect list.
    pub async fn remove_server(&self, server_id: &str) {
        let Some(info) = self.inner.client.server(server_id).await else {
            return;
        };
        let address = info.address();

        self.inner.client.disconnect(server_id).await;
        self.inner.client.forget_server(server_id).await;

        {
            let mut config = self.inner.config.lock().await;
            config.distributed.auto_connect.retain(|a| a != &address);
            if let Err(e) = config.save(&self.inner.config_path) {
                warn!(error = %e, "could not persist auto-connect list");
            }
        }

        publish(&self.inner).await;
    }

    /// Every server seen so far, connected or not.
    pub async fn known_servers(&self) -> Vec<ServerInfo> {
        self.inner.client.all_servers().await
    }

    /// Run one monitoring pass immediately (ping + reconnect + publish).
    pub async fn poll_now(&self) {
        monitor_pass(&self.inner).await;
    }
}

async fn monitor_pass(inner: &Arc<DiscoveryInner>) {
    debug!("monitoring known servers");

    for info in inner.client.all_servers().await {
        let address = info.address();
        if inner.client.is_connected(&address).await {
            // Ping failure is logged, not fatal: a hard disconnect is
            // noticed by the listen loop, which owns reconnection.
            if !inner.client.ping(&info.server_id).await {
                warn!(server = %info.server_id, "ping failed");
            }
        } else if !inner.client.has_reconnect_task(&address).await {
            debug!(server = %info.server_id, %address, "server lost, attempting reconnect");
            let client = inner.client.clone();
            tokio::spawn(async move {
                let _ = client.connect(&address).await;
            });
        }
    }

    publish(inner).await;
}

async fn publish(inner: &Arc<DiscoveryInner>) {
    let callback = inner.update_callback.lock().await.clone();
    if let Some(callback) = callback {
        callback(inner.client.connected_servers().await);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientConfig;
    use crate::protocol::{Message, MessageBody};
    use futures::{SinkExt, StreamExt};
    use std::collections::BTreeMap;
    use std::sync::Mutex as StdMutex;
    use tokio::net::TcpListener;
    use tokio_tungstenite::{accept_async, MaybeTlsStream};

    fn scripted_info(server_id: &str) -> ServerInfo {
        use crate::messages::{ServerCapabilities, ServerStatus};
        ServerInfo {
            server_id: server_id.to_string(),
            name: "scripted".to_string(),
            ip: "0.0.0.0".to_string(),
            port: 0,
            status: ServerStatus::Online,
            capabilities: ServerCapabilities {
                hostname: "scripted".to_string(),
                os: "linux".to_string(),
                cpu_cores: 4,
                memory_gb: 8.0,
                disk_space_gb: 100.0,
                software_encoders: vec!["libx264".to_string()],
                hardware_encoders: BTreeMap::new(),
                estimated_performance: 400.0,
                current_load: 0.0,
                max_resolution: "1080p".to_string(),
                supported_formats: vec!["mkv".to_string()],
                max_file_size_gb: 50.0,
            },
            max_jobs: 2,
            current_jobs: 0,
            uptime: 1.0,
            last_seen: 0.0,
        }
    }

    /// Scripted server: answers the handshake and every ping, forever.
    fn spawn_scripted_server(listener: TcpListener, server_id: &'static str) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let server_id = server_id.to_string();
                tokio::spawn(async move {
                    let Ok(mut ws) = accept_async(MaybeTlsStream::Plain(stream)).await else {
                        return;
                    };
                    while let Some(Ok(frame)) = ws.next().await {
                        let Ok(Some(message)) = Message::from_frame(&frame) else {
                            continue;
                        };
                        match message.body {
                            MessageBody::Hello { .. } => {
                                let reply = Message::new(MessageBody::ServerInfo(scripted_info(
                                    &server_id,
                                )));
                                if ws.send(reply.to_frame().unwrap()).await.is_err() {
                                    return;
                                }
                            }
                            MessageBody::Ping { timestamp } => {
                                let reply = Message::reply_to(
                                    MessageBody::Pong { timestamp },
                                    &message.message_id,
                                );
                                if ws.send(reply.to_frame().unwrap()).await.is_err() {
                                    return;
                                }
                            }
                            _ => {}
                        }
                    }
                });
            }
        })
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

    #[tokio::test]
    async fn test_add_server_persists_and_publishes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
        let server = spawn_scripted_server(listener, "srv-add");

        let temp_dir = tempfile::TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        let client = fast_client();
        let discovery =
            ServerDiscovery::new(client.clone(), Config::default(), config_path.clone());

        let snapshots: Arc<StdMutex<Vec<usize>>> = Arc::new(StdMutex::new(Vec::new()));
        let observed = snapshots.clone();
        discovery
            .register_update_callback(Arc::new(move |servers| {
                if let Ok(mut seen) = observed.lock() {
                    seen.push(servers.len());
                }
            }))
            .await;

        let info = discovery
            .add_server(&address)
            .await
            .expect("server should connect");
        assert_eq!(info.server_id, "srv-add");

        // The auto-connect list was persisted.
        let saved = Config::load_from_file(&config_path).expect("config should exist");
        assert_eq!(saved.distributed.auto_connect, vec![address.clone()]);

        // The snapshot observer saw one connected server.
        assert_eq!(snapshots.lock().unwrap().last().copied(), Some(1));

        // Adding the same address again does not duplicate the entry.
        discovery.add_server(&address).await;
        let saved = Config::load_from_file(&config_path).unwrap();
        assert_eq!(saved.distributed.auto_connect.len(), 1);

        discovery.stop().await;
        server.abort();
    }

    #[tokio::test]
    async fn test_remove_server_updates_list_and_snapshot() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
        let server = spawn_scripted_server(listener, "srv-rm");

        let temp_dir = tempfile::TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        let client = fast_client();
        let discovery =
            ServerDiscovery::new(client.clone(), Config::default(), config_path.clone());

        discovery.add_server(&address).await.expect("should connect");
        discovery.remove_server("srv-rm").await;

        let saved = Config::load_from_file(&config_path).unwrap();
        assert!(saved.distributed.auto_connect.is_empty());
        assert!(discovery.known_servers().await.is_empty());
        assert!(client.connected_servers().await.is_empty());

        discovery.stop().await;
        server.abort();
    }

    #[tokio::test]
    async fn test_start_connects_auto_connect_list_and_pass_pings() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
        let server = spawn_scripted_server(listener, "srv-auto");

        let temp_dir = tempfile::TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        let mut config = Config::default();
        config.distributed.auto_connect.push(address.clone());

        let client = fast_client();
        let discovery = ServerDiscovery::new(client.clone(), config, config_path);

        let snapshots: Arc<StdMutex<Vec<usize>>> = Arc::new(StdMutex::new(Vec::new()));
        let observed = snapshots.clone();
        discovery
            .register_update_callback(Arc::new(move |servers| {
                if let Ok(mut seen) = observed.lock() {
                    seen.push(servers.len());
                }
            }))
            .await;

        discovery.start().await;
        assert!(client.is_connected(&address).await);

        // A manual pass pings the live server and republishes.
        discovery.poll_now().await;
        assert_eq!(snapshots.lock().unwrap().last().copied(), Some(1));
        assert!(client.is_connected(&address).await);

        discovery.stop().await;
        server.abort();
    }

    #[tokio::test]
    async fn test_unreachable_auto_connect_is_not_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_address = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
        drop(listener);

        let temp_dir = tempfile::TempDir::new().unwrap();
        let mut config = Config::default();
        config.distributed.auto_connect.push(dead_address.clone());

        let client = fast_client();
        let discovery = ServerDiscovery::new(
            client.clone(),
            config,
            temp_dir.path().join("config.toml"),
        );

        discovery.start().await;
        assert!(!client.is_connected(&dead_address).await);

        discovery.stop().await;
    }
}
