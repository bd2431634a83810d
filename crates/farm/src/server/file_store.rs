//! Chunked file transfer store.
//!
//! Receives transferred inputs chunk by chunk (opened on
//! `file_download_start`, appended on `file_chunk`, closed once the
//! declared size is reached) and streams result files out the same way.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::protocol::{Message, MessageBody, ProtocolError};

/// Chunk size for outgoing transfers.
const CHUNK_SIZE: usize = 1024 * 1024;

struct ReceiveState {
    file: File,
    path: PathBuf,
    received: u64,
    declared: u64,
}

/// Manages per-job transferred files under one working directory.
pub struct FileStore {
    dir: PathBuf,
    receiving: Mutex<HashMap<String, ReceiveState>>,
    /// Result files streamed out, deletable on `file_cleanup`.
    delivered: Mutex<HashMap<String, PathBuf>>,
}

impl FileStore {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            receiving: Mutex::new(HashMap::new()),
            delivered: Mutex::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    /// Path a transferred input for `job_id` is written to.
    pub fn input_path(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{job_id}_input"))
    }

    /// Open the receive target for a job.
    pub async fn begin_receive(&self, job_id: &str, declared_size: u64) -> io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.input_path(job_id);
        let file = File::create(&path).await?;

        info!(job = job_id, declared_size, path = %path.display(), "receiving file");
        self.receiving.lock().await.insert(
            job_id.to_string(),
            ReceiveState {
                file,
                path,
                received: 0,
                declared: declared_size,
            },
        );
        Ok(self.input_path(job_id))
    }

    /// Append one chunk. `Ok(true)` once the declared size is reached and
    /// the file has been closed.
    pub async fn receive_chunk(&self, job_id: &str, chunk: &[u8]) -> io::Result<bool> {
        let mut receiving = self.receiving.lock().await;
        let Some(state) = receiving.get_mut(job_id) else {
            warn!(job = job_id, "chunk for unknown transfer dropped");
            return Ok(false);
        };

        state.file.write_all(chunk).await?;
        state.received += chunk.len() as u64;

        if state.received >= state.declared {
            if let Some(state) = receiving.remove(job_id) {
                let mut file = state.file;
                file.flush().await?;
                debug!(job = job_id, path = %state.path.display(), "transfer complete");
            }
            return Ok(true);
        }
        Ok(false)
    }

    /// Stream a result file to the peer: `file_download_start` followed by
    /// fixed-size `file_chunk` frames.
    pub async fn send_file(
        &self,
        job_id: &str,
        path: &PathBuf,
        outbound: &mpsc::UnboundedSender<WsMessage>,
    ) -> io::Result<()> {
        let metadata = tokio::fs::metadata(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{job_id}_result"));

        info!(job = job_id, size = metadata.len(), "sending result file");
        send_message(
            outbound,
            Message::new(MessageBody::FileDownloadStart {
                job_id: job_id.to_string(),
                file_name,
                file_size: metadata.len(),
            }),
        )?;

        let mut file = File::open(path).await?;
        let mut buffer = vec![0u8; CHUNK_SIZE];
        loop {
            let read = file.read(&mut buffer).await?;
            if read == 0 {
                break;
            }
            send_message(
                outbound,
                Message::new(MessageBody::FileChunk {
                    job_id: job_id.to_string(),
                    chunk: buffer[..read].to_vec(),
                }),
            )?;
        }

        self.delivered
            .lock()
            .await
            .insert(job_id.to_string(), path.clone());
        Ok(())
    }

    /// Drop everything stored for a job: a half-received input, the
    /// transferred input file, and a delivered result the peer has
    /// confirmed.
    pub async fn cleanup(&self, job_id: &str) {
        if let Some(state) = self.receiving.lock().await.remove(job_id) {
            let _ = tokio::fs::remove_file(&state.path).await;
        }
        let _ = tokio::fs::remove_file(self.input_path(job_id)).await;
        if let Some(path) = self.delivered.lock().await.remove(job_id) {
            let _ = tokio::fs::remove_file(&path).await;
        }
        debug!(job = job_id, "files cleaned up");
    }
}

fn send_message(
    outbound: &mpsc::UnboundedSender<WsMessage>,
    message: Message,
) -> io::Result<()> {
    let frame = message
        .to_frame()
        .map_err(|e: ProtocolError| io::Error::other(e.to_string()))?;
    outbound
        .send(frame)
        .map_err(|_| io::Error::other("outbound channel closed"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_receive_until_declared_size() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::new(temp_dir.path().to_path_buf());

        store.begin_receive("j1", 6).await.expect("should open");
        assert!(!store.receive_chunk("j1", b"abc").await.unwrap());
        assert!(store.receive_chunk("j1", b"def").await.unwrap());

        let written = std::fs::read(store.input_path("j1")).unwrap();
        assert_eq!(written, b"abcdef");
    }

    #[tokio::test]
    async fn test_chunk_for_unknown_job_is_dropped() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::new(temp_dir.path().to_path_buf());
        assert!(!store.receive_chunk("nobody", b"data").await.unwrap());
    }

    #[tokio::test]
    async fn test_send_file_frames() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::new(temp_dir.path().to_path_buf());

        let result_path = temp_dir.path().join("result.mkv");
        let payload: Vec<u8> = (0..200u8).collect();
        std::fs::write(&result_path, &payload).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        store
            .send_file("j2", &result_path, &tx)
            .await
            .expect("should send");

        let start = Message::from_frame(&rx.try_recv().unwrap()).unwrap().unwrap();
        match start.body {
            MessageBody::FileDownloadStart {
                job_id,
                file_name,
                file_size,
            } => {
                assert_eq!(job_id, "j2");
                assert_eq!(file_name, "result.mkv");
                assert_eq!(file_size, 200);
            }
            other => panic!("unexpected first frame: {}", other.kind()),
        }

        let mut received = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            let message = Message::from_frame(&frame).unwrap().unwrap();
            match message.body {
                MessageBody::FileChunk { job_id, chunk } => {
                    assert_eq!(job_id, "j2");
                    received.extend(chunk);
                }
                other => panic!("unexpected frame: {}", other.kind()),
            }
        }
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_cleanup_removes_input_and_delivered() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStore::new(temp_dir.path().to_path_buf());

        store.begin_receive("j3", 3).await.unwrap();
        store.receive_chunk("j3", b"xyz").await.unwrap();

        let result_path = temp_dir.path().join("done.mkv");
        std::fs::write(&result_path, b"artifact").unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        store.send_file("j3", &result_path, &tx).await.unwrap();

        store.cleanup("j3").await;
        assert!(!store.input_path("j3").exists());
        assert!(!result_path.exists());
    }
}
