//! Wire protocol: message envelope and framing.
//!
//! Every message is one JSON object in one WebSocket text frame:
//! `{type, data, message_id, timestamp, reply_to?}`. Request/response pairs
//! correlate via `reply_to == message_id` of the initiating message; push
//! notifications carry no `reply_to`.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use uuid::Uuid;

use crate::messages::{CapabilityReport, JobProgress, JobResult, JobSpec, ServerInfo};

/// Error type for protocol operations
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Message could not be serialized or parsed
    #[error("Invalid message format: {0}")]
    Format(#[from] serde_json::Error),

    /// Peer replied with an error message
    #[error("Remote error: {0}")]
    Remote(String),
}

/// Kind-specific payload of a wire message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum MessageBody {
    Hello {
        client_name: String,
    },
    ServerInfo(ServerInfo),
    JobSubmit(JobSpec),
    JobProgress(JobProgress),
    JobCompleted(JobResult),
    JobFailed(JobResult),
    JobCancel {
        job_id: String,
    },
    JobPause {
        job_id: String,
    },
    JobResume {
        job_id: String,
    },
    CapabilityRequest {
        encoders_needed: Vec<String>,
    },
    CapabilityResponse(CapabilityReport),
    Ping {
        timestamp: f64,
    },
    Pong {
        timestamp: f64,
    },
    FileDownloadStart {
        job_id: String,
        file_name: String,
        file_size: u64,
    },
    FileChunk {
        job_id: String,
        #[serde(with = "base64_bytes")]
        chunk: Vec<u8>,
    },
    FileCleanup {
        job_id: String,
    },
    Error {
        error: String,
    },
    ValidationError {
        error: String,
    },
}

impl MessageBody {
    /// Wire name of this message kind, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::Hello { .. } => "hello",
            MessageBody::ServerInfo(_) => "server_info",
            MessageBody::JobSubmit(_) => "job_submit",
            MessageBody::JobProgress(_) => "job_progress",
            MessageBody::JobCompleted(_) => "job_completed",
            MessageBody::JobFailed(_) => "job_failed",
            MessageBody::JobCancel { .. } => "job_cancel",
            MessageBody::JobPause { .. } => "job_pause",
            MessageBody::JobResume { .. } => "job_resume",
            MessageBody::CapabilityRequest { .. } => "capability_request",
            MessageBody::CapabilityResponse(_) => "capability_response",
            MessageBody::Ping { .. } => "ping",
            MessageBody::Pong { .. } => "pong",
            MessageBody::FileDownloadStart { .. } => "file_download_start",
            MessageBody::FileChunk { .. } => "file_chunk",
            MessageBody::FileCleanup { .. } => "file_cleanup",
            MessageBody::Error { .. } => "error",
            MessageBody::ValidationError { .. } => "validation_error",
        }
    }
}

/// One framed protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    #[serde(flatten)]
    pub body: MessageBody,
    pub message_id: String,
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

impl Message {
    /// New push message or request (no `reply_to`).
    pub fn new(body: MessageBody) -> Self {
        Self {
            body,
            message_id: Uuid::new_v4().to_string(),
            timestamp: unix_now(),
            reply_to: None,
        }
    }

    /// New reply correlated to the initiating message id.
    pub fn reply_to(body: MessageBody, request_id: &str) -> Self {
        let mut message = Self::new(body);
        message.reply_to = Some(request_id.to_string());
        message
    }

    /// Serialize into one WebSocket text frame.
    pub fn to_frame(&self) -> Result<WsMessage, ProtocolError> {
        Ok(WsMessage::Text(serde_json::to_string(self)?))
    }

    /// Parse a WebSocket frame. Control frames (ping/pong/close) yield
    /// `Ok(None)`; malformed payloads are errors.
    pub fn from_frame(frame: &WsMessage) -> Result<Option<Self>, ProtocolError> {
        match frame {
            WsMessage::Text(text) => Ok(Some(serde_json::from_str(text)?)),
            WsMessage::Binary(bytes) => Ok(Some(serde_json::from_slice(bytes)?)),
            _ => Ok(None),
        }
    }
}

/// Current unix time in fractional seconds.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_hello_frame_shape() {
        let message = Message::new(MessageBody::Hello {
            client_name: "encode-farm".to_string(),
        });
        let frame = message.to_frame().expect("should encode");
        let WsMessage::Text(text) = frame else {
            panic!("expected text frame");
        };

        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["type"], "hello");
        assert_eq!(value["data"]["client_name"], "encode-farm");
        assert!(value["message_id"].is_string());
        assert!(value["timestamp"].is_number());
        // No reply_to on push/request messages.
        assert!(value.get("reply_to").is_none());
    }

    #[test]
    fn test_reply_correlation() {
        let request = Message::new(MessageBody::Ping { timestamp: 1.0 });
        let reply = Message::reply_to(MessageBody::Pong { timestamp: 2.0 }, &request.message_id);

        assert_eq!(reply.reply_to.as_deref(), Some(request.message_id.as_str()));
        assert_ne!(reply.message_id, request.message_id);

        let value: Value =
            serde_json::from_str(reply.to_frame().unwrap().to_text().unwrap()).unwrap();
        assert_eq!(value["type"], "pong");
        assert_eq!(value["reply_to"], request.message_id);
    }

    #[test]
    fn test_round_trip_job_progress() {
        let progress = JobProgress {
            job_id: "j1".to_string(),
            output_id: Some("o1".to_string()),
            progress: 0.5,
            current_frame: Some(120),
            total_frames: Some(240),
            fps: Some(30.0),
            bitrate: Some("800.0kbits/s".to_string()),
            speed: Some("1.0x".to_string()),
            eta: Some(4),
            server_id: "srv-1".to_string(),
        };
        let message = Message::new(MessageBody::JobProgress(progress.clone()));
        let frame = message.to_frame().unwrap();
        let decoded = Message::from_frame(&frame)
            .unwrap()
            .expect("text frame should decode");

        match decoded.body {
            MessageBody::JobProgress(decoded_progress) => {
                assert_eq!(decoded_progress, progress);
            }
            other => panic!("unexpected body: {}", other.kind()),
        }
        assert_eq!(decoded.message_id, message.message_id);
    }

    #[test]
    fn test_file_chunk_bytes_are_base64() {
        let chunk = vec![0u8, 1, 2, 254, 255];
        let message = Message::new(MessageBody::FileChunk {
            job_id: "j1".to_string(),
            chunk: chunk.clone(),
        });
        let frame = message.to_frame().unwrap();

        let value: Value = serde_json::from_str(frame.to_text().unwrap()).unwrap();
        assert!(value["data"]["chunk"].is_string(), "chunk must be base64 text");

        let decoded = Message::from_frame(&frame).unwrap().unwrap();
        match decoded.body {
            MessageBody::FileChunk {
                chunk: decoded_chunk,
                ..
            } => assert_eq!(decoded_chunk, chunk),
            other => panic!("unexpected body: {}", other.kind()),
        }
    }

    #[test]
    fn test_malformed_frame_is_an_error() {
        let frame = WsMessage::Text("{\"type\": \"no_such_kind\", \"data\": {}}".to_string());
        assert!(Message::from_frame(&frame).is_err());

        let frame = WsMessage::Text("not json at all".to_string());
        assert!(Message::from_frame(&frame).is_err());
    }

    #[test]
    fn test_control_frames_are_skipped() {
        assert!(Message::from_frame(&WsMessage::Ping(vec![]))
            .unwrap()
            .is_none());
        assert!(Message::from_frame(&WsMessage::Pong(vec![]))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_kind_names_match_wire_names() {
        let cases = [
            (
                Message::new(MessageBody::JobCancel {
                    job_id: "j".to_string(),
                }),
                "job_cancel",
            ),
            (
                Message::new(MessageBody::ValidationError {
                    error: "bad".to_string(),
                }),
                "validation_error",
            ),
            (
                Message::new(MessageBody::FileDownloadStart {
                    job_id: "j".to_string(),
                    file_name: "out.mkv".to_string(),
                    file_size: 10,
                }),
                "file_download_start",
            ),
        ];

        for (message, expected) in cases {
            assert_eq!(message.body.kind(), expected);
            let value: Value =
                serde_json::from_str(message.to_frame().unwrap().to_text().unwrap()).unwrap();
            assert_eq!(value["type"], expected);
        }
    }
}
