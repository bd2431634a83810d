//! Wire data types shared by the distributed client and the encode server.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Declared status of an encode server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerStatus {
    Online,
    Busy,
    Maintenance,
    Offline,
}

impl std::fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerStatus::Online => write!(f, "online"),
            ServerStatus::Busy => write!(f, "busy"),
            ServerStatus::Maintenance => write!(f, "maintenance"),
            ServerStatus::Offline => write!(f, "offline"),
        }
    }
}

/// Status of a job as reported over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteJobStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RemoteJobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RemoteJobStatus::Completed | RemoteJobStatus::Failed | RemoteJobStatus::Cancelled
        )
    }
}

/// Encoder implementation class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncoderKind {
    Software,
    HardwareNvidia,
    HardwareIntel,
    HardwareAmd,
    HardwareApple,
}

/// Capability set declared by an encode server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerCapabilities {
    pub hostname: String,
    pub os: String,
    pub cpu_cores: u32,
    pub memory_gb: f64,
    pub disk_space_gb: f64,
    /// Software encoder names (e.g. "libx264").
    pub software_encoders: Vec<String>,
    /// Hardware encoders grouped by vendor ("nvidia", "intel", ...).
    pub hardware_encoders: BTreeMap<String, Vec<String>>,
    /// Relative performance score.
    pub estimated_performance: f64,
    /// Current CPU load in [0, 1].
    pub current_load: f64,
    pub max_resolution: String,
    pub supported_formats: Vec<String>,
    pub max_file_size_gb: f64,
}

impl ServerCapabilities {
    /// Every encoder this server offers, software and hardware.
    pub fn all_encoders(&self) -> Vec<&str> {
        self.software_encoders
            .iter()
            .map(String::as_str)
            .chain(
                self.hardware_encoders
                    .values()
                    .flat_map(|encoders| encoders.iter().map(String::as_str)),
            )
            .collect()
    }

    pub fn supports_encoder(&self, encoder: &str) -> bool {
        self.all_encoders().iter().any(|e| *e == encoder)
    }

    pub fn has_hardware_encoder(&self, encoder: &str) -> bool {
        self.hardware_encoders
            .values()
            .any(|encoders| encoders.iter().any(|e| e == encoder))
    }
}

/// Directory entry for one known encode server.
///
/// Created on the first successful handshake and refreshed on every
/// `server_info` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub server_id: String,
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub status: ServerStatus,
    pub capabilities: ServerCapabilities,
    pub max_jobs: u32,
    pub current_jobs: u32,
    /// Seconds since the server started.
    pub uptime: f64,
    /// Unix timestamp of the last message from this server.
    pub last_seen: f64,
}

impl ServerInfo {
    /// Connection key: "ip:port".
    pub fn address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Job configuration as submitted over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub job_id: String,
    pub input_file: String,
    pub output_file: String,
    pub encoder: String,
    pub encoder_type: EncoderKind,
    pub preset: Option<String>,
    /// "crf", "bitrate" or "quality".
    pub quality_mode: String,
    pub quality_value: String,
    pub filters: Vec<String>,
    /// Opaque arguments inserted between input and output.
    pub ffmpeg_args: Vec<String>,
    pub required_capabilities: Vec<String>,
    /// 1-10, higher is more urgent.
    pub priority: u8,
    pub estimated_duration: Option<f64>,
    pub file_size: u64,
    pub resolution: String,
    pub codec: String,
    pub container: String,
}

impl JobSpec {
    /// Encoders a server must offer to run this job.
    pub fn required_encoders(&self) -> Vec<String> {
        let mut encoders = vec![self.encoder.clone()];
        encoders.extend(self.required_capabilities.iter().cloned());
        encoders
    }
}

/// Progress report for one `(job, output)` pair.
///
/// `progress` is a fraction in [0, 1] everywhere on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_id: Option<String>,
    pub progress: f64,
    pub current_frame: Option<u64>,
    pub total_frames: Option<u64>,
    pub fps: Option<f64>,
    pub bitrate: Option<String>,
    pub speed: Option<String>,
    /// Estimated seconds remaining.
    pub eta: Option<u64>,
    pub server_id: String,
}

/// Terminal result for one `(job, output)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_id: Option<String>,
    pub status: RemoteJobStatus,
    pub output_file: String,
    pub file_size: u64,
    /// Wall-clock seconds the job ran.
    pub duration: f64,
    pub average_fps: f64,
    pub error_message: Option<String>,
    pub server_id: String,
    pub completed_at: f64,
}

/// Reply payload for a capability request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityReport {
    pub supported: Vec<String>,
    pub missing: Vec<String>,
    pub capabilities: ServerCapabilities,
}

/// Match between a job and a candidate server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityMatch {
    pub server_id: String,
    /// Fraction of required encoders the server offers, in [0, 1].
    pub compatibility_score: f64,
    pub missing_capabilities: Vec<String>,
    pub performance_estimate: f64,
    pub recommended: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn test_capabilities() -> ServerCapabilities {
        let mut hardware = BTreeMap::new();
        hardware.insert(
            "nvidia".to_string(),
            vec!["h264_nvenc".to_string(), "hevc_nvenc".to_string()],
        );
        ServerCapabilities {
            hostname: "rig-01".to_string(),
            os: "linux".to_string(),
            cpu_cores: 16,
            memory_gb: 64.0,
            disk_space_gb: 500.0,
            software_encoders: vec!["libx264".to_string(), "libx265".to_string()],
            hardware_encoders: hardware,
            estimated_performance: 1600.0,
            current_load: 0.1,
            max_resolution: "4K".to_string(),
            supported_formats: vec!["mp4".to_string(), "mkv".to_string()],
            max_file_size_gb: 100.0,
        }
    }

    #[test]
    fn test_all_encoders_merges_software_and_hardware() {
        let caps = test_capabilities();
        let encoders = caps.all_encoders();
        assert!(encoders.contains(&"libx264"));
        assert!(encoders.contains(&"h264_nvenc"));
        assert_eq!(encoders.len(), 4);
    }

    #[test]
    fn test_supports_encoder() {
        let caps = test_capabilities();
        assert!(caps.supports_encoder("libx265"));
        assert!(caps.supports_encoder("hevc_nvenc"));
        assert!(!caps.supports_encoder("libaom-av1"));
        assert!(caps.has_hardware_encoder("h264_nvenc"));
        assert!(!caps.has_hardware_encoder("libx264"));
    }

    #[test]
    fn test_server_info_address() {
        let info = ServerInfo {
            server_id: "srv-1".to_string(),
            name: "rig".to_string(),
            ip: "10.0.0.9".to_string(),
            port: 8765,
            status: ServerStatus::Online,
            capabilities: test_capabilities(),
            max_jobs: 2,
            current_jobs: 0,
            uptime: 10.0,
            last_seen: 0.0,
        };
        assert_eq!(info.address(), "10.0.0.9:8765");
    }

    #[test]
    fn test_required_encoders_includes_capabilities() {
        let spec = JobSpec {
            job_id: "j1".to_string(),
            input_file: "/in.mkv".to_string(),
            output_file: "/out.mkv".to_string(),
            encoder: "hevc_nvenc".to_string(),
            encoder_type: EncoderKind::HardwareNvidia,
            preset: Some("p5".to_string()),
            quality_mode: "crf".to_string(),
            quality_value: "23".to_string(),
            filters: vec![],
            ffmpeg_args: vec![],
            required_capabilities: vec!["cuda".to_string()],
            priority: 5,
            estimated_duration: None,
            file_size: 0,
            resolution: "1920x1080".to_string(),
            codec: "h264".to_string(),
            container: "mkv".to_string(),
        };
        assert_eq!(spec.required_encoders(), vec!["hevc_nvenc", "cuda"]);
    }

    #[test]
    fn test_remote_status_terminal_set() {
        assert!(RemoteJobStatus::Completed.is_terminal());
        assert!(RemoteJobStatus::Failed.is_terminal());
        assert!(RemoteJobStatus::Cancelled.is_terminal());
        assert!(!RemoteJobStatus::Running.is_terminal());
        assert!(!RemoteJobStatus::Queued.is_terminal());
        assert!(!RemoteJobStatus::Pending.is_terminal());
    }

    #[test]
    fn test_status_snake_case_on_the_wire() {
        assert_eq!(
            serde_json::to_string(&ServerStatus::Online).unwrap(),
            "\"online\""
        );
        assert_eq!(
            serde_json::to_string(&RemoteJobStatus::Cancelled).unwrap(),
            "\"cancelled\""
        );
        assert_eq!(
            serde_json::to_string(&EncoderKind::HardwareNvidia).unwrap(),
            "\"hardware_nvidia\""
        );
    }
}
