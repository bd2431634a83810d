//! Capability matching between jobs and encode servers.
//!
//! Pure scoring logic: compatibility (required encoders offered),
//! performance (encoder class and declared server score) and load are
//! combined into a weighted total used to rank candidate servers.

use crate::messages::{CapabilityMatch, JobSpec, ServerInfo, ServerStatus};

const WEIGHT_COMPATIBILITY: f64 = 0.5;
const WEIGHT_PERFORMANCE: f64 = 0.3;
const WEIGHT_LOAD: f64 = 0.2;

/// A server's total score must clear this bar to be recommended.
const RECOMMEND_THRESHOLD: f64 = 0.7;

/// Relative throughput preference per encoder. Hardware encoders rank
/// above software ones.
fn encoder_preference(encoder: &str) -> f64 {
    match encoder {
        "h264_nvenc" | "hevc_nvenc" => 1.0,
        "h264_videotoolbox" | "hevc_videotoolbox" => 0.95,
        "h264_qsv" | "hevc_qsv" => 0.9,
        "h264_amf" | "hevc_amf" => 0.85,
        "libx264" => 0.7,
        "libx265" => 0.6,
        "libvpx" => 0.5,
        "libvpx-vp9" => 0.45,
        _ => 0.5,
    }
}

/// Full evaluation of one server for one job.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerScore {
    pub server_id: String,
    pub compatibility_score: f64,
    pub performance_score: f64,
    /// 1.0 = idle, 0.0 = saturated.
    pub load_score: f64,
    pub total_score: f64,
    pub missing_capabilities: Vec<String>,
    pub warnings: Vec<String>,
}

/// Scores candidate servers for a job.
#[derive(Debug, Clone, Copy, Default)]
pub struct CapabilityMatcher;

impl CapabilityMatcher {
    pub fn new() -> Self {
        Self
    }

    /// Rank online servers for this job, best first, at most
    /// `max_results` entries.
    pub fn find_best_servers(
        &self,
        job: &JobSpec,
        available_servers: &[ServerInfo],
        max_results: usize,
    ) -> Vec<CapabilityMatch> {
        let mut scores: Vec<ServerScore> = available_servers
            .iter()
            .filter(|server| server.status == ServerStatus::Online)
            .map(|server| self.evaluate(job, server))
            .collect();

        scores.sort_by(|a, b| {
            b.total_score
                .partial_cmp(&a.total_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        scores
            .into_iter()
            .take(max_results)
            .map(|score| CapabilityMatch {
                server_id: score.server_id,
                compatibility_score: score.compatibility_score,
                missing_capabilities: score.missing_capabilities,
                performance_estimate: score.performance_score,
                recommended: score.total_score > RECOMMEND_THRESHOLD,
            })
            .collect()
    }

    /// Evaluate one server for one job.
    pub fn evaluate(&self, job: &JobSpec, server: &ServerInfo) -> ServerScore {
        let (compatibility_score, missing) = compatibility(job, server);
        let performance_score = performance(job, server);
        let load_score = load(server);

        let total_score = compatibility_score * WEIGHT_COMPATIBILITY
            + performance_score * WEIGHT_PERFORMANCE
            + load_score * WEIGHT_LOAD;

        let warnings = warnings(job, server, compatibility_score);

        ServerScore {
            server_id: server.server_id.clone(),
            compatibility_score,
            performance_score,
            load_score,
            total_score,
            missing_capabilities: missing,
            warnings,
        }
    }
}

/// Ratio of required encoders the server offers, plus the missing ones.
fn compatibility(job: &JobSpec, server: &ServerInfo) -> (f64, Vec<String>) {
    let required = job.required_encoders();
    if required.is_empty() {
        return (1.0, Vec::new());
    }

    let mut missing = Vec::new();
    let mut supported = 0usize;
    for encoder in &required {
        if server.capabilities.supports_encoder(encoder) {
            supported += 1;
        } else {
            missing.push(encoder.clone());
        }
    }

    (supported as f64 / required.len() as f64, missing)
}

/// Performance estimate from the declared server score, the encoder class
/// and a hardware bonus.
fn performance(job: &JobSpec, server: &ServerInfo) -> f64 {
    let base_score = (server.capabilities.estimated_performance / 1000.0).min(1.0);
    let encoder_bonus = encoder_preference(&job.encoder);
    let hardware_bonus = if server.capabilities.has_hardware_encoder(&job.encoder) {
        1.3
    } else {
        1.0
    };

    (base_score * encoder_bonus * hardware_bonus).min(1.0)
}

/// Combined job-slot and CPU load, inverted so 1.0 means idle.
fn load(server: &ServerInfo) -> f64 {
    if server.max_jobs == 0 {
        return 0.0;
    }

    let job_load = server.current_jobs as f64 / server.max_jobs as f64;
    let cpu_load = server.capabilities.current_load;
    let combined = job_load * 0.7 + cpu_load * 0.3;

    (1.0 - combined).max(0.0)
}

fn warnings(job: &JobSpec, server: &ServerInfo, compatibility_score: f64) -> Vec<String> {
    let mut warnings = Vec::new();

    if compatibility_score < 1.0 {
        warnings.push(format!(
            "Encoder {} not supported on this server",
            job.encoder
        ));
    }
    if server.current_jobs >= server.max_jobs {
        warnings.push("Server is currently saturated".to_string());
    }
    if server.capabilities.current_load > 0.9 {
        warnings.push("High CPU load on this server".to_string());
    }
    if job.file_size as f64 > server.capabilities.max_file_size_gb * 1024f64.powi(3) {
        warnings.push("File too large for this server".to_string());
    }

    let job_pixels = parse_resolution(&job.resolution);
    let max_pixels = resolution_limit(&server.capabilities.max_resolution);
    if job_pixels > max_pixels {
        warnings.push(format!(
            "Resolution {} may exceed this server's limit",
            job.resolution
        ));
    }

    warnings
}

/// Parse "1920x1080" into a pixel count; unknown formats fall back to
/// 1080p.
fn parse_resolution(resolution: &str) -> u64 {
    if let Some((width, height)) = resolution.split_once('x') {
        if let (Ok(w), Ok(h)) = (width.trim().parse::<u64>(), height.trim().parse::<u64>()) {
            return w * h;
        }
    }
    1920 * 1080
}

fn resolution_limit(label: &str) -> u64 {
    match label {
        "1080p" => 1920 * 1080,
        "2K" => 2560 * 1440,
        "4K" => 3840 * 2160,
        "8K" => 7680 * 4320,
        _ => 1920 * 1080,
    }
}
