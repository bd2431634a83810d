//! Local capability detection.
//!
//! Builds the [`ServerCapabilities`] an encode server announces: the
//! encoder list parsed from `ffmpeg -encoders`, partitioned into software
//! and hardware by vendor suffix, plus system facts from the host.

use std::collections::BTreeMap;
use std::io;
use std::process::Command;
use sysinfo::{Disks, System};
use tracing::warn;

use crate::messages::ServerCapabilities;

/// Detect the capability set for this host.
///
/// Falls back to a minimal software encoder set when ffmpeg cannot be
/// queried, so a server can still announce itself.
pub fn detect_capabilities(ffmpeg_path: &str) -> ServerCapabilities {
    match list_encoders(ffmpeg_path) {
        Ok(encoders) if !encoders.is_empty() => build_capabilities(encoders),
        Ok(_) => {
            warn!(ffmpeg = ffmpeg_path, "ffmpeg reported no encoders, using fallback set");
            fallback_capabilities()
        }
        Err(e) => {
            warn!(ffmpeg = ffmpeg_path, error = %e, "encoder detection failed, using fallback set");
            fallback_capabilities()
        }
    }
}

/// Parse `ffmpeg -hide_banner -encoders` output into encoder names.
fn list_encoders(ffmpeg_path: &str) -> io::Result<Vec<String>> {
    let output = Command::new(ffmpeg_path)
        .arg("-hide_banner")
        .arg("-encoders")
        .output()?;

    if !output.status.success() {
        return Ok(Vec::new());
    }

    let text = String::from_utf8_lossy(&output.stdout);
    let mut encoders = Vec::new();
    for line in text.lines() {
        // Rows look like " V....D libx264    H.264 ..."; the name is the
        // second whitespace-separated column.
        if let Some(name) = line.split_whitespace().nth(1) {
            if !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            {
                encoders.push(name.to_string());
            }
        }
    }
    Ok(encoders)
}

/// Vendor bucket for a hardware encoder name, if any.
fn hardware_vendor(encoder: &str) -> Option<&'static str> {
    if encoder.contains("nvenc") {
        Some("nvidia")
    } else if encoder.contains("qsv") {
        Some("intel")
    } else if encoder.contains("amf") {
        Some("amd")
    } else if encoder.contains("videotoolbox") {
        Some("apple")
    } else {
        None
    }
}

fn build_capabilities(encoders: Vec<String>) -> ServerCapabilities {
    let mut software = Vec::new();
    let mut hardware: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for encoder in encoders {
        match hardware_vendor(&encoder) {
            Some(vendor) => hardware.entry(vendor.to_string()).or_default().push(encoder),
            None => software.push(encoder),
        }
    }

    let system = System::new_all();
    let cpu_cores = num_cpus::get() as u32;
    let memory_gb = system.total_memory() as f64 / 1024f64.powi(3);
    let disk_space_gb = Disks::new_with_refreshed_list()
        .list()
        .iter()
        .map(|disk| disk.available_space())
        .max()
        .unwrap_or(0) as f64
        / 1024f64.powi(3);

    ServerCapabilities {
        hostname: System::host_name().unwrap_or_else(|| "localhost".to_string()),
        os: System::name().unwrap_or_else(|| "unknown".to_string()),
        cpu_cores,
        memory_gb,
        disk_space_gb,
        software_encoders: software,
        hardware_encoders: hardware,
        estimated_performance: cpu_cores as f64 * 100.0,
        current_load: 0.0,
        max_resolution: "4K".to_string(),
        supported_formats: supported_formats(),
        max_file_size_gb: 100.0,
    }
}

/// Minimal capability set used when ffmpeg is unavailable.
fn fallback_capabilities() -> ServerCapabilities {
    ServerCapabilities {
        hostname: System::host_name().unwrap_or_else(|| "localhost".to_string()),
        os: System::name().unwrap_or_else(|| "unknown".to_string()),
        cpu_cores: num_cpus::get() as u32,
        memory_gb: 4.0,
        disk_space_gb: 100.0,
        software_encoders: vec![
            "libx264".to_string(),
            "libx265".to_string(),
            "aac".to_string(),
        ],
        hardware_encoders: BTreeMap::new(),
        estimated_performance: 500.0,
        current_load: 0.0,
        max_resolution: "1080p".to_string(),
        supported_formats: supported_formats(),
        max_file_size_gb: 50.0,
    }
}

fn supported_formats() -> Vec<String> {
    ["mp4", "mkv", "mov", "webm", "avi"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}
