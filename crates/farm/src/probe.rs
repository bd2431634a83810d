//! Source duration probe collaborator.
//!
//! The pool normalizes `out_time_ms` progress into a fraction using the
//! source duration, probed once per job through this seam.

use std::io::Read;
use std::path::Path;
use std::time::Duration;

use crate::process::{self, ProcessControl};

/// Resolves the duration of a source file in seconds.
///
/// `None` means the duration could not be determined; progress fractions
/// for that job stay at zero until the end-of-progress marker.
pub trait DurationProbe: Send + Sync {
    fn duration_secs(&self, src_path: &Path) -> Option<f64>;
}

impl<F> DurationProbe for F
where
    F: Fn(&Path) -> Option<f64> + Send + Sync,
{
    fn duration_secs(&self, src_path: &Path) -> Option<f64> {
        self(src_path)
    }
}

/// Probe backed by `ffprobe -show_entries format=duration`.
pub struct FfprobeDurationProbe {
    ffprobe_path: String,
    timeout: Duration,
}

impl FfprobeDurationProbe {
    pub fn new(ffprobe_path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            ffprobe_path: ffprobe_path.into(),
            timeout,
        }
    }
}

impl Default for FfprobeDurationProbe {
    fn default() -> Self {
        Self::new("ffprobe", Duration::from_secs(30))
    }
}

impl DurationProbe for FfprobeDurationProbe {
    fn duration_secs(&self, src_path: &Path) -> Option<f64> {
        let argv = vec![
            self.ffprobe_path.clone(),
            "-v".to_string(),
            "quiet".to_string(),
            "-show_entries".to_string(),
            "format=duration".to_string(),
            "-of".to_string(),
            "csv=p=0".to_string(),
            src_path.to_string_lossy().into_owned(),
        ];

        let (mut process, mut stdout, _stderr) = match process::spawn(&argv) {
            Ok(spawned) => spawned,
            Err(e) => {
                tracing::warn!(path = %src_path.display(), error = %e, "ffprobe unavailable");
                return None;
            }
        };

        let status = match process.wait_timeout(self.timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                tracing::warn!(path = %src_path.display(), "ffprobe timed out");
                let _ = process.kill();
                let _ = process.wait();
                return None;
            }
            Err(e) => {
                tracing::warn!(path = %src_path.display(), error = %e, "ffprobe wait failed");
                return None;
            }
        };

        if !status.success() {
            return None;
        }

        let mut raw = String::new();
        stdout.read_to_string(&mut raw).ok()?;
        parse_duration(&raw)
    }
}

fn parse_duration(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed == "N/A" {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|d| *d >= 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_valid() {
        assert_eq!(parse_duration("7200.25\n"), Some(7200.25));
        assert_eq!(parse_duration("  12.5  "), Some(12.5));
    }

    #[test]
    fn test_parse_duration_not_available() {
        assert_eq!(parse_duration("N/A"), None);
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("garbage"), None);
    }

    #[test]
    fn test_parse_duration_rejects_negative() {
        assert_eq!(parse_duration("-3.0"), None);
    }

    #[test]
    fn test_missing_ffprobe_returns_none() {
        let probe = FfprobeDurationProbe::new(
            "definitely-not-a-real-ffprobe-4711",
            Duration::from_secs(1),
        );
        assert_eq!(probe.duration_secs(Path::new("/media/clip.mkv")), None);
    }

    #[test]
    fn test_closure_probe() {
        let probe = |_: &Path| Some(42.0);
        assert_eq!(probe.duration_secs(Path::new("/media/clip.mkv")), Some(42.0));
    }
}
