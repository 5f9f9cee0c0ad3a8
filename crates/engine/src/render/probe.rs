//! Source duration probing with ffprobe

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Raw ffprobe JSON structures for parsing
mod ffprobe_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct FfprobeOutput {
        pub format: Option<Format>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Format {
        pub duration: Option<String>,
    }
}

/// Parse the container duration out of `ffprobe -show_format` JSON
pub fn parse_duration(json_str: &str) -> Option<f64> {
    let output: ffprobe_json::FfprobeOutput = serde_json::from_str(json_str).ok()?;
    let duration: f64 = output.format?.duration?.trim().parse().ok()?;
    (duration.is_finite() && duration > 0.0).then_some(duration)
}

/// Probe the duration of `input` in seconds
///
/// Any failure (missing tool, timeout, unparsable output) yields `None`.
pub async fn probe_duration(ffprobe: &Path, input: &Path, timeout: Duration) -> Option<f64> {
    let child = Command::new(ffprobe)
        .args(["-v", "quiet", "-print_format", "json", "-show_format"])
        .arg(input)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .ok()?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) if output.status.success() => output,
        Ok(_) => return None,
        Err(_) => {
            debug!(input = %input.display(), "ffprobe timed out");
            return None;
        }
    };

    let duration = parse_duration(&String::from_utf8_lossy(&output.stdout));
    debug!(input = %input.display(), ?duration, "Probed source duration");
    duration
}
