//! Startup checks for framepipe
//!
//! Preflight checks run by [`crate::Engine::new`]:
//! - the configured ffmpeg binary resolves and reports a usable version
//! - ffprobe resolves (optional; duration probing is skipped without it)
//!
//! Also hosts the software-only guard applied to every built argument list.

use crate::config::Config;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, warn};

/// Substrings that mark an argument as selecting a hardware path
const FORBIDDEN_HW_FLAGS: &[&str] = &[
    "nvenc",
    "qsv",
    "vaapi",
    "cuda",
    "amf",
    "videotoolbox",
];

/// Oldest ffmpeg major version with `-progress pipe:` and the encoders we bind
pub const MIN_FFMPEG_MAJOR: u32 = 4;

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{tool} not available: {reason}")]
    ToolUnavailable { tool: String, reason: String },

    #[error("FFmpeg version requirement not met: {0}")]
    UnsupportedVersion(String),

    #[error("Hardware encoding flag '{flag}' found in '{arg}', but hardware encoding is disabled")]
    HardwareEncodingDetected { flag: &'static str, arg: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tool locations confirmed at startup
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTools {
    pub ffmpeg: PathBuf,
    pub ffmpeg_major: u32,
    /// `None` when ffprobe could not be found
    pub ffprobe: Option<PathBuf>,
}

/// Check if a string contains any forbidden hardware encoder flags
///
/// Returns the first detected forbidden flag, or None if clean.
pub fn detect_hardware_flag(s: &str) -> Option<&'static str> {
    let lower = s.to_lowercase();
    FORBIDDEN_HW_FLAGS
        .iter()
        .find(|&&flag| lower.contains(flag))
        .copied()
}

/// Reject any argument that selects a hardware path when hardware encoding is disallowed
pub fn check_args_for_hardware_flags<S: AsRef<str>>(
    args: &[S],
    disallow_hardware_encoding: bool,
) -> Result<(), StartupError> {
    if !disallow_hardware_encoding {
        return Ok(());
    }

    for arg in args {
        let arg = arg.as_ref();
        if let Some(flag) = detect_hardware_flag(arg) {
            return Err(StartupError::HardwareEncodingDetected {
                flag,
                arg: arg.to_string(),
            });
        }
    }

    Ok(())
}

/// Resolve a tool given as a bare name (looked up on `PATH`) or a path
pub fn resolve_tool(tool: &Path) -> Result<PathBuf, StartupError> {
    which::which(tool.as_os_str()).map_err(|e| StartupError::ToolUnavailable {
        tool: display_name(tool.as_os_str()),
        reason: e.to_string(),
    })
}

/// Parse FFmpeg version string and extract major version number
///
/// Handles various FFmpeg version formats:
/// - Standard: "ffmpeg version 6.1 ..."
/// - N-prefixed: "ffmpeg version n6.1-... ..."
pub fn parse_ffmpeg_version(version_output: &str) -> Option<u32> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let version_part = version_line
        .to_lowercase()
        .split("ffmpeg version")
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    let version_str = version_part.trim_start_matches('n');

    let major_str = version_str.split(['.', '-']).next()?;

    major_str.parse().ok()
}

/// Run `<ffmpeg> -version` and return the major version
pub async fn check_ffmpeg_version(ffmpeg: &Path) -> Result<u32, StartupError> {
    let output = Command::new(ffmpeg)
        .arg("-version")
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| StartupError::ToolUnavailable {
            tool: display_name(ffmpeg.as_os_str()),
            reason: format!("failed to run -version: {}", e),
        })?;

    if !output.status.success() {
        return Err(StartupError::UnsupportedVersion(format!(
            "{} -version exited with {}",
            ffmpeg.display(),
            output.status
        )));
    }

    let version_output = String::from_utf8_lossy(&output.stdout);
    let major = parse_ffmpeg_version(&version_output).ok_or_else(|| {
        StartupError::UnsupportedVersion(format!(
            "Could not parse FFmpeg version from output: {}",
            version_output.lines().next().unwrap_or("(empty)")
        ))
    })?;

    if major < MIN_FFMPEG_MAJOR {
        return Err(StartupError::UnsupportedVersion(format!(
            "FFmpeg {}.x or newer required, got: {}",
            MIN_FFMPEG_MAJOR, major
        )));
    }

    Ok(major)
}

/// Run all startup checks in order
///
/// 1. ffmpeg resolves
/// 2. ffmpeg version is supported
/// 3. ffprobe resolves (warning only)
pub async fn run_startup_checks(cfg: &Config) -> Result<ResolvedTools, StartupError> {
    let ffmpeg = resolve_tool(&cfg.tools.ffmpeg_path)?;
    let ffmpeg_major = check_ffmpeg_version(&ffmpeg).await?;

    let ffprobe = match resolve_tool(&cfg.tools.ffprobe_path) {
        Ok(path) => Some(path),
        Err(e) => {
            warn!(error = %e, "ffprobe unavailable, source durations will not be probed");
            None
        }
    };

    info!(
        ffmpeg = %ffmpeg.display(),
        version = ffmpeg_major,
        ffprobe = ?ffprobe,
        "Startup checks passed"
    );

    Ok(ResolvedTools {
        ffmpeg,
        ffmpeg_major,
        ffprobe,
    })
}

fn display_name(tool: &OsStr) -> String {
    tool.to_string_lossy().into_owned()
}
