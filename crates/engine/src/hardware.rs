//! Hardware capability detection
//!
//! Probes the host for a GPU vendor, verifies that the vendor's encoder
//! bindings actually work through a short synthetic encode, and samples
//! GPU utilization. Every query is best-effort: a missing tool is a valid
//! "no hardware" answer, never an error.

use crate::config::{ToolsConfig, VideoCodec};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info};

/// GPU vendor families the engine knows encoder bindings for
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum GpuVendor {
    #[default]
    None,
    Nvidia,
    Amd,
    Intel,
    Apple,
}

impl GpuVendor {
    pub fn as_str(&self) -> &'static str {
        match self {
            GpuVendor::None => "none",
            GpuVendor::Nvidia => "nvidia",
            GpuVendor::Amd => "amd",
            GpuVendor::Intel => "intel",
            GpuVendor::Apple => "apple",
        }
    }

    /// Hardware encoder binding for `codec` on this vendor
    pub fn hardware_encoder(&self, codec: VideoCodec) -> Option<&'static str> {
        match (self, codec) {
            (GpuVendor::None, _) => None,
            (GpuVendor::Nvidia, VideoCodec::H264) => Some("h264_nvenc"),
            (GpuVendor::Nvidia, VideoCodec::Hevc) => Some("hevc_nvenc"),
            (GpuVendor::Amd, VideoCodec::H264) => Some("h264_amf"),
            (GpuVendor::Amd, VideoCodec::Hevc) => Some("hevc_amf"),
            (GpuVendor::Intel, VideoCodec::H264) => Some("h264_qsv"),
            (GpuVendor::Intel, VideoCodec::Hevc) => Some("hevc_qsv"),
            (GpuVendor::Apple, VideoCodec::H264) => Some("h264_videotoolbox"),
            (GpuVendor::Apple, VideoCodec::Hevc) => Some("hevc_videotoolbox"),
        }
    }

    /// Value for ffmpeg's `-hwaccel` input option
    pub fn hwaccel(&self) -> Option<&'static str> {
        match self {
            GpuVendor::None => None,
            GpuVendor::Nvidia => Some("cuda"),
            GpuVendor::Amd => Some("auto"),
            GpuVendor::Intel => Some("qsv"),
            GpuVendor::Apple => Some("videotoolbox"),
        }
    }
}

/// Snapshot of what the host can accelerate with
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct HardwareCapabilities {
    pub vendor: GpuVendor,
    /// Device name reported by the vendor probe
    pub device: Option<String>,
    /// Hardware encoders that passed the synthetic encode test
    pub encoders: Vec<String>,
    /// GPU utilization in percent at detection time
    pub utilization: f32,
}

impl HardwareCapabilities {
    /// The "no hardware" answer
    pub fn none() -> Self {
        Self::default()
    }

    pub fn has_hardware(&self) -> bool {
        self.vendor != GpuVendor::None
    }

    /// Whether `encoder` was verified to work on this host
    pub fn supports(&self, encoder: &str) -> bool {
        self.encoders.iter().any(|e| e == encoder)
    }
}

/// A single vendor probe command
///
/// The probe matches when the command exits 0 and, if `expect_stdout` is
/// set, its stdout contains that marker.
#[derive(Debug, Clone)]
pub struct VendorProbe {
    pub vendor: GpuVendor,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub expect_stdout: Option<String>,
}

impl VendorProbe {
    pub fn new(vendor: GpuVendor, program: impl Into<PathBuf>, args: &[&str]) -> Self {
        Self {
            vendor,
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            expect_stdout: None,
        }
    }

    pub fn expecting(mut self, marker: &str) -> Self {
        self.expect_stdout = Some(marker.to_string());
        self
    }
}

/// Vendor probes in detection order: NVIDIA, AMD, Intel, Apple Silicon
pub fn default_probes() -> Vec<VendorProbe> {
    let mut probes = vec![
        VendorProbe::new(
            GpuVendor::Nvidia,
            "nvidia-smi",
            &["--query-gpu=name", "--format=csv,noheader"],
        ),
        VendorProbe::new(GpuVendor::Amd, "rocm-smi", &["--showproductname"]),
        VendorProbe::new(GpuVendor::Intel, "intel_gpu_top", &["-L"]),
    ];
    if cfg!(target_os = "macos") {
        probes.push(
            VendorProbe::new(GpuVendor::Apple, "sysctl", &["-n", "machdep.cpu.brand_string"])
                .expecting("Apple"),
        );
    }
    probes
}

/// Stateless hardware capability detector
#[derive(Debug, Clone)]
pub struct HardwareDetector {
    ffmpeg_path: PathBuf,
    probes: Vec<VendorProbe>,
    probe_timeout: Duration,
    encoder_test_timeout: Duration,
}

impl HardwareDetector {
    pub fn new(tools: &ToolsConfig) -> Self {
        Self {
            ffmpeg_path: tools.ffmpeg_path.clone(),
            probes: default_probes(),
            probe_timeout: tools.probe_timeout(),
            encoder_test_timeout: tools.encoder_test_timeout(),
        }
    }

    /// Replace the vendor probe list
    pub fn with_probes(mut self, probes: Vec<VendorProbe>) -> Self {
        self.probes = probes;
        self
    }

    /// Detect the GPU vendor and its working encoders
    ///
    /// The first probe that succeeds wins. When none succeed the "none"
    /// vendor is returned.
    pub async fn detect(&self) -> HardwareCapabilities {
        let mut found = None;
        for probe in &self.probes {
            if let Some(device) = self.run_probe(probe).await {
                found = Some((probe.vendor, device));
                break;
            }
        }

        let Some((vendor, device)) = found else {
            info!("No GPU vendor detected, software encoding only");
            return HardwareCapabilities::none();
        };

        let mut encoders = Vec::new();
        for codec in [VideoCodec::H264, VideoCodec::Hevc] {
            if let Some(encoder) = vendor.hardware_encoder(codec) {
                if self.test_encoder_support(encoder).await {
                    encoders.push(encoder.to_string());
                }
            }
        }

        let utilization = self.get_utilization().await;
        info!(
            vendor = vendor.as_str(),
            device = device.as_deref().unwrap_or("unknown"),
            encoders = ?encoders,
            "Hardware detection complete"
        );

        HardwareCapabilities {
            vendor,
            device,
            encoders,
            utilization,
        }
    }

    /// Run a one-second synthetic encode through `encoder`
    ///
    /// Returns true only if ffmpeg exits 0 within the test timeout.
    pub async fn test_encoder_support(&self, encoder: &str) -> bool {
        let args = encoder_test_args(encoder);
        match run_captured(&self.ffmpeg_path, &args, self.encoder_test_timeout).await {
            Some(output) if output.status.success() => {
                debug!(encoder, "Encoder passed functional test");
                true
            }
            Some(output) => {
                debug!(
                    encoder,
                    code = ?output.status.code(),
                    "Encoder failed functional test"
                );
                false
            }
            None => false,
        }
    }

    /// Current GPU utilization in percent, 0.0 when unavailable
    ///
    /// Sampled through nvidia-smi or rocm-smi, whichever answers first in
    /// probe order. Intel and Apple expose no cheap query and always read 0.0.
    pub async fn get_utilization(&self) -> f32 {
        for probe in &self.probes {
            let (args, parse): (&[&str], fn(&str) -> Option<f32>) = match probe.vendor {
                GpuVendor::Nvidia => (
                    &["--query-gpu=utilization.gpu", "--format=csv,noheader,nounits"],
                    parse_utilization,
                ),
                GpuVendor::Amd => (&["--showuse"], parse_rocm_utilization),
                _ => continue,
            };
            let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
            let sample = run_captured(&probe.program, &args, self.probe_timeout)
                .await
                .filter(|output| output.status.success())
                .and_then(|output| parse(&String::from_utf8_lossy(&output.stdout)));
            if let Some(value) = sample {
                return value;
            }
        }
        0.0
    }

    /// Returns the device line on success
    async fn run_probe(&self, probe: &VendorProbe) -> Option<Option<String>> {
        let output = run_captured(&probe.program, &probe.args, self.probe_timeout).await?;
        if !output.status.success() {
            return None;
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        if let Some(marker) = &probe.expect_stdout {
            if !stdout.contains(marker.as_str()) {
                return None;
            }
        }
        let device = stdout
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(String::from);
        Some(device)
    }
}

/// Arguments for the synthetic encode used by [`HardwareDetector::test_encoder_support`]
pub fn encoder_test_args(encoder: &str) -> Vec<String> {
    let mut args: Vec<String> = [
        "-hide_banner",
        "-nostdin",
        "-loglevel",
        "error",
        "-f",
        "lavfi",
        "-i",
        "testsrc=duration=1:size=320x240:rate=30",
        "-c:v",
        encoder,
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    if encoder.ends_with("_videotoolbox") {
        args.push("-allow_sw".to_string());
        args.push("1".to_string());
    }
    args.extend(["-f", "null", "-"].iter().map(|s| s.to_string()));
    args
}

/// Parse the first line of nvidia-smi's utilization query
pub fn parse_utilization(stdout: &str) -> Option<f32> {
    let value = stdout.lines().next()?.trim().parse::<f32>().ok()?;
    if value.is_finite() {
        Some(value.clamp(0.0, 100.0))
    } else {
        None
    }
}

/// Parse the first `GPU use (%)` line of `rocm-smi --showuse`
pub fn parse_rocm_utilization(stdout: &str) -> Option<f32> {
    let line = stdout.lines().find(|line| line.contains("GPU use (%)"))?;
    let value = line.rsplit(':').next()?.trim().parse::<f32>().ok()?;
    if value.is_finite() {
        Some(value.clamp(0.0, 100.0))
    } else {
        None
    }
}

/// Run a short-lived tool, capturing its output
///
/// `None` when the tool cannot be spawned or overruns `timeout`.
async fn run_captured(program: &Path, args: &[String], timeout: Duration) -> Option<Output> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => Some(output),
        Ok(Err(e)) => {
            debug!(program = %program.display(), error = %e, "Probe tool unavailable");
            None
        }
        Err(_) => {
            debug!(program = %program.display(), "Probe tool timed out");
            None
        }
    }
}
