//! Encoder selection and per-family quality flags

use crate::config::{EncodingConfig, VideoCodec};
use crate::hardware::{GpuVendor, HardwareCapabilities};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// The encoder a render will use, and how it was picked
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderChoice {
    pub encoder: String,
    pub vendor: GpuVendor,
    pub hardware: bool,
    /// Set when a hardware binding existed but could not be used
    pub fallback_reason: Option<String>,
}

impl EncoderChoice {
    pub fn software(codec: VideoCodec) -> Self {
        Self {
            encoder: codec.software_encoder().to_string(),
            vendor: GpuVendor::None,
            hardware: false,
            fallback_reason: None,
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.fallback_reason.is_some()
    }
}

/// Pick the vendor's hardware binding for `codec` when it passed its
/// functional test, otherwise the software encoder
///
/// A vendor whose binding failed its test falls back with a warning and a
/// recorded reason, so the outcome shows the task ran on the CPU.
pub fn select_encoder(
    caps: &HardwareCapabilities,
    codec: VideoCodec,
    disallow_hardware: bool,
) -> EncoderChoice {
    if disallow_hardware {
        return EncoderChoice::software(codec);
    }

    let Some(binding) = caps.vendor.hardware_encoder(codec) else {
        return EncoderChoice::software(codec);
    };

    if caps.supports(binding) {
        debug!(encoder = binding, vendor = caps.vendor.as_str(), "Selected hardware encoder");
        return EncoderChoice {
            encoder: binding.to_string(),
            vendor: caps.vendor,
            hardware: true,
            fallback_reason: None,
        };
    }

    let software = codec.software_encoder();
    warn!(
        failed = binding,
        fallback = software,
        vendor = caps.vendor.as_str(),
        "Hardware encoder unusable, falling back to software"
    );
    EncoderChoice {
        fallback_reason: Some(format!("{} failed its functional test", binding)),
        ..EncoderChoice::software(codec)
    }
}

/// Rate-control and speed flags for the chosen encoder
pub fn quality_args(choice: &EncoderChoice, encoding: &EncodingConfig) -> Vec<String> {
    let crf = encoding.effective_crf();

    if let Some(kbps) = encoding.bitrate_kbps {
        let mut args = vec!["-b:v".to_string(), format!("{}k", kbps)];
        if !choice.hardware {
            args.extend(["-preset".to_string(), encoding.effective_preset().to_string()]);
        }
        return args;
    }

    let flags: &[&str] = match (choice.hardware, choice.vendor) {
        (false, _) | (true, GpuVendor::None) => {
            return vec![
                "-crf".to_string(),
                crf.to_string(),
                "-preset".to_string(),
                encoding.effective_preset().to_string(),
            ];
        }
        (true, GpuVendor::Nvidia) => &["-rc:v", "constqp", "-qp", "{q}"],
        (true, GpuVendor::Amd) => &["-rc", "cqp", "-qp_i", "{q}", "-qp_p", "{q}"],
        (true, GpuVendor::Intel) => &["-global_quality", "{q}"],
        (true, GpuVendor::Apple) => {
            return vec![
                "-q:v".to_string(),
                videotoolbox_quality(crf).to_string(),
                "-allow_sw".to_string(),
                "1".to_string(),
            ];
        }
    };
    flags
        .iter()
        .map(|flag| flag.replace("{q}", &crf.to_string()))
        .collect()
}

/// Map a CRF (lower is better, 0-51) onto VideoToolbox's 1-100 scale (higher is better)
fn videotoolbox_quality(crf: u8) -> u8 {
    let crf = crf.min(51) as u32;
    (100 - crf * 99 / 51).clamp(1, 100) as u8
}
