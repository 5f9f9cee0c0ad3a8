//! Media enums shared between the configuration file and the engine

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Output video codec family
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    #[default]
    H264,
    #[serde(alias = "h265")]
    Hevc,
}

impl VideoCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "h264",
            VideoCodec::Hevc => "hevc",
        }
    }

    /// Software encoder used when no hardware binding is usable
    pub fn software_encoder(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "libx264",
            VideoCodec::Hevc => "libx265",
        }
    }
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse quality level translated into encoder-specific settings
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum QualityPreset {
    High,
    #[default]
    Medium,
    Low,
}

impl QualityPreset {
    /// Constant-rate-factor for the software encoder of `codec`
    ///
    /// libx265 uses a shifted scale, so the same preset maps to a higher number.
    pub fn crf(&self, codec: VideoCodec) -> u8 {
        match (codec, self) {
            (VideoCodec::H264, QualityPreset::High) => 18,
            (VideoCodec::H264, QualityPreset::Medium) => 23,
            (VideoCodec::H264, QualityPreset::Low) => 28,
            (VideoCodec::Hevc, QualityPreset::High) => 20,
            (VideoCodec::Hevc, QualityPreset::Medium) => 28,
            (VideoCodec::Hevc, QualityPreset::Low) => 35,
        }
    }

    /// x264/x265 speed preset name
    pub fn speed_preset(&self) -> &'static str {
        match self {
            QualityPreset::High => "slow",
            QualityPreset::Medium => "medium",
            QualityPreset::Low => "fast",
        }
    }
}

/// Which tiers of the hybrid cache are active
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheStrategy {
    None,
    Memory,
    Disk,
    #[default]
    Hybrid,
}

impl CacheStrategy {
    pub fn uses_memory(&self) -> bool {
        matches!(self, CacheStrategy::Memory | CacheStrategy::Hybrid)
    }

    pub fn uses_disk(&self) -> bool {
        matches!(self, CacheStrategy::Disk | CacheStrategy::Hybrid)
    }
}

impl FromStr for CacheStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" => Ok(CacheStrategy::None),
            "memory" => Ok(CacheStrategy::Memory),
            "disk" => Ok(CacheStrategy::Disk),
            "hybrid" => Ok(CacheStrategy::Hybrid),
            other => Err(format!("unknown cache strategy '{}'", other)),
        }
    }
}
