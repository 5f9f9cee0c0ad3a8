//! Configuration module for framepipe
//!
//! Handles loading configuration from TOML files and environment variable overrides.

pub mod config;
pub mod media;

pub use config::*;
pub use media::{CacheStrategy, QualityPreset, VideoCodec};
