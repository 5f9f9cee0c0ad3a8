//! Core configuration structures and loading logic

use crate::media::{CacheStrategy, QualityPreset, VideoCodec};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Error type for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Values parsed but are inconsistent
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config file: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Scheduler and registry sizing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Worker pool size (0 = derive from the host)
    #[serde(default)]
    pub worker_pool_size: u32,
    /// Maximum number of tasks waiting for a worker
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    /// Maximum number of tasks tracked by the registry, terminal ones included
    #[serde(default = "default_max_registry_size")]
    pub max_registry_size: usize,
    /// Terminal tasks kept before the oldest are trimmed
    #[serde(default = "default_max_retained_tasks")]
    pub max_retained_tasks: usize,
    /// Terminal tasks left after a trim
    #[serde(default = "default_retain_after_trim")]
    pub retain_after_trim: usize,
    /// Scratch directory for concat lists and similar per-task files
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    /// Buffered events per subscriber before slow receivers start lagging
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_max_queue_size() -> usize {
    100
}

fn default_max_registry_size() -> usize {
    2048
}

fn default_max_retained_tasks() -> usize {
    1000
}

fn default_retain_after_trim() -> usize {
    500
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("/tmp/framepipe")
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 0,
            max_queue_size: default_max_queue_size(),
            max_registry_size: default_max_registry_size(),
            max_retained_tasks: default_max_retained_tasks(),
            retain_after_trim: default_retain_after_trim(),
            temp_dir: default_temp_dir(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// CPU-related configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CpuConfig {
    /// Number of logical cores (auto-detected if None)
    pub logical_cores: Option<u32>,
    /// Target CPU utilization (0.5-1.0, default 0.85)
    #[serde(default = "default_target_cpu_utilization")]
    pub target_cpu_utilization: f32,
}

fn default_target_cpu_utilization() -> f32 {
    0.85
}

impl Default for CpuConfig {
    fn default() -> Self {
        Self {
            logical_cores: None,
            target_cpu_utilization: default_target_cpu_utilization(),
        }
    }
}

/// External tool locations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolsConfig {
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: PathBuf,
    #[serde(default = "default_ffprobe_path")]
    pub ffprobe_path: PathBuf,
    /// Upper bound for ffprobe and vendor probe commands
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// Upper bound for the synthetic encode used to verify an encoder
    #[serde(default = "default_encoder_test_timeout_secs")]
    pub encoder_test_timeout_secs: u64,
}

fn default_ffmpeg_path() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe_path() -> PathBuf {
    PathBuf::from("ffprobe")
}

fn default_probe_timeout_secs() -> u64 {
    5
}

fn default_encoder_test_timeout_secs() -> u64 {
    10
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            ffprobe_path: default_ffprobe_path(),
            probe_timeout_secs: default_probe_timeout_secs(),
            encoder_test_timeout_secs: default_encoder_test_timeout_secs(),
        }
    }
}

impl ToolsConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn encoder_test_timeout(&self) -> Duration {
        Duration::from_secs(self.encoder_test_timeout_secs)
    }
}

/// Encoder settings attached to a task
///
/// `crf`, `preset` and `bitrate_kbps` override what `quality` would pick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncodingConfig {
    #[serde(default)]
    pub codec: VideoCodec,
    #[serde(default)]
    pub quality: QualityPreset,
    #[serde(default)]
    pub crf: Option<u8>,
    #[serde(default)]
    pub preset: Option<String>,
    #[serde(default)]
    pub bitrate_kbps: Option<u32>,
    #[serde(default = "default_keyframe_interval")]
    pub keyframe_interval: u32,
    #[serde(default = "default_pixel_format")]
    pub pixel_format: String,
    /// Encoder thread hint (0 = let the engine decide)
    #[serde(default)]
    pub threads: u32,
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate: String,
}

fn default_keyframe_interval() -> u32 {
    250
}

fn default_pixel_format() -> String {
    "yuv420p".to_string()
}

fn default_audio_bitrate() -> String {
    "192k".to_string()
}

impl Default for EncodingConfig {
    fn default() -> Self {
        Self {
            codec: VideoCodec::default(),
            quality: QualityPreset::default(),
            crf: None,
            preset: None,
            bitrate_kbps: None,
            keyframe_interval: default_keyframe_interval(),
            pixel_format: default_pixel_format(),
            threads: 0,
            audio_bitrate: default_audio_bitrate(),
        }
    }
}

impl EncodingConfig {
    /// CRF after applying the explicit override
    pub fn effective_crf(&self) -> u8 {
        self.crf.unwrap_or_else(|| self.quality.crf(self.codec))
    }

    /// Speed preset after applying the explicit override
    pub fn effective_preset(&self) -> &str {
        self.preset
            .as_deref()
            .unwrap_or_else(|| self.quality.speed_preset())
    }
}

/// Hardware acceleration settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HardwareConfig {
    /// Never select a hardware encoder binding
    #[serde(default)]
    pub disallow_hardware_encoding: bool,
    /// Run vendor probes when the engine is constructed
    #[serde(default = "default_detect_on_start")]
    pub detect_on_start: bool,
    /// Interval between GPU utilization samples
    #[serde(default = "default_utilization_interval_ms")]
    pub utilization_interval_ms: u64,
}

fn default_detect_on_start() -> bool {
    true
}

fn default_utilization_interval_ms() -> u64 {
    2000
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            disallow_hardware_encoding: false,
            detect_on_start: default_detect_on_start(),
            utilization_interval_ms: default_utilization_interval_ms(),
        }
    }
}

/// Per-operation subprocess timeouts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeoutConfig {
    #[serde(default = "default_transcode_secs")]
    pub transcode_secs: u64,
    #[serde(default = "default_long_op_secs")]
    pub resize_secs: u64,
    #[serde(default = "default_long_op_secs")]
    pub filter_secs: u64,
    #[serde(default = "default_long_op_secs")]
    pub extract_frames_secs: u64,
    #[serde(default = "default_concat_secs")]
    pub concat_secs: u64,
    #[serde(default = "default_thumbnail_secs")]
    pub thumbnail_secs: u64,
    /// Multiplier applied to the probed source duration
    #[serde(default = "default_duration_factor")]
    pub duration_factor: f64,
}

fn default_transcode_secs() -> u64 {
    3600
}

fn default_long_op_secs() -> u64 {
    1800
}

fn default_concat_secs() -> u64 {
    600
}

fn default_thumbnail_secs() -> u64 {
    60
}

fn default_duration_factor() -> f64 {
    3.0
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            transcode_secs: default_transcode_secs(),
            resize_secs: default_long_op_secs(),
            filter_secs: default_long_op_secs(),
            extract_frames_secs: default_long_op_secs(),
            concat_secs: default_concat_secs(),
            thumbnail_secs: default_thumbnail_secs(),
            duration_factor: default_duration_factor(),
        }
    }
}

/// Hybrid cache configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    #[serde(default)]
    pub strategy: CacheStrategy,
    #[serde(default = "default_max_memory_bytes")]
    pub max_memory_bytes: u64,
    #[serde(default = "default_max_disk_bytes")]
    pub max_disk_bytes: u64,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_cache_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_max_memory_bytes() -> u64 {
    1024 * 1024 * 1024
}

fn default_max_disk_bytes() -> u64 {
    10 * 1024 * 1024 * 1024
}

fn default_ttl_secs() -> u64 {
    3600
}

fn default_cache_directory() -> PathBuf {
    PathBuf::from("/tmp/framepipe/cache")
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            strategy: CacheStrategy::default(),
            max_memory_bytes: default_max_memory_bytes(),
            max_disk_bytes: default_max_disk_bytes(),
            ttl_secs: default_ttl_secs(),
            directory: default_cache_directory(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Snapshot HTTP endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricsServerConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    #[serde(default = "default_metrics_bind")]
    pub bind: String,
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_bind() -> String {
    "127.0.0.1:7878".to_string()
}

fn default_sample_interval_ms() -> u64 {
    500
}

impl Default for MetricsServerConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            bind: default_metrics_bind(),
            sample_interval_ms: default_sample_interval_ms(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub cpu: CpuConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub encoding: EncodingConfig,
    #[serde(default)]
    pub hardware: HardwareConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub metrics_server: MetricsServerConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Overrides the following values if environment variables are set:
    /// - FRAMEPIPE_WORKER_POOL_SIZE -> engine.worker_pool_size
    /// - FRAMEPIPE_MAX_QUEUE_SIZE -> engine.max_queue_size
    /// - CPU_LOGICAL_CORES -> cpu.logical_cores
    /// - CPU_TARGET_UTILIZATION -> cpu.target_cpu_utilization
    /// - FRAMEPIPE_FFMPEG_PATH -> tools.ffmpeg_path
    /// - FRAMEPIPE_FFPROBE_PATH -> tools.ffprobe_path
    /// - FRAMEPIPE_DISALLOW_HARDWARE_ENCODING -> hardware.disallow_hardware_encoding
    /// - FRAMEPIPE_CACHE_STRATEGY -> cache.strategy
    /// - FRAMEPIPE_CACHE_MAX_MEMORY_BYTES -> cache.max_memory_bytes
    /// - FRAMEPIPE_CACHE_DIR -> cache.directory
    /// - FRAMEPIPE_METRICS_BIND -> metrics_server.bind
    ///
    /// Values that fail to parse are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Some(size) = parsed_var::<u32>("FRAMEPIPE_WORKER_POOL_SIZE") {
            self.engine.worker_pool_size = size;
        }

        if let Some(size) = parsed_var::<usize>("FRAMEPIPE_MAX_QUEUE_SIZE") {
            self.engine.max_queue_size = size;
        }

        if let Some(cores) = parsed_var::<u32>("CPU_LOGICAL_CORES") {
            self.cpu.logical_cores = Some(cores);
        }

        if let Some(util) = parsed_var::<f32>("CPU_TARGET_UTILIZATION") {
            self.cpu.target_cpu_utilization = util;
        }

        if let Ok(path) = env::var("FRAMEPIPE_FFMPEG_PATH") {
            if !path.is_empty() {
                self.tools.ffmpeg_path = PathBuf::from(path);
            }
        }

        if let Ok(path) = env::var("FRAMEPIPE_FFPROBE_PATH") {
            if !path.is_empty() {
                self.tools.ffprobe_path = PathBuf::from(path);
            }
        }

        if let Ok(val) = env::var("FRAMEPIPE_DISALLOW_HARDWARE_ENCODING") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.hardware.disallow_hardware_encoding = true,
                "false" | "0" | "no" => self.hardware.disallow_hardware_encoding = false,
                _ => {}
            }
        }

        if let Some(strategy) = parsed_var::<CacheStrategy>("FRAMEPIPE_CACHE_STRATEGY") {
            self.cache.strategy = strategy;
        }

        if let Some(bytes) = parsed_var::<u64>("FRAMEPIPE_CACHE_MAX_MEMORY_BYTES") {
            self.cache.max_memory_bytes = bytes;
        }

        if let Ok(dir) = env::var("FRAMEPIPE_CACHE_DIR") {
            if !dir.is_empty() {
                self.cache.directory = PathBuf::from(dir);
            }
        }

        if let Ok(bind) = env::var("FRAMEPIPE_METRICS_BIND") {
            if !bind.is_empty() {
                self.metrics_server.bind = bind;
            }
        }
    }

    /// Reject combinations the engine cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.engine.max_queue_size == 0 {
            return Err(ConfigError::Invalid(
                "engine.max_queue_size must be at least 1".to_string(),
            ));
        }
        if self.engine.max_registry_size == 0 {
            return Err(ConfigError::Invalid(
                "engine.max_registry_size must be at least 1".to_string(),
            ));
        }
        if self.engine.retain_after_trim > self.engine.max_retained_tasks {
            return Err(ConfigError::Invalid(format!(
                "engine.retain_after_trim ({}) exceeds engine.max_retained_tasks ({})",
                self.engine.retain_after_trim, self.engine.max_retained_tasks
            )));
        }
        if !(self.timeouts.duration_factor > 0.0) {
            return Err(ConfigError::Invalid(
                "timeouts.duration_factor must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Load configuration from file, apply environment overrides and validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = if path.as_ref().exists() {
            Self::load_from_file(path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|val| val.trim().parse::<T>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ENV_VARS: &[&str] = &[
        "FRAMEPIPE_WORKER_POOL_SIZE",
        "FRAMEPIPE_MAX_QUEUE_SIZE",
        "CPU_LOGICAL_CORES",
        "CPU_TARGET_UTILIZATION",
        "FRAMEPIPE_FFMPEG_PATH",
        "FRAMEPIPE_FFPROBE_PATH",
        "FRAMEPIPE_DISALLOW_HARDWARE_ENCODING",
        "FRAMEPIPE_CACHE_STRATEGY",
        "FRAMEPIPE_CACHE_MAX_MEMORY_BYTES",
        "FRAMEPIPE_CACHE_DIR",
        "FRAMEPIPE_METRICS_BIND",
    ];

    /// Helper to clear all config-related env vars
    fn clear_env_vars() {
        for var in ENV_VARS {
            env::remove_var(var);
        }
    }

    fn strategy_name(idx: usize) -> (&'static str, CacheStrategy) {
        [
            ("none", CacheStrategy::None),
            ("memory", CacheStrategy::Memory),
            ("disk", CacheStrategy::Disk),
            ("hybrid", CacheStrategy::Hybrid),
        ][idx]
    }

    // Every section parses and round-trips the values it was given.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_all_sections(
            pool_size in 0u32..64,
            queue_size in 1usize..10_000,
            logical_cores in proptest::option::of(1u32..256),
            target_util in 0.0f32..2.0,
            disallow_hw in proptest::bool::ANY,
            strategy_idx in 0usize..4,
            max_memory in 1u64..(1u64 << 40),
            ttl in 1u64..100_000,
            transcode_secs in 1u64..100_000,
        ) {
            let (strategy_str, strategy) = strategy_name(strategy_idx);
            let toml_str = format!(
                r#"
[engine]
worker_pool_size = {}
max_queue_size = {}

[cpu]
{}
target_cpu_utilization = {}

[hardware]
disallow_hardware_encoding = {}

[cache]
strategy = "{}"
max_memory_bytes = {}
ttl_secs = {}

[timeouts]
transcode_secs = {}
"#,
                pool_size,
                queue_size,
                logical_cores.map(|c| format!("logical_cores = {}", c)).unwrap_or_default(),
                target_util,
                disallow_hw,
                strategy_str,
                max_memory,
                ttl,
                transcode_secs,
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(config.engine.worker_pool_size, pool_size);
            prop_assert_eq!(config.engine.max_queue_size, queue_size);
            prop_assert_eq!(config.cpu.logical_cores, logical_cores);
            prop_assert!((config.cpu.target_cpu_utilization - target_util).abs() < 0.0001);
            prop_assert_eq!(config.hardware.disallow_hardware_encoding, disallow_hw);
            prop_assert_eq!(config.cache.strategy, strategy);
            prop_assert_eq!(config.cache.max_memory_bytes, max_memory);
            prop_assert_eq!(config.cache.ttl_secs, ttl);
            prop_assert_eq!(config.timeouts.transcode_secs, transcode_secs);
            // Untouched sections keep their defaults
            prop_assert_eq!(config.tools.clone(), ToolsConfig::default());
        }

        #[test]
        fn prop_env_overrides_worker_pool_size(
            initial in 0u32..32,
            override_size in 0u32..64,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[engine]\nworker_pool_size = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("FRAMEPIPE_WORKER_POOL_SIZE", override_size.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.engine.worker_pool_size, override_size);
        }

        #[test]
        fn prop_env_overrides_cpu_logical_cores(
            initial_cores in proptest::option::of(1u32..128),
            override_cores in 1u32..256,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!(
                "[cpu]\n{}\n",
                initial_cores.map(|c| format!("logical_cores = {}", c)).unwrap_or_default()
            );
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("CPU_LOGICAL_CORES", override_cores.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.cpu.logical_cores, Some(override_cores));
        }

        #[test]
        fn prop_env_overrides_disallow_hardware_encoding(
            initial_disallow in proptest::bool::ANY,
            override_disallow in proptest::bool::ANY,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!(
                "[hardware]\ndisallow_hardware_encoding = {}\n",
                initial_disallow
            );
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("FRAMEPIPE_DISALLOW_HARDWARE_ENCODING", override_disallow.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.hardware.disallow_hardware_encoding, override_disallow);
        }

        #[test]
        fn prop_env_overrides_cache_strategy(
            strategy_idx in 0usize..4,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let (name, expected) = strategy_name(strategy_idx);
            let mut config = Config::default();

            env::set_var("FRAMEPIPE_CACHE_STRATEGY", name.to_uppercase());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.cache.strategy, expected);
        }
    }

    #[test]
    fn test_env_overrides_paths_and_bind() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("FRAMEPIPE_FFMPEG_PATH", "/opt/ffmpeg/bin/ffmpeg");
        env::set_var("FRAMEPIPE_CACHE_DIR", "/var/cache/framepipe");
        env::set_var("FRAMEPIPE_METRICS_BIND", "0.0.0.0:9000");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.tools.ffmpeg_path, PathBuf::from("/opt/ffmpeg/bin/ffmpeg"));
        assert_eq!(config.cache.directory, PathBuf::from("/var/cache/framepipe"));
        assert_eq!(config.metrics_server.bind, "0.0.0.0:9000");
    }

    #[test]
    fn test_invalid_env_values_are_ignored() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("FRAMEPIPE_WORKER_POOL_SIZE", "many");
        env::set_var("FRAMEPIPE_CACHE_STRATEGY", "redis");
        env::set_var("FRAMEPIPE_DISALLOW_HARDWARE_ENCODING", "maybe");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config, Config::default());
    }

    // Test that missing sections use defaults
    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config.engine.worker_pool_size, 0);
        assert_eq!(config.engine.max_queue_size, 100);
        assert_eq!(config.engine.max_retained_tasks, 1000);
        assert_eq!(config.engine.retain_after_trim, 500);
        assert_eq!(config.cpu.logical_cores, None);
        assert!((config.cpu.target_cpu_utilization - 0.85).abs() < 0.0001);
        assert_eq!(config.tools.ffmpeg_path, PathBuf::from("ffmpeg"));
        assert_eq!(config.encoding.keyframe_interval, 250);
        assert_eq!(config.encoding.pixel_format, "yuv420p");
        assert_eq!(config.encoding.effective_crf(), 23);
        assert_eq!(config.encoding.effective_preset(), "medium");
        assert!(!config.hardware.disallow_hardware_encoding);
        assert_eq!(config.timeouts.transcode_secs, 3600);
        assert_eq!(config.timeouts.concat_secs, 600);
        assert_eq!(config.cache.strategy, CacheStrategy::Hybrid);
        assert_eq!(config.cache.max_memory_bytes, 1024 * 1024 * 1024);
        assert_eq!(config.cache.ttl(), Duration::from_secs(3600));
        assert_eq!(config.metrics_server.bind, "127.0.0.1:7878");
        assert!(config.validate().is_ok());
    }

    // Test partial config with some sections missing
    #[test]
    fn test_partial_config_uses_defaults_for_missing() {
        let toml_str = r#"
[encoding]
codec = "hevc"
quality = "high"
preset = "veryslow"
"#;
        let config = Config::parse_toml(toml_str).expect("Partial TOML should parse");

        assert_eq!(config.encoding.codec, VideoCodec::Hevc);
        assert_eq!(config.encoding.effective_crf(), 20);
        assert_eq!(config.encoding.effective_preset(), "veryslow");
        assert_eq!(config.encoding.audio_bitrate, "192k"); // default
        assert_eq!(config.engine, EngineConfig::default());
        assert_eq!(config.cache, CacheConfig::default());
    }

    #[test]
    fn test_validate_rejects_inconsistent_retention() {
        let mut config = Config::default();
        config.engine.max_retained_tasks = 10;
        config.engine.retain_after_trim = 20;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.engine.max_queue_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = Config::default();
        config.timeouts.duration_factor = 0.0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_from_file_and_missing_file() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[engine]\nworker_pool_size = 3\n[cache]\nstrategy = \"memory\"").unwrap();

        let config = Config::load(file.path()).expect("file should load");
        assert_eq!(config.engine.worker_pool_size, 3);
        assert_eq!(config.cache.strategy, CacheStrategy::Memory);

        assert!(matches!(
            Config::load("/nonexistent/framepipe.toml"),
            Err(ConfigError::Io(_))
        ));
        let fallback = Config::load_or_default("/nonexistent/framepipe.toml").unwrap();
        assert_eq!(fallback, Config::default());
    }

    #[test]
    fn test_parse_error_is_reported() {
        let err = Config::parse_toml("[engine\nworker_pool_size = ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(err.to_string().starts_with("Failed to parse config"));
    }
}
