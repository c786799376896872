use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

use crate::feed::FeedConfig;
use crate::gesture::GestureConfig;
use crate::upload::RetryPolicy;
use crate::viewport::ViewportConfig;

const DEFAULT_ENV_PREFIX: &str = "ARTFEED";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub feed: FeedSection,
    #[serde(default)]
    pub viewport: ViewportSection,
    #[serde(default)]
    pub gesture: GestureSection,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub player: PlayerConfig,
    #[serde(default)]
    pub upload: UploadSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    /// Project URL; empty runs the built-in demo feed.
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub anon_key: String,
    #[serde(default = "default_feed_table")]
    pub feed_table: String,
    #[serde(default = "default_artist_table")]
    pub artist_table: String,
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// Web front-end used to show artist pages.
    #[serde(default)]
    pub site_url: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            anon_key: String::new(),
            feed_table: default_feed_table(),
            artist_table: default_artist_table(),
            bucket: default_bucket(),
            site_url: String::new(),
        }
    }
}

impl BackendConfig {
    pub fn is_configured(&self) -> bool {
        !self.url.trim().is_empty()
    }
}

fn default_feed_table() -> String {
    crate::backend::DEFAULT_FEED_TABLE.into()
}

fn default_artist_table() -> String {
    crate::backend::DEFAULT_ARTIST_TABLE.into()
}

fn default_bucket() -> String {
    crate::backend::DEFAULT_BUCKET.into()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedSection {
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_preload_threshold")]
    pub preload_threshold: usize,
    #[serde(default = "default_radius")]
    pub render_radius: usize,
    #[serde(default = "default_radius")]
    pub prefetch_radius: usize,
}

impl Default for FeedSection {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            preload_threshold: default_preload_threshold(),
            render_radius: default_radius(),
            prefetch_radius: default_radius(),
        }
    }
}

fn default_page_size() -> usize {
    10
}

fn default_preload_threshold() -> usize {
    2
}

fn default_radius() -> usize {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ViewportSection {
    #[serde(default = "default_visible_threshold")]
    pub visible_threshold: f32,
    #[serde(default = "default_dwell", with = "humantime_serde")]
    pub dwell: Duration,
}

impl Default for ViewportSection {
    fn default() -> Self {
        Self {
            visible_threshold: default_visible_threshold(),
            dwell: default_dwell(),
        }
    }
}

fn default_visible_threshold() -> f32 {
    0.8
}

fn default_dwell() -> Duration {
    Duration::from_millis(300)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GestureSection {
    #[serde(default = "default_double_tap", with = "humantime_serde")]
    pub double_tap: Duration,
    #[serde(default = "default_long_press", with = "humantime_serde")]
    pub long_press: Duration,
}

impl Default for GestureSection {
    fn default() -> Self {
        Self {
            double_tap: default_double_tap(),
            long_press: default_long_press(),
        }
    }
}

fn default_double_tap() -> Duration {
    Duration::from_millis(300)
}

fn default_long_press() -> Duration {
    Duration::from_millis(500)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaConfig {
    #[serde(default = "default_cache_dir")]
    pub cache_dir: Option<PathBuf>,
    #[serde(default = "default_max_size_bytes")]
    pub max_size_bytes: i64,
    #[serde(default = "default_media_ttl_duration", with = "humantime_serde")]
    pub default_ttl: Duration,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            max_size_bytes: default_max_size_bytes(),
            default_ttl: default_media_ttl_duration(),
            workers: default_workers(),
        }
    }
}

fn default_cache_dir() -> Option<PathBuf> {
    crate::media::default_cache_dir()
}

fn default_max_size_bytes() -> i64 {
    200 * 1024 * 1024
}

fn default_media_ttl_duration() -> Duration {
    Duration::from_secs(6 * 60 * 60)
}

fn default_workers() -> usize {
    2
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PlayerBackend {
    #[default]
    Mpv,
    Headless,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayerConfig {
    #[serde(default)]
    pub backend: PlayerBackend,
    #[serde(default = "default_mpv_path")]
    pub mpv_path: String,
    #[serde(default = "default_load_timeout", with = "humantime_serde")]
    pub load_timeout: Duration,
}

impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            backend: PlayerBackend::default(),
            mpv_path: default_mpv_path(),
            load_timeout: default_load_timeout(),
        }
    }
}

fn default_mpv_path() -> String {
    "mpv".into()
}

fn default_load_timeout() -> Duration {
    Duration::from_secs(20)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadSection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    pub initial_backoff: Duration,
    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for UploadSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(500)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(8)
}

impl Config {
    pub fn feed_config(&self) -> FeedConfig {
        FeedConfig {
            page_size: self.feed.page_size,
            preload_threshold: self.feed.preload_threshold,
            render_radius: self.feed.render_radius,
            prefetch_radius: self.feed.prefetch_radius,
        }
    }

    pub fn viewport_config(&self) -> ViewportConfig {
        ViewportConfig {
            visible_threshold: self.viewport.visible_threshold,
            dwell: self.viewport.dwell,
        }
    }

    pub fn gesture_config(&self) -> GestureConfig {
        GestureConfig {
            double_tap: self.gesture.double_tap,
            long_press: self.gesture.long_press,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.upload.max_attempts,
            initial_backoff: self.upload.initial_backoff,
            max_backoff: self.upload.max_backoff,
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.feed.page_size > 0, "config: feed.page_size must be positive");
        ensure!(
            self.viewport.visible_threshold > 0.0 && self.viewport.visible_threshold <= 1.0,
            "config: viewport.visible_threshold must be in (0, 1]"
        );
        ensure!(
            self.upload.max_attempts > 0,
            "config: upload.max_attempts must be positive"
        );
        ensure!(self.media.workers > 0, "config: media.workers must be positive");
        if self.backend.is_configured() {
            ensure!(
                !self.backend.anon_key.trim().is_empty(),
                "config: backend.anon_key is required when backend.url is set"
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_file: Option<PathBuf>,
    pub env_prefix: Option<String>,
}

/// Defaults, then the YAML file (explicit or default path), then environment
/// overrides such as `ARTFEED_FEED__PAGE_SIZE`.
pub fn load(options: LoadOptions) -> Result<Config> {
    let mut cfg = Config::default();

    let path = options.config_file.clone().or_else(default_config_path);
    if let Some(path) = path {
        if path.exists() {
            cfg = read_config_file(&path)?;
            log::debug!("config: loaded {}", path.display());
        }
    }

    let prefix = options.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX);
    for (key, value) in env_overrides(prefix) {
        apply_env_value(&mut cfg, &key, value);
    }

    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("Failed to parse config file at {}", path.display()))?;
    Ok(config)
}

fn env_overrides(prefix: &str) -> HashMap<String, String> {
    let upper_prefix = format!("{}_", prefix.to_uppercase());
    env::vars()
        .filter_map(|(key, value)| {
            let stripped = key.strip_prefix(&upper_prefix)?;
            // ARTFEED_LOG and friends configure logging, not sections.
            if !stripped.contains("__") {
                return None;
            }
            Some((stripped.to_ascii_lowercase().replace("__", "."), value))
        })
        .collect()
}

fn apply_env_value(cfg: &mut Config, key: &str, value: String) {
    let applied = match key {
        "backend.url" => set(&mut cfg.backend.url, value),
        "backend.anon_key" => set(&mut cfg.backend.anon_key, value),
        "backend.feed_table" => set(&mut cfg.backend.feed_table, value),
        "backend.artist_table" => set(&mut cfg.backend.artist_table, value),
        "backend.bucket" => set(&mut cfg.backend.bucket, value),
        "backend.site_url" => set(&mut cfg.backend.site_url, value),
        "feed.page_size" => parse_into(&mut cfg.feed.page_size, &value),
        "feed.preload_threshold" => parse_into(&mut cfg.feed.preload_threshold, &value),
        "feed.render_radius" => parse_into(&mut cfg.feed.render_radius, &value),
        "feed.prefetch_radius" => parse_into(&mut cfg.feed.prefetch_radius, &value),
        "viewport.visible_threshold" => parse_into(&mut cfg.viewport.visible_threshold, &value),
        "viewport.dwell" => duration_into(&mut cfg.viewport.dwell, &value),
        "gesture.double_tap" => duration_into(&mut cfg.gesture.double_tap, &value),
        "gesture.long_press" => duration_into(&mut cfg.gesture.long_press, &value),
        "media.cache_dir" => {
            cfg.media.cache_dir = Some(PathBuf::from(value));
            true
        }
        "media.max_size_bytes" => parse_into(&mut cfg.media.max_size_bytes, &value),
        "media.default_ttl" => duration_into(&mut cfg.media.default_ttl, &value),
        "media.workers" => parse_into(&mut cfg.media.workers, &value),
        "player.backend" => match value.trim().to_ascii_lowercase().as_str() {
            "mpv" => {
                cfg.player.backend = PlayerBackend::Mpv;
                true
            }
            "headless" => {
                cfg.player.backend = PlayerBackend::Headless;
                true
            }
            _ => false,
        },
        "player.mpv_path" => set(&mut cfg.player.mpv_path, value),
        "player.load_timeout" => duration_into(&mut cfg.player.load_timeout, &value),
        "upload.max_attempts" => parse_into(&mut cfg.upload.max_attempts, &value),
        "upload.initial_backoff" => duration_into(&mut cfg.upload.initial_backoff, &value),
        "upload.max_backoff" => duration_into(&mut cfg.upload.max_backoff, &value),
        _ => {
            log::debug!("config: ignoring unknown override {key}");
            return;
        }
    };
    if !applied {
        log::warn!("config: ignoring invalid value for {key}");
    }
}

fn set(slot: &mut String, value: String) -> bool {
    *slot = value;
    true
}

fn parse_into<T: std::str::FromStr>(slot: &mut T, value: &str) -> bool {
    match value.trim().parse() {
        Ok(parsed) => {
            *slot = parsed;
            true
        }
        Err(_) => false,
    }
}

fn duration_into(slot: &mut Duration, value: &str) -> bool {
    match humantime::parse_duration(value.trim()) {
        Ok(parsed) => {
            *slot = parsed;
            true
        }
        Err(_) => false,
    }
}

pub fn default_path() -> Option<PathBuf> {
    default_config_path()
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("artfeed").join("config.yaml"))
}

pub fn to_yaml(cfg: &Config) -> Result<String> {
    serde_yaml::to_string(cfg).context("config: failed to serialize config")
}
