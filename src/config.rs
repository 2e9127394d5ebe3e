use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::feed::{self, FeedOptions};
use crate::injector::{self, InjectorOptions};
use crate::storage;

const DEFAULT_ENV_PREFIX: &str = "VERIFEED";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            user_agent: default_user_agent(),
            timeout: default_timeout(),
        }
    }
}

fn default_user_agent() -> String {
    format!("verifeed/{}", crate::VERSION)
}

fn default_timeout() -> Duration {
    Duration::from_secs(20)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FeedConfig {
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_stale_time", with = "humantime_serde")]
    pub stale_time: Duration,
    #[serde(default = "default_intersection_margin")]
    pub intersection_margin: f64,
    #[serde(default = "default_intersection_threshold")]
    pub intersection_threshold: f64,
    #[serde(default = "default_reconcile_delay", with = "humantime_serde")]
    pub reconcile_delay: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            stale_time: default_stale_time(),
            intersection_margin: default_intersection_margin(),
            intersection_threshold: default_intersection_threshold(),
            reconcile_delay: default_reconcile_delay(),
        }
    }
}

impl FeedConfig {
    pub fn feed_options(&self) -> FeedOptions {
        FeedOptions {
            page_size: self.page_size,
            stale_time: self.stale_time,
            intersection_margin: self.intersection_margin,
            intersection_threshold: self.intersection_threshold,
        }
    }

    pub fn injector_options(&self) -> InjectorOptions {
        InjectorOptions {
            reconcile_delay: self.reconcile_delay,
        }
    }
}

fn default_page_size() -> usize {
    feed::DEFAULT_PAGE_SIZE
}

fn default_stale_time() -> Duration {
    feed::DEFAULT_STALE_TIME
}

fn default_intersection_margin() -> f64 {
    feed::DEFAULT_INTERSECTION_MARGIN
}

fn default_intersection_threshold() -> f64 {
    feed::DEFAULT_INTERSECTION_THRESHOLD
}

fn default_reconcile_delay() -> Duration {
    injector::DEFAULT_RECONCILE_DELAY
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StorageConfig {
    #[serde(default = "default_provisional_ttl", with = "humantime_serde")]
    pub provisional_ttl: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            provisional_ttl: default_provisional_ttl(),
        }
    }
}

impl StorageConfig {
    pub fn store_options(&self) -> storage::Options {
        storage::Options {
            ttl: self.provisional_ttl,
        }
    }
}

fn default_provisional_ttl() -> Duration {
    Duration::from_secs(60 * 60)
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_file: Option<PathBuf>,
    pub env_prefix: Option<String>,
}

pub fn load(options: LoadOptions) -> Result<Config> {
    let mut cfg = Config::default();

    if let Some(path) = options.config_file.as_ref() {
        if path.exists() {
            cfg = read_config_file(path)?;
        }
    } else if let Some(default_path) = default_config_path() {
        if default_path.exists() {
            cfg = read_config_file(&default_path)?;
        }
    }

    let prefix = options.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX);
    apply_env(&mut cfg, prefix);
    sanitize(&mut cfg);

    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("Failed to parse config file at {}", path.display()))?;
    Ok(config)
}

fn apply_env(cfg: &mut Config, prefix: &str) {
    let mut map: HashMap<String, String> = HashMap::new();
    let upper_prefix = format!("{}_", prefix.to_uppercase());

    for (key, value) in env::vars() {
        if let Some(stripped) = key.strip_prefix(&upper_prefix) {
            let normalized = stripped.to_ascii_lowercase().replace("__", ".");
            map.insert(normalized, value);
        }
    }

    for (key, value) in map {
        apply_env_value(cfg, &key, value);
    }
}

fn apply_env_value(cfg: &mut Config, key: &str, value: String) {
    match key {
        "api.base_url" => cfg.api.base_url = value,
        "api.user_agent" => cfg.api.user_agent = value,
        "api.timeout" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.api.timeout = duration;
            }
        }
        "feed.page_size" => {
            if let Ok(parsed) = value.parse::<usize>() {
                cfg.feed.page_size = parsed;
            }
        }
        "feed.stale_time" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.feed.stale_time = duration;
            }
        }
        "feed.intersection_margin" => {
            if let Ok(parsed) = value.parse::<f64>() {
                cfg.feed.intersection_margin = parsed;
            }
        }
        "feed.intersection_threshold" => {
            if let Ok(parsed) = value.parse::<f64>() {
                cfg.feed.intersection_threshold = parsed;
            }
        }
        "feed.reconcile_delay" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.feed.reconcile_delay = duration;
            }
        }
        "storage.provisional_ttl" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.storage.provisional_ttl = duration;
            }
        }
        _ => {}
    }
}

fn sanitize(cfg: &mut Config) {
    if cfg.feed.page_size == 0 {
        cfg.feed.page_size = default_page_size();
    }
    if !cfg.feed.intersection_margin.is_finite() || cfg.feed.intersection_margin < 0.0 {
        cfg.feed.intersection_margin = default_intersection_margin();
    }
    if !(0.0..=1.0).contains(&cfg.feed.intersection_threshold) {
        cfg.feed.intersection_threshold = default_intersection_threshold();
    }
    if cfg.api.user_agent.trim().is_empty() {
        cfg.api.user_agent = default_user_agent();
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("verifeed").join("config.yaml"))
}
