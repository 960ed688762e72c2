use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse config: {0}")]
    Parse(#[from] serde_yml::Error),
    #[error("channel #{index}: missing required field `{field}`")]
    MissingField { index: usize, field: &'static str },
    #[error("channel `{0}`: target is not a valid URL")]
    InvalidTarget(String),
    #[error("duplicate channel name `{0}`")]
    DuplicateChannel(String),
    #[error("route `{route}` references unknown channel `{channel}`")]
    UnknownRouteChannel { route: String, channel: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub ssh: Option<SshConfig>,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui_auth_token: Option<String>,
    /// Legacy per-site config. Converted into channels at load time and
    /// never written back.
    #[serde(default, skip_serializing)]
    pub sites: Vec<LegacySite>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_proxy_port")]
    pub port: u16,
    #[serde(default)]
    pub ui: UiConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_proxy_port(),
            ui: UiConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_ui_port")]
    pub port: u16,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_host(),
            port: default_ui_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshConfig {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelConfig {
    pub name: String,
    pub target: String,
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub key_strategy: KeyStrategy,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub fallback: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel: Option<TunnelConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheckConfig>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyStrategy {
    #[default]
    #[serde(rename = "round-robin")]
    RoundRobin,
    #[serde(rename = "random")]
    Random,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub local_port: u16,
    pub remote_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckConfig {
    pub path: String,
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_health_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteConfig {
    pub path: String,
    pub channels: Vec<String>,
    #[serde(default)]
    pub strategy: RouteStrategy,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteStrategy {
    #[default]
    #[serde(rename = "priority")]
    Priority,
    #[serde(rename = "round-robin")]
    RoundRobin,
    #[serde(rename = "lowest-latency")]
    LowestLatency,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// SSH reconnect delay in milliseconds.
    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub hot_reload: bool,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            reconnect_interval: default_reconnect_interval(),
            log_level: default_log_level(),
            hot_reload: false,
            retry: RetryConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_on")]
    pub retry_on: Vec<u16>,
    #[serde(default)]
    pub backoff: BackoffKind,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_on: default_retry_on(),
            backoff: BackoffKind::default(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    #[default]
    Exponential,
    Fixed,
}

/// One entry of the deprecated top-level `sites:` array.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacySite {
    pub name: String,
    pub target: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub local_port: u16,
    pub remote_port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_proxy_port() -> u16 {
    9000
}

fn default_ui_port() -> u16 {
    3000
}

fn default_ssh_port() -> u16 {
    22
}

fn default_true() -> bool {
    true
}

fn default_weight() -> u32 {
    10
}

fn default_health_interval_ms() -> u64 {
    30_000
}

fn default_health_timeout_ms() -> u64 {
    5_000
}

fn default_reconnect_interval() -> u64 {
    5_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_on() -> Vec<u16> {
    vec![429, 502, 503, 504]
}

fn default_base_delay_ms() -> u64 {
    300
}

fn default_max_delay_ms() -> u64 {
    10_000
}

/// Resolve the config file path: explicit flag first, then the override
/// env vars, then `~/.ai-tunnel/config.yaml`.
pub fn config_path(explicit: Option<PathBuf>) -> PathBuf {
    if let Some(path) = explicit {
        return path;
    }
    for var in crate::CONFIG_ENV_VARS {
        if let Ok(value) = std::env::var(var)
            && !value.trim().is_empty()
        {
            return PathBuf::from(value);
        }
    }
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".ai-tunnel").join("config.yaml"),
        None => PathBuf::from("config.yaml"),
    }
}

pub fn load(path: &Path) -> Result<AppConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut config: AppConfig = serde_yml::from_str(&raw)?;
    convert_legacy_sites(&mut config);
    validate(&config)?;
    Ok(config)
}

/// Auto-convert the deprecated `sites:` array: each site becomes a channel
/// with `tunnel.enabled = true` and a single credential lifted from an
/// embedded `Authorization` header. Any other custom header has no home in
/// the channel model and is dropped with a warning.
fn convert_legacy_sites(config: &mut AppConfig) {
    for site in std::mem::take(&mut config.sites) {
        let mut keys = Vec::new();
        for (header, value) in &site.headers {
            if header.eq_ignore_ascii_case("authorization") {
                let key = value
                    .trim()
                    .strip_prefix("Bearer ")
                    .or_else(|| value.trim().strip_prefix("bearer "))
                    .unwrap_or(value.trim());
                if !key.is_empty() {
                    keys.push(key.to_string());
                }
            } else {
                warn!(
                    event = "legacy_header_dropped",
                    site = %site.name,
                    header = %header,
                    "legacy site header has no channel equivalent"
                );
            }
        }
        config.channels.push(ChannelConfig {
            name: site.name,
            target: site.target,
            keys,
            key_strategy: KeyStrategy::default(),
            weight: default_weight(),
            fallback: false,
            tunnel: Some(TunnelConfig {
                enabled: true,
                local_port: site.local_port,
                remote_port: site.remote_port,
            }),
            health_check: None,
        });
    }
}

fn validate(config: &AppConfig) -> Result<(), ConfigError> {
    let mut seen = std::collections::HashSet::new();
    for (index, channel) in config.channels.iter().enumerate() {
        if channel.name.trim().is_empty() {
            return Err(ConfigError::MissingField {
                index,
                field: "name",
            });
        }
        if channel.target.trim().is_empty() {
            return Err(ConfigError::MissingField {
                index,
                field: "target",
            });
        }
        if url::Url::parse(&channel.target).is_err() {
            return Err(ConfigError::InvalidTarget(channel.name.clone()));
        }
        if channel.keys.iter().all(|key| key.trim().is_empty()) {
            return Err(ConfigError::MissingField {
                index,
                field: "keys",
            });
        }
        if !seen.insert(channel.name.clone()) {
            return Err(ConfigError::DuplicateChannel(channel.name.clone()));
        }
    }
    for route in &config.routes {
        for name in &route.channels {
            if !seen.contains(name) {
                return Err(ConfigError::UnknownRouteChannel {
                    route: route.path.clone(),
                    channel: name.clone(),
                });
            }
        }
    }
    Ok(())
}
