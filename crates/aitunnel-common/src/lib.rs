//! Shared configuration model for the tunnel gateway.
//!
//! The config file is YAML, read once at startup and again on every hot
//! reload. Loading is strict for a cold start (a broken file fails the
//! process) while reload callers are expected to keep the previous config
//! when [`load`] returns an error.

mod config;

pub use config::{
    AppConfig, BackoffKind, ChannelConfig, ConfigError, HealthCheckConfig, KeyStrategy,
    LegacySite, RetryConfig, RouteConfig, RouteStrategy, ServerConfig, Settings, SshConfig,
    TunnelConfig, UiConfig, config_path, load,
};

/// Env vars that override the config file path, in precedence order.
pub const CONFIG_ENV_VARS: [&str; 2] = ["TUNNEL_CONFIG", "AI_TUNNEL_CONFIG"];
