use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;

use aitunnel_common::AppConfig;

use crate::channel::Channel;
use crate::events::{EventHub, LogLevel};
use crate::retry::RetryPolicy;
use crate::router::{RouteGroup, Router};

/// Root of the in-memory state. The router owns the channels; nothing in
/// here points back up, and a reload is a wholesale replacement: stats and
/// credential liveness of like-named channels are not migrated.
pub struct AppState {
    pub hub: EventHub,
    pub router: Router,
    pub policy: ArcSwap<RetryPolicy>,
    pub config: ArcSwap<AppConfig>,
    pub started_at: Instant,
}

impl AppState {
    pub fn from_config(config: AppConfig, hub: EventHub) -> Arc<Self> {
        if let Ok(level) = LogLevel::from_str(&config.settings.log_level) {
            hub.set_min_level(level);
        }
        let (channels, routes) = build_table(&config);
        let policy = RetryPolicy::from_config(&config.settings.retry);
        Arc::new(Self {
            hub,
            router: Router::new(channels, routes),
            policy: ArcSwap::from_pointee(policy),
            config: ArcSwap::from_pointee(config),
            started_at: Instant::now(),
        })
    }

    /// Swap in a freshly loaded config. In-flight requests that already
    /// resolved a channel finish against the old state.
    pub fn apply_reload(&self, config: AppConfig) {
        if let Ok(level) = LogLevel::from_str(&config.settings.log_level) {
            self.hub.set_min_level(level);
        }
        let (channels, routes) = build_table(&config);
        self.router.update(channels, routes);
        self.policy
            .store(Arc::new(RetryPolicy::from_config(&config.settings.retry)));
        self.config.store(Arc::new(config));
    }

    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.router.channels()
    }

    pub fn channel(&self, name: &str) -> Option<Arc<Channel>> {
        self.router.channel(name)
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

fn build_table(config: &AppConfig) -> (Vec<Arc<Channel>>, Vec<RouteGroup>) {
    let channels = config
        .channels
        .iter()
        .map(|ch| Arc::new(Channel::from_config(ch)))
        .collect();
    let routes = config
        .routes
        .iter()
        .map(|route| RouteGroup {
            pattern: route.path.clone(),
            channels: route.channels.clone(),
            strategy: route.strategy,
        })
        .collect();
    (channels, routes)
}
