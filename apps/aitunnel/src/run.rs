use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use tokio::net::TcpListener;

use aitunnel_common::AppConfig;
use aitunnel_core::events::{Event, EventHub};
use aitunnel_core::state::AppState;
use aitunnel_proxy::{HealthProber, ProxyEngine};
use aitunnel_tunnel::{Forward, TunnelAuth, TunnelManager, TunnelSettings};

/// How often the hot-reload loop checks the config file's mtime.
const RELOAD_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub fn run(config: Option<PathBuf>) -> anyhow::Result<()> {
    let config_path = aitunnel_common::config_path(config);
    let runtime = tokio::runtime::Runtime::new().context("build tokio runtime")?;
    runtime.block_on(serve(config_path))
}

async fn serve(config_path: PathBuf) -> anyhow::Result<()> {
    let config = aitunnel_common::load(&config_path)
        .with_context(|| format!("load config {}", config_path.display()))?;
    init_tracing(&config.settings.log_level);

    let hub = EventHub::new(1024);
    let state = AppState::from_config(config.clone(), hub.clone());

    // Unified proxy entry.
    let engine = Arc::new(ProxyEngine::new(state.clone()).context("build upstream client")?);
    let proxy_bind = format!("{}:{}", config.server.host, config.server.port);
    let proxy_listener = TcpListener::bind(&proxy_bind)
        .await
        .with_context(|| format!("bind proxy listener on {proxy_bind}"))?;
    tokio::spawn(async move {
        if let Err(err) = axum::serve(proxy_listener, engine.router()).await {
            tracing::error!(event = "proxy_listener_failed", error = %err);
        }
    });
    hub.info("server", format!("proxy listening on {proxy_bind}"));

    // Management API.
    if config.server.ui.enabled {
        let admin = aitunnel_admin::router(state.clone(), config.ui_auth_token.clone());
        let admin_bind = format!("{}:{}", config.server.ui.host, config.server.ui.port);
        let admin_listener = TcpListener::bind(&admin_bind)
            .await
            .with_context(|| format!("bind management listener on {admin_bind}"))?;
        tokio::spawn(async move {
            if let Err(err) = axum::serve(admin_listener, admin).await {
                tracing::error!(event = "admin_listener_failed", error = %err);
            }
        });
        hub.info("server", format!("management api on {admin_bind}"));
    }

    let prober = HealthProber::new(state.clone())
        .context("build health prober")?
        .spawn();

    let tunnel = tunnel_settings(&config).map(TunnelManager::new);
    let tunnel_task = tunnel.as_ref().map(|manager| manager.spawn());
    if tunnel.is_some() {
        hub.info("tunnel", "ssh reverse tunnel starting");
    }

    let reload = tokio::spawn(reload_loop(state.clone(), config_path));

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    hub.info("server", "shutting down");
    if let Some(manager) = &tunnel {
        manager.shutdown();
    }
    prober.abort();
    reload.abort();
    if let Some(task) = tunnel_task {
        // Give the SSH goodbye its grace period.
        let _ = tokio::time::timeout(Duration::from_secs(3), task).await;
    }
    Ok(())
}

fn init_tracing(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// A tunnel runs when SSH credentials are configured and at least one
/// channel adverts a remote port.
fn tunnel_settings(config: &AppConfig) -> Option<TunnelSettings> {
    let ssh = config.ssh.as_ref()?;
    let forwards: Vec<Forward> = config
        .channels
        .iter()
        .filter_map(|channel| channel.tunnel.as_ref())
        .filter(|tunnel| tunnel.enabled)
        .map(|tunnel| Forward {
            remote_port: tunnel.remote_port,
            local_port: tunnel.local_port,
        })
        .collect();
    if forwards.is_empty() {
        return None;
    }
    let auth = if let Some(path) = &ssh.private_key_path {
        TunnelAuth::PrivateKey(PathBuf::from(path))
    } else if let Some(password) = &ssh.password {
        TunnelAuth::Password(password.clone())
    } else {
        tracing::warn!(event = "ssh_no_auth", "ssh block has neither key nor password");
        return None;
    };
    Some(TunnelSettings {
        host: ssh.host.clone(),
        port: ssh.port,
        username: ssh.username.clone(),
        auth,
        forwards,
        reconnect_interval: Duration::from_millis(config.settings.reconnect_interval),
    })
}

/// Reacts to `config_reload_request` events from the management API and,
/// when `hotReload` is on, to config file changes. A broken file keeps
/// the previous config running.
async fn reload_loop(state: Arc<AppState>, config_path: PathBuf) {
    let mut events = state.hub.subscribe();
    let mut last_mtime = file_mtime(&config_path);
    let mut tick = tokio::time::interval(RELOAD_POLL_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        let triggered = tokio::select! {
            event = events.recv() => matches!(event, Ok(Event::ConfigReloadRequest)),
            _ = tick.tick() => {
                if !state.config.load().settings.hot_reload {
                    false
                } else {
                    let mtime = file_mtime(&config_path);
                    let changed = mtime.is_some() && mtime != last_mtime;
                    if changed {
                        last_mtime = mtime;
                    }
                    changed
                }
            }
        };
        if !triggered {
            continue;
        }
        match aitunnel_common::load(&config_path) {
            Ok(config) => {
                state.apply_reload(config);
                state.hub.info("config", "configuration reloaded");
            }
            Err(err) => {
                state.hub.error(
                    "config",
                    format!("reload failed, keeping previous config: {err}"),
                );
            }
        }
    }
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|meta| meta.modified()).ok()
}
