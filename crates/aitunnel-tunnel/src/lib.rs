//! SSH reverse-tunnel manager.
//!
//! Holds one authenticated SSH session, asks the remote side to listen on
//! the configured ports, and relays every inbound stream to a local port.
//! A dropped session reconnects after `reconnect_interval`; a shutdown
//! ends the session gracefully and stays down.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_ssh2_lite::{AsyncChannel, AsyncSession, SessionConfiguration};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

pub const READY_TIMEOUT: Duration = Duration::from_secs(15);
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
pub const KEEPALIVE_MAX_MISSED: u32 = 3;
/// Grace period for the goodbye packet before the session is dropped hard.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Forward {
    /// Port the remote side listens on (127.0.0.1 there).
    pub remote_port: u16,
    /// Local port inbound streams are relayed to.
    pub local_port: u16,
}

#[derive(Debug, Clone)]
pub enum TunnelAuth {
    PrivateKey(PathBuf),
    Password(String),
}

#[derive(Debug, Clone)]
pub struct TunnelSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: TunnelAuth,
    pub forwards: Vec<Forward>,
    pub reconnect_interval: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("ssh io: {0}")]
    Io(#[from] std::io::Error),
    #[error("ssh: {0}")]
    Ssh(#[from] async_ssh2_lite::Error),
    #[error("ssh endpoint not ready within {READY_TIMEOUT:?}")]
    ReadyTimeout,
    #[error("ssh authentication rejected")]
    AuthRejected,
    #[error("missed {0} keepalives")]
    KeepaliveLost(u32),
    #[error("remote forward listener closed")]
    ListenerClosed,
}

struct Inner {
    settings: TunnelSettings,
    destroyed: AtomicBool,
    shutdown: Notify,
}

#[derive(Clone)]
pub struct TunnelManager {
    inner: Arc<Inner>,
}

impl TunnelManager {
    pub fn new(settings: TunnelSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                destroyed: AtomicBool::new(false),
                shutdown: Notify::new(),
            }),
        }
    }

    /// Run the connect/serve/reconnect loop until [`shutdown`] is called.
    /// An auth failure is terminal for the loop but must not take the
    /// process down; the caller just logs and carries on without egress.
    pub fn spawn(&self) -> JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(run(inner))
    }

    pub fn shutdown(&self) {
        self.inner.destroyed.store(true, Ordering::SeqCst);
        self.inner.shutdown.notify_waiters();
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }
}

async fn run(inner: Arc<Inner>) {
    let mut reconnecting = false;
    loop {
        if inner.destroyed.load(Ordering::SeqCst) {
            break;
        }
        match serve_once(&inner, reconnecting).await {
            Ok(()) => break,
            Err(TunnelError::AuthRejected) => {
                error!(
                    event = "ssh_auth_failed",
                    host = %inner.settings.host,
                    "ssh authentication rejected; tunnel disabled until restart"
                );
                break;
            }
            Err(err) => {
                warn!(event = "ssh_disconnected", error = %err, "ssh session lost");
            }
        }
        reconnecting = true;
        if inner.destroyed.load(Ordering::SeqCst) {
            break;
        }
        info!(
            event = "ssh_reconnect_scheduled",
            delay_ms = inner.settings.reconnect_interval.as_millis() as u64
        );
        tokio::select! {
            _ = tokio::time::sleep(inner.settings.reconnect_interval) => {}
            _ = inner.shutdown.notified() => break,
        }
    }
}

/// One full session lifetime: connect, authenticate, install forwards,
/// then sit on keepalives until something drops.
async fn serve_once(inner: &Arc<Inner>, reconnecting: bool) -> Result<(), TunnelError> {
    let settings = &inner.settings;
    let addr = format!("{}:{}", settings.host, settings.port);
    let stream = timeout(READY_TIMEOUT, TcpStream::connect(&addr))
        .await
        .map_err(|_| TunnelError::ReadyTimeout)??;
    let mut config = SessionConfiguration::new();
    config.set_keepalive(true, KEEPALIVE_INTERVAL.as_secs() as u32);
    let mut session = AsyncSession::new(stream, config)?;
    timeout(READY_TIMEOUT, session.handshake())
        .await
        .map_err(|_| TunnelError::ReadyTimeout)??;
    authenticate(&mut session, settings).await?;
    info!(event = "ssh_connected", host = %settings.host, user = %settings.username);

    if reconnecting {
        // The server may still hold listeners from the dropped session.
        cleanup_stale_listeners(&mut session, &settings.forwards).await;
    }

    let mut accept_tasks: JoinSet<()> = JoinSet::new();
    for forward in &settings.forwards {
        let (mut listener, bound_port) = session
            .channel_forward_listen(forward.remote_port, Some("127.0.0.1"), None)
            .await?;
        info!(
            event = "ssh_forward_ready",
            remote_port = bound_port,
            local_port = forward.local_port
        );
        let local_port = forward.local_port;
        accept_tasks.spawn(async move {
            loop {
                match listener.accept().await {
                    Ok(channel) => {
                        tokio::spawn(relay(channel, local_port));
                    }
                    Err(err) => {
                        warn!(event = "ssh_accept_failed", error = %err);
                        return;
                    }
                }
            }
        });
    }

    let mut missed: u32 = 0;
    let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = inner.shutdown.notified() => {
                accept_tasks.abort_all();
                let _ = timeout(
                    SHUTDOWN_GRACE,
                    session.disconnect(None, "shutting down", None),
                )
                .await;
                return Ok(());
            }
            _ = ticker.tick() => {
                if inner.destroyed.load(Ordering::SeqCst) {
                    accept_tasks.abort_all();
                    return Ok(());
                }
                match session.keepalive_send().await {
                    Ok(_) => missed = 0,
                    Err(err) => {
                        missed += 1;
                        debug!(event = "ssh_keepalive_missed", missed, error = %err);
                        if missed >= KEEPALIVE_MAX_MISSED {
                            accept_tasks.abort_all();
                            return Err(TunnelError::KeepaliveLost(missed));
                        }
                    }
                }
            }
            _ = accept_tasks.join_next() => {
                accept_tasks.abort_all();
                return Err(TunnelError::ListenerClosed);
            }
        }
    }
}

/// Dial the local side and pump bytes both ways; when either end closes
/// or errors the other is torn down by drop.
async fn relay(mut channel: AsyncChannel<TcpStream>, local_port: u16) {
    match TcpStream::connect(("127.0.0.1", local_port)).await {
        Ok(mut local) => {
            if let Err(err) = tokio::io::copy_bidirectional(&mut channel, &mut local).await {
                debug!(event = "ssh_relay_closed", error = %err);
            }
        }
        Err(err) => {
            warn!(event = "ssh_relay_dial_failed", local_port, error = %err);
        }
    }
}

async fn authenticate(
    session: &mut AsyncSession<TcpStream>,
    settings: &TunnelSettings,
) -> Result<(), TunnelError> {
    match &settings.auth {
        TunnelAuth::PrivateKey(path) => {
            let path = expand_tilde(path);
            session
                .userauth_pubkey_file(&settings.username, None, &path, None)
                .await?;
        }
        TunnelAuth::Password(password) => {
            session
                .userauth_password(&settings.username, password)
                .await?;
        }
    }
    if !session.authenticated() {
        return Err(TunnelError::AuthRejected);
    }
    Ok(())
}

/// Best-effort: ask the server to free any port our previous session left
/// occupied. Failure here only means the forward request below may fail
/// once more before the next reconnect.
async fn cleanup_stale_listeners(session: &mut AsyncSession<TcpStream>, forwards: &[Forward]) {
    let ports = forwards
        .iter()
        .map(|forward| forward.remote_port.to_string())
        .collect::<Vec<_>>()
        .join(" ");
    let command =
        format!("for p in {ports}; do fuser -k -n tcp \"$p\" >/dev/null 2>&1 || true; done");
    let result: Result<(), TunnelError> = async {
        let mut channel = session.channel_session().await?;
        channel.exec(&command).await?;
        let mut output = Vec::new();
        channel.read_to_end(&mut output).await?;
        channel.close().await?;
        Ok(())
    }
    .await;
    if let Err(err) = result {
        debug!(event = "ssh_cleanup_failed", error = %err);
    }
}

/// `~`-prefixed key paths refer to the invoking user's home.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let Some(raw) = path.to_str() else {
        return path.to_path_buf();
    };
    if raw == "~" {
        return dirs::home_dir().unwrap_or_else(|| path.to_path_buf());
    }
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tilde_expansion_uses_home() {
        let home = dirs::home_dir().expect("home dir in test env");
        assert_eq!(
            expand_tilde(Path::new("~/.ssh/id_ed25519")),
            home.join(".ssh/id_ed25519")
        );
        assert_eq!(expand_tilde(Path::new("~")), home);
        assert_eq!(
            expand_tilde(Path::new("/etc/ssh/key")),
            PathBuf::from("/etc/ssh/key")
        );
    }

    #[test]
    fn shutdown_flag_sticks() {
        let manager = TunnelManager::new(TunnelSettings {
            host: "127.0.0.1".to_string(),
            port: 22,
            username: "nobody".to_string(),
            auth: TunnelAuth::Password("pw".to_string()),
            forwards: vec![Forward {
                remote_port: 18080,
                local_port: 9000,
            }],
            reconnect_interval: Duration::from_millis(100),
        });
        assert!(!manager.is_destroyed());
        manager.shutdown();
        assert!(manager.is_destroyed());
    }
}
