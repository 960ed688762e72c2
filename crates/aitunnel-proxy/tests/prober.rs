use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::{Request, State};
use axum::response::IntoResponse;
use http::StatusCode;
use http::header::{AUTHORIZATION, HOST};
use tokio::sync::Mutex;
use tokio::time::timeout;

use aitunnel_common::{AppConfig, ChannelConfig, HealthCheckConfig, KeyStrategy, TunnelConfig};
use aitunnel_core::Health;
use aitunnel_core::events::{Event, EventHub};
use aitunnel_core::state::AppState;
use aitunnel_proxy::HealthProber;

/// Generous ceiling for probe-driven transitions; probes fire on the
/// prober's internal scheduler tick, not instantly.
const EVENT_WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
struct ProbeSeen {
    authorization: Option<String>,
    host: Option<String>,
    path: String,
}

#[derive(Clone, Default)]
struct ProbeTarget {
    seen: Arc<Mutex<Vec<ProbeSeen>>>,
    hits: Arc<AtomicU32>,
    /// Probes up to this count get a 500; later ones get a 200.
    fail_first: Arc<AtomicU32>,
}

async fn probe_handler(State(target): State<ProbeTarget>, req: Request) -> impl IntoResponse {
    let hit = target.hits.fetch_add(1, Ordering::SeqCst) + 1;
    target.seen.lock().await.push(ProbeSeen {
        authorization: header_string(req.headers(), AUTHORIZATION.as_str()),
        host: header_string(req.headers(), HOST.as_str()),
        path: req.uri().path().to_string(),
    });
    if hit <= target.fail_first.load(Ordering::SeqCst) {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    }
}

fn header_string(headers: &http::HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}

async fn serve_probe_target(target: ProbeTarget) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = Router::new()
        .fallback(probe_handler)
        .with_state(target);
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

fn probed_channel(name: &str, target: String, tunnel: Option<TunnelConfig>) -> ChannelConfig {
    ChannelConfig {
        name: name.to_string(),
        target,
        keys: vec!["k1".to_string()],
        key_strategy: KeyStrategy::RoundRobin,
        weight: 10,
        fallback: false,
        tunnel,
        health_check: Some(HealthCheckConfig {
            path: "/health".to_string(),
            interval_ms: 50,
            timeout_ms: 1_000,
        }),
    }
}

async fn next_health_event(
    rx: &mut tokio::sync::broadcast::Receiver<Event>,
) -> aitunnel_core::events::HealthEvent {
    loop {
        let event = timeout(EVENT_WAIT, rx.recv())
            .await
            .expect("health event within the wait window")
            .expect("hub stays open");
        if let Event::Health(health) = event {
            return health;
        }
    }
}

#[tokio::test]
async fn three_probe_failures_demote_and_one_success_recovers() {
    let target = ProbeTarget::default();
    target.fail_first.store(3, Ordering::SeqCst);
    let addr = serve_probe_target(target.clone()).await;

    let config = AppConfig {
        channels: vec![probed_channel("probed", format!("http://{addr}"), None)],
        ..AppConfig::default()
    };
    let state = AppState::from_config(config, EventHub::new(256));
    let channel = state.channel("probed").unwrap();
    assert_eq!(channel.health(), Health::Unknown);

    let mut events = state.hub.subscribe();
    let prober = HealthProber::new(state.clone()).unwrap().spawn();

    // Two strikes are not enough: watch the first two probes land
    // without a demotion.
    while target.hits.load(Ordering::SeqCst) < 3 {
        assert_ne!(channel.health(), Health::Unhealthy);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // The third strike demotes.
    let down = next_health_event(&mut events).await;
    assert_eq!(down.channel, "probed");
    assert!(!down.healthy);
    assert!(target.hits.load(Ordering::SeqCst) >= 3);
    assert_eq!(channel.health(), Health::Unhealthy);
    assert!(!channel.is_available());

    // Probe 4 succeeds: a single success clears the streak and emits the
    // healthy transition.
    let up = next_health_event(&mut events).await;
    assert_eq!(up.channel, "probed");
    assert!(up.healthy);
    assert!(up.latency_ms.is_some());
    assert_eq!(channel.health(), Health::Healthy);
    assert!(channel.is_available());

    // Probes used the configured path and the first alive credential.
    let seen = target.seen.lock().await;
    assert_eq!(seen[0].path, "/health");
    assert_eq!(seen[0].authorization.as_deref(), Some("Bearer k1"));

    prober.abort();
}

#[tokio::test]
async fn transition_events_fire_once_per_boundary() {
    // Six failures, then permanent success: one unhealthy event on the
    // third strike, one healthy event on recovery, nothing in between.
    let target = ProbeTarget::default();
    target.fail_first.store(6, Ordering::SeqCst);
    let addr = serve_probe_target(target.clone()).await;

    let config = AppConfig {
        channels: vec![probed_channel("flappy", format!("http://{addr}"), None)],
        ..AppConfig::default()
    };
    let state = AppState::from_config(config, EventHub::new(256));
    let mut events = state.hub.subscribe();
    let prober = HealthProber::new(state.clone()).unwrap().spawn();

    let down = next_health_event(&mut events).await;
    assert!(!down.healthy);
    assert!(target.hits.load(Ordering::SeqCst) >= 3);

    // Strikes 4-6 keep failing but the state already is unhealthy; the
    // next event must be the recovery, not a repeat demotion.
    let up = next_health_event(&mut events).await;
    assert!(up.healthy);
    assert!(target.hits.load(Ordering::SeqCst) >= 7);

    prober.abort();
}

#[tokio::test]
async fn tunnel_channels_probe_the_local_forward_with_the_origin_host() {
    let target = ProbeTarget::default();
    let addr = serve_probe_target(target.clone()).await;

    // The advertised origin is unreachable on purpose; only the local
    // forward port (our test listener) can answer.
    let config = AppConfig {
        channels: vec![probed_channel(
            "tunneled",
            "https://origin.example.com".to_string(),
            Some(TunnelConfig {
                enabled: true,
                local_port: addr.port(),
                remote_port: 18080,
            }),
        )],
        ..AppConfig::default()
    };
    let state = AppState::from_config(config, EventHub::new(256));
    let channel = state.channel("tunneled").unwrap();
    let prober = HealthProber::new(state.clone()).unwrap().spawn();

    let deadline = tokio::time::Instant::now() + EVENT_WAIT;
    while channel.health() != Health::Healthy {
        assert!(
            tokio::time::Instant::now() < deadline,
            "probe never marked the tunnel channel healthy"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let seen = target.seen.lock().await;
    assert!(!seen.is_empty());
    // The request went to 127.0.0.1:{localPort} but carried the origin's
    // authority, so a CDN-fronted origin still recognizes it.
    assert_eq!(seen[0].host.as_deref(), Some("origin.example.com"));
    assert_eq!(seen[0].path, "/health");
    assert_eq!(seen[0].authorization.as_deref(), Some("Bearer k1"));

    prober.abort();
}
