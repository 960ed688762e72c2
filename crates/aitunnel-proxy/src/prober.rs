use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use aitunnel_core::channel::Health;
use aitunnel_core::events::{Event, HealthEvent};
use aitunnel_core::state::AppState;

/// Probe failures needed before a channel is demoted.
const PROBE_FAIL_THRESHOLD: u32 = 3;
/// How often the scheduler looks for due probes.
const SCHEDULER_TICK: Duration = Duration::from_millis(500);

struct ProbeEntry {
    next_at: Instant,
    fails: u32,
    in_flight: bool,
}

struct ProbeResult {
    channel: String,
    ok: bool,
    latency_ms: u64,
}

/// Out-of-band health probing. Channels are re-read from the router every
/// tick, so a hot reload is picked up without restarting anything; probe
/// results write into channel state through `set_health` only.
pub struct HealthProber {
    state: Arc<AppState>,
    client: reqwest::Client,
}

impl HealthProber {
    pub fn new(state: Arc<AppState>) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { state, client })
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let mut entries: HashMap<String, ProbeEntry> = HashMap::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<ProbeResult>();
        let mut tick = tokio::time::interval(SCHEDULER_TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tick.tick() => self.schedule_due(&mut entries, &tx),
                Some(result) = rx.recv() => self.apply(&mut entries, result),
            }
        }
    }

    fn schedule_due(
        &self,
        entries: &mut HashMap<String, ProbeEntry>,
        tx: &mpsc::UnboundedSender<ProbeResult>,
    ) {
        let channels = self.state.channels();
        let now = Instant::now();

        // Forget channels a reload removed.
        let live: std::collections::HashSet<&str> =
            channels.iter().map(|ch| ch.name()).collect();
        entries.retain(|name, _| live.contains(name.as_str()));

        for channel in channels {
            let Some(check) = channel.health_check() else {
                continue;
            };
            let entry = entries
                .entry(channel.name().to_string())
                .or_insert(ProbeEntry {
                    next_at: now,
                    fails: 0,
                    in_flight: false,
                });
            if entry.in_flight || entry.next_at > now {
                continue;
            }
            entry.in_flight = true;
            entry.next_at = now + Duration::from_millis(check.interval_ms);

            let name = channel.name().to_string();
            let timeout = Duration::from_millis(check.timeout_ms);
            let url;
            let mut host_override = None;
            if let Some(tunnel) = channel.tunnel().filter(|tunnel| tunnel.enabled) {
                // Probe through the local end of the reverse forward; the
                // origin may reject requests arriving over the direct path,
                // so keep its authority in the Host header.
                url = format!("http://127.0.0.1:{}{}", tunnel.local_port, check.path);
                host_override = target_authority(channel.target());
            } else {
                url = format!("{}{}", channel.target(), check.path);
            }
            let bearer = channel.first_alive_key();

            let client = self.client.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut request = client.get(&url).timeout(timeout);
                if let Some(host) = host_override {
                    request = request.header(http::header::HOST, host);
                }
                if let Some(key) = bearer {
                    request = request.bearer_auth(key);
                }
                let started = Instant::now();
                let ok = match request.send().await {
                    Ok(response) => {
                        response.status().is_success() || response.status().is_redirection()
                    }
                    Err(_) => false,
                };
                let _ = tx.send(ProbeResult {
                    channel: name,
                    ok,
                    latency_ms: started.elapsed().as_millis() as u64,
                });
            });
        }
    }

    fn apply(&self, entries: &mut HashMap<String, ProbeEntry>, result: ProbeResult) {
        let Some(entry) = entries.get_mut(&result.channel) else {
            return;
        };
        entry.in_flight = false;
        let Some(channel) = self.state.channel(&result.channel) else {
            return;
        };

        if result.ok {
            entry.fails = 0;
            let was_unhealthy = channel.health() == Health::Unhealthy;
            let changed = channel.set_health(Health::Healthy, Some(result.latency_ms));
            if changed && was_unhealthy {
                self.state.hub.info(
                    "health",
                    format!("channel {} recovered", result.channel),
                );
                self.state.hub.emit(Event::Health(HealthEvent {
                    channel: result.channel,
                    healthy: true,
                    latency_ms: Some(result.latency_ms),
                }));
            }
        } else {
            entry.fails += 1;
            if entry.fails >= PROBE_FAIL_THRESHOLD
                && channel.set_health(Health::Unhealthy, None)
            {
                self.state.hub.warn(
                    "health",
                    format!("channel {} failed {} consecutive probes", result.channel, entry.fails),
                );
                self.state.hub.emit(Event::Health(HealthEvent {
                    channel: result.channel,
                    healthy: false,
                    latency_ms: None,
                }));
            }
        }
    }
}

fn target_authority(target: &str) -> Option<String> {
    let parsed = url::Url::parse(target).ok()?;
    let host = parsed.host_str()?;
    Some(match parsed.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::target_authority;

    #[test]
    fn authority_keeps_explicit_port() {
        assert_eq!(
            target_authority("https://api.example.com").as_deref(),
            Some("api.example.com")
        );
        assert_eq!(
            target_authority("http://10.0.0.2:8080").as_deref(),
            Some("10.0.0.2:8080")
        );
        assert_eq!(target_authority("not a url"), None);
    }
}
