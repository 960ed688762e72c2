use aitunnel_common::{ChannelConfig, KeyStrategy};
use aitunnel_core::channel::{Channel, Health};

fn channel_with_keys(keys: &[&str], strategy: KeyStrategy) -> Channel {
    Channel::from_config(&ChannelConfig {
        name: "test".to_string(),
        target: "https://api.example.com".to_string(),
        keys: keys.iter().map(|k| (*k).to_string()).collect(),
        key_strategy: strategy,
        weight: 10,
        fallback: false,
        tunnel: None,
        health_check: None,
    })
}

#[test]
fn round_robin_cycles_alive_keys() {
    let ch = channel_with_keys(&["k1", "k2", "k3"], KeyStrategy::RoundRobin);
    let picks: Vec<String> = (0..4).map(|_| ch.pick_key().unwrap().0).collect();
    assert_eq!(picks, ["k1", "k2", "k3", "k1"]);
}

#[test]
fn round_robin_skips_dead_keys() {
    let ch = channel_with_keys(&["k1", "k2", "k3"], KeyStrategy::RoundRobin);
    for _ in 0..3 {
        ch.mark_key_failed(1);
    }
    assert_eq!(ch.alive_keys(), 2);
    let picks: Vec<String> = (0..4).map(|_| ch.pick_key().unwrap().0).collect();
    assert_eq!(picks, ["k1", "k3", "k1", "k3"]);
}

#[test]
fn pick_returns_none_with_no_alive_keys() {
    let ch = channel_with_keys(&["k1"], KeyStrategy::RoundRobin);
    for _ in 0..3 {
        ch.mark_key_failed(0);
    }
    assert!(ch.pick_key().is_none());
    assert!(!ch.is_available());
}

#[test]
fn key_disable_needs_three_strikes_and_is_idempotent_past_threshold() {
    let ch = channel_with_keys(&["k1", "k2"], KeyStrategy::RoundRobin);
    ch.mark_key_failed(0);
    ch.mark_key_failed(0);
    assert_eq!(ch.alive_keys(), 2);
    ch.mark_key_failed(0);
    assert_eq!(ch.alive_keys(), 1);
    // Further strikes on a dead key change nothing.
    ch.mark_key_failed(0);
    assert_eq!(ch.alive_keys(), 1);
}

#[test]
fn key_success_self_heals_a_disabled_key() {
    let ch = channel_with_keys(&["k1"], KeyStrategy::RoundRobin);
    for _ in 0..3 {
        ch.mark_key_failed(0);
    }
    assert_eq!(ch.alive_keys(), 0);
    ch.mark_key_success(0);
    assert_eq!(ch.alive_keys(), 1);
    assert!(ch.pick_key().is_some());
}

#[test]
fn stats_triple_stays_consistent() {
    let ch = channel_with_keys(&["k1"], KeyStrategy::RoundRobin);
    ch.record_success(12);
    ch.record_failure("upstream 502");
    ch.record_success(8);
    let stats = ch.stats();
    assert_eq!(stats.total_requests, 3);
    assert_eq!(stats.success_count + stats.fail_count, stats.total_requests);
    assert_eq!(stats.last_error.as_deref(), Some("upstream 502"));
}

#[test]
fn three_failures_demote_health_and_success_resets() {
    let ch = channel_with_keys(&["k1"], KeyStrategy::RoundRobin);
    assert!(!ch.record_failure("boom"));
    assert!(!ch.record_failure("boom"));
    assert!(ch.record_failure("boom"));
    assert_eq!(ch.health(), Health::Unhealthy);
    assert!(!ch.is_available());

    ch.record_success(5);
    assert_eq!(ch.health(), Health::Healthy);
    assert!(ch.is_available());
}

#[test]
fn prober_health_transitions_report_changes_only() {
    let ch = channel_with_keys(&["k1"], KeyStrategy::RoundRobin);
    assert!(ch.set_health(Health::Unhealthy, None));
    assert!(!ch.set_health(Health::Unhealthy, None));
    assert!(ch.set_health(Health::Healthy, Some(20)));
    assert_eq!(ch.latency_ms(), Some(20));
}

#[test]
fn toggle_twice_restores_enabled() {
    let ch = channel_with_keys(&["k1"], KeyStrategy::RoundRobin);
    assert!(ch.enabled());
    assert!(!ch.toggle());
    assert!(ch.toggle());
    assert!(ch.enabled());
}

#[test]
fn add_then_remove_last_restores_key_set() {
    let ch = channel_with_keys(&["k1", "k2"], KeyStrategy::RoundRobin);
    ch.add_key("k3".to_string());
    assert_eq!(ch.total_keys(), 3);
    assert!(ch.remove_key(2));
    assert_eq!(ch.total_keys(), 2);
    assert!(!ch.remove_key(5));
}

#[test]
fn removing_at_or_past_cursor_resets_it() {
    let ch = channel_with_keys(&["k1", "k2", "k3"], KeyStrategy::RoundRobin);
    // Advance the cursor past k1.
    assert_eq!(ch.pick_key().unwrap().0, "k1");
    // Cursor sits at index 1; removing index 1 resets to the front.
    assert!(ch.remove_key(1));
    assert_eq!(ch.pick_key().unwrap().0, "k1");
    assert_eq!(ch.pick_key().unwrap().0, "k3");
}

#[test]
fn random_strategy_only_picks_alive_keys() {
    let ch = channel_with_keys(&["k1", "k2", "k3"], KeyStrategy::Random);
    for _ in 0..3 {
        ch.mark_key_failed(0);
        ch.mark_key_failed(2);
    }
    for _ in 0..20 {
        let (key, index) = ch.pick_key().unwrap();
        assert_eq!(key, "k2");
        assert_eq!(index, 1);
    }
}

#[test]
fn summary_exposes_counts_but_never_key_material() {
    let ch = channel_with_keys(&["sk-secret-1", "sk-secret-2"], KeyStrategy::RoundRobin);
    let summary = ch.summary();
    assert_eq!(summary.total_keys, 2);
    assert_eq!(summary.alive_keys, 2);
    let json = serde_json::to_string(&summary).unwrap();
    assert!(!json.contains("sk-secret"));
}

#[test]
fn concurrent_picks_yield_distinct_indices() {
    use std::sync::Arc;

    let ch = Arc::new(channel_with_keys(&["k1", "k2"], KeyStrategy::RoundRobin));
    let mut handles = Vec::new();
    for _ in 0..2 {
        let ch = ch.clone();
        handles.push(std::thread::spawn(move || ch.pick_key().unwrap().1));
    }
    let picked: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_ne!(picked[0], picked[1]);
}
