use std::collections::HashSet;
use std::sync::Arc;

use aitunnel_common::{ChannelConfig, KeyStrategy, RouteStrategy};
use aitunnel_core::channel::Channel;
use aitunnel_core::router::{RouteGroup, Router};

fn make_channel(name: &str, weight: u32, fallback: bool) -> Arc<Channel> {
    Arc::new(Channel::from_config(&ChannelConfig {
        name: name.to_string(),
        target: format!("https://{name}.example.com"),
        keys: vec![format!("{name}-key")],
        key_strategy: KeyStrategy::RoundRobin,
        weight,
        fallback,
        tunnel: None,
        health_check: None,
    }))
}

fn route(pattern: &str, channels: &[&str], strategy: RouteStrategy) -> RouteGroup {
    RouteGroup {
        pattern: pattern.to_string(),
        channels: channels.iter().map(|s| (*s).to_string()).collect(),
        strategy,
    }
}

#[test]
fn priority_prefers_weight_then_declaration_order() {
    let a = make_channel("a", 5, false);
    let b = make_channel("b", 20, false);
    let c = make_channel("c", 20, false);
    let router = Router::new(
        vec![a, b, c],
        vec![route("/v1/**", &["a", "b", "c"], RouteStrategy::Priority)],
    );
    let resolved = router.resolve("/v1/chat/completions").unwrap();
    assert_eq!(resolved.channel.name(), "b");
}

#[test]
fn fallback_channels_lose_priority_until_needed() {
    let primary = make_channel("primary", 5, false);
    let backup = make_channel("backup", 50, true);
    let router = Router::new(
        vec![primary.clone(), backup],
        vec![route(
            "/v1/**",
            &["primary", "backup"],
            RouteStrategy::Priority,
        )],
    );
    assert_eq!(router.resolve("/v1/models").unwrap().channel.name(), "primary");

    // Primary exhausted: the fallback takes over.
    for _ in 0..3 {
        primary.record_failure("502");
    }
    let resolved = router.resolve("/v1/models").unwrap();
    assert_eq!(resolved.channel.name(), "backup");

    // Degraded last resort: an unhealthy fallback still routes when it is
    // the only channel left switched on.
    for _ in 0..3 {
        resolved.channel.record_failure("502");
    }
    assert_eq!(router.resolve("/v1/models").unwrap().channel.name(), "backup");
}

#[test]
fn unmatched_path_uses_synthetic_default_group() {
    let a = make_channel("a", 10, false);
    let b = make_channel("b", 30, false);
    let router = Router::new(
        vec![a, b],
        vec![route("/v1beta/**", &["a"], RouteStrategy::Priority)],
    );
    // "/v2/foo" matches no route; default group is all channels, priority.
    assert_eq!(router.resolve("/v2/foo").unwrap().channel.name(), "b");
}

#[test]
fn round_robin_rotates_per_pool_identity() {
    let a = make_channel("a", 10, false);
    let b = make_channel("b", 10, false);
    let router = Router::new(
        vec![a, b],
        vec![route("/v1/**", &["a", "b"], RouteStrategy::RoundRobin)],
    );
    let picks: Vec<String> = (0..4)
        .map(|_| router.resolve("/v1/x").unwrap().channel.name().to_string())
        .collect();
    assert_eq!(picks, ["a", "b", "a", "b"]);
}

#[test]
fn lowest_latency_prefers_measured_channels() {
    let fast = make_channel("fast", 10, false);
    let slow = make_channel("slow", 10, false);
    let cold = make_channel("cold", 10, false);
    fast.record_success(10);
    slow.record_success(300);
    let router = Router::new(
        vec![cold, slow, fast],
        vec![route(
            "/v1/**",
            &["cold", "slow", "fast"],
            RouteStrategy::LowestLatency,
        )],
    );
    assert_eq!(router.resolve("/v1/x").unwrap().channel.name(), "fast");
}

#[test]
fn excluded_channels_are_skipped() {
    let a = make_channel("a", 20, false);
    let b = make_channel("b", 5, false);
    let router = Router::new(
        vec![a, b],
        vec![route("/v1/**", &["a", "b"], RouteStrategy::Priority)],
    );
    let mut excluded = HashSet::new();
    excluded.insert("a".to_string());
    assert_eq!(
        router.resolve_next("/v1/x", &excluded).unwrap().channel.name(),
        "b"
    );
    excluded.insert("b".to_string());
    assert!(router.resolve_next("/v1/x", &excluded).is_none());
}

#[test]
fn empty_key_pool_resolves_to_none_without_channel_iteration() {
    let a = make_channel("a", 20, false);
    for _ in 0..3 {
        a.mark_key_failed(0);
    }
    let b = make_channel("b", 5, false);
    let router = Router::new(
        vec![a, b],
        vec![route("/v1/**", &["a", "b"], RouteStrategy::Priority)],
    );
    // Channel a is unavailable (zero alive keys), so the availability
    // filter already removes it and b is chosen directly.
    assert_eq!(router.resolve("/v1/x").unwrap().channel.name(), "b");
}

#[test]
fn disabled_channels_never_route() {
    let a = make_channel("a", 20, false);
    a.toggle();
    let router = Router::new(vec![a], Vec::new());
    assert!(router.resolve("/v1/x").is_none());
}

#[test]
fn update_swaps_table_atomically() {
    let a = make_channel("a", 10, false);
    let router = Router::new(vec![a], Vec::new());
    assert_eq!(router.resolve("/v1/x").unwrap().channel.name(), "a");

    let replacement = make_channel("a2", 10, false);
    router.update(vec![replacement], Vec::new());
    assert_eq!(router.resolve("/v1/x").unwrap().channel.name(), "a2");
    assert!(router.channel("a").is_none());
}
