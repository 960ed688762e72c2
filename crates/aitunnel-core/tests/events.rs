use std::time::Duration;

use tokio::time::timeout;

use aitunnel_core::events::{Event, EventHub, LogLevel};

#[tokio::test]
async fn log_calls_publish_log_events() {
    let hub = EventHub::new(16);
    let mut rx = hub.subscribe();

    hub.info("proxy", "request started");

    let event = timeout(Duration::from_millis(200), rx.recv())
        .await
        .unwrap()
        .unwrap();
    let Event::Log(record) = event else {
        panic!("expected log event");
    };
    assert_eq!(record.level, LogLevel::Info);
    assert_eq!(record.tag, "proxy");
    assert_eq!(record.message, "request started");
}

#[tokio::test]
async fn min_level_gates_emission() {
    let hub = EventHub::new(16);
    hub.set_min_level(LogLevel::Warn);
    let mut rx = hub.subscribe();

    hub.debug("proxy", "dropped");
    hub.info("proxy", "dropped");
    hub.error("proxy", "kept");

    let event = timeout(Duration::from_millis(200), rx.recv())
        .await
        .unwrap()
        .unwrap();
    let Event::Log(record) = event else {
        panic!("expected log event");
    };
    assert_eq!(record.message, "kept");
    assert_eq!(hub.recent(10).len(), 1);
}

#[tokio::test]
async fn ring_keeps_most_recent_entries() {
    let hub = EventHub::new(16);
    for i in 0..250 {
        hub.info("ring", format!("entry {i}"));
    }
    let recent = hub.recent(200);
    assert_eq!(recent.len(), 200);
    assert_eq!(recent.first().unwrap().message, "entry 50");
    assert_eq!(recent.last().unwrap().message, "entry 249");

    let tail = hub.recent(5);
    assert_eq!(tail.len(), 5);
    assert_eq!(tail.first().unwrap().message, "entry 245");
}

#[tokio::test]
async fn a_lagging_subscriber_does_not_poison_the_hub() {
    let hub = EventHub::new(4);
    // This receiver never polls and overflows its buffer.
    let mut lagging = hub.subscribe();
    for i in 0..32 {
        hub.info("burst", format!("{i}"));
    }

    // A fresh subscriber still sees new events.
    let mut rx = hub.subscribe();
    hub.info("after", "still alive");
    let event = timeout(Duration::from_millis(200), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.topic(), "log");

    // The lagging receiver reports a lag error, not a wedged channel.
    assert!(matches!(
        lagging.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Lagged(_))
    ));
}

#[tokio::test]
async fn every_topic_reaches_wildcard_subscribers() {
    let hub = EventHub::new(16);
    let mut rx = hub.subscribe();

    hub.emit(Event::ConfigReloadRequest);
    let event = timeout(Duration::from_millis(200), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.topic(), "config_reload_request");

    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["topic"], "config_reload_request");
}
