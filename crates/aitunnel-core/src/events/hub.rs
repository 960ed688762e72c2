use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use time::OffsetDateTime;
use tokio::sync::broadcast;

use super::types::{Event, LOG_RING_CAPACITY, LogLevel, LogRecord};

/// Level-gated logger and topic fan-out, shared by the proxy, the prober
/// and the management API.
///
/// Emission never blocks a request: subscribers ride a bounded broadcast
/// channel and simply lag out when they fall behind, and the ring append
/// is a short synchronous critical section. Every log call is also a
/// published `log` event, so SSE subscribers see the same records the
/// snapshot endpoints serve.
#[derive(Clone)]
pub struct EventHub {
    inner: Arc<Inner>,
}

struct Inner {
    tx: broadcast::Sender<Event>,
    ring: Mutex<VecDeque<LogRecord>>,
    min_level: AtomicU8,
}

impl EventHub {
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer);
        Self {
            inner: Arc::new(Inner {
                tx,
                ring: Mutex::new(VecDeque::with_capacity(LOG_RING_CAPACITY)),
                min_level: AtomicU8::new(level_to_u8(LogLevel::Info)),
            }),
        }
    }

    /// Wildcard subscription: the receiver sees every event, any topic.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.tx.subscribe()
    }

    pub fn emit(&self, event: Event) {
        if let Event::Log(record) = &event {
            let mut ring = self
                .inner
                .ring
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if ring.len() == LOG_RING_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(record.clone());
        }
        // No receivers is fine; SSE clients come and go.
        let _ = self.inner.tx.send(event);
    }

    /// Snapshot of the most recent `n` log records, oldest first.
    pub fn recent(&self, n: usize) -> Vec<LogRecord> {
        let ring = self
            .inner
            .ring
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let skip = ring.len().saturating_sub(n);
        ring.iter().skip(skip).cloned().collect()
    }

    pub fn set_min_level(&self, level: LogLevel) {
        self.inner.min_level.store(level_to_u8(level), Ordering::Relaxed);
    }

    pub fn min_level(&self) -> LogLevel {
        level_from_u8(self.inner.min_level.load(Ordering::Relaxed))
    }

    pub fn log(&self, level: LogLevel, tag: &str, message: impl Into<String>) {
        if level < self.min_level() {
            return;
        }
        let message = message.into();
        match level {
            LogLevel::Debug => tracing::debug!(tag = %tag, "{message}"),
            LogLevel::Info => tracing::info!(tag = %tag, "{message}"),
            LogLevel::Warn => tracing::warn!(tag = %tag, "{message}"),
            LogLevel::Error => tracing::error!(tag = %tag, "{message}"),
        }
        self.emit(Event::Log(LogRecord {
            timestamp: OffsetDateTime::now_utc(),
            level,
            tag: tag.to_string(),
            message,
        }));
    }

    pub fn debug(&self, tag: &str, message: impl Into<String>) {
        self.log(LogLevel::Debug, tag, message);
    }

    pub fn info(&self, tag: &str, message: impl Into<String>) {
        self.log(LogLevel::Info, tag, message);
    }

    pub fn warn(&self, tag: &str, message: impl Into<String>) {
        self.log(LogLevel::Warn, tag, message);
    }

    pub fn error(&self, tag: &str, message: impl Into<String>) {
        self.log(LogLevel::Error, tag, message);
    }
}

fn level_to_u8(level: LogLevel) -> u8 {
    match level {
        LogLevel::Debug => 0,
        LogLevel::Info => 1,
        LogLevel::Warn => 2,
        LogLevel::Error => 3,
    }
}

fn level_from_u8(value: u8) -> LogLevel {
    match value {
        0 => LogLevel::Debug,
        1 => LogLevel::Info,
        2 => LogLevel::Warn,
        _ => LogLevel::Error,
    }
}
