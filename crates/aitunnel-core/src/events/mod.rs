mod hub;
mod types;

pub use hub::EventHub;
pub use types::{Event, HealthEvent, LogLevel, LogRecord, RequestEvent, RetryEvent};
