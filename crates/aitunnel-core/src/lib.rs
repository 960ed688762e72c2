pub mod channel;
pub mod events;
pub mod retry;
pub mod router;
pub mod state;

pub use channel::{Channel, ChannelStats, ChannelSummary, Health};
pub use events::{Event, EventHub, HealthEvent, LogLevel, LogRecord, RequestEvent, RetryEvent};
pub use retry::RetryPolicy;
pub use router::{Resolved, RouteGroup, Router};
pub use state::AppState;
