//! Management API: read-only status/stats, channel mutations, and the SSE
//! log stream consumed by the Web UI.

mod router;
mod sse;

pub use router::{AdminState, router};
