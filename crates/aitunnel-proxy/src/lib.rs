pub mod engine;
pub mod prober;
pub mod upstream;

pub use engine::ProxyEngine;
pub use prober::HealthProber;
pub use upstream::UpstreamClient;
