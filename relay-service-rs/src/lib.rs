mod relay;
mod service;

pub use relay::Relay;
pub use service::{spawn_relay, Config, Error, PayloadCacheConfig, Service, ServiceHandle};
