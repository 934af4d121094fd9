pub mod beacon_node;
pub mod config;
mod error;
mod network;
pub mod payload_cache;
pub mod proposer_scheduler;
pub mod registration;
pub mod relay_api;
pub mod serde;
pub mod signing;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;
pub mod validator_registry;

pub use beacon_node::BeaconNode;
pub use error::Error;
pub use network::*;
pub use payload_cache::PayloadCache;
pub use proposer_scheduler::ProposerScheduler;
pub use registration::RegistrationValidator;
pub use relay_api::RelayApi;
pub use validator_registry::ValidatorRegistry;
