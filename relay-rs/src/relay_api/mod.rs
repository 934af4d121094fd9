mod client;
mod server;

pub use client::Client;
pub use server::{RelayServer, Server};

use crate::{
    types::{DutySnapshot, RawSignedValidatorRegistration},
    Error,
};
use async_trait::async_trait;
use std::sync::Arc;

/// The proposer- and builder-facing operations served over HTTP.
#[async_trait]
pub trait RelayApi {
    /// Validate and store each registration independently.
    ///
    /// Individual rejections are not reported; an error means the batch as a whole could not
    /// be handled.
    async fn register_validators(
        &self,
        registrations: &[RawSignedValidatorRegistration],
    ) -> Result<(), Error>;

    async fn get_proposer_duties(&self) -> Result<Arc<DutySnapshot>, Error>;
}
