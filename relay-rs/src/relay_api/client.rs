use crate::{
    types::{ProposerDuty, RawSignedValidatorRegistration},
    Error,
};
use beacon_api_client::{api_error_or_ok, mainnet::Client as BeaconApiClient};

/// A `Client` for a service implementing the relay APIs.
#[derive(Clone)]
pub struct Client {
    api: BeaconApiClient,
}

impl Client {
    pub fn new(api_client: BeaconApiClient) -> Self {
        Self { api: api_client }
    }

    pub async fn check_status(&self) -> Result<(), Error> {
        let response = self.api.http_get("/eth/v1/builder/status").await?;
        api_error_or_ok(response).await.map_err(From::from)
    }

    pub async fn register_validators(
        &self,
        registrations: &[RawSignedValidatorRegistration],
    ) -> Result<(), Error> {
        let response = self.api.http_post("/eth/v1/builder/validators", &registrations).await?;
        api_error_or_ok(response).await.map_err(From::from)
    }

    pub async fn get_proposer_duties(&self) -> Result<Vec<ProposerDuty>, Error> {
        self.api.get("/relay/v1/builder/validators").await.map_err(From::from)
    }
}
