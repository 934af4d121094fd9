use crate::{beacon_node, types::SignedValidatorRegistration, BeaconNode};
use async_trait::async_trait;
use ethereum_consensus::primitives::BlsPublicKey;
use parking_lot::RwLock;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Error)]
pub enum Error {
    #[error("could not load validator set: {0}")]
    BeaconNode(#[from] beacon_node::Error),
    #[error("registry unavailable: {0}")]
    Unavailable(String),
}

/// Durable view of the validators known to the relay and their latest registrations.
#[async_trait]
pub trait ValidatorRegistry: Send + Sync {
    /// Whether `public_key` belongs to the last loaded set of registrable validators.
    async fn is_known_validator(&self, public_key: &BlsPublicKey) -> bool;

    async fn get_registration(
        &self,
        public_key: &BlsPublicKey,
    ) -> Result<Option<SignedValidatorRegistration>, Error>;

    async fn get_registration_timestamp(
        &self,
        public_key: &BlsPublicKey,
    ) -> Result<Option<u64>, Error>;

    /// Store `registration` if it is newer than the one on file.
    ///
    /// Returns whether the registration was written.
    async fn set_registration(&self, registration: &SignedValidatorRegistration)
        -> Result<bool, Error>;

    /// Reload the known-validator set, returning its new size.
    async fn refresh_known_validators(&self) -> Result<usize, Error>;
}

#[derive(Default, Debug)]
struct State {
    // data from consensus
    known_validators: HashSet<BlsPublicKey>,
    // data from registered validators
    registrations: HashMap<BlsPublicKey, SignedValidatorRegistration>,
}

impl State {
    // Keeps only the registration with the highest timestamp for each key
    fn insert_if_newer(&mut self, registration: &SignedValidatorRegistration) -> bool {
        let public_key = &registration.message.public_key;
        let timestamp = registration.message.timestamp;
        let is_newer = self
            .registrations
            .get(public_key)
            .map_or(true, |existing| existing.message.timestamp < timestamp);
        if is_newer {
            self.registrations.insert(public_key.clone(), registration.clone());
        }
        is_newer
    }
}

/// A [`ValidatorRegistry`] held in process memory, loading the known-validator set from a
/// beacon node.
pub struct InMemoryValidatorRegistry {
    beacon_node: Arc<dyn BeaconNode>,
    state: RwLock<State>,
}

impl InMemoryValidatorRegistry {
    pub fn new(beacon_node: Arc<dyn BeaconNode>) -> Self {
        Self { beacon_node, state: Default::default() }
    }

    pub fn registered_validators_count(&self) -> usize {
        self.state.read().registrations.len()
    }
}

#[async_trait]
impl ValidatorRegistry for InMemoryValidatorRegistry {
    async fn is_known_validator(&self, public_key: &BlsPublicKey) -> bool {
        self.state.read().known_validators.contains(public_key)
    }

    async fn get_registration(
        &self,
        public_key: &BlsPublicKey,
    ) -> Result<Option<SignedValidatorRegistration>, Error> {
        Ok(self.state.read().registrations.get(public_key).cloned())
    }

    async fn get_registration_timestamp(
        &self,
        public_key: &BlsPublicKey,
    ) -> Result<Option<u64>, Error> {
        let state = self.state.read();
        Ok(state.registrations.get(public_key).map(|registration| registration.message.timestamp))
    }

    async fn set_registration(
        &self,
        registration: &SignedValidatorRegistration,
    ) -> Result<bool, Error> {
        let updated = self.state.write().insert_if_newer(registration);
        if updated {
            trace!(public_key = %registration.message.public_key, "stored registration");
        }
        Ok(updated)
    }

    async fn refresh_known_validators(&self) -> Result<usize, Error> {
        let public_keys = self.beacon_node.get_registrable_validators().await?;
        let known_validators = HashSet::from_iter(public_keys);
        let count = known_validators.len();
        self.state.write().known_validators = known_validators;
        debug!(
            known = count,
            registered = self.registered_validators_count(),
            "loaded known validators"
        );
        Ok(count)
    }
}
