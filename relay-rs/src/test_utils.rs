//! Deterministic keys and in-memory collaborators for tests.
use crate::{
    beacon_node::{self, ProposerAssignment, SyncStatus},
    signing::{compute_builder_signing_domain, sign_builder_message},
    types::{RawSignedValidatorRegistration, SignedValidatorRegistration, ValidatorRegistration},
    validator_registry, BeaconNode, ValidatorRegistry,
};
use async_trait::async_trait;
use ethereum_consensus::{
    crypto::SecretKey,
    primitives::{BlsPublicKey, Domain, Epoch, Slot},
    state_transition::Context,
};
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};
use tokio::sync::mpsc;

pub const TEST_GAS_LIMIT: u64 = 30_000_000;

/// The signing key of the test validator at `index`.
pub fn secret_key_for(index: u8) -> SecretKey {
    let bytes = [index.wrapping_add(1); 32];
    SecretKey::try_from(bytes.as_slice()).unwrap()
}

pub fn public_key_for(index: u8) -> BlsPublicKey {
    secret_key_for(index).public_key()
}

pub fn test_context() -> Context {
    Context::for_mainnet()
}

pub fn test_signing_domain() -> Domain {
    compute_builder_signing_domain(None, &test_context()).unwrap()
}

/// A registration for the test validator at `index`, signed under `domain`.
pub fn signed_registration(
    index: u8,
    timestamp: u64,
    domain: Domain,
) -> SignedValidatorRegistration {
    let signing_key = secret_key_for(index);
    let message = ValidatorRegistration {
        gas_limit: TEST_GAS_LIMIT,
        timestamp,
        public_key: signing_key.public_key(),
        ..Default::default()
    };
    let signature = sign_builder_message(&message, &signing_key, domain).unwrap();
    SignedValidatorRegistration { message, signature }
}

/// A correctly signed registration in the form it arrives over the wire.
pub fn raw_registration(index: u8, timestamp: u64) -> RawSignedValidatorRegistration {
    let registration = signed_registration(index, timestamp, test_signing_domain());
    RawSignedValidatorRegistration::from(&registration)
}

#[derive(Default)]
struct BeaconState {
    sync_status: Option<SyncStatus>,
    validators: Vec<BlsPublicKey>,
    validators_delay: Option<Duration>,
    duties: HashMap<Epoch, Vec<ProposerAssignment>>,
    duty_requests: usize,
    head_subscribers: Vec<mpsc::UnboundedSender<Slot>>,
    unavailable: bool,
}

/// A [`BeaconNode`] whose answers are set by the test.
#[derive(Default)]
pub struct MockBeaconNode {
    state: Mutex<BeaconState>,
}

impl MockBeaconNode {
    pub fn set_validators(&self, validators: Vec<BlsPublicKey>) {
        self.state.lock().validators = validators;
    }

    /// Delay every load of the validator set by `delay`.
    pub fn delay_validators(&self, delay: Duration) {
        self.state.lock().validators_delay = Some(delay);
    }

    pub fn set_duties(&self, epoch: Epoch, duties: Vec<ProposerAssignment>) {
        self.state.lock().duties.insert(epoch, duties);
    }

    pub fn set_sync_status(&self, sync_status: SyncStatus) {
        self.state.lock().sync_status = Some(sync_status);
    }

    /// Fail every request until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// Number of proposer duty requests served so far.
    pub fn duty_requests(&self) -> usize {
        self.state.lock().duty_requests
    }

    pub fn head_subscriber_count(&self) -> usize {
        let mut state = self.state.lock();
        state.head_subscribers.retain(|subscriber| !subscriber.is_closed());
        state.head_subscribers.len()
    }

    /// Publish a new head to every open stream.
    pub fn publish_head(&self, slot: Slot) {
        self.state.lock().head_subscribers.retain(|subscriber| subscriber.send(slot).is_ok());
    }

    /// End every open head stream, as a beacon node restart would.
    pub fn close_head_streams(&self) {
        self.state.lock().head_subscribers.clear();
    }

    fn check_available(state: &BeaconState) -> Result<(), beacon_node::Error> {
        if state.unavailable {
            Err(beacon_node::Error::Unavailable("mock beacon node is down".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BeaconNode for MockBeaconNode {
    async fn get_sync_status(&self) -> Result<SyncStatus, beacon_node::Error> {
        let state = self.state.lock();
        Self::check_available(&state)?;
        Ok(state.sync_status.unwrap_or(SyncStatus { head_slot: 0, is_syncing: false }))
    }

    async fn get_proposer_duties(
        &self,
        epoch: Epoch,
    ) -> Result<Vec<ProposerAssignment>, beacon_node::Error> {
        let mut state = self.state.lock();
        Self::check_available(&state)?;
        state.duty_requests += 1;
        Ok(state.duties.get(&epoch).cloned().unwrap_or_default())
    }

    async fn get_registrable_validators(&self) -> Result<Vec<BlsPublicKey>, beacon_node::Error> {
        let delay = self.state.lock().validators_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let state = self.state.lock();
        Self::check_available(&state)?;
        Ok(state.validators.clone())
    }

    async fn stream_head_slots(&self) -> Result<BoxStream<'static, Slot>, beacon_node::Error> {
        let mut state = self.state.lock();
        Self::check_available(&state)?;
        let (sender, receiver) = mpsc::unbounded_channel();
        state.head_subscribers.push(sender);
        let slots = stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|slot| (slot, receiver))
        });
        Ok(slots.boxed())
    }
}

#[derive(Default)]
struct RegistryState {
    known_validators: HashSet<BlsPublicKey>,
    registrations: HashMap<BlsPublicKey, SignedValidatorRegistration>,
    lookup_delays: HashMap<BlsPublicKey, Duration>,
    failing_lookups: HashSet<BlsPublicKey>,
    failing_writes: HashSet<BlsPublicKey>,
    lookup_failures: usize,
}

/// A [`ValidatorRegistry`] with injectable latency and failures.
#[derive(Default)]
pub struct MockValidatorRegistry {
    state: Mutex<RegistryState>,
}

impl MockValidatorRegistry {
    pub fn insert_known(&self, public_key: BlsPublicKey) {
        self.state.lock().known_validators.insert(public_key);
    }

    /// Store `registration` directly, marking its validator as known.
    pub fn insert_registration(&self, registration: SignedValidatorRegistration) {
        let mut state = self.state.lock();
        let public_key = registration.message.public_key.clone();
        state.known_validators.insert(public_key.clone());
        state.registrations.insert(public_key, registration);
    }

    pub fn delay_lookups_for(&self, public_key: BlsPublicKey, delay: Duration) {
        self.state.lock().lookup_delays.insert(public_key, delay);
    }

    pub fn fail_lookups_for(&self, public_key: BlsPublicKey) {
        self.state.lock().failing_lookups.insert(public_key);
    }

    /// Let every lookup and write succeed again.
    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.failing_lookups.clear();
        state.failing_writes.clear();
    }

    /// Number of lookups failed so far.
    pub fn lookup_failures(&self) -> usize {
        self.state.lock().lookup_failures
    }

    pub fn fail_writes_for(&self, public_key: BlsPublicKey) {
        self.state.lock().failing_writes.insert(public_key);
    }

    async fn lookup<T>(
        &self,
        public_key: &BlsPublicKey,
        f: impl FnOnce(&RegistryState) -> T,
    ) -> Result<T, validator_registry::Error> {
        let delay = self.state.lock().lookup_delays.get(public_key).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        if state.failing_lookups.contains(public_key) {
            state.lookup_failures += 1;
            return Err(validator_registry::Error::Unavailable(format!(
                "lookup of {public_key} failed"
            )))
        }
        Ok(f(&state))
    }
}

#[async_trait]
impl ValidatorRegistry for MockValidatorRegistry {
    async fn is_known_validator(&self, public_key: &BlsPublicKey) -> bool {
        self.state.lock().known_validators.contains(public_key)
    }

    async fn get_registration(
        &self,
        public_key: &BlsPublicKey,
    ) -> Result<Option<SignedValidatorRegistration>, validator_registry::Error> {
        self.lookup(public_key, |state| state.registrations.get(public_key).cloned()).await
    }

    async fn get_registration_timestamp(
        &self,
        public_key: &BlsPublicKey,
    ) -> Result<Option<u64>, validator_registry::Error> {
        self.lookup(public_key, |state| {
            state.registrations.get(public_key).map(|registration| registration.message.timestamp)
        })
        .await
    }

    async fn set_registration(
        &self,
        registration: &SignedValidatorRegistration,
    ) -> Result<bool, validator_registry::Error> {
        let mut state = self.state.lock();
        let public_key = &registration.message.public_key;
        if state.failing_writes.contains(public_key) {
            return Err(validator_registry::Error::Unavailable(format!(
                "write for {public_key} failed"
            )))
        }
        let is_newer = state.registrations.get(public_key).map_or(true, |existing| {
            existing.message.timestamp < registration.message.timestamp
        });
        if is_newer {
            state.registrations.insert(public_key.clone(), registration.clone());
        }
        Ok(is_newer)
    }

    async fn refresh_known_validators(&self) -> Result<usize, validator_registry::Error> {
        Ok(self.state.lock().known_validators.len())
    }
}
