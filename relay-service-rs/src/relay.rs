use crate::Config;
use async_trait::async_trait;
use backoff::ExponentialBackoff;
use ethereum_consensus::{
    clock::get_current_unix_time_in_nanos,
    primitives::{Domain, Epoch, Slot},
};
use futures::StreamExt;
use relay_rs::{
    payload_cache,
    types::{DutySnapshot, RawSignedValidatorRegistration, VersionedExecutionPayload},
    BeaconNode, Error, PayloadCache, ProposerScheduler, RegistrationValidator, RelayApi,
    ValidatorRegistry,
};
use std::{ops::Deref, sync::Arc, time::Duration};
use tokio::{
    sync::watch,
    task::JoinSet,
    time::{interval_at, timeout, Instant, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

const NANOS_PER_SECOND: u128 = 1_000_000_000;

fn current_unix_time_in_secs() -> u64 {
    u64::try_from(get_current_unix_time_in_nanos() / NANOS_PER_SECOND).unwrap_or(u64::MAX)
}

#[derive(Clone)]
pub struct Relay(Arc<Inner>);

impl Deref for Relay {
    type Target = Inner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

pub struct Inner {
    beacon_node: Arc<dyn BeaconNode>,
    validator_registry: Arc<dyn ValidatorRegistry>,
    registration_validator: RegistrationValidator,
    proposer_scheduler: ProposerScheduler,
    payload_cache: PayloadCache,
    slots_per_epoch: u64,
    request_timeout: Duration,
    refresh_timeout: Duration,
}

impl Relay {
    pub fn new(
        beacon_node: Arc<dyn BeaconNode>,
        validator_registry: Arc<dyn ValidatorRegistry>,
        payload_cache: PayloadCache,
        signing_domain: Domain,
        slots_per_epoch: u64,
        config: &Config,
    ) -> Self {
        let registration_validator = RegistrationValidator::new(
            validator_registry.clone(),
            signing_domain,
            config.max_registration_concurrency,
        );
        let proposer_scheduler = ProposerScheduler::new(
            beacon_node.clone(),
            validator_registry.clone(),
            config.max_duty_lookup_concurrency,
        );
        let inner = Inner {
            beacon_node,
            validator_registry,
            registration_validator,
            proposer_scheduler,
            payload_cache,
            slots_per_epoch: slots_per_epoch.max(1),
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            refresh_timeout: Duration::from_millis(config.known_validator_refresh_timeout_ms),
        };
        Self(Arc::new(inner))
    }

    fn epoch_for(&self, slot: Slot) -> Epoch {
        slot / self.slots_per_epoch
    }

    /// Verify the beacon node is usable and load the state needed to serve requests.
    pub async fn initialize(&self) -> Result<(), Error> {
        let sync_status = self.beacon_node.get_sync_status().await?;
        if sync_status.is_syncing {
            return Err(Error::BeaconNodeSyncing)
        }
        self.refresh_known_validators().await?;
        let epoch = self.epoch_for(sync_status.head_slot);
        self.update_proposer_duties(epoch).await
    }

    pub async fn refresh_known_validators(&self) -> Result<usize, Error> {
        let refresh = self.validator_registry.refresh_known_validators();
        let count = timeout(self.refresh_timeout, refresh)
            .await
            .map_err(|_| Error::Timeout("refreshing known validators"))??;
        if count == 0 {
            warn!("loaded an empty set of known validators");
        } else {
            info!(count, "refreshed known validators");
        }
        Ok(count)
    }

    pub async fn update_proposer_duties(&self, epoch: Epoch) -> Result<(), Error> {
        let update = self.proposer_scheduler.update(epoch);
        timeout(self.request_timeout, update)
            .await
            .map_err(|_| Error::Timeout("updating proposer duties"))??;
        Ok(())
    }

    /// Recompute duties for the epoch of `slot` on a task in `updates` so the caller is never
    /// held up by the registry lookups.
    pub fn on_head_slot(&self, slot: Slot, updates: &mut JoinSet<()>) {
        let epoch = self.epoch_for(slot);
        debug!(slot, epoch, "observed new head");
        let relay = self.clone();
        updates.spawn(async move {
            if let Err(err) = relay.update_proposer_duties(epoch).await {
                error!(%err, epoch, "could not update proposer duties");
            }
        });
    }

    /// Follow new heads until `shutdown` fires, resubscribing whenever the stream ends.
    ///
    /// Returns once every update still in flight has been cancelled.
    pub async fn run_duty_updates(&self, mut shutdown: watch::Receiver<bool>) {
        let mut updates = JoinSet::new();
        self.follow_heads(&mut shutdown, &mut updates).await;
        updates.shutdown().await;
    }

    async fn follow_heads(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        updates: &mut JoinSet<()>,
    ) {
        loop {
            let subscribe = backoff::future::retry(
                ExponentialBackoff { max_elapsed_time: None, ..Default::default() },
                || async {
                    self.beacon_node.stream_head_slots().await.map_err(|err| {
                        warn!(%err, "could not subscribe to head events");
                        backoff::Error::transient(err)
                    })
                },
            );
            let mut head_slots = tokio::select! {
                head_slots = subscribe => match head_slots {
                    Ok(head_slots) => head_slots,
                    Err(err) => {
                        error!(%err, "giving up on head events");
                        return
                    }
                },
                _ = shutdown.changed() => return,
            };
            debug!("subscribed to head events");

            loop {
                tokio::select! {
                    slot = head_slots.next() => match slot {
                        Some(slot) => self.on_head_slot(slot, updates),
                        None => {
                            warn!("head event stream ended; resubscribing");
                            break
                        }
                    },
                    Some(_) = updates.join_next(), if !updates.is_empty() => {}
                    _ = shutdown.changed() => return,
                }
            }
        }
    }

    /// Refresh the known-validator set every `period` until `shutdown` fires.
    pub async fn run_known_validator_updates(
        &self,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        // the set was loaded during initialization
        let mut ticks = interval_at(Instant::now() + period, period);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticks.tick() => {
                    if let Err(err) = self.refresh_known_validators().await {
                        error!(%err, "could not refresh known validators");
                    }
                }
                _ = shutdown.changed() => return,
            }
        }
    }

    /// Cache `payload` for later retrieval; backend failures are logged and ignored.
    pub async fn cache_payload(
        &self,
        slot: Slot,
        proposer_public_key: &str,
        block_hash: &str,
        payload: &VersionedExecutionPayload,
    ) -> Result<(), Error> {
        match self.payload_cache.put(slot, proposer_public_key, block_hash, payload).await {
            Ok(()) => Ok(()),
            Err(err @ payload_cache::Error::InvalidKeyComponent(..)) => Err(err.into()),
            Err(err) => {
                warn!(%err, slot, "could not cache payload");
                Ok(())
            }
        }
    }

    /// Fetch a cached payload; an unusable cache reads as a miss.
    pub async fn get_cached_payload(
        &self,
        slot: Slot,
        proposer_public_key: &str,
        block_hash: &str,
    ) -> Result<Option<VersionedExecutionPayload>, Error> {
        match self.payload_cache.get(slot, proposer_public_key, block_hash).await {
            Ok(payload) => Ok(payload),
            Err(err @ payload_cache::Error::InvalidKeyComponent(..)) => Err(err.into()),
            Err(err) => {
                warn!(%err, slot, "could not read payload cache");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl RelayApi for Relay {
    async fn register_validators(
        &self,
        registrations: &[RawSignedValidatorRegistration],
    ) -> Result<(), Error> {
        let start = Instant::now();
        let current_timestamp = current_unix_time_in_secs();
        let summary = self
            .registration_validator
            .process_registrations(registrations, current_timestamp)
            .await;
        let last_changed = summary.last_changed.as_ref().map(ToString::to_string);
        info!(
            num_registrations = summary.num_registrations,
            num_updated = summary.num_updated,
            num_rejected = summary.num_rejected,
            last_changed = last_changed.as_deref().unwrap_or("none"),
            elapsed = ?start.elapsed(),
            "processed validator registrations"
        );
        Ok(())
    }

    async fn get_proposer_duties(&self) -> Result<Arc<DutySnapshot>, Error> {
        Ok(self.proposer_scheduler.snapshot())
    }
}
