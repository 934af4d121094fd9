//! The consensus-layer capabilities the relay depends on.
use crate::serde::as_str;
use async_trait::async_trait;
use beacon_api_client::{
    mainnet::Client, Error as ApiError, StateId, Topic, ValidatorStatus, ValidatorSummary,
};
use ethereum_consensus::primitives::{BlsPublicKey, Epoch, Slot};
use futures::stream::{BoxStream, StreamExt};
use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("beacon node unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncStatus {
    pub head_slot: Slot,
    pub is_syncing: bool,
}

/// The proposer scheduled for `slot`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposerAssignment {
    pub slot: Slot,
    pub public_key: BlsPublicKey,
}

#[async_trait]
pub trait BeaconNode: Send + Sync {
    async fn get_sync_status(&self) -> Result<SyncStatus, Error>;

    /// Proposer assignments for every slot of `epoch`, ordered by slot.
    async fn get_proposer_duties(&self, epoch: Epoch) -> Result<Vec<ProposerAssignment>, Error>;

    /// Public keys of every validator in the head state that may register with a relay.
    async fn get_registrable_validators(&self) -> Result<Vec<BlsPublicKey>, Error>;

    /// Slots of new chain heads, as the beacon node observes them.
    async fn stream_head_slots(&self) -> Result<BoxStream<'static, Slot>, Error>;
}

// pending validators may register ahead of activation
fn is_registrable(status: ValidatorStatus) -> bool {
    matches!(
        status,
        ValidatorStatus::PendingInitialized |
            ValidatorStatus::PendingQueued |
            ValidatorStatus::ActiveOngoing |
            ValidatorStatus::ActiveExiting
    )
}

struct HeadTopic;

impl Topic for HeadTopic {
    const NAME: &'static str = "head";

    type Data = HeadEvent;
}

#[derive(Debug, Deserialize)]
struct HeadEvent {
    #[serde(with = "as_str")]
    slot: Slot,
}

#[async_trait]
impl BeaconNode for Client {
    async fn get_sync_status(&self) -> Result<SyncStatus, Error> {
        let status = Client::get_sync_status(self).await?;
        Ok(SyncStatus { head_slot: status.head_slot, is_syncing: status.is_syncing })
    }

    async fn get_proposer_duties(&self, epoch: Epoch) -> Result<Vec<ProposerAssignment>, Error> {
        // TODO be tolerant to re-orgs by tracking the dependent root
        let (_dependent_root, duties) = Client::get_proposer_duties(self, epoch).await?;
        let assignments = duties
            .into_iter()
            .map(|duty| ProposerAssignment { slot: duty.slot, public_key: duty.public_key })
            .collect();
        Ok(assignments)
    }

    async fn get_registrable_validators(&self) -> Result<Vec<BlsPublicKey>, Error> {
        let summaries = self.get_validators(StateId::Head, &[], &[]).await?;
        let public_keys = summaries
            .into_iter()
            .filter(|summary: &ValidatorSummary| is_registrable(summary.status))
            .map(|summary| summary.validator.public_key)
            .collect();
        Ok(public_keys)
    }

    async fn stream_head_slots(&self) -> Result<BoxStream<'static, Slot>, Error> {
        let events = self.get_events::<HeadTopic>().await?;
        let slots = events.filter_map(|event| async move {
            match event {
                Ok(event) => Some(event.slot),
                Err(err) => {
                    warn!(%err, "could not decode head event");
                    None
                }
            }
        });
        Ok(slots.boxed())
    }
}
