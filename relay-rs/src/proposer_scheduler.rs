use crate::{
    beacon_node::{self, ProposerAssignment},
    types::{DutySnapshot, ProposerDuty},
    validator_registry, BeaconNode, ValidatorRegistry,
};
use ethereum_consensus::primitives::{BlsPublicKey, Epoch, Slot};
use futures::stream::{self, StreamExt, TryStreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum Error {
    #[error("could not fetch proposer duties: {0}")]
    BeaconNode(#[from] beacon_node::Error),
    #[error("could not look up registration of proposer {public_key} for slot {slot}: {source}")]
    Registry {
        slot: Slot,
        public_key: BlsPublicKey,
        #[source]
        source: validator_registry::Error,
    },
    #[error("beacon node returned no proposer duties for epoch {0}")]
    NoDuties(Epoch),
}

/// Tracks which registration is on file for each proposer of the current epoch.
///
/// Readers get a shared handle to an immutable [`DutySnapshot`]; `update` publishes a
/// fully built replacement or nothing at all.
pub struct ProposerScheduler {
    beacon_node: Arc<dyn BeaconNode>,
    registry: Arc<dyn ValidatorRegistry>,
    max_concurrency: usize,
    snapshot: RwLock<Arc<DutySnapshot>>,
}

impl ProposerScheduler {
    pub fn new(
        beacon_node: Arc<dyn BeaconNode>,
        registry: Arc<dyn ValidatorRegistry>,
        max_concurrency: usize,
    ) -> Self {
        Self {
            beacon_node,
            registry,
            max_concurrency: max_concurrency.max(1),
            snapshot: Default::default(),
        }
    }

    pub fn snapshot(&self) -> Arc<DutySnapshot> {
        self.snapshot.read().clone()
    }

    pub fn current_epoch(&self) -> Option<Epoch> {
        self.snapshot.read().epoch
    }

    fn is_current_or_newer(&self, epoch: Epoch) -> bool {
        matches!(self.current_epoch(), Some(current) if current >= epoch)
    }

    /// Recompute the duties of `epoch` and publish them.
    ///
    /// Duties are computed once per epoch; asking again for the current epoch, or for one
    /// older than it, leaves the published snapshot untouched.
    pub async fn update(&self, epoch: Epoch) -> Result<(), Error> {
        if self.is_current_or_newer(epoch) {
            return Ok(())
        }

        let assignments = self.beacon_node.get_proposer_duties(epoch).await?;
        if assignments.is_empty() {
            return Err(Error::NoDuties(epoch))
        }
        let duties = self.fetch_registrations(assignments).await?;
        let snapshot = Arc::new(DutySnapshot { epoch: Some(epoch), duties });

        let mut current = self.snapshot.write();
        if matches!(current.epoch, Some(published) if published >= epoch) {
            debug!(epoch, "discarding proposer duties older than the current snapshot");
            return Ok(())
        }
        if let Some((first_slot, last_slot)) = snapshot.slot_range() {
            info!(epoch, first_slot, last_slot, "updated proposer duties");
        }
        *current = snapshot;
        Ok(())
    }

    async fn fetch_registrations(
        &self,
        assignments: Vec<ProposerAssignment>,
    ) -> Result<Vec<ProposerDuty>, Error> {
        let count = assignments.len();
        let lookups = stream::iter(assignments.into_iter().enumerate())
            .map(|(index, ProposerAssignment { slot, public_key })| async move {
                match self.registry.get_registration(&public_key).await {
                    Ok(entry) => Ok((index, ProposerDuty { slot, entry })),
                    Err(source) => Err(Error::Registry { slot, public_key, source }),
                }
            })
            .buffer_unordered(self.max_concurrency);
        futures::pin_mut!(lookups);

        // lookups complete in any order, so reassemble by position
        let mut duties = vec![None; count];
        while let Some((index, duty)) = lookups.try_next().await? {
            duties[index] = Some(duty);
        }
        Ok(duties.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        public_key_for, signed_registration, test_signing_domain, MockBeaconNode,
        MockValidatorRegistry,
    };
    use std::time::Duration;

    const EPOCH: Epoch = 3;

    fn setup(
        slots: &[(Slot, u8)],
    ) -> (Arc<MockBeaconNode>, Arc<MockValidatorRegistry>, ProposerScheduler) {
        let beacon_node = Arc::new(MockBeaconNode::default());
        beacon_node.set_duties(
            EPOCH,
            slots
                .iter()
                .map(|&(slot, index)| ProposerAssignment { slot, public_key: public_key_for(index) })
                .collect(),
        );
        let registry = Arc::new(MockValidatorRegistry::default());
        let scheduler = ProposerScheduler::new(beacon_node.clone(), registry.clone(), 8);
        (beacon_node, registry, scheduler)
    }

    #[tokio::test]
    async fn test_update_preserves_duty_order() {
        let (_, registry, scheduler) = setup(&[(10, 0), (11, 1), (12, 2)]);
        let domain = test_signing_domain();
        for index in 0..3 {
            registry.insert_registration(signed_registration(index, 100, domain));
        }
        // lookups finish as B, C, then A
        registry.delay_lookups_for(public_key_for(0), Duration::from_millis(60));
        registry.delay_lookups_for(public_key_for(1), Duration::from_millis(10));
        registry.delay_lookups_for(public_key_for(2), Duration::from_millis(30));

        scheduler.update(EPOCH).await.unwrap();

        let snapshot = scheduler.snapshot();
        assert_eq!(snapshot.epoch, Some(EPOCH));
        let slots = snapshot.duties.iter().map(|duty| duty.slot).collect::<Vec<_>>();
        assert_eq!(slots, vec![10, 11, 12]);
        for (index, duty) in snapshot.duties.iter().enumerate() {
            let entry = duty.entry.as_ref().unwrap();
            assert_eq!(entry.message.public_key, public_key_for(index as u8));
        }
    }

    #[tokio::test]
    async fn test_update_is_idempotent_per_epoch() {
        let (beacon_node, _, scheduler) = setup(&[(10, 0)]);
        scheduler.update(EPOCH).await.unwrap();
        let first = scheduler.snapshot();

        scheduler.update(EPOCH).await.unwrap();
        let second = scheduler.snapshot();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(beacon_node.duty_requests(), 1);
    }

    #[tokio::test]
    async fn test_missing_registrations_are_empty_entries() {
        let (_, registry, scheduler) = setup(&[(10, 0), (11, 1)]);
        registry.insert_registration(signed_registration(1, 100, test_signing_domain()));
        scheduler.update(EPOCH).await.unwrap();

        let snapshot = scheduler.snapshot();
        assert!(snapshot.duties[0].entry.is_none());
        assert!(snapshot.duties[1].entry.is_some());
    }

    #[tokio::test]
    async fn test_failed_lookup_keeps_previous_snapshot() {
        let (beacon_node, registry, scheduler) = setup(&[(10, 0), (11, 1)]);
        scheduler.update(EPOCH).await.unwrap();
        let previous = scheduler.snapshot();

        beacon_node.set_duties(
            EPOCH + 1,
            vec![
                ProposerAssignment { slot: 13, public_key: public_key_for(2) },
                ProposerAssignment { slot: 14, public_key: public_key_for(3) },
            ],
        );
        registry.fail_lookups_for(public_key_for(3));
        let result = scheduler.update(EPOCH + 1).await;
        assert!(matches!(result, Err(Error::Registry { slot: 14, .. })));
        assert!(Arc::ptr_eq(&previous, &scheduler.snapshot()));
        assert_eq!(scheduler.current_epoch(), Some(EPOCH));
    }

    #[tokio::test]
    async fn test_empty_duties_are_an_error() {
        let (_, _, scheduler) = setup(&[]);
        let result = scheduler.update(EPOCH).await;
        assert!(matches!(result, Err(Error::NoDuties(EPOCH))));
        assert_eq!(scheduler.current_epoch(), None);
    }

    #[tokio::test]
    async fn test_snapshot_never_regresses() {
        let (beacon_node, _, scheduler) = setup(&[(10, 0)]);
        beacon_node.set_duties(
            EPOCH + 1,
            vec![ProposerAssignment { slot: 42, public_key: public_key_for(1) }],
        );
        scheduler.update(EPOCH + 1).await.unwrap();
        scheduler.update(EPOCH).await.unwrap();
        assert_eq!(scheduler.current_epoch(), Some(EPOCH + 1));
        assert_eq!(scheduler.snapshot().duties[0].slot, 42);
    }

    #[tokio::test]
    async fn test_readers_never_observe_partial_snapshot() {
        let (beacon_node, registry, scheduler) = setup(&[(10, 0), (11, 1), (12, 2)]);
        scheduler.update(EPOCH).await.unwrap();

        beacon_node.set_duties(
            EPOCH + 1,
            (0..3)
                .map(|index| ProposerAssignment {
                    slot: 20 + index as Slot,
                    public_key: public_key_for(index),
                })
                .collect(),
        );
        for index in 0..3 {
            registry.delay_lookups_for(public_key_for(index), Duration::from_millis(5));
        }

        let scheduler = Arc::new(scheduler);
        let reader = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move {
                for _ in 0..200 {
                    let snapshot = scheduler.snapshot();
                    let slots = snapshot.duties.iter().map(|duty| duty.slot).collect::<Vec<_>>();
                    match snapshot.epoch {
                        Some(EPOCH) => assert_eq!(slots, vec![10, 11, 12]),
                        Some(epoch) if epoch == EPOCH + 1 => assert_eq!(slots, vec![20, 21, 22]),
                        other => panic!("unexpected epoch {other:?}"),
                    }
                    tokio::task::yield_now().await;
                }
            })
        };
        scheduler.update(EPOCH + 1).await.unwrap();
        reader.await.unwrap();
        assert_eq!(scheduler.current_epoch(), Some(EPOCH + 1));
    }
}
