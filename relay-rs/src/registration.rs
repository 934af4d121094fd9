//! Validation of incoming validator registrations.
//!
//! Every registration in a batch is checked independently: a rejection is logged and
//! counted but never stops its siblings from being processed. Rejections are not reported
//! back to the proposer, so the API does not reveal which check an entry failed.
use crate::{
    signing::verify_signed_builder_message,
    types::{
        RawSignedValidatorRegistration, SignedValidatorRegistration, ValidatorRegistration,
        BLS_PUBLIC_KEY_LEN, BLS_SIGNATURE_LEN,
    },
    validator_registry, ValidatorRegistry,
};
use ethereum_consensus::primitives::{BlsPublicKey, BlsSignature, Domain};
use futures::stream::{self, StreamExt};
use std::{cmp::Ordering, sync::Arc};
use thiserror::Error;
use tracing::{error, trace, warn};

// Registrations may run slightly ahead of the local clock
const FUTURE_TIMESTAMP_TOLERANCE_SECS: u64 = 10;

#[derive(Debug, Error)]
pub enum Rejection {
    #[error("malformed registration: {0}")]
    Malformed(&'static str),
    #[error("local time is {1} but registration has timestamp from future: {0}")]
    FutureRegistration(u64, u64),
    #[error("unknown validator {0}")]
    UnknownValidator(BlsPublicKey),
    #[error("bad signature for validator {0}")]
    BadSignature(BlsPublicKey),
    #[error("could not store registration: {0}")]
    Storage(#[from] validator_registry::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Updated(BlsPublicKey),
    /// The registry already holds a registration at least as recent.
    Unchanged,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    pub num_registrations: usize,
    pub num_updated: usize,
    pub num_rejected: usize,
    /// Key of the updated registration latest in the batch.
    pub last_changed: Option<BlsPublicKey>,
}

enum ValidatorRegistrationStatus {
    New,
    Existing,
    Outdated,
}

fn determine_validator_registration_status(
    timestamp: u64,
    latest_timestamp: Option<u64>,
) -> ValidatorRegistrationStatus {
    let Some(latest_timestamp) = latest_timestamp else {
        return ValidatorRegistrationStatus::New
    };
    match timestamp.cmp(&latest_timestamp) {
        Ordering::Less => ValidatorRegistrationStatus::Outdated,
        Ordering::Equal => ValidatorRegistrationStatus::Existing,
        Ordering::Greater => ValidatorRegistrationStatus::New,
    }
}

/// Enforce lengths and encodings, yielding a typed registration.
pub fn validate_structure(
    registration: &RawSignedValidatorRegistration,
) -> Result<SignedValidatorRegistration, Rejection> {
    let message = registration.message.as_ref().ok_or(Rejection::Malformed("missing message"))?;
    if message.public_key.len() != BLS_PUBLIC_KEY_LEN {
        return Err(Rejection::Malformed("invalid public key length"))
    }
    if registration.signature.len() != BLS_SIGNATURE_LEN {
        return Err(Rejection::Malformed("invalid signature length"))
    }
    let public_key = BlsPublicKey::try_from(message.public_key.as_slice())
        .map_err(|_| Rejection::Malformed("invalid public key encoding"))?;
    let signature = BlsSignature::try_from(registration.signature.as_slice())
        .map_err(|_| Rejection::Malformed("invalid signature encoding"))?;
    let fee_recipient =
        message.fee_recipient.clone().ok_or(Rejection::Malformed("invalid fee recipient"))?;
    let gas_limit = message.gas_limit.ok_or(Rejection::Malformed("invalid gas limit"))?;
    let timestamp = message.timestamp.ok_or(Rejection::Malformed("invalid timestamp"))?;
    let message = ValidatorRegistration { fee_recipient, gas_limit, timestamp, public_key };
    Ok(SignedValidatorRegistration { message, signature })
}

fn validate_registration_is_not_from_future(
    message: &ValidatorRegistration,
    current_timestamp: u64,
) -> Result<(), Rejection> {
    let timestamp = message.timestamp;
    if timestamp > current_timestamp + FUTURE_TIMESTAMP_TOLERANCE_SECS {
        Err(Rejection::FutureRegistration(timestamp, current_timestamp))
    } else {
        Ok(())
    }
}

pub struct RegistrationValidator {
    registry: Arc<dyn ValidatorRegistry>,
    signing_domain: Domain,
    max_concurrency: usize,
}

impl RegistrationValidator {
    pub fn new(
        registry: Arc<dyn ValidatorRegistry>,
        signing_domain: Domain,
        max_concurrency: usize,
    ) -> Self {
        Self { registry, signing_domain, max_concurrency: max_concurrency.max(1) }
    }

    /// Validate a single registration and, if it is the newest valid one for its key,
    /// persist it.
    pub async fn process_registration(
        &self,
        registration: &RawSignedValidatorRegistration,
        current_timestamp: u64,
    ) -> Result<Outcome, Rejection> {
        let registration = validate_structure(registration)?;
        let message = &registration.message;
        let public_key = &message.public_key;

        validate_registration_is_not_from_future(message, current_timestamp)?;

        if !self.registry.is_known_validator(public_key).await {
            return Err(Rejection::UnknownValidator(public_key.clone()))
        }

        let latest_timestamp = match self.registry.get_registration_timestamp(public_key).await {
            Ok(timestamp) => timestamp,
            Err(err) => {
                warn!(%err, %public_key, "could not get latest registration timestamp");
                None
            }
        };
        let status = determine_validator_registration_status(message.timestamp, latest_timestamp);
        if !matches!(status, ValidatorRegistrationStatus::New) {
            return Ok(Outcome::Unchanged)
        }

        verify_signed_builder_message(
            message,
            &registration.signature,
            public_key,
            self.signing_domain,
        )
        .map_err(|_| Rejection::BadSignature(public_key.clone()))?;

        if self.registry.set_registration(&registration).await? {
            trace!(%public_key, "processed new registration");
            Ok(Outcome::Updated(public_key.clone()))
        } else {
            Ok(Outcome::Unchanged)
        }
    }

    /// Process every registration of a batch, with at most `max_concurrency` in flight.
    pub async fn process_registrations(
        &self,
        registrations: &[RawSignedValidatorRegistration],
        current_timestamp: u64,
    ) -> BatchSummary {
        let outcomes = stream::iter(registrations.iter().enumerate())
            .map(|(index, registration)| async move {
                (index, self.process_registration(registration, current_timestamp).await)
            })
            .buffer_unordered(self.max_concurrency)
            .collect::<Vec<_>>()
            .await;

        let mut summary =
            BatchSummary { num_registrations: registrations.len(), ..Default::default() };
        let mut last_changed_index = None;
        for (index, outcome) in outcomes {
            match outcome {
                Ok(Outcome::Updated(public_key)) => {
                    summary.num_updated += 1;
                    if last_changed_index.map_or(true, |last| index > last) {
                        last_changed_index = Some(index);
                        summary.last_changed = Some(public_key);
                    }
                }
                Ok(Outcome::Unchanged) => {}
                Err(err @ Rejection::Storage(..)) => {
                    summary.num_rejected += 1;
                    error!(%err, index, "error updating validator registration");
                }
                Err(err) => {
                    summary.num_rejected += 1;
                    warn!(%err, index, "rejected validator registration");
                }
            }
        }
        summary
    }
}
