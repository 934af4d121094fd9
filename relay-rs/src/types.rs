use crate::serde::{as_hex, as_lenient_str, as_str, lenient};
use ethereum_consensus::primitives::{Epoch, ExecutionAddress, Slot};
use serde::{Deserialize, Serialize};

pub use ethereum_consensus::builder::{SignedValidatorRegistration, ValidatorRegistration};

/// Length in bytes of a compressed BLS public key.
pub const BLS_PUBLIC_KEY_LEN: usize = 48;
/// Length in bytes of a compressed BLS signature.
pub const BLS_SIGNATURE_LEN: usize = 96;

/// A validator registration as submitted by a proposer, before any validation.
///
/// Every field decodes leniently: a missing or undecodable value is left empty, so that a
/// single malformed entry is rejected on its own instead of failing the batch it arrived in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawSignedValidatorRegistration {
    #[serde(default, deserialize_with = "lenient")]
    pub message: Option<RawValidatorRegistration>,
    #[serde(default, with = "as_hex")]
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawValidatorRegistration {
    #[serde(default, deserialize_with = "lenient")]
    pub fee_recipient: Option<ExecutionAddress>,
    #[serde(default, with = "as_lenient_str")]
    pub gas_limit: Option<u64>,
    #[serde(default, with = "as_lenient_str")]
    pub timestamp: Option<u64>,
    #[serde(rename = "pubkey", default, with = "as_hex")]
    pub public_key: Vec<u8>,
}

impl From<&SignedValidatorRegistration> for RawSignedValidatorRegistration {
    fn from(registration: &SignedValidatorRegistration) -> Self {
        let message = &registration.message;
        Self {
            message: Some(RawValidatorRegistration {
                fee_recipient: Some(message.fee_recipient.clone()),
                gas_limit: Some(message.gas_limit),
                timestamp: Some(message.timestamp),
                public_key: message.public_key.to_vec(),
            }),
            signature: registration.signature.to_vec(),
        }
    }
}

/// The registration on file for the proposer of `slot`, if any.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposerDuty {
    #[serde(with = "as_str")]
    pub slot: Slot,
    pub entry: Option<SignedValidatorRegistration>,
}

/// Every [`ProposerDuty`] of one epoch, in the order the beacon node reported them.
///
/// A snapshot is never mutated once built; a newer epoch replaces it wholesale.
#[derive(Debug, Clone, Default)]
pub struct DutySnapshot {
    /// `None` until the first epoch has been computed.
    pub epoch: Option<Epoch>,
    pub duties: Vec<ProposerDuty>,
}

impl DutySnapshot {
    pub fn slot_range(&self) -> Option<(Slot, Slot)> {
        let first = self.duties.first()?;
        let last = self.duties.last()?;
        Some((first.slot, last.slot))
    }
}

/// Execution payload tagged with the fork it belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "version", content = "data", rename_all = "lowercase")]
pub enum VersionedExecutionPayload {
    Bellatrix(ethereum_consensus::bellatrix::mainnet::ExecutionPayload),
    Capella(ethereum_consensus::capella::mainnet::ExecutionPayload),
    Deneb(ethereum_consensus::deneb::mainnet::ExecutionPayload),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_registration_tolerates_bad_entries() {
        let input = r#"[
            {
                "message": {
                    "fee_recipient": "0xabcf8e0d4e9587369b2301d0790347320302cc09",
                    "gas_limit": "30000000",
                    "timestamp": "100",
                    "pubkey": "0x0102"
                },
                "signature": "0x03"
            },
            {
                "message": {
                    "fee_recipient": "0xabcf",
                    "gas_limit": 30000000,
                    "pubkey": "0x123"
                },
                "signature": null
            },
            { "message": "registration", "signature": "not hex" },
            {}
        ]"#;
        let registrations: Vec<RawSignedValidatorRegistration> =
            serde_json::from_str(input).unwrap();
        assert_eq!(registrations.len(), 4);

        let message = registrations[0].message.as_ref().unwrap();
        assert_eq!(message.public_key, vec![1, 2]);
        assert_eq!(message.timestamp, Some(100));
        assert_eq!(message.gas_limit, Some(30_000_000));
        assert!(message.fee_recipient.is_some());
        assert_eq!(registrations[0].signature, vec![3]);

        let message = registrations[1].message.as_ref().unwrap();
        assert!(message.public_key.is_empty());
        assert!(message.fee_recipient.is_none());
        assert_eq!(message.gas_limit, Some(30_000_000));
        assert_eq!(message.timestamp, None);
        assert!(registrations[1].signature.is_empty());

        assert!(registrations[2].message.is_none());
        assert!(registrations[2].signature.is_empty());
        assert!(registrations[3].message.is_none());
    }

    #[test]
    fn test_duty_serialization() {
        let duty = ProposerDuty { slot: 42, entry: None };
        let encoding = serde_json::to_value(&duty).unwrap();
        assert_eq!(encoding, serde_json::json!({ "slot": "42", "entry": null }));
    }

    #[test]
    fn test_versioned_payload_envelope() {
        let payload = VersionedExecutionPayload::Capella(Default::default());
        let encoding = serde_json::to_value(&payload).unwrap();
        assert_eq!(encoding["version"], "capella");
        assert!(encoding["data"].is_object());
        let recovered: VersionedExecutionPayload = serde_json::from_value(encoding).unwrap();
        assert_eq!(recovered, payload);
    }
}
