use ethereum_consensus::{
    builder::compute_builder_domain,
    crypto::SecretKey,
    primitives::{BlsPublicKey, BlsSignature, Domain, Version},
    signing::{sign_with_domain, verify_signed_data},
    ssz::prelude::SimpleSerialize,
    state_transition::Context,
    Error as ConsensusError,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid genesis fork version `{0}`: expected 4 bytes of hex")]
    InvalidForkVersion(String),
    #[error(transparent)]
    Consensus(#[from] ConsensusError),
}

fn parse_fork_version(input: &str) -> Result<Version, Error> {
    let encoding = input.strip_prefix("0x").unwrap_or(input);
    let bytes = hex::decode(encoding).map_err(|_| Error::InvalidForkVersion(input.to_string()))?;
    Version::try_from(bytes.as_slice()).map_err(|_| Error::InvalidForkVersion(input.to_string()))
}

/// Resolve the domain builder-API messages are signed under.
///
/// The domain only depends on the genesis fork version of the chain; if `genesis_fork_version`
/// is provided it takes precedence over the value carried by `context`.
pub fn compute_builder_signing_domain(
    genesis_fork_version: Option<&str>,
    context: &Context,
) -> Result<Domain, Error> {
    let domain = match genesis_fork_version {
        Some(genesis_fork_version) => {
            let mut context = context.clone();
            context.genesis_fork_version = parse_fork_version(genesis_fork_version)?;
            compute_builder_domain(&context)?
        }
        None => compute_builder_domain(context)?,
    };
    Ok(domain)
}

pub fn verify_signed_builder_message<T: SimpleSerialize>(
    message: &T,
    signature: &BlsSignature,
    public_key: &BlsPublicKey,
    domain: Domain,
) -> Result<(), Error> {
    verify_signed_data(message, signature, public_key, domain)?;
    Ok(())
}

pub fn sign_builder_message<T: SimpleSerialize>(
    message: &T,
    signing_key: &SecretKey,
    domain: Domain,
) -> Result<BlsSignature, Error> {
    let signature = sign_with_domain(message, signing_key, domain)?;
    Ok(signature)
}
