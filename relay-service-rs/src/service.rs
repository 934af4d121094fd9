use crate::relay::Relay;
use beacon_api_client::mainnet::Client;
use ethereum_consensus::state_transition::Context;
use relay_rs::{
    payload_cache::{self, CacheBackend, MemcachedCache, MemoryCache, DEFAULT_KEY_PREFIX},
    relay_api::Server,
    signing::compute_builder_signing_domain,
    validator_registry::InMemoryValidatorRegistry,
    Network, PayloadCache,
};
use serde::Deserialize;
use std::{
    future::Future,
    net::{Ipv4Addr, SocketAddr},
    pin::Pin,
    sync::Arc,
    task::Poll,
    time::Duration,
};
use thiserror::Error;
use tokio::{
    sync::watch,
    task::{JoinError, JoinHandle},
};
use tracing::info;
use url::Url;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid beacon node url `{0}`: {1}")]
    InvalidUrl(String, url::ParseError),
    #[error("could not load network configuration: {0}")]
    Network(#[from] ethereum_consensus::state_transition::Error),
    #[error(transparent)]
    PayloadCache(#[from] payload_cache::Error),
    #[error(transparent)]
    Relay(#[from] relay_rs::Error),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PayloadCacheConfig {
    /// Scopes keys so relays sharing a cache backend do not collide.
    pub key_prefix: String,
    pub ttl_secs: u64,
    /// memcached servers as `host:port`; the cache is kept in process memory if empty.
    pub servers: Vec<String>,
    pub timeout_ms: u64,
}

impl Default for PayloadCacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            ttl_secs: 45,
            servers: vec![],
            timeout_ms: 500,
        }
    }
}

impl PayloadCacheConfig {
    pub async fn build(&self) -> Result<PayloadCache, Error> {
        let backend: Arc<dyn CacheBackend> = if self.servers.is_empty() {
            Arc::new(MemoryCache::default())
        } else {
            let timeout = Duration::from_millis(self.timeout_ms);
            Arc::new(MemcachedCache::connect(&self.servers, timeout).await?)
        };
        let cache =
            PayloadCache::new(backend, self.key_prefix.clone(), Duration::from_secs(self.ttl_secs))?;
        Ok(cache)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: Ipv4Addr,
    pub port: u16,
    pub beacon_node_url: String,
    /// Overrides the network's genesis fork version when computing the builder domain.
    pub genesis_fork_version: Option<String>,
    pub proposer_api: bool,
    pub builder_api: bool,
    pub max_registration_concurrency: usize,
    pub max_duty_lookup_concurrency: usize,
    pub request_timeout_ms: u64,
    /// Bounds loading the full validator set, which is far larger than other requests.
    pub known_validator_refresh_timeout_ms: u64,
    pub payload_cache: PayloadCacheConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::UNSPECIFIED,
            port: 28545,
            beacon_node_url: "http://127.0.0.1:5052".into(),
            genesis_fork_version: None,
            proposer_api: true,
            builder_api: true,
            max_registration_concurrency: 64,
            max_duty_lookup_concurrency: 32,
            request_timeout_ms: 10_000,
            known_validator_refresh_timeout_ms: 120_000,
            payload_cache: Default::default(),
        }
    }
}

pub struct Service {
    network: Network,
    config: Config,
}

impl Service {
    pub fn from(network: Network, config: Config) -> Self {
        Self { network, config }
    }

    /// Builds the [`Relay`] against the configured beacon node, then checks it and spawns the
    /// server and background tasks
    pub async fn spawn(self) -> Result<ServiceHandle, Error> {
        let Self { network, config } = self;
        let context = Context::try_from(&network)?;

        let endpoint: Url = config
            .beacon_node_url
            .parse()
            .map_err(|err| Error::InvalidUrl(config.beacon_node_url.clone(), err))?;
        let beacon_node = Arc::new(Client::new(endpoint));
        let validator_registry = Arc::new(InMemoryValidatorRegistry::new(beacon_node.clone()));
        let payload_cache = config.payload_cache.build().await?;
        let signing_domain =
            compute_builder_signing_domain(config.genesis_fork_version.as_deref(), &context)
                .map_err(relay_rs::Error::from)?;

        let relay = Relay::new(
            beacon_node,
            validator_registry,
            payload_cache,
            signing_domain,
            context.slots_per_epoch,
            &config,
        );
        let epoch_duration =
            Duration::from_secs(context.seconds_per_slot * context.slots_per_epoch);
        spawn_relay(relay, &config, epoch_duration / 2).await
    }
}

/// Initializes `relay` and spawns the HTTP server, the duty updates and the known-validator
/// refresh, all tied to one shutdown signal
pub async fn spawn_relay(
    relay: Relay,
    config: &Config,
    known_validator_refresh_period: Duration,
) -> Result<ServiceHandle, Error> {
    relay.initialize().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = Server::new(config.host, config.port, relay.clone())
        .with_proposer_api(config.proposer_api)
        .with_builder_api(config.builder_api);
    let mut server_shutdown = shutdown_rx.clone();
    let (local_addr, server) = server.spawn(async move {
        let _ = server_shutdown.changed().await;
    })?;
    info!(%local_addr, "relay server started");

    let duties = {
        let relay = relay.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { relay.run_duty_updates(shutdown).await })
    };
    let known_validators = tokio::spawn(async move {
        relay.run_known_validator_updates(known_validator_refresh_period, shutdown_rx).await
    });

    Ok(ServiceHandle { duties, known_validators, server, shutdown: shutdown_tx, local_addr })
}

/// Contains the handles to the tasks spawned by [`spawn_relay`]
///
/// Completes as soon as any of the tasks does.
#[pin_project::pin_project]
pub struct ServiceHandle {
    #[pin]
    duties: JoinHandle<()>,
    #[pin]
    known_validators: JoinHandle<()>,
    #[pin]
    server: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
    local_addr: SocketAddr,
}

impl ServiceHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Signal every task to stop and wait for them to finish.
    pub async fn shutdown(self) -> Result<(), JoinError> {
        let Self { duties, known_validators, server, shutdown, .. } = self;
        let _ = shutdown.send(true);
        duties.await?;
        known_validators.await?;
        server.await
    }
}

impl Future for ServiceHandle {
    type Output = Result<(), JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let duties = this.duties.poll(cx);
        if duties.is_ready() {
            return duties
        }
        let known_validators = this.known_validators.poll(cx);
        if known_validators.is_ready() {
            return known_validators
        }
        this.server.poll(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config: Config = toml::from_str("port = 18000").unwrap();
        assert_eq!(config.port, 18000);
        assert_eq!(config.host, Ipv4Addr::UNSPECIFIED);
        assert_eq!(config.max_registration_concurrency, 64);
        assert_eq!(config.payload_cache.key_prefix, "boost-relay");
        assert_eq!(config.payload_cache.ttl_secs, 45);
        assert!(config.payload_cache.servers.is_empty());
        assert_eq!(config.request_timeout_ms, 10_000);
        assert_eq!(config.known_validator_refresh_timeout_ms, 120_000);
        assert!(config.proposer_api && config.builder_api);
        assert!(config.genesis_fork_version.is_none());
    }

    #[test]
    fn test_config_overrides() {
        let config: Config = toml::from_str(
            r#"
            genesis_fork_version = "0x90000069"
            builder_api = false
            request_timeout_ms = 500
            known_validator_refresh_timeout_ms = 300000

            [payload_cache]
            key_prefix = "holesky-a"
            servers = ["10.0.0.1:11211", "10.0.0.2:11211"]
            "#,
        )
        .unwrap();
        assert_eq!(config.genesis_fork_version.as_deref(), Some("0x90000069"));
        assert!(!config.builder_api);
        assert_eq!(config.request_timeout_ms, 500);
        assert_eq!(config.known_validator_refresh_timeout_ms, 300_000);
        assert_eq!(config.payload_cache.key_prefix, "holesky-a");
        assert_eq!(config.payload_cache.ttl_secs, 45);
        assert_eq!(config.payload_cache.servers.len(), 2);
        assert_eq!(config.payload_cache.timeout_ms, 500);
    }

    #[tokio::test]
    async fn test_payload_cache_without_servers_is_local() {
        let config = PayloadCacheConfig { ttl_secs: 12, ..Default::default() };
        let cache = config.build().await.unwrap();
        assert_eq!(cache.ttl(), Duration::from_secs(12));

        let config = PayloadCacheConfig { key_prefix: "a:b".to_string(), ..Default::default() };
        assert!(matches!(
            config.build().await,
            Err(Error::PayloadCache(payload_cache::Error::InvalidPrefix(..)))
        ));
    }
}
