use beacon_api_client::mainnet::Client as ApiClient;
use ethereum_consensus::primitives::{Epoch, Slot};
use rand::seq::SliceRandom;
use relay_rs::{
    beacon_node::{ProposerAssignment, SyncStatus},
    payload_cache::{MemoryCache, DEFAULT_TTL},
    relay_api::Client as RelayClient,
    test_utils::{public_key_for, raw_registration, test_signing_domain, MockBeaconNode},
    types::RawSignedValidatorRegistration,
    validator_registry::InMemoryValidatorRegistry,
    PayloadCache, ValidatorRegistry,
};
use relay_service_rs::{spawn_relay, Config, Relay, ServiceHandle};
use std::{
    future::Future,
    net::Ipv4Addr,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use url::Url;

const SLOTS_PER_EPOCH: u64 = 32;
const VALIDATOR_COUNT: u8 = 4;

fn setup_logging() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "error".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

fn get_time() -> u64 {
    let duration = SystemTime::now().duration_since(UNIX_EPOCH).unwrap();
    duration.as_secs()
}

fn duties_for(epoch: Epoch) -> Vec<ProposerAssignment> {
    (0..VALIDATOR_COUNT)
        .map(|index| ProposerAssignment {
            slot: epoch * SLOTS_PER_EPOCH + index as Slot,
            public_key: public_key_for(index),
        })
        .collect()
}

struct TestRelay {
    beacon_node: Arc<MockBeaconNode>,
    validator_registry: Arc<InMemoryValidatorRegistry>,
    handle: ServiceHandle,
    api: ApiClient,
}

async fn start_relay(config: Config) -> TestRelay {
    let beacon_node = Arc::new(MockBeaconNode::default());
    beacon_node.set_sync_status(SyncStatus { head_slot: 2 * SLOTS_PER_EPOCH, is_syncing: false });
    beacon_node.set_validators((0..VALIDATOR_COUNT).map(public_key_for).collect());
    beacon_node.set_duties(2, duties_for(2));
    beacon_node.set_duties(3, duties_for(3));

    let validator_registry = Arc::new(InMemoryValidatorRegistry::new(beacon_node.clone()));
    let payload_cache =
        PayloadCache::new(Arc::new(MemoryCache::default()), "integration", DEFAULT_TTL).unwrap();
    let relay = Relay::new(
        beacon_node.clone(),
        validator_registry.clone(),
        payload_cache,
        test_signing_domain(),
        SLOTS_PER_EPOCH,
        &config,
    );
    let handle = spawn_relay(relay, &config, Duration::from_secs(6)).await.unwrap();

    let endpoint = Url::parse(&format!("http://{}", handle.local_addr())).unwrap();
    TestRelay { beacon_node, validator_registry, handle, api: ApiClient::new(endpoint) }
}

fn local_config() -> Config {
    Config { host: Ipv4Addr::LOCALHOST, port: 0, ..Default::default() }
}

async fn eventually<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_end_to_end() {
    setup_logging();

    let TestRelay { beacon_node, handle, api, .. } = start_relay(local_config()).await;
    let relay = RelayClient::new(api.clone());

    relay.check_status().await.unwrap();

    let duties = relay.get_proposer_duties().await.unwrap();
    let slots = duties.iter().map(|duty| duty.slot).collect::<Vec<_>>();
    assert_eq!(slots, vec![64, 65, 66, 67]);
    assert!(duties.iter().all(|duty| duty.entry.is_none()));

    let timestamp = get_time();
    let mut registrations =
        (0..VALIDATOR_COUNT).map(|index| raw_registration(index, timestamp)).collect::<Vec<_>>();
    // neither of these may keep the others from being stored
    registrations.push(raw_registration(9, timestamp));
    registrations.push(RawSignedValidatorRegistration::default());
    registrations.shuffle(&mut rand::thread_rng());
    relay.register_validators(&registrations).await.unwrap();

    // duties of the current epoch are not recomputed
    let duties = relay.get_proposer_duties().await.unwrap();
    assert!(duties.iter().all(|duty| duty.entry.is_none()));

    let beacon_node = &beacon_node;
    eventually(|| async move { beacon_node.head_subscriber_count() == 1 }).await;
    beacon_node.publish_head(3 * SLOTS_PER_EPOCH);
    let relay = &relay;
    eventually(|| async move {
        let duties = relay.get_proposer_duties().await.unwrap();
        duties.first().map(|duty| duty.slot) == Some(96)
    })
    .await;

    let duties = relay.get_proposer_duties().await.unwrap();
    for (index, duty) in duties.iter().enumerate() {
        assert_eq!(duty.slot, 96 + index as Slot);
        let entry = duty.entry.as_ref().unwrap();
        assert_eq!(entry.message.public_key, public_key_for(index as u8));
        assert_eq!(entry.message.timestamp, timestamp);
    }

    let response = api
        .http_post("/eth/v1/builder/validators", &serde_json::json!({ "not": "a list" }))
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["code"], 400);
    assert!(body["message"].is_string());

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_disabled_builder_api() {
    setup_logging();

    let config = Config { builder_api: false, ..local_config() };
    let TestRelay { handle, api, .. } = start_relay(config).await;

    let response = api.http_get("/relay/v1/builder/validators").await.unwrap();
    assert_eq!(response.status().as_u16(), 404);
    let response = api.http_get("/eth/v1/builder/status").await.unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let response = api.http_get("/").await.unwrap();
    assert_eq!(response.status().as_u16(), 200);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_undecodable_entries_do_not_fail_the_batch() {
    setup_logging();

    let TestRelay { validator_registry, handle, api, .. } = start_relay(local_config()).await;

    let timestamp = get_time();
    let valid = (0..VALIDATOR_COUNT)
        .map(|index| serde_json::to_value(raw_registration(index, timestamp)).unwrap())
        .collect::<Vec<_>>();

    let mut odd_length_key = valid[0].clone();
    odd_length_key["message"]["pubkey"] = "0x123".into();
    let mut missing_signature = valid[1].clone();
    missing_signature["signature"] = serde_json::Value::Null;
    let mut missing_gas_limit = valid[2].clone();
    missing_gas_limit["message"].as_object_mut().unwrap().remove("gas_limit");
    let mut non_hex_signature = valid[3].clone();
    non_hex_signature["signature"] = "registration".into();

    let mut batch = vec![odd_length_key, missing_signature, missing_gas_limit, non_hex_signature];
    for (index, registration) in valid.into_iter().enumerate() {
        batch.insert(2 * index + 1, registration);
    }

    let response = api.http_post("/eth/v1/builder/validators", &batch).await.unwrap();
    assert_eq!(response.status().as_u16(), 200);

    for index in 0..VALIDATOR_COUNT {
        let stored =
            validator_registry.get_registration_timestamp(&public_key_for(index)).await.unwrap();
        assert_eq!(stored, Some(timestamp));
    }

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_refuses_to_start_while_syncing() {
    let beacon_node = Arc::new(MockBeaconNode::default());
    beacon_node.set_sync_status(SyncStatus { head_slot: 10, is_syncing: true });
    let validator_registry = Arc::new(InMemoryValidatorRegistry::new(beacon_node.clone()));
    let payload_cache =
        PayloadCache::new(Arc::new(MemoryCache::default()), "integration", DEFAULT_TTL).unwrap();
    let config = local_config();
    let relay = Relay::new(
        beacon_node,
        validator_registry,
        payload_cache,
        test_signing_domain(),
        SLOTS_PER_EPOCH,
        &config,
    );
    assert!(spawn_relay(relay, &config, Duration::from_secs(6)).await.is_err());
}
