use crate::{
    relay_api::RelayApi,
    types::{DutySnapshot, RawSignedValidatorRegistration},
    Error,
};
use axum::{
    body::Bytes,
    extract::{Json, State},
    routing::{get, post, IntoMakeService},
    Router,
};
use hyper::server::conn::AddrIncoming;
use serde::{Serialize, Serializer};
use serde_json::{json, Value};
use std::{
    future::Future,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
};
use tokio::task::JoinHandle;
use tracing::{error, info, trace};

/// Type alias for the configured axum server
pub type RelayServer = axum::Server<AddrIncoming, IntoMakeService<Router>>;

// serialized as the bare list of duties
struct DutiesBody(Arc<DutySnapshot>);

impl Serialize for DutiesBody {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.duties.serialize(serializer)
    }
}

async fn handle_get_root() -> Json<Value> {
    trace!("serving root");
    Json(json!({}))
}

async fn handle_status_check() -> Json<Value> {
    trace!("status check");
    Json(json!({}))
}

async fn handle_validator_registration<R: RelayApi>(
    State(relay): State<R>,
    body: Bytes,
) -> Result<Json<Value>, Error> {
    let registrations: Vec<RawSignedValidatorRegistration> =
        serde_json::from_slice(&body).map_err(|err| Error::InvalidRequest(err.to_string()))?;
    trace!(count = registrations.len(), "processing registrations");
    relay.register_validators(&registrations).await?;
    Ok(Json(json!({})))
}

async fn handle_get_proposer_duties<R: RelayApi>(
    State(relay): State<R>,
) -> Result<Json<DutiesBody>, Error> {
    trace!("serving proposer duties for current epoch");
    let snapshot = relay.get_proposer_duties().await?;
    Ok(Json(DutiesBody(snapshot)))
}

pub struct Server<R> {
    host: Ipv4Addr,
    port: u16,
    relay: R,
    proposer_api: bool,
    builder_api: bool,
}

impl<R: RelayApi + Clone + Send + Sync + 'static> Server<R> {
    pub fn new(host: Ipv4Addr, port: u16, relay: R) -> Self {
        Self { host, port, relay, proposer_api: true, builder_api: true }
    }

    /// Whether to mount the routes proposers call.
    pub fn with_proposer_api(mut self, enabled: bool) -> Self {
        self.proposer_api = enabled;
        self
    }

    /// Whether to mount the routes builders call.
    pub fn with_builder_api(mut self, enabled: bool) -> Self {
        self.builder_api = enabled;
        self
    }

    fn router(&self) -> Router {
        let mut router = Router::new().route("/", get(handle_get_root));
        if self.proposer_api {
            router = router
                .route("/eth/v1/builder/status", get(handle_status_check))
                .route("/eth/v1/builder/validators", post(handle_validator_registration::<R>));
        }
        if self.builder_api {
            router =
                router.route("/relay/v1/builder/validators", get(handle_get_proposer_duties::<R>));
        }
        router.with_state(self.relay.clone())
    }

    /// Configures and returns the axum server
    pub fn serve(&self) -> Result<RelayServer, Error> {
        let addr = SocketAddr::from((self.host, self.port));
        let server = axum::Server::try_bind(&addr)?.serve(self.router().into_make_service());
        Ok(server)
    }

    /// Spawns the server on a new task, returning the bound address and the handle for it.
    ///
    /// The server stops accepting connections once `shutdown` completes and finishes after
    /// in-flight requests are served.
    pub fn spawn<F>(&self, shutdown: F) -> Result<(SocketAddr, JoinHandle<()>), Error>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let server = self.serve()?;
        let addr = server.local_addr();
        let handle = tokio::spawn(async move {
            info!("listening at {addr}...");
            if let Err(err) = server.with_graceful_shutdown(shutdown).await {
                error!(%err, "error while listening for incoming")
            }
        });
        Ok((addr, handle))
    }
}
