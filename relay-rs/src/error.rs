use crate::{beacon_node, payload_cache, proposer_scheduler, signing, validator_registry};
use axum::{
    extract::Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use beacon_api_client::Error as ApiError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("beacon node is syncing")]
    BeaconNodeSyncing,
    #[error("timed out while {0}")]
    Timeout(&'static str),

    #[error(transparent)]
    BeaconNode(#[from] beacon_node::Error),
    #[error(transparent)]
    ValidatorRegistry(#[from] validator_registry::Error),
    #[error(transparent)]
    ProposerScheduler(#[from] proposer_scheduler::Error),
    #[error(transparent)]
    PayloadCache(#[from] payload_cache::Error),
    #[error(transparent)]
    Signing(#[from] signing::Error),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Http(#[from] hyper::Error),
}

impl Error {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(..) |
            Self::PayloadCache(payload_cache::Error::InvalidKeyComponent(..)) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Body of every non-success response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: u16,
    pub message: String,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let code = self.status_code();
        let message = self.to_string();
        (code, Json(ErrorResponse { code: code.as_u16(), message })).into_response()
    }
}
