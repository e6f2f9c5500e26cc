//! Gateway error taxonomy and the single reporting funnel.
//!
//! ERROR HANDLING
//! ==============
//! Every handler error becomes an error frame to the offending client;
//! nothing but a transport failure tears a connection down. Service errors
//! are mapped onto the six wire codes here, in one place.

use messages::{ErrorCode, ServerMessage};
use tracing::{debug, error};

use crate::gateway::connection::ClientHandle;
use crate::services::ServiceError;

/// Everything a message handler can fail with.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("token expired")]
    TokenExpired,
    #[error("invalid collection `{0}`")]
    InvalidCollection(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl GatewayError {
    /// The wire code carried in the error frame.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidPayload(_) => ErrorCode::InvalidPayload,
            Self::AuthenticationFailed(_) => ErrorCode::AuthenticationFailed,
            Self::TokenExpired => ErrorCode::TokenExpired,
            Self::InvalidCollection(_) => ErrorCode::InvalidCollection,
            Self::Forbidden(_) => ErrorCode::Forbidden,
            Self::Service(err) => match err {
                ServiceError::InvalidCredentials | ServiceError::InvalidToken => ErrorCode::AuthenticationFailed,
                // Row-level filters may hide the item rather than the
                // collection; both surface as FORBIDDEN.
                ServiceError::Forbidden(_) | ServiceError::NotFound(_) => ErrorCode::Forbidden,
                ServiceError::UnknownCollection(_) => ErrorCode::InvalidCollection,
                ServiceError::InvalidQuery(_) => ErrorCode::InvalidPayload,
                ServiceError::Internal(_) => ErrorCode::Internal,
            },
        }
    }

    /// The message clients see. Internal details stay in the logs.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            Self::Service(ServiceError::Internal(_)) => "internal error".to_owned(),
            other => other.to_string(),
        }
    }
}

/// Map an error to an error frame and send it. The one funnel every
/// handler's failure path goes through.
pub async fn report(client: &ClientHandle, error: &GatewayError, uid: Option<String>) {
    match error {
        GatewayError::Service(ServiceError::Internal(detail)) => {
            error!(client_id = %client.id(), %detail, "gateway: internal error");
        }
        other => {
            debug!(client_id = %client.id(), error = %other, "gateway: reporting error to client");
        }
    }
    client
        .safe_send(ServerMessage::error(error.code(), error.public_message(), uid))
        .await;
}
