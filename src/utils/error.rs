// =============================================================================
// Matrixon Sliding Sync Proxy - Error Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Error taxonomy shared by the poller pool, the shared cache and the sliding
//   sync engine, plus its translation into Matrix-style HTTP error bodies.
//
// =============================================================================

use std::{io, time::Duration};

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use ruma::OwnedUserId;
use thiserror::Error;
use tracing::error;

/// Matrixon sliding proxy error type
#[derive(Debug, Error)]
pub enum Error {
    /// Network failure, 5xx or rate limit from the homeserver; retried with backoff
    #[error("Upstream temporarily unavailable: {message}")]
    UpstreamTransient {
        message: String,
        retry_after: Option<Duration>,
    },

    /// The homeserver answered with a body we could not fully read
    #[error("Upstream response truncated: {0}")]
    UpstreamTruncated(String),

    /// The upstream access token was rejected; terminal for the poller
    #[error("Upstream credential invalid: {0}")]
    UpstreamCredentialInvalid(String),

    /// A delta arrived out of order for its account
    #[error("Store conflict: {0}")]
    StoreConflict(String),

    /// The client presented a cursor outside the retention horizon
    #[error("Stale cursor: {0}")]
    StaleCursor(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// The account's credential is no longer usable; the client must log in again
    #[error("Re-authentication required for {0}")]
    ReauthRequired(OwnedUserId),

    #[error("Missing access token")]
    MissingToken,

    #[error("Unknown access token")]
    UnknownToken,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    BadConfig(String),

    #[error("Vault error: {0}")]
    Vault(#[from] matrixon_vault::VaultError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Matrixon sliding proxy result type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn bad_database(msg: impl Into<String>) -> Self {
        let message = msg.into();
        error!("❌ Database error: {}", message);
        Error::Database(message)
    }

    pub fn bad_config(msg: impl Into<String>) -> Self {
        Error::BadConfig(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Error::UpstreamTransient {
            message: msg.into(),
            retry_after: None,
        }
    }

    /// Whether a poller should retry after this error
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::UpstreamTransient { .. } | Error::UpstreamTruncated(_)
        )
    }

    fn status_and_errcode(&self) -> (StatusCode, &'static str) {
        match self {
            Error::MissingToken => (StatusCode::UNAUTHORIZED, "M_MISSING_TOKEN"),
            Error::UnknownToken
            | Error::UpstreamCredentialInvalid(_)
            | Error::ReauthRequired(_) => {
                (StatusCode::UNAUTHORIZED, "M_UNKNOWN_TOKEN")
            }
            Error::BadRequest(_) | Error::Serialization(_) => {
                (StatusCode::BAD_REQUEST, "M_BAD_JSON")
            }
            Error::StaleCursor(_) | Error::SessionNotFound(_) => {
                (StatusCode::BAD_REQUEST, "M_UNKNOWN_POS")
            }
            Error::UpstreamTransient { .. } | Error::UpstreamTruncated(_) => {
                (StatusCode::BAD_GATEWAY, "M_UNKNOWN")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "M_UNKNOWN"),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, errcode) = self.status_and_errcode();

        let body = match &self {
            Error::ReauthRequired(_) | Error::UpstreamCredentialInvalid(_) => serde_json::json!({
                "errcode": errcode,
                "error": self.to_string(),
                "soft_logout": true,
            }),
            // Internal details stay in the logs
            Error::Database(_) | Error::StoreConflict(_) | Error::Vault(_) | Error::Io(_) => {
                serde_json::json!({
                    "errcode": errcode,
                    "error": "Internal server error",
                })
            }
            _ => serde_json::json!({
                "errcode": errcode,
                "error": self.to_string(),
            }),
        };

        (status, Json(body)).into_response()
    }
}
