// =============================================================================
// Matrixon Sliding Sync Proxy - HTTP API
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Client-facing routes of the proxy.
//
// =============================================================================

pub mod client_server;

use std::sync::Arc;

use axum::{http::HeaderMap, routing::post, Router};
use tower_http::trace::TraceLayer;

use crate::{utils, Error, Result, Services};

/// All client routes, sharing `services`
pub fn router(services: Arc<Services>) -> Router {
    Router::new()
        .route(
            "/_matrix/client/unstable/org.matrix.msc3575/sync",
            post(client_server::sync_sliding_route),
        )
        .route("/_matrix/client/v3/logout", post(client_server::logout_route))
        .layer(TraceLayer::new_for_http())
        .with_state(services)
}

/// The request's access token, from the `Authorization` header or the query string
pub(crate) fn access_token<'a>(headers: &'a HeaderMap, query: Option<&'a str>) -> Result<&'a str> {
    if let Some(header) = headers.get(axum::http::header::AUTHORIZATION) {
        return header
            .to_str()
            .ok()
            .and_then(utils::bearer_token)
            .ok_or(Error::MissingToken);
    }

    query.filter(|token| !token.is_empty()).ok_or(Error::MissingToken)
}
