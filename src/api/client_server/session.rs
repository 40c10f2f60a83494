use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::instrument;

use crate::{api::access_token, Result, Services};

#[derive(Debug, Default, Deserialize)]
pub struct LogoutQuery {
    pub access_token: Option<String>,
}

/// # `POST /_matrix/client/v3/logout`
///
/// Forgets the device behind the access token; the homeserver session is left alone.
#[instrument(level = "debug", skip_all)]
pub async fn logout_route(
    State(services): State<Arc<Services>>,
    headers: HeaderMap,
    Query(query): Query<LogoutQuery>,
) -> Result<Json<Value>> {
    let token = access_token(&headers, query.access_token.as_deref())?;
    services.logout(token).await?;
    Ok(Json(json!({})))
}
