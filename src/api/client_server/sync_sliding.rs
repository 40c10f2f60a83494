use std::{sync::Arc, time::Instant};

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::{
    api::access_token,
    service::sync::{SlidingSyncRequest, SlidingSyncResponse},
    Result, Services,
};

#[derive(Debug, Default, Deserialize)]
pub struct SyncQuery {
    pub pos: Option<String>,
    pub timeout: Option<u64>,
    pub access_token: Option<String>,
}

/// # `POST /_matrix/client/unstable/org.matrix.msc3575/sync`
///
/// Windowed room list diff since `pos`, long-polling up to `timeout` ms
/// when nothing changed.
#[instrument(level = "debug", skip_all, fields(pos = ?query.pos))]
pub async fn sync_sliding_route(
    State(services): State<Arc<Services>>,
    headers: HeaderMap,
    Query(query): Query<SyncQuery>,
    body: Bytes,
) -> Result<Json<SlidingSyncResponse>> {
    let start = Instant::now();
    let token = access_token(&headers, query.access_token.as_deref())?;

    let mut request: SlidingSyncRequest = if body.is_empty() {
        SlidingSyncRequest::default()
    } else {
        serde_json::from_slice(&body)?
    };
    if query.pos.is_some() {
        request.pos = query.pos.clone();
    }
    if query.timeout.is_some() {
        request.timeout_ms = query.timeout;
    }

    let response = services.sliding_sync(token, request).await;
    metrics::histogram!("syncv3_request_duration_seconds").record(start.elapsed().as_secs_f64());
    debug!("📊 Sliding sync answered in {:?}", start.elapsed());

    Ok(Json(response?))
}
