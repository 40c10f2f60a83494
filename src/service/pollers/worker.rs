use std::{sync::Arc, time::Duration};

use ruma::OwnedUserId;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{
    backoff::Backoff,
    upstream::{SyncRequest, Upstream},
    PollerState,
};
use crate::{
    config::PollerConfig,
    service::{accounts::Credential, cache},
    Error,
};

/// Why a worker returned
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    Shutdown,
    CredentialInvalid,
    StoreConflict,
}

/// Long-polls the homeserver for one account and feeds the cache
pub(super) struct Worker {
    pub account_id: OwnedUserId,
    pub credential: Credential,
    pub upstream: Arc<dyn Upstream>,
    pub cache: Arc<cache::Service>,
    pub config: PollerConfig,
    pub state: watch::Sender<PollerState>,
    pub shutdown: watch::Receiver<bool>,
}

impl Worker {
    pub async fn run(self) -> StopReason {
        let state = self.state.clone();
        state.send_replace(PollerState::Polling);

        let reason = self.poll().await;

        state.send_replace(PollerState::Stopped);
        reason
    }

    async fn poll(self) -> StopReason {
        let Worker {
            account_id,
            credential,
            upstream,
            cache,
            config,
            state,
            mut shutdown,
        } = self;

        info!(
            "🔄 Poller started for {} with device {}",
            account_id, credential.device_id
        );

        let mut backoff = Backoff::new(config.backoff_base(), config.backoff_max());
        let mut partial_retries = 0;

        loop {
            if *shutdown.borrow() {
                return StopReason::Shutdown;
            }

            // The committed position is the only resume point
            let since = match cache.upstream_since(&account_id).await {
                Ok(since) => since,
                Err(e) => {
                    error!("❌ Cannot read upstream position of {}: {}", account_id, e);
                    if pause(&mut shutdown, backoff.next_delay(None)).await {
                        return StopReason::Shutdown;
                    }
                    continue;
                }
            };

            let request = SyncRequest {
                access_token: credential.access_token.clone(),
                since,
                timeout: config.poll_timeout(),
            };

            let result = tokio::select! {
                result = upstream.sync(&request) => result,
                _ = shutdown.changed() => return StopReason::Shutdown,
            };

            let failure = match result {
                Ok(delta) => {
                    partial_retries = 0;
                    match cache.apply_delta(&account_id, &delta).await {
                        Ok(cursor) => {
                            backoff.reset();
                            metrics::counter!("syncv3_poller_syncs_total").increment(1);
                            debug!("✅ {} at {} (upstream {})", account_id, cursor, delta.next_batch);
                            continue;
                        }
                        Err(Error::StoreConflict(message)) => {
                            error!("❌ Poller for {} hit a store conflict: {}", account_id, message);
                            return StopReason::StoreConflict;
                        }
                        Err(e) => e,
                    }
                }
                Err(Error::UpstreamTruncated(message))
                    if partial_retries < config.max_partial_retries =>
                {
                    partial_retries += 1;
                    warn!(
                        "⚠️ Truncated sync for {} ({}), retry {}/{}",
                        account_id, message, partial_retries, config.max_partial_retries
                    );
                    continue;
                }
                Err(Error::UpstreamCredentialInvalid(errcode)) => {
                    warn!(
                        "🔐 Homeserver rejected the token of {} {}: {}",
                        account_id, credential.device_id, errcode
                    );
                    return StopReason::CredentialInvalid;
                }
                Err(e) => e,
            };

            partial_retries = 0;
            let hint = match &failure {
                Error::UpstreamTransient { retry_after, .. } => *retry_after,
                _ => None,
            };
            let delay = backoff.next_delay(hint);
            metrics::counter!("syncv3_poller_failures_total").increment(1);
            warn!(
                "⚠️ Sync for {} failed: {}; retry {} in {:?}",
                account_id,
                failure,
                backoff.attempts(),
                delay
            );

            state.send_replace(PollerState::BackoffWait);
            if pause(&mut shutdown, delay).await {
                return StopReason::Shutdown;
            }
            state.send_replace(PollerState::Polling);
        }
    }
}

/// Sleeps for `delay`; true when shutdown was requested meanwhile
async fn pause(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown.changed() => true,
    }
}
