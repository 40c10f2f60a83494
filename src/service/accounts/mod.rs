// =============================================================================
// Matrixon Sliding Sync Proxy - Accounts Service
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Maps client access tokens to upstream devices. Tokens are only kept
//   sealed by the token vault; lookups go through their SHA-256.
//
// =============================================================================

mod data;

use std::sync::Arc;

pub use data::Data;
use matrixon_vault::TokenVault;
use ruma::{DeviceId, OwnedDeviceId, OwnedUserId, UserId};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument, warn};

use crate::{
    service::pollers::upstream::Upstream,
    utils::{self, hash_token},
    Error, Result,
};

/// A device the proxy polls for
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub account_id: OwnedUserId,
    pub device_id: OwnedDeviceId,
    pub token_hash: String,
    pub sealed_token: String,
    /// Set once the homeserver rejected the token
    pub expired: bool,
    pub created_ts: u64,
}

/// Who is behind an authenticated request
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DeviceContext {
    pub account_id: OwnedUserId,
    pub device_id: OwnedDeviceId,
}

/// A usable upstream credential
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub device_id: OwnedDeviceId,
    pub access_token: String,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("device_id", &self.device_id)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

pub struct Service {
    db: Arc<dyn Data>,
    vault: TokenVault,
    upstream: Arc<dyn Upstream>,
}

impl Service {
    pub fn new(db: Arc<dyn Data>, vault: TokenVault, upstream: Arc<dyn Upstream>) -> Self {
        Self {
            db,
            vault,
            upstream,
        }
    }

    /// Resolves a client token, registering its device on first sight
    ///
    /// Returns the device and whether it was newly registered.
    #[instrument(level = "debug", skip_all)]
    pub async fn authenticate(&self, access_token: &str) -> Result<(DeviceContext, bool)> {
        let token_hash = hash_token(access_token);

        if let Some(record) = self.db.device_by_token_hash(&token_hash).await? {
            if record.expired {
                return Err(Error::ReauthRequired(record.account_id));
            }
            return Ok((
                DeviceContext {
                    account_id: record.account_id,
                    device_id: record.device_id,
                },
                false,
            ));
        }

        let whoami = self.upstream.whoami(access_token).await?;
        let device_id: OwnedDeviceId = whoami
            .device_id
            .unwrap_or_else(|| format!("PROXY_{}", &token_hash[..10]).into());

        let record = DeviceRecord {
            account_id: whoami.user_id.clone(),
            device_id: device_id.clone(),
            token_hash,
            sealed_token: self.vault.seal(access_token)?,
            expired: false,
            created_ts: utils::millis_since_unix_epoch(),
        };
        self.db.save_device(&record).await?;

        info!("🔑 Registered device {} of {}", device_id, whoami.user_id);
        Ok((
            DeviceContext {
                account_id: whoami.user_id,
                device_id,
            },
            true,
        ))
    }

    /// A non-expired credential for the account, if any
    ///
    /// Tokens that no longer open under the current secret are expired on the way.
    pub async fn credential(&self, account_id: &UserId) -> Result<Option<Credential>> {
        for record in self.db.devices_for_account(account_id).await? {
            if record.expired {
                continue;
            }

            match self.vault.open(&record.sealed_token) {
                Ok(access_token) => {
                    return Ok(Some(Credential {
                        device_id: record.device_id,
                        access_token,
                    }))
                }
                Err(e) => {
                    error!(
                        "❌ Stored token of {} {} cannot be opened: {}",
                        account_id, record.device_id, e
                    );
                    self.expire(account_id, &record.device_id).await?;
                }
            }
        }

        Ok(None)
    }

    /// Marks a device's token as rejected by the homeserver
    pub async fn expire(&self, account_id: &UserId, device_id: &DeviceId) -> Result<()> {
        for mut record in self.db.devices_for_account(account_id).await? {
            if record.device_id == device_id && !record.expired {
                record.expired = true;
                self.db.save_device(&record).await?;
                warn!("🔐 Expired credential of {} {}", account_id, device_id);
            }
        }
        Ok(())
    }

    /// Forgets the device behind `access_token`
    pub async fn logout(&self, access_token: &str) -> Result<Option<DeviceContext>> {
        let Some(record) = self.db.device_by_token_hash(&hash_token(access_token)).await? else {
            return Ok(None);
        };

        self.db.remove_device(&record).await?;
        info!("👋 Logged out {} {}", record.account_id, record.device_id);

        Ok(Some(DeviceContext {
            account_id: record.account_id,
            device_id: record.device_id,
        }))
    }

    /// Whether any device of the account still has a usable token
    pub async fn has_live_devices(&self, account_id: &UserId) -> Result<bool> {
        Ok(self
            .db
            .devices_for_account(account_id)
            .await?
            .iter()
            .any(|record| !record.expired))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        database::KeyValueDatabase,
        service::pollers::upstream::{MockUpstream, Whoami},
    };
    use ruma::{device_id, user_id};
    use test_log::test;

    async fn service(upstream: MockUpstream) -> Service {
        let db = KeyValueDatabase::in_memory().await.unwrap();
        Service::new(db, TokenVault::new("s3cr3t").unwrap(), Arc::new(upstream))
    }

    fn alice_whoami() -> MockUpstream {
        let mut upstream = MockUpstream::new();
        upstream.expect_whoami().times(1).returning(|_| {
            Ok(Whoami {
                user_id: user_id!("@alice:example.org").to_owned(),
                device_id: Some(device_id!("PHONE").to_owned()),
            })
        });
        upstream
    }

    #[test(tokio::test)]
    async fn test_first_authentication_registers_device() {
        let accounts = service(alice_whoami()).await;

        let (context, fresh) = accounts.authenticate("syt_alice").await.unwrap();
        assert!(fresh);
        assert_eq!(context.device_id, device_id!("PHONE"));

        // Second time comes from the store; whoami is expected only once
        let (again, fresh) = accounts.authenticate("syt_alice").await.unwrap();
        assert!(!fresh);
        assert_eq!(again, context);

        let credential = accounts
            .credential(user_id!("@alice:example.org"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(credential.access_token, "syt_alice");
    }

    #[test(tokio::test)]
    async fn test_rejected_token_is_not_registered() {
        let mut upstream = MockUpstream::new();
        upstream
            .expect_whoami()
            .returning(|_| Err(Error::UpstreamCredentialInvalid("M_UNKNOWN_TOKEN".to_owned())));
        let accounts = service(upstream).await;

        let result = accounts.authenticate("syt_bogus").await;
        assert!(matches!(result, Err(Error::UpstreamCredentialInvalid(_))));
        assert!(!accounts
            .has_live_devices(user_id!("@alice:example.org"))
            .await
            .unwrap());
    }

    #[test(tokio::test)]
    async fn test_expired_device_requires_reauth() {
        let accounts = service(alice_whoami()).await;
        let alice = user_id!("@alice:example.org");
        accounts.authenticate("syt_alice").await.unwrap();

        accounts.expire(alice, device_id!("PHONE")).await.unwrap();

        assert!(matches!(
            accounts.authenticate("syt_alice").await,
            Err(Error::ReauthRequired(_))
        ));
        assert!(accounts.credential(alice).await.unwrap().is_none());
        assert!(!accounts.has_live_devices(alice).await.unwrap());
    }

    #[test(tokio::test)]
    async fn test_secret_rotation_expires_tokens() {
        let db = KeyValueDatabase::in_memory().await.unwrap();
        let alice = user_id!("@alice:example.org");

        let before = Service::new(db.clone(), TokenVault::new("old").unwrap(), Arc::new(alice_whoami()));
        before.authenticate("syt_alice").await.unwrap();

        let after = Service::new(db, TokenVault::new("new").unwrap(), Arc::new(MockUpstream::new()));
        assert!(after.credential(alice).await.unwrap().is_none());
        assert!(!after.has_live_devices(alice).await.unwrap());
    }

    #[test(tokio::test)]
    async fn test_logout_forgets_device() {
        let accounts = service(alice_whoami()).await;
        accounts.authenticate("syt_alice").await.unwrap();

        let context = accounts.logout("syt_alice").await.unwrap().unwrap();
        assert_eq!(context.account_id, user_id!("@alice:example.org"));
        assert!(accounts.logout("syt_alice").await.unwrap().is_none());
        assert!(!accounts.has_live_devices(&context.account_id).await.unwrap());
    }
}
