use async_trait::async_trait;
use ruma::UserId;

use super::DeviceRecord;
use crate::Result;

#[async_trait]
pub trait Data: Send + Sync {
    async fn device_by_token_hash(&self, token_hash: &str) -> Result<Option<DeviceRecord>>;

    /// Stores the record, replacing any previous token of the same device
    async fn save_device(&self, record: &DeviceRecord) -> Result<()>;

    async fn remove_device(&self, record: &DeviceRecord) -> Result<()>;

    async fn devices_for_account(&self, account_id: &UserId) -> Result<Vec<DeviceRecord>>;
}
