use async_trait::async_trait;
use ruma::{DeviceId, UserId};

use crate::{
    database::KeyValueDatabase,
    service::{self, accounts::DeviceRecord},
    Error, Result,
};

fn userdevice_key(account_id: &UserId, device_id: &DeviceId) -> Vec<u8> {
    let mut key = account_id.as_bytes().to_vec();
    key.push(0xff);
    key.extend_from_slice(device_id.as_bytes());
    key
}

#[async_trait]
impl service::accounts::Data for KeyValueDatabase {
    async fn device_by_token_hash(&self, token_hash: &str) -> Result<Option<DeviceRecord>> {
        self.tokenhash_device
            .get(token_hash.as_bytes())
            .await?
            .map(|bytes| {
                serde_json::from_slice(&bytes)
                    .map_err(|_| Error::bad_database("Invalid device record in db."))
            })
            .transpose()
    }

    async fn save_device(&self, record: &DeviceRecord) -> Result<()> {
        let key = userdevice_key(&record.account_id, &record.device_id);

        // A device logging in again replaces its previous token
        if let Some(old_hash) = self.userdeviceid_tokenhash.get(&key).await? {
            if old_hash != record.token_hash.as_bytes() {
                self.tokenhash_device.remove(&old_hash).await?;
            }
        }

        self.tokenhash_device
            .insert(record.token_hash.as_bytes(), &serde_json::to_vec(record)?)
            .await?;
        self.userdeviceid_tokenhash
            .insert(&key, record.token_hash.as_bytes())
            .await
    }

    async fn remove_device(&self, record: &DeviceRecord) -> Result<()> {
        let key = userdevice_key(&record.account_id, &record.device_id);

        if self.userdeviceid_tokenhash.get(&key).await?.as_deref()
            == Some(record.token_hash.as_bytes())
        {
            self.userdeviceid_tokenhash.remove(&key).await?;
        }

        self.tokenhash_device.remove(record.token_hash.as_bytes()).await
    }

    async fn devices_for_account(&self, account_id: &UserId) -> Result<Vec<DeviceRecord>> {
        let mut prefix = account_id.as_bytes().to_vec();
        prefix.push(0xff);

        let mut records = Vec::new();
        for (_, token_hash) in self.userdeviceid_tokenhash.scan_prefix(prefix).await? {
            let token_hash = String::from_utf8(token_hash)
                .map_err(|_| Error::bad_database("Invalid token hash in db."))?;
            if let Some(record) =
                service::accounts::Data::device_by_token_hash(self, &token_hash).await?
            {
                records.push(record);
            }
        }

        Ok(records)
    }
}
