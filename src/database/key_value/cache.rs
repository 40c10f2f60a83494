use std::sync::Arc;

use async_trait::async_trait;
use ruma::{OwnedUserId, UserId};
use tracing::warn;

use crate::{
    database::KeyValueDatabase,
    service::{
        self,
        cache::models::{AccountHead, RoomState},
    },
    utils, Error, Result,
};

const SHORTACCOUNT_COUNTER: &[u8] = b"shortaccount_counter";

fn partition_prefix(short: u64) -> Vec<u8> {
    let mut prefix = short.to_be_bytes().to_vec();
    prefix.push(0xff);
    prefix
}

#[async_trait]
impl service::cache::Data for KeyValueDatabase {
    async fn short_account_id(&self, account_id: &UserId) -> Result<u64> {
        if let Some(short) = self.userid_shortaccount.get(account_id.as_bytes()).await? {
            return utils::u64_from_bytes(&short);
        }

        let short = self.global.increment(SHORTACCOUNT_COUNTER).await?;
        self.userid_shortaccount
            .insert(account_id.as_bytes(), &short)
            .await?;

        utils::u64_from_bytes(&short)
    }

    async fn load_partition(&self, short: u64) -> Result<Option<(AccountHead, Vec<RoomState>)>> {
        let prefix = partition_prefix(short);
        let mut head = None;
        let mut rooms = Vec::new();

        for (key, value) in self.shortaccount_partition.scan_prefix(prefix.clone()).await? {
            if key.len() == prefix.len() {
                head = Some(
                    serde_json::from_slice::<AccountHead>(&value)
                        .map_err(|_| Error::bad_database("Invalid account head in db."))?,
                );
            } else {
                rooms.push(
                    serde_json::from_slice::<RoomState>(&value)
                        .map_err(|_| Error::bad_database("Invalid room state in db."))?,
                );
            }
        }

        Ok(head.map(|head| (head, rooms)))
    }

    async fn commit(&self, head: &AccountHead, rooms: &[Arc<RoomState>]) -> Result<()> {
        let prefix = partition_prefix(head.short);

        let mut batch = Vec::with_capacity(rooms.len() + 1);
        batch.push((prefix.clone(), serde_json::to_vec(head)?));
        for room in rooms {
            let mut key = prefix.clone();
            key.extend_from_slice(room.room_id.as_bytes());
            batch.push((key, serde_json::to_vec(&**room)?));
        }

        self.shortaccount_partition.insert_batch(batch).await
    }

    async fn known_accounts(&self) -> Result<Vec<OwnedUserId>> {
        Ok(self
            .userid_shortaccount
            .scan_prefix(Vec::new())
            .await?
            .into_iter()
            .filter_map(|(key, _)| {
                let parsed = String::from_utf8(key)
                    .ok()
                    .and_then(|s| UserId::parse(s).ok());
                if parsed.is_none() {
                    warn!("❌ Skipping invalid user id in userid_shortaccount");
                }
                parsed
            })
            .collect())
    }
}
