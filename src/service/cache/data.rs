use std::sync::Arc;

use async_trait::async_trait;
use ruma::{OwnedUserId, UserId};

use super::models::{AccountHead, RoomState};
use crate::Result;

#[async_trait]
pub trait Data: Send + Sync {
    /// Stable short id of an account, allocated on first use
    async fn short_account_id(&self, account_id: &UserId) -> Result<u64>;

    /// Head and rooms of a previously committed partition
    async fn load_partition(&self, short: u64) -> Result<Option<(AccountHead, Vec<RoomState>)>>;

    /// Writes the head and the changed rooms as one atomic batch
    async fn commit(&self, head: &AccountHead, rooms: &[Arc<RoomState>]) -> Result<()>;

    /// Every account that has a partition
    async fn known_accounts(&self) -> Result<Vec<OwnedUserId>>;
}
