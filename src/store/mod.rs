pub mod sqlite;

use async_trait::async_trait;
use crate::core::{Bot, BotUpdate, NewBot};
use crate::error::Result;

pub use sqlite::SqliteStore;

/// Durable record store for bot metadata, status and logs
#[async_trait]
pub trait BotStore: Send + Sync {
    /// Get bot by id
    async fn get(&self, id: &str) -> Result<Option<Bot>>;

    /// Create a new bot record (id and upload timestamp are assigned here)
    async fn create(&self, new_bot: NewBot) -> Result<Bot>;

    /// Apply a partial update, returning the refreshed record.
    /// Fails with `NotFound` when the id has no record.
    async fn update(&self, id: &str, update: BotUpdate) -> Result<Bot>;

    /// Delete a bot record. Returns `false` if nothing was deleted.
    async fn delete(&self, id: &str) -> Result<bool>;

    /// All bots, oldest upload first
    async fn list(&self) -> Result<Vec<Bot>>;
}
