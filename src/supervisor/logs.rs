use std::sync::Arc;
use tokio::sync::Mutex;

use crate::core::BotUpdate;
use crate::error::Result;
use crate::store::BotStore;

/// Text buffer that keeps only the most recent `limit` bytes.
///
/// Trimming always happens on a char boundary, so the kept text can be
/// slightly shorter than `limit`.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    text: String,
    limit: usize,
    truncated: bool,
}

impl LogBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            text: String::new(),
            limit,
            truncated: false,
        }
    }

    pub fn push(&mut self, chunk: &str) {
        self.text.push_str(chunk);
        if self.text.len() > self.limit {
            let mut cut = self.text.len() - self.limit;
            while !self.text.is_char_boundary(cut) {
                cut += 1;
            }
            self.text.drain(..cut);
            self.truncated = true;
        }
    }

    pub fn clear(&mut self) {
        self.text.clear();
        self.truncated = false;
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    /// True once older output has been dropped to honor the limit
    pub fn was_truncated(&self) -> bool {
        self.truncated
    }
}

/// Per-process log record, written through to the bot store on every append
/// while attached.
pub struct LogAccumulator {
    bot_id: String,
    buffer: LogBuffer,
    store: Arc<dyn BotStore>,
    attached: bool,
}

/// Accumulator shared between a process's output pump and its lifecycle operations
pub type SharedLog = Arc<Mutex<LogAccumulator>>;

impl LogAccumulator {
    pub fn new(bot_id: impl Into<String>, store: Arc<dyn BotStore>, limit: usize) -> Self {
        Self {
            bot_id: bot_id.into(),
            buffer: LogBuffer::new(limit),
            store,
            attached: true,
        }
    }

    pub fn shared(self) -> SharedLog {
        Arc::new(Mutex::new(self))
    }

    pub fn bot_id(&self) -> &str {
        &self.bot_id
    }

    /// Drop everything and start over from `marker` (not persisted)
    pub fn reset(&mut self, marker: &str) {
        self.buffer.clear();
        self.buffer.push(marker);
    }

    /// Append a chunk and, while attached, persist the whole buffer
    pub async fn append(&mut self, chunk: &str) -> Result<()> {
        self.buffer.push(chunk);
        if !self.attached {
            return Ok(());
        }
        self.store
            .update(&self.bot_id, BotUpdate::logs(self.buffer.as_str()))
            .await?;
        Ok(())
    }

    /// Append without persisting; the caller writes `contents()` itself
    pub fn push_local(&mut self, chunk: &str) {
        self.buffer.push(chunk);
    }

    /// Stop writing through. Later appends only reach the in-memory buffer.
    pub fn detach(&mut self) {
        self.attached = false;
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn contents(&self) -> &str {
        self.buffer.as_str()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::NewBot;
    use crate::store::SqliteStore;

    #[test]
    fn test_buffer_keeps_tail() {
        let mut buffer = LogBuffer::new(5);
        buffer.push("abc");
        buffer.push("defg");
        assert_eq!(buffer.as_str(), "cdefg");
        assert!(buffer.was_truncated());
    }

    #[test]
    fn test_buffer_char_boundary() {
        let mut buffer = LogBuffer::new(4);
        buffer.push("aéé"); // 1 + 2 + 2 bytes
        assert_eq!(buffer.as_str(), "éé");
        buffer.push("z");
        assert_eq!(buffer.as_str(), "éz");
    }

    #[test]
    fn test_buffer_under_limit() {
        let mut buffer = LogBuffer::new(64);
        buffer.push("hello ");
        buffer.push("world");
        assert_eq!(buffer.as_str(), "hello world");
        assert!(!buffer.was_truncated());
    }

    #[tokio::test]
    async fn test_append_order_is_persisted() {
        let store: Arc<dyn BotStore> = Arc::new(SqliteStore::new(":memory:").await.unwrap());
        let bot = store.create(NewBot::new("echo", "echo.sh")).await.unwrap();

        let mut acc = LogAccumulator::new(&bot.id, store.clone(), 1024);
        acc.reset("[Bot started]\n");
        for chunk in ["a", "b", "c"] {
            acc.append(chunk).await.unwrap();
        }

        let stored = store.get(&bot.id).await.unwrap().unwrap();
        assert!(stored.logs.ends_with("abc"));
        assert_eq!(stored.logs, "[Bot started]\nabc");
    }

    #[tokio::test]
    async fn test_detached_appends_stay_local() {
        let store: Arc<dyn BotStore> = Arc::new(SqliteStore::new(":memory:").await.unwrap());
        let bot = store.create(NewBot::new("echo", "echo.sh")).await.unwrap();

        let mut acc = LogAccumulator::new(&bot.id, store.clone(), 1024);
        assert!(acc.is_attached());
        acc.append("kept").await.unwrap();
        acc.detach();
        assert!(!acc.is_attached());
        acc.append(" late").await.unwrap();

        assert_eq!(acc.contents(), "kept late");
        let stored = store.get(&bot.id).await.unwrap().unwrap();
        assert_eq!(stored.logs, "kept");
    }
}
