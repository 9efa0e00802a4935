use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, Notify, OwnedMutexGuard};

use super::logs::SharedLog;

/// In-memory reference to one live bot process.
///
/// The child itself is owned by its waiter task; the handle only carries what
/// is needed to ask for termination and to recognise the process later.
#[derive(Clone)]
pub struct ProcessHandle {
    bot_id: String,
    pid: Option<u32>,
    generation: u64,
    started_at: Instant,
    terminate: Arc<Notify>,
    logs: SharedLog,
}

impl ProcessHandle {
    pub fn new(
        bot_id: impl Into<String>,
        pid: Option<u32>,
        generation: u64,
        terminate: Arc<Notify>,
        logs: SharedLog,
    ) -> Self {
        Self {
            bot_id: bot_id.into(),
            pid,
            generation,
            started_at: Instant::now(),
            terminate,
            logs,
        }
    }

    pub fn bot_id(&self) -> &str {
        &self.bot_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn logs(&self) -> &SharedLog {
        &self.logs
    }

    /// Ask the waiter task to terminate the process. Never blocks; a process
    /// that already exited simply ignores the request.
    pub fn request_termination(&self) {
        self.terminate.notify_one();
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("bot_id", &self.bot_id)
            .field("pid", &self.pid)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Mapping from bot id to its live process handle, plus the per-bot locks
/// that serialize lifecycle operations.
///
/// The handle map itself is only held for short, non-async critical sections.
/// Per-bot locks are independent, so operations on different bots run in
/// parallel.
#[derive(Default)]
pub struct ProcessRegistry {
    handles: RwLock<HashMap<String, ProcessHandle>>,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    next_generation: AtomicU64,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lifecycle lock for `id`. The entry is dropped from the lock
    /// map again once the last holder or waiter lets go.
    pub async fn lock(&self, id: &str) -> BotLock<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(id.to_string()).or_default().clone()
        };
        BotLock {
            registry: self,
            id: id.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    fn release(&self, id: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // clones are only taken under this mutex, so a count of one is final
        if locks.get(id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(id);
        }
    }

    /// Number of bots with a lifecycle lock held or awaited
    pub fn lock_entries(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Store `handle`, returning any handle it replaced. The caller is
    /// expected to have terminated the previous one already.
    pub fn register(&self, handle: ProcessHandle) -> Option<ProcessHandle> {
        let mut handles = self.handles.write().unwrap_or_else(PoisonError::into_inner);
        let previous = handles.insert(handle.bot_id.clone(), handle);
        if let Some(ref prev) = previous {
            tracing::warn!(
                "⚠️  {}: Replaced a registered process (generation {})",
                prev.bot_id,
                prev.generation
            );
        }
        previous
    }

    pub fn lookup(&self, id: &str) -> Option<ProcessHandle> {
        let handles = self.handles.read().unwrap_or_else(PoisonError::into_inner);
        handles.get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<ProcessHandle> {
        let mut handles = self.handles.write().unwrap_or_else(PoisonError::into_inner);
        handles.remove(id)
    }

    /// Remove the entry only if it still belongs to `generation`.
    /// Returns whether it did.
    pub fn remove_if_current(&self, id: &str, generation: u64) -> bool {
        let mut handles = self.handles.write().unwrap_or_else(PoisonError::into_inner);
        match handles.get(id) {
            Some(h) if h.generation == generation => {
                handles.remove(id);
                true
            }
            _ => false,
        }
    }

    /// Whether `generation` is still the registered process for `id`
    pub fn is_current(&self, id: &str, generation: u64) -> bool {
        let handles = self.handles.read().unwrap_or_else(PoisonError::into_inner);
        handles.get(id).is_some_and(|h| h.generation == generation)
    }

    pub fn contains(&self, id: &str) -> bool {
        let handles = self.handles.read().unwrap_or_else(PoisonError::into_inner);
        handles.contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        let handles = self.handles.read().unwrap_or_else(PoisonError::into_inner);
        handles.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        let handles = self.handles.read().unwrap_or_else(PoisonError::into_inner);
        handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Held lifecycle lock for one bot
pub struct BotLock<'a> {
    registry: &'a ProcessRegistry,
    id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl std::fmt::Debug for BotLock<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotLock")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Drop for BotLock<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.registry.release(&self.id);
    }
}
