//! Process supervision for uploaded bots.
//!
//! The [`Supervisor`] is the only component that spawns or kills bot
//! processes and the only one that turns a process exit into a status change.
//! Every lifecycle operation and every exit handler for a given bot runs under
//! that bot's lock in the [`ProcessRegistry`]; different bots never wait on
//! each other.
//!
//! Each spawned process gets two reader tasks (stdout, stderr) feeding one log
//! pump, and one waiter task that owns the child. The waiter delivers the exit
//! to the exit handler, which only records a status if the process is still
//! the registered one for its bot. An explicit stop unregisters the process
//! first, so whatever exit code the killed process reports is ignored.

pub mod logs;
pub mod output;
pub mod registry;

use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::SupervisorConfig;
use crate::core::{Bot, BotStatus, BotUpdate};
use crate::error::{Result, RunnerError};
use crate::store::BotStore;

pub use logs::{LogAccumulator, LogBuffer, SharedLog};
pub use registry::{BotLock, ProcessHandle, ProcessRegistry};

pub const START_MARKER: &str = "[Bot started]\n";
pub const STOP_MARKER: &str = "\n[Bot stopped by user]";
const RECONCILE_MARKER: &str = "\n[Process not running after supervisor restart]";
const EVENT_CAPACITY: usize = 64;

/// Sent once for every process that terminates, whatever the cause
#[derive(Debug, Clone, PartialEq)]
pub struct ExitEvent {
    pub bot_id: String,
    pub pid: Option<u32>,
    pub generation: u64,
    /// Exit code, `None` when killed by a signal or when waiting failed
    pub code: Option<i32>,
    /// Status written for this exit, `None` if the process had already been
    /// stopped, replaced or deleted
    pub recorded: Option<BotStatus>,
}

#[derive(Clone)]
pub struct Supervisor {
    store: Arc<dyn BotStore>,
    registry: Arc<ProcessRegistry>,
    config: Arc<SupervisorConfig>,
    events: broadcast::Sender<ExitEvent>,
    live: Arc<AtomicUsize>,
}

impl Supervisor {
    pub fn new(store: Arc<dyn BotStore>, config: SupervisorConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            registry: Arc::new(ProcessRegistry::new()),
            config: Arc::new(config),
            events,
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn store(&self) -> &Arc<dyn BotStore> {
        &self.store
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    /// Receive exit events for processes that terminate after this call
    pub fn subscribe(&self) -> broadcast::Receiver<ExitEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.registry.contains(id)
    }

    pub fn pid(&self, id: &str) -> Option<u32> {
        self.registry.lookup(id).and_then(|h| h.pid())
    }

    /// Processes whose waiter task has not finished yet (includes processes
    /// that were asked to stop but have not exited)
    pub fn live_processes(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Start the bot's script. An already running process is stopped first.
    ///
    /// Status becomes `running` as soon as the process is spawned; a fast crash
    /// shows up later through the exit handler.
    pub async fn start(&self, id: &str) -> Result<Bot> {
        let _guard = self.registry.lock(id).await;
        self.start_locked(id).await
    }

    /// Stop the bot's process if it has one. Without a live process this is a
    /// no-op that returns the record unchanged.
    pub async fn stop(&self, id: &str) -> Result<Bot> {
        let _guard = self.registry.lock(id).await;
        let bot = self.get_bot(id).await?;
        Ok(self.stop_locked(id).await?.unwrap_or(bot))
    }

    /// Stop followed by start, as one step for this bot
    pub async fn restart(&self, id: &str) -> Result<Bot> {
        let _guard = self.registry.lock(id).await;
        let bot = self.get_bot(id).await?;
        resolve_script(&bot).await?;
        info!("🔄 {}: Restarting...", id);
        self.stop_locked(id).await?;
        self.start_locked(id).await
    }

    /// Terminate any live process, delete the record and the uploaded files
    pub async fn delete(&self, id: &str) -> Result<()> {
        let _guard = self.registry.lock(id).await;
        let bot = self.get_bot(id).await?;

        if let Some(handle) = self.registry.remove(id) {
            handle.request_termination();
            handle.logs().lock().await.detach();
        }

        self.store.delete(id).await?;

        remove_upload(&bot.script_path).await;
        if let Some(manifest) = &bot.manifest_path {
            remove_upload(manifest).await;
        }

        info!("🗑️  {}: Deleted", id);
        Ok(())
    }

    /// Mark bots persisted as `running` without a live process as `stopped`.
    /// Meant for boot, when the registry is empty.
    pub async fn reconcile(&self) -> Result<usize> {
        let mut fixed = 0;

        for bot in self.store.list().await? {
            if !bot.is_running() {
                continue;
            }
            let _guard = self.registry.lock(&bot.id).await;
            if self.registry.contains(&bot.id) {
                continue;
            }

            let mut logs = LogBuffer::new(self.config.log_limit_bytes);
            logs.push(&bot.logs);
            logs.push(RECONCILE_MARKER);
            self.store
                .update(&bot.id, BotUpdate::status_and_logs(BotStatus::Stopped, logs.as_str()))
                .await?;
            fixed += 1;
        }

        if fixed > 0 {
            info!("🧹 Reconciled {} stale running bot(s)", fixed);
        }
        Ok(fixed)
    }

    /// Stop every live process and wait up to `timeout` for them to exit
    pub async fn shutdown(&self, timeout: Duration) {
        let ids = self.registry.ids();
        info!("🛑 Stopping {} bot process(es)...", ids.len());

        for id in ids {
            let _guard = self.registry.lock(&id).await;
            if let Err(e) = self.stop_locked(&id).await {
                warn!("⚠️  {}: Failed to record stop: {}", id, e);
            }
        }

        let deadline = Instant::now() + timeout;
        while self.live_processes() > 0 && Instant::now() < deadline {
            sleep(Duration::from_millis(50)).await;
        }

        let remaining = self.live_processes();
        if remaining > 0 {
            warn!("⚠️  {} process(es) still alive after {:?}", remaining, timeout);
        } else {
            info!("✅ All bot processes stopped");
        }
    }

    async fn get_bot(&self, id: &str) -> Result<Bot> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| RunnerError::NotFound(id.to_string()))
    }

    async fn start_locked(&self, id: &str) -> Result<Bot> {
        let bot = self.get_bot(id).await?;
        let script = resolve_script(&bot).await?;

        if self.registry.contains(id) {
            self.stop_locked(id).await?;
        }

        let mut child = self.command(&script).spawn().map_err(|e| RunnerError::SpawnFailure {
            bot_id: id.to_string(),
            reason: format!("{}: {}", self.config.interpreter, e),
        })?;
        let pid = child.id();

        let bot = match self
            .store
            .update(id, BotUpdate::status_and_logs(BotStatus::Running, START_MARKER))
            .await
        {
            Ok(bot) => bot,
            Err(e) => {
                let _ = child.start_kill();
                return Err(e);
            }
        };

        let mut acc = LogAccumulator::new(id, self.store.clone(), self.config.log_limit_bytes);
        acc.reset(START_MARKER);
        let logs = acc.shared();

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            output::forward_chunks(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            output::forward_chunks(stderr, tx.clone());
        }
        drop(tx);
        let pump = tokio::spawn(pump_logs(rx, logs.clone()));

        let generation = self.registry.next_generation();
        let terminate = Arc::new(Notify::new());
        self.registry.register(ProcessHandle::new(
            id,
            pid,
            generation,
            terminate.clone(),
            logs.clone(),
        ));

        self.live.fetch_add(1, Ordering::SeqCst);
        let watcher = self.clone();
        let bot_id = id.to_string();
        tokio::spawn(async move {
            watcher
                .watch(bot_id, pid, generation, child, terminate, pump, logs)
                .await;
        });

        info!(
            "✅ {}: Started (PID {}) {}",
            id,
            pid.unwrap_or(0),
            script.display()
        );
        Ok(bot)
    }

    /// Returns the updated record, or `None` if nothing was running
    async fn stop_locked(&self, id: &str) -> Result<Option<Bot>> {
        let Some(handle) = self.registry.remove(id) else {
            debug!("{}: stop requested but no process is running", id);
            return Ok(None);
        };

        handle.request_termination();

        let mut acc = handle.logs().lock().await;
        acc.push_local(STOP_MARKER);
        acc.detach();
        let bot = self
            .store
            .update(id, BotUpdate::status_and_logs(BotStatus::Stopped, acc.contents()))
            .await?;

        info!(
            "🛑 {}: Stop requested (PID {}, up {}s)",
            id,
            handle.pid().unwrap_or(0),
            handle.uptime().as_secs()
        );
        Ok(Some(bot))
    }

    fn command(&self, script: &Path) -> Command {
        let mut cmd = Command::new(&self.config.interpreter);
        cmd.args(&self.config.interpreter_args)
            .arg(script)
            .envs(&self.config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = script.parent() {
            cmd.current_dir(dir);
        }
        cmd
    }

    /// Waiter task: owns the child until it exits, then runs the exit handler
    #[allow(clippy::too_many_arguments)]
    async fn watch(
        self,
        bot_id: String,
        pid: Option<u32>,
        generation: u64,
        mut child: Child,
        terminate: Arc<Notify>,
        pump: JoinHandle<()>,
        logs: SharedLog,
    ) {
        let status = tokio::select! {
            res = child.wait() => res,
            _ = terminate.notified() => self.terminate_child(&bot_id, &mut child).await,
        };

        // output written just before exit may still be in flight
        if tokio::time::timeout(self.config.drain_timeout(), pump).await.is_err() {
            debug!("{}: output streams still open after exit", bot_id);
        }

        let event = self.handle_exit(&bot_id, pid, generation, status, &logs).await;
        self.live.fetch_sub(1, Ordering::SeqCst);
        let _ = self.events.send(event);
    }

    async fn terminate_child(&self, bot_id: &str, child: &mut Child) -> io::Result<ExitStatus> {
        info!("🛑 {}: Sending SIGTERM (PID {})", bot_id, child.id().unwrap_or(0));
        send_sigterm(child);

        tokio::select! {
            res = child.wait() => res,
            _ = sleep(self.config.stop_timeout()) => {
                warn!("⚠️  {}: Timeout, sending SIGKILL", bot_id);
                let _ = child.kill().await;
                child.wait().await
            }
        }
    }

    /// Exit handler: runs once per process, under the bot's lock unless the
    /// process was already unregistered
    async fn handle_exit(
        &self,
        bot_id: &str,
        pid: Option<u32>,
        generation: u64,
        status: io::Result<ExitStatus>,
        logs: &SharedLog,
    ) -> ExitEvent {
        let (code, marker, outcome) = describe_exit(&status);

        // a superseded generation never becomes current again
        let _guard = if self.registry.is_current(bot_id, generation) {
            Some(self.registry.lock(bot_id).await)
        } else {
            None
        };

        let recorded = if self.registry.remove_if_current(bot_id, generation) {
            let mut acc = logs.lock().await;
            acc.push_local(&marker);
            acc.detach();

            match self
                .store
                .update(bot_id, BotUpdate::status_and_logs(outcome, acc.contents()))
                .await
            {
                Ok(_) => {
                    if outcome == BotStatus::Error {
                        warn!("❌ {}: {}", bot_id, marker.trim());
                    } else {
                        info!("✅ {}: Process exited cleanly", bot_id);
                    }
                    Some(outcome)
                }
                Err(e) => {
                    warn!("⚠️  {}: Failed to record exit: {}", bot_id, e);
                    None
                }
            }
        } else {
            debug!(
                "{}: exit of superseded process (generation {}) ignored",
                bot_id, generation
            );
            None
        };

        ExitEvent {
            bot_id: bot_id.to_string(),
            pid,
            generation,
            code,
            recorded,
        }
    }
}

async fn pump_logs(mut rx: mpsc::UnboundedReceiver<String>, logs: SharedLog) {
    while let Some(chunk) = rx.recv().await {
        let mut acc = logs.lock().await;
        if let Err(e) = acc.append(&chunk).await {
            warn!("⚠️  {}: Failed to persist logs: {}", acc.bot_id(), e);
        }
    }
}

async fn resolve_script(bot: &Bot) -> Result<PathBuf> {
    let spawn_failure = |reason: String| RunnerError::SpawnFailure {
        bot_id: bot.id.clone(),
        reason,
    };

    let path = tokio::fs::canonicalize(&bot.script_path)
        .await
        .map_err(|e| spawn_failure(format!("script {}: {}", bot.script_path.display(), e)))?;

    let meta = tokio::fs::metadata(&path)
        .await
        .map_err(|e| spawn_failure(format!("script {}: {}", path.display(), e)))?;
    if !meta.is_file() {
        return Err(spawn_failure(format!("script {} is not a file", path.display())));
    }

    Ok(path)
}

async fn remove_upload(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!("⚠️  Failed to delete {}: {}", path.display(), e);
    }
}

#[cfg(unix)]
fn send_sigterm(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match child.id() {
        Some(pid) => {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
        None => {
            let _ = child.start_kill();
        }
    }
}

#[cfg(not(unix))]
fn send_sigterm(child: &mut Child) {
    let _ = child.start_kill();
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

/// Exit code, log marker and resulting status for a finished process
fn describe_exit(status: &io::Result<ExitStatus>) -> (Option<i32>, String, BotStatus) {
    match status {
        Ok(s) => match s.code() {
            Some(code) => {
                let outcome = if code == 0 { BotStatus::Stopped } else { BotStatus::Error };
                (Some(code), format!("\n[Process exited with code {}]", code), outcome)
            }
            None => {
                let marker = match exit_signal(s) {
                    Some(sig) => format!("\n[Process terminated by signal {}]", sig),
                    None => "\n[Process terminated]".to_string(),
                };
                (None, marker, BotStatus::Error)
            }
        },
        Err(e) => (None, format!("\n[Process wait failed: {}]", e), BotStatus::Error),
    }
}
