//! # KissBot Runner
//!
//! Upload bot scripts and run them as supervised background processes:
//! - Process supervisor with one live process per bot
//! - Captured stdout/stderr, written through to the bot record
//! - Dependency installation at upload time
//! - SQLite bot store
//! - Multiple interfaces: Rust library, HTTP API, CLI
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use kissbot_runner::{BotRunner, RunnerConfig, UploadRequest, UploadedFile};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runner = BotRunner::new(&RunnerConfig::default()).await?;
//!
//!     let bot = runner.upload(UploadRequest {
//!         name: "echo".to_string(),
//!         script: UploadedFile::new("echo.py", "print('hello')"),
//!         manifest: None,
//!     }).await?;
//!
//!     let bot = runner.start(&bot.id).await?;
//!     println!("{} is {}", bot.name, bot.status);
//!     Ok(())
//! }
//! ```

pub mod core;
pub mod config;
pub mod store;
pub mod supervisor;
pub mod installer;
pub mod runner;
pub mod error;

// Re-export primary types
pub use core::{Bot, BotStatus, BotUpdate, NewBot};
pub use config::{InstallerConfig, RunnerConfig, SupervisorConfig};
pub use store::{BotStore, SqliteStore};
pub use supervisor::{ExitEvent, Supervisor};
pub use installer::{DependencyInstaller, InstallOutcome};
pub use runner::{AccessCheck, BotRunner, UploadRequest, UploadedFile};
pub use error::{Result, RunnerError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
