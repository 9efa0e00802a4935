use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Lifecycle status of a bot, as persisted and shown to users
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum BotStatus {
    #[default]
    Stopped,
    Running,
    Error,
}

impl BotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BotStatus::Stopped => "stopped",
            BotStatus::Running => "running",
            BotStatus::Error => "error",
        }
    }
}

impl fmt::Display for BotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BotStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stopped" => Ok(BotStatus::Stopped),
            "running" => Ok(BotStatus::Running),
            "error" => Ok(BotStatus::Error),
            other => Err(format!("Unknown bot status: {}", other)),
        }
    }
}

/// A user-uploaded script plus its metadata
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Bot {
    /// Opaque unique identifier (UUID v4)
    pub id: String,

    /// Display label
    pub name: String,

    /// Uploaded, runnable script
    pub script_path: PathBuf,

    /// Uploaded dependency manifest, if any
    #[serde(default)]
    pub manifest_path: Option<PathBuf>,

    pub status: BotStatus,

    pub uploaded_at: DateTime<Utc>,

    /// Accumulated process output and lifecycle markers
    #[serde(default)]
    pub logs: String,
}

impl Bot {
    pub fn is_running(&self) -> bool {
        self.status == BotStatus::Running
    }
}

/// Fields supplied when creating a bot record
#[derive(Debug, Clone)]
pub struct NewBot {
    pub name: String,
    pub script_path: PathBuf,
    pub manifest_path: Option<PathBuf>,
    pub status: BotStatus,
    pub logs: String,
}

impl NewBot {
    pub fn new(name: impl Into<String>, script_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            script_path: script_path.into(),
            manifest_path: None,
            status: BotStatus::Stopped,
            logs: String::new(),
        }
    }

    pub fn with_manifest(mut self, manifest_path: impl Into<PathBuf>) -> Self {
        self.manifest_path = Some(manifest_path.into());
        self
    }

    pub fn with_logs(mut self, logs: impl Into<String>) -> Self {
        self.logs = logs.into();
        self
    }
}

/// Partial update: only `Some` fields are written
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BotUpdate {
    pub status: Option<BotStatus>,
    pub logs: Option<String>,
}

impl BotUpdate {
    pub fn status(status: BotStatus) -> Self {
        Self { status: Some(status), logs: None }
    }

    pub fn logs(logs: impl Into<String>) -> Self {
        Self { status: None, logs: Some(logs.into()) }
    }

    pub fn status_and_logs(status: BotStatus, logs: impl Into<String>) -> Self {
        Self { status: Some(status), logs: Some(logs.into()) }
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.logs.is_none()
    }
}
