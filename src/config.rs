//! Runner configuration.
//!
//! Values come from an optional YAML file and are then overridden by
//! environment variables:
//!
//! | Variable | Field |
//! | --- | --- |
//! | `KISSBOT_RUNNER_CONFIG` | YAML file path (when none is given explicitly) |
//! | `DB_PATH` | `db_path` |
//! | `BOTS_DIR` | `bots_dir` |
//! | `HOST` | `host` |
//! | `PORT` | `port` |
//! | `ACCESS_CODES` | `access_codes` (comma separated) |
//! | `BOT_INTERPRETER` | `supervisor.interpreter` |

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, RunnerError};

pub const CONFIG_ENV: &str = "KISSBOT_RUNNER_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunnerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    /// Where uploaded scripts and manifests are stored
    pub bots_dir: PathBuf,
    /// Codes accepted by the access gate. Empty = nobody gets in.
    pub access_codes: Vec<String>,
    pub max_upload_bytes: usize,
    pub supervisor: SupervisorConfig,
    pub installer: InstallerConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            db_path: PathBuf::from("kissbot-runner.db"),
            bots_dir: PathBuf::from("bots"),
            access_codes: Vec::new(),
            max_upload_bytes: 16 * 1024 * 1024,
            supervisor: SupervisorConfig::default(),
            installer: InstallerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Program that runs a bot script (the script path is the last argument)
    pub interpreter: String,
    pub interpreter_args: Vec<String>,
    /// Extra environment passed to every bot
    pub env: HashMap<String, String>,
    /// SIGTERM grace period before SIGKILL
    pub stop_timeout_secs: u64,
    /// How long the exit handler waits for buffered output after the process is gone
    pub drain_timeout_ms: u64,
    /// Cap on the accumulated log per bot; oldest output is dropped first
    pub log_limit_bytes: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            interpreter_args: vec!["-u".to_string()],
            env: HashMap::new(),
            stop_timeout_secs: 10,
            drain_timeout_ms: 2000,
            log_limit_bytes: 256 * 1024,
        }
    }
}

impl SupervisorConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InstallerConfig {
    pub program: String,
    /// Arguments placed before the manifest path
    pub args: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            program: "pip".to_string(),
            args: vec!["install".to_string(), "-r".to_string()],
            timeout_secs: 300,
        }
    }
}

impl InstallerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl RunnerConfig {
    /// Load from `path` (or `$KISSBOT_RUNNER_CONFIG`), then apply env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));

        let mut config = match path {
            Some(p) => Self::from_yaml_file(&p)?,
            None => Self::default(),
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RunnerError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Apply overrides from a key lookup (the environment in production)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("BOTS_DIR") {
            self.bots_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("HOST") {
            self.host = v;
        }
        if let Some(v) = lookup("PORT") {
            self.port = v
                .trim()
                .parse()
                .map_err(|_| RunnerError::Config(format!("PORT is not a valid port: {}", v)))?;
        }
        if let Some(v) = lookup("ACCESS_CODES") {
            self.access_codes = v
                .split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = lookup("BOT_INTERPRETER") {
            self.supervisor.interpreter = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.supervisor.interpreter.trim().is_empty() {
            return Err(RunnerError::Config("supervisor.interpreter is empty".to_string()));
        }
        if self.supervisor.log_limit_bytes == 0 {
            return Err(RunnerError::Config("supervisor.log_limit_bytes must be > 0".to_string()));
        }
        if self.installer.program.trim().is_empty() {
            return Err(RunnerError::Config("installer.program is empty".to_string()));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RunnerConfig::default();
        assert_eq!(config.port, 5000);
        assert_eq!(config.supervisor.stop_timeout(), Duration::from_secs(10));
        assert_eq!(config.installer.args, vec!["install", "-r"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml() {
        let yaml = r#"
port: 8080
bots_dir: /srv/bots
supervisor:
  interpreter: sh
  log_limit_bytes: 1024
"#;
        let config = RunnerConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.bots_dir, PathBuf::from("/srv/bots"));
        assert_eq!(config.supervisor.interpreter, "sh");
        assert_eq!(config.supervisor.log_limit_bytes, 1024);
        // untouched fields keep their defaults
        assert_eq!(config.supervisor.stop_timeout_secs, 10);
        assert_eq!(config.installer.program, "pip");
    }

    #[test]
    fn test_env_overrides() {
        let mut config = RunnerConfig::default();
        let env: HashMap<&str, &str> = [
            ("PORT", "9000"),
            ("ACCESS_CODES", "ABC, DEF ,,"),
            ("BOT_INTERPRETER", "python"),
        ]
        .into_iter()
        .collect();

        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.access_codes, vec!["ABC", "DEF"]);
        assert_eq!(config.supervisor.interpreter, "python");
        assert_eq!(config.bind_addr(), "0.0.0.0:9000");
    }

    #[test]
    fn test_invalid_port() {
        let mut config = RunnerConfig::default();
        let result = config.apply_overrides(|k| (k == "PORT").then(|| "http".to_string()));
        assert!(matches!(result, Err(RunnerError::Config(_))));
    }

    #[test]
    fn test_zero_log_limit_rejected() {
        let mut config = RunnerConfig::default();
        config.supervisor.log_limit_bytes = 0;
        assert!(config.validate().is_err());
    }
}
