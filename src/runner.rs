use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

use crate::config::RunnerConfig;
use crate::core::{Bot, NewBot};
use crate::error::{Result, RunnerError};
use crate::installer::DependencyInstaller;
use crate::store::{BotStore, SqliteStore};
use crate::supervisor::Supervisor;

pub const READY_MESSAGE: &str = "Bot uploaded successfully. Ready to run.";

/// A file received from the upload form
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub file_name: String,
    pub content: Vec<u8>,
}

impl UploadedFile {
    pub fn new(file_name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            file_name: file_name.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub name: String,
    pub script: UploadedFile,
    pub manifest: Option<UploadedFile>,
}

/// Outcome of checking an access code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessCheck {
    Granted,
    Denied,
    /// Nothing was entered
    Empty,
}

/// Entry points used by the HTTP server and the CLI: upload, the access
/// gate, and the lifecycle operations that delegate to the [`Supervisor`].
pub struct BotRunner {
    store: Arc<dyn BotStore>,
    supervisor: Supervisor,
    installer: DependencyInstaller,
    bots_dir: PathBuf,
    access_codes: Vec<String>,
}

impl BotRunner {
    /// Open the SQLite store from `config.db_path` and prepare `bots_dir`
    pub async fn new(config: &RunnerConfig) -> Result<Self> {
        let store = Arc::new(SqliteStore::new(&config.db_path.to_string_lossy()).await?);
        Self::with_store(store, config).await
    }

    pub async fn with_store(store: Arc<dyn BotStore>, config: &RunnerConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.bots_dir).await?;
        let bots_dir = tokio::fs::canonicalize(&config.bots_dir).await?;

        if config.access_codes.is_empty() {
            tracing::warn!("⚠️  No access codes configured, every access check will be denied");
        }

        Ok(Self {
            supervisor: Supervisor::new(store.clone(), config.supervisor.clone()),
            installer: DependencyInstaller::new(&config.installer),
            store,
            bots_dir,
            access_codes: config.access_codes.clone(),
        })
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn store(&self) -> &Arc<dyn BotStore> {
        &self.store
    }

    pub fn bots_dir(&self) -> &Path {
        &self.bots_dir
    }

    pub fn validate_access(&self, code: &str) -> AccessCheck {
        let code = code.trim();
        if code.is_empty() {
            AccessCheck::Empty
        } else if self.access_codes.iter().any(|c| c == code) {
            AccessCheck::Granted
        } else {
            AccessCheck::Denied
        }
    }

    /// Store the uploaded files, install dependencies if a manifest came
    /// along, and create the bot record as `stopped`. A failed install does
    /// not fail the upload; its output becomes the bot's logs.
    pub async fn upload(&self, request: UploadRequest) -> Result<Bot> {
        let name = request.name.trim();
        if name.is_empty() {
            return Err(RunnerError::InvalidInput("Bot name is required".to_string()));
        }
        if request.script.file_name.trim().is_empty() || request.script.content.is_empty() {
            return Err(RunnerError::InvalidInput("Bot file is required".to_string()));
        }

        let script_path = self.save_upload(&request.script, "bot.py").await?;
        let manifest_path = match &request.manifest {
            Some(file) if !file.content.is_empty() => {
                Some(self.save_upload(file, "requirements.txt").await?)
            }
            _ => None,
        };

        let logs = match &manifest_path {
            Some(manifest) => {
                let outcome = self.installer.install(&self.bots_dir, manifest).await;
                if !outcome.success {
                    format!("Failed to install requirements: {}", outcome.output)
                } else if outcome.output.trim().is_empty() {
                    READY_MESSAGE.to_string()
                } else {
                    outcome.output
                }
            }
            None => READY_MESSAGE.to_string(),
        };

        let mut new_bot = NewBot::new(name, &script_path).with_logs(logs);
        if let Some(manifest) = &manifest_path {
            new_bot = new_bot.with_manifest(manifest);
        }

        match self.store.create(new_bot).await {
            Ok(bot) => {
                tracing::info!("📥 {}: Uploaded '{}' ({})", bot.id, bot.name, script_path.display());
                Ok(bot)
            }
            Err(e) => {
                discard_upload(&script_path).await;
                if let Some(manifest) = &manifest_path {
                    discard_upload(manifest).await;
                }
                Err(e)
            }
        }
    }

    pub async fn list(&self) -> Result<Vec<Bot>> {
        self.store.list().await
    }

    pub async fn get(&self, id: &str) -> Result<Bot> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| RunnerError::NotFound(id.to_string()))
    }

    pub async fn start(&self, id: &str) -> Result<Bot> {
        self.supervisor.start(id).await
    }

    pub async fn stop(&self, id: &str) -> Result<Bot> {
        self.supervisor.stop(id).await
    }

    pub async fn restart(&self, id: &str) -> Result<Bot> {
        self.supervisor.restart(id).await
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.supervisor.delete(id).await
    }

    async fn save_upload(&self, file: &UploadedFile, fallback: &str) -> Result<PathBuf> {
        let unique = Uuid::new_v4().simple().to_string();
        let stored_name = format!(
            "{}-{}-{}",
            Utc::now().timestamp_millis(),
            &unique[..8],
            sanitize_file_name(&file.file_name, fallback)
        );
        let path = self.bots_dir.join(stored_name);
        tokio::fs::write(&path, &file.content).await?;
        Ok(path)
    }
}

async fn discard_upload(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        tracing::warn!("⚠️  Failed to clean up {}: {}", path.display(), e);
    }
}

/// Last path component of `name`, restricted to `[A-Za-z0-9._-]`
fn sanitize_file_name(name: &str, fallback: &str) -> String {
    let base = Path::new(name.trim())
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if cleaned.trim_matches('.').is_empty() {
        fallback.to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstallerConfig;
    use crate::core::BotStatus;
    use tempfile::TempDir;

    async fn runner(dir: &TempDir, installer: InstallerConfig) -> BotRunner {
        let config = RunnerConfig {
            bots_dir: dir.path().join("bots"),
            access_codes: vec!["DPX1432".to_string()],
            installer,
            ..RunnerConfig::default()
        };
        let store = Arc::new(SqliteStore::new(":memory:").await.unwrap());
        BotRunner::with_store(store, &config).await.unwrap()
    }

    fn script_upload(name: &str) -> UploadRequest {
        UploadRequest {
            name: name.to_string(),
            script: UploadedFile::new("echo.py", "print('hello')\n"),
            manifest: None,
        }
    }

    struct RejectingStore;

    #[async_trait::async_trait]
    impl BotStore for RejectingStore {
        async fn get(&self, _id: &str) -> Result<Option<Bot>> {
            Ok(None)
        }

        async fn create(&self, _new_bot: NewBot) -> Result<Bot> {
            Err(RunnerError::Store("disk full".to_string()))
        }

        async fn update(&self, id: &str, _update: crate::core::BotUpdate) -> Result<Bot> {
            Err(RunnerError::NotFound(id.to_string()))
        }

        async fn delete(&self, _id: &str) -> Result<bool> {
            Ok(false)
        }

        async fn list(&self) -> Result<Vec<Bot>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_failed_create_removes_saved_files() {
        let dir = TempDir::new().unwrap();
        let config = RunnerConfig {
            bots_dir: dir.path().join("bots"),
            ..RunnerConfig::default()
        };
        let runner = BotRunner::with_store(Arc::new(RejectingStore), &config)
            .await
            .unwrap();

        let result = runner.upload(script_upload("Doomed")).await;
        assert!(matches!(result, Err(RunnerError::Store(_))));

        let leftovers = std::fs::read_dir(runner.bots_dir()).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("bot.py", "x"), "bot.py");
        assert_eq!(sanitize_file_name("../../etc/passwd", "x"), "passwd");
        assert_eq!(sanitize_file_name("my bot (1).py", "x"), "my_bot__1_.py");
        assert_eq!(sanitize_file_name("..", "fallback.py"), "fallback.py");
        assert_eq!(sanitize_file_name("", "fallback.py"), "fallback.py");
    }

    #[tokio::test]
    async fn test_access_gate() {
        let dir = TempDir::new().unwrap();
        let runner = runner(&dir, InstallerConfig::default()).await;
        assert_eq!(runner.validate_access("DPX1432"), AccessCheck::Granted);
        assert_eq!(runner.validate_access(" DPX1432 "), AccessCheck::Granted);
        assert_eq!(runner.validate_access("nope"), AccessCheck::Denied);
        assert_eq!(runner.validate_access("   "), AccessCheck::Empty);
    }

    #[tokio::test]
    async fn test_upload_without_manifest() {
        let dir = TempDir::new().unwrap();
        let runner = runner(&dir, InstallerConfig::default()).await;

        let bot = runner.upload(script_upload("Echo")).await.unwrap();
        assert_eq!(bot.name, "Echo");
        assert_eq!(bot.status, BotStatus::Stopped);
        assert_eq!(bot.logs, READY_MESSAGE);
        assert!(bot.manifest_path.is_none());
        assert!(bot.script_path.starts_with(runner.bots_dir()));
        assert!(bot.script_path.to_string_lossy().ends_with("-echo.py"));
        assert_eq!(std::fs::read_to_string(&bot.script_path).unwrap(), "print('hello')\n");
    }

    #[tokio::test]
    async fn test_upload_rejects_blank_name() {
        let dir = TempDir::new().unwrap();
        let runner = runner(&dir, InstallerConfig::default()).await;
        let result = runner.upload(script_upload("  ")).await;
        assert!(matches!(result, Err(RunnerError::InvalidInput(_))));
        assert!(runner.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upload_install_failure_still_creates_bot() {
        let dir = TempDir::new().unwrap();
        let installer = InstallerConfig {
            program: "sh".to_string(),
            args: Vec::new(),
            timeout_secs: 10,
        };
        let runner = runner(&dir, installer).await;

        let mut request = script_upload("Needs deps");
        request.manifest = Some(UploadedFile::new(
            "requirements.txt",
            "echo 'ERROR: No matching distribution found' >&2\nexit 1\n",
        ));

        let bot = runner.upload(request).await.unwrap();
        assert_eq!(bot.status, BotStatus::Stopped);
        assert!(bot.logs.starts_with("Failed to install requirements: "));
        assert!(bot.logs.contains("No matching distribution"));
        assert!(bot.manifest_path.as_ref().unwrap().exists());
    }

    #[tokio::test]
    async fn test_upload_install_success_keeps_output() {
        let dir = TempDir::new().unwrap();
        let installer = InstallerConfig {
            program: "sh".to_string(),
            args: Vec::new(),
            timeout_secs: 10,
        };
        let runner = runner(&dir, installer).await;

        let mut request = script_upload("With deps");
        request.manifest = Some(UploadedFile::new("requirements.txt", "echo 'Successfully installed'\n"));

        let bot = runner.upload(request).await.unwrap();
        assert!(bot.logs.contains("Successfully installed"));
    }

    #[tokio::test]
    async fn test_get_unknown_bot() {
        let dir = TempDir::new().unwrap();
        let runner = runner(&dir, InstallerConfig::default()).await;
        assert!(matches!(runner.get("missing").await, Err(RunnerError::NotFound(_))));
    }
}
