use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::InstallerConfig;
use crate::supervisor::output::forward_chunks;

/// Result of one installer run. Failure is data, not an error: the upload
/// flow keeps going and stores `output` as the bot's first logs.
#[derive(Debug, Clone, PartialEq)]
pub struct InstallOutcome {
    pub success: bool,
    /// Combined stdout + stderr in arrival order
    pub output: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

impl InstallOutcome {
    fn failed(output: String) -> Self {
        Self {
            success: false,
            output,
            exit_code: None,
            timed_out: false,
        }
    }
}

/// Runs the package installer against a dependency manifest
#[derive(Debug, Clone)]
pub struct DependencyInstaller {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl DependencyInstaller {
    pub fn new(config: &InstallerConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            timeout: config.timeout(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run `<program> <args..> <manifest>` in `work_dir` and wait for it
    pub async fn install(&self, work_dir: &Path, manifest: &Path) -> InstallOutcome {
        info!("📦 Installing dependencies from {}", manifest.display());

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(manifest)
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("❌ Failed to run {}: {}", self.program, e);
                return InstallOutcome::failed(format!("Failed to run {}: {}", self.program, e));
            }
        };

        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            forward_chunks(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_chunks(stderr, tx.clone());
        }
        drop(tx);

        let deadline = sleep(self.timeout);
        tokio::pin!(deadline);
        let mut output = String::new();
        let mut streams_open = true;

        let status = loop {
            tokio::select! {
                chunk = rx.recv(), if streams_open => match chunk {
                    Some(text) => output.push_str(&text),
                    None => streams_open = false,
                },
                status = child.wait(), if !streams_open => break status,
                _ = &mut deadline => {
                    warn!("⚠️  Dependency installation timed out after {:?}", self.timeout);
                    let _ = child.kill().await;
                    output.push_str(&format!(
                        "\n[Dependency installation timed out after {}s]",
                        self.timeout.as_secs()
                    ));
                    return InstallOutcome {
                        success: false,
                        output,
                        exit_code: None,
                        timed_out: true,
                    };
                }
            }
        };

        match status {
            Ok(status) => {
                let success = status.success();
                if success {
                    info!("✅ Dependencies installed");
                } else {
                    warn!("❌ Dependency installation failed ({})", status);
                }
                InstallOutcome {
                    success,
                    output,
                    exit_code: status.code(),
                    timed_out: false,
                }
            }
            Err(e) => {
                output.push_str(&format!("\n[Installer wait failed: {}]", e));
                InstallOutcome::failed(output)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sh_installer() -> DependencyInstaller {
        DependencyInstaller::new(&InstallerConfig {
            program: "sh".to_string(),
            args: Vec::new(),
            timeout_secs: 10,
        })
    }

    #[tokio::test]
    async fn test_install_success_captures_both_streams() {
        let dir = TempDir::new().unwrap();
        let manifest = dir.path().join("install.sh");
        std::fs::write(&manifest, "echo collected\necho warning >&2\nexit 0\n").unwrap();

        let outcome = sh_installer().install(dir.path(), &manifest).await;
        assert!(outcome.success);
        assert_eq!(outcome.exit_code, Some(0));
        assert!(outcome.output.contains("collected"));
        assert!(outcome.output.contains("warning"));
    }

    #[tokio::test]
    async fn test_install_failure_keeps_output() {
        let dir = TempDir::new().unwrap();
        let manifest = dir.path().join("install.sh");
        std::fs::write(&manifest, "echo 'No matching distribution' >&2\nexit 1\n").unwrap();

        let outcome = sh_installer().install(dir.path(), &manifest).await;
        assert!(!outcome.success);
        assert_eq!(outcome.exit_code, Some(1));
        assert!(outcome.output.contains("No matching distribution"));
    }

    #[tokio::test]
    async fn test_install_missing_program() {
        let dir = TempDir::new().unwrap();
        let installer = DependencyInstaller::new(&InstallerConfig {
            program: "definitely-not-pip".to_string(),
            ..InstallerConfig::default()
        });

        let outcome = installer.install(dir.path(), Path::new("requirements.txt")).await;
        assert!(!outcome.success);
        assert!(outcome.output.starts_with("Failed to run definitely-not-pip"));
    }

    #[tokio::test]
    async fn test_install_timeout() {
        let dir = TempDir::new().unwrap();
        let manifest = dir.path().join("install.sh");
        std::fs::write(&manifest, "echo started\nsleep 30\n").unwrap();

        let outcome = sh_installer()
            .with_timeout(Duration::from_millis(300))
            .install(dir.path(), &manifest)
            .await;
        assert!(!outcome.success);
        assert!(outcome.timed_out);
        assert!(outcome.output.contains("timed out"));
    }
}
