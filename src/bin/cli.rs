use clap::{Parser, Subcommand};
use futures::StreamExt;
use kissbot_runner::{BotRunner, RunnerConfig, UploadRequest, UploadedFile};
use signal_hook::consts::signal::*;
use signal_hook_tokio::Signals;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "kissbot-runner")]
#[command(about = "KissBot Runner CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database path (overrides the configuration)
    #[arg(short, long)]
    db: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List uploaded bots
    List,

    /// Print a bot's logs
    Logs {
        /// Bot id
        id: String,
    },

    /// Upload a script (and optional requirements file)
    Upload {
        /// Display name
        #[arg(short, long)]
        name: String,

        /// Script to run
        #[arg(short, long)]
        script: PathBuf,

        /// Dependency manifest (requirements.txt)
        #[arg(short, long)]
        manifest: Option<PathBuf>,
    },

    /// Delete a bot and its files
    Delete {
        /// Bot id
        id: String,
    },

    /// Run a bot in the foreground until it exits (Ctrl-C stops it)
    Run {
        /// Bot id
        id: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kissbot_runner=warn".into()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let mut config = RunnerConfig::load(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }

    let runner = BotRunner::new(&config).await?;

    match cli.command {
        Commands::List => {
            let bots = runner.list().await?;
            if bots.is_empty() {
                println!("No bots uploaded yet.");
            }
            for bot in bots {
                let status = match bot.status {
                    kissbot_runner::BotStatus::Running => "🟢 RUNNING",
                    kissbot_runner::BotStatus::Stopped => "🔴 STOPPED",
                    kissbot_runner::BotStatus::Error => "❌ ERROR",
                };
                println!(
                    "{:36}  {:20} {:12} {}",
                    bot.id,
                    bot.name,
                    status,
                    bot.uploaded_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }

        Commands::Logs { id } => {
            let bot = runner.get(&id).await?;
            println!("{}", bot.logs);
        }

        Commands::Upload {
            name,
            script,
            manifest,
        } => {
            let script_file = read_upload(&script).await?;
            let manifest_file = match manifest {
                Some(path) => Some(read_upload(&path).await?),
                None => None,
            };

            println!("📥 Uploading {}...", script.display());
            let bot = runner
                .upload(UploadRequest {
                    name,
                    script: script_file,
                    manifest: manifest_file,
                })
                .await?;

            println!("\n✅ Uploaded: {} ({})", bot.name, bot.id);
            println!("   Script: {}", bot.script_path.display());
            println!("\n{}", bot.logs);
        }

        Commands::Delete { id } => {
            runner.delete(&id).await?;
            println!("🗑️  Deleted {}", id);
        }

        Commands::Run { id } => {
            let supervisor = runner.supervisor();
            let mut exits = supervisor.subscribe();
            let mut signals = Signals::new(&[SIGTERM, SIGINT])?;

            let bot = runner.start(&id).await?;
            println!("🚀 {} started (PID {})", bot.name, supervisor.pid(&id).unwrap_or(0));

            loop {
                tokio::select! {
                    event = exits.recv() => match event {
                        Ok(event) if event.bot_id == id => break,
                        Ok(_) => continue,
                        Err(e) => anyhow::bail!("exit notifications lost: {}", e),
                    },
                    Some(_) = signals.next() => {
                        println!("\n🛑 Stopping {}...", bot.name);
                        supervisor.shutdown(config.supervisor.stop_timeout()).await;
                        break;
                    }
                }
            }

            let bot = runner.get(&id).await?;
            println!("{}", bot.logs);
            println!("\nStatus: {}", bot.status);
        }
    }

    Ok(())
}

async fn read_upload(path: &std::path::Path) -> anyhow::Result<UploadedFile> {
    let content = tokio::fs::read(path).await?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(UploadedFile::new(file_name, content))
}
