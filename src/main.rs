// src/main.rs
// opencode-mem - persistent per-project memory service

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use opencode_mem::config::Config;
use opencode_mem::db::DatabasePool;
use opencode_mem::db::cleanup::{cleanup_project_sync, purge_sync};

#[derive(Parser)]
#[command(name = "opencode-mem", version, about = "Memory service for AI coding assistants")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP service (default)
    Serve {
        /// Override the configured listen port
        #[arg(long)]
        port: Option<u16>,
    },
    /// Trim a project's memories to count and age budgets
    Cleanup {
        #[arg(long)]
        project: String,
        #[arg(long)]
        max_memories: Option<usize>,
        #[arg(long)]
        max_age_days: Option<u32>,
        /// Report what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,
    },
    /// Delete stored data, for one project or everything
    Purge {
        #[arg(long)]
        project: Option<String>,
        /// Required; purge refuses to run without it
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Only the global env file is honored, never one from the CWD.
    if let Some(home) = dirs::home_dir() {
        let _ = dotenvy::from_path(home.join(".config/opencode/.env"));
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    // Config or migration problems are fatal: exit non-zero via `?`.
    let mut config = Config::load()?;

    match Cli::parse().command {
        None | Some(Commands::Serve { port: None }) => {
            opencode_mem::server::run(config).await?;
        }
        Some(Commands::Serve { port: Some(port) }) => {
            config.port = port;
            opencode_mem::server::run(config).await?;
        }
        Some(Commands::Cleanup {
            project,
            max_memories,
            max_age_days,
            dry_run,
        }) => {
            let pool = DatabasePool::open(&config.db_path()).await?;
            let report = pool
                .interact_raw(move |conn| {
                    cleanup_project_sync(conn, &project, max_memories, max_age_days, dry_run)
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Some(Commands::Purge { project, yes }) => {
            if !yes {
                anyhow::bail!("purge refused: pass --yes to confirm");
            }
            let pool = DatabasePool::open(&config.db_path()).await?;
            let report = pool
                .interact_raw(move |conn| purge_sync(conn, project.as_deref()))
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
