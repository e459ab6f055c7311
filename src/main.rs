use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tidings::config::Config;
use tidings::engine::scheduler::{shutdown_channel, Scheduler};
use tidings::engine::{import_subscriptions, Engine};
use tidings::feed::{self, export_opml, Fetcher};
use tidings::storage::{save_state, FileStore, LoadError, StateStore, StoreError};
use tidings::web;

/// Get the config directory path (~/.config/tidings/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("tidings"))
}

#[derive(Parser, Debug)]
#[command(name = "tidings", version, about = "Personal Atom/RSS aggregator with a web reader")]
struct Args {
    /// Config file (default: ~/.config/tidings/config.toml)
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch every feed listed in an OPML file and write the initial state
    Import {
        #[arg(value_name = "OPML")]
        opml: PathBuf,

        /// Replace an existing state document
        #[arg(long)]
        force: bool,
    },
    /// Load the state, refresh it periodically and serve unread entries
    Serve,
    /// Write the current subscriptions as OPML
    Export {
        #[arg(value_name = "FILE")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let (config_path, config_dir) = match &args.config {
        Some(path) => {
            let dir = path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            (path.clone(), dir)
        }
        None => {
            let dir = get_config_dir()?;
            (dir.join("config.toml"), dir)
        }
    };
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    let state_path = config.resolve_state_path(&config_dir);

    match args.command {
        Command::Import { opml, force } => import(&config, &opml, &state_path, force).await,
        Command::Serve => serve(&config, &state_path).await,
        Command::Export { output } => export(&config, &state_path, &output).await,
    }
}

async fn import(config: &Config, opml: &Path, state_path: &Path, force: bool) -> Result<()> {
    if state_path.exists() && !force {
        anyhow::bail!(
            "State already exists at {}. Re-run with --force to replace it.",
            state_path.display()
        );
    }

    let opml_str = opml
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in OPML path"))?;
    let urls = feed::parse(opml_str)
        .await
        .context("Failed to parse OPML file")?;
    if urls.is_empty() {
        eprintln!("Warning: No feeds found in {}", opml.display());
    }

    let fetcher = Fetcher::new(config.fetch_policy()).context("Failed to build HTTP client")?;
    let report = import_subscriptions(&urls, &fetcher, config.engine_options(), Utc::now()).await;

    if let Some(parent) = state_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let store = FileStore::new(state_path);
    save_state(&store, &report.state)
        .await
        .with_context(|| format!("Failed to write state to {}", state_path.display()))?;

    println!(
        "Imported {} feeds into {}",
        report.state.source_count(),
        state_path.display()
    );
    for (url, reason) in &report.skipped {
        println!("  skipped {}: {}", url, reason);
    }
    Ok(())
}

async fn load_engine(config: &Config, state_path: &Path) -> Result<Engine<FileStore>> {
    let fetcher = Fetcher::new(config.fetch_policy()).context("Failed to build HTTP client")?;
    let store = Arc::new(FileStore::new(state_path));
    match Engine::load(store, fetcher, config.engine_options()).await {
        Ok(engine) => Ok(engine),
        Err(LoadError::Read(StoreError::NotFound(_))) => anyhow::bail!(
            "No state found at {}. Import your subscriptions first:\n  tidings import /path/to/feeds.opml",
            state_path.display()
        ),
        Err(e) => Err(e).with_context(|| format!("Failed to load state from {}", state_path.display())),
    }
}

async fn serve(config: &Config, state_path: &Path) -> Result<()> {
    let engine = Arc::new(load_engine(config, state_path).await?);

    let (trigger, shutdown) = shutdown_channel();
    let scheduler = Scheduler::spawn(
        Arc::clone(&engine),
        config.refresh_interval(),
        config.persist_interval(),
        shutdown.clone(),
    );

    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    tracing::info!(addr = %config.listen_addr, "Serving");

    let mut server_shutdown = shutdown;
    let server = tokio::spawn(async move {
        axum::serve(listener, web::router(engine))
            .with_graceful_shutdown(async move { server_shutdown.wait().await })
            .await
    });

    let Scheduler { refresh, mut persist } = scheduler;
    // The persist loop only ends on its own after an unrecoverable encode error
    let finished_early = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
            None
        }
        result = &mut persist => Some(result),
    };
    trigger.trigger();
    let persist_result = match finished_early {
        Some(result) => result,
        None => persist.await,
    };

    refresh.await.context("Refresh task panicked")?;
    server
        .await
        .context("Server task panicked")?
        .context("Web server failed")?;
    persist_result
        .context("Persist task panicked")?
        .context("Failed to persist state")?;
    Ok(())
}

async fn export(config: &Config, state_path: &Path, output: &Path) -> Result<()> {
    let engine = load_engine(config, state_path).await?;
    let state = engine.shared().snapshot().await;
    let opml = export_opml(&state).context("Failed to render OPML")?;

    FileStore::new(output)
        .save(opml.into_bytes())
        .await
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!("Exported {} feeds to {}", state.source_count(), output.display());
    Ok(())
}
