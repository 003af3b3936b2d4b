mod config;
mod models;
mod providers;
mod relay;
mod services;
mod stream;
mod ui;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use config::{Config, StorageBackend};
use services::export::{write_export, ExportFormat};
use services::{ChatController, ChatStore, Database, HttpRelayClient, RestChatStore};
use ui::terminal::TerminalView;

#[derive(Parser)]
#[command(name = "lannzai", version, about = "LannZAi chat relay and terminal client")]
struct Cli {
    /// TOML configuration file.
    #[arg(long, global = true, env = "LANNZAI_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the streaming chat relay.
    Relay {
        #[arg(long)]
        bind: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Chat with the relay from the terminal.
    Chat {
        /// Ask for whole replies instead of streamed ones.
        #[arg(long)]
        no_stream: bool,
    },
    /// Write a saved chat to a file.
    Export {
        id: String,
        #[arg(long, value_enum, default_value = "json")]
        format: ExportFormat,
        #[arg(long, default_value = ".")]
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,lannzai=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    tracing::debug!("Loaded configuration: {:?}", config);

    match cli.command {
        Command::Relay { bind, port } => {
            if let Some(bind) = bind {
                config.relay.bind = bind;
            }
            if let Some(port) = port {
                config.relay.port = port;
            }
            relay::serve(config.relay).await
        }
        Command::Chat { no_stream } => {
            if no_stream {
                config.client.stream_responses = false;
            }
            let db = Database::open(config.storage.sqlite_path.as_deref()).await?;
            let store = open_store(&config, &db)?;
            let view = Arc::new(TerminalView::stdout());
            let transport = HttpRelayClient::new(&config.client)?;
            let controller = Arc::new(ChatController::new(
                transport,
                store,
                view.clone(),
                &config.client,
            ));
            ui::terminal::run(controller, view, db).await
        }
        Command::Export { id, format, dir } => {
            let db = Database::open(config.storage.sqlite_path.as_deref()).await?;
            let store = open_store(&config, &db)?;
            let conversation = store
                .get(&id)
                .await?
                .ok_or_else(|| anyhow!("No saved chat with id {}", id))?;
            let path = write_export(&conversation, format, &dir)?;
            println!("{}", path.display());
            Ok(())
        }
    }
}

/// Conversations go to the configured backend; templates always stay local.
fn open_store(config: &Config, db: &Database) -> Result<Arc<dyn ChatStore>> {
    match config.storage.backend {
        StorageBackend::Sqlite => Ok(Arc::new(db.clone())),
        StorageBackend::Rest => {
            let url = config
                .storage
                .rest_url
                .as_deref()
                .ok_or_else(|| anyhow!("storage.rest_url is not set"))?;
            tracing::info!("Saving chats to {}", url);
            Ok(Arc::new(RestChatStore::new(
                url,
                config.storage.rest_key.clone(),
            )?))
        }
    }
}
