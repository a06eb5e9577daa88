// ABOUTME: Entry point for the tally binary.
// ABOUTME: Parses CLI arguments, initializes tracing, wires the store to its encrypted persistor, and runs one command.

mod config;

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tally_core::{CounterState, StoreHandle};
use tally_persist::{EncryptTransform, FileStorage, PersistConfig, Persistor, Storage};

use crate::config::TallyConfig;

#[derive(Parser)]
#[command(name = "tally", version, about = "A counter that remembers, encrypted at rest")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print the current state
    Show,
    /// Increment the counter
    Inc {
        #[arg(long, default_value_t = 1)]
        times: u32,
    },
    /// Decrement the counter
    Dec {
        #[arg(long, default_value_t = 1)]
        times: u32,
    },
    /// Set the counter to a value (lastCount is left alone)
    Set {
        #[arg(allow_hyphen_values = true)]
        value: i64,
    },
    /// Delete the persisted state
    Purge,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tally=info,tally_core=info,tally_persist=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = TallyConfig::from_env()?;
    tracing::debug!(?config, "loaded configuration");

    let storage: Arc<dyn Storage> = Arc::new(FileStorage::new(config.state_dir()));
    let transform = EncryptTransform::from_passphrase(&config.secret_key)
        .context("failed to derive encryption key")?;
    let persist_config = PersistConfig::new(config.persist_key.clone(), storage)
        .with_version(config.persist_version)
        .with_transform(transform);

    let store = tally_core::spawn(CounterState::new());
    let persistor = Persistor::start(&store, persist_config);
    persistor.wait_rehydrated().await?;

    let state = run(&store, &persistor, cli.command.unwrap_or(Command::Show)).await?;

    persistor.stop().await?;

    println!("{}", serde_json::to_string(&state)?);
    Ok(())
}

async fn run(store: &StoreHandle, persistor: &Persistor, command: Command) -> anyhow::Result<CounterState> {
    let state = match command {
        Command::Show => store.get_state().await,
        Command::Inc { times } => {
            for _ in 0..times {
                store.increment().await?;
            }
            store.get_state().await
        }
        Command::Dec { times } => {
            for _ in 0..times {
                store.decrement().await?;
            }
            store.get_state().await
        }
        Command::Set { value } => store.set_count(value).await?,
        Command::Purge => {
            persistor.purge().await?;
            tracing::info!("persisted state removed");
            store.get_state().await
        }
    };
    Ok(state)
}
