//! POS Store CLI
//!
//! Opens (and migrates) the store, then runs one command against it.
//! Results are printed as JSON.

use anyhow::Context;
use clap::{Parser, Subcommand};
use pos_store::commands::{self, AppState};
use pos_store::{Record, StoreConfig};
use std::fs;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "pos-store", version, about = "Offline point-of-sale store")]
struct Cli {
    /// Store name (default: $POS_STORE_NAME or "pos")
    #[arg(long)]
    name: Option<String>,

    /// Directory holding the store (default: $POS_DATA_DIR, else in-memory)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Migrate the store and show its version and record counts
    Init,
    /// Provision a staff user
    AddUser {
        username: String,
        pin: String,
        /// Cashier, Manager or Owner
        role: String,
    },
    /// Check a username/PIN pair and print the resulting session
    Login { username: String, pin: String },
    /// List users (without PIN hashes)
    Users,
    /// Count records in a collection
    Count { collection: String },
    /// Upsert a JSON array of records into a collection, all or nothing
    Import { collection: String, file: PathBuf },
}

impl Cli {
    fn config(&self) -> StoreConfig {
        let mut config = StoreConfig::from_env();
        if let Some(name) = &self.name {
            config.name = name.clone();
        }
        if let Some(dir) = &self.data_dir {
            config.data_dir = Some(dir.clone());
        }
        config
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(state: &AppState, command: Command) -> Result<(), String> {
    let result = match command {
        Command::Init => serde_json::to_value(commands::store_info(state).await?),
        Command::AddUser {
            username,
            pin,
            role,
        } => serde_json::to_value(commands::add_user(state, username, pin, role).await?),
        Command::Login { username, pin } => {
            serde_json::to_value(commands::login(state, username, pin).await?)
        }
        Command::Users => serde_json::to_value(commands::list_users(state).await?),
        Command::Count { collection } => {
            serde_json::to_value(commands::count(state, collection).await?)
        }
        Command::Import { collection, file } => {
            let raw = fs::read_to_string(&file)
                .map_err(|e| format!("cannot read {}: {}", file.display(), e))?;
            let records: Vec<Record> = serde_json::from_str(&raw)
                .map_err(|e| format!("{} is not a JSON array of records: {}", file.display(), e))?;
            let written = commands::import_records(state, collection, records).await?;
            serde_json::to_value(serde_json::json!({ "written": written }))
        }
    };
    let value = result.map_err(|e| e.to_string())?;
    print_json(&value).map_err(|e| e.to_string())
}

// ============================================================================
// MAIN
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info")
    ).init();

    let cli = Cli::parse();
    let config = cli.config();

    let state = commands::open_store(config)
        .await
        .map_err(anyhow::Error::msg)
        .context("store could not be opened")?;

    run(&state, cli.command).await.map_err(anyhow::Error::msg)
}
