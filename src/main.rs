//! lime-sync command-line interface.
//!
//! A thin host around the sync engine: one-shot commands for status,
//! setup, sync, clone, and device management, plus `serve` which runs the
//! auto-sync loop until interrupted. Configuration comes from `LIME_*`
//! environment variables.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use lime_sync::config::Settings;
use lime_sync::security::Vault;
use lime_sync::sync::cloud::{ObjectStore, S3Store};
use lime_sync::sync::SyncEngine;

#[derive(Parser)]
#[command(name = "lime-sync", version, about = "LIME multi-device sync core")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show engine status.
    Status,
    /// Initialize (first run) or unlock the encryption vault.
    Setup {
        /// Passphrase; prompted interactively when omitted.
        #[arg(long)]
        passphrase: Option<String>,
    },
    /// Run one push+pull sync cycle.
    Sync {
        #[arg(long)]
        passphrase: Option<String>,
    },
    /// Full data download for a device joining an existing mesh.
    Clone {
        #[arg(long)]
        passphrase: Option<String>,
    },
    /// List devices in the sync mesh.
    Devices,
    /// Remove a device and delete its remote changelog.
    RemoveDevice { device_id: String },
    /// Show recent changelog entries (debug).
    Changelog {
        #[arg(long, default_value_t = 50)]
        limit: u32,
        #[arg(long)]
        table: Option<String>,
    },
    /// Rotate the vault passphrase.
    ChangePassphrase,
    /// Run the auto-sync loop until interrupted.
    Serve {
        #[arg(long)]
        passphrase: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_env();
    let vault = Arc::new(Vault::new(&settings));
    let object_store: Arc<dyn ObjectStore> =
        Arc::new(S3Store::new(&settings).context("configuring object store")?);
    let engine = SyncEngine::initialize(settings, vault, object_store)
        .context("initializing sync engine")?;

    match cli.command {
        Command::Status => {
            print_json(&engine.status())?;
        }
        Command::Setup { passphrase } => {
            let passphrase = passphrase_or_prompt(passphrase, "Vault passphrase")?;
            let outcome = engine.setup_encryption(&passphrase).await?;
            print_json(&outcome)?;
        }
        Command::Sync { passphrase } => {
            unlock(&engine, passphrase).await?;
            let report = engine.sync_now().await?;
            print_json(&report)?;
        }
        Command::Clone { passphrase } => {
            unlock(&engine, passphrase).await?;
            let stats = engine.initial_clone().await?;
            print_json(&stats)?;
        }
        Command::Devices => {
            print_json(&engine.list_devices()?)?;
        }
        Command::RemoveDevice { device_id } => {
            let removed = engine.remove_device(&device_id).await?;
            print_json(&removed)?;
        }
        Command::Changelog { limit, table } => {
            print_json(&engine.changelog(limit, table.as_deref())?)?;
        }
        Command::ChangePassphrase => {
            let current = prompt_passphrase("Current passphrase")?;
            let new = dialoguer::Password::new()
                .with_prompt("New passphrase")
                .with_confirmation("Confirm new passphrase", "Passphrases do not match")
                .interact()?;
            let vault = Arc::clone(engine.vault());
            let info =
                tokio::task::spawn_blocking(move || vault.change_passphrase(&current, &new))
                    .await??;
            print_json(&info)?;
            eprintln!("Other devices must re-unlock with the new passphrase.");
        }
        Command::Serve { passphrase } => {
            unlock(&engine, passphrase).await?;
            engine.start_auto_sync();
            tracing::info!("Auto-sync running, press ctrl-c to stop");
            tokio::signal::ctrl_c().await?;
            engine.stop_auto_sync().await;
        }
    }

    Ok(())
}

async fn unlock(engine: &SyncEngine, passphrase: Option<String>) -> anyhow::Result<()> {
    let passphrase = passphrase_or_prompt(passphrase, "Vault passphrase")?;
    let outcome = engine.setup_encryption(&passphrase).await?;
    if outcome.action == "initialized" {
        eprintln!("Vault initialized (key id {})", outcome.key_id);
    }
    Ok(())
}

fn passphrase_or_prompt(passphrase: Option<String>, prompt: &str) -> anyhow::Result<String> {
    match passphrase {
        Some(p) => Ok(p),
        None => prompt_passphrase(prompt),
    }
}

fn prompt_passphrase(prompt: &str) -> anyhow::Result<String> {
    Ok(dialoguer::Password::new().with_prompt(prompt).interact()?)
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
