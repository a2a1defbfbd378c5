//! Administration tool for the database key store
//!
//! Usage:
//!   exptrac-keyctl status
//!   exptrac-keyctl init
//!   exptrac-keyctl rotate [--force]
//!   exptrac-keyctl backup
//!   exptrac-keyctl list-backups
//!   exptrac-keyctl restore <BACKUP_ID>
//!   exptrac-keyctl delete [--include-backups]
//!
//! Works against the file blob store at `KEY_STORAGE_PATH`, sealed with
//! `EXPTRAC_MASTER_KEY`. Hosts running this tool have no biometric hardware,
//! so a store with biometric gating enabled cannot be read here.
// Copyright 2025 Exptrac Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use exptrac_config::KeyVaultConfig;
use exptrac_keys::{
    init_key_manager, open_or_create_key, MockBiometrics, ProgressObserver, RotationStage,
};
use exptrac_logging::{init_logging, LogFormat};
use std::sync::Arc;
use tracing::warn;

#[derive(Parser)]
#[command(name = "exptrac-keyctl", version, about = "Manage the Exptrac database encryption key")]
struct Cli {
    /// Directory holding the sealed key blobs
    #[arg(long, env = "KEY_STORAGE_PATH")]
    storage_path: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show key version, metadata and biometric state
    Status,
    /// Generate and store a key if none exists
    Init,
    /// Rotate the key, snapshotting the old one first.
    ///
    /// The database stays encrypted under the old key until it is re-keyed
    /// separately; the snapshot is what keeps it openable until then.
    Rotate {
        /// Skip the snapshot. Unless backups are already enabled, the old key
        /// is destroyed and a database still encrypted under it can no longer
        /// be opened.
        #[arg(long)]
        force: bool,
    },
    /// Snapshot the current key
    Backup,
    /// List recorded backups
    ListBackups,
    /// Make a backup the current key
    Restore {
        backup_id: String,
    },
    /// Destroy the key and its records
    Delete {
        /// Also delete every recorded backup
        #[arg(long)]
        include_backups: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = KeyVaultConfig::from_env()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;
    if let Some(path) = cli.storage_path {
        config.storage.path = path;
    }

    let format = config.log_format().parse::<LogFormat>().unwrap_or_default();
    if let Err(e) = init_logging("exptrac-keyctl", config.log_level(), format) {
        eprintln!("Logging unavailable: {}", e);
    }

    let manager = init_key_manager(&config, Arc::new(MockBiometrics::unavailable()))
        .await
        .context("Failed to open key store")?;

    match cli.command {
        Command::Status => {
            println!("Storage:   {}", config.storage_path());
            println!("Key:       {}", if manager.has_key().await? { "present" } else { "absent" });
            println!("Version:   {}", manager.current_version().await);
            println!("Biometric: {}", if manager.is_biometric_enabled().await { "enabled" } else { "disabled" });
            match manager.metadata().await {
                Some(metadata) => {
                    println!("Algorithm: {} ({} bits)", metadata.algorithm, metadata.key_size);
                    println!("Created:   {}", metadata.created_at.to_rfc3339());
                    if let Some(rotated) = metadata.last_rotated {
                        println!("Rotated:   {}", rotated.to_rfc3339());
                    }
                    println!("Backups:   {}", if metadata.backup_enabled { "enabled" } else { "disabled" });
                }
                None => println!("Metadata:  none"),
            }
        }
        Command::Init => {
            let existed = manager.has_key().await?;
            open_or_create_key(&manager).await?;
            if existed {
                println!("Key already present (version {})", manager.current_version().await);
            } else {
                println!("Key generated (version {})", manager.current_version().await);
            }
        }
        Command::Rotate { force } => {
            let observer: ProgressObserver = &|stage: RotationStage| {
                println!("[{:>3}%] {}", stage.percent(), stage.message());
            };
            let rotation = if force {
                manager.rotate_committed(Some(observer)).await?
            } else {
                manager.rotate_with_backup(Some(observer)).await?
            };
            println!("Rotated to version {}", rotation.metadata.version);
            match &rotation.backup_id {
                Some(backup_id) => {
                    println!("Previous key saved as backup {}", backup_id);
                    warn!(
                        backup_id = %backup_id,
                        "Database is still encrypted under the previous key until it is re-keyed"
                    );
                }
                None => warn!("Previous key was not backed up; re-key the database before closing it"),
            }
        }
        Command::Backup => {
            let backup_id = manager.create_backup().await?;
            println!("Backup created: {}", backup_id);
        }
        Command::ListBackups => {
            let backups = manager.list_backups().await;
            if backups.is_empty() {
                println!("No backups recorded");
            }
            for backup in backups {
                println!("{}  version {}  {}", backup.id, backup.version, backup.timestamp.to_rfc3339());
            }
        }
        Command::Restore { backup_id } => {
            manager.restore_backup(&backup_id).await?;
            println!("Restored {} (version {})", backup_id, manager.current_version().await);
        }
        Command::Delete { include_backups } => {
            manager.delete_key(include_backups).await?;
            println!("Key deleted");
        }
    }

    Ok(())
}
