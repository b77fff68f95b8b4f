//! Maintenance CLI for a Veil datastore.
//!
//! Opens the backend named in a JSON configuration file and runs one
//! maintenance command against it.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use veil_core::AbsoluteTime;
use veil_datastore::logging::{self, LogFormat};
use veil_datastore::{DatastoreConfig, DatastoreFactory, UsageObserver};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file. Defaults to an in-memory store.
    #[arg(long, short, env = "VEIL_DATASTORE_CONFIG")]
    config: Option<PathBuf>,

    /// Log line format.
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print stored payload size and quota.
    Stats,
    /// List every stored key, one per line.
    Keys,
    /// Delete every datum that has already expired.
    PurgeExpired,
    /// Evict datums until the store is back within its quota.
    EnforceQuota,
    /// Delete every datum.
    Drop {
        /// Confirm the deletion.
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init("veil_datastore=info", args.log_format)?;

    let config = match &args.config {
        Some(path) => DatastoreConfig::from_json_file(path)?,
        None => DatastoreConfig::default(),
    };
    let observers: Vec<Arc<dyn UsageObserver>> = Vec::new();
    let (mut store, tracker) = DatastoreFactory::new(config, observers)
        .open()
        .await
        .context("opening datastore")?;

    match args.cmd {
        Command::Stats => {
            let size = store.estimate_size().await?;
            println!("payload_bytes: {size}");
            match tracker.quota() {
                0 => println!("quota_bytes: unlimited"),
                quota => {
                    println!("quota_bytes: {quota}");
                    println!("excess_bytes: {}", tracker.excess());
                }
            }
        }
        Command::Keys => {
            let mut listed = 0u64;
            store
                .get_keys(|key| {
                    if let Some(key) = key {
                        println!("{key}");
                        listed += 1;
                    }
                })
                .await?;
            eprintln!("{listed} keys");
        }
        Command::PurgeExpired => {
            let purged = store.purge_expired(AbsoluteTime::now()).await?;
            println!("purged {purged} expired datums");
        }
        Command::EnforceQuota => {
            let excess = tracker.excess();
            let freed = store.make_room(excess).await?;
            println!("freed {freed} bytes");
        }
        Command::Drop { yes } => {
            if !yes {
                bail!("refusing to drop the datastore without --yes");
            }
            store.drop().await?;
            println!("datastore dropped");
        }
    }
    Ok(())
}
