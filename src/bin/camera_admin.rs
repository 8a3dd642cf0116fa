//! camera_admin - manage the camera catalogue and engine settings.

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use roadwatch::config::{KEY_CLIPS_DIR, KEY_CONSECUTIVE_THRESHOLD, KEY_COOLDOWN_SECONDS};
use roadwatch::storage::{StoredArtifact, StoredEvent};
use roadwatch::{Endpoint, GeoPoint, SourceId, SqlitePersistence};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the roadwatch database.
    #[arg(long, env = "ROADWATCH_DB_PATH", default_value = "roadwatch.db")]
    db_path: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register a camera. Prints the assigned source id.
    Add {
        #[arg(long, default_value = "")]
        address: String,
        #[arg(long, default_value_t = 554)]
        port: u16,
        #[arg(long, default_value = "")]
        path: String,
        /// Full stream URL; overrides address/port/path.
        #[arg(long)]
        url: Option<String>,
        /// Where credentials live: `env:VAR` or `file:/path`.
        #[arg(long)]
        credential_ref: Option<String>,
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,
        #[arg(long, allow_hyphen_values = true)]
        lon: f64,
    },
    /// List registered cameras as JSON.
    List,
    /// Store an engine tunable read at session start.
    SetConfig { key: String, value: String },
    /// Show recent events for a camera, newest first.
    Events {
        id: SourceId,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Serialize)]
struct EventReport {
    #[serde(flatten)]
    event: StoredEvent,
    artifacts: Vec<StoredArtifact>,
}

const KNOWN_KEYS: [&str; 3] = [KEY_CONSECUTIVE_THRESHOLD, KEY_COOLDOWN_SECONDS, KEY_CLIPS_DIR];

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let store = SqlitePersistence::open(&args.db_path)?;

    match args.command {
        Command::Add {
            address,
            port,
            path,
            url,
            credential_ref,
            lat,
            lon,
        } => {
            if url.is_none() && address.is_empty() {
                return Err(anyhow!("either --address or --url is required"));
            }
            let endpoint = Endpoint {
                address,
                port,
                path,
                credential_ref,
                url,
            };
            let id = store.add_source(
                &endpoint,
                GeoPoint {
                    latitude: lat,
                    longitude: lon,
                },
            )?;
            println!("{}", id);
        }
        Command::List => {
            let sources = store.list_sources()?;
            println!("{}", serde_json::to_string_pretty(&sources)?);
        }
        Command::SetConfig { key, value } => {
            if !KNOWN_KEYS.contains(&key.as_str()) {
                log::warn!("'{}' is not read by the engine (known: {:?})", key, KNOWN_KEYS);
            }
            store.set_config_value(&key, &value)?;
            log::info!("{} = {}", key, value);
        }
        Command::Events { id, limit } => {
            let mut reports = Vec::new();
            for event in store.events_for_source(id, limit)? {
                let artifacts = store.artifacts_for_event(event.id)?;
                reports.push(EventReport { event, artifacts });
            }
            println!("{}", serde_json::to_string_pretty(&reports)?);
        }
    }
    Ok(())
}
