//! roadwatchd - supervise live camera sessions until interrupted.
//!
//! Starts every configured source, logs a health line per active source on a
//! fixed interval, and stops all sessions on Ctrl-C.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use roadwatch::publish::FanOut;
use roadwatch::{
    detect, evidence, BroadcastHub, EngineConfig, MqttPublisher, Publisher, RtspConnector,
    SessionDeps, SourceId, SqlitePersistence, StreamRegistry,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Configuration file (TOML or JSON).
    #[arg(long, env = "ROADWATCH_CONFIG")]
    config: Option<PathBuf>,
    /// Source ids to start, in addition to the configured ones.
    #[arg(long = "source", value_name = "ID")]
    sources: Vec<SourceId>,
    /// Seconds between health log lines.
    #[arg(long, default_value_t = 5)]
    health_interval_s: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = EngineConfig::load_from(args.config.as_deref())?;
    log::info!(
        "roadwatchd starting (db={}, clips={}, detector={})",
        config.db_path,
        config.clips_dir.display(),
        config.detector.backend
    );

    let persistence = Arc::new(SqlitePersistence::open(&config.db_path)?);
    let detector = detect::provider_for(&config.detector)?;
    let encoder = evidence::encoder_for(
        config.recording.clip_format,
        config.publish.jpeg_quality,
    )?;

    let hub = Arc::new(BroadcastHub::default());
    let mut fan_out = FanOut::new().with(hub.clone());
    let mqtt = match &config.publish.mqtt {
        Some(settings) => {
            let publisher = Arc::new(
                MqttPublisher::connect(settings).context("failed to start MQTT publisher")?,
            );
            fan_out = fan_out.with(publisher.clone());
            Some(publisher)
        }
        None => None,
    };
    let publisher: Arc<dyn Publisher> = Arc::new(fan_out);

    let deps = SessionDeps {
        connector: Arc::new(RtspConnector::new()),
        detector,
        encoder,
        persistence,
        publisher,
    };

    let mut wanted = config.sources.clone();
    for id in args.sources {
        if !wanted.contains(&id) {
            wanted.push(id);
        }
    }
    let registry = StreamRegistry::new(config, deps);
    for id in &wanted {
        if !registry.start_source(*id) {
            log::warn!("source {} not started", id);
        }
    }
    if wanted.is_empty() {
        log::warn!("no sources configured; set ROADWATCH_SOURCES or pass --source");
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("error setting Ctrl-C handler")?;

    let health_interval = Duration::from_secs(args.health_interval_s.max(1));
    let mut last_health_log = Instant::now();
    log::info!("roadwatchd running; Ctrl-C to stop");

    while running.load(Ordering::SeqCst) {
        if last_health_log.elapsed() >= health_interval {
            let active = registry.list_active();
            for id in &active {
                if let Some(stats) = registry.get_stats(*id) {
                    log::info!(
                        "source {} phase={:?} frames={} detections={} confirmed={} clips={} recording={} reconnects={}",
                        id,
                        stats.phase,
                        stats.frame_count,
                        stats.total_detections,
                        stats.confirmed_events,
                        stats.clips_written,
                        stats.recording,
                        stats.reconnect_attempts
                    );
                }
            }
            log::debug!(
                "{} active sources, {} live subscribers, {} live messages dropped",
                active.len(),
                hub.subscriber_count(),
                hub.dropped()
            );
            last_health_log = Instant::now();
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    log::info!("shutdown signal received, stopping sessions...");
    registry.stop_all();
    if let Some(mqtt) = mqtt {
        mqtt.disconnect();
    }
    log::info!("roadwatchd stopped");
    Ok(())
}
