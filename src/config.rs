use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::storage::Persistence;
use crate::SourceId;

const DEFAULT_DB_PATH: &str = "roadwatch.db";
const DEFAULT_CLIPS_DIR: &str = "clips";
const DEFAULT_SNAPSHOTS_DIR: &str = "snapshots";
const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RECONNECT_BACKOFF_MS: u64 = 5_000;
const DEFAULT_IO_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_MAX_READ_FAILURES: u32 = 20;
const DEFAULT_READ_FAILURE_SLEEP_MS: u64 = 100;
const DEFAULT_FRAME_SKIP: u32 = 2;
const DEFAULT_EXPECTED_FPS: u32 = 15;
const DEFAULT_REQUIRED_CONSECUTIVE: u32 = 3;
const DEFAULT_COOLDOWN_SECS: u64 = 10;
const DEFAULT_PRE_ROLL_SECS: u32 = 5;
const DEFAULT_POST_ROLL_SECS: u32 = 5;
const DEFAULT_PUBLISH_INTERVAL_MS: u64 = 150;
const DEFAULT_PUBLISH_MAX_WIDTH: u32 = 640;
const DEFAULT_JPEG_QUALITY: u8 = 70;
const DEFAULT_MQTT_TOPIC_PREFIX: &str = "roadwatch";
const DEFAULT_DETECTOR_BACKEND: &str = "stub";
const DEFAULT_TARGET_LABEL: &str = "severe";
const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;
const DEFAULT_MODEL_INPUT_SIZE: u32 = 224;

/// Persistence keys read at session start.
pub const KEY_CONSECUTIVE_THRESHOLD: &str = "consecutive_threshold";
pub const KEY_COOLDOWN_SECONDS: &str = "cooldown_seconds";
pub const KEY_CLIPS_DIR: &str = "clips_dir";

#[derive(Debug, Deserialize, Default)]
struct EngineConfigFile {
    db_path: Option<String>,
    clips_dir: Option<PathBuf>,
    snapshots_dir: Option<PathBuf>,
    sources: Option<Vec<i64>>,
    capture: Option<CaptureConfigFile>,
    confirmation: Option<ConfirmationConfigFile>,
    recording: Option<RecordingConfigFile>,
    publish: Option<PublishConfigFile>,
    detector: Option<DetectorConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    reconnect_max_attempts: Option<u32>,
    reconnect_backoff_ms: Option<u64>,
    io_timeout_ms: Option<u64>,
    max_read_failures: Option<u32>,
    read_failure_sleep_ms: Option<u64>,
    frame_skip: Option<u32>,
    expected_fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct ConfirmationConfigFile {
    required_consecutive: Option<u32>,
    cooldown_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct RecordingConfigFile {
    pre_roll_secs: Option<u32>,
    post_roll_secs: Option<u32>,
    clip_format: Option<ClipFormat>,
}

#[derive(Debug, Deserialize, Default)]
struct PublishConfigFile {
    min_interval_ms: Option<u64>,
    max_width: Option<u32>,
    jpeg_quality: Option<u8>,
    mqtt: Option<MqttConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct MqttConfigFile {
    broker_addr: Option<String>,
    topic_prefix: Option<String>,
    client_id: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    target_label: Option<String>,
    target_index: Option<usize>,
    input_size: Option<u32>,
    confidence_threshold: Option<f32>,
    per_session: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub db_path: String,
    pub clips_dir: PathBuf,
    pub snapshots_dir: PathBuf,
    /// Sources started automatically by the daemon.
    pub sources: Vec<SourceId>,
    pub capture: CaptureSettings,
    pub confirmation: ConfirmationSettings,
    pub recording: RecordingSettings,
    pub publish: PublishSettings,
    pub detector: DetectorSettings,
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub reconnect_max_attempts: u32,
    pub reconnect_backoff: Duration,
    pub io_timeout: Duration,
    pub max_read_failures: u32,
    pub read_failure_sleep: Duration,
    /// Every Nth frame is sent to the detector.
    pub frame_skip: u32,
    pub expected_fps: u32,
}

#[derive(Debug, Clone)]
pub struct ConfirmationSettings {
    pub required_consecutive: u32,
    pub cooldown: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClipFormat {
    Mjpeg,
    Mp4,
}

impl ClipFormat {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mjpeg" => Ok(ClipFormat::Mjpeg),
            "mp4" => Ok(ClipFormat::Mp4),
            other => Err(anyhow!("unknown clip format '{}' (expected mjpeg or mp4)", other)),
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ClipFormat::Mjpeg => "avi",
            ClipFormat::Mp4 => "mp4",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordingSettings {
    pub pre_roll_secs: u32,
    pub post_roll_secs: u32,
    pub clip_format: ClipFormat,
}

#[derive(Debug, Clone)]
pub struct PublishSettings {
    pub min_interval: Duration,
    pub max_width: u32,
    pub jpeg_quality: u8,
    pub mqtt: Option<MqttSettings>,
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub broker_addr: String,
    pub topic_prefix: String,
    pub client_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub backend: String,
    pub model_path: Option<PathBuf>,
    pub target_label: String,
    /// Output index of the target class for classifier models.
    pub target_index: usize,
    /// Square model input edge in pixels.
    pub input_size: u32,
    pub confidence_threshold: f32,
    /// One detector instance per session instead of one shared instance.
    pub per_session: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from_file(EngineConfigFile::default())
    }
}

impl EngineConfig {
    /// Load from `ROADWATCH_CONFIG` (if set), then environment overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("ROADWATCH_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(config_path: Option<&Path>) -> Result<Self> {
        let file_cfg = match config_path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: EngineConfigFile) -> Self {
        let capture = file.capture.unwrap_or_default();
        let confirmation = file.confirmation.unwrap_or_default();
        let recording = file.recording.unwrap_or_default();
        let publish = file.publish.unwrap_or_default();
        let detector = file.detector.unwrap_or_default();

        let mqtt = publish.mqtt.and_then(|mqtt| {
            mqtt.broker_addr.map(|broker_addr| MqttSettings {
                broker_addr,
                topic_prefix: mqtt
                    .topic_prefix
                    .unwrap_or_else(|| DEFAULT_MQTT_TOPIC_PREFIX.to_string()),
                client_id: mqtt.client_id,
            })
        });

        Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            clips_dir: file
                .clips_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CLIPS_DIR)),
            snapshots_dir: file
                .snapshots_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SNAPSHOTS_DIR)),
            sources: file
                .sources
                .unwrap_or_default()
                .into_iter()
                .map(SourceId)
                .collect(),
            capture: CaptureSettings {
                reconnect_max_attempts: capture
                    .reconnect_max_attempts
                    .unwrap_or(DEFAULT_RECONNECT_MAX_ATTEMPTS),
                reconnect_backoff: Duration::from_millis(
                    capture
                        .reconnect_backoff_ms
                        .unwrap_or(DEFAULT_RECONNECT_BACKOFF_MS),
                ),
                io_timeout: Duration::from_millis(
                    capture.io_timeout_ms.unwrap_or(DEFAULT_IO_TIMEOUT_MS),
                ),
                max_read_failures: capture
                    .max_read_failures
                    .unwrap_or(DEFAULT_MAX_READ_FAILURES),
                read_failure_sleep: Duration::from_millis(
                    capture
                        .read_failure_sleep_ms
                        .unwrap_or(DEFAULT_READ_FAILURE_SLEEP_MS),
                ),
                frame_skip: capture.frame_skip.unwrap_or(DEFAULT_FRAME_SKIP),
                expected_fps: capture.expected_fps.unwrap_or(DEFAULT_EXPECTED_FPS),
            },
            confirmation: ConfirmationSettings {
                required_consecutive: confirmation
                    .required_consecutive
                    .unwrap_or(DEFAULT_REQUIRED_CONSECUTIVE),
                cooldown: Duration::from_secs(
                    confirmation.cooldown_secs.unwrap_or(DEFAULT_COOLDOWN_SECS),
                ),
            },
            recording: RecordingSettings {
                pre_roll_secs: recording.pre_roll_secs.unwrap_or(DEFAULT_PRE_ROLL_SECS),
                post_roll_secs: recording.post_roll_secs.unwrap_or(DEFAULT_POST_ROLL_SECS),
                clip_format: recording.clip_format.unwrap_or(ClipFormat::Mjpeg),
            },
            publish: PublishSettings {
                min_interval: Duration::from_millis(
                    publish.min_interval_ms.unwrap_or(DEFAULT_PUBLISH_INTERVAL_MS),
                ),
                max_width: publish.max_width.unwrap_or(DEFAULT_PUBLISH_MAX_WIDTH),
                jpeg_quality: publish.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
                mqtt,
            },
            detector: DetectorSettings {
                backend: detector
                    .backend
                    .unwrap_or_else(|| DEFAULT_DETECTOR_BACKEND.to_string()),
                model_path: detector.model_path,
                target_label: detector
                    .target_label
                    .unwrap_or_else(|| DEFAULT_TARGET_LABEL.to_string()),
                target_index: detector.target_index.unwrap_or(0),
                input_size: detector.input_size.unwrap_or(DEFAULT_MODEL_INPUT_SIZE),
                confidence_threshold: detector
                    .confidence_threshold
                    .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD),
                per_session: detector.per_session.unwrap_or(false),
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(path) = std::env::var("ROADWATCH_DB_PATH") {
            if !path.trim().is_empty() {
                self.db_path = path;
            }
        }
        if let Ok(dir) = std::env::var("ROADWATCH_CLIPS_DIR") {
            if !dir.trim().is_empty() {
                self.clips_dir = PathBuf::from(dir);
            }
        }
        if let Ok(dir) = std::env::var("ROADWATCH_SNAPSHOTS_DIR") {
            if !dir.trim().is_empty() {
                self.snapshots_dir = PathBuf::from(dir);
            }
        }
        if let Ok(sources) = std::env::var("ROADWATCH_SOURCES") {
            let parsed = split_csv(&sources)
                .iter()
                .map(|id| id.parse::<SourceId>())
                .collect::<Result<Vec<_>>>()?;
            if !parsed.is_empty() {
                self.sources = parsed;
            }
        }
        if let Ok(required) = std::env::var("ROADWATCH_REQUIRED_CONSECUTIVE") {
            self.confirmation.required_consecutive = required.trim().parse().map_err(|_| {
                anyhow!("ROADWATCH_REQUIRED_CONSECUTIVE must be a positive integer")
            })?;
        }
        if let Ok(cooldown) = std::env::var("ROADWATCH_COOLDOWN_SECS") {
            let seconds: u64 = cooldown.trim().parse().map_err(|_| {
                anyhow!("ROADWATCH_COOLDOWN_SECS must be an integer number of seconds")
            })?;
            self.confirmation.cooldown = Duration::from_secs(seconds);
        }
        if let Ok(addr) = std::env::var("ROADWATCH_MQTT_ADDR") {
            if !addr.trim().is_empty() {
                match self.publish.mqtt.as_mut() {
                    Some(mqtt) => mqtt.broker_addr = addr,
                    None => {
                        self.publish.mqtt = Some(MqttSettings {
                            broker_addr: addr,
                            topic_prefix: DEFAULT_MQTT_TOPIC_PREFIX.to_string(),
                            client_id: None,
                        })
                    }
                }
            }
        }
        if let Ok(format) = std::env::var("ROADWATCH_CLIP_FORMAT") {
            self.recording.clip_format = ClipFormat::parse(&format)?;
        }
        if let Ok(backend) = std::env::var("ROADWATCH_DETECTOR") {
            if !backend.trim().is_empty() {
                self.detector.backend = backend.trim().to_string();
            }
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.capture.expected_fps == 0 {
            return Err(anyhow!("capture.expected_fps must be greater than zero"));
        }
        if self.capture.frame_skip == 0 {
            return Err(anyhow!("capture.frame_skip must be greater than zero"));
        }
        if self.capture.max_read_failures == 0 {
            return Err(anyhow!("capture.max_read_failures must be greater than zero"));
        }
        if self.capture.io_timeout.is_zero() {
            return Err(anyhow!("capture.io_timeout_ms must be greater than zero"));
        }
        if self.confirmation.required_consecutive == 0 {
            return Err(anyhow!(
                "confirmation.required_consecutive must be greater than zero"
            ));
        }
        if !(1..=100).contains(&self.publish.jpeg_quality) {
            return Err(anyhow!("publish.jpeg_quality must be within 1..=100"));
        }
        if self.detector.input_size == 0 {
            return Err(anyhow!("detector.input_size must be greater than zero"));
        }
        if !(0.0..=1.0).contains(&self.detector.confidence_threshold) {
            return Err(anyhow!("detector.confidence_threshold must be within 0..=1"));
        }
        self.detector.backend = self.detector.backend.to_ascii_lowercase();
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<EngineConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}

// ----------------------------------------------------------------------------
// Session tunables
// ----------------------------------------------------------------------------

/// Immutable parameters of one session, fixed when the session starts.
///
/// Changing any of these for a running source means restarting it
/// (`StreamRegistry::restart_source`), never mutating a live session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionTunables {
    pub required_consecutive: u32,
    pub cooldown: Duration,
    pub clips_dir: PathBuf,
    pub snapshots_dir: PathBuf,
    pub reconnect_max_attempts: u32,
    pub reconnect_backoff: Duration,
    pub io_timeout: Duration,
    pub max_read_failures: u32,
    pub read_failure_sleep: Duration,
    pub frame_skip: u32,
    pub expected_fps: u32,
    pub pre_roll_secs: u32,
    pub post_roll_secs: u32,
    pub publish_interval: Duration,
    pub publish_max_width: u32,
    pub jpeg_quality: u8,
    pub target_label: String,
}

impl SessionTunables {
    /// Tunables taken from the engine config alone.
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            required_consecutive: cfg.confirmation.required_consecutive,
            cooldown: cfg.confirmation.cooldown,
            clips_dir: cfg.clips_dir.clone(),
            snapshots_dir: cfg.snapshots_dir.clone(),
            reconnect_max_attempts: cfg.capture.reconnect_max_attempts,
            reconnect_backoff: cfg.capture.reconnect_backoff,
            io_timeout: cfg.capture.io_timeout,
            max_read_failures: cfg.capture.max_read_failures,
            read_failure_sleep: cfg.capture.read_failure_sleep,
            frame_skip: cfg.capture.frame_skip.max(1),
            expected_fps: cfg.capture.expected_fps.max(1),
            pre_roll_secs: cfg.recording.pre_roll_secs,
            post_roll_secs: cfg.recording.post_roll_secs,
            publish_interval: cfg.publish.min_interval,
            publish_max_width: cfg.publish.max_width,
            jpeg_quality: cfg.publish.jpeg_quality,
            target_label: cfg.detector.target_label.clone(),
        }
    }

    /// Engine config overlaid with the tunables stored in persistence.
    ///
    /// Missing keys, unreadable keys and unparsable values fall back to the
    /// engine config.
    pub fn resolve(cfg: &EngineConfig, persistence: &dyn Persistence) -> Self {
        let mut tunables = Self::from_config(cfg);
        if let Some(required) = read_tunable::<u32>(persistence, KEY_CONSECUTIVE_THRESHOLD) {
            if required > 0 {
                tunables.required_consecutive = required;
            } else {
                log::warn!("ignoring {}=0; keeping {}", KEY_CONSECUTIVE_THRESHOLD, tunables.required_consecutive);
            }
        }
        if let Some(seconds) = read_tunable::<u64>(persistence, KEY_COOLDOWN_SECONDS) {
            tunables.cooldown = Duration::from_secs(seconds);
        }
        if let Some(dir) = read_tunable::<String>(persistence, KEY_CLIPS_DIR) {
            if !dir.trim().is_empty() {
                tunables.clips_dir = PathBuf::from(dir.trim());
            }
        }
        tunables
    }

    /// Ring capacity in frames.
    pub fn pre_roll_frames(&self) -> usize {
        (self.pre_roll_secs as usize).saturating_mul(self.expected_fps as usize)
    }

    /// Post-roll quota in frames.
    pub fn post_roll_frames(&self) -> usize {
        (self.post_roll_secs as usize).saturating_mul(self.expected_fps as usize)
    }
}

fn read_tunable<T: std::str::FromStr>(persistence: &dyn Persistence, key: &str) -> Option<T> {
    let raw = match persistence.get_config_value(key) {
        Ok(Some(raw)) => raw,
        Ok(None) => return None,
        Err(e) => {
            log::warn!("failed to read tunable {}: {}; using default", key, e);
            return None;
        }
    };
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("tunable {}='{}' is not valid; using default", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryPersistence;

    #[test]
    fn defaults_are_documented_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.db_path, DEFAULT_DB_PATH);
        assert_eq!(cfg.capture.reconnect_max_attempts, 3);
        assert_eq!(cfg.capture.max_read_failures, 20);
        assert_eq!(cfg.confirmation.required_consecutive, 3);
        assert_eq!(cfg.recording.clip_format, ClipFormat::Mjpeg);
        assert!(cfg.publish.mqtt.is_none());
    }

    #[test]
    fn tunables_overlay_persisted_values() {
        let cfg = EngineConfig::default();
        let store = InMemoryPersistence::new();
        store.set_config_value(KEY_CONSECUTIVE_THRESHOLD, "120");
        store.set_config_value(KEY_COOLDOWN_SECONDS, " 4 ");
        store.set_config_value(KEY_CLIPS_DIR, "/var/lib/roadwatch/clips");

        let tunables = SessionTunables::resolve(&cfg, &store);
        assert_eq!(tunables.required_consecutive, 120);
        assert_eq!(tunables.cooldown, Duration::from_secs(4));
        assert_eq!(tunables.clips_dir, PathBuf::from("/var/lib/roadwatch/clips"));
    }

    #[test]
    fn bad_tunables_fall_back_to_defaults() {
        let cfg = EngineConfig::default();
        let store = InMemoryPersistence::new();
        store.set_config_value(KEY_CONSECUTIVE_THRESHOLD, "lots");
        store.set_config_value(KEY_COOLDOWN_SECONDS, "-3");

        let tunables = SessionTunables::resolve(&cfg, &store);
        assert_eq!(tunables, SessionTunables::from_config(&cfg));
    }

    #[test]
    fn frame_budgets_follow_fps() {
        let mut tunables = SessionTunables::from_config(&EngineConfig::default());
        tunables.expected_fps = 10;
        tunables.pre_roll_secs = 3;
        tunables.post_roll_secs = 2;
        assert_eq!(tunables.pre_roll_frames(), 30);
        assert_eq!(tunables.post_roll_frames(), 20);
    }

    #[test]
    fn rejects_unknown_clip_format() {
        assert!(ClipFormat::parse("avi").is_err());
        assert_eq!(ClipFormat::parse(" MP4 ").unwrap(), ClipFormat::Mp4);
    }
}
