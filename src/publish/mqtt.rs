use anyhow::{anyhow, Context, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, MqttOptions};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use url::Url;

use super::{LiveMessage, Publisher};
use crate::config::MqttSettings;

const DEFAULT_MQTT_PORT: u16 = 1883;
const REQUEST_QUEUE_DEPTH: usize = 64;
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Publishes live messages to an MQTT broker.
///
/// Topics are `<prefix>/<sourceId>/<kind>` with kind one of `frame`,
/// `tentative`, `confirmed`, `recording`. Payloads are JSON, QoS 0, never
/// retained. When the client's request queue is full the message is dropped.
pub struct MqttPublisher {
    client: Client,
    topic_prefix: String,
    shutdown: Arc<AtomicBool>,
    connection_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MqttPublisher {
    pub fn connect(settings: &MqttSettings) -> Result<Self> {
        let (host, port) = parse_broker_addr(&settings.broker_addr)?;
        let client_id = settings
            .client_id
            .clone()
            .unwrap_or_else(|| format!("roadwatch-{:08x}", rand::random::<u32>()));

        let mut options = MqttOptions::new(client_id, host.as_str(), port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_start(true);

        let (client, connection) = Client::new(options, REQUEST_QUEUE_DEPTH);
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = spawn_connection_loop(connection, shutdown.clone())?;
        log::info!("MQTT publisher started for {}:{} (prefix {})", host, port, settings.topic_prefix);

        Ok(Self {
            client,
            topic_prefix: settings.topic_prefix.trim_end_matches('/').to_string(),
            shutdown,
            connection_handle: Mutex::new(Some(handle)),
        })
    }

    pub fn topic_for(&self, message: &LiveMessage) -> String {
        topic_for(&self.topic_prefix, message)
    }

    /// Disconnect from the broker and join the connection thread.
    pub fn disconnect(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Err(e) = self.client.try_disconnect() {
            log::debug!("MQTT disconnect request not queued: {}", e);
        }
        let handle = self
            .connection_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Publisher for MqttPublisher {
    fn publish(&self, message: LiveMessage) {
        let topic = self.topic_for(&message);
        let payload = match serde_json::to_vec(&message) {
            Ok(payload) => payload,
            Err(e) => {
                log::warn!("failed to serialize {} message: {}", message.kind(), e);
                return;
            }
        };
        if let Err(e) = self.client.try_publish(topic, QoS::AtMostOnce, false, payload) {
            log::debug!("MQTT {} message dropped: {}", message.kind(), e);
        }
    }
}

impl Drop for MqttPublisher {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn spawn_connection_loop(
    mut connection: Connection,
    shutdown: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("mqtt-connection".to_string())
        .spawn(move || {
            for event in connection.iter() {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                match event {
                    Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => {}
                    Err(e) => {
                        log::warn!("MQTT connection error: {}; retrying", e);
                        std::thread::sleep(RECONNECT_DELAY);
                    }
                }
            }
        })
        .context("spawn MQTT connection thread")
}

fn topic_for(prefix: &str, message: &LiveMessage) -> String {
    format!("{}/{}/{}", prefix, message.source_id(), message.kind())
}

/// Accepts `host`, `host:port` or `mqtt://host[:port]`.
fn parse_broker_addr(addr: &str) -> Result<(String, u16)> {
    let addr = addr.trim();
    if addr.contains("://") {
        let url = Url::parse(addr).with_context(|| format!("invalid MQTT broker url {}", addr))?;
        if url.scheme() != "mqtt" && url.scheme() != "tcp" {
            return Err(anyhow!("unsupported MQTT scheme '{}'", url.scheme()));
        }
        let host = url
            .host_str()
            .ok_or_else(|| anyhow!("MQTT broker url {} has no host", addr))?;
        return Ok((host.to_string(), url.port().unwrap_or(DEFAULT_MQTT_PORT)));
    }

    match addr.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && !host.contains(':') => {
            let port = port
                .parse::<u16>()
                .map_err(|_| anyhow!("invalid MQTT broker port in {}", addr))?;
            Ok((host.to_string(), port))
        }
        _ if !addr.is_empty() => Ok((addr.to_string(), DEFAULT_MQTT_PORT)),
        _ => Err(anyhow!("MQTT broker address is empty")),
    }
}
