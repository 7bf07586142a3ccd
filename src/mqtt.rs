use anyhow::{Context, Result};
use rumqttc::{AsyncClient, EventLoop, MqttOptions, QoS};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct MqttConfig {
    host: String,
    #[serde(default = "MqttConfig::default_port")]
    port: u16,
    username: Option<String>,
    password: Option<String>,
    #[serde(default = "MqttConfig::default_topic")]
    topic: String,
    #[serde(default = "MqttConfig::default_qos")]
    qos: u8,
    #[serde(default = "MqttConfig::default_client_id")]
    client_id: String,
    #[serde(
        default = "MqttConfig::default_keep_alive_interval",
        with = "humantime_serde"
    )]
    keep_alive_interval: Duration,
    #[serde(
        default = "MqttConfig::default_reconnect_delay",
        with = "humantime_serde"
    )]
    reconnect_delay: Duration,
}

impl MqttConfig {
    fn default_port() -> u16 {
        1883
    }

    fn default_topic() -> String {
        "ubms".into()
    }

    fn default_qos() -> u8 {
        0
    }

    fn generate_random_string(len: usize) -> String {
        use rand::distributions::Alphanumeric;
        use rand::Rng;

        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(char::from)
            .collect()
    }

    fn default_client_id() -> String {
        format!("ubms-{}", Self::generate_random_string(8))
    }

    fn default_keep_alive_interval() -> Duration {
        Duration::from_secs(30)
    }

    fn default_reconnect_delay() -> Duration {
        Duration::from_secs(5)
    }

    pub const DEFAULT_CONFIG_FILE: &str = "mqtt.yaml";

    pub fn load(config_file_path: &Path) -> Result<Self> {
        log::debug!("Loading config file from {config_file_path:?}");
        let config_file = std::fs::File::open(config_file_path)
            .with_context(|| format!("Cannot open MQTT config file {config_file_path:?}"))?;
        let config: Self = serde_yaml::from_reader(&config_file)
            .with_context(|| format!("Cannot read MQTT config from file: {config_file_path:?}"))?;
        Ok(config)
    }

    fn qos(&self) -> QoS {
        match self.qos {
            2 => QoS::ExactlyOnce,
            1 => QoS::AtLeastOnce,
            _ => QoS::AtMostOnce,
        }
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options
            .set_keep_alive(self.keep_alive_interval)
            .set_clean_session(true);
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            options.set_credentials(username, password);
        }
        options
    }
}

/// Drives the connection. rumqttc reconnects on the next poll after an error.
async fn drive_event_loop(mut event_loop: EventLoop, reconnect_delay: Duration) {
    loop {
        match event_loop.poll().await {
            Ok(notification) => log::trace!("MQTT event: {notification:?}"),
            Err(e) => {
                log::error!("MQTT connection error: {e}");
                tokio::time::sleep(reconnect_delay).await;
            }
        }
    }
}

pub struct MqttPublisher {
    client: AsyncClient,
    config: MqttConfig,
    event_loop: tokio::task::JoinHandle<()>,
}

impl MqttPublisher {
    /// Must be called inside a tokio runtime; the event loop runs as a task.
    pub fn new(config: MqttConfig) -> Self {
        log::info!(
            "Connecting to MQTT broker {}:{} with client_id: {}",
            config.host,
            config.port,
            config.client_id
        );
        let (client, event_loop) = AsyncClient::new(config.options(), 64);
        let event_loop = tokio::spawn(drive_event_loop(event_loop, config.reconnect_delay));
        Self {
            client,
            config,
            event_loop,
        }
    }

    pub fn topic(&self) -> &str {
        &self.config.topic
    }

    pub async fn publish(&self, topic: &str, payload: String) -> Result<()> {
        log::debug!(
            "Publishing to MQTT: Topic='{topic}', Payload='{payload}', QoS={}",
            self.config.qos
        );
        self.client
            .publish(topic, self.config.qos(), false, payload)
            .await
            .with_context(|| format!("Failed to publish message to MQTT topic: {topic}"))?;
        Ok(())
    }

    pub async fn disconnect(self) {
        if let Err(e) = self.client.disconnect().await {
            log::warn!("Error disconnecting from MQTT broker: {e}");
        }
        self.event_loop.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "host: broker.local\nusername: bms\npassword: secret").unwrap();
        let config = MqttConfig::load(file.path()).unwrap();
        assert_eq!(config.host, "broker.local");
        assert_eq!(config.port, 1883);
        assert_eq!(config.topic, "ubms");
        assert_eq!(config.qos(), QoS::AtMostOnce);
        assert!(config.client_id.starts_with("ubms-"));
        assert_eq!(config.client_id.len(), "ubms-".len() + 8);
        assert_eq!(config.keep_alive_interval, Duration::from_secs(30));
    }

    #[test]
    fn parses_durations_and_qos() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "host: 10.0.0.2\nport: 8883\ntopic: house/battery\nqos: 1\nkeep_alive_interval: 1m\nreconnect_delay: 500ms"
        )
        .unwrap();
        let config = MqttConfig::load(file.path()).unwrap();
        assert_eq!(config.port, 8883);
        assert_eq!(config.topic, "house/battery");
        assert_eq!(config.qos(), QoS::AtLeastOnce);
        assert_eq!(config.keep_alive_interval, Duration::from_secs(60));
        assert_eq!(config.reconnect_delay, Duration::from_millis(500));
    }

    #[test]
    fn rejects_unknown_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "host: broker\nuri: tcp://broker:1883").unwrap();
        assert!(MqttConfig::load(file.path()).is_err());
    }
}
