use crate::error::LoadError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming the optional TOML config file
pub const CONFIG_PATH_ENV: &str = "ROOM_LOAD_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "./config/room-load.toml";
const ENV_PREFIX: &str = "ROOM_LOAD";

/// Largest MQTT packet body (remaining length) a broker can accept
pub const MQTT_MAX_PACKET_SIZE: usize = 268_435_455;

/// Room left in a publish packet for the topic and header fields
pub const TOPIC_HEADROOM: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub num_shards: usize,
    pub num_rooms: usize,
    pub use_pooling: bool,
    /// Messages per second sent by each producer of a room
    pub message_rate: u32,
    pub producers_per_room: usize,
    pub consumers_per_room: usize,
    pub message_retention_sec: u64,
    pub consumers_per_connection: usize,
    pub payload_size: usize,
    /// Ceiling on concurrent worker start/stop actions
    pub launch_concurrency: usize,
    pub backend: Backend,
    /// Where to write the final report as JSON
    pub report_path: Option<PathBuf>,
    pub mqtt: MqttConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// External MQTT broker
    Mqtt,
    /// In-process loopback broker, useful for dry runs
    Memory,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub address: String,
    pub port: u16,
    pub client_id_prefix: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
    pub insecure_skip_verify: bool,
    pub qos: u8,
    /// Replica count recorded on provisioned partitions
    pub partition_replicas: usize,
    /// Capacity of each connection's outgoing request queue
    pub max_pending: usize,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
    pub reconnect_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub json: bool,
    pub level: String,
}

impl Config {
    /// Loads defaults, then the optional TOML file, then `ROOM_LOAD_*` overrides.
    pub fn load() -> Result<Self> {
        let config_path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&config_path, config::Environment::with_prefix(ENV_PREFIX))
    }

    fn load_from(config_path: &str, environment: config::Environment) -> Result<Self> {
        let config: Config = config::Config::builder()
            .add_source(config::File::with_name(config_path).required(false))
            .add_source(
                environment
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("Failed to load configuration from {}", config_path))?
            .try_deserialize()
            .with_context(|| "Failed to parse configuration")?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), LoadError> {
        if self.num_shards == 0 {
            return Err(LoadError::Config("num_shards must be at least 1".into()));
        }
        if self.consumers_per_connection == 0 {
            return Err(LoadError::Config(
                "consumers_per_connection must be at least 1".into(),
            ));
        }
        if self.launch_concurrency == 0 {
            return Err(LoadError::Config(
                "launch_concurrency must be at least 1".into(),
            ));
        }
        if self.payload_size == 0 {
            return Err(LoadError::Config("payload_size must be at least 1".into()));
        }
        if self.payload_size > MQTT_MAX_PACKET_SIZE - TOPIC_HEADROOM {
            return Err(LoadError::Config(format!(
                "payload_size must be at most {} bytes (got {})",
                MQTT_MAX_PACKET_SIZE - TOPIC_HEADROOM,
                self.payload_size
            )));
        }
        if self.mqtt.qos > 2 {
            return Err(LoadError::Config(format!(
                "mqtt.qos must be 0, 1 or 2 (got {})",
                self.mqtt.qos
            )));
        }
        Ok(())
    }

    pub fn message_retention(&self) -> Duration {
        Duration::from_secs(self.message_retention_sec)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_shards: 50,
            num_rooms: 1000,
            use_pooling: true,
            message_rate: 10,
            producers_per_room: 1,
            consumers_per_room: 10,
            message_retention_sec: 10,
            consumers_per_connection: 10,
            payload_size: 1024,
            launch_concurrency: 30,
            backend: Backend::Mqtt,
            report_path: None,
            mqtt: MqttConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            address: std::env::var("MQTT_BROKER_ADDRESS")
                .unwrap_or_else(|_| "localhost".to_string()),
            port: 1883,
            client_id_prefix: "room-load".to_string(),
            username: None,
            password: None,
            use_tls: false,
            insecure_skip_verify: false,
            qos: 0,
            partition_replicas: 3,
            max_pending: 200_000,
            keep_alive_secs: 30,
            connect_timeout_secs: 10,
            reconnect_delay_ms: 1000,
        }
    }
}

impl fmt::Debug for MqttConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttConfig")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("client_id_prefix", &self.client_id_prefix)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("use_tls", &self.use_tls)
            .field("insecure_skip_verify", &self.insecure_skip_verify)
            .field("qos", &self.qos)
            .field("partition_replicas", &self.partition_replicas)
            .field("max_pending", &self.max_pending)
            .field("keep_alive_secs", &self.keep_alive_secs)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("reconnect_delay_ms", &self.reconnect_delay_ms)
            .finish()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            json: false,
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.num_shards, 50);
        assert_eq!(config.num_rooms, 1000);
        assert!(config.use_pooling);
        assert_eq!(config.message_rate, 10);
        assert_eq!(config.producers_per_room, 1);
        assert_eq!(config.consumers_per_room, 10);
        assert_eq!(config.message_retention(), Duration::from_secs(10));
        assert_eq!(config.consumers_per_connection, 10);
        assert_eq!(config.payload_size, 1024);
        assert_eq!(config.mqtt.max_pending, 200_000);
        assert_eq!(config.mqtt.partition_replicas, 3);
        assert!(config.validate().is_ok());
    }

    fn load_toml(contents: &str, env: &[(&str, &str)]) -> Result<Config> {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("room-load.toml");
        std::fs::write(&path, contents).unwrap();

        let vars: config::Map<String, String> = env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::load_from(
            path.to_str().unwrap(),
            config::Environment::with_prefix(ENV_PREFIX).source(Some(vars)),
        )
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = load_toml(
            r#"
            num_rooms = 20
            use_pooling = false
            backend = "memory"

            [mqtt]
            port = 1884

            [logging]
            json = true
            "#,
            &[],
        )
        .unwrap();

        assert_eq!(config.num_rooms, 20);
        assert!(!config.use_pooling);
        assert_eq!(config.backend, Backend::Memory);
        assert_eq!(config.mqtt.port, 1884);
        assert_eq!(config.mqtt.client_id_prefix, "room-load");
        assert!(config.logging.json);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.num_shards, 50);
    }

    #[test]
    fn test_environment_overrides_file() {
        let config = load_toml(
            "num_rooms = 20\n[mqtt]\nport = 1884\n",
            &[
                ("ROOM_LOAD_NUM_ROOMS", "7"),
                ("ROOM_LOAD_MQTT__PORT", "1999"),
                ("ROOM_LOAD_MQTT__ADDRESS", "broker.internal"),
            ],
        )
        .unwrap();

        assert_eq!(config.num_rooms, 7);
        assert_eq!(config.mqtt.port, 1999);
        assert_eq!(config.mqtt.address, "broker.internal");
        assert_eq!(config.consumers_per_room, 10);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = Config::load_from(
            "/nonexistent/room-load.toml",
            config::Environment::with_prefix(ENV_PREFIX).source(Some(config::Map::new())),
        )
        .unwrap();
        assert_eq!(config.num_rooms, 1000);
    }

    #[test]
    fn test_validation_rejects_zero_values() {
        assert!(load_toml("num_shards = 0", &[]).is_err());
        assert!(load_toml("consumers_per_connection = 0", &[]).is_err());
        assert!(load_toml("launch_concurrency = 0", &[]).is_err());
        assert!(load_toml("[mqtt]\nqos = 3", &[]).is_err());
    }

    #[test]
    fn test_payload_size_bounded_by_mqtt_packet_limit() {
        let largest = MQTT_MAX_PACKET_SIZE - TOPIC_HEADROOM;
        let ok = Config {
            payload_size: largest,
            ..Config::default()
        };
        assert!(ok.validate().is_ok());

        let too_big = Config {
            payload_size: largest + 1,
            ..Config::default()
        };
        assert!(matches!(too_big.validate(), Err(LoadError::Config(_))));
    }

    #[test]
    fn test_debug_redacts_password() {
        let mqtt = MqttConfig {
            username: Some("loader".to_string()),
            password: Some("hunter2".to_string()),
            ..MqttConfig::default()
        };
        let rendered = format!("{:?}", Config {
            mqtt,
            ..Config::default()
        });
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
        assert!(rendered.contains("loader"));
    }
}
