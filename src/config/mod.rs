//! # Configuration Management Module
//!
//! Handles all configuration aspects of the evogateway process: serial port
//! parameters, registry file locations, MQTT broker settings and the sender
//! (retry/acknowledgement) tuning.
//!
//! ## Configuration File Format
//!
//! evogateway uses TOML format for human-readable configuration:
//!
//! ```toml
//! [serial.ports."/dev/ttyUSB0"]
//! baud = 115200
//! retry_limit = 10
//! is_send_port = true
//!
//! [mqtt]
//! server = "broker.local"
//! pub_topic = "evohome/gateway"
//! sub_topic = "evohome/gateway/_send"
//!
//! [sender]
//! controller_id = "01:139901"
//! gateway_id = "18:318170"
//! ```
//!
//! All sections have sensible defaults; `evogateway init` writes a default
//! file to start from. An empty `mqtt.server` disables the bus entirely and
//! the gateway runs as a pure listener/logger.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub serial: SerialConfig,
    #[serde(default)]
    pub files: FilesConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    pub sender: SenderConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Serial ports keyed by device path. At least one port must open at
    /// startup or the process exits with an error.
    pub ports: HashMap<String, SerialPortConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialPortConfig {
    #[serde(default = "default_baud")]
    pub baud: u32,
    /// Number of open attempts before the port is skipped (5s pause between).
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
    /// Outbound commands are only written to send ports.
    #[serde(default)]
    pub is_send_port: bool,
}

fn default_baud() -> u32 {
    115200
}

fn default_retry_limit() -> u32 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesConfig {
    /// Known devices registry (JSON, keyed by device id).
    pub devices_file: String,
    /// Newly discovered, not-yet-named devices accumulate here.
    pub new_devices_file: String,
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self {
            devices_file: "devices.json".to_string(),
            new_devices_file: "devices_new.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker host. Leave blank to disable MQTT publishing entirely;
    /// messages are still decoded and logged.
    pub server: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub client_id: String,
    /// Base topic for publications. Per-device topics are nested beneath it.
    pub pub_topic: String,
    /// Topic on which command instructions are received (JSON payloads).
    pub sub_topic: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            port: 1883,
            user: String::new(),
            password: String::new(),
            client_id: "evoGateway".to_string(),
            pub_topic: "evohome/gateway".to_string(),
            sub_topic: "evohome/gateway/_send".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderConfig {
    /// The main evohome touchscreen controller, default target for commands.
    pub controller_id: String,
    /// This gateway's own device id on the radio network.
    pub gateway_id: String,
    pub gateway_name: String,
    /// Seconds to wait for an acknowledgement before resending.
    #[serde(default = "default_resend_timeout")]
    pub resend_timeout_secs: f64,
    /// Maximum resend attempts after the initial send. Zero disables
    /// waiting for acknowledgements altogether.
    #[serde(default = "default_resend_attempts")]
    pub resend_attempts: u32,
    /// Reset the serial links before the final resend attempt.
    #[serde(default)]
    pub auto_reset_ports_on_failure: bool,
}

fn default_resend_timeout() -> f64 {
    60.0
}

fn default_resend_attempts() -> u32 {
    3
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            controller_id: "01:139901".to_string(),
            gateway_id: "18:318170".to_string(),
            gateway_name: "EvoGateway".to_string(),
            resend_timeout_secs: 60.0,
            resend_attempts: 3,
            auto_reset_ports_on_failure: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Log frames dropped due to hardware/firmware corruption markers.
    #[serde(default)]
    pub log_dropped_packets: bool,
    /// Suppress re-dispatch of frames heard through multiple receivers.
    #[serde(default = "default_true")]
    pub drop_duplicate_messages: bool,
    /// Capacity of the recent-frame window used for duplicate detection.
    #[serde(default = "default_history")]
    pub max_history_stack_length: usize,
}

fn default_true() -> bool {
    true
}

fn default_history() -> usize {
    10
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            log_dropped_packets: false,
            drop_duplicate_messages: true,
            max_history_stack_length: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: Some("evogateway.log".to_string()),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        let mut ports = HashMap::new();
        ports.insert(
            "/dev/ttyUSB0".to_string(),
            SerialPortConfig {
                baud: 115200,
                retry_limit: 10,
                is_send_port: true,
            },
        );

        Config {
            serial: SerialConfig { ports },
            files: FilesConfig::default(),
            mqtt: MqttConfig::default(),
            sender: SenderConfig::default(),
            gateway: GatewayConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
