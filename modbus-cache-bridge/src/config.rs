//! Configuration for the Modbus cache bridge.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

use modbus_cache_framework::{BridgeConfig, BridgeError, LoggingConfig};

/// Upper bound on the number of cached register addresses.
pub const MAX_REGISTERS: usize = 400;

/// Largest register count a single read request may carry.
pub const MAX_READ_QUANTITY: u16 = 125;

/// Ceiling for the configurable reconnect delay (one hour).
pub const MAX_BACKOFF_MS: u64 = 3_600_000;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete bridge configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModbusCacheConfig {
    /// The authoritative device being polled.
    pub upstream: UpstreamConfig,

    /// Polling cadence and batching.
    #[serde(default)]
    pub polling: PollingConfig,

    /// Reconnect backoff.
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Registers polled on every cycle.
    #[serde(default)]
    pub registers: Vec<u16>,

    /// Registers fetched until known once, then never polled again.
    #[serde(default)]
    pub static_registers: Vec<u16>,

    /// Downstream server roles.
    #[serde(default)]
    pub servers: ServersConfig,

    /// What happens to downstream writes.
    #[serde(default)]
    pub writes: WritePolicy,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Upstream device settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Connection type and address
    pub connection: ConnectionConfig,

    /// Modbus unit/slave ID (1-247)
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,

    /// Per-request timeout in milliseconds (also bounds connect attempts)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Function used for upstream reads
    #[serde(default)]
    pub function: ReadFunction,
}

fn default_unit_id() -> u8 {
    1
}

fn default_timeout_ms() -> u64 {
    1000
}

/// Connection configuration (TCP or RTU).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConnectionConfig {
    /// Modbus TCP connection
    Tcp {
        /// Host address (IP or hostname)
        host: String,
        /// TCP port (default: 502)
        #[serde(default = "default_modbus_port")]
        port: u16,
    },
    /// Modbus RTU (serial) connection
    Rtu(SerialConfig),
}

impl ConnectionConfig {
    /// Short human-readable description of the link.
    pub fn describe(&self) -> String {
        match self {
            ConnectionConfig::Tcp { host, port } => format!("tcp://{}:{}", host, port),
            ConnectionConfig::Rtu(serial) => format!("rtu://{}@{}", serial.port, serial.baud_rate),
        }
    }
}

fn default_modbus_port() -> u16 {
    502
}

/// Serial line settings shared by the upstream link and the RTU server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0" or "COM1")
    pub port: String,
    /// Baud rate (default: 9600)
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Data bits (default: 8)
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    /// Parity: "none", "even", or "odd" (default: "none")
    #[serde(default = "default_parity")]
    pub parity: String,
    /// Stop bits: 1 or 2 (default: 1)
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_parity() -> String {
    "none".to_string()
}

fn default_stop_bits() -> u8 {
    1
}

impl SerialConfig {
    /// Build a serial port builder from these settings.
    pub fn builder(&self) -> tokio_serial::SerialPortBuilder {
        let parity = match self.parity.to_lowercase().as_str() {
            "even" => tokio_serial::Parity::Even,
            "odd" => tokio_serial::Parity::Odd,
            _ => tokio_serial::Parity::None,
        };

        let stop_bits = match self.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };

        let data_bits = match self.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };

        tokio_serial::new(&self.port, self.baud_rate)
            .parity(parity)
            .stop_bits(stop_bits)
            .data_bits(data_bits)
    }

    fn verify(&self, role: &str) -> Result<(), ConfigError> {
        if self.port.is_empty() {
            return Err(ConfigError::Validation(format!(
                "{}: serial port cannot be empty",
                role
            )));
        }

        match self.parity.to_lowercase().as_str() {
            "none" | "even" | "odd" => {}
            _ => {
                return Err(ConfigError::Validation(format!(
                    "{}: invalid parity '{}' (use none, even, or odd)",
                    role, self.parity
                )));
            }
        }

        Ok(())
    }
}

/// Upstream read function.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadFunction {
    /// Read holding registers (0x03, default)
    #[default]
    Holding,
    /// Read input registers (0x04)
    Input,
}

/// Polling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Minimum time between two polling passes
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Maximum registers coalesced into one upstream read
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: u16,

    /// A pass is skipped while this many requests are still in flight
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,

    /// Pending requests older than this are purged as timed out
    #[serde(default = "default_pending_ttl_ms")]
    pub pending_ttl_ms: u64,

    /// Grace period added to the interval before the bridge reports non-operational
    #[serde(default = "default_operational_grace_ms")]
    pub operational_grace_ms: u64,

    /// Capacity of the queue between the poller and the upstream worker
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

fn default_interval_ms() -> u64 {
    500
}

fn default_max_batch_size() -> u16 {
    100
}

fn default_max_pending() -> usize {
    4
}

fn default_pending_ttl_ms() -> u64 {
    4000
}

fn default_operational_grace_ms() -> u64 {
    2000
}

fn default_queue_depth() -> usize {
    32
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            max_batch_size: default_max_batch_size(),
            max_pending: default_max_pending(),
            pending_ttl_ms: default_pending_ttl_ms(),
            operational_grace_ms: default_operational_grace_ms(),
            queue_depth: default_queue_depth(),
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn pending_ttl(&self) -> Duration {
        Duration::from_millis(self.pending_ttl_ms)
    }

    /// Age of the last successful update beyond which the bridge is non-operational.
    pub fn operational_window(&self) -> Duration {
        Duration::from_millis(self.interval_ms + self.operational_grace_ms)
    }
}

/// Reconnect backoff configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Delay after the first failed attempt
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,

    /// Ceiling for the doubled delay
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_backoff_ms() -> u64 {
    2000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            backoff_ms: default_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Downstream server roles. Each one is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServersConfig {
    /// Modbus TCP server
    #[serde(default)]
    pub tcp: Option<TcpServerConfig>,

    /// Modbus RTU server emulating the upstream meter on a serial line
    #[serde(default)]
    pub rtu: Option<SerialConfig>,
}

/// Modbus TCP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TcpServerConfig {
    /// Listen address
    #[serde(default = "default_bind")]
    pub bind: String,
}

fn default_bind() -> String {
    "0.0.0.0:502".to_string()
}

/// Policy for downstream write requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WritePolicy {
    /// Writes only update the cache (default)
    #[default]
    CacheOnly,
    /// Writes update the cache and are forwarded to the upstream device
    MirrorUpstream,
}

impl ModbusCacheConfig {
    /// Sorted, de-duplicated union of dynamic and static registers.
    pub fn address_list(&self) -> Vec<u16> {
        self.registers
            .iter()
            .chain(self.static_registers.iter())
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Check the configuration for values the bridge cannot run with.
    pub fn verify(&self) -> Result<(), ConfigError> {
        let addresses = self.address_list();
        if addresses.is_empty() {
            return Err(ConfigError::Validation(
                "At least one register must be configured".to_string(),
            ));
        }
        if addresses.len() > MAX_REGISTERS {
            return Err(ConfigError::Validation(format!(
                "{} registers configured, at most {} are supported",
                addresses.len(),
                MAX_REGISTERS
            )));
        }

        let upstream = &self.upstream;
        if upstream.unit_id == 0 || upstream.unit_id > 247 {
            return Err(ConfigError::Validation(format!(
                "upstream: unit_id must be 1-247, got {}",
                upstream.unit_id
            )));
        }
        if upstream.timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "upstream: timeout_ms must be positive".to_string(),
            ));
        }
        match &upstream.connection {
            ConnectionConfig::Tcp { host, port } => {
                if host.is_empty() {
                    return Err(ConfigError::Validation(
                        "upstream: host cannot be empty".to_string(),
                    ));
                }
                if *port == 0 {
                    return Err(ConfigError::Validation(
                        "upstream: port cannot be 0".to_string(),
                    ));
                }
            }
            ConnectionConfig::Rtu(serial) => serial.verify("upstream")?,
        }

        let polling = &self.polling;
        if polling.interval_ms == 0 {
            return Err(ConfigError::Validation(
                "polling: interval_ms must be positive".to_string(),
            ));
        }
        if polling.max_batch_size == 0 || polling.max_batch_size > MAX_READ_QUANTITY {
            return Err(ConfigError::Validation(format!(
                "polling: max_batch_size must be 1-{}, got {}",
                MAX_READ_QUANTITY, polling.max_batch_size
            )));
        }
        if polling.max_pending == 0 || polling.queue_depth == 0 {
            return Err(ConfigError::Validation(
                "polling: max_pending and queue_depth must be positive".to_string(),
            ));
        }

        if self.reconnect.max_backoff_ms > MAX_BACKOFF_MS {
            return Err(ConfigError::Validation(format!(
                "reconnect: max_backoff_ms must be at most {}, got {}",
                MAX_BACKOFF_MS, self.reconnect.max_backoff_ms
            )));
        }
        if self.reconnect.backoff_ms > self.reconnect.max_backoff_ms {
            return Err(ConfigError::Validation(format!(
                "reconnect: backoff_ms ({}) exceeds max_backoff_ms ({})",
                self.reconnect.backoff_ms, self.reconnect.max_backoff_ms
            )));
        }

        if let Some(tcp) = &self.servers.tcp {
            tcp.bind.parse::<SocketAddr>().map_err(|e| {
                ConfigError::Validation(format!("servers.tcp: invalid bind '{}': {}", tcp.bind, e))
            })?;
        }
        if let Some(rtu) = &self.servers.rtu {
            rtu.verify("servers.rtu")?;
        }

        Ok(())
    }
}

impl BridgeConfig for ModbusCacheConfig {
    fn logging(&self) -> &LoggingConfig {
        &self.logging
    }

    fn validate(&self) -> modbus_cache_framework::Result<()> {
        self.verify()
            .map_err(|e| BridgeError::validation(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp_config() {
        let json = r#"{
            upstream: {
                connection: { type: "tcp", host: "192.168.1.10" }
            },
            registers: [0, 2, 4]
        }"#;

        let config: ModbusCacheConfig = json5::from_str(json).unwrap();
        config.verify().unwrap();

        if let ConnectionConfig::Tcp { host, port } = &config.upstream.connection {
            assert_eq!(host, "192.168.1.10");
            assert_eq!(*port, 502); // default
        } else {
            panic!("Expected TCP connection");
        }
        assert_eq!(config.upstream.unit_id, 1);
        assert_eq!(config.upstream.function, ReadFunction::Holding);
        assert_eq!(config.polling.interval_ms, 500);
        assert_eq!(config.polling.max_batch_size, 100);
        assert_eq!(config.writes, WritePolicy::CacheOnly);
        assert!(config.servers.tcp.is_none());
    }

    #[test]
    fn test_parse_rtu_config() {
        let json = r#"{
            upstream: {
                connection: {
                    type: "rtu",
                    port: "/dev/ttyUSB0",
                    baud_rate: 19200,
                    parity: "even"
                },
                unit_id: 5,
                function: "input"
            },
            registers: [0, 1],
            servers: {
                tcp: { bind: "127.0.0.1:5020" },
                rtu: { port: "/dev/ttyUSB1" }
            },
            writes: "mirror_upstream"
        }"#;

        let config: ModbusCacheConfig = json5::from_str(json).unwrap();
        config.verify().unwrap();

        assert_eq!(config.upstream.unit_id, 5);
        assert_eq!(config.upstream.function, ReadFunction::Input);
        if let ConnectionConfig::Rtu(serial) = &config.upstream.connection {
            assert_eq!(serial.port, "/dev/ttyUSB0");
            assert_eq!(serial.baud_rate, 19200);
            assert_eq!(serial.parity, "even");
        } else {
            panic!("Expected RTU connection");
        }
        assert_eq!(config.servers.rtu.as_ref().unwrap().baud_rate, 9600);
        assert_eq!(config.writes, WritePolicy::MirrorUpstream);
    }

    #[test]
    fn test_address_list_merges_static_registers() {
        let json = r#"{
            upstream: { connection: { type: "tcp", host: "meter" } },
            registers: [12, 0, 6, 0],
            static_registers: [64512, 6]
        }"#;

        let config: ModbusCacheConfig = json5::from_str(json).unwrap();
        assert_eq!(config.address_list(), vec![0, 6, 12, 64512]);
    }

    #[test]
    fn test_validate_empty_registers() {
        let json = r#"{
            upstream: { connection: { type: "tcp", host: "meter" } }
        }"#;

        let config: ModbusCacheConfig = json5::from_str(json).unwrap();
        assert!(config.verify().is_err());
    }

    #[test]
    fn test_validate_too_many_registers() {
        let mut config: ModbusCacheConfig = json5::from_str(
            r#"{ upstream: { connection: { type: "tcp", host: "meter" } } }"#,
        )
        .unwrap();
        config.registers = (0..=MAX_REGISTERS as u16).collect();

        assert!(matches!(config.verify(), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_validate_batch_size_limit() {
        let json = r#"{
            upstream: { connection: { type: "tcp", host: "meter" } },
            polling: { max_batch_size: 126 },
            registers: [0]
        }"#;

        let config: ModbusCacheConfig = json5::from_str(json).unwrap();
        assert!(config.verify().is_err());
    }

    #[test]
    fn test_validate_backoff_ceiling() {
        let json = r#"{
            upstream: { connection: { type: "tcp", host: "meter" } },
            reconnect: { max_backoff_ms: 18446744073709551615 },
            registers: [0]
        }"#;

        let mut config: ModbusCacheConfig = json5::from_str(json).unwrap();
        assert!(matches!(config.verify(), Err(ConfigError::Validation(_))));

        config.reconnect.max_backoff_ms = MAX_BACKOFF_MS;
        config.verify().unwrap();
    }

    #[test]
    fn test_validate_bad_parity() {
        let json = r#"{
            upstream: { connection: { type: "rtu", port: "/dev/ttyS0", parity: "mark" } },
            registers: [0]
        }"#;

        let config: ModbusCacheConfig = json5::from_str(json).unwrap();
        assert!(config.verify().is_err());
    }

    #[test]
    fn test_validate_bad_bind() {
        let json = r#"{
            upstream: { connection: { type: "tcp", host: "meter" } },
            servers: { tcp: { bind: "not-an-address" } },
            registers: [0]
        }"#;

        let config: ModbusCacheConfig = json5::from_str(json).unwrap();
        assert!(config.verify().is_err());
    }

    #[test]
    fn test_bridge_config_validate_maps_error() {
        let json = r#"{
            upstream: { connection: { type: "tcp", host: "meter" }, unit_id: 0 },
            registers: [0]
        }"#;

        let config: ModbusCacheConfig = json5::from_str(json).unwrap();
        let result = BridgeConfig::validate(&config);
        assert!(matches!(result, Err(BridgeError::ConfigValidation(_))));
    }

    #[test]
    fn test_sample_config_is_valid() {
        let config: ModbusCacheConfig =
            json5::from_str(include_str!("../modbus-cache.json5")).unwrap();
        config.verify().unwrap();

        assert_eq!(config.address_list().len(), 25);
        assert_eq!(config.servers.tcp.unwrap().bind, "0.0.0.0:5020");
        assert!(config.servers.rtu.is_none());
    }

    #[test]
    fn test_operational_window() {
        let polling = PollingConfig::default();
        assert_eq!(polling.operational_window(), Duration::from_millis(2500));
    }
}
