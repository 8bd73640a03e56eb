//! Configuration data types
//!
//! Everything here deserializes from the TOML configuration file. All
//! sections are optional and fall back to the defaults documented on each
//! field.

use crate::message::BindingId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Default routing pool size
pub const DEFAULT_WORKER_THREADS: usize = 4;

/// Default per-destination send queue depth
pub const DEFAULT_QUEUE_DEPTH: usize = 64;

/// Default ingress depth of each routing worker
pub const DEFAULT_POOL_QUEUE_DEPTH: usize = 1024;

/// Default time slice for one inbound poll in milliseconds
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 10;

/// Default drain grace on shutdown and reconfiguration in milliseconds
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5000;

/// Root of the configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RadapterConfig {
    /// Scheduler, sandbox and retry settings
    pub runtime: RuntimeSettings,
    /// Log output
    pub logging: LoggingSettings,
    /// Event feed sinks
    pub events: EventSettings,
    /// Declared transport bindings, in start order
    pub bindings: Vec<BindingConfig>,
    /// Pipeline edges
    pub edges: Vec<EdgeConfig>,
}

// ==================== Runtime ====================

/// Scheduler settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Number of routing pool threads
    pub worker_threads: usize,
    /// Default bounded depth of each binding's send queue
    pub queue_depth: usize,
    /// Bounded ingress depth of each routing worker
    pub pool_queue_depth: usize,
    /// Time slice for one inbound poll in milliseconds
    pub poll_timeout_ms: u64,
    /// How long shutdown and reconfiguration wait for in-flight work
    pub shutdown_grace_ms: u64,
    /// Script sandbox limits
    pub sandbox: SandboxSettings,
    /// Connect/send retry policy
    pub retry: RetrySettings,
    /// When repeated script failures disable an edge
    pub edge_faults: EdgeFaultSettings,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            worker_threads: DEFAULT_WORKER_THREADS,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            pool_queue_depth: DEFAULT_POOL_QUEUE_DEPTH,
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
            sandbox: SandboxSettings::default(),
            retry: RetrySettings::default(),
            edge_faults: EdgeFaultSettings::default(),
        }
    }
}

impl RuntimeSettings {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Script sandbox limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSettings {
    /// Wall-clock budget per invocation in milliseconds
    pub budget_ms: u64,
    /// Operation budget per invocation
    pub max_operations: u64,
    pub max_string_size: usize,
    pub max_array_size: usize,
    pub max_map_size: usize,
    pub max_call_levels: usize,
    pub max_expr_depth: usize,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            budget_ms: 50,
            max_operations: 100_000,
            max_string_size: 65_536,
            max_array_size: 10_000,
            max_map_size: 10_000,
            max_call_levels: 32,
            max_expr_depth: 64,
        }
    }
}

/// Exponential backoff policy for transient failures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Attempts before the binding is declared faulted
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 5000,
        }
    }
}

impl RetrySettings {
    /// Delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }

    /// At least one attempt is always made
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Sliding-window fault threshold for edges
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeFaultSettings {
    /// Faults tolerated within the window; one more disables the edge
    pub max_faults: usize,
    pub window_ms: u64,
}

impl Default for EdgeFaultSettings {
    fn default() -> Self {
        Self {
            max_faults: 10,
            window_ms: 10_000,
        }
    }
}

impl EdgeFaultSettings {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

// ==================== Logging & Events ====================

/// Log line format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Log output settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter directive; `RUST_LOG` takes precedence
    pub level: String,
    pub format: LogFormat,
    /// Directory for daily rolling log files
    pub directory: Option<PathBuf>,
    pub file_prefix: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            directory: None,
            file_prefix: "radapter.log".to_string(),
        }
    }
}

/// Event feed sinks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventSettings {
    /// Append every event as a JSON line to this file
    pub file: Option<PathBuf>,
    /// Buffer depth of each subscriber
    pub capacity: usize,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            file: None,
            capacity: 1024,
        }
    }
}

// ==================== Bindings ====================

/// One declared transport binding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingConfig {
    pub id: BindingId,
    /// Reconnect automatically this long after a fault
    #[serde(default)]
    pub auto_reconnect_ms: Option<u64>,
    /// Override of the runtime's send queue depth
    #[serde(default)]
    pub queue_depth: Option<usize>,
    #[serde(flatten)]
    pub transport: TransportConfig,
}

impl BindingConfig {
    pub fn new(id: impl Into<BindingId>, transport: TransportConfig) -> Self {
        Self {
            id: id.into(),
            auto_reconnect_ms: None,
            queue_depth: None,
            transport,
        }
    }

    pub fn auto_reconnect(&self) -> Option<Duration> {
        self.auto_reconnect_ms.map(Duration::from_millis)
    }
}

/// Protocol-specific binding settings, selected by `protocol`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum TransportConfig {
    Serial(SerialConfig),
    ModbusRtu(ModbusConfig),
    WebsocketClient(WebsocketClientConfig),
    WebsocketServer(WebsocketServerConfig),
    Loopback(LoopbackConfig),
}

/// Parity setting of a serial line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParityConfig {
    #[default]
    None,
    Even,
    Odd,
}

/// Flow control of a serial line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowControlConfig {
    #[default]
    None,
    Software,
    Hardware,
}

fn default_baud() -> u32 {
    115_200
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

/// Serial line parameters shared by raw serial and Modbus RTU bindings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialLineConfig {
    /// Device path, e.g. `/dev/ttyUSB0` or `COM3`
    pub port: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default)]
    pub parity: ParityConfig,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default)]
    pub flow_control: FlowControlConfig,
}

impl SerialLineConfig {
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud: default_baud(),
            data_bits: default_data_bits(),
            parity: ParityConfig::None,
            stop_bits: default_stop_bits(),
            flow_control: FlowControlConfig::None,
        }
    }
}

/// How payloads are delimited on a raw serial line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// RFC 1055 SLIP frames
    #[default]
    Slip,
    /// One JSON document per `\n` terminated line
    Line,
}

/// Raw serial port binding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialConfig {
    #[serde(flatten)]
    pub line: SerialLineConfig,
    #[serde(default)]
    pub framing: Framing,
}

/// Register value type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterType {
    #[default]
    U16,
    I16,
    U32,
    I32,
    F32,
    Bit,
}

/// Byte or word order
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endianness {
    #[default]
    Big,
    Little,
}

/// Register access mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    /// Polled only
    #[default]
    #[serde(rename = "r")]
    Read,
    /// Polled and writable
    #[serde(rename = "rw")]
    ReadWrite,
    /// Written only, never polled
    #[serde(rename = "w")]
    Write,
}

impl AccessMode {
    pub fn readable(self) -> bool {
        matches!(self, AccessMode::Read | AccessMode::ReadWrite)
    }

    pub fn writable(self) -> bool {
        matches!(self, AccessMode::ReadWrite | AccessMode::Write)
    }
}

/// One named register
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterConfig {
    /// Start address within its table
    pub index: u16,
    #[serde(rename = "type", default)]
    pub kind: RegisterType,
    #[serde(default)]
    pub byte_order: Endianness,
    #[serde(default)]
    pub word_order: Endianness,
    #[serde(default)]
    pub mode: AccessMode,
}

impl RegisterConfig {
    pub fn new(index: u16, kind: RegisterType) -> Self {
        Self {
            index,
            kind,
            byte_order: Endianness::Big,
            word_order: Endianness::Big,
            mode: AccessMode::Read,
        }
    }

    pub fn with_mode(mut self, mode: AccessMode) -> Self {
        self.mode = mode;
        self
    }
}

/// Register tables keyed by payload path (`:` nests)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterMapConfig {
    pub holding: BTreeMap<String, RegisterConfig>,
    pub input: BTreeMap<String, RegisterConfig>,
    pub coils: BTreeMap<String, RegisterConfig>,
    pub discrete_inputs: BTreeMap<String, RegisterConfig>,
}

fn default_slave_id() -> u8 {
    1
}

fn default_modbus_poll_ms() -> u64 {
    500
}

fn default_response_timeout_ms() -> u64 {
    200
}

/// Modbus RTU master on a serial bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModbusConfig {
    #[serde(flatten)]
    pub line: SerialLineConfig,
    #[serde(default = "default_slave_id")]
    pub slave_id: u8,
    #[serde(default = "default_modbus_poll_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
    #[serde(default)]
    pub registers: RegisterMapConfig,
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

/// Websocket client binding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebsocketClientConfig {
    /// `ws://` or `wss://` URL
    pub url: String,
    /// Skip certificate verification (test setups only)
    #[serde(default)]
    pub accept_invalid_certs: bool,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}

/// Websocket server binding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebsocketServerConfig {
    #[serde(default = "default_listen_host")]
    pub host: String,
    pub port: u16,
    /// PEM certificate chain; enables TLS together with `key_file`
    #[serde(default)]
    pub cert_file: Option<PathBuf>,
    /// PEM PKCS#8 private key
    #[serde(default)]
    pub key_file: Option<PathBuf>,
}

fn default_echo() -> bool {
    true
}

/// In-process loopback binding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopbackConfig {
    /// Feed every sent message back as inbound
    #[serde(default = "default_echo")]
    pub echo: bool,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self { echo: true }
    }
}

// ==================== Edges ====================

/// One destination or a list of destinations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Destinations {
    One(BindingId),
    Many(Vec<BindingId>),
}

impl Destinations {
    pub fn to_vec(&self) -> Vec<BindingId> {
        match self {
            Destinations::One(id) => vec![id.clone()],
            Destinations::Many(ids) => ids.clone(),
        }
    }
}

/// One pipeline edge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeConfig {
    /// Unique name; generated from the endpoints when absent
    #[serde(default)]
    pub name: Option<String>,
    pub from: BindingId,
    pub to: Destinations,
    /// Transform script file, relative to the configuration file
    #[serde(default)]
    pub script: Option<PathBuf>,
    /// Inline transform script
    #[serde(default)]
    pub script_inline: Option<String>,
    /// Filter expression
    #[serde(default)]
    pub filter: Option<String>,
}

impl EdgeConfig {
    pub fn new(from: impl Into<BindingId>, to: impl Into<BindingId>) -> Self {
        Self {
            name: None,
            from: from.into(),
            to: Destinations::One(to.into()),
            script: None,
            script_inline: None,
            filter: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_script(mut self, source: impl Into<String>) -> Self {
        self.script_inline = Some(source.into());
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// The configured name, or one derived from the endpoints
    pub fn display_name(&self, position: usize) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => {
                let to: Vec<String> = self.to.to_vec().iter().map(|b| b.to_string()).collect();
                format!("{}->{}#{}", self.from, to.join(","), position)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let retry = RetrySettings {
            max_attempts: 10,
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
        };
        assert_eq!(retry.backoff(1), Duration::from_millis(100));
        assert_eq!(retry.backoff(2), Duration::from_millis(200));
        assert_eq!(retry.backoff(4), Duration::from_millis(800));
        assert_eq!(retry.backoff(5), Duration::from_millis(1000));
        assert_eq!(retry.backoff(60), Duration::from_millis(1000));
    }

    #[test]
    fn test_attempts_at_least_one() {
        let retry = RetrySettings {
            max_attempts: 0,
            ..RetrySettings::default()
        };
        assert_eq!(retry.attempts(), 1);
    }

    #[test]
    fn test_edge_display_name() {
        let edge = EdgeConfig::new("plc", "cloud");
        assert_eq!(edge.display_name(3), "plc->cloud#3");
        assert_eq!(edge.named("main").display_name(3), "main");
    }

    #[test]
    fn test_access_mode() {
        assert!(AccessMode::Read.readable());
        assert!(!AccessMode::Read.writable());
        assert!(AccessMode::ReadWrite.writable());
        assert!(!AccessMode::Write.readable());
    }
}
