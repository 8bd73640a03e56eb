//! Transport implementations
//!
//! A [`Transport`] moves payloads over one protocol. Binding workers own one
//! transport each and drive it from their own thread, so implementations may
//! block; nothing is shared between transports.
//!
//! # Implementations
//!
//! - [`SerialTransport`] - JSON over a serial line, SLIP or newline framed
//! - [`ModbusRtuTransport`] - Modbus RTU master polling register maps
//! - [`WebsocketClientTransport`] / [`WebsocketServerTransport`] - JSON frames
//!   over websockets, optionally TLS
//! - [`LoopbackTransport`] - in-process echo, used for tests and dry runs

pub mod codec;
pub mod loopback;
pub mod modbus;
pub mod serial;
pub mod websocket;

pub use loopback::{LoopbackPeer, LoopbackTransport};
pub use modbus::ModbusRtuTransport;
pub use serial::SerialTransport;
pub use websocket::{WebsocketClientTransport, WebsocketServerTransport};

use crate::config::{resolve_path, BindingConfig, TransportConfig};
use crate::error::{RadapterError, Result};
use crate::message::{BindingId, Message, Metadata, Payload};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Protocol family of a binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    Serial,
    ModbusRtu,
    WebsocketClient,
    WebsocketServer,
    Loopback,
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ProtocolKind::Serial => "serial",
            ProtocolKind::ModbusRtu => "modbus_rtu",
            ProtocolKind::WebsocketClient => "websocket_client",
            ProtocolKind::WebsocketServer => "websocket_server",
            ProtocolKind::Loopback => "loopback",
        };
        f.write_str(text)
    }
}

impl From<&TransportConfig> for ProtocolKind {
    fn from(config: &TransportConfig) -> Self {
        match config {
            TransportConfig::Serial(_) => ProtocolKind::Serial,
            TransportConfig::ModbusRtu(_) => ProtocolKind::ModbusRtu,
            TransportConfig::WebsocketClient(_) => ProtocolKind::WebsocketClient,
            TransportConfig::WebsocketServer(_) => ProtocolKind::WebsocketServer,
            TransportConfig::Loopback(_) => ProtocolKind::Loopback,
        }
    }
}

/// One decoded inbound payload, before it is stamped into a [`Message`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Received {
    pub payload: Payload,
    pub metadata: Metadata,
}

impl Received {
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            metadata: Metadata::new(),
        }
    }

    pub fn into_message(self, source: BindingId) -> Message {
        Message::new(source, self.payload).with_metadata(self.metadata)
    }
}

/// Common interface of every protocol binding
///
/// Methods block; each transport is driven by exactly one binding thread.
#[cfg_attr(test, mockall::automock)]
pub trait Transport: Send {
    /// Protocol family
    fn kind(&self) -> ProtocolKind;

    /// Establish the connection (open the port, dial or listen)
    fn connect(&mut self) -> Result<()>;

    /// Release every resource; calling it again is a no-op
    fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    /// Transmit one message
    fn send(&mut self, message: &Message) -> Result<()>;

    /// Wait up to `timeout` for the next inbound payload
    ///
    /// `Ok(None)` means nothing arrived in time.
    fn poll(&mut self, timeout: Duration) -> Result<Option<Received>>;
}

/// Lazy sequence of inbound messages from a transport
///
/// Yields until the transport disconnects or fails with a non-retryable
/// error. Undecodable packets are yielded as errors without ending the
/// sequence. A new `Inbound` over the same transport resumes where the
/// previous one stopped.
pub struct Inbound<'a> {
    transport: &'a mut dyn Transport,
    source: BindingId,
    timeout: Duration,
    stop_when_idle: bool,
    done: bool,
}

impl<'a> Inbound<'a> {
    pub fn new(transport: &'a mut dyn Transport, source: BindingId, timeout: Duration) -> Self {
        Self {
            transport,
            source,
            timeout,
            stop_when_idle: false,
            done: false,
        }
    }

    /// End the sequence the first time a poll times out
    pub fn until_idle(mut self) -> Self {
        self.stop_when_idle = true;
        self
    }
}

impl Iterator for Inbound<'_> {
    type Item = Result<Message>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.done {
            if !self.transport.is_connected() {
                self.done = true;
                break;
            }
            match self.transport.poll(self.timeout) {
                Ok(Some(received)) => return Some(Ok(received.into_message(self.source.clone()))),
                Ok(None) if self.stop_when_idle => {
                    self.done = true;
                }
                Ok(None) => {}
                Err(e) => {
                    if !e.is_decode_failure() && !e.is_transient() {
                        self.done = true;
                    }
                    return Some(Err(e));
                }
            }
        }
        None
    }
}

/// Check a binding's protocol settings and resolve its file paths
pub fn prepare(binding: &BindingConfig, base_dir: &Path) -> Result<BindingConfig> {
    let mut prepared = binding.clone();
    match &mut prepared.transport {
        TransportConfig::Serial(serial) => serial::check_line(&serial.line)?,
        TransportConfig::ModbusRtu(config) => {
            serial::check_line(&config.line)?;
            modbus::RegisterMap::from_config(&config.registers)?;
        }
        TransportConfig::WebsocketClient(config) => {
            if !(config.url.starts_with("ws://") || config.url.starts_with("wss://")) {
                return Err(RadapterError::Config(format!(
                    "websocket url '{}' must start with ws:// or wss://",
                    config.url
                )));
            }
        }
        TransportConfig::WebsocketServer(config) => {
            match (&config.cert_file, &config.key_file) {
                (Some(_), None) | (None, Some(_)) => {
                    return Err(RadapterError::Config(
                        "cert_file and key_file must be given together".to_string(),
                    ))
                }
                _ => {}
            }
            config.cert_file = config.cert_file.as_deref().map(|p| resolve_path(base_dir, p));
            config.key_file = config.key_file.as_deref().map(|p| resolve_path(base_dir, p));
        }
        TransportConfig::Loopback(_) => {}
    }
    Ok(prepared)
}

/// Construct the transport for a binding (not yet connected)
pub fn open(binding: &BindingConfig) -> Result<Box<dyn Transport>> {
    let transport: Box<dyn Transport> = match &binding.transport {
        TransportConfig::Serial(config) => Box::new(SerialTransport::new(config.clone())),
        TransportConfig::ModbusRtu(config) => Box::new(ModbusRtuTransport::new(config.clone())?),
        TransportConfig::WebsocketClient(config) => {
            Box::new(WebsocketClientTransport::new(config.clone()))
        }
        TransportConfig::WebsocketServer(config) => {
            Box::new(WebsocketServerTransport::new(config.clone()))
        }
        TransportConfig::Loopback(config) => Box::new(LoopbackTransport::new(config.echo)),
    };
    Ok(transport)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LoopbackConfig, WebsocketClientConfig, WebsocketServerConfig};
    use crate::message::into_payload;
    use mockall::Sequence;
    use serde_json::json;
    use std::path::PathBuf;

    fn received(value: serde_json::Value) -> Received {
        Received::new(into_payload(value))
    }

    #[test]
    fn test_inbound_yields_until_disconnect() {
        let mut mock = MockTransport::new();
        let mut seq = Sequence::new();
        mock.expect_is_connected()
            .times(2)
            .in_sequence(&mut seq)
            .return_const(true);
        mock.expect_is_connected()
            .times(1)
            .in_sequence(&mut seq)
            .return_const(false);
        mock.expect_poll()
            .times(2)
            .returning(|_| Ok(Some(received(json!({"n": 1})))));

        let source = BindingId::new("m");
        let items: Vec<_> = Inbound::new(&mut mock, source.clone(), Duration::from_millis(1)).collect();
        assert_eq!(items.len(), 2);
        let first = items[0].as_ref().unwrap();
        assert_eq!(first.source(), &source);
        assert_eq!(first.payload()["n"], json!(1));
    }

    #[test]
    fn test_inbound_until_idle() {
        let mut mock = MockTransport::new();
        mock.expect_is_connected().return_const(true);
        let mut seq = Sequence::new();
        mock.expect_poll()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Some(received(json!({"n": 1})))));
        mock.expect_poll()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(None));

        let count = Inbound::new(&mut mock, BindingId::new("m"), Duration::from_millis(1))
            .until_idle()
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_inbound_survives_decode_errors_and_stops_on_fatal() {
        let mut mock = MockTransport::new();
        mock.expect_is_connected().return_const(true);
        let mut seq = Sequence::new();
        mock.expect_poll()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(RadapterError::Framing("bad frame".into())));
        mock.expect_poll()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Some(received(json!({})))));
        mock.expect_poll()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(RadapterError::Disconnected("gone".into())));

        let items: Vec<_> =
            Inbound::new(&mut mock, BindingId::new("m"), Duration::from_millis(1)).collect();
        assert_eq!(items.len(), 3);
        assert!(items[0].is_err());
        assert!(items[1].is_ok());
        assert!(items[2].is_err());
    }

    #[test]
    fn test_prepare_rejects_bad_url() {
        let binding = BindingConfig::new(
            "ws",
            TransportConfig::WebsocketClient(WebsocketClientConfig {
                url: "http://example.com".into(),
                accept_invalid_certs: false,
                connect_timeout_ms: 100,
            }),
        );
        assert!(prepare(&binding, Path::new(".")).is_err());
    }

    #[test]
    fn test_prepare_resolves_tls_paths() {
        let binding = BindingConfig::new(
            "srv",
            TransportConfig::WebsocketServer(WebsocketServerConfig {
                host: "127.0.0.1".into(),
                port: 0,
                cert_file: Some(PathBuf::from("certs/cert.pem")),
                key_file: Some(PathBuf::from("certs/key.pem")),
            }),
        );
        let prepared = prepare(&binding, Path::new("/etc/radapter")).unwrap();
        match prepared.transport {
            TransportConfig::WebsocketServer(config) => {
                assert_eq!(
                    config.cert_file.unwrap(),
                    PathBuf::from("/etc/radapter/certs/cert.pem")
                );
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_prepare_requires_cert_and_key() {
        let binding = BindingConfig::new(
            "srv",
            TransportConfig::WebsocketServer(WebsocketServerConfig {
                host: "127.0.0.1".into(),
                port: 0,
                cert_file: Some(PathBuf::from("cert.pem")),
                key_file: None,
            }),
        );
        assert!(prepare(&binding, Path::new(".")).is_err());
    }

    #[test]
    fn test_open_loopback() {
        let binding = BindingConfig::new("lo", TransportConfig::Loopback(LoopbackConfig::default()));
        let transport = open(&binding).unwrap();
        assert_eq!(transport.kind(), ProtocolKind::Loopback);
        assert!(!transport.is_connected());
    }
}
