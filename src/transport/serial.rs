//! Raw serial transport
//!
//! Payloads travel as JSON, one object per SLIP or newline frame.

use super::codec::{decode_payload, encode_payload, slip_encode, FrameDecoder, LineDecoder, SlipDecoder};
use super::{ProtocolKind, Received, Transport};
use crate::config::{FlowControlConfig, Framing, ParityConfig, SerialConfig, SerialLineConfig};
use crate::error::{RadapterError, Result, ResultExt};
use crate::message::{Message, Scalar};
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

/// Byte link underneath a serial style transport
///
/// Implemented for real ports; tests substitute in-memory links.
pub trait Link: Read + Write + Send {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Drop any unread input
    fn clear_input(&mut self) -> Result<()> {
        Ok(())
    }
}

impl Link for Box<dyn serialport::SerialPort> {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        serialport::SerialPort::set_timeout(self.as_mut(), timeout).map_err(serial_error)
    }

    fn clear_input(&mut self) -> Result<()> {
        self.clear(serialport::ClearBuffer::Input).map_err(serial_error)
    }
}

pub(crate) fn serial_error(e: serialport::Error) -> RadapterError {
    match e.kind() {
        serialport::ErrorKind::NoDevice => RadapterError::Disconnected(e.to_string()),
        serialport::ErrorKind::Io(kind) => RadapterError::Io(io::Error::new(kind, e.description)),
        _ => RadapterError::Connect(e.to_string()),
    }
}

/// Reject line settings the hardware cannot express
pub fn check_line(line: &SerialLineConfig) -> Result<()> {
    if line.port.trim().is_empty() {
        return Err(RadapterError::Config("serial port name is empty".to_string()));
    }
    if line.baud == 0 {
        return Err(RadapterError::Config("baud rate must be positive".to_string()));
    }
    if !(5..=8).contains(&line.data_bits) {
        return Err(RadapterError::Config(format!(
            "data_bits must be 5-8, got {}",
            line.data_bits
        )));
    }
    if !(1..=2).contains(&line.stop_bits) {
        return Err(RadapterError::Config(format!(
            "stop_bits must be 1 or 2, got {}",
            line.stop_bits
        )));
    }
    Ok(())
}

/// Open the port described by `line`
pub(crate) fn open_port(line: &SerialLineConfig, timeout: Duration) -> Result<Box<dyn Link>> {
    let data_bits = match line.data_bits {
        5 => serialport::DataBits::Five,
        6 => serialport::DataBits::Six,
        7 => serialport::DataBits::Seven,
        _ => serialport::DataBits::Eight,
    };
    let parity = match line.parity {
        ParityConfig::None => serialport::Parity::None,
        ParityConfig::Even => serialport::Parity::Even,
        ParityConfig::Odd => serialport::Parity::Odd,
    };
    let stop_bits = match line.stop_bits {
        2 => serialport::StopBits::Two,
        _ => serialport::StopBits::One,
    };
    let flow_control = match line.flow_control {
        FlowControlConfig::None => serialport::FlowControl::None,
        FlowControlConfig::Software => serialport::FlowControl::Software,
        FlowControlConfig::Hardware => serialport::FlowControl::Hardware,
    };
    let port = serialport::new(line.port.as_str(), line.baud)
        .data_bits(data_bits)
        .parity(parity)
        .stop_bits(stop_bits)
        .flow_control(flow_control)
        .timeout(timeout)
        .open()
        .map_err(|e| RadapterError::Connect(e.to_string()))
        .with_context(|| format!("Failed to open {}", line.port))?;
    tracing::info!("Opened serial port {} at {} baud", line.port, line.baud);
    Ok(Box::new(port))
}

/// JSON-over-serial transport
pub struct SerialTransport {
    config: SerialConfig,
    link: Option<Box<dyn Link>>,
    decoder: Box<dyn FrameDecoder>,
    buf: Vec<u8>,
}

impl SerialTransport {
    pub fn new(config: SerialConfig) -> Self {
        let decoder = decoder_for(config.framing);
        Self {
            config,
            link: None,
            decoder,
            buf: vec![0; 1024],
        }
    }

    /// Use an already open link instead of opening the configured port
    pub fn with_link(config: SerialConfig, link: Box<dyn Link>) -> Self {
        let mut transport = Self::new(config);
        transport.link = Some(link);
        transport
    }

    fn frame(&self, message: &Message) -> Result<Vec<u8>> {
        let mut bytes = encode_payload(message)?;
        Ok(match self.config.framing {
            Framing::Slip => slip_encode(&bytes),
            Framing::Line => {
                bytes.push(b'\n');
                bytes
            }
        })
    }

    fn received(&self, frame: &[u8]) -> Result<Received> {
        let mut received = Received::new(decode_payload(frame)?);
        received
            .metadata
            .insert("port".to_string(), Scalar::from(self.config.line.port.as_str()));
        Ok(received)
    }
}

fn decoder_for(framing: Framing) -> Box<dyn FrameDecoder> {
    match framing {
        Framing::Slip => Box::new(SlipDecoder::new()),
        Framing::Line => Box::new(LineDecoder::new()),
    }
}

impl Transport for SerialTransport {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Serial
    }

    fn connect(&mut self) -> Result<()> {
        if self.link.is_none() {
            self.link = Some(open_port(&self.config.line, Duration::from_millis(10))?);
        }
        self.decoder.reset();
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.link.take().is_some() {
            tracing::info!("Closed serial port {}", self.config.line.port);
        }
        self.decoder.reset();
    }

    fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    fn send(&mut self, message: &Message) -> Result<()> {
        let frame = self.frame(message)?;
        let link = self
            .link
            .as_mut()
            .ok_or_else(|| RadapterError::Disconnected(self.config.line.port.clone()))?;
        link.write_all(&frame)?;
        link.flush()?;
        Ok(())
    }

    fn poll(&mut self, timeout: Duration) -> Result<Option<Received>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(frame) = self.decoder.next_frame() {
                return frame.and_then(|f| self.received(&f)).map(Some);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let link = self
                .link
                .as_mut()
                .ok_or_else(|| RadapterError::Disconnected(self.config.line.port.clone()))?;
            link.set_timeout(remaining)?;
            match link.read(&mut self.buf) {
                Ok(0) => {
                    self.link = None;
                    return Err(RadapterError::Disconnected(format!(
                        "{} closed",
                        self.config.line.port
                    )));
                }
                Ok(n) => self.decoder.feed(&self.buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}
