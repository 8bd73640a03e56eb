//! Modbus RTU master transport
//!
//! Polls the configured register map every `poll_interval_ms` and emits a
//! payload holding only the values that changed since the previous poll.
//! Outbound payloads are flattened and each path that names a writable
//! register is written to the slave.

pub mod frame;
pub mod registers;

pub use registers::{ReadBlock, Register, RegisterMap, Table, DEFAULT_GAP_THRESHOLD};

use super::serial::{open_port, Link};
use super::{ProtocolKind, Received, Transport};
use crate::config::{ModbusConfig, RegisterType};
use crate::error::{RadapterError, Result};
use crate::message::path::{flatten, set_path};
use crate::message::{Message, Payload, Scalar};
use frame::{decode_response, remaining, Request, Response, MAX_WRITE_REGISTERS};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io;
use std::time::{Duration, Instant};

/// Modbus RTU master over a serial line
pub struct ModbusRtuTransport {
    config: ModbusConfig,
    map: RegisterMap,
    plan: Vec<ReadBlock>,
    link: Option<Box<dyn Link>>,
    last: BTreeMap<String, Value>,
    next_poll: Instant,
}

impl ModbusRtuTransport {
    pub fn new(config: ModbusConfig) -> Result<Self> {
        let map = RegisterMap::from_config(&config.registers)?;
        let plan = map.plan_reads(DEFAULT_GAP_THRESHOLD);
        tracing::debug!(
            "Modbus slave {}: {} register(s) in {} read block(s)",
            config.slave_id,
            map.len(),
            plan.len()
        );
        Ok(Self {
            config,
            map,
            plan,
            link: None,
            last: BTreeMap::new(),
            next_poll: Instant::now(),
        })
    }

    /// Use an already open link instead of opening the configured port
    pub fn with_link(config: ModbusConfig, link: Box<dyn Link>) -> Result<Self> {
        let mut transport = Self::new(config)?;
        transport.link = Some(link);
        Ok(transport)
    }

    pub fn register_map(&self) -> &RegisterMap {
        &self.map
    }

    fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.config.response_timeout_ms)
    }

    /// Send one request and wait for its response
    fn transact(&mut self, request: &Request) -> Result<Response> {
        let slave = self.config.slave_id;
        let timeout = self.response_timeout();
        let port = &self.config.line.port;
        let link = self
            .link
            .as_mut()
            .ok_or_else(|| RadapterError::Disconnected(port.clone()))?;

        link.clear_input()?;
        link.write_all(&request.encode(slave))?;
        link.flush()?;

        let deadline = Instant::now() + timeout;
        let mut adu = Vec::with_capacity(request.response_len());
        let mut chunk = [0u8; 256];
        loop {
            let need = remaining(request, &adu);
            if need == 0 {
                break;
            }
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Err(RadapterError::Timeout(format!(
                    "slave {} did not answer function 0x{:02X} within {:?}",
                    slave,
                    request.function(),
                    timeout
                )));
            }
            link.set_timeout(left)?;
            let want = need.min(chunk.len());
            match link.read(&mut chunk[..want]) {
                Ok(0) => {
                    self.link = None;
                    return Err(RadapterError::Disconnected(format!("{} closed", port)));
                }
                Ok(n) => adu.extend_from_slice(&chunk[..n]),
                Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::Interrupted) => {}
                Err(e) => return Err(e.into()),
            }
        }
        decode_response(slave, request, &adu)
    }

    /// Read every block and collect the values that changed
    fn poll_cycle(&mut self) -> Result<Payload> {
        let mut changed = Payload::new();
        for i in 0..self.plan.len() {
            let request = self.plan[i].request();
            let data: Vec<u16> = match self.transact(&request)? {
                Response::Bits(bits) => bits.into_iter().map(u16::from).collect(),
                Response::Words(words) => words,
                Response::Written => Vec::new(),
            };
            for (path, value) in self.map.extract(&self.plan[i], &data) {
                if self.last.get(&path) != Some(&value) {
                    self.last.insert(path.clone(), value.clone());
                    set_path(&mut changed, &path, value);
                }
            }
        }
        Ok(changed)
    }

    fn write_register(&mut self, register: &Register, value: &Value) -> Result<()> {
        let words = register.encode(value)?;
        let address = register.config.index;
        let request = match (register.table, register.config.kind) {
            (Table::Coils, _) => Request::WriteCoil {
                address,
                value: words[0] != 0,
            },
            (_, RegisterType::U16 | RegisterType::I16) => Request::WriteRegister {
                address,
                value: words[0],
            },
            _ if words.len() as u16 <= MAX_WRITE_REGISTERS => Request::WriteRegisters {
                start: address,
                values: words,
            },
            _ => {
                return Err(RadapterError::Modbus(format!(
                    "register '{}' is too wide to write",
                    register.path
                )))
            }
        };
        self.transact(&request)?;
        tracing::debug!("Wrote {} = {} to slave {}", register.path, value, self.config.slave_id);
        Ok(())
    }
}

impl Transport for ModbusRtuTransport {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::ModbusRtu
    }

    fn connect(&mut self) -> Result<()> {
        if self.link.is_none() {
            self.link = Some(open_port(&self.config.line, self.response_timeout())?);
        }
        self.last.clear();
        self.next_poll = Instant::now();
        Ok(())
    }

    fn disconnect(&mut self) {
        if self.link.take().is_some() {
            tracing::info!("Closed Modbus line {}", self.config.line.port);
        }
    }

    fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    fn send(&mut self, message: &Message) -> Result<()> {
        let mut written = 0;
        for (path, value) in flatten(message.payload()) {
            let Some(register) = self.map.get(&path).cloned() else {
                tracing::debug!("No register for '{}', skipped", path);
                continue;
            };
            if !register.config.mode.writable() {
                return Err(RadapterError::Config(format!(
                    "register '{}' is not writable",
                    path
                )));
            }
            self.write_register(&register, &value)?;
            if let Some(current) = self.last.get_mut(&path) {
                *current = register.decode(&register.encode(&value)?);
            }
            written += 1;
        }
        if written == 0 {
            return Err(RadapterError::Config(
                "payload names no writable register".to_string(),
            ));
        }
        Ok(())
    }

    fn poll(&mut self, timeout: Duration) -> Result<Option<Received>> {
        if self.link.is_none() {
            return Err(RadapterError::Disconnected(self.config.line.port.clone()));
        }
        let now = Instant::now();
        if now < self.next_poll {
            let wait = self.next_poll - now;
            if wait > timeout {
                std::thread::sleep(timeout);
                return Ok(None);
            }
            std::thread::sleep(wait);
        }
        self.next_poll = Instant::now() + Duration::from_millis(self.config.poll_interval_ms);

        let changed = self.poll_cycle()?;
        if changed.is_empty() {
            return Ok(None);
        }
        let mut received = Received::new(changed);
        received
            .metadata
            .insert("slave_id".to_string(), Scalar::Int(self.config.slave_id as i64));
        Ok(Some(received))
    }
}
