//! Binding worker thread
//!
//! One worker drives one transport. Each loop iteration handles pending
//! commands, flushes the send queue, then reads inbound traffic for up to
//! the poll timeout.
//!
//! # Failure handling
//!
//! - Transient errors (timeouts, framing, interrupted I/O) are retried with
//!   exponential backoff up to `retry.max_attempts`
//! - Exhausted retries and lost links fault the binding and emit
//!   `BindingFault`
//! - Errors tied to one message (bad payload, Modbus exception) emit
//!   `SendFailed` and leave the link up
//! - An undecodable inbound packet is counted and dropped

use super::{BindingCommand, BindingEntry, BindingStats, ConnectionState, MessageSink, StateCell};
use crate::config::RetrySettings;
use crate::error::RadapterError;
use crate::events::{EventFeed, RuntimeEvent};
use crate::message::{BindingId, Message};
use crate::transport::{Inbound, ProtocolKind, Transport};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Outbound messages written per loop iteration before reading inbound
const MAX_SEND_BATCH: usize = 64;
/// Inbound messages read per loop iteration before flushing outbound again
const MAX_RECEIVE_BATCH: usize = 64;

/// Timing and retry knobs of a worker
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub retry: RetrySettings,
    pub poll_timeout: Duration,
    pub auto_reconnect: Option<Duration>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            retry: RetrySettings::default(),
            poll_timeout: Duration::from_millis(10),
            auto_reconnect: None,
        }
    }
}

/// State owned by a binding thread
pub struct BindingWorker {
    id: BindingId,
    transport: Box<dyn Transport>,
    outbound: Receiver<Arc<Message>>,
    command_tx: Sender<BindingCommand>,
    command_rx: Receiver<BindingCommand>,
    sink: Arc<dyn MessageSink>,
    feed: EventFeed,
    options: WorkerOptions,
    state: StateCell,
    stats: Arc<Mutex<BindingStats>>,
    running: bool,
    faulted_at: Option<Instant>,
    inbound_errors: u32,
    /// Reconnect asked for while the worker was backing off
    reconnect_requested: bool,
}

impl BindingWorker {
    pub fn new(
        entry: &BindingEntry,
        transport: Box<dyn Transport>,
        sink: Arc<dyn MessageSink>,
        feed: EventFeed,
        options: WorkerOptions,
    ) -> Self {
        let (command_tx, command_rx) = unbounded();
        Self {
            id: entry.id.clone(),
            transport,
            outbound: entry.queue.receiver(),
            command_tx,
            command_rx,
            sink,
            feed,
            options,
            state: entry.state.clone(),
            stats: entry.stats.clone(),
            running: true,
            faulted_at: None,
            inbound_errors: 0,
            reconnect_requested: false,
        }
    }

    pub fn id(&self) -> &BindingId {
        &self.id
    }

    pub fn kind(&self) -> ProtocolKind {
        self.transport.kind()
    }

    pub fn command_sender(&self) -> Sender<BindingCommand> {
        self.command_tx.clone()
    }

    /// Run the worker loop until stopped
    pub fn run(mut self) {
        tracing::info!("Binding {} ({}) worker started", self.id, self.transport.kind());
        self.connect_with_retry();

        while self.running {
            self.process_commands();
            if !self.running {
                break;
            }
            match self.state.get() {
                ConnectionState::Connected => {
                    self.flush_outbound();
                    if self.running && self.state.get() == ConnectionState::Connected {
                        self.receive_inbound();
                    }
                }
                ConnectionState::Faulted => self.idle_faulted(),
                ConnectionState::Disconnected | ConnectionState::Connecting => {
                    self.wait_for_command(self.options.poll_timeout);
                }
            }
        }

        self.transport.disconnect();
        self.set_state(ConnectionState::Disconnected);
        tracing::info!("Binding {} worker stopped", self.id);
    }

    fn set_state(&self, state: ConnectionState) {
        if self.state.set(state) != state {
            self.feed.emit(RuntimeEvent::BindingState {
                binding: self.id.clone(),
                state,
            });
        }
    }

    fn with_stats(&self, f: impl FnOnce(&mut BindingStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            f(&mut stats);
        }
    }

    // =========================================================================
    // Commands
    // =========================================================================

    fn process_commands(&mut self) {
        loop {
            match self.command_rx.try_recv() {
                Ok(cmd) => self.handle_command(cmd),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.running = false;
                    break;
                }
            }
        }
        if self.running && std::mem::take(&mut self.reconnect_requested) {
            self.handle_command(BindingCommand::Reconnect);
        }
    }

    fn handle_command(&mut self, cmd: BindingCommand) {
        match cmd {
            BindingCommand::Reconnect => {
                tracing::info!("Binding {} reconnecting", self.id);
                self.transport.disconnect();
                self.set_state(ConnectionState::Disconnected);
                if self.connect_with_retry() {
                    self.with_stats(|s| s.record_reconnect());
                }
            }
            BindingCommand::Stop => self.running = false,
        }
    }

    /// Block for up to `timeout` waiting for a command
    fn wait_for_command(&mut self, timeout: Duration) {
        match self.command_rx.recv_timeout(timeout) {
            Ok(cmd) => self.handle_command(cmd),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => self.running = false,
        }
    }

    /// Sleep that wakes early on Stop; returns false if the worker must exit
    ///
    /// A Reconnect received meanwhile is deferred to the next command pass.
    fn pause(&mut self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.command_rx.recv_timeout(left) {
                Ok(BindingCommand::Stop) | Err(RecvTimeoutError::Disconnected) => {
                    self.running = false;
                    return false;
                }
                Ok(BindingCommand::Reconnect) => self.reconnect_requested = true,
                Err(RecvTimeoutError::Timeout) => return true,
            }
        }
    }

    // =========================================================================
    // Connection
    // =========================================================================

    fn connect_with_retry(&mut self) -> bool {
        let attempts = self.options.retry.attempts();
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            if !self.running {
                return false;
            }
            self.set_state(ConnectionState::Connecting);
            match self.transport.connect() {
                Ok(()) => {
                    self.faulted_at = None;
                    self.inbound_errors = 0;
                    self.reconnect_requested = false;
                    self.set_state(ConnectionState::Connected);
                    return true;
                }
                Err(e) => {
                    tracing::warn!(
                        "Binding {} connect attempt {}/{} failed: {}",
                        self.id,
                        attempt,
                        attempts,
                        e
                    );
                    last_error = e.to_string();
                    if attempt < attempts && !self.pause(self.options.retry.backoff(attempt)) {
                        return false;
                    }
                }
            }
        }
        self.fault(last_error, attempts);
        false
    }

    fn fault(&mut self, error: String, attempts: u32) {
        self.transport.disconnect();
        self.faulted_at = Some(Instant::now());
        self.set_state(ConnectionState::Faulted);
        self.feed.emit(RuntimeEvent::BindingFault {
            binding: self.id.clone(),
            error,
            attempts,
        });
    }

    fn idle_faulted(&mut self) {
        if let (Some(delay), Some(at)) = (self.options.auto_reconnect, self.faulted_at) {
            if at.elapsed() >= delay {
                tracing::info!("Binding {} auto-reconnecting", self.id);
                if self.connect_with_retry() {
                    self.with_stats(|s| s.record_reconnect());
                }
                return;
            }
        }
        self.wait_for_command(self.options.poll_timeout.max(Duration::from_millis(10)));
    }

    // =========================================================================
    // Traffic
    // =========================================================================

    fn flush_outbound(&mut self) {
        for _ in 0..MAX_SEND_BATCH {
            let Ok(message) = self.outbound.try_recv() else {
                break;
            };
            self.send_with_retry(&message);
            if !self.running || self.state.get() != ConnectionState::Connected {
                break;
            }
        }
    }

    fn send_with_retry(&mut self, message: &Message) {
        let attempts = self.options.retry.attempts();
        let mut attempt = 1;
        loop {
            let start = Instant::now();
            let error = match self.transport.send(message) {
                Ok(()) => {
                    let elapsed = start.elapsed().as_micros() as u64;
                    self.with_stats(|s| s.record_send(elapsed));
                    return;
                }
                Err(e) => e,
            };

            if error.is_transient() && attempt < attempts {
                tracing::debug!(
                    "Binding {} send attempt {}/{} failed: {}",
                    self.id,
                    attempt,
                    attempts,
                    error
                );
                if !self.pause(self.options.retry.backoff(attempt)) {
                    return;
                }
                attempt += 1;
                continue;
            }

            self.with_stats(|s| s.record_send_failure());
            self.feed.emit(RuntimeEvent::SendFailed {
                binding: self.id.clone(),
                edge: None,
                error: error.to_string(),
            });
            if !error.is_message_scoped() {
                self.fault(error.to_string(), attempt);
            }
            return;
        }
    }

    fn receive_inbound(&mut self) {
        if !self.sink.accepting() {
            self.wait_for_command(self.options.poll_timeout);
            return;
        }

        // A transient error ends the batch so the worker backs off before
        // polling again
        let mut batch: Vec<Result<Message, RadapterError>> = Vec::new();
        let inbound = Inbound::new(
            self.transport.as_mut(),
            self.id.clone(),
            self.options.poll_timeout,
        )
        .until_idle();
        for item in inbound.take(MAX_RECEIVE_BATCH) {
            let transient = matches!(&item, Err(e) if !e.is_decode_failure() && e.is_transient());
            batch.push(item);
            if transient {
                break;
            }
        }

        for item in batch {
            match item {
                Ok(message) => {
                    self.inbound_errors = 0;
                    self.with_stats(|s| s.record_received());
                    if !self.sink.submit(message.into_shared()) {
                        self.with_stats(|s| s.record_rejected());
                        tracing::debug!("Binding {} inbound message refused", self.id);
                    }
                }
                Err(e) if e.is_decode_failure() => {
                    self.with_stats(|s| s.record_decode_failure());
                    tracing::warn!("Binding {} dropped undecodable packet: {}", self.id, e);
                }
                Err(e) if e.is_transient() => {
                    self.inbound_errors += 1;
                    tracing::debug!("Binding {} receive error: {}", self.id, e);
                    if self.inbound_errors >= self.options.retry.attempts() {
                        let attempts = self.inbound_errors;
                        self.fault(e.to_string(), attempts);
                        return;
                    }
                    if !self.pause(self.options.retry.backoff(self.inbound_errors)) {
                        return;
                    }
                }
                Err(e) if e.is_message_scoped() => {
                    self.with_stats(|s| s.record_decode_failure());
                    tracing::warn!("Binding {} receive failed: {}", self.id, e);
                }
                Err(e) => {
                    self.fault(e.to_string(), 1);
                    return;
                }
            }
        }

        // The transport may have dropped its link without reporting an error
        if !self.transport.is_connected() && self.state.get() == ConnectionState::Connected {
            self.fault("link closed".to_string(), 1);
        }
    }
}
