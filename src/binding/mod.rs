//! Binding workers
//!
//! A binding is one configured transport plus the thread that drives it.
//! The worker connects with retry, drains the binding's [`SendQueue`] into
//! the transport, and hands inbound messages to a [`MessageSink`] (the
//! routing pool in a running runtime).
//!
//! # Connection states
//!
//! ```text
//! Disconnected ──▶ Connecting ──▶ Connected
//!                     ▲  │            │
//!                     │  ▼            ▼
//!                     └─ Faulted ◀────┘   (retries exhausted / link lost)
//! ```
//!
//! A Faulted binding keeps queueing outbound messages (with drop-oldest
//! backpressure) until `reconnect` or its auto-reconnect delay brings it back.

pub mod queue;
pub mod registry;
pub mod stats;
pub mod worker;

pub use queue::SendQueue;
pub use registry::{BindingEntry, BindingRegistry};
pub use stats::BindingStats;
pub use worker::{BindingWorker, WorkerOptions};

use crate::error::{RadapterError, Result};
use crate::message::{BindingId, Message};
use crate::transport::ProtocolKind;
use crossbeam_channel::Sender;
use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Connection state of a binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Faulted = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Faulted,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Connection state shared between a worker and observers
#[derive(Debug, Clone, Default)]
pub struct StateCell(Arc<AtomicU8>);

impl StateCell {
    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Store a new state, returning the previous one
    pub fn set(&self, state: ConnectionState) -> ConnectionState {
        ConnectionState::from_u8(self.0.swap(state as u8, Ordering::SeqCst))
    }
}

/// Commands accepted by a running binding worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingCommand {
    /// Drop the link and connect again
    Reconnect,
    /// Disconnect and exit the worker
    Stop,
}

/// Where a worker delivers inbound messages
pub trait MessageSink: Send + Sync {
    /// Hand over one inbound message; false if it was refused
    fn submit(&self, message: Arc<Message>) -> bool;

    /// Whether inbound traffic should be read at all
    fn accepting(&self) -> bool {
        true
    }
}

impl MessageSink for Sender<Arc<Message>> {
    fn submit(&self, message: Arc<Message>) -> bool {
        self.send(message).is_ok()
    }
}

/// Owner's handle to a running binding thread
#[derive(Debug)]
pub struct BindingHandle {
    id: BindingId,
    kind: ProtocolKind,
    commands: Sender<BindingCommand>,
    thread: Option<JoinHandle<()>>,
}

impl BindingHandle {
    /// Start `worker` on its own thread
    pub fn spawn(worker: BindingWorker) -> Result<Self> {
        let id = worker.id().clone();
        let kind = worker.kind();
        let commands = worker.command_sender();
        let thread = std::thread::Builder::new()
            .name(format!("binding-{}", id))
            .spawn(move || worker.run())?;
        Ok(Self {
            id,
            kind,
            commands,
            thread: Some(thread),
        })
    }

    pub fn id(&self) -> &BindingId {
        &self.id
    }

    pub fn kind(&self) -> ProtocolKind {
        self.kind
    }

    /// Ask the worker to drop its link and connect again
    pub fn reconnect(&self) -> Result<()> {
        self.commands
            .send(BindingCommand::Reconnect)
            .map_err(|_| RadapterError::Channel(format!("binding {} has stopped", self.id)))
    }

    /// Ask the worker to exit without waiting for it
    pub fn request_stop(&self) {
        let _ = self.commands.send(BindingCommand::Stop);
    }

    /// Stop the worker and wait for its thread
    pub fn stop(mut self) {
        self.shutdown();
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    fn shutdown(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.commands.send(BindingCommand::Stop);
            if thread.join().is_err() {
                tracing::error!("Binding {} worker panicked", self.id);
            }
        }
    }
}

impl Drop for BindingHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
