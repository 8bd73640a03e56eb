//! Pipeline runtime
//!
//! The [`Runtime`] owns every binding worker, the binding registry, the
//! router and the routing pool, and drives their lifecycle:
//!
//! ```text
//! Initializing ──start──▶ Running ──shutdown──▶ Draining ──▶ Stopped
//!                           │  ▲
//!                           └──┘ reload
//! ```
//!
//! # Shutdown
//!
//! 1. The routing pool stops accepting inbound messages
//! 2. Queued routing jobs and send queues drain, up to the grace period
//! 3. Running scripts are cancelled
//! 4. Bindings stop in reverse start order
//! 5. The event feed closes
//!
//! # Reload
//!
//! Bindings whose configuration is unchanged keep running. Changed bindings
//! restart (keeping their queued messages), new ones start, and the router
//! graph is swapped with unchanged edges carried over. Bindings no longer
//! configured stop after the new graph is in place.

mod builder;

pub use builder::{RuntimeBuilder, TransportFactory};

use crate::binding::{
    BindingEntry, BindingHandle, BindingRegistry, BindingStats, ConnectionState, MessageSink,
    SendQueue, WorkerOptions,
};
use crate::config::{
    resolve_path, BindingConfig, ConfigEntry, ConfigIssue, LoadedConfig, RuntimeSettings,
    ValidatedConfig,
};
use crate::error::{RadapterError, Result};
use crate::events::{EventFeed, EventRecord, RuntimeEvent};
use crate::message::{BindingId, Message};
use crate::router::{EdgeSpec, EdgeState, ReconfigureReport, RoutePool, Router};
use crate::scripting::ScriptEngine;
use crossbeam_channel::Receiver;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Lifecycle state of the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeState {
    Initializing,
    Running,
    Draining,
    Stopped,
}

/// What a graceful shutdown achieved
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShutdownReport {
    /// Every routing job finished before the grace period ran out
    pub routing_drained: bool,
    /// Messages still queued for sending when bindings were stopped
    pub undelivered: usize,
    pub bindings_stopped: usize,
    pub elapsed: Duration,
}

/// What a reload changed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReloadReport {
    pub bindings_started: Vec<BindingId>,
    pub bindings_restarted: Vec<BindingId>,
    pub bindings_stopped: Vec<BindingId>,
    pub router: ReconfigureReport,
    /// Entries rejected by validation or failing to start
    pub issues: Vec<ConfigIssue>,
}

struct RunningBinding {
    config: BindingConfig,
    entry: Arc<BindingEntry>,
    handle: BindingHandle,
}

/// The running adapter
pub struct Runtime {
    state: Mutex<RuntimeState>,
    loaded: LoadedConfig,
    settings: RuntimeSettings,
    engine: Arc<ScriptEngine>,
    registry: Arc<BindingRegistry>,
    router: Arc<Router>,
    pool: Arc<RoutePool>,
    feed: EventFeed,
    factory: TransportFactory,
    /// In start order
    bindings: Vec<RunningBinding>,
    event_writer: Option<JoinHandle<()>>,
}

impl Runtime {
    pub fn builder(loaded: LoadedConfig) -> RuntimeBuilder {
        RuntimeBuilder::new(loaded)
    }

    // ==================== Lifecycle ====================

    /// Start every valid binding and activate the edge graph
    ///
    /// Invalid entries are reported as `ConfigRejected` events and skipped.
    pub fn start(&mut self) -> Result<Vec<ConfigIssue>> {
        let current = self.state();
        if current != RuntimeState::Initializing {
            return Err(RadapterError::Config(format!(
                "cannot start a runtime that is {:?}",
                current
            )));
        }

        if let Some(file) = &self.loaded.config.events.file {
            let path = resolve_path(&self.loaded.base_dir, file);
            self.event_writer = Some(self.feed.write_to_file(&path)?);
        }

        let validated = self.loaded.validate(&self.engine);
        let mut issues = validated.issues.clone();

        for config in &validated.bindings {
            if let Err(e) = self.start_binding(config.clone(), None) {
                issues.push(ConfigIssue {
                    entry: ConfigEntry::Binding(config.id.clone()),
                    reason: e.to_string(),
                });
            }
        }

        let edges = self.routable_edges(&validated, &mut issues);
        for issue in &issues {
            self.feed.emit(RuntimeEvent::ConfigRejected {
                issue: issue.clone(),
            });
        }
        let report = self.router.reconfigure(edges, self.settings.shutdown_grace());
        issues.extend(report.rejected);

        self.set_state(RuntimeState::Running);
        tracing::info!(
            "Runtime started: {} binding(s), {} edge(s), {} issue(s)",
            self.bindings.len(),
            self.router.snapshot().len(),
            issues.len()
        );
        Ok(issues)
    }

    /// Apply a new configuration to a running runtime
    ///
    /// Runtime-wide settings (thread counts, sandbox limits) need a restart;
    /// changes to them are logged and ignored.
    pub fn reload(&mut self, loaded: LoadedConfig) -> Result<ReloadReport> {
        let current = self.state();
        if current != RuntimeState::Running {
            return Err(RadapterError::Config(format!(
                "cannot reload a runtime that is {:?}",
                current
            )));
        }
        if loaded.config.runtime != self.settings {
            tracing::warn!("Runtime settings changed; restart to apply them");
        }

        let validated = loaded.validate(&self.engine);
        let mut report = ReloadReport {
            issues: validated.issues.clone(),
            ..Default::default()
        };
        let wanted: HashSet<BindingId> = validated.binding_ids();

        for config in &validated.bindings {
            let existing = self.bindings.iter().position(|b| b.config.id == config.id);
            let result = match existing {
                Some(index) if self.bindings[index].config == *config => continue,
                Some(index) => {
                    let old = self.bindings.remove(index);
                    let queue = old.entry.queue.clone();
                    old.handle.stop();
                    self.registry.remove(&old.config.id);
                    let reuse = (queue.capacity() == self.queue_depth(config)).then_some(queue);
                    report.bindings_restarted.push(config.id.clone());
                    self.start_binding(config.clone(), reuse)
                }
                None => {
                    report.bindings_started.push(config.id.clone());
                    self.start_binding(config.clone(), None)
                }
            };
            if let Err(e) = result {
                report.issues.push(ConfigIssue {
                    entry: ConfigEntry::Binding(config.id.clone()),
                    reason: e.to_string(),
                });
            }
        }

        let edges = self.routable_edges(&validated, &mut report.issues);
        for issue in &report.issues {
            self.feed.emit(RuntimeEvent::ConfigRejected {
                issue: issue.clone(),
            });
        }
        report.router = self.router.reconfigure(edges, self.settings.shutdown_grace());
        report.issues.extend(report.router.rejected.iter().cloned());

        let retired: Vec<usize> = (0..self.bindings.len())
            .rev()
            .filter(|&i| !wanted.contains(&self.bindings[i].config.id))
            .collect();
        for index in retired {
            let binding = self.bindings.remove(index);
            binding.handle.stop();
            self.registry.remove(&binding.config.id);
            report.bindings_stopped.push(binding.config.id);
        }

        self.loaded = loaded;
        tracing::info!(
            "Configuration reloaded: {} started, {} restarted, {} stopped, {} issue(s)",
            report.bindings_started.len(),
            report.bindings_restarted.len(),
            report.bindings_stopped.len(),
            report.issues.len()
        );
        Ok(report)
    }

    /// Stop gracefully, waiting at most `grace` for queued work
    pub fn shutdown(&mut self, grace: Duration) -> ShutdownReport {
        let started = Instant::now();
        let mut report = ShutdownReport::default();
        if self.state() == RuntimeState::Stopped {
            report.routing_drained = true;
            return report;
        }

        self.set_state(RuntimeState::Draining);
        let deadline = started + grace;

        self.pool.stop_accepting();
        report.routing_drained = self
            .pool
            .wait_idle(deadline.saturating_duration_since(Instant::now()));
        self.wait_for_queues(deadline);
        report.undelivered = self.registry.queued();

        self.router.cancel_token().cancel();
        self.pool.shutdown();

        while let Some(binding) = self.bindings.pop() {
            tracing::debug!("Stopping binding {}", binding.config.id);
            binding.handle.stop();
            self.registry.remove(&binding.config.id);
            report.bindings_stopped += 1;
        }

        self.set_state(RuntimeState::Stopped);
        self.feed.close();
        if let Some(writer) = self.event_writer.take() {
            if writer.join().is_err() {
                tracing::error!("Event log writer panicked");
            }
        }

        report.elapsed = started.elapsed();
        if report.undelivered > 0 {
            tracing::warn!(
                "Shutdown discarded {} undelivered message(s)",
                report.undelivered
            );
        }
        tracing::info!("Runtime stopped in {:?}", report.elapsed);
        report
    }

    /// Wait for send queues of connected bindings to empty
    fn wait_for_queues(&self, deadline: Instant) {
        loop {
            let busy = self.bindings.iter().any(|b| {
                !b.entry.queue.is_empty() && b.entry.state() == ConnectionState::Connected
            });
            if !busy || Instant::now() >= deadline {
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    // ==================== Bindings ====================

    fn queue_depth(&self, config: &BindingConfig) -> usize {
        config.queue_depth.unwrap_or(self.settings.queue_depth).max(1)
    }

    fn start_binding(&mut self, config: BindingConfig, queue: Option<SendQueue>) -> Result<()> {
        let transport = (self.factory)(&config)?;
        let queue = queue.unwrap_or_else(|| {
            SendQueue::new(config.id.clone(), self.queue_depth(&config), self.feed.clone())
        });
        let entry = Arc::new(BindingEntry::new(config.id.clone(), transport.kind(), queue));
        let sink: Arc<dyn MessageSink> = self.pool.clone();
        let options = WorkerOptions {
            retry: self.settings.retry.clone(),
            poll_timeout: self.settings.poll_timeout(),
            auto_reconnect: config.auto_reconnect(),
        };
        let worker = crate::binding::BindingWorker::new(
            &entry,
            transport,
            sink,
            self.feed.clone(),
            options,
        );

        self.registry.insert(entry.clone());
        let handle = match BindingHandle::spawn(worker) {
            Ok(handle) => handle,
            Err(e) => {
                self.registry.remove(&config.id);
                return Err(e);
            }
        };
        tracing::info!("Binding {} started ({})", config.id, handle.kind());
        self.bindings.push(RunningBinding {
            config,
            entry,
            handle,
        });
        Ok(())
    }

    /// Edges whose endpoints all have a running binding
    fn routable_edges(
        &self,
        validated: &ValidatedConfig,
        issues: &mut Vec<ConfigIssue>,
    ) -> Vec<EdgeSpec> {
        let mut edges = Vec::with_capacity(validated.edges.len());
        for spec in &validated.edges {
            let missing = std::iter::once(&spec.from)
                .chain(spec.to.iter())
                .find(|id| !self.registry.contains(id));
            match missing {
                Some(id) => issues.push(ConfigIssue {
                    entry: ConfigEntry::Edge(spec.name.clone()),
                    reason: format!("binding '{}' is not running", id),
                }),
                None => edges.push(spec.clone()),
            }
        }
        edges
    }

    /// Drop and re-establish a binding's link
    pub fn reconnect(&self, id: &BindingId) -> Result<()> {
        let binding = self
            .bindings
            .iter()
            .find(|b| &b.config.id == id)
            .ok_or_else(|| RadapterError::Config(format!("unknown binding '{}'", id)))?;
        tracing::info!("Reconnect requested for binding {}", id);
        binding.handle.reconnect()
    }

    /// Connection state of every binding, in start order
    pub fn binding_states(&self) -> Vec<(BindingId, ConnectionState)> {
        self.bindings
            .iter()
            .map(|b| (b.config.id.clone(), b.entry.state()))
            .collect()
    }

    pub fn binding_state(&self, id: &BindingId) -> Option<ConnectionState> {
        self.registry.get(id).map(|e| e.state())
    }

    pub fn binding_stats(&self, id: &BindingId) -> Option<BindingStats> {
        self.registry.get(id).map(|e| e.stats())
    }

    // ==================== Edges ====================

    /// Re-enable a Disabled edge
    pub fn enable_edge(&self, name: &str) -> Result<()> {
        self.router.enable_edge(name)
    }

    /// Disable an edge after its in-flight messages finish
    pub fn disable_edge(&self, name: &str) -> Result<bool> {
        self.router
            .disable_edge(name, self.settings.shutdown_grace())
    }

    pub fn edge_state(&self, name: &str) -> Option<EdgeState> {
        self.router.edge_state(name)
    }

    pub fn edge_states(&self) -> Vec<(String, EdgeState)> {
        self.router.edge_states()
    }

    // ==================== Misc ====================

    /// Route a message as if `message.source()` had received it
    pub fn submit(&self, message: Message) -> bool {
        self.pool.dispatch(message.into_shared())
    }

    pub fn subscribe(&self) -> Receiver<EventRecord> {
        self.feed.subscribe()
    }

    pub fn events(&self) -> &EventFeed {
        &self.feed
    }

    pub fn state(&self) -> RuntimeState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(RuntimeState::Stopped)
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    pub fn config(&self) -> &LoadedConfig {
        &self.loaded
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn registry(&self) -> &Arc<BindingRegistry> {
        &self.registry
    }

    fn set_state(&self, state: RuntimeState) {
        let changed = match self.state.lock() {
            Ok(mut current) if *current != state => {
                *current = state;
                true
            }
            _ => false,
        };
        if changed {
            self.announce(state);
        }
    }

    fn announce(&self, state: RuntimeState) {
        self.feed.emit(RuntimeEvent::RuntimeState { state });
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if self.state() != RuntimeState::Stopped {
            let grace = self.settings.shutdown_grace();
            self.shutdown(grace);
        }
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("state", &self.state())
            .field("bindings", &self.bindings.len())
            .field("router", &self.router)
            .finish()
    }
}
