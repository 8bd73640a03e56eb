//! Message routing
//!
//! The [`Router`] holds the current [`RouterGraph`] snapshot and dispatches
//! each inbound message along the Active edges leaving its source:
//!
//! ```text
//! message ──▶ filter ──▶ transform ──▶ enqueue on every destination
//!               │            │
//!               ▼            ▼
//!            filtered     dropped / SandboxError (edge fault)
//! ```
//!
//! Destinations are resolved by id through the [`BindingRegistry`] at the
//! moment of delivery, and each is attempted independently.
//!
//! ## Reconfiguration
//!
//! [`Router::reconfigure`] builds a new graph and swaps it in under a
//! single-writer lock. Edges with an unchanged definition are carried over
//! as-is (same id, state and fault history). Removed or changed edges go
//! Draining, wait for their in-flight messages up to the grace period, then
//! become Disabled.

pub mod edge;
pub mod graph;
pub mod pool;

pub use edge::{Edge, EdgeId, EdgeSpec, EdgeState, FaultWindow, InFlight, ScriptSource};
pub use graph::RouterGraph;
pub use pool::RoutePool;

use crate::binding::BindingRegistry;
use crate::config::{ConfigEntry, ConfigIssue, EdgeFaultSettings};
use crate::error::{RadapterError, Result};
use crate::events::{EventFeed, RuntimeEvent, ScriptStage};
use crate::message::Message;
use crate::scripting::{CancelToken, Outcome, ScriptEngine};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// What happened to one routed message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouteReport {
    /// Active edges the message entered
    pub matched: usize,
    /// Edges from the source that were not Active
    pub skipped: usize,
    /// Edges whose filter rejected the message
    pub filtered: usize,
    /// Edges whose transform returned the drop marker
    pub dropped: usize,
    /// Edges whose filter or transform failed
    pub faulted: usize,
    /// Successful enqueues across all destinations
    pub delivered: usize,
    /// Destinations that could not be reached
    pub undeliverable: usize,
    /// Older queued messages evicted to make room
    pub evicted: usize,
}

/// Result of a reconfiguration
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconfigureReport {
    /// Edges carried over unchanged
    pub kept: usize,
    /// Edges newly built
    pub added: usize,
    /// Edges taken out of the graph
    pub removed: usize,
    /// Removed edges that were still busy when the grace period ran out
    pub undrained: usize,
    /// Edges that could not be built
    pub rejected: Vec<ConfigIssue>,
}

/// Routes messages through the current edge graph
pub struct Router {
    graph: RwLock<Arc<RouterGraph>>,
    reconfigure_lock: Mutex<()>,
    engine: Arc<ScriptEngine>,
    bindings: Arc<BindingRegistry>,
    feed: EventFeed,
    cancel: CancelToken,
    fault_settings: EdgeFaultSettings,
    next_id: AtomicU32,
}

impl Router {
    pub fn new(
        engine: Arc<ScriptEngine>,
        bindings: Arc<BindingRegistry>,
        feed: EventFeed,
        fault_settings: EdgeFaultSettings,
    ) -> Self {
        Self {
            graph: RwLock::new(Arc::new(RouterGraph::empty())),
            reconfigure_lock: Mutex::new(()),
            engine,
            bindings,
            feed,
            cancel: CancelToken::new(),
            fault_settings,
            next_id: AtomicU32::new(0),
        }
    }

    /// The graph routing currently uses
    pub fn snapshot(&self) -> Arc<RouterGraph> {
        self.graph
            .read()
            .map(|g| g.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Token that aborts running scripts
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn engine(&self) -> &Arc<ScriptEngine> {
        &self.engine
    }

    pub fn bindings(&self) -> &Arc<BindingRegistry> {
        &self.bindings
    }

    // ==================== Routing ====================

    /// Dispatch a message along every Active edge from its source
    ///
    /// The whole call works on one graph snapshot.
    pub fn route(&self, message: &Arc<Message>) -> RouteReport {
        let graph = self.snapshot();
        let mut report = RouteReport::default();
        for edge in graph.edges_from(message.source()) {
            let Some(_entered) = edge.try_enter() else {
                report.skipped += 1;
                continue;
            };
            report.matched += 1;
            self.route_edge(edge, message, &mut report);
        }
        if report.matched == 0 {
            tracing::trace!("No active edge from {}", message.source());
        }
        report
    }

    fn route_edge(&self, edge: &Edge, message: &Arc<Message>, report: &mut RouteReport) {
        if let Some(filter) = edge.filter() {
            match self.engine.evaluate_filter(filter, message, &self.cancel) {
                Ok(true) => {}
                Ok(false) => {
                    report.filtered += 1;
                    return;
                }
                Err(e) => {
                    report.faulted += 1;
                    self.script_failed(edge, ScriptStage::Filter, e);
                    return;
                }
            }
        }

        let output = match edge.transform() {
            None => message.clone(),
            Some(instance) => match self.engine.invoke(instance, message, &self.cancel) {
                Ok(Outcome::Emit(transformed)) => Arc::new(transformed),
                Ok(Outcome::Dropped) => {
                    report.dropped += 1;
                    return;
                }
                Err(e) => {
                    report.faulted += 1;
                    self.script_failed(edge, ScriptStage::Transform, e);
                    return;
                }
            },
        };

        for to in edge.to() {
            match self.bindings.enqueue(to, output.clone()) {
                Ok(evicted) => {
                    report.delivered += 1;
                    report.evicted += evicted;
                }
                Err(e) => {
                    report.undeliverable += 1;
                    self.feed.emit(RuntimeEvent::SendFailed {
                        binding: to.clone(),
                        edge: Some(edge.name().to_string()),
                        error: e.to_string(),
                    });
                }
            }
        }
    }

    fn script_failed(&self, edge: &Edge, stage: ScriptStage, error: RadapterError) {
        let fault = error
            .script_fault()
            .unwrap_or(crate::error::ScriptFault::Failed);
        self.feed.emit(RuntimeEvent::SandboxError {
            edge: edge.name().to_string(),
            stage,
            fault,
            error: error.to_string(),
        });

        // Cancellation is the runtime stopping, not the edge misbehaving
        if fault == crate::error::ScriptFault::Cancelled {
            return;
        }
        if edge.record_fault() && edge.transition(EdgeState::Active, EdgeState::Disabled) {
            self.feed.emit(RuntimeEvent::EdgeDisabled {
                edge: edge.name().to_string(),
                faults: edge.fault_count(),
            });
        }
    }

    // ==================== Reconfiguration ====================

    /// Replace the edge set
    ///
    /// Edges that fail to build are reported with `ConfigRejected` and left
    /// out; the rest of the graph activates.
    pub fn reconfigure(&self, specs: Vec<EdgeSpec>, grace: Duration) -> ReconfigureReport {
        let _writer = self
            .reconfigure_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let current = self.snapshot();
        let mut report = ReconfigureReport::default();
        let mut edges = Vec::with_capacity(specs.len());
        let mut kept = HashSet::new();

        for spec in specs {
            let reusable = current
                .edge_by_name(&spec.name)
                .filter(|e| e.spec() == &spec && e.state() != EdgeState::Draining);
            if let Some(existing) = reusable {
                kept.insert(existing.id());
                edges.push(existing.clone());
                report.kept += 1;
                continue;
            }
            match self.build_edge(spec) {
                Ok(edge) => {
                    tracing::info!("Edge '{}' added ({})", edge.name(), edge.id());
                    edges.push(Arc::new(edge));
                    report.added += 1;
                }
                Err(issue) => {
                    self.feed.emit(RuntimeEvent::ConfigRejected {
                        issue: issue.clone(),
                    });
                    report.rejected.push(issue);
                }
            }
        }

        let retired: Vec<Arc<Edge>> = current
            .edges()
            .iter()
            .filter(|e| !kept.contains(&e.id()))
            .cloned()
            .collect();

        self.swap(RouterGraph::new(edges));

        for edge in &retired {
            if edge.transition(EdgeState::Active, EdgeState::Draining) {
                self.emit_state(edge);
            }
        }
        for edge in &retired {
            if !edge.wait_drained(grace) {
                tracing::warn!(
                    "Edge '{}' still has {} message(s) in flight after {:?}",
                    edge.name(),
                    edge.in_flight(),
                    grace
                );
                report.undrained += 1;
            }
            if edge.set_state(EdgeState::Disabled) != EdgeState::Disabled {
                self.emit_state(edge);
            }
        }
        report.removed = retired.len();

        tracing::info!(
            "Router reconfigured: {} kept, {} added, {} removed, {} rejected",
            report.kept,
            report.added,
            report.removed,
            report.rejected.len()
        );
        report
    }

    fn build_edge(&self, spec: EdgeSpec) -> std::result::Result<Edge, ConfigIssue> {
        let issue = |error: RadapterError| ConfigIssue {
            entry: ConfigEntry::Edge(spec.name.clone()),
            reason: error.to_string(),
        };
        let transform = match &spec.transform {
            Some(script) => {
                let compiled = self
                    .engine
                    .compile(&script.name, &script.source)
                    .map_err(issue)?;
                Some(self.engine.instantiate(compiled))
            }
            None => None,
        };
        let filter = match &spec.filter {
            Some(source) => Some(self.engine.compile_filter(source).map_err(issue)?),
            None => None,
        };
        let id = EdgeId(self.next_id.fetch_add(1, Ordering::Relaxed));
        Ok(Edge::new(id, spec, transform, filter, &self.fault_settings))
    }

    fn swap(&self, graph: RouterGraph) {
        let graph = Arc::new(graph);
        match self.graph.write() {
            Ok(mut slot) => *slot = graph,
            Err(poisoned) => *poisoned.into_inner() = graph,
        }
    }

    fn emit_state(&self, edge: &Edge) {
        self.feed.emit(RuntimeEvent::EdgeState {
            edge: edge.name().to_string(),
            state: edge.state(),
        });
    }

    // ==================== Edge control ====================

    fn find(&self, name: &str) -> Result<Arc<Edge>> {
        self.snapshot()
            .edge_by_name(name)
            .cloned()
            .ok_or_else(|| RadapterError::Config(format!("unknown edge '{}'", name)))
    }

    /// Re-enable a Disabled edge, clearing its fault history
    pub fn enable_edge(&self, name: &str) -> Result<()> {
        let edge = self.find(name)?;
        match edge.state() {
            EdgeState::Active => Ok(()),
            EdgeState::Draining => Err(RadapterError::Config(format!(
                "edge '{}' is draining",
                name
            ))),
            EdgeState::Disabled => {
                edge.clear_faults();
                if edge.transition(EdgeState::Disabled, EdgeState::Active) {
                    self.emit_state(&edge);
                }
                Ok(())
            }
        }
    }

    /// Stop routing through an edge, letting in-flight messages finish
    ///
    /// Returns false if messages were still in flight after `grace`.
    pub fn disable_edge(&self, name: &str, grace: Duration) -> Result<bool> {
        let edge = self.find(name)?;
        if !edge.transition(EdgeState::Active, EdgeState::Draining) {
            return Ok(true);
        }
        self.emit_state(&edge);
        let drained = edge.wait_drained(grace);
        edge.set_state(EdgeState::Disabled);
        self.emit_state(&edge);
        Ok(drained)
    }

    pub fn edge_state(&self, name: &str) -> Option<EdgeState> {
        self.snapshot().edge_by_name(name).map(|e| e.state())
    }

    /// Name and state of every edge, in declaration order
    pub fn edge_states(&self) -> Vec<(String, EdgeState)> {
        self.snapshot()
            .edges()
            .iter()
            .map(|e| (e.name().to_string(), e.state()))
            .collect()
    }

    /// Messages currently inside any edge of the current graph
    pub fn in_flight(&self) -> usize {
        self.snapshot().edges().iter().map(|e| e.in_flight()).sum()
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("edges", &self.snapshot().len())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
