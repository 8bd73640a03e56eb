//! Pipeline edges and their state machine
//!
//! ```text
//!            reconfigure (removed/changed)
//!   Active ─────────────────────────────▶ Draining ──(in-flight done)──▶ Disabled
//!     ▲  │                                                                  │
//!     │  └──────────── too many faults / disable_edge ─────────────────────▶│
//!     └──────────────────────────── enable_edge ────────────────────────────┘
//! ```
//!
//! A message enters an edge only while it is Active. Entry increments the
//! in-flight counter before checking the state, so once an edge has been
//! switched to Draining no new message can slip in unseen.

use crate::config::EdgeFaultSettings;
use crate::message::BindingId;
use crate::scripting::{CompiledFilter, ScriptInstance};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Identity of an edge within a runtime; stable across reconfigurations
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize)]
pub struct EdgeId(pub u32);

impl EdgeId {
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EdgeId({})", self.0)
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Routing state of an edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum EdgeState {
    Active = 0,
    Disabled = 1,
    Draining = 2,
}

impl EdgeState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => EdgeState::Active,
            2 => EdgeState::Draining,
            _ => EdgeState::Disabled,
        }
    }
}

impl fmt::Display for EdgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            EdgeState::Active => "active",
            EdgeState::Disabled => "disabled",
            EdgeState::Draining => "draining",
        };
        f.write_str(text)
    }
}

/// Transform script source attached to an edge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptSource {
    /// File path or generated name, for diagnostics
    pub name: String,
    pub source: String,
}

/// Validated definition of an edge
///
/// Two definitions are equal when a reconfiguration may keep the running edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeSpec {
    pub name: String,
    pub from: BindingId,
    pub to: Vec<BindingId>,
    pub transform: Option<ScriptSource>,
    pub filter: Option<String>,
}

/// Sliding window of recent faults
#[derive(Debug)]
pub struct FaultWindow {
    faults: VecDeque<Instant>,
    max_faults: usize,
    window: Duration,
}

impl FaultWindow {
    pub fn new(settings: &EdgeFaultSettings) -> Self {
        Self {
            faults: VecDeque::new(),
            max_faults: settings.max_faults,
            window: settings.window(),
        }
    }

    /// Record a fault; returns true once the threshold is exceeded
    pub fn record(&mut self, now: Instant) -> bool {
        self.faults.push_back(now);
        while let Some(&oldest) = self.faults.front() {
            if now.duration_since(oldest) > self.window {
                self.faults.pop_front();
            } else {
                break;
            }
        }
        self.faults.len() > self.max_faults
    }

    pub fn len(&self) -> usize {
        self.faults.len()
    }

    pub fn is_empty(&self) -> bool {
        self.faults.is_empty()
    }

    pub fn clear(&mut self) {
        self.faults.clear();
    }
}

/// A live edge
pub struct Edge {
    id: EdgeId,
    spec: EdgeSpec,
    transform: Option<ScriptInstance>,
    filter: Option<Arc<CompiledFilter>>,
    state: AtomicU8,
    in_flight: AtomicUsize,
    faults: Mutex<FaultWindow>,
}

impl Edge {
    pub fn new(
        id: EdgeId,
        spec: EdgeSpec,
        transform: Option<ScriptInstance>,
        filter: Option<Arc<CompiledFilter>>,
        fault_settings: &EdgeFaultSettings,
    ) -> Self {
        Self {
            id,
            spec,
            transform,
            filter,
            state: AtomicU8::new(EdgeState::Active as u8),
            in_flight: AtomicUsize::new(0),
            faults: Mutex::new(FaultWindow::new(fault_settings)),
        }
    }

    pub fn id(&self) -> EdgeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &EdgeSpec {
        &self.spec
    }

    pub fn from(&self) -> &BindingId {
        &self.spec.from
    }

    pub fn to(&self) -> &[BindingId] {
        &self.spec.to
    }

    pub fn transform(&self) -> Option<&ScriptInstance> {
        self.transform.as_ref()
    }

    pub fn filter(&self) -> Option<&CompiledFilter> {
        self.filter.as_deref()
    }

    pub fn state(&self) -> EdgeState {
        EdgeState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Set the state, returning the previous one
    pub fn set_state(&self, state: EdgeState) -> EdgeState {
        EdgeState::from_u8(self.state.swap(state as u8, Ordering::SeqCst))
    }

    /// Move from `current` to `next` only if still in `current`
    pub fn transition(&self, current: EdgeState, next: EdgeState) -> bool {
        self.state
            .compare_exchange(current as u8, next as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Number of messages currently being processed by this edge
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Admit a message if the edge is Active
    pub fn try_enter(&self) -> Option<InFlight<'_>> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        if self.state() == EdgeState::Active {
            Some(InFlight { edge: self })
        } else {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            None
        }
    }

    /// Wait until no message is in flight, up to `grace`
    pub fn wait_drained(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        while self.in_flight() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }

    /// Record a script fault; true if the edge should now be disabled
    pub fn record_fault(&self) -> bool {
        self.faults
            .lock()
            .map(|mut w| w.record(Instant::now()))
            .unwrap_or(false)
    }

    pub fn fault_count(&self) -> usize {
        self.faults.lock().map(|w| w.len()).unwrap_or(0)
    }

    pub fn clear_faults(&self) {
        if let Ok(mut w) = self.faults.lock() {
            w.clear();
        }
    }
}

impl fmt::Debug for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Edge")
            .field("id", &self.id)
            .field("name", &self.spec.name)
            .field("state", &self.state())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Guard for one message inside an edge
pub struct InFlight<'a> {
    edge: &'a Edge,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.edge.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
