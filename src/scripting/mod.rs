//! Rhai scripting sandbox for edge transforms and filters
//!
//! Every pipeline edge may carry a transform script and a filter expression.
//! Both run inside a shared [`ScriptEngine`] with no I/O available, under a
//! per-invocation [`ExecutionBudget`] enforced by the host.
//!
//! ## Script Contract
//!
//! A transform sees `msg`, a map with `payload`, `metadata`, `source` and
//! `timestamp`. If the script defines `fn transform(msg)` that function is
//! called; otherwise the whole script body is evaluated with `msg` in scope.
//! It must return a message-shaped map (`payload` required, `metadata`
//! optional) or `drop()` to discard the message.
//!
//! A filter is a single expression that must evaluate to a boolean. Every
//! top-level payload key is available as a variable, as is `msg`.
//!
//! ## Host Functions
//!
//! - `drop()` - Discard the current message
//! - `get(map, "a:b")` / `set(map, "a:b", value)` / `has(map, "a:b")` - Colon paths
//! - `scale(value, in_min, in_max, out_min, out_max)` - Linear rescale
//! - `clamp(value, min, max)` - Clamp to a range
//! - `deadband(value, center, width)` - Snap small deviations to center
//!
//! ## Example Scripts
//!
//! Scaling a temperature reading:
//! ```rhai
//! msg.payload.temp *= 10;
//! msg
//! ```
//!
//! Dropping idle samples:
//! ```rhai
//! fn transform(msg) {
//!     if msg.payload.state == "idle" { return drop(); }
//!     msg.metadata.checked = true;
//!     msg
//! }
//! ```

mod convert;
mod engine;

pub use convert::{dynamic_to_json, json_to_dynamic, message_to_dynamic, WideInt};
pub use engine::{DropMarker, ScriptEngine};

use crate::config::SandboxSettings;
use crate::message::Message;
use rhai::AST;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// Name of the optional entry point in transform scripts
pub const TRANSFORM_FN: &str = "transform";

/// A compiled transform script that can be executed efficiently
#[derive(Clone)]
pub struct CompiledScript {
    /// The compiled AST
    ast: AST,
    /// The original source code
    source: String,
    /// Name/identifier for this script
    name: String,
    /// Whether the script defines `fn transform(msg)`
    has_entry_fn: bool,
}

impl CompiledScript {
    /// Get the source code of this script
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Get the name of this script
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_entry_fn(&self) -> bool {
        self.has_entry_fn
    }

    pub(crate) fn ast(&self) -> &AST {
        &self.ast
    }
}

impl std::fmt::Debug for CompiledScript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledScript")
            .field("name", &self.name)
            .field("has_entry_fn", &self.has_entry_fn)
            .finish()
    }
}

/// A compiled filter expression
#[derive(Clone)]
pub struct CompiledFilter {
    ast: AST,
    source: String,
}

impl CompiledFilter {
    pub fn source(&self) -> &str {
        &self.source
    }

    pub(crate) fn ast(&self) -> &AST {
        &self.ast
    }
}

impl std::fmt::Debug for CompiledFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("CompiledFilter").field(&self.source).finish()
    }
}

/// Cache for compiled scripts to avoid recompilation
///
/// Keyed by source text, so edges sharing a script share one compiled AST.
#[derive(Default)]
pub struct ScriptCache {
    /// Map from script source to compiled script
    scripts: HashMap<String, Arc<CompiledScript>>,
    /// Map from expression source to compiled filter
    filters: HashMap<String, Arc<CompiledFilter>>,
}

impl ScriptCache {
    /// Create a new empty cache
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, source: &str) -> Option<Arc<CompiledScript>> {
        self.scripts.get(source).cloned()
    }

    pub fn filter(&self, source: &str) -> Option<Arc<CompiledFilter>> {
        self.filters.get(source).cloned()
    }

    pub fn insert_script(&mut self, script: Arc<CompiledScript>) {
        self.scripts.insert(script.source.clone(), script);
    }

    pub fn insert_filter(&mut self, filter: Arc<CompiledFilter>) {
        self.filters.insert(filter.source.clone(), filter);
    }

    /// Number of cached scripts and filters
    pub fn len(&self) -> usize {
        self.scripts.len() + self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear the cache
    pub fn clear(&mut self) {
        self.scripts.clear();
        self.filters.clear();
    }
}

/// Thread-safe script cache wrapper
pub type SharedScriptCache = Arc<RwLock<ScriptCache>>;

/// Per-invocation limits enforced by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionBudget {
    /// Wall-clock limit for one invocation
    pub time_limit: Duration,
    /// Operation limit for one invocation
    pub max_operations: u64,
}

impl ExecutionBudget {
    pub fn new(time_limit: Duration, max_operations: u64) -> Self {
        Self {
            time_limit,
            max_operations,
        }
    }
}

impl Default for ExecutionBudget {
    fn default() -> Self {
        Self::from(&SandboxSettings::default())
    }
}

impl From<&SandboxSettings> for ExecutionBudget {
    fn from(settings: &SandboxSettings) -> Self {
        Self {
            time_limit: Duration::from_millis(settings.budget_ms),
            max_operations: settings.max_operations,
        }
    }
}

/// Runtime-wide cancellation flag observed by every running script
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Result of a successful transform invocation
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The script produced a (possibly new) message
    Emit(Message),
    /// The script returned the drop marker
    Dropped,
}

/// A transform bound to an edge: compiled script, budget and last error
pub struct ScriptInstance {
    script: Arc<CompiledScript>,
    budget: ExecutionBudget,
    last_error: Mutex<Option<String>>,
}

impl ScriptInstance {
    pub fn new(script: Arc<CompiledScript>, budget: ExecutionBudget) -> Self {
        Self {
            script,
            budget,
            last_error: Mutex::new(None),
        }
    }

    pub fn script(&self) -> &Arc<CompiledScript> {
        &self.script
    }

    pub fn budget(&self) -> &ExecutionBudget {
        &self.budget
    }

    /// The most recent runtime error message, if any
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|e| e.clone())
    }

    pub(crate) fn record_error(&self, error: &str) {
        if let Ok(mut slot) = self.last_error.lock() {
            *slot = Some(error.to_string());
        }
    }
}

impl std::fmt::Debug for ScriptInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptInstance")
            .field("script", &self.script.name)
            .field("budget", &self.budget)
            .finish()
    }
}

/// Built-in scripts for common use cases
pub mod builtins {
    /// Identity transform - returns the message unchanged
    pub const IDENTITY: &str = r#"
fn transform(msg) {
    msg
}
"#;

    /// Drop every message
    pub const DROP_ALL: &str = "drop()";
}
