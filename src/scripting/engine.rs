//! Rhai Script Engine Implementation
//!
//! This module provides the sandboxed engine that runs edge transforms and
//! filter expressions.
//!
//! ## Budgets
//!
//! Memory limits (string, array and map sizes, call and expression depth) are
//! fixed engine-wide from [`SandboxSettings`]. Time and operation limits are
//! per invocation: before running a script the calling thread installs its
//! [`ExecutionBudget`] and the runtime's [`CancelToken`], and the engine's
//! progress hook terminates the script once either is exhausted.

use super::convert::{
    json_to_dynamic, map_to_metadata, map_to_payload, message_to_dynamic, WideInt,
};
use super::{
    CancelToken, CompiledFilter, CompiledScript, ExecutionBudget, Outcome, ScriptCache,
    ScriptInstance, SharedScriptCache, TRANSFORM_FN,
};
use crate::config::SandboxSettings;
use crate::error::{RadapterError, Result, ScriptFault};
use crate::message::Message;
use rhai::{CallFnOptions, Dynamic, Engine, EvalAltResult, Map, Scope, INT};
use std::cell::RefCell;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// Termination token used when the runtime cancels scripts
const CANCELLED_TOKEN: &str = "cancelled";

/// Operations between wall-clock checks
const DEADLINE_CHECK_INTERVAL: u64 = 64;

/// Marker returned by `drop()` to discard the current message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DropMarker;

struct ActiveBudget {
    deadline: Instant,
    max_operations: u64,
    cancel: CancelToken,
}

thread_local! {
    static ACTIVE_BUDGET: RefCell<Option<ActiveBudget>> = const { RefCell::new(None) };
}

/// Installs a budget for the current thread until dropped
struct BudgetGuard;

impl BudgetGuard {
    fn enter(budget: &ExecutionBudget, cancel: &CancelToken) -> Self {
        ACTIVE_BUDGET.with(|slot| {
            *slot.borrow_mut() = Some(ActiveBudget {
                deadline: Instant::now() + budget.time_limit,
                max_operations: budget.max_operations,
                cancel: cancel.clone(),
            });
        });
        BudgetGuard
    }
}

impl Drop for BudgetGuard {
    fn drop(&mut self) {
        ACTIVE_BUDGET.with(|slot| *slot.borrow_mut() = None);
    }
}

fn check_budget(operations: u64) -> Option<Dynamic> {
    ACTIVE_BUDGET.with(|slot| {
        let slot = slot.borrow();
        let active = slot.as_ref()?;
        if active.cancel.is_cancelled() {
            return Some(Dynamic::from(CANCELLED_TOKEN.to_string()));
        }
        if operations > active.max_operations {
            return Some(Dynamic::from(format!(
                "operation limit of {} reached",
                active.max_operations
            )));
        }
        if operations % DEADLINE_CHECK_INTERVAL == 0 && Instant::now() >= active.deadline {
            return Some(Dynamic::from("time limit reached".to_string()));
        }
        None
    })
}

fn innermost(err: &EvalAltResult) -> &EvalAltResult {
    match err {
        EvalAltResult::ErrorInFunctionCall(_, _, inner, _) => innermost(inner),
        EvalAltResult::ErrorInModule(_, inner, _) => innermost(inner),
        other => other,
    }
}

/// Map a Rhai evaluation error onto a sandbox runtime error
fn runtime_error(err: Box<EvalAltResult>) -> RadapterError {
    let kind = match innermost(&err) {
        EvalAltResult::ErrorTerminated(token, _) if token.to_string() == CANCELLED_TOKEN => {
            ScriptFault::Cancelled
        }
        EvalAltResult::ErrorTerminated(..)
        | EvalAltResult::ErrorTooManyOperations(_)
        | EvalAltResult::ErrorDataTooLarge(..)
        | EvalAltResult::ErrorStackOverflow(_) => ScriptFault::BudgetExceeded,
        _ => ScriptFault::Failed,
    };
    RadapterError::script(kind, err.to_string())
}

fn malformed(message: impl Into<String>) -> RadapterError {
    RadapterError::script(ScriptFault::Malformed, message)
}

fn is_identifier(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

// ===== Colon path helpers exposed to scripts =====

fn path_get(map: &Map, path: &str) -> Dynamic {
    let mut parts = path.split(':').filter(|s| !s.is_empty());
    let Some(first) = parts.next() else {
        return Dynamic::UNIT;
    };
    let mut current = match map.get(first) {
        Some(value) => value.clone(),
        None => return Dynamic::UNIT,
    };
    for part in parts {
        current = if current.is_map() {
            current
                .try_cast::<Map>()
                .and_then(|m| m.get(part).cloned())
                .unwrap_or(Dynamic::UNIT)
        } else if current.is_array() {
            let index = part.parse::<usize>().ok();
            current
                .into_array()
                .ok()
                .and_then(|items| index.and_then(|i| items.get(i).cloned()))
                .unwrap_or(Dynamic::UNIT)
        } else {
            return Dynamic::UNIT;
        };
    }
    current
}

fn scale(x: f64, in_min: f64, in_max: f64, out_min: f64, out_max: f64) -> f64 {
    if in_max == in_min {
        out_min
    } else {
        (x - in_min) * (out_max - out_min) / (in_max - in_min) + out_min
    }
}

fn path_set(map: &mut Map, parts: &[&str], value: Dynamic) {
    match parts {
        [] => {}
        [last] => {
            map.insert((*last).into(), value);
        }
        [head, rest @ ..] => {
            let mut child = map
                .remove(*head)
                .and_then(|d| d.try_cast::<Map>())
                .unwrap_or_default();
            path_set(&mut child, rest, value);
            map.insert((*head).into(), Dynamic::from_map(child));
        }
    }
}

/// The sandboxed script engine shared by every edge
pub struct ScriptEngine {
    /// The Rhai engine instance
    engine: Engine,
    /// Cache of compiled scripts
    cache: SharedScriptCache,
    /// Budget applied to scripts compiled through this engine
    budget: ExecutionBudget,
}

impl ScriptEngine {
    /// Create a new script engine with the given sandbox limits
    pub fn new(settings: &SandboxSettings) -> Self {
        Self::with_cache(settings, Arc::new(RwLock::new(ScriptCache::new())))
    }

    /// Create a new script engine with a shared cache
    pub fn with_cache(settings: &SandboxSettings, cache: SharedScriptCache) -> Self {
        let mut engine = Engine::new();
        Self::configure_engine(&mut engine, settings);

        Self {
            engine,
            cache,
            budget: ExecutionBudget::from(settings),
        }
    }

    /// Configure the Rhai engine with host functions and safety limits
    fn configure_engine(engine: &mut Engine, settings: &SandboxSettings) {
        // Set safety limits
        engine.set_max_expr_depths(settings.max_expr_depth, settings.max_expr_depth);
        engine.set_max_call_levels(settings.max_call_levels);
        engine.set_max_string_size(settings.max_string_size);
        engine.set_max_array_size(settings.max_array_size);
        engine.set_max_map_size(settings.max_map_size);

        // No dynamic code
        engine.disable_symbol("eval");

        // Per-invocation time/operation budget and cancellation
        engine.on_progress(check_budget);

        engine.register_type_with_name::<DropMarker>("Drop");
        engine.register_fn("drop", || DropMarker);

        // ===== Path Functions =====

        // Registered under the same names as the single-key map builtins so
        // that colon paths take precedence
        engine.register_fn("get", |map: &mut Map, path: &str| path_get(map, path));
        engine.register_fn("has", |map: &mut Map, path: &str| {
            !path_get(map, path).is_unit()
        });
        engine.register_fn("set", |map: &mut Map, path: &str, value: Dynamic| {
            let parts: Vec<&str> = path.split(':').filter(|s| !s.is_empty()).collect();
            path_set(map, &parts, value);
        });

        // ===== Transformer Functions =====

        // Map value from one range to another
        engine.register_fn(
            "scale",
            |x: f64, in_min: f64, in_max: f64, out_min: f64, out_max: f64| {
                scale(x, in_min, in_max, out_min, out_max)
            },
        );
        engine.register_fn(
            "scale",
            |x: INT, in_min: INT, in_max: INT, out_min: INT, out_max: INT| {
                scale(
                    x as f64,
                    in_min as f64,
                    in_max as f64,
                    out_min as f64,
                    out_max as f64,
                )
            },
        );

        // Clamping and limiting
        engine.register_fn("clamp", |x: f64, min: f64, max: f64| x.max(min).min(max));
        engine.register_fn("clamp", |x: INT, min: INT, max: INT| x.max(min).min(max));

        // Deadband: ignore small changes around a center value
        // Usage: deadband(value, center, width) - returns center if within deadband
        engine.register_fn("deadband", |value: f64, center: f64, width: f64| -> f64 {
            if (value - center).abs() < width / 2.0 {
                center
            } else {
                value
            }
        });
        engine.register_fn("deadband", |value: INT, center: INT, width: INT| -> INT {
            if (value - center).saturating_abs().saturating_mul(2) < width {
                center
            } else {
                value
            }
        });

        // Integers wider than INT pass through scripts untouched
        engine.register_type_with_name::<WideInt>("WideInt");
        engine.register_fn("to_string", |n: &mut WideInt| n.to_string());
        engine.register_fn("to_float", |n: &mut WideInt| n.to_float());

        // Type conversions
        engine.register_fn("to_float", |x: INT| x as f64);
        engine.register_fn("is_finite", |x: f64| x.is_finite());
    }

    /// Compile a transform script and cache it
    pub fn compile(&self, name: &str, source: &str) -> Result<Arc<CompiledScript>> {
        if let Some(script) = self.read_cache()?.script(source) {
            return Ok(script);
        }

        let ast = self
            .engine
            .compile(source)
            .map_err(|e| RadapterError::Compile(format!("{}: {}", name, e)))?;
        let has_entry_fn = ast
            .iter_functions()
            .any(|f| f.name == TRANSFORM_FN && f.params.len() == 1);

        let script = Arc::new(CompiledScript {
            ast,
            source: source.to_string(),
            name: name.to_string(),
            has_entry_fn,
        });
        self.write_cache()?.insert_script(script.clone());
        tracing::debug!("Compiled script '{}'", name);
        Ok(script)
    }

    /// Compile a filter expression and cache it
    pub fn compile_filter(&self, source: &str) -> Result<Arc<CompiledFilter>> {
        if let Some(filter) = self.read_cache()?.filter(source) {
            return Ok(filter);
        }

        let ast = self
            .engine
            .compile_expression(source)
            .map_err(|e| RadapterError::Compile(format!("filter '{}': {}", source, e)))?;

        let filter = Arc::new(CompiledFilter {
            ast,
            source: source.to_string(),
        });
        self.write_cache()?.insert_filter(filter.clone());
        Ok(filter)
    }

    /// Bind a compiled script to this engine's default budget
    pub fn instantiate(&self, script: Arc<CompiledScript>) -> ScriptInstance {
        ScriptInstance::new(script, self.budget)
    }

    /// Run a transform against a message
    ///
    /// Each call gets a fresh scope; nothing survives between invocations.
    /// Errors are also recorded as the instance's last error.
    pub fn invoke(
        &self,
        instance: &ScriptInstance,
        message: &Message,
        cancel: &CancelToken,
    ) -> Result<Outcome> {
        let result = self.run_transform(instance.script(), message, instance.budget(), cancel);
        if let Err(e) = &result {
            instance.record_error(&e.to_string());
        }
        result
    }

    fn run_transform(
        &self,
        script: &CompiledScript,
        message: &Message,
        budget: &ExecutionBudget,
        cancel: &CancelToken,
    ) -> Result<Outcome> {
        if cancel.is_cancelled() {
            return Err(RadapterError::script(
                ScriptFault::Cancelled,
                "runtime is shutting down",
            ));
        }

        let msg = message_to_dynamic(message);
        let mut scope = Scope::new();

        let value = {
            let _guard = BudgetGuard::enter(budget, cancel);
            if script.has_entry_fn() {
                // Top-level statements are not evaluated, only the entry point
                let options = CallFnOptions::new().eval_ast(false);
                self.engine.call_fn_with_options::<Dynamic>(
                    options,
                    &mut scope,
                    script.ast(),
                    TRANSFORM_FN,
                    (msg,),
                )
            } else {
                scope.push_dynamic("msg", msg);
                self.engine
                    .eval_ast_with_scope::<Dynamic>(&mut scope, script.ast())
            }
        }
        .map_err(runtime_error)?;

        Self::to_outcome(value, message)
    }

    fn to_outcome(value: Dynamic, input: &Message) -> Result<Outcome> {
        if value.is::<DropMarker>() {
            return Ok(Outcome::Dropped);
        }

        let type_name = value.type_name();
        let mut map = value.try_cast::<Map>().ok_or_else(|| {
            malformed(format!(
                "expected a message map or drop(), got '{}'",
                type_name
            ))
        })?;

        let payload = match map.remove("payload") {
            Some(p) if p.is_map() => {
                map_to_payload(p.try_cast::<Map>().unwrap_or_default()).map_err(malformed)?
            }
            Some(p) => {
                return Err(malformed(format!(
                    "payload must be a map, got '{}'",
                    p.type_name()
                )))
            }
            None => return Err(malformed("result has no payload")),
        };

        let metadata = match map.remove("metadata") {
            None => input.metadata().clone(),
            Some(m) if m.is_unit() => input.metadata().clone(),
            Some(m) if m.is_map() => {
                map_to_metadata(m.try_cast::<Map>().unwrap_or_default()).map_err(malformed)?
            }
            Some(m) => {
                return Err(malformed(format!(
                    "metadata must be a map, got '{}'",
                    m.type_name()
                )))
            }
        };

        Ok(Outcome::Emit(input.derive(payload, metadata)))
    }

    /// Evaluate a filter expression against a message
    pub fn evaluate_filter(
        &self,
        filter: &CompiledFilter,
        message: &Message,
        cancel: &CancelToken,
    ) -> Result<bool> {
        if cancel.is_cancelled() {
            return Err(RadapterError::script(
                ScriptFault::Cancelled,
                "runtime is shutting down",
            ));
        }

        let mut scope = Scope::new();
        for (key, value) in message.payload() {
            if is_identifier(key) {
                scope.push_dynamic(key.clone(), json_to_dynamic(value));
            }
        }
        scope.push_dynamic("msg", message_to_dynamic(message));

        let value = {
            let _guard = BudgetGuard::enter(&self.budget, cancel);
            self.engine
                .eval_ast_with_scope::<Dynamic>(&mut scope, filter.ast())
        }
        .map_err(runtime_error)?;

        value.as_bool().map_err(|type_name| {
            malformed(format!(
                "filter '{}' must evaluate to a bool, got '{}'",
                filter.source(),
                type_name
            ))
        })
    }

    /// Validate a transform script without caching it
    pub fn validate(&self, source: &str) -> Result<()> {
        self.engine
            .compile(source)
            .map(|_| ())
            .map_err(|e| RadapterError::Compile(e.to_string()))
    }

    /// Clear the compiled script cache
    pub fn clear_cache(&self) -> Result<()> {
        self.write_cache()?.clear();
        Ok(())
    }

    /// Default per-invocation budget
    pub fn budget(&self) -> &ExecutionBudget {
        &self.budget
    }

    pub fn cache(&self) -> &SharedScriptCache {
        &self.cache
    }

    fn read_cache(&self) -> Result<std::sync::RwLockReadGuard<'_, ScriptCache>> {
        self.cache
            .read()
            .map_err(|e| RadapterError::Compile(format!("Failed to acquire cache lock: {}", e)))
    }

    fn write_cache(&self) -> Result<std::sync::RwLockWriteGuard<'_, ScriptCache>> {
        self.cache
            .write()
            .map_err(|e| RadapterError::Compile(format!("Failed to acquire cache lock: {}", e)))
    }
}

impl Default for ScriptEngine {
    fn default() -> Self {
        Self::new(&SandboxSettings::default())
    }
}

impl std::fmt::Debug for ScriptEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptEngine")
            .field("budget", &self.budget)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{into_payload, BindingId, Scalar};
    use serde_json::json;
    use std::time::Duration;

    fn message(value: serde_json::Value) -> Message {
        Message::new(BindingId::new("plc"), into_payload(value)).with_meta("unit", "C")
    }

    fn run(engine: &ScriptEngine, source: &str, msg: &Message) -> Result<Outcome> {
        let script = engine.compile("test", source)?;
        let instance = engine.instantiate(script);
        engine.invoke(&instance, msg, &CancelToken::new())
    }

    fn emitted(outcome: Outcome) -> Message {
        match outcome {
            Outcome::Emit(msg) => msg,
            Outcome::Dropped => panic!("expected a message, got drop"),
        }
    }

    #[test]
    fn test_engine_creation() {
        let engine = ScriptEngine::default();
        assert_eq!(engine.budget().time_limit, Duration::from_millis(50));
    }

    #[test]
    fn test_body_transform() {
        let engine = ScriptEngine::default();
        let msg = message(json!({"temp": 21.5}));
        let out = emitted(run(&engine, "msg.payload.temp *= 10; msg", &msg).unwrap());
        assert_eq!(out.payload()["temp"], json!(215.0));
        assert_eq!(out.timestamp(), msg.timestamp());
        assert_eq!(out.source(), msg.source());
    }

    #[test]
    fn test_function_transform() {
        let engine = ScriptEngine::default();
        let script = r#"
            let ignored = undefined_at_top_level;
            fn transform(msg) {
                msg.payload.doubled = msg.payload.x * 2;
                msg
            }
        "#;
        let out = emitted(run(&engine, script, &message(json!({"x": 4}))).unwrap());
        assert_eq!(out.payload()["doubled"], json!(8));
    }

    #[test]
    fn test_drop_marker() {
        let engine = ScriptEngine::default();
        let outcome = run(&engine, "drop()", &message(json!({}))).unwrap();
        assert_eq!(outcome, Outcome::Dropped);

        let script = r#"if msg.payload.state == "idle" { drop() } else { msg }"#;
        let outcome = run(&engine, script, &message(json!({"state": "idle"}))).unwrap();
        assert_eq!(outcome, Outcome::Dropped);
        let outcome = run(&engine, script, &message(json!({"state": "run"}))).unwrap();
        assert!(matches!(outcome, Outcome::Emit(_)));
    }

    #[test]
    fn test_metadata_kept_when_absent() {
        let engine = ScriptEngine::default();
        let msg = message(json!({"a": 1}));
        let out = emitted(run(&engine, "#{ payload: #{ b: 2 } }", &msg).unwrap());
        assert_eq!(out.payload()["b"], json!(2));
        assert_eq!(out.metadata()["unit"], Scalar::Text("C".into()));
    }

    #[test]
    fn test_metadata_replaced_when_given() {
        let engine = ScriptEngine::default();
        let out = emitted(
            run(
                &engine,
                "#{ payload: msg.payload, metadata: #{ seq: 3 } }",
                &message(json!({"a": 1})),
            )
            .unwrap(),
        );
        assert_eq!(out.metadata().len(), 1);
        assert_eq!(out.metadata()["seq"], Scalar::Int(3));
    }

    #[test]
    fn test_malformed_results() {
        let engine = ScriptEngine::default();
        let msg = message(json!({"a": 1}));
        for source in ["42", "#{ other: 1 }", "#{ payload: 5 }", "#{ payload: #{}, metadata: 1 }"] {
            let err = run(&engine, source, &msg).unwrap_err();
            assert_eq!(
                err.script_fault(),
                Some(ScriptFault::Malformed),
                "source {:?} gave {}",
                source,
                err
            );
        }
    }

    #[test]
    fn test_runtime_error_recorded() {
        let engine = ScriptEngine::default();
        let script = engine.compile("bad", "msg.payload.x.y.z + nothing").unwrap();
        let instance = engine.instantiate(script);
        let err = engine
            .invoke(&instance, &message(json!({})), &CancelToken::new())
            .unwrap_err();
        assert_eq!(err.script_fault(), Some(ScriptFault::Failed));
        assert!(instance.last_error().is_some());
    }

    #[test]
    fn test_compile_error() {
        let engine = ScriptEngine::default();
        let err = engine.compile("broken", "fn transform(msg) {").unwrap_err();
        assert!(matches!(err, RadapterError::Compile(_)));
        assert!(engine.validate("let x = ;").is_err());
        assert!(engine.validate("msg").is_ok());
    }

    #[test]
    fn test_eval_disabled() {
        let engine = ScriptEngine::default();
        assert!(engine.compile("eval", r#"eval("1 + 1")"#).is_err());
    }

    #[test]
    fn test_caching() {
        let engine = ScriptEngine::default();
        let a = engine.compile("a", builtins_identity()).unwrap();
        let b = engine.compile("b", builtins_identity()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.has_entry_fn());
        engine.clear_cache().unwrap();
        assert!(engine.cache().read().unwrap().is_empty());
    }

    fn builtins_identity() -> &'static str {
        crate::scripting::builtins::IDENTITY
    }

    #[test]
    fn test_time_budget_enforced() {
        let settings = SandboxSettings {
            budget_ms: 20,
            max_operations: u64::MAX,
            ..SandboxSettings::default()
        };
        let engine = ScriptEngine::new(&settings);
        let start = Instant::now();
        let err = run(&engine, "let x = 0; loop { x += 1; }", &message(json!({}))).unwrap_err();
        assert_eq!(err.script_fault(), Some(ScriptFault::BudgetExceeded));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_operation_budget_enforced() {
        let settings = SandboxSettings {
            budget_ms: 60_000,
            max_operations: 1_000,
            ..SandboxSettings::default()
        };
        let engine = ScriptEngine::new(&settings);
        let err = run(
            &engine,
            "let x = 0; while x < 1000000 { x += 1; } msg",
            &message(json!({})),
        )
        .unwrap_err();
        assert_eq!(err.script_fault(), Some(ScriptFault::BudgetExceeded));
    }

    #[test]
    fn test_budget_in_entry_fn() {
        let settings = SandboxSettings {
            budget_ms: 20,
            max_operations: u64::MAX,
            ..SandboxSettings::default()
        };
        let engine = ScriptEngine::new(&settings);
        let script = "fn transform(msg) { let x = 0; loop { x += 1; } }";
        let err = run(&engine, script, &message(json!({}))).unwrap_err();
        assert_eq!(err.script_fault(), Some(ScriptFault::BudgetExceeded));
    }

    #[test]
    fn test_cancellation() {
        let settings = SandboxSettings {
            budget_ms: 60_000,
            max_operations: u64::MAX,
            ..SandboxSettings::default()
        };
        let engine = ScriptEngine::new(&settings);
        let instance = engine.instantiate(
            engine
                .compile("spin", "let x = 0; loop { x += 1; }")
                .unwrap(),
        );
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            trigger.cancel();
        });
        let err = engine
            .invoke(&instance, &message(json!({})), &cancel)
            .unwrap_err();
        handle.join().unwrap();
        assert_eq!(err.script_fault(), Some(ScriptFault::Cancelled));

        // Already cancelled: refuses to start
        let err = engine
            .invoke(&instance, &message(json!({})), &cancel)
            .unwrap_err();
        assert_eq!(err.script_fault(), Some(ScriptFault::Cancelled));
    }

    #[test]
    fn test_scopes_are_isolated() {
        let engine = ScriptEngine::default();
        let script = r#"
            let count = if is_def_var("count") { count + 1 } else { 1 };
            msg.payload.count = count;
            msg
        "#;
        for _ in 0..3 {
            let out = emitted(run(&engine, script, &message(json!({}))).unwrap());
            assert_eq!(out.payload()["count"], json!(1));
        }
    }

    #[test]
    fn test_filter_uses_payload_keys() {
        let engine = ScriptEngine::default();
        let filter = engine.compile_filter("temp > 20").unwrap();
        let cancel = CancelToken::new();
        assert!(engine
            .evaluate_filter(&filter, &message(json!({"temp": 21.5})), &cancel)
            .unwrap());
        assert!(!engine
            .evaluate_filter(&filter, &message(json!({"temp": 10})), &cancel)
            .unwrap());
    }

    #[test]
    fn test_filter_sees_msg() {
        let engine = ScriptEngine::default();
        let filter = engine
            .compile_filter(r#"msg.source == "plc" && msg.metadata.unit == "C""#)
            .unwrap();
        assert!(engine
            .evaluate_filter(&filter, &message(json!({})), &CancelToken::new())
            .unwrap());
    }

    #[test]
    fn test_filter_must_be_bool() {
        let engine = ScriptEngine::default();
        let filter = engine.compile_filter("temp + 1").unwrap();
        let err = engine
            .evaluate_filter(&filter, &message(json!({"temp": 1})), &CancelToken::new())
            .unwrap_err();
        assert_eq!(err.script_fault(), Some(ScriptFault::Malformed));
    }

    #[test]
    fn test_filter_rejects_statements() {
        let engine = ScriptEngine::default();
        assert!(engine.compile_filter("let x = 1; x > 0").is_err());
    }

    #[test]
    fn test_path_functions() {
        let engine = ScriptEngine::default();
        let script = r#"
            msg.payload.set("motor:speed", get(msg.payload, "raw:rpm") * 2);
            msg.payload.present = has(msg.payload, "raw:rpm");
            msg.payload.missing = has(msg.payload, "raw:none");
            msg.payload.flat = get(msg.payload, "label");
            msg.payload.second = get(msg.payload, "list:1");
            msg
        "#;
        let out = emitted(run(&engine, script, &message(json!({"raw": {"rpm": 600}, "label": "m1", "list": [4, 5]})))
            .unwrap());
        assert_eq!(out.payload()["motor"]["speed"], json!(1200));
        assert_eq!(out.payload()["flat"], json!("m1"));
        assert_eq!(out.payload()["second"], json!(5));
        assert_eq!(out.payload()["present"], json!(true));
        assert_eq!(out.payload()["missing"], json!(false));
    }

    #[test]
    fn test_math_helpers() {
        let engine = ScriptEngine::default();
        let script = r#"
            msg.payload.scaled = scale(2048.0, 0.0, 4096.0, 0.0, 10.0);
            msg.payload.clamped = clamp(15.0, 0.0, 10.0);
            msg.payload.snapped = deadband(10.4, 10.0, 2.0);
            msg
        "#;
        let out = emitted(run(&engine, script, &message(json!({}))).unwrap());
        assert_eq!(out.payload()["scaled"], json!(5.0));
        assert_eq!(out.payload()["clamped"], json!(10.0));
        assert_eq!(out.payload()["snapped"], json!(10.0));
    }

    #[test]
    fn test_math_helpers_accept_integers() {
        let engine = ScriptEngine::default();
        let script = r#"
            msg.payload.scaled = scale(2048, 0, 4096, 0, 10);
            msg.payload.snapped = deadband(11, 10, 4);
            msg.payload.kept = deadband(13, 10, 4);
            msg
        "#;
        let out = emitted(run(&engine, script, &message(json!({}))).unwrap());
        assert_eq!(out.payload()["scaled"], json!(5.0));
        assert_eq!(out.payload()["snapped"], json!(10));
        assert_eq!(out.payload()["kept"], json!(13));
    }

    #[test]
    fn test_wide_integers_survive_scripts() {
        let engine = ScriptEngine::default();
        let payload = json!({"big": u64::MAX, "nested": {"big": 9_223_372_036_854_775_808u64}});
        let out = emitted(run(&engine, "msg", &message(payload.clone())).unwrap());
        assert_eq!(serde_json::Value::Object(out.payload().clone()), payload);

        let out = emitted(
            run(&engine, "msg.payload.text = msg.payload.big.to_string(); msg", &message(payload))
                .unwrap(),
        );
        assert_eq!(out.payload()["text"], json!("18446744073709551615"));
    }

    #[test]
    fn test_is_identifier() {
        assert!(is_identifier("temp"));
        assert!(is_identifier("_x1"));
        assert!(!is_identifier("1x"));
        assert!(!is_identifier("a:b"));
        assert!(!is_identifier(""));
    }
}
