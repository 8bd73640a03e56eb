//! Configuration module for radapter
//!
//! This module handles loading the TOML configuration and validating it
//! into the pieces the runtime activates:
//!
//! - Bindings, checked per protocol, with file paths resolved
//! - Edges, with endpoints checked and scripts loaded and compiled
//!
//! Validation never fails as a whole. Every invalid binding or edge is
//! reported as a [`ConfigIssue`] and left out, so the rest of the graph can
//! still activate.
//!
//! # Example
//!
//! ```ignore
//! use radapter::config::{self, LoadedConfig};
//! use radapter::scripting::ScriptEngine;
//!
//! let loaded = config::load("radapter.toml")?;
//! let engine = ScriptEngine::new(&loaded.config.runtime.sandbox);
//! let validated = loaded.validate(&engine);
//! for issue in &validated.issues {
//!     eprintln!("{}", issue);
//! }
//! ```

pub mod settings;

pub use settings::*;

use crate::error::{RadapterError, Result, ResultExt};
use crate::message::BindingId;
use crate::router::{EdgeSpec, ScriptSource};
use crate::scripting::ScriptEngine;
use crate::transport;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// A parsed configuration and the directory relative paths resolve against
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedConfig {
    pub config: RadapterConfig,
    pub base_dir: PathBuf,
    /// Source file, when loaded from disk
    pub path: Option<PathBuf>,
}

impl LoadedConfig {
    /// Wrap an in-memory configuration
    pub fn from_config(config: RadapterConfig, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            base_dir: base_dir.into(),
            path: None,
        }
    }

    /// Validate against the given engine (compiles every script)
    pub fn validate(&self, engine: &ScriptEngine) -> ValidatedConfig {
        validate(&self.config, &self.base_dir, engine)
    }

    /// Resolve a path relative to the configuration directory
    pub fn resolve(&self, path: &Path) -> PathBuf {
        resolve_path(&self.base_dir, path)
    }
}

/// Parse configuration text
pub fn parse(text: &str) -> Result<RadapterConfig> {
    toml::from_str(text).map_err(|e| RadapterError::Config(format!("Failed to parse: {}", e)))
}

/// Load and parse a configuration file
pub fn load(path: impl AsRef<Path>) -> Result<LoadedConfig> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .map_err(RadapterError::from)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let config = parse(&text).with_context(|| path.display().to_string())?;
    let base_dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    tracing::info!(
        "Loaded configuration from {} ({} bindings, {} edges)",
        path.display(),
        config.bindings.len(),
        config.edges.len()
    );
    Ok(LoadedConfig {
        config,
        base_dir,
        path: Some(path.to_path_buf()),
    })
}

/// Modification time of a configuration file, for reload polling
pub fn modified(path: impl AsRef<Path>) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Resolve a path relative to a base directory
pub fn resolve_path(base_dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

// ==================== Validation ====================

/// The configuration entry an issue refers to
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum ConfigEntry {
    Binding(BindingId),
    Edge(String),
}

impl fmt::Display for ConfigEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigEntry::Binding(id) => write!(f, "binding '{}'", id),
            ConfigEntry::Edge(name) => write!(f, "edge '{}'", name),
        }
    }
}

/// A rejected configuration entry
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ConfigIssue {
    pub entry: ConfigEntry,
    pub reason: String,
}

impl ConfigIssue {
    fn binding(id: &BindingId, error: impl fmt::Display) -> Self {
        Self {
            entry: ConfigEntry::Binding(id.clone()),
            reason: error.to_string(),
        }
    }

    fn edge(name: &str, error: impl fmt::Display) -> Self {
        Self {
            entry: ConfigEntry::Edge(name.to_string()),
            reason: error.to_string(),
        }
    }

    /// As a configuration error
    pub fn to_error(&self) -> RadapterError {
        RadapterError::Config(self.to_string())
    }
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} rejected: {}", self.entry, self.reason)
    }
}

/// The activatable part of a configuration
#[derive(Debug, Clone, Default)]
pub struct ValidatedConfig {
    /// Valid bindings, in declaration order, with paths resolved
    pub bindings: Vec<BindingConfig>,
    /// Valid edges, with script sources loaded
    pub edges: Vec<EdgeSpec>,
    /// Every rejected entry
    pub issues: Vec<ConfigIssue>,
}

impl ValidatedConfig {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn binding_ids(&self) -> HashSet<BindingId> {
        self.bindings.iter().map(|b| b.id.clone()).collect()
    }
}

/// Validate a configuration, collecting per-entry issues
pub fn validate(config: &RadapterConfig, base_dir: &Path, engine: &ScriptEngine) -> ValidatedConfig {
    let mut out = ValidatedConfig::default();

    let mut seen = HashSet::new();
    for binding in &config.bindings {
        if binding.id.as_str().is_empty() {
            out.issues
                .push(ConfigIssue::binding(&binding.id, "binding id must not be empty"));
            continue;
        }
        if !seen.insert(binding.id.clone()) {
            out.issues
                .push(ConfigIssue::binding(&binding.id, "duplicate binding id"));
            continue;
        }
        if binding.queue_depth == Some(0) {
            out.issues
                .push(ConfigIssue::binding(&binding.id, "queue_depth must be at least 1"));
            continue;
        }
        match transport::prepare(binding, base_dir) {
            Ok(prepared) => out.bindings.push(prepared),
            Err(e) => out.issues.push(ConfigIssue::binding(&binding.id, e)),
        }
    }

    let known = out.binding_ids();
    let mut names = HashSet::new();
    for (position, edge) in config.edges.iter().enumerate() {
        let name = edge.display_name(position);
        if !names.insert(name.clone()) {
            out.issues.push(ConfigIssue::edge(&name, "duplicate edge name"));
            continue;
        }
        match validate_edge(edge, name.clone(), &known, base_dir, engine) {
            Ok(spec) => out.edges.push(spec),
            Err(e) => out.issues.push(ConfigIssue::edge(&name, e)),
        }
    }

    for issue in &out.issues {
        tracing::warn!("Configuration: {}", issue);
    }
    out
}

fn validate_edge(
    edge: &EdgeConfig,
    name: String,
    known: &HashSet<BindingId>,
    base_dir: &Path,
    engine: &ScriptEngine,
) -> Result<EdgeSpec> {
    if !known.contains(&edge.from) {
        return Err(RadapterError::Config(format!(
            "unknown source binding '{}'",
            edge.from
        )));
    }
    let to = edge.to.to_vec();
    if to.is_empty() {
        return Err(RadapterError::Config(
            "at least one destination is required".to_string(),
        ));
    }
    if let Some(unknown) = to.iter().find(|id| !known.contains(*id)) {
        return Err(RadapterError::Config(format!(
            "unknown destination binding '{}'",
            unknown
        )));
    }

    let transform = match (&edge.script, &edge.script_inline) {
        (Some(_), Some(_)) => {
            return Err(RadapterError::Config(
                "`script` and `script_inline` are mutually exclusive".to_string(),
            ))
        }
        (Some(path), None) => {
            let full = resolve_path(base_dir, path);
            let source = std::fs::read_to_string(&full)
                .map_err(RadapterError::from)
                .with_context(|| format!("Failed to read script {}", full.display()))?;
            Some(ScriptSource {
                name: path.display().to_string(),
                source,
            })
        }
        (None, Some(source)) => Some(ScriptSource {
            name: format!("{} (inline)", name),
            source: source.clone(),
        }),
        (None, None) => None,
    };

    if let Some(script) = &transform {
        engine.compile(&script.name, &script.source)?;
    }
    if let Some(filter) = &edge.filter {
        engine.compile_filter(filter)?;
    }

    Ok(EdgeSpec {
        name,
        from: edge.from.clone(),
        to,
        transform,
        filter: edge.filter.clone(),
    })
}
