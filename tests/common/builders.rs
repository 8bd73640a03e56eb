//! Test data builders for configurations and messages

use radapter::config::{
    BindingConfig, EdgeConfig, LoadedConfig, LoopbackConfig, RadapterConfig, TransportConfig,
};
use radapter::{BindingId, Message};
use serde_json::Value;

/// Builder for in-memory configurations made of loopback bindings
pub struct ConfigBuilder {
    config: RadapterConfig,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        let mut config = RadapterConfig::default();
        config.runtime.shutdown_grace_ms = 2000;
        config.runtime.retry.initial_backoff_ms = 1;
        config.runtime.retry.max_backoff_ms = 10;
        Self { config }
    }

    /// Add loopback bindings that do not echo
    pub fn loopbacks(mut self, ids: &[&str]) -> Self {
        for id in ids {
            self.config.bindings.push(BindingConfig::new(
                *id,
                TransportConfig::Loopback(LoopbackConfig { echo: false }),
            ));
        }
        self
    }

    pub fn binding(mut self, binding: BindingConfig) -> Self {
        self.config.bindings.push(binding);
        self
    }

    pub fn edge(mut self, edge: EdgeConfig) -> Self {
        self.config.edges.push(edge);
        self
    }

    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.config.runtime.queue_depth = depth;
        self
    }

    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.config.runtime.worker_threads = threads;
        self
    }

    pub fn budget_ms(mut self, budget_ms: u64) -> Self {
        self.config.runtime.sandbox.budget_ms = budget_ms;
        self
    }

    pub fn max_operations(mut self, max_operations: u64) -> Self {
        self.config.runtime.sandbox.max_operations = max_operations;
        self
    }

    pub fn build(self) -> RadapterConfig {
        self.config
    }

    pub fn loaded(self) -> LoadedConfig {
        LoadedConfig::from_config(self.config, ".")
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Message from `source` with a JSON object payload
pub fn message(source: &str, payload: Value) -> Message {
    Message::from_value(BindingId::new(source), payload)
}
