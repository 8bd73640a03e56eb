//! Runtime construction

use super::{Runtime, RuntimeState};
use crate::binding::BindingRegistry;
use crate::config::{BindingConfig, LoadedConfig};
use crate::error::Result;
use crate::events::EventFeed;
use crate::router::{RoutePool, Router};
use crate::scripting::ScriptEngine;
use crate::transport::{self, Transport};
use std::sync::{Arc, Mutex};

/// Opens the transport for a binding
pub type TransportFactory =
    Arc<dyn Fn(&BindingConfig) -> Result<Box<dyn Transport>> + Send + Sync>;

/// Builder for a [`Runtime`]
///
/// ```ignore
/// let loaded = radapter::config::load("radapter.toml")?;
/// let mut runtime = RuntimeBuilder::new(loaded).start()?;
/// // ...
/// runtime.shutdown(runtime.settings().shutdown_grace());
/// ```
pub struct RuntimeBuilder {
    loaded: LoadedConfig,
    factory: Option<TransportFactory>,
    feed: Option<EventFeed>,
}

impl RuntimeBuilder {
    pub fn new(loaded: LoadedConfig) -> Self {
        Self {
            loaded,
            factory: None,
            feed: None,
        }
    }

    /// Replace how transports are opened (defaults to [`transport::open`])
    pub fn transport_factory<F>(mut self, factory: F) -> Self
    where
        F: Fn(&BindingConfig) -> Result<Box<dyn Transport>> + Send + Sync + 'static,
    {
        self.factory = Some(Arc::new(factory));
        self
    }

    /// Publish events on an existing feed instead of a new one
    pub fn event_feed(mut self, feed: EventFeed) -> Self {
        self.feed = Some(feed);
        self
    }

    /// Create every shared component; nothing is connected yet
    pub fn build(self) -> Result<Runtime> {
        let settings = self.loaded.config.runtime.clone();
        let feed = self
            .feed
            .unwrap_or_else(|| EventFeed::new(self.loaded.config.events.capacity));
        let factory = self
            .factory
            .unwrap_or_else(|| Arc::new(|binding: &BindingConfig| transport::open(binding)));

        let engine = Arc::new(ScriptEngine::new(&settings.sandbox));
        let registry = Arc::new(BindingRegistry::new());
        let router = Arc::new(Router::new(
            engine.clone(),
            registry.clone(),
            feed.clone(),
            settings.edge_faults.clone(),
        ));
        let pool = Arc::new(RoutePool::new(
            router.clone(),
            settings.worker_threads,
            settings.pool_queue_depth,
        )?);

        let runtime = Runtime {
            state: Mutex::new(RuntimeState::Initializing),
            loaded: self.loaded,
            settings,
            engine,
            registry,
            router,
            pool,
            feed,
            factory,
            bindings: Vec::new(),
            event_writer: None,
        };
        runtime.announce(RuntimeState::Initializing);
        Ok(runtime)
    }

    /// Build and start in one step
    pub fn start(self) -> Result<Runtime> {
        let mut runtime = self.build()?;
        runtime.start()?;
        Ok(runtime)
    }
}
