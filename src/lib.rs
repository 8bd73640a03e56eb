//! # radapter: multi-protocol data adapter runtime
//!
//! Bridges field-bus and serial transports (Modbus RTU, raw serial) with
//! network transports (websocket client and server, optionally over TLS),
//! routing every message through a graph of edges that can filter and
//! transform it with sandboxed Rhai scripts.
//!
//! ## Architecture
//!
//! - **Transports**: one implementation per protocol behind the
//!   [`transport::Transport`] trait
//! - **Bindings**: one worker thread per transport, with a bounded
//!   drop-oldest send queue and retry/fault handling
//! - **Router**: copy-on-write edge graph, sharded routing pool preserving
//!   per-source order
//! - **Scripting**: budget-limited Rhai sandbox for transforms and filters
//! - **Runtime**: lifecycle, hot reload and graceful shutdown
//! - **Events**: structured feed of lifecycle changes and faults
//!
//! ## Example
//!
//! ```ignore
//! use radapter::{config, RuntimeBuilder};
//!
//! let loaded = config::load("radapter.toml")?;
//! let mut runtime = RuntimeBuilder::new(loaded).start()?;
//! for record in runtime.subscribe() {
//!     println!("{}", serde_json::to_string(&record)?);
//! }
//! ```

pub mod binding;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod message;
pub mod router;
pub mod runtime;
pub mod scripting;
pub mod transport;

// Re-export commonly used types
pub use binding::{BindingStats, ConnectionState};
pub use config::{LoadedConfig, RadapterConfig};
pub use error::{RadapterError, Result};
pub use events::{EventFeed, EventRecord, RuntimeEvent};
pub use message::{BindingId, Message, Payload, Scalar};
pub use router::{EdgeState, Router};
pub use runtime::{Runtime, RuntimeBuilder, RuntimeState, ShutdownReport};
pub use scripting::ScriptEngine;
pub use transport::{ProtocolKind, Transport};
