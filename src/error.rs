//! Error handling for radapter
//!
//! This module defines the error type shared by every component and a
//! Result alias for use throughout the crate.
//!
//! Errors are grouped by the component that raises them:
//!
//! - `Connect` / `Send` / `Disconnected` / `Framing` / `Modbus` - transport bindings
//! - `Compile` / `Script` - the scripting sandbox
//! - `Config` - configuration loading and validation
//!
//! Backpressure drops are not errors; they are reported on the event feed.

use std::fmt;
use thiserror::Error;

/// Why a script invocation did not produce a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptFault {
    /// Wall-clock, operation or memory budget exceeded
    BudgetExceeded,
    /// Runtime-wide cancellation (shutdown)
    Cancelled,
    /// Script raised an error or referenced something undefined
    Failed,
    /// Script returned something that is not a message or drop marker
    Malformed,
}

impl fmt::Display for ScriptFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ScriptFault::BudgetExceeded => "budget exceeded",
            ScriptFault::Cancelled => "cancelled",
            ScriptFault::Failed => "failed",
            ScriptFault::Malformed => "malformed result",
        };
        f.write_str(text)
    }
}

/// Main error type for radapter operations
#[derive(Error, Debug)]
pub enum RadapterError {
    /// A transport could not establish its connection
    #[error("Connect error: {0}")]
    Connect(String),

    /// A single message could not be transmitted
    #[error("Send error: {0}")]
    Send(String),

    /// The peer or device went away
    #[error("Disconnected: {0}")]
    Disconnected(String),

    /// Inbound bytes could not be decoded into a payload
    #[error("Framing error: {0}")]
    Framing(String),

    /// Modbus protocol failure (CRC mismatch, exception response)
    #[error("Modbus error: {0}")]
    Modbus(String),

    /// Script failed to compile
    #[error("Compile error: {0}")]
    Compile(String),

    /// Script failed while running
    #[error("Script error ({kind}): {message}")]
    Script { kind: ScriptFault, message: String },

    /// Configuration could not be loaded or an entry is invalid
    #[error("Configuration error: {0}")]
    Config(String),

    /// Channel communication failure between workers
    #[error("Channel error: {0}")]
    Channel(String),

    /// Timeout errors
    #[error("Timeout: {0}")]
    Timeout(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic errors with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<RadapterError>,
    },
}

impl RadapterError {
    /// Add context to an error
    pub fn with_context(self, context: impl Into<String>) -> Self {
        RadapterError::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Create a script runtime error
    pub fn script(kind: ScriptFault, message: impl Into<String>) -> Self {
        RadapterError::Script {
            kind,
            message: message.into(),
        }
    }

    /// The innermost error, with all context layers removed
    pub fn root(&self) -> &RadapterError {
        match self {
            RadapterError::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        match self.root() {
            RadapterError::Timeout(_) | RadapterError::Framing(_) => true,
            RadapterError::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }

    /// Whether the error means the connection itself is gone
    pub fn is_connection_loss(&self) -> bool {
        match self.root() {
            RadapterError::Disconnected(_) | RadapterError::Connect(_) => true,
            RadapterError::Io(err) => !matches!(
                err.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }

    /// Whether the error concerns a single undecodable inbound packet
    pub fn is_decode_failure(&self) -> bool {
        matches!(
            self.root(),
            RadapterError::Framing(_) | RadapterError::Serialization(_)
        )
    }

    /// Whether the error is tied to one message and leaves the link usable
    pub fn is_message_scoped(&self) -> bool {
        matches!(
            self.root(),
            RadapterError::Serialization(_) | RadapterError::Modbus(_) | RadapterError::Config(_)
        )
    }

    /// Sandbox fault kind, if this is a script runtime error
    pub fn script_fault(&self) -> Option<ScriptFault> {
        match self.root() {
            RadapterError::Script { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for RadapterError {
    fn from(err: serde_json::Error) -> Self {
        RadapterError::Serialization(err.to_string())
    }
}

/// Result type alias for radapter operations
pub type Result<T> = std::result::Result<T, RadapterError>;

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error result
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context lazily to an error result
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.with_context(context))
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| e.with_context(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RadapterError::Config("unknown binding 'plc'".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: unknown binding 'plc'"
        );
    }

    #[test]
    fn test_script_error_display() {
        let err = RadapterError::script(ScriptFault::BudgetExceeded, "deadline");
        assert_eq!(err.to_string(), "Script error (budget exceeded): deadline");
        assert_eq!(err.script_fault(), Some(ScriptFault::BudgetExceeded));
    }

    #[test]
    fn test_error_with_context() {
        let err = RadapterError::Timeout("no response".to_string());
        let with_ctx = err.with_context("Reading holding registers");
        assert!(with_ctx.to_string().contains("Reading holding registers"));
        assert!(with_ctx.is_transient());
    }

    #[test]
    fn test_transient_classification() {
        let timed_out = RadapterError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "timed out",
        ));
        assert!(timed_out.is_transient());
        assert!(!timed_out.is_connection_loss());

        let broken = RadapterError::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "pipe",
        ));
        assert!(!broken.is_transient());
        assert!(broken.is_connection_loss());

        assert!(!RadapterError::Send("bad value".into()).is_transient());
        assert!(RadapterError::Disconnected("closed".into()).is_connection_loss());
    }

    #[test]
    fn test_decode_failure() {
        assert!(RadapterError::Framing("bad escape".into()).is_decode_failure());
        assert!(RadapterError::Serialization("eof".into())
            .with_context("packet")
            .is_decode_failure());
        assert!(!RadapterError::Modbus("crc".into()).is_decode_failure());
    }

    #[test]
    fn test_message_scoped() {
        assert!(RadapterError::Modbus("illegal data address".into()).is_message_scoped());
        assert!(RadapterError::Serialization("nan".into()).is_message_scoped());
        assert!(!RadapterError::Disconnected("gone".into()).is_message_scoped());
        assert!(!RadapterError::Timeout("slow".into()).is_message_scoped());
    }
}
