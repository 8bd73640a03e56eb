//! Structured runtime event feed
//!
//! Lifecycle changes and faults are published as [`RuntimeEvent`]s. Every
//! event is logged through `tracing` and handed to each subscriber's bounded
//! channel; a slow subscriber loses events rather than stalling the runtime.
//!
//! Events serialize as flat JSON objects tagged by `event`:
//!
//! ```json
//! {"at":"2024-05-01T10:00:00Z","event":"backpressure_drop","binding":"cloud","dropped_source":"plc","capacity":64}
//! ```

use crate::binding::ConnectionState;
use crate::config::ConfigIssue;
use crate::error::{RadapterError, Result, ResultExt, ScriptFault};
use crate::message::BindingId;
use crate::router::EdgeState;
use crate::runtime::RuntimeState;
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::Serialize;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Which script stage of an edge failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptStage {
    Filter,
    Transform,
}

/// Something that happened in the runtime
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RuntimeEvent {
    RuntimeState {
        state: RuntimeState,
    },
    BindingState {
        binding: BindingId,
        state: ConnectionState,
    },
    /// A binding gave up after exhausting its retries, or failed fatally
    BindingFault {
        binding: BindingId,
        error: String,
        attempts: u32,
    },
    /// A message could not be delivered to or sent by a destination
    SendFailed {
        binding: BindingId,
        edge: Option<String>,
        error: String,
    },
    EdgeState {
        edge: String,
        state: EdgeState,
    },
    /// An edge exceeded its fault threshold and was disabled
    EdgeDisabled {
        edge: String,
        faults: usize,
    },
    /// A full send queue evicted its oldest message
    BackpressureDrop {
        binding: BindingId,
        dropped_source: BindingId,
        capacity: usize,
    },
    SandboxError {
        edge: String,
        stage: ScriptStage,
        fault: ScriptFault,
        error: String,
    },
    ConfigRejected {
        #[serde(flatten)]
        issue: ConfigIssue,
    },
}

impl RuntimeEvent {
    fn log(&self) {
        match self {
            RuntimeEvent::RuntimeState { state } => {
                tracing::info!("Runtime state: {:?}", state)
            }
            RuntimeEvent::BindingState { binding, state } => {
                tracing::info!("Binding {} is {:?}", binding, state)
            }
            RuntimeEvent::BindingFault {
                binding,
                error,
                attempts,
            } => tracing::error!(
                "Binding {} faulted after {} attempt(s): {}",
                binding,
                attempts,
                error
            ),
            RuntimeEvent::SendFailed {
                binding,
                edge,
                error,
            } => tracing::warn!(
                "Send to {} failed (edge {}): {}",
                binding,
                edge.as_deref().unwrap_or("-"),
                error
            ),
            RuntimeEvent::EdgeState { edge, state } => {
                tracing::info!("Edge '{}' is {}", edge, state)
            }
            RuntimeEvent::EdgeDisabled { edge, faults } => tracing::error!(
                "Edge '{}' disabled after {} faults",
                edge,
                faults
            ),
            RuntimeEvent::BackpressureDrop {
                binding,
                dropped_source,
                capacity,
            } => tracing::warn!(
                "Send queue of {} full ({}), dropped oldest message from {}",
                binding,
                capacity,
                dropped_source
            ),
            RuntimeEvent::SandboxError {
                edge,
                stage,
                error,
                ..
            } => tracing::warn!("Edge '{}' {:?} error: {}", edge, stage, error),
            RuntimeEvent::ConfigRejected { issue } => tracing::warn!("{}", issue),
        }
    }
}

/// An event with its emission time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: RuntimeEvent,
}

struct FeedInner {
    subscribers: Mutex<Vec<Sender<EventRecord>>>,
    capacity: usize,
    emitted: AtomicU64,
    lost: AtomicU64,
}

/// Cloneable handle for publishing and subscribing to runtime events
#[derive(Clone)]
pub struct EventFeed {
    inner: Arc<FeedInner>,
}

impl EventFeed {
    /// Create a feed whose subscribers buffer up to `capacity` events
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(FeedInner {
                subscribers: Mutex::new(Vec::new()),
                capacity: capacity.max(1),
                emitted: AtomicU64::new(0),
                lost: AtomicU64::new(0),
            }),
        }
    }

    /// Subscribe to every event emitted from now on
    pub fn subscribe(&self) -> Receiver<EventRecord> {
        let (tx, rx) = bounded(self.inner.capacity);
        if let Ok(mut subs) = self.inner.subscribers.lock() {
            subs.push(tx);
        }
        rx
    }

    /// Publish an event
    pub fn emit(&self, event: RuntimeEvent) {
        event.log();
        self.inner.emitted.fetch_add(1, Ordering::Relaxed);
        let record = EventRecord {
            at: Utc::now(),
            event,
        };
        let Ok(mut subs) = self.inner.subscribers.lock() else {
            return;
        };
        subs.retain(|tx| match tx.try_send(record.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.inner.lost.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    /// Number of events emitted so far
    pub fn emitted(&self) -> u64 {
        self.inner.emitted.load(Ordering::Relaxed)
    }

    /// Number of deliveries skipped because a subscriber was full
    pub fn lost(&self) -> u64 {
        self.inner.lost.load(Ordering::Relaxed)
    }

    /// Disconnect every subscriber; buffered events stay readable
    pub fn close(&self) {
        if let Ok(mut subs) = self.inner.subscribers.lock() {
            subs.clear();
        }
    }

    /// Append every event as a JSON line to `path` from a background thread
    ///
    /// The writer stops after [`EventFeed::close`].
    pub fn write_to_file(&self, path: &Path) -> Result<JoinHandle<()>> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(RadapterError::from)
            .with_context(|| format!("Failed to open event log {}", path.display()))?;
        let rx = self.subscribe();
        let log_path = path.display().to_string();
        let handle = std::thread::Builder::new()
            .name("radapter-events".to_string())
            .spawn(move || {
                let mut writer = BufWriter::new(file);
                for record in rx {
                    let written = serde_json::to_writer(&mut writer, &record)
                        .map_err(std::io::Error::from)
                        .and_then(|_| writer.write_all(b"\n"))
                        .and_then(|_| writer.flush());
                    if let Err(e) = written {
                        tracing::error!("Event log {} write failed: {}", log_path, e);
                        break;
                    }
                }
            })?;
        tracing::info!("Writing events to {}", path.display());
        Ok(handle)
    }
}

impl Default for EventFeed {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl std::fmt::Debug for EventFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventFeed")
            .field("capacity", &self.inner.capacity)
            .field("emitted", &self.emitted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigEntry;

    fn drop_event() -> RuntimeEvent {
        RuntimeEvent::BackpressureDrop {
            binding: BindingId::new("cloud"),
            dropped_source: BindingId::new("plc"),
            capacity: 4,
        }
    }

    #[test]
    fn test_subscribers_receive_events() {
        let feed = EventFeed::new(8);
        let a = feed.subscribe();
        let b = feed.subscribe();
        feed.emit(drop_event());
        assert_eq!(a.try_recv().unwrap().event, drop_event());
        assert_eq!(b.try_recv().unwrap().event, drop_event());
        assert_eq!(feed.emitted(), 1);
    }

    #[test]
    fn test_full_subscriber_loses_events() {
        let feed = EventFeed::new(1);
        let rx = feed.subscribe();
        feed.emit(drop_event());
        feed.emit(drop_event());
        assert_eq!(rx.len(), 1);
        assert_eq!(feed.lost(), 1);
    }

    #[test]
    fn test_dropped_subscriber_is_removed() {
        let feed = EventFeed::new(4);
        drop(feed.subscribe());
        feed.emit(drop_event());
        assert_eq!(feed.inner.subscribers.lock().unwrap().len(), 0);
    }

    #[test]
    fn test_event_serialization() {
        let record = EventRecord {
            at: Utc::now(),
            event: drop_event(),
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["event"], "backpressure_drop");
        assert_eq!(json["binding"], "cloud");
        assert_eq!(json["dropped_source"], "plc");
        assert_eq!(json["capacity"], 4);
        assert!(json["at"].is_string());

        let json = serde_json::to_value(RuntimeEvent::EdgeState {
            edge: "e".into(),
            state: EdgeState::Draining,
        })
        .unwrap();
        assert_eq!(json["state"], "draining");
    }

    #[test]
    fn test_config_rejected_serialization() {
        let event = RuntimeEvent::ConfigRejected {
            issue: ConfigIssue {
                entry: ConfigEntry::Edge("e1".into()),
                reason: "unknown destination binding 'x'".into(),
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "config_rejected");
        assert_eq!(json["entry"]["kind"], "edge");
        assert_eq!(json["entry"]["name"], "e1");
    }

    #[test]
    fn test_write_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        let feed = EventFeed::new(16);
        let handle = feed.write_to_file(&path).unwrap();
        feed.emit(drop_event());
        feed.emit(RuntimeEvent::RuntimeState {
            state: RuntimeState::Running,
        });
        feed.close();
        handle.join().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "backpressure_drop");
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["state"], "running");
    }
}
