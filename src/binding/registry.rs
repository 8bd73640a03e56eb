//! Lookup table of live bindings, shared by the router and the runtime

use super::{BindingStats, ConnectionState, SendQueue, StateCell};
use crate::error::{RadapterError, Result};
use crate::message::{BindingId, Message};
use crate::transport::ProtocolKind;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

/// Shared view of one binding
#[derive(Debug)]
pub struct BindingEntry {
    pub id: BindingId,
    pub kind: ProtocolKind,
    pub state: StateCell,
    pub queue: SendQueue,
    pub stats: Arc<Mutex<BindingStats>>,
}

impl BindingEntry {
    pub fn new(id: BindingId, kind: ProtocolKind, queue: SendQueue) -> Self {
        Self {
            id,
            kind,
            state: StateCell::default(),
            queue,
            stats: Arc::new(Mutex::new(BindingStats::default())),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn stats(&self) -> BindingStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

/// Bindings by id
#[derive(Debug, Default)]
pub struct BindingRegistry {
    entries: RwLock<HashMap<BindingId, Arc<BindingEntry>>>,
}

impl BindingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, entry: Arc<BindingEntry>) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(entry.id.clone(), entry);
        }
    }

    pub fn remove(&self, id: &BindingId) -> Option<Arc<BindingEntry>> {
        self.entries.write().ok().and_then(|mut e| e.remove(id))
    }

    pub fn get(&self, id: &BindingId) -> Option<Arc<BindingEntry>> {
        self.entries.read().ok().and_then(|e| e.get(id).cloned())
    }

    pub fn contains(&self, id: &BindingId) -> bool {
        self.get(id).is_some()
    }

    pub fn ids(&self) -> Vec<BindingId> {
        let mut ids: Vec<BindingId> = self
            .entries
            .read()
            .map(|e| e.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue a message for `to`; returns how many older messages were evicted
    pub fn enqueue(&self, to: &BindingId, message: Arc<Message>) -> Result<usize> {
        let entry = self
            .get(to)
            .ok_or_else(|| RadapterError::Send(format!("unknown binding '{}'", to)))?;
        entry.queue.push(message)
    }

    /// Messages waiting in all send queues
    pub fn queued(&self) -> usize {
        self.entries
            .read()
            .map(|e| e.values().map(|b| b.queue.len()).sum())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventFeed;
    use serde_json::json;

    fn entry(id: &str) -> Arc<BindingEntry> {
        let id = BindingId::new(id);
        Arc::new(BindingEntry::new(
            id.clone(),
            ProtocolKind::Loopback,
            SendQueue::new(id, 4, EventFeed::default()),
        ))
    }

    #[test]
    fn test_enqueue_routes_to_queue() {
        let registry = BindingRegistry::new();
        registry.insert(entry("b"));
        registry.insert(entry("a"));
        assert_eq!(registry.ids(), vec![BindingId::new("a"), BindingId::new("b")]);

        let message = Message::from_value(BindingId::new("a"), json!({})).into_shared();
        registry.enqueue(&BindingId::new("b"), message.clone()).unwrap();
        assert_eq!(registry.get(&BindingId::new("b")).unwrap().queue.len(), 1);
        assert_eq!(registry.queued(), 1);

        assert!(registry.enqueue(&BindingId::new("zz"), message).is_err());
    }

    #[test]
    fn test_remove() {
        let registry = BindingRegistry::new();
        registry.insert(entry("a"));
        assert!(registry.remove(&BindingId::new("a")).is_some());
        assert!(registry.is_empty());
        assert_eq!(
            entry("x").state(),
            ConnectionState::Disconnected
        );
    }
}
