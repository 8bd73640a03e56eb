//! Loopback harness for driving a runtime from tests

use super::{test_timeout, wait_for};
use radapter::config::{BindingConfig, LoadedConfig};
use radapter::transport::loopback::{LoopbackPeer, LoopbackTransport};
use radapter::{Message, Result, Runtime, RuntimeBuilder, Transport};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Peers of every loopback transport a runtime opened, by binding id
#[derive(Clone, Default)]
pub struct Harness {
    peers: Arc<Mutex<HashMap<String, LoopbackPeer>>>,
    refuse: Arc<HashSet<String>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bindings whose transports refuse to connect
    pub fn refusing(ids: &[&str]) -> Self {
        Self {
            peers: Arc::default(),
            refuse: Arc::new(ids.iter().map(|s| s.to_string()).collect()),
        }
    }

    fn open(&self, binding: &BindingConfig) -> Result<Box<dyn Transport>> {
        let (transport, peer) = LoopbackTransport::pair(false);
        if self.refuse.contains(binding.id.as_str()) {
            peer.refuse_connect(true);
        }
        if let Ok(mut peers) = self.peers.lock() {
            peers.insert(binding.id.to_string(), peer);
        }
        Ok(Box::new(transport))
    }

    /// Build and start a runtime whose transports are loopbacks
    pub fn start(&self, loaded: LoadedConfig) -> Runtime {
        let harness = self.clone();
        RuntimeBuilder::new(loaded)
            .transport_factory(move |binding| harness.open(binding))
            .start()
            .expect("runtime should start")
    }

    pub fn peer(&self, id: &str) -> LoopbackPeer {
        self.peers
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or_else(|| panic!("no transport opened for {}", id))
    }

    /// Wait until every named binding's link is up
    pub fn wait_connected(&self, ids: &[&str]) {
        for id in ids {
            let peer = self.peer(id);
            assert!(wait_for(|| peer.is_connected()), "{} never connected", id);
        }
    }

    /// Feed a payload into a binding as if it had been received
    pub fn inject(&self, id: &str, payload: Value) {
        self.peer(id).inject(radapter::message::into_payload(payload));
    }

    /// Next message sent by a binding
    pub fn recv(&self, id: &str) -> Option<Message> {
        self.peer(id).recv_sent(test_timeout())
    }

    /// Collect `count` messages sent by a binding
    pub fn recv_n(&self, id: &str, count: usize) -> Vec<Message> {
        let peer = self.peer(id);
        (0..count)
            .map_while(|_| peer.recv_sent(test_timeout()))
            .collect()
    }
}
