//! In-process transport
//!
//! Messages sent to a loopback binding are recorded on its [`LoopbackPeer`]
//! and, in echo mode, come straight back as inbound traffic. The peer can
//! also inject inbound payloads, which makes loopback bindings the fixture of
//! choice for exercising routes without hardware.

use super::{ProtocolKind, Received, Transport};
use crate::error::{RadapterError, Result};
use crate::message::{Message, Metadata, Payload};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Shared state between a loopback transport and its peer
#[derive(Debug, Default)]
struct Shared {
    connected: AtomicBool,
    fail_next_send: Mutex<Option<RadapterError>>,
    fail_connect: AtomicBool,
}

/// Loopback binding transport
#[derive(Debug)]
pub struct LoopbackTransport {
    echo: bool,
    inbound_tx: Sender<Received>,
    inbound_rx: Receiver<Received>,
    sent_tx: Sender<Message>,
    shared: Arc<Shared>,
}

/// Test-side handle of a loopback transport
#[derive(Debug, Clone)]
pub struct LoopbackPeer {
    inbound: Sender<Received>,
    sent: Receiver<Message>,
    shared: Arc<Shared>,
}

impl LoopbackTransport {
    /// Create a loopback transport whose peer is dropped
    pub fn new(echo: bool) -> Self {
        Self::pair(echo).0
    }

    /// Create a transport together with its peer handle
    pub fn pair(echo: bool) -> (Self, LoopbackPeer) {
        let (inbound_tx, inbound_rx) = unbounded();
        let (sent_tx, sent_rx) = unbounded();
        let shared = Arc::new(Shared::default());
        let peer = LoopbackPeer {
            inbound: inbound_tx.clone(),
            sent: sent_rx,
            shared: shared.clone(),
        };
        (
            Self {
                echo,
                inbound_tx,
                inbound_rx,
                sent_tx,
                shared,
            },
            peer,
        )
    }
}

impl Transport for LoopbackTransport {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Loopback
    }

    fn connect(&mut self) -> Result<()> {
        if self.shared.fail_connect.load(Ordering::SeqCst) {
            return Err(RadapterError::Connect("loopback refused".to_string()));
        }
        self.shared.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn disconnect(&mut self) {
        self.shared.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn send(&mut self, message: &Message) -> Result<()> {
        if !self.is_connected() {
            return Err(RadapterError::Disconnected("loopback not connected".to_string()));
        }
        if let Some(err) = self.shared.fail_next_send.lock().ok().and_then(|mut f| f.take()) {
            return Err(err);
        }
        if self.echo {
            let echoed = Received {
                payload: message.payload().clone(),
                metadata: message.metadata().clone(),
            };
            let _ = self.inbound_tx.send(echoed);
        }
        // The peer may be gone; sent messages are then simply discarded
        let _ = self.sent_tx.send(message.clone());
        Ok(())
    }

    fn poll(&mut self, timeout: Duration) -> Result<Option<Received>> {
        if !self.is_connected() {
            return Err(RadapterError::Disconnected("loopback not connected".to_string()));
        }
        match self.inbound_rx.recv_timeout(timeout) {
            Ok(received) => Ok(Some(received)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(RadapterError::Disconnected(
                "loopback channel closed".to_string(),
            )),
        }
    }
}

impl LoopbackPeer {
    /// Deliver an inbound payload to the binding
    pub fn inject(&self, payload: Payload) {
        self.inject_with(payload, Metadata::new());
    }

    pub fn inject_with(&self, payload: Payload, metadata: Metadata) {
        let _ = self.inbound.send(Received { payload, metadata });
    }

    /// Messages the binding has sent, in order
    pub fn sent(&self) -> &Receiver<Message> {
        &self.sent
    }

    /// Wait for the next sent message
    pub fn recv_sent(&self, timeout: Duration) -> Option<Message> {
        self.sent.recv_timeout(timeout).ok()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Make the next send fail with `error`
    pub fn fail_next_send(&self, error: RadapterError) {
        if let Ok(mut slot) = self.shared.fail_next_send.lock() {
            *slot = Some(error);
        }
    }

    /// Refuse connection attempts while `refuse` is set
    pub fn refuse_connect(&self, refuse: bool) {
        self.shared.fail_connect.store(refuse, Ordering::SeqCst);
    }

    /// Simulate the remote side dropping the link
    pub fn drop_link(&self) {
        self.shared.connected.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{into_payload, BindingId};
    use serde_json::json;

    #[test]
    fn test_echo_round_trip() {
        let (mut transport, peer) = LoopbackTransport::pair(true);
        transport.connect().unwrap();
        let message = Message::from_value(BindingId::new("lo"), json!({"a": 1}));
        transport.send(&message).unwrap();

        let echoed = transport.poll(Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!(echoed.payload["a"], json!(1));
        assert_eq!(peer.recv_sent(Duration::from_millis(10)).unwrap(), message);
    }

    #[test]
    fn test_no_echo_and_inject() {
        let (mut transport, peer) = LoopbackTransport::pair(false);
        transport.connect().unwrap();
        let message = Message::from_value(BindingId::new("lo"), json!({"a": 1}));
        transport.send(&message).unwrap();
        assert!(transport.poll(Duration::from_millis(5)).unwrap().is_none());

        peer.inject(into_payload(json!({"b": 2})));
        let received = transport.poll(Duration::from_millis(10)).unwrap().unwrap();
        assert_eq!(received.payload["b"], json!(2));
    }

    #[test]
    fn test_failures() {
        let (mut transport, peer) = LoopbackTransport::pair(false);
        let message = Message::from_value(BindingId::new("lo"), json!({}));
        assert!(matches!(
            transport.send(&message),
            Err(RadapterError::Disconnected(_))
        ));

        peer.refuse_connect(true);
        assert!(transport.connect().is_err());
        peer.refuse_connect(false);
        transport.connect().unwrap();

        peer.fail_next_send(RadapterError::Timeout("slow".into()));
        assert!(matches!(transport.send(&message), Err(RadapterError::Timeout(_))));
        transport.send(&message).unwrap();

        peer.drop_link();
        assert!(!transport.is_connected());
    }
}
