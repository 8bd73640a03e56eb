//! Bounded send queues with drop-oldest backpressure
//!
//! Routing never blocks on a slow destination: when a binding's queue is
//! full the oldest queued message is evicted to make room, and one
//! `BackpressureDrop` event is emitted for every evicted message.

use crate::error::{RadapterError, Result};
use crate::events::{EventFeed, RuntimeEvent};
use crate::message::{BindingId, Message};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Outbound queue of one binding
///
/// Both channel ends are held here, so the queue can pop its own oldest
/// entry. Clones share the same queue.
#[derive(Clone)]
pub struct SendQueue {
    binding: BindingId,
    tx: Sender<Arc<Message>>,
    rx: Receiver<Arc<Message>>,
    capacity: usize,
    feed: EventFeed,
    dropped: Arc<AtomicU64>,
}

impl SendQueue {
    pub fn new(binding: BindingId, capacity: usize, feed: EventFeed) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = bounded(capacity);
        Self {
            binding,
            tx,
            rx,
            capacity,
            feed,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Enqueue a message, evicting the oldest ones while the queue is full
    ///
    /// Returns how many messages were evicted.
    pub fn push(&self, message: Arc<Message>) -> Result<usize> {
        let mut message = message;
        let mut evicted = 0;
        loop {
            match self.tx.try_send(message) {
                Ok(()) => return Ok(evicted),
                Err(TrySendError::Full(back)) => {
                    message = back;
                    // The consumer may have made room meanwhile; then just retry
                    if let Ok(oldest) = self.rx.try_recv() {
                        evicted += 1;
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        self.feed.emit(RuntimeEvent::BackpressureDrop {
                            binding: self.binding.clone(),
                            dropped_source: oldest.source().clone(),
                            capacity: self.capacity,
                        });
                    }
                }
                Err(TrySendError::Disconnected(_)) => {
                    return Err(RadapterError::Channel(format!(
                        "send queue of {} closed",
                        self.binding
                    )))
                }
            }
        }
    }

    /// Consumer end, read by the binding worker
    pub fn receiver(&self) -> Receiver<Arc<Message>> {
        self.rx.clone()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Messages evicted so far
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn binding(&self) -> &BindingId {
        &self.binding
    }

    /// Discard everything still queued
    pub fn clear(&self) -> usize {
        self.rx.try_iter().count()
    }
}

impl std::fmt::Debug for SendQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendQueue")
            .field("binding", &self.binding)
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn msg(source: &str, n: i64) -> Arc<Message> {
        Message::from_value(BindingId::new(source), json!({ "n": n })).into_shared()
    }

    #[test]
    fn test_push_within_capacity() {
        let feed = EventFeed::new(16);
        let events = feed.subscribe();
        let queue = SendQueue::new(BindingId::new("out"), 2, feed);
        assert_eq!(queue.push(msg("a", 1)).unwrap(), 0);
        assert_eq!(queue.push(msg("a", 2)).unwrap(), 0);
        assert_eq!(queue.len(), 2);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_full_queue_drops_oldest() {
        let feed = EventFeed::new(16);
        let events = feed.subscribe();
        let queue = SendQueue::new(BindingId::new("out"), 2, feed);
        queue.push(msg("a", 1)).unwrap();
        queue.push(msg("b", 2)).unwrap();
        assert_eq!(queue.push(msg("c", 3)).unwrap(), 1);

        let rx = queue.receiver();
        let remaining: Vec<i64> = rx
            .try_iter()
            .map(|m| m.payload()["n"].as_i64().unwrap())
            .collect();
        assert_eq!(remaining, vec![2, 3]);
        assert_eq!(queue.dropped(), 1);

        let record = events.try_recv().unwrap();
        assert_eq!(
            record.event,
            RuntimeEvent::BackpressureDrop {
                binding: BindingId::new("out"),
                dropped_source: BindingId::new("a"),
                capacity: 2,
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_one_event_per_eviction() {
        let feed = EventFeed::new(64);
        let events = feed.subscribe();
        let queue = SendQueue::new(BindingId::new("out"), 3, feed);
        for i in 0..10 {
            queue.push(msg("src", i)).unwrap();
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped(), 7);
        assert_eq!(events.try_iter().count(), 7);
    }

    #[test]
    fn test_concurrent_producers_account_for_every_message() {
        let feed = EventFeed::new(4096);
        let events = feed.subscribe();
        let queue = SendQueue::new(BindingId::new("out"), 8, feed);
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let queue = queue.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        queue.push(msg(&format!("p{}", p), i)).unwrap();
                    }
                })
            })
            .collect();
        for handle in producers {
            handle.join().unwrap();
        }
        let drops = events.try_iter().count() as u64;
        assert_eq!(drops, queue.dropped());
        assert_eq!(queue.len() as u64 + drops, 800);
    }
}
