//! Sharded routing pool
//!
//! A fixed set of routing threads, each with its own bounded ingress
//! channel. Messages are assigned to a thread by hashing their source, so
//! all messages from one source are routed by the same thread in the order
//! they were submitted. A full ingress channel blocks only the producer.

use super::Router;
use crate::binding::MessageSink;
use crate::error::Result;
use crate::message::{BindingId, Message};
use crossbeam_channel::{bounded, Sender};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct PoolCounters {
    /// Submitted but not yet fully routed
    pending: AtomicUsize,
    routed: AtomicU64,
    refused: AtomicU64,
}

/// Routing threads fed by per-thread bounded channels
pub struct RoutePool {
    shards: RwLock<Vec<Sender<Arc<Message>>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    accepting: AtomicBool,
    counters: Arc<PoolCounters>,
    width: usize,
}

impl RoutePool {
    /// Start `workers` routing threads sharing `queue_depth` ingress slots
    pub fn new(router: Arc<Router>, workers: usize, queue_depth: usize) -> Result<Self> {
        let width = workers.max(1);
        let per_shard = (queue_depth / width).max(1);
        let counters = Arc::new(PoolCounters::default());
        let mut shards = Vec::with_capacity(width);
        let mut threads = Vec::with_capacity(width);

        for index in 0..width {
            let (tx, rx) = bounded::<Arc<Message>>(per_shard);
            let router = router.clone();
            let counters = counters.clone();
            let thread = std::thread::Builder::new()
                .name(format!("route-{}", index))
                .spawn(move || {
                    tracing::debug!("Routing thread {} started", index);
                    for message in rx {
                        router.route(&message);
                        counters.routed.fetch_add(1, Ordering::Relaxed);
                        counters.pending.fetch_sub(1, Ordering::SeqCst);
                    }
                    tracing::debug!("Routing thread {} stopped", index);
                })?;
            shards.push(tx);
            threads.push(thread);
        }

        tracing::info!(
            "Routing pool started: {} thread(s), {} slot(s) each",
            width,
            per_shard
        );
        Ok(Self {
            shards: RwLock::new(shards),
            threads: Mutex::new(threads),
            accepting: AtomicBool::new(true),
            counters,
            width,
        })
    }

    fn shard_of(&self, source: &BindingId) -> usize {
        let mut hasher = DefaultHasher::new();
        source.as_str().hash(&mut hasher);
        (hasher.finish() % self.width as u64) as usize
    }

    /// Queue a message for routing, blocking while its shard is full
    ///
    /// Returns false once the pool has stopped accepting.
    pub fn dispatch(&self, message: Arc<Message>) -> bool {
        if !self.accepting.load(Ordering::SeqCst) {
            self.counters.refused.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let shard = self.shard_of(message.source());
        let Some(tx) = self
            .shards
            .read()
            .ok()
            .and_then(|shards| shards.get(shard).cloned())
        else {
            self.counters.refused.fetch_add(1, Ordering::Relaxed);
            return false;
        };

        self.counters.pending.fetch_add(1, Ordering::SeqCst);
        if tx.send(message).is_err() {
            self.counters.pending.fetch_sub(1, Ordering::SeqCst);
            self.counters.refused.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        true
    }

    /// Refuse new messages; queued ones are still routed
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }

    pub fn resume_accepting(&self) {
        self.accepting.store(true, Ordering::SeqCst);
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Messages submitted but not yet routed
    pub fn pending(&self) -> usize {
        self.counters.pending.load(Ordering::SeqCst)
    }

    pub fn routed(&self) -> u64 {
        self.counters.routed.load(Ordering::Relaxed)
    }

    pub fn refused(&self) -> u64 {
        self.counters.refused.load(Ordering::Relaxed)
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Wait until every submitted message has been routed
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.pending() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }

    /// Stop accepting, let the threads finish their queues, and join them
    pub fn shutdown(&self) {
        self.stop_accepting();
        if let Ok(mut shards) = self.shards.write() {
            shards.clear();
        }
        let threads = self
            .threads
            .lock()
            .map(|mut t| std::mem::take(&mut *t))
            .unwrap_or_default();
        for thread in threads {
            if thread.join().is_err() {
                tracing::error!("Routing thread panicked");
            }
        }
    }
}

impl MessageSink for RoutePool {
    fn submit(&self, message: Arc<Message>) -> bool {
        self.dispatch(message)
    }

    fn accepting(&self) -> bool {
        self.is_accepting()
    }
}

impl Drop for RoutePool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for RoutePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutePool")
            .field("width", &self.width)
            .field("pending", &self.pending())
            .field("accepting", &self.is_accepting())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::{BindingEntry, BindingRegistry, SendQueue};
    use crate::config::{EdgeFaultSettings, SandboxSettings};
    use crate::events::EventFeed;
    use crate::router::EdgeSpec;
    use crate::scripting::ScriptEngine;
    use crate::transport::ProtocolKind;
    use serde_json::json;

    fn setup(sources: &[&str]) -> (Arc<Router>, Arc<BindingRegistry>) {
        let feed = EventFeed::new(64);
        let registry = Arc::new(BindingRegistry::new());
        let sink = BindingId::new("sink");
        registry.insert(Arc::new(BindingEntry::new(
            sink.clone(),
            ProtocolKind::Loopback,
            SendQueue::new(sink.clone(), 10_000, feed.clone()),
        )));
        let router = Arc::new(Router::new(
            Arc::new(ScriptEngine::new(&SandboxSettings::default())),
            registry.clone(),
            feed,
            EdgeFaultSettings::default(),
        ));
        let specs = sources
            .iter()
            .map(|s| EdgeSpec {
                name: format!("{}-sink", s),
                from: BindingId::new(s),
                to: vec![sink.clone()],
                transform: None,
                filter: None,
            })
            .collect();
        router.reconfigure(specs, Duration::ZERO);
        (router, registry)
    }

    #[test]
    fn test_per_source_order() {
        let sources = ["a", "b", "c", "d"];
        let (router, registry) = setup(&sources);
        let pool = Arc::new(RoutePool::new(router, 3, 64).unwrap());

        let producers: Vec<_> = sources
            .iter()
            .map(|s| {
                let pool = pool.clone();
                let source = BindingId::new(s);
                std::thread::spawn(move || {
                    for n in 0..250 {
                        let m = Message::from_value(source.clone(), json!({ "n": n }));
                        assert!(pool.dispatch(m.into_shared()));
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }
        assert!(pool.wait_idle(Duration::from_secs(10)));
        assert_eq!(pool.routed(), 1000);

        let delivered: Vec<Arc<Message>> = registry
            .get(&BindingId::new("sink"))
            .unwrap()
            .queue
            .receiver()
            .try_iter()
            .collect();
        assert_eq!(delivered.len(), 1000);
        for s in sources {
            let seq: Vec<i64> = delivered
                .iter()
                .filter(|m| m.source().as_str() == s)
                .map(|m| m.payload()["n"].as_i64().unwrap())
                .collect();
            assert_eq!(seq, (0..250).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_refuses_after_stop() {
        let (router, _) = setup(&["a"]);
        let pool = RoutePool::new(router, 1, 4).unwrap();
        let m = Message::from_value(BindingId::new("a"), json!({})).into_shared();
        assert!(MessageSink::accepting(&pool));
        pool.stop_accepting();
        assert!(!pool.submit(m));
        assert_eq!(pool.refused(), 1);
        pool.shutdown();
        assert_eq!(pool.pending(), 0);
    }

    #[test]
    fn test_same_source_same_shard() {
        let (router, _) = setup(&[]);
        let pool = RoutePool::new(router, 8, 8).unwrap();
        let id = BindingId::new("plc");
        assert_eq!(pool.shard_of(&id), pool.shard_of(&id.clone()));
        assert!(pool.shard_of(&id) < pool.width());
    }
}
