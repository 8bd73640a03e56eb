//! Integration tests for the pipeline runtime
//!
//! These tests drive a full runtime through loopback transports:
//! - Filtering, transforming and fan-out
//! - Per-source ordering
//! - Drop-oldest backpressure
//! - Draining an edge removed by a reload
//! - Shutdown

mod common;

use common::builders::{message, ConfigBuilder};
use common::mock_helpers::Harness;
use common::{drain_events, wait_for};
use radapter::config::EdgeConfig;
use radapter::{BindingId, ConnectionState, EdgeState, RuntimeEvent, RuntimeState};
use serde_json::json;
use std::time::Duration;

#[test]
fn test_filter_and_transform_scenario() {
    let harness = Harness::new();
    let loaded = ConfigBuilder::new()
        .loopbacks(&["plc", "cloud"])
        .edge(
            EdgeConfig::new("plc", "cloud")
                .named("scale")
                .with_filter("temp > 20")
                .with_script("msg.payload.temp = msg.payload.temp * 10; msg"),
        )
        .loaded();
    let mut runtime = harness.start(loaded);
    harness.wait_connected(&["plc", "cloud"]);

    let hot = message("plc", json!({"temp": 21.5}));
    let timestamp = hot.timestamp();
    assert!(runtime.submit(hot));
    assert!(runtime.submit(message("plc", json!({"temp": 10}))));
    assert!(runtime.submit(message("plc", json!({"temp": 30}))));

    let first = harness.recv("cloud").expect("hot reading delivered");
    assert_eq!(first.payload()["temp"], json!(215.0));
    assert_eq!(first.timestamp(), timestamp);
    assert_eq!(first.source(), &BindingId::new("plc"));

    // {temp: 10} was filtered, so the next one out is 300
    let second = harness.recv("cloud").expect("second hot reading delivered");
    assert_eq!(second.payload()["temp"], json!(300));

    runtime.shutdown(Duration::from_secs(2));
}

#[test]
fn test_fan_out_to_every_destination() {
    let harness = Harness::new();
    let loaded = ConfigBuilder::new()
        .loopbacks(&["src", "x", "y"])
        .edge(EdgeConfig {
            to: radapter::config::Destinations::Many(vec!["x".into(), "y".into()]),
            ..EdgeConfig::new("src", "x").named("fan")
        })
        .loaded();
    let mut runtime = harness.start(loaded);
    harness.wait_connected(&["src", "x", "y"]);

    harness.inject("src", json!({"level": 3}));
    let x = harness.recv("x").unwrap();
    let y = harness.recv("y").unwrap();
    assert_eq!(x.payload(), y.payload());
    assert_eq!(x.payload()["level"], json!(3));

    runtime.shutdown(Duration::from_secs(2));
}

#[test]
fn test_per_source_ordering() {
    let harness = Harness::new();
    let loaded = ConfigBuilder::new()
        .loopbacks(&["a", "c", "sink"])
        .worker_threads(4)
        .queue_depth(1024)
        .edge(EdgeConfig::new("a", "sink").named("a-sink"))
        .edge(EdgeConfig::new("c", "sink").named("c-sink"))
        .loaded();
    let mut runtime = harness.start(loaded);
    harness.wait_connected(&["a", "c", "sink"]);

    const COUNT: i64 = 200;
    std::thread::scope(|scope| {
        for source in ["a", "c"] {
            let runtime = &runtime;
            scope.spawn(move || {
                for n in 0..COUNT {
                    assert!(runtime.submit(message(source, json!({ "n": n }))));
                }
            });
        }
    });

    let received = harness.recv_n("sink", (COUNT * 2) as usize);
    assert_eq!(received.len(), (COUNT * 2) as usize);
    for source in ["a", "c"] {
        let sequence: Vec<i64> = received
            .iter()
            .filter(|m| m.source().as_str() == source)
            .map(|m| m.payload()["n"].as_i64().unwrap())
            .collect();
        assert_eq!(sequence, (0..COUNT).collect::<Vec<_>>(), "order from {}", source);
    }

    runtime.shutdown(Duration::from_secs(2));
}

#[test]
fn test_inbound_order_through_binding() {
    let harness = Harness::new();
    let loaded = ConfigBuilder::new()
        .loopbacks(&["a", "b"])
        .queue_depth(256)
        .edge(EdgeConfig::new("a", "b").named("ab"))
        .loaded();
    let mut runtime = harness.start(loaded);
    harness.wait_connected(&["a", "b"]);

    for n in 0..50 {
        harness.inject("a", json!({ "n": n }));
    }
    let received: Vec<i64> = harness
        .recv_n("b", 50)
        .iter()
        .map(|m| m.payload()["n"].as_i64().unwrap())
        .collect();
    assert_eq!(received, (0..50).collect::<Vec<_>>());

    assert!(wait_for(|| runtime
        .binding_stats(&BindingId::new("a"))
        .map_or(false, |s| s.received == 50)));
    assert!(wait_for(|| runtime
        .binding_stats(&BindingId::new("b"))
        .map_or(false, |s| s.sent == 50)));

    runtime.shutdown(Duration::from_secs(2));
}

#[test]
fn test_backpressure_drops_oldest() {
    let harness = Harness::refusing(&["slow"]);
    let loaded = ConfigBuilder::new()
        .loopbacks(&["fast", "slow"])
        .queue_depth(4)
        .edge(EdgeConfig::new("fast", "slow").named("to-slow"))
        .loaded();
    let mut runtime = harness.start(loaded);
    let events = runtime.subscribe();
    harness.wait_connected(&["fast"]);

    for n in 0..10 {
        assert!(runtime.submit(message("fast", json!({ "n": n }))));
    }
    let registry = runtime.registry().clone();
    let slow = BindingId::new("slow");
    assert!(wait_for(|| registry.get(&slow).unwrap().queue.dropped() == 6));

    let queue = registry.get(&slow).unwrap().queue.clone();
    assert_eq!(queue.len(), 4);
    let kept: Vec<i64> = queue
        .receiver()
        .try_iter()
        .map(|m| m.payload()["n"].as_i64().unwrap())
        .collect();
    assert_eq!(kept, vec![6, 7, 8, 9]);

    let drops = drain_events(&events)
        .into_iter()
        .filter(|e| matches!(e, RuntimeEvent::BackpressureDrop { binding, .. } if binding == &slow))
        .count();
    assert_eq!(drops, 6);

    runtime.shutdown(Duration::from_millis(100));
}

#[test]
fn test_refused_binding_faults() {
    let harness = Harness::refusing(&["dead"]);
    let loaded = ConfigBuilder::new().loopbacks(&["dead"]).loaded();
    let mut runtime = harness.start(loaded);
    let dead = BindingId::new("dead");
    assert!(wait_for(|| runtime.binding_state(&dead) == Some(ConnectionState::Faulted)));

    harness.peer("dead").refuse_connect(false);
    runtime.reconnect(&dead).unwrap();
    assert!(wait_for(|| runtime.binding_state(&dead) == Some(ConnectionState::Connected)));

    runtime.shutdown(Duration::from_secs(1));
}

#[test]
fn test_removed_edge_drains_in_flight_message() {
    let harness = Harness::new();
    let slow_script = r#"
        let started = timestamp();
        while started.elapsed < 0.3 { }
        msg
    "#;
    let base = || {
        ConfigBuilder::new()
            .loopbacks(&["a", "b"])
            .budget_ms(5000)
            .max_operations(u64::MAX)
    };
    let loaded = base()
        .edge(EdgeConfig::new("a", "b").named("slow").with_script(slow_script))
        .loaded();
    let mut runtime = harness.start(loaded);
    let events = runtime.subscribe();
    harness.wait_connected(&["a", "b"]);

    assert!(runtime.submit(message("a", json!({"v": "in flight"}))));
    let router = runtime.router().clone();
    assert!(wait_for(|| router.in_flight() > 0));

    let report = runtime.reload(base().loaded()).unwrap();
    assert_eq!(report.router.removed, 1);
    assert_eq!(report.router.undrained, 0);
    assert!(runtime.edge_state("slow").is_none());

    let delivered = harness.recv("b").expect("in-flight message delivered");
    assert_eq!(delivered.payload()["v"], json!("in flight"));

    let states: Vec<EdgeState> = drain_events(&events)
        .into_iter()
        .filter_map(|e| match e {
            RuntimeEvent::EdgeState { edge, state } if edge == "slow" => Some(state),
            _ => None,
        })
        .collect();
    assert_eq!(states, vec![EdgeState::Draining, EdgeState::Disabled]);

    // Nothing routes along the removed edge any more
    assert!(runtime.submit(message("a", json!({"v": "late"}))));
    assert!(harness.peer("b").recv_sent(Duration::from_millis(200)).is_none());

    runtime.shutdown(Duration::from_secs(2));
}

#[test]
fn test_budget_overrun_is_reported_and_isolated() {
    let harness = Harness::new();
    let loaded = ConfigBuilder::new()
        .loopbacks(&["a", "b"])
        .budget_ms(20)
        .max_operations(u64::MAX)
        .edge(EdgeConfig::new("a", "b").named("spin").with_script("loop { }"))
        .loaded();
    let mut runtime = harness.start(loaded);
    let events = runtime.subscribe();
    harness.wait_connected(&["a", "b"]);

    let started = std::time::Instant::now();
    assert!(runtime.submit(message("a", json!({}))));
    let mut recorded = Vec::new();
    assert!(wait_for(|| {
        recorded.extend(drain_events(&events));
        recorded
            .iter()
            .any(|e| matches!(e, RuntimeEvent::SandboxError { .. }))
    }));
    assert!(started.elapsed() < Duration::from_secs(2));

    let fault = recorded
        .iter()
        .find_map(|e| match e {
            RuntimeEvent::SandboxError { edge, fault, .. } => Some((edge.clone(), *fault)),
            _ => None,
        })
        .unwrap();
    assert_eq!(fault, ("spin".to_string(), radapter::error::ScriptFault::BudgetExceeded));
    assert_eq!(runtime.edge_state("spin"), Some(EdgeState::Active));

    runtime.shutdown(Duration::from_secs(1));
}

#[test]
fn test_shutdown_delivers_queued_messages() {
    let harness = Harness::new();
    let loaded = ConfigBuilder::new()
        .loopbacks(&["a", "b"])
        .queue_depth(1024)
        .edge(EdgeConfig::new("a", "b").named("ab"))
        .loaded();
    let mut runtime = harness.start(loaded);
    let events = runtime.subscribe();
    harness.wait_connected(&["a", "b"]);

    for n in 0..100 {
        assert!(runtime.submit(message("a", json!({ "n": n }))));
    }
    let report = runtime.shutdown(Duration::from_secs(5));
    assert!(report.routing_drained);
    assert_eq!(report.undelivered, 0);
    assert_eq!(report.bindings_stopped, 2);
    assert_eq!(runtime.state(), RuntimeState::Stopped);
    assert_eq!(harness.peer("b").sent().try_iter().count(), 100);

    // Refused after shutdown
    assert!(!runtime.submit(message("a", json!({}))));

    let recorded = drain_events(&events);
    // Bindings stop in reverse start order
    let disconnected: Vec<String> = recorded
        .iter()
        .filter_map(|e| match e {
            RuntimeEvent::BindingState { binding, state }
                if *state == ConnectionState::Disconnected =>
            {
                Some(binding.to_string())
            }
            _ => None,
        })
        .collect();
    assert_eq!(disconnected, vec!["b".to_string(), "a".to_string()]);
    assert_eq!(
        recorded.last(),
        Some(&RuntimeEvent::RuntimeState {
            state: RuntimeState::Stopped
        })
    );
}
