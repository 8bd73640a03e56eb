//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;
pub mod mock_helpers;

use radapter::events::EventRecord;
use radapter::RuntimeEvent;
use crossbeam_channel::Receiver;
use std::time::{Duration, Instant};

/// Generous upper bound for anything crossing threads
pub fn test_timeout() -> Duration {
    Duration::from_secs(5)
}

/// Poll `condition` until it holds or the test timeout passes
pub fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + test_timeout();
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    false
}

/// Every event currently buffered in a subscription
pub fn drain_events(events: &Receiver<EventRecord>) -> Vec<RuntimeEvent> {
    events.try_iter().map(|r| r.event).collect()
}

/// Assert two floats are approximately equal
pub fn assert_float_eq(a: f64, b: f64, epsilon: f64) {
    assert!(
        (a - b).abs() < epsilon,
        "Expected {} to be approximately equal to {} (epsilon: {})",
        a,
        b,
        epsilon
    );
}
