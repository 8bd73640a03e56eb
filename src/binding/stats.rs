//! Per-binding traffic statistics

use serde::Serialize;
use std::collections::VecDeque;

/// Size of the rolling window for recent send times
const RECENT_WINDOW_SIZE: usize = 100;

/// Counters and send latency of one binding
///
/// Kept by the binding worker; snapshots are cloned out through the registry.
#[derive(Debug, Clone, Serialize)]
pub struct BindingStats {
    /// Messages written to the transport
    pub sent: u64,
    /// Sends that failed after all retries
    pub send_failures: u64,
    /// Messages read from the transport
    pub received: u64,
    /// Inbound packets dropped because they could not be decoded
    pub decode_failures: u64,
    /// Inbound messages refused by the routing pool
    pub rejected: u64,
    /// Completed reconnect cycles
    pub reconnects: u64,
    /// Total send time in microseconds
    pub total_send_time_us: u64,
    /// Last send time in microseconds
    pub last_send_time_us: u64,
    /// Minimum send time observed (microseconds)
    pub min_send_time_us: u64,
    /// Maximum send time observed (microseconds)
    pub max_send_time_us: u64,
    /// Rolling window of recent send times
    #[serde(skip)]
    pub recent_send_times: VecDeque<u64>,
}

impl Default for BindingStats {
    fn default() -> Self {
        Self {
            sent: 0,
            send_failures: 0,
            received: 0,
            decode_failures: 0,
            rejected: 0,
            reconnects: 0,
            total_send_time_us: 0,
            last_send_time_us: 0,
            min_send_time_us: u64::MAX,
            max_send_time_us: 0,
            recent_send_times: VecDeque::with_capacity(RECENT_WINDOW_SIZE),
        }
    }
}

impl BindingStats {
    /// Average send time in microseconds
    pub fn avg_send_time_us(&self) -> f64 {
        if self.sent == 0 {
            0.0
        } else {
            self.total_send_time_us as f64 / self.sent as f64
        }
    }

    /// Send success rate as percentage
    pub fn success_rate(&self) -> f64 {
        let total = self.sent + self.send_failures;
        if total == 0 {
            100.0
        } else {
            (self.sent as f64 / total as f64) * 100.0
        }
    }

    pub fn record_send(&mut self, time_us: u64) {
        self.sent += 1;
        self.total_send_time_us += time_us;
        self.last_send_time_us = time_us;
        self.min_send_time_us = self.min_send_time_us.min(time_us);
        self.max_send_time_us = self.max_send_time_us.max(time_us);

        self.recent_send_times.push_back(time_us);
        if self.recent_send_times.len() > RECENT_WINDOW_SIZE {
            self.recent_send_times.pop_front();
        }
    }

    pub fn record_send_failure(&mut self) {
        self.send_failures += 1;
    }

    pub fn record_received(&mut self) {
        self.received += 1;
    }

    pub fn record_decode_failure(&mut self) {
        self.decode_failures += 1;
    }

    pub fn record_rejected(&mut self) {
        self.rejected += 1;
    }

    pub fn record_reconnect(&mut self) {
        self.reconnects += 1;
    }

    /// Jitter (max - min) over the recent window in microseconds
    pub fn jitter_us(&self) -> u64 {
        let min = self.recent_send_times.iter().min().copied().unwrap_or(0);
        let max = self.recent_send_times.iter().max().copied().unwrap_or(0);
        max.saturating_sub(min)
    }

    /// Sample standard deviation of recent send times in microseconds
    pub fn stddev_us(&self) -> f64 {
        if self.recent_send_times.len() < 2 {
            return 0.0;
        }
        let n = self.recent_send_times.len() as f64;
        let mean = self.recent_send_times.iter().sum::<u64>() as f64 / n;
        let variance = self
            .recent_send_times
            .iter()
            .map(|&t| (t as f64 - mean).powi(2))
            .sum::<f64>()
            / (n - 1.0);
        variance.sqrt()
    }
}
