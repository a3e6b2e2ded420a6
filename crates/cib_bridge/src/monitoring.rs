//! Monitoring counters and the published info record
//!
//! ## Design
//! - Lock-free word-sized atomics for every counter; readers may
//!   observe any consistent point and are not ordered with respect to
//!   each other.
//! - Single writer per counter: the receiver thread owns the data-plane
//!   counters, the lifecycle thread owns the control counters.
//! - The bounded window of per-packet word counts is the only shared
//!   structure behind a mutex; contention is at trigger rate.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

/// Cap on the sliding window of per-packet word counts.
const BUFFER_WINDOW_CAP: usize = 1000;

/// Shared counters of one bridge instance.
#[derive(Debug, Default)]
pub struct BridgeStats {
    pub num_control_messages_sent: AtomicU64,
    pub num_control_responses_received: AtomicU64,
    /// Lifetime trigger count, monotone across runs.
    pub num_total_triggers: AtomicU64,
    /// Per-run trigger count, reset on every stop.
    pub run_trigger_counter: AtomicU64,
    pub last_readout_timestamp: AtomicU64,
    pub sent_events: AtomicU64,
    pub failed_to_send_events: AtomicU64,
    pub last_sent_timestamp: AtomicU64,
    pub is_running: AtomicBool,
    pub is_configured: AtomicBool,
    buffer_counts: Mutex<VecDeque<u32>>,
}

impl BridgeStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push one packet's word count, evicting the oldest entry past the
    /// cap.
    pub fn push_buffer_count(&self, count: u32) {
        let mut counts = self
            .buffer_counts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if counts.len() >= BUFFER_WINDOW_CAP {
            counts.pop_front();
        }
        counts.push_back(count);
    }

    /// Arithmetic mean of the window; 0.0 when empty.
    pub fn average_buffer_counts(&self) -> f64 {
        let counts = self
            .buffer_counts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if counts.is_empty() {
            return 0.0;
        }
        let total: u64 = counts.iter().map(|&c| u64::from(c)).sum();
        total as f64 / counts.len() as f64
    }

    /// Snapshot everything for the host's info collector.
    pub fn snapshot(&self) -> CibBridgeInfo {
        CibBridgeInfo {
            num_control_messages_sent: self.num_control_messages_sent.load(Ordering::Relaxed),
            num_control_responses_received: self
                .num_control_responses_received
                .load(Ordering::Relaxed),
            num_total_triggers: self.num_total_triggers.load(Ordering::Relaxed),
            run_trigger_counter: self.run_trigger_counter.load(Ordering::Relaxed),
            last_readout_timestamp: self.last_readout_timestamp.load(Ordering::Relaxed),
            sent_events: self.sent_events.load(Ordering::Relaxed),
            failed_to_send_events: self.failed_to_send_events.load(Ordering::Relaxed),
            last_sent_timestamp: self.last_sent_timestamp.load(Ordering::Relaxed),
            is_running: self.is_running.load(Ordering::SeqCst),
            is_configured: self.is_configured.load(Ordering::SeqCst),
            average_buffer_occupancy: self.average_buffer_counts(),
        }
    }
}

/// Published monitoring record.
#[derive(Debug, Clone, Serialize)]
pub struct CibBridgeInfo {
    pub num_control_messages_sent: u64,
    pub num_control_responses_received: u64,
    pub num_total_triggers: u64,
    pub run_trigger_counter: u64,
    pub last_readout_timestamp: u64,
    pub sent_events: u64,
    pub failed_to_send_events: u64,
    pub last_sent_timestamp: u64,
    pub is_running: bool,
    pub is_configured: bool,
    pub average_buffer_occupancy: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_mean() {
        let stats = BridgeStats::new();
        assert_eq!(stats.average_buffer_counts(), 0.0);
        stats.push_buffer_count(1);
        stats.push_buffer_count(2);
        stats.push_buffer_count(3);
        assert!((stats.average_buffer_counts() - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_window_is_bounded() {
        let stats = BridgeStats::new();
        for _ in 0..BUFFER_WINDOW_CAP {
            stats.push_buffer_count(1);
        }
        // the next push evicts a 1 and the mean moves toward 1001
        stats.push_buffer_count(1001);
        let mean = stats.average_buffer_counts();
        assert!(mean > 1.0);
        assert_eq!(
            stats.buffer_counts.lock().unwrap().len(),
            BUFFER_WINDOW_CAP
        );
    }

    #[test]
    fn test_snapshot_reads_counters() {
        let stats = BridgeStats::new();
        stats.num_total_triggers.store(7, Ordering::Relaxed);
        stats.run_trigger_counter.store(3, Ordering::Relaxed);
        stats.is_configured.store(true, Ordering::SeqCst);
        let info = stats.snapshot();
        assert_eq!(info.num_total_triggers, 7);
        assert_eq!(info.run_trigger_counter, 3);
        assert!(info.is_configured);
        assert!(!info.is_running);
    }
}
