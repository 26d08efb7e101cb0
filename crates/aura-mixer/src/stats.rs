//! Stats reporting
//!
//! Aggregates loop, phase, and per-slave counters into a structured record
//! roughly once a second and hands it to the telemetry sink. Per-node stats
//! use try-lock: a contended client record is simply skipped that cycle.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};

use crate::SlaveStats;

/// Destination for published stats records.
pub trait StatsSink: Send + Sync {
    fn publish(&self, record: Value);
}

/// Logs each record at debug level.
pub struct LogStatsSink;

impl StatsSink for LogStatsSink {
    fn publish(&self, record: Value) {
        tracing::debug!(target: "aura_stats", %record, "stats");
    }
}

/// Collects records for tests.
pub struct CaptureStatsSink {
    records: Mutex<Vec<Value>>,
}

impl CaptureStatsSink {
    pub fn new() -> Self {
        CaptureStatsSink {
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn take(&self) -> Vec<Value> {
        std::mem::take(&mut self.records.lock())
    }
}

impl Default for CaptureStatsSink {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsSink for CaptureStatsSink {
    fn publish(&self, record: Value) {
        self.records.lock().push(record);
    }
}

/// Loop-thread accumulators between stats ticks.
///
/// The receive thread bumps `process_events_us`; everything else belongs
/// to the loop thread, so plain relaxed atomics are enough.
#[derive(Default)]
pub struct LoopCounters {
    pub frames: AtomicU64,
    pub drain_us: AtomicU64,
    pub display_name_us: AtomicU64,
    pub snapshot_us: AtomicU64,
    pub broadcast_us: AtomicU64,
    pub send_stats_us: AtomicU64,
    pub process_events_us: AtomicU64,
    pub listeners: AtomicU64,
    pub identity_packets: AtomicU64,
}

impl LoopCounters {
    pub fn add(&self, counter: &AtomicU64, amount: u64) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }

    /// Read and reset every counter; returns (frames, snapshot of sums).
    pub fn drain(&self) -> LoopSnapshot {
        LoopSnapshot {
            frames: self.frames.swap(0, Ordering::Relaxed),
            drain_us: self.drain_us.swap(0, Ordering::Relaxed),
            display_name_us: self.display_name_us.swap(0, Ordering::Relaxed),
            snapshot_us: self.snapshot_us.swap(0, Ordering::Relaxed),
            broadcast_us: self.broadcast_us.swap(0, Ordering::Relaxed),
            send_stats_us: self.send_stats_us.swap(0, Ordering::Relaxed),
            process_events_us: self.process_events_us.swap(0, Ordering::Relaxed),
            listeners: self.listeners.swap(0, Ordering::Relaxed),
            identity_packets: self.identity_packets.swap(0, Ordering::Relaxed),
        }
    }
}

/// One interval's worth of loop counters.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct LoopSnapshot {
    pub frames: u64,
    pub drain_us: u64,
    pub display_name_us: u64,
    pub snapshot_us: u64,
    pub broadcast_us: u64,
    pub send_stats_us: u64,
    pub process_events_us: u64,
    pub listeners: u64,
    pub identity_packets: u64,
}

fn per_frame(total: u64, frames: u64) -> f64 {
    if frames == 0 {
        0.0
    } else {
        total as f64 / frames as f64
    }
}

/// Build the published record from one interval's counters.
pub fn build_stats_record(
    loop_rate: f64,
    threads: usize,
    trailing_mix_ratio: f32,
    throttling_ratio: f32,
    snapshot: LoopSnapshot,
    slaves: SlaveStats,
    avatars: Value,
) -> Value {
    let frames = snapshot.frames;
    let broadcast_frames = slaves.nodes_broadcast.max(1) as f64;

    json!({
        "broadcast_loop_rate": loop_rate,
        "threads": threads,
        "trailing_mix_ratio": trailing_mix_ratio,
        "throttling_ratio": throttling_ratio,
        "average_listeners_last_second": per_frame(snapshot.listeners, frames),
        "single_core_tasks": {
            "process_events_us": per_frame(snapshot.process_events_us, frames),
            "display_name_management_us": per_frame(snapshot.display_name_us, frames),
            "candidate_snapshot_us": per_frame(snapshot.snapshot_us, frames),
            "send_stats_us": snapshot.send_stats_us as f64,
        },
        "parallel_tasks": {
            "process_queued_packets_us": per_frame(snapshot.drain_us, frames),
            "broadcast_avatar_data_us": per_frame(snapshot.broadcast_us, frames),
        },
        "slaves_aggregate_per_frame": {
            "received_nodes_processed": per_frame(slaves.nodes_processed, frames),
            "received_packets_processed": per_frame(slaves.packets_processed, frames),
            "received_malformed_packets": slaves.malformed_packets,
            "sent_nodes_broadcasted_to": per_frame(slaves.nodes_broadcast, frames),
            "sent_average_others_included": slaves.others_included as f64 / broadcast_frames,
            "sent_average_over_budget_avatars": slaves.over_budget as f64 / broadcast_frames,
            "sent_average_data_bytes": per_frame(slaves.data_bytes, frames),
            "sent_average_traits_bytes": per_frame(slaves.traits_bytes, frames),
            "sent_average_identity_bytes": per_frame(slaves.identity_bytes, frames),
            "timing_process_incoming_us": per_frame(slaves.drain_elapsed_us, frames),
            "timing_broadcast_us": per_frame(slaves.broadcast_elapsed_us, frames),
        },
        "z_avatars": avatars,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_drain_and_reset() {
        let counters = LoopCounters::default();
        counters.add(&counters.frames, 45);
        counters.add(&counters.drain_us, 900);

        let snapshot = counters.drain();
        assert_eq!(snapshot.frames, 45);
        assert_eq!(snapshot.drain_us, 900);

        let empty = counters.drain();
        assert_eq!(empty.frames, 0);
    }

    #[test]
    fn test_record_contains_required_fields() {
        let record = build_stats_record(
            44.8,
            4,
            0.3,
            0.0,
            LoopSnapshot {
                frames: 45,
                ..Default::default()
            },
            SlaveStats::default(),
            json!({}),
        );
        assert_eq!(record["broadcast_loop_rate"], 44.8);
        assert_eq!(record["threads"], 4);
        assert!(record["slaves_aggregate_per_frame"].is_object());
        assert!(record["z_avatars"].is_object());
    }

    #[test]
    fn test_per_frame_handles_zero_frames() {
        let record = build_stats_record(
            0.0,
            1,
            0.0,
            0.0,
            LoopSnapshot::default(),
            SlaveStats::default(),
            json!({}),
        );
        assert_eq!(record["parallel_tasks"]["process_queued_packets_us"], 0.0);
    }
}
