//! Per-table coordinator latency bookkeeping, backing speculative retry.

use std::collections::HashMap;
use std::sync::Mutex;

use statistical::mean;

use tokio::time::Duration;

/// How many recent samples each table keeps.
const SAMPLE_CAPACITY: usize = 256;

/// Ring of recent latency samples for one table.
#[derive(Debug)]
struct SampleRing {
    samples: Vec<u64>,
    next: usize,
}

impl SampleRing {
    fn record(&mut self, micros: u64) {
        if self.samples.len() < SAMPLE_CAPACITY {
            self.samples.push(micros);
        } else {
            self.samples[self.next] = micros;
            self.next = (self.next + 1) % SAMPLE_CAPACITY;
        }
    }

    fn percentile(&self, pct: f64) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_unstable();
        let rank = ((pct / 100.0) * (sorted.len() - 1) as f64).round() as usize;
        Some(sorted[rank.min(sorted.len() - 1)])
    }
}

/// Tracks recent read latencies per (keyspace, table) and answers
/// percentile queries for the speculative-retry delay.
#[derive(Debug, Default)]
pub struct LatencyTracker {
    rings: Mutex<HashMap<(String, String), SampleRing>>,
}

impl LatencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one coordinator-side latency sample for a table.
    pub fn record(&self, keyspace: &str, table: &str, latency: Duration) {
        let mut rings = self.rings.lock().unwrap();
        rings
            .entry((keyspace.to_string(), table.to_string()))
            .or_insert_with(|| SampleRing {
                samples: Vec::new(),
                next: 0,
            })
            .record(latency.as_micros() as u64);
    }

    /// The given percentile of the table's recent latencies, if any
    /// samples exist.
    pub fn percentile(
        &self,
        keyspace: &str,
        table: &str,
        pct: f64,
    ) -> Option<Duration> {
        let rings = self.rings.lock().unwrap();
        rings
            .get(&(keyspace.to_string(), table.to_string()))
            .and_then(|r| r.percentile(pct))
            .map(Duration::from_micros)
    }

    /// Mean latency across a table's samples, for reporting.
    pub fn mean_micros(&self, keyspace: &str, table: &str) -> Option<f64> {
        let rings = self.rings.lock().unwrap();
        rings
            .get(&(keyspace.to_string(), table.to_string()))
            .filter(|r| !r.samples.is_empty())
            .map(|r| {
                let as_f64: Vec<f64> =
                    r.samples.iter().map(|&s| s as f64).collect();
                mean(&as_f64)
            })
    }
}
