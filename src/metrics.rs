use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::observe::Observer;

/// A simple percentile tracker that maintains a sliding window of measurements
#[derive(Debug, Clone)]
pub struct PercentileTracker {
    measurements: VecDeque<u64>,
    window_size: usize,
}

impl PercentileTracker {
    /// Create a new percentile tracker with a specified window size
    pub fn new(window_size: usize) -> Self {
        Self {
            measurements: VecDeque::with_capacity(window_size),
            window_size,
        }
    }

    /// Record a measurement (in nanoseconds)
    pub fn record(&mut self, nanos: u64) {
        if self.measurements.len() >= self.window_size {
            self.measurements.pop_front();
        }
        self.measurements.push_back(nanos);
    }

    /// Median in microseconds
    pub fn p50_us(&self) -> f64 {
        self.percentile(0.50)
    }

    pub fn p99_us(&self) -> f64 {
        self.percentile(0.99)
    }

    fn percentile(&self, p: f64) -> f64 {
        if self.measurements.is_empty() {
            return 0.0;
        }

        let mut sorted: Vec<_> = self.measurements.iter().copied().collect();
        sorted.sort_unstable();

        let idx = ((sorted.len() as f64 * p).ceil() as usize).saturating_sub(1);
        sorted[idx] as f64 / 1000.0
    }

    /// Number of measurements currently in the window
    pub fn count(&self) -> usize {
        self.measurements.len()
    }
}

const TIMING_WINDOW: usize = 1000;
const LOG_CAPACITY: usize = 256;

/// In-memory [`Observer`] keeping named counters, timing windows and the most
/// recent log lines.
///
/// Counters are created on first use; later increments only take the map lock
/// for reading the shared atomic.
#[derive(Debug)]
pub struct MetricsRecorder {
    counters: RwLock<HashMap<String, Arc<AtomicU64>>>,
    timings: Mutex<HashMap<String, PercentileTracker>>,
    logs: Mutex<VecDeque<String>>,
    start_time: Instant,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(HashMap::new()),
            timings: Mutex::new(HashMap::new()),
            logs: Mutex::new(VecDeque::with_capacity(LOG_CAPACITY)),
            start_time: Instant::now(),
        }
    }

    /// Current value of a counter (0 if never incremented)
    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .read()
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Number of timings currently held for `name`
    pub fn timing_count(&self, name: &str) -> usize {
        self.timings.lock().get(name).map(|t| t.count()).unwrap_or(0)
    }

    pub fn log_lines(&self) -> Vec<String> {
        self.logs.lock().iter().cloned().collect()
    }

    /// Get a snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = self
            .counters
            .read()
            .iter()
            .map(|(name, c)| (name.clone(), c.load(Ordering::Relaxed)))
            .collect();
        let timings = self
            .timings
            .lock()
            .iter()
            .map(|(name, t)| {
                let summary = TimingSummary {
                    count: t.count(),
                    p50_us: t.p50_us(),
                    p99_us: t.p99_us(),
                };
                (name.clone(), summary)
            })
            .collect();

        MetricsSnapshot {
            counters,
            timings,
            elapsed: self.start_time.elapsed(),
        }
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl Observer for MetricsRecorder {
    fn record_counter(&self, name: &str) {
        if let Some(counter) = self.counters.read().get(name) {
            counter.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.counters
            .write()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .fetch_add(1, Ordering::Relaxed);
    }

    fn record_timing(&self, name: &str, duration: Duration) {
        let mut timings = self.timings.lock();
        timings
            .entry(name.to_string())
            .or_insert_with(|| PercentileTracker::new(TIMING_WINDOW))
            .record(duration.as_nanos() as u64);
    }

    fn log(&self, message: &str) {
        let mut logs = self.logs.lock();
        if logs.len() >= LOG_CAPACITY {
            logs.pop_front();
        }
        logs.push_back(message.to_string());
    }
}

/// Latency summary of one timer
#[derive(Debug, Clone, PartialEq)]
pub struct TimingSummary {
    pub count: usize,
    pub p50_us: f64,
    pub p99_us: f64,
}

/// A snapshot of metrics at a point in time
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<String, u64>,
    pub timings: BTreeMap<String, TimingSummary>,
    pub elapsed: Duration,
}

impl MetricsSnapshot {
    /// Format metrics as a human-readable multi-line string
    pub fn format(&self) -> String {
        let mut out = format!("Metrics after {:.2}s:\n", self.elapsed.as_secs_f64());
        for (name, value) in &self.counters {
            out.push_str(&format!("  {}: {}\n", name, value));
        }
        for (name, t) in &self.timings {
            out.push_str(&format!(
                "  {}: n={}, P50: {:.2}µs, P99: {:.2}µs\n",
                name, t.count, t.p50_us, t.p99_us
            ));
        }
        out
    }
}
