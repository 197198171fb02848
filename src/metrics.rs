use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-stage counters
#[derive(Debug, Clone)]
pub struct StageMetrics {
    /// Items pushed into the stage's buffer
    received: Arc<AtomicU64>,
    /// Items handed on with `data_complete`
    completed: Arc<AtomicU64>,
    /// Completed items with no stage to go to
    unroutable: Arc<AtomicU64>,
    /// Times the run loop parked for a pause
    pauses: Arc<AtomicU64>,
    /// Throughput is measured from here
    start_time: Instant,
}

impl StageMetrics {
    /// All counters start at zero
    pub fn new() -> Self {
        Self {
            received: Arc::new(AtomicU64::new(0)),
            completed: Arc::new(AtomicU64::new(0)),
            unroutable: Arc::new(AtomicU64::new(0)),
            pauses: Arc::new(AtomicU64::new(0)),
            start_time: Instant::now(),
        }
    }

    /// Record an item pushed into the buffer
    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an item handed on by the run loop
    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed item that had nowhere to go
    pub fn record_unroutable(&self) {
        self.unroutable.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one pause of the run loop
    pub fn record_pause(&self) {
        self.pauses.fetch_add(1, Ordering::Relaxed);
    }

    /// Get total items received
    pub fn total_received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Get total items completed
    pub fn total_completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Get total items dropped for lack of a successor
    pub fn total_unroutable(&self) -> u64 {
        self.unroutable.load(Ordering::Relaxed)
    }

    /// Get how many times the stage has paused
    pub fn total_pauses(&self) -> u64 {
        self.pauses.load(Ordering::Relaxed)
    }

    /// Completed items per second since creation
    pub fn throughput_mps(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            0.0
        } else {
            self.total_completed() as f64 / elapsed
        }
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            received: self.total_received(),
            completed: self.total_completed(),
            unroutable: self.total_unroutable(),
            pauses: self.total_pauses(),
            throughput_mps: self.throughput_mps(),
            elapsed: self.start_time.elapsed(),
        }
    }
}

impl Default for StageMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Counter values read by [`StageMetrics::snapshot`]
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Items pushed into the buffer
    pub received: u64,
    /// Items handed on with `data_complete`
    pub completed: u64,
    /// Completed items with no stage to go to
    pub unroutable: u64,
    /// Times the run loop parked for a pause
    pub pauses: u64,
    /// Completed items per second
    pub throughput_mps: f64,
    /// Time since the metrics were created
    pub elapsed: Duration,
}

impl MetricsSnapshot {
    /// One-line summary for logs and demos
    pub fn format(&self) -> String {
        format!(
            "Received: {}, Completed: {}, Unroutable: {}, Pauses: {}, \
             Throughput: {:.2} msg/s, Elapsed: {:.2}s",
            self.received,
            self.completed,
            self.unroutable,
            self.pauses,
            self.throughput_mps,
            self.elapsed.as_secs_f64()
        )
    }
}
