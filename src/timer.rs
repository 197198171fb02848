//! Periodic callback on a background thread.
//!
//! Used by applications to drive polling work next to a pipeline, such as
//! sweeping a table of finished sessions every few hundred milliseconds.

use crate::error::{PipelineError, Result};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Default)]
struct TimerSignal {
    running: Mutex<bool>,
    wake: Condvar,
}

/// Runs a callback on its own thread at a fixed period until stopped
pub struct IntervalTimer {
    period: Duration,
    signal: Arc<TimerSignal>,
    worker: Option<JoinHandle<()>>,
}

impl IntervalTimer {
    /// Create a stopped timer
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            signal: Arc::new(TimerSignal::default()),
            worker: None,
        }
    }

    /// Get the period used by the next `start`
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Change the period. Takes effect on the next `start`.
    pub fn set_period(&mut self, period: Duration) {
        self.period = period;
    }

    /// Check if the timer thread is ticking
    pub fn is_running(&self) -> bool {
        *self.signal.running.lock()
    }

    /// Call `callback` every period until stopped. Restarts if already running.
    pub fn start<F>(&mut self, callback: F) -> Result<()>
    where
        F: FnMut() + Send + 'static,
    {
        self.stop();

        let signal = Arc::new(TimerSignal {
            running: Mutex::new(true),
            wake: Condvar::new(),
        });
        let period = self.period;
        let worker_signal = Arc::clone(&signal);
        let worker = thread::Builder::new()
            .name("interval-timer".to_string())
            .spawn(move || tick_loop(&worker_signal, period, callback))
            .map_err(|e| PipelineError::Pool(format!("failed to spawn interval timer: {e}")))?;

        self.signal = signal;
        self.worker = Some(worker);
        tracing::debug!(period_ms = period.as_millis() as u64, "interval timer started");
        Ok(())
    }

    /// Like [`start`](Self::start) with a new period
    pub fn start_with_period<F>(&mut self, callback: F, period: Duration) -> Result<()>
    where
        F: FnMut() + Send + 'static,
    {
        self.period = period;
        self.start(callback)
    }

    /// Wake the timer thread and wait for it to exit. No further callbacks
    /// run once this returns.
    pub fn stop(&mut self) {
        *self.signal.running.lock() = false;
        self.signal.wake.notify_all();

        let Some(worker) = self.worker.take() else {
            return;
        };
        if worker.thread().id() == thread::current().id() {
            return;
        }
        if worker.join().is_err() {
            tracing::error!("interval timer callback panicked");
        }
    }
}

impl Drop for IntervalTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn tick_loop<F: FnMut()>(signal: &TimerSignal, period: Duration, mut callback: F) {
    let mut running = signal.running.lock();
    loop {
        let deadline = Instant::now() + period;
        while *running {
            if signal.wake.wait_until(&mut running, deadline).timed_out() {
                break;
            }
        }
        if !*running {
            break;
        }
        MutexGuard::unlocked(&mut running, &mut callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_ticks_until_stopped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);
        let mut timer = IntervalTimer::new(Duration::from_millis(10));
        timer
            .start(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        assert!(timer.is_running());

        let deadline = Instant::now() + Duration::from_secs(5);
        while ticks.load(Ordering::Relaxed) < 3 {
            assert!(Instant::now() < deadline, "timer never ticked");
            thread::sleep(Duration::from_millis(5));
        }

        timer.stop();
        assert!(!timer.is_running());
        let after_stop = ticks.load(Ordering::Relaxed);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(ticks.load(Ordering::Relaxed), after_stop);
    }

    #[test]
    fn test_stop_does_not_wait_for_period() {
        let mut timer = IntervalTimer::new(Duration::from_secs(60));
        timer.start(|| {}).unwrap();
        let start = Instant::now();
        timer.stop();
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_restart_with_new_period() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let mut timer = IntervalTimer::new(Duration::from_secs(60));
        timer.start(|| {}).unwrap();

        let counter = Arc::clone(&ticks);
        timer
            .start_with_period(
                move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                },
                Duration::from_millis(5),
            )
            .unwrap();
        assert_eq!(timer.period(), Duration::from_millis(5));

        let deadline = Instant::now() + Duration::from_secs(5);
        while ticks.load(Ordering::Relaxed) == 0 {
            assert!(Instant::now() < deadline, "restarted timer never ticked");
            thread::sleep(Duration::from_millis(5));
        }
    }
}
