//! Stop and pause state for a single stage.
//!
//! Both axes live behind one mutex and one condition variable, so a stop
//! request can never slip past a thread that is about to wait for a restart.
//!
//! ```text
//! PauseEnd --Pause--> Requested --enter_pause()--> Paused --Restart--> PauseEnd
//!                         |                                    ^
//!                         +--------------Restart---------------+
//! ```
//!
//! The stop flag is independent of the pause cycle: it starts clear, is set
//! once and wakes any thread parked in [`StageControl::enter_pause`].

use parking_lot::{Condvar, Mutex};

/// Where a stage is in its pause cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PauseState {
    /// A pause was requested but the run loop has not parked yet
    Requested,
    /// The run loop is parked in `enter_pause`
    Paused,
    /// Running normally
    #[default]
    PauseEnd,
}

/// Why `enter_pause` returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseExit {
    /// No pause was pending, nothing happened
    NotRequested,
    /// Parked, then woken by a restart
    Resumed,
    /// Woken (or never parked) because the stage is stopping
    Stopped,
}

#[derive(Debug, Default)]
struct ControlState {
    stop: bool,
    pause: PauseState,
}

/// Stop flag and pause cycle of one stage
#[derive(Debug, Default)]
pub struct StageControl {
    state: Mutex<ControlState>,
    wake: Condvar,
}

impl StageControl {
    /// Running, with no pause pending
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if the stop flag is set
    pub fn should_stop(&self) -> bool {
        self.state.lock().stop
    }

    /// Set the stop flag and release any parked run loop.
    ///
    /// Returns `true` only for the call that actually set the flag.
    pub fn stop(&self) -> bool {
        let first = {
            let mut state = self.state.lock();
            !std::mem::replace(&mut state.stop, true)
        };
        self.wake.notify_all();
        first
    }

    /// Get the current pause state
    pub fn pause_state(&self) -> PauseState {
        self.state.lock().pause
    }

    /// Check if a pause is waiting to be entered
    pub fn is_pause_requested(&self) -> bool {
        self.state.lock().pause == PauseState::Requested
    }

    /// Ask the run loop to park. Ignored unless the stage is running normally.
    pub fn request_pause(&self) -> bool {
        let mut state = self.state.lock();
        if state.pause == PauseState::PauseEnd {
            state.pause = PauseState::Requested;
            true
        } else {
            false
        }
    }

    /// Cancel a pending pause or wake a parked run loop
    pub fn restart(&self) -> bool {
        let changed = {
            let mut state = self.state.lock();
            let changed = state.pause != PauseState::PauseEnd;
            state.pause = PauseState::PauseEnd;
            changed
        };
        if changed {
            self.wake.notify_all();
        }
        changed
    }

    /// Park the calling thread if a pause is pending.
    ///
    /// Blocks until a restart or a stop; there is no timeout.
    pub fn enter_pause(&self) -> PauseExit {
        let mut state = self.state.lock();
        if state.stop {
            return PauseExit::Stopped;
        }
        if state.pause != PauseState::Requested {
            return PauseExit::NotRequested;
        }

        state.pause = PauseState::Paused;
        while state.pause == PauseState::Paused && !state.stop {
            self.wake.wait(&mut state);
        }

        if state.stop {
            PauseExit::Stopped
        } else {
            PauseExit::Resumed
        }
    }
}
