//! Payload envelope routed between stages.
//!
//! The engine never looks inside a payload. It only moves [`DataRef`] handles
//! from one stage's buffer to the next; the payload type `T` is chosen by the
//! application, usually a closed enum so consumers can match on variants.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared handle to a payload. Released when the last holder drops it.
pub type DataRef<T> = Arc<StageData<T>>;

/// A payload plus the end-of-stream marker for a processing run.
pub struct StageData<T> {
    payload: T,
    is_final: AtomicBool,
}

impl<T> StageData<T> {
    /// Wrap a payload as a shareable, non-final item
    pub fn new(payload: T) -> DataRef<T> {
        Arc::new(Self {
            payload,
            is_final: AtomicBool::new(false),
        })
    }

    /// Wrap a payload as the last item of a run
    pub fn final_item(payload: T) -> DataRef<T> {
        Arc::new(Self {
            payload,
            is_final: AtomicBool::new(true),
        })
    }

    /// Whether this item marks the end of the stream
    pub fn is_final(&self) -> bool {
        self.is_final.load(Ordering::Acquire)
    }

    /// Mark or unmark this item as the end of the stream.
    ///
    /// Visible to every holder of the shared reference.
    pub fn set_final(&self, is_final: bool) {
        self.is_final.store(is_final, Ordering::Release);
    }

    /// Borrow the payload
    pub fn payload(&self) -> &T {
        &self.payload
    }
}

impl<T> Deref for StageData<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.payload
    }
}

impl<T: fmt::Debug> fmt::Debug for StageData<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageData")
            .field("payload", &self.payload)
            .field("is_final", &self.is_final())
            .finish()
    }
}
