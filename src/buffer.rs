use crate::error::PipelineError;
use crossbeam::channel::{unbounded, Receiver, Sender};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Kinds of stage buffer the engine can build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum BufferKind {
    /// Unbounded FIFO queue
    #[default]
    Queue,
}

impl FromStr for BufferKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queue" => Ok(BufferKind::Queue),
            _ => Err(PipelineError::UnsupportedBuffer(s.to_string())),
        }
    }
}

impl fmt::Display for BufferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferKind::Queue => f.write_str("queue"),
        }
    }
}

/// FIFO mailbox owned by a single stage.
///
/// Implementations must be thread safe: any number of producers may push
/// while the owning stage's run loop pops.
pub trait StageBuffer<T>: Send + Sync {
    /// Enqueue an item. Never blocks.
    fn push(&self, item: T);

    /// Take the oldest item, waiting up to `timeout` for one to arrive
    fn pop(&self, timeout: Duration) -> Option<T>;

    /// Number of items currently buffered
    fn len(&self) -> usize;

    /// Check whether anything is waiting to be consumed
    fn has_data(&self) -> bool {
        self.len() > 0
    }

    /// Check if the buffer is empty
    fn is_empty(&self) -> bool {
        !self.has_data()
    }
}

/// Build a buffer of the requested kind
pub fn new_buffer<T: Send + 'static>(kind: BufferKind) -> Box<dyn StageBuffer<T>> {
    match kind {
        BufferKind::Queue => Box::new(QueueBuffer::new()),
    }
}

/// Unbounded queue backed by crossbeam's MPMC channel
#[derive(Debug)]
pub struct QueueBuffer<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> QueueBuffer<T> {
    /// Create an empty queue
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }
}

impl<T> Default for QueueBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> StageBuffer<T> for QueueBuffer<T> {
    fn push(&self, item: T) {
        // Both ends live in `self`, so the channel cannot be disconnected here.
        let _ = self.tx.send(item);
    }

    fn pop(&self, timeout: Duration) -> Option<T> {
        self.rx.recv_timeout(timeout).ok()
    }

    fn len(&self) -> usize {
        self.rx.len()
    }

    fn has_data(&self) -> bool {
        !self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn test_buffer_push_pop() {
        let buffer = QueueBuffer::new();
        buffer.push(42);
        assert!(buffer.has_data());
        assert_eq!(buffer.pop(Duration::from_millis(10)), Some(42));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_pop_times_out_on_empty() {
        let buffer: QueueBuffer<u32> = QueueBuffer::new();
        let start = Instant::now();
        assert_eq!(buffer.pop(Duration::from_millis(50)), None);
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[test]
    fn test_pop_wakes_on_push() {
        let buffer = Arc::new(QueueBuffer::new());
        let producer = Arc::clone(&buffer);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.push("late");
        });

        let start = Instant::now();
        assert_eq!(buffer.pop(Duration::from_secs(5)), Some("late"));
        assert!(start.elapsed() < Duration::from_secs(5));
        handle.join().unwrap();
    }

    #[test]
    fn test_size_queries() {
        let buffer = QueueBuffer::new();
        for i in 0..5 {
            buffer.push(i);
        }
        assert_eq!(buffer.len(), 5);
        let _ = buffer.pop(Duration::ZERO);
        assert_eq!(buffer.len(), 4);
    }

    #[test]
    fn test_buffer_kind_parse() {
        assert_eq!("queue".parse::<BufferKind>().unwrap(), BufferKind::Queue);
        assert_eq!(" Queue ".parse::<BufferKind>().unwrap(), BufferKind::Queue);
        assert!(matches!(
            "ring".parse::<BufferKind>(),
            Err(PipelineError::UnsupportedBuffer(kind)) if kind == "ring"
        ));
    }

    proptest! {
        #[test]
        fn prop_single_producer_fifo(items in proptest::collection::vec(any::<u64>(), 0..200)) {
            let buffer = new_buffer::<u64>(BufferKind::Queue);
            for item in &items {
                buffer.push(*item);
            }
            let popped: Vec<u64> = (0..items.len())
                .filter_map(|_| buffer.pop(Duration::ZERO))
                .collect();
            prop_assert_eq!(popped, items);
            prop_assert!(buffer.is_empty());
        }
    }
}
