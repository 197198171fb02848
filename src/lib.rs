//! A multi-stage concurrent pipeline engine.
//!
//! Each stage runs its own processing loop on a dedicated worker thread and
//! owns an unbounded FIFO buffer. Finished items travel to the next stage as
//! messages on a pipeline-owned bus, so stages never call each other
//! directly. Individual stages can be paused, resumed and stopped without
//! touching the rest of the chain.
//!
//! # Features
//!
//! - Per-stage unbounded FIFO buffers with timed waits
//! - Message routing by stage identity with an explicit chain topology
//! - Pause/restart control per stage, stop always wins over pause
//! - One worker thread per stage, failures contained per stage
//! - Per-stage counters and TOML configuration
//!
//! # Example
//!
//! ```no_run
//! use stage_pipeline::{PassthroughStage, Pipeline, PipelineStage, StageData};
//!
//! # fn main() -> stage_pipeline::Result<()> {
//! let mut pipeline = Pipeline::<String>::new("ingest");
//! pipeline.add_stage(PipelineStage::new(PassthroughStage))?;
//! pipeline.add_stage(PipelineStage::new(PassthroughStage))?;
//! pipeline.initialise()?;
//! pipeline.start()?;
//!
//! pipeline.inject_data(StageData::final_item("record".to_string()))?;
//!
//! let report = pipeline.stop(true);
//! assert!(report.all_completed());
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod bus;
pub mod config;
pub mod control;
pub mod data;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod pool;
pub mod stage;
pub mod timer;

// Re-exports for convenience
pub use buffer::{BufferKind, QueueBuffer, StageBuffer};
pub use bus::{
    BusMessage, ControlCommand, ControlMessage, DataAvailableMessage, MessageBus, StageId,
    Subscriber, Subscription,
};
pub use config::{PipelineConfig, StageConfig};
pub use control::{PauseExit, PauseState};
pub use data::{DataRef, StageData};
pub use error::{PipelineError, Result};
pub use logging::init_logging;
pub use metrics::{MetricsSnapshot, StageMetrics};
pub use pipeline::{Pipeline, StopReport};
pub use pool::{TaskHandle, WorkerPool};
pub use stage::{
    FilterStage, MapStage, PassthroughStage, PipelineStage, Stage, StageContext, StageStatus,
    DEFAULT_POLL_INTERVAL,
};
pub use timer::IntervalTimer;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
