use thiserror::Error;

/// Result type for stage pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors that can occur while configuring or running a pipeline
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Pipeline has no registered stages
    #[error("Cannot initialise pipeline with no stages")]
    NoStages,

    /// `initialise` was called twice, or a stage was added after it
    #[error("Pipeline has already been initialised")]
    AlreadyInitialised,

    /// `start` was called before `initialise`
    #[error("Pipeline has not been initialised")]
    NotInitialised,

    /// Pipeline has already been started
    #[error("Pipeline has already been started")]
    AlreadyStarted,

    /// Every stage identity is already in use
    #[error("Pipeline has run out of stage identities")]
    TooManyStages,

    /// Stage buffer kind is not supported
    #[error("Unsupported stage buffer kind: {0}")]
    UnsupportedBuffer(String),

    /// Worker pool cannot host one task per stage
    #[error("Worker pool has {slots} slots but the pipeline has {stages} stages")]
    PoolTooSmall { slots: usize, stages: usize },

    /// Worker pool creation or submission failed
    #[error("Worker pool error: {0}")]
    Pool(String),

    /// A queued task was cleared or its worker panicked before completing
    #[error("Task was cancelled before completion")]
    TaskCancelled,

    /// Stage execution error, raised by user `run` bodies
    #[error("Stage execution failed: {0}")]
    Stage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
