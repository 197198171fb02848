//! Pipeline configuration loaded from TOML.
//!
//! ```toml
//! name = "ingest"
//! poll_interval_ms = 200
//!
//! [[stages]]
//! name = "prepare"
//! buffer = "queue"
//!
//! [[stages]]
//! name = "index"
//! poll_interval_ms = 50
//! ```

use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

fn default_buffer() -> String {
    "queue".to_string()
}

fn default_poll_interval_ms() -> u64 {
    100
}

/// Settings for a whole pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline name, used for thread names and logs
    #[serde(default)]
    pub name: String,

    /// Poll interval for stages that do not set their own
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Stage settings in chain order
    #[serde(default)]
    pub stages: Vec<StageConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            poll_interval_ms: default_poll_interval_ms(),
            stages: Vec::new(),
        }
    }
}

impl PipelineConfig {
    /// Parse a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| PipelineError::Config(format!("Failed to parse pipeline config: {}", e)))
    }

    /// Load a TOML file from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("Failed to read pipeline config {:?}: {}", path, e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Serialize back to TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| {
            PipelineError::Config(format!("Failed to serialize pipeline config: {}", e))
        })
    }

    /// Pipeline-wide poll interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Stage settings with the pipeline-wide poll interval filled in
    pub fn resolved_stage(&self, index: usize) -> Option<StageConfig> {
        self.stages.get(index).map(|stage| StageConfig {
            poll_interval_ms: stage.poll_interval_ms.or(Some(self.poll_interval_ms)),
            ..stage.clone()
        })
    }
}

/// Settings for a single stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Overrides the stage implementation's own name
    #[serde(default)]
    pub name: Option<String>,

    /// Buffer kind; only `"queue"` is supported
    #[serde(default = "default_buffer")]
    pub buffer: String,

    /// How long `next_data` waits before giving the loop a chance to stop
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            name: None,
            buffer: default_buffer(),
            poll_interval_ms: None,
        }
    }
}

impl StageConfig {
    /// This stage's poll interval, if it sets one
    pub fn poll_interval(&self) -> Option<Duration> {
        self.poll_interval_ms.map(Duration::from_millis)
    }
}
