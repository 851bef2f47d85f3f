//! Graph Configuration
//!
//! Settings are plain data with defaults for every field, so a partial JSON
//! document is a valid config.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default capacity of each node's change stream buffer.
pub const DEFAULT_STREAM_CAPACITY: usize = 256;

/// Default limit on nested evaluations before a read fails.
pub const DEFAULT_MAX_DEPTH: usize = 512;

/// Configuration for a [`crate::Graph`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Name used in log output.
    pub name: String,

    /// Buffered values per change stream before slow consumers lag.
    pub stream_capacity: usize,

    /// Maximum depth of nested node evaluations on one call stack.
    pub max_depth: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            name: "graph".to_string(),
            stream_capacity: DEFAULT_STREAM_CAPACITY,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl GraphConfig {
    /// Parse a config from JSON and validate it.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the values are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stream_capacity == 0 {
            return Err(ConfigError::Invalid(
                "stream_capacity must be greater than zero".into(),
            ));
        }
        if self.max_depth == 0 {
            return Err(ConfigError::Invalid(
                "max_depth must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
