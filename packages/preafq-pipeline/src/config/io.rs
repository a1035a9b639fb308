//! Configuration I/O (YAML loading)
//!
//! Defines the YAML schema types. Loading and conversion live in
//! preafq_config.rs.

use super::sections::{ExecutionConfig, ParameterConfig, ToolConfig};
use serde::{Deserialize, Serialize};

/// YAML Schema v1
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFileV1 {
    /// Schema version (always 1 for v1); optional here so a missing
    /// version gets a dedicated error
    #[serde(default)]
    pub version: Option<u32>,

    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub tools: ToolConfig,

    #[serde(default)]
    pub parameters: ParameterConfig,
}
