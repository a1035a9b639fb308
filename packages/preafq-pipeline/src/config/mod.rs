//! Pipeline configuration
//!
//! Defaults reproduce the standard preAFQ pipeline. A versioned YAML file
//! overrides any subset of them:
//!
//! ```yaml
//! version: 1
//! execution:
//!   max_parallel_nodes: 4
//! tools:
//!   art: /opt/art/bin/rapidart
//! parameters:
//!   anat_subject: freesurfer
//!   art:
//!     norm_threshold: 3
//! ```

pub mod error;
pub mod io;
pub mod preafq_config;
pub mod sections;

// Re-exports
pub use error::{ConfigError, ConfigResult};
pub use io::ConfigFileV1;
pub use preafq_config::PreafqConfig;
pub use sections::{
    ArtConfig, ArtMaskType, ExecutionConfig, FlirtConfig, MotionConfig, ParameterConfig,
    ParameterSource, ToolConfig,
};
