use crate::config::ConfigError;
use preafq_engine::EngineError;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    // Session errors
    #[error("Diffusion image '{file_name}' does not start with a 'sub-' subject code (found '{subject}')")]
    InvalidSubjectName { file_name: String, subject: String },

    #[error("Not a file path: {0}")]
    InvalidInputPath(PathBuf),

    // Native computation errors
    #[error("Malformed affine matrix in {source_name}: {reason}")]
    MalformedMatrix { source_name: String, reason: String },

    #[error("Malformed b-vector file {path}: {reason}")]
    MalformedBvec { path: PathBuf, reason: String },

    #[error("Singular transform matrix: {0}")]
    SingularMatrix(String),

    #[error("{vectors} b-vectors but {matrices} transform matrices")]
    CountMismatch { vectors: usize, matrices: usize },

    #[error("Invalid value '{value}' for {name}")]
    InvalidParameter { name: String, value: String },

    // Tool output errors
    #[error("{tool} did not produce expected output {path}")]
    MissingToolOutput { tool: String, path: PathBuf },

    #[error("Unexpected output from {tool}: {reason}")]
    UnexpectedToolOutput { tool: String, reason: String },

    // Post-run errors
    #[error("No output matching {pattern}")]
    OutputNotFound { pattern: String },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<PipelineError> for EngineError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Engine(inner) => inner,
            other => EngineError::handler(other),
        }
    }
}
