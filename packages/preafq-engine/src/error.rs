use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Duplicate node: {0}")]
    DuplicateNode(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Port not found: {node}.{port}")]
    PortNotFound { node: String, port: String },

    #[error("Port type mismatch on {port}: expected {expected}, found {found}")]
    PortTypeMismatch {
        port: String,
        expected: String,
        found: String,
    },

    #[error("Input {node}.{port} is already bound")]
    InputAlreadyBound { node: String, port: String },

    #[error("Required input {node}.{port} is neither connected nor set")]
    UnboundInput { node: String, port: String },

    #[error("Missing input: {0}")]
    MissingInput(String),

    #[error("Missing output {port} from node {node}")]
    MissingOutput { node: String, port: String },

    #[error("Workflow cycle detected at node {0}")]
    CycleDetected(String),

    #[error("No handler registered for node {0}")]
    HandlerNotRegistered(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Failed to spawn {program}: {source}")]
    ToolSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with status {status}: {stderr}")]
    ToolFailed {
        program: String,
        status: i32,
        stderr: String,
    },

    #[error("Node {node} failed: {source}")]
    NodeFailed {
        node: String,
        #[source]
        source: Box<EngineError>,
    },

    #[error("Node {node} timed out after {secs}s")]
    Timeout { node: String, secs: u64 },

    #[error("Node {0} panicked")]
    NodePanicked(String),

    #[error("Handler error: {0}")]
    Handler(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl EngineError {
    pub fn missing_input<S: Into<String>>(port: S) -> Self {
        Self::MissingInput(port.into())
    }

    pub fn handler<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Handler(Box::new(err))
    }

    /// Unwraps `NodeFailed` layers down to the error raised by the node itself.
    pub fn root_cause(&self) -> &EngineError {
        match self {
            EngineError::NodeFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }
}
