use crate::dag::{PortType, PortValue};
use crate::error::{EngineError, Result};
use crate::process::{ToolCommand, ToolOutput, ToolRunner};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

/// Context passed to node handlers
#[derive(Clone)]
pub struct NodeContext {
    pub run_id: Uuid,
    pub workflow: String,
    pub node: String,
    /// Node-private working directory (created before `execute`)
    pub work_dir: PathBuf,
    pub runner: Arc<dyn ToolRunner>,
    /// Upper bound for handlers that fan out over their inputs
    pub max_parallel: usize,
}

impl NodeContext {
    /// Run an external tool inside the node's working directory
    pub async fn run_tool(&self, mut command: ToolCommand) -> Result<ToolOutput> {
        if command.cwd.is_none() {
            command.cwd = Some(self.work_dir.clone());
        }
        self.runner.run(&command).await
    }

    /// Path of a file inside the node's working directory
    pub fn output_path(&self, file_name: impl AsRef<Path>) -> PathBuf {
        self.work_dir.join(file_name)
    }
}

/// Values bound to a node's input ports
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeInputs {
    values: BTreeMap<String, PortValue>,
}

impl NodeInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, port: impl Into<String>, value: PortValue) {
        self.values.insert(port.into(), value);
    }

    pub fn with(mut self, port: impl Into<String>, value: PortValue) -> Self {
        self.insert(port, value);
        self
    }

    pub fn get(&self, port: &str) -> Option<&PortValue> {
        self.values.get(port)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &PortValue)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn require(&self, port: &str) -> Result<&PortValue> {
        self.values
            .get(port)
            .ok_or_else(|| EngineError::missing_input(port))
    }

    fn mismatch(port: &str, expected: PortType, found: &PortValue) -> EngineError {
        EngineError::PortTypeMismatch {
            port: port.to_string(),
            expected: expected.to_string(),
            found: found.port_type().to_string(),
        }
    }

    pub fn file(&self, port: &str) -> Result<&Path> {
        match self.require(port)? {
            PortValue::File(path) => Ok(path),
            other => Err(Self::mismatch(port, PortType::File, other)),
        }
    }

    pub fn files(&self, port: &str) -> Result<&[PathBuf]> {
        match self.require(port)? {
            PortValue::FileList(paths) => Ok(paths),
            PortValue::File(path) => Ok(std::slice::from_ref(path)),
            other => Err(Self::mismatch(port, PortType::FileList, other)),
        }
    }

    pub fn float(&self, port: &str) -> Result<f64> {
        match self.require(port)? {
            PortValue::Float(v) => Ok(*v),
            PortValue::Integer(v) => Ok(*v as f64),
            other => Err(Self::mismatch(port, PortType::Float, other)),
        }
    }

    pub fn integer(&self, port: &str) -> Result<i64> {
        match self.require(port)? {
            PortValue::Integer(v) => Ok(*v),
            other => Err(Self::mismatch(port, PortType::Integer, other)),
        }
    }

    pub fn text(&self, port: &str) -> Result<&str> {
        match self.require(port)? {
            PortValue::Text(v) => Ok(v),
            other => Err(Self::mismatch(port, PortType::Text, other)),
        }
    }
}

/// Values produced on a node's output ports
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeOutputs {
    values: BTreeMap<String, PortValue>,
}

impl NodeOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, port: impl Into<String>, value: PortValue) -> Self {
        self.values.insert(port.into(), value);
        self
    }

    pub fn with_file(self, port: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.with(port, PortValue::File(path.into()))
    }

    pub fn with_files(self, port: impl Into<String>, paths: Vec<PathBuf>) -> Self {
        self.with(port, PortValue::FileList(paths))
    }

    pub fn get(&self, port: &str) -> Option<&PortValue> {
        self.values.get(port)
    }

    pub fn into_map(self) -> BTreeMap<String, PortValue> {
        self.values
    }

    pub fn from_map(values: BTreeMap<String, PortValue>) -> Self {
        Self { values }
    }
}

/// Node handler trait (one implementation per kind of external tool)
#[async_trait]
pub trait NodeHandler: Send + Sync {
    /// Run the node
    async fn execute(&self, inputs: NodeInputs, ctx: &NodeContext) -> Result<NodeOutputs>;

    /// Fixed parameters, folded into the cache key
    fn fingerprint(&self) -> String {
        String::new()
    }

    /// May a previous result be reused when inputs are unchanged?
    fn cacheable(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::SystemRunner;

    struct EchoHandler;

    #[async_trait]
    impl NodeHandler for EchoHandler {
        async fn execute(&self, inputs: NodeInputs, ctx: &NodeContext) -> Result<NodeOutputs> {
            let input = inputs.file("in_file")?;
            let out_file = ctx.output_path(input.file_name().unwrap());
            Ok(NodeOutputs::new().with_file("out_file", out_file))
        }
    }

    fn test_context(dir: &Path) -> NodeContext {
        NodeContext {
            run_id: Uuid::new_v4(),
            workflow: "wf".to_string(),
            node: "echo".to_string(),
            work_dir: dir.to_path_buf(),
            runner: Arc::new(SystemRunner::new()),
            max_parallel: 1,
        }
    }

    #[test]
    fn test_inputs_typed_access() {
        let inputs = NodeInputs::new()
            .with("in_file", PortValue::File("dwi.nii.gz".into()))
            .with("ref_num", PortValue::Integer(0))
            .with("scale", PortValue::Integer(1000));

        assert_eq!(inputs.file("in_file").unwrap(), Path::new("dwi.nii.gz"));
        assert_eq!(inputs.integer("ref_num").unwrap(), 0);
        assert_eq!(inputs.float("scale").unwrap(), 1000.0);
        assert_eq!(inputs.files("in_file").unwrap().len(), 1);
    }

    #[test]
    fn test_inputs_missing_and_mismatch() {
        let inputs = NodeInputs::new().with("ref_num", PortValue::Integer(0));

        assert!(matches!(inputs.file("in_file"), Err(EngineError::MissingInput(_))));
        assert!(matches!(
            inputs.file("ref_num"),
            Err(EngineError::PortTypeMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_handler_execution() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path());
        let inputs = NodeInputs::new().with("in_file", PortValue::File("/data/dwi.nii.gz".into()));

        let outputs = EchoHandler.execute(inputs, &ctx).await.unwrap();

        assert_eq!(
            outputs.get("out_file"),
            Some(&PortValue::File(dir.path().join("dwi.nii.gz")))
        );
        assert!(EchoHandler.cacheable());
        assert!(EchoHandler.fingerprint().is_empty());
    }
}
