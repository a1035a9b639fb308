//! Node handlers
//!
//! One handler per kind of external tool. Handlers build the command line,
//! run it through the context runner inside the node working directory and
//! report output paths using the toolkits' own naming conventions.

pub mod art;
pub mod freesurfer;
pub mod fsl;
pub mod native;

pub use art::ArtifactDetect;
pub use freesurfer::{
    ApplyVolTransform, BbRegister, Binarize, BinarizeSegmentation, MriConvert, VolInterp,
};
pub use fsl::{BinaryMaths, ExtractRoi, FlirtMap, MergeVolumes, SplitVolumes, TensorFit};
pub use native::{MotionParameters, RotateBvecs};

use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use preafq_engine::{NodeContext, NodeHandler, NodeInputs, NodeOutputs};
use std::path::{Path, PathBuf};

/// Multi-part extensions recognized when splitting file names
const COMPOUND_EXTENSIONS: [&str; 2] = [".nii.gz", ".tar.gz"];

/// Split a path's file name into (stem, extension), keeping `.nii.gz` whole
pub fn split_filename(path: &Path) -> (String, String) {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    for ext in COMPOUND_EXTENSIONS {
        if let Some(stem) = name.strip_suffix(ext) {
            return (stem.to_string(), ext.to_string());
        }
    }

    match name.rfind('.') {
        Some(idx) if idx > 0 => (name[..idx].to_string(), name[idx..].to_string()),
        _ => (name, String::new()),
    }
}

/// Stem of a path's file name
pub fn file_stem(path: &Path) -> String {
    split_filename(path).0
}

/// Fail unless the tool left `path` behind
pub(crate) fn require_output(tool: &str, path: PathBuf) -> Result<PathBuf> {
    if path.exists() {
        Ok(path)
    } else {
        Err(PipelineError::MissingToolOutput {
            tool: tool.to_string(),
            path,
        })
    }
}

/// Passes its inputs through under the same port names.
///
/// Marks the boundary of a subgraph (`inputnode` / `outputnode`).
#[derive(Debug, Clone, Default)]
pub struct Identity;

#[async_trait]
impl NodeHandler for Identity {
    async fn execute(
        &self,
        inputs: NodeInputs,
        _ctx: &NodeContext,
    ) -> preafq_engine::Result<NodeOutputs> {
        Ok(inputs
            .iter()
            .fold(NodeOutputs::new(), |outputs, (port, value)| {
                outputs.with(port.clone(), value.clone())
            }))
    }

    fn cacheable(&self) -> bool {
        false
    }
}

/// Picks one file of a list by index
#[derive(Debug, Clone, Default)]
pub struct Select;

impl Select {
    fn pick(inputs: &NodeInputs) -> Result<PathBuf> {
        let list = inputs.files("inlist")?;
        let index = inputs.integer("index")?;
        usize::try_from(index)
            .ok()
            .and_then(|i| list.get(i))
            .cloned()
            .ok_or_else(|| PipelineError::InvalidParameter {
                name: "index".to_string(),
                value: format!("{} (list has {} files)", index, list.len()),
            })
    }
}

#[async_trait]
impl NodeHandler for Select {
    async fn execute(
        &self,
        inputs: NodeInputs,
        _ctx: &NodeContext,
    ) -> preafq_engine::Result<NodeOutputs> {
        Ok(NodeOutputs::new().with_file("out", Self::pick(&inputs)?))
    }

    fn cacheable(&self) -> bool {
        false
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fake runner shared by the handler tests

    use async_trait::async_trait;
    use preafq_engine::{NodeContext, ToolCommand, ToolOutput, ToolRunner};
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    type Script = Box<dyn Fn(&ToolCommand) -> std::io::Result<String> + Send + Sync>;

    /// Records commands; `script` creates outputs and returns stdout
    pub struct ScriptedRunner {
        pub commands: Mutex<Vec<ToolCommand>>,
        script: Script,
    }

    impl ScriptedRunner {
        pub fn new(
            script: impl Fn(&ToolCommand) -> std::io::Result<String> + Send + Sync + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                commands: Mutex::new(Vec::new()),
                script: Box::new(script),
            })
        }

        pub fn programs(&self) -> Vec<String> {
            self.commands
                .lock()
                .unwrap()
                .iter()
                .map(|c| c.program.clone())
                .collect()
        }
    }

    #[async_trait]
    impl ToolRunner for ScriptedRunner {
        async fn run(&self, command: &ToolCommand) -> preafq_engine::Result<ToolOutput> {
            self.commands.lock().unwrap().push(command.clone());
            let stdout = (self.script)(command)?;
            Ok(ToolOutput {
                stdout,
                stderr: String::new(),
            })
        }
    }

    pub fn context(dir: &Path, runner: Arc<ScriptedRunner>) -> NodeContext {
        NodeContext {
            run_id: Default::default(),
            workflow: "preAFQ".to_string(),
            node: "test".to_string(),
            work_dir: dir.to_path_buf(),
            runner,
            max_parallel: 2,
        }
    }

    /// Value following `flag` in the command line
    pub fn flag_value<'a>(command: &'a ToolCommand, flag: &str) -> Option<&'a str> {
        command
            .args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| command.args.get(i + 1))
            .map(String::as_str)
    }

    /// Write a placeholder file relative to the command's working directory
    pub fn touch(command: &ToolCommand, path: &str) -> std::io::Result<()> {
        let path = match &command.cwd {
            Some(dir) => dir.join(path),
            None => path.into(),
        };
        std::fs::write(path, b"nifti")
    }
}
