//! Output sink: renames node outputs and copies them into the subject tree

use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use preafq_engine::{NodeContext, NodeHandler, NodeInputs, NodeOutputs};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Ordered literal substring replacements.
///
/// Every rule is tried in list order on the result of the previous one, so
/// a longer pattern must come before any shorter pattern it contains.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubstitutionTable {
    rules: Vec<(String, String)>,
}

impl SubstitutionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, pattern: impl Into<String>, replacement: impl Into<String>) -> Self {
        self.rules.push((pattern.into(), replacement.into()));
        self
    }

    pub fn rules(&self) -> &[(String, String)] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn apply(&self, file_name: &str) -> String {
        self.rules
            .iter()
            .fold(file_name.to_string(), |name, (pattern, replacement)| {
                name.replace(pattern.as_str(), replacement)
            })
    }

    /// Renames intermediate outputs after the diffusion file they came from
    pub fn preafq(dwi_fname: &str) -> Self {
        Self::new()
            .with(
                "vol0000_flirt_merged.nii.gz",
                format!("{}.nii.gz", dwi_fname),
            )
            .with(
                "stats.vol0000_flirt_merged.txt",
                format!("{}.art.json", dwi_fname),
            )
            .with("motion_parameters.par", format!("{}.motion.txt", dwi_fname))
            .with("_rotated.bvec", ".bvec")
            .with(
                "aparc+aseg_warped_out",
                dwi_fname.replace("_dwi", "_aparc+aseg"),
            )
            .with(
                "art.vol0000_flirt_merged_outliers.txt",
                format!("{}.outliers.txt", dwi_fname),
            )
            .with("vol0000_flirt_merged", dwi_fname)
            .with("_roi_bbreg_freesurfer", "_register")
            .with(
                "aparc+asegbin_warped_thresh",
                dwi_fname.replace("_dwi", "_mask"),
            )
    }
}

/// Destination folder of a binding key: `preafq.dti.@fa` -> `preafq/dti`.
///
/// Components starting with `@` only name the binding.
pub fn sink_folder(key: &str) -> PathBuf {
    key.split('.')
        .filter(|part| !part.is_empty() && !part.starts_with('@'))
        .collect()
}

/// Copies every bound file to `<base_dir>/<container>/<folder>/<renamed>`
#[derive(Debug, Clone)]
pub struct DataSink {
    base_dir: PathBuf,
    container: String,
    substitutions: SubstitutionTable,
}

impl DataSink {
    pub fn new(
        base_dir: impl Into<PathBuf>,
        container: impl Into<String>,
        substitutions: SubstitutionTable,
    ) -> Self {
        Self {
            base_dir: base_dir.into(),
            container: container.into(),
            substitutions,
        }
    }

    /// Destination of `source` when bound under `key`
    pub fn destination(&self, key: &str, source: &Path) -> Result<PathBuf> {
        let file_name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| PipelineError::InvalidInputPath(source.to_path_buf()))?;

        Ok(self
            .base_dir
            .join(&self.container)
            .join(sink_folder(key))
            .join(self.substitutions.apply(&file_name)))
    }

    async fn copy_all(&self, inputs: &NodeInputs) -> Result<Vec<PathBuf>> {
        let mut written = Vec::new();
        for (key, value) in inputs.iter() {
            for source in value.paths() {
                let dest = self.destination(key, source)?;
                if let Some(parent) = dest.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                // Overwrites a file from a previous run
                tokio::fs::copy(source, &dest).await?;
                debug!("Sink {}: {} -> {}", key, source.display(), dest.display());
                written.push(dest);
            }
        }
        Ok(written)
    }
}

#[async_trait]
impl NodeHandler for DataSink {
    async fn execute(
        &self,
        inputs: NodeInputs,
        _ctx: &NodeContext,
    ) -> preafq_engine::Result<NodeOutputs> {
        let written = self.copy_all(&inputs).await?;
        info!(
            "Sink wrote {} files under {}",
            written.len(),
            self.base_dir.join(&self.container).display()
        );
        Ok(NodeOutputs::new().with_files("out_files", written))
    }

    // Destination files live outside the working directory and may be edited
    fn cacheable(&self) -> bool {
        false
    }
}
