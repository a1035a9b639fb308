use super::{file_stem, require_output};
use crate::config::ArtConfig;
use crate::error::Result;
use async_trait::async_trait;
use preafq_engine::{NodeContext, NodeHandler, NodeInputs, NodeOutputs, ToolCommand};
use std::path::{Path, PathBuf};

/// Outlier volume detection from motion parameters and global intensity.
///
/// Drives a rapidart-compatible command line. For a realigned series
/// `<base>.nii.gz` the detector writes, into `--out-dir`:
/// `art.<base>_outliers.txt`, `stats.<base>.txt`, `norm.<base>.txt` and
/// `global_intensity.<base>.txt`.
#[derive(Debug, Clone)]
pub struct ArtifactDetect {
    program: String,
    settings: ArtConfig,
}

struct ArtOutputs {
    outliers: PathBuf,
    statistics: PathBuf,
    norm: PathBuf,
    intensity: PathBuf,
}

fn flag(v: bool) -> &'static str {
    if v {
        "true"
    } else {
        "false"
    }
}

impl ArtifactDetect {
    pub fn new(program: impl Into<String>, settings: ArtConfig) -> Self {
        Self {
            program: program.into(),
            settings,
        }
    }

    fn command(&self, realigned: &Path, parameters: &Path, out_dir: &Path) -> ToolCommand {
        let s = &self.settings;
        ToolCommand::new(&self.program)
            .opt("--realigned", realigned)
            .opt("--parameters", parameters)
            .opt("--parameter-source", s.parameter_source.as_str())
            .opt("--norm-threshold", s.norm_threshold.to_string())
            .opt("--zintensity-threshold", s.zintensity_threshold.to_string())
            .opt("--mask-type", s.mask_type.as_str())
            .opt(
                "--use-differences",
                format!(
                    "{},{}",
                    flag(s.use_differences[0]),
                    flag(s.use_differences[1])
                ),
            )
            .opt("--use-norm", flag(s.use_norm))
            .opt("--out-dir", out_dir)
    }

    async fn detect(&self, inputs: &NodeInputs, ctx: &NodeContext) -> Result<ArtOutputs> {
        let realigned = inputs.file("realigned_file")?;
        let parameters = inputs.file("realignment_parameters")?;
        let base = file_stem(realigned);

        ctx.run_tool(self.command(realigned, parameters, &ctx.work_dir))
            .await?;

        Ok(ArtOutputs {
            outliers: require_output(
                &self.program,
                ctx.output_path(format!("art.{}_outliers.txt", base)),
            )?,
            statistics: require_output(
                &self.program,
                ctx.output_path(format!("stats.{}.txt", base)),
            )?,
            norm: require_output(&self.program, ctx.output_path(format!("norm.{}.txt", base)))?,
            intensity: require_output(
                &self.program,
                ctx.output_path(format!("global_intensity.{}.txt", base)),
            )?,
        })
    }
}

#[async_trait]
impl NodeHandler for ArtifactDetect {
    async fn execute(
        &self,
        inputs: NodeInputs,
        ctx: &NodeContext,
    ) -> preafq_engine::Result<NodeOutputs> {
        let out = self.detect(&inputs, ctx).await?;
        Ok(NodeOutputs::new()
            .with_file("outlier_files", out.outliers)
            .with_file("statistic_files", out.statistics)
            .with_file("norm_files", out.norm)
            .with_file("intensity_files", out.intensity))
    }

    fn fingerprint(&self) -> String {
        let s = &self.settings;
        format!(
            "{} diff={:?} norm={} norm_t={} z_t={} mask={} source={}",
            self.program,
            s.use_differences,
            s.use_norm,
            s.norm_threshold,
            s.zintensity_threshold,
            s.mask_type.as_str(),
            s.parameter_source.as_str()
        )
    }
}
