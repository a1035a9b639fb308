//! Handlers computed in-process

use crate::bvec::{format_bvecs, read_bvecs, rotate_bvecs, rotated_bvec_name};
use crate::error::Result;
use crate::motion::{self, Affine, MotionParams, MOTION_PARAMS_FILE};
use async_trait::async_trait;
use preafq_engine::{NodeContext, NodeHandler, NodeInputs, NodeOutputs, ToolCommand};
use std::path::{Path, PathBuf};
use tracing::debug;

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

async fn read_matrix(path: &Path) -> Result<Affine> {
    let text = tokio::fs::read_to_string(path).await?;
    motion::parse_matrix(&text, &display_name(path))
}

// ═══════════════════════════════════════════════════════════════════════════
// b-vector rotation
// ═══════════════════════════════════════════════════════════════════════════

/// Rotate gradient directions by the per-volume motion correction
#[derive(Debug, Clone, Default)]
pub struct RotateBvecs;

impl RotateBvecs {
    async fn rotate(&self, inputs: &NodeInputs, ctx: &NodeContext) -> Result<PathBuf> {
        let in_bvec = inputs.file("in_bvec")?;
        let matrix_files = inputs.files("in_matrix")?;

        let vectors = read_bvecs(in_bvec)?;
        let mut matrices = Vec::with_capacity(matrix_files.len());
        for file in matrix_files {
            matrices.push(read_matrix(file).await?);
        }
        let names: Vec<String> = matrix_files.iter().map(|p| display_name(p)).collect();

        let rotated = rotate_bvecs(&vectors, &matrices, &names)?;
        let out_file = ctx.output_path(rotated_bvec_name(in_bvec));
        tokio::fs::write(&out_file, format_bvecs(&rotated)).await?;

        debug!("Rotated {} gradient directions", rotated.len());
        Ok(out_file)
    }
}

#[async_trait]
impl NodeHandler for RotateBvecs {
    async fn execute(
        &self,
        inputs: NodeInputs,
        ctx: &NodeContext,
    ) -> preafq_engine::Result<NodeOutputs> {
        let out_file = self.rotate(&inputs, ctx).await?;
        Ok(NodeOutputs::new().with_file("out_file", out_file))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Motion parameters
// ═══════════════════════════════════════════════════════════════════════════

/// Per-volume rotations and translations from the motion correction
/// matrices, written to `motion_parameters.par`
#[derive(Debug, Clone)]
pub struct MotionParameters {
    /// `avscale` program; `None` decomposes the raw matrix files
    avscale: Option<String>,
}

impl MotionParameters {
    pub fn with_avscale(program: impl Into<String>) -> Self {
        Self {
            avscale: Some(program.into()),
        }
    }

    pub fn from_raw_matrices() -> Self {
        Self { avscale: None }
    }

    /// Rigid part of one registration matrix
    async fn rigid_matrix(&self, file: &Path, ctx: &NodeContext) -> Result<Affine> {
        match &self.avscale {
            Some(program) => {
                let output = ctx
                    .run_tool(ToolCommand::new(program).arg("--allparams").arg(file))
                    .await?;
                motion::parse_avscale(&output.stdout, &display_name(file))
            }
            None => read_matrix(file).await,
        }
    }

    async fn extract(&self, inputs: &NodeInputs, ctx: &NodeContext) -> Result<PathBuf> {
        let matrix_files = inputs.files("in_matrices")?;

        let mut params: Vec<MotionParams> = Vec::with_capacity(matrix_files.len());
        for file in matrix_files {
            params.push(motion::decompose(&self.rigid_matrix(file, ctx).await?));
        }

        let out_file = ctx.output_path(MOTION_PARAMS_FILE);
        tokio::fs::write(&out_file, motion::format_parameters(&params)).await?;
        Ok(out_file)
    }
}

#[async_trait]
impl NodeHandler for MotionParameters {
    async fn execute(
        &self,
        inputs: NodeInputs,
        ctx: &NodeContext,
    ) -> preafq_engine::Result<NodeOutputs> {
        let out_file = self.extract(&inputs, ctx).await?;
        Ok(NodeOutputs::new().with_file("motion_params", out_file))
    }

    fn fingerprint(&self) -> String {
        format!("avscale={}", self.avscale.as_deref().unwrap_or("none"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motion::recompose;
    use crate::nodes::testing::{context, ScriptedRunner};
    use preafq_engine::PortValue;

    fn write_matrix(path: &Path, m: &Affine) {
        let text: String = m
            .iter()
            .map(|row| {
                row.iter()
                    .map(|v| format!("{:.10}", v))
                    .collect::<Vec<_>>()
                    .join("  ")
                    + "\n"
            })
            .collect();
        std::fs::write(path, text).unwrap();
    }

    #[tokio::test]
    async fn test_rotate_bvecs_node() {
        let dir = tempfile::tempdir().unwrap();
        let bvec = dir.path().join("sub-01_dwi.bvec");
        std::fs::write(&bvec, "0 1\n0 0\n0 0\n").unwrap();

        let identity = recompose(&MotionParams {
            rotations: [0.0; 3],
            translations: [0.0; 3],
        });
        let mats: Vec<PathBuf> = (0..2)
            .map(|i| {
                let p = dir.path().join(format!("vol{:04}_flirt.mat", i));
                write_matrix(&p, &identity);
                p
            })
            .collect();

        let runner = ScriptedRunner::new(|_| Ok(String::new()));
        let ctx = context(dir.path(), runner);
        let inputs = NodeInputs::new()
            .with("in_bvec", PortValue::File(bvec))
            .with("in_matrix", PortValue::FileList(mats));

        let outputs = RotateBvecs.execute(inputs, &ctx).await.unwrap();

        let out = dir.path().join("sub-01_dwi_rotated.bvec");
        assert_eq!(outputs.get("out_file"), Some(&PortValue::File(out.clone())));
        let text = std::fs::read_to_string(out).unwrap();
        assert!(text.starts_with("0.000000000000000 1.000000000000000\n"));
    }

    #[tokio::test]
    async fn test_motion_parameters_from_raw_matrices() {
        let dir = tempfile::tempdir().unwrap();
        let moved = MotionParams {
            rotations: [0.01, -0.02, 0.03],
            translations: [0.5, -1.0, 2.0],
        };
        let mat = dir.path().join("vol0001_flirt.mat");
        write_matrix(&mat, &recompose(&moved));

        let runner = ScriptedRunner::new(|_| Ok(String::new()));
        let ctx = context(dir.path(), runner.clone());
        let inputs = NodeInputs::new().with("in_matrices", PortValue::FileList(vec![mat]));

        let outputs = MotionParameters::from_raw_matrices()
            .execute(inputs, &ctx)
            .await
            .unwrap();

        let out = dir.path().join(MOTION_PARAMS_FILE);
        assert_eq!(
            outputs.get("motion_params"),
            Some(&PortValue::File(out.clone()))
        );
        assert_eq!(
            std::fs::read_to_string(out).unwrap(),
            "0.010000 -0.020000 0.030000 0.500000 -1.000000 2.000000 \n"
        );
        assert!(runner.programs().is_empty());
    }

    #[tokio::test]
    async fn test_motion_parameters_through_avscale() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new(|_| {
            Ok("Rotation & Translation Matrix:\n\
                1 0 0 1.5\n0 1 0 0\n0 0 1 0\n0 0 0 1\n\n\
                Scales (x,y,z) = 1.02 1.0 1.0\n"
                .to_string())
        });
        let ctx = context(dir.path(), runner.clone());
        let mats: Vec<PathBuf> = vec!["/c/vol0000_flirt.mat".into(), "/c/vol0001_flirt.mat".into()];
        let inputs = NodeInputs::new().with("in_matrices", PortValue::FileList(mats));

        MotionParameters::with_avscale("avscale")
            .execute(inputs, &ctx)
            .await
            .unwrap();

        let text = std::fs::read_to_string(dir.path().join(MOTION_PARAMS_FILE)).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.lines().all(|l| l.contains(" 1.500000 ")));

        let commands = runner.commands.lock().unwrap();
        assert_eq!(commands.len(), 2);
        assert_eq!(
            commands[1].args,
            vec!["--allparams", "/c/vol0001_flirt.mat"]
        );
    }
}
