//! FSL handlers

use super::{file_stem, require_output};
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use preafq_engine::{NodeContext, NodeHandler, NodeInputs, NodeOutputs, ToolCommand};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// FSL command with the output type pinned
fn fsl_command(program: &str, output_type: &str) -> ToolCommand {
    ToolCommand::new(program).env("FSLOUTPUTTYPE", output_type)
}

/// Program and output type, part of every FSL cache key
fn fsl_fingerprint(program: &str, output_type: &str) -> String {
    format!("{} output_type={}", program, output_type)
}

/// `vol0000.nii.gz`, `vol0001.nii.gz`, ... in `dir`, sorted
fn split_volumes_in(dir: &Path, prefix: &str) -> Vec<PathBuf> {
    let mut volumes: Vec<PathBuf> = WalkDir::new(dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            let name = entry.file_name().to_string_lossy();
            name.strip_prefix(prefix)
                .and_then(|rest| rest.strip_suffix(".nii.gz"))
                .is_some_and(|index| !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()))
        })
        .map(|entry| entry.into_path())
        .collect();
    volumes.sort();
    volumes
}

// ═══════════════════════════════════════════════════════════════════════════
// fslsplit
// ═══════════════════════════════════════════════════════════════════════════

/// Split a 4-D series into one file per volume
#[derive(Debug, Clone)]
pub struct SplitVolumes {
    program: String,
    output_type: String,
}

impl SplitVolumes {
    const PREFIX: &'static str = "vol";

    pub fn new(program: impl Into<String>, output_type: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            output_type: output_type.into(),
        }
    }

    async fn split(&self, inputs: &NodeInputs, ctx: &NodeContext) -> Result<Vec<PathBuf>> {
        let in_file = inputs.file("in_file")?;

        // Volumes of an earlier, longer series would otherwise be picked up
        for stale in split_volumes_in(&ctx.work_dir, Self::PREFIX) {
            tokio::fs::remove_file(stale).await?;
        }

        ctx.run_tool(
            fsl_command(&self.program, &self.output_type)
                .arg(in_file)
                .arg(Self::PREFIX)
                .arg("-t"),
        )
        .await?;

        let volumes = split_volumes_in(&ctx.work_dir, Self::PREFIX);
        if volumes.is_empty() {
            return Err(PipelineError::MissingToolOutput {
                tool: self.program.clone(),
                path: ctx.output_path(format!("{}0000.nii.gz", Self::PREFIX)),
            });
        }
        debug!("{} produced {} volumes", self.program, volumes.len());
        Ok(volumes)
    }
}

#[async_trait]
impl NodeHandler for SplitVolumes {
    async fn execute(
        &self,
        inputs: NodeInputs,
        ctx: &NodeContext,
    ) -> preafq_engine::Result<NodeOutputs> {
        let volumes = self.split(&inputs, ctx).await?;
        Ok(NodeOutputs::new().with_files("out_files", volumes))
    }

    fn fingerprint(&self) -> String {
        fsl_fingerprint(&self.program, &self.output_type)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// fslroi
// ═══════════════════════════════════════════════════════════════════════════

/// Extract `t_size` volumes starting at `t_min`
#[derive(Debug, Clone)]
pub struct ExtractRoi {
    program: String,
    output_type: String,
    t_size: u32,
}

impl ExtractRoi {
    pub fn new(program: impl Into<String>, output_type: impl Into<String>, t_size: u32) -> Self {
        Self {
            program: program.into(),
            output_type: output_type.into(),
            t_size,
        }
    }

    async fn extract(&self, inputs: &NodeInputs, ctx: &NodeContext) -> Result<PathBuf> {
        let in_file = inputs.file("in_file")?;
        let t_min = inputs.integer("t_min")?;
        if t_min < 0 {
            return Err(PipelineError::InvalidParameter {
                name: "t_min".to_string(),
                value: t_min.to_string(),
            });
        }

        let roi_file = ctx.output_path(format!("{}_roi.nii.gz", file_stem(in_file)));
        ctx.run_tool(
            fsl_command(&self.program, &self.output_type)
                .arg(in_file)
                .arg(&roi_file)
                .arg(t_min.to_string())
                .arg(self.t_size.to_string()),
        )
        .await?;

        require_output(&self.program, roi_file)
    }
}

#[async_trait]
impl NodeHandler for ExtractRoi {
    async fn execute(
        &self,
        inputs: NodeInputs,
        ctx: &NodeContext,
    ) -> preafq_engine::Result<NodeOutputs> {
        let roi_file = self.extract(&inputs, ctx).await?;
        Ok(NodeOutputs::new().with_file("roi_file", roi_file))
    }

    fn fingerprint(&self) -> String {
        format!(
            "{} t_size={}",
            fsl_fingerprint(&self.program, &self.output_type),
            self.t_size
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// flirt (mapped over volumes)
// ═══════════════════════════════════════════════════════════════════════════

/// Register every input volume to one reference
#[derive(Debug, Clone)]
pub struct FlirtMap {
    program: String,
    output_type: String,
    dof: u32,
    interp: String,
    padding_size: u32,
}

impl FlirtMap {
    pub fn new(
        program: impl Into<String>,
        output_type: impl Into<String>,
        dof: u32,
        interp: impl Into<String>,
        padding_size: u32,
    ) -> Self {
        Self {
            program: program.into(),
            output_type: output_type.into(),
            dof,
            interp: interp.into(),
            padding_size,
        }
    }

    async fn register_one(
        &self,
        volume: &Path,
        reference: &Path,
        ctx: &NodeContext,
    ) -> Result<(PathBuf, PathBuf)> {
        let stem = file_stem(volume);
        let out_file = ctx.output_path(format!("{}_flirt.nii.gz", stem));
        let out_matrix = ctx.output_path(format!("{}_flirt.mat", stem));

        ctx.run_tool(
            fsl_command(&self.program, &self.output_type)
                .opt("-in", volume)
                .opt("-ref", reference)
                .opt("-out", &out_file)
                .opt("-omat", &out_matrix)
                .opt("-dof", self.dof.to_string())
                .opt("-interp", &self.interp)
                .opt("-paddingsize", self.padding_size.to_string())
                .arg("-nosearch"),
        )
        .await?;

        Ok((
            require_output(&self.program, out_file)?,
            require_output(&self.program, out_matrix)?,
        ))
    }

    async fn register_all(
        &self,
        inputs: &NodeInputs,
        ctx: &NodeContext,
    ) -> Result<(Vec<PathBuf>, Vec<PathBuf>)> {
        let volumes = inputs.files("in_files")?.to_vec();
        let reference = inputs.file("reference")?.to_path_buf();
        let reference = reference.as_path();

        // Order of the results follows the order of the volumes
        let pairs: Vec<(PathBuf, PathBuf)> = futures::stream::iter(volumes)
            .map(move |volume| async move { self.register_one(&volume, reference, ctx).await })
            .buffered(ctx.max_parallel.max(1))
            .try_collect()
            .await?;

        Ok(pairs.into_iter().unzip())
    }
}

#[async_trait]
impl NodeHandler for FlirtMap {
    async fn execute(
        &self,
        inputs: NodeInputs,
        ctx: &NodeContext,
    ) -> preafq_engine::Result<NodeOutputs> {
        let (out_files, out_matrix_files) = self.register_all(&inputs, ctx).await?;
        Ok(NodeOutputs::new()
            .with_files("out_files", out_files)
            .with_files("out_matrix_files", out_matrix_files))
    }

    fn fingerprint(&self) -> String {
        format!(
            "{} dof={} interp={} padding={}",
            fsl_fingerprint(&self.program, &self.output_type),
            self.dof,
            self.interp,
            self.padding_size
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// fslmerge
// ═══════════════════════════════════════════════════════════════════════════

/// Concatenate volumes along time
#[derive(Debug, Clone)]
pub struct MergeVolumes {
    program: String,
    output_type: String,
}

impl MergeVolumes {
    pub fn new(program: impl Into<String>, output_type: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            output_type: output_type.into(),
        }
    }

    async fn merge(&self, inputs: &NodeInputs, ctx: &NodeContext) -> Result<PathBuf> {
        let volumes = inputs.files("in_files")?;
        let first = volumes.first().ok_or_else(|| PipelineError::InvalidParameter {
            name: "in_files".to_string(),
            value: "[]".to_string(),
        })?;

        let merged_file = ctx.output_path(format!("{}_merged.nii.gz", file_stem(first)));
        ctx.run_tool(
            fsl_command(&self.program, &self.output_type)
                .arg("-t")
                .arg(&merged_file)
                .args(volumes),
        )
        .await?;

        require_output(&self.program, merged_file)
    }
}

#[async_trait]
impl NodeHandler for MergeVolumes {
    async fn execute(
        &self,
        inputs: NodeInputs,
        ctx: &NodeContext,
    ) -> preafq_engine::Result<NodeOutputs> {
        let merged_file = self.merge(&inputs, ctx).await?;
        Ok(NodeOutputs::new().with_file("merged_file", merged_file))
    }

    fn fingerprint(&self) -> String {
        fsl_fingerprint(&self.program, &self.output_type)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// fslmaths
// ═══════════════════════════════════════════════════════════════════════════

/// `fslmaths <in> -<operation> <operand> <in>_maths`
#[derive(Debug, Clone)]
pub struct BinaryMaths {
    program: String,
    output_type: String,
}

impl BinaryMaths {
    pub const OPERATIONS: [&'static str; 8] =
        ["add", "sub", "mul", "div", "rem", "max", "min", "pow"];

    pub fn new(program: impl Into<String>, output_type: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            output_type: output_type.into(),
        }
    }

    async fn apply(&self, inputs: &NodeInputs, ctx: &NodeContext) -> Result<PathBuf> {
        let in_file = inputs.file("in_file")?;
        let operation = inputs.text("operation")?;
        let operand = inputs.float("operand_value")?;
        if !Self::OPERATIONS.contains(&operation) {
            return Err(PipelineError::InvalidParameter {
                name: "operation".to_string(),
                value: operation.to_string(),
            });
        }

        let out_file = ctx.output_path(format!("{}_maths.nii.gz", file_stem(in_file)));
        ctx.run_tool(
            fsl_command(&self.program, &self.output_type)
                .arg(in_file)
                .arg(format!("-{}", operation))
                .arg(operand.to_string())
                .arg(&out_file),
        )
        .await?;

        require_output(&self.program, out_file)
    }
}

#[async_trait]
impl NodeHandler for BinaryMaths {
    async fn execute(
        &self,
        inputs: NodeInputs,
        ctx: &NodeContext,
    ) -> preafq_engine::Result<NodeOutputs> {
        let out_file = self.apply(&inputs, ctx).await?;
        Ok(NodeOutputs::new().with_file("out_file", out_file))
    }

    fn fingerprint(&self) -> String {
        fsl_fingerprint(&self.program, &self.output_type)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Tensor fit (fslmaths + dtifit)
// ═══════════════════════════════════════════════════════════════════════════

/// Diffusion tensor fit.
///
/// Outputs `<base>_tensor`, `_fa`, `_md`, `_ad` (= L1) and `_rd`
/// (= (L2 + L3) / 2), all `.nii.gz`.
#[derive(Debug, Clone)]
pub struct TensorFit {
    fslmaths: String,
    dtifit: String,
    output_type: String,
}

struct TensorMaps {
    tensor: PathBuf,
    fa: PathBuf,
    md: PathBuf,
    ad: PathBuf,
    rd: PathBuf,
}

impl TensorFit {
    pub fn new(
        fslmaths: impl Into<String>,
        dtifit: impl Into<String>,
        output_type: impl Into<String>,
    ) -> Self {
        Self {
            fslmaths: fslmaths.into(),
            dtifit: dtifit.into(),
            output_type: output_type.into(),
        }
    }

    fn map_path(ctx: &NodeContext, base: &str, suffix: &str) -> PathBuf {
        ctx.output_path(format!("{}_{}.nii.gz", base, suffix))
    }

    async fn fit(&self, inputs: &NodeInputs, ctx: &NodeContext) -> Result<TensorMaps> {
        let in_file = inputs.file("in_file")?;
        let bval = inputs.file("in_bval")?;
        let bvec = inputs.file("in_bvec")?;
        let base = file_stem(in_file);

        // Fit inside every voxel with signal in any volume
        let mask = Self::map_path(ctx, &base, "fitmask");
        ctx.run_tool(
            fsl_command(&self.fslmaths, &self.output_type)
                .arg(in_file)
                .arg("-Tmax")
                .arg("-bin")
                .arg(&mask),
        )
        .await?;

        ctx.run_tool(
            fsl_command(&self.dtifit, &self.output_type)
                .opt("-k", in_file)
                .opt("-o", ctx.output_path(&base))
                .opt("-m", &mask)
                .opt("-r", bvec)
                .opt("-b", bval)
                .arg("--save_tensor"),
        )
        .await?;

        let l2 = require_output(&self.dtifit, Self::map_path(ctx, &base, "L2"))?;
        let l3 = require_output(&self.dtifit, Self::map_path(ctx, &base, "L3"))?;
        let rd = Self::map_path(ctx, &base, "rd");
        ctx.run_tool(
            fsl_command(&self.fslmaths, &self.output_type)
                .arg(&l2)
                .opt("-add", &l3)
                .opt("-div", "2")
                .arg(&rd),
        )
        .await?;

        let fa = Self::map_path(ctx, &base, "fa");
        let md = Self::map_path(ctx, &base, "md");
        let ad = Self::map_path(ctx, &base, "ad");
        tokio::fs::rename(
            require_output(&self.dtifit, Self::map_path(ctx, &base, "FA"))?,
            &fa,
        )
        .await?;
        tokio::fs::rename(
            require_output(&self.dtifit, Self::map_path(ctx, &base, "MD"))?,
            &md,
        )
        .await?;
        tokio::fs::copy(
            require_output(&self.dtifit, Self::map_path(ctx, &base, "L1"))?,
            &ad,
        )
        .await?;

        Ok(TensorMaps {
            tensor: require_output(&self.dtifit, Self::map_path(ctx, &base, "tensor"))?,
            fa,
            md,
            ad,
            rd: require_output(&self.fslmaths, rd)?,
        })
    }
}

#[async_trait]
impl NodeHandler for TensorFit {
    async fn execute(
        &self,
        inputs: NodeInputs,
        ctx: &NodeContext,
    ) -> preafq_engine::Result<NodeOutputs> {
        let maps = self.fit(&inputs, ctx).await?;
        Ok(NodeOutputs::new()
            .with_file("out_file", maps.tensor)
            .with_file("fa_file", maps.fa)
            .with_file("md_file", maps.md)
            .with_file("ad_file", maps.ad)
            .with_file("rd_file", maps.rd))
    }

    fn fingerprint(&self) -> String {
        format!(
            "{} {}",
            fsl_fingerprint(&self.fslmaths, &self.output_type),
            self.dtifit
        )
    }
}
