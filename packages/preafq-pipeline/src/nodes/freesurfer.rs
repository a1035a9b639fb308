//! FreeSurfer handlers

use super::{file_stem, require_output, split_filename};
use crate::error::{PipelineError, Result};
use async_trait::async_trait;
use preafq_engine::{NodeContext, NodeHandler, NodeInputs, NodeOutputs, PortValue, ToolCommand};
use std::path::{Path, PathBuf};

const SUBJECTS_DIR: &str = "SUBJECTS_DIR";

fn freesurfer_command(program: &str, subjects_dir: &Path) -> ToolCommand {
    ToolCommand::new(program).env(SUBJECTS_DIR, subjects_dir.to_string_lossy())
}

// ═══════════════════════════════════════════════════════════════════════════
// bbregister
// ═══════════════════════════════════════════════════════════════════════════

/// Boundary-based registration of a diffusion volume to a FreeSurfer subject.
///
/// T2-weighted contrast, FSL initialization, EPI brain mask.
#[derive(Debug, Clone)]
pub struct BbRegister {
    program: String,
    subjects_dir: PathBuf,
}

struct Registration {
    reg_file: PathBuf,
    fsl_file: PathBuf,
    min_cost_file: PathBuf,
    min_cost: f64,
}

impl BbRegister {
    pub fn new(program: impl Into<String>, subjects_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            subjects_dir: subjects_dir.into(),
        }
    }

    /// First value of a `.mincost` file
    pub fn parse_min_cost(text: &str) -> Result<f64> {
        text.split_whitespace()
            .next()
            .and_then(|v| v.parse::<f64>().ok())
            .ok_or_else(|| PipelineError::UnexpectedToolOutput {
                tool: "bbregister".to_string(),
                reason: format!("unreadable minimum cost '{}'", text.trim()),
            })
    }

    async fn register(&self, inputs: &NodeInputs, ctx: &NodeContext) -> Result<Registration> {
        let source = inputs.file("source_file")?;
        let subject = inputs.text("subject_id")?;

        let stem = format!("{}_bbreg_{}", file_stem(source), subject);
        let reg_file = ctx.output_path(format!("{}.dat", stem));
        let fsl_file = ctx.output_path(format!("{}.mat", stem));

        ctx.run_tool(
            freesurfer_command(&self.program, &self.subjects_dir)
                .opt("--s", subject)
                .opt("--mov", source)
                .opt("--reg", &reg_file)
                .opt("--fslmat", &fsl_file)
                .arg("--t2")
                .arg("--init-fsl")
                .arg("--epi-mask"),
        )
        .await?;

        let mut min_cost_name = reg_file.clone().into_os_string();
        min_cost_name.push(".mincost");
        let min_cost_file = require_output(&self.program, PathBuf::from(min_cost_name))?;
        let min_cost = Self::parse_min_cost(&tokio::fs::read_to_string(&min_cost_file).await?)?;

        Ok(Registration {
            reg_file: require_output(&self.program, reg_file)?,
            fsl_file: require_output(&self.program, fsl_file)?,
            min_cost_file,
            min_cost,
        })
    }
}

#[async_trait]
impl NodeHandler for BbRegister {
    async fn execute(
        &self,
        inputs: NodeInputs,
        ctx: &NodeContext,
    ) -> preafq_engine::Result<NodeOutputs> {
        let reg = self.register(&inputs, ctx).await?;
        tracing::info!("bbregister minimum cost {:.4}", reg.min_cost);
        Ok(NodeOutputs::new()
            .with_file("out_reg_file", reg.reg_file)
            .with_file("out_fsl_file", reg.fsl_file)
            .with_file("min_cost_file", reg.min_cost_file)
            .with("min_cost", PortValue::Float(reg.min_cost)))
    }

    fn fingerprint(&self) -> String {
        format!(
            "{} subjects_dir={}",
            self.program,
            self.subjects_dir.display()
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Segmentation mask
// ═══════════════════════════════════════════════════════════════════════════

/// Mask of every labelled voxel (`label > 0`) of a segmentation.
///
/// `aparc+aseg.mgz` -> `aparc+asegbin.nii.gz`
#[derive(Debug, Clone)]
pub struct BinarizeSegmentation {
    mri_convert: String,
    fslmaths: String,
    output_type: String,
}

impl BinarizeSegmentation {
    pub fn new(
        mri_convert: impl Into<String>,
        fslmaths: impl Into<String>,
        output_type: impl Into<String>,
    ) -> Self {
        Self {
            mri_convert: mri_convert.into(),
            fslmaths: fslmaths.into(),
            output_type: output_type.into(),
        }
    }

    async fn binarize(&self, inputs: &NodeInputs, ctx: &NodeContext) -> Result<PathBuf> {
        let segmentation = inputs.file("aparc_aseg")?;
        let stem = file_stem(segmentation);

        let converted = ctx.output_path(format!("{}.nii.gz", stem));
        ctx.run_tool(
            ToolCommand::new(&self.mri_convert)
                .arg(segmentation)
                .arg(&converted),
        )
        .await?;
        let converted = require_output(&self.mri_convert, converted)?;

        // fslmaths -bin keeps strictly positive voxels
        let out_file = ctx.output_path(format!("{}bin.nii.gz", stem));
        ctx.run_tool(
            ToolCommand::new(&self.fslmaths)
                .env("FSLOUTPUTTYPE", &self.output_type)
                .arg(&converted)
                .arg("-bin")
                .arg(&out_file)
                .opt("-odt", "float"),
        )
        .await?;

        require_output(&self.fslmaths, out_file)
    }
}

#[async_trait]
impl NodeHandler for BinarizeSegmentation {
    async fn execute(
        &self,
        inputs: NodeInputs,
        ctx: &NodeContext,
    ) -> preafq_engine::Result<NodeOutputs> {
        let out_file = self.binarize(&inputs, ctx).await?;
        Ok(NodeOutputs::new().with_file("out_file", out_file))
    }

    fn fingerprint(&self) -> String {
        format!(
            "{} {} output_type={}",
            self.mri_convert, self.fslmaths, self.output_type
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// mri_vol2vol
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolInterp {
    Trilinear,
    /// For label volumes
    Nearest,
}

/// Resample the target volume into source space through the inverse of a
/// registration
#[derive(Debug, Clone)]
pub struct ApplyVolTransform {
    program: String,
    subjects_dir: PathBuf,
    interp: VolInterp,
}

impl ApplyVolTransform {
    pub fn new(
        program: impl Into<String>,
        subjects_dir: impl Into<PathBuf>,
        interp: VolInterp,
    ) -> Self {
        Self {
            program: program.into(),
            subjects_dir: subjects_dir.into(),
            interp,
        }
    }

    async fn transform(&self, inputs: &NodeInputs, ctx: &NodeContext) -> Result<PathBuf> {
        let source = inputs.file("source_file")?;
        let target = inputs.file("target_file")?;
        let reg = inputs.file("reg_file")?;

        let (stem, ext) = split_filename(target);
        let out_file = ctx.output_path(format!("{}_warped{}", stem, ext));

        let mut command = freesurfer_command(&self.program, &self.subjects_dir)
            .opt("--mov", source)
            .opt("--targ", target)
            .opt("--reg", reg)
            .arg("--inv");
        if self.interp == VolInterp::Nearest {
            command = command.opt("--interp", "nearest");
        }
        ctx.run_tool(command.opt("--o", &out_file)).await?;

        require_output(&self.program, out_file)
    }
}

#[async_trait]
impl NodeHandler for ApplyVolTransform {
    async fn execute(
        &self,
        inputs: NodeInputs,
        ctx: &NodeContext,
    ) -> preafq_engine::Result<NodeOutputs> {
        let out_file = self.transform(&inputs, ctx).await?;
        Ok(NodeOutputs::new().with_file("transformed_file", out_file))
    }

    fn fingerprint(&self) -> String {
        format!(
            "{} subjects_dir={} interp={:?}",
            self.program,
            self.subjects_dir.display(),
            self.interp
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// mri_binarize
// ═══════════════════════════════════════════════════════════════════════════

/// Threshold at `min` and dilate.
///
/// Applied to the mask after it has been warped into diffusion space.
// TODO: compare masks with and without this step on a few subjects and drop
// the node if they agree
#[derive(Debug, Clone)]
pub struct Binarize {
    program: String,
    min: f64,
    dilate: u32,
}

impl Binarize {
    pub fn new(program: impl Into<String>, min: f64, dilate: u32) -> Self {
        Self {
            program: program.into(),
            min,
            dilate,
        }
    }

    async fn threshold(&self, inputs: &NodeInputs, ctx: &NodeContext) -> Result<PathBuf> {
        let in_file = inputs.file("in_file")?;
        let out_file = ctx.output_path(format!("{}_thresh.nii.gz", file_stem(in_file)));

        ctx.run_tool(
            ToolCommand::new(&self.program)
                .opt("--i", in_file)
                .opt("--min", self.min.to_string())
                .opt("--dilate", self.dilate.to_string())
                .opt("--o", &out_file),
        )
        .await?;

        require_output(&self.program, out_file)
    }
}

#[async_trait]
impl NodeHandler for Binarize {
    async fn execute(
        &self,
        inputs: NodeInputs,
        ctx: &NodeContext,
    ) -> preafq_engine::Result<NodeOutputs> {
        let out_file = self.threshold(&inputs, ctx).await?;
        Ok(NodeOutputs::new().with_file("binary_file", out_file))
    }

    fn fingerprint(&self) -> String {
        format!("{} min={} dilate={}", self.program, self.min, self.dilate)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// mri_convert
// ═══════════════════════════════════════════════════════════════════════════

/// Convert to compressed NIfTI: `<stem>_out.nii.gz`
#[derive(Debug, Clone)]
pub struct MriConvert {
    program: String,
}

impl MriConvert {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

#[async_trait]
impl NodeHandler for MriConvert {
    async fn execute(
        &self,
        inputs: NodeInputs,
        ctx: &NodeContext,
    ) -> preafq_engine::Result<NodeOutputs> {
        let in_file = inputs.file("in_file")?;
        let out_file = ctx.output_path(format!("{}_out.nii.gz", file_stem(in_file)));

        ctx.run_tool(
            ToolCommand::new(&self.program)
                .opt("--out_type", "niigz")
                .arg(in_file)
                .arg(&out_file),
        )
        .await?;

        let out_file = require_output(&self.program, out_file)?;
        Ok(NodeOutputs::new().with_file("out_file", out_file))
    }

    fn fingerprint(&self) -> String {
        self.program.clone()
    }
}
