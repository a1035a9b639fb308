//! Configuration sections
//!
//! Every section deserializes with defaults, so a YAML file only needs to
//! name what it changes.

use super::error::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════
// Execution
// ═══════════════════════════════════════════════════════════════════════════

/// Graph execution settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutionConfig {
    /// Graph name; also the top-level directory under the working dir
    pub workflow_name: String,
    pub max_parallel_nodes: usize,
    pub node_timeout_secs: u64,
    /// Reuse node results from a previous run when inputs are unchanged
    pub use_cache: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            workflow_name: "preAFQ".to_string(),
            max_parallel_nodes: (num_cpus::get() * 3 / 4).max(1),
            node_timeout_secs: 24 * 60 * 60,
            use_cache: true,
        }
    }
}

impl ExecutionConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.workflow_name.trim().is_empty() || self.workflow_name.contains('/') {
            return Err(ConfigError::range_with_hint(
                "execution.workflow_name",
                format!("'{}'", self.workflow_name),
                "a non-empty name",
                "no '/'",
                "The workflow name becomes a directory name",
            ));
        }

        if self.max_parallel_nodes == 0 || self.max_parallel_nodes > 1024 {
            return Err(ConfigError::range_with_hint(
                "execution.max_parallel_nodes",
                self.max_parallel_nodes,
                1,
                1024,
                "At least one node must be able to run",
            ));
        }

        if self.node_timeout_secs == 0 || self.node_timeout_secs > 7 * 24 * 60 * 60 {
            return Err(ConfigError::range_with_hint(
                "execution.node_timeout_secs",
                self.node_timeout_secs,
                1,
                7 * 24 * 60 * 60,
                "Registration of a full session rarely takes more than a few hours",
            ));
        }

        Ok(())
    }

    pub fn node_timeout(&self) -> Duration {
        Duration::from_secs(self.node_timeout_secs)
    }

    /// Builder: Set max_parallel_nodes
    pub fn max_parallel_nodes(mut self, v: usize) -> Self {
        self.max_parallel_nodes = v;
        self
    }

    /// Builder: Set use_cache
    pub fn use_cache(mut self, v: bool) -> Self {
        self.use_cache = v;
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// External programs
// ═══════════════════════════════════════════════════════════════════════════

/// Program names (or absolute paths) of the external tools
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolConfig {
    pub fslsplit: String,
    pub fslroi: String,
    pub fslmerge: String,
    pub flirt: String,
    pub fslmaths: String,
    pub dtifit: String,
    pub avscale: String,
    pub bbregister: String,
    pub mri_vol2vol: String,
    pub mri_binarize: String,
    pub mri_convert: String,
    /// Artifact detector (rapidart-compatible command line)
    pub art: String,
    /// Value of FSLOUTPUTTYPE for every FSL invocation
    pub fsl_output_type: String,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            fslsplit: "fslsplit".to_string(),
            fslroi: "fslroi".to_string(),
            fslmerge: "fslmerge".to_string(),
            flirt: "flirt".to_string(),
            fslmaths: "fslmaths".to_string(),
            dtifit: "dtifit".to_string(),
            avscale: "avscale".to_string(),
            bbregister: "bbregister".to_string(),
            mri_vol2vol: "mri_vol2vol".to_string(),
            mri_binarize: "mri_binarize".to_string(),
            mri_convert: "mri_convert".to_string(),
            art: "rapidart".to_string(),
            fsl_output_type: "NIFTI_GZ".to_string(),
        }
    }
}

impl ToolConfig {
    pub fn programs(&self) -> [(&'static str, &str); 12] {
        [
            ("fslsplit", self.fslsplit.as_str()),
            ("fslroi", self.fslroi.as_str()),
            ("fslmerge", self.fslmerge.as_str()),
            ("flirt", self.flirt.as_str()),
            ("fslmaths", self.fslmaths.as_str()),
            ("dtifit", self.dtifit.as_str()),
            ("avscale", self.avscale.as_str()),
            ("bbregister", self.bbregister.as_str()),
            ("mri_vol2vol", self.mri_vol2vol.as_str()),
            ("mri_binarize", self.mri_binarize.as_str()),
            ("mri_convert", self.mri_convert.as_str()),
            ("art", self.art.as_str()),
        ]
    }

    pub fn validate(&self) -> ConfigResult<()> {
        for (tool, program) in self.programs() {
            if program.trim().is_empty() {
                return Err(ConfigError::EmptyProgram(tool.to_string()));
            }
        }

        // Only the compressed NIfTI output naming is supported downstream
        if self.fsl_output_type != "NIFTI_GZ" {
            return Err(ConfigError::range_with_hint(
                "tools.fsl_output_type",
                &self.fsl_output_type,
                "NIFTI_GZ",
                "NIFTI_GZ",
                "Output names assume .nii.gz",
            ));
        }

        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Pipeline parameters
// ═══════════════════════════════════════════════════════════════════════════

/// FLIRT settings of the motion and eddy correction stages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FlirtConfig {
    /// Degrees of freedom for head motion (rigid body)
    pub motion_dof: u32,
    /// Degrees of freedom for eddy current distortion (full affine)
    pub eddy_dof: u32,
    pub interp: String,
    pub padding_size: u32,
}

impl Default for FlirtConfig {
    fn default() -> Self {
        Self {
            motion_dof: 6,
            eddy_dof: 12,
            interp: "spline".to_string(),
            padding_size: 1,
        }
    }
}

impl FlirtConfig {
    const VALID_DOF: [u32; 4] = [6, 7, 9, 12];
    const VALID_INTERP: [&'static str; 4] = ["trilinear", "nearestneighbour", "sinc", "spline"];

    pub fn validate(&self) -> ConfigResult<()> {
        for (field, dof) in [
            ("parameters.flirt.motion_dof", self.motion_dof),
            ("parameters.flirt.eddy_dof", self.eddy_dof),
        ] {
            if !Self::VALID_DOF.contains(&dof) {
                return Err(ConfigError::range_with_hint(
                    field,
                    dof,
                    6,
                    12,
                    "FLIRT accepts 6, 7, 9 or 12 degrees of freedom",
                ));
            }
        }

        if !Self::VALID_INTERP.contains(&self.interp.as_str()) {
            return Err(ConfigError::range_with_hint(
                "parameters.flirt.interp",
                &self.interp,
                "trilinear",
                "spline",
                "One of trilinear, nearestneighbour, sinc, spline",
            ));
        }

        if self.padding_size > 16 {
            return Err(ConfigError::range_with_hint(
                "parameters.flirt.padding_size",
                self.padding_size,
                0,
                16,
                "Padding is measured in voxels",
            ));
        }

        Ok(())
    }
}

/// Motion parameter extraction settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MotionConfig {
    /// Pass each matrix through `avscale --allparams` before decomposing
    pub use_avscale: bool,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self { use_avscale: true }
    }
}

/// Mask used by the artifact detector for the global intensity signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtMaskType {
    SpmGlobal,
    File,
    Thresh,
}

impl ArtMaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtMaskType::SpmGlobal => "spm_global",
            ArtMaskType::File => "file",
            ArtMaskType::Thresh => "thresh",
        }
    }
}

/// Package that produced the realignment parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParameterSource {
    #[serde(rename = "SPM")]
    Spm,
    #[serde(rename = "FSL")]
    Fsl,
    #[serde(rename = "AFNI")]
    Afni,
    #[serde(rename = "NiPy")]
    NiPy,
    #[serde(rename = "FSFAST")]
    Fsfast,
}

impl ParameterSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParameterSource::Spm => "SPM",
            ParameterSource::Fsl => "FSL",
            ParameterSource::Afni => "AFNI",
            ParameterSource::NiPy => "NiPy",
            ParameterSource::Fsfast => "FSFAST",
        }
    }
}

/// Artifact detection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ArtConfig {
    /// Use differences between successive motion (first) and intensity (second) values
    pub use_differences: [bool; 2],
    /// Use the composite norm of the motion parameters
    pub use_norm: bool,
    /// Composite motion threshold (mm)
    pub norm_threshold: f64,
    /// Global intensity threshold (z-score)
    pub zintensity_threshold: f64,
    pub mask_type: ArtMaskType,
    pub parameter_source: ParameterSource,
}

impl Default for ArtConfig {
    fn default() -> Self {
        Self {
            use_differences: [true, true],
            use_norm: true,
            norm_threshold: 3.0,
            zintensity_threshold: 9.0,
            mask_type: ArtMaskType::SpmGlobal,
            parameter_source: ParameterSource::Fsl,
        }
    }
}

impl ArtConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if !(self.norm_threshold > 0.0 && self.norm_threshold <= 100.0) {
            return Err(ConfigError::range_with_hint(
                "parameters.art.norm_threshold",
                self.norm_threshold,
                "0 (exclusive)",
                100,
                "Composite motion threshold in millimetres",
            ));
        }

        if !(self.zintensity_threshold > 0.0 && self.zintensity_threshold <= 100.0) {
            return Err(ConfigError::range_with_hint(
                "parameters.art.zintensity_threshold",
                self.zintensity_threshold,
                "0 (exclusive)",
                100,
                "Intensity threshold is a z-score",
            ));
        }

        Ok(())
    }
}

/// Fixed parameters of the pipeline nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ParameterConfig {
    /// Reference volume index for motion/eddy correction
    pub ref_num: u32,
    /// Multiplier applied to the tensor volume
    pub tensor_scale: f64,
    /// FreeSurfer subject holding the anatomical reference
    pub anat_subject: String,
    /// Segmentation volume under `<subjects_dir>/<anat_subject>/mri/`
    pub segmentation_file: String,
    /// Lower bound for binarizing the warped mask
    pub mask_threshold: f64,
    /// Dilation (voxels) of the warped mask
    pub mask_dilate: u32,
    pub flirt: FlirtConfig,
    pub motion: MotionConfig,
    pub art: ArtConfig,
}

impl Default for ParameterConfig {
    fn default() -> Self {
        Self {
            ref_num: 0,
            tensor_scale: 1000.0,
            anat_subject: "freesurfer".to_string(),
            segmentation_file: "aparc+aseg.mgz".to_string(),
            mask_threshold: 0.5,
            mask_dilate: 1,
            flirt: FlirtConfig::default(),
            motion: MotionConfig::default(),
            art: ArtConfig::default(),
        }
    }
}

impl ParameterConfig {
    pub fn validate(&self) -> ConfigResult<()> {
        if self.ref_num > 10_000 {
            return Err(ConfigError::range_with_hint(
                "parameters.ref_num",
                self.ref_num,
                0,
                10_000,
                "Reference index must address a volume of the series",
            ));
        }

        if !(self.tensor_scale > 0.0 && self.tensor_scale <= 1e9) {
            return Err(ConfigError::range_with_hint(
                "parameters.tensor_scale",
                self.tensor_scale,
                "0 (exclusive)",
                1e9,
                "Tensor scale must be positive",
            ));
        }

        if self.anat_subject.trim().is_empty() || self.segmentation_file.trim().is_empty() {
            return Err(ConfigError::range_with_hint(
                "parameters.anat_subject",
                format!("'{}/{}'", self.anat_subject, self.segmentation_file),
                "a subject",
                "a file name",
                "Both the FreeSurfer subject and the segmentation file are required",
            ));
        }

        if !(0.0..=1.0).contains(&self.mask_threshold) {
            return Err(ConfigError::range_with_hint(
                "parameters.mask_threshold",
                self.mask_threshold,
                0.0,
                1.0,
                "The warped mask holds values between 0 and 1",
            ));
        }

        if self.mask_dilate > 10 {
            return Err(ConfigError::range_with_hint(
                "parameters.mask_dilate",
                self.mask_dilate,
                0,
                10,
                "Dilation is measured in voxels",
            ));
        }

        self.flirt.validate()?;
        self.art.validate()?;

        Ok(())
    }

    /// Builder: Set ref_num
    pub fn ref_num(mut self, v: u32) -> Self {
        self.ref_num = v;
        self
    }

    /// Builder: Set anat_subject
    pub fn anat_subject(mut self, v: impl Into<String>) -> Self {
        self.anat_subject = v.into();
        self
    }
}
