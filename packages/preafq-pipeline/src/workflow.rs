//! preAFQ workflow graph
//!
//! Layout (node names as they appear in the working directory):
//!
//! ```text
//! preprocessing: inputnode -> motion_correct.* -> eddy_correct.* -> outputnode
//! outputnode ─┬─> dti_tensor ──> scale_tensor
//!             ├─> fslroi ──> bbreg ──┬─> transform (bin_aparc) ──> threshold2
//!             │                      └─> transform_aparcaseg ──> convert2nii
//!             └─> art <── get_motion_parameters <── motion_correct.coregistration
//! every designated output ──> sinker
//! ```

use crate::config::{PreafqConfig, ToolConfig};
use crate::error::Result;
use crate::nodes::{
    ApplyVolTransform, ArtifactDetect, BbRegister, Binarize, BinarizeSegmentation, BinaryMaths,
    ExtractRoi, FlirtMap, Identity, MergeVolumes, MotionParameters, MriConvert, RotateBvecs,
    Select, SplitVolumes, TensorFit, VolInterp,
};
use crate::session::{segmentation_path, DwiSession};
use crate::sink::{DataSink, SubstitutionTable};
use preafq_engine::{
    ExecutorConfig, NodeHandler, NodeSpec, PortType, PortValue, WorkflowExecutor, WorkflowGraph,
};
use std::path::Path;
use std::sync::Arc;

/// Name of the output sink node
pub const SINK_NODE: &str = "sinker";

/// Sink bindings: (producer node, producer port, destination key)
pub const SINK_BINDINGS: [(&str, &str, &str); 16] = [
    ("art", "statistic_files", "preafq.art.@artstat"),
    ("art", "outlier_files", "preafq.art.@artoutlier"),
    ("get_motion_parameters", "motion_params", "preafq.art.@motion"),
    ("outputnode", "dmri_corrected", "preafq.dwi.@corrected"),
    ("outputnode", "bvec_rotated", "preafq.dwi.@rotated"),
    ("dti_tensor", "out_file", "preafq.dti.@tensor"),
    ("dti_tensor", "fa_file", "preafq.dti.@fa"),
    ("dti_tensor", "md_file", "preafq.dti.@md"),
    ("dti_tensor", "ad_file", "preafq.dti.@ad"),
    ("dti_tensor", "rd_file", "preafq.dti.@rd"),
    ("scale_tensor", "out_file", "preafq.dti.@scaled_tensor"),
    ("bbreg", "min_cost_file", "preafq.reg.@mincost"),
    ("bbreg", "out_fsl_file", "preafq.reg.@fslfile"),
    ("bbreg", "out_reg_file", "preafq.reg.@reg"),
    ("threshold2", "binary_file", "preafq.anat.@mask"),
    ("convert2nii", "out_file", "preafq.anat.@aparc_aseg"),
];

/// A graph plus the handler of every node
pub struct PreafqWorkflow {
    graph: WorkflowGraph,
    handlers: Vec<(String, Arc<dyn NodeHandler>)>,
}

impl PreafqWorkflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            graph: WorkflowGraph::new(name),
            handlers: Vec::new(),
        }
    }

    /// Add a node together with the handler that runs it
    pub fn add(&mut self, spec: NodeSpec, handler: impl NodeHandler + 'static) -> Result<()> {
        let name = spec.name.clone();
        self.graph.add_node(spec)?;
        let handler: Arc<dyn NodeHandler> = Arc::new(handler);
        self.handlers.push((name, handler));
        Ok(())
    }

    pub fn connect(
        &mut self,
        from_node: &str,
        from_port: &str,
        to_node: &str,
        to_port: &str,
    ) -> Result<()> {
        self.graph.connect(from_node, from_port, to_node, to_port)?;
        Ok(())
    }

    pub fn set_input(&mut self, node: &str, port: &str, value: PortValue) -> Result<()> {
        self.graph.set_input(node, port, value)?;
        Ok(())
    }

    pub fn graph(&self) -> &WorkflowGraph {
        &self.graph
    }

    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.handlers.iter().map(|(name, _)| name.as_str())
    }

    pub fn into_executor(self, config: ExecutorConfig) -> WorkflowExecutor {
        let mut executor = WorkflowExecutor::new(self.graph).with_config(config);
        for (name, handler) in self.handlers {
            executor.register_handler(name, handler);
        }
        executor
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Preprocessing subgraph
// ═══════════════════════════════════════════════════════════════════════════

fn split_node(name: &str, tools: &ToolConfig) -> (NodeSpec, SplitVolumes) {
    (
        NodeSpec::new(name)
            .input("in_file", PortType::File)
            .output("out_files", PortType::FileList),
        SplitVolumes::new(&tools.fslsplit, &tools.fsl_output_type),
    )
}

fn flirt_node(name: &str, dof: u32, config: &PreafqConfig) -> (NodeSpec, FlirtMap) {
    let tools = &config.tools;
    let flirt = &config.parameters.flirt;
    (
        NodeSpec::new(name)
            .input("in_files", PortType::FileList)
            .input("reference", PortType::File)
            .output("out_files", PortType::FileList)
            .output("out_matrix_files", PortType::FileList),
        FlirtMap::new(
            &tools.flirt,
            &tools.fsl_output_type,
            dof,
            &flirt.interp,
            flirt.padding_size,
        ),
    )
}

fn merge_node(name: &str, tools: &ToolConfig) -> (NodeSpec, MergeVolumes) {
    (
        NodeSpec::new(name)
            .input("in_files", PortType::FileList)
            .output("merged_file", PortType::File),
        MergeVolumes::new(&tools.fslmerge, &tools.fsl_output_type),
    )
}

/// Motion correction then eddy-current correction.
///
/// Motion correction registers every volume rigidly to the reference
/// volume and rotates the b-vectors accordingly; eddy correction registers
/// the motion-corrected volumes with an affine model.
///
/// Entry: `inputnode.{in_file, in_bvec, ref_num}`.
/// Exit: `outputnode.{dmri_corrected, bvec_rotated}`.
pub fn preprocessing_subgraph(wf: &mut PreafqWorkflow, config: &PreafqConfig) -> Result<()> {
    let tools = &config.tools;
    let flirt = &config.parameters.flirt;

    wf.add(
        NodeSpec::new("inputnode")
            .input("in_file", PortType::File)
            .input("in_bvec", PortType::File)
            .input("ref_num", PortType::Integer)
            .output("in_file", PortType::File)
            .output("in_bvec", PortType::File)
            .output("ref_num", PortType::Integer),
        Identity,
    )?;

    // Motion correction
    let (spec, handler) = split_node("motion_correct.split", tools);
    wf.add(spec, handler)?;
    wf.add(
        NodeSpec::new("motion_correct.reference")
            .input("in_file", PortType::File)
            .input("t_min", PortType::Integer)
            .output("roi_file", PortType::File),
        ExtractRoi::new(&tools.fslroi, &tools.fsl_output_type, 1),
    )?;
    let (spec, handler) = flirt_node("motion_correct.coregistration", flirt.motion_dof, config);
    wf.add(spec, handler)?;
    wf.add(
        NodeSpec::new("motion_correct.rotate_b_matrix")
            .input("in_bvec", PortType::File)
            .input("in_matrix", PortType::FileList)
            .output("out_file", PortType::File),
        RotateBvecs,
    )?;
    let (spec, handler) = merge_node("motion_correct.merge", tools);
    wf.add(spec, handler)?;

    wf.connect("inputnode", "in_file", "motion_correct.split", "in_file")?;
    wf.connect(
        "inputnode",
        "in_file",
        "motion_correct.reference",
        "in_file",
    )?;
    wf.connect("inputnode", "ref_num", "motion_correct.reference", "t_min")?;
    wf.connect(
        "motion_correct.split",
        "out_files",
        "motion_correct.coregistration",
        "in_files",
    )?;
    wf.connect(
        "motion_correct.reference",
        "roi_file",
        "motion_correct.coregistration",
        "reference",
    )?;
    wf.connect(
        "inputnode",
        "in_bvec",
        "motion_correct.rotate_b_matrix",
        "in_bvec",
    )?;
    wf.connect(
        "motion_correct.coregistration",
        "out_matrix_files",
        "motion_correct.rotate_b_matrix",
        "in_matrix",
    )?;
    wf.connect(
        "motion_correct.coregistration",
        "out_files",
        "motion_correct.merge",
        "in_files",
    )?;

    // Eddy-current correction
    let (spec, handler) = split_node("eddy_correct.split", tools);
    wf.add(spec, handler)?;
    wf.add(
        NodeSpec::new("eddy_correct.pick_ref")
            .input("inlist", PortType::FileList)
            .input("index", PortType::Integer)
            .output("out", PortType::File),
        Select,
    )?;
    let (spec, handler) = flirt_node("eddy_correct.coregistration", flirt.eddy_dof, config);
    wf.add(spec, handler)?;
    let (spec, handler) = merge_node("eddy_correct.merge", tools);
    wf.add(spec, handler)?;

    wf.connect(
        "motion_correct.merge",
        "merged_file",
        "eddy_correct.split",
        "in_file",
    )?;
    wf.connect(
        "eddy_correct.split",
        "out_files",
        "eddy_correct.pick_ref",
        "inlist",
    )?;
    wf.connect("inputnode", "ref_num", "eddy_correct.pick_ref", "index")?;
    wf.connect(
        "eddy_correct.split",
        "out_files",
        "eddy_correct.coregistration",
        "in_files",
    )?;
    wf.connect(
        "eddy_correct.pick_ref",
        "out",
        "eddy_correct.coregistration",
        "reference",
    )?;
    wf.connect(
        "eddy_correct.coregistration",
        "out_files",
        "eddy_correct.merge",
        "in_files",
    )?;

    wf.add(
        NodeSpec::new("outputnode")
            .input("dmri_corrected", PortType::File)
            .input("bvec_rotated", PortType::File)
            .output("dmri_corrected", PortType::File)
            .output("bvec_rotated", PortType::File),
        Identity,
    )?;
    wf.connect(
        "eddy_correct.merge",
        "merged_file",
        "outputnode",
        "dmri_corrected",
    )?;
    wf.connect(
        "motion_correct.rotate_b_matrix",
        "out_file",
        "outputnode",
        "bvec_rotated",
    )?;

    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════
// Full workflow
// ═══════════════════════════════════════════════════════════════════════════

/// Build the complete preAFQ graph for one diffusion session.
///
/// Registered outputs are copied to `<out_dir>/<subject>/preafq/...` by the
/// sink node, renamed after the diffusion file.
pub fn build_preafq_workflow(
    session: &DwiSession,
    subjects_dir: &Path,
    out_dir: &Path,
    config: &PreafqConfig,
) -> Result<PreafqWorkflow> {
    let tools = &config.tools;
    let params = &config.parameters;
    let fsl_type = tools.fsl_output_type.as_str();
    let segmentation = segmentation_path(
        subjects_dir,
        &params.anat_subject,
        &params.segmentation_file,
    );

    let mut wf = PreafqWorkflow::new(&config.execution.workflow_name);
    preprocessing_subgraph(&mut wf, config)?;

    wf.set_input(
        "inputnode",
        "in_file",
        PortValue::File(session.dwi_file().to_path_buf()),
    )?;
    wf.set_input(
        "inputnode",
        "in_bvec",
        PortValue::File(session.bvec_file().to_path_buf()),
    )?;
    wf.set_input(
        "inputnode",
        "ref_num",
        PortValue::Integer(i64::from(params.ref_num)),
    )?;

    // Tensor estimation and scaling
    wf.add(
        NodeSpec::new("dti_tensor")
            .input("in_file", PortType::File)
            .input("in_bval", PortType::File)
            .input("in_bvec", PortType::File)
            .output("out_file", PortType::File)
            .output("fa_file", PortType::File)
            .output("md_file", PortType::File)
            .output("ad_file", PortType::File)
            .output("rd_file", PortType::File),
        TensorFit::new(&tools.fslmaths, &tools.dtifit, fsl_type),
    )?;
    wf.connect("outputnode", "dmri_corrected", "dti_tensor", "in_file")?;
    wf.connect("outputnode", "bvec_rotated", "dti_tensor", "in_bvec")?;
    wf.set_input(
        "dti_tensor",
        "in_bval",
        PortValue::File(session.bval_file().to_path_buf()),
    )?;

    wf.add(
        NodeSpec::new("scale_tensor")
            .input("in_file", PortType::File)
            .input("operation", PortType::Text)
            .input("operand_value", PortType::Float)
            .output("out_file", PortType::File),
        BinaryMaths::new(&tools.fslmaths, fsl_type),
    )?;
    wf.connect("dti_tensor", "out_file", "scale_tensor", "in_file")?;
    wf.set_input(
        "scale_tensor",
        "operation",
        PortValue::Text("mul".to_string()),
    )?;
    wf.set_input(
        "scale_tensor",
        "operand_value",
        PortValue::Float(params.tensor_scale),
    )?;

    // Registration to the anatomical subject
    wf.add(
        NodeSpec::new("fslroi")
            .input("in_file", PortType::File)
            .input("t_min", PortType::Integer)
            .output("roi_file", PortType::File),
        ExtractRoi::new(&tools.fslroi, fsl_type, 1),
    )?;
    wf.connect("outputnode", "dmri_corrected", "fslroi", "in_file")?;
    wf.set_input("fslroi", "t_min", PortValue::Integer(0))?;

    wf.add(
        NodeSpec::new("bbreg")
            .input("source_file", PortType::File)
            .input("subject_id", PortType::Text)
            .output("out_reg_file", PortType::File)
            .output("out_fsl_file", PortType::File)
            .output("min_cost_file", PortType::File)
            .output("min_cost", PortType::Float),
        BbRegister::new(&tools.bbregister, subjects_dir),
    )?;
    wf.connect("fslroi", "roi_file", "bbreg", "source_file")?;
    wf.set_input(
        "bbreg",
        "subject_id",
        PortValue::Text(params.anat_subject.clone()),
    )?;

    // Brain mask and segmentation in diffusion space
    wf.add(
        NodeSpec::new("bin_aparc")
            .input("aparc_aseg", PortType::File)
            .output("out_file", PortType::File),
        BinarizeSegmentation::new(&tools.mri_convert, &tools.fslmaths, fsl_type),
    )?;
    wf.set_input(
        "bin_aparc",
        "aparc_aseg",
        PortValue::File(segmentation.clone()),
    )?;

    let vol_transform = |name: &str| {
        NodeSpec::new(name)
            .input("source_file", PortType::File)
            .input("target_file", PortType::File)
            .input("reg_file", PortType::File)
            .output("transformed_file", PortType::File)
    };
    wf.add(
        vol_transform("transform"),
        ApplyVolTransform::new(&tools.mri_vol2vol, subjects_dir, VolInterp::Trilinear),
    )?;
    wf.connect("bin_aparc", "out_file", "transform", "target_file")?;
    wf.connect("fslroi", "roi_file", "transform", "source_file")?;
    wf.connect("bbreg", "out_reg_file", "transform", "reg_file")?;

    wf.add(
        vol_transform("transform_aparcaseg"),
        ApplyVolTransform::new(&tools.mri_vol2vol, subjects_dir, VolInterp::Nearest),
    )?;
    wf.set_input(
        "transform_aparcaseg",
        "target_file",
        PortValue::File(segmentation),
    )?;
    wf.connect("fslroi", "roi_file", "transform_aparcaseg", "source_file")?;
    wf.connect("bbreg", "out_reg_file", "transform_aparcaseg", "reg_file")?;

    wf.add(
        NodeSpec::new("threshold2")
            .input("in_file", PortType::File)
            .output("binary_file", PortType::File),
        Binarize::new(
            &tools.mri_binarize,
            params.mask_threshold,
            params.mask_dilate,
        ),
    )?;
    wf.connect("transform", "transformed_file", "threshold2", "in_file")?;

    wf.add(
        NodeSpec::new("convert2nii")
            .input("in_file", PortType::File)
            .output("out_file", PortType::File),
        MriConvert::new(&tools.mri_convert),
    )?;
    wf.connect(
        "transform_aparcaseg",
        "transformed_file",
        "convert2nii",
        "in_file",
    )?;

    // Motion parameters and outlier detection
    let motion = if params.motion.use_avscale {
        MotionParameters::with_avscale(&tools.avscale)
    } else {
        MotionParameters::from_raw_matrices()
    };
    wf.add(
        NodeSpec::new("get_motion_parameters")
            .input("in_matrices", PortType::FileList)
            .output("motion_params", PortType::File),
        motion,
    )?;
    wf.connect(
        "motion_correct.coregistration",
        "out_matrix_files",
        "get_motion_parameters",
        "in_matrices",
    )?;

    wf.add(
        NodeSpec::new("art")
            .input("realigned_file", PortType::File)
            .input("realignment_parameters", PortType::File)
            .output("outlier_files", PortType::File)
            .output("statistic_files", PortType::File)
            .output("norm_files", PortType::File)
            .output("intensity_files", PortType::File),
        ArtifactDetect::new(&tools.art, params.art.clone()),
    )?;
    wf.connect(
        "get_motion_parameters",
        "motion_params",
        "art",
        "realignment_parameters",
    )?;
    wf.connect("outputnode", "dmri_corrected", "art", "realigned_file")?;

    // Output sink
    let sink_spec = SINK_BINDINGS
        .iter()
        .fold(NodeSpec::new(SINK_NODE), |spec, (_, _, key)| {
            spec.input(*key, PortType::FileList)
        })
        .output("out_files", PortType::FileList);
    wf.add(
        sink_spec,
        DataSink::new(
            out_dir,
            session.subject_id(),
            SubstitutionTable::preafq(session.dwi_fname()),
        ),
    )?;
    for (node, port, key) in SINK_BINDINGS {
        wf.connect(node, port, SINK_NODE, key)?;
    }

    Ok(wf)
}
