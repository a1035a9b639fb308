/*
 * preafq-pipeline - Diffusion MRI preprocessing for AFQ
 *
 * Builds and runs the preAFQ workflow on top of preafq-engine:
 * - Motion + eddy-current correction with b-vector rotation
 * - Diffusion tensor fit and scaling
 * - Boundary-based registration to a FreeSurfer subject
 * - Brain mask and segmentation warped into diffusion space
 * - Motion parameters + outlier volume detection
 * - Output sink with BIDS-style renaming
 *
 * Every image computation runs in an external toolkit (FSL, FreeSurfer,
 * an artifact detector). Motion parameter decomposition and b-vector
 * rotation are computed here.
 */

pub mod bvec;
pub mod config;
pub mod error;
pub mod motion;
pub mod nodes;
pub mod resolve;
pub mod run;
pub mod session;
pub mod sink;
pub mod workflow;

pub use config::{ConfigError, PreafqConfig};
pub use error::{PipelineError, Result};
pub use resolve::{copy_bval, resolve_outputs, PreafqOutputs};
pub use run::{run_preafq, run_preafq_with_runner, PreafqInputs};
pub use session::DwiSession;
pub use sink::{DataSink, SubstitutionTable};
pub use workflow::{build_preafq_workflow, preprocessing_subgraph, PreafqWorkflow};
