use crate::config::PreafqConfig;
use crate::error::Result;
use crate::resolve::{copy_bval, resolve_outputs, PreafqOutputs};
use crate::session::DwiSession;
use crate::workflow::build_preafq_workflow;
use preafq_engine::{SystemRunner, ToolRunner};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Paths of one pipeline invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreafqInputs {
    pub dwi_file: PathBuf,
    pub bvec_file: PathBuf,
    pub bval_file: PathBuf,
    /// FreeSurfer `SUBJECTS_DIR`
    pub subjects_dir: PathBuf,
    /// Root of the intermediate node directories
    pub working_dir: PathBuf,
    pub out_dir: PathBuf,
}

impl PreafqInputs {
    pub fn session(&self) -> Result<DwiSession> {
        DwiSession::from_paths(&self.dwi_file, &self.bvec_file, &self.bval_file)
    }
}

/// Run the whole pipeline with the installed toolkits
pub async fn run_preafq(inputs: &PreafqInputs, config: &PreafqConfig) -> Result<PreafqOutputs> {
    run_preafq_with_runner(inputs, config, Arc::new(SystemRunner::new())).await
}

/// Run the whole pipeline, sending every tool invocation through `runner`
pub async fn run_preafq_with_runner(
    inputs: &PreafqInputs,
    config: &PreafqConfig,
    runner: Arc<dyn ToolRunner>,
) -> Result<PreafqOutputs> {
    config.validate()?;
    let session = inputs.session()?;
    let start = Instant::now();

    info!(
        "preAFQ for {} (subject {})",
        session.dwi_fname(),
        session.subject_id()
    );

    let workflow = build_preafq_workflow(&session, &inputs.subjects_dir, &inputs.out_dir, config)?;
    let executor = workflow
        .into_executor(config.executor_config(&inputs.working_dir))
        .with_runner(runner);
    let report = executor.run().await?;

    copy_bval(&session, &inputs.out_dir)?;
    let outputs = resolve_outputs(&session, &inputs.out_dir)?;

    info!(
        "preAFQ finished in {:.1}s ({} nodes executed) - {}",
        start.elapsed().as_secs_f64(),
        report.executed_count(),
        outputs.dmri_corrected.display()
    );
    Ok(outputs)
}
