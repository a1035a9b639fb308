//! preAFQ command line
//!
//! # Usage
//!
//! ```bash
//! # Full preprocessing of one acquisition
//! preafq run --dwi sub-01_dwi.nii.gz --bvec sub-01_dwi.bvec --bval sub-01_dwi.bval \
//!     --subjects-dir /data/freesurfer --working-dir /scratch/preafq --out-dir /data/derivatives
//!
//! # Print the execution phases without running anything
//! preafq plan --dwi sub-01_dwi.nii.gz --bvec sub-01_dwi.bvec --bval sub-01_dwi.bval \
//!     --subjects-dir /data/freesurfer --out-dir /data/derivatives
//!
//! # Motion parameters from FLIRT matrices
//! preafq motion --output motion_parameters.par vol0000_flirt.mat vol0001_flirt.mat
//! ```
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use preafq_pipeline::config::PreafqConfig;
use preafq_pipeline::motion::{decompose, parse_matrix, write_parameters};
use preafq_pipeline::run::{run_preafq, PreafqInputs};
use preafq_pipeline::workflow::build_preafq_workflow;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "preafq")]
#[command(about = "Diffusion MRI preprocessing for AFQ", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline
    Run {
        #[command(flatten)]
        session: SessionArgs,

        /// Root of the intermediate node directories
        #[arg(short, long)]
        working_dir: PathBuf,

        /// Override execution.max_parallel_nodes
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Re-run every node even when a cached result exists
        #[arg(long)]
        no_cache: bool,
    },

    /// Validate the graph and print its execution phases
    Plan {
        #[command(flatten)]
        session: SessionArgs,
    },

    /// Decompose rigid registration matrices into motion parameters
    Motion {
        /// Output parameter file
        #[arg(short, long, default_value = "motion_parameters.par")]
        output: PathBuf,

        /// 4x4 matrix files, one per volume
        #[arg(required = true)]
        matrices: Vec<PathBuf>,
    },
}

#[derive(Args)]
struct SessionArgs {
    /// 4-D diffusion image (`sub-<label>_..._dwi.nii.gz`)
    #[arg(long)]
    dwi: PathBuf,

    #[arg(long)]
    bvec: PathBuf,

    #[arg(long)]
    bval: PathBuf,

    /// FreeSurfer SUBJECTS_DIR
    #[arg(short, long)]
    subjects_dir: PathBuf,

    /// Output tree root
    #[arg(short, long)]
    out_dir: PathBuf,

    /// YAML configuration (version 1)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

impl SessionArgs {
    fn load_config(&self) -> anyhow::Result<PreafqConfig> {
        match &self.config {
            Some(path) => PreafqConfig::from_yaml(path)
                .with_context(|| format!("Failed to load {}", path.display())),
            None => Ok(PreafqConfig::default()),
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    // Ignore the error when a subscriber is already installed
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            session,
            working_dir,
            max_parallel,
            no_cache,
        } => run(session, working_dir, max_parallel, no_cache).await,
        Commands::Plan { session } => plan(session),
        Commands::Motion { output, matrices } => motion(&output, &matrices),
    }
}

async fn run(
    args: SessionArgs,
    working_dir: PathBuf,
    max_parallel: Option<usize>,
    no_cache: bool,
) -> anyhow::Result<()> {
    let mut config = args.load_config()?;
    if let Some(n) = max_parallel {
        config.execution = config.execution.max_parallel_nodes(n);
    }
    if no_cache {
        config.execution = config.execution.use_cache(false);
    }

    let inputs = PreafqInputs {
        dwi_file: args.dwi,
        bvec_file: args.bvec,
        bval_file: args.bval,
        subjects_dir: args.subjects_dir,
        working_dir,
        out_dir: args.out_dir,
    };
    let outputs = run_preafq(&inputs, &config).await?;

    println!("{}", serde_json::to_string_pretty(&outputs)?);
    Ok(())
}

fn plan(args: SessionArgs) -> anyhow::Result<()> {
    let config = args.load_config()?;
    let inputs = PreafqInputs {
        dwi_file: args.dwi,
        bvec_file: args.bvec,
        bval_file: args.bval,
        subjects_dir: args.subjects_dir,
        working_dir: PathBuf::new(),
        out_dir: args.out_dir,
    };
    let session = inputs.session()?;

    let workflow = build_preafq_workflow(&session, &inputs.subjects_dir, &inputs.out_dir, &config)?;
    let plan = workflow.graph().validate()?;

    info!(
        "{} nodes in {} phases",
        plan.node_count(),
        plan.phases().len()
    );
    println!("{}", plan.describe());
    Ok(())
}

fn motion(output: &Path, matrices: &[PathBuf]) -> anyhow::Result<()> {
    let mut params = Vec::with_capacity(matrices.len());
    for path in matrices {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        params.push(decompose(&parse_matrix(&text, &path.display().to_string())?));
    }

    write_parameters(output, &params)?;
    info!("Wrote {} volumes to {}", params.len(), output.display());
    Ok(())
}
