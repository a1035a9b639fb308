//! End-to-end runs of the preAFQ workflow against a fake toolkit
//!
//! `FakeToolkit` stands in for FSL, FreeSurfer and the artifact detector:
//! every command writes the files the real tool would write, with just
//! enough content for the in-process steps (matrices, avscale output).

use async_trait::async_trait;
use preafq_engine::{EngineError, ToolCommand, ToolOutput, ToolRunner};
use preafq_pipeline::{
    run_preafq_with_runner, PipelineError, PreafqConfig, PreafqInputs, PreafqOutputs,
};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const VOLUMES: usize = 3;

const IDENTITY_MATRIX: &str = "1 0 0 0\n0 1 0 0\n0 0 1 0\n0 0 0 1\n";

#[derive(Default)]
struct FakeToolkit {
    commands: Mutex<Vec<ToolCommand>>,
    /// Program that exits with an error
    failing: Option<&'static str>,
}

fn value_after<'a>(command: &'a ToolCommand, flag: &str) -> Option<&'a str> {
    command
        .args
        .iter()
        .position(|a| a == flag)
        .and_then(|i| command.args.get(i + 1))
        .map(String::as_str)
}

fn write(path: impl AsRef<Path>, content: &str) -> std::io::Result<()> {
    std::fs::write(path, content)
}

fn required<'a>(command: &'a ToolCommand, flag: &str) -> std::io::Result<&'a str> {
    value_after(command, flag).ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{} without {}", command.program, flag),
        )
    })
}

fn last_arg(command: &ToolCommand) -> std::io::Result<&str> {
    command
        .args
        .last()
        .map(String::as_str)
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "no arguments"))
}

impl FakeToolkit {
    fn failing(program: &'static str) -> Self {
        Self {
            failing: Some(program),
            ..Default::default()
        }
    }

    fn count(&self) -> usize {
        self.commands.lock().unwrap().len()
    }

    fn programs(&self) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.program.clone())
            .collect()
    }

    /// Produce the tool's outputs; returns stdout
    fn simulate(command: &ToolCommand) -> std::io::Result<String> {
        let args = &command.args;
        let tool = Path::new(&command.program)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match tool.as_str() {
            "fslsplit" => {
                let cwd = command.cwd.clone().unwrap_or_default();
                for i in 0..VOLUMES {
                    write(cwd.join(format!("vol{:04}.nii.gz", i)), "volume")?;
                }
            }
            "fslroi" | "fslmerge" => write(&args[1], "volume")?,
            "flirt" => {
                write(required(command, "-out")?, "volume")?;
                write(required(command, "-omat")?, IDENTITY_MATRIX)?;
            }
            "fslmaths" => {
                let out = match args.iter().position(|a| a == "-odt") {
                    Some(i) => args[i - 1].as_str(),
                    None => last_arg(command)?,
                };
                write(out, "image")?;
            }
            "dtifit" => {
                let base = required(command, "-o")?;
                for map in ["tensor", "FA", "MD", "L1", "L2", "L3"] {
                    write(format!("{}_{}.nii.gz", base, map), map)?;
                }
            }
            "avscale" => {
                return Ok(format!(
                    "Rotation & Translation Matrix:\n{}\nScales (x,y,z) = 1.0 1.0 1.0\n",
                    IDENTITY_MATRIX
                ));
            }
            "bbregister" => {
                let reg = required(command, "--reg")?;
                write(reg, "registration")?;
                write(format!("{}.mincost", reg), "0.4123 77.1 80.2 12.5\n")?;
                write(required(command, "--fslmat")?, IDENTITY_MATRIX)?;
            }
            "mri_vol2vol" | "mri_binarize" => write(required(command, "--o")?, "image")?,
            "mri_convert" => write(last_arg(command)?, "image")?,
            "rapidart" => {
                let out_dir = PathBuf::from(required(command, "--out-dir")?);
                let realigned = required(command, "--realigned")?;
                let base = Path::new(realigned)
                    .file_name()
                    .map(|n| n.to_string_lossy().trim_end_matches(".nii.gz").to_string())
                    .unwrap_or_default();
                write(out_dir.join(format!("art.{}_outliers.txt", base)), "1\n")?;
                write(out_dir.join(format!("stats.{}.txt", base)), "{}")?;
                write(out_dir.join(format!("norm.{}.txt", base)), "0.1\n")?;
                write(
                    out_dir.join(format!("global_intensity.{}.txt", base)),
                    "1.0\n",
                )?;
            }
            other => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("unknown tool {}", other),
                ));
            }
        }
        Ok(String::new())
    }
}

#[async_trait]
impl ToolRunner for FakeToolkit {
    async fn run(&self, command: &ToolCommand) -> preafq_engine::Result<ToolOutput> {
        self.commands.lock().unwrap().push(command.clone());
        if self.failing == Some(command.program.as_str()) {
            return Err(EngineError::ToolFailed {
                program: command.program.clone(),
                status: 1,
                stderr: "simulated failure".to_string(),
            });
        }
        let stdout = Self::simulate(command)?;
        Ok(ToolOutput {
            stdout,
            stderr: String::new(),
        })
    }
}

/// Raw inputs of `sub-01_dwi` in a scratch directory
fn inputs(root: &Path) -> PreafqInputs {
    let raw = root.join("raw");
    std::fs::create_dir_all(&raw).unwrap();
    let dwi_file = raw.join("sub-01_dwi.nii.gz");
    let bvec_file = raw.join("sub-01_dwi.bvec");
    let bval_file = raw.join("sub-01_dwi.bval");
    std::fs::write(&dwi_file, b"4d").unwrap();
    std::fs::write(&bvec_file, "0 1 0\n0 0 1\n0 0 0\n").unwrap();
    std::fs::write(&bval_file, "0 1000 1000\n").unwrap();

    PreafqInputs {
        dwi_file,
        bvec_file,
        bval_file,
        subjects_dir: root.join("subjects"),
        working_dir: root.join("work"),
        out_dir: root.join("out"),
    }
}

fn expected_outputs(out_dir: &Path) -> PreafqOutputs {
    let root = out_dir.join("sub-01/preafq");
    PreafqOutputs {
        dmri_corrected: root.join("dwi/sub-01_dwi.nii.gz"),
        bvec_rotated: root.join("dwi/sub-01_dwi.bvec"),
        art_json: root.join("art/sub-01_dwi.art.json"),
        motion_txt: root.join("art/sub-01_dwi.motion.txt"),
        outliers_txt: root.join("art/sub-01_dwi.outliers.txt"),
    }
}

fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_pipeline_returns_the_five_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let inputs = inputs(dir.path());
    let toolkit = Arc::new(FakeToolkit::default());

    let outputs = run_preafq_with_runner(&inputs, &PreafqConfig::default(), toolkit.clone())
        .await
        .unwrap();

    assert_eq!(outputs, expected_outputs(&inputs.out_dir));

    let root = inputs.out_dir.join("sub-01/preafq");
    assert_eq!(
        file_names(&root.join("dwi")),
        vec!["sub-01_dwi.bval", "sub-01_dwi.bvec", "sub-01_dwi.nii.gz"]
    );
    assert_eq!(
        file_names(&root.join("art")),
        vec![
            "sub-01_dwi.art.json",
            "sub-01_dwi.motion.txt",
            "sub-01_dwi.outliers.txt"
        ]
    );
    assert_eq!(
        file_names(&root.join("dti")),
        vec![
            "sub-01_dwi_ad.nii.gz",
            "sub-01_dwi_fa.nii.gz",
            "sub-01_dwi_md.nii.gz",
            "sub-01_dwi_rd.nii.gz",
            "sub-01_dwi_tensor.nii.gz",
            "sub-01_dwi_tensor_maths.nii.gz",
        ]
    );
    assert_eq!(
        file_names(&root.join("reg")),
        vec![
            "sub-01_dwi_register.dat",
            "sub-01_dwi_register.dat.mincost",
            "sub-01_dwi_register.mat",
        ]
    );
    assert_eq!(
        file_names(&root.join("anat")),
        vec!["sub-01_aparc+aseg.nii.gz", "sub-01_mask.nii.gz"]
    );

    // Identity registrations leave the gradient directions unchanged
    let bvec = std::fs::read_to_string(&outputs.bvec_rotated).unwrap();
    assert!(bvec.starts_with("0.000000000000000 1.000000000000000 0.000000000000000\n"));

    let motion = std::fs::read_to_string(&outputs.motion_txt).unwrap();
    assert_eq!(motion.lines().count(), VOLUMES);

    // One registration per volume in each correction stage
    let flirt_runs = toolkit.programs().iter().filter(|p| *p == "flirt").count();
    assert_eq!(flirt_runs, 2 * VOLUMES);
}

#[tokio::test]
async fn test_rerun_overwrites_and_ignores_stale_files() {
    let dir = tempfile::tempdir().unwrap();
    let inputs = inputs(dir.path());
    let config = PreafqConfig::default();
    let toolkit = Arc::new(FakeToolkit::default());

    let first = run_preafq_with_runner(&inputs, &config, toolkit.clone())
        .await
        .unwrap();
    let commands_after_first = toolkit.count();

    // A differently named leftover from an earlier layout
    let dwi_dir = inputs.out_dir.join("sub-01/preafq/dwi");
    std::fs::write(dwi_dir.join("sub-01_acq-old_dwi.nii.gz"), b"stale").unwrap();
    std::fs::write(&first.dmri_corrected, b"edited").unwrap();

    let second = run_preafq_with_runner(&inputs, &config, toolkit.clone())
        .await
        .unwrap();

    assert_eq!(first, second);
    // Every tool node was served from the cache
    assert_eq!(toolkit.count(), commands_after_first);
    // The sink always copies, so the edited file is replaced
    assert_eq!(std::fs::read(&second.dmri_corrected).unwrap(), b"volume");
    assert_eq!(file_names(&dwi_dir).len(), 4);
}

#[tokio::test]
async fn test_changed_tool_path_invalidates_cached_nodes() {
    let dir = tempfile::tempdir().unwrap();
    let inputs = inputs(dir.path());
    let mut config = PreafqConfig::default();
    let toolkit = Arc::new(FakeToolkit::default());

    run_preafq_with_runner(&inputs, &config, toolkit.clone())
        .await
        .unwrap();
    let commands_after_first = toolkit.count();

    config.tools.dtifit = "/opt/fsl/bin/dtifit".to_string();
    run_preafq_with_runner(&inputs, &config, toolkit.clone())
        .await
        .unwrap();

    let rerun = toolkit.programs().split_off(commands_after_first);
    assert!(rerun.iter().any(|p| p == "/opt/fsl/bin/dtifit"));
    assert!(!rerun.iter().any(|p| p == "flirt"));
}

#[tokio::test]
async fn test_fsl_style_bvecs_file_is_resolved() {
    let dir = tempfile::tempdir().unwrap();
    let mut inputs = inputs(dir.path());
    let bvecs = dir.path().join("raw/bvecs");
    std::fs::rename(&inputs.bvec_file, &bvecs).unwrap();
    inputs.bvec_file = bvecs;
    let toolkit = Arc::new(FakeToolkit::default());

    let outputs = run_preafq_with_runner(&inputs, &PreafqConfig::default(), toolkit)
        .await
        .unwrap();

    let dwi_dir = inputs.out_dir.join("sub-01/preafq/dwi");
    assert_eq!(outputs.bvec_rotated, dwi_dir.join("bvecs.bvec"));
    assert_eq!(
        file_names(&dwi_dir),
        vec!["bvecs.bvec", "sub-01_dwi.bval", "sub-01_dwi.nii.gz"]
    );
}

#[tokio::test]
async fn test_tool_failure_aborts_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let inputs = inputs(dir.path());
    let toolkit = Arc::new(FakeToolkit::failing("bbregister"));

    let err = run_preafq_with_runner(&inputs, &PreafqConfig::default(), toolkit.clone())
        .await
        .unwrap_err();

    match err {
        PipelineError::Engine(EngineError::NodeFailed { node, source }) => {
            assert_eq!(node, "bbreg");
            assert!(matches!(*source, EngineError::ToolFailed { .. }));
        }
        other => panic!("unexpected error: {}", other),
    }

    // Nothing downstream of the registration ran
    let programs = toolkit.programs();
    assert!(!programs.iter().any(|p| p == "mri_vol2vol"));
    assert!(!inputs.out_dir.join("sub-01").exists());
}

#[tokio::test]
async fn test_non_bids_input_is_rejected_before_any_tool_runs() {
    let dir = tempfile::tempdir().unwrap();
    let mut inputs = inputs(dir.path());
    inputs.dwi_file = dir.path().join("raw/patient01_dwi.nii.gz");
    let toolkit = Arc::new(FakeToolkit::default());

    let err = run_preafq_with_runner(&inputs, &PreafqConfig::default(), toolkit.clone())
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::InvalidSubjectName { .. }));
    assert_eq!(toolkit.count(), 0);
}
