//! Post-run file relocation and discovery

use crate::error::{PipelineError, Result};
use crate::session::DwiSession;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// The five files handed back to the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreafqOutputs {
    pub dmri_corrected: PathBuf,
    pub bvec_rotated: PathBuf,
    pub art_json: PathBuf,
    pub motion_txt: PathBuf,
    pub outliers_txt: PathBuf,
}

/// Copy the b-value file next to the corrected diffusion volume
pub fn copy_bval(session: &DwiSession, out_dir: &Path) -> Result<PathBuf> {
    let file_name = session
        .bval_file()
        .file_name()
        .ok_or_else(|| PipelineError::InvalidInputPath(session.bval_file().to_path_buf()))?;

    let dest_dir = session.output_root(out_dir).join("dwi");
    std::fs::create_dir_all(&dest_dir)?;
    let dest = dest_dir.join(file_name);
    std::fs::copy(session.bval_file(), &dest)?;

    debug!(
        "Copied {} -> {}",
        session.bval_file().display(),
        dest.display()
    );
    Ok(dest)
}

/// Find the file ending in `suffix` inside `folder`.
///
/// `<dwi_fname><suffix>` is preferred; otherwise the newest match wins.
fn find_output(folder: &Path, dwi_fname: &str, suffix: &str) -> Result<PathBuf> {
    let canonical = folder.join(format!("{}{}", dwi_fname, suffix));
    if canonical.is_file() {
        return Ok(canonical);
    }

    let newest = WalkDir::new(folder)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| entry.file_name().to_string_lossy().ends_with(suffix))
        .map(|entry| {
            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (modified, entry.into_path())
        })
        .max_by_key(|(modified, _)| *modified)
        .map(|(_, path)| path);

    match newest {
        Some(path) => {
            warn!(
                "{} not found, using {}",
                canonical.display(),
                path.display()
            );
            Ok(path)
        }
        None => Err(PipelineError::OutputNotFound {
            pattern: folder.join(format!("*{}", suffix)).display().to_string(),
        }),
    }
}

/// Locate the canonical outputs in the subject tree
pub fn resolve_outputs(session: &DwiSession, out_dir: &Path) -> Result<PreafqOutputs> {
    let root = session.output_root(out_dir);
    let dwi = root.join("dwi");
    let art = root.join("art");
    let name = session.dwi_fname();

    Ok(PreafqOutputs {
        dmri_corrected: find_output(&dwi, name, ".nii.gz")?,
        bvec_rotated: find_output(&dwi, name, ".bvec")?,
        art_json: find_output(&art, name, ".art.json")?,
        motion_txt: find_output(&art, name, ".motion.txt")?,
        outliers_txt: find_output(&art, name, ".outliers.txt")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(dir: &Path) -> DwiSession {
        let bval = dir.join("sub-01_dwi.bval");
        std::fs::write(&bval, "0 1000 1000\n").unwrap();
        DwiSession::from_paths(
            dir.join("sub-01_dwi.nii.gz"),
            dir.join("sub-01_dwi.bvec"),
            bval,
        )
        .unwrap()
    }

    fn populate(root: &Path, dwi_fname: &str) {
        let dwi = root.join("dwi");
        let art = root.join("art");
        std::fs::create_dir_all(&dwi).unwrap();
        std::fs::create_dir_all(&art).unwrap();
        std::fs::write(dwi.join(format!("{}.nii.gz", dwi_fname)), b"").unwrap();
        std::fs::write(dwi.join(format!("{}.bvec", dwi_fname)), b"").unwrap();
        for suffix in [".art.json", ".motion.txt", ".outliers.txt"] {
            std::fs::write(art.join(format!("{}{}", dwi_fname, suffix)), b"").unwrap();
        }
    }

    #[test]
    fn test_copy_bval() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path());
        let out = dir.path().join("out");

        let copied = copy_bval(&session, &out).unwrap();
        assert_eq!(copied, out.join("sub-01/preafq/dwi/sub-01_dwi.bval"));
        assert_eq!(std::fs::read_to_string(copied).unwrap(), "0 1000 1000\n");
    }

    #[test]
    fn test_resolve_prefers_canonical_names() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path());
        let out = dir.path().join("out");
        let root = session.output_root(&out);
        populate(&root, "sub-01_dwi");
        // Left over from a run on another acquisition
        std::fs::write(root.join("dwi/sub-01_acq-old_dwi.nii.gz"), b"").unwrap();
        copy_bval(&session, &out).unwrap();

        let outputs = resolve_outputs(&session, &out).unwrap();
        assert_eq!(outputs.dmri_corrected, root.join("dwi/sub-01_dwi.nii.gz"));
        assert_eq!(outputs.bvec_rotated, root.join("dwi/sub-01_dwi.bvec"));
        assert_eq!(outputs.art_json, root.join("art/sub-01_dwi.art.json"));
        assert_eq!(outputs.motion_txt, root.join("art/sub-01_dwi.motion.txt"));
        assert_eq!(
            outputs.outliers_txt,
            root.join("art/sub-01_dwi.outliers.txt")
        );
    }

    #[test]
    fn test_resolve_falls_back_to_wildcard() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path());
        let out = dir.path().join("out");
        let root = session.output_root(&out);
        populate(&root, "sub-01_renamed");

        let outputs = resolve_outputs(&session, &out).unwrap();
        assert_eq!(outputs.art_json, root.join("art/sub-01_renamed.art.json"));
    }

    #[test]
    fn test_missing_output_fails() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path());
        let out = dir.path().join("out");
        let root = session.output_root(&out);
        populate(&root, "sub-01_dwi");
        std::fs::remove_file(root.join("art/sub-01_dwi.outliers.txt")).unwrap();

        let err = resolve_outputs(&session, &out).unwrap_err();
        match err {
            PipelineError::OutputNotFound { pattern } => {
                assert!(pattern.ends_with("*.outliers.txt"), "{}", pattern)
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}
