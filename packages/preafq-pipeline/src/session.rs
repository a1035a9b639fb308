use crate::error::{PipelineError, Result};
use std::path::{Path, PathBuf};

/// Prefix every BIDS subject code starts with
pub const SUBJECT_PREFIX: &str = "sub-";

/// Raw inputs of one diffusion acquisition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DwiSession {
    dwi_file: PathBuf,
    bvec_file: PathBuf,
    bval_file: PathBuf,
    /// Diffusion file name without `.nii.gz`, e.g. `sub-01_ses-1_dwi`
    dwi_fname: String,
    /// Leading `_` token of `dwi_fname`, e.g. `sub-01`
    subject_id: String,
}

impl DwiSession {
    pub fn from_paths(
        dwi_file: impl Into<PathBuf>,
        bvec_file: impl Into<PathBuf>,
        bval_file: impl Into<PathBuf>,
    ) -> Result<Self> {
        let dwi_file = dwi_file.into();
        let file_name = dwi_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| PipelineError::InvalidInputPath(dwi_file.clone()))?;

        let dwi_fname = file_name
            .split(".nii.gz")
            .next()
            .unwrap_or_default()
            .to_string();
        let subject_id = dwi_fname.split('_').next().unwrap_or_default().to_string();

        if !subject_id.starts_with(SUBJECT_PREFIX) {
            return Err(PipelineError::InvalidSubjectName {
                file_name,
                subject: subject_id,
            });
        }

        Ok(Self {
            dwi_file,
            bvec_file: bvec_file.into(),
            bval_file: bval_file.into(),
            dwi_fname,
            subject_id,
        })
    }

    pub fn dwi_file(&self) -> &Path {
        &self.dwi_file
    }

    pub fn bvec_file(&self) -> &Path {
        &self.bvec_file
    }

    pub fn bval_file(&self) -> &Path {
        &self.bval_file
    }

    pub fn dwi_fname(&self) -> &str {
        &self.dwi_fname
    }

    pub fn subject_id(&self) -> &str {
        &self.subject_id
    }

    /// `<out_dir>/<subject>/preafq`
    pub fn output_root(&self, out_dir: &Path) -> PathBuf {
        out_dir.join(&self.subject_id).join("preafq")
    }
}

/// `<subjects_dir>/<anat_subject>/mri/<file>`
pub fn segmentation_path(subjects_dir: &Path, anat_subject: &str, file: &str) -> PathBuf {
    subjects_dir.join(anat_subject).join("mri").join(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_from_bids_name() {
        let session = DwiSession::from_paths(
            "/data/sub-01/dwi/sub-01_dwi.nii.gz",
            "/data/sub-01/dwi/sub-01_dwi.bvec",
            "/data/sub-01/dwi/sub-01_dwi.bval",
        )
        .unwrap();

        assert_eq!(session.dwi_fname(), "sub-01_dwi");
        assert_eq!(session.subject_id(), "sub-01");
        assert_eq!(
            session.output_root(Path::new("/out")),
            PathBuf::from("/out/sub-01/preafq")
        );
    }

    #[test]
    fn test_subject_with_session_entity() {
        let session = DwiSession::from_paths(
            "sub-A12_ses-2_acq-hardi_dwi.nii.gz",
            "b.bvec",
            "b.bval",
        )
        .unwrap();

        assert_eq!(session.dwi_fname(), "sub-A12_ses-2_acq-hardi_dwi");
        assert_eq!(session.subject_id(), "sub-A12");
    }

    #[test]
    fn test_non_bids_name_fails() {
        let result = DwiSession::from_paths("patient01_dwi.nii.gz", "b.bvec", "b.bval");
        assert!(matches!(
            result,
            Err(PipelineError::InvalidSubjectName { ref subject, .. }) if subject == "patient01"
        ));
    }

    #[test]
    fn test_missing_file_name_fails() {
        let result = DwiSession::from_paths("/", "b.bvec", "b.bval");
        assert!(matches!(result, Err(PipelineError::InvalidInputPath(_))));
    }

    #[test]
    fn test_segmentation_path() {
        assert_eq!(
            segmentation_path(Path::new("/subjects"), "freesurfer", "aparc+aseg.mgz"),
            PathBuf::from("/subjects/freesurfer/mri/aparc+aseg.mgz")
        );
    }
}
