use crate::dag::PortValue;
use crate::error::Result;
use crate::handler::{NodeInputs, NodeOutputs};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::UNIX_EPOCH;
use tracing::{debug, warn};

/// Result of a completed node, persisted in its working directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedResult {
    pub node: String,
    pub input_hash: String,
    pub outputs: BTreeMap<String, PortValue>,
    pub created_at: DateTime<Utc>,
}

/// Node result cache (one `_result.json` per node working directory)
#[derive(Debug, Clone)]
pub struct ResultCache {
    enabled: bool,
}

impl ResultCache {
    pub const RESULT_FILE: &'static str = "_result.json";

    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Hash of everything that determines a node's result.
    ///
    /// Files contribute path, size and modification time, not content.
    pub fn input_hash(node: &str, fingerprint: &str, inputs: &NodeInputs) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(node.as_bytes());
        hasher.update([0u8]);
        hasher.update(fingerprint.as_bytes());

        for (port, value) in inputs.iter() {
            hasher.update([0u8]);
            hasher.update(port.as_bytes());
            hasher.update(serde_json::to_vec(value)?);

            for path in value.paths() {
                match std::fs::metadata(path) {
                    Ok(meta) => {
                        hasher.update(meta.len().to_le_bytes());
                        let mtime = meta
                            .modified()
                            .ok()
                            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                            .map_or(0, |d| d.as_nanos());
                        hasher.update(mtime.to_le_bytes());
                    }
                    Err(_) => hasher.update(b"missing"),
                }
            }
        }

        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Load a previous result when the inputs are unchanged and its files still exist
    pub fn load(&self, work_dir: &Path, input_hash: &str) -> Result<Option<NodeOutputs>> {
        if !self.enabled {
            return Ok(None);
        }

        let path = work_dir.join(Self::RESULT_FILE);
        if !path.exists() {
            return Ok(None);
        }

        let cached: CachedResult = match serde_json::from_slice(&std::fs::read(&path)?) {
            Ok(cached) => cached,
            Err(e) => {
                warn!("Ignoring unreadable cache entry {}: {}", path.display(), e);
                return Ok(None);
            }
        };

        if cached.input_hash != input_hash {
            debug!("Cache miss for {} (inputs changed)", cached.node);
            return Ok(None);
        }

        let all_present = cached
            .outputs
            .values()
            .flat_map(|value| value.paths())
            .all(|p| p.exists());
        if !all_present {
            warn!("Cache entry for {} references missing files", cached.node);
            return Ok(None);
        }

        Ok(Some(NodeOutputs::from_map(cached.outputs)))
    }

    /// Persist a node result
    pub fn save(
        &self,
        work_dir: &Path,
        node: &str,
        input_hash: &str,
        outputs: &NodeOutputs,
    ) -> Result<()> {
        let entry = CachedResult {
            node: node.to_string(),
            input_hash: input_hash.to_string(),
            outputs: outputs.clone().into_map(),
            created_at: Utc::now(),
        };
        std::fs::write(
            work_dir.join(Self::RESULT_FILE),
            serde_json::to_vec_pretty(&entry)?,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs_for(path: &Path) -> NodeInputs {
        NodeInputs::new()
            .with("in_file", PortValue::File(path.to_path_buf()))
            .with("t_min", PortValue::Integer(0))
    }

    #[test]
    fn test_hash_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("dwi.nii.gz");
        std::fs::write(&input, b"volume").unwrap();

        let a = ResultCache::input_hash("fslroi", "t_size=1", &inputs_for(&input)).unwrap();
        let b = ResultCache::input_hash("fslroi", "t_size=1", &inputs_for(&input)).unwrap();
        let c = ResultCache::input_hash("fslroi", "t_size=2", &inputs_for(&input)).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_hash_changes_with_file_size() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("dwi.nii.gz");
        std::fs::write(&input, b"volume").unwrap();
        let before = ResultCache::input_hash("fslroi", "", &inputs_for(&input)).unwrap();

        std::fs::write(&input, b"a larger volume").unwrap();
        let after = ResultCache::input_hash("fslroi", "", &inputs_for(&input)).unwrap();

        assert_ne!(before, after);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("roi.nii.gz");
        std::fs::write(&out, b"roi").unwrap();

        let cache = ResultCache::new(true);
        let outputs = NodeOutputs::new().with_file("roi_file", &out);
        cache.save(dir.path(), "fslroi", "abc", &outputs).unwrap();

        let loaded = cache.load(dir.path(), "abc").unwrap();
        assert_eq!(loaded, Some(outputs));

        // Different inputs
        assert!(cache.load(dir.path(), "def").unwrap().is_none());
    }

    #[test]
    fn test_load_rejects_missing_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("roi.nii.gz");
        std::fs::write(&out, b"roi").unwrap();

        let cache = ResultCache::new(true);
        let outputs = NodeOutputs::new().with_file("roi_file", &out);
        cache.save(dir.path(), "fslroi", "abc", &outputs).unwrap();
        std::fs::remove_file(&out).unwrap();

        assert!(cache.load(dir.path(), "abc").unwrap().is_none());
    }

    #[test]
    fn test_disabled_cache_never_hits() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResultCache::new(false);
        cache
            .save(dir.path(), "fslroi", "abc", &NodeOutputs::new())
            .unwrap();

        assert!(cache.load(dir.path(), "abc").unwrap().is_none());
    }
}
