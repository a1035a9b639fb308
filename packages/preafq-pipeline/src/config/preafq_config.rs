use super::error::{ConfigError, ConfigResult};
use super::io::ConfigFileV1;
use super::sections::{ExecutionConfig, ParameterConfig, ToolConfig};
use preafq_engine::ExecutorConfig;
use std::path::Path;

/// Complete pipeline configuration
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PreafqConfig {
    pub execution: ExecutionConfig,
    pub tools: ToolConfig,
    pub parameters: ParameterConfig,
}

impl PreafqConfig {
    pub const SUPPORTED_VERSIONS: [u32; 1] = [1];

    /// Load from YAML file and validate
    pub fn from_yaml(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> ConfigResult<Self> {
        let file: ConfigFileV1 = serde_yaml::from_str(content)?;

        // Version check
        match file.version {
            None => return Err(ConfigError::MissingVersion),
            Some(found) if !Self::SUPPORTED_VERSIONS.contains(&found) => {
                return Err(ConfigError::UnsupportedVersion {
                    found,
                    supported: Self::SUPPORTED_VERSIONS.to_vec(),
                });
            }
            Some(_) => {}
        }

        let config = Self {
            execution: file.execution,
            tools: file.tools,
            parameters: file.parameters,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> ConfigResult<String> {
        let file = ConfigFileV1 {
            version: Some(1),
            execution: self.execution.clone(),
            tools: self.tools.clone(),
            parameters: self.parameters.clone(),
        };
        Ok(serde_yaml::to_string(&file)?)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        self.execution.validate()?;
        self.tools.validate()?;
        self.parameters.validate()?;
        Ok(())
    }

    /// Engine settings for a run rooted at `working_dir`
    pub fn executor_config(&self, working_dir: &Path) -> ExecutorConfig {
        ExecutorConfig {
            base_dir: working_dir.to_path_buf(),
            max_parallel: self.execution.max_parallel_nodes,
            node_timeout: self.execution.node_timeout(),
            use_cache: self.execution.use_cache,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_is_valid() {
        PreafqConfig::default().validate().unwrap();
    }

    #[test]
    fn test_executor_config() {
        let mut config = PreafqConfig::default();
        config.execution = config.execution.max_parallel_nodes(3).use_cache(false);

        let exec = config.executor_config(Path::new("/scratch/work"));
        assert_eq!(exec.base_dir, Path::new("/scratch/work"));
        assert_eq!(exec.max_parallel, 3);
        assert_eq!(exec.node_timeout, Duration::from_secs(86400));
        assert!(!exec.use_cache);
    }

    fn write_yaml(content: &str) -> NamedTempFile {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(content.as_bytes()).unwrap();
        temp_file
    }

    #[test]
    fn test_yaml_roundtrip() {
        let mut config = PreafqConfig::default();
        config.parameters.anat_subject = "fsaverage".to_string();

        let yaml = config.to_yaml().unwrap();
        assert!(yaml.contains("version: 1"));
        assert!(yaml.contains("anat_subject: fsaverage"));

        let parsed = PreafqConfig::from_yaml_str(&yaml).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_yaml_loading_partial_sections() {
        let temp_file = write_yaml(
            r#"
version: 1
execution:
  max_parallel_nodes: 2
  use_cache: false
tools:
  art: /opt/art/bin/rapidart
parameters:
  mask_dilate: 2
  art:
    norm_threshold: 1.5
    mask_type: thresh
"#,
        );

        let config = PreafqConfig::from_yaml(temp_file.path()).unwrap();
        assert_eq!(config.execution.max_parallel_nodes, 2);
        assert!(!config.execution.use_cache);
        assert_eq!(config.tools.art, "/opt/art/bin/rapidart");
        assert_eq!(config.tools.flirt, "flirt");
        assert_eq!(config.parameters.mask_dilate, 2);
        assert_eq!(config.parameters.art.norm_threshold, 1.5);
        assert_eq!(config.parameters.art.zintensity_threshold, 9.0);
        assert_eq!(config.parameters.tensor_scale, 1000.0);
    }

    #[test]
    fn test_yaml_missing_version() {
        let temp_file = write_yaml("execution:\n  use_cache: false\n");

        let result = PreafqConfig::from_yaml(temp_file.path());
        assert!(matches!(result, Err(ConfigError::MissingVersion)));
    }

    #[test]
    fn test_yaml_unsupported_version() {
        let temp_file = write_yaml("version: 2\n");

        let result = PreafqConfig::from_yaml(temp_file.path());
        assert!(matches!(
            result,
            Err(ConfigError::UnsupportedVersion { found: 2, .. })
        ));
    }

    #[test]
    fn test_yaml_unknown_field_rejected() {
        let temp_file = write_yaml("version: 1\nparameters:\n  mask_treshold: 0.4\n");

        let result = PreafqConfig::from_yaml(temp_file.path());
        assert!(matches!(result, Err(ConfigError::Yaml(_))));
    }

    #[test]
    fn test_yaml_out_of_range_rejected() {
        let temp_file = write_yaml("version: 1\nparameters:\n  tensor_scale: -1\n");

        let result = PreafqConfig::from_yaml(temp_file.path());
        assert!(matches!(result, Err(ConfigError::Range { .. })));
    }
}
