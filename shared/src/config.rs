//! Pipeline configuration loaded from TOML.
//!
//! Every section has defaults, so an empty file is a valid configuration that
//! runs the embedded knowledge asset with local-only image storage.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::classifier::DEFAULT_MAX_QUEUED;
use crate::image_processing::{PreprocessConfig, DEFAULT_INPUT_SIZE};
use crate::storage::{DEFAULT_REMOTE_FOLDER, DEFAULT_UPLOAD_ROOT};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("failed to parse config TOML: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("invalid configuration field {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub model: ModelConfig,
    pub preprocess: PreprocessConfig,
    pub knowledge: KnowledgeConfig,
    pub storage: StorageConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// ONNX classifier artifact.
    pub path: PathBuf,
    /// `{"0": label, ...}` file; the bundled mapping when unset.
    pub class_mapping: Option<PathBuf>,
    pub input_size: u32,
    pub max_queued: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("models/pest_classifier.onnx"),
            class_mapping: None,
            input_size: DEFAULT_INPUT_SIZE,
            max_queued: DEFAULT_MAX_QUEUED,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KnowledgeConfig {
    /// Overrides the embedded knowledge asset.
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub upload_root: PathBuf,
    pub remote_timeout_secs: u64,
    pub remote: Option<RemoteStorageConfig>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_root: PathBuf::from(DEFAULT_UPLOAD_ROOT),
            remote_timeout_secs: 15,
            remote: None,
        }
    }
}

impl StorageConfig {
    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteStorageConfig {
    pub endpoint: String,
    pub public_base_url: String,
    #[serde(default = "default_remote_folder")]
    pub folder: String,
    /// Name of the environment variable holding the bearer token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

fn default_remote_folder() -> String {
    DEFAULT_REMOTE_FOLDER.to_string()
}

fn default_token_env() -> String {
    "PESTID_REMOTE_TOKEN".to_string()
}

impl RemoteStorageConfig {
    pub fn token(&self) -> Option<String> {
        std::env::var(&self.token_env)
            .ok()
            .filter(|token| !token.trim().is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/pestid.db"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl PipelineConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Preprocessing settings with the model's input size applied.
    pub fn preprocess_config(&self) -> PreprocessConfig {
        PreprocessConfig {
            input_size: self.model.input_size,
            ..self.preprocess.clone()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model.input_size == 0 || self.model.input_size > 4096 {
            return Err(invalid(
                "model.input_size",
                format!("{} not in 1..=4096", self.model.input_size),
            ));
        }
        if self.model.max_queued == 0 {
            return Err(invalid("model.max_queued", "must be positive"));
        }
        if self.preprocess.max_concurrent_ops == 0 {
            return Err(invalid("preprocess.max_concurrent_ops", "must be positive"));
        }
        if self.preprocess.max_input_bytes == Some(0) {
            return Err(invalid("preprocess.max_input_bytes", "must be positive"));
        }
        if self.storage.remote_timeout_secs == 0 {
            return Err(invalid("storage.remote_timeout_secs", "must be positive"));
        }
        if self.storage.upload_root.as_os_str().is_empty() {
            return Err(invalid("storage.upload_root", "must not be empty"));
        }
        if let Some(remote) = &self.storage.remote {
            if remote.endpoint.trim().is_empty() {
                return Err(invalid("storage.remote.endpoint", "must not be empty"));
            }
            if remote.public_base_url.trim().is_empty() {
                return Err(invalid("storage.remote.public_base_url", "must not be empty"));
            }
            if remote.folder.trim_matches('/').is_empty() {
                return Err(invalid("storage.remote.folder", "must not be empty"));
            }
        }
        if self.logging.level.parse::<tracing::Level>().is_err() {
            return Err(invalid(
                "logging.level",
                format!("unknown level {:?}", self.logging.level),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_document_is_valid() {
        let config = PipelineConfig::from_toml("").unwrap();
        assert_eq!(config.model.input_size, 224);
        assert_eq!(config.storage.upload_root, PathBuf::from("static/uploads"));
        assert!(config.storage.remote.is_none());
        assert_eq!(config.logging.level, "info");
        assert!(config.preprocess.max_input_bytes.is_none());
    }

    #[test]
    fn parses_all_sections() {
        let toml = r#"
            [model]
            path = "/opt/models/pests.onnx"
            class_mapping = "/opt/models/class_mapping.json"
            max_queued = 8

            [preprocess]
            max_input_bytes = 1048576
            max_concurrent_ops = 2

            [knowledge]
            path = "/opt/pestid/knowledge.json"

            [storage]
            upload_root = "/var/lib/pestid/uploads"
            remote_timeout_secs = 5

            [storage.remote]
            endpoint = "https://upload.example.test/v1/objects"
            public_base_url = "https://cdn.example.test"

            [database]
            path = "/var/lib/pestid/pestid.db"

            [logging]
            level = "debug"
            json = true
        "#;

        let config = PipelineConfig::from_toml(toml).unwrap();

        assert_eq!(config.model.max_queued, 8);
        assert_eq!(config.preprocess.max_concurrent_ops, 2);
        assert_eq!(config.preprocess.max_input_bytes, Some(1_048_576));
        assert_eq!(config.preprocess.max_image_pixels, None);
        assert_eq!(config.preprocess_config().input_size, 224);
        assert_eq!(config.storage.remote_timeout(), Duration::from_secs(5));
        let remote = config.storage.remote.unwrap();
        assert_eq!(remote.folder, "pest_detection");
        assert_eq!(remote.token_env, "PESTID_REMOTE_TOKEN");
        assert!(config.logging.json);
    }

    #[test]
    fn model_input_size_drives_preprocessing() {
        let config = PipelineConfig::from_toml("[model]\ninput_size = 128\n").unwrap();
        assert_eq!(config.preprocess_config().input_size, 128);
    }

    #[test]
    fn rejects_zero_queue() {
        let err = PipelineConfig::from_toml("[model]\nmax_queued = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "model.max_queued", .. }));
    }

    #[test]
    fn rejects_unknown_log_level() {
        let err = PipelineConfig::from_toml("[logging]\nlevel = \"loud\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "logging.level", .. }));
    }

    #[test]
    fn rejects_remote_without_endpoint() {
        let toml = "[storage.remote]\nendpoint = \"\"\npublic_base_url = \"https://cdn.example.test\"\n";
        let err = PipelineConfig::from_toml(toml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "storage.remote.endpoint", .. }));
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(matches!(
            PipelineConfig::from_toml("[model\n"),
            Err(ConfigError::TomlParse(_))
        ));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[database]\npath = \"detections.db\"").unwrap();

        let config = PipelineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.database.path, PathBuf::from("detections.db"));

        let missing = PipelineConfig::from_file(file.path().with_extension("absent"));
        assert!(matches!(missing, Err(ConfigError::FileRead(_))));
    }
}
