use crate::error::{LungsegError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable overriding `models.base_url`
pub const BASE_URL_ENV: &str = "LUNGSEG_MODELS_URL";

/// Main configuration structure
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub prediction: PredictionConfig,
    #[serde(default)]
    pub staging: StagingConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct ModelsConfig {
    /// Where model bundles are cached; defaults to `<data dir>/lungseg/models`
    pub dir: Option<PathBuf>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// JSON registry replacing the built-in model table
    pub registry: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub verify_checksums: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct DownloadConfig {
    /// Zero disables the timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_true")]
    pub progress: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct PredictionConfig {
    #[serde(default = "default_executable")]
    pub executable: String,
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_step_size")]
    pub step_size: f32,
    #[serde(default)]
    pub disable_tta: bool,
    #[serde(default = "default_workers")]
    pub preprocessing_workers: u32,
    #[serde(default = "default_workers")]
    pub export_workers: u32,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct StagingConfig {
    /// Parent of per-run work dirs; system temp dir when unset
    pub root: Option<PathBuf>,
    /// Keep the work dir after the run for inspection
    #[serde(default)]
    pub keep_temp: bool,
}

// Default value functions
fn default_base_url() -> String {
    "https://github.com/lungseg/lungseg-models/releases/download/v1".to_string()
}
fn default_true() -> bool {
    true
}
fn default_timeout_secs() -> u64 {
    1800
}
fn default_executable() -> String {
    "nnUNetv2_predict_from_modelfolder".to_string()
}
fn default_device() -> String {
    "cuda".to_string()
}
fn default_step_size() -> f32 {
    0.5
}
fn default_workers() -> u32 {
    3
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            dir: None,
            base_url: default_base_url(),
            registry: None,
            verify_checksums: default_true(),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            progress: default_true(),
        }
    }
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            device: default_device(),
            step_size: default_step_size(),
            disable_tta: false,
            preprocessing_workers: default_workers(),
            export_workers: default_workers(),
        }
    }
}

impl Config {
    /// Load config from the default location, falling back to defaults
    pub fn load() -> Result<Self> {
        let mut config = match config_path() {
            Some(path) if path.exists() => Self::read_file(&path)?,
            _ => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Load config from an explicit file, which must exist
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(LungsegError::Configuration(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        let mut config = Self::read_file(path)?;
        config.apply_env();
        Ok(config)
    }

    fn read_file(path: &Path) -> Result<Self> {
        tracing::debug!("Loading config from {}", path.display());
        let content = fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| {
            LungsegError::Configuration(format!("Failed to parse {}: {e}", path.display()))
        })
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(BASE_URL_ENV) {
            if !url.trim().is_empty() {
                self.models.base_url = url.trim().to_string();
            }
        }
    }

    /// Resolved models directory
    pub fn models_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.models.dir {
            return Ok(dir.clone());
        }
        dirs::data_dir()
            .map(|d| d.join("lungseg").join("models"))
            .ok_or_else(|| {
                LungsegError::Configuration(
                    "Cannot determine data directory; pass --models_dir".to_string(),
                )
            })
    }
}

/// Default config file location: `$XDG_CONFIG_HOME/lungseg/config.toml`
#[must_use]
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("lungseg").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [prediction]
            device = "cpu"
            "#,
        )
        .unwrap();

        assert_eq!(config.prediction.device, "cpu");
        assert_eq!(config.prediction.executable, "nnUNetv2_predict_from_modelfolder");
        assert_eq!(config.prediction.preprocessing_workers, 3);
        assert!(config.models.verify_checksums);
        assert!(config.models.dir.is_none());
        assert!(!config.staging.keep_temp);
    }

    #[test]
    fn test_empty_config_equals_default() {
        let parsed: Config = toml::from_str("").unwrap();
        let default = Config::default();
        assert_eq!(parsed.models.base_url, default.models.base_url);
        assert_eq!(parsed.download.timeout_secs, default.download.timeout_secs);
        assert!((parsed.prediction.step_size - 0.5).abs() < f32::EPSILON);
    }

    #[test]
    #[serial]
    fn test_load_from_file_with_env_override() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[models]\ndir = \"/srv/models\"\nbase_url = \"https://a.example\"\n",
        )
        .unwrap();

        std::env::set_var(BASE_URL_ENV, "file:///mirror");
        let config = Config::load_from(&path).unwrap();
        std::env::remove_var(BASE_URL_ENV);

        assert_eq!(config.models.base_url, "file:///mirror");
        assert_eq!(config.models_dir().unwrap(), PathBuf::from("/srv/models"));
    }

    #[test]
    fn test_load_from_missing_file() {
        let err = Config::load_from(Path::new("/nonexistent/lungseg.toml")).unwrap_err();
        assert!(matches!(err, LungsegError::Configuration(_)));
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[models\n").unwrap();
        assert!(matches!(
            Config::load_from(&path),
            Err(LungsegError::Configuration(_))
        ));
    }
}
