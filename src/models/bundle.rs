use crate::error::{LungsegError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Name of the install record written into each provisioned model folder
pub const INSTALL_RECORD: &str = ".lungseg-install.json";

/// File ending nnUNet assumes when `dataset.json` does not say
pub const DEFAULT_FILE_ENDING: &str = ".nrrd";

/// A provisioned model on disk
#[derive(Debug, Clone)]
pub struct ModelBundle {
    /// `<models_dir>/<model_name>`
    pub root: PathBuf,
    /// Trained model folder (holds `dataset.json`, `plans.json`, `fold_*`)
    pub model_folder: PathBuf,
    pub fold: String,
    pub descriptor: DatasetDescriptor,
}

/// The parts of nnUNet's `dataset.json` lungseg cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetDescriptor {
    pub name: Option<String>,
    pub file_ending: String,
    /// Foreground labels, index -> name
    pub labels: BTreeMap<u32, String>,
}

#[derive(Deserialize)]
struct RawDataset {
    name: Option<String>,
    file_ending: Option<String>,
    #[serde(default)]
    labels: BTreeMap<String, serde_json::Value>,
}

/// Information about an installed model, kept next to its files
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstallRecord {
    pub url: String,
    pub size_bytes: u64,
    pub checksum: Option<String>,
    pub downloaded_at: String,
}

impl ModelBundle {
    /// Open an already provisioned bundle
    pub fn open(root: &Path, fold: &str) -> Result<Self> {
        let dataset_json = find_dataset_json(root)?;
        let model_folder = dataset_json
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| root.to_path_buf());

        if !model_folder.join("plans.json").exists() {
            tracing::warn!(
                "No plans.json next to {}; nnUNet will likely refuse this model",
                dataset_json.display()
            );
        }

        let descriptor = DatasetDescriptor::load(&dataset_json)?;
        tracing::debug!(
            "Model folder {} ({} labels, file ending {})",
            model_folder.display(),
            descriptor.labels.len(),
            descriptor.file_ending
        );

        Ok(Self {
            root: root.to_path_buf(),
            model_folder,
            fold: fold.to_string(),
            descriptor,
        })
    }

    /// Install record, if the bundle was provisioned by lungseg
    #[must_use]
    pub fn install_record(&self) -> Option<InstallRecord> {
        InstallRecord::load(&self.root.join(INSTALL_RECORD))
    }
}

impl DatasetDescriptor {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content).map_err(|reason| {
            LungsegError::InvalidModel(format!("{}: {reason}", path.display()))
        })
    }

    fn parse(content: &str) -> std::result::Result<Self, String> {
        let raw: RawDataset = serde_json::from_str(content).map_err(|e| e.to_string())?;

        let mut labels = BTreeMap::new();
        for (name, value) in raw.labels {
            // Regions group several labels and own no index of their own
            if value.is_array() {
                continue;
            }
            let index = label_index(&value)
                .ok_or_else(|| format!("label '{name}' has a non-integer value {value}"))?;
            if index > 0 {
                labels.insert(index, name);
            }
        }

        let file_ending = raw
            .file_ending
            .filter(|e| !e.is_empty())
            .map_or_else(|| DEFAULT_FILE_ENDING.to_string(), |e| {
                if e.starts_with('.') {
                    e
                } else {
                    format!(".{e}")
                }
            });

        Ok(Self {
            name: raw.name,
            file_ending,
            labels,
        })
    }
}

fn label_index(value: &serde_json::Value) -> Option<u32> {
    match value {
        serde_json::Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

impl InstallRecord {
    #[must_use]
    pub fn load(path: &Path) -> Option<Self> {
        let content = fs::read_to_string(path).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Save atomically (tmp + rename)
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp_path = path.with_extension("tmp");
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| LungsegError::Other(format!("Failed to serialize install record: {e}")))?;
        fs::write(&tmp_path, content)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

/// Search the bundle for nnUNet's `dataset.json`, shallowest match first
pub fn find_dataset_json(root: &Path) -> Result<PathBuf> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file() && e.file_name() == "dataset.json")
        .min_by_key(walkdir::DirEntry::depth)
        .map(walkdir::DirEntry::into_path)
        .ok_or_else(|| {
            LungsegError::InvalidModel(format!("dataset.json not found in {}", root.display()))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const DATASET: &str = r#"{
        "channel_names": { "0": "CT" },
        "labels": { "background": 0, "left_lung": 1, "right_lung": "2", "lungs": [1, 2] },
        "numTraining": 40,
        "file_ending": ".nrrd",
        "name": "Dataset101_InvivoParenchyma"
    }"#;

    #[test]
    fn test_parse_descriptor() {
        let descriptor = DatasetDescriptor::parse(DATASET).unwrap();
        assert_eq!(descriptor.file_ending, ".nrrd");
        assert_eq!(descriptor.name.as_deref(), Some("Dataset101_InvivoParenchyma"));
        assert!(!descriptor.labels.values().any(|n| n == "background"));
        assert_eq!(descriptor.labels.get(&2).map(String::as_str), Some("right_lung"));
    }

    #[test]
    fn test_region_labels_do_not_replace_classes() {
        let descriptor = DatasetDescriptor::parse(DATASET).unwrap();
        assert_eq!(descriptor.labels.len(), 2);
        assert_eq!(descriptor.labels.get(&1).map(String::as_str), Some("left_lung"));
        assert!(!descriptor.labels.values().any(|n| n == "lungs"));
    }

    #[test]
    fn test_parse_descriptor_defaults() {
        let descriptor = DatasetDescriptor::parse(r#"{ "file_ending": "nii.gz" }"#).unwrap();
        assert_eq!(descriptor.file_ending, ".nii.gz");
        assert!(descriptor.labels.is_empty());

        let descriptor = DatasetDescriptor::parse("{}").unwrap();
        assert_eq!(descriptor.file_ending, DEFAULT_FILE_ENDING);
    }

    #[test]
    fn test_parse_descriptor_bad_label() {
        assert!(DatasetDescriptor::parse(r#"{ "labels": { "x": "one" } }"#).is_err());
    }

    #[test]
    fn test_open_nested_bundle() {
        let dir = TempDir::new().unwrap();
        let folder = dir
            .path()
            .join("Dataset101_InvivoParenchyma/nnUNetTrainer__nnUNetPlans__3d_fullres");
        fs::create_dir_all(folder.join("fold_0")).unwrap();
        fs::write(folder.join("dataset.json"), DATASET).unwrap();
        fs::write(folder.join("plans.json"), "{}").unwrap();
        // A deeper copy must not win over the shallow one
        fs::write(folder.join("fold_0/dataset.json"), "{}").unwrap();

        let bundle = ModelBundle::open(dir.path(), "0").unwrap();
        assert_eq!(bundle.model_folder, folder);
        assert_eq!(bundle.fold, "0");
        assert_eq!(bundle.descriptor.labels.len(), 2);
        assert!(bundle.install_record().is_none());
    }

    #[test]
    fn test_open_without_dataset_json() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("checkpoint.pth"), "x").unwrap();
        assert!(matches!(
            ModelBundle::open(dir.path(), "0"),
            Err(LungsegError::InvalidModel(_))
        ));
    }

    #[test]
    fn test_install_record_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(INSTALL_RECORD);
        let record = InstallRecord {
            url: "https://models.example/a.zip".to_string(),
            size_bytes: 42,
            checksum: Some("abc123".to_string()),
            downloaded_at: "2026-01-01T00:00:00Z".to_string(),
        };

        record.save(&path).unwrap();
        assert_eq!(InstallRecord::load(&path), Some(record));
        assert!(!path.with_extension("tmp").exists());
    }
}
