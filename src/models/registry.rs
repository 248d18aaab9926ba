use crate::error::{LungsegError, Result};
use clap::ValueEnum;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

/// Acquisition context of the scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum)]
pub enum Mode {
    #[value(name = "Invivo")]
    Invivo,
    #[value(name = "Exvivo")]
    Exvivo,
}

/// Anatomical target of the segmentation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum)]
pub enum Structure {
    #[value(name = "Parenchyma")]
    Parenchyma,
    #[value(name = "Airways")]
    Airways,
    #[value(name = "Vascular")]
    Vascular,
    #[value(name = "ParenchymaAirways")]
    ParenchymaAirways,
    #[value(name = "All")]
    All,
    #[value(name = "Lobes")]
    Lobes,
}

impl Mode {
    pub const ALL: [Self; 2] = [Self::Invivo, Self::Exvivo];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Invivo => "Invivo",
            Self::Exvivo => "Exvivo",
        }
    }

    const fn dataset_base(self) -> u32 {
        match self {
            Self::Invivo => 100,
            Self::Exvivo => 200,
        }
    }
}

impl Structure {
    pub const ALL: [Self; 6] = [
        Self::Parenchyma,
        Self::Airways,
        Self::Vascular,
        Self::ParenchymaAirways,
        Self::All,
        Self::Lobes,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Parenchyma => "Parenchyma",
            Self::Airways => "Airways",
            Self::Vascular => "Vascular",
            Self::ParenchymaAirways => "ParenchymaAirways",
            Self::All => "All",
            Self::Lobes => "Lobes",
        }
    }

    const fn dataset_offset(self) -> u32 {
        match self {
            Self::Parenchyma => 1,
            Self::Airways => 2,
            Self::Vascular => 3,
            Self::ParenchymaAirways => 4,
            Self::All => 5,
            Self::Lobes => 6,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Structure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = LungsegError;

    fn from_str(s: &str) -> Result<Self> {
        parse_named(s, &Self::ALL, Self::as_str, "mode")
    }
}

impl FromStr for Structure {
    type Err = LungsegError;

    fn from_str(s: &str) -> Result<Self> {
        parse_named(s, &Self::ALL, Self::as_str, "structure")
    }
}

fn parse_named<T: Copy>(
    s: &str,
    all: &[T],
    name: fn(T) -> &'static str,
    kind: &str,
) -> Result<T> {
    let wanted = s.trim();
    if let Some(v) = all.iter().find(|v| name(**v).eq_ignore_ascii_case(wanted)) {
        return Ok(*v);
    }

    let names: Vec<&str> = all.iter().map(|v| name(*v)).collect();
    let hint = suggest(wanted, &names)
        .map(|n| format!(" Did you mean '{n}'?"))
        .unwrap_or_default();
    Err(LungsegError::Configuration(format!(
        "Unknown {kind} '{wanted}'.{hint} Valid values: {}",
        names.join(", ")
    )))
}

/// Everything needed to fetch and run one trained model
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    pub mode: Mode,
    pub structure: Structure,
    pub url: String,
    /// Folder name under the models directory
    pub model_name: String,
    pub dataset_id: String,
    pub configuration: String,
    pub fold: String,
    /// Hex SHA-256 of the archive, verified after download when present
    pub sha256: Option<String>,
    pub size_mb: Option<u64>,
}

impl ModelInfo {
    /// nnUNet's name for the trained model, e.g. `Dataset101 3d_fullres fold 0`
    #[must_use]
    pub fn nnunet_label(&self) -> String {
        let dataset = match self.dataset_id.parse::<u32>() {
            Ok(id) => format!("Dataset{id:03}"),
            Err(_) => self.dataset_id.clone(),
        };
        format!("{dataset} {} fold {}", self.configuration, self.fold)
    }
}

/// (mode, structure) -> model mapping
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    entries: BTreeMap<(Mode, Structure), ModelInfo>,
}

/// One entry of a `models.json` registry file
#[derive(Debug, Deserialize)]
struct RegistryEntry {
    model_url: String,
    model_name: String,
    model_id: NumOrString,
    #[serde(default = "default_configuration")]
    configuration: String,
    #[serde(default = "default_fold")]
    fold: NumOrString,
    sha256: Option<String>,
    size_mb: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NumOrString {
    Num(u64),
    Str(String),
}

impl fmt::Display for NumOrString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Num(n) => write!(f, "{n}"),
            Self::Str(s) => f.write_str(s),
        }
    }
}

fn default_configuration() -> String {
    "3d_fullres".to_string()
}
fn default_fold() -> NumOrString {
    NumOrString::Num(0)
}

impl ModelRegistry {
    /// Built-in table: every (mode, structure) pair, archives under `base_url`
    #[must_use]
    pub fn builtin(base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        let mut entries = BTreeMap::new();

        for mode in Mode::ALL {
            for structure in Structure::ALL {
                let id = mode.dataset_base() + structure.dataset_offset();
                let model_name = format!("Dataset{id:03}_{mode}{structure}");
                entries.insert(
                    (mode, structure),
                    ModelInfo {
                        mode,
                        structure,
                        url: format!("{base}/{model_name}.zip"),
                        model_name,
                        dataset_id: id.to_string(),
                        configuration: default_configuration(),
                        fold: "0".to_string(),
                        sha256: None,
                        size_mb: None,
                    },
                );
            }
        }

        Self { entries }
    }

    /// Load a registry from a `models.json` file
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_json_str(&content).map_err(|e| match e {
            LungsegError::Configuration(msg) => {
                LungsegError::Configuration(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    /// Parse `{ "<Mode>": { "<Structure>": { ... } } }`
    pub fn from_json_str(content: &str) -> Result<Self> {
        let raw: BTreeMap<String, BTreeMap<String, RegistryEntry>> =
            serde_json::from_str(content).map_err(|e| {
                LungsegError::Configuration(format!("Failed to parse model registry: {e}"))
            })?;

        let mut entries = BTreeMap::new();
        for (mode_name, structures) in raw {
            let mode: Mode = mode_name.parse()?;
            for (structure_name, entry) in structures {
                let structure: Structure = structure_name.parse()?;
                if entry.model_name.is_empty()
                    || entry.model_name.contains(&['/', '\\'][..])
                    || entry.model_name == ".."
                {
                    return Err(LungsegError::Configuration(format!(
                        "Invalid model_name '{}' for {mode}/{structure}",
                        entry.model_name
                    )));
                }
                entries.insert(
                    (mode, structure),
                    ModelInfo {
                        mode,
                        structure,
                        url: entry.model_url,
                        model_name: entry.model_name,
                        dataset_id: entry.model_id.to_string(),
                        configuration: entry.configuration,
                        fold: entry.fold.to_string(),
                        sha256: entry.sha256.map(|s| s.to_ascii_lowercase()),
                        size_mb: entry.size_mb,
                    },
                );
            }
        }

        Ok(Self { entries })
    }

    /// Find the model for a (mode, structure) pair
    pub fn lookup(&self, mode: Mode, structure: Structure) -> Result<&ModelInfo> {
        self.entries.get(&(mode, structure)).ok_or_else(|| {
            LungsegError::Configuration(format!(
                "No model registered for mode '{mode}' and structure '{structure}'"
            ))
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModelInfo> {
        self.entries.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Find closest match using Levenshtein distance
#[must_use]
pub fn suggest<'a>(name: &str, candidates: &[&'a str]) -> Option<&'a str> {
    if name.is_empty() {
        return None;
    }

    let lowered = name.to_ascii_lowercase();
    candidates
        .iter()
        .map(|c| (*c, levenshtein_distance(&lowered, &c.to_ascii_lowercase())))
        .min_by_key(|(_, dist)| *dist)
        .filter(|(_, dist)| *dist <= 2) // Only suggest if within 2 edits
        .map(|(candidate, _)| candidate)
}

/// Calculate Levenshtein distance between two strings
#[allow(clippy::needless_range_loop)]
fn levenshtein_distance(s1: &str, s2: &str) -> usize {
    let len1 = s1.chars().count();
    let len2 = s2.chars().count();

    if len1 == 0 {
        return len2;
    }
    if len2 == 0 {
        return len1;
    }

    let mut matrix = vec![vec![0; len2 + 1]; len1 + 1];

    for i in 0..=len1 {
        matrix[i][0] = i;
    }
    for j in 0..=len2 {
        matrix[0][j] = j;
    }

    for (i, c1) in s1.chars().enumerate() {
        for (j, c2) in s2.chars().enumerate() {
            let cost = usize::from(c1 != c2);
            matrix[i + 1][j + 1] = (matrix[i][j + 1] + 1)
                .min(matrix[i + 1][j] + 1)
                .min(matrix[i][j] + cost);
        }
    }

    matrix[len1][len2]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_covers_every_pair() {
        let registry = ModelRegistry::builtin("https://models.example/v1/");
        assert_eq!(registry.len(), 12);

        for mode in Mode::ALL {
            for structure in Structure::ALL {
                let info = registry.lookup(mode, structure).unwrap();
                assert_eq!(info.mode, mode);
                assert_eq!(info.structure, structure);
                assert!(info.url.starts_with("https://models.example/v1/Dataset"));
                assert!(info.url.ends_with(".zip"));
            }
        }
    }

    #[test]
    fn test_builtin_names_are_unique() {
        let registry = ModelRegistry::builtin("https://models.example");
        let mut names: Vec<&str> = registry.iter().map(|m| m.model_name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), 12);

        let info = registry.lookup(Mode::Invivo, Structure::Parenchyma).unwrap();
        assert_eq!(info.model_name, "Dataset101_InvivoParenchyma");
        assert_eq!(info.dataset_id, "101");
        assert_eq!(info.configuration, "3d_fullres");
        assert_eq!(info.nnunet_label(), "Dataset101 3d_fullres fold 0");
    }

    #[test]
    fn test_parse_mode_and_structure() {
        assert_eq!("Invivo".parse::<Mode>().unwrap(), Mode::Invivo);
        assert_eq!("exvivo".parse::<Mode>().unwrap(), Mode::Exvivo);
        assert_eq!(
            "parenchymaairways".parse::<Structure>().unwrap(),
            Structure::ParenchymaAirways
        );
    }

    #[test]
    fn test_parse_suggests_close_match() {
        let err = "Airway".parse::<Structure>().unwrap_err().to_string();
        assert!(err.contains("Did you mean 'Airways'"), "{err}");

        let err = "Axial".parse::<Mode>().unwrap_err().to_string();
        assert!(!err.contains("Did you mean"), "{err}");
    }

    #[test]
    fn test_json_registry() {
        let json = r#"{
            "Invivo": {
                "Airways": {
                    "model_url": "file:///mirror/airways.zip",
                    "model_name": "Invivo_Airways",
                    "model_id": "Dataset012_Airways",
                    "configuration": "3d_lowres",
                    "fold": 2,
                    "sha256": "ABCDEF"
                }
            }
        }"#;
        let registry = ModelRegistry::from_json_str(json).unwrap();
        assert_eq!(registry.len(), 1);

        let info = registry.lookup(Mode::Invivo, Structure::Airways).unwrap();
        assert_eq!(info.url, "file:///mirror/airways.zip");
        assert_eq!(info.dataset_id, "Dataset012_Airways");
        assert_eq!(info.configuration, "3d_lowres");
        assert_eq!(info.fold, "2");
        assert_eq!(info.sha256.as_deref(), Some("abcdef"));
        assert_eq!(info.nnunet_label(), "Dataset012_Airways 3d_lowres fold 2");

        let missing = registry.lookup(Mode::Exvivo, Structure::Lobes);
        assert!(matches!(missing, Err(LungsegError::Configuration(_))));
    }

    #[test]
    fn test_json_registry_rejects_unknown_keys() {
        let json = r#"{ "Invivo": { "Bronchi": {
            "model_url": "u", "model_name": "n", "model_id": 1 } } }"#;
        assert!(ModelRegistry::from_json_str(json).is_err());
    }

    #[test]
    fn test_json_registry_rejects_path_in_name() {
        let json = r#"{ "Invivo": { "Lobes": {
            "model_url": "u", "model_name": "../escape", "model_id": 1 } } }"#;
        assert!(matches!(
            ModelRegistry::from_json_str(json),
            Err(LungsegError::Configuration(_))
        ));
    }

    #[test]
    fn test_suggest() {
        let names = ["Parenchyma", "Airways", "Lobes"];
        assert_eq!(suggest("Lobe", &names), Some("Lobes"));
        assert_eq!(suggest("airwys", &names), Some("Airways"));
        assert_eq!(suggest("invalid123", &names), None);
        assert_eq!(suggest("", &names), None);
    }

    #[test]
    fn test_levenshtein_distance() {
        assert_eq!(levenshtein_distance("", ""), 0);
        assert_eq!(levenshtein_distance("lobes", "lobes"), 0);
        assert_eq!(levenshtein_distance("kitten", "sitting"), 3);
    }
}
