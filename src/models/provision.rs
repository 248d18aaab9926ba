use crate::error::{LungsegError, Result};
use crate::models::bundle::{InstallRecord, ModelBundle, INSTALL_RECORD};
use crate::models::download::{
    check_disk_space, compute_sha256, extract_zip, format_bytes, ArchiveFetcher,
};
use crate::models::registry::{Mode, ModelInfo, ModelRegistry, Structure};
use std::fs;
use std::path::{Path, PathBuf};

/// Result of provisioning one model
#[derive(Debug)]
pub struct Provisioned {
    pub bundle: ModelBundle,
    /// False when the model folder was already on disk
    pub downloaded: bool,
}

/// Model provisioner: makes sure a bundle is on disk before a run
pub struct Provisioner<F> {
    registry: ModelRegistry,
    models_dir: PathBuf,
    fetcher: F,
    verify_checksums: bool,
}

impl<F: ArchiveFetcher> Provisioner<F> {
    /// Create a provisioner, creating the models directory if needed
    pub fn new(registry: ModelRegistry, models_dir: impl Into<PathBuf>, fetcher: F) -> Result<Self> {
        let models_dir = models_dir.into();
        fs::create_dir_all(&models_dir)?;

        Ok(Self {
            registry,
            models_dir,
            fetcher,
            verify_checksums: true,
        })
    }

    #[must_use]
    pub const fn with_checksum_verification(mut self, enabled: bool) -> Self {
        self.verify_checksums = enabled;
        self
    }

    #[must_use]
    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    #[must_use]
    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Get path where a model's files live
    #[must_use]
    pub fn model_path(&self, info: &ModelInfo) -> PathBuf {
        self.models_dir.join(&info.model_name)
    }

    /// Check if a model is installed (folder presence only)
    #[must_use]
    pub fn is_installed(&self, info: &ModelInfo) -> bool {
        self.model_path(info).is_dir()
    }

    /// Registry entries with their install state
    pub fn installed(&self) -> impl Iterator<Item = (&ModelInfo, bool)> {
        self.registry.iter().map(|info| (info, self.is_installed(info)))
    }

    /// Ensure the model for (mode, structure) is on disk and open it
    ///
    /// `fold` overrides the registry's fold when given.
    pub fn provision(
        &self,
        mode: Mode,
        structure: Structure,
        fold: Option<&str>,
    ) -> Result<Provisioned> {
        let info = self.registry.lookup(mode, structure)?;
        let model_path = self.model_path(info);
        let fold = fold.unwrap_or(&info.fold);

        let downloaded = if model_path.exists() {
            tracing::info!(
                "Model '{}' already present in {}",
                info.model_name,
                self.models_dir.display()
            );
            false
        } else {
            self.install(info, &model_path)?;
            true
        };

        let bundle = ModelBundle::open(&model_path, fold)?;
        Ok(Provisioned { bundle, downloaded })
    }

    /// Download, verify and extract a model into `model_path`
    ///
    /// Extraction happens in a sibling folder renamed into place at the end,
    /// so a failed install never leaves a folder that looks provisioned.
    fn install(&self, info: &ModelInfo, model_path: &Path) -> Result<()> {
        if let Some(size_mb) = info.size_mb {
            check_disk_space(&self.models_dir, size_mb)?;
        }

        let archive_path = self.models_dir.join(format!("{}.zip.part", info.model_name));
        let extract_path = self.models_dir.join(format!(".{}.extracting", info.model_name));

        let result = self.download_and_extract(info, &archive_path, &extract_path, model_path);

        remove_quietly(&archive_path);
        if result.is_err() {
            remove_quietly(&extract_path);
        }
        result
    }

    fn download_and_extract(
        &self,
        info: &ModelInfo,
        archive_path: &Path,
        extract_path: &Path,
        model_path: &Path,
    ) -> Result<()> {
        tracing::info!("Downloading model '{}' from {}", info.model_name, info.url);
        let size_bytes = self.fetcher.fetch(&info.url, archive_path)?;
        tracing::info!("Downloaded {} ({})", info.model_name, format_bytes(size_bytes));

        let checksum = compute_sha256(archive_path)?;
        if let Some(expected) = info.sha256.as_deref().filter(|_| self.verify_checksums) {
            if !checksum.eq_ignore_ascii_case(expected) {
                return Err(LungsegError::Download(format!(
                    "Checksum mismatch for {}: expected {expected}, got {checksum}",
                    info.url
                )));
            }
            tracing::debug!("Checksum verified for {}", info.model_name);
        }

        if extract_path.exists() {
            fs::remove_dir_all(extract_path)?;
        }
        let files = extract_zip(archive_path, extract_path)?;
        tracing::info!("Extracted {files} files for model '{}'", info.model_name);

        // An archive nnUNet cannot use must not become a cached model folder
        ModelBundle::open(extract_path, &info.fold)?;

        InstallRecord {
            url: info.url.clone(),
            size_bytes,
            checksum: Some(checksum),
            downloaded_at: chrono::Utc::now().to_rfc3339(),
        }
        .save(&extract_path.join(INSTALL_RECORD))?;

        fs::rename(extract_path, model_path)?;
        tracing::info!("Model extracted to {}", model_path.display());
        Ok(())
    }
}

fn remove_quietly(path: &Path) {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else if path.exists() {
        fs::remove_file(path)
    } else {
        return;
    };
    if let Err(e) = result {
        tracing::warn!("Failed to remove {}: {e}", path.display());
    }
}
