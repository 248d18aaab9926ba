//! One segmentation run, stage by stage
//!
//! provision → normalize → stage → predict → finalize. Each stage takes the
//! previous stage's path and returns a typed result, so stages can be
//! exercised on their own. All temporaries live in a per-run work dir that
//! is removed whether the run succeeds or not.

pub mod finalize;
pub mod normalize;
pub mod predict;
pub mod stage;

pub use finalize::{PredictionResult, DEFAULT_RESULT_NAME};
pub use normalize::NormalizedImage;
pub use predict::{NnUnetCli, PredictionRequest, Predictor};
pub use stage::StagedCase;

use crate::error::{LungsegError, Result};
use crate::image::ImageFormat;
use crate::models::{ArchiveFetcher, Mode, Provisioner, Structure};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Instant;
use tempfile::TempDir;

/// What the user asked for
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub mode: Mode,
    pub structure: Structure,
    pub input: PathBuf,
    pub output_dir: PathBuf,
    /// Result file name without extension
    pub name: String,
    /// Overrides the registry's fold
    pub fold: Option<String>,
}

impl RunRequest {
    /// Request with the default output dir and result name
    #[must_use]
    pub fn new(mode: Mode, structure: Structure, input: impl Into<PathBuf>) -> Self {
        Self {
            mode,
            structure,
            input: input.into(),
            output_dir: PathBuf::from(DEFAULT_RESULT_NAME),
            name: DEFAULT_RESULT_NAME.to_string(),
            fold: None,
        }
    }
}

/// What a successful run produced
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub result_path: PathBuf,
    pub model_folder: PathBuf,
    /// True when the model had to be downloaded for this run
    pub downloaded: bool,
    /// Foreground labels of the model, index -> name
    pub labels: BTreeMap<u32, String>,
}

/// The five stages wired together
pub struct Pipeline<F, P> {
    provisioner: Provisioner<F>,
    predictor: P,
    staging_root: Option<PathBuf>,
    keep_temp: bool,
}

impl<F: ArchiveFetcher, P: Predictor> Pipeline<F, P> {
    pub fn new(provisioner: Provisioner<F>, predictor: P) -> Self {
        Self {
            provisioner,
            predictor,
            staging_root: None,
            keep_temp: false,
        }
    }

    /// Parent directory for per-run work dirs (system temp dir when `None`)
    #[must_use]
    pub fn with_staging_root(mut self, root: Option<PathBuf>) -> Self {
        self.staging_root = root;
        self
    }

    /// Keep the work dir after the run instead of deleting it
    #[must_use]
    pub const fn keep_temp(mut self, keep: bool) -> Self {
        self.keep_temp = keep;
        self
    }

    #[must_use]
    pub fn provisioner(&self) -> &Provisioner<F> {
        &self.provisioner
    }

    /// Run one segmentation
    ///
    /// # Errors
    /// Unsupported inputs are rejected before any download or staging;
    /// every later failure aborts the run after cleaning up the work dir.
    pub fn run(&self, request: &RunRequest) -> Result<RunOutcome> {
        let started = Instant::now();
        normalize::input_format(&request.input)?;
        if !request.input.is_file() {
            return Err(LungsegError::Configuration(format!(
                "Input file not found: {}",
                request.input.display()
            )));
        }

        let provisioned = self.provisioner.provision(
            request.mode,
            request.structure,
            request.fold.as_deref(),
        )?;
        let bundle = provisioned.bundle;

        let ending = &bundle.descriptor.file_ending;
        let target = ImageFormat::from_extension(ending).ok_or_else(|| {
            LungsegError::InvalidModel(format!(
                "{}: file_ending '{ending}' is not a format lungseg can write",
                bundle.model_folder.display()
            ))
        })?;

        let work = self.create_work_dir()?;
        tracing::debug!("Work dir {}", work.path().display());

        let result = self.run_in(request, &bundle.model_folder, &bundle.fold, target, &work);
        self.cleanup(work);
        let result = result?;

        tracing::info!(
            "Segmentation of {} finished in {:.1}s",
            request.input.display(),
            started.elapsed().as_secs_f64()
        );

        Ok(RunOutcome {
            result_path: result.path,
            model_folder: bundle.model_folder,
            downloaded: provisioned.downloaded,
            labels: bundle.descriptor.labels,
        })
    }

    fn run_in(
        &self,
        request: &RunRequest,
        model_folder: &std::path::Path,
        fold: &str,
        target: ImageFormat,
        work: &TempDir,
    ) -> Result<PredictionResult> {
        let normalized = normalize::normalize(&request.input, target, work.path())?;
        let staged = stage::stage(&normalized, &work.path().join("staging"))?;

        fs::create_dir_all(&request.output_dir)?;
        finalize::clear_stale_results(&request.output_dir)?;
        self.predictor.predict(&PredictionRequest {
            staging_dir: staged.dir,
            model_folder: model_folder.to_path_buf(),
            fold: fold.to_string(),
            output_dir: request.output_dir.clone(),
        })?;

        finalize::finalize(&request.output_dir, &request.name, target.extension())
    }

    fn create_work_dir(&self) -> Result<TempDir> {
        let builder = {
            let mut b = tempfile::Builder::new();
            b.prefix("lungseg-");
            b
        };
        let dir = match &self.staging_root {
            Some(root) => {
                fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };
        Ok(dir)
    }

    /// Remove the work dir; failures are logged, never returned
    fn cleanup(&self, work: TempDir) {
        if self.keep_temp {
            let path = work.keep();
            tracing::info!("Keeping work dir {}", path.display());
            return;
        }
        let path = work.path().to_path_buf();
        if let Err(e) = work.close() {
            tracing::warn!("Failed to remove work dir {}: {e}", path.display());
        }
    }
}
