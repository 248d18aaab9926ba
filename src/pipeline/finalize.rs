use super::stage::CASE_ID;
use crate::error::{LungsegError, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Files nnUNet writes next to its predictions
pub const SIDE_FILES: [&str; 3] = ["dataset.json", "plans.json", "predict_from_raw_data_args.json"];

/// Result name used when the caller gives none
pub const DEFAULT_RESULT_NAME: &str = "prediction";

/// The renamed segmentation, owned by the user from here on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredictionResult {
    pub path: PathBuf,
}

/// Rename nnUNet's output for case `001` to `<name><ext>` and drop side files
///
/// # Errors
/// `MissingResult` when nnUNet wrote nothing for the case
pub fn finalize(output_dir: &Path, name: &str, ext: &str) -> Result<PredictionResult> {
    let produced = locate_result(output_dir, ext)?;
    let ext = result_extension(&produced).unwrap_or_else(|| ext.to_string());
    let target = output_dir.join(format!("{name}{ext}"));

    if produced != target {
        if target.exists() {
            tracing::debug!("Replacing existing {}", target.display());
            fs::remove_file(&target)?;
        }
        fs::rename(&produced, &target)?;
    }

    for side in SIDE_FILES {
        let path = output_dir.join(side);
        if path.is_file() {
            if let Err(e) = fs::remove_file(&path) {
                tracing::warn!("Failed to remove {}: {e}", path.display());
            }
        }
    }

    tracing::info!("Prediction saved to {}", target.display());
    Ok(PredictionResult { path: target })
}

/// Remove `001.*` files a previous, aborted run left in `output_dir`
///
/// Runs before prediction so that only this run's output can be finalized.
pub fn clear_stale_results(output_dir: &Path) -> Result<usize> {
    let stale = case_outputs(output_dir);
    for path in &stale {
        tracing::warn!("Removing stale prediction {}", path.display());
        fs::remove_file(path)?;
    }
    Ok(stale.len())
}

/// `<output>/001<ext>`, or the only `001.*` file if nnUNet chose another ending
fn locate_result(output_dir: &Path, ext: &str) -> Result<PathBuf> {
    let expected = output_dir.join(format!("{CASE_ID}{ext}"));
    if expected.is_file() {
        return Ok(expected);
    }

    let mut candidates = case_outputs(output_dir);

    match candidates.len() {
        1 => Ok(candidates.remove(0)),
        0 => Err(LungsegError::MissingResult(output_dir.display().to_string())),
        _ => {
            candidates.sort();
            Err(LungsegError::MissingResult(format!(
                "{}: ambiguous results {:?}",
                output_dir.display(),
                candidates
            )))
        }
    }
}

/// Files named `001.*` in `output_dir`
fn case_outputs(output_dir: &Path) -> Vec<PathBuf> {
    let prefix = format!("{CASE_ID}.");
    match fs::read_dir(output_dir) {
        Ok(entries) => entries
            .filter_map(std::result::Result::ok)
            .map(|e| e.path())
            .filter(|p| {
                p.is_file()
                    && p.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with(&prefix))
            })
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Everything after the case id, e.g. `.nii.gz` for `001.nii.gz`
fn result_extension(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    name.strip_prefix(CASE_ID).map(str::to_string)
}
