use super::normalize::NormalizedImage;
use crate::error::Result;
use std::fs;
use std::path::{Path, PathBuf};

/// Case identifier nnUNet sees for the single staged scan
pub const CASE_ID: &str = "001";

/// Channel suffix for the only modality
const CHANNEL: &str = "0000";

/// The staging folder holding exactly one input case
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedCase {
    pub dir: PathBuf,
    pub file: PathBuf,
}

/// File name nnUNet expects for the staged case, e.g. `001_0000.nrrd`
#[must_use]
pub fn staged_file_name(extension: &str) -> String {
    format!("{CASE_ID}_{CHANNEL}{extension}")
}

/// Copy the normalized image into `staging_dir` under nnUNet's naming
///
/// Anything else already in the folder is removed so nnUNet sees one case.
pub fn stage(image: &NormalizedImage, staging_dir: &Path) -> Result<StagedCase> {
    fs::create_dir_all(staging_dir)?;
    for entry in fs::read_dir(staging_dir)? {
        let path = entry?.path();
        if path.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }

    let file = staging_dir.join(staged_file_name(image.format.extension()));
    fs::copy(&image.path, &file)?;
    tracing::debug!("Staged {} as {}", image.path.display(), file.display());

    Ok(StagedCase {
        dir: staging_dir.to_path_buf(),
        file,
    })
}
