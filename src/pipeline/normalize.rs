use crate::error::{LungsegError, Result};
use crate::image::{self, ImageFormat};
use std::path::{Path, PathBuf};

/// Input scan in the format the model expects
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedImage {
    pub path: PathBuf,
    pub format: ImageFormat,
    /// True when a converted copy was written to the work dir
    pub converted: bool,
}

/// Detect the input format, failing for anything lungseg cannot read
pub fn input_format(input: &Path) -> Result<ImageFormat> {
    ImageFormat::from_path(input).ok_or_else(|| {
        LungsegError::UnsupportedFormat(format!(
            "{} (expected one of {})",
            input.display(),
            ImageFormat::ALL.map(ImageFormat::extension).join(", ")
        ))
    })
}

/// Bring `input` into `target` format
///
/// Inputs already in the target format are passed through untouched;
/// others are converted into `work_dir`, keeping voxels and geometry.
pub fn normalize(input: &Path, target: ImageFormat, work_dir: &Path) -> Result<NormalizedImage> {
    let format = input_format(input)?;
    if !input.is_file() {
        return Err(LungsegError::Configuration(format!(
            "Input file not found: {}",
            input.display()
        )));
    }

    if format == target {
        tracing::debug!("{} is already {target}, no conversion needed", input.display());
        return Ok(NormalizedImage {
            path: input.to_path_buf(),
            format,
            converted: false,
        });
    }

    tracing::info!("Converting {} from {format} to {target}", input.display());
    let volume = image::read_as(input, format)?;
    tracing::debug!(
        "Read {:?} volume {:?}, spacing {:?}",
        volume.pixel,
        volume.dims,
        volume.spacing
    );

    let path = work_dir.join(format!("input{}", target.extension()));
    image::write(&volume, &path)?;

    Ok(NormalizedImage {
        path,
        format: target,
        converted: true,
    })
}
