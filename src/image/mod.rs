//! Volumetric image I/O
//!
//! Reads and writes the four formats lungseg accepts (`.nii`, `.nii.gz`,
//! `.mha`, `.nrrd`) through one in-memory [`Volume`]. Geometry is kept in
//! ITK's convention: physical LPS coordinates, `point = origin + D * (spacing * index)`
//! where the columns of `D` are the axis directions.
//!
//! Voxel bytes are never reinterpreted, only byte-swapped to little endian,
//! so converting between formats is lossless for the voxel data.

pub mod metaimage;
pub mod nifti;
pub mod nrrd;

use crate::error::ImageError;
use std::fmt;
use std::path::Path;

/// Voxel component type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
}

impl PixelType {
    /// Size of one voxel in bytes
    #[must_use]
    pub const fn size(self) -> usize {
        match self {
            Self::U8 | Self::I8 => 1,
            Self::U16 | Self::I16 => 2,
            Self::U32 | Self::I32 | Self::F32 => 4,
            Self::U64 | Self::I64 | Self::F64 => 8,
        }
    }
}

/// Supported on-disk formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Nifti,
    NiftiGz,
    MetaImage,
    Nrrd,
}

impl ImageFormat {
    pub const ALL: [Self; 4] = [Self::Nifti, Self::NiftiGz, Self::MetaImage, Self::Nrrd];

    /// File extension including the leading dot
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Nifti => ".nii",
            Self::NiftiGz => ".nii.gz",
            Self::MetaImage => ".mha",
            Self::Nrrd => ".nrrd",
        }
    }

    /// Parse an extension such as `.nii.gz` or `nrrd` (case-insensitive)
    #[must_use]
    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.trim().trim_start_matches('.').to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|f| f.extension().trim_start_matches('.') == ext)
    }

    /// Detect the format from a file name; `.nii.gz` wins over `.gz`
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        // Longest extension first
        [Self::NiftiGz, Self::Nifti, Self::MetaImage, Self::Nrrd]
            .into_iter()
            .find(|f| name.len() > f.extension().len() && name.ends_with(f.extension()))
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// A scalar image with its spatial metadata
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
    /// Size along each axis, fastest-varying first
    pub dims: Vec<usize>,
    pub pixel: PixelType,
    pub spacing: Vec<f64>,
    pub origin: Vec<f64>,
    /// Row-major `n x n` direction cosines; column `j` is axis `j`
    pub direction: Vec<f64>,
    /// Voxel values, little endian
    pub data: Vec<u8>,
}

impl Volume {
    /// Volume with unit spacing, zero origin and identity direction
    #[must_use]
    pub fn new(dims: Vec<usize>, pixel: PixelType, data: Vec<u8>) -> Self {
        let n = dims.len();
        Self {
            spacing: vec![1.0; n],
            origin: vec![0.0; n],
            direction: identity(n),
            dims,
            pixel,
            data,
        }
    }

    #[must_use]
    pub fn ndim(&self) -> usize {
        self.dims.len()
    }

    #[must_use]
    pub fn voxel_count(&self) -> usize {
        self.dims.iter().product()
    }

    /// Check that the metadata is consistent with the voxel buffer
    pub fn validate(&self, path: &Path) -> Result<(), ImageError> {
        let n = self.ndim();
        let header = |reason: String| ImageError::Header {
            path: path.display().to_string(),
            reason,
        };

        if !(2..=3).contains(&n) {
            return Err(ImageError::Unsupported {
                path: path.display().to_string(),
                what: "dimension",
                value: n.to_string(),
            });
        }
        if self.dims.iter().any(|d| *d == 0) {
            return Err(header(format!("empty axis in size {:?}", self.dims)));
        }
        if self.spacing.len() != n || self.origin.len() != n || self.direction.len() != n * n {
            return Err(header("geometry does not match dimension".to_string()));
        }
        if self.spacing.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(header(format!("invalid spacing {:?}", self.spacing)));
        }
        let expected = self.voxel_count() * self.pixel.size();
        if self.data.len() != expected {
            return Err(ImageError::Truncated {
                path: path.display().to_string(),
                expected,
                found: self.data.len(),
            });
        }
        Ok(())
    }

    /// Drop trailing size-1 axes past the third along with their geometry
    ///
    /// Scanners and toolkits often write a 3-D scan as `X x Y x Z x 1`.
    #[must_use]
    pub fn squeeze(mut self) -> Self {
        let n = self.ndim();
        let mut keep = n;
        while keep > 3 && self.dims[keep - 1] == 1 {
            keep -= 1;
        }
        if keep == n || self.direction.len() != n * n {
            return self;
        }

        let mut direction = Vec::with_capacity(keep * keep);
        for r in 0..keep {
            direction.extend_from_slice(&self.direction[r * n..r * n + keep]);
        }
        self.dims.truncate(keep);
        self.spacing.truncate(keep);
        self.origin.truncate(keep);
        self.direction = direction;
        self
    }

    /// Direction entry for physical row `r`, axis `c`
    #[must_use]
    pub fn direction_at(&self, r: usize, c: usize) -> f64 {
        self.direction[r * self.ndim() + c]
    }
}

/// Row-major identity matrix
#[must_use]
pub fn identity(n: usize) -> Vec<f64> {
    let mut m = vec![0.0; n * n];
    for i in 0..n {
        m[i * n + i] = 1.0;
    }
    m
}

/// Read any supported format
pub fn read(path: &Path) -> Result<Volume, ImageError> {
    let format = ImageFormat::from_path(path).ok_or_else(|| ImageError::Unsupported {
        path: path.display().to_string(),
        what: "file extension",
        value: path.extension().map_or_else(String::new, |e| e.to_string_lossy().into_owned()),
    })?;
    read_as(path, format)
}

/// Read a file in a known format
pub fn read_as(path: &Path, format: ImageFormat) -> Result<Volume, ImageError> {
    let volume = match format {
        ImageFormat::Nifti | ImageFormat::NiftiGz => nifti::read(path)?,
        ImageFormat::MetaImage => metaimage::read(path)?,
        ImageFormat::Nrrd => nrrd::read(path)?,
    }
    .squeeze();
    volume.validate(path)?;
    Ok(volume)
}

/// Write a volume; the format follows the file name
pub fn write(volume: &Volume, path: &Path) -> Result<(), ImageError> {
    let format = ImageFormat::from_path(path).ok_or_else(|| ImageError::Unsupported {
        path: path.display().to_string(),
        what: "file extension",
        value: path.display().to_string(),
    })?;
    volume.validate(path)?;
    match format {
        ImageFormat::Nifti | ImageFormat::NiftiGz => nifti::write(volume, path),
        ImageFormat::MetaImage => metaimage::write(volume, path),
        ImageFormat::Nrrd => nrrd::write(volume, path),
    }
}

/// Reverse the byte order of every element in place
pub(crate) fn swap_bytes(data: &mut [u8], size: usize) {
    if size > 1 {
        for chunk in data.chunks_exact_mut(size) {
            chunk.reverse();
        }
    }
}

pub(crate) fn io_error(path: &Path, source: std::io::Error) -> ImageError {
    ImageError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Shortest text that parses back to the same `f64`
pub(crate) fn fmt_f64(v: f64) -> String {
    if v == 0.0 {
        // Avoid "-0"
        "0".to_string()
    } else {
        format!("{v}")
    }
}
