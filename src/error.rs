use thiserror::Error;

/// Main error type for lungseg
#[derive(Error, Debug)]
pub enum LungsegError {
    #[error("Config error: {0}\n\nTroubleshooting:\n- Check config file: ~/.config/lungseg/config.toml\n- List known models: lungseg --list_models\n- Run with RUST_LOG=debug for more details")]
    Configuration(String),

    #[error("Unsupported input format: {0}\n\nTroubleshooting:\n- Supported extensions: .nii, .nii.gz, .mha, .nrrd\n- Convert DICOM series to one of these first")]
    UnsupportedFormat(String),

    #[error("Model download failed: {0}\n\nTroubleshooting:\n- Check internet connection\n- Verify models.base_url or the registry file in config\n- Remove any partial files in the models directory and retry")]
    Download(String),

    #[error("Prediction failed: {0}\n\nTroubleshooting:\n- Is nnUNetv2 installed? Check: which nnUNetv2_predict_from_modelfolder\n- Try --device cpu if no GPU is available\n- Run with RUST_LOG=debug to see the full nnUNet output")]
    Prediction(String),

    #[error("No prediction result found in {0}\n\nTroubleshooting:\n- nnUNet exited without writing a segmentation\n- Check the nnUNet output above for warnings")]
    MissingResult(String),

    #[error("Invalid model bundle: {0}\n\nTroubleshooting:\n- Delete the model folder to force a fresh download")]
    InvalidModel(String),

    #[error("Image error: {0}")]
    Image(#[from] ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

/// Volume codec errors
#[derive(Error, Debug)]
pub enum ImageError {
    #[error("{path}: malformed header: {reason}")]
    Header { path: String, reason: String },

    #[error("{path}: unsupported {what}: {value}")]
    Unsupported {
        path: String,
        what: &'static str,
        value: String,
    },

    #[error("{path}: expected {expected} bytes of voxel data, found {found}")]
    Truncated {
        path: String,
        expected: usize,
        found: usize,
    },

    #[error("{path}: {reason}")]
    Nifti { path: String, reason: String },

    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl LungsegError {
    /// Process exit code reported by the CLI for this error
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) => 2,
            Self::UnsupportedFormat(_) => 3,
            Self::Download(_) => 4,
            Self::Prediction(_) => 5,
            Self::MissingResult(_) => 6,
            Self::InvalidModel(_) => 7,
            Self::Image(_) => 8,
            Self::Io(_) | Self::Other(_) => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, LungsegError>;
