//! Run pre-trained nnUNetv2 lung segmentation models against a single scan.
//!
//! The heavy lifting happens in nnUNetv2; this crate provisions the model,
//! brings the scan into the format the model expects, stages it, invokes
//! nnUNet and hands back the renamed result.

pub mod config;
pub mod error;
pub mod image;
pub mod models;
pub mod pipeline;

pub use error::{LungsegError, Result};
