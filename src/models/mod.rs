pub mod bundle;
pub mod download;
pub mod provision;
pub mod registry;

pub use bundle::{DatasetDescriptor, InstallRecord, ModelBundle};
pub use download::{ArchiveFetcher, HttpFetcher};
pub use provision::{Provisioned, Provisioner};
pub use registry::{Mode, ModelInfo, ModelRegistry, Structure};
