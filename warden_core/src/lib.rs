pub mod backend;
pub mod contracts;
pub mod error;
pub mod pipeline;
pub mod registry;
pub mod result;

pub use backend::{EvaluationBackend, LocalBackend, LocalBackendConfig, RemoteBackend, RemoteBackendConfig};
pub use contracts::{Assistant, Checker, Input, Output, Provider};
pub use error::Error;
pub use pipeline::{CheckOutcome, Pipeline, RunReport};
pub use registry::{Capability, ManifestLoader, PluginDescriptor, PluginHandle, PluginManifest, PolicyMeta, Registry};
pub use result::CheckResult;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
