//! Policy evaluation backends.
//!
//! Two interchangeable implementations of one contract: [`LocalBackend`]
//! runs checks as subprocesses over a managed evaluator binary, and
//! [`RemoteBackend`] talks HTTP to a separately addressed evaluation
//! service. Both extract the policy's declared namespace the same way and
//! return the declared output sub-field (`details`) from the verdict.

mod local;
mod policy;
mod remote;

#[cfg(test)]
pub(crate) mod stub_server;

pub use local::{LocalBackend, LocalBackendConfig, DEFAULT_DOWNLOAD_BASE_URL};
pub use policy::{extract_package_name, load_policy, namespace_to_path, PolicyDocument};
pub use remote::{RemoteBackend, RemoteBackendConfig};

use crate::result::CheckResult;
use crate::Result;
use async_trait::async_trait;
use std::path::Path;

/// Field of the evaluator verdict that carries the check's output.
pub(crate) const RESULT_FIELD: &str = "details";

/// Contract shared by the local and remote evaluation backends.
#[async_trait]
pub trait EvaluationBackend: Send + Sync {
    /// Evaluate `policy` against `input.details` and return a record whose
    /// `details` holds the declared output sub-field of the verdict (an
    /// empty structure when absent).
    async fn execute(&self, input: &CheckResult, policy: &Path) -> Result<CheckResult>;
}
