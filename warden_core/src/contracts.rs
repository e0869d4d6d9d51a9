//! Capability contracts satisfied by concrete plugins.
//!
//! The orchestrator only ever talks to plugins through these traits; it
//! never sees concrete cloud gatherers, checks or output channels.

use crate::result::CheckResult;
use crate::Result;
use async_trait::async_trait;

/// Contract for data-provider plugins.
///
/// Providers gather a record from an external system (cloud APIs, usually)
/// and may be slow. A failed gather aborts only the checker that depends
/// on it.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn gather(&self) -> Result<CheckResult>;
}

/// Contract for policy-check plugins and their paired reporting hook.
pub trait Checker: Send + Sync {
    /// Merge check-specific configuration (thresholds, date cutoffs, etc.)
    /// into the gathered input so the policy evaluator can see it.
    ///
    /// The default implementation passes the input through unchanged;
    /// absence of an injection step is not an error.
    fn inject(&self, input: CheckResult) -> Result<CheckResult> {
        Ok(input)
    }

    /// Render the evaluator's verdict in a human-readable format.
    ///
    /// Must always return a record, including a "no findings" sentinel, so
    /// downstream consumers never branch on absence.
    fn report(&self, result: CheckResult) -> CheckResult;
}

/// Contract for output-channel plugins.
#[async_trait]
pub trait Output: Send + Sync {
    async fn publish(&self, results: &[CheckResult]) -> Result<()>;
}

/// Contract for assistant plugins, which transform the accumulated results
/// right before the output stage.
#[async_trait]
pub trait Assistant: Send + Sync {
    async fn transform(&self, results: Vec<CheckResult>) -> Result<Vec<CheckResult>>;
}

/// Contract for input plugins, which consume records gathered from their
/// declared providers.
#[async_trait]
pub trait Input: Send + Sync {
    async fn consume(&self, results: Vec<CheckResult>) -> Result<()>;
}
