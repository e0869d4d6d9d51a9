//! The policy execution orchestrator.
//!
//! Runs every checker in the registry end-to-end: resolve its provider,
//! inject check configuration, hand the input to the evaluation backend,
//! and render the verdict through the checker's report hook. Each checker
//! is isolated; a failure is recorded and never aborts siblings.

use crate::backend::EvaluationBackend;
use crate::error::Error;
use crate::registry::{Capability, PluginDescriptor, Registry};
use crate::result::CheckResult;
use crate::Result;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// The recorded fate of one checker execution.
#[derive(Debug)]
pub struct CheckOutcome {
    pub checker: String,
    pub started_at: DateTime<Utc>,
    pub elapsed: Duration,
    pub outcome: Result<CheckResult>,
}

/// Everything one pipeline run produced.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: Uuid,
    pub outcomes: Vec<CheckOutcome>,
    /// Successful records, after the assistant stage.
    pub results: Vec<CheckResult>,
}

impl RunReport {
    pub fn failed(&self) -> impl Iterator<Item = &CheckOutcome> {
        self.outcomes.iter().filter(|o| o.outcome.is_err())
    }
}

/// Orchestrates checker execution against a sealed registry and one
/// evaluation backend.
pub struct Pipeline {
    registry: Registry,
    backend: Arc<dyn EvaluationBackend>,
    checker_timeout: Option<Duration>,
}

impl Pipeline {
    pub fn new(registry: Registry, backend: Arc<dyn EvaluationBackend>) -> Self {
        Self {
            registry,
            backend,
            checker_timeout: None,
        }
    }

    /// Bound the whole per-checker execution (provider, injection,
    /// evaluation, report). Expiry abandons the checker's in-flight work;
    /// the remote backend detects the abandonment and removes any policy
    /// it had uploaded for the checker in a background task.
    pub fn with_checker_timeout(mut self, timeout: Duration) -> Self {
        self.checker_timeout = Some(timeout);
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Execute exactly one checker end-to-end.
    pub async fn execute_checker(
        &self,
        descriptor: &PluginDescriptor,
        prior: &[CheckResult],
    ) -> Result<CheckResult> {
        let checker = descriptor.instance.as_checker().ok_or_else(|| {
            Error::Configuration(format!("plugin {} is not a checker", descriptor.name))
        })?;

        let providers = self.registry.providers_used_by(descriptor);
        let input = match providers.len() {
            1 => {
                let provider = providers[0];
                debug!(
                    checker = %descriptor.name,
                    provider = %provider.name,
                    "gathering input"
                );
                provider
                    .instance
                    .as_provider()
                    .ok_or_else(|| {
                        Error::Configuration(format!("plugin {} is not a provider", provider.name))
                    })?
                    .gather()
                    .await?
            }
            0 => {
                // Explicit escape hatch for chained checks; see DESIGN.md
                // for the stricter-validation caveat.
                warn!(
                    checker = %descriptor.name,
                    "no provider found, falling back to prior results"
                );
                match prior.first() {
                    Some(first) => first.clone(),
                    None => CheckResult::empty(&descriptor.name),
                }
            }
            n => {
                return Err(Error::Configuration(format!(
                    "checker {} may use at most one provider, found {}",
                    descriptor.name, n
                )));
            }
        };

        let input = checker.inject(input)?;

        let policy = descriptor.policy.as_ref().ok_or_else(|| {
            Error::Configuration(format!(
                "checker {} has no policy document",
                descriptor.name
            ))
        })?;
        let verdict = self.backend.execute(&input, &policy.file).await?;

        // The finding is identified by the check, not by whatever the
        // provider called its record.
        let verdict = CheckResult::new(
            descriptor.name.clone(),
            descriptor.name.clone(),
            policy.description.clone(),
            verdict.details,
        );
        Ok(checker.report(verdict))
    }

    async fn execute_checker_timed(
        &self,
        descriptor: &PluginDescriptor,
        prior: &[CheckResult],
    ) -> CheckOutcome {
        let started_at = Utc::now();
        let clock = std::time::Instant::now();
        let outcome = match self.checker_timeout {
            Some(timeout) => {
                match tokio::time::timeout(timeout, self.execute_checker(descriptor, prior)).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Evaluation(format!(
                        "checker {} timed out after {:?}",
                        descriptor.name, timeout
                    ))),
                }
            }
            None => self.execute_checker(descriptor, prior).await,
        };
        if let Err(e) = &outcome {
            error!(checker = %descriptor.name, "checker failed: {}", e);
        }
        CheckOutcome {
            checker: descriptor.name.clone(),
            started_at,
            elapsed: clock.elapsed(),
            outcome,
        }
    }

    /// Run every checker sequentially, then the assistant, input and
    /// output stages. Checker failures are isolated per checker and
    /// surfaced in the report; nothing is retried automatically.
    pub async fn run(&self) -> RunReport {
        let run_id = Uuid::new_v4();
        info!(%run_id, "starting pipeline run");

        let checkers = self.registry.find(Capability::Checker);
        let mut outcomes = Vec::with_capacity(checkers.len());
        let mut results: Vec<CheckResult> = Vec::new();

        for descriptor in checkers {
            let outcome = self.execute_checker_timed(descriptor, &results).await;
            if let Ok(record) = &outcome.outcome {
                results.push(record.clone());
            }
            outcomes.push(outcome);
        }

        results = self.assist(results).await;
        self.feed_inputs().await;
        self.publish(&results).await;

        info!(
            %run_id,
            total = outcomes.len(),
            failed = outcomes.iter().filter(|o| o.outcome.is_err()).count(),
            "pipeline run finished"
        );
        RunReport {
            run_id,
            outcomes,
            results,
        }
    }

    /// Run independent checkers concurrently, bounded by `limit`.
    ///
    /// Concurrent checkers do not see each other's results, so the
    /// providerless fallback always synthesizes an empty record here.
    /// Safety comes from per-namespace locks in the remote backend and
    /// process isolation in the local one.
    pub async fn run_concurrent(&self, limit: usize) -> RunReport {
        let run_id = Uuid::new_v4();
        info!(%run_id, limit, "starting concurrent pipeline run");

        let checkers = self.registry.find(Capability::Checker);
        let outcomes: Vec<CheckOutcome> = stream::iter(checkers)
            .map(|descriptor| self.execute_checker_timed(descriptor, &[]))
            .buffered(limit.max(1))
            .collect()
            .await;

        let mut results: Vec<CheckResult> = outcomes
            .iter()
            .filter_map(|o| o.outcome.as_ref().ok().cloned())
            .collect();

        results = self.assist(results).await;
        self.feed_inputs().await;
        self.publish(&results).await;

        RunReport {
            run_id,
            outcomes,
            results,
        }
    }

    /// Assistant stage: each assistant transforms the accumulated results
    /// in load order. A failing assistant is skipped, keeping the results
    /// it received.
    async fn assist(&self, mut results: Vec<CheckResult>) -> Vec<CheckResult> {
        for descriptor in self.registry.find(Capability::Assistant) {
            let Some(assistant) = descriptor.instance.as_assistant() else {
                continue;
            };
            match assistant.transform(results.clone()).await {
                Ok(transformed) => results = transformed,
                Err(e) => error!(assistant = %descriptor.name, "assistant failed: {}", e),
            }
        }
        results
    }

    /// Input stage: each input plugin gathers from its declared providers
    /// and consumes what they produced.
    async fn feed_inputs(&self) {
        for descriptor in self.registry.find(Capability::Input) {
            let Some(input) = descriptor.instance.as_input() else {
                continue;
            };
            let mut gathered = Vec::new();
            for provider in self.registry.providers_used_by(descriptor) {
                let Some(provider_instance) = provider.instance.as_provider() else {
                    continue;
                };
                match provider_instance.gather().await {
                    Ok(record) => gathered.push(record),
                    Err(e) => error!(
                        input = %descriptor.name,
                        provider = %provider.name,
                        "gather failed: {}", e
                    ),
                }
            }
            if let Err(e) = input.consume(gathered).await {
                error!(input = %descriptor.name, "input plugin failed: {}", e);
            }
        }
    }

    /// Output stage: every output plugin sees the full result set; a
    /// failing output never aborts the others.
    async fn publish(&self, results: &[CheckResult]) {
        for descriptor in self.registry.find(Capability::Output) {
            let Some(output) = descriptor.instance.as_output() else {
                continue;
            };
            if let Err(e) = output.publish(results).await {
                error!(output = %descriptor.name, "output plugin failed: {}", e);
            }
        }
    }
}
