use super::{policy, EvaluationBackend, RESULT_FIELD};
use crate::error::Error;
use crate::result::CheckResult;
use crate::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::header::CONTENT_TYPE;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

/// Configuration for the remote evaluation backend.
#[derive(Debug, Clone)]
pub struct RemoteBackendConfig {
    /// Base URL of the evaluation service, e.g. `http://opa.internal:8181`.
    pub base_url: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl RemoteBackendConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Evaluation backend that talks HTTP to a separately addressed policy
/// evaluation service.
///
/// Each execution is an upload/evaluate/teardown transaction keyed by the
/// policy's namespace, so concurrent runs never collide on server-side
/// policy state. Checkers sharing one namespace are serialized through a
/// per-namespace lock; distinct namespaces run concurrently.
#[derive(Debug)]
pub struct RemoteBackend {
    base_url: String,
    client: reqwest::Client,
    namespace_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl RemoteBackend {
    /// Probe the service and construct the backend.
    ///
    /// An unreachable service is fatal for the whole backend.
    pub async fn connect(config: RemoteBackendConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;

        let health_url = format!("{}/health", config.base_url);
        let probe = client.get(&health_url).send().await;
        match probe {
            Ok(resp) if resp.status().is_success() => {
                debug!("evaluation service reachable at {}", config.base_url);
            }
            Ok(resp) => {
                return Err(Error::ServiceUnavailable(format!(
                    "{} answered health probe with {}",
                    config.base_url,
                    resp.status()
                )));
            }
            Err(e) => {
                return Err(Error::ServiceUnavailable(format!(
                    "{} is unreachable: {}",
                    config.base_url, e
                )));
            }
        }

        Ok(Self {
            base_url: config.base_url,
            client,
            namespace_locks: DashMap::new(),
        })
    }

    fn namespace_lock(&self, namespace: &str) -> Arc<Mutex<()>> {
        self.namespace_locks
            .entry(namespace.to_string())
            .or_default()
            .clone()
    }

    /// Upload the policy document under its namespace. Nothing is created
    /// on the server when this fails, so teardown is skipped on this path.
    async fn upload(&self, policy_url: &str, document: &policy::PolicyDocument) -> Result<()> {
        debug!(
            "Uploading policy namespace {} to {}",
            document.namespace, policy_url
        );
        let resp = self
            .client
            .put(policy_url)
            .header(CONTENT_TYPE, "text/plain")
            .body(document.text.clone())
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Evaluation(format!(
                "policy upload failed with {}: {}",
                status,
                body.trim()
            )));
        }
        Ok(())
    }

    async fn evaluate(&self, data_url: &str, input: &CheckResult) -> Result<serde_json::Value> {
        let resp = self
            .client
            .post(data_url)
            .json(&input.details)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Error::Evaluation(format!(
                "evaluation failed with {}",
                resp.status()
            )));
        }
        resp.json::<serde_json::Value>()
            .await
            .map_err(|e| Error::Evaluation(format!("malformed evaluator response: {}", e)))
    }

    /// Remove the uploaded policy. Runs on every exit path once upload has
    /// succeeded; a failed removal is logged but never masks the
    /// evaluation outcome.
    async fn teardown(&self, policy_url: &str) {
        remove_policy(&self.client, policy_url).await;
    }
}

async fn remove_policy(client: &reqwest::Client, policy_url: &str) {
    match client.delete(policy_url).send().await {
        Ok(resp) if resp.status().is_success() => {
            debug!("policy removed from {}", policy_url);
        }
        Ok(resp) => warn!(
            "policy removal at {} answered {}",
            policy_url,
            resp.status()
        ),
        Err(e) => warn!("policy removal at {} failed: {}", policy_url, e),
    }
}

/// Guards a successfully uploaded policy across the evaluate step.
///
/// `execute` can be abandoned mid-transaction when a caller drops its
/// future, e.g. under an orchestrator timeout. Dropping the guard while
/// still armed spawns the removal so the uploaded policy does not outlive
/// the transaction; the spawned task takes the namespace lock so the
/// removal cannot race a later upload into the same namespace.
struct UploadedPolicy {
    client: reqwest::Client,
    policy_url: String,
    lock: Arc<Mutex<()>>,
    armed: bool,
}

impl UploadedPolicy {
    fn new(client: reqwest::Client, policy_url: String, lock: Arc<Mutex<()>>) -> Self {
        Self {
            client,
            policy_url,
            lock,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for UploadedPolicy {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!(
            "execution abandoned with policy still uploaded at {}; removing",
            self.policy_url
        );
        let client = self.client.clone();
        let policy_url = self.policy_url.clone();
        let lock = self.lock.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _guard = lock.lock().await;
                remove_policy(&client, &policy_url).await;
            });
        }
    }
}

#[async_trait]
impl EvaluationBackend for RemoteBackend {
    async fn execute(&self, input: &CheckResult, policy_path: &Path) -> Result<CheckResult> {
        let document = policy::load_policy(policy_path)?;
        let namespace_path = policy::namespace_to_path(&document.namespace);
        let policy_url = format!("{}/v1/policies/{}", self.base_url, namespace_path);
        let data_url = format!("{}/v1/data/{}", self.base_url, namespace_path);

        // Serializes checkers that share a namespace; teardown of one must
        // not race the upload of another.
        let lock = self.namespace_lock(&document.namespace);
        let _guard = lock.lock().await;

        self.upload(&policy_url, &document).await?;
        let mut uploaded =
            UploadedPolicy::new(self.client.clone(), policy_url.clone(), lock.clone());

        // Evaluate, then tear down unconditionally before surfacing any
        // evaluation failure. The guard covers the case where this future
        // is dropped while evaluate is still in flight.
        let evaluated = self.evaluate(&data_url, input).await;
        uploaded.disarm();
        self.teardown(&policy_url).await;
        let verdict = evaluated?;

        let details = verdict
            .pointer(&format!("/result/{}", RESULT_FIELD))
            .cloned()
            .unwrap_or_else(|| serde_json::Value::Array(Vec::new()));
        Ok(input.with_details(details))
    }
}

#[cfg(test)]
mod tests {
    use super::super::stub_server::{RecordedCall, StubServer};
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_policy(dir: &TempDir, name: &str, namespace: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "package {}\n\ndetails := []", namespace).unwrap();
        path
    }

    fn input() -> CheckResult {
        CheckResult::new(
            "ec2",
            "idle_instances",
            "Idle EC2 instances",
            json!({"input": {"instances": [{"id": "i-1", "cpu": 2}]}}),
        )
    }

    fn ok_responder() -> super::super::stub_server::Responder {
        Arc::new(|call: &RecordedCall| match call.method.as_str() {
            "POST" => (
                200,
                br#"{"result":{"details":[{"id":"i-1"}]}}"#.to_vec(),
            ),
            _ => (200, b"{}".to_vec()),
        })
    }

    async fn connect(server: &StubServer) -> RemoteBackend {
        RemoteBackend::connect(RemoteBackendConfig::new(server.base_url.clone()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_connect_fails_when_unreachable() {
        let err = RemoteBackend::connect(RemoteBackendConfig::new("http://127.0.0.1:1"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ServiceUnavailable(_)));
    }

    #[tokio::test]
    async fn test_connect_fails_on_unhealthy_probe() {
        let server = StubServer::spawn(Arc::new(|_: &RecordedCall| (500, Vec::new()))).await;
        let err = RemoteBackend::connect(RemoteBackendConfig::new(server.base_url.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ServiceUnavailable(_)));
    }

    #[tokio::test]
    async fn test_execute_runs_upload_evaluate_teardown() {
        let server = StubServer::spawn(ok_responder()).await;
        let dir = TempDir::new().unwrap();
        let policy = write_policy(&dir, "idle.rego", "aws.cost.idle_instances");

        let backend = connect(&server).await;
        let result = backend.execute(&input(), &policy).await.unwrap();
        assert_eq!(result.details, json!([{"id": "i-1"}]));

        let calls = server.call_summary();
        assert_eq!(
            &calls[1..],
            &[
                ("PUT".into(), "/v1/policies/aws/cost/idle_instances".into()),
                ("POST".into(), "/v1/data/aws/cost/idle_instances".into()),
                ("DELETE".into(), "/v1/policies/aws/cost/idle_instances".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_teardown_runs_when_evaluate_fails() {
        let server = StubServer::spawn(Arc::new(|call: &RecordedCall| {
            match call.method.as_str() {
                "POST" => (500, Vec::new()),
                _ => (200, b"{}".to_vec()),
            }
        }))
        .await;
        let dir = TempDir::new().unwrap();
        let policy = write_policy(&dir, "idle.rego", "aws.cost.idle_instances");

        let backend = connect(&server).await;
        let err = backend.execute(&input(), &policy).await.unwrap_err();
        assert!(matches!(err, Error::Evaluation(_)));

        let deletes: Vec<_> = server
            .call_summary()
            .into_iter()
            .filter(|(method, _)| method == "DELETE")
            .collect();
        assert_eq!(deletes.len(), 1, "DELETE must run exactly once");
    }

    #[tokio::test]
    async fn test_upload_failure_skips_teardown() {
        let server = StubServer::spawn(Arc::new(|call: &RecordedCall| {
            match call.method.as_str() {
                "PUT" => (404, b"no such bundle".to_vec()),
                _ => (200, b"{}".to_vec()),
            }
        }))
        .await;
        let dir = TempDir::new().unwrap();
        let policy = write_policy(&dir, "idle.rego", "aws.cost.idle_instances");

        let backend = connect(&server).await;
        let err = backend.execute(&input(), &policy).await.unwrap_err();
        assert!(matches!(err, Error::Evaluation(_)));

        let methods: Vec<_> = server
            .call_summary()
            .into_iter()
            .map(|(method, _)| method)
            .collect();
        assert!(
            !methods.contains(&"DELETE".to_string()),
            "nothing was uploaded, so nothing may be torn down"
        );
    }

    #[tokio::test]
    async fn test_shared_namespace_executions_do_not_interleave() {
        let server = StubServer::spawn(ok_responder()).await;
        let dir = TempDir::new().unwrap();
        let policy = write_policy(&dir, "idle.rego", "aws.cost.idle_instances");

        let backend = Arc::new(connect(&server).await);
        let first = {
            let backend = backend.clone();
            let policy = policy.clone();
            tokio::spawn(async move { backend.execute(&input(), &policy).await })
        };
        let second = {
            let backend = backend.clone();
            let policy = policy.clone();
            tokio::spawn(async move { backend.execute(&input(), &policy).await })
        };
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        // Skip the health probe, then expect two well-formed transactions.
        let methods: Vec<_> = server
            .call_summary()
            .into_iter()
            .map(|(method, _)| method)
            .collect();
        assert_eq!(
            &methods[1..],
            &["PUT", "POST", "DELETE", "PUT", "POST", "DELETE"]
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_abandoned_execution_still_tears_down() {
        // POST answers slowly enough that the caller gives up first.
        let server = StubServer::spawn(Arc::new(|call: &RecordedCall| {
            if call.method == "POST" {
                std::thread::sleep(Duration::from_millis(400));
            }
            (200, b"{}".to_vec())
        }))
        .await;
        let dir = TempDir::new().unwrap();
        let policy = write_policy(&dir, "idle.rego", "aws.cost.idle_instances");

        let backend = connect(&server).await;
        let abandoned =
            tokio::time::timeout(Duration::from_millis(100), backend.execute(&input(), &policy))
                .await;
        assert!(abandoned.is_err(), "evaluation should still be in flight");

        // Give the spawned removal time to reach the server.
        tokio::time::sleep(Duration::from_millis(800)).await;
        let deletes: Vec<_> = server
            .call_summary()
            .into_iter()
            .filter(|(method, _)| method == "DELETE")
            .collect();
        assert_eq!(
            deletes,
            vec![(
                "DELETE".to_string(),
                "/v1/policies/aws/cost/idle_instances".to_string()
            )],
            "uploaded policy must be removed after the caller gives up"
        );
    }

    #[tokio::test]
    async fn test_missing_result_field_defaults_to_empty() {
        let server = StubServer::spawn(Arc::new(|call: &RecordedCall| {
            match call.method.as_str() {
                "POST" => (200, b"{\"result\":{}}".to_vec()),
                _ => (200, b"{}".to_vec()),
            }
        }))
        .await;
        let dir = TempDir::new().unwrap();
        let policy = write_policy(&dir, "idle.rego", "aws.cost.idle_instances");

        let backend = connect(&server).await;
        let result = backend.execute(&input(), &policy).await.unwrap();
        assert_eq!(result.details, json!([]));
    }
}
