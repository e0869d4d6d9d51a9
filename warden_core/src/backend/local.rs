use super::{policy, EvaluationBackend, RESULT_FIELD};
use crate::error::Error;
use crate::result::CheckResult;
use crate::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{debug, info};

/// Published download location for evaluator binaries.
pub const DEFAULT_DOWNLOAD_BASE_URL: &str = "https://openpolicyagent.org/downloads/latest";

/// Configuration for the local evaluation backend.
#[derive(Debug, Clone)]
pub struct LocalBackendConfig {
    /// Directory the evaluator binary lives in, or is installed into.
    pub binary_dir: PathBuf,
    /// Base URL of the platform-keyed binary download table.
    pub download_base_url: String,
}

impl Default for LocalBackendConfig {
    fn default() -> Self {
        Self {
            binary_dir: PathBuf::from("."),
            download_base_url: DEFAULT_DOWNLOAD_BASE_URL.to_string(),
        }
    }
}

/// Binary acquisition states, walked once at backend construction.
///
/// Every terminal failure (unsupported platform, integrity mismatch, failed
/// smoke test) is fatal for the whole backend, never per-check.
#[derive(Debug)]
enum AcquireState {
    Checking,
    ResolvingPlatform,
    Downloading { asset: &'static str },
    Verifying { expected: String },
    Finalizing,
    SmokeTest,
    Ready,
}

/// Evaluation backend that runs checks as subprocesses over a managed
/// evaluator binary.
///
/// The resolved binary path is the only state and is read-only after
/// construction; concurrent checker executions are independent OS
/// processes.
#[derive(Debug)]
pub struct LocalBackend {
    binary: PathBuf,
}

impl LocalBackend {
    /// Resolve or install the evaluator binary, then verify it runs.
    ///
    /// Runs the acquisition state machine to completion exactly once;
    /// callers that share a backend across checkers must construct it
    /// before any checker execution begins.
    pub async fn acquire(config: LocalBackendConfig) -> Result<Self> {
        let binary = config.binary_dir.join(binary_name());
        let mut state = AcquireState::Checking;
        loop {
            debug!("evaluator acquisition state: {:?}", state);
            state = match state {
                AcquireState::Checking => {
                    if binary.exists() {
                        debug!("evaluator already present at {:?}", binary);
                        AcquireState::Ready
                    } else {
                        AcquireState::ResolvingPlatform
                    }
                }
                AcquireState::ResolvingPlatform => {
                    let asset = platform_asset(std::env::consts::OS, std::env::consts::ARCH)?;
                    AcquireState::Downloading { asset }
                }
                AcquireState::Downloading { asset } => {
                    let expected = download(&config.download_base_url, asset, &binary).await?;
                    AcquireState::Verifying { expected }
                }
                AcquireState::Verifying { expected } => {
                    verify(&binary, &expected).await?;
                    AcquireState::Finalizing
                }
                AcquireState::Finalizing => {
                    set_executable(&binary)?;
                    AcquireState::SmokeTest
                }
                AcquireState::SmokeTest => {
                    smoke_test(&binary).await?;
                    AcquireState::Ready
                }
                AcquireState::Ready => break,
            };
        }
        info!("evaluator binary ready at {:?}", binary);
        Ok(Self { binary })
    }

    pub fn binary_path(&self) -> &Path {
        &self.binary
    }
}

fn binary_name() -> &'static str {
    if cfg!(windows) {
        "opa.exe"
    } else {
        "opa"
    }
}

/// Map OS and architecture onto the published asset name.
fn platform_asset(os: &str, arch: &str) -> Result<&'static str> {
    match (os, arch) {
        ("linux", "x86_64") => Ok("opa_linux_amd64"),
        ("linux", "aarch64") => Ok("opa_linux_arm64_static"),
        ("macos", "x86_64") => Ok("opa_darwin_amd64"),
        ("macos", "aarch64") => Ok("opa_darwin_arm64_static"),
        ("windows", "x86_64") => Ok("opa_windows_amd64.exe"),
        (os, arch) => Err(Error::UnsupportedPlatform {
            os: os.to_string(),
            arch: arch.to_string(),
        }),
    }
}

/// Fetch the binary and its published checksum; returns the expected hex
/// digest. The partial download is removed when the checksum cannot be
/// obtained.
async fn download(base_url: &str, asset: &str, dest: &Path) -> Result<String> {
    let url = format!("{}/{}", base_url, asset);
    info!("Downloading evaluator from {}", url);
    let bytes = reqwest::get(&url).await?.error_for_status()?.bytes().await?;
    tokio::fs::write(dest, &bytes).await?;

    let checksum_url = format!("{}.sha256", url);
    let text = match fetch_checksum(&checksum_url).await {
        Ok(text) => text,
        Err(e) => {
            let _ = tokio::fs::remove_file(dest).await;
            return Err(e);
        }
    };
    // The digest is the first whitespace-delimited token of the file.
    match text.split_whitespace().next() {
        Some(token) => Ok(token.to_ascii_lowercase()),
        None => {
            let _ = tokio::fs::remove_file(dest).await;
            Err(Error::Configuration(format!(
                "empty checksum file at {}",
                checksum_url
            )))
        }
    }
}

async fn fetch_checksum(url: &str) -> Result<String> {
    Ok(reqwest::get(url).await?.error_for_status()?.text().await?)
}

/// Recompute the SHA-256 of the downloaded binary and compare; a mismatch
/// deletes the partial download.
async fn verify(binary: &Path, expected: &str) -> Result<()> {
    let bytes = tokio::fs::read(binary).await?;
    let actual = hex::encode(Sha256::digest(&bytes));
    if actual != expected {
        let _ = tokio::fs::remove_file(binary).await;
        return Err(Error::Integrity {
            expected: expected.to_string(),
            actual,
        });
    }
    debug!("evaluator checksum verified");
    Ok(())
}

#[cfg(unix)]
fn set_executable(binary: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(binary)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(binary, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn set_executable(_binary: &Path) -> Result<()> {
    Ok(())
}

/// Invoke a trivial command and require success before declaring the
/// binary ready.
async fn smoke_test(binary: &Path) -> Result<()> {
    let output = Command::new(binary).arg("version").output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        return Err(Error::Evaluation(format!(
            "evaluator smoke test failed with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(())
}

#[async_trait]
impl EvaluationBackend for LocalBackend {
    async fn execute(&self, input: &CheckResult, policy_path: &Path) -> Result<CheckResult> {
        let document = policy::load_policy(policy_path)?;
        let query = format!("data.{}", document.namespace);

        // Removed on drop, success or failure.
        let input_file = tempfile::NamedTempFile::new()?;
        serde_json::to_writer(input_file.as_file(), &input.details)?;

        debug!("Running evaluator query {} for {:?}", query, policy_path);
        let output = Command::new(&self.binary)
            .arg("eval")
            .arg("-d")
            .arg(policy_path)
            .arg("-i")
            .arg(input_file.path())
            .arg(&query)
            .arg("--format=json")
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            return Err(Error::Evaluation(format!(
                "evaluator exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let verdict: serde_json::Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| Error::Evaluation(format!("malformed evaluator output: {}", e)))?;
        let details = verdict
            .pointer(&format!("/result/0/expressions/0/value/{}", RESULT_FIELD))
            .cloned()
            .unwrap_or_else(|| serde_json::Value::Array(Vec::new()));
        Ok(input.with_details(details))
    }
}
