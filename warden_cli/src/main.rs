use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::EnvFilter;
use warden_core::backend::{load_policy, DEFAULT_DOWNLOAD_BASE_URL};
use warden_core::{
    CheckResult, EvaluationBackend, LocalBackend, LocalBackendConfig, RemoteBackend,
    RemoteBackendConfig,
};

#[derive(Debug, Parser)]
#[command(name = "warden", version, about = "Policy execution tools for the warden posture scanner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Print the declared namespace of a policy document
    InspectPolicy {
        /// Path to the policy file
        #[arg(long)]
        file: PathBuf,
    },
    /// Download and verify the local evaluator binary
    FetchEvaluator {
        /// Directory to install the binary into
        #[arg(long, default_value = ".")]
        dir: PathBuf,
        /// Override the download base URL
        #[arg(long, default_value = DEFAULT_DOWNLOAD_BASE_URL)]
        base_url: String,
    },
    /// Probe a remote evaluation service
    Probe {
        /// Base URL of the service
        #[arg(long)]
        url: String,
    },
    /// Evaluate one policy against a JSON input file
    Eval {
        /// Path to the policy file
        #[arg(long)]
        policy: PathBuf,
        /// Path to the JSON input document
        #[arg(long)]
        input: PathBuf,
        /// Evaluate against a remote service instead of the local binary
        #[arg(long)]
        url: Option<String>,
        /// Directory holding (or receiving) the local evaluator binary
        #[arg(long, default_value = ".")]
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli.command).await {
        error!("{}", e);
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(command: Commands) -> warden_core::Result<()> {
    match command {
        Commands::InspectPolicy { file } => {
            let document = load_policy(&file)?;
            println!("{}", document.namespace);
        }
        Commands::FetchEvaluator { dir, base_url } => {
            let backend = LocalBackend::acquire(LocalBackendConfig {
                binary_dir: dir,
                download_base_url: base_url,
            })
            .await?;
            println!("Evaluator ready at {}", backend.binary_path().display());
        }
        Commands::Probe { url } => {
            RemoteBackend::connect(RemoteBackendConfig::new(url.clone())).await?;
            println!("Evaluation service at {} is reachable", url);
        }
        Commands::Eval {
            policy,
            input,
            url,
            dir,
        } => {
            let details: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&input)?)?;
            let name = policy
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("ad-hoc")
                .to_string();
            let record = CheckResult::new(name.clone(), name, "ad-hoc evaluation", details);

            let backend: Arc<dyn EvaluationBackend> = match url {
                Some(url) => Arc::new(RemoteBackend::connect(RemoteBackendConfig::new(url)).await?),
                None => {
                    Arc::new(
                        LocalBackend::acquire(LocalBackendConfig {
                            binary_dir: dir,
                            download_base_url: DEFAULT_DOWNLOAD_BASE_URL.to_string(),
                        })
                        .await?,
                    )
                }
            };

            let verdict = backend.execute(&record, &policy).await?;
            println!("{}", serde_json::to_string_pretty(&verdict.details)?);
        }
    }
    Ok(())
}
