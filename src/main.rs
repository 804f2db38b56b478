//! CLI entry point for the triage orchestrator.
//!
//! ```bash
//! # Run one request against the deterministic stub stages.
//! triage-core run --request ./request.json
//!
//! # Same, but write the response to a file instead of stdout.
//! triage-core run --request ./request.json --output ./response.json
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info, Level};

use triage_orchestrator::artifact_store::LocalArtifactStore;
use triage_orchestrator::orchestrator::{Orchestrator, ProcessingRequest};
use triage_orchestrator::policy::PolicyRegistry;
use triage_orchestrator::stage::stub::default_registry;
use triage_orchestrator::telemetry::{init_telemetry, shutdown_telemetry, ChannelTelemetryHooks, TelemetryConfig};

#[derive(Parser)]
#[command(name = "triage-core")]
#[command(about = "Policy-driven step graph executor for medical-imaging triage pipelines", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Runs a single processing request through the orchestrator.
    Run {
        /// Path to a JSON-encoded `ProcessingRequest`.
        #[arg(short, long)]
        request: PathBuf,

        /// Where to write the JSON response. Defaults to stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Directory backing the local artifact store.
        #[arg(long, default_value = "./artifacts")]
        artifact_root: PathBuf,

        /// Verbose (DEBUG) logging instead of INFO.
        #[arg(long, short = 'v', default_value = "false")]
        verbose: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Run { request, output, artifact_root, verbose } => {
            let mut telemetry_config = TelemetryConfig::from_env();
            telemetry_config.log_level = if *verbose { Level::DEBUG } else { Level::INFO };

            if let Err(e) = init_telemetry(telemetry_config) {
                eprintln!("Warning: failed to initialize telemetry: {e}");
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                    .try_init();
            }

            run_request(request, output, artifact_root).await;

            shutdown_telemetry();
        }
    }
}

async fn run_request(request_path: &PathBuf, output_path: &Option<PathBuf>, artifact_root: &PathBuf) {
    let raw = match std::fs::read_to_string(request_path) {
        Ok(raw) => raw,
        Err(e) => {
            error!(error = %e, "failed to read request file");
            std::process::exit(1);
        }
    };

    let request: ProcessingRequest = match serde_json::from_str(&raw) {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "failed to parse request JSON");
            std::process::exit(1);
        }
    };

    let store = Arc::new(LocalArtifactStore::new(artifact_root.clone()));
    let orchestrator = Orchestrator::new(
        Arc::new(PolicyRegistry::new()),
        Arc::new(default_registry(store.clone())),
        store,
        Arc::new(ChannelTelemetryHooks::default()),
    );

    info!(image_ref = %request.image_ref, mode = ?request.mode, "processing request");

    let response = match orchestrator.process(request).await {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "orchestrator rejected request");
            std::process::exit(1);
        }
    };

    let json = serde_json::to_string_pretty(&response).expect("response is always serializable");
    match output_path {
        Some(path) => {
            if let Err(e) = std::fs::write(path, json) {
                eprintln!("failed to write response: {e}");
                std::process::exit(1);
            }
            println!("response written to {path:?}");
        }
        None => println!("{json}"),
    }
}
