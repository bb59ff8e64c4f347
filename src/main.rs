//! Cloud Drive Operator
//!
//! Serves the planning REST API: loads the storage decision matrix,
//! registers the per-provider storage managers, and answers `POST /create`
//! distribution requests.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use cloud_drive_operator::{
    load_matrix, ApiServer, ApiServerConfig, ApiState, ProviderKind, Result,
    StorageManagerRegistry,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Cloud Drive Operator - block-volume planning and lifecycle control
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// REST API bind address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8090")]
    api_addr: String,

    /// Default provider for requests that name none
    #[arg(long, env = "PROVIDER", default_value = "aws")]
    provider: String,

    /// Path to the storage decision matrix YAML
    #[arg(
        long,
        env = "DECISION_MATRIX_PATH",
        default_value = "/etc/cloud-drive-operator/matrix.yaml"
    )]
    decision_matrix: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting Cloud Drive Operator");
    info!("  Version: {}", cloud_drive_operator::VERSION);
    info!("  REST API: {}", args.api_addr);
    info!("  Default provider: {}", args.provider);

    let provider: ProviderKind = args.provider.parse()?;
    let matrix = load_matrix(&args.decision_matrix)?;
    let registry = Arc::new(StorageManagerRegistry::with_defaults());

    let api_config = ApiServerConfig {
        addr: args.api_addr.parse().map_err(|e| {
            cloud_drive_operator::Error::Configuration(format!("invalid API address: {e}"))
        })?,
    };
    let state = Arc::new(ApiState::new(registry, matrix, provider));

    info!("Starting REST API server");
    ApiServer::new(api_config, state).run().await?;

    info!("Operator shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(level.into())
        .add_directive("hyper=warn".parse().unwrap())
        .add_directive("tower=warn".parse().unwrap())
        .add_directive("axum=info".parse().unwrap());

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
