// Pipeliner - HTTP Server
// The production entrypoint: configuration, logging, wiring and the API server
// Run with: cargo run --bin server -- --config config.yaml

//! # Pipeliner Server Binary
//!
//! Loads [`AppConfig`], initializes tracing, wires the runtime together and
//! serves the HTTP API.
//!
//! ```text
//! main()
//!   ↓ loads
//! AppConfig (defaults → YAML → PIPELINER__* env)
//!   ↓ builds
//! HttpClient → ScenarioLoader + Services → PipelineRunner
//!   ↓ serves
//! ApiServer (axum)
//! ```
//!
//! ## Rust Learning Notes:
//!
//! ### Async Main Function
//! `#[tokio::main]` turns the async `main` into a synchronous one that starts
//! the tokio runtime and blocks on the future.
//!
//! ### Binary crate vs library crate
//! Everything testable lives in the `pipeliner` library; this file only
//! wires it together.

use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pipeliner::api::{ApiServer, AppState};
use pipeliner::integrations::{HttpClient, Services, TracingMetrics};
use pipeliner::{AppConfig, InMemoryStorage, PipelineRunner, ScenarioLoader};

#[derive(Debug, Parser)]
#[command(name = "pipeliner", version, about = "Scenario execution service")]
struct Args {
    /// YAML configuration file
    #[arg(short, long, env = "PIPELINER_CONFIG")]
    config: Option<String>,

    /// Overrides `server.port`
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let mut config = AppConfig::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.server.port = port;
    }

    // RUST_LOG wins over the configured level
    let default_level = config.log_level.clone().unwrap_or_else(|| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("🚀 Starting Pipeliner...");
    info!("=====================================");
    info!("Server: {}", config.bind_address());
    info!(
        "Engine: max {} steps per task, nesting depth {}",
        config.engine.max_steps_per_task, config.engine.max_nesting_depth
    );

    if config.function_store.url().is_some() {
        info!("✅ Function store: {}", config.function_store.base_url);
    } else {
        warn!("⚠️  function_store.base_url is not set, python3 blocks will fail");
    }
    if !config.remedy.base_url.is_empty() {
        info!("✅ Remedy: {}", config.remedy.base_url);
    }
    if !config.ngsa.collector_url.is_empty() {
        info!("✅ NGSA collector: {}", config.ngsa.collector_url);
    }
    if config.sso.client_secret().is_some() {
        info!("✅ SSO client secret found in ${}", config.sso.client_secret_env);
    }

    let http = HttpClient::new(config.retry_policy(), Arc::new(TracingMetrics))?;
    let services = Services::from_config(&config, &http);
    let loader = ScenarioLoader::new(http, config.endpoints());
    let runner = PipelineRunner::new(Arc::new(InMemoryStorage::new()), loader, services, config.limits());

    let state = AppState::new(runner).with_async_run_default(config.engine.async_run_default);
    ApiServer::new(state, config.server.host.clone(), config.server.port)
        .with_cors(config.server.cors)
        .run()
        .await?;

    Ok(())
}
