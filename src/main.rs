use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use gsfly_agent::config::{loader, ServiceConfig};
use gsfly_agent::extension::NoopExtension;
use gsfly_agent::Service;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_NAMES: &[&str] = &[
    "agent.properties",
    "agent.yaml",
    "agent.yml",
    "agent.json",
];

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

fn resolve_config_path() -> Option<PathBuf> {
    if let Some(arg) = std::env::args().nth(1) {
        return Some(PathBuf::from(arg));
    }
    DEFAULT_CONFIG_NAMES
        .iter()
        .map(PathBuf::from)
        .find(|p| p.exists())
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    tracing::info!("gsfly-agent starting");

    let Some(config_path) = resolve_config_path() else {
        tracing::error!(
            "no config file found (looked for {:?}); pass a path as the first argument",
            DEFAULT_CONFIG_NAMES
        );
        return ExitCode::FAILURE;
    };

    let map = match loader::load_file(&config_path) {
        Ok(map) => map,
        Err(e) => {
            tracing::error!(error = %e, path = %config_path.display(), "failed to load config");
            return ExitCode::FAILURE;
        }
    };

    let config = match ServiceConfig::from_map(&map) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid config");
            return ExitCode::FAILURE;
        }
    };

    let service = match Service::new(config, Arc::new(NoopExtension)) {
        Ok(service) => service,
        Err(e) => {
            tracing::error!(error = %e, "failed to build service");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(agent_id = service.agent_id(), "service ready");
    if let Err(e) = service.run().await {
        tracing::error!(error = %e, "service exited with error");
        return ExitCode::FAILURE;
    }

    tracing::info!("gsfly-agent exited cleanly");
    ExitCode::SUCCESS
}
