//! MarketBridge entry point.

use std::process::ExitCode;

use gateway::{Config, ConfigError, ExitReason};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use upstream::TcpTransport;

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match Config::load(std::env::args().skip(1)) {
        Ok(config) => config,
        Err(ConfigError::Help) => {
            print!("{}", gateway::config::USAGE);
            return ExitCode::SUCCESS;
        }
        Err(e) if e.is_usage() => {
            eprintln!("{e}");
            eprint!("{}", gateway::config::USAGE);
            return ExitCode::from(64);
        }
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(1);
        }
    };

    info!("starting MarketBridge");
    info!(
        upstream = %format!("{}:{}", config.upstream_host, config.upstream_port),
        listen = %format!("{}:{}", config.ws_host, config.ws_port),
        "configuration loaded"
    );

    if let Err(e) = PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.metrics_port))
        .install()
    {
        error!(error = %e, port = config.metrics_port, "failed to start metrics exporter");
        return ExitCode::from(1);
    }

    let transport = TcpTransport::new(&config.upstream_host, config.upstream_port);
    match gateway::supervisor::run(config, transport).await {
        Ok(ExitReason::Clean) => ExitCode::SUCCESS,
        Ok(ExitReason::UpstreamFailed) => ExitCode::from(2),
        Err(e) => {
            error!(error = %format!("{e:#}"), "fatal error");
            ExitCode::from(1)
        }
    }
}
