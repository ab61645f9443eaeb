use anyhow::Context;
use clap::Parser;
use page_capture::{
    setup_logging, validate_config, Cli, CliRunner, Commands, Config, Metrics, PrometheusExporter,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};

/// How long a signalled shutdown waits for the running command.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    setup_logging(args.verbose)?;
    info!("Starting page-capture v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args).await?;

    // The recorder must be installed before metric handles are registered.
    if let Some(port) = args.metrics_port {
        PrometheusExporter::new(port)
            .start()
            .context("failed to start Prometheus exporter")?;
        info!("Prometheus metrics on port {}", port);
    }
    let metrics = Arc::new(Metrics::new());

    let cli_runner = CliRunner::new(config, metrics)?;

    if matches!(args.command, Commands::Batch { .. }) {
        let checker = page_capture::HealthChecker::new(
            cli_runner.service.clone(),
            cli_runner.storage.clone(),
        );
        let interval = (cli_runner.service.config().temp_max_age / 4).max(Duration::from_secs(1));
        tokio::spawn(async move {
            checker.start_periodic_health_checks(interval).await;
        });
    }

    let run = cli_runner.run(args.command);
    tokio::pin!(run);
    let result = tokio::select! {
        result = &mut run => result,
        _ = shutdown_signal() => {
            info!(
                "Received shutdown signal, letting in-flight captures finish for up to {}s",
                SHUTDOWN_GRACE.as_secs()
            );
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut run).await {
                Ok(result) => result,
                Err(_) => {
                    warn!("Shutdown grace period elapsed, abandoning in-flight captures");
                    Ok(())
                }
            }
        }
    };

    info!("Shutting down...");
    cli_runner.service.shutdown().await;
    if let Err(e) = cli_runner.service.sweep_temp_dir().await {
        warn!("Temp directory sweep failed: {}", e);
    }

    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }
    Ok(())
}

/// File, then environment, then command-line flags.
async fn load_config(args: &Cli) -> anyhow::Result<Config> {
    let mut config = if let Some(config_path) = &args.config {
        let content = tokio::fs::read_to_string(config_path)
            .await
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        serde_json::from_str(&content).context("invalid configuration JSON")?
    } else {
        Config::default()
    };

    config.apply_env_overrides();

    if let Some(chrome_path) = &args.chrome_path {
        config.renderer.chrome_path = Some(chrome_path.clone());
    }
    if let Some(uploads_dir) = &args.uploads_dir {
        config.uploads_dir = uploads_dir.clone();
    }

    validate_config(&config)?;

    info!("Uploads dir: {}", config.uploads_dir.display());
    info!(
        "Cloud storage: {}",
        if config.storage.enabled { config.storage.bucket.as_str() } else { "disabled" }
    );
    Ok(config)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
