use anyhow::Context;
use calculator_loadtest::{Config, GrpcConnector, LoadRunner, ProtoSchema};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Serve Prometheus metrics for the duration of the run
fn setup_prometheus_exporter(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;
    info!("Prometheus metrics listening on {}", addr);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "calculator_loadtest=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration from environment
    let config = Config::from_env().context("Invalid configuration")?;
    config.validate().context("Invalid configuration")?;
    info!(
        "Loaded configuration: vus={}, duration={:?}, target={}",
        config.scenario.vus, config.scenario.duration, config.target.address
    );

    if let Some(addr) = config.output.prometheus_addr {
        setup_prometheus_exporter(addr)?;
    }

    // The protocol definition is loaded once; any failure aborts the whole run
    let schema = ProtoSchema::load(&config.target.import_paths, &config.target.proto_file)
        .inspect_err(|e| error!("Failed to load protocol definition: {}", e))
        .context("Scenario setup failed")?;

    let connector = Arc::new(GrpcConnector::new(&config.target));
    let summary_export = config.output.summary_export.clone();
    let runner = LoadRunner::new(config, &schema, connector).context("Scenario setup failed")?;

    let summary = runner.run().await;
    println!("{}", summary.report());

    if let Some(path) = summary_export {
        summary
            .write_json(&path)
            .with_context(|| format!("Failed to write summary to {}", path.display()))?;
        info!("Summary written to {}", path.display());
    }

    Ok(())
}
