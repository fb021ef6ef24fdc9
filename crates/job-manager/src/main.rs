use anyhow::{Context, Result};
use scanfleet_dispatch::WorkerConfig;
use scanfleet_job_manager::{init_telemetry, LocalConfig, LocalEnvironment, TelemetryConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine; configuration may come from the real environment
    dotenvy::dotenv().ok();

    // Configure via environment variables:
    // - OTEL_EXPORTER_OTLP_ENDPOINT: OTLP endpoint (e.g., "http://localhost:4317")
    // - RUST_LOG or LOG_LEVEL: Log filter (default: info for the scanfleet crates)
    let _telemetry_guard = init_telemetry(TelemetryConfig::from_env());

    tracing::info!("scanfleet-job-manager starting...");

    let config = WorkerConfig::from_env().context("Failed to read worker configuration")?;
    config.validate().context("Invalid worker configuration")?;
    let local = LocalConfig::from_env().context("Failed to read local configuration")?;

    tracing::info!(
        job_id = %config.job_id,
        pool_id = %config.dispatcher.pool_id,
        pool_nodes = local.pool_nodes,
        task_slots_per_node = local.task_slots_per_node,
        "Starting dispatch worker in local mode"
    );

    let environment = LocalEnvironment::new(&config, &local);
    environment
        .seed(local.seed_requests)
        .await
        .context("Failed to seed work requests")?;
    let simulator = environment.spawn_simulator();

    let mut worker = environment.worker(config);
    let shutdown = worker.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received shutdown signal");
            shutdown.shutdown();
        }
    });

    let result = worker.run().await;
    simulator.abort();

    let report = result.context("Dispatch worker failed")?;
    tracing::info!(
        job_id = %report.job_id,
        exit_reason = ?report.exit_reason,
        cycles = report.cycles,
        tasks_admitted = report.tasks_admitted,
        requests_reconciled = report.requests_reconciled,
        "Worker shutdown complete"
    );
    Ok(())
}
