use anyhow::{bail, Context, Result};
use sensor_bridge::config::Config;
use sensor_bridge::dead_letter::FileDeadLetter;
use sensor_bridge::lifecycle::{Exit, LifecycleController};
use sensor_bridge::mqtt::{self, MessageHandler};
use sensor_bridge::pipeline::{self, PipelineStats};
use sensor_bridge::store::{DocumentStore, PgDocumentStore};
use sensor_bridge::writer::{StorageWriter, WriterSettings};
use std::sync::Arc;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,sensor_bridge=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(normalize_otlp_http_endpoint(endpoint));
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "sensor-bridge"),
            ])))
            .install_batch(Tokio)?;

        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim().trim_end_matches('/');
    if trimmed.is_empty() || trimmed.ends_with("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{trimmed}/v1/traces")
}

/// Ctrl-C, plus SIGTERM on unix.
async fn termination_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
                return;
            }
            Err(err) => tracing::warn!(error = %err, "failed to install SIGTERM handler"),
        }
    }
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for ctrl-c");
        futures::future::pending::<()>().await;
    }
}

fn spawn_status_logger(
    stats: Arc<PipelineStats>,
    interval: std::time::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let snapshot = stats.snapshot();
            tracing::info!(
                received = snapshot.received,
                malformed = snapshot.malformed,
                dropped = snapshot.dropped,
                queue_depth = snapshot.queue_depth,
                stored = snapshot.stored,
                store_retries = snapshot.store_retries,
                dead_lettered = snapshot.dead_lettered,
                dead_letter_failed = snapshot.dead_letter_failed,
                mqtt_connected = snapshot.mqtt_connected,
                last_mqtt_error = stats.last_mqtt_error().as_deref().unwrap_or(""),
                last_store_error = stats.last_store_error().as_deref().unwrap_or(""),
                "pipeline status"
            );
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;
    tracing::info!(
        host = %config.mqtt_host,
        port = config.mqtt_port,
        topic = %config.mqtt_topic,
        collection = %config.collection,
        timezone = %config.timezone,
        queue_capacity = config.queue_capacity,
        "starting sensor bridge"
    );

    let store = PgDocumentStore::connect(
        &config.database_url,
        config.db_pool_size,
        config.store_timeout(),
        &config.collection,
    )
    .await?;
    tokio::time::timeout(config.store_timeout(), store.ping())
        .await
        .context("document store ping timed out")?
        .context("document store ping failed")?;
    tracing::info!(collection = %store.collection(), "document store reachable");

    let stats = Arc::new(PipelineStats::new());
    let (producer, consumer) =
        pipeline::channel(config.queue_capacity, config.enqueue_timeout(), stats.clone());
    let handler = MessageHandler::new(producer, config.timezone);
    let writer = StorageWriter::new(
        store,
        FileDeadLetter::new(&config.dead_letter_path),
        WriterSettings {
            max_attempts: config.store_max_attempts,
            insert_timeout: config.store_timeout(),
            retry_base: config.store_retry_base(),
            retry_max: config.store_retry_max(),
        },
        stats.clone(),
    );

    let status_handle = spawn_status_logger(stats.clone(), config.status_log_interval());

    let mut controller = LifecycleController::new(config.drain_timeout());
    let listener = mqtt::run_listener(config.clone(), handler, controller.stop_token());
    let writer = writer.run(consumer, controller.drain_deadline_token());
    controller.start(listener, writer)?;

    if controller.wait_for_exit(termination_signal()).await == Exit::ListenerExited {
        tracing::warn!("MQTT listener exited; shutting down");
    }
    let report = controller.shutdown().await;
    status_handle.abort();

    let snapshot = stats.snapshot();
    tracing::info!(
        received = snapshot.received,
        malformed = snapshot.malformed,
        dropped = snapshot.dropped,
        stored = report.writer.stored,
        dead_lettered = report.writer.dead_lettered,
        dead_letter_failed = report.writer.dead_letter_failed,
        "sensor bridge stopped"
    );

    if let Some(failure) = report.transport_failure {
        bail!("startup health check failed: {failure}");
    }
    Ok(())
}
