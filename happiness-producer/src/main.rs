//! Publish happiness records from a CSV file to Kafka.
use envconfig::Envconfig;
use eyre::{Result, WrapErr};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use happiness_common::channel::kafka::KafkaPublisher;
use happiness_common::health::HealthRegistry;
use happiness_common::metrics::{serve, setup_metrics_recorder, setup_metrics_router};
use happiness_producer::config::Config;
use happiness_producer::producer::RecordProducer;
use happiness_producer::source::CsvSource;

async fn shutdown_signal(shutdown: CancellationToken) {
    let term = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(error) => {
                tracing::warn!("failed to register SIGTERM handler: {}", error);
                std::future::pending::<()>().await
            }
        }
    };

    tokio::select! {
        _ = term => {},
        _ = signal::ctrl_c() => {},
    };

    tracing::info!("Shutting down gracefully...");
    shutdown.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::init_from_env().wrap_err("invalid configuration")?;

    let liveness = HealthRegistry::new("liveness");
    let kafka_liveness = liveness.register("rdkafka", time::Duration::seconds(30));

    let recorder_handle = setup_metrics_recorder().wrap_err("failed to install metrics recorder")?;
    let router = setup_metrics_router("happiness producer", liveness, Some(recorder_handle));
    let bind = config.bind();
    tokio::task::spawn(async move {
        if let Err(error) = serve(router, &bind).await {
            tracing::error!("failed to start serving metrics: {}", error);
        }
    });

    let source = CsvSource::from_path(&config.source_path)?;
    let publisher = KafkaPublisher::new(&config.kafka, kafka_liveness)?;
    let producer = RecordProducer::new(
        publisher,
        &config.kafka.kafka_topic,
        config.retry_policy.policy(),
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let summary = producer
        .run(source.records(), config.rate_limit.0, &shutdown)
        .await;
    producer.publisher().flush()?;

    tracing::info!(
        published = summary.published,
        failed = summary.failed,
        skipped = source.skipped(),
        "producer finished"
    );

    Ok(())
}
