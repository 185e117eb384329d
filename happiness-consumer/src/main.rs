//! Consume happiness records from Kafka, score them and store them in PostgreSQL.
use std::sync::Arc;

use envconfig::Envconfig;
use eyre::{Result, WrapErr};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use happiness_common::channel::kafka::{KafkaPublisher, KafkaSubscription};
use happiness_common::health::HealthRegistry;
use happiness_common::metrics::{serve, setup_metrics_recorder, setup_metrics_router};
use happiness_common::scoring::LinearModel;
use happiness_common::storage::PgSink;
use happiness_consumer::config::Config;
use happiness_consumer::consumer::{DeadLetter, RecordConsumer, RecordProcessor};
use happiness_consumer::error::ConsumerError;

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
    let deadline = time::Duration::try_from(config.liveness_interval.0 * 3)
        .wrap_err("liveness interval is too large")?;
    let consumer_liveness = liveness.register("consumer", deadline);

    let recorder_handle = setup_metrics_recorder().wrap_err("failed to install metrics recorder")?;
    let router = setup_metrics_router(
        "happiness consumer",
        liveness.clone(),
        Some(recorder_handle),
    );
    let bind = config.bind();
    tokio::task::spawn(async move {
        if let Err(error) = serve(router, &bind).await {
            tracing::error!("failed to start serving metrics: {}", error);
        }
    });

    let scorer = Arc::new(LinearModel::from_path(&config.model_path).map_err(ConsumerError::from)?);
    tracing::info!(path = %config.model_path, "loaded scoring model");

    let sink = PgSink::connect(&config.database_url, config.max_pg_connections)
        .await
        .map_err(ConsumerError::from)?;
    if config.create_schema {
        sink.create_schema().await.map_err(ConsumerError::from)?;
    }

    let retry_policy = config.retry_policy.policy();
    let mut processor = RecordProcessor::new(sink, scorer, retry_policy);
    if let Some(topic) = &config.dead_letter_topic {
        let kafka_liveness = liveness.register("rdkafka-dead-letter", time::Duration::seconds(30));
        let publisher = KafkaPublisher::new(&config.kafka, kafka_liveness)?;
        processor = processor.with_dead_letter(DeadLetter {
            publisher: Arc::new(publisher),
            topic: topic.as_str().to_owned(),
        });
    }

    let subscription = KafkaSubscription::new(&config.kafka, &config.consumer)?;
    let consumer = RecordConsumer::new(subscription, processor, retry_policy, consumer_liveness)
        .with_liveness_interval(config.liveness_interval.0);

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let stats = consumer.run(shutdown).await?;
    tracing::info!(
        received = stats.received,
        persisted = stats.persisted,
        failed = stats.failed,
        "consumer finished"
    );

    Ok(())
}
