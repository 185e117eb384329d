//! Score happiness records read from a subscription and persist them.
//!
//! Messages are processed strictly one at a time. Every message reaches one
//! of two terminal states, persisted or failed at some stage, and only then is
//! its offset acknowledged. Acknowledged offsets are committed on clean
//! shutdown, or by the channel's own commit schedule.
use std::sync::Arc;
use std::time;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use happiness_common::channel::{publish_json, ChannelError, Delivery, Publisher, Subscription};
use happiness_common::health::HealthHandle;
use happiness_common::metrics::{
    RECORDS_DEAD_LETTERED, RECORDS_FAILED, RECORDS_PERSISTED, RECORD_PROCESSING_DURATION,
};
use happiness_common::record::{decode_object, EnrichedRecord, RawRecord};
use happiness_common::retry::RetryPolicy;
use happiness_common::scoring::Scorer;
use happiness_common::storage::RecordSink;

use crate::error::{ConsumerError, ProcessingError, Stage};

/// Counters for one run of the consumer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerStats {
    pub received: usize,
    pub persisted: usize,
    pub failed: usize,
    pub dead_lettered: usize,
}

/// A topic collecting messages that failed processing.
#[derive(Clone)]
pub struct DeadLetter {
    pub publisher: Arc<dyn Publisher>,
    pub topic: String,
}

#[derive(Serialize)]
struct DeadLetterMessage<'a> {
    topic: &'a str,
    partition: i32,
    offset: i64,
    stage: Stage,
    error: String,
    payload: String,
}

/// Takes a single message from payload to stored row.
pub struct RecordProcessor<K> {
    sink: K,
    scorer: Arc<dyn Scorer>,
    retry_policy: RetryPolicy,
    dead_letter: Option<DeadLetter>,
}

impl<K: RecordSink> RecordProcessor<K> {
    pub fn new(sink: K, scorer: Arc<dyn Scorer>, retry_policy: RetryPolicy) -> Self {
        Self {
            sink,
            scorer,
            retry_policy,
            dead_letter: None,
        }
    }

    pub fn with_dead_letter(mut self, dead_letter: DeadLetter) -> Self {
        self.dead_letter = Some(dead_letter);
        self
    }

    /// Decode, validate, score and store one message. Returns the id of the
    /// stored row.
    pub async fn process(&self, payload: &[u8]) -> Result<i64, ProcessingError> {
        let fields = decode_object(payload)?;
        let record = RawRecord::try_from(fields)?;
        let prediction = self.scorer.score(&record.features())?;
        let enriched = EnrichedRecord::new(record, prediction)?;

        self.persist(&enriched).await
    }

    async fn persist(&self, record: &EnrichedRecord) -> Result<i64, ProcessingError> {
        let mut attempt = 1;

        loop {
            match self.sink.insert(record).await {
                Ok(id) => return Ok(id),
                Err(error) if error.is_retryable() && self.retry_policy.should_retry(attempt) => {
                    let wait = self.retry_policy.time_until_next_retry(attempt);
                    warn!(attempt, ?wait, %error, "storage unavailable, retrying insert");
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    /// Log a failed message and route it to the dead-letter topic, if any.
    /// Returns whether the message was dead-lettered.
    async fn reject(&self, delivery: &Delivery, error: &ProcessingError) -> bool {
        let stage = error.stage();
        metrics::counter!(RECORDS_FAILED, "stage" => stage.as_str()).increment(1);
        error!(
            %stage,
            payload = %delivery.payload_lossy(),
            partition = delivery.receipt.partition,
            offset = delivery.receipt.offset,
            %error,
            "failed to process record, skipping it"
        );

        let Some(dead_letter) = &self.dead_letter else {
            return false;
        };

        let message = DeadLetterMessage {
            topic: &delivery.receipt.topic,
            partition: delivery.receipt.partition,
            offset: delivery.receipt.offset,
            stage,
            error: error.to_string(),
            payload: delivery.payload_lossy(),
        };
        match publish_json(
            dead_letter.publisher.as_ref(),
            &dead_letter.topic,
            None,
            &message,
        )
        .await
        {
            Ok(()) => {
                metrics::counter!(RECORDS_DEAD_LETTERED).increment(1);
                true
            }
            Err(error) => {
                error!(topic = %dead_letter.topic, %error, "failed to publish dead letter");
                false
            }
        }
    }
}

/// The long-running consumer loop.
pub struct RecordConsumer<S, K> {
    subscription: S,
    processor: RecordProcessor<K>,
    /// Backoff for a failing subscription.
    retry_policy: RetryPolicy,
    liveness: HealthHandle,
    liveness_interval: time::Duration,
}

impl<S: Subscription, K: RecordSink> RecordConsumer<S, K> {
    pub fn new(
        subscription: S,
        processor: RecordProcessor<K>,
        retry_policy: RetryPolicy,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            subscription,
            processor,
            retry_policy,
            liveness,
            liveness_interval: time::Duration::from_secs(10),
        }
    }

    pub fn with_liveness_interval(mut self, interval: time::Duration) -> Self {
        // tokio intervals cannot be zero
        self.liveness_interval = interval.max(time::Duration::from_millis(1));
        self
    }

    /// Consume until `shutdown` is cancelled.
    ///
    /// A message already received when shutdown is requested is processed to
    /// completion; then every acknowledged offset is committed. The loop fails
    /// if the subscription keeps failing past the retry policy, which also
    /// marks the consumer unhealthy, or if the final commit fails.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<ConsumerStats, ConsumerError> {
        let mut stats = ConsumerStats::default();
        let mut liveness_tick = tokio::time::interval(self.liveness_interval);
        let mut failed_receives = 0;

        let outcome = loop {
            let received = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                _ = liveness_tick.tick() => {
                    self.liveness.report_healthy();
                    continue;
                }
                received = self.subscription.recv() => received,
            };

            let delivery = match received {
                Ok(delivery) => {
                    failed_receives = 0;
                    delivery
                }
                Err(ChannelError::Closed) => {
                    info!("subscription closed, stopping");
                    break Ok(());
                }
                Err(error) => {
                    failed_receives += 1;
                    if !self.retry_policy.should_retry(failed_receives) {
                        self.liveness.report_unhealthy();
                        break Err(error);
                    }
                    let wait = self.retry_policy.time_until_next_retry(failed_receives);
                    warn!(attempt = failed_receives, ?wait, %error, "failed to receive, retrying");
                    tokio::time::sleep(wait).await;
                    continue;
                }
            };

            stats.received += 1;
            let started = std::time::Instant::now();
            match self.processor.process(delivery.payload()).await {
                Ok(id) => {
                    stats.persisted += 1;
                    metrics::counter!(RECORDS_PERSISTED).increment(1);
                    debug!(
                        id,
                        partition = delivery.receipt.partition,
                        offset = delivery.receipt.offset,
                        "persisted record"
                    );
                }
                Err(error) => {
                    stats.failed += 1;
                    if self.processor.reject(&delivery, &error).await {
                        stats.dead_lettered += 1;
                    }
                }
            }
            metrics::histogram!(RECORD_PROCESSING_DURATION).record(started.elapsed().as_secs_f64());

            if let Err(error) = self.subscription.ack(&delivery.receipt) {
                warn!(
                    partition = delivery.receipt.partition,
                    offset = delivery.receipt.offset,
                    %error,
                    "failed to store offset, the record may be delivered again"
                );
            }
        };

        let committed = self.subscription.commit().await;
        info!(
            received = stats.received,
            persisted = stats.persisted,
            failed = stats.failed,
            dead_lettered = stats.dead_lettered,
            "consumer stopped"
        );

        if let Err(error) = outcome {
            if let Err(commit_error) = committed {
                error!(error = %commit_error, "failed to commit acknowledged offsets");
            }
            return Err(error.into());
        }
        committed?;
        Ok(stats)
    }
}
