use std::time;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use happiness_common::channel::{ChannelError, Publisher};
use happiness_common::metrics::{RECORDS_PUBLISHED, RECORDS_PUBLISH_FAILED};
use happiness_common::record::RawRecord;
use happiness_common::retry::RetryPolicy;

/// Outcome of a producer run, for the operator.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ProducerSummary {
    pub published: usize,
    pub failed: usize,
}

/// Publishes records one at a time, in source order.
pub struct RecordProducer<P> {
    publisher: P,
    topic: String,
    retry_policy: RetryPolicy,
}

impl<P: Publisher> RecordProducer<P> {
    pub fn new(publisher: P, topic: &str, retry_policy: RetryPolicy) -> Self {
        Self {
            publisher,
            topic: topic.to_owned(),
            retry_policy,
        }
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    /// Publish every record, pausing `rate_limit` between two sends.
    ///
    /// A record that cannot be published after exhausting the retry policy is
    /// logged and skipped. Cancelling `shutdown` stops the run before the next
    /// send.
    pub async fn run(
        &self,
        records: &[RawRecord],
        rate_limit: time::Duration,
        shutdown: &CancellationToken,
    ) -> ProducerSummary {
        let mut summary = ProducerSummary::default();

        for (index, record) in records.iter().enumerate() {
            if index > 0 {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => {},
                    _ = tokio::time::sleep(rate_limit) => {},
                }
            }
            if shutdown.is_cancelled() {
                info!(remaining = records.len() - index, "shutdown requested, stopping");
                break;
            }

            match self.publish(record).await {
                Ok(()) => {
                    summary.published += 1;
                    metrics::counter!(RECORDS_PUBLISHED).increment(1);
                }
                Err(error) => {
                    summary.failed += 1;
                    metrics::counter!(RECORDS_PUBLISH_FAILED).increment(1);
                    error!(
                        key = %record.key(),
                        %error,
                        "failed to publish record, skipping it"
                    );
                }
            }
        }

        summary
    }

    async fn publish(&self, record: &RawRecord) -> Result<(), ChannelError> {
        let payload = record.to_wire()?;
        let key = record.key();
        let mut attempt = 1;

        loop {
            match self
                .publisher
                .publish(&self.topic, Some(&key), &payload)
                .await
            {
                Ok(()) => return Ok(()),
                Err(error) if error.is_retryable() && self.retry_policy.should_retry(attempt) => {
                    let wait = self.retry_policy.time_until_next_retry(attempt);
                    warn!(attempt, ?wait, %error, "publish failed, retrying");
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}
