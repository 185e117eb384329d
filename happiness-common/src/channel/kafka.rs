use std::time::Duration;

use async_trait::async_trait;
use metrics::{counter, gauge};
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::types::RDKafkaRespErr;
use rdkafka::util::Timeout;
use rdkafka::{ClientConfig, Message, Offset, TopicPartitionList};
use tracing::{debug, error, info};

use super::{ChannelError, Delivery, Publisher, Receipt, Subscription};
use crate::config::{ConsumerConfig, KafkaConfig};
use crate::health::HealthHandle;

pub struct KafkaContext {
    liveness: HealthHandle,
}

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        // Signal liveness, as the main rdkafka loop is running and calling us
        self.liveness.report_healthy();

        gauge!("happiness_kafka_producer_queue_depth").set(stats.msg_cnt as f64);
        gauge!("happiness_kafka_producer_queue_depth_limit").set(stats.msg_max as f64);

        for (_, stats) in stats.brokers {
            let id_string = format!("{}", stats.nodeid);
            gauge!(
                "happiness_kafka_broker_requests_pending",
                "broker" => id_string.clone()
            )
            .set(stats.outbuf_cnt as f64);
            counter!(
                "happiness_kafka_broker_tx_errors_total",
                "broker" => id_string
            )
            .absolute(stats.txerrs);
        }
    }
}

fn apply_tls(client_config: &mut ClientConfig, config: &KafkaConfig) {
    if config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    };
}

/// Publishes to Kafka, resolving only once the broker acknowledged the write.
#[derive(Clone)]
pub struct KafkaPublisher {
    producer: FutureProducer<KafkaContext>,
}

impl KafkaPublisher {
    pub fn new(config: &KafkaConfig, liveness: HealthHandle) -> Result<Self, ChannelError> {
        info!("connecting to Kafka brokers at {}...", config.kafka_hosts);

        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("statistics.interval.ms", "10000")
            .set("linger.ms", config.kafka_producer_linger_ms.to_string())
            .set(
                "message.timeout.ms",
                config.kafka_message_timeout_ms.to_string(),
            )
            .set("compression.codec", &config.kafka_compression_codec)
            .set(
                "queue.buffering.max.kbytes",
                (config.kafka_producer_queue_mib * 1024).to_string(),
            );
        apply_tls(&mut client_config, config);

        debug!("rdkafka configuration: {:?}", client_config);
        let producer: FutureProducer<KafkaContext> =
            client_config.create_with_context(KafkaContext { liveness })?;

        // Ping the cluster to make sure we can reach brokers, fail after 10 seconds
        producer
            .client()
            .fetch_metadata(None, Timeout::After(Duration::new(10, 0)))
            .map_err(|error| {
                error!("failed to fetch metadata from Kafka brokers: {}", error);
                ChannelError::Unavailable(error.to_string())
            })?;
        info!("connected to Kafka brokers");

        Ok(KafkaPublisher { producer })
    }

    /// Wait for every queued message to be delivered.
    pub fn flush(&self) -> Result<(), ChannelError> {
        self.producer.flush(Duration::new(30, 0))?;
        Ok(())
    }
}

fn produce_error(error: KafkaError) -> ChannelError {
    match error.rdkafka_error_code() {
        Some(RDKafkaErrorCode::MessageSizeTooLarge) => ChannelError::MessageTooLarge,
        Some(RDKafkaErrorCode::MessageTimedOut) => ChannelError::Unavailable(error.to_string()),
        _ => ChannelError::Kafka(error),
    }
}

#[async_trait]
impl Publisher for KafkaPublisher {
    async fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &[u8],
    ) -> Result<(), ChannelError> {
        let record: FutureRecord<'_, str, [u8]> = FutureRecord {
            topic,
            partition: None,
            payload: Some(payload),
            key,
            timestamp: None,
            headers: None,
        };

        let delivery = match self.producer.send_result(record) {
            Ok(delivery) => delivery,
            Err((error, _)) => return Err(produce_error(error)),
        };

        match delivery.await {
            // Cancelled due to timeout while retrying
            Err(_) => Err(ChannelError::DeliveryTimeout),
            Ok(Err((error, _))) => Err(produce_error(error)),
            Ok(Ok(_)) => Ok(()),
        }
    }
}

/// A consumer group member reading one topic.
///
/// Automatic offset *storing* is disabled: an offset is stored only when the
/// caller acknowledges the message, so the interval auto-commit and the
/// explicit [`Subscription::commit`] never commit a message that is still being
/// processed.
pub struct KafkaSubscription {
    consumer: StreamConsumer,
    topic: String,
}

impl KafkaSubscription {
    pub fn new(
        config: &KafkaConfig,
        consumer_config: &ConsumerConfig,
    ) -> Result<Self, ChannelError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("group.id", &consumer_config.kafka_consumer_group)
            .set(
                "auto.offset.reset",
                &consumer_config.kafka_consumer_offset_reset,
            )
            .set("enable.auto.offset.store", "false")
            .set(
                "enable.auto.commit",
                consumer_config.kafka_consumer_auto_commit.to_string(),
            )
            .set(
                "auto.commit.interval.ms",
                consumer_config
                    .kafka_consumer_auto_commit_interval_ms
                    .to_string(),
            );
        apply_tls(&mut client_config, config);

        debug!("rdkafka configuration: {:?}", client_config);
        let consumer: StreamConsumer = client_config.create()?;

        // Neither create nor subscribe reach a broker: check the topic is
        // served before blocking on recv, fail after 10 seconds
        let metadata = consumer
            .fetch_metadata(
                Some(config.kafka_topic.as_str()),
                Timeout::After(Duration::new(10, 0)),
            )
            .map_err(|error| {
                error!("failed to fetch metadata from Kafka brokers: {}", error);
                ChannelError::Unavailable(error.to_string())
            })?;
        let missing = metadata
            .topics()
            .iter()
            .find(|topic| topic.name() == config.kafka_topic)
            .map_or(true, |topic| {
                topic.error() == Some(RDKafkaRespErr::RD_KAFKA_RESP_ERR_UNKNOWN_TOPIC_OR_PART)
            });
        if missing {
            error!(topic = %config.kafka_topic, "Kafka topic does not exist");
            return Err(ChannelError::Unavailable(format!(
                "topic {} does not exist",
                config.kafka_topic
            )));
        }

        consumer.subscribe(&[config.kafka_topic.as_str()])?;
        info!(
            topic = %config.kafka_topic,
            group = %consumer_config.kafka_consumer_group,
            "subscribed to Kafka topic"
        );

        Ok(Self {
            consumer,
            topic: config.kafka_topic.to_owned(),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl Subscription for KafkaSubscription {
    async fn recv(&mut self) -> Result<Delivery, ChannelError> {
        let message = self.consumer.recv().await?;

        Ok(Delivery {
            receipt: Receipt {
                topic: message.topic().to_owned(),
                partition: message.partition(),
                offset: message.offset(),
            },
            key: message.key().map(<[u8]>::to_vec),
            payload: message.payload().map(<[u8]>::to_vec),
        })
    }

    fn ack(&mut self, receipt: &Receipt) -> Result<(), ChannelError> {
        // The committed offset is the next one to read.
        let mut offsets = TopicPartitionList::new();
        offsets.add_partition_offset(
            &receipt.topic,
            receipt.partition,
            Offset::Offset(receipt.offset + 1),
        )?;
        self.consumer.store_offsets(&offsets)?;
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), ChannelError> {
        match self.consumer.commit_consumer_state(CommitMode::Sync) {
            Ok(()) => Ok(()),
            // Nothing was acknowledged since the last commit
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}
