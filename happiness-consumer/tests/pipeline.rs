use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use happiness_common::channel::memory::MemoryChannel;
use happiness_common::channel::{Publisher, Subscription};
use happiness_common::config::{DEFAULT_CONSUMER_GROUP, DEFAULT_TOPIC};
use happiness_common::health::{HealthHandle, HealthRegistry};
use happiness_common::record::EnrichedRecord;
use happiness_common::retry::RetryPolicy;
use happiness_common::scoring::{LinearModel, Scorer};
use happiness_common::storage::{RecordSink, StorageError};
use happiness_consumer::consumer::{ConsumerStats, DeadLetter, RecordConsumer, RecordProcessor};

const DEAD_LETTER_TOPIC: &str = "kafka-happiness-dead-letter";

/// Stores rows in memory. The first `outages` inserts fail as if the database
/// was down.
#[derive(Clone, Default)]
struct MemorySink {
    rows: Arc<Mutex<Vec<EnrichedRecord>>>,
    outages: Arc<AtomicUsize>,
}

impl MemorySink {
    fn failing(outages: usize) -> Self {
        Self {
            outages: Arc::new(AtomicUsize::new(outages)),
            ..Self::default()
        }
    }

    fn rows(&self) -> Vec<EnrichedRecord> {
        self.rows.lock().unwrap().clone()
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn insert(&self, record: &EnrichedRecord) -> Result<i64, StorageError> {
        let down = self
            .outages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if down {
            return Err(StorageError::StorageUnavailable {
                command: "INSERT",
                error: sqlx::Error::PoolTimedOut,
            });
        }

        let mut rows = self.rows.lock().unwrap();
        rows.push(record.clone());
        Ok(rows.len() as i64)
    }
}

/// Holds every insert until the test releases it.
#[derive(Clone, Default)]
struct GatedSink {
    stored: MemorySink,
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl RecordSink for GatedSink {
    async fn insert(&self, record: &EnrichedRecord) -> Result<i64, StorageError> {
        self.entered.notify_one();
        self.release.notified().await;
        self.stored.insert(record).await
    }
}

fn model() -> Arc<dyn Scorer> {
    Arc::new(LinearModel::new(2.0, [1.0, 2.0, 3.0, -1.0, 0.5, 0.25]).unwrap())
}

fn example_payload() -> Value {
    json!({
        "GDP_per_capita": 1.2,
        "life_expectancy": 0.9,
        "freedom": 0.6,
        "perceptions_corruption": 0.1,
        "generosity": 0.3,
        "continent_numeric": 2,
        "country_numeric": 10,
        "happiness_score": 6.5
    })
}

fn fast_retries(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::build(1, Duration::from_millis(1))
        .max_attempts(max_attempts)
        .provide()
}

fn liveness() -> HealthHandle {
    HealthRegistry::new("liveness").register("consumer", time::Duration::seconds(30))
}

async fn consumer(
    channel: &MemoryChannel,
    processor: RecordProcessor<MemorySink>,
) -> RecordConsumer<happiness_common::channel::memory::MemorySubscription, MemorySink> {
    RecordConsumer::new(
        channel.subscribe(DEFAULT_TOPIC, DEFAULT_CONSUMER_GROUP),
        processor,
        RetryPolicy::no_retries(),
        liveness(),
    )
}

async fn publish(channel: &MemoryChannel, payload: &[u8]) {
    channel.publish(DEFAULT_TOPIC, None, payload).await.unwrap();
}

async fn wait_for<F: Fn() -> bool>(check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(check(), "condition not reached in time");
}

#[tokio::test]
async fn malformed_message_is_skipped_and_next_one_persisted() {
    let channel = MemoryChannel::default();
    let sink = MemorySink::default();
    publish(&channel, b"{not json").await;
    publish(&channel, &serde_json::to_vec(&example_payload()).unwrap()).await;

    let shutdown = CancellationToken::new();
    let processor = RecordProcessor::new(sink.clone(), model(), RetryPolicy::no_retries());
    let handle = tokio::spawn(consumer(&channel, processor).await.run(shutdown.clone()));

    wait_for(|| sink.rows().len() == 1).await;
    shutdown.cancel();
    let stats = handle.await.unwrap().unwrap();

    assert_eq!(
        stats,
        ConsumerStats {
            received: 2,
            persisted: 1,
            failed: 1,
            dead_lettered: 0
        }
    );
    assert_eq!(sink.rows()[0].record.country_numeric, 10);
}

#[tokio::test]
async fn record_missing_a_feature_is_skipped() {
    let channel = MemoryChannel::default();
    let sink = MemorySink::default();

    let mut incomplete = example_payload();
    incomplete.as_object_mut().unwrap().remove("freedom");
    publish(&channel, &serde_json::to_vec(&incomplete).unwrap()).await;
    let mut quoted = example_payload();
    quoted["generosity"] = json!("0.3");
    publish(&channel, &serde_json::to_vec(&quoted).unwrap()).await;
    publish(&channel, &serde_json::to_vec(&example_payload()).unwrap()).await;

    let shutdown = CancellationToken::new();
    let processor = RecordProcessor::new(sink.clone(), model(), RetryPolicy::no_retries());
    let handle = tokio::spawn(consumer(&channel, processor).await.run(shutdown.clone()));

    wait_for(|| sink.rows().len() == 1).await;
    shutdown.cancel();
    let stats = handle.await.unwrap().unwrap();

    assert_eq!(stats.received, 3);
    assert_eq!(stats.failed, 2);
    assert_eq!(sink.rows().len(), 1);
}

#[tokio::test]
async fn database_outage_is_survived() {
    let channel = MemoryChannel::default();
    let sink = MemorySink::failing(1);
    let mut first = example_payload();
    first["country_numeric"] = json!(1);
    publish(&channel, &serde_json::to_vec(&first).unwrap()).await;
    publish(&channel, &serde_json::to_vec(&example_payload()).unwrap()).await;

    let shutdown = CancellationToken::new();
    let processor = RecordProcessor::new(sink.clone(), model(), RetryPolicy::no_retries());
    let handle = tokio::spawn(consumer(&channel, processor).await.run(shutdown.clone()));

    wait_for(|| sink.rows().len() == 1).await;
    shutdown.cancel();
    let stats = handle.await.unwrap().unwrap();

    // The record hit by the outage is lost, the loop keeps going
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.persisted, 1);
    assert_eq!(sink.rows()[0].record.country_numeric, 10);
}

#[tokio::test]
async fn unavailable_storage_is_retried() {
    let channel = MemoryChannel::default();
    let sink = MemorySink::failing(2);
    publish(&channel, &serde_json::to_vec(&example_payload()).unwrap()).await;

    let shutdown = CancellationToken::new();
    let processor = RecordProcessor::new(sink.clone(), model(), fast_retries(3));
    let handle = tokio::spawn(consumer(&channel, processor).await.run(shutdown.clone()));

    wait_for(|| sink.rows().len() == 1).await;
    shutdown.cancel();
    let stats = handle.await.unwrap().unwrap();

    assert_eq!(stats.persisted, 1);
    assert_eq!(stats.failed, 0);
}

#[tokio::test]
async fn example_record_is_enriched_with_prediction() {
    let channel = MemoryChannel::default();
    let sink = MemorySink::default();
    publish(&channel, &serde_json::to_vec(&example_payload()).unwrap()).await;

    let shutdown = CancellationToken::new();
    let processor = RecordProcessor::new(sink.clone(), model(), RetryPolicy::no_retries());
    let handle = tokio::spawn(consumer(&channel, processor).await.run(shutdown.clone()));

    wait_for(|| sink.rows().len() == 1).await;
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    let row = serde_json::to_value(&sink.rows()[0]).unwrap();
    let fields = row.as_object().unwrap();
    assert_eq!(fields.len(), 9);
    for (name, value) in example_payload().as_object().unwrap() {
        assert_eq!(&fields[name], value, "field {name}");
    }
    let prediction = fields["happiness_prediction"].as_f64().unwrap();
    assert!((prediction - 7.35).abs() < 1e-9);
}

#[tokio::test]
async fn crash_before_commit_redelivers() {
    let channel = MemoryChannel::default();
    let sink = MemorySink::default();
    publish(&channel, &serde_json::to_vec(&example_payload()).unwrap()).await;

    let processor = RecordProcessor::new(sink.clone(), model(), RetryPolicy::no_retries());
    let crashing = tokio::spawn(
        consumer(&channel, processor)
            .await
            .run(CancellationToken::new()),
    );
    wait_for(|| sink.rows().len() == 1).await;
    // Killed without a chance to commit
    crashing.abort();
    assert!(crashing.await.unwrap_err().is_cancelled());
    assert_eq!(channel.committed_offset(DEFAULT_CONSUMER_GROUP, DEFAULT_TOPIC, 0), None);

    let shutdown = CancellationToken::new();
    let processor = RecordProcessor::new(sink.clone(), model(), RetryPolicy::no_retries());
    let restarted = tokio::spawn(consumer(&channel, processor).await.run(shutdown.clone()));
    wait_for(|| sink.rows().len() == 2).await;
    shutdown.cancel();
    restarted.await.unwrap().unwrap();

    let rows = sink.rows();
    assert_eq!(rows[0], rows[1]);
    assert_eq!(
        channel.committed_offset(DEFAULT_CONSUMER_GROUP, DEFAULT_TOPIC, 0),
        Some(1)
    );
}

#[tokio::test]
async fn clean_shutdown_commits_processed_offsets() {
    let channel = MemoryChannel::default();
    let sink = MemorySink::default();
    publish(&channel, b"[]").await;
    publish(&channel, &serde_json::to_vec(&example_payload()).unwrap()).await;

    let shutdown = CancellationToken::new();
    let processor = RecordProcessor::new(sink.clone(), model(), RetryPolicy::no_retries());
    let handle = tokio::spawn(consumer(&channel, processor).await.run(shutdown.clone()));
    wait_for(|| sink.rows().len() == 1).await;
    shutdown.cancel();
    let stats = handle.await.unwrap().unwrap();
    assert_eq!(stats.received, 2);

    // Both messages, failed or not, are committed
    assert_eq!(
        channel.committed_offset(DEFAULT_CONSUMER_GROUP, DEFAULT_TOPIC, 0),
        Some(2)
    );
    let mut restarted = channel.subscribe(DEFAULT_TOPIC, DEFAULT_CONSUMER_GROUP);
    let next = tokio::time::timeout(Duration::from_millis(100), restarted.recv()).await;
    assert!(next.is_err(), "nothing should be delivered again");
}

#[tokio::test]
async fn shutdown_lets_in_flight_record_finish() {
    let channel = MemoryChannel::default();
    let sink = GatedSink::default();
    publish(&channel, &serde_json::to_vec(&example_payload()).unwrap()).await;

    let shutdown = CancellationToken::new();
    let processor = RecordProcessor::new(sink.clone(), model(), RetryPolicy::no_retries());
    let consumer = RecordConsumer::new(
        channel.subscribe(DEFAULT_TOPIC, DEFAULT_CONSUMER_GROUP),
        processor,
        RetryPolicy::no_retries(),
        liveness(),
    );
    let handle = tokio::spawn(consumer.run(shutdown.clone()));

    // Shutdown is requested while the insert is still waiting
    tokio::time::timeout(Duration::from_secs(5), sink.entered.notified())
        .await
        .unwrap();
    shutdown.cancel();
    sink.release.notify_one();
    let stats = handle.await.unwrap().unwrap();

    assert_eq!(stats.persisted, 1);
    assert_eq!(sink.stored.rows().len(), 1);
    assert_eq!(
        channel.committed_offset(DEFAULT_CONSUMER_GROUP, DEFAULT_TOPIC, 0),
        Some(1)
    );
}

#[tokio::test]
async fn failed_records_go_to_dead_letter_topic() {
    let channel = MemoryChannel::default();
    let sink = MemorySink::default();
    publish(&channel, b"").await;
    let mut incomplete = example_payload();
    incomplete.as_object_mut().unwrap().remove("continent_numeric");
    publish(&channel, &serde_json::to_vec(&incomplete).unwrap()).await;

    let dead_letters: Arc<dyn Publisher> = Arc::new(channel.clone());
    let processor = RecordProcessor::new(sink.clone(), model(), RetryPolicy::no_retries())
        .with_dead_letter(DeadLetter {
            publisher: dead_letters,
            topic: DEAD_LETTER_TOPIC.to_owned(),
        });

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(consumer(&channel, processor).await.run(shutdown.clone()));
    wait_for(|| channel.len(DEAD_LETTER_TOPIC) == 2).await;
    shutdown.cancel();
    let stats = handle.await.unwrap().unwrap();

    assert_eq!(stats.dead_lettered, 2);
    assert!(sink.rows().is_empty());

    let letters: Vec<Value> = channel
        .payloads(DEAD_LETTER_TOPIC)
        .iter()
        .map(|payload| serde_json::from_slice(payload).unwrap())
        .collect();
    assert_eq!(letters[0]["stage"], "deserialize");
    assert_eq!(letters[0]["payload"], "");
    assert_eq!(letters[0]["offset"], 0);
    assert_eq!(letters[1]["stage"], "extract");
    assert_eq!(letters[1]["topic"], DEFAULT_TOPIC);
    assert!(letters[1]["error"]
        .as_str()
        .unwrap()
        .contains("continent_numeric"));
    let original: Value = serde_json::from_str(letters[1]["payload"].as_str().unwrap()).unwrap();
    assert_eq!(original, incomplete);
}

#[test]
fn bundled_model_loads() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../demos/happiness_model.json");

    let model = LinearModel::from_path(path).unwrap();

    let prediction = model
        .score(&happiness_common::record::FeatureVector([0.0; 6]))
        .unwrap();
    assert_eq!(prediction, 2.178);
}
