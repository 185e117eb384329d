//! An in-process channel with Kafka's consumer group semantics.
//!
//! Topics are split in a fixed number of partitions and keyed messages always
//! land in the same partition. The partitions of a topic are spread over the
//! live members of a group, partition `p` going to member `p % members`, and
//! are rebalanced whenever a member joins or leaves. A member starts reading a
//! newly assigned partition at the group's committed offset, so dropping a
//! subscription without committing replays everything it received since the
//! last commit. A revoked partition has its acknowledged offset committed.
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::watch;

use super::{ChannelError, Delivery, Publisher, Receipt, Subscription};

#[derive(Clone)]
struct StoredMessage {
    key: Option<Vec<u8>>,
    payload: Vec<u8>,
}

#[derive(Default)]
struct State {
    topics: HashMap<String, Vec<Vec<StoredMessage>>>,
    /// Next offset to read, keyed by (group, topic, partition).
    committed: HashMap<(String, String, i32), i64>,
    /// Live members, in joining order, keyed by (group, topic).
    members: HashMap<(String, String), Vec<u64>>,
    next_member: u64,
    round_robin: usize,
    available: bool,
}

struct Inner {
    partitions: usize,
    state: Mutex<State>,
    /// Bumped on every publish and membership change.
    changes: watch::Sender<u64>,
}

#[derive(Clone)]
pub struct MemoryChannel {
    inner: Arc<Inner>,
}

impl MemoryChannel {
    pub fn new(partitions: usize) -> Self {
        let (changes, _) = watch::channel(0);

        Self {
            inner: Arc::new(Inner {
                partitions: partitions.max(1),
                state: Mutex::new(State {
                    available: true,
                    ..State::default()
                }),
                changes,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock leaves plain data behind, keep going.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Simulate a broker outage: publishes fail until availability is restored.
    pub fn set_available(&self, available: bool) {
        self.state().available = available;
    }

    /// Number of messages ever published to a topic, across partitions.
    pub fn len(&self, topic: &str) -> usize {
        self.state()
            .topics
            .get(topic)
            .map(|partitions| partitions.iter().map(Vec::len).sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, topic: &str) -> bool {
        self.len(topic) == 0
    }

    /// Every payload of a topic, partition by partition.
    pub fn payloads(&self, topic: &str) -> Vec<Vec<u8>> {
        self.state()
            .topics
            .get(topic)
            .map(|partitions| {
                partitions
                    .iter()
                    .flatten()
                    .map(|message| message.payload.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Committed offset of a group on one partition, if it ever committed.
    pub fn committed_offset(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.state()
            .committed
            .get(&(group.to_owned(), topic.to_owned(), partition))
            .copied()
    }

    /// Join `group` on `topic`. Partitions are only assigned on the first
    /// receive, like a Kafka consumer joining on its first poll.
    pub fn subscribe(&self, topic: &str, group: &str) -> MemorySubscription {
        let member = {
            let mut state = self.state();
            let member = state.next_member;
            state.next_member += 1;
            state
                .members
                .entry((group.to_owned(), topic.to_owned()))
                .or_default()
                .push(member);
            member
        };
        self.notify();

        MemorySubscription {
            channel: self.clone(),
            topic: topic.to_owned(),
            group: group.to_owned(),
            member,
            positions: HashMap::new(),
            acknowledged: HashMap::new(),
            next_partition: 0,
            changes: self.inner.changes.subscribe(),
        }
    }

    fn notify(&self) {
        self.inner.changes.send_modify(|count| *count += 1);
    }

    fn partition_for(&self, key: Option<&str>, state: &mut State) -> usize {
        match key {
            Some(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % self.inner.partitions as u64) as usize
            }
            None => {
                state.round_robin = state.round_robin.wrapping_add(1);
                state.round_robin % self.inner.partitions
            }
        }
    }
}

impl Default for MemoryChannel {
    fn default() -> Self {
        MemoryChannel::new(1)
    }
}

#[async_trait]
impl Publisher for MemoryChannel {
    async fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &[u8],
    ) -> Result<(), ChannelError> {
        {
            let mut state = self.state();
            if !state.available {
                return Err(ChannelError::Unavailable(
                    "in-memory broker is down".to_owned(),
                ));
            }

            let partition = self.partition_for(key, &mut state);
            let partitions = self.inner.partitions;
            let topic = state
                .topics
                .entry(topic.to_owned())
                .or_insert_with(|| vec![Vec::new(); partitions]);
            topic[partition].push(StoredMessage {
                key: key.map(|key| key.as_bytes().to_vec()),
                payload: payload.to_vec(),
            });
        }

        self.notify();
        Ok(())
    }
}

pub struct MemorySubscription {
    channel: MemoryChannel,
    topic: String,
    group: String,
    member: u64,
    /// Next offset to hand out, per assigned partition.
    positions: HashMap<i32, i64>,
    /// Next offset to commit, per partition.
    acknowledged: HashMap<i32, i64>,
    next_partition: usize,
    changes: watch::Receiver<u64>,
}

impl MemorySubscription {
    fn group_key(&self) -> (String, String) {
        (self.group.clone(), self.topic.clone())
    }

    fn assignment(&self, state: &State) -> Vec<i32> {
        let members = state.members.get(&self.group_key());
        let Some((index, count)) = members.and_then(|members| {
            let index = members.iter().position(|member| *member == self.member)?;
            Some((index, members.len()))
        }) else {
            return Vec::new();
        };

        (0..self.channel.inner.partitions)
            .filter(|partition| partition % count == index)
            .map(|partition| partition as i32)
            .collect()
    }

    /// Commit what was acknowledged on revoked partitions, then start newly
    /// assigned ones at the committed offset.
    fn rebalance(&mut self, state: &mut State, assigned: &[i32]) {
        let assigned: HashSet<i32> = assigned.iter().copied().collect();

        let revoked: Vec<i32> = self
            .positions
            .keys()
            .filter(|partition| !assigned.contains(partition))
            .copied()
            .collect();
        for partition in revoked {
            self.positions.remove(&partition);
            if let Some(offset) = self.acknowledged.remove(&partition) {
                state.committed.insert(
                    (self.group.clone(), self.topic.clone(), partition),
                    offset,
                );
            }
        }

        for partition in assigned {
            if !self.positions.contains_key(&partition) {
                let key = (self.group.clone(), self.topic.clone(), partition);
                let committed = state.committed.get(&key).copied().unwrap_or(0);
                self.positions.insert(partition, committed);
            }
        }
    }

    /// Take the next unread message, visiting the assigned partitions in turn.
    fn poll(&mut self) -> Option<Delivery> {
        let channel = self.channel.clone();
        let mut state = channel.state();
        let assigned = self.assignment(&state);
        self.rebalance(&mut state, &assigned);

        let partitions = state.topics.get(&self.topic)?;
        for step in 0..assigned.len() {
            let slot = (self.next_partition + step) % assigned.len();
            let partition = assigned[slot];
            let position = self.positions.entry(partition).or_insert(0);

            if let Some(message) = partitions[partition as usize].get(*position as usize) {
                let delivery = Delivery {
                    receipt: Receipt {
                        topic: self.topic.clone(),
                        partition,
                        offset: *position,
                    },
                    key: message.key.clone(),
                    payload: Some(message.payload.clone()),
                };
                *position += 1;
                self.next_partition = slot + 1;
                return Some(delivery);
            }
        }

        None
    }
}

impl Drop for MemorySubscription {
    /// Leave the group without committing, like a crashed consumer.
    fn drop(&mut self) {
        {
            let mut state = self.channel.state();
            let key = self.group_key();
            if let Some(members) = state.members.get_mut(&key) {
                members.retain(|member| *member != self.member);
                if members.is_empty() {
                    state.members.remove(&key);
                }
            }
        }
        self.channel.notify();
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn recv(&mut self) -> Result<Delivery, ChannelError> {
        loop {
            // Mark the current change as seen before looking, so a publish
            // racing with the lookup still wakes us up.
            self.changes.borrow_and_update();

            if let Some(delivery) = self.poll() {
                return Ok(delivery);
            }

            self.changes
                .changed()
                .await
                .map_err(|_| ChannelError::Closed)?;
        }
    }

    fn ack(&mut self, receipt: &Receipt) -> Result<(), ChannelError> {
        let next = receipt.offset + 1;
        let acknowledged = self.acknowledged.entry(receipt.partition).or_insert(next);
        *acknowledged = (*acknowledged).max(next);
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), ChannelError> {
        let mut state = self.channel.state();
        for (partition, offset) in self.acknowledged.drain() {
            state
                .committed
                .insert((self.group.clone(), self.topic.clone(), partition), offset);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPIC: &str = "kafka-happiness";
    const GROUP: &str = "happiness-scoring";

    async fn drain(subscription: &mut MemorySubscription) -> Vec<Delivery> {
        let mut deliveries = Vec::new();
        while let Ok(Ok(delivery)) = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            subscription.recv(),
        )
        .await
        {
            deliveries.push(delivery);
        }
        deliveries
    }

    #[tokio::test]
    async fn test_partition_order_is_preserved() {
        let channel = MemoryChannel::new(4);
        for i in 0..10 {
            let key = if i % 2 == 0 { "even" } else { "odd" };
            channel
                .publish(TOPIC, Some(key), i.to_string().as_bytes())
                .await
                .unwrap();
        }

        let mut subscription = channel.subscribe(TOPIC, GROUP);
        let deliveries = drain(&mut subscription).await;
        assert_eq!(deliveries.len(), 10);

        for key in ["even", "odd"] {
            let values: Vec<i32> = deliveries
                .iter()
                .filter(|delivery| delivery.key.as_deref() == Some(key.as_bytes()))
                .map(|delivery| delivery.payload_lossy().parse().unwrap())
                .collect();
            let mut sorted = values.clone();
            sorted.sort();
            assert_eq!(values, sorted);
            assert_eq!(values.len(), 5);
        }
    }

    #[tokio::test]
    async fn test_uncommitted_messages_are_redelivered() {
        let channel = MemoryChannel::default();
        for i in 0..3 {
            channel
                .publish(TOPIC, None, i.to_string().as_bytes())
                .await
                .unwrap();
        }

        let mut subscription = channel.subscribe(TOPIC, GROUP);
        let first = subscription.recv().await.unwrap();
        let second = subscription.recv().await.unwrap();
        subscription.ack(&first.receipt).unwrap();
        subscription.commit().await.unwrap();
        // The second message is received and acknowledged, but never committed
        subscription.ack(&second.receipt).unwrap();
        drop(subscription);

        let mut restarted = channel.subscribe(TOPIC, GROUP);
        let redelivered = restarted.recv().await.unwrap();
        assert_eq!(redelivered.payload(), b"1");
        assert_eq!(redelivered.receipt, second.receipt);
        assert_eq!(channel.committed_offset(GROUP, TOPIC, 0), Some(1));
    }

    #[tokio::test]
    async fn test_groups_track_offsets_independently() {
        let channel = MemoryChannel::default();
        channel.publish(TOPIC, None, b"a").await.unwrap();

        let mut scoring = channel.subscribe(TOPIC, GROUP);
        let delivery = scoring.recv().await.unwrap();
        scoring.ack(&delivery.receipt).unwrap();
        scoring.commit().await.unwrap();

        drop(scoring);

        let mut audit = channel.subscribe(TOPIC, "audit");
        assert_eq!(audit.recv().await.unwrap().payload(), b"a");
        assert!(drain(&mut channel.subscribe(TOPIC, GROUP)).await.is_empty());
    }

    #[tokio::test]
    async fn test_group_members_split_partitions() {
        let channel = MemoryChannel::new(2);
        for i in 0..4 {
            channel
                .publish(TOPIC, None, i.to_string().as_bytes())
                .await
                .unwrap();
        }

        let mut first = channel.subscribe(TOPIC, GROUP);
        let mut second = channel.subscribe(TOPIC, GROUP);
        let first_deliveries = drain(&mut first).await;
        let second_deliveries = drain(&mut second).await;

        assert_eq!(first_deliveries.len(), 2);
        assert_eq!(second_deliveries.len(), 2);
        assert!(first_deliveries
            .iter()
            .all(|delivery| delivery.receipt.partition == 0));
        assert!(second_deliveries
            .iter()
            .all(|delivery| delivery.receipt.partition == 1));
    }

    #[tokio::test]
    async fn test_leaving_member_hands_partitions_over() {
        let channel = MemoryChannel::new(2);
        let mut first = channel.subscribe(TOPIC, GROUP);
        for i in 0..2 {
            channel
                .publish(TOPIC, None, i.to_string().as_bytes())
                .await
                .unwrap();
        }

        // Alone in the group, the first member reads both partitions
        let received = drain(&mut first).await;
        assert_eq!(received.len(), 2);
        for delivery in &received {
            first.ack(&delivery.receipt).unwrap();
        }

        // Partition 1 moves to the new member, its acknowledged offset is committed
        let mut second = channel.subscribe(TOPIC, GROUP);
        assert!(drain(&mut first).await.is_empty());
        assert_eq!(channel.committed_offset(GROUP, TOPIC, 1), Some(1));
        assert!(drain(&mut second).await.is_empty());

        // Partition 0 was never committed, its message is delivered again
        drop(first);
        let redelivered = drain(&mut second).await;
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].receipt.partition, 0);
        assert_eq!(channel.committed_offset(GROUP, TOPIC, 0), None);
    }

    #[tokio::test]
    async fn test_recv_waits_for_publish() {
        let channel = MemoryChannel::default();
        let mut subscription = channel.subscribe(TOPIC, GROUP);

        let publisher = channel.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            publisher.publish(TOPIC, None, b"late").await.unwrap();
        });

        let delivery = tokio::time::timeout(std::time::Duration::from_secs(5), subscription.recv())
            .await
            .expect("recv never woke up")
            .unwrap();
        assert_eq!(delivery.payload(), b"late");
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_unavailable_channel_rejects_publishes() {
        let channel = MemoryChannel::default();
        channel.set_available(false);
        assert!(matches!(
            channel.publish(TOPIC, None, b"a").await.unwrap_err(),
            ChannelError::Unavailable(_)
        ));

        channel.set_available(true);
        channel.publish(TOPIC, None, b"a").await.unwrap();
        assert_eq!(channel.len(TOPIC), 1);
        assert_eq!(channel.payloads(TOPIC), vec![b"a".to_vec()]);
    }
}
