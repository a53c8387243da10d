//! In-process broker with partitioned topics, consumer-group offsets and
//! switchable acknowledgment behaviour.

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use log::debug;
use parking_lot::Mutex;
use std::{
    collections::{HashMap, VecDeque, hash_map::DefaultHasher},
    hash::{Hash, Hasher},
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::{Notify, oneshot},
    time::{Instant, timeout_at},
};

use super::{
    AckHandle, BrokerError, Consumer, Delivery, Message, Position, Producer, Timestamp, TopicSpec,
};

/// What the broker does with the acknowledgment of each sent message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckMode {
    /// Store the message and acknowledge it.
    Deliver,
    /// Reject the message with the given reason.
    Fail(String),
    /// Store the message but never acknowledge it.
    Withhold,
}

type AckSender = oneshot::Sender<Result<Delivery, BrokerError>>;

struct Stored {
    key: Option<Vec<u8>>,
    payload: Option<Vec<u8>>,
    timestamp: Timestamp,
}

struct State {
    topics: HashMap<String, Vec<Vec<Stored>>>,
    committed: HashMap<(String, String, i32), i64>,
    ack_mode: AckMode,
    withheld: Vec<AckSender>,
    injected_errors: VecDeque<BrokerError>,
    topic_creation_error: Option<BrokerError>,
}

struct Inner {
    state: Mutex<State>,
    arrivals: Notify,
}

#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    topics: HashMap::new(),
                    committed: HashMap::new(),
                    ack_mode: AckMode::Deliver,
                    withheld: Vec::new(),
                    injected_errors: VecDeque::new(),
                    topic_creation_error: None,
                }),
                arrivals: Notify::new(),
            }),
        }
    }

    pub fn producer(&self) -> MemoryProducer {
        MemoryProducer {
            broker: self.clone(),
        }
    }

    pub fn consumer(&self, group_id: &str) -> MemoryConsumer {
        MemoryConsumer {
            broker: self.clone(),
            group_id: group_id.to_string(),
            topic: None,
            next_offsets: HashMap::new(),
            closed: false,
        }
    }

    pub fn set_ack_mode(&self, mode: AckMode) {
        self.inner.state.lock().ack_mode = mode;
    }

    /// Makes every following topic creation fail with `err`.
    pub fn fail_topic_creation(&self, err: BrokerError) {
        self.inner.state.lock().topic_creation_error = Some(err);
    }

    /// Queues an error that the next consumer poll returns instead of a message.
    pub fn inject_error(&self, err: BrokerError) {
        self.inner.state.lock().injected_errors.push_back(err);
        self.inner.arrivals.notify_waiters();
    }

    /// Appends a message as-is, bypassing the producer path. The topic is
    /// created with a single partition if it does not exist yet.
    pub fn append(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: Option<&[u8]>,
        timestamp: Timestamp,
    ) {
        let mut state = self.inner.state.lock();
        let partitions = state
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new()]);
        let partition = partition_for(key.unwrap_or_default(), partitions.len());
        partitions[partition].push(Stored {
            key: key.map(|k| k.as_bytes().to_vec()),
            payload: payload.map(<[u8]>::to_vec),
            timestamp,
        });
        drop(state);
        self.inner.arrivals.notify_waiters();
    }

    /// All stored messages of a topic, partition by partition.
    pub fn messages(&self, topic: &str) -> Vec<Message> {
        let state = self.inner.state.lock();
        let Some(partitions) = state.topics.get(topic) else {
            return Vec::new();
        };
        partitions
            .iter()
            .enumerate()
            .flat_map(|(partition, stored)| {
                stored
                    .iter()
                    .enumerate()
                    .map(move |(offset, stored)| to_message(topic, partition, offset, stored))
            })
            .collect()
    }

    pub fn partition_count(&self, topic: &str) -> Option<usize> {
        self.inner.state.lock().topics.get(topic).map(Vec::len)
    }

    /// Offset the group resumes from on `topic`/`partition`, if it committed one.
    pub fn committed_offset(&self, group_id: &str, topic: &str, partition: i32) -> Option<i64> {
        let key = (group_id.to_string(), topic.to_string(), partition);
        self.inner.state.lock().committed.get(&key).copied()
    }
}

pub struct MemoryProducer {
    broker: MemoryBroker,
}

#[async_trait]
impl Producer for MemoryProducer {
    async fn create_topic(&self, topic: &TopicSpec) -> Result<(), BrokerError> {
        let mut state = self.broker.inner.state.lock();
        if let Some(err) = &state.topic_creation_error {
            return Err(err.clone());
        }
        if state.topics.contains_key(&topic.name) {
            return Err(BrokerError::TopicAlreadyExists(topic.name.clone()));
        }
        let partitions = usize::try_from(topic.partitions)
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| {
                BrokerError::Client(format!("invalid partition count {}", topic.partitions))
            })?;
        state
            .topics
            .insert(topic.name.clone(), (0..partitions).map(|_| Vec::new()).collect());
        debug!("Created topic {} with {partitions} partitions", topic.name);
        Ok(())
    }

    fn send(&self, topic: &str, key: &str, value: &str) -> Result<AckHandle, BrokerError> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.broker.inner.state.lock();
        let ack_mode = state.ack_mode.clone();

        if let AckMode::Fail(reason) = ack_mode {
            let _ = tx.send(Err(BrokerError::Delivery(reason)));
        } else {
            let partitions = state
                .topics
                .get_mut(topic)
                .ok_or_else(|| BrokerError::Client(format!("unknown topic {topic}")))?;
            let partition = partition_for(key, partitions.len());
            let offset = partitions[partition].len();
            partitions[partition].push(Stored {
                key: Some(key.as_bytes().to_vec()),
                payload: Some(value.as_bytes().to_vec()),
                timestamp: Timestamp::CreateTime(Utc::now().timestamp_millis()),
            });
            let delivery = Delivery {
                partition: to_i32(partition),
                offset: to_i64(offset),
            };
            if ack_mode == AckMode::Withhold {
                state.withheld.push(tx);
            } else {
                let _ = tx.send(Ok(delivery));
            }
            drop(state);
            self.broker.inner.arrivals.notify_waiters();
        }

        Ok(async move {
            rx.await
                .map_err(|_| BrokerError::Delivery("acknowledgment dropped".to_string()))?
        }
        .boxed())
    }

    async fn flush(&self, _timeout: Duration) -> Result<(), BrokerError> {
        Ok(())
    }
}

pub struct MemoryConsumer {
    broker: MemoryBroker,
    group_id: String,
    topic: Option<String>,
    next_offsets: HashMap<usize, usize>,
    closed: bool,
}

impl MemoryConsumer {
    fn try_next(&mut self) -> Option<Result<Message, BrokerError>> {
        let mut state = self.broker.inner.state.lock();
        if let Some(err) = state.injected_errors.pop_front() {
            return Some(Err(err));
        }
        let topic = self.topic.as_deref()?;
        let partitions = state.topics.get(topic)?;

        for (partition, stored) in partitions.iter().enumerate() {
            let next = *self.next_offsets.entry(partition).or_insert_with(|| {
                let key = (self.group_id.clone(), topic.to_string(), to_i32(partition));
                state
                    .committed
                    .get(&key)
                    .and_then(|offset| usize::try_from(*offset).ok())
                    .unwrap_or(0)
            });
            if let Some(message) = stored.get(next) {
                self.next_offsets.insert(partition, next + 1);
                return Some(Ok(to_message(topic, partition, next, message)));
            }
        }
        None
    }
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        self.topic = Some(topic.to_string());
        self.next_offsets.clear();
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Option<Result<Message, BrokerError>> {
        if self.closed || self.topic.is_none() {
            return Some(Err(BrokerError::Client("consumer is not subscribed".to_string())));
        }
        let deadline = Instant::now() + timeout;
        let broker = self.broker.clone();
        loop {
            let arrival = broker.inner.arrivals.notified();
            tokio::pin!(arrival);
            arrival.as_mut().enable();

            if let Some(polled) = self.try_next() {
                return Some(polled);
            }
            if timeout_at(deadline, arrival).await.is_err() {
                return None;
            }
        }
    }

    async fn commit(&mut self, position: &Position) -> Result<(), BrokerError> {
        let key = (
            self.group_id.clone(),
            position.topic.clone(),
            position.partition,
        );
        self.broker
            .inner
            .state
            .lock()
            .committed
            .insert(key, position.offset + 1);
        Ok(())
    }

    async fn close(&mut self) {
        self.closed = true;
        self.topic = None;
    }
}

fn partition_for(key: &str, partitions: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    usize::try_from(hasher.finish() % partitions as u64).unwrap_or(0)
}

fn to_message(topic: &str, partition: usize, offset: usize, stored: &Stored) -> Message {
    Message {
        position: Position {
            topic: topic.to_string(),
            partition: to_i32(partition),
            offset: to_i64(offset),
        },
        key: stored.key.clone(),
        payload: stored.payload.clone(),
        timestamp: stored.timestamp,
    }
}

fn to_i32(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

fn to_i64(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topic(name: &str) -> TopicSpec {
        TopicSpec {
            name: name.to_string(),
            partitions: 3,
            replication: 1,
        }
    }

    #[tokio::test]
    async fn test_create_topic_twice_reports_existing() {
        let broker = MemoryBroker::new();
        let producer = broker.producer();
        producer.create_topic(&topic("status")).await.unwrap();
        assert_eq!(
            producer.create_topic(&topic("status")).await,
            Err(BrokerError::TopicAlreadyExists("status".to_string()))
        );
        assert_eq!(broker.partition_count("status"), Some(3));
    }

    #[tokio::test]
    async fn test_same_key_lands_in_same_partition() {
        let broker = MemoryBroker::new();
        let producer = broker.producer();
        producer.create_topic(&topic("status")).await.unwrap();

        let first = producer.send("status", "http://a/", "1").unwrap().await.unwrap();
        let second = producer.send("status", "http://a/", "2").unwrap().await.unwrap();
        assert_eq!(first.partition, second.partition);
        assert_eq!(second.offset, first.offset + 1);
    }

    #[tokio::test]
    async fn test_send_to_unknown_topic_fails() {
        let broker = MemoryBroker::new();
        assert!(broker.producer().send("missing", "k", "v").is_err());
    }

    #[tokio::test]
    async fn test_poll_times_out_when_empty() {
        let broker = MemoryBroker::new();
        let mut consumer = broker.consumer("group");
        consumer.subscribe("status").await.unwrap();
        assert!(consumer.poll(Duration::from_millis(20)).await.is_none());
    }

    #[tokio::test]
    async fn test_poll_wakes_on_arrival() {
        let broker = MemoryBroker::new();
        let mut consumer = broker.consumer("group");
        consumer.subscribe("status").await.unwrap();

        let writer = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append("status", Some("k"), Some(b"v".as_slice()), Timestamp::CreateTime(7));
        });

        let message = consumer.poll(Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(message.payload.as_deref(), Some(&b"v"[..]));
        assert_eq!(message.timestamp, Timestamp::CreateTime(7));
    }

    #[tokio::test]
    async fn test_committed_offset_is_resumed() {
        let broker = MemoryBroker::new();
        broker.append("status", Some("k"), Some(b"1".as_slice()), Timestamp::CreateTime(1));
        broker.append("status", Some("k"), Some(b"2".as_slice()), Timestamp::CreateTime(2));

        let mut consumer = broker.consumer("group");
        consumer.subscribe("status").await.unwrap();
        let first = consumer.poll(Duration::from_millis(50)).await.unwrap().unwrap();
        consumer.commit(&first.position).await.unwrap();
        consumer.close().await;
        assert_eq!(broker.committed_offset("group", "status", 0), Some(1));

        let mut resumed = broker.consumer("group");
        resumed.subscribe("status").await.unwrap();
        let next = resumed.poll(Duration::from_millis(50)).await.unwrap().unwrap();
        assert_eq!(next.payload.as_deref(), Some(&b"2"[..]));
    }

    #[tokio::test]
    async fn test_injected_error_is_polled_first() {
        let broker = MemoryBroker::new();
        broker.append("status", Some("k"), Some(b"1".as_slice()), Timestamp::CreateTime(1));
        broker.inject_error(BrokerError::Message("kafka broke".to_string()));

        let mut consumer = broker.consumer("group");
        consumer.subscribe("status").await.unwrap();
        assert_eq!(
            consumer.poll(Duration::from_millis(50)).await,
            Some(Err(BrokerError::Message("kafka broke".to_string())))
        );
    }
}
