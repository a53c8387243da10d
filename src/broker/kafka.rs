//! Kafka implementation of the broker capabilities, on top of `rdkafka`.

use async_trait::async_trait;
use futures::FutureExt;
use log::{debug, info};
use rdkafka::{
    ClientConfig, Offset, TopicPartitionList,
    admin::{AdminClient, AdminOptions, NewTopic, TopicReplication},
    client::DefaultClientContext,
    consumer::{CommitMode, Consumer as _, StreamConsumer},
    error::{KafkaError, RDKafkaErrorCode},
    message::{BorrowedMessage, Message as _},
    producer::{FutureProducer, FutureRecord, Producer as _},
    util::Timeout,
};
use std::time::Duration;

use super::{
    AckHandle, BrokerError, Consumer, Delivery, Message, Position, Producer, Timestamp, TopicSpec,
};
use crate::config::Config;

impl From<KafkaError> for BrokerError {
    fn from(err: KafkaError) -> Self {
        BrokerError::Client(err.to_string())
    }
}

fn client_config(config: &Config) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    for (key, value) in config.kafka_settings() {
        client_config.set(key, value);
    }
    client_config
}

pub struct KafkaProducer {
    producer: FutureProducer,
    admin: AdminClient<DefaultClientContext>,
}

impl KafkaProducer {
    pub fn new(config: &Config) -> Result<Self, BrokerError> {
        let mut client_config = client_config(config);
        client_config.set("client.id", "checksite-producer");

        let producer: FutureProducer = client_config.create()?;
        let admin: AdminClient<DefaultClientContext> = client_config.create()?;
        info!("Connected producer to {}", config.kafka_servers);

        Ok(Self { producer, admin })
    }
}

#[async_trait]
impl Producer for KafkaProducer {
    async fn create_topic(&self, topic: &TopicSpec) -> Result<(), BrokerError> {
        let new_topic = NewTopic::new(
            &topic.name,
            topic.partitions,
            TopicReplication::Fixed(topic.replication),
        );
        let results = self
            .admin
            .create_topics([&new_topic], &AdminOptions::new())
            .await?;

        for result in results {
            match result {
                Ok(name) => debug!("Created topic {name}"),
                Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    return Err(BrokerError::TopicAlreadyExists(name));
                }
                Err((name, code)) => {
                    return Err(BrokerError::Client(format!(
                        "failed to create topic {name}: {code}"
                    )));
                }
            }
        }
        Ok(())
    }

    fn send(&self, topic: &str, key: &str, value: &str) -> Result<AckHandle, BrokerError> {
        let record = FutureRecord::to(topic).key(key).payload(value);
        let delivery = self
            .producer
            .send_result(record)
            .map_err(|(err, _)| BrokerError::from(err))?;

        Ok(async move {
            match delivery.await {
                Ok(Ok((partition, offset))) => Ok(Delivery { partition, offset }),
                Ok(Err((err, _))) => Err(BrokerError::Delivery(err.to_string())),
                Err(_) => Err(BrokerError::Delivery(
                    "producer dropped before delivery".to_string(),
                )),
            }
        }
        .boxed())
    }

    async fn flush(&self, timeout: Duration) -> Result<(), BrokerError> {
        self.producer.flush(Timeout::After(timeout))?;
        Ok(())
    }
}

pub struct KafkaConsumer {
    consumer: StreamConsumer,
}

impl KafkaConsumer {
    /// Offsets are committed explicitly, after each stored event.
    pub fn new(config: &Config, group_id: &str) -> Result<Self, BrokerError> {
        let mut client_config = client_config(config);
        client_config
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest");

        let consumer: StreamConsumer = client_config.create()?;
        info!("Connected consumer group {group_id} to {}", config.kafka_servers);

        Ok(Self { consumer })
    }
}

fn to_message(message: &BorrowedMessage<'_>) -> Message {
    Message {
        position: Position {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
        },
        key: message.key().map(<[u8]>::to_vec),
        payload: message.payload().map(<[u8]>::to_vec),
        timestamp: match message.timestamp() {
            rdkafka::message::Timestamp::NotAvailable => Timestamp::NotAvailable,
            rdkafka::message::Timestamp::CreateTime(ms) => Timestamp::CreateTime(ms),
            rdkafka::message::Timestamp::LogAppendTime(ms) => Timestamp::LogAppendTime(ms),
        },
    }
}

#[async_trait]
impl Consumer for KafkaConsumer {
    async fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        self.consumer.subscribe(&[topic])?;
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Option<Result<Message, BrokerError>> {
        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => None,
            Ok(Err(err)) => Some(Err(BrokerError::Message(err.to_string()))),
            Ok(Ok(message)) => Some(Ok(to_message(&message))),
        }
    }

    async fn commit(&mut self, position: &Position) -> Result<(), BrokerError> {
        let mut offsets = TopicPartitionList::new();
        offsets.add_partition_offset(
            &position.topic,
            position.partition,
            Offset::Offset(position.offset + 1),
        )?;
        self.consumer.commit(&offsets, CommitMode::Sync)?;
        Ok(())
    }

    async fn close(&mut self) {
        self.consumer.unsubscribe();
        debug!("Consumer unsubscribed");
    }
}
