//! Kafka publishing and the consumer loop every service runs its handlers in.

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Message as _, Offset, TopicPartitionList};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::retry::{Message, MessageHandler};

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<()>;
}

pub async fn publish_json<T>(publisher: &dyn EventPublisher, topic: &str, key: &str, event: &T) -> Result<()>
where
    T: Serialize + ?Sized,
{
    let json = serde_json::to_vec(event)?;
    publisher.publish(topic, key, &json).await
}

#[derive(Clone)]
pub struct KafkaPublisher {
    producer: FutureProducer,
    queue_timeout: Duration,
}

impl KafkaPublisher {
    pub fn new(brokers: &str) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .create()?;

        Ok(Self {
            producer,
            queue_timeout: Duration::from_secs(5),
        })
    }
}

#[async_trait]
impl EventPublisher for KafkaPublisher {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<()> {
        let record = FutureRecord::to(topic)
            .payload(payload)
            .key(key);

        self.producer.send(record, self.queue_timeout).await
            .map_err(|(e, _)| anyhow::anyhow!("Failed to publish to {}: {}", topic, e))?;

        Ok(())
    }
}

/// Builds a consumer in `group_id` subscribed to `topics`. Offsets are only
/// committed by [`consume`], never by librdkafka on a timer.
pub fn stream_consumer(brokers: &str, group_id: &str, topics: &[&str]) -> Result<StreamConsumer> {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("group.id", group_id)
        .set("bootstrap.servers", brokers)
        .set("enable.partition.eof", "false")
        .set("session.timeout.ms", "6000")
        .set("enable.auto.commit", "false")
        .set("enable.auto.offset.store", "false")
        .create()?;

    consumer.subscribe(topics)?;
    Ok(consumer)
}

/// Where finished offsets go. `next_offset` is the position to resume from.
pub trait OffsetCommitter: Send + Sync {
    fn commit(&self, topic: &str, partition: i32, next_offset: i64) -> Result<()>;
}

impl OffsetCommitter for StreamConsumer {
    fn commit(&self, topic: &str, partition: i32, next_offset: i64) -> Result<()> {
        let mut offsets = TopicPartitionList::new();
        offsets.add_partition_offset(topic, partition, Offset::Offset(next_offset))?;
        Consumer::commit(self, &offsets, CommitMode::Async)?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct PartitionOffsets {
    in_flight: BTreeSet<i64>,
    highest_done: Option<i64>,
    committed: Option<i64>,
}

/// Low-water mark per partition: a position is only handed out once every
/// earlier offset seen on that partition has finished.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: Mutex<HashMap<(String, i32), PartitionOffsets>>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Must be called in receive order, before the message is handled.
    pub fn begin(&self, topic: &str, partition: i32, offset: i64) {
        let mut partitions = self.partitions.lock().unwrap_or_else(|e| e.into_inner());
        let state = partitions.entry((topic.to_string(), partition)).or_default();
        // Redelivery after a rebalance rewinds the partition.
        if state.committed.map_or(true, |c| offset < c) {
            state.committed = Some(offset);
            state.highest_done = None;
        }
        state.in_flight.insert(offset);
    }

    /// Marks `offset` finished and returns the new commit position, if it moved.
    pub fn complete(&self, topic: &str, partition: i32, offset: i64) -> Option<i64> {
        let mut partitions = self.partitions.lock().unwrap_or_else(|e| e.into_inner());
        let state = partitions.get_mut(&(topic.to_string(), partition))?;
        if !state.in_flight.remove(&offset) {
            return None;
        }
        state.highest_done = Some(state.highest_done.map_or(offset, |h| h.max(offset)));

        let position = match state.in_flight.first() {
            Some(&pending) => pending,
            None => state.highest_done? + 1,
        };
        if state.committed.map_or(true, |c| position > c) {
            state.committed = Some(position);
            Some(position)
        } else {
            None
        }
    }
}

/// Runs one received message through `handler` and commits whatever the
/// partition's low-water mark now allows. Handler failures still count as done.
pub async fn handle_tracked<H, C>(
    handler: &H,
    tracker: &OffsetTracker,
    committer: &C,
    message: &Message,
    partition: i32,
    offset: i64,
) where
    H: MessageHandler + ?Sized,
    C: OffsetCommitter + ?Sized,
{
    if let Err(e) = handler.process(message).await {
        error!(
            topic = %message.topic,
            partition,
            offset,
            key = ?message.key,
            "Processing failure: {:#}",
            e
        );
    }

    if let Some(next) = tracker.complete(&message.topic, partition, offset) {
        if let Err(e) = committer.commit(&message.topic, partition, next) {
            error!("Error committing offset {} on {}/{}: {}", next, message.topic, partition, e);
        }
    }
}

/// Feeds every message from `consumer` through `handler`, at most `concurrency`
/// at a time, until `shutdown` fires.
///
/// A handler error is logged as a processing failure and the offset is still
/// committed. Offsets are committed only after the handler returns, and never
/// past a message on the same partition that is still running, so a crash
/// mid-message means redelivery.
pub async fn consume<H>(
    consumer: StreamConsumer,
    handler: H,
    concurrency: usize,
    shutdown: CancellationToken,
) where
    H: MessageHandler,
{
    let handler = &handler;
    let committer = &consumer;
    let tracker = &OffsetTracker::new();

    consumer
        .stream()
        .take_until(shutdown.cancelled())
        .for_each_concurrent(concurrency.max(1), |delivery| {
            let received = delivery.map(|m| {
                tracker.begin(m.topic(), m.partition(), m.offset());
                let message = Message {
                    topic: m.topic().to_string(),
                    key: m.key_view::<str>().and_then(|k| k.ok()).map(str::to_string),
                    payload: m.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                };
                (message, m.partition(), m.offset())
            });
            async move {
                match received {
                    Ok((message, partition, offset)) => {
                        handle_tracked(handler, tracker, committer, &message, partition, offset).await
                    }
                    Err(e) => error!("Error receiving message: {}", e),
                }
            }
        })
        .await;

    info!("Consumer stopped");
}
