use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::task::{Context, Poll};
use std::time::Instant;

use futures::Stream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::client::Client;
use crate::config::Config;
use crate::consumer::decode::decode_fetched;
use crate::consumer::{ConsumerError, ConsumerErrors, ConsumerMessage, Registry};
use crate::error::{Error, KafkaCode};
use crate::protocol::fetch::{FetchPartition, FetchRequest};
use crate::types::TopicPartition;

// ============================================================================
// Shared state
// ============================================================================

/// State a partition consumer shares with its owning [`Consumer`](super::Consumer).
#[derive(Debug)]
pub(crate) struct PartitionState {
    high_water_mark: AtomicI64,
    paused: watch::Sender<bool>,
}

impl PartitionState {
    pub(crate) fn new() -> Self {
        Self {
            high_water_mark: AtomicI64::new(-1),
            paused: watch::Sender::new(false),
        }
    }

    pub(crate) fn high_water_mark(&self) -> i64 {
        self.high_water_mark.load(Ordering::Acquire)
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        self.paused.send_replace(paused);
    }

    pub(crate) fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }
}

// ============================================================================
// PartitionConsumer
// ============================================================================

/// Messages of one partition in offset order.
///
/// Created by [`Consumer::consume_partition`](super::Consumer::consume_partition).
/// Also usable as a [`Stream`] of messages.
pub struct PartitionConsumer {
    tp: TopicPartition,
    messages: mpsc::Receiver<ConsumerMessage>,
    errors: Option<mpsc::Receiver<ConsumerError>>,
    state: Arc<PartitionState>,
    registry: Arc<Registry>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for PartitionConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionConsumer")
            .field("topic", &self.tp.topic)
            .field("partition", &self.tp.partition)
            .field("high_water_mark", &self.state.high_water_mark())
            .finish_non_exhaustive()
    }
}

impl PartitionConsumer {
    pub(crate) fn start(
        client: Client,
        tp: TopicPartition,
        offset: i64,
        state: Arc<PartitionState>,
        registry: Arc<Registry>,
    ) -> Self {
        let config = client.config().clone();
        let (messages_tx, messages) = mpsc::channel(config.channel_buffer_size.max(1));
        let (errors_tx, errors) = if config.consumer.return_errors {
            let (tx, rx) = mpsc::channel(config.channel_buffer_size.max(1));
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let cancel = CancellationToken::new();
        let fetcher = Fetcher {
            fetch_size: config.consumer.fetch.default,
            client,
            config,
            tp: tp.clone(),
            offset,
            state: state.clone(),
            messages: messages_tx,
            errors: errors_tx,
            cancel: cancel.clone(),
            retries: 0,
        };
        let task = tokio::spawn(fetcher.run());

        Self {
            tp,
            messages,
            errors,
            state,
            registry,
            cancel,
            task: Some(task),
        }
    }

    pub fn topic(&self) -> &str {
        &self.tp.topic
    }

    pub fn partition(&self) -> i32 {
        self.tp.partition
    }

    /// Next message. `None` once the consumer has stopped.
    pub async fn recv(&mut self) -> Option<ConsumerMessage> {
        self.messages.recv().await
    }

    /// The errors channel. Available once, and only with
    /// `consumer.return_errors`.
    pub fn take_errors(&mut self) -> Option<mpsc::Receiver<ConsumerError>> {
        self.errors.take()
    }

    /// Last high-water mark reported by the leader, or -1 before the first
    /// fetch completes.
    pub fn high_water_mark(&self) -> i64 {
        self.state.high_water_mark()
    }

    /// Stop fetching until [`resume`](Self::resume). Buffered messages stay
    /// readable.
    pub fn pause(&self) {
        self.state.set_paused(true);
    }

    pub fn resume(&self) {
        self.state.set_paused(false);
    }

    pub fn is_paused(&self) -> bool {
        self.state.is_paused()
    }

    /// Stop the fetch loop and release the partition. Errors not taken off
    /// the errors channel are returned.
    pub async fn close(mut self) -> std::result::Result<(), ConsumerErrors> {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.registry.release(&self.tp);

        let mut collected = Vec::new();
        if let Some(errors) = self.errors.as_mut() {
            while let Ok(error) = errors.try_recv() {
                collected.push(error);
            }
        }
        if collected.is_empty() {
            Ok(())
        } else {
            Err(ConsumerErrors(collected))
        }
    }
}

impl Stream for PartitionConsumer {
    type Item = ConsumerMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.messages.poll_recv(cx)
    }
}

impl Drop for PartitionConsumer {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.cancel.cancel();
            self.registry.release(&self.tp);
        }
    }
}

// ============================================================================
// Fetch loop
// ============================================================================

struct Fetcher {
    client: Client,
    config: Arc<Config>,
    tp: TopicPartition,
    offset: i64,
    fetch_size: i32,
    state: Arc<PartitionState>,
    messages: mpsc::Sender<ConsumerMessage>,
    errors: Option<mpsc::Sender<ConsumerError>>,
    cancel: CancellationToken,
    retries: u32,
}

/// What the loop does after one fetch.
enum Step {
    Continue,
    Backoff,
    Stop,
}

impl Fetcher {
    async fn run(mut self) {
        tracing::debug!(topic = %self.tp.topic, partition = self.tp.partition, offset = self.offset, "Partition consumer started");
        loop {
            if !self.wait_unpaused().await {
                break;
            }
            let cancel = self.cancel.clone();
            let step = tokio::select! {
                _ = cancel.cancelled() => Step::Stop,
                step = self.fetch_once() => step,
            };
            match step {
                Step::Continue => self.retries = 0,
                Step::Backoff => {
                    let delay = self.config.consumer.retry_backoff.delay(self.retries, u32::MAX);
                    self.retries = self.retries.saturating_add(1);
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Step::Stop => break,
            }
        }
        tracing::debug!(topic = %self.tp.topic, partition = self.tp.partition, offset = self.offset, "Partition consumer stopped");
    }

    /// Returns false once cancelled.
    async fn wait_unpaused(&self) -> bool {
        let mut paused = self.state.paused.subscribe();
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            result = paused.wait_for(|paused| !paused) => result.is_ok(),
        }
    }

    async fn fetch_once(&mut self) -> Step {
        let topic = self.tp.topic.clone();
        let partition = self.tp.partition;

        let broker = match self.client.leader(&topic, partition).await {
            Ok(broker) => broker,
            Err(e) => {
                self.report(e).await;
                return Step::Backoff;
            }
        };

        let consumer = &self.config.consumer;
        let mut request = FetchRequest {
            max_wait_ms: consumer.max_wait_time.as_millis() as i32,
            min_bytes: consumer.fetch.min,
            max_bytes: consumer.fetch.ceiling(),
            isolation_level: consumer.isolation_level.as_i8(),
            ..Default::default()
        };
        request.add_partition(&topic, FetchPartition::new(partition, self.offset, self.fetch_size));

        let response = match broker.send_with_wait(&request, consumer.max_wait_time).await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(topic = %topic, partition, broker = broker.id(), error = %e, "Fetch failed");
                if e.is_connection_error() {
                    let _ = broker.close().await;
                }
                self.refresh().await;
                return Step::Backoff;
            }
        };

        let Some(block) = response.partition(&topic, partition) else {
            self.report(Error::Decoding(format!(
                "fetch response is missing {topic}/{partition}"
            )))
            .await;
            return Step::Backoff;
        };

        match block.error_code {
            KafkaCode::None => {}
            KafkaCode::OffsetOutOfRange => {
                tracing::warn!(topic = %topic, partition, offset = self.offset, "Fetch offset out of range");
                self.report(Error::Kafka(KafkaCode::OffsetOutOfRange)).await;
                return Step::Stop;
            }
            code if code.invalidates_metadata() || code.is_retriable() => {
                tracing::debug!(topic = %topic, partition, error = ?code, "Retriable fetch error");
                self.refresh().await;
                return Step::Backoff;
            }
            code => {
                self.report(Error::Kafka(code)).await;
                return Step::Backoff;
            }
        }

        self.state
            .high_water_mark
            .store(block.high_watermark, Ordering::Release);

        let Some(records) = block.records.as_ref().filter(|r| !r.is_empty()) else {
            return Step::Continue;
        };
        let aborted = block.aborted_transactions.as_deref().unwrap_or(&[]);
        let fetched = match decode_fetched(
            &topic,
            partition,
            records,
            self.offset,
            consumer.isolation_level,
            aborted,
        ) {
            Ok(fetched) => fetched,
            Err(e) => {
                self.report(e).await;
                return Step::Backoff;
            }
        };

        if fetched.messages.is_empty() {
            if let Some(needed) = fetched.overflow {
                self.grow_fetch_size(needed).await;
            } else if let Some(next) = fetched.next_offset {
                self.offset = self.offset.max(next);
            }
            return Step::Continue;
        }

        self.fetch_size = consumer.fetch.default;
        let next = fetched.next_offset;
        for message in fetched.messages {
            let offset = message.offset;
            if !self.deliver(message).await {
                return Step::Stop;
            }
            self.offset = offset + 1;
        }
        if let Some(next) = next {
            self.offset = self.offset.max(next);
        }
        Step::Continue
    }

    /// Double the fetch size toward the ceiling. At the ceiling the oversized
    /// message is reported and skipped.
    async fn grow_fetch_size(&mut self, needed: usize) {
        let ceiling = self.config.consumer.fetch.ceiling();
        if self.fetch_size >= ceiling {
            tracing::warn!(topic = %self.tp.topic, partition = self.tp.partition, offset = self.offset, needed, "Message larger than the fetch ceiling, skipping");
            self.report(Error::MessageTooLarge(needed.min(i32::MAX as usize) as i32))
                .await;
            self.offset += 1;
            self.fetch_size = self.config.consumer.fetch.default;
        } else {
            self.fetch_size = self.fetch_size.saturating_mul(2).min(ceiling);
            tracing::debug!(topic = %self.tp.topic, partition = self.tp.partition, fetch_size = self.fetch_size, "Growing fetch size");
        }
    }

    /// Returns false when the consumer was closed or dropped.
    async fn deliver(&self, message: ConsumerMessage) -> bool {
        let started = Instant::now();
        let permit = tokio::select! {
            _ = self.cancel.cancelled() => return false,
            permit = self.messages.reserve() => permit,
        };
        match permit {
            Ok(permit) => {
                let waited = started.elapsed();
                if waited > self.config.consumer.max_processing_time {
                    tracing::debug!(topic = %self.tp.topic, partition = self.tp.partition, waited_ms = waited.as_millis() as u64, "Slow consumer");
                }
                permit.send(message);
                true
            }
            Err(_) => false,
        }
    }

    async fn refresh(&self) {
        if let Err(e) = self.client.refresh_metadata(&[&self.tp.topic]).await {
            tracing::debug!(topic = %self.tp.topic, error = %e, "Metadata refresh failed");
        }
    }

    async fn report(&self, error: Error) {
        match &self.errors {
            Some(errors) => {
                let error = ConsumerError {
                    topic: self.tp.topic.clone(),
                    partition: self.tp.partition,
                    error,
                };
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = errors.send(error) => {}
                }
            }
            None => {
                tracing::warn!(topic = %self.tp.topic, partition = self.tp.partition, error = %error, "Partition consumer error");
            }
        }
    }
}
