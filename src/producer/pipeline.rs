//! The producer's internal stages.
//!
//! ```text
//! send() ─▶ dispatcher ─▶ partition producer (one per topic/partition)
//!                              │  pending batch, sequence numbers, retries
//!                              ▼
//!                         broker aggregator (one per leader)
//!                              │  one ProduceRequest per drain
//!                              ▼
//!                           Broker::send
//! ```
//!
//! A partition producer keeps at most one batch outstanding, so batches for a
//! partition are acknowledged in the order they were built. Every message
//! leaves the pipeline exactly once, through [`Results`].

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, sleep, sleep_until};

use crate::broker::Broker;
use crate::client::Client;
use crate::config::Config;
use crate::error::{Error, KafkaCode, Result};
use crate::metrics;
use crate::producer::batch::{BatchEncoder, EncodedBatch, PendingBatch, advance_sequence, magic_for};
use crate::producer::partitioner::Partitioner;
use crate::producer::txn::TxnManager;
use crate::producer::{ProducerError, ProducerMessage};
use crate::protocol::produce::ProduceRequest;
use crate::protocol::records::parse_producer_info;
use crate::types::{RequiredAcks, TopicPartition};

// ============================================================================
// Results
// ============================================================================

/// Where finished messages go, plus the count of messages still inside.
pub(crate) struct Results {
    successes: Option<mpsc::Sender<ProducerMessage>>,
    errors: Option<mpsc::Sender<ProducerError>>,
    in_flight: AtomicUsize,
    failed: AtomicUsize,
    idle: Notify,
}

impl Results {
    pub fn new(
        successes: Option<mpsc::Sender<ProducerMessage>>,
        errors: Option<mpsc::Sender<ProducerError>>,
    ) -> Self {
        Self {
            successes,
            errors,
            in_flight: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    pub fn enter(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Messages that have failed since the producer started.
    pub fn failed(&self) -> usize {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn leave(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Wait until every accepted message has left the pipeline.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    pub async fn succeed(&self, mut message: ProducerMessage, partition: i32, offset: Option<i64>) {
        message.partition = Some(partition);
        message.offset = offset;
        if let Some(completion) = message.completion.take() {
            let _ = completion.send(Ok(message));
        } else if let Some(successes) = &self.successes {
            let _ = successes.send(message).await;
        }
        self.leave();
    }

    pub async fn fail(&self, mut message: ProducerMessage, error: Error) {
        self.failed.fetch_add(1, Ordering::SeqCst);
        if let Some(completion) = message.completion.take() {
            let _ = completion.send(Err(ProducerError { message, error }));
        } else if let Some(errors) = &self.errors {
            let _ = errors.send(ProducerError { message, error }).await;
        } else {
            tracing::warn!(topic = %message.topic, error = %error, "Dropping failed message");
        }
        self.leave();
    }
}

// ============================================================================
// Shared state
// ============================================================================

pub(crate) struct Shared {
    pub client: Client,
    pub config: Arc<Config>,
    pub txn: Arc<TxnManager>,
    pub results: Results,
    pub flush_signal: watch::Sender<u64>,
    pub flushing: AtomicUsize,
    fatal: StdMutex<Option<Error>>,
    magic: i8,
    aggregators: StdMutex<HashMap<i32, Aggregator>>,
}

struct Aggregator {
    broker: Arc<Broker>,
    input: mpsc::Sender<BatchRequest>,
    task: JoinHandle<()>,
}

impl Shared {
    pub fn new(client: Client, txn: Arc<TxnManager>, results: Results) -> Self {
        let config = client.config().clone();
        Self {
            magic: magic_for(config.version),
            client,
            config,
            txn,
            results,
            flush_signal: watch::channel(0).0,
            flushing: AtomicUsize::new(0),
            fatal: StdMutex::new(None),
            aggregators: StdMutex::new(HashMap::new()),
        }
    }

    pub fn fatal_error(&self) -> Option<Error> {
        self.fatal.lock().ok().and_then(|f| f.clone())
    }

    async fn set_fatal(&self, error: &Error) {
        if let Ok(mut fatal) = self.fatal.lock() {
            fatal.get_or_insert_with(|| Error::ProducerFatal(error.to_string()));
        }
        self.txn.fail(error.clone()).await;
    }

    /// The aggregator for `broker`, started on first use.
    fn aggregator(self: &Arc<Self>, broker: Arc<Broker>) -> mpsc::Sender<BatchRequest> {
        let Ok(mut aggregators) = self.aggregators.lock() else {
            let (input, _) = mpsc::channel(1);
            return input;
        };
        if let Some(existing) = aggregators.get(&broker.id())
            && Arc::ptr_eq(&existing.broker, &broker)
            && !existing.input.is_closed()
        {
            return existing.input.clone();
        }
        let (input, rx) = mpsc::channel(self.config.channel_buffer_size);
        let task = tokio::spawn(run_aggregator(self.clone(), broker.clone(), rx));
        if let Some(replaced) = aggregators.insert(
            broker.id(),
            Aggregator {
                broker,
                input: input.clone(),
                task,
            },
        ) {
            tracing::debug!(broker = replaced.broker.id(), "Replacing producer aggregator");
        }
        input
    }

    /// Close every aggregator and wait for its outstanding requests.
    pub async fn shutdown_aggregators(&self) {
        let drained: Vec<Aggregator> = match self.aggregators.lock() {
            Ok(mut aggregators) => aggregators.drain().map(|(_, a)| a).collect(),
            Err(_) => Vec::new(),
        };
        for aggregator in drained {
            drop(aggregator.input);
            let _ = aggregator.task.await;
        }
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

pub(crate) async fn run_dispatcher(shared: Arc<Shared>, mut input: mpsc::Receiver<ProducerMessage>) {
    let mut partitioners: HashMap<String, Box<dyn Partitioner>> = HashMap::new();
    let mut partitions: HashMap<TopicPartition, mpsc::Sender<ProducerMessage>> = HashMap::new();
    let mut tasks = JoinSet::new();
    let max_bytes = shared.config.producer.max_message_bytes;

    while let Some(mut message) = input.recv().await {
        if let Some(error) = shared.fatal_error() {
            shared.results.fail(message, error).await;
            continue;
        }
        if message.byte_size() > max_bytes {
            shared
                .results
                .fail(message, Error::Kafka(KafkaCode::MessageSizeTooLarge))
                .await;
            continue;
        }
        if let Err(e) = shared.txn.check_produce().await {
            shared.results.fail(message, e).await;
            continue;
        }

        let partitioner = partitioners
            .entry(message.topic.clone())
            .or_insert_with(|| shared.config.producer.partitioner.build(&message.topic));
        let partition = match assign_partition(&shared.client, partitioner.as_mut(), &message).await {
            Ok(partition) => partition,
            Err(e) => {
                shared.results.fail(message, e).await;
                continue;
            }
        };
        message.partition = Some(partition);

        let tp = TopicPartition::new(message.topic.clone(), partition);
        let sender = partitions.entry(tp.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(shared.config.channel_buffer_size);
            let producer = PartitionProducer::new(shared.clone(), tp, rx);
            tasks.spawn(producer.run());
            tx
        });
        if let Err(mpsc::error::SendError(message)) = sender.send(message).await {
            shared.results.fail(message, Error::ShuttingDown).await;
        }
    }

    drop(partitions);
    while tasks.join_next().await.is_some() {}
    tracing::debug!("Producer dispatcher stopped");
}

async fn assign_partition(
    client: &Client,
    partitioner: &mut dyn Partitioner,
    message: &ProducerMessage,
) -> Result<i32> {
    if let Some(partition) = message.partition {
        let all = client.partitions(&message.topic).await?;
        return if all.contains(&partition) {
            Ok(partition)
        } else {
            Err(Error::Kafka(KafkaCode::UnknownTopicOrPartition))
        };
    }

    let candidates = if partitioner.requires_consistency() {
        client.partitions(&message.topic).await?
    } else {
        client.writable_partitions(&message.topic).await?
    };
    if candidates.is_empty() {
        return Err(Error::Kafka(KafkaCode::LeaderNotAvailable));
    }
    let index = partitioner.partition(message, candidates.len() as i32)?;
    candidates
        .get(index as usize)
        .copied()
        .ok_or(Error::Kafka(KafkaCode::UnknownTopicOrPartition))
}

// ============================================================================
// Partition producer
// ============================================================================

struct PartitionProducer {
    shared: Arc<Shared>,
    tp: TopicPartition,
    input: mpsc::Receiver<ProducerMessage>,
    pending: PendingBatch,
    next_sequence: i32,
    deadline: Option<Instant>,
}

impl PartitionProducer {
    fn new(shared: Arc<Shared>, tp: TopicPartition, input: mpsc::Receiver<ProducerMessage>) -> Self {
        Self {
            shared,
            tp,
            input,
            pending: PendingBatch::default(),
            next_sequence: 0,
            deadline: None,
        }
    }

    async fn run(mut self) {
        let mut flush_signal = self.shared.flush_signal.subscribe();
        let flush = self.shared.config.producer.flush.clone();
        let max_bytes = self.shared.config.producer.max_message_bytes;

        loop {
            let deadline = self.deadline;
            tokio::select! {
                message = self.input.recv() => {
                    let Some(message) = message else { break };
                    if self.pending.would_overflow(&message, max_bytes) {
                        self.ship().await;
                    }
                    if self.pending.is_empty() {
                        self.deadline = flush.frequency.map(|f| Instant::now() + f);
                    }
                    self.pending.push(message);
                    if self.pending.is_ready(&flush) || self.shared.flushing.load(Ordering::SeqCst) > 0 {
                        self.ship().await;
                    }
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.ship().await;
                }
                changed = flush_signal.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.ship().await;
                }
            }
        }

        self.ship().await;
        tracing::trace!(topic = %self.tp.topic, partition = self.tp.partition, "Partition producer stopped");
    }

    /// Send the pending batch and wait for its outcome.
    async fn ship(&mut self) {
        self.deadline = None;
        if self.pending.is_empty() {
            return;
        }
        let mut queue = VecDeque::from([self.pending.take()]);
        while let Some(messages) = queue.pop_front() {
            if let Some(split) = self.send_batch(messages).await {
                for message in split.into_iter().rev() {
                    queue.push_front(vec![message]);
                }
            }
        }
    }

    /// Deliver one batch, retrying as configured. A batch the broker rejects
    /// as too large is handed back to be resent one message at a time.
    async fn send_batch(&mut self, mut messages: Vec<ProducerMessage>) -> Option<Vec<ProducerMessage>> {
        if let Some(error) = self.shared.fatal_error() {
            self.fail_all(messages, error).await;
            return None;
        }

        let encoder = BatchEncoder {
            config: &self.shared.config.producer,
            magic: self.shared.magic,
            identity: self.shared.txn.identity(),
            transactional: self.shared.txn.is_transactional(),
            metrics: self.shared.config.metrics.as_ref(),
        };
        let batch = match encoder.encode(&self.tp.topic, &mut messages, self.next_sequence) {
            Ok(batch) => batch,
            Err(e) => {
                self.fail_all(messages, e).await;
                return None;
            }
        };
        if self.shared.txn.identity().is_valid() {
            self.next_sequence = advance_sequence(self.next_sequence, batch.count);
        }

        let retry = &self.shared.config.producer.retry;
        let mut attempts = 0;
        loop {
            match self.attempt(&batch).await {
                Ok(base_offset) => {
                    for (i, message) in messages.into_iter().enumerate() {
                        let offset = base_offset.map(|base| base + i as i64);
                        self.shared.results.succeed(message, self.tp.partition, offset).await;
                    }
                    return None;
                }
                Err(e) if e.kafka_code().is_some_and(KafkaCode::is_fatal_for_producer)
                    && self.shared.txn.identity().is_valid() =>
                {
                    tracing::error!(
                        topic = %self.tp.topic,
                        partition = self.tp.partition,
                        error = %e,
                        "Idempotent producer cannot continue"
                    );
                    self.shared.set_fatal(&e).await;
                    self.fail_all(messages, Error::ProducerFatal(e.to_string())).await;
                    return None;
                }
                Err(e) if e.is_retriable() && attempts < retry.max => {
                    attempts += 1;
                    let delay = retry.backoff.delay(attempts - 1, retry.max);
                    tracing::warn!(
                        topic = %self.tp.topic,
                        partition = self.tp.partition,
                        error = %e,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Produce failed, retrying"
                    );
                    for message in &mut messages {
                        message.retries += 1;
                    }
                    if e.is_connection_error()
                        || e.kafka_code().is_some_and(KafkaCode::invalidates_metadata)
                    {
                        if let Err(refresh) = self.shared.client.refresh_metadata(&[&self.tp.topic]).await {
                            tracing::debug!(error = %refresh, "Metadata refresh before retry failed");
                        }
                    }
                    sleep(delay).await;
                }
                Err(e) => {
                    // A broker rejection means the sequence range was never
                    // written, so the next batch reuses it.
                    if e.kafka_code().is_some() && batch.first_sequence >= 0 {
                        self.next_sequence = batch.first_sequence;
                    }
                    if e == Error::Kafka(KafkaCode::MessageSizeTooLarge) && messages.len() > 1 {
                        tracing::debug!(
                            topic = %self.tp.topic,
                            partition = self.tp.partition,
                            messages = messages.len(),
                            "Batch too large, resending messages individually"
                        );
                        return Some(messages);
                    }
                    self.fail_all(messages, e).await;
                    return None;
                }
            }
        }
    }

    async fn attempt(&self, batch: &EncodedBatch) -> Result<Option<i64>> {
        if let Some(info) = parse_producer_info(&batch.records)
            && info.is_idempotent()
            && (info.first_sequence != batch.first_sequence || info.record_count as usize != batch.count)
        {
            return Err(Error::InvariantViolation(format!(
                "retry of {}/{} changed its sequence range",
                self.tp.topic, self.tp.partition
            )));
        }
        self.shared.txn.add_partition(&self.tp).await?;

        let leader = self.shared.client.leader(&self.tp.topic, self.tp.partition).await?;
        let aggregator = self.shared.aggregator(leader);
        let (reply, outcome) = oneshot::channel();
        aggregator
            .send(BatchRequest {
                tp: self.tp.clone(),
                batch: batch.clone(),
                reply,
            })
            .await
            .map_err(|_| Error::ShuttingDown)?;
        outcome.await.map_err(|_| Error::ConnectionClosed)?
    }

    async fn fail_all(&self, messages: Vec<ProducerMessage>, error: Error) {
        for message in messages {
            self.shared.results.fail(message, error.clone()).await;
        }
    }
}

// ============================================================================
// Broker aggregator
// ============================================================================

pub(crate) struct BatchRequest {
    tp: TopicPartition,
    batch: EncodedBatch,
    reply: oneshot::Sender<Result<Option<i64>>>,
}

async fn run_aggregator(shared: Arc<Shared>, broker: Arc<Broker>, mut input: mpsc::Receiver<BatchRequest>) {
    let permits = Arc::new(Semaphore::new(shared.config.net.max_open_requests.max(1)));
    let max_messages = shared.config.producer.flush.max_messages;
    let mut requests = JoinSet::new();

    while let Some(first) = input.recv().await {
        let mut messages = first.batch.count;
        let mut batches = vec![first];
        while max_messages == 0 || messages < max_messages {
            let Ok(next) = input.try_recv() else { break };
            if batches.iter().any(|b| b.tp == next.tp) {
                tracing::warn!(topic = %next.tp.topic, partition = next.tp.partition, "Two batches for one partition in a request");
            }
            messages += next.batch.count;
            batches.push(next);
        }

        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        requests.spawn(send_request(shared.clone(), broker.clone(), batches, permit));
        while requests.try_join_next().is_some() {}
    }

    while requests.join_next().await.is_some() {}
    tracing::debug!(broker = broker.id(), "Producer aggregator stopped");
}

async fn send_request(
    shared: Arc<Shared>,
    broker: Arc<Broker>,
    batches: Vec<BatchRequest>,
    _permit: OwnedSemaphorePermit,
) {
    let producer = &shared.config.producer;
    let mut request = ProduceRequest {
        transactional_id: shared.txn.transactional_id().map(str::to_string),
        acks: producer.required_acks.as_i16(),
        timeout_ms: producer.timeout.as_millis() as i32,
        topics: Vec::new(),
    };
    let mut per_topic: HashMap<&str, u64> = HashMap::new();
    for b in &batches {
        request.add_records(&b.tp.topic, b.tp.partition, b.batch.records.clone());
        *per_topic.entry(b.tp.topic.as_str()).or_default() += b.batch.count as u64;
    }
    record_request_metrics(shared.config.metrics.as_ref(), &per_topic);

    if producer.required_acks == RequiredAcks::None {
        let result = broker.send_without_response(&request).await;
        if let Err(e) = &result
            && e.is_connection_error()
        {
            let _ = broker.close().await;
        }
        for b in batches {
            let _ = b.reply.send(result.clone().map(|_| None));
        }
        return;
    }

    let response = match broker.send(&request).await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(broker = broker.id(), error = %e, batches = batches.len(), "Produce request failed");
            if e.is_connection_error() {
                let _ = broker.close().await;
            }
            for b in batches {
                let _ = b.reply.send(Err(e.clone()));
            }
            return;
        }
    };

    for b in batches {
        let outcome = match response.partition(&b.tp.topic, b.tp.partition) {
            None => Err(Error::Decoding(format!(
                "produce response is missing {}/{}",
                b.tp.topic, b.tp.partition
            ))),
            Some(block) => match block.error_code {
                KafkaCode::None => Ok(Some(block.base_offset)),
                KafkaCode::DuplicateSequenceNumber => {
                    tracing::debug!(
                        topic = %b.tp.topic,
                        partition = b.tp.partition,
                        "Broker already has this batch"
                    );
                    Ok((block.base_offset >= 0).then_some(block.base_offset))
                }
                code => Err(Error::Kafka(code)),
            },
        };
        let _ = b.reply.send(outcome);
    }
}

fn record_request_metrics(registry: &dyn metrics::MetricsRegistry, per_topic: &HashMap<&str, u64>) {
    let total: u64 = per_topic.values().sum();
    registry.mark_meter(metrics::RECORD_SEND_RATE, total);
    registry.update_histogram(metrics::RECORDS_PER_REQUEST, total as i64);
    for (topic, count) in per_topic {
        registry.mark_meter(&metrics::for_topic(metrics::RECORD_SEND_RATE, topic), *count);
        registry.update_histogram(&metrics::for_topic(metrics::RECORDS_PER_REQUEST, topic), *count as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::PrometheusMetrics;

    #[tokio::test]
    async fn test_results_track_in_flight() {
        let (tx, mut rx) = mpsc::channel(4);
        let results = Results::new(Some(tx), None);
        results.enter();
        results.enter();
        assert_eq!(results.in_flight(), 2);

        results.succeed(ProducerMessage::new("t"), 3, Some(10)).await;
        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered.partition, Some(3));
        assert_eq!(delivered.offset, Some(10));

        results.fail(ProducerMessage::new("t"), Error::ShuttingDown).await;
        assert_eq!(results.in_flight(), 0);
        results.wait_idle().await;
    }

    #[tokio::test]
    async fn test_results_complete_sync_waiters() {
        let results = Results::new(None, None);
        let (tx, rx) = oneshot::channel();
        let mut message = ProducerMessage::new("t");
        message.completion = Some(tx);
        results.enter();
        results.succeed(message, 1, Some(42)).await;
        let delivered = rx.await.unwrap().unwrap();
        assert_eq!((delivered.partition, delivered.offset), (Some(1), Some(42)));
    }

    #[test]
    fn test_request_metrics_per_topic() {
        let registry = PrometheusMetrics::new();
        let per_topic = HashMap::from([("a", 3u64), ("b", 2u64)]);
        record_request_metrics(&registry, &per_topic);
        assert_eq!(registry.meter_count(metrics::RECORD_SEND_RATE), 5);
        assert_eq!(registry.meter_count("record-send-rate-for-topic-a"), 3);
        assert_eq!(registry.histogram_count(metrics::RECORDS_PER_REQUEST), 1);
    }
}
