//! Asynchronous and synchronous producers.
//!
//! [`AsyncProducer`] accepts messages without waiting for the broker and
//! reports every message exactly once: on the successes channel (when
//! `producer.return_successes` is set), or on the errors channel. Messages
//! with the same key land on the same partition and are acknowledged in the
//! order they were sent.
//!
//! ```rust,no_run
//! use gregor::config::Config;
//! use gregor::producer::{AsyncProducer, ProducerMessage};
//!
//! # async fn example() -> gregor::Result<()> {
//! let mut config = Config::default();
//! config.producer.return_successes = true;
//! let mut producer = AsyncProducer::new(&["localhost:9092"], config).await?;
//! let mut successes = producer.take_successes().expect("successes enabled");
//!
//! producer.send(ProducerMessage::new("events").with_key("user-1").with_value("hello")).await?;
//! let delivered = successes.recv().await.expect("delivered");
//! println!("stored at {:?}/{:?}", delivered.partition, delivered.offset);
//! producer.close().await.ok();
//! # Ok(())
//! # }
//! ```

mod batch;
mod message;
pub mod partitioner;
mod pipeline;
mod sync;
mod txn;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use message::{MessageMetadata, ProducerError, ProducerErrors, ProducerMessage};
pub use partitioner::{
    HashPartitioner, ManualPartitioner, Partitioner, PartitionerFactory, RandomPartitioner,
    RoundRobinPartitioner,
};
pub use sync::SyncProducer;
pub use txn::{TxnOffset, TxnState};

use crate::client::Client;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::types::ProducerIdentity;
use pipeline::{Results, Shared, run_dispatcher};
use txn::TxnManager;

pub struct AsyncProducer {
    input: mpsc::Sender<ProducerMessage>,
    shared: Arc<Shared>,
    dispatcher: JoinHandle<()>,
    successes: Option<mpsc::Receiver<ProducerMessage>>,
    errors: Option<mpsc::Receiver<ProducerError>>,
    owns_client: bool,
    txn_failure_mark: AtomicUsize,
}

impl std::fmt::Debug for AsyncProducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncProducer")
            .field("in_flight", &self.shared.results.in_flight())
            .field("transactional_id", &self.shared.txn.transactional_id())
            .finish_non_exhaustive()
    }
}

impl AsyncProducer {
    /// Connect to `addrs` with a client owned by the producer.
    pub async fn new<S: AsRef<str>>(addrs: &[S], config: Config) -> Result<Self> {
        let client = Client::new(addrs, config).await?;
        let mut producer = Self::from_client(client).await?;
        producer.owns_client = true;
        Ok(producer)
    }

    /// Produce through an existing client. Closing the producer leaves the
    /// client open.
    pub async fn from_client(client: Client) -> Result<Self> {
        if client.closed() {
            return Err(Error::ClosedClient);
        }
        let config = client.config().clone();
        let txn = TxnManager::init(&client).await?;

        let buffer = config.channel_buffer_size;
        let (successes_tx, successes) = if config.producer.return_successes {
            let (tx, rx) = mpsc::channel(buffer);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let (errors_tx, errors) = if config.producer.return_errors {
            let (tx, rx) = mpsc::channel(buffer);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let shared = Arc::new(Shared::new(client, txn, Results::new(successes_tx, errors_tx)));
        let (input, rx) = mpsc::channel(buffer);
        let dispatcher = tokio::spawn(run_dispatcher(shared.clone(), rx));

        Ok(Self {
            input,
            shared,
            dispatcher,
            successes,
            errors,
            owns_client: false,
            txn_failure_mark: AtomicUsize::new(0),
        })
    }

    /// Queue `message`. Waits only when the input buffer is full.
    pub async fn send(&self, message: ProducerMessage) -> Result<()> {
        if let Some(error) = self.shared.fatal_error() {
            return Err(error);
        }
        self.shared.results.enter();
        if self.input.send(message).await.is_err() {
            self.shared.results.leave();
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }

    /// The successes channel. Available once, and only with
    /// `producer.return_successes`.
    pub fn take_successes(&mut self) -> Option<mpsc::Receiver<ProducerMessage>> {
        self.successes.take()
    }

    /// The errors channel. Available once, and only with
    /// `producer.return_errors`. Errors not taken are returned by
    /// [`close`](Self::close).
    pub fn take_errors(&mut self) -> Option<mpsc::Receiver<ProducerError>> {
        self.errors.take()
    }

    /// Messages accepted but not yet reported.
    pub fn in_flight(&self) -> usize {
        self.shared.results.in_flight()
    }

    pub fn producer_identity(&self) -> ProducerIdentity {
        self.shared.txn.identity()
    }

    /// Send everything pending now and wait until every accepted message has
    /// been reported.
    pub async fn flush(&self) -> Result<()> {
        self.shared.flushing.fetch_add(1, Ordering::SeqCst);
        self.shared.flush_signal.send_modify(|generation| *generation += 1);
        self.shared.results.wait_idle().await;
        self.shared.flushing.fetch_sub(1, Ordering::SeqCst);
        match self.shared.fatal_error() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    pub fn is_transactional(&self) -> bool {
        self.shared.txn.is_transactional()
    }

    pub async fn txn_state(&self) -> TxnState {
        self.shared.txn.state().await
    }

    pub async fn begin_txn(&self) -> Result<()> {
        self.shared.txn.begin().await?;
        self.txn_failure_mark
            .store(self.shared.results.failed(), Ordering::SeqCst);
        Ok(())
    }

    /// Flush, then commit. Fails without committing when any message of
    /// the transaction failed; abort in that case.
    pub async fn commit_txn(&self) -> Result<()> {
        self.flush().await?;
        let failed = self.shared.results.failed() - self.txn_failure_mark.load(Ordering::SeqCst);
        if failed > 0 {
            return Err(Error::Transaction(format!(
                "{failed} messages failed in this transaction; abort it"
            )));
        }
        self.shared.txn.end(true).await
    }

    pub async fn abort_txn(&self) -> Result<()> {
        self.flush().await?;
        self.shared.txn.end(false).await
    }

    /// Commit consumer offsets atomically with the produced messages.
    pub async fn add_offsets_to_txn(&self, group_id: &str, offsets: &[TxnOffset]) -> Result<()> {
        self.shared.txn.add_offsets(group_id, offsets).await
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Stop accepting messages, deliver everything already accepted and shut
    /// down. Errors that were never taken off the errors channel are
    /// returned.
    pub async fn close(self) -> std::result::Result<(), ProducerErrors> {
        let AsyncProducer {
            input,
            shared,
            mut dispatcher,
            mut successes,
            mut errors,
            owns_client,
            ..
        } = self;
        drop(input);

        let mut collected = Vec::new();
        loop {
            tokio::select! {
                _ = &mut dispatcher => break,
                Some(error) = recv_if_present(&mut errors) => collected.push(error),
                Some(_) = recv_if_present(&mut successes) => {}
            }
        }
        shared.shutdown_aggregators().await;
        if let Some(errors) = errors.as_mut() {
            while let Ok(error) = errors.try_recv() {
                collected.push(error);
            }
        }

        if owns_client && let Err(e) = shared.client.close().await {
            tracing::debug!(error = %e, "Producer client already closed");
        }
        tracing::info!(failed = collected.len(), "Producer closed");
        if collected.is_empty() {
            Ok(())
        } else {
            Err(ProducerErrors(collected))
        }
    }
}

async fn recv_if_present<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
