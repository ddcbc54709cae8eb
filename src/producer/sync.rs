use tokio::sync::oneshot;

use crate::client::Client;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::producer::{AsyncProducer, ProducerError, ProducerErrors, ProducerMessage, TxnOffset, TxnState};

/// Blocks each send until the broker has acknowledged it.
#[derive(Debug)]
pub struct SyncProducer {
    producer: AsyncProducer,
}

impl SyncProducer {
    pub async fn new<S: AsRef<str>>(addrs: &[S], mut config: Config) -> Result<Self> {
        config.producer.return_successes = true;
        config.producer.return_errors = true;
        Ok(Self {
            producer: AsyncProducer::new(addrs, config).await?,
        })
    }

    /// The client's config must enable both `return_successes` and
    /// `return_errors`.
    pub async fn from_client(client: Client) -> Result<Self> {
        let producer = &client.config().producer;
        if !producer.return_successes || !producer.return_errors {
            return Err(Error::Config(
                "sync producer requires producer.return_successes and producer.return_errors"
                    .to_string(),
            ));
        }
        Ok(Self {
            producer: AsyncProducer::from_client(client).await?,
        })
    }

    /// Send one message and return its `(partition, offset)`. The offset is
    /// -1 when the broker does not report one.
    pub async fn send_message(&self, message: ProducerMessage) -> Result<(i32, i64)> {
        let delivered = self.submit(message).await?.await.map_err(|_| Error::ShuttingDown)?;
        match delivered {
            Ok(message) => Ok((message.partition.unwrap_or(-1), message.offset.unwrap_or(-1))),
            Err(failure) => Err(failure.error),
        }
    }

    /// Send a group of messages and wait for all of them.
    pub async fn send_messages(
        &self,
        messages: Vec<ProducerMessage>,
    ) -> std::result::Result<Vec<ProducerMessage>, ProducerErrors> {
        let mut waiting = Vec::with_capacity(messages.len());
        let mut failures = Vec::new();
        let mut pending = messages.into_iter();
        while let Some(message) = pending.next() {
            match self.submit(message).await {
                Ok(rx) => waiting.push(rx),
                Err(error) => {
                    tracing::debug!(error = %error, "Sync producer stopped accepting messages");
                    failures.extend(pending.by_ref().map(|message| ProducerError {
                        message,
                        error: error.clone(),
                    }));
                    break;
                }
            }
        }

        let mut delivered = Vec::with_capacity(waiting.len());
        for rx in waiting {
            match rx.await {
                Ok(Ok(message)) => delivered.push(message),
                Ok(Err(failure)) => failures.push(failure),
                Err(_) => failures.push(ProducerError {
                    message: ProducerMessage::new(String::new()),
                    error: Error::ShuttingDown,
                }),
            }
        }
        if failures.is_empty() {
            Ok(delivered)
        } else {
            Err(ProducerErrors(failures))
        }
    }

    async fn submit(
        &self,
        mut message: ProducerMessage,
    ) -> Result<oneshot::Receiver<std::result::Result<ProducerMessage, ProducerError>>> {
        let (tx, rx) = oneshot::channel();
        message.completion = Some(tx);
        self.producer.send(message).await?;
        Ok(rx)
    }

    pub fn is_transactional(&self) -> bool {
        self.producer.is_transactional()
    }

    pub async fn txn_state(&self) -> TxnState {
        self.producer.txn_state().await
    }

    pub async fn begin_txn(&self) -> Result<()> {
        self.producer.begin_txn().await
    }

    pub async fn commit_txn(&self) -> Result<()> {
        self.producer.commit_txn().await
    }

    pub async fn abort_txn(&self) -> Result<()> {
        self.producer.abort_txn().await
    }

    pub async fn add_offsets_to_txn(&self, group_id: &str, offsets: &[TxnOffset]) -> Result<()> {
        self.producer.add_offsets_to_txn(group_id, offsets).await
    }

    pub async fn close(self) -> std::result::Result<(), ProducerErrors> {
        self.producer.close().await
    }
}
