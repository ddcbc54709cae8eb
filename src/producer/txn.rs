//! Producer identity and the transaction state machine.
//!
//! ```text
//! Uninitialized ──init──▶ Ready ──begin──▶ InTransaction ──commit──▶ Committing ──▶ Ready
//!                                               │
//!                                               └──abort──▶ Aborting ──▶ Ready
//! ```
//!
//! Any producer-fatal broker code moves the machine to `FatalError`, which
//! is terminal.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use backon::Retryable;
use tokio::sync::Mutex;

use crate::broker::Broker;
use crate::client::Client;
use crate::config::TransactionConfig;
use crate::error::{Error, KafkaCode, Result};
use crate::protocol::Request;
use crate::protocol::txn::{
    AddOffsetsToTxnRequest, AddPartitionsToTxnRequest, AddPartitionsToTxnResponse, EndTxnRequest,
    InitProducerIdRequest, InitProducerIdResponse, TxnErrorResponse, TxnOffsetCommitRequest,
};
use crate::retry::RetryPolicy;
use crate::types::{ProducerIdentity, TopicPartition};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Uninitialized,
    Ready,
    InTransaction,
    Committing,
    Aborting,
    FatalError,
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TxnState::Uninitialized => "uninitialized",
            TxnState::Ready => "ready",
            TxnState::InTransaction => "in-transaction",
            TxnState::Committing => "committing",
            TxnState::Aborting => "aborting",
            TxnState::FatalError => "fatal-error",
        };
        f.write_str(name)
    }
}

/// An offset to commit inside a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnOffset {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub metadata: Option<String>,
}

#[derive(Debug)]
struct TxnStatus {
    state: TxnState,
    partitions: BTreeSet<TopicPartition>,
    offsets_added: bool,
    fatal: Option<Error>,
}

#[derive(Debug)]
pub(crate) struct TxnManager {
    client: Client,
    config: TransactionConfig,
    transactional_id: Option<String>,
    identity: ProducerIdentity,
    status: Mutex<TxnStatus>,
}

impl TxnManager {
    /// Obtain a producer identity when the producer is idempotent or
    /// transactional. A plain producer gets [`ProducerIdentity::NONE`].
    pub async fn init(client: &Client) -> Result<Arc<TxnManager>> {
        let producer = &client.config().producer;
        let config = producer.transaction.clone();
        let transactional_id = config.id.clone();

        let identity = if producer.idempotent || transactional_id.is_some() {
            let request = InitProducerIdRequest {
                transactional_id: transactional_id.clone(),
                transaction_timeout_ms: config.timeout.as_millis() as i32,
            };
            let response = retrying(&config, || async {
                let broker = match &transactional_id {
                    Some(id) => client.transaction_coordinator(id).await?,
                    None => client.any_broker()?,
                };
                let response = send(client, transactional_id.as_deref(), &broker, &request).await?;
                response.error_code.ok()?;
                Ok(response)
            })
            .await?;
            tracing::info!(
                producer_id = response.producer_id,
                epoch = response.producer_epoch,
                transactional_id = ?transactional_id,
                "Initialized producer id"
            );
            response.identity()
        } else {
            ProducerIdentity::NONE
        };

        let state = if transactional_id.is_some() {
            TxnState::Ready
        } else {
            TxnState::Uninitialized
        };
        Ok(Arc::new(TxnManager {
            client: client.clone(),
            config,
            transactional_id,
            identity,
            status: Mutex::new(TxnStatus {
                state,
                partitions: BTreeSet::new(),
                offsets_added: false,
                fatal: None,
            }),
        }))
    }

    pub fn identity(&self) -> ProducerIdentity {
        self.identity
    }

    pub fn transactional_id(&self) -> Option<&str> {
        self.transactional_id.as_deref()
    }

    pub fn is_transactional(&self) -> bool {
        self.transactional_id.is_some()
    }

    pub async fn state(&self) -> TxnState {
        self.status.lock().await.state
    }

    /// Move to `FatalError`; every later transactional call fails with `error`.
    pub async fn fail(&self, error: Error) {
        let mut status = self.status.lock().await;
        status.state = TxnState::FatalError;
        status.fatal.get_or_insert(error);
    }

    fn transition_error(status: &TxnStatus, operation: &str) -> Error {
        match (&status.state, &status.fatal) {
            (TxnState::FatalError, Some(e)) => Error::ProducerFatal(e.to_string()),
            (state, _) => Error::Transaction(format!("cannot {operation} in state {state}")),
        }
    }

    fn transactional_id_or_err(&self) -> Result<&str> {
        self.transactional_id
            .as_deref()
            .ok_or_else(|| Error::Transaction("producer is not transactional".to_string()))
    }

    pub async fn begin(&self) -> Result<()> {
        self.transactional_id_or_err()?;
        let mut status = self.status.lock().await;
        if status.state != TxnState::Ready {
            return Err(Self::transition_error(&status, "begin a transaction"));
        }
        status.state = TxnState::InTransaction;
        Ok(())
    }

    /// Whether messages may be produced right now.
    pub async fn check_produce(&self) -> Result<()> {
        if !self.is_transactional() {
            return Ok(());
        }
        let status = self.status.lock().await;
        if status.state != TxnState::InTransaction {
            return Err(Self::transition_error(&status, "produce"));
        }
        Ok(())
    }

    /// Register `tp` with the transaction before its first batch is sent.
    pub async fn add_partition(&self, tp: &TopicPartition) -> Result<()> {
        let Some(transactional_id) = self.transactional_id.as_deref() else {
            return Ok(());
        };
        let mut status = self.status.lock().await;
        if status.state != TxnState::InTransaction {
            return Err(Self::transition_error(&status, "add a partition"));
        }
        if status.partitions.contains(tp) {
            return Ok(());
        }

        let mut request = AddPartitionsToTxnRequest {
            transactional_id: transactional_id.to_string(),
            producer_id: self.identity.producer_id,
            producer_epoch: self.identity.epoch,
            topics: Vec::new(),
        };
        request.add_partition(&tp.topic, tp.partition);

        let result = retrying(&self.config, || async {
            let broker = self.client.transaction_coordinator(transactional_id).await?;
            let response = send(&self.client, Some(transactional_id), &broker, &request).await?;
            match response.error_for(&tp.topic, tp.partition) {
                Some(code) => code.ok(),
                None => Err(Error::Decoding(format!(
                    "AddPartitionsToTxn response is missing {}/{}",
                    tp.topic, tp.partition
                ))),
            }
        })
        .await;

        match result {
            Ok(()) => {
                tracing::debug!(topic = %tp.topic, partition = tp.partition, "Added partition to transaction");
                status.partitions.insert(tp.clone());
                Ok(())
            }
            Err(e) => Err(self.classify(&mut status, e)),
        }
    }

    /// Commit consumer offsets as part of the current transaction.
    pub async fn add_offsets(&self, group_id: &str, offsets: &[TxnOffset]) -> Result<()> {
        let transactional_id = self.transactional_id_or_err()?;
        let mut status = self.status.lock().await;
        if status.state != TxnState::InTransaction {
            return Err(Self::transition_error(&status, "add offsets"));
        }

        let add = AddOffsetsToTxnRequest {
            transactional_id: transactional_id.to_string(),
            producer_id: self.identity.producer_id,
            producer_epoch: self.identity.epoch,
            group_id: group_id.to_string(),
        };
        let added = retrying(&self.config, || async {
            let broker = self.client.transaction_coordinator(transactional_id).await?;
            send(&self.client, Some(transactional_id), &broker, &add)
                .await?
                .error_code
                .ok()
        })
        .await;
        if let Err(e) = added {
            return Err(self.classify(&mut status, e));
        }

        let mut commit = TxnOffsetCommitRequest {
            transactional_id: transactional_id.to_string(),
            group_id: group_id.to_string(),
            producer_id: self.identity.producer_id,
            producer_epoch: self.identity.epoch,
            topics: Vec::new(),
        };
        for offset in offsets {
            commit.add_offset(&offset.topic, offset.partition, offset.offset, offset.metadata.clone());
        }
        let committed = retrying(&self.config, || async {
            let broker = self.client.coordinator(group_id).await?;
            let response = match broker.send(&commit).await {
                Ok(response) => response,
                Err(e) => {
                    if e.is_connection_error() {
                        let _ = broker.close().await;
                    }
                    return Err(e);
                }
            };
            for offset in offsets {
                if let Some(code) = response.error_for(&offset.topic, offset.partition) {
                    if code.invalidates_coordinator() {
                        let _ = self.client.refresh_coordinator(group_id).await;
                    }
                    code.ok()?;
                }
            }
            Ok(())
        })
        .await;

        match committed {
            Ok(()) => {
                status.offsets_added = true;
                Ok(())
            }
            Err(e) => Err(self.classify(&mut status, e)),
        }
    }

    /// End the open transaction. The caller flushes outstanding messages
    /// before committing.
    pub async fn end(&self, commit: bool) -> Result<()> {
        let transactional_id = self.transactional_id_or_err()?;
        let mut status = self.status.lock().await;
        if status.state != TxnState::InTransaction {
            let operation = if commit { "commit" } else { "abort" };
            return Err(Self::transition_error(&status, operation));
        }
        if status.partitions.is_empty() && !status.offsets_added {
            status.state = TxnState::Ready;
            return Ok(());
        }

        status.state = if commit {
            TxnState::Committing
        } else {
            TxnState::Aborting
        };
        let request = EndTxnRequest {
            transactional_id: transactional_id.to_string(),
            producer_id: self.identity.producer_id,
            producer_epoch: self.identity.epoch,
            committed: commit,
        };
        let result = retrying(&self.config, || async {
            let broker = self.client.transaction_coordinator(transactional_id).await?;
            send(&self.client, Some(transactional_id), &broker, &request)
                .await?
                .error_code
                .ok()
        })
        .await;

        match result {
            Ok(()) => {
                tracing::info!(transactional_id, commit, partitions = status.partitions.len(), "Ended transaction");
                status.state = TxnState::Ready;
                status.partitions.clear();
                status.offsets_added = false;
                Ok(())
            }
            Err(e) => {
                let error = self.classify(&mut status, e);
                if status.state != TxnState::FatalError {
                    status.state = TxnState::InTransaction;
                }
                Err(error)
            }
        }
    }

    fn classify(&self, status: &mut TxnStatus, error: Error) -> Error {
        match error.kafka_code() {
            Some(code) if code.is_fatal_for_producer() => {
                tracing::error!(error = %error, "Transactional producer hit a fatal error");
                status.state = TxnState::FatalError;
                status.fatal = Some(error.clone());
                Error::ProducerFatal(error.to_string())
            }
            _ => error,
        }
    }
}

async fn retrying<T, F, Fut>(config: &TransactionConfig, operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let policy = RetryPolicy::new(config.retry_backoff.clone(), config.retry_max);
    operation
        .retry(policy)
        .when(|e: &Error| e.is_retriable())
        .notify(|e, delay| {
            tracing::debug!(error = %e, delay_ms = delay.as_millis() as u64, "Transaction request failed, retrying");
        })
        .await
}

/// Send to a transaction coordinator, dropping it from the cache when it no
/// longer owns the id.
async fn send<R: Request>(
    client: &Client,
    transactional_id: Option<&str>,
    broker: &Arc<Broker>,
    request: &R,
) -> Result<R::Response>
where
    R::Response: TxnCoded,
{
    let response = match broker.send(request).await {
        Ok(response) => response,
        Err(e) => {
            if e.is_connection_error() {
                let _ = broker.close().await;
            }
            return Err(e);
        }
    };
    if let Some(id) = transactional_id
        && response.codes().any(KafkaCode::invalidates_coordinator)
    {
        let _ = client.refresh_transaction_coordinator(id).await;
    }
    Ok(response)
}

/// Error codes carried by a transaction response.
trait TxnCoded {
    fn codes(&self) -> Box<dyn Iterator<Item = KafkaCode> + '_>;
}

impl TxnCoded for InitProducerIdResponse {
    fn codes(&self) -> Box<dyn Iterator<Item = KafkaCode> + '_> {
        Box::new(std::iter::once(self.error_code))
    }
}

impl TxnCoded for TxnErrorResponse {
    fn codes(&self) -> Box<dyn Iterator<Item = KafkaCode> + '_> {
        Box::new(std::iter::once(self.error_code))
    }
}

impl TxnCoded for AddPartitionsToTxnResponse {
    fn codes(&self) -> Box<dyn Iterator<Item = KafkaCode> + '_> {
        Box::new(self.errors().map(|(_, _, code)| code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(TxnState::InTransaction.to_string(), "in-transaction");
        assert_eq!(TxnState::FatalError.to_string(), "fatal-error");
    }

    #[test]
    fn test_transition_error_prefers_fatal_cause() {
        let status = TxnStatus {
            state: TxnState::FatalError,
            partitions: BTreeSet::new(),
            offsets_added: false,
            fatal: Some(Error::Kafka(KafkaCode::ProducerFenced)),
        };
        assert!(matches!(
            TxnManager::transition_error(&status, "begin"),
            Error::ProducerFatal(_)
        ));

        let status = TxnStatus {
            state: TxnState::Ready,
            fatal: None,
            ..status
        };
        assert_eq!(
            TxnManager::transition_error(&status, "commit"),
            Error::Transaction("cannot commit in state ready".to_string())
        );
    }
}
