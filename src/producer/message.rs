use std::any::Any;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::Error;
use crate::protocol::records::RecordHeader;

/// Opaque caller data carried through the pipeline untouched.
pub type MessageMetadata = Arc<dyn Any + Send + Sync>;

pub(crate) type Completion = oneshot::Sender<Result<ProducerMessage, ProducerError>>;

/// A message handed to the producer.
///
/// `partition` and `offset` are filled in when the message comes back on
/// the successes channel.
pub struct ProducerMessage {
    pub topic: String,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: Vec<RecordHeader>,
    /// Explicit partition; bypasses the partitioner when set.
    pub partition: Option<i32>,
    pub offset: Option<i64>,
    /// Milliseconds since the epoch; the send time when unset.
    pub timestamp: Option<i64>,
    pub metadata: Option<MessageMetadata>,
    pub(crate) retries: u32,
    pub(crate) completion: Option<Completion>,
}

impl fmt::Debug for ProducerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerMessage")
            .field("topic", &self.topic)
            .field("key", &self.key)
            .field("value_len", &self.value.as_ref().map(Bytes::len))
            .field("headers", &self.headers.len())
            .field("partition", &self.partition)
            .field("offset", &self.offset)
            .field("timestamp", &self.timestamp)
            .finish_non_exhaustive()
    }
}

impl ProducerMessage {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            value: None,
            headers: Vec::new(),
            partition: None,
            offset: None,
            timestamp: None,
            metadata: None,
            retries: 0,
            completion: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_value(mut self, value: impl Into<Bytes>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        self.headers.push(RecordHeader {
            key: key.into(),
            value: Some(value.into()),
        });
        self
    }

    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn with_timestamp(mut self, timestamp_ms: i64) -> Self {
        self.timestamp = Some(timestamp_ms);
        self
    }

    pub fn with_metadata(mut self, metadata: impl Any + Send + Sync) -> Self {
        self.metadata = Some(Arc::new(metadata));
        self
    }

    /// The metadata attached with [`with_metadata`](Self::with_metadata).
    pub fn metadata_as<T: Any>(&self) -> Option<&T> {
        self.metadata.as_ref()?.downcast_ref()
    }

    /// Size of key, value and headers, the part the broker limits.
    pub fn byte_size(&self) -> usize {
        let headers: usize = self
            .headers
            .iter()
            .map(|h| h.key.len() + h.value.as_ref().map_or(0, Bytes::len))
            .sum();
        self.key.as_ref().map_or(0, Bytes::len) + self.value.as_ref().map_or(0, Bytes::len) + headers
    }

    /// How many times the pipeline has retried this message.
    pub fn retries(&self) -> u32 {
        self.retries
    }
}

/// A message that could not be delivered, with the reason.
#[derive(Debug, thiserror::Error)]
#[error("failed to produce message to {}: {error}", .message.topic)]
pub struct ProducerError {
    pub message: ProducerMessage,
    pub error: Error,
}

/// Errors collected when closing a producer.
#[derive(Debug, thiserror::Error)]
#[error("{} messages failed to produce", .0.len())]
pub struct ProducerErrors(pub Vec<ProducerError>);

impl ProducerErrors {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl IntoIterator for ProducerErrors {
    type Item = ProducerError;
    type IntoIter = std::vec::IntoIter<ProducerError>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_size() {
        let message = ProducerMessage::new("orders")
            .with_key("k1")
            .with_value("value")
            .with_header("trace", "abc")
            .with_metadata(42u32);
        assert_eq!(message.byte_size(), 2 + 5 + 5 + 3);
        assert_eq!(message.metadata_as::<u32>(), Some(&42));
        assert_eq!(message.metadata_as::<String>(), None);
        assert_eq!(message.retries(), 0);
    }

    #[test]
    fn test_error_display() {
        let error = ProducerError {
            message: ProducerMessage::new("orders"),
            error: Error::ShuttingDown,
        };
        assert!(error.to_string().contains("orders"));
        assert_eq!(ProducerErrors(vec![error]).to_string(), "1 messages failed to produce");
    }
}
