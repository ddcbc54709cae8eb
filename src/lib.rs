//! # Gregor
//! Async Rust client for Apache Kafka and Kafka-compatible brokers.
//!
//! Gregor speaks the Kafka wire protocol directly over Tokio. It provides an
//! asynchronous producer with batching, compression, retries, idempotence and
//! transactions; partition consumers with read-committed isolation; and
//! consumer groups with pluggable partition assignment and committed offsets.
//!
//! # Goals
//! - Easy to understand code
//! - Leverage best in class libraries such as [Tokio](https://tokio.rs/), [Nom](https://docs.rs/nom/latest/nom/)
//! - Every message reported exactly once, as a success or an error
//! - Testable without a broker through the in-process [`mock`] cluster
//!
//! ## Getting started
//! ```toml
//! gregor = "0.1"
//! ```
//!
//! ### Producing
//! ```rust,no_run
//! use gregor::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> gregor::Result<()> {
//!     let producer = SyncProducer::new(&["localhost:9092"], Config::default()).await?;
//!     let (partition, offset) = producer
//!         .send_message(ProducerMessage::new("events").with_value("hello"))
//!         .await?;
//!     println!("stored at {partition}/{offset}");
//!     producer.close().await.ok();
//!     Ok(())
//! }
//! ```
//!
//! ### Consuming as a group
//! ```rust,no_run
//! use std::sync::Arc;
//! use gregor::prelude::*;
//! use async_trait::async_trait;
//!
//! struct Printer;
//!
//! #[async_trait]
//! impl ConsumerGroupHandler for Printer {
//!     async fn consume_claim(
//!         &self,
//!         session: &ConsumerGroupSession,
//!         claim: &mut ConsumerGroupClaim,
//!     ) -> gregor::Result<()> {
//!         while let Some(message) = claim.recv().await {
//!             println!("{}/{}@{}", message.topic, message.partition, message.offset);
//!             session.mark_message(&message, "");
//!         }
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> gregor::Result<()> {
//!     let group = ConsumerGroup::new(&["localhost:9092"], "printers", Config::default()).await?;
//!     loop {
//!         group.consume(&["events"], Arc::new(Printer)).await?;
//!     }
//! }
//! ```
//!
//! ## Resources
//! - [Kafka Protocol Spec](https://kafka.apache.org/protocol.html)
//! - [Confluence Docs](https://cwiki.apache.org/confluence/display/KAFKA/A+Guide+To+The+Kafka+Protocol)

#![forbid(unsafe_code)]

mod encode;
pub mod error;
mod parser;
pub mod protocol;
pub mod types;

pub mod broker;
pub mod client;
pub mod config;
pub mod constants;
pub mod consumer;
pub mod group;
pub mod metrics;
pub mod mock;
pub mod producer;
pub mod retry;
pub mod sasl;
pub mod telemetry;

pub use error::{Error, KafkaCode, Result};

pub mod prelude {
    //! The types most applications need.
    pub use crate::client::Client;
    pub use crate::config::Config;
    pub use crate::consumer::{
        Consumer, ConsumerError, ConsumerMessage, OffsetManager, PartitionConsumer,
        PartitionOffsetManager,
    };
    pub use crate::error::{Error, KafkaCode, Result};
    pub use crate::group::{
        ConsumerGroup, ConsumerGroupClaim, ConsumerGroupHandler, ConsumerGroupSession, GroupState,
    };
    pub use crate::producer::{AsyncProducer, ProducerError, ProducerMessage, SyncProducer};
    pub use crate::types::{IsolationLevel, RequiredAcks, StartOffset, TopicPartition};

    pub use bytes;
}
