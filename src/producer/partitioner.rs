//! Partition selection for produced messages.
//!
//! The producer builds one [`Partitioner`] per topic from the configured
//! [`PartitionerFactory`]. A message that already names a partition skips
//! the partitioner entirely.

use std::fmt;
use std::sync::Arc;

use rand::Rng;

use crate::error::{Error, Result};
use crate::producer::ProducerMessage;

pub trait Partitioner: Send {
    /// Choose a partition in `0..num_partitions` for `message`.
    fn partition(&mut self, message: &ProducerMessage, num_partitions: i32) -> Result<i32>;

    /// Whether the same message must always land on the same partition.
    /// Consistent partitioners choose among every partition, the others only
    /// among partitions that currently have a leader.
    fn requires_consistency(&self) -> bool;
}

/// 32-bit FNV-1a.
pub fn fnv1a32(data: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in data {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

fn ensure_partitions(num_partitions: i32) -> Result<()> {
    if num_partitions <= 0 {
        return Err(Error::Kafka(crate::error::KafkaCode::LeaderNotAvailable));
    }
    Ok(())
}

/// Keyed messages go to `fnv1a(key) mod n`; keyless ones are spread randomly.
#[derive(Debug, Default)]
pub struct HashPartitioner {
    random: RandomPartitioner,
}

impl Partitioner for HashPartitioner {
    fn partition(&mut self, message: &ProducerMessage, num_partitions: i32) -> Result<i32> {
        ensure_partitions(num_partitions)?;
        match &message.key {
            Some(key) => Ok(((fnv1a32(key) & 0x7fff_ffff) % num_partitions as u32) as i32),
            None => self.random.partition(message, num_partitions),
        }
    }

    fn requires_consistency(&self) -> bool {
        true
    }
}

#[derive(Debug, Default)]
pub struct RandomPartitioner;

impl Partitioner for RandomPartitioner {
    fn partition(&mut self, _message: &ProducerMessage, num_partitions: i32) -> Result<i32> {
        ensure_partitions(num_partitions)?;
        Ok(rand::thread_rng().gen_range(0..num_partitions))
    }

    fn requires_consistency(&self) -> bool {
        false
    }
}

#[derive(Debug, Default)]
pub struct RoundRobinPartitioner {
    next: i32,
}

impl Partitioner for RoundRobinPartitioner {
    fn partition(&mut self, _message: &ProducerMessage, num_partitions: i32) -> Result<i32> {
        ensure_partitions(num_partitions)?;
        if self.next >= num_partitions {
            self.next = 0;
        }
        let chosen = self.next;
        self.next += 1;
        Ok(chosen)
    }

    fn requires_consistency(&self) -> bool {
        false
    }
}

/// Uses the partition set on the message.
#[derive(Debug, Default)]
pub struct ManualPartitioner;

impl Partitioner for ManualPartitioner {
    fn partition(&mut self, message: &ProducerMessage, num_partitions: i32) -> Result<i32> {
        match message.partition {
            Some(p) if (0..num_partitions).contains(&p) => Ok(p),
            Some(_) => Err(Error::Kafka(crate::error::KafkaCode::UnknownTopicOrPartition)),
            None => Err(Error::Config(format!(
                "manual partitioner requires an explicit partition for topic {}",
                message.topic
            ))),
        }
    }

    fn requires_consistency(&self) -> bool {
        true
    }
}

type BuildFn = dyn Fn(&str) -> Box<dyn Partitioner> + Send + Sync;

/// Builds a fresh [`Partitioner`] for each topic.
#[derive(Clone)]
pub struct PartitionerFactory {
    name: &'static str,
    build: Arc<BuildFn>,
}

impl fmt::Debug for PartitionerFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PartitionerFactory").field(&self.name).finish()
    }
}

impl PartitionerFactory {
    /// A custom partitioner; `build` receives the topic name.
    pub fn new(build: impl Fn(&str) -> Box<dyn Partitioner> + Send + Sync + 'static) -> Self {
        Self {
            name: "custom",
            build: Arc::new(build),
        }
    }

    pub fn hash() -> Self {
        Self {
            name: "hash",
            build: Arc::new(|_| Box::new(HashPartitioner::default())),
        }
    }

    pub fn random() -> Self {
        Self {
            name: "random",
            build: Arc::new(|_| Box::new(RandomPartitioner)),
        }
    }

    pub fn round_robin() -> Self {
        Self {
            name: "roundrobin",
            build: Arc::new(|_| Box::new(RoundRobinPartitioner::default())),
        }
    }

    pub fn manual() -> Self {
        Self {
            name: "manual",
            build: Arc::new(|_| Box::new(ManualPartitioner)),
        }
    }

    /// Look a built-in partitioner up by name.
    pub fn by_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "hash" => Some(Self::hash()),
            "random" => Some(Self::random()),
            "roundrobin" | "round-robin" => Some(Self::round_robin()),
            "manual" => Some(Self::manual()),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn build(&self, topic: &str) -> Box<dyn Partitioner> {
        (self.build)(topic)
    }
}
