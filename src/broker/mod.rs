//! Narrow contracts over the message broker.
//!
//! The chain driver never talks to a broker client directly; it publishes
//! through a [`Producer`] and consumes through a [`Consumer`] built by a
//! [`BrokerFactory`]. Swapping the factory swaps the transport, which is how
//! the tests run every chain against [`memory::MemoryBroker`].

use std::fmt::Display;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::config::KafkaConfig;

pub mod memory;

/// Partition index every channel is pinned to. One partition per channel is
/// a design invariant: the partition is the channel's total order, and a
/// second partition would split it.
pub const RAW_PARTITION: i32 = 0;

/// Sentinel offset: the next record to be produced.
pub const OFFSET_NEWEST: i64 = -1;
/// Sentinel offset: the start of retained history.
pub const OFFSET_OLDEST: i64 = -2;

/// The broker partition backing a channel: topic named after the channel,
/// partition pinned to [`RAW_PARTITION`]. Immutable for the lifetime of the
/// chain driver.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChainPartition {
    channel_id: String,
    partition: i32,
}

impl ChainPartition {
    pub fn new(channel_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            partition: RAW_PARTITION,
        }
    }

    pub fn topic(&self) -> &str {
        &self.channel_id
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }
}

impl Display for ChainPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.channel_id, self.partition)
    }
}

/// A record delivered from a partition, in partition order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedMessage {
    pub offset: i64,
    pub value: Vec<u8>,
}

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("partition {0} is not materialized on the broker")]
    UnknownPartition(ChainPartition),
    #[error("broker connection closed")]
    Closed,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Publish side of the partition. The adapter owns retries; callers treat a
/// returned error as final.
#[async_trait]
pub trait Producer: Send + Sync {
    async fn send(&self, partition: &ChainPartition, payload: Vec<u8>) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Consume side of the partition: a message stream and an error stream,
/// starting from a requested offset. Built by a [`BrokerFactory`]; the
/// backing task stops when [`Consumer::close`] fires or both streams are
/// dropped.
#[derive(Debug)]
pub struct Consumer {
    messages: mpsc::Receiver<ConsumedMessage>,
    errors: Option<mpsc::Receiver<BrokerError>>,
    closer: Option<oneshot::Sender<()>>,
}

impl Consumer {
    pub fn new(
        messages: mpsc::Receiver<ConsumedMessage>,
        errors: mpsc::Receiver<BrokerError>,
        closer: oneshot::Sender<()>,
    ) -> Self {
        Self {
            messages,
            errors: Some(errors),
            closer: Some(closer),
        }
    }

    /// Next record in partition order; `None` once the backend is gone.
    pub async fn recv(&mut self) -> Option<ConsumedMessage> {
        self.messages.recv().await
    }

    /// Hands out the error stream. Yields once; the stream is meant to be
    /// moved into a dedicated drain task.
    pub fn errors(&mut self) -> Option<mpsc::Receiver<BrokerError>> {
        self.errors.take()
    }

    pub fn close(&mut self) {
        if let Some(closer) = self.closer.take() {
            let _ = closer.send(());
        }
    }
}

/// Capability object carrying the broker, producer and consumer
/// constructors. Passed by reference to every chain driver so tests can
/// substitute transports without global state.
#[async_trait]
pub trait BrokerFactory: Send + Sync {
    fn producer(&self, brokers: &[String], config: &KafkaConfig) -> std::sync::Arc<dyn Producer>;

    /// Builds a consumer positioned at `start_offset`. Fails when the
    /// partition has not been materialized yet, which is why startup posts a
    /// connect message first.
    async fn consumer(
        &self,
        brokers: &[String],
        config: &KafkaConfig,
        partition: ChainPartition,
        start_offset: i64,
    ) -> Result<Consumer, BrokerError>;
}
