//! In-process broker backed by tokio channels.
//!
//! Partitions are append-only byte-record logs; producers append, consumers
//! replay from a requested offset and then tail live appends. Delivery per
//! partition is in append order, which is the only broker guarantee the
//! chain driver relies on. Used by the chain tests and for local runs
//! without a broker cluster.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::debug;
use tokio::sync::{mpsc, oneshot, Notify};

use crate::broker::{
    BrokerError, BrokerFactory, ChainPartition, Consumer, ConsumedMessage, Producer,
};
use crate::config::KafkaConfig;

const STREAM_CAPACITY: usize = 1000;

#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    partitions: Mutex<HashMap<String, Arc<PartitionLog>>>,
    closed: AtomicBool,
}

#[derive(Default)]
struct PartitionLog {
    records: Mutex<Vec<Vec<u8>>>,
    appended: Notify,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a partition's records; empty if never materialized.
    pub fn records(&self, partition: &ChainPartition) -> Vec<Vec<u8>> {
        let partitions = self
            .shared
            .partitions
            .lock()
            .expect("partition table lock poisoned");
        match partitions.get(&partition.to_string()) {
            Some(log) => log
                .records
                .lock()
                .expect("partition log lock poisoned")
                .clone(),
            None => vec![],
        }
    }

    /// Simulates losing the cluster: every subsequent publish fails.
    /// Already-created consumers keep replaying what was retained.
    pub fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
    }
}

struct MemoryProducer {
    shared: Arc<Shared>,
}

#[async_trait]
impl Producer for MemoryProducer {
    async fn send(&self, partition: &ChainPartition, payload: Vec<u8>) -> Result<(), BrokerError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        let log = {
            let mut partitions = self
                .shared
                .partitions
                .lock()
                .expect("partition table lock poisoned");
            partitions
                .entry(partition.to_string())
                .or_default()
                .clone()
        };
        let offset = {
            let mut records = log.records.lock().expect("partition log lock poisoned");
            records.push(payload);
            records.len() - 1
        };
        log.appended.notify_waiters();
        debug!("appended record at offset {offset} to {partition}");
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

#[async_trait]
impl BrokerFactory for MemoryBroker {
    fn producer(&self, _brokers: &[String], _config: &KafkaConfig) -> Arc<dyn Producer> {
        Arc::new(MemoryProducer {
            shared: self.shared.clone(),
        })
    }

    async fn consumer(
        &self,
        _brokers: &[String],
        _config: &KafkaConfig,
        partition: ChainPartition,
        start_offset: i64,
    ) -> Result<Consumer, BrokerError> {
        let log = {
            let partitions = self
                .shared
                .partitions
                .lock()
                .expect("partition table lock poisoned");
            partitions
                .get(&partition.to_string())
                .cloned()
                .ok_or_else(|| BrokerError::UnknownPartition(partition.clone()))?
        };

        // Both sentinels resolve to the start of retained history.
        let start = if start_offset < 0 { 0 } else { start_offset as usize };

        let (message_tx, message_rx) = mpsc::channel(STREAM_CAPACITY);
        let (error_tx, error_rx) = mpsc::channel(STREAM_CAPACITY);
        let (close_tx, close_rx) = oneshot::channel();
        tokio::spawn(pump(log, start, message_tx, error_tx, close_rx));

        Ok(Consumer::new(message_rx, error_rx, close_tx))
    }
}

/// Replays `log` from `next` onward, then tails live appends. Ends when the
/// consumer closes, drops its message stream, or the send side is gone.
async fn pump(
    log: Arc<PartitionLog>,
    mut next: usize,
    messages: mpsc::Sender<ConsumedMessage>,
    _errors: mpsc::Sender<BrokerError>,
    mut closed: oneshot::Receiver<()>,
) {
    loop {
        let pending = {
            let records = log.records.lock().expect("partition log lock poisoned");
            records.get(next).cloned()
        };
        match pending {
            Some(value) => {
                let message = ConsumedMessage {
                    offset: next as i64,
                    value,
                };
                tokio::select! {
                    sent = messages.send(message) => {
                        if sent.is_err() {
                            return;
                        }
                        next += 1;
                    }
                    _ = &mut closed => return,
                }
            }
            None => {
                // Register for the wakeup before re-checking, otherwise an
                // append between the check and the wait would be lost.
                let appended = log.appended.notified();
                let caught_up = {
                    let records = log.records.lock().expect("partition log lock poisoned");
                    records.len() <= next
                };
                if !caught_up {
                    continue;
                }
                tokio::select! {
                    () = appended => {}
                    _ = &mut closed => return,
                }
            }
        }
    }
}
