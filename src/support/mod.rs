//! Contracts the multi-channel manager fulfills for each chain driver.
//!
//! The driver is deliberately ignorant of batching policy and ledger layout:
//! it hands envelopes to the block cutter, turns the returned batches into
//! blocks, and hands those back for writing. Everything here is supplied
//! from outside the crate.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::protocol::Envelope;

/// A deferred action bound to a batch, run at block write time. Carries
/// validation side effects decided at ingress.
pub trait Committer: Send + Sync {
    fn commit(&self);
}

/// Batching policy. `ordered` folds one envelope into the pending batch and
/// returns any batches that became ready, their committer sets, and whether
/// the envelope was accepted. `cut` drains whatever is pending.
pub trait BlockCutter: Send {
    fn ordered(
        &mut self,
        envelope: Envelope,
    ) -> (Vec<Vec<Envelope>>, Vec<Vec<Box<dyn Committer>>>, bool);

    fn cut(&mut self) -> (Vec<Envelope>, Vec<Box<dyn Committer>>);
}

/// Channel-level ordering parameters.
#[derive(Debug, Clone)]
pub struct SharedConfig {
    /// Maximum latency before the driver proposes a cut.
    pub batch_timeout: Duration,
    /// The channel's broker list.
    pub kafka_brokers: Vec<String>,
}

/// A block as the driver assembles it. `metadata` is the orderer-metadata
/// slot; the ledger writer persists it verbatim and serves it back through
/// `handle_chain` on restart.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Block {
    pub number: u64,
    pub envelopes: Vec<Envelope>,
    pub metadata: Vec<u8>,
}

/// Per-channel resources the manager lends to the driver.
pub trait ConsenterSupport: Send + Sync {
    fn chain_id(&self) -> String;

    /// Current ledger height: number of blocks written, genesis included.
    fn height(&self) -> u64;

    fn shared_config(&self) -> SharedConfig;

    fn block_cutter(&self) -> Arc<Mutex<dyn BlockCutter>>;

    fn create_next_block(&self, batch: Vec<Envelope>) -> Block;

    fn write_block(&self, block: Block, committers: Vec<Box<dyn Committer>>, metadata: Vec<u8>);
}
