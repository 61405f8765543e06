//! The consenter factory.
//!
//! One per process; the multi-channel manager calls [`Consenter::handle_chain`]
//! for every channel it enumerates, and each call mints an independent
//! [`ChainDriver`]. The factory carries the broker connection parameters and
//! the [`BrokerFactory`] capability so drivers never reach for globals.

use std::sync::Arc;

use log::debug;
use prost::Message;
use thiserror::Error;

use crate::broker::{BrokerFactory, OFFSET_OLDEST};
use crate::chain::ChainDriver;
use crate::config::KafkaConfig;
use crate::protocol::KafkaMetadata;
use crate::support::ConsenterSupport;

#[derive(Error, Debug)]
pub enum ConsenterError {
    /// The ledger tip carries orderer metadata that does not decode. The
    /// channel cannot be resumed safely; the caller decides what to do with
    /// the rest of the process.
    #[error("[channel: {chain_id}] ledger may be corrupted: cannot decode orderer metadata in most recent block")]
    CorruptMetadata {
        chain_id: String,
        #[source]
        source: prost::DecodeError,
    },
}

pub struct Consenter {
    config: KafkaConfig,
    factory: Arc<dyn BrokerFactory>,
}

impl Consenter {
    pub fn new(config: KafkaConfig, factory: Arc<dyn BrokerFactory>) -> Self {
        Self { config, factory }
    }

    /// Builds the chain driver for one channel. `metadata` is the orderer
    /// metadata from the tip of the channel's ledger, absent before the
    /// first block was ever cut.
    pub fn handle_chain(
        &self,
        support: Arc<dyn ConsenterSupport>,
        metadata: Option<&[u8]>,
    ) -> Result<ChainDriver, ConsenterError> {
        let last_offset_persisted = last_offset_persisted(metadata, &support.chain_id())?;
        Ok(ChainDriver::new(
            self.config.clone(),
            self.factory.clone(),
            support,
            last_offset_persisted,
        ))
    }
}

fn last_offset_persisted(
    metadata: Option<&[u8]>,
    chain_id: &str,
) -> Result<i64, ConsenterError> {
    match metadata {
        Some(encoded) => {
            let decoded = KafkaMetadata::decode(encoded).map_err(|source| {
                ConsenterError::CorruptMetadata {
                    chain_id: chain_id.to_string(),
                    source,
                }
            })?;
            debug!(
                "[channel: {chain_id}] resuming from persisted offset {}",
                decoded.last_offset_persisted
            );
            Ok(decoded.last_offset_persisted)
        }
        // Never cut a block: one below the oldest sentinel, so the consumer
        // starts at the beginning of retained history.
        None => Ok(OFFSET_OLDEST - 1),
    }
}
