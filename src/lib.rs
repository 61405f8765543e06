//! Kafka-backed ordering consenter.
//!
//! One chain driver per channel turns the channel's broker partition into a
//! totally-ordered sequence of blocks. Every orderer replaying the same
//! partition cuts byte-identical blocks at identical offsets.

pub mod broker;
pub mod chain;
pub mod config;
pub mod consenter;
pub mod logging;
pub mod protocol;
pub mod support;

pub use chain::ChainDriver;
pub use consenter::Consenter;
