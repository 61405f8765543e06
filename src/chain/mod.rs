//! The per-channel chain driver.
//!
//! One driver per channel owns a producer handle, a consumer positioned
//! right after the last offset folded into a block, and the batch timer.
//! All ordering state is mutated by a single event-loop task; `enqueue`
//! runs on caller tasks and only ever publishes.
//!
//! Cuts are never taken on local timer expiry. The timer publishes a
//! time-to-cut proposal to the partition, and the cut happens when that
//! proposal is consumed back, so every replica cuts at the same offset
//! regardless of clock drift.

use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use prost::Message;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Sleep};

use crate::broker::{
    BrokerError, BrokerFactory, ChainPartition, Consumer, ConsumedMessage, Producer,
};
use crate::config::KafkaConfig;
use crate::protocol::{self, kafka_message, Envelope, KafkaMessage, KafkaMetadata};
use crate::support::{Committer, ConsenterSupport};


pub struct ChainDriver {
    partition: ChainPartition,
    batch_timeout: Duration,
    last_offset_persisted: i64,
    last_cut_block: u64,
    brokers: Vec<String>,
    config: KafkaConfig,
    factory: Arc<dyn BrokerFactory>,
    support: Arc<dyn ConsenterSupport>,
    producer: Arc<dyn Producer>,

    /// Halt oracle for the enqueue fast path. Written on the shutdown path
    /// only; a stale read is benign because a publish against a halted
    /// broker fails on its own.
    halted: Arc<AtomicBool>,
    exit_tx: watch::Sender<bool>,
    exit_rx: watch::Receiver<bool>,
    halted_tx: Option<watch::Sender<bool>>,
    halted_rx: watch::Receiver<bool>,
    setup_tx: watch::Sender<bool>,
    setup_rx: watch::Receiver<bool>,
}

impl ChainDriver {
    pub(crate) fn new(
        config: KafkaConfig,
        factory: Arc<dyn BrokerFactory>,
        support: Arc<dyn ConsenterSupport>,
        last_offset_persisted: i64,
    ) -> Self {
        let shared = support.shared_config();
        let brokers = if shared.kafka_brokers.is_empty() {
            config.brokers.clone()
        } else {
            shared.kafka_brokers.clone()
        };
        let partition = ChainPartition::new(support.chain_id());
        let last_cut_block = support.height().saturating_sub(1);
        debug!(
            "[channel: {}] starting chain with last persisted offset {last_offset_persisted} and last recorded block {last_cut_block}",
            partition.topic()
        );

        let producer = factory.producer(&brokers, &config);
        let (exit_tx, exit_rx) = watch::channel(false);
        let (halted_tx, halted_rx) = watch::channel(false);
        let (setup_tx, setup_rx) = watch::channel(false);

        Self {
            partition,
            batch_timeout: shared.batch_timeout,
            last_offset_persisted,
            last_cut_block,
            brokers,
            config,
            factory,
            support,
            producer,
            halted: Arc::new(AtomicBool::new(false)),
            exit_tx,
            exit_rx,
            halted_tx: Some(halted_tx),
            halted_rx,
            setup_tx,
            setup_rx,
        }
    }

    /// Allocates the channel's broker resources and spawns the event loop
    /// and the error drain. A failure in either startup gate leaves the
    /// chain halted; the rest of the process keeps running other channels.
    pub async fn start(&mut self) {
        let channel = self.partition.topic().to_string();

        let Some(halted_tx) = self.halted_tx.take() else {
            warn!("[channel: {channel}] chain already started");
            return;
        };

        // 1. Post the connect message first: seeking on a partition the
        // broker has not materialized yet is refused.
        debug!("[channel: {channel}] posting the connect message");
        let connect = protocol::marshal(&protocol::connect_message());
        if let Err(err) = self.producer.send(&self.partition, connect).await {
            error!("[channel: {channel}] cannot post connect message: {err}");
            self.halted.store(true, Ordering::SeqCst);
            self.exit_tx.send_replace(true);
            return;
        }
        debug!("[channel: {channel}] connect message posted successfully");

        // 2. Resume right after the last offset folded into a block.
        let mut consumer = match self
            .factory
            .consumer(
                &self.brokers,
                &self.config,
                self.partition.clone(),
                self.last_offset_persisted + 1,
            )
            .await
        {
            Ok(consumer) => consumer,
            Err(err) => {
                error!("[channel: {channel}] cannot retrieve requested offset from the broker: {err}");
                self.halted.store(true, Ordering::SeqCst);
                self.exit_tx.send_replace(true);
                return;
            }
        };

        // 3. Release anyone waiting on setup completion.
        self.setup_tx.send_replace(true);

        // 4. Consumer errors are logged, never fatal.
        if let Some(errors) = consumer.errors() {
            tokio::spawn(drain_errors(errors, self.exit_rx.clone(), channel));
        }

        // 5. The event loop owns the mutable ordering state from here on.
        let event_loop = EventLoop {
            partition: self.partition.clone(),
            batch_timeout: self.batch_timeout,
            last_offset_persisted: self.last_offset_persisted,
            last_cut_block: self.last_cut_block,
            support: self.support.clone(),
            producer: self.producer.clone(),
            consumer,
            exit: self.exit_rx.clone(),
            halted: self.halted.clone(),
            halted_tx,
        };
        tokio::spawn(event_loop.run());
    }

    /// Accepts a validated envelope for ordering by publishing it to the
    /// channel's partition. Ordering is decided on the consume side, never
    /// here. `false` means the caller must not assume the envelope entered
    /// the stream.
    pub async fn enqueue(&self, envelope: Envelope) -> bool {
        if self.halted.load(Ordering::SeqCst) {
            return false;
        }

        let channel = self.partition.topic();
        debug!("[channel: {channel}] enqueueing envelope");
        let payload = protocol::marshal(&protocol::regular_message(envelope.encode_to_vec()));
        if let Err(err) = self.producer.send(&self.partition, payload).await {
            error!("[channel: {channel}] cannot enqueue envelope: {err}");
            return false;
        }
        debug!("[channel: {channel}] envelope enqueued successfully");

        // A halt can land while the publish is in flight. Report it even
        // though the envelope is already in the broker; that is benign.
        !self.halted.load(Ordering::SeqCst)
    }

    /// Requests shutdown. Idempotent and non-blocking; callers that need the
    /// loop fully drained await [`ChainDriver::halted_signal`].
    pub fn halt(&self) {
        let channel = self.partition.topic();
        if *self.exit_rx.borrow() {
            debug!("[channel: {channel}] halting of chain requested again");
        } else {
            debug!("[channel: {channel}] halting of chain requested");
            self.exit_tx.send_replace(true);
        }
    }

    /// Whether the chain stopped accepting envelopes.
    pub fn halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Resolves once the event loop has drained and released its resources,
    /// or immediately if startup was aborted.
    pub async fn halted_signal(&self) {
        let mut observer = self.halted_rx.clone();
        let _ = observer.wait_for(|halted| *halted).await;
    }

    /// Resolves once startup finished allocating broker resources.
    pub async fn setup_complete(&self) {
        let mut observer = self.setup_rx.clone();
        let _ = observer.wait_for(|ready| *ready).await;
    }
}

/// Resolves when the pending batch timer fires; pends forever while no
/// timer is armed.
async fn armed(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(deadline) => deadline.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn drain_errors(
    mut errors: mpsc::Receiver<BrokerError>,
    mut exit: watch::Receiver<bool>,
    channel: String,
) {
    loop {
        tokio::select! {
            _ = exit.wait_for(|stop| *stop) => return,
            received = errors.recv() => match received {
                Some(err) => error!("[channel: {channel}] consumer error: {err}"),
                None => return,
            }
        }
    }
}

/// The single task allowed to touch ordering state. Everything it owns dies
/// with it; cleanup runs on every exit path.
struct EventLoop {
    partition: ChainPartition,
    batch_timeout: Duration,
    last_offset_persisted: i64,
    last_cut_block: u64,
    support: Arc<dyn ConsenterSupport>,
    producer: Arc<dyn Producer>,
    consumer: Consumer,
    exit: watch::Receiver<bool>,
    halted: Arc<AtomicBool>,
    halted_tx: watch::Sender<bool>,
}

impl EventLoop {
    async fn run(mut self) {
        let channel = self.partition.topic().to_string();
        // At most one pending deadline; None while no batch is accumulating.
        let mut timer: Option<Pin<Box<Sleep>>> = None;

        enum Event {
            Message(Option<ConsumedMessage>),
            TimerFired,
            Exit,
        }

        loop {
            let event = tokio::select! {
                received = self.consumer.recv() => Event::Message(received),
                () = armed(&mut timer) => Event::TimerFired,
                _ = self.exit.wait_for(|stop| *stop) => Event::Exit,
            };

            match event {
                Event::Message(Some(message)) => {
                    if self.on_message(message, &mut timer).is_break() {
                        break;
                    }
                }
                Event::Message(None) => {
                    warn!("[channel: {channel}] consumer stream ended");
                    break;
                }
                Event::TimerFired => {
                    timer = None;
                    self.propose_cut().await;
                }
                Event::Exit => {
                    info!("[channel: {channel}] consenter for channel exiting");
                    break;
                }
            }
        }

        debug!(
            "[channel: {channel}] event loop stopping at block {} / offset {}",
            self.last_cut_block, self.last_offset_persisted
        );

        // Release in reverse acquisition order; failures are log-only.
        self.consumer.close();
        if let Err(err) = self.producer.close().await {
            error!("[channel: {channel}] error closing producer: {err}");
        }
        self.halted.store(true, Ordering::SeqCst);
        self.halted_tx.send_replace(true);
    }

    fn on_message(
        &mut self,
        message: ConsumedMessage,
        timer: &mut Option<Pin<Box<Sleep>>>,
    ) -> ControlFlow<()> {
        let channel = self.partition.topic().to_string();
        let decoded = match KafkaMessage::decode(message.value.as_slice()) {
            Ok(decoded) => decoded,
            Err(err) => {
                // Everything on the partition was framed by an orderer, so
                // this cannot happen under the protocol's invariants.
                error!("[channel: {channel}] unable to decode consumed message: {err}");
                return ControlFlow::Continue(());
            }
        };

        match decoded.r#type {
            Some(kafka_message::Type::Connect(_)) => {
                debug!("[channel: {channel}] it's a connect message - ignoring");
                ControlFlow::Continue(())
            }
            Some(kafka_message::Type::TimeToCut(proposal)) => {
                self.on_time_to_cut(proposal.block_number, message.offset, timer)
            }
            Some(kafka_message::Type::Regular(regular)) => {
                self.on_regular(&regular.payload, message.offset, timer);
                ControlFlow::Continue(())
            }
            None => {
                // Framed by a newer orderer; skipping keeps the stream
                // forward compatible.
                debug!("[channel: {channel}] unrecognized message variant - ignoring");
                ControlFlow::Continue(())
            }
        }
    }

    fn on_regular(
        &mut self,
        payload: &[u8],
        offset: i64,
        timer: &mut Option<Pin<Box<Sleep>>>,
    ) {
        let channel = self.partition.topic().to_string();
        let envelope = match Envelope::decode(payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                // Should have been filtered at broadcast ingress.
                error!("[channel: {channel}] unable to decode payload of regular message: {err}");
                return;
            }
        };

        let cutter = self.support.block_cutter();
        let (batches, committers, accepted) = cutter
            .lock()
            .expect("block cutter lock poisoned")
            .ordered(envelope);
        debug!(
            "[channel: {channel}] ordering results: {} batch(es), accepted = {accepted}",
            batches.len()
        );

        if accepted && batches.is_empty() && timer.is_none() {
            *timer = Some(Box::pin(sleep(self.batch_timeout)));
            debug!(
                "[channel: {channel}] just began {:?} batch timer",
                self.batch_timeout
            );
            return;
        }

        // A rejected envelope comes back with no batches, so this is a no-op.
        let cut_any = !batches.is_empty();
        for (batch, batch_committers) in batches.into_iter().zip(committers) {
            self.write_block(batch, batch_committers, offset);
            debug!(
                "[channel: {channel}] batch filled, just cut block {}",
                self.last_cut_block
            );
        }
        if cut_any {
            *timer = None;
        }
    }

    fn on_time_to_cut(
        &mut self,
        block_number: u64,
        offset: i64,
        timer: &mut Option<Pin<Box<Sleep>>>,
    ) -> ControlFlow<()> {
        let channel = self.partition.topic().to_string();
        debug!("[channel: {channel}] it's a time-to-cut message for block {block_number}");

        if block_number == self.last_cut_block + 1 {
            *timer = None;
            let cutter = self.support.block_cutter();
            let (batch, committers) = cutter
                .lock()
                .expect("block cutter lock poisoned")
                .cut();
            if batch.is_empty() {
                warn!(
                    "[channel: {channel}] got right time-to-cut message (for block {block_number}), no pending requests though; this might indicate a bug"
                );
                info!("[channel: {channel}] consenter for channel exiting");
                return ControlFlow::Break(());
            }
            self.write_block(batch, committers, offset);
            debug!(
                "[channel: {channel}] proper time-to-cut received, just cut block {}",
                self.last_cut_block
            );
            ControlFlow::Continue(())
        } else if block_number > self.last_cut_block + 1 {
            warn!(
                "[channel: {channel}] got larger time-to-cut message ({block_number}) than allowed ({}) - this might indicate a bug",
                self.last_cut_block + 1
            );
            info!("[channel: {channel}] consenter for channel exiting");
            ControlFlow::Break(())
        } else {
            debug!("[channel: {channel}] ignoring stale time-to-cut message for block {block_number}");
            ControlFlow::Continue(())
        }
    }

    /// Synthesizes and persists one block, stamping the offset whose
    /// consumption triggered the cut.
    fn write_block(
        &mut self,
        batch: Vec<Envelope>,
        committers: Vec<Box<dyn Committer>>,
        offset: i64,
    ) {
        let block = self.support.create_next_block(batch);
        let metadata = protocol::marshal(&KafkaMetadata {
            last_offset_persisted: offset,
        });
        self.support.write_block(block, committers, metadata);
        self.last_cut_block += 1;
        self.last_offset_persisted = offset;
    }

    /// Serializes the cut decision through the partition instead of cutting
    /// locally: every replica then observes it at the same offset, wherever
    /// its own timer happened to be.
    async fn propose_cut(&mut self) {
        let channel = self.partition.topic();
        debug!(
            "[channel: {channel}] time-to-cut block {} timer expired",
            self.last_cut_block + 1
        );
        let proposal = protocol::marshal(&protocol::time_to_cut_message(self.last_cut_block + 1));
        if let Err(err) = self.producer.send(&self.partition, proposal).await {
            // Not fatal: the next consumed envelope restarts the cycle.
            error!("[channel: {channel}] cannot post time-to-cut message: {err}");
        }
    }
}
