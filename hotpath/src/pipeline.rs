//! Order stream pipeline.
//!
//! Admitted purchases are appended to a durable stream. A fixed set of
//! long-lived workers (`consumer-0`, `consumer-1`, ...) in one consumer group
//! read them, materialize each one and acknowledge only after the store
//! transaction committed. Every read first drains the worker's own pending
//! list, so anything delivered before a crash is retried before new work.
//!
//! Messages that cannot succeed without an operator (malformed intents, stock
//! desync) are parked: logged at error level, left unacknowledged and skipped
//! by later reads of this process until [`OrderStreamPipeline::unpark`].

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn, Instrument};

use crate::backend::{ConsumerStats, ReadCursor, StreamGroup, StreamLog, StreamMessage};
use crate::config::StreamConfig;
use crate::errors::{PipelineError, PipelineResult};
use crate::intent::OrderIntent;
use crate::materializer::{MaterializeOutcome, OrderMaterializer};
use crate::timeout::bounded;
use crate::types::{ConsumerName, MessageId};

/// Operator view of the stream and the group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamInfo {
    /// Stream key
    pub stream_key: String,
    /// Consumer group
    pub group: String,
    /// Messages in the stream
    pub length: u64,
    /// Delivered but unacknowledged messages
    pub pending: u64,
    /// Last id delivered to the group
    pub last_delivered: Option<MessageId>,
    /// Per-consumer pending counts
    pub consumers: Vec<ConsumerStats>,
    /// Messages parked for intervention by this process
    pub parked: Vec<MessageId>,
    /// Whether workers are running
    pub running: bool,
}

/// What a worker does after handling one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Next {
    Continue,
    Backoff,
}

struct Shared {
    log: Arc<dyn StreamLog>,
    materializer: Arc<OrderMaterializer>,
    config: StreamConfig,
    group: StreamGroup,
    call_timeout: Duration,
    parked: Mutex<HashSet<MessageId>>,
}

/// Durable order queue with a fixed pool of consumer-group workers.
pub struct OrderStreamPipeline {
    shared: Arc<Shared>,
    is_running: AtomicBool,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for OrderStreamPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderStreamPipeline")
            .field("group", &self.shared.group)
            .field("is_running", &self.is_running.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl OrderStreamPipeline {
    /// Creates a stopped pipeline.
    pub fn new(
        log: Arc<dyn StreamLog>,
        materializer: Arc<OrderMaterializer>,
        config: StreamConfig,
        call_timeout: Duration,
    ) -> Self {
        let group = StreamGroup::new(config.stream_key.clone(), config.group.clone());
        Self {
            shared: Arc::new(Shared {
                log,
                materializer,
                config,
                group,
                call_timeout,
                parked: Mutex::new(HashSet::new()),
            }),
            is_running: AtomicBool::new(false),
            shutdown: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// The stream and group this pipeline consumes.
    pub fn group(&self) -> &StreamGroup {
        &self.shared.group
    }

    /// Whether workers are running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Appends `intent` to the stream.
    ///
    /// Admission appends atomically as part of its evaluation; this is the
    /// entry point for replays and tooling.
    #[instrument(skip(self))]
    pub async fn publish(&self, intent: OrderIntent) -> PipelineResult<MessageId> {
        let shared = &self.shared;
        let id = bounded(
            shared.call_timeout,
            shared.log.append(&shared.group.stream, intent.to_fields()),
        )
        .await?;
        debug!(message_id = %id, "order intent published");
        Ok(id)
    }

    /// Next batch for `consumer`: its own pending messages first, then
    /// messages claimed from idle consumers, then new messages.
    pub async fn read_batch(&self, consumer: &ConsumerName) -> PipelineResult<Vec<StreamMessage>> {
        self.shared.read_batch(consumer).await
    }

    /// Acknowledges `id`. Fails with [`PipelineError::NotPending`] when the
    /// group holds no such pending message.
    pub async fn ack(&self, id: MessageId) -> PipelineResult<()> {
        self.shared.ack(id).await
    }

    /// Snapshot of the stream, the group and the parked set.
    pub async fn info(&self) -> PipelineResult<StreamInfo> {
        let shared = &self.shared;
        let stats = bounded(shared.call_timeout, shared.log.stats(&shared.group)).await?;
        let mut parked: Vec<MessageId> = shared.parked.lock().iter().copied().collect();
        parked.sort_unstable();
        Ok(StreamInfo {
            stream_key: shared.group.stream.clone(),
            group: shared.group.group.clone(),
            length: stats.length,
            pending: stats.pending,
            last_delivered: stats.last_delivered,
            consumers: stats.consumers,
            parked,
            running: self.is_running(),
        })
    }

    /// Releases a parked message so workers retry it.
    pub fn unpark(&self, id: MessageId) -> bool {
        let released = self.shared.parked.lock().remove(&id);
        if released {
            info!(message_id = %id, "parked order intent released for retry");
        }
        released
    }

    /// Creates the group if needed and spawns the workers.
    #[instrument(skip(self))]
    pub async fn start(&self) -> PipelineResult<()> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(PipelineError::AlreadyRunning);
        }

        let shared = &self.shared;
        match bounded(shared.call_timeout, shared.log.ensure_group(&shared.group)).await {
            Ok(true) => info!(group = %shared.group.group, "consumer group created"),
            Ok(false) => debug!(group = %shared.group.group, "consumer group exists"),
            Err(e) => {
                self.is_running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        }

        let (tx, rx) = watch::channel(false);
        let count: usize = shared.config.consumers.into_inner();
        let mut handles = Vec::with_capacity(count);
        for i in 0..count {
            let raw = format!("{}-{i}", shared.config.consumer_prefix);
            let consumer = match ConsumerName::try_new(raw.clone()) {
                Ok(name) => name,
                Err(e) => {
                    warn!(consumer = %raw, error = %e, "invalid consumer name, worker skipped");
                    continue;
                }
            };
            let span = tracing::info_span!("stream_consumer", consumer = %consumer);
            handles.push(tokio::spawn(
                run_worker(Arc::clone(shared), consumer, rx.clone()).instrument(span),
            ));
        }

        info!(
            stream = %shared.group.stream,
            workers = handles.len(),
            "order stream pipeline started"
        );
        *self.shutdown.lock() = Some(tx);
        *self.workers.lock() = handles;
        Ok(())
    }

    /// Signals the workers and waits for them.
    ///
    /// A worker finishes the message it is handling; the rest of its batch
    /// stays pending and is redelivered on the next start.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> PipelineResult<()> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PipelineError::NotRunning);
        }

        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(true);
        }
        let handles = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "stream consumer panicked");
            }
        }

        self.is_running.store(false, Ordering::SeqCst);
        info!("order stream pipeline stopped");
        Ok(())
    }
}

impl Shared {
    fn batch_size(&self) -> usize {
        self.config.batch_size.into_inner()
    }

    fn unparked(&self, messages: Vec<StreamMessage>) -> Vec<StreamMessage> {
        let parked = self.parked.lock();
        messages
            .into_iter()
            .filter(|m| !parked.contains(&m.id))
            .collect()
    }

    async fn read_batch(&self, consumer: &ConsumerName) -> PipelineResult<Vec<StreamMessage>> {
        let count = self.batch_size();

        let mut after = None;
        loop {
            let page = bounded(
                self.call_timeout,
                self.log.read_group(
                    &self.group,
                    consumer,
                    ReadCursor::Pending { after },
                    count,
                    Duration::ZERO,
                ),
            )
            .await?;
            let full = page.len() >= count;
            after = page.last().map(|m| m.id);
            let ready = self.unparked(page);
            if !ready.is_empty() {
                return Ok(ready);
            }
            if !full {
                break;
            }
        }

        let claimed = bounded(
            self.call_timeout,
            self.log
                .claim_idle(&self.group, consumer, self.config.claim_min_idle, count),
        )
        .await?;
        let claimed = self.unparked(claimed);
        if !claimed.is_empty() {
            info!(consumer = %consumer, claimed = claimed.len(), "claimed messages from idle consumers");
            return Ok(claimed);
        }

        let fresh = bounded(
            self.call_timeout + self.config.block,
            self.log.read_group(
                &self.group,
                consumer,
                ReadCursor::New,
                count,
                self.config.block,
            ),
        )
        .await?;
        Ok(fresh)
    }

    async fn ack(&self, id: MessageId) -> PipelineResult<()> {
        let acked = bounded(self.call_timeout, self.log.ack(&self.group, &[id])).await?;
        if acked == 0 {
            return Err(PipelineError::NotPending(id));
        }
        Ok(())
    }

    async fn handle(&self, message: StreamMessage) -> Next {
        let intent = match OrderIntent::from_fields(&message.fields) {
            Ok(intent) => intent,
            Err(e) => {
                self.park(&message, &e);
                return Next::Continue;
            }
        };

        match self.materializer.materialize(&intent).await {
            Ok(outcome) => {
                if let MaterializeOutcome::AlreadyMaterialized = outcome {
                    debug!(message_id = %message.id, "redelivered intent already materialized");
                }
                if let Err(e) = self.ack(message.id).await {
                    warn!(message_id = %message.id, error = %e, "ack failed, message will be redelivered");
                }
                Next::Continue
            }
            Err(e) if e.requires_intervention() => {
                self.park(&message, &e);
                Next::Continue
            }
            Err(e) => {
                warn!(
                    message_id = %message.id,
                    delivery_count = message.delivery_count,
                    error = %e,
                    "materialization failed, message stays pending"
                );
                Next::Backoff
            }
        }
    }

    fn park(&self, message: &StreamMessage, reason: &dyn std::error::Error) {
        self.parked.lock().insert(message.id);
        error!(
            message_id = %message.id,
            delivery_count = message.delivery_count,
            error = %reason,
            "order intent parked for operator intervention"
        );
    }
}

async fn run_worker(shared: Arc<Shared>, consumer: ConsumerName, mut shutdown: watch::Receiver<bool>) {
    info!("stream consumer started");

    'outer: while !*shutdown.borrow() {
        let batch = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            batch = shared.read_batch(&consumer) => batch,
        };

        let messages = match batch {
            Ok(messages) => messages,
            Err(e) => {
                warn!(error = %e, "stream read failed");
                pause(&mut shutdown, shared.config.error_backoff).await;
                continue;
            }
        };

        if messages.is_empty() {
            pause(&mut shutdown, shared.config.idle_sleep).await;
            continue;
        }

        for message in messages {
            if *shutdown.borrow() {
                debug!("shutdown requested, rest of batch stays pending");
                break 'outer;
            }
            if shared.handle(message).await == Next::Backoff {
                pause(&mut shutdown, shared.config.error_backoff).await;
                break;
            }
        }
    }

    info!("stream consumer stopped");
}

async fn pause(shutdown: &mut watch::Receiver<bool>, duration: Duration) {
    tokio::select! {
        () = tokio::time::sleep(duration) => {}
        _ = shutdown.changed() => {}
    }
}
