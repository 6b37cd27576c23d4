//! Group dispatcher
//!
//! Routes each inbound message onto one of N worker queues by a stable
//! hash of its routing key, so all messages of one group land on the same
//! worker and stay totally ordered. A global in-flight cap rejects
//! deliveries immediately instead of blocking; upstream retries.

use chatmem_config::DispatcherConfig;
use chatmem_core::RawMessage;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::memorize::ProcessOutcome;
use crate::PipelineError;

/// Something that can process one inbound message to completion
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process(&self, message: &RawMessage) -> Result<ProcessOutcome, PipelineError>;
}

/// Stable routing: the same key always maps to the same queue
pub fn route_key(key: &str, num_queues: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % num_queues.max(1) as u64) as usize
}

/// Outcome of a delivery attempt
pub enum DeliveryStatus {
    /// Enqueued; the receiver resolves with the pipeline outcome
    Accepted(oneshot::Receiver<Result<ProcessOutcome, PipelineError>>),
    /// Global in-flight cap reached (or dispatcher draining)
    Rejected,
}

struct Delivery {
    message: RawMessage,
    reply: oneshot::Sender<Result<ProcessOutcome, PipelineError>>,
}

/// Rolling event counter over per-event timestamps, pruned past 5 minutes
struct RollingCounter {
    events: Mutex<VecDeque<Instant>>,
}

impl RollingCounter {
    fn new() -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
        }
    }

    fn record(&self) {
        let mut events = self.events.lock();
        let now = Instant::now();
        events.push_back(now);
        let horizon = now - Duration::from_secs(300);
        while events.front().is_some_and(|t| *t < horizon) {
            events.pop_front();
        }
    }

    fn count_within(&self, window: Duration) -> u64 {
        let events = self.events.lock();
        let cutoff = Instant::now() - window;
        events.iter().rev().take_while(|t| **t >= cutoff).count() as u64
    }
}

struct QueueStats {
    delivered: RollingCounter,
    consumed: RollingCounter,
    depth: AtomicUsize,
    max_depth: AtomicUsize,
    rejects: AtomicU64,
}

impl QueueStats {
    fn new() -> Self {
        Self {
            delivered: RollingCounter::new(),
            consumed: RollingCounter::new(),
            depth: AtomicUsize::new(0),
            max_depth: AtomicUsize::new(0),
            rejects: AtomicU64::new(0),
        }
    }
}

/// Point-in-time view of one worker queue
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueStatsSnapshot {
    pub queue_index: usize,
    pub depth: usize,
    pub max_depth: usize,
    pub delivered_1m: u64,
    pub delivered_5m: u64,
    pub consumed_1m: u64,
    pub consumed_5m: u64,
    pub rejects: u64,
}

/// Hash-routing dispatcher with a global in-flight cap
pub struct GroupDispatcher {
    config: DispatcherConfig,
    senders: Vec<mpsc::UnboundedSender<Delivery>>,
    receivers: Mutex<Option<Vec<mpsc::UnboundedReceiver<Delivery>>>>,
    processor: Arc<dyn MessageProcessor>,
    in_flight: Arc<AtomicUsize>,
    accepting: AtomicBool,
    started: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stats: Vec<Arc<QueueStats>>,
}

impl GroupDispatcher {
    pub fn new(config: DispatcherConfig, processor: Arc<dyn MessageProcessor>) -> Self {
        let num_queues = config.num_queues.max(1);
        let mut senders = Vec::with_capacity(num_queues);
        let mut receivers = Vec::with_capacity(num_queues);
        let mut stats = Vec::with_capacity(num_queues);
        for _ in 0..num_queues {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(tx);
            receivers.push(rx);
            stats.push(Arc::new(QueueStats::new()));
        }

        Self {
            config,
            senders,
            receivers: Mutex::new(Some(receivers)),
            processor,
            in_flight: Arc::new(AtomicUsize::new(0)),
            accepting: AtomicBool::new(true),
            started: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
            stats,
        }
    }

    /// Spawn the worker loops. Idempotent: a second call is a no-op.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            tracing::debug!("dispatcher already started, ignoring");
            return;
        }

        let receivers = self
            .receivers
            .lock()
            .take()
            .expect("receivers present on first start");

        let mut workers = self.workers.lock();
        for (index, mut rx) in receivers.into_iter().enumerate() {
            let processor = self.processor.clone();
            let in_flight = self.in_flight.clone();
            let stats = self.stats[index].clone();

            workers.push(tokio::spawn(async move {
                while let Some(delivery) = rx.recv().await {
                    stats.depth.fetch_sub(1, Ordering::SeqCst);
                    stats.consumed.record();

                    // Errors stop at the loop boundary: one bad message
                    // must not kill the worker
                    let result = processor.process(&delivery.message).await;
                    if let Err(ref e) = result {
                        tracing::warn!(
                            queue = index,
                            message_id = %delivery.message.message_id,
                            error = %e,
                            "pipeline failed for message"
                        );
                        metrics::counter!("chatmem_pipeline_failures_total").increment(1);
                    }

                    // Free the slot before replying so a caller that saw
                    // its reply can immediately deliver again
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    let _ = delivery.reply.send(result);
                }
                tracing::debug!(queue = index, "worker loop finished");
            }));
        }

        tracing::info!(queues = self.senders.len(), "dispatcher started");
    }

    /// Deliver one message. Rejected deliveries return immediately without
    /// blocking.
    pub fn deliver(&self, message: RawMessage) -> DeliveryStatus {
        let index = route_key(message.routing_key(), self.senders.len());
        let stats = &self.stats[index];

        if !self.accepting.load(Ordering::SeqCst) {
            stats.rejects.fetch_add(1, Ordering::SeqCst);
            return DeliveryStatus::Rejected;
        }

        // Reserve an in-flight slot; give it back if the cap was hit
        let previous = self.in_flight.fetch_add(1, Ordering::SeqCst);
        if previous >= self.config.max_total_messages {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            stats.rejects.fetch_add(1, Ordering::SeqCst);
            metrics::counter!("chatmem_dispatcher_rejects_total").increment(1);
            tracing::warn!(
                in_flight = previous,
                cap = self.config.max_total_messages,
                "dispatcher over capacity, rejecting"
            );
            return DeliveryStatus::Rejected;
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let delivery = Delivery {
            message,
            reply: reply_tx,
        };

        // Count the depth before handing off; the worker decrements it as
        // soon as it picks the delivery up
        let depth = stats.depth.fetch_add(1, Ordering::SeqCst) + 1;
        stats.max_depth.fetch_max(depth, Ordering::SeqCst);

        if self.senders[index].send(delivery).is_err() {
            // Worker gone (hard shutdown); count as a reject
            stats.depth.fetch_sub(1, Ordering::SeqCst);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            stats.rejects.fetch_add(1, Ordering::SeqCst);
            return DeliveryStatus::Rejected;
        }

        stats.delivered.record();
        metrics::counter!("chatmem_dispatcher_delivered_total").increment(1);

        DeliveryStatus::Accepted(reply_rx)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Per-queue observability snapshot
    pub fn queue_stats(&self) -> Vec<QueueStatsSnapshot> {
        self.stats
            .iter()
            .enumerate()
            .map(|(queue_index, s)| QueueStatsSnapshot {
                queue_index,
                depth: s.depth.load(Ordering::SeqCst),
                max_depth: s.max_depth.load(Ordering::SeqCst),
                delivered_1m: s.delivered.count_within(Duration::from_secs(60)),
                delivered_5m: s.delivered.count_within(Duration::from_secs(300)),
                consumed_1m: s.consumed.count_within(Duration::from_secs(60)),
                consumed_5m: s.consumed.count_within(Duration::from_secs(300)),
                rejects: s.rejects.load(Ordering::SeqCst),
            })
            .collect()
    }

    /// Soft shutdown: refuse new deliveries and wait for in-flight work to
    /// drain, up to the configured delay. Returns whether the drain
    /// completed.
    pub async fn shutdown_soft(&self) -> bool {
        self.accepting.store(false, Ordering::SeqCst);
        let deadline = Instant::now() + Duration::from_secs(self.config.max_delay_seconds);

        while self.in_flight.load(Ordering::SeqCst) > 0 {
            if Instant::now() >= deadline {
                tracing::warn!(
                    remaining = self.in_flight.load(Ordering::SeqCst),
                    "soft shutdown deadline reached with work in flight"
                );
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        tracing::info!("dispatcher drained");
        true
    }

    /// Hard shutdown: cancel every worker immediately. In-flight messages
    /// are lost; upstream retries.
    pub fn shutdown_hard(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        let mut workers = self.workers.lock();
        for worker in workers.drain(..) {
            worker.abort();
        }
        tracing::info!("dispatcher workers aborted");
    }
}
