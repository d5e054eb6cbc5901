//! Sharded dispatch pool.
//!
//! Packets are spread over N bounded queues by a monotonic push counter;
//! each worker task owns one shard and processes it in FIFO order. There
//! is no ordering guarantee across shards.

use crate::error::CoreError;
use crate::processor::{DispatchContext, ProcessorRegistry};
use crate::registry::ConnectionRegistry;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use wirebus_protocol::{Packet, Payload};

/// Dispatch pool options.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker tasks (and shards), at least 1.
    pub worker_count: usize,
    /// Bounded capacity of each shard queue.
    pub shard_capacity: usize,
    /// When false, `push` dispatches inline on the caller's task.
    pub queueing: bool,
    /// How long a worker waits on its shard before re-checking liveness.
    pub poll_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            shard_capacity: 256,
            queueing: true,
            poll_timeout: Duration::from_secs(60),
        }
    }
}

impl PoolConfig {
    pub fn with_workers(mut self, count: usize) -> Self {
        self.worker_count = count.max(1);
        self
    }

    pub fn with_shard_capacity(mut self, capacity: usize) -> Self {
        self.shard_capacity = capacity.max(1);
        self
    }

    pub fn without_queueing(mut self) -> Self {
        self.queueing = false;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }
}

/// The bounded shard queues plus the push cursor.
///
/// Receivers sit behind async mutexes so extra workers can later bind to
/// the existing shard set; growing never adds shards.
pub(crate) struct ShardSet {
    senders: Vec<mpsc::Sender<Packet>>,
    receivers: Vec<Arc<AsyncMutex<mpsc::Receiver<Packet>>>>,
    push_counter: AtomicU64,
}

impl ShardSet {
    pub(crate) fn new(shards: usize, capacity: usize) -> Self {
        let mut senders = Vec::with_capacity(shards);
        let mut receivers = Vec::with_capacity(shards);
        for _ in 0..shards {
            let (tx, rx) = mpsc::channel(capacity);
            senders.push(tx);
            receivers.push(Arc::new(AsyncMutex::new(rx)));
        }
        Self {
            senders,
            receivers,
            push_counter: AtomicU64::new(0),
        }
    }

    /// Enqueues onto the next shard in rotation, awaiting capacity.
    pub(crate) async fn push(&self, packet: Packet) -> Result<(), CoreError> {
        let shard = (self.push_counter.fetch_add(1, Ordering::Relaxed)
            % self.senders.len() as u64) as usize;
        self.senders[shard]
            .send(packet)
            .await
            .map_err(|_| CoreError::QueueClosed)
    }

    pub(crate) fn receiver(&self, shard: usize) -> Arc<AsyncMutex<mpsc::Receiver<Packet>>> {
        self.receivers[shard].clone()
    }

    pub(crate) fn shard_count(&self) -> usize {
        self.senders.len()
    }
}

/// Sharded dispatch pool.
///
/// Resolves each packet's processor, invokes it, and, when built with a
/// connection registry, sends any non-empty result back as a response
/// packet. Handler failures are logged and the packet dropped; a worker
/// never dies from one.
pub struct ProcessorPool {
    processors: Arc<ProcessorRegistry>,
    registry: Option<Arc<ConnectionRegistry>>,
    shards: Option<Arc<ShardSet>>,
    running: Arc<AtomicBool>,
    worker_seq: AtomicUsize,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    poll_timeout: Duration,
}

impl ProcessorPool {
    /// Builds the pool and, when queueing is enabled, starts its workers.
    ///
    /// `registry` routes responses; a pool built without one (the client
    /// side) drops handler results.
    pub fn new(
        config: PoolConfig,
        processors: Arc<ProcessorRegistry>,
        registry: Option<Arc<ConnectionRegistry>>,
    ) -> Arc<Self> {
        let shards = config
            .queueing
            .then(|| Arc::new(ShardSet::new(config.worker_count.max(1), config.shard_capacity)));

        let pool = Arc::new(Self {
            processors,
            registry,
            shards,
            running: Arc::new(AtomicBool::new(true)),
            worker_seq: AtomicUsize::new(0),
            workers: parking_lot::Mutex::new(Vec::new()),
            poll_timeout: config.poll_timeout,
        });

        if pool.shards.is_some() {
            pool.spawn_workers(config.worker_count.max(1));
        }
        pool
    }

    fn spawn_workers(self: &Arc<Self>, count: usize) {
        let Some(shards) = self.shards.clone() else { return };
        let mut workers = self.workers.lock();
        for _ in 0..count {
            let shard = self.worker_seq.fetch_add(1, Ordering::Relaxed) % shards.shard_count();
            let receiver = shards.receiver(shard);
            let pool = Arc::clone(self);
            workers.push(tokio::spawn(Self::worker_loop(pool, shard, receiver)));
        }
    }

    /// Starts additional workers over the existing shard set.
    pub fn grow(self: &Arc<Self>, additional: usize) {
        self.spawn_workers(additional);
    }

    async fn worker_loop(
        pool: Arc<ProcessorPool>,
        shard: usize,
        receiver: Arc<AsyncMutex<mpsc::Receiver<Packet>>>,
    ) {
        tracing::debug!("dispatch worker started on shard {}", shard);

        while pool.running.load(Ordering::Acquire) {
            let polled = tokio::time::timeout(pool.poll_timeout, async {
                receiver.lock().await.recv().await
            })
            .await;

            match polled {
                Ok(Some(packet)) => pool.dispatch(packet),
                Ok(None) => break,
                Err(_) => continue, // poll timeout, loop re-checks running
            }
        }
        tracing::debug!("dispatch worker on shard {} stopped", shard);
    }

    /// Hands a packet to the pool.
    ///
    /// With queueing enabled this blocks on a full shard until a worker
    /// drains an entry; with queueing disabled it dispatches inline.
    pub async fn push(&self, packet: Packet) -> Result<(), CoreError> {
        match &self.shards {
            Some(shards) => shards.push(packet).await,
            None => {
                self.dispatch(packet);
                Ok(())
            }
        }
    }

    /// Resolves and invokes the packet's processor.
    pub fn dispatch(&self, packet: Packet) {
        let Some(processor) = self.processors.get(&packet.processor) else {
            tracing::warn!(
                "no processor for '{}', dropping request {}",
                packet.processor,
                packet.request_id
            );
            return;
        };

        let ctx = DispatchContext::new(self.registry.clone(), packet.connection_id.clone());
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            processor.handle(&ctx, &packet.request_id, &packet.method, &packet.payload)
        }));

        match outcome {
            Ok(Ok(Some(result))) => self.respond(&packet, result),
            Ok(Ok(None)) => {}
            Ok(Err(e)) => tracing::error!(
                "processor '{}' failed for request {}: {}",
                packet.processor,
                packet.request_id,
                e
            ),
            Err(_) => tracing::error!(
                "processor '{}' panicked on request {}",
                packet.processor,
                packet.request_id
            ),
        }
    }

    fn respond(&self, packet: &Packet, result: Payload) {
        let Some(registry) = &self.registry else { return };
        let Some(conn) = registry.get(&packet.connection_id) else {
            tracing::warn!(
                "connection '{}' gone, dropping response to {}",
                packet.connection_id,
                packet.request_id
            );
            return;
        };
        if let Err(e) = conn.send(&packet.response(result)) {
            tracing::warn!("response send failed on '{}': {}", packet.connection_id, e);
        }
    }

    /// Stops the pool; workers exit after their next poll or timeout.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Number of workers started over the pool's lifetime.
    pub fn worker_count(&self) -> usize {
        self.worker_seq.load(Ordering::Relaxed)
    }
}
