//! Assured dispatch pool.
//!
//! Variant of [`crate::ProcessorPool`] that always answers: handler
//! failures, panics and unknown processors are converted into an
//! error-payload response packet instead of being dropped, as long as the
//! originating connection is still open.
//!
//! Workers do not own a shard here. Each poll advances a dedicated read
//! cursor and drains the shard it lands on, so the read rotation is
//! independent of the push cursor and every shard is visited on
//! successive polls regardless of write traffic.

use crate::error::CoreError;
use crate::pool::{PoolConfig, ShardSet};
use crate::processor::{DispatchContext, ProcessorRegistry};
use crate::registry::ConnectionRegistry;
use serde_json::json;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use wirebus_protocol::{Packet, Payload};

/// Dispatch pool that guarantees a response packet per request.
pub struct AssuredProcessorPool {
    processors: Arc<ProcessorRegistry>,
    registry: Arc<ConnectionRegistry>,
    shards: Arc<ShardSet>,
    read_counter: AtomicU64,
    running: Arc<AtomicBool>,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    poll_timeout: Duration,
}

impl AssuredProcessorPool {
    pub fn new(
        config: PoolConfig,
        processors: Arc<ProcessorRegistry>,
        registry: Arc<ConnectionRegistry>,
    ) -> Arc<Self> {
        let worker_count = config.worker_count.max(1);
        let pool = Arc::new(Self {
            processors,
            registry,
            shards: Arc::new(ShardSet::new(worker_count, config.shard_capacity)),
            read_counter: AtomicU64::new(0),
            running: Arc::new(AtomicBool::new(true)),
            workers: parking_lot::Mutex::new(Vec::new()),
            poll_timeout: config.poll_timeout,
        });

        let mut workers = pool.workers.lock();
        for _ in 0..worker_count {
            let pool_ref = Arc::clone(&pool);
            workers.push(tokio::spawn(Self::worker_loop(pool_ref)));
        }
        drop(workers);
        pool
    }

    async fn worker_loop(pool: Arc<AssuredProcessorPool>) {
        while pool.running.load(Ordering::Acquire) {
            let shard = (pool.read_counter.fetch_add(1, Ordering::Relaxed)
                % pool.shards.shard_count() as u64) as usize;
            let receiver = pool.shards.receiver(shard);

            let polled = tokio::time::timeout(pool.poll_timeout, async {
                receiver.lock().await.recv().await
            })
            .await;

            match polled {
                Ok(Some(packet)) => pool.dispatch(packet),
                Ok(None) => break,
                Err(_) => continue,
            }
        }
    }

    /// Starts additional workers over the existing shard set.
    pub fn grow(self: &Arc<Self>, additional: usize) {
        let mut workers = self.workers.lock();
        for _ in 0..additional {
            workers.push(tokio::spawn(Self::worker_loop(Arc::clone(self))));
        }
    }

    /// Enqueues a packet, awaiting shard capacity.
    pub async fn push(&self, packet: Packet) -> Result<(), CoreError> {
        self.shards.push(packet).await
    }

    /// Invokes the packet's processor and always produces a response.
    pub fn dispatch(&self, packet: Packet) {
        let outcome = self.invoke(&packet);
        match outcome {
            Ok(result) => self.respond(&packet, result.unwrap_or(Payload::Value(json!(null)))),
            Err(e) => {
                tracing::error!(
                    "assured dispatch of '{}' request {} failed: {}",
                    packet.processor,
                    packet.request_id,
                    e
                );
                let still_open = self
                    .registry
                    .get(&packet.connection_id)
                    .map(|conn| !conn.is_closed())
                    .unwrap_or(false);
                if still_open {
                    self.respond(&packet, Payload::Value(json!({ "error": e.to_string() })));
                }
            }
        }
    }

    fn invoke(&self, packet: &Packet) -> Result<Option<Payload>, CoreError> {
        let processor = self
            .processors
            .get(&packet.processor)
            .ok_or_else(|| CoreError::ProcessorNotFound(packet.processor.clone()))?;

        let ctx = DispatchContext::new(Some(self.registry.clone()), packet.connection_id.clone());
        catch_unwind(AssertUnwindSafe(|| {
            processor.handle(&ctx, &packet.request_id, &packet.method, &packet.payload)
        }))
        .map_err(|_| CoreError::Handler(format!("processor '{}' panicked", packet.processor)))?
    }

    fn respond(&self, packet: &Packet, result: Payload) {
        let Some(conn) = self.registry.get(&packet.connection_id) else {
            tracing::warn!(
                "connection '{}' gone, dropping assured response to {}",
                packet.connection_id,
                packet.request_id
            );
            return;
        };
        if let Err(e) = conn.send(&packet.response(result)) {
            tracing::warn!(
                "assured response send failed on '{}': {}",
                packet.connection_id,
                e
            );
        }
    }

    /// Stops the pool; workers exit after their next poll or timeout.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}
