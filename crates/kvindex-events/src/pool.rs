//! Event-ingestion pool: `concurrency` independent work queues, each
//! single-consumer so all messages for one producer land on one worker
//! and preserve `seq` order, built on the usual mpsc-plus-`tokio::spawn`
//! worker-loop shape.

use std::hash::Hasher;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kvindex_backend::IndexBackend;
use kvindex_common::config::EventPoolConfig;
use kvindex_common::model::{BlockKey, PodEntry};
use tokio::sync::{mpsc, Barrier};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::subscriber;
use crate::wire::{decode_batch, EventRecord, Message};

fn shard_of(pod_identifier: &str, concurrency: usize) -> usize {
    let mut hasher = fxhash::FxHasher64::default();
    hasher.write(pod_identifier.as_bytes());
    (hasher.finish() as usize) % concurrency.max(1)
}

/// Owns the subscriber thread and the `concurrency` shard workers; call
/// [`EventPool::shutdown`] to drain and stop.
pub struct EventPool {
    cancel: CancellationToken,
    shard_senders: Vec<mpsc::Sender<Message>>,
    barrier: Arc<Barrier>,
    dropped_total: Arc<AtomicUsize>,
}

impl EventPool {
    /// Starts the subscriber thread and the shard workers. `cancel` is the
    /// single token threaded through both; cancelling it and then calling
    /// [`EventPool::shutdown`] is how a caller stops the pool.
    pub fn start(config: EventPoolConfig, index: Arc<dyn IndexBackend>, cancel: CancellationToken) -> Self {
        let concurrency = config.concurrency.max(1);
        let barrier = Arc::new(Barrier::new(concurrency + 1));
        let dropped_total = Arc::new(AtomicUsize::new(0));

        let mut shard_senders = Vec::with_capacity(concurrency);
        for shard in 0..concurrency {
            let (tx, rx) = mpsc::channel::<Message>(1024);
            shard_senders.push(tx);
            let index = index.clone();
            let barrier = barrier.clone();
            let dropped_total = dropped_total.clone();
            tokio::spawn(async move {
                run_shard(shard, rx, index, dropped_total).await;
                barrier.wait().await;
            });
        }

        let (router_tx, mut router_rx) = mpsc::channel::<Message>(4096);
        {
            let config = config.clone();
            let cancel = cancel.clone();
            std::thread::spawn(move || subscriber::run(config, router_tx, cancel));
        }
        let senders = shard_senders.clone();
        tokio::spawn(async move {
            while let Some(message) = router_rx.recv().await {
                let shard = shard_of(&message.pod_identifier, senders.len());
                if senders[shard].send(message).await.is_err() {
                    break;
                }
            }
        });

        Self {
            cancel,
            shard_senders,
            barrier,
            dropped_total,
        }
    }

    pub fn dropped_total(&self) -> usize {
        self.dropped_total.load(Ordering::Relaxed)
    }

    /// Signals cancellation, drops this pool's shard senders so each worker
    /// drains its queue and exits, then waits on the barrier for every
    /// worker to finish, bounded by `timeout`. Returns `true` if every
    /// worker quiesced before the timeout, `false` if it elapsed first (a
    /// stuck or panicked shard worker no longer hangs shutdown forever).
    pub async fn shutdown(self, timeout: Duration) -> bool {
        self.cancel.cancel();
        drop(self.shard_senders);
        tokio::time::timeout(timeout, self.barrier.wait())
            .await
            .is_ok()
    }
}

async fn run_shard(
    shard: usize,
    mut rx: mpsc::Receiver<Message>,
    index: Arc<dyn IndexBackend>,
    dropped_total: Arc<AtomicUsize>,
) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = dispatch(&message, &index).await {
            dropped_total.fetch_add(1, Ordering::Relaxed);
            debug!(target: "events", shard, error = %e, "dropping event after dispatch failure");
        }
    }
}

async fn dispatch(message: &Message, index: &Arc<dyn IndexBackend>) -> kvindex_common::Result<()> {
    let batch = decode_batch(&message.payload)?;
    for event in batch.events {
        match event {
            EventRecord::BlockStored { block_hashes, .. } => {
                let keys: Vec<BlockKey> = block_hashes
                    .iter()
                    .map(|h| BlockKey::new(message.model_name.clone(), *h))
                    .collect();
                if keys.is_empty() {
                    continue;
                }
                let entries = [PodEntry::new(
                    message.pod_identifier.clone(),
                    PodEntry::DEFAULT_TIER,
                )];
                if let Err(e) = index.add(&keys, &entries).await {
                    warn!(target: "events", error = %e, "index add failed, continuing");
                }
            }
            EventRecord::BlockRemoved { block_hashes } => {
                let entries = [PodEntry::new(
                    message.pod_identifier.clone(),
                    PodEntry::DEFAULT_TIER,
                )];
                for h in block_hashes {
                    let key = BlockKey::new(message.model_name.clone(), h);
                    if let Err(e) = index.evict(&key, &entries).await {
                        warn!(target: "events", error = %e, "index evict failed, continuing");
                    }
                }
            }
            EventRecord::AllBlocksCleared => {
                // See DESIGN.md's Open Question Q1: no-op by design, since
                // the backend has no "clear by producer" primitive and a
                // full-index clear would affect unrelated producers.
                debug!(target: "events", pod = %message.pod_identifier, "AllBlocksCleared received, no-op");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_assignment_is_deterministic() {
        let a = shard_of("pod-1", 4);
        let b = shard_of("pod-1", 4);
        assert_eq!(a, b);
    }

    #[test]
    fn shard_assignment_stays_in_range() {
        for pod in ["a", "b", "c", "pod-xyz"] {
            assert!(shard_of(pod, 3) < 3);
        }
    }

    fn encode_batch(events: Vec<rmpv::Value>) -> Vec<u8> {
        let value = rmpv::Value::Map(vec![
            (rmpv::Value::from("ts"), rmpv::Value::from(1.0)),
            (rmpv::Value::from("events"), rmpv::Value::Array(events)),
            (rmpv::Value::from("data_parallel_rank"), rmpv::Value::Nil),
        ]);
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &value).unwrap();
        buf
    }

    fn block_stored(hash: u64) -> rmpv::Value {
        rmpv::Value::Array(vec![
            rmpv::Value::from("BlockStored"),
            rmpv::Value::Array(vec![rmpv::Value::from(hash)]),
            rmpv::Value::Nil,
            rmpv::Value::Array(vec![rmpv::Value::from(1u32)]),
            rmpv::Value::from(16),
            rmpv::Value::Nil,
        ])
    }

    fn block_removed(hash: u64) -> rmpv::Value {
        rmpv::Value::Array(vec![
            rmpv::Value::from("BlockRemoved"),
            rmpv::Value::Array(vec![rmpv::Value::from(hash)]),
        ])
    }

    #[tokio::test]
    async fn same_producer_events_apply_in_seq_order() {
        use kvindex_backend::bounded_lru::BoundedLruBackend;

        let index: Arc<dyn IndexBackend> = Arc::new(BoundedLruBackend::new(16, 16));
        let (tx, rx) = mpsc::channel(8);
        let dropped = Arc::new(AtomicUsize::new(0));
        let worker = {
            let index = index.clone();
            tokio::spawn(run_shard(0, rx, index, dropped))
        };

        let stored = Message {
            pod_identifier: "pod-1".into(),
            model_name: "m".into(),
            seq: 0,
            payload: encode_batch(vec![block_stored(42)]),
        };
        let removed = Message {
            pod_identifier: "pod-1".into(),
            model_name: "m".into(),
            seq: 1,
            payload: encode_batch(vec![block_removed(42)]),
        };
        tx.send(stored).await.unwrap();
        tx.send(removed).await.unwrap();
        drop(tx);
        worker.await.unwrap();

        let key = BlockKey::new("m".to_string(), 42);
        let hits = index.lookup(&[key], &[]).await.unwrap();
        assert!(hits.iter().all(|(_, pods)| pods.is_empty()));
    }
}
