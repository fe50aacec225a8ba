use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use fathom_base::{kind_err, Knobs, Priority, Value, Version};
use fathom_wire::{GetReadVersionRequest, ProxyId, Transport, TransactionFlags};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, trace};

use crate::throttle::ThrottleTable;

pub struct GrvResult {
    pub version: Version,
    pub metadata_version: Option<Value>,
}

struct PendingRequest {
    tags: Vec<String>,
    debug_id: Option<String>,
    reply: oneshot::Sender<fathom_base::Result<GrvResult>>,
}

/// A single `VersionRequest` (§4.3): submit and await the batched reply.
pub struct VersionRequestHandle {
    rx: oneshot::Receiver<fathom_base::Result<GrvResult>>,
}

impl VersionRequestHandle {
    pub async fn recv(self) -> fathom_base::Result<GrvResult> {
        match self.rx.await {
            Ok(r) => r,
            Err(_) => Err(kind_err(fathom_base::ErrorKind::Other, "GRV batcher task dropped the reply channel")),
        }
    }
}

/// One batcher per `(priority, flags)` class, coalescing GRV requests
/// within a dynamically adapted window (§4.3). Owns no task by itself;
/// [`GrvBatcher::run`] is spawned by [`GrvBatcherSet`] once per class and
/// lives for the lifetime of the `DatabaseContext`.
pub struct GrvBatcher {
    tx: mpsc::UnboundedSender<PendingRequest>,
}

impl GrvBatcher {
    pub fn submit(&self, tags: Vec<String>, debug_id: Option<String>) -> VersionRequestHandle {
        let (reply, rx) = oneshot::channel();
        // Closed channel means the batcher task has shut down (context
        // dropped); the caller observes this via `recv()`'s Err arm.
        let _ = self.tx.send(PendingRequest { tags, debug_id, reply });
        VersionRequestHandle { rx }
    }
}

async fn run_batcher(
    priority: Priority,
    flags: TransactionFlags,
    proxy: ProxyId,
    transport: Arc<dyn Transport>,
    throttle: Arc<ThrottleTable>,
    knobs: Knobs,
    mut rx: mpsc::UnboundedReceiver<PendingRequest>,
) {
    let mut batch_time = 0.0f64;
    loop {
        let first = match rx.recv().await {
            Some(r) => r,
            None => return, // all senders dropped: context torn down
        };
        let mut batch = vec![first];
        let deadline = Instant::now() + Duration::from_secs_f64(batch_time.clamp(0.0, knobs.grv_batch_timeout.as_secs_f64()));
        loop {
            if batch.len() >= knobs.max_batch_size {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(r) => batch.push(r),
                    None => break,
                },
                _ = tokio::time::sleep(deadline - now) => break,
            }
        }

        trace!(target: "fathom", count = batch.len(), ?priority, "dispatching GRV batch");
        let merged_tags: Vec<String> = {
            let mut set: BTreeMap<String, ()> = BTreeMap::new();
            for r in &batch {
                for t in &r.tags {
                    set.insert(t.clone(), ());
                }
            }
            set.into_keys().collect()
        };
        let debug_id = batch.iter().find_map(|r| r.debug_id.clone());
        let req = GetReadVersionRequest {
            count: batch.len() as u32,
            priority,
            flags,
            tags: merged_tags,
            debug_id,
        };

        let start = Instant::now();
        let reply = transport.get_read_version(proxy, req).await;
        let elapsed = start.elapsed();
        // Low-pass filter: half the observed reply latency keeps end-to-end
        // GRV latency within ~1.5x server latency regardless of load.
        let sample = 0.5 * elapsed.as_secs_f64();
        batch_time = (0.1 * sample + 0.9 * batch_time).clamp(0.0, knobs.grv_batch_timeout.as_secs_f64());

        match reply {
            Ok(r) => {
                throttle.apply_reply(priority, &r.tag_rates);
                for (i, pending) in batch.into_iter().enumerate() {
                    if i > 0 && i % knobs.broadcast_batch_size == 0 {
                        tokio::task::yield_now().await;
                    }
                    let _ = pending.reply.send(Ok(GrvResult {
                        version: r.version,
                        metadata_version: r.metadata_version.clone(),
                    }));
                }
            }
            Err(e) => {
                let kind = e.kind();
                let msg = format!("{e}");
                debug!(target: "fathom", ?kind, "GRV batch RPC failed");
                for (i, pending) in batch.into_iter().enumerate() {
                    if i > 0 && i % knobs.broadcast_batch_size == 0 {
                        tokio::task::yield_now().await;
                    }
                    let _ = pending.reply.send(Err(kind_err(kind, msg.clone())));
                }
            }
        }
    }
}

/// Owns one [`GrvBatcher`] + background task per `(priority, flags)` class
/// seen so far, and the shared throttle table all classes piggyback onto.
pub struct GrvBatcherSet {
    proxy: ProxyId,
    transport: Arc<dyn Transport>,
    knobs: Knobs,
    throttle: Arc<ThrottleTable>,
    batchers: Mutex<BTreeMap<(Priority, bool, bool), GrvBatcher>>,
}

impl GrvBatcherSet {
    pub fn new(proxy: ProxyId, transport: Arc<dyn Transport>, knobs: Knobs) -> Self {
        GrvBatcherSet {
            proxy,
            transport,
            knobs,
            throttle: Arc::new(ThrottleTable::default()),
            batchers: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn throttle_table(&self) -> Arc<ThrottleTable> {
        self.throttle.clone()
    }

    pub async fn submit(
        &self,
        priority: Priority,
        flags: TransactionFlags,
        tags: Vec<String>,
        debug_id: Option<String>,
    ) -> VersionRequestHandle {
        let key = (priority, flags.causal_read_risky, flags.first_in_batch);
        let mut batchers = self.batchers.lock().await;
        if !batchers.contains_key(&key) {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(run_batcher(
                priority,
                flags,
                self.proxy,
                self.transport.clone(),
                self.throttle.clone(),
                self.knobs.clone(),
                rx,
            ));
            batchers.insert(key, GrvBatcher { tx });
        }
        batchers.get(&key).unwrap().submit(tags, debug_id)
    }
}
