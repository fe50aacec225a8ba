// Transaction state (§3) and the read pipeline (§4.4). Commit lives in
// `commit.rs`; retry classification in `retry.rs`.

use std::sync::Arc;

use fathom_base::{
    key_after, kind_err, metadata_version_key, ErrorKind, Key, KeyRange, KeySelector, Result, TransactionOptions,
    Value, Version,
};
use fathom_failure::dispatch;
use fathom_wire::protocol::{AtomicOp, GetKeyRequest, GetKeyServerLocationsRequest, GetKeyValuesRequest, GetValueRequest, Mutation, RangeLimits, SplitMetricsRequest, WaitMetricsRequest};
use fathom_wire::LocationInfo;
use tokio::sync::oneshot;
use tracing::{trace, warn};

use crate::retry::{Backoff, RetryAction, TagThrottleContext};
use crate::services::TxnServices;

/// A watch registered against this transaction but not yet armed; its fate
/// is decided at commit (§3, §4.6 post-commit step 3).
struct PendingWatch {
    key: Key,
    value_read: Option<Value>,
    tx: oneshot::Sender<fathom_watch::WatchFuture>,
}

/// Returned by [`Transaction::watch`]. Resolves once the owning transaction
/// actually commits and the watch is armed at the committed version; if the
/// transaction never commits (reset away, or fails with a non-committing
/// outcome), `wait` resolves to [`ErrorKind::WatchCancelled`].
pub struct WatchHandle {
    rx: oneshot::Receiver<fathom_watch::WatchFuture>,
}

impl WatchHandle {
    pub async fn wait(self) -> Result<()> {
        match self.rx.await {
            Ok(fut) => fut.wait().await,
            Err(_) => Err(kind_err(ErrorKind::WatchCancelled, "transaction did not commit; watch was never armed")),
        }
    }
}

/// §3 "Transaction State". Bound to one `DatabaseContext` via [`TxnServices`]
/// for its whole lifetime; `reset` clears everything except `options` and
/// the pending watch list (§4.6 "reset preserves watches-until-commit").
pub struct Transaction {
    pub(crate) services: Arc<TxnServices>,
    pub(crate) options: TransactionOptions,
    read_version: Option<Version>,
    pub(crate) mutations: Vec<Mutation>,
    pub(crate) read_conflict_ranges: Vec<KeyRange>,
    pub(crate) write_conflict_ranges: Vec<KeyRange>,
    pub(crate) watches: Vec<PendingWatch>,
    pub(crate) last_self_conflict: Option<KeyRange>,
    backoff: Backoff,
    committed_size: usize,
    versionstamp_tx: Option<oneshot::Sender<fathom_base::Versionstamp>>,
    versionstamp_rx: Option<oneshot::Receiver<fathom_base::Versionstamp>>,
}

impl Transaction {
    pub fn new(services: Arc<TxnServices>, options: TransactionOptions) -> Self {
        let (tx, rx) = oneshot::channel();
        Transaction {
            services,
            options,
            read_version: None,
            mutations: Vec::new(),
            read_conflict_ranges: Vec::new(),
            write_conflict_ranges: Vec::new(),
            watches: Vec::new(),
            last_self_conflict: None,
            backoff: Backoff::new(),
            committed_size: 0,
            versionstamp_tx: Some(tx),
            versionstamp_rx: Some(rx),
        }
    }

    pub fn options(&self) -> &TransactionOptions {
        &self.options
    }

    /// Clears mutation/conflict-range buffers and the cached read version.
    /// Per §4.6, already-registered watches survive a reset until commit
    /// decides their fate.
    pub fn reset(&mut self) {
        self.read_version = None;
        self.mutations.clear();
        self.read_conflict_ranges.clear();
        self.write_conflict_ranges.clear();
        self.last_self_conflict = None;
        self.committed_size = 0;
        let (tx, rx) = oneshot::channel();
        self.versionstamp_tx = Some(tx);
        self.versionstamp_rx = Some(rx);
    }

    pub fn cancel(&mut self) {
        self.mutations.clear();
        self.read_conflict_ranges.clear();
        self.write_conflict_ranges.clear();
        self.watches.clear();
    }

    /// Externally pins the read version instead of letting it resolve
    /// lazily from a `getReadVersion` batch (§3 "once set, immutable until
    /// reset"). Must be called before any read that would otherwise
    /// trigger the lazy resolution, and at most once per reset cycle.
    pub fn set_read_version(&mut self, version: Version) -> Result<()> {
        if self.read_version.is_some() {
            return Err(kind_err(ErrorKind::ReadVersionAlreadySet, "read version already set for this transaction"));
        }
        if version.0 <= 0 {
            return Err(kind_err(ErrorKind::VersionInvalid, "read version must be a positive version"));
        }
        self.read_version = Some(version);
        Ok(())
    }

    /// Resolves the lazy read-version future (§3), submitting a batched
    /// `getReadVersion` request on first call and caching the result for
    /// the rest of the transaction's life.
    pub async fn get_read_version(&mut self) -> Result<Version> {
        if let Some(v) = self.read_version {
            return Ok(v);
        }
        let flags = fathom_wire::TransactionFlags {
            causal_read_risky: self.options.causal_read_risky,
            first_in_batch: self.options.first_in_batch,
        };
        let handle = self
            .services
            .grv
            .submit(self.options.priority, flags, self.options.tags.clone(), self.options.debug_transaction_identifier.clone())
            .await;
        let result = handle.recv().await?;
        if let Some(mv) = result.metadata_version.clone() {
            self.services.metadata.record(result.version, Some(mv));
        }
        self.read_version = Some(result.version);
        Ok(result.version)
    }

    fn check_size_limits(&self, key: &Key, value: Option<&Value>) -> Result<()> {
        if key.0.len() > self.services.knobs.key_size_limit {
            return Err(kind_err(ErrorKind::KeyTooLarge, "key exceeds KEY_SIZE_LIMIT"));
        }
        if let Some(v) = value {
            if v.0.len() > self.services.knobs.value_size_limit {
                return Err(kind_err(ErrorKind::ValueTooLarge, "value exceeds VALUE_SIZE_LIMIT"));
            }
        }
        Ok(())
    }

    // ---- mutation buffer (§4.6 "buffer model") ----

    pub fn set(&mut self, key: Key, value: Value) -> Result<()> {
        self.check_size_limits(&key, Some(&value))?;
        self.committed_size += key.0.len() + value.0.len();
        self.write_conflict_ranges.push(KeyRange::singleton(key.clone()));
        self.mutations.push(Mutation::Set(key, value));
        self.enforce_size_limit()
    }

    pub fn clear(&mut self, key: Key) {
        self.write_conflict_ranges.push(KeyRange::singleton(key.clone()));
        self.mutations.push(Mutation::ClearRange(KeyRange::singleton(key)));
    }

    pub fn clear_range(&mut self, range: KeyRange) {
        self.write_conflict_ranges.push(range.clone());
        self.mutations.push(Mutation::ClearRange(range));
    }

    /// `ATOMIC<op>` (§4.6). Versionstamped ops add no write-conflict range
    /// for the key itself, since the final key isn't known until commit.
    pub fn atomic_op(&mut self, op: AtomicOp, key: Key, operand: Value) -> Result<()> {
        self.check_size_limits(&key, Some(&operand))?;
        let versionstamped = matches!(op, AtomicOp::SetVersionstampedKey | AtomicOp::SetVersionstampedValue);
        if !versionstamped {
            self.write_conflict_ranges.push(KeyRange::singleton(key.clone()));
        }
        self.committed_size += key.0.len() + operand.0.len();
        let mutation = match op {
            AtomicOp::SetVersionstampedKey => Mutation::VersionstampedKey(key, operand),
            AtomicOp::SetVersionstampedValue => Mutation::VersionstampedValue(key, operand),
            other => Mutation::Atomic(other, key, operand),
        };
        self.mutations.push(mutation);
        self.enforce_size_limit()
    }

    /// §4.4.3d: `min_rows` can't exceed `rows`, or the range read could
    /// never terminate on either condition simultaneously.
    fn validate_range_limits(limits: &RangeLimits) -> Result<()> {
        if let (Some(min_rows), Some(rows)) = (limits.min_rows, limits.rows) {
            if min_rows > rows {
                return Err(kind_err(ErrorKind::RangeLimitsInvalid, "min_rows exceeds row limit"));
            }
        }
        Ok(())
    }

    fn enforce_size_limit(&self) -> Result<()> {
        let limit = self.options.size_limit.unwrap_or(usize::MAX);
        if self.committed_size > limit {
            return Err(kind_err(ErrorKind::ClientInvalidOperation, "transaction_too_large"));
        }
        Ok(())
    }

    pub fn versionstamp(&mut self) -> Option<oneshot::Receiver<fathom_base::Versionstamp>> {
        self.versionstamp_rx.take()
    }

    pub(crate) fn resolve_versionstamp(&mut self, vs: fathom_base::Versionstamp) {
        if let Some(tx) = self.versionstamp_tx.take() {
            let _ = tx.send(vs);
        }
    }

    // ---- read pipeline (§4.4) ----

    /// §4.4.1 `get(key, snapshot)`.
    pub async fn get(&mut self, key: Key, snapshot: bool) -> Result<Option<Value>> {
        if !snapshot {
            self.read_conflict_ranges.push(KeyRange::singleton(key.clone()));
        }
        if key == metadata_version_key() {
            let v = self.get_read_version().await?;
            return Ok(self.services.metadata.lookup(v));
        }
        let version = self.get_read_version().await?;
        loop {
            let (_range, info) = self.resolve_location(&key, false).await?;
            let transport = self.services.transport.clone();
            let tags = self.options.tags.clone();
            let fetch_key = key.clone();
            let result = dispatch(
                &info,
                &self.services.failure,
                &self.services.tss_registry,
                &self.services.tss_mismatch_tx,
                self.services.knobs.load_balance_tss_timeout,
                move |ssi| {
                    let transport = transport.clone();
                    let req = GetValueRequest { key: fetch_key.clone(), version, tags: tags.clone(), debug_id: None };
                    async move { transport.get_value(&ssi, req).await }
                },
            )
            .await;
            match result {
                Ok(reply) => return Ok(reply.value),
                Err(e) if matches!(e.kind(), ErrorKind::WrongShardServer | ErrorKind::AllAlternativesFailed) => {
                    self.invalidate_key(&key);
                    tokio::time::sleep(self.services.knobs.wrong_shard_server_delay).await;
                    continue;
                }
                Err(e) if e.kind() == ErrorKind::TransactionTooOld => {
                    self.invalidate_key(&key);
                    tokio::time::sleep(self.services.knobs.wrong_shard_server_delay).await;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// §4.4.2 `getKey(selector, snapshot)`.
    pub async fn get_key(&mut self, mut selector: KeySelector, snapshot: bool) -> Result<Key> {
        let version = self.get_read_version().await?;
        loop {
            let (shard, info) = self.resolve_location(&selector.key, selector.is_backward()).await?;
            let transport = self.services.transport.clone();
            let req_selector = selector.clone();
            let result = dispatch(
                &info,
                &self.services.failure,
                &self.services.tss_registry,
                &self.services.tss_mismatch_tx,
                self.services.knobs.load_balance_tss_timeout,
                move |ssi| {
                    let transport = transport.clone();
                    let req = GetKeyRequest { selector: req_selector.clone(), version };
                    async move { transport.get_key(&ssi, req).await }
                },
            )
            .await;
            match result {
                Ok(reply) => {
                    let resolved = reply.selector;
                    if resolved.is_resolved() {
                        if !snapshot {
                            self.read_conflict_ranges.push(self.key_selector_conflict_range(&selector, &resolved.key));
                        }
                        return Ok(resolved.key);
                    }
                    if !shard.contains(&resolved.key) && resolved.key != shard.end {
                        selector = resolved;
                        continue;
                    }
                    selector = resolved;
                }
                Err(e) if matches!(e.kind(), ErrorKind::WrongShardServer | ErrorKind::AllAlternativesFailed) => {
                    self.invalidate_key(&selector.key);
                    tokio::time::sleep(self.services.knobs.wrong_shard_server_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn key_selector_conflict_range(&self, original: &KeySelector, resolved: &Key) -> KeyRange {
        if original.is_backward() {
            KeyRange::new(resolved.clone(), key_after(&original.key))
        } else {
            KeyRange::new(original.key.clone(), key_after(resolved))
        }
    }

    /// §4.4.3 `getRange(begin, end, limits, reverse, snapshot)`.
    pub async fn get_range(
        &mut self,
        mut begin: KeySelector,
        mut end: KeySelector,
        mut limits: RangeLimits,
        reverse: bool,
        snapshot: bool,
    ) -> Result<Vec<(Key, Value)>> {
        Self::validate_range_limits(&limits)?;
        let version = self.get_read_version().await?;
        let mut out = Vec::new();
        let conflict_begin = begin.key.clone();
        let mut conflict_end = end.key.clone();
        let mut truncated_at: Option<Key> = None;
        let mut total_rows: u32 = 0;

        loop {
            if limits.rows == Some(0) || limits.bytes == Some(0) {
                break;
            }
            let (shard, info) = self.resolve_location(&begin.key, reverse).await?;

            let mut modified = false;
            let req_begin = if shard.contains(&begin.key) || begin.key == shard.begin {
                begin.clone()
            } else {
                modified = true;
                KeySelector::first_greater_or_equal(shard.begin.clone())
            };
            let req_end = if end.key <= shard.end || end.key == shard.end {
                end.clone()
            } else {
                modified = true;
                KeySelector::first_greater_or_equal(shard.end.clone())
            };

            let transport = self.services.transport.clone();
            let req_limits = limits;
            let result = dispatch(
                &info,
                &self.services.failure,
                &self.services.tss_registry,
                &self.services.tss_mismatch_tx,
                self.services.knobs.load_balance_tss_timeout,
                move |ssi| {
                    let transport = transport.clone();
                    let req = GetKeyValuesRequest { begin: req_begin.clone(), end: req_end.clone(), version, limit: req_limits, reverse };
                    async move { transport.get_key_values(&ssi, req).await }
                },
            )
            .await;
            let reply = match result {
                Ok(r) => r,
                Err(e) if matches!(e.kind(), ErrorKind::WrongShardServer | ErrorKind::AllAlternativesFailed) => {
                    self.invalidate_key(&begin.key);
                    tokio::time::sleep(self.services.knobs.wrong_shard_server_delay).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let got = reply.data.len();
            total_rows += got as u32;
            if let Some(rows) = limits.rows {
                limits.rows = Some(rows.saturating_sub(got as u32));
            }
            if let Some(bytes) = limits.bytes {
                let got_bytes: u64 = reply.data.iter().map(|(k, v)| (k.0.len() + v.0.len()) as u64).sum();
                limits.bytes = Some(bytes.saturating_sub(got_bytes.min(u32::MAX as u64) as u32));
            }
            if let Some((k, _)) = reply.data.last() {
                truncated_at = Some(k.clone());
            }
            out.extend(reply.data);

            let min_rows_satisfied = limits.min_rows.is_some_and(|min| total_rows >= min);
            let done = limits.rows == Some(0) || limits.bytes == Some(0) || min_rows_satisfied || (!modified && !reply.more);
            if done {
                break;
            }
            if !reply.more && modified && out.is_empty() {
                // §4.4.3e fallback: resolve both selectors absolutely and
                // retry as an exact range at the current version.
                begin = KeySelector::first_greater_or_equal(begin.key.clone());
                end = KeySelector::first_greater_or_equal(end.key.clone());
                continue;
            }
            if reverse {
                end = KeySelector::first_greater_or_equal(shard.begin.clone());
            } else {
                begin = KeySelector::first_greater_or_equal(shard.end.clone());
            }
            if begin.key >= end.key && !reverse {
                break;
            }
        }

        if !snapshot {
            let range = if let Some(last) = truncated_at {
                if reverse {
                    KeyRange::new(last, conflict_end.clone())
                } else {
                    KeyRange::new(conflict_begin.clone(), key_after(&last))
                }
            } else {
                KeyRange::new(conflict_begin.clone(), std::mem::take(&mut conflict_end))
            };
            self.read_conflict_ranges.push(range);
        }

        Ok(out)
    }

    /// **[ADDED — supplemented from the original `NativeAPI`]** returns the
    /// addresses of the storage servers currently serving `key`'s shard,
    /// read straight off the cached `LocationInfo`. No RPC.
    pub async fn get_addresses_for_key(&mut self, key: &Key) -> Result<Vec<String>> {
        let (_range, info) = self.resolve_location(key, false).await?;
        Ok(info.ssis.iter().map(|s| s.address.clone()).collect())
    }

    /// **[ADDED]** sums `SplitMetrics` byte estimates over the shards
    /// covering `range`.
    pub async fn get_estimated_range_size_bytes(&mut self, range: &KeyRange) -> Result<u64> {
        let shards = {
            let cache = self.services.locations.lock();
            cache.get_range(range, usize::MAX, false)
        };
        let shards = match shards {
            Ok(s) => s,
            Err(_) => {
                self.resolve_location(&range.begin, false).await?;
                return Ok(0);
            }
        };
        let mut total = 0u64;
        for (shard_range, info) in shards {
            let clamped = KeyRange::new(shard_range.begin.max(range.begin.clone()), shard_range.end.min(range.end.clone()));
            let transport = self.services.transport.clone();
            let req_range = clamped;
            let reply = dispatch(
                &info,
                &self.services.failure,
                &self.services.tss_registry,
                &self.services.tss_mismatch_tx,
                self.services.knobs.load_balance_tss_timeout,
                move |ssi| {
                    let transport = transport.clone();
                    let req = WaitMetricsRequest { range: req_range.clone() };
                    async move { transport.wait_metrics(&ssi, req).await }
                },
            )
            .await?;
            total += reply.bytes;
        }
        Ok(total)
    }

    pub async fn split_storage_metrics(&mut self, range: &KeyRange, chunk_size_bytes: u64) -> Result<Vec<Key>> {
        let (_range, info) = self.resolve_location(&range.begin, false).await?;
        let transport = self.services.transport.clone();
        let req_range = range.clone();
        let reply = dispatch(
            &info,
            &self.services.failure,
            &self.services.tss_registry,
            &self.services.tss_mismatch_tx,
            self.services.knobs.load_balance_tss_timeout,
            move |ssi| {
                let transport = transport.clone();
                let req = SplitMetricsRequest { range: req_range.clone(), chunk_size_bytes };
                async move { transport.split_metrics(&ssi, req).await }
            },
        )
        .await?;
        Ok(reply.split_points)
    }

    /// §4.5 parallel shard-fragmented range scan. Unlike `get_range`, the
    /// whole `[begin, end)` is read in one pass; a single read-conflict
    /// range covers it (unless `snapshot`), and fragments stream back in
    /// order via `fathom-stream`'s reorder-and-backpressure pipeline.
    pub async fn get_range_stream(
        &mut self,
        range: KeyRange,
        reverse: bool,
        snapshot: bool,
    ) -> Result<futures::stream::BoxStream<'static, Result<(Key, Value)>>> {
        let version = self.get_read_version().await?;
        if !snapshot {
            self.read_conflict_ranges.push(range.clone());
        }
        let ctx = Arc::new(fathom_stream::StreamContext {
            transport: self.services.transport.clone(),
            locations: self.services.locations.clone(),
            failure: self.services.failure.clone(),
            coordinator: self.services.coordinator,
            wrong_shard_server_delay: self.services.knobs.wrong_shard_server_delay,
            buffered_fragments_limit: self.services.knobs.rangestream_buffered_fragments_limit,
            fragment_split_bytes: self.services.knobs.rangestream_fragment_split_bytes,
            tss_registry: self.services.tss_registry.clone(),
            tss_mismatch_tx: self.services.tss_mismatch_tx.clone(),
            load_balance_tss_timeout: self.services.knobs.load_balance_tss_timeout,
        });
        Ok(fathom_stream::stream_range(ctx, range, version, reverse))
    }

    /// §4.4.4 register intent to watch `key` changing away from `value_read`.
    /// Per §3/§4.6, a watch's fate is decided at commit: this issues no RPC
    /// and touches no shared watch state, only queuing the intent for
    /// `arm_pending_watches` to act on once (and if) this transaction
    /// actually commits.
    pub fn watch(&mut self, key: Key, value_read: Option<Value>) -> Result<WatchHandle> {
        if self.services.watches.live_count() >= self.services.max_watches() {
            return Err(kind_err(ErrorKind::TooManyWatches, "watch limit reached"));
        }
        let (tx, rx) = oneshot::channel();
        self.watches.push(PendingWatch { key, value_read, tx });
        Ok(WatchHandle { rx })
    }

    /// §4.6 post-commit step 3: arm every watch queued by `watch()` at the
    /// version the transaction actually committed at. Watches whose
    /// replica can't be resolved are silently dropped, same as a watch
    /// whose handle was never polled — the caller only learns about it
    /// through `WatchHandle::wait` never resolving.
    pub(crate) async fn arm_pending_watches(&mut self, version: Version) {
        let pending = std::mem::take(&mut self.watches);
        for watch in pending {
            self.arm_watch(watch, version).await;
        }
    }

    async fn arm_watch(&self, watch: PendingWatch, version: Version) {
        let PendingWatch { key, value_read, tx } = watch;
        let ssi = match self.resolve_location(&key, false).await {
            Ok((_, info)) => match fathom_failure::pick_replica(&info, &self.services.failure) {
                Some(ssi) => ssi,
                None => return,
            },
            Err(_) => return,
        };
        let transport = self.services.transport.clone();
        let read_ssi = ssi.clone();
        let read_key = key.clone();
        let read_current = async move {
            transport.get_value(&read_ssi, GetValueRequest { key: read_key, version, tags: vec![], debug_id: None }).await.map(|r| r.value)
        };
        let fut = self.services.watches.register(ssi, key, value_read, version, read_current).await;
        let _ = tx.send(fut);
    }

    /// §7 "User-visible `on_error`": classifies `err`, performs whatever
    /// reset/invalidate the class calls for, waits out the backoff, and
    /// resolves — or, for `Fatal` errors, hands `err` straight back so the
    /// caller's retry loop exits.
    pub async fn on_error(&mut self, err: fathom_base::Error) -> Result<()> {
        let throttle_table = self.services.grv.throttle_table();
        let ctx = TagThrottleContext { priority: self.options.priority, tags: &self.options.tags, table: &throttle_table };
        let action = self.backoff.classify(err.kind(), &self.services.knobs, Some(ctx));
        match action {
            RetryAction::Reset { delay } => {
                self.reset();
                tokio::time::sleep(delay).await;
                Ok(())
            }
            RetryAction::InvalidateCache { delay } => {
                for range in self.read_conflict_ranges.iter().chain(self.write_conflict_ranges.iter()) {
                    self.invalidate_key(&range.begin);
                }
                tokio::time::sleep(delay).await;
                Ok(())
            }
            RetryAction::Propagate => Err(err),
        }
    }

    fn invalidate_key(&self, key: &Key) {
        let mut cache = self.services.locations.lock();
        cache.invalidate_key(key);
    }

    async fn resolve_location(&self, key: &Key, reverse: bool) -> Result<(KeyRange, Arc<LocationInfo>)> {
        {
            let cache = self.services.locations.lock();
            let (range, slot) = cache.get(key, reverse);
            if let Some(info) = slot {
                return Ok((range, info));
            }
        }
        trace!(target: "fathom", ?key, "location cache miss, resolving");
        let req = GetKeyServerLocationsRequest { begin: key.clone(), end: None, limit: 1, reverse };
        let reply = self.services.transport.get_key_server_locations(self.services.coordinator, req).await?;
        if reply.results.is_empty() {
            warn!(target: "fathom", ?key, "no location returned");
            return Err(kind_err(ErrorKind::AllAlternativesFailed, "no location returned for key"));
        }
        let mut cache = self.services.locations.lock();
        let mut found = None;
        for (range, ssis) in reply.results {
            let info = Arc::new(LocationInfo::new(ssis, false));
            cache.insert(&range, info.clone());
            if range.contains(key) {
                found = Some((range, info));
            } else if found.is_none() {
                found = Some((range, info));
            }
        }
        found.ok_or_else(|| kind_err(ErrorKind::AllAlternativesFailed, "no location returned for key"))
    }
}

/// The retry-loop-visible outcome of a `commit()` call before user-facing
/// translation (used by `retry.rs`/`commit.rs`); re-exported so callers
/// matching on it don't need to reach into `commit`.
pub use crate::commit::CommitOutcome;
