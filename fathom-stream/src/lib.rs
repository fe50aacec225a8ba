//! §4.5 Range Stream: the parallel shard-fragmented streaming scanner.
//!
//! A large `[begin, end)` is split at `~1 MB` granularity (`GetRangeSplitPoints`),
//! one streaming subrequest is issued per fragment, and results are
//! delivered to the caller in fragment order. Concurrency and backpressure
//! both ride on [`futures::stream::StreamExt::buffered`]: up to
//! `RANGESTREAM_BUFFERED_FRAGMENTS_LIMIT` fragment RPCs are in flight at
//! once, `buffered` only starts the next one once an earlier slot's result
//! has been consumed, and results come out in the order the fragments were
//! submitted — exactly the reorder-window-plus-backpressure behavior the
//! hand-rolled version of this would otherwise need a `BinaryHeap` for.

use std::sync::Arc;
use std::time::Duration;

use fathom_base::{err, kind_err, Error, ErrorKind, Key, KeyRange, KeySelector, Result, Value, Version};
use fathom_failure::{dispatch, pick_replica, FailureMonitor, MismatchRecord, TssRegistry};
use fathom_locations::LocationCache;
use fathom_wire::protocol::{GetKeyValuesRequest, GetRangeSplitPointsRequest, RangeLimits};
use fathom_wire::{ProxyId, Transport};
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// One `[begin, end)` slice of the overall scan, in emission order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Fragment {
    pub index: usize,
    pub range: KeyRange,
}

/// Divides `range` into fragments at `split_points`, which must already lie
/// strictly inside `range` in ascending order (as `GetRangeSplitPoints`
/// returns them). `split_points` being empty yields the whole range as one
/// fragment.
pub fn plan_fragments(range: KeyRange, split_points: Vec<Key>) -> Vec<Fragment> {
    let mut bounds = Vec::with_capacity(split_points.len() + 2);
    bounds.push(range.begin.clone());
    bounds.extend(split_points.into_iter().filter(|k| *k > range.begin && *k < range.end));
    bounds.push(range.end.clone());
    bounds
        .windows(2)
        .enumerate()
        .map(|(index, w)| Fragment { index, range: KeyRange::new(w[0].clone(), w[1].clone()) })
        .collect()
}

/// Shared context a fragment fetch needs; kept separate from
/// `fathom_txn::TxnServices` so this crate doesn't depend upward on it.
pub struct StreamContext {
    pub transport: Arc<dyn Transport>,
    pub locations: Arc<Mutex<LocationCache>>,
    pub failure: FailureMonitor,
    pub coordinator: ProxyId,
    pub wrong_shard_server_delay: std::time::Duration,
    pub buffered_fragments_limit: usize,
    pub fragment_split_bytes: u64,
    /// TSS shadow pairing table consulted for the (non-streaming) split-point
    /// planning request (§4.2, §4.4.5). Per-fragment data fetches ride
    /// `get_key_values_stream`, whose output isn't a single comparable
    /// value, so they aren't shadow-duplicated.
    pub tss_registry: TssRegistry,
    pub tss_mismatch_tx: mpsc::Sender<MismatchRecord>,
    pub load_balance_tss_timeout: Duration,
}

/// Runs the full §4.5 pipeline over `range` at `version` and returns an
/// ordered stream of key-value pairs (or the first unrecoverable error,
/// which ends the stream).
pub fn stream_range(ctx: Arc<StreamContext>, range: KeyRange, version: Version, reverse: bool) -> BoxStream<'static, Result<(Key, Value)>> {
    let plan_ctx = ctx.clone();
    stream::once(async move { plan(&plan_ctx, range).await })
        .flat_map(move |fragments| match fragments {
            Ok(mut fragments) => {
                if reverse {
                    fragments.reverse();
                    for (i, f) in fragments.iter_mut().enumerate() {
                        f.index = i;
                    }
                }
                let limit = ctx.buffered_fragments_limit.max(1);
                let map_ctx = ctx.clone();
                stream::iter(fragments)
                    .map(move |frag| fetch_fragment(map_ctx.clone(), frag, version))
                    .buffered(limit)
                    .flat_map(|result| match result {
                        Ok(pairs) => stream::iter(pairs.into_iter().map(Ok)).boxed(),
                        Err(e) => stream::iter(vec![Err(e)]).boxed(),
                    })
                    .boxed()
            }
            Err(e) => stream::iter(vec![Err(e)]).boxed(),
        })
        .boxed()
}

async fn plan(ctx: &StreamContext, range: KeyRange) -> Result<Vec<Fragment>> {
    let (_shard, info) = resolve_location(ctx, &range.begin, false).await?;
    let transport = ctx.transport.clone();
    let req_range = range.clone();
    let chunk_size_bytes = ctx.fragment_split_bytes;
    let reply = dispatch(
        &info,
        &ctx.failure,
        &ctx.tss_registry,
        &ctx.tss_mismatch_tx,
        ctx.load_balance_tss_timeout,
        move |ssi| {
            let transport = transport.clone();
            let req = GetRangeSplitPointsRequest { range: req_range.clone(), chunk_size_bytes };
            async move { transport.get_range_split_points(&ssi, req).await }
        },
    )
    .await?;
    debug!(target: "fathom", fragments = reply.split_points.len() + 1, "range stream planned");
    Ok(plan_fragments(range, reply.split_points))
}

async fn fetch_fragment(ctx: Arc<StreamContext>, fragment: Fragment, version: Version) -> Result<Vec<(Key, Value)>> {
    let range = fragment.range;
    loop {
        let (shard, info) = resolve_location(&ctx, &range.begin, false).await?;
        let ssi = pick_replica(&info, &ctx.failure).ok_or_else(|| err("no replicas for fragment"))?;
        let _ = &shard;
        let req = GetKeyValuesRequest {
            begin: KeySelector::first_greater_or_equal(range.begin.clone()),
            end: KeySelector::first_greater_or_equal(range.end.clone()),
            version,
            limit: RangeLimits::default(),
            reverse: false,
        };
        let guard = ctx.failure.begin_request(ssi.id);
        let mut out = Vec::new();
        let mut chunks = ctx.transport.get_key_values_stream(&ssi, req);
        let mut failed: Option<Error> = None;
        while let Some(item) = chunks.next().await {
            match item {
                Ok(chunk) => out.extend(chunk.data),
                Err(e) => {
                    failed = Some(e);
                    break;
                }
            }
        }
        drop(guard);
        match failed {
            None => return Ok(out),
            Some(e) if matches!(e.kind(), ErrorKind::WrongShardServer | ErrorKind::AllAlternativesFailed) => {
                trace!(target: "fathom", fragment = fragment.index, "fragment shard miss, restarting fragment");
                ctx.failure.mark_failed(ssi.id);
                invalidate(&ctx, &range.begin);
                tokio::time::sleep(ctx.wrong_shard_server_delay).await;
                continue;
            }
            Some(e) => {
                if e.is_retriable() {
                    ctx.failure.mark_failed(ssi.id);
                }
                return Err(e);
            }
        }
    }
}

fn invalidate(ctx: &StreamContext, key: &Key) {
    ctx.locations.lock().invalidate_key(key);
}

async fn resolve_location(ctx: &StreamContext, key: &Key, reverse: bool) -> Result<(KeyRange, Arc<fathom_wire::LocationInfo>)> {
    {
        let cache = ctx.locations.lock();
        let (range, slot) = cache.get(key, reverse);
        if let Some(info) = slot {
            return Ok((range, info));
        }
    }
    let req = fathom_wire::protocol::GetKeyServerLocationsRequest { begin: key.clone(), end: None, limit: 1, reverse };
    let reply = ctx.transport.get_key_server_locations(ctx.coordinator, req).await?;
    if reply.results.is_empty() {
        return Err(kind_err(ErrorKind::AllAlternativesFailed, "no location returned for key"));
    }
    let mut cache = ctx.locations.lock();
    let mut found = None;
    for (range, ssis) in reply.results {
        let info = Arc::new(fathom_wire::LocationInfo::new(ssis, false));
        cache.insert(&range, info.clone());
        if found.is_none() {
            found = Some((range, info));
        }
    }
    found.ok_or_else(|| kind_err(ErrorKind::AllAlternativesFailed, "no location returned for key"))
}

#[cfg(test)]
mod test {
    use super::*;
    use fathom_base::Knobs;
    use fathom_wire::mock::MockTransport;
    use test_log::test;

    fn ctx(mock: &Arc<MockTransport>) -> Arc<StreamContext> {
        let knobs = Knobs::default();
        let (tss_mismatch_tx, _unused_rx) = mpsc::channel(1);
        Arc::new(StreamContext {
            transport: mock.clone(),
            locations: Arc::new(Mutex::new(LocationCache::new(knobs.location_cache_size))),
            failure: FailureMonitor::new(),
            coordinator: mock.proxy(),
            wrong_shard_server_delay: knobs.wrong_shard_server_delay,
            buffered_fragments_limit: knobs.rangestream_buffered_fragments_limit,
            fragment_split_bytes: knobs.rangestream_fragment_split_bytes,
            tss_registry: TssRegistry::new(),
            tss_mismatch_tx,
            load_balance_tss_timeout: knobs.load_balance_tss_timeout,
        })
    }

    #[test]
    fn plan_fragments_splits_on_interior_points_only() {
        let range = KeyRange::new(Key(b"a".to_vec()), Key(b"z".to_vec()));
        let points = vec![Key(b"a".to_vec()), Key(b"m".to_vec()), Key(b"z".to_vec())];
        let fragments = plan_fragments(range.clone(), points);
        assert_eq!(fragments.len(), 2);
        assert_eq!(fragments[0].range, KeyRange::new(Key(b"a".to_vec()), Key(b"m".to_vec())));
        assert_eq!(fragments[1].range, KeyRange::new(Key(b"m".to_vec()), Key(b"z".to_vec())));
    }

    #[test(tokio::test)]
    async fn stream_range_yields_all_pairs_in_order() {
        let mock = MockTransport::new();
        for (k, v) in [("a", "1"), ("b", "2"), ("c", "3")] {
            mock.seed(Key(k.as_bytes().to_vec()), Value(v.as_bytes().to_vec()));
        }
        let context = ctx(&mock);
        let version = mock.current_version();
        let range = KeyRange::all();
        let pairs: Vec<(Key, Value)> = stream_range(context, range, version, false)
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[0].0, Key(b"a".to_vec()));
        assert_eq!(pairs[2].0, Key(b"c".to_vec()));
    }
}
