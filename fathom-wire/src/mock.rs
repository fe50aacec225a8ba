//! A single-process, single-shard [`Transport`] good enough to drive every
//! unit test in this workspace without a live cluster — the fathom analogue
//! of `submerge-net::Node`, which is an in-process message queue rather
//! than a socket.
//!
//! `MockTransport` is intentionally simple: one storage server, one GRV/commit
//! proxy, no sharding, no TSS pairing (tests that need TSS pairing wrap a
//! second `MockTransport` and compare manually; see `fathom-tss`). What it
//! does model faithfully is conflict detection, so §8 scenario 3 ("commit
//! conflict") can be exercised end to end.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use fathom_base::{kind_err, ErrorKind, Key, KeyRange, KeySelector, Result, Value, Version};
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;

use crate::protocol::*;
use crate::ssi::{EndpointToken, ProxyId, Ssi, SsiId};

struct Inner {
    data: BTreeMap<Key, Value>,
    /// Version at which each still-live key was last written, for conflict
    /// detection against a transaction's read_snapshot.
    written_at: BTreeMap<Key, Version>,
    version: i64,
}

pub struct MockTransport {
    inner: Mutex<Inner>,
    ssi: Ssi,
    proxy: ProxyId,
    fail_next_commit: Mutex<Option<ErrorKind>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(MockTransport {
            inner: Mutex::new(Inner {
                data: BTreeMap::new(),
                written_at: BTreeMap::new(),
                version: 1,
            }),
            ssi: Ssi {
                id: SsiId(1),
                address: "mock://0".to_string(),
                get_value: EndpointToken(1),
                get_key: EndpointToken(2),
                get_key_values: EndpointToken(3),
                get_key_values_stream: EndpointToken(4),
                watch_value: EndpointToken(5),
                split_metrics: EndpointToken(6),
                get_read_hot_ranges: EndpointToken(7),
                get_range_split_points: EndpointToken(8),
            },
            proxy: ProxyId(1),
            fail_next_commit: Mutex::new(None),
        })
    }

    pub fn ssi(&self) -> Ssi {
        self.ssi.clone()
    }

    pub fn proxy(&self) -> ProxyId {
        self.proxy
    }

    pub fn current_version(&self) -> Version {
        Version(self.inner.lock().version)
    }

    /// Directly seed a value without going through commit, for test setup.
    pub fn seed(&self, key: Key, value: Value) {
        let mut inner = self.inner.lock();
        let v = inner.version;
        inner.data.insert(key.clone(), value);
        inner.written_at.insert(key, Version(v));
    }

    /// Reads a key straight out of the backing store, bypassing the
    /// transaction pipeline entirely; test-only inspection helper.
    pub fn peek(&self, key: &Key) -> Option<Value> {
        self.inner.lock().data.get(key).cloned()
    }

    /// Arranges for the next `commit()` call to fail with `kind` instead of
    /// applying, for exercising the §4.6/§4.7 retry and recovery paths.
    pub fn inject_commit_failure(&self, kind: ErrorKind) {
        *self.fail_next_commit.lock() = Some(kind);
    }

    fn resolve_selector(data: &BTreeMap<Key, Value>, sel: &KeySelector) -> Key {
        let mut keys: Vec<&Key> = data.keys().collect();
        keys.sort();
        let idx = match keys.binary_search(&&sel.key) {
            Ok(i) => {
                if sel.or_equal {
                    i as i64
                } else {
                    i as i64 + 1
                }
            }
            Err(i) => i as i64,
        };
        let target = idx + (sel.offset - 1) as i64;
        if target < 0 {
            Key(vec![])
        } else if target as usize >= keys.len() {
            KeyRange::all().end
        } else {
            keys[target as usize].clone()
        }
    }
}

#[async_trait]
impl crate::transport::Transport for MockTransport {
    async fn get_value(&self, _ssi: &Ssi, req: GetValueRequest) -> Result<GetValueReply> {
        let inner = self.inner.lock();
        Ok(GetValueReply { value: inner.data.get(&req.key).cloned() })
    }

    async fn get_key(&self, _ssi: &Ssi, req: GetKeyRequest) -> Result<GetKeyReply> {
        let inner = self.inner.lock();
        let key = Self::resolve_selector(&inner.data, &req.selector);
        Ok(GetKeyReply { selector: KeySelector::new(key, true, 0) })
    }

    async fn get_key_values(&self, _ssi: &Ssi, req: GetKeyValuesRequest) -> Result<GetKeyValuesReply> {
        let inner = self.inner.lock();
        let begin = Self::resolve_selector(&inner.data, &req.begin);
        let end = Self::resolve_selector(&inner.data, &req.end);
        if begin >= end {
            return Ok(GetKeyValuesReply { data: vec![], more: false, version: Version(inner.version) });
        }
        let mut items: Vec<(Key, Value)> = inner
            .data
            .range(begin..end)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if req.reverse {
            items.reverse();
        }
        let limit = req.limit.rows.unwrap_or(u32::MAX) as usize;
        let more = items.len() > limit;
        items.truncate(limit);
        Ok(GetKeyValuesReply { data: items, more, version: Version(inner.version) })
    }

    fn get_key_values_stream(
        &self,
        ssi: &Ssi,
        req: GetKeyValuesRequest,
    ) -> BoxStream<'static, Result<GetKeyValuesStreamChunk>> {
        let inner = self.inner.lock();
        let begin = Self::resolve_selector(&inner.data, &req.begin);
        let end = Self::resolve_selector(&inner.data, &req.end);
        let items: Vec<(Key, Value)> = if begin < end {
            inner.data.range(begin..end).map(|(k, v)| (k.clone(), v.clone())).collect()
        } else {
            vec![]
        };
        let version = Version(inner.version);
        drop(inner);
        let _ = ssi;
        stream::once(async move {
            Ok(GetKeyValuesStreamChunk { data: items, more: false, version, cached: false })
        })
        .boxed()
    }

    async fn watch_value(&self, _ssi: &Ssi, req: WatchValueRequest) -> Result<WatchValueReply> {
        // Polling mock: resolves immediately if the current value already
        // differs from the watched value, else errors to avoid hanging
        // tests forever; real watch semantics live in `fathom-watch` and
        // are exercised against a channel-driven fake, not this mock.
        let inner = self.inner.lock();
        let now = inner.data.get(&req.key).cloned();
        if now != req.value {
            Ok(WatchValueReply { version: Version(inner.version) })
        } else {
            Err(kind_err(ErrorKind::Other, "mock watch: value unchanged, no transport to block on"))
        }
    }

    async fn get_read_version(
        &self,
        _proxy: ProxyId,
        _req: GetReadVersionRequest,
    ) -> Result<GetReadVersionReply> {
        let inner = self.inner.lock();
        Ok(GetReadVersionReply {
            version: Version(inner.version),
            metadata_version: None,
            tag_rates: Default::default(),
            locked: false,
            mid_shard_size: None,
        })
    }

    async fn commit(&self, _proxy: ProxyId, req: CommitRequest) -> Result<CommitReply> {
        if let Some(kind) = self.fail_next_commit.lock().take() {
            return Err(kind_err(kind, "injected commit failure"));
        }
        let mut inner = self.inner.lock();
        let mut conflicts = Vec::new();
        for (idx, range) in req.read_conflict_ranges.iter().enumerate() {
            for (k, wrote_at) in inner.written_at.range(range.begin.clone()..range.end.clone()) {
                let _ = k;
                if wrote_at.0 > req.read_snapshot.0 {
                    conflicts.push(idx as u32);
                    break;
                }
            }
        }
        if !conflicts.is_empty() {
            return Ok(CommitReply {
                version: Version::INVALID,
                conflicting_kr_indices: Some(conflicts),
                metadata_version: None,
                batch_id: 0,
            });
        }
        inner.version += 1;
        let v = inner.version;
        for m in req.mutations {
            match m {
                Mutation::Set(k, val) => {
                    inner.data.insert(k.clone(), val);
                    inner.written_at.insert(k, Version(v));
                }
                Mutation::ClearRange(r) => {
                    let keys: Vec<Key> = inner.data.range(r.begin.clone()..r.end.clone()).map(|(k, _)| k.clone()).collect();
                    for k in keys {
                        inner.data.remove(&k);
                        inner.written_at.insert(k, Version(v));
                    }
                }
                Mutation::Atomic(op, k, operand) => {
                    let cur = inner.data.get(&k).cloned();
                    let new = apply_atomic(op, cur, &operand);
                    match new {
                        Some(val) => {
                            inner.data.insert(k.clone(), val);
                        }
                        None => {
                            inner.data.remove(&k);
                        }
                    }
                    inner.written_at.insert(k, Version(v));
                }
                Mutation::VersionstampedKey(mut k, val) => {
                    k.0.extend_from_slice(&(v as i64).to_be_bytes());
                    inner.data.insert(k.clone(), val);
                    inner.written_at.insert(k, Version(v));
                }
                Mutation::VersionstampedValue(k, mut val) => {
                    val.0.extend_from_slice(&(v as i64).to_be_bytes());
                    inner.data.insert(k.clone(), val);
                    inner.written_at.insert(k, Version(v));
                }
            }
        }
        for r in req.write_conflict_ranges {
            inner.written_at.insert(r.begin, Version(v));
        }
        Ok(CommitReply {
            version: Version(v),
            conflicting_kr_indices: None,
            metadata_version: None,
            batch_id: 0,
        })
    }

    async fn get_key_server_locations(
        &self,
        _coordinator: ProxyId,
        _req: GetKeyServerLocationsRequest,
    ) -> Result<GetKeyServerLocationsReply> {
        Ok(GetKeyServerLocationsReply {
            results: vec![(KeyRange::all(), vec![self.ssi.clone()])],
            tss_mappings: vec![],
        })
    }

    async fn split_metrics(&self, _ssi: &Ssi, req: SplitMetricsRequest) -> Result<SplitMetricsReply> {
        let inner = self.inner.lock();
        let keys: Vec<Key> = inner.data.range(req.range.begin.clone()..req.range.end.clone()).map(|(k, _)| k.clone()).collect();
        Ok(SplitMetricsReply { split_points: keys })
    }

    async fn wait_metrics(&self, _ssi: &Ssi, req: WaitMetricsRequest) -> Result<WaitMetricsReply> {
        let inner = self.inner.lock();
        let bytes: u64 = inner
            .data
            .range(req.range.begin.clone()..req.range.end.clone())
            .map(|(k, v)| (k.0.len() + v.0.len()) as u64)
            .sum();
        Ok(WaitMetricsReply { bytes })
    }

    async fn get_read_hot_ranges(
        &self,
        _ssi: &Ssi,
        _req: GetReadHotRangesRequest,
    ) -> Result<GetReadHotRangesReply> {
        Ok(GetReadHotRangesReply { ranges: vec![] })
    }

    async fn get_range_split_points(
        &self,
        _ssi: &Ssi,
        req: GetRangeSplitPointsRequest,
    ) -> Result<GetRangeSplitPointsReply> {
        let inner = self.inner.lock();
        let keys: Vec<Key> = inner
            .data
            .range(req.range.begin.clone()..req.range.end.clone())
            .map(|(k, _)| k.clone())
            .collect();
        Ok(GetRangeSplitPointsReply { split_points: keys })
    }
}

fn apply_atomic(op: AtomicOp, cur: Option<Value>, operand: &Value) -> Option<Value> {
    use AtomicOp::*;
    let cur_i = |v: &Value| -> i64 {
        let mut buf = [0u8; 8];
        let n = v.0.len().min(8);
        buf[..n].copy_from_slice(&v.0[..n]);
        i64::from_le_bytes(buf)
    };
    let to_val = |i: i64| Value(i.to_le_bytes().to_vec());
    match op {
        Add => {
            let a = cur.as_ref().map(|v| cur_i(v)).unwrap_or(0);
            let b = cur_i(operand);
            Some(to_val(a.wrapping_add(b)))
        }
        Or => Some(cur.unwrap_or_else(|| operand.clone())),
        And | AndV2 => match cur {
            Some(v) => Some(Value(v.0.iter().zip(operand.0.iter()).map(|(a, b)| a & b).collect())),
            None if matches!(op, AndV2) => Some(operand.clone()),
            None => None,
        },
        Xor => match cur {
            Some(v) => Some(Value(v.0.iter().zip(operand.0.iter()).map(|(a, b)| a ^ b).collect())),
            None => Some(operand.clone()),
        },
        Min | MinV2 => match cur {
            Some(v) => Some(if v.0 < operand.0 { v } else { operand.clone() }),
            None if matches!(op, MinV2) => Some(operand.clone()),
            None => None,
        },
        Max => match cur {
            Some(v) => Some(if v.0 > operand.0 { v } else { operand.clone() }),
            None => None,
        },
        ByteMin => match cur {
            Some(v) => Some(if v.0 <= operand.0 { v } else { operand.clone() }),
            None => Some(operand.clone()),
        },
        ByteMax => match cur {
            Some(v) => Some(if v.0 >= operand.0 { v } else { operand.clone() }),
            None => Some(operand.clone()),
        },
        AppendIfFits => match cur {
            Some(mut v) => {
                v.0.extend_from_slice(&operand.0);
                Some(v)
            }
            None => Some(operand.clone()),
        },
        CompareAndClear => {
            if cur.as_ref() == Some(operand) {
                None
            } else {
                cur
            }
        }
        SetVersionstampedKey | SetVersionstampedValue => Some(operand.clone()),
    }
}

#[allow(unused)]
fn _assert_send_sync() {
    fn is_send_sync<T: Send + Sync>() {}
    is_send_sync::<MockTransport>();
}
