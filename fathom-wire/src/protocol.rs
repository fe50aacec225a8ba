// Wire request/reply shapes from §6 "External Interfaces". These are the
// collaborator contract: the actual RPC transport and codec are out of
// scope (§1), but the shapes are not, since every component above the
// transport line needs to agree on them. Plain structs with `serde`
// derives; the wire codec itself is left to the `Transport` implementation.

use fathom_base::{Key, KeySelector, KeyRange, Priority, Value, Version};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::ssi::{ProxyId, Ssi};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Default, Serialize, Deserialize)]
pub struct TransactionFlags {
    pub causal_read_risky: bool,
    pub first_in_batch: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetReadVersionRequest {
    pub count: u32,
    pub priority: Priority,
    pub flags: TransactionFlags,
    pub tags: Vec<String>,
    pub debug_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetReadVersionReply {
    pub version: Version,
    pub metadata_version: Option<Value>,
    pub tag_rates: BTreeMap<String, f64>,
    pub locked: bool,
    pub mid_shard_size: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetKeyServerLocationsRequest {
    pub begin: Key,
    pub end: Option<Key>,
    pub limit: u32,
    pub reverse: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetKeyServerLocationsReply {
    pub results: Vec<(KeyRange, Vec<Ssi>)>,
    pub tss_mappings: Vec<(crate::ssi::SsiId, crate::ssi::SsiId)>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetValueRequest {
    pub key: Key,
    pub version: Version,
    pub tags: Vec<String>,
    pub debug_id: Option<String>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct GetValueReply {
    pub value: Option<Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetKeyRequest {
    pub selector: KeySelector,
    pub version: Version,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct GetKeyReply {
    pub selector: KeySelector,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Default, Serialize, Deserialize)]
pub struct RangeLimits {
    pub rows: Option<u32>,
    pub bytes: Option<u32>,
    pub min_rows: Option<u32>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetKeyValuesRequest {
    pub begin: KeySelector,
    pub end: KeySelector,
    pub version: Version,
    pub limit: RangeLimits,
    pub reverse: bool,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct GetKeyValuesReply {
    pub data: Vec<(Key, Value)>,
    pub more: bool,
    pub version: Version,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetKeyValuesStreamChunk {
    pub data: Vec<(Key, Value)>,
    pub more: bool,
    pub version: Version,
    pub cached: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WatchValueRequest {
    pub key: Key,
    pub value: Option<Value>,
    pub version: Version,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WatchValueReply {
    pub version: Version,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    Set(Key, Value),
    ClearRange(KeyRange),
    Atomic(AtomicOp, Key, Value),
    VersionstampedKey(Key, Value),
    VersionstampedValue(Key, Value),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum AtomicOp {
    Add,
    And,
    AndV2,
    Or,
    Xor,
    Min,
    MinV2,
    Max,
    ByteMin,
    ByteMax,
    AppendIfFits,
    CompareAndClear,
    SetVersionstampedKey,
    SetVersionstampedValue,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Default, Serialize, Deserialize)]
pub struct CommitFlags {
    pub causal_write_risky: bool,
    pub lock_aware: bool,
    pub first_in_batch: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommitRequest {
    pub mutations: Vec<Mutation>,
    pub read_conflict_ranges: Vec<KeyRange>,
    pub write_conflict_ranges: Vec<KeyRange>,
    pub read_snapshot: Version,
    pub flags: CommitFlags,
    pub tags: Vec<String>,
    pub cost_estimation: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommitReply {
    pub version: Version,
    pub conflicting_kr_indices: Option<Vec<u32>>,
    pub metadata_version: Option<Value>,
    pub batch_id: u16,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SplitMetricsRequest {
    pub range: KeyRange,
    pub chunk_size_bytes: u64,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SplitMetricsReply {
    pub split_points: Vec<Key>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WaitMetricsRequest {
    pub range: KeyRange,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct WaitMetricsReply {
    pub bytes: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetReadHotRangesRequest {
    pub range: KeyRange,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetReadHotRangesReply {
    pub ranges: Vec<KeyRange>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetRangeSplitPointsRequest {
    pub range: KeyRange,
    pub chunk_size_bytes: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetRangeSplitPointsReply {
    pub split_points: Vec<Key>,
}

pub type CoordinatorId = ProxyId;
