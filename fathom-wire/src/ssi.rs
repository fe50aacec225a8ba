use serde::{Deserialize, Serialize};

/// Stable identity of one storage-server endpoint. If a server migrates,
/// its tokens change; a cached [`Ssi`] whose tokens no longer match the
/// one returned by a fresh location lookup is stale and must be refreshed,
/// not patched in place (§3 `Storage-Server Interface`).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct EndpointToken(pub u64);

/// A storage server identity plus its per-operation endpoint tokens.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Ssi {
    pub id: SsiId,
    pub address: String,
    pub get_value: EndpointToken,
    pub get_key: EndpointToken,
    pub get_key_values: EndpointToken,
    pub get_key_values_stream: EndpointToken,
    pub watch_value: EndpointToken,
    pub split_metrics: EndpointToken,
    pub get_read_hot_ranges: EndpointToken,
    pub get_range_split_points: EndpointToken,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct SsiId(pub u64);

impl Ssi {
    /// Whether `other` is a fresh location record for the *same* server
    /// (same id) that has since migrated (any endpoint token differs).
    pub fn has_migrated_from(&self, other: &Ssi) -> bool {
        self.id == other.id
            && (self.get_value != other.get_value
                || self.get_key != other.get_key
                || self.get_key_values != other.get_key_values
                || self.get_key_values_stream != other.get_key_values_stream
                || self.watch_value != other.watch_value)
    }
}

/// Identity of a GRV or commit proxy (§1, §6). Proxies don't have the rich
/// per-operation endpoint set storage servers do; they're addressed
/// directly.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct ProxyId(pub u64);

/// A `LocationInfo` is the replica set serving one shard, shared by every
/// transaction that reads it; reference-counted so that `Arc::ptr_eq` can
/// distinguish "the same cached entry" from "coincidentally identical
/// replica set" when deciding whether a cache invalidation actually
/// changed anything (§3 `LocationInfo`, §9 open question on refresh
/// observables).
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct LocationInfo {
    pub ssis: Vec<Ssi>,
    pub has_caches: bool,
}

impl LocationInfo {
    pub fn new(ssis: Vec<Ssi>, has_caches: bool) -> Self {
        LocationInfo { ssis, has_caches }
    }
}
