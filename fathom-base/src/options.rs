use std::time::Duration;

/// Wire trace format, mirrored from the collaborator-defined tracing
/// bootstrap (§6 network options); fathom only stores the selection, it
/// does not implement the bootstrap itself.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TraceFormat {
    Xml,
    Json,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DistributedClientTracer {
    None,
    LogFile,
    NetworkLossy,
}

/// Process-wide network options, set once before any `DatabaseContext` is
/// created.
#[derive(Clone, Debug)]
pub enum NetworkOption {
    TraceEnable(Option<String>),
    TraceRollSize(u64),
    TraceMaxLogsSize(u64),
    TraceFormat(TraceFormat),
    TraceFileIdentifier(String),
    TraceLogGroup(String),
    TraceClockSource(String),
    Knob { name: String, value: String },
    TlsCertPath(String),
    TlsCertBytes(Vec<u8>),
    TlsCaPath(String),
    TlsCaBytes(Vec<u8>),
    TlsKeyPath(String),
    TlsKeyBytes(Vec<u8>),
    TlsPassword(String),
    TlsVerifyPeers(String),
    DisableClientStatisticsLogging,
    EnableRunLoopProfiling,
    SupportedClientVersions(String),
    DistributedClientTracer(DistributedClientTracer),
}

/// `DatabaseContext`-scoped options (§4.8). Each is either a direct context
/// mutation or a default stamped onto every new transaction; see
/// `fathom-db::options` for which is which.
#[derive(Clone, Debug)]
pub enum DatabaseOption {
    LocationCacheSize(usize),
    MachineId(String),
    MaxWatches(usize),
    DatacenterId(String),
    SnapshotRywEnable,
    SnapshotRywDisable,
    TransactionLoggingEnable(String),
    TransactionLoggingDisable,
    UseConfigDatabase,
    TestCausalReadRisky,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Priority {
    Default,
    Batch,
    SystemImmediate,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Default
    }
}

/// Per-transaction options (§3 `Transaction State::options`, §6).
#[derive(Clone, Debug, Default)]
pub struct TransactionOptions {
    pub causal_read_risky: bool,
    pub causal_write_risky: bool,
    pub priority: Priority,
    pub initialize_new_database: bool,
    pub access_system_keys: bool,
    pub read_system_keys: bool,
    pub timeout: Option<Duration>,
    pub retry_limit: Option<u32>,
    pub max_retry_delay: Option<Duration>,
    pub size_limit: Option<usize>,
    pub lock_aware: bool,
    pub read_lock_aware: bool,
    pub first_in_batch: bool,
    pub use_provisional_proxies: bool,
    pub include_port_in_address: bool,
    pub tags: Vec<String>,
    pub auto_throttle_tags: Vec<String>,
    pub span_parent: Option<[u8; 16]>,
    pub report_conflicting_keys: bool,
    pub expensive_clear_cost_estimation_enable: bool,
    pub debug_transaction_identifier: Option<String>,
    pub log_transaction: bool,
    pub transaction_logging_max_field_length: Option<i32>,
    pub server_request_tracing: bool,
    pub commit_on_first_proxy: bool,
}

/// Size and timing constants from §4 and §7, collected here so
/// `fathom-db`'s `set_option`/knob overrides have one place to adjust
/// them.
#[derive(Clone, Debug)]
pub struct Knobs {
    pub key_size_limit: usize,
    pub value_size_limit: usize,
    pub max_batch_size: usize,
    pub grv_batch_timeout: Duration,
    pub broadcast_batch_size: usize,
    pub wrong_shard_server_delay: Duration,
    pub future_version_retry_delay: Duration,
    pub backoff_growth_rate: f64,
    pub default_max_backoff: Duration,
    pub resource_constrained_max_backoff: Duration,
    pub rangestream_buffered_fragments_limit: usize,
    pub rangestream_fragment_split_bytes: u64,
    pub load_balance_timeout: Duration,
    pub load_balance_tss_timeout: Duration,
    pub location_cache_size: usize,
    pub cache_eviction_batch: usize,
    /// Capacity of the metadata-version ring cache (§3 `Metadata-Version
    /// Cache`).
    pub metadata_version_ring_size: usize,
    /// Hard-coded in the source as a 50M-version threshold after a watch
    /// fires to decide whether to return directly or re-check the value;
    /// §9 flags this as worth revisiting, so it's a knob rather than a
    /// constant.
    pub watch_stale_version_threshold: i64,
    /// Escape hatch for any `knob=<name>=<value>` network option that
    /// doesn't map onto a typed field above.
    pub extra: std::collections::BTreeMap<String, String>,
}

impl Default for Knobs {
    fn default() -> Self {
        Knobs {
            key_size_limit: 10_000,
            value_size_limit: 100_000,
            max_batch_size: 1_000,
            grv_batch_timeout: Duration::from_millis(5),
            broadcast_batch_size: 20,
            wrong_shard_server_delay: Duration::from_millis(10),
            future_version_retry_delay: Duration::from_millis(1000),
            backoff_growth_rate: 2.0,
            default_max_backoff: Duration::from_millis(1000),
            resource_constrained_max_backoff: Duration::from_millis(30_000),
            rangestream_buffered_fragments_limit: 20,
            rangestream_fragment_split_bytes: 1_000_000,
            load_balance_timeout: Duration::from_millis(5_000),
            load_balance_tss_timeout: Duration::from_millis(5_000),
            location_cache_size: 100_000,
            cache_eviction_batch: 100,
            metadata_version_ring_size: 64,
            watch_stale_version_threshold: 50_000_000,
            extra: std::collections::BTreeMap::new(),
        }
    }
}
