//! `DatabaseContext` (§4.8): the object that owns every cache, proxy
//! handle, and background task a running client needs, and the one place
//! `set_option` and status/health readers live.
//!
//! Everything a `Transaction` actually touches during a read or commit
//! lives in `fathom-txn`; this crate is the wiring and bookkeeping layer
//! above it — metadata-version ring, telemetry counters, TSS registry,
//! transaction-default options, cluster-descriptor bookkeeping.

mod context;
mod counters;
mod metadata;

pub use context::{ClusterDescriptor, DatabaseContext, DatabaseStatus};
pub use counters::{Counters, CountersSnapshot};
pub use metadata::MetadataVersionRing;
