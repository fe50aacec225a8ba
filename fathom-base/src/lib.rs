mod error;
mod key;
mod options;
mod selector;
mod version;

pub use error::{err, kind_err, Error, ErrorKind, Result, RetryClass};
pub use key::{key_after, metadata_version_key, self_conflict_key, Key, KeyRange, Value};
pub use options::{
    DatabaseOption, DistributedClientTracer, Knobs, NetworkOption, Priority, TraceFormat,
    TransactionOptions,
};
pub use selector::KeySelector;
pub use version::{Version, Versionstamp};
