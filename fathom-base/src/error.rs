// We want a few things here:
// 1. A way to create a new error with a backtrace
// 2. A way to centralize setting a breakpoint to trap any error in the system fairly soon
//    after it's created (or at least when it's propagated from a library we use back to us)
// 3. Same but for logging / emitting error messages into the tracing/logging system
// 4. A structured kind alongside the opaque backtrace so the retry loop can classify
//    without downcasting.

use std::borrow::Cow;
use backtrace_error::DynBacktraceError;
use tracing::error;

#[cfg(test)]
use test_log::test;

/// The §7 error taxonomy. Retriable and version-drift and shard-cache-invalidation
/// classes are handled by the retry loop (see `fathom-txn::retry`); user-fatal
/// errors propagate to the caller untouched.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ErrorKind {
    // Transient-retry
    NotCommitted,
    CommitUnknownResult,
    DatabaseLocked,
    ProxyMemoryLimitExceeded,
    ProcessBehind,
    BatchTransactionThrottled,
    TagThrottled,
    // Version-drift
    TransactionTooOld,
    FutureVersion,
    // Shard-cache-invalidation
    WrongShardServer,
    AllAlternativesFailed,
    RequestMaybeDelivered,
    // User-fatal
    KeyTooLarge,
    ValueTooLarge,
    RangeLimitsInvalid,
    ClientInvalidOperation,
    InvalidOptionValue,
    ReadVersionAlreadySet,
    VersionInvalid,
    TooManyWatches,
    WatchCancelled,
    TimedOut,
    // Anything not named above (connection failures, internal invariant
    // breaks, wrapped I/O errors, etc). Callers should not rely on this
    // variant's meaning staying fixed across releases.
    Other,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum RetryClass {
    TransientRetry,
    VersionDrift,
    ShardCacheInvalidation,
    Fatal,
}

impl ErrorKind {
    pub fn retry_class(self) -> RetryClass {
        use ErrorKind::*;
        use RetryClass::*;
        match self {
            NotCommitted
            | CommitUnknownResult
            | DatabaseLocked
            | ProxyMemoryLimitExceeded
            | ProcessBehind
            | BatchTransactionThrottled
            | TagThrottled => TransientRetry,
            TransactionTooOld | FutureVersion => VersionDrift,
            WrongShardServer | AllAlternativesFailed | RequestMaybeDelivered => {
                ShardCacheInvalidation
            }
            _ => Fatal,
        }
    }

    pub fn is_retriable(self) -> bool {
        !matches!(self.retry_class(), RetryClass::Fatal)
    }
}

#[derive(Debug)]
#[allow(dead_code)]
pub struct Error {
    inner: DynBacktraceError,
    kind: ErrorKind,
}
pub type Result<T> = std::result::Result<T, Error>;

struct SimpleErr(Cow<'static, str>);
impl std::fmt::Debug for SimpleErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::fmt::Display for SimpleErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl std::error::Error for SimpleErr {
    fn description(&self) -> &str {
        &self.0
    }
}

impl<E: std::error::Error + Send + Sync + 'static> From<E> for Error {
    fn from(err: E) -> Error {
        Error::with_kind(err, ErrorKind::Other)
    }
}

impl Error {
    pub fn with_kind<E: std::error::Error + Send + Sync + 'static>(
        err: E,
        kind: ErrorKind,
    ) -> Error {
        error!(target: "fathom", kind = ?kind, "{:?}", err);
        let inner = DynBacktraceError::from(err);
        Error { inner, kind }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is_retriable(&self) -> bool {
        self.kind.is_retriable()
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.inner)
    }
}

/// Build an opaque, backtrace-carrying error of kind [`ErrorKind::Other`].
pub fn err(msg: impl Into<Cow<'static, str>>) -> Error {
    kind_err(ErrorKind::Other, msg)
}

/// Build an error with an explicit taxonomy kind, for sites that know which
/// §7 class they're raising (size limits, option validation, shard misses).
pub fn kind_err(kind: ErrorKind, msg: impl Into<Cow<'static, str>>) -> Error {
    let err = SimpleErr(msg.into());
    Error::with_kind(err, kind)
}

#[test]
fn test_error() {
    let e = err("test error");
    assert_eq!(e.kind(), ErrorKind::Other);
}

#[test]
fn test_retry_classification() {
    assert!(ErrorKind::NotCommitted.is_retriable());
    assert!(ErrorKind::WrongShardServer.is_retriable());
    assert!(ErrorKind::TransactionTooOld.is_retriable());
    assert!(!ErrorKind::KeyTooLarge.is_retriable());
    assert!(!ErrorKind::RangeLimitsInvalid.is_retriable());
}
