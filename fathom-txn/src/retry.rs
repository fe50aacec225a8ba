// Retry loop and error taxonomy actions (§4.7). `Transaction::on_error`
// is the only thing here that touches a live transaction; everything else
// is pure so it can be driven from a model checker (see the `stateright`
// test below) as well as the real async loop.

use std::time::Duration;

use fathom_base::{ErrorKind, Knobs, Priority, RetryClass};
use fathom_grv::ThrottleTable;
use rand::Rng;

/// Context `classify` needs only for `ErrorKind::TagThrottled` (§4.7
/// "tag_throttled additionally picks up the tag's minimum rechecked
/// delay"): the transaction's priority and tags, and the shared throttle
/// table those tags' rates are piggybacked onto by GRV replies.
pub struct TagThrottleContext<'a> {
    pub priority: Priority,
    pub tags: &'a [String],
    pub table: &'a ThrottleTable,
}

/// What the retry loop should do in response to a classified error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryAction {
    /// Reset the transaction (new read version, cleared mutation buffer)
    /// and retry after `delay`.
    Reset { delay: Duration },
    /// Invalidate the relevant location-cache entries and retry without
    /// resetting transaction state.
    InvalidateCache { delay: Duration },
    /// Propagate to the caller; the transaction is not retried.
    Propagate,
}

/// Per-transaction backoff state, grown monotonically across retries and
/// reset to the floor whenever a transaction is reset successfully.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    current: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Backoff { current: Duration::from_millis(10) }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    /// Classify `kind` and decide the retry action, growing `self` in
    /// place for `TransientRetry` classes per §4.7's table. `tag_throttle`
    /// is consulted only when `kind` is `TagThrottled`; pass `None` when no
    /// such context is available (the generic jittered backoff is used as
    /// a fallback).
    pub fn classify(&mut self, kind: ErrorKind, knobs: &Knobs, tag_throttle: Option<TagThrottleContext>) -> RetryAction {
        match kind.retry_class() {
            RetryClass::TransientRetry => {
                if kind == ErrorKind::TagThrottled {
                    if let Some(delay) = tag_throttle.and_then(|ctx| Self::tag_rechecked_delay(&ctx)) {
                        self.current = grow(self.current, knobs.backoff_growth_rate, knobs.default_max_backoff);
                        return RetryAction::Reset { delay };
                    }
                }
                let max = if kind == ErrorKind::ProxyMemoryLimitExceeded {
                    knobs.resource_constrained_max_backoff
                } else {
                    knobs.default_max_backoff
                };
                let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
                let delay = self.current.mul_f64(jitter);
                self.current = grow(self.current, knobs.backoff_growth_rate, max);
                RetryAction::Reset { delay }
            }
            RetryClass::VersionDrift => {
                let max = knobs.default_max_backoff;
                let delay = knobs.future_version_retry_delay.min(max);
                RetryAction::Reset { delay }
            }
            RetryClass::ShardCacheInvalidation => {
                RetryAction::InvalidateCache { delay: knobs.wrong_shard_server_delay }
            }
            RetryClass::Fatal => RetryAction::Propagate,
        }
    }

    /// The shortest "wait this long before rechecking" interval across the
    /// transaction's throttled tags, derived from each tag's advertised
    /// rate (higher rate, shorter recheck interval). `None` if none of the
    /// transaction's tags currently carry a tracked rate.
    fn tag_rechecked_delay(ctx: &TagThrottleContext) -> Option<Duration> {
        ctx.tags
            .iter()
            .filter_map(|tag| ctx.table.current_rate(ctx.priority, tag))
            .filter(|rate| *rate > 0.0)
            .map(|rate| Duration::from_secs_f64(1.0 / rate))
            .min()
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

fn grow(current: Duration, rate: f64, max: Duration) -> Duration {
    let grown = current.mul_f64(rate);
    if grown > max {
        max
    } else {
        grown
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_log::test;

    #[test]
    fn transient_retry_grows_and_resets() {
        let knobs = Knobs::default();
        let mut b = Backoff::new();
        let a1 = b.classify(ErrorKind::NotCommitted, &knobs, None);
        assert!(matches!(a1, RetryAction::Reset { .. }));
        assert!(b.current() > Duration::from_millis(10));
    }

    #[test]
    fn version_drift_resets_without_growing_backoff() {
        let knobs = Knobs::default();
        let mut b = Backoff::new();
        let before = b.current();
        let action = b.classify(ErrorKind::FutureVersion, &knobs, None);
        assert!(matches!(action, RetryAction::Reset { .. }));
        assert_eq!(b.current(), before);
    }

    #[test]
    fn shard_cache_invalidation_does_not_reset() {
        let knobs = Knobs::default();
        let mut b = Backoff::new();
        let action = b.classify(ErrorKind::WrongShardServer, &knobs, None);
        assert_eq!(action, RetryAction::InvalidateCache { delay: knobs.wrong_shard_server_delay });
    }

    #[test]
    fn fatal_errors_propagate() {
        let knobs = Knobs::default();
        let mut b = Backoff::new();
        let action = b.classify(ErrorKind::KeyTooLarge, &knobs, None);
        assert_eq!(action, RetryAction::Propagate);
    }

    #[test]
    fn tag_throttled_picks_up_tags_rechecked_delay() {
        let knobs = Knobs::default();
        let mut b = Backoff::new();
        let table = ThrottleTable::new(Duration::from_secs(60));
        let mut rates = std::collections::BTreeMap::new();
        rates.insert("busy-tag".to_string(), 4.0); // 1/4s recheck interval
        table.apply_reply(Priority::Default, &rates);
        let tags = vec!["busy-tag".to_string()];
        let ctx = TagThrottleContext { priority: Priority::Default, tags: &tags, table: &table };
        let action = b.classify(ErrorKind::TagThrottled, &knobs, Some(ctx));
        assert_eq!(action, RetryAction::Reset { delay: Duration::from_millis(250) });
    }

    #[test]
    fn tag_throttled_falls_back_without_tracked_rate() {
        let knobs = Knobs::default();
        let mut b = Backoff::new();
        let table = ThrottleTable::new(Duration::from_secs(60));
        let tags = vec!["untracked".to_string()];
        let ctx = TagThrottleContext { priority: Priority::Default, tags: &tags, table: &table };
        let action = b.classify(ErrorKind::TagThrottled, &knobs, Some(ctx));
        assert!(matches!(action, RetryAction::Reset { .. }));
    }

    // Model-checked invariant: no matter how many consecutive
    // TransientRetry classifications occur, backoff never exceeds the
    // configured ceiling, checked exhaustively with `stateright` rather
    // than by example.
    mod model {
        use super::*;
        use stateright::{Model, Property};

        #[derive(Clone, Debug, Hash)]
        struct BackoffModel {
            max_steps: usize,
        }

        impl Model for BackoffModel {
            type State = (u64, usize); // (backoff millis, steps taken)
            type Action = ();

            fn init_states(&self) -> Vec<Self::State> {
                vec![(10, 0)]
            }

            fn actions(&self, state: &Self::State, actions: &mut Vec<Self::Action>) {
                if state.1 < self.max_steps {
                    actions.push(());
                }
            }

            fn next_state(&self, state: &Self::State, _action: Self::Action) -> Option<Self::State> {
                let knobs = Knobs::default();
                let grown = grow(
                    Duration::from_millis(state.0),
                    knobs.backoff_growth_rate,
                    knobs.default_max_backoff,
                );
                Some((grown.as_millis() as u64, state.1 + 1))
            }

            fn properties(&self) -> Vec<Property<Self>> {
                vec![Property::always("bounded by max_backoff", |model, state| {
                    let knobs = Knobs::default();
                    state.0 <= knobs.default_max_backoff.as_millis() as u64
                })]
            }
        }

        #[test]
        fn backoff_never_exceeds_ceiling() {
            use stateright::Checker;
            BackoffModel { max_steps: 20 }.checker().spawn_bfs().join().assert_properties();
        }
    }
}
