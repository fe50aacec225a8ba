//! §4.10 TSS Mismatch Handler: drains the shadow-verification channel and
//! quarantines (or clears) the offending shadow in a system-keys
//! transaction, persisting the mismatch record alongside.
//!
//! The dispatcher side that duplicates requests and detects mismatches in
//! the first place is part of the load-balance/dispatch path (§4.2,
//! §4.4.5); this crate only owns what happens once a mismatch has already
//! been detected and handed off.

use std::sync::Arc;

use fathom_base::{kind_err, Error, ErrorKind, Key, Result, TransactionOptions, Value};
pub use fathom_failure::MismatchRecord;
use fathom_failure::TssRegistry;
use fathom_txn::{Backoff, CommitOutcome, RetryAction, Transaction, TxnServices};
use fathom_wire::SsiId;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const MAX_ATTEMPTS: u32 = 10;

/// Corresponds to the `QUARANTINE_TSS_ON_MISMATCH` knob: whether a mismatch
/// marks the primary quarantined or instead clears the shadow's own
/// server-tag so it stops receiving shadow traffic.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TssPolicy {
    pub quarantine_on_mismatch: bool,
}

impl Default for TssPolicy {
    fn default() -> Self {
        TssPolicy { quarantine_on_mismatch: true }
    }
}

fn quarantine_key(id: SsiId) -> Key {
    Key(format!("\u{ff}/tssQuarantine/{}", id.0).into_bytes())
}

fn server_tag_key(id: SsiId) -> Key {
    Key(format!("\u{ff}/serverTag/{}", id.0).into_bytes())
}

fn mismatch_record_key(record: &MismatchRecord) -> Key {
    Key(format!("\u{ff}/tssMismatch/{}/{}/{}", record.shadow_id.0, record.timestamp, record.mismatch_uid).into_bytes())
}

pub struct TssMismatchHandler {
    services: Arc<TxnServices>,
    registry: TssRegistry,
    policy: TssPolicy,
}

impl TssMismatchHandler {
    pub fn new(services: Arc<TxnServices>, registry: TssRegistry, policy: TssPolicy) -> Self {
        TssMismatchHandler { services, registry, policy }
    }

    /// Drains `rx` until the sender side closes, handling each record in
    /// turn. A record that exhausts its retries is logged and dropped —
    /// the shadow stays paired and will surface again on the next
    /// mismatch, which is the same outcome a giving-up dispatcher would
    /// produce.
    pub async fn run(&self, mut rx: mpsc::Receiver<MismatchRecord>) {
        while let Some(record) = rx.recv().await {
            if let Err(e) = self.handle(record.clone()).await {
                warn!(target: "fathom", shadow_id = record.shadow_id.0, error = %e, "giving up on tss mismatch after retries");
            }
        }
    }

    /// The 5-step handling for one record (§4.10): locate the primary,
    /// quarantine (or detag) in a system-keys transaction together with
    /// the persisted mismatch record, then erase the pairing.
    pub async fn handle(&self, record: MismatchRecord) -> Result<()> {
        let Some(primary) = self.registry.primary_for(record.shadow_id) else {
            debug!(target: "fathom", shadow_id = record.shadow_id.0, "mismatch for an already-unpaired shadow, ignoring");
            return Ok(());
        };

        let mut backoff = Backoff::new();
        for attempt in 0..MAX_ATTEMPTS {
            match self.try_commit_once(primary, &record).await {
                Ok(CommitOutcome::Committed(_)) => {
                    self.registry.remove(primary);
                    debug!(target: "fathom", primary = primary.0, shadow_id = record.shadow_id.0, "tss pairing quarantined and erased");
                    return Ok(());
                }
                Ok(_conflict_or_unknown) => {
                    let action = backoff.classify(ErrorKind::NotCommitted, &self.services.knobs, None);
                    if !wait_out(action).await {
                        return Err(give_up(attempt));
                    }
                }
                Err(e) => {
                    let action = backoff.classify(e.kind(), &self.services.knobs, None);
                    if !wait_out(action).await {
                        return Err(e);
                    }
                }
            }
        }
        Err(give_up(MAX_ATTEMPTS))
    }

    async fn try_commit_once(&self, primary: SsiId, record: &MismatchRecord) -> Result<CommitOutcome> {
        let mut txn = Transaction::new(
            self.services.clone(),
            TransactionOptions { access_system_keys: true, ..Default::default() },
        );
        if self.policy.quarantine_on_mismatch {
            txn.set(quarantine_key(primary), Value(b"1".to_vec()))?;
        } else {
            txn.clear(server_tag_key(record.shadow_id));
        }
        txn.set(mismatch_record_key(record), Value(record.trace.clone().into_bytes()))?;
        txn.commit().await
    }
}

/// Sleeps out a retry action's delay and reports whether the caller should
/// retry at all (`Propagate` means no).
async fn wait_out(action: RetryAction) -> bool {
    match action {
        RetryAction::Reset { delay } | RetryAction::InvalidateCache { delay } => {
            tokio::time::sleep(delay).await;
            true
        }
        RetryAction::Propagate => false,
    }
}

fn give_up(attempts: u32) -> Error {
    kind_err(ErrorKind::Other, format!("tss mismatch handling exhausted retries after {attempts} attempts"))
}

#[cfg(test)]
mod test {
    use super::*;
    use fathom_base::Knobs;
    use fathom_wire::mock::MockTransport;
    use test_log::test;

    fn services(mock: &Arc<MockTransport>) -> Arc<TxnServices> {
        TxnServices::new(mock.clone(), mock.proxy(), mock.proxy(), Knobs::default())
    }

    #[test(tokio::test)]
    async fn quarantines_and_erases_pairing_on_success() {
        let mock = MockTransport::new();
        let registry = TssRegistry::new();
        registry.install(SsiId(1), SsiId(2));
        let handler = TssMismatchHandler::new(services(&mock), registry.clone(), TssPolicy::default());

        let record = MismatchRecord { shadow_id: SsiId(2), timestamp: 1000, mismatch_uid: 7, trace: "primary=1 shadow=2".into() };
        handler.handle(record).await.unwrap();

        assert_eq!(registry.shadow_for(SsiId(1)), None);
        let value = mock.peek(&quarantine_key(SsiId(1)));
        assert_eq!(value, Some(Value(b"1".to_vec())));
    }

    #[test(tokio::test)]
    async fn ignores_mismatch_for_unpaired_shadow() {
        let mock = MockTransport::new();
        let registry = TssRegistry::new();
        let handler = TssMismatchHandler::new(services(&mock), registry, TssPolicy::default());
        let record = MismatchRecord { shadow_id: SsiId(99), timestamp: 1, mismatch_uid: 1, trace: "x".into() };
        handler.handle(record).await.unwrap();
    }
}
