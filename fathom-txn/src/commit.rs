// Commit pipeline (§4.6): preparation, submission, maybe-delivered
// recovery, and post-commit effects.

use fathom_base::{self_conflict_key, ErrorKind, KeyRange, Result, Value, Version, Versionstamp};
use fathom_wire::protocol::{CommitFlags, CommitRequest};
use tracing::debug;

use crate::transaction::Transaction;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CommitOutcome {
    Committed(Version),
    Conflict,
    /// §4.6 "commit_unknown_result recovery": the dummy-transaction check
    /// ran and the original is now known not to have committed.
    UnknownButDidNotCommit,
    /// The dummy transaction also couldn't resolve the outcome; the caller
    /// must treat this as "maybe committed" and surface `commit_unknown_result`.
    TrulyUnknown,
}

impl Transaction {
    /// Drives the whole §4.6 pipeline and returns the outcome. On success,
    /// records the metadata-version cache entry, resolves the versionstamp
    /// promise, and arms every registered watch at the commit version.
    pub async fn commit(&mut self) -> Result<CommitOutcome> {
        if self.mutations.is_empty() && self.write_conflict_ranges.is_empty() {
            if !self.watches.is_empty() {
                let version = self.get_read_version().await?;
                self.arm_pending_watches(version).await;
            }
            return Ok(CommitOutcome::Committed(Version::INVALID));
        }

        if !self.options.causal_write_risky {
            self.ensure_self_conflict_range();
        }

        let read_snapshot = self.get_read_version().await?;
        let flags = CommitFlags {
            causal_write_risky: self.options.causal_write_risky,
            lock_aware: self.options.lock_aware,
            first_in_batch: self.options.first_in_batch,
        };
        let req = CommitRequest {
            mutations: self.mutations.clone(),
            read_conflict_ranges: self.read_conflict_ranges.clone(),
            write_conflict_ranges: self.write_conflict_ranges.clone(),
            read_snapshot,
            flags,
            tags: self.options.tags.clone(),
            cost_estimation: if self.options.expensive_clear_cost_estimation_enable {
                Some(self.estimate_cost())
            } else {
                None
            },
        };

        let commit_proxy = self.services.commit_proxy;
        match self.services.transport.commit(commit_proxy, req).await {
            Ok(reply) if reply.version.0 > 0 => {
                self.post_commit(reply.version, reply.batch_id, reply.metadata_version).await;
                Ok(CommitOutcome::Committed(reply.version))
            }
            Ok(_reply) => Ok(CommitOutcome::Conflict),
            Err(e) if matches!(e.kind(), ErrorKind::RequestMaybeDelivered | ErrorKind::CommitUnknownResult) => {
                if self.options.causal_write_risky {
                    return Ok(CommitOutcome::TrulyUnknown);
                }
                self.recover_via_dummy_transaction().await
            }
            Err(e) => Err(e),
        }
    }

    fn ensure_self_conflict_range(&mut self) {
        let overlaps = self
            .read_conflict_ranges
            .iter()
            .any(|r| self.write_conflict_ranges.iter().any(|w| r.intersects(w)));
        if overlaps {
            return;
        }
        let uuid: u128 = rand::random();
        let key = self_conflict_key(uuid);
        let range = KeyRange::singleton(key);
        self.read_conflict_ranges.push(range.clone());
        self.write_conflict_ranges.push(range.clone());
        self.last_self_conflict = Some(range);
    }

    /// Dummy transaction over the self-conflict singleton: if it commits
    /// cleanly, the original did not; the state of the self-conflict key
    /// is the only reliable witness of the original's outcome.
    async fn recover_via_dummy_transaction(&mut self) -> Result<CommitOutcome> {
        let Some(range) = self.last_self_conflict.clone() else {
            return Ok(CommitOutcome::TrulyUnknown);
        };
        let version = match self.get_read_version().await {
            Ok(v) => v,
            Err(_) => return Ok(CommitOutcome::TrulyUnknown),
        };
        let req = CommitRequest {
            mutations: vec![fathom_wire::protocol::Mutation::Set(range.begin.clone(), Value(vec![1]))],
            read_conflict_ranges: vec![range.clone()],
            write_conflict_ranges: vec![range],
            read_snapshot: version,
            flags: CommitFlags::default(),
            tags: vec![],
            cost_estimation: None,
        };
        match self.services.transport.commit(self.services.commit_proxy, req).await {
            Ok(reply) if reply.version.0 > 0 => Ok(CommitOutcome::UnknownButDidNotCommit),
            Ok(_) => Ok(CommitOutcome::TrulyUnknown),
            Err(_) => Ok(CommitOutcome::TrulyUnknown),
        }
    }

    async fn post_commit(&mut self, version: Version, batch_id: u16, metadata_version: Option<Value>) {
        self.services.metadata.record(version, metadata_version);
        let vs = Versionstamp::new(version, batch_id);
        self.resolve_versionstamp(vs);
        debug!(target: "fathom", version = version.0, watches = self.watches.len(), "transaction committed");
        self.arm_pending_watches(version).await;
    }

    fn estimate_cost(&self) -> u64 {
        self.mutations
            .iter()
            .map(|m| match m {
                fathom_wire::protocol::Mutation::Set(k, v) => (k.0.len() + v.0.len()) as u64,
                fathom_wire::protocol::Mutation::ClearRange(r) => (r.begin.0.len() + r.end.0.len()) as u64,
                fathom_wire::protocol::Mutation::Atomic(_, k, v) => (k.0.len() + v.0.len()) as u64,
                fathom_wire::protocol::Mutation::VersionstampedKey(k, v)
                | fathom_wire::protocol::Mutation::VersionstampedValue(k, v) => (k.0.len() + v.0.len()) as u64,
            })
            .sum()
    }
}
