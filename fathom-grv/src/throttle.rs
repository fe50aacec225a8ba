use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use fathom_base::Priority;
use parking_lot::Mutex;

struct ThrottleEntry {
    rate: f64,
    expiration: Instant,
    last_check: Instant,
}

/// Per-priority `Tag -> {rate, expiration, last_check}`, populated by every
/// GRV reply's piggybacked `tag_rates` (§4.3, §3 "Throttle Table").
pub struct ThrottleTable {
    ttl: Duration,
    inner: Mutex<BTreeMap<(Priority, String), ThrottleEntry>>,
}

impl ThrottleTable {
    pub fn new(ttl: Duration) -> Self {
        ThrottleTable { ttl, inner: Mutex::new(BTreeMap::new()) }
    }

    /// Apply a GRV reply's tag-rate map for `priority`. This is a full
    /// replace for that priority: a tag previously tracked but absent from
    /// `tag_rates` is removed, per §4.3 "missing tags cause entry removal".
    pub fn apply_reply(&self, priority: Priority, tag_rates: &BTreeMap<String, f64>) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.retain(|(p, _), _| *p != priority);
        for (tag, rate) in tag_rates {
            inner.insert(
                (priority, tag.clone()),
                ThrottleEntry { rate: *rate, expiration: now + self.ttl, last_check: now },
            );
        }
    }

    /// The most recently advertised rate for `tag` under `priority`, or
    /// `None` if untracked or expired by wall clock.
    pub fn current_rate(&self, priority: Priority, tag: &str) -> Option<f64> {
        let inner = self.inner.lock();
        let e = inner.get(&(priority, tag.to_string()))?;
        if e.expiration < Instant::now() {
            None
        } else {
            Some(e.rate)
        }
    }

    pub fn last_checked(&self, priority: Priority, tag: &str) -> Option<Instant> {
        self.inner.lock().get(&(priority, tag.to_string())).map(|e| e.last_check)
    }
}

impl Default for ThrottleTable {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_log::test;

    #[test]
    fn apply_then_read() {
        let t = ThrottleTable::new(Duration::from_secs(60));
        let mut m = BTreeMap::new();
        m.insert("tagA".to_string(), 5.0);
        t.apply_reply(Priority::Default, &m);
        assert_eq!(t.current_rate(Priority::Default, "tagA"), Some(5.0));
        assert_eq!(t.current_rate(Priority::Batch, "tagA"), None);
    }

    #[test]
    fn missing_tag_is_evicted_on_next_reply() {
        let t = ThrottleTable::new(Duration::from_secs(60));
        let mut m = BTreeMap::new();
        m.insert("tagA".to_string(), 5.0);
        t.apply_reply(Priority::Default, &m);
        t.apply_reply(Priority::Default, &BTreeMap::new());
        assert_eq!(t.current_rate(Priority::Default, "tagA"), None);
    }

    #[test]
    fn expired_entry_reads_as_absent() {
        let t = ThrottleTable::new(Duration::from_millis(0));
        let mut m = BTreeMap::new();
        m.insert("tagA".to_string(), 5.0);
        t.apply_reply(Priority::Default, &m);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(t.current_rate(Priority::Default, "tagA"), None);
    }
}
