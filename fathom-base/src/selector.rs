use crate::key::Key;
use serde::{Deserialize, Serialize};

/// `{key, or_equal, offset}` — describes a key by relative position rather
/// than by exact value (§4.4.2). A resolved selector collapses to the
/// `offset`-th key from `key` (inclusive of `key` itself if `or_equal`).
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct KeySelector {
    pub key: Key,
    pub or_equal: bool,
    pub offset: i32,
}

impl KeySelector {
    pub fn new(key: Key, or_equal: bool, offset: i32) -> Self {
        KeySelector { key, or_equal, offset }
    }

    pub fn first_greater_or_equal(key: Key) -> Self {
        KeySelector::new(key, true, 1)
    }

    pub fn first_greater_than(key: Key) -> Self {
        KeySelector::new(key, false, 1)
    }

    pub fn last_less_or_equal(key: Key) -> Self {
        KeySelector::new(key, true, 0)
    }

    pub fn last_less_than(key: Key) -> Self {
        KeySelector::new(key, false, 0)
    }

    /// A selector resolved in place: `offset == 0 && or_equal` terminates
    /// the resolution loop in §4.4.2.
    pub fn is_resolved(&self) -> bool {
        self.offset == 0 && self.or_equal
    }

    /// Whether this selector, as written, walks backward from its anchor
    /// key (`offset <= 0`), per §4.4.2's "respecting backward lookup".
    pub fn is_backward(&self) -> bool {
        self.offset <= 0
    }

    pub fn add_offset(&self, delta: i32) -> Self {
        KeySelector::new(self.key.clone(), self.or_equal, self.offset + delta)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn first_greater_or_equal_is_resolved() {
        let sel = KeySelector::first_greater_or_equal(Key::from("m"));
        assert!(!sel.is_resolved());
        assert!(!sel.is_backward());
    }

    #[test]
    fn last_less_or_equal_is_resolved_and_backward() {
        let sel = KeySelector::last_less_or_equal(Key::from("m"));
        assert!(sel.is_resolved());
        assert!(sel.is_backward());
    }
}
