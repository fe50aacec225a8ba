use serde::{Deserialize, Serialize};
use std::fmt;

/// A byte string key. Ordering is lexicographic over bytes, which is what
/// the cluster uses for shard boundaries and conflict detection.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize, Default)]
pub struct Key(pub Vec<u8>);

/// A byte string value.
#[derive(Clone, Eq, PartialEq, Hash, Serialize, Deserialize, Default)]
pub struct Value(pub Vec<u8>);

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", String::from_utf8_lossy(&self.0))
    }
}
impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Value({} bytes)", self.0.len())
    }
}

impl From<Vec<u8>> for Key {
    fn from(v: Vec<u8>) -> Self {
        Key(v)
    }
}
impl From<&[u8]> for Key {
    fn from(v: &[u8]) -> Self {
        Key(v.to_vec())
    }
}
impl From<&str> for Key {
    fn from(v: &str) -> Self {
        Key(v.as_bytes().to_vec())
    }
}
impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value(v)
    }
}
impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value(v.to_vec())
    }
}
impl AsRef<[u8]> for Key {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
impl AsRef<[u8]> for Value {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Smallest key strictly greater than `key`: appends a zero byte. Used to
/// turn a single key into a half-open singleton range, and to extend a
/// truncated result's read-conflict range past the last returned key.
pub fn key_after(key: &Key) -> Key {
    let mut v = key.0.clone();
    v.push(0);
    Key(v)
}

/// A half-open byte-string range `[begin, end)`. System keys live under the
/// reserved `\xFF` prefix; `KeyRange::all()` spans the whole addressable
/// keyspace including that prefix (callers needing only user keys should
/// intersect with `KeyRange::all_user_keys()`).
#[derive(Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    pub begin: Key,
    pub end: Key,
}

impl fmt::Debug for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}, {:?})", self.begin, self.end)
    }
}

impl KeyRange {
    pub fn new(begin: Key, end: Key) -> Self {
        KeyRange { begin, end }
    }

    /// The range containing exactly `key` and nothing else.
    pub fn singleton(key: Key) -> Self {
        let end = key_after(&key);
        KeyRange { begin: key, end }
    }

    pub fn is_empty(&self) -> bool {
        self.begin >= self.end
    }

    pub fn contains(&self, key: &Key) -> bool {
        key >= &self.begin && key < &self.end
    }

    /// Whether `self` and `other` share any key.
    pub fn intersects(&self, other: &KeyRange) -> bool {
        self.begin < other.end && other.begin < self.end
    }

    pub fn all() -> Self {
        KeyRange {
            begin: Key(vec![]),
            end: Key(vec![0xff, 0xff]),
        }
    }

    pub fn system_keys_prefix() -> Key {
        Key(vec![0xff])
    }
}

/// The reserved system-key prefix marker, `"\xFF/SC/<uuid>"`, used for
/// self-conflict ranges (§4.6 step 5).
pub fn self_conflict_key(uuid: u128) -> Key {
    let mut v = b"\xff/SC/".to_vec();
    v.extend_from_slice(&uuid.to_be_bytes());
    Key(v)
}

pub fn metadata_version_key() -> Key {
    Key(b"\xff/metadataVersion".to_vec())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn singleton_contains_only_key() {
        let k = Key::from("m");
        let r = KeyRange::singleton(k.clone());
        assert!(r.contains(&k));
        assert!(!r.contains(&Key::from("n")));
        assert!(!r.contains(&Key::from("l")));
    }

    #[test]
    fn key_after_is_strictly_greater() {
        let k = Key::from("m");
        assert!(key_after(&k) > k);
    }

    #[test]
    fn empty_range_detection() {
        assert!(KeyRange::new(Key::from("z"), Key::from("a")).is_empty());
        assert!(KeyRange::new(Key::from("a"), Key::from("a")).is_empty());
        assert!(!KeyRange::new(Key::from("a"), Key::from("z")).is_empty());
    }
}
