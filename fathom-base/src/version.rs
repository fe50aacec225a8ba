use serde::{Deserialize, Serialize};

/// A cluster-assigned commit version. `INVALID` (0) marks "no version yet";
/// `LATEST` (-1) is a send-time sentinel meaning "resolve to whatever the
/// current read version turns out to be" rather than a real version.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Version(pub i64);

impl Version {
    pub const INVALID: Version = Version(0);
    pub const LATEST: Version = Version(-1);

    pub fn is_latest_sentinel(self) -> bool {
        self == Self::LATEST
    }
}

impl Default for Version {
    fn default() -> Self {
        Version::INVALID
    }
}

/// The 10-byte versionstamp format of §6: 8-byte big-endian commit version
/// followed by a 2-byte big-endian batch index.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Versionstamp(pub [u8; 10]);

impl Versionstamp {
    pub fn new(version: Version, batch_id: u16) -> Self {
        let mut buf = [0u8; 10];
        buf[0..8].copy_from_slice(&version.0.to_be_bytes());
        buf[8..10].copy_from_slice(&batch_id.to_be_bytes());
        Versionstamp(buf)
    }

    pub fn version(&self) -> Version {
        let mut v = [0u8; 8];
        v.copy_from_slice(&self.0[0..8]);
        Version(i64::from_be_bytes(v))
    }

    pub fn batch_id(&self) -> u16 {
        let mut b = [0u8; 2];
        b.copy_from_slice(&self.0[8..10]);
        u16::from_be_bytes(b)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn versionstamp_round_trips() {
        let vs = Versionstamp::new(Version(42), 7);
        assert_eq!(vs.version(), Version(42));
        assert_eq!(vs.batch_id(), 7);
        assert_eq!(vs.0.len(), 10);
    }

    #[test]
    fn latest_is_distinct_from_invalid() {
        assert_ne!(Version::LATEST, Version::INVALID);
        assert!(Version::LATEST.is_latest_sentinel());
        assert!(!Version::INVALID.is_latest_sentinel());
    }
}
