//! 96-bit record identifiers and their wire split.
//!
//! A [`RecordId`] is twelve opaque bytes with total ordering on the bytes
//! themselves. On the wire it travels as a [`PackedId`]: the first eight bytes
//! as a big-endian `u64`, the last four as a big-endian `u32`.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::Utc;
use once_cell::sync::Lazy;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Width of a record identifier in bytes.
pub const ID_LEN: usize = 12;

static PROCESS_NONCE: Lazy<[u8; 5]> = Lazy::new(rand::random);
static COUNTER: Lazy<AtomicU32> = Lazy::new(|| AtomicU32::new(rand::random::<u32>()));

/// Globally unique 96-bit identifier assigned by the record store on insert.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId([u8; ID_LEN]);

/// Wire form of a [`RecordId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackedId {
    pub high: u64,
    pub low: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum IdParseError {
    #[error("record id must be {ID_LEN} bytes, got {0}")]
    Length(usize),
    #[error("record id is not valid hex: {0}")]
    Hex(#[from] hex::FromHexError),
}

impl RecordId {
    pub const fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, IdParseError> {
        let array: [u8; ID_LEN] = bytes
            .try_into()
            .map_err(|_| IdParseError::Length(bytes.len()))?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// Mint a fresh id: 4-byte unix seconds, 5-byte process nonce, 3-byte counter.
    pub fn generate() -> Self {
        let seconds = Utc::now().timestamp().clamp(0, u32::MAX as i64) as u32;
        let count = COUNTER.fetch_add(1, Ordering::Relaxed) & 0x00ff_ffff;

        let mut bytes = [0u8; ID_LEN];
        bytes[..4].copy_from_slice(&seconds.to_be_bytes());
        bytes[4..9].copy_from_slice(&*PROCESS_NONCE);
        bytes[9..].copy_from_slice(&count.to_be_bytes()[1..]);
        Self(bytes)
    }

    pub fn split(&self) -> PackedId {
        let mut high = [0u8; 8];
        let mut low = [0u8; 4];
        high.copy_from_slice(&self.0[..8]);
        low.copy_from_slice(&self.0[8..]);
        PackedId {
            high: u64::from_be_bytes(high),
            low: u32::from_be_bytes(low),
        }
    }

    pub fn join(packed: PackedId) -> Self {
        let mut bytes = [0u8; ID_LEN];
        bytes[..8].copy_from_slice(&packed.high.to_be_bytes());
        bytes[8..].copy_from_slice(&packed.low.to_be_bytes());
        Self(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<PackedId> for RecordId {
    fn from(packed: PackedId) -> Self {
        Self::join(packed)
    }
}

impl From<RecordId> for PackedId {
    fn from(id: RecordId) -> Self {
        id.split()
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordId({})", self.to_hex())
    }
}

impl FromStr for RecordId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.trim())?;
        Self::from_slice(&bytes)
    }
}

impl Serialize for RecordId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for RecordId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_round_trip(id: RecordId) {
        let packed = id.split();
        assert_eq!(RecordId::join(packed).as_bytes(), id.as_bytes());
    }

    #[test]
    fn all_zero_round_trip() {
        let id = RecordId::from_bytes([0u8; ID_LEN]);
        assert_eq!(id.split(), PackedId { high: 0, low: 0 });
        assert_round_trip(id);
    }

    #[test]
    fn all_ones_round_trip() {
        let id = RecordId::from_bytes([0xff; ID_LEN]);
        assert_eq!(
            id.split(),
            PackedId {
                high: u64::MAX,
                low: u32::MAX
            }
        );
        assert_round_trip(id);
    }

    #[test]
    fn random_round_trip() {
        for _ in 0..100 {
            assert_round_trip(RecordId::from_bytes(rand::random()));
        }
    }

    #[test]
    fn split_is_big_endian() {
        let id = RecordId::from_bytes([1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);
        let packed = id.split();
        assert_eq!(packed.high, 0x0102_0304_0506_0708);
        assert_eq!(packed.low, 0x090a_0b0c);
    }

    #[test]
    fn ordering_follows_bytes() {
        let a = RecordId::from_bytes([0, 0, 0, 0, 0, 0, 0, 1, 0xff, 0xff, 0xff, 0xff]);
        let b = RecordId::from_bytes([0, 0, 0, 0, 0, 0, 0, 2, 0, 0, 0, 0]);
        assert!(a < b);
    }

    #[test]
    fn hex_and_serde_round_trip() {
        let id = RecordId::generate();
        let parsed: RecordId = id.to_hex().parse().unwrap();
        assert_eq!(parsed, id);

        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.to_hex()));
        let back: RecordId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(matches!(
            "abcd".parse::<RecordId>(),
            Err(IdParseError::Length(2))
        ));
    }

    #[test]
    fn generated_ids_are_distinct() {
        let a = RecordId::generate();
        let b = RecordId::generate();
        assert_ne!(a, b);
    }
}
