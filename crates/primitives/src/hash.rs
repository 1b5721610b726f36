use borsh::{BorshDeserialize, BorshSerialize};
use core::marker::PhantomData;
use derive_more::{AsRef, Deref, Into};
use serde_with::serde_as;
use std::fmt;
use std::str::FromStr;

#[serde_as]
#[derive(
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
    BorshSerialize,
    BorshDeserialize,
    Deref,
    AsRef,
    Into,
)]
#[serde(transparent)]
pub struct Hash32<T> {
    #[deref]
    #[as_ref]
    #[into]
    #[serde_as(as = "serde_with::hex::Hex")]
    bytes: [u8; 32],
    #[into(skip)]
    #[serde(skip)]
    #[borsh(skip)]
    _marker: PhantomData<T>,
}

impl<T> From<[u8; 32]> for Hash32<T> {
    fn from(bytes: [u8; 32]) -> Self {
        Self {
            bytes,
            _marker: PhantomData,
        }
    }
}

impl<T> Hash32<T> {
    /// Converts the hash to a hexadecimal string representation.
    pub fn as_hex(&self) -> String {
        hex::encode(self.as_ref())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }
}

impl<T> fmt::Debug for Hash32<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", self.as_hex())
    }
}

impl<T> fmt::Display for Hash32<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", self.as_hex())
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ParseHashError {
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("expected 32 bytes, got {0}")]
    Length(usize),
}

impl<T> FromStr for Hash32<T> {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let stripped = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(stripped)?;
        let len = bytes.len();
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| ParseHashError::Length(len))?;
        Ok(bytes.into())
    }
}

// Marker types
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Signing;

/// A 32-byte value a keep is asked to sign.
pub type Digest = Hash32<Signing>;

#[cfg(test)]
mod tests {
    use super::*;

    use rand::{rngs::StdRng, RngCore, SeedableRng};

    #[derive(Clone, PartialEq)]
    struct TestMarker;
    type TestHash = Hash32<TestMarker>;

    #[test]
    fn test_from_bytes_array() {
        let bytes = [1u8; 32];
        let hash: TestHash = bytes.into();
        assert_eq!(*hash, bytes);
    }

    #[test]
    fn test_parse_accepts_optional_prefix() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);
        let with_prefix: Digest = format!("0x{}", hex::encode(bytes)).parse().unwrap();
        let without_prefix: Digest = hex::encode(bytes).parse().unwrap();
        assert_eq!(with_prefix, without_prefix);
        assert_eq!(*with_prefix, bytes);
    }

    #[test]
    fn test_parse_rejects_wrong_length() {
        let err = "0xabcd".parse::<Digest>().unwrap_err();
        assert_eq!(err, ParseHashError::Length(2));
    }

    #[test]
    fn test_serde_is_plain_hex() {
        let digest = Digest::from([0xab; 32]);
        let json = serde_json::to_string(&digest).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(32)));
        let back: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, digest);
    }

    #[test]
    fn test_display_is_prefixed() {
        let digest = Digest::from([0x01; 32]);
        assert_eq!(digest.to_string(), format!("0x{}", "01".repeat(32)));
    }
}
