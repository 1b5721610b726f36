use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use sha3::{Digest as _, Keccak256};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ParseIdError {
    #[error("keep id {0:?} must have the form <chain>:<address>")]
    MissingChainTag(String),
    #[error("keep id {0:?} contains a path separator")]
    PathSeparator(String),
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("expected 20 bytes, got {0}")]
    Length(usize),
}

/// Identifies a keep. Opaque apart from the chain tag prefix, which lets a chain
/// backend reject identifiers that belong to a different chain family.
#[derive(
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    BorshSerialize,
    BorshDeserialize,
    derive_more::Display,
)]
#[serde(try_from = "String", into = "String")]
#[display("{_0}")]
pub struct KeepId(String);

impl KeepId {
    pub fn new(chain_tag: &str, address: &str) -> Result<Self, ParseIdError> {
        format!("{}:{}", chain_tag, address).parse()
    }

    pub fn chain_tag(&self) -> &str {
        self.0.split_once(':').map(|(tag, _)| tag).unwrap_or_default()
    }

    pub fn address(&self) -> &str {
        self.0.split_once(':').map(|(_, addr)| addr).unwrap_or_default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for KeepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeepId({})", self.0)
    }
}

impl FromStr for KeepId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((tag, addr)) if !tag.is_empty() && !addr.is_empty() => {}
            _ => return Err(ParseIdError::MissingChainTag(s.to_string())),
        }
        if s.contains('/') || s.contains('\\') {
            return Err(ParseIdError::PathSeparator(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for KeepId {
    type Error = ParseIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<KeepId> for String {
    fn from(value: KeepId) -> Self {
        value.0
    }
}

/// On-chain address of an operator.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    BorshSerialize,
    BorshDeserialize,
    derive_more::From,
    derive_more::AsRef,
)]
#[serde(try_from = "String", into = "String")]
pub struct OperatorId([u8; 20]);

impl OperatorId {
    /// Derives the address from the 64-byte X||Y encoding of a secp256k1 public key:
    /// the last 20 bytes of its Keccak-256 hash.
    pub fn from_public_key_xy(xy: &[u8; 64]) -> Self {
        let hash = Keccak256::digest(xy);
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&hash[12..]);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(&self.0[..4]))
    }
}

impl FromStr for OperatorId {
    type Err = ParseIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s.strip_prefix("0x").unwrap_or(s))?;
        let len = bytes.len();
        let bytes: [u8; 20] = bytes.try_into().map_err(|_| ParseIdError::Length(len))?;
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for OperatorId {
    type Error = ParseIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<OperatorId> for String {
    fn from(value: OperatorId) -> Self {
        value.to_string()
    }
}
