//! Identifiers that travel between the caller, the ledger and the content store.

use std::{
    fmt::{Debug, Display},
    str::FromStr,
};

use alloy_primitives::{B256, U256};
use serde::{Deserialize, Serialize};

/// Identifier the marketplace assigns to a request when the request transaction is mined.
///
/// The marketplace stores ids as `bytes32`; [`RequestId::as_u256`] gives the integer view.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub B256);

impl RequestId {
    pub fn as_u256(&self) -> U256 {
        U256::from_be_bytes(self.0.0)
    }
}

impl From<B256> for RequestId {
    fn from(value: B256) -> Self {
        RequestId(value)
    }
}

impl From<U256> for RequestId {
    fn from(value: U256) -> Self {
        RequestId(B256::from(value.to_be_bytes::<32>()))
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Debug for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RequestId({})", self.0)
    }
}

impl FromStr for RequestId {
    type Err = alloy_primitives::hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        B256::from_str(s).map(RequestId)
    }
}

impl Serialize for RequestId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RequestId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        RequestId::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Errors from parsing a [`ContentId`] or a [`Did`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IdentifierError {
    #[error("unsupported identifier prefix: {0}")]
    UnsupportedPrefix(String),
    #[error("invalid hex digest: {0}")]
    InvalidHex(#[from] hex::FromHexError),
    #[error("digest must be 32 bytes, got {0}")]
    InvalidLength(usize),
}

fn parse_digest(hex_digest: &str) -> Result<B256, IdentifierError> {
    let bytes = hex::decode(hex_digest)?;
    if bytes.len() != 32 {
        return Err(IdentifierError::InvalidLength(bytes.len()));
    }
    Ok(B256::from_slice(&bytes))
}

/// Base16 CIDv1 prefix for a dag-pb node addressed by a sha2-256 multihash.
pub const CID_V1_SHA256_PREFIX: &str = "f01701220";

/// Content identifier of a document held by the content store.
///
/// Accepts the base16 CIDv1 form (`f01701220<sha256 hex>`) or a bare `0x`-prefixed
/// 32-byte digest. The digest is what goes on-chain as request data.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ContentId {
    repr: String,
    digest: B256,
}

impl ContentId {
    pub fn from_digest(digest: B256) -> Self {
        ContentId {
            repr: format!("{CID_V1_SHA256_PREFIX}{}", hex::encode(digest)),
            digest,
        }
    }

    pub fn digest(&self) -> B256 {
        self.digest
    }

    pub fn as_str(&self) -> &str {
        &self.repr
    }
}

impl FromStr for ContentId {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digest = if let Some(rest) = s.strip_prefix(CID_V1_SHA256_PREFIX) {
            parse_digest(rest)?
        } else if let Some(rest) = s.strip_prefix("0x") {
            parse_digest(rest)?
        } else {
            return Err(IdentifierError::UnsupportedPrefix(
                s.chars().take(9).collect(),
            ));
        };
        Ok(ContentId {
            repr: s.to_string(),
            digest,
        })
    }
}

impl Display for ContentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.repr)
    }
}

impl Debug for ContentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContentId({})", self.repr)
    }
}

impl Serialize for ContentId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.repr)
    }
}

impl<'de> Deserialize<'de> for ContentId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ContentId::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Decentralized identifier of a subscription plan, `did:nv:<64 hex>`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Did(pub B256);

pub const DID_PREFIX: &str = "did:nv:";

impl Display for Did {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{DID_PREFIX}{}", hex::encode(self.0))
    }
}

impl Debug for Did {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Did({self})")
    }
}

impl FromStr for Did {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix(DID_PREFIX)
            .or_else(|| s.strip_prefix("0x"))
            .ok_or_else(|| IdentifierError::UnsupportedPrefix(s.chars().take(7).collect()))?;
        parse_digest(rest).map(Did)
    }
}

impl Serialize for Did {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Did {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Did::from_str(&s).map_err(serde::de::Error::custom)
    }
}
