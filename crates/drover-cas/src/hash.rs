//! Content hash identifiers.
//!
//! Builds are registered with a 40 character hexadecimal digest per file.
//! The digest is only ever used as an identity here; the cache never
//! recomputes it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::CasError;

/// Length of a content hash in bytes.
pub const HASH_LEN: usize = 20;

/// Length of a content hash in hex characters.
pub const HASH_HEX_LEN: usize = HASH_LEN * 2;

/// 160-bit content identifier, displayed as upper-case hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; HASH_LEN]);

impl ContentHash {
    pub const fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Parse a hex string, accepting either case.
    pub fn parse(hex_str: &str) -> Result<Self, CasError> {
        let hex_str = hex_str.trim();
        if hex_str.len() != HASH_HEX_LEN {
            return Err(CasError::InvalidHash {
                value: hex_str.to_string(),
            });
        }
        let mut bytes = [0u8; HASH_LEN];
        hex::decode_to_slice(hex_str, &mut bytes).map_err(|_| CasError::InvalidHash {
            value: hex_str.to_string(),
        })?;
        Ok(Self(bytes))
    }

    /// Upper-case hex form, used for file names.
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }

    /// Two character shard directory name (`00`..`FF`).
    pub fn shard(&self) -> String {
        format!("{:02X}", self.0[0])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl FromStr for ContentHash {
    type Err = CasError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
