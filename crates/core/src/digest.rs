//! Content-addressable digest types.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::str::FromStr;

/// Digest algorithms accepted on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DigestAlgorithm {
    Sha256,
    Sha512,
}

impl DigestAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }

    /// Expected length of the hex-encoded hash for this algorithm.
    fn hex_len(&self) -> usize {
        match self {
            Self::Sha256 => 64,
            Self::Sha512 => 128,
        }
    }
}

/// A content address in `algorithm:hex` form (e.g. `sha256:e3b0c4…`).
///
/// The string representation is canonical: algorithm and hex digits are
/// always lowercase, so digests can be compared and used as map keys
/// directly.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    algorithm: DigestAlgorithm,
    hex: String,
}

impl Digest {
    /// Parse and validate a digest string.
    pub fn parse(input: &str) -> Result<Self> {
        let (algo_str, hex) = input
            .split_once(':')
            .ok_or_else(|| Error::InvalidDigest(format!("missing algorithm prefix: {input}")))?;
        let algorithm = match algo_str {
            "sha256" => DigestAlgorithm::Sha256,
            "sha512" => DigestAlgorithm::Sha512,
            other => {
                return Err(Error::InvalidDigest(format!(
                    "unsupported algorithm: {other}"
                )));
            }
        };
        if hex.len() != algorithm.hex_len() {
            return Err(Error::InvalidDigest(format!(
                "expected {} hex chars for {}, got {}",
                algorithm.hex_len(),
                algorithm.as_str(),
                hex.len()
            )));
        }
        if !hex.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
            return Err(Error::InvalidDigest(format!(
                "non-hex characters in digest: {input}"
            )));
        }
        Ok(Self {
            algorithm,
            hex: hex.to_string(),
        })
    }

    /// Compute the SHA-256 digest of the given bytes.
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self {
            algorithm: DigestAlgorithm::Sha256,
            hex: hex::encode(hasher.finalize()),
        }
    }

    /// Create an incremental SHA-256 hasher.
    pub fn hasher() -> DigestHasher {
        DigestHasher(Sha256::new())
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// Check whether the given bytes hash to this digest.
    ///
    /// Only sha256 digests can be verified locally; sha512 content is
    /// accepted on trust from upstreams that use it.
    pub fn matches(&self, data: &[u8]) -> bool {
        match self.algorithm {
            DigestAlgorithm::Sha256 => Self::compute(data) == *self,
            DigestAlgorithm::Sha512 => {
                use sha2::Sha512;
                let mut hasher = Sha512::new();
                hasher.update(data);
                hex::encode(hasher.finalize()) == self.hex
            }
        }
    }
}

/// Incremental SHA-256 digest computation, used by the chunked upload path.
pub struct DigestHasher(Sha256);

impl DigestHasher {
    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> Digest {
        Digest {
            algorithm: DigestAlgorithm::Sha256,
            hex: hex::encode(self.0.finalize()),
        }
    }
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.as_str(), self.hex)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({}:{})", self.algorithm.as_str(), &self.hex[..12])
    }
}

impl Serialize for Digest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}
