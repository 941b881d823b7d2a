//! Digest type and content kinds.
//!
//! A [`Digest`] is a fixed-width SHA-256 hash with a declared algorithm
//! tag, printable as `sha256:<64 hex lowercase>`. Digests order by byte
//! value, which gives deterministic iteration wherever digest sets are
//! canonicalized (build fingerprints, GC root sets).

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::str::FromStr;

/// Declared digest algorithm.
///
/// Only SHA-256 is accepted for stored content; the tag exists so the
/// printable form is self-describing and future algorithms can be
/// rejected explicitly instead of misparsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    Sha256,
}

impl DigestAlgorithm {
    /// Printable algorithm tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha256 => "sha256",
        }
    }
}

/// A content digest: algorithm tag plus 32 raw hash bytes.
///
/// Total ordering is by byte value, so sorting a set of digests is
/// stable across processes and hosts.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest {
    algorithm: DigestAlgorithm,
    bytes: [u8; 32],
}

impl Digest {
    /// Computes the SHA-256 digest of `data`.
    pub fn of_bytes(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&hash);
        Self {
            algorithm: DigestAlgorithm::Sha256,
            bytes,
        }
    }

    /// Returns the raw hash bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    /// Returns the declared algorithm.
    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// Returns the lowercase hex form without the algorithm tag.
    pub fn hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// Shard prefix: the first two hex characters of the hash.
    ///
    /// Used as the first directory level of the on-disk object layout.
    pub fn shard(&self) -> String {
        self.hex()[..2].to_string()
    }

    /// Remainder of the hex form after the shard prefix.
    pub fn shard_rest(&self) -> String {
        self.hex()[2..].to_string()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.as_str(), self.hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({self})")
    }
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (algo, hash) = s
            .split_once(':')
            .ok_or_else(|| Error::InvalidContent(format!("digest '{s}' missing algorithm tag")))?;

        if algo != "sha256" {
            return Err(Error::InvalidContent(format!(
                "unsupported digest algorithm '{algo}': only sha256 is supported"
            )));
        }

        if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::InvalidContent(format!(
                "digest hash '{hash}' is not 64 hex characters"
            )));
        }

        let decoded = hex::decode(hash.to_ascii_lowercase())
            .map_err(|e| Error::InvalidContent(format!("digest hex decode: {e}")))?;
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&decoded);

        Ok(Self {
            algorithm: DigestAlgorithm::Sha256,
            bytes,
        })
    }
}

impl Serialize for Digest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Kind tag carried by every stored object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    /// Image layer archive.
    Layer,
    /// Image or build-output manifest.
    Manifest,
    /// Image configuration blob.
    Config,
    /// Capsule state blob (memory image, filesystem archive).
    Capsule,
    /// Build input or collected build output.
    Build,
}

impl ObjectKind {
    /// Printable kind tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Layer => "layer",
            ObjectKind::Manifest => "manifest",
            ObjectKind::Config => "config",
            ObjectKind::Capsule => "capsule",
            ObjectKind::Build => "build",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "layer" => Ok(ObjectKind::Layer),
            "manifest" => Ok(ObjectKind::Manifest),
            "config" => Ok(ObjectKind::Config),
            "capsule" => Ok(ObjectKind::Capsule),
            "build" => Ok(ObjectKind::Build),
            other => Err(Error::InvalidContent(format!("unknown object kind '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_roundtrip_through_display() {
        let d = Digest::of_bytes(b"hello");
        let parsed: Digest = d.to_string().parse().unwrap();
        assert_eq!(d, parsed);
    }

    #[test]
    fn digest_rejects_bad_forms() {
        assert!("sha256:short".parse::<Digest>().is_err());
        assert!("md5:d41d8cd98f00b204e9800998ecf8427e".parse::<Digest>().is_err());
        assert!("deadbeef".parse::<Digest>().is_err());
    }

    #[test]
    fn digest_orders_by_byte_value() {
        let a = Digest::of_bytes(b"a");
        let b = Digest::of_bytes(b"b");
        assert_eq!(a.cmp(&b), a.as_bytes().cmp(b.as_bytes()));
    }

    #[test]
    fn shard_is_first_two_hex_chars() {
        let d = Digest::of_bytes(b"hello");
        assert_eq!(d.shard().len(), 2);
        assert_eq!(format!("{}{}", d.shard(), d.shard_rest()), d.hex());
    }
}
