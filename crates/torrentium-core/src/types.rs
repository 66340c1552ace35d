//! Core data types for Torrentium

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// A 32-byte BLAKE3 digest
pub type Digest = [u8; 32];

/// Content identifier: BLAKE3 over the ordered chunk digests of a file
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentId(Digest);

impl ContentId {
    pub const fn from_bytes(bytes: Digest) -> Self {
        Self(bytes)
    }

    /// Parse an identifier from a wire-level byte slice
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let digest: Digest = bytes.try_into().map_err(|_| {
            Error::InvalidData(format!("content id must be 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self(digest))
    }

    pub fn as_bytes(&self) -> &Digest {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 8 hex characters, for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentId({})", self.short())
    }
}

impl FromStr for ContentId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| Error::InvalidData(format!("invalid content id '{}': {}", s, e)))?;
        Self::from_slice(&bytes)
    }
}

/// Information about a file chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    /// Index of the chunk (0-based)
    pub index: u32,
    /// Size of the chunk in bytes (may be smaller for last chunk)
    pub length: u32,
    /// BLAKE3 hash of the chunk data
    pub digest: Digest,
}

/// Where the bytes of a file record live
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Location {
    Local(PathBuf),
    Remote,
}

/// Manifest of a published file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: ContentId,
    /// Display name (original filename)
    pub name: String,
    /// File size in bytes
    pub size: u64,
    /// Ordered chunk manifest
    pub chunks: Vec<ChunkDescriptor>,
    pub location: Location,
    /// Unix timestamp when the record was created
    pub created_at: u64,
}

impl FileRecord {
    pub fn chunk_count(&self) -> u32 {
        self.chunks.len() as u32
    }

    pub fn local_path(&self) -> Option<&Path> {
        match &self.location {
            Location::Local(path) => Some(path),
            Location::Remote => None,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self.location, Location::Local(_))
    }

    /// Byte offset of a chunk within the file
    pub fn chunk_offset(&self, index: u32) -> Option<u64> {
        if index as usize >= self.chunks.len() {
            return None;
        }
        Some(
            self.chunks[..index as usize]
                .iter()
                .map(|c| c.length as u64)
                .sum(),
        )
    }

    /// Check that the manifest is internally consistent and names itself.
    ///
    /// Records received from other peers are only trusted once this passes.
    pub fn verify_manifest(&self) -> Result<()> {
        for (expected, chunk) in self.chunks.iter().enumerate() {
            if chunk.index as usize != expected {
                return Err(Error::InvalidData(format!(
                    "chunk index {} out of sequence (expected {})",
                    chunk.index, expected
                )));
            }
        }

        let total: u64 = self.chunks.iter().map(|c| c.length as u64).sum();
        if total != self.size {
            return Err(Error::InvalidData(format!(
                "chunk lengths sum to {}, record says {}",
                total, self.size
            )));
        }

        let computed = crate::chunk::combine_digests(self.chunks.iter().map(|c| &c.digest));
        if computed != self.id {
            return Err(Error::InvalidData(format!(
                "manifest digests combine to {}, not {}",
                computed.short(),
                self.id.short()
            )));
        }

        Ok(())
    }
}

/// Peer identity as assigned by the transport layer
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Position of this peer in the DHT keyspace
    pub fn dht_key(&self) -> Digest {
        *blake3::hash(self.0.as_bytes()).as_bytes()
    }

    /// Random identity for hosts that were not given one
    pub fn random() -> Self {
        let mut buf = [0u8; 16];
        if getrandom::getrandom(&mut buf).is_err() {
            let nanos = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos();
            buf = nanos.to_le_bytes();
        }
        Self(hex::encode(buf))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A dialable network address
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerAddress(String);

impl PeerAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerAddress({})", self.0)
    }
}

impl FromStr for PeerAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.trim().is_empty() {
            return Err(Error::InvalidAddress("empty address".to_string()));
        }
        Ok(Self(s.trim().to_string()))
    }
}

impl From<&str> for PeerAddress {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A peer's identity together with where to reach it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: PeerId,
    pub address: PeerAddress,
}

impl PeerInfo {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: PeerId::new(id),
            address: PeerAddress::new(address),
        }
    }
}

impl fmt::Display for PeerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.address)
    }
}

/// "This peer provides that content", as learned from the DHT
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub id: ContentId,
    pub peer: PeerInfo,
    /// Unix timestamp when last seen
    pub last_seen: u64,
}

/// Current unix time in seconds
pub fn now_unix_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_for(chunks: &[&[u8]]) -> FileRecord {
        let descriptors: Vec<ChunkDescriptor> = chunks
            .iter()
            .enumerate()
            .map(|(i, data)| ChunkDescriptor {
                index: i as u32,
                length: data.len() as u32,
                digest: crate::chunk::chunk_digest(data),
            })
            .collect();
        FileRecord {
            id: crate::chunk::combine_digests(descriptors.iter().map(|c| &c.digest)),
            name: "sample.bin".to_string(),
            size: chunks.iter().map(|c| c.len() as u64).sum(),
            chunks: descriptors,
            location: Location::Remote,
            created_at: 0,
        }
    }

    #[test]
    fn test_content_id_hex_parse() {
        let id = ContentId::from_bytes([0xab; 32]);
        let parsed: ContentId = id.to_hex().parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(id.short(), "abababab");

        assert!("not-hex".parse::<ContentId>().is_err());
        assert!("abcd".parse::<ContentId>().is_err());
    }

    #[test]
    fn test_verify_manifest_accepts_consistent_record() {
        let record = record_for(&[b"first", b"second", b"3"]);
        record.verify_manifest().unwrap();
        assert_eq!(record.chunk_offset(0), Some(0));
        assert_eq!(record.chunk_offset(2), Some(11));
        assert_eq!(record.chunk_offset(3), None);
    }

    #[test]
    fn test_verify_manifest_rejects_tampering() {
        let mut wrong_digest = record_for(&[b"first", b"second"]);
        wrong_digest.chunks[1].digest = [9u8; 32];
        assert!(wrong_digest.verify_manifest().is_err());

        let mut wrong_size = record_for(&[b"first", b"second"]);
        wrong_size.size += 1;
        assert!(wrong_size.verify_manifest().is_err());

        let mut wrong_index = record_for(&[b"first", b"second"]);
        wrong_index.chunks[1].index = 5;
        assert!(wrong_index.verify_manifest().is_err());
    }

    #[test]
    fn test_peer_dht_key_is_stable() {
        let a = PeerId::new("node-a");
        assert_eq!(a.dht_key(), PeerId::new("node-a").dht_key());
        assert_ne!(a.dht_key(), PeerId::new("node-b").dht_key());
        assert_ne!(PeerId::random(), PeerId::random());
    }
}
