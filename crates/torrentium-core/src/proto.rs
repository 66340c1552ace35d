//! Protocol buffer message definitions
//!
//! These are manually defined with prost derives, avoiding the need for
//! protoc at build time. Every exchange is a single request envelope
//! answered by a single response envelope on a freshly dialed stream.

use crate::types::{ChunkDescriptor, ContentId, FileRecord, Location, PeerInfo, ProviderRecord};
use crate::{Error, Result, PROTOCOL_VERSION};
use prost::Message;

/// Message envelope wrapping all protocol messages
#[derive(Clone, PartialEq, Message)]
pub struct Envelope {
    /// Protocol version
    #[prost(uint32, tag = "1")]
    pub version: u32,
    /// Request ID for correlation
    #[prost(uint64, tag = "2")]
    pub request_id: u64,
    /// Identity of the sending node
    #[prost(message, optional, tag = "3")]
    pub sender: Option<NodeInfo>,
    /// The actual message payload
    #[prost(
        oneof = "Payload",
        tags = "10, 11, 20, 21, 22, 23, 40, 41, 42, 43, 44, 45, 46, 47, 100"
    )]
    pub payload: Option<Payload>,
}

/// Payload variants for the envelope
#[derive(Clone, PartialEq, prost::Oneof)]
pub enum Payload {
    #[prost(message, tag = "10")]
    SearchRequest(SearchRequest),
    #[prost(message, tag = "11")]
    SearchResponse(SearchResponse),
    #[prost(message, tag = "20")]
    ChunkRequest(ChunkRequest),
    #[prost(message, tag = "21")]
    ChunkResponse(ChunkResponse),
    #[prost(message, tag = "22")]
    ManifestRequest(ManifestRequest),
    #[prost(message, tag = "23")]
    ManifestResponse(ManifestResponse),
    #[prost(message, tag = "40")]
    FindNodeRequest(FindNodeRequest),
    #[prost(message, tag = "41")]
    FindNodeResponse(FindNodeResponse),
    #[prost(message, tag = "42")]
    FindProvidersRequest(FindProvidersRequest),
    #[prost(message, tag = "43")]
    FindProvidersResponse(FindProvidersResponse),
    #[prost(message, tag = "44")]
    AddProviderRequest(AddProviderRequest),
    #[prost(message, tag = "45")]
    AddProviderResponse(AddProviderResponse),
    #[prost(message, tag = "46")]
    PingRequest(PingRequest),
    #[prost(message, tag = "47")]
    PingResponse(PingResponse),
    #[prost(message, tag = "100")]
    ErrorResponse(ErrorResponse),
}

impl Payload {
    /// Short name for log lines
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::SearchRequest(_) => "search_request",
            Payload::SearchResponse(_) => "search_response",
            Payload::ChunkRequest(_) => "chunk_request",
            Payload::ChunkResponse(_) => "chunk_response",
            Payload::ManifestRequest(_) => "manifest_request",
            Payload::ManifestResponse(_) => "manifest_response",
            Payload::FindNodeRequest(_) => "find_node_request",
            Payload::FindNodeResponse(_) => "find_node_response",
            Payload::FindProvidersRequest(_) => "find_providers_request",
            Payload::FindProvidersResponse(_) => "find_providers_response",
            Payload::AddProviderRequest(_) => "add_provider_request",
            Payload::AddProviderResponse(_) => "add_provider_response",
            Payload::PingRequest(_) => "ping_request",
            Payload::PingResponse(_) => "ping_response",
            Payload::ErrorResponse(_) => "error_response",
        }
    }
}

// Shared messages

#[derive(Clone, PartialEq, Message)]
pub struct NodeInfo {
    #[prost(string, tag = "1")]
    pub peer_id: String,
    #[prost(string, tag = "2")]
    pub address: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct ChunkDescriptorMsg {
    #[prost(uint32, tag = "1")]
    pub index: u32,
    #[prost(uint32, tag = "2")]
    pub length: u32,
    #[prost(bytes = "vec", tag = "3")]
    pub digest: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct FileRecordMsg {
    #[prost(bytes = "vec", tag = "1")]
    pub content_id: Vec<u8>,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(uint64, tag = "3")]
    pub size: u64,
    #[prost(message, repeated, tag = "4")]
    pub chunks: Vec<ChunkDescriptorMsg>,
    #[prost(uint64, tag = "5")]
    pub created_at: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct ProviderMsg {
    #[prost(message, optional, tag = "1")]
    pub peer: Option<NodeInfo>,
    #[prost(uint64, tag = "2")]
    pub last_seen: u64,
}

// Search messages

#[derive(Clone, PartialEq, Message)]
pub struct SearchRequest {
    #[prost(string, tag = "1")]
    pub query: String,
    #[prost(uint32, tag = "2")]
    pub max_results: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct SearchResponse {
    #[prost(message, repeated, tag = "1")]
    pub records: Vec<FileRecordMsg>,
}

// Transfer messages

#[derive(Clone, PartialEq, Message)]
pub struct ManifestRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub content_id: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ManifestResponse {
    #[prost(message, optional, tag = "1")]
    pub record: Option<FileRecordMsg>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ChunkRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub content_id: Vec<u8>,
    #[prost(uint32, tag = "2")]
    pub chunk_index: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct ChunkResponse {
    #[prost(bytes = "vec", tag = "1")]
    pub content_id: Vec<u8>,
    #[prost(uint32, tag = "2")]
    pub chunk_index: u32,
    #[prost(bytes = "bytes", tag = "3")]
    pub data: ::prost::bytes::Bytes,
}

// DHT messages

#[derive(Clone, PartialEq, Message)]
pub struct FindNodeRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub target: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct FindNodeResponse {
    #[prost(message, repeated, tag = "1")]
    pub nodes: Vec<NodeInfo>,
}

#[derive(Clone, PartialEq, Message)]
pub struct FindProvidersRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub content_id: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct FindProvidersResponse {
    #[prost(message, repeated, tag = "1")]
    pub providers: Vec<ProviderMsg>,
    #[prost(message, repeated, tag = "2")]
    pub nodes: Vec<NodeInfo>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AddProviderRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub content_id: Vec<u8>,
    #[prost(message, optional, tag = "2")]
    pub provider: Option<ProviderMsg>,
}

#[derive(Clone, PartialEq, Message)]
pub struct AddProviderResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct PingRequest {
    #[prost(uint64, tag = "1")]
    pub nonce: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct PingResponse {
    #[prost(uint64, tag = "1")]
    pub nonce: u64,
}

// Error message

#[derive(Clone, PartialEq, Message)]
pub struct ErrorResponse {
    #[prost(uint32, tag = "1")]
    pub code: u32,
    #[prost(string, tag = "2")]
    pub message: String,
}

// Helper implementations

impl Envelope {
    /// Create a new envelope with the current protocol version
    pub fn new(request_id: u64, payload: Payload) -> Self {
        Self {
            version: PROTOCOL_VERSION as u32,
            request_id,
            sender: None,
            payload: Some(payload),
        }
    }

    /// Attach the sending node's identity
    pub fn with_sender(mut self, sender: &PeerInfo) -> Self {
        self.sender = Some(NodeInfo::from(sender));
        self
    }

    /// Sender identity, if present and well formed
    pub fn sender_info(&self) -> Option<PeerInfo> {
        self.sender
            .as_ref()
            .and_then(|node| PeerInfo::try_from(node).ok())
    }

    /// Encode the envelope to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    /// Decode an envelope from bytes, checking version compatibility
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let envelope = Self::decode(buf)?;

        if envelope.version != PROTOCOL_VERSION as u32 {
            return Err(Error::VersionMismatch {
                expected: PROTOCOL_VERSION,
                actual: envelope.version,
            });
        }

        Ok(envelope)
    }
}

impl From<&PeerInfo> for NodeInfo {
    fn from(peer: &PeerInfo) -> Self {
        Self {
            peer_id: peer.id.as_str().to_string(),
            address: peer.address.as_str().to_string(),
        }
    }
}

impl TryFrom<&NodeInfo> for PeerInfo {
    type Error = Error;

    fn try_from(node: &NodeInfo) -> Result<Self> {
        if node.peer_id.is_empty() || node.address.is_empty() {
            return Err(Error::InvalidData("node info missing id or address".to_string()));
        }
        Ok(PeerInfo::new(node.peer_id.clone(), node.address.clone()))
    }
}

impl From<&FileRecord> for FileRecordMsg {
    fn from(record: &FileRecord) -> Self {
        Self {
            content_id: record.id.as_bytes().to_vec(),
            name: record.name.clone(),
            size: record.size,
            chunks: record
                .chunks
                .iter()
                .map(|c| ChunkDescriptorMsg {
                    index: c.index,
                    length: c.length,
                    digest: c.digest.to_vec(),
                })
                .collect(),
            created_at: record.created_at,
        }
    }
}

impl TryFrom<&FileRecordMsg> for FileRecord {
    type Error = Error;

    /// Records decoded from the wire are always remote-only
    fn try_from(msg: &FileRecordMsg) -> Result<Self> {
        let chunks = msg
            .chunks
            .iter()
            .map(|c| {
                let digest = c.digest.as_slice().try_into().map_err(|_| {
                    Error::InvalidData(format!("chunk {} digest has wrong length", c.index))
                })?;
                Ok(ChunkDescriptor {
                    index: c.index,
                    length: c.length,
                    digest,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(FileRecord {
            id: ContentId::from_slice(&msg.content_id)?,
            name: msg.name.clone(),
            size: msg.size,
            chunks,
            location: Location::Remote,
            created_at: msg.created_at,
        })
    }
}

impl ProviderMsg {
    pub fn from_record(record: &ProviderRecord) -> Self {
        Self {
            peer: Some(NodeInfo::from(&record.peer)),
            last_seen: record.last_seen,
        }
    }

    pub fn into_record(&self, id: ContentId) -> Result<ProviderRecord> {
        let peer = self
            .peer
            .as_ref()
            .ok_or_else(|| Error::InvalidData("provider without peer".to_string()))?;
        Ok(ProviderRecord {
            id,
            peer: PeerInfo::try_from(peer)?,
            last_seen: self.last_seen,
        })
    }
}

/// Error codes
pub mod error_codes {
    // Protocol errors (1xx)
    pub const VERSION_MISMATCH: u32 = 100;
    pub const INVALID_MESSAGE: u32 = 101;

    // Resource errors (2xx)
    pub const NOT_FOUND: u32 = 200;
    pub const UNAVAILABLE: u32 = 201;

    // Validation errors (3xx)
    pub const HASH_MISMATCH: u32 = 300;
    pub const INVALID_DATA: u32 = 301;
}

/// Helper functions to create common message types

pub fn search_request(query: String, max_results: u32) -> Payload {
    Payload::SearchRequest(SearchRequest { query, max_results })
}

pub fn manifest_request(id: &ContentId) -> Payload {
    Payload::ManifestRequest(ManifestRequest {
        content_id: id.as_bytes().to_vec(),
    })
}

pub fn chunk_request(id: &ContentId, chunk_index: u32) -> Payload {
    Payload::ChunkRequest(ChunkRequest {
        content_id: id.as_bytes().to_vec(),
        chunk_index,
    })
}

pub fn error_response(request_id: u64, code: u32, message: String) -> Envelope {
    Envelope::new(
        request_id,
        Payload::ErrorResponse(ErrorResponse { code, message }),
    )
}
