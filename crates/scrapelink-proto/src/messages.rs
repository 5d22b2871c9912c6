//! Protocol message types

use serde::{Deserialize, Serialize};

/// Work item forwarded by the relay: scrape one registered path
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScrapeRequest {
    pub agent_id: String,
    /// Relay-assigned correlation id, echoed back on the response
    pub scrape_id: u64,
    pub path: String,
    pub accept: String,
    pub debug_enabled: bool,
    pub encoded_query_params: String,
    pub auth_header: String,
}

/// Non-chunked scrape result sent on the plain response stream
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScrapeResponse {
    pub agent_id: String,
    pub scrape_id: u64,
    pub valid_response: bool,
    pub status_code: u16,
    pub content_type: String,
    /// True when `content` holds gzip-compressed bytes
    pub zipped: bool,
    #[serde(with = "serde_bytes")]
    pub content: Vec<u8>,
    pub failure_reason: String,
    pub url: String,
}

/// One frame of a chunked transmission
///
/// A well-formed transmission for one scrape id is exactly one `Header`,
/// one or more `Chunk` frames in ascending sequence order, then one `Summary`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChunkedScrapeResponse {
    Header(ChunkedHeader),
    Chunk(ChunkData),
    Summary(ChunkedSummary),
}

impl ChunkedScrapeResponse {
    /// Scrape id this frame belongs to
    pub fn scrape_id(&self) -> u64 {
        match self {
            ChunkedScrapeResponse::Header(header) => header.scrape_id,
            ChunkedScrapeResponse::Chunk(chunk) => chunk.scrape_id,
            ChunkedScrapeResponse::Summary(summary) => summary.scrape_id,
        }
    }

    /// Short frame kind, used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            ChunkedScrapeResponse::Header(_) => "header",
            ChunkedScrapeResponse::Chunk(_) => "chunk",
            ChunkedScrapeResponse::Summary(_) => "summary",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkedHeader {
    pub agent_id: String,
    pub scrape_id: u64,
    pub valid_response: bool,
    pub status_code: u16,
    pub content_type: String,
    pub failure_reason: String,
    pub url: String,
    /// Total length of the compressed payload that the chunks will carry
    pub content_size: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkData {
    pub scrape_id: u64,
    /// 1-based sequence number
    pub chunk_count: u32,
    /// Bytes of payload actually carried by this chunk
    pub chunk_byte_count: u32,
    /// CRC-32 over every payload byte emitted so far, this chunk included
    pub chunk_checksum: u32,
    #[serde(with = "serde_bytes")]
    pub chunk_bytes: Vec<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkedSummary {
    pub scrape_id: u64,
    pub chunk_count: u32,
    pub byte_count: u64,
    /// CRC-32 of the whole payload
    pub checksum: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentInfo {
    pub agent_id: String,
}

/// Reply body of the filter-disabled connect handshake
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectAgentResponse {
    pub agent_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterAgentRequest {
    pub agent_id: String,
    pub launch_id: String,
    pub agent_name: String,
    pub host_name: String,
    pub consolidated: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterAgentResponse {
    pub agent_id: String,
    pub valid: bool,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PathMapSizeRequest {
    pub agent_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PathMapSizeResponse {
    pub path_count: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterPathRequest {
    pub agent_id: String,
    pub path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterPathResponse {
    pub valid: bool,
    pub reason: String,
    pub path_count: u32,
    pub path_id: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnregisterPathRequest {
    pub agent_id: String,
    pub path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnregisterPathResponse {
    pub valid: bool,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeartBeatRequest {
    pub agent_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeartBeatResponse {
    pub valid: bool,
    pub reason: String,
}

// Byte payloads go through serialize_bytes rather than a per-element sequence
mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<u8>::deserialize(deserializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scrape_response_serialization() {
        let response = ScrapeResponse {
            agent_id: "agent-1".to_string(),
            scrape_id: 42,
            valid_response: true,
            status_code: 200,
            content_type: "text/plain".to_string(),
            zipped: false,
            content: b"up 1".to_vec(),
            failure_reason: String::new(),
            url: "http://localhost:9100/metrics".to_string(),
        };

        let serialized = bincode::serialize(&response).unwrap();
        let deserialized: ScrapeResponse = bincode::deserialize(&serialized).unwrap();
        assert_eq!(response, deserialized);
    }

    #[test]
    fn test_chunk_frame_accessors() {
        let chunk = ChunkedScrapeResponse::Chunk(ChunkData {
            scrape_id: 7,
            chunk_count: 1,
            chunk_byte_count: 3,
            chunk_checksum: 0,
            chunk_bytes: vec![1, 2, 3],
        });
        assert_eq!(chunk.scrape_id(), 7);
        assert_eq!(chunk.kind(), "chunk");

        let summary = ChunkedScrapeResponse::Summary(ChunkedSummary {
            scrape_id: 9,
            ..Default::default()
        });
        assert_eq!(summary.scrape_id(), 9);
        assert_eq!(summary.kind(), "summary");
    }
}
