//! Chunking codec
//!
//! Turns one [`ScrapeResult`] into wire frames. Results that are not gzipped,
//! or whose gzipped payload is below the chunk size, go out as a single
//! [`ScrapeResponse`]. Larger payloads become a chunked transmission:
//!
//! ```text
//! Header { content_size }
//! Chunk  { chunk_count: 1, chunk_byte_count, chunk_checksum }   running CRC-32
//! Chunk  { chunk_count: 2, ... }
//! ...
//! Summary { chunk_count, byte_count, checksum }                 CRC-32 of payload
//! ```
//!
//! The checksum is one accumulator advanced over exactly the bytes of each
//! block, so the summary checksum is the CRC-32 of the whole payload.

use crate::error::AgentError;
use crate::fetch::ScrapeResult;
use crate::metrics::labels;
use bytes::Bytes;
use crc32fast::Hasher;
use scrapelink_proto::{
    ChunkData, ChunkedHeader, ChunkedScrapeResponse, ChunkedSummary, ScrapeResponse,
};

/// How a result was put on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingOutcome {
    NonGzipped,
    Gzipped,
    Chunked,
}

impl EncodingOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            EncodingOutcome::NonGzipped => labels::NON_GZIPPED,
            EncodingOutcome::Gzipped => labels::GZIPPED,
            EncodingOutcome::Chunked => labels::CHUNKED,
        }
    }
}

/// One encoded result: a single message or a chunked frame sequence
#[derive(Debug)]
pub enum EncodedResult {
    Single {
        response: ScrapeResponse,
        outcome: EncodingOutcome,
    },
    Chunked(ChunkedTransmission),
}

impl EncodedResult {
    pub fn outcome(&self) -> EncodingOutcome {
        match self {
            EncodedResult::Single { outcome, .. } => *outcome,
            EncodedResult::Chunked(_) => EncodingOutcome::Chunked,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResultEncoder {
    chunk_size: usize,
}

impl ResultEncoder {
    /// `chunk_size` is both the chunking threshold and the block size, in bytes
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn encode(&self, result: ScrapeResult) -> EncodedResult {
        if !result.zipped {
            return EncodedResult::Single {
                response: result.to_scrape_response(),
                outcome: EncodingOutcome::NonGzipped,
            };
        }

        if result.content.len() < self.chunk_size {
            return EncodedResult::Single {
                response: result.to_scrape_response(),
                outcome: EncodingOutcome::Gzipped,
            };
        }

        EncodedResult::Chunked(ChunkedTransmission::new(&result, self.chunk_size))
    }
}

/// Lazy header/chunk/summary frame sequence for one scrape id
pub struct ChunkedTransmission {
    scrape_id: u64,
    header: Option<ChunkedHeader>,
    payload: Bytes,
    offset: usize,
    chunk_size: usize,
    chunk_count: u32,
    checksum: Hasher,
    finished: bool,
}

impl std::fmt::Debug for ChunkedTransmission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedTransmission")
            .field("scrape_id", &self.scrape_id)
            .field("payload_len", &self.payload.len())
            .field("offset", &self.offset)
            .field("chunk_count", &self.chunk_count)
            .finish()
    }
}

impl ChunkedTransmission {
    fn new(result: &ScrapeResult, chunk_size: usize) -> Self {
        Self {
            scrape_id: result.scrape_id,
            header: Some(result.to_chunked_header()),
            payload: result.content.clone(),
            offset: 0,
            chunk_size,
            chunk_count: 0,
            checksum: Hasher::new(),
            finished: false,
        }
    }

    pub fn scrape_id(&self) -> u64 {
        self.scrape_id
    }
}

impl Iterator for ChunkedTransmission {
    type Item = ChunkedScrapeResponse;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(header) = self.header.take() {
            return Some(ChunkedScrapeResponse::Header(header));
        }

        if self.offset < self.payload.len() {
            let end = (self.offset + self.chunk_size).min(self.payload.len());
            let block = self.payload.slice(self.offset..end);
            self.offset = end;

            self.checksum.update(&block);
            self.chunk_count += 1;

            return Some(ChunkedScrapeResponse::Chunk(ChunkData {
                scrape_id: self.scrape_id,
                chunk_count: self.chunk_count,
                chunk_byte_count: block.len() as u32,
                chunk_checksum: self.checksum.clone().finalize(),
                chunk_bytes: block.to_vec(),
            }));
        }

        if !self.finished {
            self.finished = true;
            return Some(ChunkedScrapeResponse::Summary(ChunkedSummary {
                scrape_id: self.scrape_id,
                chunk_count: self.chunk_count,
                byte_count: self.offset as u64,
                checksum: self.checksum.clone().finalize(),
            }));
        }

        None
    }
}

/// Rebuilds a payload from one chunked transmission, checking every invariant
///
/// Frames must arrive header first, chunks in sequence, summary last, all for
/// the same scrape id.
#[derive(Default)]
pub struct ChunkedReassembler {
    header: Option<ChunkedHeader>,
    payload: Vec<u8>,
    next_chunk: u32,
    checksum: Hasher,
}

impl std::fmt::Debug for ChunkedReassembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedReassembler")
            .field("header", &self.header)
            .field("received", &self.payload.len())
            .field("next_chunk", &self.next_chunk)
            .finish()
    }
}

impl ChunkedReassembler {
    pub fn new() -> Self {
        Self {
            next_chunk: 1,
            ..Default::default()
        }
    }

    /// Feed one frame; returns the header and payload once the summary arrives
    pub fn push(
        &mut self,
        frame: ChunkedScrapeResponse,
    ) -> Result<Option<(ChunkedHeader, Vec<u8>)>, AgentError> {
        match frame {
            ChunkedScrapeResponse::Header(header) => {
                if self.header.is_some() {
                    return Err(AgentError::Codec(format!(
                        "duplicate header for scrape {}",
                        header.scrape_id
                    )));
                }
                self.header = Some(header);
                Ok(None)
            }
            ChunkedScrapeResponse::Chunk(chunk) => {
                let scrape_id = self.expect_scrape_id(chunk.scrape_id)?;
                if chunk.chunk_count != self.next_chunk {
                    return Err(AgentError::Codec(format!(
                        "scrape {}: chunk {} out of sequence, expected {}",
                        scrape_id, chunk.chunk_count, self.next_chunk
                    )));
                }
                if chunk.chunk_byte_count as usize != chunk.chunk_bytes.len() {
                    return Err(AgentError::Codec(format!(
                        "scrape {}: chunk {} byte count {} != {} bytes carried",
                        scrape_id,
                        chunk.chunk_count,
                        chunk.chunk_byte_count,
                        chunk.chunk_bytes.len()
                    )));
                }

                self.checksum.update(&chunk.chunk_bytes);
                if self.checksum.clone().finalize() != chunk.chunk_checksum {
                    return Err(AgentError::Codec(format!(
                        "scrape {}: running checksum mismatch at chunk {}",
                        scrape_id, chunk.chunk_count
                    )));
                }

                self.payload.extend_from_slice(&chunk.chunk_bytes);
                self.next_chunk += 1;
                Ok(None)
            }
            ChunkedScrapeResponse::Summary(summary) => {
                let scrape_id = self.expect_scrape_id(summary.scrape_id)?;
                let chunks = self.next_chunk - 1;
                if summary.chunk_count != chunks || chunks == 0 {
                    return Err(AgentError::Codec(format!(
                        "scrape {}: summary chunk count {} != {} received",
                        scrape_id, summary.chunk_count, chunks
                    )));
                }
                if summary.byte_count != self.payload.len() as u64 {
                    return Err(AgentError::Codec(format!(
                        "scrape {}: summary byte count {} != {} received",
                        scrape_id,
                        summary.byte_count,
                        self.payload.len()
                    )));
                }
                if summary.checksum != self.checksum.clone().finalize() {
                    return Err(AgentError::Codec(format!(
                        "scrape {}: summary checksum mismatch",
                        scrape_id
                    )));
                }

                let header = self.header.take().ok_or_else(|| {
                    AgentError::Codec(format!("scrape {}: summary without header", scrape_id))
                })?;
                Ok(Some((header, std::mem::take(&mut self.payload))))
            }
        }
    }

    fn expect_scrape_id(&self, scrape_id: u64) -> Result<u64, AgentError> {
        match &self.header {
            Some(header) if header.scrape_id == scrape_id => Ok(scrape_id),
            Some(header) => Err(AgentError::Codec(format!(
                "frame for scrape {} interleaved into scrape {}",
                scrape_id, header.scrape_id
            ))),
            None => Err(AgentError::Codec(format!(
                "scrape {}: frame before header",
                scrape_id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zipped_result(scrape_id: u64, content: &[u8]) -> ScrapeResult {
        ScrapeResult {
            agent_id: "17".to_string(),
            scrape_id,
            valid_response: true,
            status_code: 200,
            content_type: "text/plain; version=0.0.4".to_string(),
            zipped: true,
            content: Bytes::copy_from_slice(content),
            ..Default::default()
        }
    }

    fn frames(encoded: EncodedResult) -> Vec<ChunkedScrapeResponse> {
        match encoded {
            EncodedResult::Chunked(transmission) => transmission.collect(),
            EncodedResult::Single { outcome, .. } => panic!("expected chunked, got {:?}", outcome),
        }
    }

    #[test]
    fn test_unzipped_is_single_message() {
        let mut result = zipped_result(1, &[7u8; 100]);
        result.zipped = false;

        match ResultEncoder::new(4).encode(result.clone()) {
            EncodedResult::Single { response, outcome } => {
                assert_eq!(outcome, EncodingOutcome::NonGzipped);
                assert_eq!(response, result.to_scrape_response());
            }
            other => panic!("expected single message, got {:?}", other),
        }
    }

    #[test]
    fn test_small_zipped_is_single_message() {
        let result = zipped_result(2, b"abc");
        match ResultEncoder::new(4).encode(result) {
            EncodedResult::Single { response, outcome } => {
                assert_eq!(outcome, EncodingOutcome::Gzipped);
                assert_eq!(outcome.label(), "gzipped");
                assert_eq!(response.content, b"abc".to_vec());
                assert!(response.zipped);
            }
            other => panic!("expected single message, got {:?}", other),
        }
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let encoded = ResultEncoder::new(4).encode(zipped_result(3, b"ABCD"));
        assert_eq!(encoded.outcome(), EncodingOutcome::Chunked);

        let frames = frames(encoded);
        assert_eq!(frames.len(), 3);
        match &frames[2] {
            ChunkedScrapeResponse::Summary(summary) => {
                assert_eq!(summary.chunk_count, 1);
                assert_eq!(summary.byte_count, 4);
            }
            other => panic!("expected summary, got {:?}", other),
        }
    }

    #[test]
    fn test_ten_bytes_in_blocks_of_four() {
        let payload = b"ABCDEFGHIJ";
        let frames = frames(ResultEncoder::new(4).encode(zipped_result(42, payload)));
        assert_eq!(frames.len(), 5);

        match &frames[0] {
            ChunkedScrapeResponse::Header(header) => {
                assert_eq!(header.scrape_id, 42);
                assert_eq!(header.content_size, 10);
                assert_eq!(header.content_type, "text/plain; version=0.0.4");
            }
            other => panic!("expected header, got {:?}", other),
        }

        let expected = [(1u32, &b"ABCD"[..]), (2, &b"EFGH"[..]), (3, &b"IJ"[..])];
        let mut running = Hasher::new();
        for (frame, (seq, bytes)) in frames[1..4].iter().zip(expected.iter()) {
            match frame {
                ChunkedScrapeResponse::Chunk(chunk) => {
                    running.update(bytes);
                    assert_eq!(chunk.scrape_id, 42);
                    assert_eq!(chunk.chunk_count, *seq);
                    assert_eq!(chunk.chunk_byte_count as usize, bytes.len());
                    assert_eq!(chunk.chunk_bytes, bytes.to_vec());
                    assert_eq!(chunk.chunk_checksum, running.clone().finalize());
                }
                other => panic!("expected chunk, got {:?}", other),
            }
        }

        match &frames[4] {
            ChunkedScrapeResponse::Summary(summary) => {
                assert_eq!(summary.scrape_id, 42);
                assert_eq!(summary.chunk_count, 3);
                assert_eq!(summary.byte_count, 10);
                assert_eq!(summary.checksum, crc32fast::hash(payload));
            }
            other => panic!("expected summary, got {:?}", other),
        }
    }

    #[test]
    fn test_short_final_block_checksum_covers_only_its_bytes() {
        // 2 full blocks of 'x' then a short block of 'y': a checksum folded
        // over the whole block capacity would include stale 'x' bytes
        let mut payload = vec![b'x'; 16];
        payload.extend_from_slice(b"yyy");
        let frames = frames(ResultEncoder::new(8).encode(zipped_result(7, &payload)));

        let last_chunk = match &frames[3] {
            ChunkedScrapeResponse::Chunk(chunk) => chunk.clone(),
            other => panic!("expected chunk, got {:?}", other),
        };
        assert_eq!(last_chunk.chunk_count, 3);
        assert_eq!(last_chunk.chunk_byte_count, 3);
        assert_eq!(last_chunk.chunk_checksum, crc32fast::hash(&payload));
    }

    #[test]
    fn test_round_trip_through_reassembler() {
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i * 31 % 251) as u8).collect();
        for chunk_size in [1usize, 7, 1024, 4096, 9_999, 10_000] {
            let mut reassembler = ChunkedReassembler::new();
            let mut rebuilt = None;
            for frame in frames(ResultEncoder::new(chunk_size).encode(zipped_result(1, &payload))) {
                if let Some(done) = reassembler.push(frame).unwrap() {
                    rebuilt = Some(done);
                }
            }
            let (header, bytes) = rebuilt.unwrap();
            assert_eq!(header.content_size, payload.len() as u64);
            assert_eq!(bytes, payload, "chunk size {}", chunk_size);
        }
    }

    #[test]
    fn test_reassembler_rejects_gaps_and_corruption() {
        let frames = frames(ResultEncoder::new(4).encode(zipped_result(9, b"ABCDEFGHIJ")));

        let mut reassembler = ChunkedReassembler::new();
        reassembler.push(frames[0].clone()).unwrap();
        assert!(matches!(
            reassembler.push(frames[2].clone()),
            Err(AgentError::Codec(_))
        ));

        let mut corrupted = frames[1].clone();
        if let ChunkedScrapeResponse::Chunk(chunk) = &mut corrupted {
            chunk.chunk_bytes[0] ^= 0xff;
        }
        let mut reassembler = ChunkedReassembler::new();
        reassembler.push(frames[0].clone()).unwrap();
        assert!(reassembler.push(corrupted).is_err());

        let mut reassembler = ChunkedReassembler::new();
        assert!(reassembler.push(frames[1].clone()).is_err());
    }
}
