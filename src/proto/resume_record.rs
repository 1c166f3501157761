//! Protobuf messages persisted next to a partial download.

use prost::Message;

#[derive(Clone, PartialEq, Message)]
pub struct ResumeRecord {
    #[prost(uint32, tag = "1")]
    pub version: u32,
    #[prost(message, optional, tag = "2")]
    pub fingerprint: Option<ManifestFingerprint>,
    #[prost(message, repeated, tag = "3")]
    pub layout: Vec<SegmentBounds>,
    #[prost(uint32, repeated, tag = "4")]
    pub completed_segments: Vec<u32>,
    #[prost(message, repeated, tag = "5")]
    pub partial_segments: Vec<PartialSegment>,
    /// unix seconds
    #[prost(int64, tag = "6")]
    pub updated_at: i64,
}

#[derive(Clone, PartialEq, Message)]
pub struct ManifestFingerprint {
    #[prost(uint64, optional, tag = "1")]
    pub size: Option<u64>,
    #[prost(string, tag = "2")]
    pub algorithm: String,
    /// lowercase hex
    #[prost(string, tag = "3")]
    pub digest: String,
    /// sha-256 of the mirror URL list
    #[prost(bytes = "vec", tag = "4")]
    pub mirrors_hash: Vec<u8>,
    /// sha-256 of the chunk list
    #[prost(bytes = "vec", tag = "5")]
    pub chunks_hash: Vec<u8>,
}

#[derive(Clone, Copy, PartialEq, Eq, Message)]
pub struct SegmentBounds {
    #[prost(uint64, tag = "1")]
    pub offset: u64,
    #[prost(uint64, tag = "2")]
    pub length: u64,
}

#[derive(Clone, Copy, PartialEq, Eq, Message)]
pub struct PartialSegment {
    #[prost(uint32, tag = "1")]
    pub index: u32,
    #[prost(uint64, tag = "2")]
    pub received: u64,
}

impl From<(u64, u64)> for SegmentBounds {
    fn from((offset, length): (u64, u64)) -> Self {
        Self { offset, length }
    }
}

impl From<SegmentBounds> for (u64, u64) {
    fn from(bounds: SegmentBounds) -> Self {
        (bounds.offset, bounds.length)
    }
}
