use crate::hash::HashDigest;

/// Smallest segment produced when splitting a file without manifest chunks.
pub const DEFAULT_MIN_SEGMENT_SIZE: u64 = 256 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub index: usize,
    pub offset: u64,
    /// None only for a sequential segment of unknown size.
    pub length: Option<u64>,
    /// Present for manifest chunks.
    pub checksum: Option<HashDigest>,
}

impl Segment {
    /// Exclusive end offset.
    pub fn end(&self) -> Option<u64> {
        self.length.map(|l| self.offset + l)
    }

    pub fn is_empty(&self) -> bool {
        self.length == Some(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanMode {
    /// Segments are the manifest chunks, each with its own checksum.
    ManifestChunks,
    /// Known size split evenly across ranged mirrors.
    EvenSplit,
    /// One segment fetched front to back; whole-file verification only.
    Sequential,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentPlan {
    pub mode: PlanMode,
    pub segments: Vec<Segment>,
    pub size: Option<u64>,
}

impl SegmentPlan {
    /// Whether segments can be fetched independently and resumed mid-file.
    pub fn is_segmented(&self) -> bool {
        self.mode != PlanMode::Sequential
    }

    pub fn has_chunk_checksums(&self) -> bool {
        self.mode == PlanMode::ManifestChunks
    }

    /// `(offset, length)` pairs, used to fingerprint the layout.
    pub fn layout(&self) -> Vec<(u64, u64)> {
        self.segments
            .iter()
            .map(|s| (s.offset, s.length.unwrap_or(u64::MAX)))
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SegmentPlanner {
    max_connections: u64,
    min_segment_size: u64,
}

impl SegmentPlanner {
    pub fn new(max_connections: u64, min_segment_size: u64) -> Self {
        Self {
            max_connections: max_connections.max(1),
            min_segment_size: min_segment_size.max(1),
        }
    }

    /// Divides a file into segments.
    ///
    /// `chunks` pairs each manifest chunk length with its digest and may be
    /// empty. `ranged_mirrors` counts candidate mirrors whose transport
    /// supports byte ranges.
    pub fn plan(
        &self,
        size: Option<u64>,
        chunks: &[(u64, HashDigest)],
        ranged_mirrors: usize,
    ) -> SegmentPlan {
        if size == Some(0) {
            return SegmentPlan {
                mode: PlanMode::Sequential,
                segments: vec![Segment {
                    index: 0,
                    offset: 0,
                    length: Some(0),
                    checksum: None,
                }],
                size,
            };
        }

        let size = match size {
            Some(size) if ranged_mirrors > 0 => size,
            _ => return Self::sequential(size),
        };

        if !chunks.is_empty() {
            let mut offset = 0;
            let segments = chunks
                .iter()
                .enumerate()
                .map(|(index, (length, digest))| {
                    let segment = Segment {
                        index,
                        offset,
                        length: Some(*length),
                        checksum: Some(digest.clone()),
                    };
                    offset += length;
                    segment
                })
                .collect();
            return SegmentPlan {
                mode: PlanMode::ManifestChunks,
                segments,
                size: Some(size),
            };
        }

        let by_size = size.div_ceil(self.min_segment_size);
        let count = self
            .max_connections
            .min(ranged_mirrors as u64)
            .min(by_size)
            .max(1);

        let base_size = size / count;
        let remainder = size % count;
        let mut offset = 0;
        let segments = (0..count)
            .map(|i| {
                let length = if i == 0 { base_size + remainder } else { base_size };
                let segment = Segment {
                    index: i as usize,
                    offset,
                    length: Some(length),
                    checksum: None,
                };
                offset += length;
                segment
            })
            .collect();

        SegmentPlan {
            mode: PlanMode::EvenSplit,
            segments,
            size: Some(size),
        }
    }

    fn sequential(size: Option<u64>) -> SegmentPlan {
        SegmentPlan {
            mode: PlanMode::Sequential,
            segments: vec![Segment {
                index: 0,
                offset: 0,
                length: size,
                checksum: None,
            }],
            size,
        }
    }
}
