//! # File Chunker
//!
//! Splits a [`ChunkSource`] into partitions for transmission (spec §4.2).
//! A partition is a run of one or more fixed-size chunks, capped by
//! `max_partition_size`, handed to the session layer as a single binary
//! frame (or, over a relay transport, a single base64 blob) so the
//! transport doesn't pay per-chunk framing overhead for small chunk
//! sizes.
//!
//! Grounded on the teacher's `storage::chunking` module's split between
//! "how big is a unit" and "how do we walk the source producing units",
//! adapted from whole-file-in-memory chunking to the streaming,
//! flow-controlled partitioning the distilled spec actually calls for.

use crate::config::EngineConfig;
use crate::error::Result;
use crate::transfer::source::ChunkSource;

/// Walks a [`ChunkSource`] front-to-back, producing partitions no larger
/// than `max_partition_size`, each itself a concatenation of
/// `chunk_size`-sized reads.
pub struct FileChunker<S: ChunkSource> {
    source: S,
    chunk_size: usize,
    max_partition_size: usize,
    offset: u64,
    last_reported_progress: f64,
    progress_report_threshold: f64,
}

impl<S: ChunkSource> FileChunker<S> {
    pub fn new(source: S, config: &EngineConfig) -> Self {
        Self {
            source,
            chunk_size: config.chunk_size,
            max_partition_size: config.max_partition_size,
            offset: 0,
            last_reported_progress: 0.0,
            progress_report_threshold: config.progress_report_threshold,
        }
    }

    pub fn size(&self) -> u64 {
        self.source.size()
    }

    pub fn name(&self) -> &str {
        self.source.name()
    }

    pub fn mime(&self) -> &str {
        self.source.mime()
    }

    /// Current fraction of the source sent, in `0.0..=1.0`. A
    /// zero-length source reports complete progress immediately.
    pub fn progress(&self) -> f64 {
        if self.source.size() == 0 {
            1.0
        } else {
            self.offset as f64 / self.source.size() as f64
        }
    }

    /// Whether the source has been fully read. A source of size zero is
    /// considered already at its end (no partitions are ever produced
    /// for it; the caller sends a header with `size: 0` and an
    /// immediate `transfer-complete`, per spec §4.2 ADDED).
    pub fn is_file_end(&self) -> bool {
        self.offset >= self.source.size()
    }

    /// Read and return the next partition, advancing `offset`. Returns
    /// `None` once [`Self::is_file_end`] is true; never returns
    /// `Some(Vec::new())` — a zero-byte read from the source is treated
    /// as end-of-file rather than emitted as an empty wire frame (spec
    /// §4.2 ADDED, resolving the distilled spec's silence on this case).
    pub async fn next_partition(&mut self) -> Result<Option<Vec<u8>>> {
        if self.is_file_end() {
            return Ok(None);
        }

        let mut partition = Vec::with_capacity(self.max_partition_size.min(
            (self.source.size() - self.offset) as usize,
        ));

        while partition.len() < self.max_partition_size && self.offset < self.source.size() {
            let want = self.chunk_size.min(self.max_partition_size - partition.len());
            let bytes = self.source.read_at(self.offset, want).await?;
            if bytes.is_empty() {
                break;
            }
            self.offset += bytes.len() as u64;
            partition.extend_from_slice(&bytes);
        }

        if partition.is_empty() {
            Ok(None)
        } else {
            Ok(Some(partition))
        }
    }

    /// Re-sends the partition starting at the chunker's *current*
    /// offset without advancing it, by rewinding and re-reading. Exposed
    /// for a retry path a future transport may want, but no caller in
    /// this engine invokes it today (spec §9: the distilled spec names
    /// `repeat_partition` without wiring it to any retry trigger).
    pub async fn repeat_partition(&mut self, from_offset: u64) -> Result<Option<Vec<u8>>> {
        let saved = self.offset;
        self.offset = from_offset;
        let result = self.next_partition().await;
        if result.as_ref().map(|r| r.is_none()).unwrap_or(true) {
            self.offset = saved;
        }
        result
    }

    /// Whether progress has moved far enough past the last reported
    /// value to justify sending a `progress` frame (spec §6).
    pub fn should_report_progress(&mut self) -> bool {
        let current = self.progress();
        if current - self.last_reported_progress >= self.progress_report_threshold || current >= 1.0 {
            self.last_reported_progress = current;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::source::MemorySource;

    fn config(chunk_size: usize, max_partition_size: usize) -> EngineConfig {
        let mut cfg = EngineConfig::default();
        cfg.chunk_size = chunk_size;
        cfg.max_partition_size = max_partition_size;
        cfg
    }

    #[tokio::test]
    async fn single_partition_for_small_file() {
        let src = MemorySource::new("a.bin", "", vec![1, 2, 3, 4]);
        let mut chunker = FileChunker::new(src, &config(2, 1_000));

        let partition = chunker.next_partition().await.unwrap().unwrap();
        assert_eq!(partition, vec![1, 2, 3, 4]);
        assert!(chunker.is_file_end());
        assert!(chunker.next_partition().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn multiple_partitions_respect_max_partition_size() {
        let bytes: Vec<u8> = (0..10u8).collect();
        let src = MemorySource::new("a.bin", "", bytes.clone());
        let mut chunker = FileChunker::new(src, &config(2, 4));

        let p1 = chunker.next_partition().await.unwrap().unwrap();
        assert_eq!(p1, bytes[0..4]);
        assert!(!chunker.is_file_end());

        let p2 = chunker.next_partition().await.unwrap().unwrap();
        assert_eq!(p2, bytes[4..8]);

        let p3 = chunker.next_partition().await.unwrap().unwrap();
        assert_eq!(p3, bytes[8..10]);

        assert!(chunker.is_file_end());
        assert!(chunker.next_partition().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn zero_length_source_is_immediately_at_end() {
        let src = MemorySource::new("empty.bin", "", vec![]);
        let chunker = FileChunker::new(src, &config(64_000, 1_000_000));
        assert!(chunker.is_file_end());
        assert_eq!(chunker.progress(), 1.0);
    }

    #[tokio::test]
    async fn progress_reports_past_threshold() {
        let bytes: Vec<u8> = (0..100u8).collect();
        let src = MemorySource::new("a.bin", "", bytes);
        let mut cfg = config(10, 10);
        cfg.progress_report_threshold = 0.2;
        let mut chunker = FileChunker::new(src, &cfg);

        chunker.next_partition().await.unwrap();
        assert!(!chunker.should_report_progress(), "0.1 progress shouldn't cross a 0.2 threshold");

        chunker.next_partition().await.unwrap();
        assert!(chunker.should_report_progress(), "0.2 progress should cross the threshold");
    }
}
