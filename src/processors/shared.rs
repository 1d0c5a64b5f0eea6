//! Shared processor plumbing: span math and volume reads
//!
//! Processors never materialize output files; they emit *span lists* -
//! byte ranges within decoded segments - that the mount layer later
//! streams on demand. The span math relies on the uniform-part layout of a
//! Usenet post (every part the same size except the last), which
//! [`crate::pipeline::FileInfo::segment_layout`] derives from the first
//! segment's `=ypart` range and the resolved file size.

use std::collections::HashMap;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::pipeline::{FileInfo, RAR_XOR_KEY, is_xor_obfuscated_rar};
use crate::types::MessageId;

use super::ProcessorContext;

/// One byte range within a decoded segment, end exclusive
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SegmentSpan {
    /// Segment the bytes live in
    pub message_id: MessageId,
    /// Start offset within the decoded segment
    pub start: u64,
    /// End offset (exclusive) within the decoded segment
    pub end: u64,
}

impl SegmentSpan {
    /// Bytes this span covers
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Whether the span is empty
    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// Spans covering a whole file, one per segment
pub fn full_file_spans(info: &FileInfo) -> Result<Vec<SegmentSpan>> {
    Ok(info
        .segment_layout()?
        .into_iter()
        .filter(|(_, size)| *size > 0)
        .map(|(message_id, size)| SegmentSpan {
            message_id,
            start: 0,
            end: size,
        })
        .collect())
}

/// Random-access reads over one archive volume
///
/// A volume is the concatenation of its decoded segments. Reads fetch the
/// covering segments on demand (the first one is seeded from the
/// pipeline); fetched segments are cached for the header walk. The
/// stored-RAR XOR overlay is undone transparently on read, while the span
/// output keeps pointing at the raw on-wire bytes.
pub struct VolumeReader<'a> {
    info: &'a FileInfo,
    ctx: &'a ProcessorContext<'a>,
    layout: Vec<(MessageId, u64)>,
    /// Cumulative start offset of each segment
    starts: Vec<u64>,
    total: u64,
    cache: HashMap<usize, Bytes>,
    xor: bool,
}

impl<'a> VolumeReader<'a> {
    /// Open a reader over one volume
    pub fn new(info: &'a FileInfo, ctx: &'a ProcessorContext<'a>) -> Result<Self> {
        let layout = info.segment_layout()?;
        let mut starts = Vec::with_capacity(layout.len());
        let mut at = 0u64;
        for (_, size) in &layout {
            starts.push(at);
            at += size;
        }

        let first = info.first_segment.as_ref().ok_or_else(|| {
            Error::InvalidNzb(format!("no first segment for {}", info.filename))
        })?;
        let xor = is_xor_obfuscated_rar(&first.data);

        let mut cache = HashMap::new();
        cache.insert(0, first.data.clone());

        Ok(Self {
            info,
            ctx,
            layout,
            starts,
            total: at,
            cache,
            xor,
        })
    }

    /// Volume size in bytes
    pub fn total_size(&self) -> u64 {
        self.total
    }

    /// Whether the volume carries the stored-RAR XOR overlay
    pub fn is_xor_obfuscated(&self) -> bool {
        self.xor
    }

    /// Read `len` bytes at `offset`, clamped to the volume end
    ///
    /// Returned bytes are de-XORed when the volume is obfuscated, so
    /// header parsing always sees plain archive structure.
    pub async fn read_at(&mut self, offset: u64, len: usize) -> Result<Bytes> {
        let end = (offset + len as u64).min(self.total);
        if offset >= end {
            return Ok(Bytes::new());
        }

        let mut out = Vec::with_capacity((end - offset) as usize);
        let mut at = offset;
        while at < end {
            let seg = match self.starts.binary_search(&at) {
                Ok(i) => i,
                Err(i) => i - 1,
            };
            let seg_start = self.starts[seg];
            let seg_size = self.layout[seg].1;
            let data = self.segment_data(seg).await?;

            let from = (at - seg_start) as usize;
            let to = ((end - seg_start).min(seg_size)) as usize;
            out.extend_from_slice(&data[from..to]);
            at = seg_start + to as u64;
        }

        if self.xor {
            for (i, b) in out.iter_mut().enumerate() {
                *b ^= RAR_XOR_KEY[((offset + i as u64) % 4) as usize];
            }
        }
        Ok(Bytes::from(out))
    }

    /// Map a volume byte range to the segments that hold it
    pub fn spans(&self, start: u64, end: u64) -> Vec<SegmentSpan> {
        let end = end.min(self.total);
        let mut spans = Vec::new();
        let mut at = start;
        while at < end {
            let seg = match self.starts.binary_search(&at) {
                Ok(i) => i,
                Err(i) => i - 1,
            };
            let seg_start = self.starts[seg];
            let seg_size = self.layout[seg].1;
            let from = at - seg_start;
            let to = (end - seg_start).min(seg_size);
            spans.push(SegmentSpan {
                message_id: self.layout[seg].0.clone(),
                start: from,
                end: to,
            });
            at = seg_start + to;
        }
        spans
    }

    async fn segment_data(&mut self, index: usize) -> Result<Bytes> {
        if let Some(data) = self.cache.get(&index) {
            return Ok(data.clone());
        }
        let (message_id, expected) = &self.layout[index];
        let decoded = self
            .ctx
            .fetcher
            .fetch_segment(message_id, &self.ctx.usage, &self.ctx.cancel)
            .await?;
        if decoded.data.len() as u64 != *expected {
            return Err(Error::InvalidYenc(format!(
                "segment {} of {} decoded to {} bytes, layout expects {}",
                message_id,
                self.info.filename,
                decoded.data.len(),
                expected
            )));
        }
        self.cache.insert(index, decoded.data.clone());
        Ok(decoded.data)
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::processors::test_support::{harness, plain_info};

    #[tokio::test]
    async fn read_at_crosses_segment_boundaries() {
        let h = harness().await;
        let ctx = h.ctx();
        // One volume of 2500 bytes split 1000/1000/500; segments beyond the
        // first are fetched from the test server
        let data: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
        let info = h.add_volume("vol.bin", &data, 1000);

        let mut reader = VolumeReader::new(&info, &ctx).unwrap();
        assert_eq!(reader.total_size(), 2500);

        let read = reader.read_at(990, 30).await.unwrap();
        assert_eq!(read.as_ref(), &data[990..1020]);

        // Clamped at the end
        let read = reader.read_at(2490, 100).await.unwrap();
        assert_eq!(read.as_ref(), &data[2490..2500]);
    }

    #[tokio::test]
    async fn spans_map_ranges_onto_segments() {
        let h = harness().await;
        let ctx = h.ctx();
        let data = vec![0u8; 2500];
        let info = plain_info("vol.bin", &data, 1000);
        let reader = VolumeReader::new(&info, &ctx).unwrap();

        let spans = reader.spans(990, 1020);
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].start, 990);
        assert_eq!(spans[0].end, 1000);
        assert_eq!(spans[1].start, 0);
        assert_eq!(spans[1].end, 20);

        let total: u64 = reader.spans(0, 2500).iter().map(SegmentSpan::len).sum();
        assert_eq!(total, 2500);
    }

    #[tokio::test]
    async fn xor_overlay_is_undone_on_read() {
        let h = harness().await;
        let ctx = h.ctx();

        let mut plain = b"Rar!\x1a\x07\x00 stored data here".to_vec();
        plain.resize(64, 0x5A);
        let mut wire = plain.clone();
        for (i, b) in wire.iter_mut().enumerate() {
            *b ^= crate::pipeline::RAR_XOR_KEY[i % 4];
        }

        let info = plain_info("vol.rar", &wire, 64);
        let mut reader = VolumeReader::new(&info, &ctx).unwrap();
        assert!(reader.is_xor_obfuscated());

        // Unaligned read still de-XORs correctly
        let read = reader.read_at(5, 20).await.unwrap();
        assert_eq!(read.as_ref(), &plain[5..25]);
    }

    #[test]
    fn full_file_spans_cover_the_file() {
        let data = vec![1u8; 1500];
        let info = plain_info("f.bin", &data, 1000);
        let spans = full_file_spans(&info).unwrap();
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].end, 1000);
        assert_eq!(spans[1].end, 500);
    }
}
