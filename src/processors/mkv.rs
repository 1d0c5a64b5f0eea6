//! Multi-part MKV processor
//!
//! `foo.mkv.001`, `foo.mkv.002`, … are raw byte splits of one video file.
//! The group concatenates into a single logical MKV: spans of every part
//! in ordinal order, size the sum of the parts.

use crate::error::{Error, Result};

use super::shared::full_file_spans;
use super::{FileGroup, FileProcessingResult, MediaKind, ProcessorContext};

/// Concatenate the group's parts into one logical MKV
pub(super) async fn process(
    group: &FileGroup,
    _ctx: &ProcessorContext<'_>,
) -> Result<Vec<FileProcessingResult>> {
    let mut spans = Vec::new();
    let mut size = 0u64;

    for info in &group.members {
        let part_size = info.size.ok_or_else(|| {
            Error::InvalidNzb(format!("unresolved size for {}", info.filename))
        })?;
        spans.extend(full_file_spans(info)?);
        size += part_size;
    }

    Ok(vec![FileProcessingResult {
        name: group.base.clone(),
        size,
        spans,
        media_kind: MediaKind::Video,
        corrupt: false,
        archive: None,
    }])
}
