//! File processors
//!
//! Files are grouped by base name (multi-part suffixes stripped) and each
//! group is classified as exactly one of RAR, 7z, multi-part MKV, or
//! plain. A group's processor walks archive structure where needed and
//! emits one [`FileProcessingResult`] per logical output file, each
//! carrying the ordered segment spans that reconstruct it.
//!
//! Classification is sticky: one member passing a type's positive test
//! (magic or suffix) classifies the whole group.

mod mkv;
mod rar;
mod sevenzip;
mod shared;

pub use shared::{SegmentSpan, VolumeReader, full_file_spans};

use std::collections::BTreeMap;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::fetcher::SegmentFetcher;
use crate::pipeline::FileInfo;
use crate::types::UsageContext;

/// Coarse media classification of an output file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaKind {
    /// Video container
    Video,
    /// Audio file
    Audio,
    /// Subtitle file
    Subtitle,
    /// Everything else
    Other,
}

/// Classify by file extension
pub fn media_kind_of(name: &str) -> MediaKind {
    let ext = name.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    match ext.as_str() {
        "mkv" | "mp4" | "avi" | "m4v" | "ts" | "mov" | "wmv" | "mpg" | "mpeg" | "webm" => {
            MediaKind::Video
        }
        "mp3" | "flac" | "aac" | "ogg" | "wav" | "m4a" | "opus" => MediaKind::Audio,
        "srt" | "sub" | "idx" | "ass" | "ssa" | "vtt" => MediaKind::Subtitle,
        _ => MediaKind::Other,
    }
}

/// Archive membership of an output file
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveInfo {
    /// Base name of the archive the entry came from
    pub archive: String,
    /// Entry data carries the stored-RAR XOR overlay; the mount layer
    /// must undo it when serving bytes
    pub xor_obfuscated: bool,
}

/// One logical output file with its reconstruction recipe
#[derive(Clone, Debug)]
pub struct FileProcessingResult {
    /// Output filename
    pub name: String,
    /// Total output size in bytes
    pub size: u64,
    /// Ordered spans that concatenate to the file's bytes
    pub spans: Vec<SegmentSpan>,
    /// Media classification
    pub media_kind: MediaKind,
    /// Set when the file is known damaged but still mountable
    pub corrupt: bool,
    /// Archive the file was extracted from, if any
    pub archive: Option<ArchiveInfo>,
}

/// Group classification
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileGroupKind {
    /// RAR volume set
    Rar,
    /// 7z archive (possibly split)
    SevenZip,
    /// `foo.mkv.001` style split video
    MultipartMkv,
    /// Standalone file
    Plain,
}

/// A set of files processed together
#[derive(Clone, Debug)]
pub struct FileGroup {
    /// Base name shared by the members
    pub base: String,
    /// Classification
    pub kind: FileGroupKind,
    /// Members in volume/ordinal order
    pub members: Vec<FileInfo>,
}

/// Execution context shared by all processors of one job
pub struct ProcessorContext<'a> {
    /// Segment fetcher
    pub fetcher: &'a SegmentFetcher,
    /// Usage context (class + job name)
    pub usage: UsageContext,
    /// Job cancellation token
    pub cancel: CancellationToken,
    /// Archive password from NZB metadata, if any
    pub password: Option<String>,
}

/// Per-RAR-group connection budget
///
/// Many RAR groups processing in parallel must not starve the pool:
/// `max(1, min(5, max_queue_connections / max(1, rar_count / 3)))`.
pub fn rar_concurrency(max_queue_connections: usize, rar_count: usize) -> usize {
    max_queue_connections
        .checked_div(rar_count / 3)
        .unwrap_or(max_queue_connections)
        .clamp(1, 5)
}

/// Multi-part suffix classification of one filename
#[derive(Clone, Debug, PartialEq, Eq)]
enum Suffix {
    /// `.rar` (ordinal 0) or `.partNN.rar` or `.rNN`
    Rar(u32),
    /// Numeric split `.NNN`; base keeps the inner extension
    Split(u32),
    /// `.7z` or `.7z.NNN`
    SevenZip(u32),
    /// No multi-part suffix
    None,
}

/// Strip a multi-part suffix, returning the group base and the suffix kind
fn split_suffix(name: &str) -> (String, Suffix) {
    let lower = name.to_ascii_lowercase();

    // name.partNN.rar
    if let Some(stem) = lower.strip_suffix(".rar") {
        if let Some(at) = stem.rfind(".part") {
            let digits = &stem[at + 5..];
            if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
                return (
                    name[..at].to_string(),
                    Suffix::Rar(digits.parse().unwrap_or(0)),
                );
            }
        }
        return (name[..name.len() - 4].to_string(), Suffix::Rar(0));
    }

    // name.rNN (old-style volumes follow the .rar head, so ordinal + 1)
    if let Some(at) = lower.rfind('.') {
        let ext = &lower[at + 1..];
        if ext.len() >= 2
            && ext.starts_with('r')
            && ext[1..].chars().all(|c| c.is_ascii_digit())
        {
            let ordinal: u32 = ext[1..].parse().unwrap_or(0);
            return (name[..at].to_string(), Suffix::Rar(ordinal + 1));
        }
    }

    // name.7z / name.7z.NNN
    if lower.ends_with(".7z") {
        return (name[..name.len() - 3].to_string(), Suffix::SevenZip(0));
    }
    if let Some(at) = lower.rfind('.') {
        let ext = &lower[at + 1..];
        if !ext.is_empty() && ext.chars().all(|c| c.is_ascii_digit()) {
            let ordinal: u32 = ext.parse().unwrap_or(0);
            let inner = &name[..at];
            if inner.to_ascii_lowercase().ends_with(".7z") {
                return (inner[..inner.len() - 3].to_string(), Suffix::SevenZip(ordinal));
            }
            // Generic numeric split keeps the inner extension in the base
            return (inner.to_string(), Suffix::Split(ordinal));
        }
    }

    (name.to_string(), Suffix::None)
}

/// Group file infos by base name and classify each group
pub fn group_files(infos: Vec<FileInfo>) -> Vec<FileGroup> {
    let mut by_base: BTreeMap<String, Vec<(Suffix, FileInfo)>> = BTreeMap::new();

    for info in infos {
        let (base, suffix) = split_suffix(&info.filename);
        by_base.entry(base).or_default().push((suffix, info));
    }

    let mut groups = Vec::new();
    for (base, mut members) in by_base {
        members.sort_by(|a, b| ordinal_of(&a.0).cmp(&ordinal_of(&b.0)));

        let is_rar = members
            .iter()
            .any(|(s, info)| info.is_rar || matches!(s, Suffix::Rar(_)));
        let is_seven_zip = !is_rar
            && members
                .iter()
                .any(|(s, info)| info.is_seven_zip || matches!(s, Suffix::SevenZip(_)));
        let is_split_mkv = !is_rar
            && !is_seven_zip
            && base.to_ascii_lowercase().ends_with(".mkv")
            && members.iter().all(|(s, _)| matches!(s, Suffix::Split(_)));

        let kind = if is_rar {
            FileGroupKind::Rar
        } else if is_seven_zip {
            FileGroupKind::SevenZip
        } else if is_split_mkv {
            FileGroupKind::MultipartMkv
        } else {
            FileGroupKind::Plain
        };

        if kind == FileGroupKind::Plain {
            // Plain files are their own outputs; never merge unrelated files
            for (_, info) in members {
                groups.push(FileGroup {
                    base: info.filename.clone(),
                    kind: FileGroupKind::Plain,
                    members: vec![info],
                });
            }
        } else {
            groups.push(FileGroup {
                base,
                kind,
                members: members.into_iter().map(|(_, info)| info).collect(),
            });
        }
    }
    groups
}

fn ordinal_of(suffix: &Suffix) -> u32 {
    match suffix {
        Suffix::Rar(n) | Suffix::Split(n) | Suffix::SevenZip(n) => *n,
        Suffix::None => 0,
    }
}

/// Run one group's processor
pub async fn process_group(
    group: &FileGroup,
    ctx: &ProcessorContext<'_>,
) -> Result<Vec<FileProcessingResult>> {
    if ctx.cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    match group.kind {
        FileGroupKind::Rar => rar::process(group, ctx).await,
        FileGroupKind::SevenZip => sevenzip::process(group, ctx).await,
        FileGroupKind::MultipartMkv => mkv::process(group, ctx).await,
        FileGroupKind::Plain => process_plain(group),
    }
}

/// Run all groups with bounded parallelism, reporting 50-100% progress
pub async fn process_all(
    groups: Vec<FileGroup>,
    ctx: &ProcessorContext<'_>,
    parallelism: usize,
    progress: &crate::progress::ProgressReporter,
) -> Result<Vec<FileProcessingResult>> {
    let total = groups.len();
    let done = std::sync::atomic::AtomicUsize::new(0);

    let outputs: Vec<Result<Vec<FileProcessingResult>>> = futures::stream::iter(groups.iter())
        .map(|group| {
            let done = &done;
            async move {
                let outputs = process_group(group, ctx).await?;
                let finished = done.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1;
                progress.report_span(50, 100, finished, total);
                Ok(outputs)
            }
        })
        .buffer_unordered(parallelism.max(1))
        .collect()
        .await;

    let mut results = Vec::new();
    for output in outputs {
        results.extend(output?);
    }
    Ok(results)
}

/// Plain file: one output covering the whole file
fn process_plain(group: &FileGroup) -> Result<Vec<FileProcessingResult>> {
    let mut results = Vec::new();
    for info in &group.members {
        let size = info.size.ok_or_else(|| {
            Error::InvalidNzb(format!("unresolved size for {}", info.filename))
        })?;
        results.push(FileProcessingResult {
            name: info.filename.clone(),
            size,
            spans: full_file_spans(info)?,
            media_kind: media_kind_of(&info.filename),
            corrupt: false,
            archive: None,
        });
    }
    Ok(results)
}
