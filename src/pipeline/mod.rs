//! Deobfuscation pipeline
//!
//! Turns a parsed NZB into classified, named, sized [`FileInfo`]s ready for
//! the file processors. Staged, each stage concurrency-bounded:
//!
//! 1. Pre-check against the known-missing cache (and, when configured,
//!    `STAT` over every segment)
//! 2. Fetch the first segment of every file; detect magic and archive type
//! 3. Harvest Par2 file descriptors (Par2 identified by magic, never by
//!    extension)
//! 4. Combine into `FileInfo`s: Par2 names/sizes win, header names next,
//!    subject names last; obfuscated candidates lose to structured ones
//! 5. Fill any still-missing sizes from refetched first-segment headers
//!
//! Progress spans 0-50%; file processing owns 50-100%.

pub mod obfuscation;

use std::collections::HashMap;

use bytes::Bytes;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::fetcher::SegmentFetcher;
use crate::nzb::{NzbDocument, NzbFile};
use crate::par2::{self, Par2Descriptor, Par2Index};
use crate::progress::ProgressReporter;
use crate::types::{MessageId, UsageContext};
use crate::yenc::YencHeader;

/// Content type detected from first-segment magic bytes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectedKind {
    /// RAR archive (plain or XOR-obfuscated)
    Rar,
    /// 7z archive
    SevenZip,
    /// Par2 recovery file
    Par2,
    /// Anything else
    Other,
}

/// RAR 4.x signature
pub const RAR4_MAGIC: &[u8] = b"Rar!\x1a\x07\x00";
/// RAR 5.x signature
pub const RAR5_MAGIC: &[u8] = b"Rar!\x1a\x07\x01\x00";
/// 7z signature
pub const SEVENZIP_MAGIC: &[u8] = b"7z\xbc\xaf\x27\x1c";
/// XOR key of the stored-RAR obfuscation overlay
pub const RAR_XOR_KEY: [u8; 4] = [0xB0, 0x41, 0xC2, 0xCE];

/// Classify leading bytes by magic
pub fn detect_kind(data: &[u8]) -> DetectedKind {
    if data.starts_with(RAR4_MAGIC) || data.starts_with(RAR5_MAGIC) || is_xor_obfuscated_rar(data) {
        DetectedKind::Rar
    } else if data.starts_with(SEVENZIP_MAGIC) {
        DetectedKind::SevenZip
    } else if par2::is_par2(data) {
        DetectedKind::Par2
    } else {
        DetectedKind::Other
    }
}

/// Whether leading bytes are a RAR signature under the known XOR overlay
pub fn is_xor_obfuscated_rar(data: &[u8]) -> bool {
    if data.len() < 7 {
        return false;
    }
    let mut head = [0u8; 7];
    for (i, b) in head.iter_mut().enumerate() {
        *b = data[i] ^ RAR_XOR_KEY[i % 4];
    }
    head.starts_with(b"Rar!")
}

/// Fetched and decoded first segment of one file
#[derive(Clone, Debug)]
pub struct FirstSegment {
    /// The segment's message-id
    pub message_id: MessageId,
    /// Decoded bytes
    pub data: Bytes,
    /// Parsed yEnc header
    pub header: YencHeader,
    /// Magic-based classification
    pub kind: DetectedKind,
}

/// One file's pipeline record, mutated as stages resolve names and sizes
#[derive(Clone, Debug)]
pub struct FileInfo {
    /// The NZB file this record describes
    pub file: NzbFile,
    /// Resolved filename (Par2 > yEnc header > subject)
    pub filename: String,
    /// Resolved total size, when known
    pub size: Option<u64>,
    /// Member of a RAR archive
    pub is_rar: bool,
    /// Member of a 7z archive
    pub is_seven_zip: bool,
    /// Canonical Par2 descriptor, when matched
    pub par2: Option<Par2Descriptor>,
    /// First segment, kept for header walks
    pub first_segment: Option<FirstSegment>,
}

impl FileInfo {
    /// Decoded size of each segment, derived from the first segment's
    /// part size and the resolved file size
    ///
    /// Parts of a post are uniformly sized except the last, so the layout
    /// follows from one `=ypart` range plus the total.
    pub fn segment_layout(&self) -> Result<Vec<(MessageId, u64)>> {
        let total = self.size.ok_or_else(|| {
            Error::InvalidNzb(format!("no resolved size for {}", self.filename))
        })?;
        let first = self.first_segment.as_ref().ok_or_else(|| {
            Error::InvalidNzb(format!("no first segment for {}", self.filename))
        })?;

        let part = first.header.part_size().max(1);
        let count = self.file.segments.len() as u64;
        let mut layout = Vec::with_capacity(self.file.segments.len());
        for (i, segment) in self.file.segments.iter().enumerate() {
            let offset = i as u64 * part;
            let size = if offset >= total {
                0
            } else {
                part.min(total - offset)
            };
            layout.push((segment.message_id.clone(), size));
        }

        // The uniform-part assumption must cover the whole file
        let covered: u64 = layout.iter().map(|(_, s)| s).sum();
        if covered != total && count > 0 {
            return Err(Error::InvalidNzb(format!(
                "segment layout of {} covers {covered} of {total} bytes",
                self.filename
            )));
        }
        Ok(layout)
    }
}

/// The staged pipeline over one NZB job
pub struct DeobfuscationPipeline<'a> {
    fetcher: &'a SegmentFetcher,
    config: &'a Config,
    progress: ProgressReporter,
    ctx: UsageContext,
    cancel: CancellationToken,
}

impl<'a> DeobfuscationPipeline<'a> {
    /// Build a pipeline for one job
    pub fn new(
        fetcher: &'a SegmentFetcher,
        config: &'a Config,
        progress: ProgressReporter,
        ctx: UsageContext,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            fetcher,
            config,
            progress,
            ctx,
            cancel,
        }
    }

    /// Run all stages, producing processor-ready file infos
    ///
    /// Par2 files are consumed for their descriptors and do not appear in
    /// the output.
    pub async fn run(&self, nzb: &NzbDocument) -> Result<Vec<FileInfo>> {
        self.pre_check(nzb).await?;
        self.progress.report(5);

        let first_segments = self.fetch_first_segments(nzb).await?;
        self.progress.report(30);

        let par2_index = self.harvest_par2(nzb, &first_segments).await?;
        self.progress.report(40);

        let mut infos = self.build_file_infos(nzb, first_segments, &par2_index);
        self.progress.report(45);

        self.fill_missing_sizes(&mut infos).await;
        self.progress.report(50);

        if infos.is_empty() {
            return Err(Error::InvalidNzb(
                "no processable files after deobfuscation".into(),
            ));
        }
        Ok(infos)
    }

    /// Stage 1: short-circuit segments already known missing; optionally
    /// STAT the whole population
    async fn pre_check(&self, nzb: &NzbDocument) -> Result<()> {
        for file in &nzb.files {
            for segment in &file.segments {
                if self.fetcher.missing_contains(&segment.message_id) {
                    return Err(Error::ArticleNotFound {
                        message_id: segment.message_id.as_str().to_string(),
                    });
                }
            }
        }

        if self.config.connections.ensure_article_existence {
            let ids: Vec<MessageId> = nzb
                .files
                .iter()
                .flat_map(|f| f.segments.iter().map(|s| s.message_id.clone()))
                .collect();
            let progress = self.progress.clone();
            let results = self
                .fetcher
                .check_all_segments(
                    &ids,
                    self.config.connections.max_queue_connections,
                    move |done, total| progress.report_span(0, 5, done, total),
                    &self.ctx,
                    &self.cancel,
                )
                .await?;
            if let Some((missing, _)) = results.iter().find(|(_, exists)| !exists) {
                return Err(Error::ArticleNotFound {
                    message_id: missing.as_str().to_string(),
                });
            }
        }
        Ok(())
    }

    /// Stage 2: fetch and classify every file's first segment
    async fn fetch_first_segments(&self, nzb: &NzbDocument) -> Result<Vec<FirstSegment>> {
        let total = nzb.files.len();
        let done = std::sync::atomic::AtomicUsize::new(0);

        let fetcher = self.fetcher;
        let ctx = &self.ctx;
        let cancel = &self.cancel;
        let progress = &self.progress;
        let fetched: Vec<Result<FirstSegment>> = futures::stream::iter(nzb.files.iter())
            .map(|file| {
                let done = &done;
                async move {
                    let segment = file.first_segment().ok_or_else(|| {
                        Error::InvalidNzb(format!("file without segments: {}", file.subject))
                    })?;
                    let decoded = fetcher
                        .fetch_segment(&segment.message_id, ctx, cancel)
                        .await?;
                    let kind = detect_kind(&decoded.data);
                    let finished =
                        done.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1;
                    progress.report_span(5, 30, finished, total);
                    Ok(FirstSegment {
                        message_id: segment.message_id.clone(),
                        data: decoded.data,
                        header: decoded.header,
                        kind,
                    })
                }
            })
            .buffered(self.config.connections.max_queue_connections.max(1))
            .collect()
            .await;

        fetched.into_iter().collect()
    }

    /// Stage 3: pull descriptor packets out of the Par2 set
    ///
    /// Par2 files are tried smallest-first; the first one yielding
    /// descriptors wins (the index file carries the full set, the volume
    /// files only repeat it).
    async fn harvest_par2(
        &self,
        nzb: &NzbDocument,
        first_segments: &[FirstSegment],
    ) -> Result<Par2Index> {
        let mut par2_files: Vec<&NzbFile> = nzb
            .files
            .iter()
            .zip(first_segments)
            .filter(|(_, fs)| fs.kind == DetectedKind::Par2)
            .map(|(f, _)| f)
            .collect();
        par2_files.sort_by_key(|f| f.total_bytes());

        let mut index = Par2Index::default();
        for file in par2_files {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match self.fetch_whole_file(file).await {
                Ok(data) => match par2::parse_file_descriptors(&data) {
                    Ok(descriptors) if !descriptors.is_empty() => {
                        tracing::debug!(
                            subject = %file.subject,
                            count = descriptors.len(),
                            "harvested Par2 descriptors"
                        );
                        index.extend(descriptors);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(subject = %file.subject, error = %e, "Par2 parse failed");
                    }
                },
                Err(e) => {
                    tracing::warn!(subject = %file.subject, error = %e, "Par2 fetch failed");
                }
            }
        }
        Ok(index)
    }

    /// Stage 4: combine first segments and Par2 descriptors into FileInfos
    fn build_file_infos(
        &self,
        nzb: &NzbDocument,
        first_segments: Vec<FirstSegment>,
        par2_index: &Par2Index,
    ) -> Vec<FileInfo> {
        let mut infos = Vec::new();

        for (file, first) in nzb.files.iter().zip(first_segments) {
            if first.kind == DetectedKind::Par2 {
                continue;
            }

            let par2 = par2_index.lookup_prefix(&first.data).cloned();

            // Par2 name wins; otherwise prefer the yEnc header name unless
            // it is obfuscated and the subject has a structured one
            let filename = match &par2 {
                Some(descriptor) => descriptor.filename.clone(),
                None => pick_header_name(&first.header.name, file),
            };
            let size = par2
                .as_ref()
                .map(|d| d.length)
                .or((first.header.size > 0).then_some(first.header.size));

            infos.push(FileInfo {
                is_rar: first.kind == DetectedKind::Rar,
                is_seven_zip: first.kind == DetectedKind::SevenZip,
                file: file.clone(),
                filename,
                size,
                par2,
                first_segment: Some(first),
            });
        }
        infos
    }

    /// Stage 5: batch-resolve sizes for files the earlier stages left open
    async fn fill_missing_sizes(&self, infos: &mut [FileInfo]) {
        let unresolved: Vec<(usize, MessageId)> = infos
            .iter()
            .enumerate()
            .filter(|(_, info)| info.size.is_none())
            .filter_map(|(i, info)| {
                info.file
                    .first_segment()
                    .map(|s| (i, s.message_id.clone()))
            })
            .collect();
        if unresolved.is_empty() {
            return;
        }

        let sizes: HashMap<usize, u64> = self
            .fetcher
            .file_sizes_batch(
                &unresolved,
                self.config.connections.max_queue_connections.max(1),
                &self.ctx,
                &self.cancel,
            )
            .await;
        for (index, size) in sizes {
            infos[index].size = Some(size);
        }
    }

    /// Fetch every segment of a file and concatenate the decoded bytes
    async fn fetch_whole_file(&self, file: &NzbFile) -> Result<Bytes> {
        let mut parts: Vec<(u64, Bytes)> = futures::stream::iter(file.segments.iter())
            .map(|segment| async move {
                let decoded = self
                    .fetcher
                    .fetch_segment(&segment.message_id, &self.ctx, &self.cancel)
                    .await?;
                Ok::<_, Error>((decoded.header.part_offset(), decoded.data))
            })
            .buffered(self.config.connections.max_queue_connections.max(1))
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<Vec<_>>>()?;

        // Segments decode with their part offsets; order by offset
        parts.sort_by_key(|(offset, _)| *offset);
        let mut out = Vec::new();
        for (_, data) in parts {
            out.extend_from_slice(&data);
        }
        Ok(Bytes::from(out))
    }
}

/// Choose between the yEnc header name and the subject-derived name
fn pick_header_name(header_name: &str, file: &NzbFile) -> String {
    let header_name = header_name.trim();
    let subject_name = file.subject_filename();

    if !header_name.is_empty() && !obfuscation::is_obfuscated(header_name) {
        return header_name.to_string();
    }
    if let Some(name) = subject_name {
        if !obfuscation::is_obfuscated(name) {
            return name.to_string();
        }
    }
    if !header_name.is_empty() {
        return header_name.to_string();
    }
    subject_name
        .map(str::to_string)
        .unwrap_or_else(|| file.subject.clone())
}
