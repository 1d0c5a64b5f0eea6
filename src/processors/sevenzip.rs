//! 7z processor
//!
//! Parses the end-of-archive header of a 7z archive and emits one output
//! per stored (copy-coded) entry. Only single-coder copy folders are
//! supported; AES folders are password protected (the NZB password cannot
//! help, decryption is out of scope), anything else is unsupported. Split
//! archives (`.7z.001` …) are plain byte splits, so volumes concatenate
//! into one logical archive before parsing.

use crate::error::{Error, Result};
use crate::pipeline::SEVENZIP_MAGIC;

use super::shared::{SegmentSpan, VolumeReader};
use super::{ArchiveInfo, FileGroup, FileProcessingResult, ProcessorContext, media_kind_of};

// Property ids of the 7z header grammar
const K_END: u64 = 0x00;
const K_HEADER: u64 = 0x01;
const K_ARCHIVE_PROPERTIES: u64 = 0x02;
const K_MAIN_STREAMS_INFO: u64 = 0x04;
const K_FILES_INFO: u64 = 0x05;
const K_PACK_INFO: u64 = 0x06;
const K_UNPACK_INFO: u64 = 0x07;
const K_SUBSTREAMS_INFO: u64 = 0x08;
const K_SIZE: u64 = 0x09;
const K_CRC: u64 = 0x0A;
const K_FOLDER: u64 = 0x0B;
const K_CODERS_UNPACK_SIZE: u64 = 0x0C;
const K_NUM_UNPACK_STREAM: u64 = 0x0D;
const K_EMPTY_STREAM: u64 = 0x0E;
const K_NAME: u64 = 0x11;
const K_ENCODED_HEADER: u64 = 0x17;

/// Copy (stored) codec id
const CODEC_COPY: &[u8] = &[0x00];
/// AES-256 + SHA-256 codec id
const CODEC_AES: &[u8] = &[0x06, 0xF1, 0x07, 0x01];

/// Process a 7z group (one archive, possibly split over volumes)
pub(super) async fn process(
    group: &FileGroup,
    ctx: &ProcessorContext<'_>,
) -> Result<Vec<FileProcessingResult>> {
    let mut reader = MultiVolumeReader::new(group, ctx)?;

    let signature = reader.read_at(0, 32).await?;
    if !signature.starts_with(SEVENZIP_MAGIC) || signature.len() < 32 {
        return Err(Error::InvalidNzb(format!(
            "{} is not a 7z archive",
            group.base
        )));
    }
    let next_header_offset = u64le(&signature[12..20]);
    let next_header_size = u64le(&signature[20..28]);

    let header = reader
        .read_at(32 + next_header_offset, next_header_size as usize)
        .await?;
    if header.len() < next_header_size as usize || header.is_empty() {
        return Err(Error::InvalidNzb(format!(
            "truncated 7z header in {}",
            group.base
        )));
    }

    let mut cursor = Cursor::new(&header);
    let first = cursor.number()?;
    let parsed = match first {
        K_HEADER => parse_header(&mut cursor, group, ctx)?,
        K_ENCODED_HEADER => {
            // The header itself is packed; its folder coder tells us why
            let streams = parse_streams_info(&mut cursor)?;
            check_coders(&streams, group, ctx)?;
            return Err(Error::InvalidNzb(format!(
                "copy-coded packed header in {}",
                group.base
            )));
        }
        other => {
            return Err(Error::InvalidNzb(format!(
                "unexpected 7z header id {other:#x} in {}",
                group.base
            )));
        }
    };

    // Map substreams to entries; pack position is relative to the end of
    // the 32-byte signature header
    let mut results = Vec::new();
    let mut pack_offsets = Vec::with_capacity(parsed.streams.pack_sizes.len());
    let mut at = 32 + parsed.streams.pack_pos;
    for size in &parsed.streams.pack_sizes {
        pack_offsets.push(at);
        at += size;
    }

    let mut substreams = Vec::new();
    for (folder_index, sizes) in parsed.streams.substream_sizes.iter().enumerate() {
        let Some(base) = pack_offsets.get(folder_index) else {
            break;
        };
        let mut running = *base;
        for size in sizes {
            substreams.push((running, *size));
            running += size;
        }
    }

    let mut next_substream = substreams.into_iter();
    for file in &parsed.files {
        if file.empty {
            continue;
        }
        let Some((offset, size)) = next_substream.next() else {
            // More names than data streams: damaged header
            results.push(FileProcessingResult {
                name: file.name.clone(),
                size: 0,
                spans: Vec::new(),
                media_kind: media_kind_of(&file.name),
                corrupt: true,
                archive: Some(ArchiveInfo {
                    archive: group.base.clone(),
                    xor_obfuscated: false,
                }),
            });
            continue;
        };
        results.push(FileProcessingResult {
            name: file.name.clone(),
            size,
            spans: reader.spans(offset, offset + size),
            media_kind: media_kind_of(&file.name),
            corrupt: false,
            archive: Some(ArchiveInfo {
                archive: group.base.clone(),
                xor_obfuscated: false,
            }),
        });
    }
    Ok(results)
}

struct ParsedHeader {
    streams: StreamsInfo,
    files: Vec<FileEntry>,
}

struct FileEntry {
    name: String,
    empty: bool,
}

#[derive(Default)]
struct StreamsInfo {
    pack_pos: u64,
    pack_sizes: Vec<u64>,
    /// First coder id of each folder
    folder_coders: Vec<Vec<u8>>,
    /// Total unpacked size of each folder
    folder_sizes: Vec<u64>,
    /// Substream sizes per folder
    substream_sizes: Vec<Vec<u64>>,
}

fn parse_header(
    cursor: &mut Cursor<'_>,
    group: &FileGroup,
    ctx: &ProcessorContext<'_>,
) -> Result<ParsedHeader> {
    let mut streams = StreamsInfo::default();
    let mut files = Vec::new();

    loop {
        let id = cursor.number()?;
        match id {
            K_END => break,
            K_ARCHIVE_PROPERTIES => skip_properties(cursor)?,
            K_MAIN_STREAMS_INFO => {
                streams = parse_streams_info(cursor)?;
                // Reject anything that is not plain storage before going on
                check_coders(&streams, group, ctx)?;
            }
            K_FILES_INFO => files = parse_files_info(cursor)?,
            _ => {
                let size = cursor.number()? as usize;
                cursor.skip(size)?;
            }
        }
    }

    Ok(ParsedHeader { streams, files })
}

/// Reject folders whose coder is anything but plain storage
fn check_coders(
    streams: &StreamsInfo,
    group: &FileGroup,
    ctx: &ProcessorContext<'_>,
) -> Result<()> {
    for coder in &streams.folder_coders {
        if coder == CODEC_COPY {
            continue;
        }
        if coder == CODEC_AES {
            if ctx.password.is_some() {
                tracing::info!(
                    archive = %group.base,
                    "7z archive is AES encrypted; a password is present but decryption is not supported"
                );
            }
            return Err(Error::PasswordProtectedSevenZip {
                archive: group.base.clone(),
            });
        }
        let mut codec = 0u64;
        for &b in coder {
            codec = (codec << 8) | b as u64;
        }
        return Err(Error::UnsupportedSevenZipCompression {
            entry: group.base.clone(),
            codec,
        });
    }
    Ok(())
}

fn parse_streams_info(cursor: &mut Cursor<'_>) -> Result<StreamsInfo> {
    let mut info = StreamsInfo::default();

    loop {
        let id = cursor.number()?;
        match id {
            K_END => break,
            K_PACK_INFO => {
                info.pack_pos = cursor.number()?;
                let count = cursor.number()? as usize;
                loop {
                    match cursor.number()? {
                        K_END => break,
                        K_SIZE => {
                            for _ in 0..count {
                                info.pack_sizes.push(cursor.number()?);
                            }
                        }
                        K_CRC => skip_digests(cursor, count)?,
                        _ => return Err(bad("unexpected id in PackInfo")),
                    }
                }
            }
            K_UNPACK_INFO => {
                if cursor.number()? != K_FOLDER {
                    return Err(bad("UnpackInfo without Folder"));
                }
                let folder_count = cursor.number()? as usize;
                if cursor.byte()? != 0 {
                    return Err(bad("external folder definitions"));
                }
                let mut total_out = 0usize;
                for _ in 0..folder_count {
                    let coder_count = cursor.number()? as usize;
                    let mut first_coder = Vec::new();
                    let mut out_streams = 0usize;
                    for c in 0..coder_count {
                        let flags = cursor.byte()?;
                        let id_len = (flags & 0x0F) as usize;
                        let complex = flags & 0x10 != 0;
                        let has_attrs = flags & 0x20 != 0;
                        let id = cursor.bytes(id_len)?.to_vec();
                        if c == 0 {
                            first_coder = id;
                        }
                        let (_ins, outs) = if complex {
                            (cursor.number()? as usize, cursor.number()? as usize)
                        } else {
                            (1, 1)
                        };
                        out_streams += outs;
                        if has_attrs {
                            let size = cursor.number()? as usize;
                            cursor.skip(size)?;
                        }
                    }
                    // Bind pairs exist only with multiple out streams
                    for _ in 0..out_streams.saturating_sub(1) {
                        let _ = cursor.number()?;
                        let _ = cursor.number()?;
                    }
                    total_out += out_streams;
                    info.folder_coders.push(first_coder);
                }
                loop {
                    match cursor.number()? {
                        K_END => break,
                        K_CODERS_UNPACK_SIZE => {
                            for _ in 0..total_out {
                                info.folder_sizes.push(cursor.number()?);
                            }
                        }
                        K_CRC => skip_digests(cursor, folder_count)?,
                        _ => return Err(bad("unexpected id in UnpackInfo")),
                    }
                }
            }
            K_SUBSTREAMS_INFO => {
                let mut counts: Vec<usize> = info.folder_coders.iter().map(|_| 1).collect();
                let mut explicit_sizes: Vec<u64> = Vec::new();
                loop {
                    match cursor.number()? {
                        K_END => break,
                        K_NUM_UNPACK_STREAM => {
                            counts = (0..info.folder_coders.len())
                                .map(|_| cursor.number().map(|n| n as usize))
                                .collect::<Result<_>>()?;
                        }
                        K_SIZE => {
                            // count-1 sizes per folder; the last is derived
                            for (folder, count) in counts.iter().enumerate() {
                                let mut used = 0u64;
                                for _ in 0..count.saturating_sub(1) {
                                    let size = cursor.number()?;
                                    used += size;
                                    explicit_sizes.push(size);
                                }
                                if *count > 0 {
                                    let folder_size =
                                        info.folder_sizes.get(folder).copied().unwrap_or(0);
                                    explicit_sizes.push(folder_size.saturating_sub(used));
                                }
                            }
                        }
                        K_CRC => {
                            let total: usize = counts.iter().sum();
                            skip_digests(cursor, total)?;
                        }
                        _ => return Err(bad("unexpected id in SubStreamsInfo")),
                    }
                }
                if explicit_sizes.is_empty() {
                    // No kSize: every folder holds exactly `count` streams of
                    // derived size; with count 1 that is the folder size
                    for (folder, count) in counts.iter().enumerate() {
                        let folder_size = info.folder_sizes.get(folder).copied().unwrap_or(0);
                        let mut sizes = Vec::new();
                        if *count == 1 {
                            sizes.push(folder_size);
                        } else {
                            return Err(bad("substream counts without sizes"));
                        }
                        info.substream_sizes.push(sizes);
                    }
                } else {
                    let mut it = explicit_sizes.into_iter();
                    for count in counts {
                        info.substream_sizes
                            .push((&mut it).take(count).collect());
                    }
                }
            }
            _ => return Err(bad("unexpected id in StreamsInfo")),
        }
    }

    // Without SubStreamsInfo every folder is one stream
    if info.substream_sizes.is_empty() {
        info.substream_sizes = info.folder_sizes.iter().map(|s| vec![*s]).collect();
    }
    Ok(info)
}

fn parse_files_info(cursor: &mut Cursor<'_>) -> Result<Vec<FileEntry>> {
    let count = cursor.number()? as usize;
    let mut names: Vec<String> = Vec::new();
    let mut empty = vec![false; count];

    loop {
        let id = cursor.number()?;
        if id == K_END {
            break;
        }
        let size = cursor.number()? as usize;
        let data = cursor.bytes(size)?;
        match id {
            K_EMPTY_STREAM => {
                for (i, flag) in empty.iter_mut().enumerate() {
                    let byte = data.get(i / 8).copied().unwrap_or(0);
                    *flag = byte & (0x80 >> (i % 8)) != 0;
                }
            }
            K_NAME => {
                let mut inner = Cursor::new(data);
                if inner.byte()? != 0 {
                    return Err(bad("external file names"));
                }
                for _ in 0..count {
                    names.push(read_utf16_name(&mut inner)?);
                }
            }
            _ => {}
        }
    }

    if names.len() != count {
        return Err(bad("file name table does not match file count"));
    }
    Ok(names
        .into_iter()
        .zip(empty)
        .map(|(name, empty)| FileEntry { name, empty })
        .collect())
}

fn read_utf16_name(cursor: &mut Cursor<'_>) -> Result<String> {
    let mut units = Vec::new();
    loop {
        let lo = cursor.byte()? as u16;
        let hi = cursor.byte()? as u16;
        let unit = lo | (hi << 8);
        if unit == 0 {
            break;
        }
        units.push(unit);
    }
    Ok(String::from_utf16_lossy(&units))
}

fn skip_properties(cursor: &mut Cursor<'_>) -> Result<()> {
    loop {
        let id = cursor.number()?;
        if id == K_END {
            return Ok(());
        }
        let size = cursor.number()? as usize;
        cursor.skip(size)?;
    }
}

/// Skip a digests record covering `count` streams
fn skip_digests(cursor: &mut Cursor<'_>, count: usize) -> Result<()> {
    let all_defined = cursor.byte()?;
    let defined = if all_defined != 0 {
        count
    } else {
        let bytes = cursor.bytes(count.div_ceil(8))?;
        bytes
            .iter()
            .map(|b| b.count_ones() as usize)
            .sum::<usize>()
            .min(count)
    };
    cursor.skip(defined * 4)
}

fn bad(what: &str) -> Error {
    Error::InvalidNzb(format!("malformed 7z header: {what}"))
}

fn u64le(b: &[u8]) -> u64 {
    u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

/// Byte cursor with the 7z variable-length number encoding
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn byte(&mut self) -> Result<u8> {
        let b = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| bad("unexpected end of header"))?;
        self.pos += 1;
        Ok(b)
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(bad("unexpected end of header"));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        self.bytes(n).map(|_| ())
    }

    /// 7z ReadNumber: leading bits of the first byte select how many
    /// little-endian continuation bytes follow
    fn number(&mut self) -> Result<u64> {
        let first = self.byte()?;
        let mut mask = 0x80u8;
        let mut value = 0u64;
        for i in 0..8 {
            if first & mask == 0 {
                let high = (first & mask.wrapping_sub(1)) as u64;
                value |= high << (8 * i);
                return Ok(value);
            }
            value |= (self.byte()? as u64) << (8 * i);
            mask >>= 1;
        }
        Ok(value)
    }
}

/// Concatenated reads over a split archive's volumes
struct MultiVolumeReader<'a> {
    volumes: Vec<VolumeReader<'a>>,
    starts: Vec<u64>,
    total: u64,
}

impl<'a> MultiVolumeReader<'a> {
    fn new(group: &'a FileGroup, ctx: &'a ProcessorContext<'a>) -> Result<Self> {
        let mut volumes = Vec::with_capacity(group.members.len());
        let mut starts = Vec::with_capacity(group.members.len());
        let mut at = 0u64;
        for info in &group.members {
            let reader = VolumeReader::new(info, ctx)?;
            starts.push(at);
            at += reader.total_size();
            volumes.push(reader);
        }
        Ok(Self {
            volumes,
            starts,
            total: at,
        })
    }

    async fn read_at(&mut self, offset: u64, len: usize) -> Result<bytes::Bytes> {
        let end = (offset + len as u64).min(self.total);
        if offset >= end {
            return Ok(bytes::Bytes::new());
        }
        let mut out = Vec::with_capacity((end - offset) as usize);
        let mut at = offset;
        while at < end {
            let vol = match self.starts.binary_search(&at) {
                Ok(i) => i,
                Err(i) => i - 1,
            };
            let vol_start = self.starts[vol];
            let vol_len = self.volumes[vol].total_size();
            let from = at - vol_start;
            let to = (end - vol_start).min(vol_len);
            let chunk = self.volumes[vol]
                .read_at(from, (to - from) as usize)
                .await?;
            out.extend_from_slice(&chunk);
            at = vol_start + to;
        }
        Ok(bytes::Bytes::from(out))
    }

    fn spans(&self, start: u64, end: u64) -> Vec<SegmentSpan> {
        let end = end.min(self.total);
        let mut spans = Vec::new();
        let mut at = start;
        while at < end {
            let vol = match self.starts.binary_search(&at) {
                Ok(i) => i,
                Err(i) => i - 1,
            };
            let vol_start = self.starts[vol];
            let vol_len = self.volumes[vol].total_size();
            let from = at - vol_start;
            let to = (end - vol_start).min(vol_len);
            spans.extend(self.volumes[vol].spans(from, to));
            at = vol_start + to;
        }
        spans
    }
}
