//! RAR processor
//!
//! Walks the block headers of a RAR volume set and emits one output per
//! *stored* file entry, with spans covering the entry's packed data across
//! volumes. Compressed entries, encrypted entries, and encrypted solid
//! sets are fatal per the failure contract. Both RAR 4.x and RAR 5.x
//! header layouts are understood; only storage (method 0) is supported in
//! either.
//!
//! A volume may carry the 4-byte XOR obfuscation overlay; the volume
//! reader undoes it for header parsing and the emitted results flag it so
//! the mount layer can undo it when serving entry bytes.

use crate::error::{Error, Result};
use crate::pipeline::{RAR4_MAGIC, RAR5_MAGIC};

use super::shared::{SegmentSpan, VolumeReader};
use super::{ArchiveInfo, FileGroup, FileProcessingResult, ProcessorContext, media_kind_of};

// RAR4 block types
const MAIN_HEAD: u8 = 0x73;
const FILE_HEAD: u8 = 0x74;
const ENDARC_HEAD: u8 = 0x7B;

// RAR4 main header flags
const MHD_SOLID: u16 = 0x0008;
const MHD_PASSWORD: u16 = 0x0080;

// RAR4 file header flags
const LHD_PASSWORD: u16 = 0x0004;
const LHD_DIRECTORY: u16 = 0x00E0;
const LHD_LARGE: u16 = 0x0100;
const LHD_UNICODE: u16 = 0x0200;

// Generic RAR4 flag: additional data follows the header
const FLAG_ADD_SIZE: u16 = 0x8000;

/// RAR4 stored method byte
const METHOD_STORE4: u8 = 0x30;

// RAR5 header types
const R5_MAIN: u64 = 1;
const R5_FILE: u64 = 2;
const R5_CRYPT: u64 = 4;
const R5_ENDARC: u64 = 5;

// RAR5 flags
const R5_FLAG_EXTRA: u64 = 0x01;
const R5_FLAG_DATA: u64 = 0x02;
const R5_MAIN_SOLID: u64 = 0x0004;
const R5_FILE_DIRECTORY: u64 = 0x0001;
const R5_COMP_SOLID: u64 = 0x0040;
const R5_EXTRA_CRYPT: u64 = 0x01;

/// One output file accumulated across volumes
struct Entry {
    name: String,
    unp_size: u64,
    spans: Vec<SegmentSpan>,
}

/// Process a RAR volume group
pub(super) async fn process(
    group: &FileGroup,
    ctx: &ProcessorContext<'_>,
) -> Result<Vec<FileProcessingResult>> {
    let mut entries: Vec<Entry> = Vec::new();
    let mut xor_obfuscated = false;
    let mut solid = false;

    for info in &group.members {
        if ctx.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let mut reader = VolumeReader::new(info, ctx)?;
        xor_obfuscated |= reader.is_xor_obfuscated();

        let signature = reader.read_at(0, 8).await?;
        if signature.starts_with(RAR5_MAGIC) {
            walk_rar5(&mut reader, &info.filename, &mut solid, &mut entries).await?;
        } else if signature.starts_with(RAR4_MAGIC) {
            walk_rar4(&mut reader, &info.filename, &mut solid, &mut entries).await?;
        } else {
            return Err(Error::InvalidNzb(format!(
                "{} is not a RAR volume",
                info.filename
            )));
        }
    }

    let results = entries
        .into_iter()
        .map(|entry| {
            let packed: u64 = entry.spans.iter().map(SegmentSpan::len).sum();
            FileProcessingResult {
                media_kind: media_kind_of(&entry.name),
                // Stored entries pack 1:1, so a span shortfall means a
                // volume (or part of one) is gone
                corrupt: packed != entry.unp_size,
                name: entry.name,
                size: entry.unp_size,
                spans: entry.spans,
                archive: Some(ArchiveInfo {
                    archive: group.base.clone(),
                    xor_obfuscated,
                }),
            }
        })
        .collect();
    Ok(results)
}

/// Walk the 4.x block chain of one volume
async fn walk_rar4(
    reader: &mut VolumeReader<'_>,
    volume: &str,
    solid: &mut bool,
    entries: &mut Vec<Entry>,
) -> Result<()> {
    let total = reader.total_size();
    let mut offset = RAR4_MAGIC.len() as u64;

    while offset + 7 <= total {
        let head = reader.read_at(offset, 7).await?;
        if head.len() < 7 {
            break;
        }
        let head_type = head[2];
        let flags = u16le(&head[3..5]);
        let head_size = u16le(&head[5..7]) as u64;
        if head_size < 7 {
            tracing::warn!(volume, offset, "RAR block with undersized header, stopping walk");
            break;
        }

        match head_type {
            MAIN_HEAD => {
                if flags & MHD_SOLID != 0 {
                    *solid = true;
                }
                if flags & MHD_PASSWORD != 0 {
                    if *solid {
                        return Err(Error::UnsupportedRarCompression {
                            entry: volume.to_string(),
                            method: 0,
                        });
                    }
                    return Err(Error::PasswordProtectedRar {
                        archive: volume.to_string(),
                    });
                }
                offset += head_size;
            }
            FILE_HEAD => {
                let full = reader.read_at(offset, head_size as usize).await?;
                if full.len() < head_size as usize || full.len() < 32 {
                    break;
                }
                let mut pack_size = u32le(&full[7..11]) as u64;
                let mut unp_size = u32le(&full[11..15]) as u64;
                let method = full[25];
                let name_size = u16le(&full[26..28]) as usize;

                let name_at = if flags & LHD_LARGE != 0 {
                    pack_size |= (u32le(&full[32..36]) as u64) << 32;
                    unp_size |= (u32le(&full[36..40]) as u64) << 32;
                    40
                } else {
                    32
                };
                if name_at + name_size > full.len() {
                    break;
                }
                let name = decode_rar4_name(&full[name_at..name_at + name_size], flags);

                let data_start = offset + head_size;
                let data_end = data_start + pack_size;

                if flags & LHD_DIRECTORY == LHD_DIRECTORY {
                    offset = data_end;
                    continue;
                }
                if flags & LHD_PASSWORD != 0 {
                    if *solid {
                        return Err(Error::UnsupportedRarCompression {
                            entry: name,
                            method: 0,
                        });
                    }
                    return Err(Error::PasswordProtectedRar { archive: name });
                }
                if method != METHOD_STORE4 {
                    return Err(Error::UnsupportedRarCompression {
                        entry: name,
                        method,
                    });
                }

                let spans = reader.spans(data_start, data_end);
                upsert(entries, name, unp_size, spans);
                offset = data_end;
            }
            ENDARC_HEAD => break,
            _ => {
                let mut add_size = 0u64;
                if flags & FLAG_ADD_SIZE != 0 {
                    let extra = reader.read_at(offset + 7, 4).await?;
                    if extra.len() < 4 {
                        break;
                    }
                    add_size = u32le(&extra) as u64;
                }
                offset += head_size + add_size;
            }
        }
    }
    Ok(())
}

/// Walk the 5.x block chain of one volume
async fn walk_rar5(
    reader: &mut VolumeReader<'_>,
    volume: &str,
    solid: &mut bool,
    entries: &mut Vec<Entry>,
) -> Result<()> {
    let total = reader.total_size();
    let mut offset = RAR5_MAGIC.len() as u64;

    while offset + 7 <= total {
        // CRC (4 bytes) + vint header size; 1 KiB covers any header we parse
        let probe = reader.read_at(offset, 1024).await?;
        if probe.len() < 6 {
            break;
        }
        let mut pos = 4usize;
        let header_size = read_vint(&probe, &mut pos)?;
        let header_total = pos as u64 + header_size;

        let head = if header_total as usize > probe.len() {
            reader.read_at(offset, header_total as usize).await?
        } else {
            probe
        };
        if (head.len() as u64) < header_total {
            break;
        }

        let mut pos = 4usize;
        let _ = read_vint(&head, &mut pos)?;
        let header_start = pos;
        let header_type = read_vint(&head, &mut pos)?;
        let header_flags = read_vint(&head, &mut pos)?;
        let mut extra_size = 0u64;
        let mut data_size = 0u64;
        if header_flags & R5_FLAG_EXTRA != 0 {
            extra_size = read_vint(&head, &mut pos)?;
        }
        if header_flags & R5_FLAG_DATA != 0 {
            data_size = read_vint(&head, &mut pos)?;
        }

        match header_type {
            R5_MAIN => {
                let archive_flags = read_vint(&head, &mut pos)?;
                if archive_flags & R5_MAIN_SOLID != 0 {
                    *solid = true;
                }
            }
            R5_CRYPT => {
                // Header encryption precedes everything readable
                return Err(Error::PasswordProtectedRar {
                    archive: volume.to_string(),
                });
            }
            R5_FILE => {
                let file_flags = read_vint(&head, &mut pos)?;
                let unp_size = read_vint(&head, &mut pos)?;
                let _attributes = read_vint(&head, &mut pos)?;
                if file_flags & 0x02 != 0 {
                    pos += 4; // mtime
                }
                if file_flags & 0x04 != 0 {
                    pos += 4; // data crc
                }
                let compression = read_vint(&head, &mut pos)?;
                let _host_os = read_vint(&head, &mut pos)?;
                let name_len = read_vint(&head, &mut pos)? as usize;
                if pos + name_len > head.len() {
                    break;
                }
                let name = String::from_utf8_lossy(&head[pos..pos + name_len]).into_owned();

                let method = ((compression >> 7) & 0x7) as u8;
                let entry_solid = *solid || compression & R5_COMP_SOLID != 0;
                let encrypted = extra_size > 0
                    && extra_has_crypt(&head, header_start, header_total as usize, extra_size);

                let data_start = offset + header_total;
                let data_end = data_start + data_size;

                if file_flags & R5_FILE_DIRECTORY != 0 {
                    offset = data_end;
                    continue;
                }
                if encrypted {
                    if entry_solid {
                        return Err(Error::UnsupportedRarCompression {
                            entry: name,
                            method: 0,
                        });
                    }
                    return Err(Error::PasswordProtectedRar { archive: name });
                }
                if method != 0 {
                    return Err(Error::UnsupportedRarCompression {
                        entry: name,
                        method,
                    });
                }

                let spans = reader.spans(data_start, data_end);
                upsert(entries, name, unp_size, spans);
                offset = data_end;
                continue;
            }
            R5_ENDARC => break,
            _ => {}
        }
        offset += header_total + data_size;
    }
    Ok(())
}

/// Does the RAR5 extra area carry an encryption record
fn extra_has_crypt(head: &[u8], header_start: usize, header_total: usize, extra_size: u64) -> bool {
    let Some(extra_start) = header_total.checked_sub(extra_size as usize) else {
        return false;
    };
    if extra_start < header_start || header_total > head.len() {
        return false;
    }
    let extra = &head[extra_start..header_total];
    let mut pos = 0usize;
    while pos < extra.len() {
        let Ok(record_size) = read_vint(extra, &mut pos) else {
            return false;
        };
        let record_start = pos;
        let Ok(record_type) = read_vint(extra, &mut pos) else {
            return false;
        };
        if record_type == R5_EXTRA_CRYPT {
            return true;
        }
        pos = record_start + record_size as usize;
    }
    false
}

/// RAR5 variable-length integer: 7 bits per byte, high bit continues
fn read_vint(buf: &[u8], pos: &mut usize) -> Result<u64> {
    let mut value = 0u64;
    for i in 0..10 {
        let byte = *buf
            .get(*pos)
            .ok_or_else(|| Error::InvalidNzb("truncated RAR5 header".into()))?;
        *pos += 1;
        value |= ((byte & 0x7F) as u64) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(Error::InvalidNzb("overlong RAR5 vint".into()))
}

/// RAR4 names: with the unicode flag the ASCII name precedes a NUL
fn decode_rar4_name(raw: &[u8], flags: u16) -> String {
    let raw = if flags & LHD_UNICODE != 0 {
        match raw.iter().position(|&b| b == 0) {
            Some(at) => &raw[..at],
            None => raw,
        }
    } else {
        raw
    };
    String::from_utf8_lossy(raw).into_owned()
}

/// Append spans to an entry, creating it on first sight
///
/// Split entries repeat their file header in every volume; volume order
/// guarantees spans land in byte order.
fn upsert(entries: &mut Vec<Entry>, name: String, unp_size: u64, spans: Vec<SegmentSpan>) {
    if let Some(entry) = entries.iter_mut().find(|e| e.name == name) {
        entry.spans.extend(spans);
        if entry.unp_size == 0 {
            entry.unp_size = unp_size;
        }
    } else {
        entries.push(Entry {
            name,
            unp_size,
            spans,
        });
    }
}

fn u16le(b: &[u8]) -> u16 {
    u16::from_le_bytes([b[0], b[1]])
}

fn u32le(b: &[u8]) -> u32 {
    u32::from_le_bytes([b[0], b[1], b[2], b[3]])
}
