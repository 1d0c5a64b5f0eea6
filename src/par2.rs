//! Par2 packet parsing
//!
//! Par2 recovery sets carry `FileDesc` packets whose records hold the
//! canonical filename, exact size, and the MD5 of the first 16 KiB of each
//! file. Those records are the authoritative pre-download source of
//! filenames and sizes for obfuscated posts: the pipeline hashes the first
//! 16 KiB of every fetched first segment and joins it against this index.
//!
//! Only the packet framing and `FileDesc` bodies are parsed here; recovery
//! slices are not used by this crate.

use std::collections::HashMap;

use md5::{Digest, Md5};

use crate::error::{Error, Result};

/// Magic at the start of every Par2 packet
pub const PACKET_MAGIC: &[u8; 8] = b"PAR2\0PKT";

/// Packet type of a file-descriptor packet
const TYPE_FILE_DESC: &[u8; 16] = b"PAR 2.0\0FileDesc";

/// Canonical description of one file in the recovery set
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Par2Descriptor {
    /// File id (MD5 of hash16k + length + name, per the Par2 spec)
    pub file_id: [u8; 16],
    /// Canonical filename
    pub filename: String,
    /// Exact file length in bytes
    pub length: u64,
    /// MD5 of the first 16 KiB of the file
    pub hash16k: [u8; 16],
}

/// Index of descriptors keyed by their 16 KiB hash
#[derive(Clone, Debug, Default)]
pub struct Par2Index {
    by_hash16k: HashMap<[u8; 16], Par2Descriptor>,
}

impl Par2Index {
    /// Number of descriptors in the index
    pub fn len(&self) -> usize {
        self.by_hash16k.len()
    }

    /// Whether the index holds no descriptors
    pub fn is_empty(&self) -> bool {
        self.by_hash16k.is_empty()
    }

    /// Add descriptors parsed from one Par2 file
    pub fn extend(&mut self, descriptors: Vec<Par2Descriptor>) {
        for d in descriptors {
            self.by_hash16k.insert(d.hash16k, d);
        }
    }

    /// Look up the descriptor for a file whose first 16 KiB hash to `hash16k`
    pub fn lookup(&self, hash16k: &[u8; 16]) -> Option<&Par2Descriptor> {
        self.by_hash16k.get(hash16k)
    }

    /// Look up by the leading bytes of a file (hashes at most 16 KiB)
    pub fn lookup_prefix(&self, leading: &[u8]) -> Option<&Par2Descriptor> {
        self.lookup(&hash16k(leading))
    }

    /// All descriptors, in no particular order
    pub fn descriptors(&self) -> impl Iterator<Item = &Par2Descriptor> {
        self.by_hash16k.values()
    }
}

/// MD5 over the first 16 KiB of `data`
pub fn hash16k(data: &[u8]) -> [u8; 16] {
    let take = data.len().min(16 * 1024);
    let digest = Md5::digest(&data[..take]);
    digest.into()
}

/// Whether a buffer starts with the Par2 packet magic
pub fn is_par2(data: &[u8]) -> bool {
    data.len() >= PACKET_MAGIC.len() && &data[..PACKET_MAGIC.len()] == PACKET_MAGIC
}

/// Parse all file-descriptor packets out of a Par2 file
///
/// Packets whose MD5 does not verify are skipped (damage in a recovery
/// file must not poison the name/size index). Returns an error only when
/// the buffer does not look like a Par2 file at all.
pub fn parse_file_descriptors(data: &[u8]) -> Result<Vec<Par2Descriptor>> {
    if !is_par2(data) {
        return Err(Error::InvalidNzb("not a Par2 file (bad magic)".into()));
    }

    let mut descriptors = Vec::new();
    let mut offset = 0usize;

    while offset + 64 <= data.len() {
        // Re-sync on the magic; damaged regions between packets are skipped
        if &data[offset..offset + 8] != PACKET_MAGIC {
            offset += 1;
            continue;
        }

        let length = u64::from_le_bytes(
            data[offset + 8..offset + 16]
                .try_into()
                .map_err(|_| Error::InvalidNzb("truncated Par2 packet header".into()))?,
        ) as usize;

        // Header alone is 64 bytes; reject absurd lengths
        if length < 64 || offset + length > data.len() {
            break;
        }

        let packet = &data[offset..offset + length];
        let advertised_md5: [u8; 16] = packet[16..32].try_into().unwrap_or_default();
        let packet_type: &[u8] = &packet[48..64];

        // Packet MD5 covers everything from the recovery-set id onward
        let computed: [u8; 16] = Md5::digest(&packet[32..]).into();
        if computed != advertised_md5 {
            tracing::debug!(offset, "skipping Par2 packet with bad MD5");
            offset += length;
            continue;
        }

        if packet_type == TYPE_FILE_DESC {
            if let Some(descriptor) = parse_file_desc_body(&packet[64..]) {
                descriptors.push(descriptor);
            }
        }

        offset += length;
    }

    Ok(descriptors)
}

/// Parse the body of a FileDesc packet
///
/// Layout: file id (16) + file MD5 (16) + hash16k (16) + length (8) +
/// null-padded ASCII filename.
fn parse_file_desc_body(body: &[u8]) -> Option<Par2Descriptor> {
    if body.len() < 56 {
        return None;
    }
    let file_id: [u8; 16] = body[0..16].try_into().ok()?;
    let hash16k: [u8; 16] = body[32..48].try_into().ok()?;
    let length = u64::from_le_bytes(body[48..56].try_into().ok()?);

    let name_bytes = &body[56..];
    let end = name_bytes
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(name_bytes.len());
    let filename = String::from_utf8_lossy(&name_bytes[..end]).into_owned();
    if filename.is_empty() {
        return None;
    }

    Some(Par2Descriptor {
        file_id,
        filename,
        length,
        hash16k,
    })
}
