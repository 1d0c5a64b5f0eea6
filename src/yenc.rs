//! Streaming yEnc decoder
//!
//! Decodes a single yEnc-encoded part incrementally: bytes are fed in
//! arbitrary chunks (as they arrive off the wire) and decoded output is
//! handed back per chunk. Decoder state, including a trailing `=` escape,
//! crosses chunk boundaries. One decoder instance decodes exactly one part;
//! restarting is not supported.
//!
//! The decoder parses `=ybegin` / `=ypart` headers, maintains a running
//! CRC32 over the decoded bytes, and verifies the `=yend` trailer: the
//! advertised `pcrc32` (or `crc32` for partless posts) must match, and for
//! multi-part posts the decoded length must match the `=ypart` range
//! exactly.

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};

/// Parsed `=ybegin` (and optional `=ypart`) header fields
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct YencHeader {
    /// Declared filename
    pub name: String,
    /// Total file size in bytes
    pub size: u64,
    /// Declared encoded line length
    pub line: u32,
    /// Part number for multi-part posts
    pub part: Option<u32>,
    /// Total part count, when advertised
    pub total: Option<u32>,
    /// 1-based inclusive start offset from `=ypart`
    pub begin: Option<u64>,
    /// Inclusive end offset from `=ypart`
    pub end: Option<u64>,
}

impl YencHeader {
    /// Part number, 1 for partless posts
    pub fn part_number(&self) -> u32 {
        self.part.unwrap_or(1)
    }

    /// Zero-based offset of this part within the file
    pub fn part_offset(&self) -> u64 {
        self.begin.map(|b| b.saturating_sub(1)).unwrap_or(0)
    }

    /// Expected decoded size of this part
    pub fn part_size(&self) -> u64 {
        match (self.begin, self.end) {
            (Some(b), Some(e)) => e.saturating_sub(b) + 1,
            _ => self.size,
        }
    }
}

/// Result of a fully decoded part
#[derive(Clone, Debug)]
pub struct YencDecoded {
    /// Parsed header
    pub header: YencHeader,
    /// Decoded bytes
    pub data: Bytes,
    /// CRC32 computed over `data` (already verified against the trailer)
    pub crc32: u32,
}

#[derive(Debug, PartialEq, Eq)]
enum State {
    /// Skipping preamble lines until `=ybegin`
    Preamble,
    /// Accumulating the `=ypart` line
    PartHeader,
    /// Decoding body bytes
    Body,
    /// Saw `=` at line start; the next byte decides escape vs. control
    LineStartEscape,
    /// Accumulating an `=y…` control line (normally `=yend`)
    Control,
    /// Trailer parsed and verified
    Done,
}

/// Incremental yEnc decoder
#[derive(Debug)]
pub struct YencDecoder {
    state: State,
    line_buf: Vec<u8>,
    header: Option<YencHeader>,
    crc: crc32fast::Hasher,
    decoded_len: u64,
    pending_escape: bool,
    at_line_start: bool,
}

impl Default for YencDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl YencDecoder {
    /// Create a decoder ready to scan for `=ybegin`
    pub fn new() -> Self {
        Self {
            state: State::Preamble,
            line_buf: Vec::new(),
            header: None,
            crc: crc32fast::Hasher::new(),
            decoded_len: 0,
            pending_escape: false,
            at_line_start: true,
        }
    }

    /// Parsed header, available once `=ybegin` (and `=ypart`) were seen
    pub fn header(&self) -> Option<&YencHeader> {
        self.header.as_ref()
    }

    /// Whether the `=yend` trailer has been parsed and verified
    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Bytes decoded so far
    pub fn decoded_len(&self) -> u64 {
        self.decoded_len
    }

    /// Feed a chunk of encoded bytes, returning the decoded bytes it produced
    ///
    /// Bytes arriving after the trailer are ignored (trailing whitespace on
    /// the wire). Errors are terminal for the decoder.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Bytes> {
        let mut out = BytesMut::with_capacity(chunk.len());
        let mut i = 0;

        while i < chunk.len() {
            let b = chunk[i];
            match self.state {
                State::Preamble | State::PartHeader => {
                    // Accumulate raw lines; header lines are ASCII
                    if b == b'\n' {
                        self.take_header_line()?;
                    } else {
                        self.line_buf.push(b);
                    }
                    i += 1;
                }
                State::Body => {
                    if self.pending_escape {
                        self.emit(b.wrapping_sub(64).wrapping_sub(42), &mut out);
                        self.pending_escape = false;
                        self.at_line_start = false;
                        i += 1;
                        continue;
                    }
                    match b {
                        b'\r' => i += 1,
                        b'\n' => {
                            self.at_line_start = true;
                            i += 1;
                        }
                        b'=' if self.at_line_start => {
                            self.state = State::LineStartEscape;
                            i += 1;
                        }
                        b'=' => {
                            self.pending_escape = true;
                            i += 1;
                        }
                        _ => {
                            self.emit(b.wrapping_sub(42), &mut out);
                            self.at_line_start = false;
                            i += 1;
                        }
                    }
                }
                State::LineStartEscape => {
                    if b == b'y' {
                        // Control line (=yend); collect it whole
                        self.line_buf.clear();
                        self.line_buf.extend_from_slice(b"=y");
                        self.state = State::Control;
                    } else {
                        // Ordinary escape that happened to start a line
                        self.emit(b.wrapping_sub(64).wrapping_sub(42), &mut out);
                        self.at_line_start = false;
                        self.state = State::Body;
                    }
                    i += 1;
                }
                State::Control => {
                    if b == b'\n' {
                        self.take_control_line()?;
                    } else {
                        self.line_buf.push(b);
                    }
                    i += 1;
                }
                State::Done => break,
            }
        }

        Ok(out.freeze())
    }

    /// Finalize the decoder; errors if the stream ended prematurely
    pub fn finish(self) -> Result<YencDecoded> {
        match self.state {
            State::Done => {
                let header = self.header.unwrap_or_default();
                Ok(YencDecoded {
                    crc32: self.crc.finalize(),
                    data: Bytes::new(),
                    header,
                })
            }
            State::Preamble => Err(Error::InvalidYenc(
                "stream ended before =ybegin header".into(),
            )),
            _ => Err(Error::InvalidYenc(format!(
                "stream ended before =yend trailer ({} bytes decoded)",
                self.decoded_len
            ))),
        }
    }

    fn emit(&mut self, byte: u8, out: &mut BytesMut) {
        out.extend_from_slice(&[byte]);
        self.crc.update(&[byte]);
        self.decoded_len += 1;
    }

    fn take_header_line(&mut self) -> Result<()> {
        if self.line_buf.last() == Some(&b'\r') {
            self.line_buf.pop();
        }
        let line = String::from_utf8_lossy(&self.line_buf).into_owned();
        self.line_buf.clear();

        match self.state {
            State::Preamble => {
                if let Some(rest) = line.strip_prefix("=ybegin ") {
                    let fields = parse_fields(rest);
                    let header = YencHeader {
                        name: fields.name.clone().unwrap_or_default(),
                        size: fields.get("size").unwrap_or(0),
                        line: fields.get("line").unwrap_or(128) as u32,
                        part: fields.get("part").map(|v| v as u32),
                        total: fields.get("total").map(|v| v as u32),
                        begin: None,
                        end: None,
                    };
                    let multipart = header.part.is_some();
                    self.header = Some(header);
                    self.state = if multipart {
                        State::PartHeader
                    } else {
                        State::Body
                    };
                    self.at_line_start = true;
                }
                // Anything else is preamble noise; keep scanning
                Ok(())
            }
            State::PartHeader => {
                let Some(rest) = line.strip_prefix("=ypart ") else {
                    return Err(Error::InvalidYenc(format!(
                        "expected =ypart after multi-part =ybegin, got {line:?}"
                    )));
                };
                let fields = parse_fields(rest);
                if let Some(header) = self.header.as_mut() {
                    header.begin = fields.get("begin");
                    header.end = fields.get("end");
                }
                self.state = State::Body;
                self.at_line_start = true;
                Ok(())
            }
            _ => unreachable!("take_header_line outside header states"),
        }
    }

    fn take_control_line(&mut self) -> Result<()> {
        if self.line_buf.last() == Some(&b'\r') {
            self.line_buf.pop();
        }
        let line = String::from_utf8_lossy(&self.line_buf).into_owned();
        self.line_buf.clear();

        if let Some(rest) = line.strip_prefix("=yend") {
            self.verify_trailer(parse_fields(rest.trim_start()))?;
            self.state = State::Done;
        } else {
            // Unknown =y control line; skip it and keep decoding
            self.state = State::Body;
            self.at_line_start = true;
        }
        Ok(())
    }

    fn verify_trailer(&mut self, fields: Fields) -> Result<()> {
        let header = self.header.clone().unwrap_or_default();
        let filename = header.name.clone();
        let part = header.part_number();

        // The decoded part size must match the =ypart range (or the file
        // size for partless posts) exactly.
        let expected_size = fields.get("size").unwrap_or(header.part_size());
        if self.decoded_len != expected_size || self.decoded_len != header.part_size() {
            return Err(Error::InvalidYenc(format!(
                "decoded {} bytes of {filename} part {part}, expected {}",
                self.decoded_len,
                header.part_size()
            )));
        }

        // pcrc32 preferred over crc32 when parts are present
        let advertised = if header.part.is_some() {
            fields.get_hex("pcrc32").or_else(|| fields.get_hex("crc32"))
        } else {
            fields.get_hex("crc32").or_else(|| fields.get_hex("pcrc32"))
        };

        if let Some(advertised) = advertised {
            let computed = self.crc.clone().finalize();
            if computed != advertised {
                return Err(Error::CrcMismatch {
                    filename,
                    part,
                    advertised,
                    computed,
                });
            }
        }

        Ok(())
    }
}

/// Decode a complete in-memory yEnc part
///
/// Convenience over the incremental decoder for callers that already hold
/// the whole article body.
pub fn decode(data: &[u8]) -> Result<YencDecoded> {
    let mut decoder = YencDecoder::new();
    let decoded = decoder.feed(data)?;
    let header = decoder.header().cloned().unwrap_or_default();
    let summary = decoder.finish()?;
    Ok(YencDecoded {
        header,
        data: decoded,
        crc32: summary.crc32,
    })
}

/// Key=value fields of a yEnc header/trailer line
struct Fields {
    pairs: Vec<(String, String)>,
    /// `name=` captures the rest of the line including spaces
    name: Option<String>,
}

impl Fields {
    fn get(&self, key: &str) -> Option<u64> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v.parse().ok())
    }

    fn get_hex(&self, key: &str) -> Option<u32> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| u32::from_str_radix(v.trim(), 16).ok())
    }
}

fn parse_fields(rest: &str) -> Fields {
    let mut pairs = Vec::new();
    let mut name = None;

    // name= is always last and may contain spaces and '=' characters
    let (head, tail) = match rest.find("name=") {
        Some(i) => (&rest[..i], Some(rest[i + 5..].to_string())),
        None => (rest, None),
    };
    if let Some(n) = tail {
        name = Some(n.trim_end().to_string());
    }

    for token in head.split_whitespace() {
        if let Some((k, v)) = token.split_once('=') {
            pairs.push((k.to_string(), v.to_string()));
        }
    }

    Fields { pairs, name }
}
