//! Streamed body transfer: terminator scanning and dot-unescaping
//!
//! A multi-line NNTP body ends with the byte sequence `\r\n.\r\n`, and any
//! body line beginning with `.` is dot-escaped on the wire (`..` for `.`).
//! [`DotDecoder`] undoes both incrementally over raw socket chunks; the
//! terminator and escape sequences may straddle chunk boundaries.
//!
//! [`BodyStream`] is the consumer half of a transfer: a bounded channel of
//! decoded chunks fed by the connection's transfer task. The bound gives
//! natural back-pressure: when the consumer lags, the transfer task stops
//! reading the socket.

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;

use crate::error::{Error, Result};

/// Chunk size the transfer task reads from the socket
pub(crate) const READ_CHUNK: usize = 64 * 1024;

/// Incremental decoder for dot-stuffed, terminator-delimited bodies
///
/// Feed raw wire chunks with [`DotDecoder::feed`]; decoded body bytes come
/// back per chunk and [`DotDecoder::is_done`] flips once the terminator has
/// been consumed. Bytes after the terminator are not consumed.
#[derive(Debug)]
pub struct DotDecoder {
    state: ScanState,
    done: bool,
}

/// Scanner position relative to a line boundary
///
/// The start of the body counts as a line start, so a body consisting of
/// only the terminator (`.\r\n`) decodes to zero bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ScanState {
    /// At the start of a line
    LineStart,
    /// Mid-line
    Normal,
    /// Mid-line, previous byte was CR
    SeenCr,
    /// Line started with a dot; next byte decides stuffing vs. terminator
    LineStartDot,
    /// Line start was `.\r`; an LF completes the terminator
    LineStartDotCr,
}

impl Default for DotDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl DotDecoder {
    /// Create a decoder positioned at the start of a body
    pub fn new() -> Self {
        Self {
            state: ScanState::LineStart,
            done: false,
        }
    }

    /// Whether the terminator has been consumed
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Decode one raw chunk, returning the decoded bytes and the number of
    /// input bytes consumed
    ///
    /// Once the terminator is reached, remaining input is left unconsumed
    /// (it belongs to the next protocol exchange).
    pub fn feed(&mut self, chunk: &[u8]) -> (Bytes, usize) {
        let mut out = BytesMut::with_capacity(chunk.len());
        let mut i = 0;

        while i < chunk.len() && !self.done {
            let b = chunk[i];
            match self.state {
                ScanState::LineStart => match b {
                    b'.' => self.state = ScanState::LineStartDot,
                    b'\r' => {
                        out.extend_from_slice(b"\r");
                        self.state = ScanState::SeenCr;
                    }
                    b'\n' => {
                        // Bare LF line break; tolerated
                        out.extend_from_slice(b"\n");
                    }
                    _ => {
                        out.extend_from_slice(&[b]);
                        self.state = ScanState::Normal;
                    }
                },
                ScanState::Normal => match b {
                    b'\r' => {
                        out.extend_from_slice(b"\r");
                        self.state = ScanState::SeenCr;
                    }
                    b'\n' => {
                        out.extend_from_slice(b"\n");
                        self.state = ScanState::LineStart;
                    }
                    _ => out.extend_from_slice(&[b]),
                },
                ScanState::SeenCr => match b {
                    b'\n' => {
                        out.extend_from_slice(b"\n");
                        self.state = ScanState::LineStart;
                    }
                    b'\r' => out.extend_from_slice(b"\r"),
                    _ => {
                        out.extend_from_slice(&[b]);
                        self.state = ScanState::Normal;
                    }
                },
                ScanState::LineStartDot => match b {
                    b'.' => {
                        // Dot-stuffed: `..` on the wire is a literal `.`
                        out.extend_from_slice(b".");
                        self.state = ScanState::Normal;
                    }
                    b'\r' => self.state = ScanState::LineStartDotCr,
                    _ => {
                        // Bare dot followed by data; emit both
                        out.extend_from_slice(&[b'.', b]);
                        self.state = ScanState::Normal;
                    }
                },
                ScanState::LineStartDotCr => match b {
                    b'\n' => {
                        self.done = true;
                        self.state = ScanState::LineStart;
                    }
                    _ => {
                        // `.\r` not followed by LF: literal bytes
                        out.extend_from_slice(&[b'.', b'\r', b]);
                        self.state = if b == b'\r' {
                            ScanState::SeenCr
                        } else {
                            ScanState::Normal
                        };
                    }
                },
            }
            i += 1;
        }

        (out.freeze(), i)
    }
}

/// Outcome of a body transfer, reported when the connection becomes ready
/// for its next command
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Terminator seen; the full body passed through the stream
    Retrieved,
    /// Transfer aborted (consumer dropped mid-body or I/O failed)
    NotRetrieved,
}

/// Consumer half of a streamed body transfer
///
/// Chunks arrive already dot-unescaped with the terminator removed. The
/// channel is bounded, so slow consumption propagates back-pressure to the
/// socket.
#[derive(Debug)]
pub struct BodyStream {
    rx: mpsc::Receiver<Result<Bytes>>,
}

impl BodyStream {
    /// Create the stream and its sender with a bound of `capacity` chunks
    pub(crate) fn channel(capacity: usize) -> (mpsc::Sender<Result<Bytes>>, BodyStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, BodyStream { rx })
    }

    /// Next decoded chunk; `None` when the body is complete
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        match self.rx.recv().await {
            Some(Ok(chunk)) => Ok(Some(chunk)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    /// Drain the whole body into memory
    ///
    /// Used for small bodies (first segments, Par2 files); large media
    /// bodies are consumed chunk-wise.
    pub async fn read_to_end(&mut self) -> Result<Bytes> {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }

    /// Drop remaining chunks without copying them
    ///
    /// Draining (rather than dropping the stream) lets the transfer task
    /// reach the terminator so the connection survives for re-lease.
    pub async fn discard(&mut self) -> Result<()> {
        while self.next_chunk().await?.is_some() {}
        Ok(())
    }
}

/// Apply dot-escaping to a body (test and STRM fixture helper)
///
/// The inverse of [`DotDecoder`]: stuffs leading dots and appends the
/// terminator.
pub fn dot_escape(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + 8);
    let mut at_line_start = true;
    for &b in body {
        if at_line_start && b == b'.' {
            out.push(b'.');
        }
        out.push(b);
        at_line_start = b == b'\n';
    }
    // Body content must end with CRLF before the terminator dot
    if !out.ends_with(b"\r\n") {
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b".\r\n");
    out
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(wire: &[u8]) -> (Vec<u8>, bool, usize) {
        let mut decoder = DotDecoder::new();
        let (out, consumed) = decoder.feed(wire);
        (out.to_vec(), decoder.is_done(), consumed)
    }

    #[test]
    fn plain_body_with_terminator() {
        let (out, done, consumed) = decode_all(b"hello\r\nworld\r\n.\r\n");
        assert_eq!(out, b"hello\r\nworld\r\n");
        assert!(done);
        assert_eq!(consumed, 17);
    }

    #[test]
    fn dot_stuffed_line_is_unescaped() {
        let (out, done, _) = decode_all(b"..leading dot\r\n.\r\n");
        assert_eq!(out, b".leading dot\r\n");
        assert!(done);
    }

    #[test]
    fn empty_body_is_just_the_terminator() {
        let (out, done, consumed) = decode_all(b".\r\n");
        assert!(out.is_empty());
        assert!(done);
        assert_eq!(consumed, 3);
    }

    #[test]
    fn bytes_after_terminator_are_not_consumed() {
        let wire = b"data\r\n.\r\n223 0 <next@x>\r\n";
        let (out, done, consumed) = decode_all(wire);
        assert_eq!(out, b"data\r\n");
        assert!(done);
        assert_eq!(&wire[consumed..], b"223 0 <next@x>\r\n");
    }

    #[test]
    fn terminator_straddling_chunk_boundaries() {
        let wire = b"payload\r\n.\r\n";
        // Split at every possible position and re-assemble
        for split in 1..wire.len() {
            let mut decoder = DotDecoder::new();
            let mut out = Vec::new();
            let (a, _) = decoder.feed(&wire[..split]);
            out.extend_from_slice(&a);
            let (b, _) = decoder.feed(&wire[split..]);
            out.extend_from_slice(&b);
            assert_eq!(out, b"payload\r\n", "split at {split}");
            assert!(decoder.is_done(), "split at {split}");
        }
    }

    #[test]
    fn stuffing_straddling_chunk_boundaries() {
        let wire = b"a\r\n..b\r\n.\r\n";
        for split in 1..wire.len() {
            let mut decoder = DotDecoder::new();
            let mut out = Vec::new();
            let (a, _) = decoder.feed(&wire[..split]);
            out.extend_from_slice(&a);
            let (b, _) = decoder.feed(&wire[split..]);
            out.extend_from_slice(&b);
            assert_eq!(out, b"a\r\n.b\r\n", "split at {split}");
            assert!(decoder.is_done(), "split at {split}");
        }
    }

    #[test]
    fn lone_dot_mid_line_passes_through() {
        let (out, done, _) = decode_all(b"a.b\r\n.\r\n");
        assert_eq!(out, b"a.b\r\n");
        assert!(done);
    }

    #[test]
    fn dot_cr_without_lf_is_literal() {
        // `.\rX` at line start is data, not a terminator
        let (out, done, _) = decode_all(b".\rX\r\n.\r\n");
        assert_eq!(out, b".\rX\r\n");
        assert!(done);
    }

    #[test]
    fn cr_without_lf_stays_mid_line() {
        // A CR not followed by LF must not create a line start; the
        // following `.` is therefore literal data
        let (out, done, _) = decode_all(b"a\r.b\r\n.\r\n");
        assert_eq!(out, b"a\r.b\r\n");
        assert!(done);
    }

    #[test]
    fn escape_is_inverse_of_unescape() {
        // Bodies not containing a bare terminator round-trip through
        // escape → decode
        let bodies: Vec<&[u8]> = vec![
            b"simple\r\n",
            b".dot first\r\n",
            b"..double\r\n",
            b"multi\r\n.line\r\n..here\r\n",
            b"",
            b"no trailing newline",
            b"\r\n",
        ];
        for body in bodies {
            let wire = dot_escape(body);
            let mut decoder = DotDecoder::new();
            let (out, consumed) = decoder.feed(&wire);
            assert!(decoder.is_done(), "body {body:?}");
            assert_eq!(consumed, wire.len());
            let mut expected = body.to_vec();
            if !expected.ends_with(b"\r\n") {
                expected.extend_from_slice(b"\r\n");
            }
            assert_eq!(out.to_vec(), expected, "body {body:?}");
        }
    }

    #[test]
    fn fuzz_like_round_trip_with_random_splits() {
        // Deterministic pseudo-random body covering dot/CR/LF densities
        let mut body = Vec::new();
        let mut seed = 0x12345678u32;
        for _ in 0..4096 {
            seed = seed.wrapping_mul(1664525).wrapping_add(1013904223);
            let b = (seed >> 16) as u8;
            body.push(match b % 7 {
                0 => b'.',
                1 => b'\r',
                2 => b'\n',
                _ => b,
            });
        }
        // Terminate lines properly so the encoded form is unambiguous
        let body: Vec<u8> = body
            .split(|&b| b == b'\n')
            .flat_map(|line| {
                let mut l: Vec<u8> = line.iter().copied().filter(|&b| b != b'\r').collect();
                l.extend_from_slice(b"\r\n");
                l
            })
            .collect();

        let wire = dot_escape(&body);
        let mut decoder = DotDecoder::new();
        let mut out = Vec::new();
        for chunk in wire.chunks(97) {
            let (decoded, _) = decoder.feed(chunk);
            out.extend_from_slice(&decoded);
        }
        assert!(decoder.is_done());
        assert_eq!(out, body);
    }

    #[tokio::test]
    async fn body_stream_yields_chunks_then_none() {
        let (tx, mut stream) = BodyStream::channel(4);
        tx.send(Ok(Bytes::from_static(b"one"))).await.unwrap();
        tx.send(Ok(Bytes::from_static(b"two"))).await.unwrap();
        drop(tx);

        assert_eq!(stream.next_chunk().await.unwrap().unwrap().as_ref(), b"one");
        assert_eq!(stream.next_chunk().await.unwrap().unwrap().as_ref(), b"two");
        assert!(stream.next_chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn body_stream_surfaces_transfer_errors() {
        let (tx, mut stream) = BodyStream::channel(2);
        tx.send(Err(Error::Timeout { seconds: 30 })).await.unwrap();
        drop(tx);
        assert!(matches!(
            stream.next_chunk().await,
            Err(Error::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn read_to_end_concatenates() {
        let (tx, mut stream) = BodyStream::channel(4);
        tokio::spawn(async move {
            for part in [&b"abc"[..], b"def", b"ghi"] {
                tx.send(Ok(Bytes::copy_from_slice(part))).await.unwrap();
            }
        });
        assert_eq!(stream.read_to_end().await.unwrap().as_ref(), b"abcdefghi");
    }
}
