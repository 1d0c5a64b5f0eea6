//! Shared fixtures for integration tests: a scripted NNTP server and
//! builders for yEnc articles, NZB documents, RAR volumes, and Par2 sets.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use md5::{Digest, Md5};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use nzb_mount::config::{ProviderConfig, ProviderType};
use nzb_mount::nntp::body::dot_escape;

/// A minimal NNTP server speaking just enough protocol for the client
pub struct MockNntpServer {
    addr: SocketAddr,
    articles: Arc<std::sync::Mutex<HashMap<String, Vec<u8>>>>,
    accepted: Arc<AtomicUsize>,
    body_delay_ms: Arc<AtomicU64>,
}

impl MockNntpServer {
    /// Start on an ephemeral port
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let articles: Arc<std::sync::Mutex<HashMap<String, Vec<u8>>>> = Arc::default();
        let accepted = Arc::new(AtomicUsize::new(0));
        let body_delay_ms = Arc::new(AtomicU64::new(0));

        {
            let articles = articles.clone();
            let accepted = accepted.clone();
            let body_delay_ms = body_delay_ms.clone();
            tokio::spawn(async move {
                while let Ok((socket, _)) = listener.accept().await {
                    accepted.fetch_add(1, Ordering::SeqCst);
                    let articles = articles.clone();
                    let body_delay_ms = body_delay_ms.clone();
                    tokio::spawn(async move {
                        let _ = serve(socket, articles, body_delay_ms).await;
                    });
                }
            });
        }

        Self {
            addr,
            articles,
            accepted,
            body_delay_ms,
        }
    }

    /// Provider config pointing at this server
    pub fn provider(&self) -> ProviderConfig {
        ProviderConfig {
            host: "127.0.0.1".into(),
            port: self.addr.port(),
            tls: false,
            username: Some("user".into()),
            password: Some("pass".into()),
            max_connections: 10,
            provider_type: ProviderType::PrimaryPooled,
            priority: 0,
        }
    }

    /// Register an article body (raw wire form, already yEnc encoded)
    pub fn add_article(&self, message_id: &str, body: &[u8]) {
        self.articles
            .lock()
            .expect("articles lock")
            .insert(message_id.to_string(), body.to_vec());
    }

    /// Connections accepted so far
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Delay BODY payloads to open cancellation windows
    pub fn set_body_delay(&self, delay: Duration) {
        self.body_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

async fn serve(
    socket: tokio::net::TcpStream,
    articles: Arc<std::sync::Mutex<HashMap<String, Vec<u8>>>>,
    body_delay_ms: Arc<AtomicU64>,
) -> std::io::Result<()> {
    let (r, mut w) = socket.into_split();
    let mut reader = BufReader::new(r);

    w.write_all(b"200 mock server ready\r\n").await?;

    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let line = line.trim_end();
        let upper = line.to_ascii_uppercase();

        if upper.starts_with("AUTHINFO USER") {
            w.write_all(b"381 password required\r\n").await?;
        } else if upper.starts_with("AUTHINFO PASS") {
            w.write_all(b"281 authenticated\r\n").await?;
        } else if upper.starts_with("DATE") {
            w.write_all(b"111 20260801000000\r\n").await?;
        } else if upper.starts_with("GROUP ") {
            w.write_all(b"211 1 1 1 group\r\n").await?;
        } else if upper.starts_with("QUIT") {
            w.write_all(b"205 bye\r\n").await?;
            return Ok(());
        } else if let Some(id) = line.split_whitespace().nth(1) {
            let id = id.trim_start_matches('<').trim_end_matches('>');
            let body = articles.lock().expect("articles lock").get(id).cloned();
            match (upper.split_whitespace().next(), body) {
                (Some("STAT"), Some(_)) => {
                    w.write_all(format!("223 0 <{id}>\r\n").as_bytes()).await?;
                }
                (Some("BODY"), Some(body)) => {
                    w.write_all(format!("222 0 <{id}>\r\n").as_bytes()).await?;
                    let delay = body_delay_ms.load(Ordering::SeqCst);
                    if delay > 0 {
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                    w.write_all(&dot_escape(&body)).await?;
                }
                (Some("HEAD"), Some(body)) => {
                    w.write_all(format!("221 0 <{id}>\r\n").as_bytes()).await?;
                    w.write_all(
                        format!("Subject: test article\r\nBytes: {}\r\n.\r\n", body.len())
                            .as_bytes(),
                    )
                    .await?;
                }
                _ => {
                    w.write_all(b"430 no such article\r\n").await?;
                }
            }
        } else {
            w.write_all(b"500 what\r\n").await?;
        }
    }
}

/// yEnc-encode a part for test articles
///
/// `part` is `(part, total, begin, end, file_size)`; `None` emits a
/// partless single-part post.
pub fn yenc_encode(
    data: &[u8],
    name: &str,
    line_len: usize,
    part: Option<(u32, u32, u64, u64, u64)>,
) -> Vec<u8> {
    let mut out = Vec::new();
    let crc = {
        let mut h = crc32fast::Hasher::new();
        h.update(data);
        h.finalize()
    };

    match part {
        Some((p, t, begin, end, file_size)) => {
            out.extend_from_slice(
                format!("=ybegin part={p} total={t} line={line_len} size={file_size} name={name}\r\n")
                    .as_bytes(),
            );
            out.extend_from_slice(format!("=ypart begin={begin} end={end}\r\n").as_bytes());
        }
        None => {
            out.extend_from_slice(
                format!("=ybegin line={line_len} size={} name={name}\r\n", data.len()).as_bytes(),
            );
        }
    }

    let mut col = 0;
    for &b in data {
        let enc = b.wrapping_add(42);
        let must_escape = matches!(enc, 0x00 | 0x0A | 0x0D | b'=') || (col == 0 && enc == b'.');
        if must_escape {
            out.push(b'=');
            out.push(enc.wrapping_add(64));
            col += 2;
        } else {
            out.push(enc);
            col += 1;
        }
        if col >= line_len {
            out.extend_from_slice(b"\r\n");
            col = 0;
        }
    }
    if col > 0 {
        out.extend_from_slice(b"\r\n");
    }

    match part {
        Some((p, _, begin, end, _)) => {
            out.extend_from_slice(
                format!("=yend size={} part={p} pcrc32={crc:08x}\r\n", end - begin + 1).as_bytes(),
            );
        }
        None => {
            out.extend_from_slice(format!("=yend size={} crc32={crc:08x}\r\n", data.len()).as_bytes());
        }
    }
    out
}

/// Register a file's parts with the server and return its NZB `<file>` XML
///
/// `header_name` is the filename carried in the yEnc headers (may differ
/// from `subject_name` for obfuscation scenarios).
pub fn post_file(
    server: &MockNntpServer,
    subject_name: &str,
    header_name: &str,
    data: &[u8],
    part_size: usize,
) -> String {
    let part_size = part_size.max(1);
    let chunks: Vec<&[u8]> = data.chunks(part_size).collect();
    let total = chunks.len();
    let mut segments = String::new();
    for (i, chunk) in chunks.iter().enumerate() {
        let id = format!("{}-p{}@test", subject_name.replace([' ', '/'], "_"), i + 1);
        let begin = (i * part_size + 1) as u64;
        let end = (i * part_size + chunk.len()) as u64;
        server.add_article(
            &id,
            &yenc_encode(
                chunk,
                header_name,
                128,
                Some((i as u32 + 1, total as u32, begin, end, data.len() as u64)),
            ),
        );
        segments.push_str(&format!(
            "<segment bytes=\"{}\" number=\"{}\">{id}</segment>",
            chunk.len() + 100,
            i + 1
        ));
    }
    format!(
        "<file poster=\"poster@example.com\" date=\"1700000000\" \
         subject=\"release [1/1] - &quot;{subject_name}&quot; yEnc (1/{total})\">\
         <groups><group>alt.binaries.test</group></groups>\
         <segments>{segments}</segments></file>"
    )
}

/// Wrap `<file>` fragments into an NZB document
pub fn nzb_doc(files: &[String]) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\
         <nzb xmlns=\"http://www.newzbin.com/DTD/2003/nzb\">{}</nzb>",
        files.join("")
    )
}

// -- RAR4 fixtures ----------------------------------------------------------

/// Build a RAR4 file header + stored data block
pub fn rar4_stored_block(name: &str, data: &[u8]) -> Vec<u8> {
    let name_bytes = name.as_bytes();
    let head_size = 32 + name_bytes.len();
    let mut block = Vec::new();
    block.extend_from_slice(&0u16.to_le_bytes()); // head_crc (unchecked)
    block.push(0x74); // FILE_HEAD
    block.extend_from_slice(&0u16.to_le_bytes()); // flags
    block.extend_from_slice(&(head_size as u16).to_le_bytes());
    block.extend_from_slice(&(data.len() as u32).to_le_bytes()); // pack_size
    block.extend_from_slice(&(data.len() as u32).to_le_bytes()); // unp_size
    block.push(0); // host_os
    block.extend_from_slice(&0u32.to_le_bytes()); // file_crc
    block.extend_from_slice(&0u32.to_le_bytes()); // ftime
    block.push(29); // unp_ver
    block.push(0x30); // method: store
    block.extend_from_slice(&(name_bytes.len() as u16).to_le_bytes());
    block.extend_from_slice(&0u32.to_le_bytes()); // attr
    block.extend_from_slice(name_bytes);
    block.extend_from_slice(data);
    block
}

/// Build a complete single-volume RAR4 archive around stored blocks
pub fn rar4_volume(blocks: &[Vec<u8>]) -> Vec<u8> {
    let mut volume = b"Rar!\x1a\x07\x00".to_vec();
    volume.extend_from_slice(&0u16.to_le_bytes());
    volume.push(0x73); // MAIN_HEAD
    volume.extend_from_slice(&0u16.to_le_bytes());
    volume.extend_from_slice(&13u16.to_le_bytes());
    volume.extend_from_slice(&[0u8; 6]);
    for block in blocks {
        volume.extend_from_slice(block);
    }
    volume.extend_from_slice(&0u16.to_le_bytes());
    volume.push(0x7B); // ENDARC
    volume.extend_from_slice(&0u16.to_le_bytes());
    volume.extend_from_slice(&7u16.to_le_bytes());
    volume
}

// -- Par2 fixtures ----------------------------------------------------------

/// MD5 of the first 16 KiB
pub fn hash16k(data: &[u8]) -> [u8; 16] {
    let take = data.len().min(16 * 1024);
    Md5::digest(&data[..take]).into()
}

/// Build a Par2 FileDesc packet
pub fn par2_file_desc(filename: &str, length: u64, hash16k: [u8; 16]) -> Vec<u8> {
    let mut body = Vec::new();
    let mut id_input = Vec::new();
    id_input.extend_from_slice(&hash16k);
    id_input.extend_from_slice(&length.to_le_bytes());
    id_input.extend_from_slice(filename.as_bytes());
    let file_id: [u8; 16] = Md5::digest(&id_input).into();

    body.extend_from_slice(&file_id);
    body.extend_from_slice(&[0u8; 16]); // whole-file MD5
    body.extend_from_slice(&hash16k);
    body.extend_from_slice(&length.to_le_bytes());
    let mut name = filename.as_bytes().to_vec();
    while name.len() % 4 != 0 {
        name.push(0);
    }
    body.extend_from_slice(&name);

    let set_id = [0x11u8; 16];
    let packet_type = b"PAR 2.0\0FileDesc";
    let length = 64 + body.len();

    let mut hashed = Vec::new();
    hashed.extend_from_slice(&set_id);
    hashed.extend_from_slice(packet_type);
    hashed.extend_from_slice(&body);
    let md5: [u8; 16] = Md5::digest(&hashed).into();

    let mut out = Vec::new();
    out.extend_from_slice(b"PAR2\0PKT");
    out.extend_from_slice(&(length as u64).to_le_bytes());
    out.extend_from_slice(&md5);
    out.extend_from_slice(&set_id);
    out.extend_from_slice(packet_type);
    out.extend_from_slice(&body);
    out
}
