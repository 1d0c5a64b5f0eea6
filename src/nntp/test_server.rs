//! Scripted in-process NNTP server for unit tests

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use crate::config::{ProviderConfig, ProviderType};

use super::body::dot_escape;

/// A minimal NNTP server speaking just enough protocol for the client
pub(crate) struct TestServer {
    addr: SocketAddr,
    articles: Arc<std::sync::Mutex<HashMap<String, Vec<u8>>>>,
    accepted: Arc<AtomicUsize>,
    body_delay_ms: Arc<AtomicU64>,
}

impl TestServer {
    /// Start the server on an ephemeral port
    pub(crate) async fn start() -> Self {
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
    pub(crate) fn provider(&self) -> ProviderConfig {
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

    /// Register an article body (decoded form; dot-escaping is applied on send)
    pub(crate) fn add_article(&self, message_id: &str, body: &[u8]) {
        self.articles
            .lock()
            .expect("articles lock")
            .insert(message_id.to_string(), body.to_vec());
    }

    /// Number of connections accepted so far
    pub(crate) fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Delay BODY payloads (cancellation-window tests)
    pub(crate) fn set_body_delay(&self, delay: Duration) {
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

    w.write_all(b"200 test server ready\r\n").await?;

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
                (Some("ARTICLE"), Some(body)) => {
                    w.write_all(format!("220 0 <{id}>\r\n").as_bytes()).await?;
                    w.write_all(b"Subject: test article\r\n\r\n").await?;
                    w.write_all(&dot_escape(&body)).await?;
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
