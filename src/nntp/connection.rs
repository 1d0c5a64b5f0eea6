//! Stateful NNTP connection
//!
//! One connection owns one TCP/TLS socket and serializes all protocol
//! exchanges on it. The lifecycle is
//! `Disconnected → Connecting → Greeted → Authenticated → Idle` and then
//! `Idle ⇄ InCommand / InBodyTransfer` until the connection breaks or is
//! closed. `Broken` is sticky: any I/O error, protocol violation, or
//! timeout poisons the connection and the pool replaces it.
//!
//! Body transfers are streamed: `body()` hands the transport to a spawned
//! transfer task that scans for the `\r\n.\r\n` terminator, dot-unescapes,
//! and forwards decoded chunks into a bounded channel. The transport
//! returns to the connection when the terminator has been seen; the next
//! command implicitly waits for that hand-back, which is the per-connection
//! serializing lock the pool relies on.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

use crate::config::ProviderConfig;
use crate::error::{Error, Result};
use crate::types::MessageId;

use super::body::{BodyStream, DotDecoder, READ_CHUNK, TransferOutcome};
use super::response::{GroupInfo, NntpResponse, code};

/// Read buffer in front of the socket (shared by status lines and bodies)
const READER_BUF: usize = 256 * 1024;

/// Connection lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket
    Disconnected,
    /// TCP/TLS handshake in progress
    Connecting,
    /// Greeting received, not yet authenticated
    Greeted,
    /// AUTHINFO accepted
    Authenticated,
    /// Ready for the next command
    Idle,
    /// A command/response exchange is in flight
    InCommand,
    /// A spawned transfer task owns the transport
    InBodyTransfer,
    /// Poisoned; must be discarded
    Broken,
}

/// The socket halves, boxed so TCP and TLS share one type
struct Transport {
    reader: BufReader<Box<dyn AsyncRead + Unpin + Send>>,
    writer: Box<dyn AsyncWrite + Unpin + Send>,
}

/// What a finished transfer task hands back
struct TransferReturn {
    transport: Option<Transport>,
    outcome: TransferOutcome,
}

/// One NNTP connection to one provider
pub struct NntpConnection {
    transport: Option<Transport>,
    pending: Option<oneshot::Receiver<TransferReturn>>,
    state: ConnectionState,
    host: String,
    operation_timeout: Duration,
    /// Bounded-channel capacity for body transfers, in chunks
    buffer_chunks: usize,
    last_used: Instant,
}

impl std::fmt::Debug for NntpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NntpConnection")
            .field("host", &self.host)
            .field("state", &self.state)
            .finish()
    }
}

impl NntpConnection {
    /// Connect, read the greeting, and authenticate if credentials are set
    pub async fn connect(
        provider: &ProviderConfig,
        operation_timeout: Duration,
        stream_buffer_size: usize,
    ) -> Result<Self> {
        let addr = format!("{}:{}", provider.host, provider.port);

        let tcp = timeout(operation_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::CouldNotConnect {
                host: provider.host.clone(),
                port: provider.port,
                reason: "connect timed out".into(),
            })?
            .map_err(|e| Error::CouldNotConnect {
                host: provider.host.clone(),
                port: provider.port,
                reason: e.to_string(),
            })?;
        tcp.set_nodelay(true).ok();

        let (reader, writer): (
            Box<dyn AsyncRead + Unpin + Send>,
            Box<dyn AsyncWrite + Unpin + Send>,
        ) = if provider.tls {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            let tls_config = rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            let connector = TlsConnector::from(Arc::new(tls_config));
            let server_name = rustls::pki_types::ServerName::try_from(provider.host.clone())
                .map_err(|e| Error::CouldNotConnect {
                    host: provider.host.clone(),
                    port: provider.port,
                    reason: format!("invalid server name: {e}"),
                })?;

            let tls = timeout(operation_timeout, connector.connect(server_name, tcp))
                .await
                .map_err(|_| Error::CouldNotConnect {
                    host: provider.host.clone(),
                    port: provider.port,
                    reason: "TLS handshake timed out".into(),
                })?
                .map_err(|e| Error::CouldNotConnect {
                    host: provider.host.clone(),
                    port: provider.port,
                    reason: format!("TLS handshake failed: {e}"),
                })?;
            let (r, w) = tokio::io::split(tls);
            (Box::new(r), Box::new(w))
        } else {
            let (r, w) = tokio::io::split(tcp);
            (Box::new(r), Box::new(w))
        };

        let mut conn = Self::from_parts(
            reader,
            writer,
            provider.host.clone(),
            operation_timeout,
            stream_buffer_size,
        );
        conn.state = ConnectionState::Connecting;

        conn.read_greeting().await?;
        if let Some(username) = provider.username.as_deref() {
            conn.authenticate(username, provider.password.as_deref().unwrap_or(""))
                .await?;
        }
        conn.state = ConnectionState::Idle;

        tracing::debug!(host = %conn.host, "NNTP connection established");
        Ok(conn)
    }

    /// Build a connection around existing I/O halves (tests, pre-opened sockets)
    pub(crate) fn from_parts(
        reader: Box<dyn AsyncRead + Unpin + Send>,
        writer: Box<dyn AsyncWrite + Unpin + Send>,
        host: String,
        operation_timeout: Duration,
        stream_buffer_size: usize,
    ) -> Self {
        Self {
            transport: Some(Transport {
                reader: BufReader::with_capacity(READER_BUF, reader),
                writer,
            }),
            pending: None,
            state: ConnectionState::Disconnected,
            host,
            operation_timeout,
            buffer_chunks: (stream_buffer_size / READ_CHUNK).max(2),
            last_used: Instant::now(),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the connection may be reused
    pub fn is_healthy(&self) -> bool {
        self.state != ConnectionState::Broken && self.state != ConnectionState::Disconnected
    }

    /// Time since the last completed operation
    pub fn idle_for(&self) -> Duration {
        self.last_used.elapsed()
    }

    /// Read and validate the server greeting (200/201)
    pub(crate) async fn read_greeting(&mut self) -> Result<()> {
        let response = self.read_response().await?;
        match response.code {
            code::GREETING_POSTING_OK | code::GREETING_NO_POSTING => {
                self.state = ConnectionState::Greeted;
                Ok(())
            }
            _ => {
                self.state = ConnectionState::Broken;
                Err(Error::Protocol(format!(
                    "unexpected greeting: {response}"
                )))
            }
        }
    }

    /// AUTHINFO USER/PASS exchange
    ///
    /// A 381 after USER asks for the password; 281 accepts. Anything else
    /// is a permanent authentication failure.
    pub(crate) async fn authenticate(&mut self, username: &str, password: &str) -> Result<()> {
        let response = self.exchange(&format!("AUTHINFO USER {username}")).await?;
        let response = match response.code {
            code::PASSWORD_REQUIRED => {
                self.exchange(&format!("AUTHINFO PASS {password}")).await?
            }
            _ => response,
        };

        if response.code != code::AUTH_ACCEPTED {
            self.state = ConnectionState::Broken;
            // Only the status code; never echo what the server saw
            return Err(Error::CouldNotLogin {
                host: self.host.clone(),
                reason: response.code.to_string(),
            });
        }
        self.state = ConnectionState::Authenticated;
        Ok(())
    }

    /// STAT: does the article exist on this provider
    pub async fn stat(&mut self, message_id: &MessageId) -> Result<bool> {
        let response = self.exchange(&format!("STAT {}", message_id.angled())).await?;
        match response.code {
            code::STAT_OK => Ok(true),
            _ if response.is_not_found() => Ok(false),
            _ => {
                self.state = ConnectionState::Broken;
                Err(Error::unexpected_response("STAT", &response.line()))
            }
        }
    }

    /// HEAD: fetch and parse article headers
    pub async fn head(&mut self, message_id: &MessageId) -> Result<Vec<(String, String)>> {
        let response = self.exchange(&format!("HEAD {}", message_id.angled())).await?;
        if response.is_not_found() {
            return Err(Error::ArticleNotFound {
                message_id: message_id.as_str().to_string(),
            });
        }
        if response.code != code::HEAD_FOLLOWS {
            self.state = ConnectionState::Broken;
            return Err(Error::unexpected_response("HEAD", &response.line()));
        }
        self.read_header_block().await
    }

    /// BODY: stream the article body through a transfer task
    ///
    /// The returned stream yields dot-unescaped chunks; the connection is
    /// ready for its next command once the terminator has been seen (the
    /// next call waits for that internally).
    pub async fn body(&mut self, message_id: &MessageId) -> Result<BodyStream> {
        let response = self.exchange(&format!("BODY {}", message_id.angled())).await?;
        if response.is_not_found() {
            return Err(Error::ArticleNotFound {
                message_id: message_id.as_str().to_string(),
            });
        }
        if response.code != code::BODY_FOLLOWS {
            self.state = ConnectionState::Broken;
            return Err(Error::unexpected_response("BODY", &response.line()));
        }
        self.spawn_transfer()
    }

    /// ARTICLE: headers plus streamed body
    pub async fn article(
        &mut self,
        message_id: &MessageId,
    ) -> Result<(Vec<(String, String)>, BodyStream)> {
        let response = self
            .exchange(&format!("ARTICLE {}", message_id.angled()))
            .await?;
        if response.is_not_found() {
            return Err(Error::ArticleNotFound {
                message_id: message_id.as_str().to_string(),
            });
        }
        if response.code != code::ARTICLE_FOLLOWS {
            self.state = ConnectionState::Broken;
            return Err(Error::unexpected_response("ARTICLE", &response.line()));
        }
        // Headers end at the first empty line; the terminator applies to
        // the block as a whole, so the body transfer picks up after it.
        let (headers, terminated) = self.read_headers_until_blank().await?;
        if terminated {
            // Headers-only article: the terminator was already consumed
            self.state = ConnectionState::Idle;
            self.last_used = Instant::now();
            let (tx, stream) = BodyStream::channel(1);
            drop(tx);
            return Ok((headers, stream));
        }
        let stream = self.spawn_transfer()?;
        Ok((headers, stream))
    }

    /// DATE: server UTC clock
    pub async fn date(&mut self) -> Result<DateTime<Utc>> {
        let response = self.exchange("DATE").await?;
        if response.code != code::DATE {
            self.state = ConnectionState::Broken;
            return Err(Error::unexpected_response("DATE", &response.line()));
        }
        let stamp = response.text.trim();
        let naive = NaiveDateTime::parse_from_str(stamp, "%Y%m%d%H%M%S")
            .map_err(|e| Error::Protocol(format!("bad DATE response {stamp:?}: {e}")))?;
        Ok(naive.and_utc())
    }

    /// GROUP: select a group, returning (count, first, last)
    pub async fn group(&mut self, name: &str) -> Result<GroupInfo> {
        let response = self.exchange(&format!("GROUP {name}")).await?;
        if response.code != code::GROUP_SELECTED {
            return Err(Error::unexpected_response("GROUP", &response.line()));
        }
        GroupInfo::parse(&response.text)
    }

    /// QUIT: polite close; the connection is unusable afterwards
    pub async fn quit(&mut self) {
        if self.reclaim().await.is_ok() {
            let _ = self.exchange("QUIT").await;
        }
        self.transport = None;
        self.state = ConnectionState::Disconnected;
    }

    // -- internals ----------------------------------------------------------

    /// Send one command line and read the status line
    async fn exchange(&mut self, line: &str) -> Result<NntpResponse> {
        self.reclaim().await?;
        self.state = ConnectionState::InCommand;

        let result = self.exchange_inner(line).await;
        match &result {
            Ok(_) => {
                self.state = ConnectionState::Idle;
                self.last_used = Instant::now();
            }
            Err(_) => self.state = ConnectionState::Broken,
        }
        result
    }

    async fn exchange_inner(&mut self, line: &str) -> Result<NntpResponse> {
        let deadline = self.operation_timeout;
        let transport = self.transport.as_mut().ok_or(Error::Cancelled)?;

        let mut wire = line.as_bytes().to_vec();
        wire.extend_from_slice(b"\r\n");
        timed(deadline, transport.writer.write_all(&wire)).await??;
        timed(deadline, transport.writer.flush()).await??;

        drop(wire);
        self.read_response().await
    }

    /// Read one CRLF-terminated status line
    async fn read_response(&mut self) -> Result<NntpResponse> {
        let deadline = self.operation_timeout;
        let transport = self.transport.as_mut().ok_or(Error::Cancelled)?;

        let mut line = String::new();
        let n = timed(deadline, transport.reader.read_line(&mut line)).await??;
        if n == 0 {
            self.state = ConnectionState::Broken;
            return Err(Error::Protocol("connection closed by server".into()));
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        NntpResponse::parse(&line)
    }

    /// Read a dot-terminated header block (HEAD)
    async fn read_header_block(&mut self) -> Result<Vec<(String, String)>> {
        let deadline = self.operation_timeout;
        let transport = self.transport.as_mut().ok_or(Error::Cancelled)?;

        let mut headers: Vec<(String, String)> = Vec::new();
        loop {
            let mut line = String::new();
            let n = timed(deadline, transport.reader.read_line(&mut line)).await??;
            if n == 0 {
                self.state = ConnectionState::Broken;
                return Err(Error::Protocol("EOF inside HEAD response".into()));
            }
            while line.ends_with('\n') || line.ends_with('\r') {
                line.pop();
            }
            if line == "." {
                break;
            }
            push_header_line(&mut headers, &line);
        }
        self.last_used = Instant::now();
        Ok(headers)
    }

    /// Read header lines up to the blank separator (ARTICLE)
    ///
    /// Returns the headers and whether the block terminator was already
    /// consumed (headers-only article).
    async fn read_headers_until_blank(&mut self) -> Result<(Vec<(String, String)>, bool)> {
        let deadline = self.operation_timeout;
        let transport = self.transport.as_mut().ok_or(Error::Cancelled)?;

        let mut headers: Vec<(String, String)> = Vec::new();
        loop {
            let mut line = String::new();
            let n = timed(deadline, transport.reader.read_line(&mut line)).await??;
            if n == 0 {
                self.state = ConnectionState::Broken;
                return Err(Error::Protocol("EOF inside ARTICLE headers".into()));
            }
            while line.ends_with('\n') || line.ends_with('\r') {
                line.pop();
            }
            if line.is_empty() {
                return Ok((headers, false));
            }
            if line == "." {
                return Ok((headers, true));
            }
            push_header_line(&mut headers, &line);
        }
    }

    /// Move the transport into a spawned transfer task
    fn spawn_transfer(&mut self) -> Result<BodyStream> {
        let mut transport = self.transport.take().ok_or(Error::Cancelled)?;
        let (tx, stream) = BodyStream::channel(self.buffer_chunks);
        let (done_tx, done_rx) = oneshot::channel();
        let deadline = self.operation_timeout;
        let host = self.host.clone();

        self.pending = Some(done_rx);
        self.state = ConnectionState::InBodyTransfer;

        tokio::spawn(async move {
            let mut decoder = DotDecoder::new();
            let mut buf = vec![0u8; READ_CHUNK];
            let outcome = loop {
                let n = match timed(deadline, transport.reader.read(&mut buf)).await {
                    Err(e) => {
                        tracing::debug!(host = %host, error = %e, "body transfer timed out");
                        let _ = tx.send(Err(e)).await;
                        break TransferOutcome::NotRetrieved;
                    }
                    Ok(Err(e)) => {
                        tracing::debug!(host = %host, error = %e, "body transfer failed");
                        let _ = tx.send(Err(e.into())).await;
                        break TransferOutcome::NotRetrieved;
                    }
                    Ok(Ok(0)) => {
                        let _ = tx
                            .send(Err(Error::Protocol("connection closed mid-body".into())))
                            .await;
                        break TransferOutcome::NotRetrieved;
                    }
                    Ok(Ok(n)) => n,
                };

                let (decoded, _consumed) = decoder.feed(&buf[..n]);
                if !decoded.is_empty() && tx.send(Ok(decoded)).await.is_err() {
                    // Consumer dropped mid-body; the socket position is
                    // indeterminate, so the connection cannot be reused
                    tracing::debug!(host = %host, "body consumer dropped mid-transfer");
                    break TransferOutcome::NotRetrieved;
                }
                if decoder.is_done() {
                    break TransferOutcome::Retrieved;
                }
            };

            let transport = match outcome {
                TransferOutcome::Retrieved => Some(transport),
                TransferOutcome::NotRetrieved => None,
            };
            let _ = done_tx.send(TransferReturn { transport, outcome });
        });

        Ok(stream)
    }

    /// Wait for a pending transfer to hand the transport back
    ///
    /// This is the serializing step between a streamed body and the next
    /// command on the same connection.
    pub(crate) async fn reclaim(&mut self) -> Result<()> {
        if let Some(rx) = self.pending.take() {
            match rx.await {
                Ok(TransferReturn {
                    transport: Some(t),
                    outcome: TransferOutcome::Retrieved,
                }) => {
                    self.transport = Some(t);
                    self.state = ConnectionState::Idle;
                    self.last_used = Instant::now();
                }
                _ => {
                    self.state = ConnectionState::Broken;
                    return Err(Error::Protocol(
                        "connection lost during body transfer".into(),
                    ));
                }
            }
        }
        if self.state == ConnectionState::Broken {
            return Err(Error::Protocol("connection is broken".into()));
        }
        Ok(())
    }
}

/// Append a header line, folding continuations into the previous value
fn push_header_line(headers: &mut Vec<(String, String)>, line: &str) {
    if line.starts_with(' ') || line.starts_with('\t') {
        if let Some((_, value)) = headers.last_mut() {
            value.push(' ');
            value.push_str(line.trim());
        }
        return;
    }
    if let Some((key, value)) = line.split_once(':') {
        headers.push((key.trim().to_string(), value.trim().to_string()));
    }
}

/// Look up a header by case-insensitive name
pub fn header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

/// Wrap a future with the operation timeout
async fn timed<T>(deadline: Duration, fut: impl std::future::Future<Output = T>) -> Result<T> {
    timeout(deadline, fut)
        .await
        .map_err(|_| Error::Timeout {
            seconds: deadline.as_secs(),
        })
}
