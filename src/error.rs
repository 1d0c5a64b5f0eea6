//! Error types for nzb-mount
//!
//! This module provides the error taxonomy used throughout the library:
//! - Transport-level errors (connect, login, protocol, timeout)
//! - Segment-level errors (article not found, CRC mismatch)
//! - Archive-level errors (password protected, unsupported compression)
//! - The user-visible [`FailureReason`] categories recorded in history

use thiserror::Error;

/// Result type alias for nzb-mount operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for nzb-mount
///
/// This is the primary error type used throughout the library. Each variant includes
/// contextual information to help diagnose issues. The queue manager is the single
/// place that maps these onto [`FailureReason`] categories for history records.
#[derive(Debug, Error)]
pub enum Error {
    /// Article is absent on every configured provider
    ///
    /// Non-retryable for the segment; the owning job fails with
    /// `FailureReason::MissingArticles`.
    #[error("article {message_id} not found on any provider")]
    ArticleNotFound {
        /// The message-id that could not be retrieved
        message_id: String,
    },

    /// TCP/TLS connect to a provider failed
    #[error("could not connect to {host}:{port}: {reason}")]
    CouldNotConnect {
        /// Provider hostname
        host: String,
        /// Provider port
        port: u16,
        /// Underlying failure description
        reason: String,
    },

    /// Provider rejected AUTHINFO credentials
    ///
    /// Authentication failures are permanent; the connection is not retried.
    #[error("could not log in to {host}: {reason}")]
    CouldNotLogin {
        /// Provider hostname
        host: String,
        /// Server response (status code only, credentials never echoed)
        reason: String,
    },

    /// Server sent a response outside the expected protocol
    ///
    /// The connection that produced this is discarded by the pool.
    #[error("NNTP protocol error: {0}")]
    Protocol(String),

    /// An operation or pool acquisition timed out
    #[error("operation timed out after {seconds}s")]
    Timeout {
        /// Configured timeout that elapsed
        seconds: u64,
    },

    /// The job's cancellation token fired
    #[error("operation cancelled")]
    Cancelled,

    /// RAR archive requires a password that was not supplied
    #[error("RAR archive {archive} is password protected")]
    PasswordProtectedRar {
        /// Archive (volume) name
        archive: String,
    },

    /// 7z archive requires a password that was not supplied
    #[error("7z archive {archive} is password protected")]
    PasswordProtectedSevenZip {
        /// Archive name
        archive: String,
    },

    /// RAR entry is compressed; only stored entries are supported
    #[error("RAR entry {entry} uses unsupported compression method {method:#04x}")]
    UnsupportedRarCompression {
        /// Entry filename inside the archive
        entry: String,
        /// RAR compression method byte
        method: u8,
    },

    /// 7z entry uses a codec other than copy; only stored entries are supported
    #[error("7z entry {entry} uses unsupported codec {codec:#x}")]
    UnsupportedSevenZipCompression {
        /// Entry filename inside the archive
        entry: String,
        /// 7z codec id
        codec: u64,
    },

    /// No importable video file was produced and `ensure_importable_video` is set
    #[error("no importable video files found")]
    NoVideoFiles,

    /// Decoded yEnc part failed CRC32 (or `=ypart` range) validation
    ///
    /// Treated as a missing/corrupt segment: retried via the next provider,
    /// then surfaces as `FailureReason::MissingArticles`.
    #[error(
        "CRC32 mismatch in {filename} part {part}: advertised {advertised:08x}, computed {computed:08x}"
    )]
    CrcMismatch {
        /// Filename from the yEnc header
        filename: String,
        /// Part number from the yEnc header (1 when partless)
        part: u32,
        /// CRC advertised in `=yend`
        advertised: u32,
        /// CRC computed over the decoded bytes
        computed: u32,
    },

    /// NZB document could not be parsed or has no usable files
    #[error("invalid NZB: {0}")]
    InvalidNzb(String),

    /// yEnc stream is structurally malformed (e.g. ends before `=ybegin`)
    #[error("invalid yEnc stream: {0}")]
    InvalidYenc(String),

    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "providers")
        key: Option<String>,
    },

    /// Metadata store operation failed
    #[error("metadata store error: {0}")]
    Store(String),

    /// A job folder with this name already exists and the duplicate policy is mark-failed
    #[error("duplicate job: {0}")]
    DuplicateJob(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for a protocol error built from an unexpected response line
    pub(crate) fn unexpected_response(command: &str, response: &str) -> Self {
        Error::Protocol(format!("unexpected response to {command}: {response}"))
    }
}

/// User-visible failure category recorded on a failed history item
///
/// The queue manager maps the top-level [`Error`] of a failed job onto exactly
/// one of these. The `Display` strings are the stable, user-facing labels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailureReason {
    /// One or more articles were absent or corrupt on all providers
    MissingArticles,
    /// The job timed out or was cancelled by the operator/supervisor
    TimeoutCancelled,
    /// A provider was unreachable, rejected login, or violated the protocol
    ConnectionError,
    /// An archive required a password that was not available
    PasswordProtected,
    /// An archive used compression or features outside the stored-entry subset
    UnsupportedFormat,
    /// No importable video was found and the config requires one
    NoVideoFiles,
    /// Anything not covered above
    UnknownError,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureReason::MissingArticles => "Missing Articles",
            FailureReason::TimeoutCancelled => "Timeout/Cancelled",
            FailureReason::ConnectionError => "Connection Error",
            FailureReason::PasswordProtected => "Password Protected",
            FailureReason::UnsupportedFormat => "Unsupported Format",
            FailureReason::NoVideoFiles => "No Video Files",
            FailureReason::UnknownError => "Unknown Error",
        };
        f.write_str(s)
    }
}

impl From<&Error> for FailureReason {
    fn from(error: &Error) -> Self {
        match error {
            Error::ArticleNotFound { .. } | Error::CrcMismatch { .. } => {
                FailureReason::MissingArticles
            }
            Error::Timeout { .. } | Error::Cancelled => FailureReason::TimeoutCancelled,
            Error::CouldNotConnect { .. } | Error::CouldNotLogin { .. } | Error::Protocol(_) => {
                FailureReason::ConnectionError
            }
            Error::PasswordProtectedRar { .. } | Error::PasswordProtectedSevenZip { .. } => {
                FailureReason::PasswordProtected
            }
            Error::UnsupportedRarCompression { .. }
            | Error::UnsupportedSevenZipCompression { .. } => FailureReason::UnsupportedFormat,
            Error::NoVideoFiles => FailureReason::NoVideoFiles,
            Error::InvalidNzb(_)
            | Error::InvalidYenc(_)
            | Error::Config { .. }
            | Error::Store(_)
            | Error::DuplicateJob(_)
            | Error::Io(_) => FailureReason::UnknownError,
        }
    }
}
