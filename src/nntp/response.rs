//! NNTP response parsing
//!
//! Responses are single CRLF-terminated ASCII lines beginning with a
//! 3-digit status code. Multi-line payloads (HEAD, BODY, ARTICLE) follow
//! the status line and are handled by the body layer.

use crate::error::{Error, Result};

/// Status codes this client acts on (RFC 3977 subset)
pub mod code {
    /// Service available, posting allowed
    pub const GREETING_POSTING_OK: u16 = 200;
    /// Service available, posting prohibited
    pub const GREETING_NO_POSTING: u16 = 201;
    /// Server date/time follows
    pub const DATE: u16 = 111;
    /// Group selected
    pub const GROUP_SELECTED: u16 = 211;
    /// Article follows (ARTICLE)
    pub const ARTICLE_FOLLOWS: u16 = 220;
    /// Headers follow (HEAD)
    pub const HEAD_FOLLOWS: u16 = 221;
    /// Body follows (BODY)
    pub const BODY_FOLLOWS: u16 = 222;
    /// Article exists (STAT)
    pub const STAT_OK: u16 = 223;
    /// Authentication accepted
    pub const AUTH_ACCEPTED: u16 = 281;
    /// Password required
    pub const PASSWORD_REQUIRED: u16 = 381;
    /// No article with that message-id
    pub const NO_SUCH_ARTICLE: u16 = 430;
    /// Authentication required
    pub const AUTH_REQUIRED: u16 = 480;
    /// Authentication rejected
    pub const AUTH_REJECTED: u16 = 481;
    /// Connection closing (QUIT)
    pub const CLOSING: u16 = 205;
}

/// One parsed status line
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NntpResponse {
    /// 3-digit status code
    pub code: u16,
    /// Remainder of the line after the code
    pub text: String,
}

impl NntpResponse {
    /// Parse a status line (CRLF already stripped)
    pub fn parse(line: &str) -> Result<Self> {
        let code_part = line.get(..3).ok_or_else(|| {
            Error::Protocol(format!("response line too short: {line:?}"))
        })?;
        let code: u16 = code_part
            .parse()
            .map_err(|_| Error::Protocol(format!("response has no status code: {line:?}")))?;
        Ok(Self {
            code,
            text: line.get(3..).unwrap_or("").trim_start().to_string(),
        })
    }

    /// First digit of the code (1 informational … 5 error)
    pub fn class(&self) -> u16 {
        self.code / 100
    }

    /// Whether the article addressed by the command does not exist
    pub fn is_not_found(&self) -> bool {
        self.code == code::NO_SUCH_ARTICLE || self.code == 423 || self.code == 420
    }

    /// The full line as received, for diagnostics
    pub fn line(&self) -> String {
        format!("{} {}", self.code, self.text)
    }
}

impl std::fmt::Display for NntpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code, self.text)
    }
}

/// Parsed `211 count first last group` response
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GroupInfo {
    /// Estimated article count
    pub count: u64,
    /// Lowest article number
    pub first: u64,
    /// Highest article number
    pub last: u64,
}

impl GroupInfo {
    /// Parse the text of a 211 response
    pub fn parse(text: &str) -> Result<Self> {
        let mut parts = text.split_whitespace();
        let mut next = |what: &str| -> Result<u64> {
            parts
                .next()
                .and_then(|p| p.parse().ok())
                .ok_or_else(|| Error::Protocol(format!("bad GROUP response ({what}): {text:?}")))
        };
        Ok(Self {
            count: next("count")?,
            first: next("first")?,
            last: next("last")?,
        })
    }
}
