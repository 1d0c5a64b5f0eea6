//! Core types for nzb-mount

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FailureReason;

/// Unique identifier for a queued job
///
/// The same id is reused for the history item when the job finalizes, so a
/// job can be followed across the queue → history transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a fresh job id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner Uuid value
    pub fn get(&self) -> Uuid {
        self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for JobId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque ASCII token identifying a single article body on NNTP
///
/// Stored without the surrounding angle brackets; they are added on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    /// Create a message-id, stripping surrounding angle brackets if present
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let trimmed = raw
            .strip_prefix('<')
            .and_then(|s| s.strip_suffix('>'))
            .map(str::to_string)
            .unwrap_or(raw);
        Self(trimmed)
    }

    /// The bare token without angle brackets
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The wire form `<token>` used in NNTP commands
    pub fn angled(&self) -> String {
        format!("<{}>", self.0)
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{}>", self.0)
    }
}

/// Caller class used by the global limiter for partitioned admission control
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageClass {
    /// On-demand streaming reads through the mount
    Streaming,
    /// Queue processing (downloads driven by the queue manager)
    Queue,
    /// Background article-existence health checks
    HealthCheck,
    /// Repair traffic (re-fetching corrupt segments)
    Repair,
}

impl UsageClass {
    /// All classes in a fixed order, used for quota tables
    pub const ALL: [UsageClass; 4] = [
        UsageClass::Streaming,
        UsageClass::Queue,
        UsageClass::HealthCheck,
        UsageClass::Repair,
    ];
}

impl std::fmt::Display for UsageClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UsageClass::Streaming => "streaming",
            UsageClass::Queue => "queue",
            UsageClass::HealthCheck => "health-check",
            UsageClass::Repair => "repair",
        };
        f.write_str(s)
    }
}

/// Tag passed on every limiter acquisition: class plus job name for tracing
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UsageContext {
    /// Caller class (determines which quota partition is consumed)
    pub class: UsageClass,
    /// Job name for tracing and affinity bookkeeping
    pub job_name: Option<String>,
}

impl UsageContext {
    /// Context for a given class with no job association
    pub fn of(class: UsageClass) -> Self {
        Self {
            class,
            job_name: None,
        }
    }

    /// Context for a given class and job name
    pub fn for_job(class: UsageClass, job_name: impl Into<String>) -> Self {
        Self {
            class,
            job_name: Some(job_name.into()),
        }
    }
}

/// Queue priority
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Low priority (-1)
    Low = -1,
    /// Normal priority (0)
    #[default]
    Normal = 0,
    /// High priority (1)
    High = 1,
    /// Force start immediately (2)
    Force = 2,
}

/// Terminal status of a finalized job
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryStatus {
    /// Job finished and its mount items were committed
    Completed,
    /// Job failed; `fail_message`/`failure_reason` carry the cause
    Failed,
}

/// Event emitted during job lifecycle
///
/// Events are fire-and-forget: they are broadcast to whoever subscribes
/// (websocket adapters, dashboards) and never block the pipeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Job added to the queue
    Queued {
        /// Job ID
        id: JobId,
        /// Job name
        job_name: String,
    },

    /// Job removed from the queue without processing
    Removed {
        /// Job ID
        id: JobId,
    },

    /// Queue worker started processing a job
    Started {
        /// Job ID
        id: JobId,
        /// Job name
        job_name: String,
    },

    /// Progress update (0-100 download; 101-200 optional health check)
    Progress {
        /// Job ID
        id: JobId,
        /// Integer progress percentage
        percent: u32,
    },

    /// Job finalized successfully; mount items committed
    Completed {
        /// Job ID
        id: JobId,
        /// Job name
        job_name: String,
        /// Mount directory id the job's files were committed under
        download_dir_id: Uuid,
    },

    /// Job finalized as failed
    Failed {
        /// Job ID
        id: JobId,
        /// Job name
        job_name: String,
        /// Categorical reason
        #[serde(with = "failure_reason_serde")]
        reason: FailureReason,
        /// User-visible failure message
        message: String,
    },

    /// Transient failure; job paused and kept in the queue
    Paused {
        /// Job ID
        id: JobId,
        /// Time the job becomes eligible again
        until: DateTime<Utc>,
    },
}

/// Serialize FailureReason by its stable display label
mod failure_reason_serde {
    use super::FailureReason;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(r: &FailureReason, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&r.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<FailureReason, D::Error> {
        let label = String::deserialize(d)?;
        Ok(match label.as_str() {
            "Missing Articles" => FailureReason::MissingArticles,
            "Timeout/Cancelled" => FailureReason::TimeoutCancelled,
            "Connection Error" => FailureReason::ConnectionError,
            "Password Protected" => FailureReason::PasswordProtected,
            "Unsupported Format" => FailureReason::UnsupportedFormat,
            "No Video Files" => FailureReason::NoVideoFiles,
            _ => FailureReason::UnknownError,
        })
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_id_strips_angle_brackets() {
        let id = MessageId::new("<part1@example.com>");
        assert_eq!(id.as_str(), "part1@example.com");
        assert_eq!(id.angled(), "<part1@example.com>");
    }

    #[test]
    fn message_id_accepts_bare_token() {
        let id = MessageId::new("part1@example.com");
        assert_eq!(id.as_str(), "part1@example.com");
        assert_eq!(id.angled(), "<part1@example.com>");
    }

    #[test]
    fn message_id_keeps_half_bracketed_token_verbatim() {
        // A token with only a leading bracket is malformed; keep it as-is
        // rather than guessing.
        let id = MessageId::new("<oops@example.com");
        assert_eq!(id.as_str(), "<oops@example.com");
    }

    #[test]
    fn priority_orders_force_above_normal() {
        assert!(Priority::Force > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn event_failed_serializes_reason_label() {
        let event = Event::Failed {
            id: JobId::new(),
            job_name: "job".into(),
            reason: FailureReason::MissingArticles,
            message: "3 segments missing".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"Missing Articles\""));
    }

    #[test]
    fn event_failed_round_trips_reason() {
        let event = Event::Failed {
            id: JobId::new(),
            job_name: "job".into(),
            reason: FailureReason::PasswordProtected,
            message: "x".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        match back {
            Event::Failed { reason, .. } => {
                assert_eq!(reason, FailureReason::PasswordProtected)
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn usage_class_display_labels() {
        assert_eq!(UsageClass::Streaming.to_string(), "streaming");
        assert_eq!(UsageClass::HealthCheck.to_string(), "health-check");
    }
}
