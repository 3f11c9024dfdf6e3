//! Core data model.
//!
//! A work item is one file instance moving through the pipeline. It has
//! identity (a fingerprint of path + size + mtime, so re-triggered discovery
//! events for the same physical file collapse onto one record), a category
//! derived from its watch subdirectory, and lifecycle state.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Stable identity of one physical file across repeated discovery events.
///
/// Derived from path, size, and modification time: an unchanged file always
/// maps to the same id, a rewritten file becomes new work.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileId(String);

impl FileId {
    pub fn derive(path: &Path, size: u64, modified: SystemTime) -> Self {
        let mtime = modified
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        let mut hasher = Sha256::new();
        hasher.update(path.as_os_str().as_encoded_bytes());
        hasher.update(size.to_le_bytes());
        hasher.update(mtime.as_secs().to_le_bytes());
        let digest = hasher.finalize();
        Self(hex::encode(&digest[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for FileId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of the fingerprint
        write!(f, "{}", &self.0[..self.0.len().min(8)])
    }
}

// ---------------------------------------------------------------------------
// Work Item
// ---------------------------------------------------------------------------

/// One file tracked by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    /// Identity fingerprint. Exactly one item exists per identity at a time.
    pub id: FileId,

    /// Location of the file when it was discovered.
    pub path: PathBuf,

    /// Logical bucket (watch subdirectory). Used for reporting and tags,
    /// never for priority.
    pub category: String,

    /// File size at discovery, bytes.
    pub size: u64,

    /// Current lifecycle state.
    pub state: State,

    /// Number of publish attempts so far. Never decreases.
    pub attempt_count: u32,

    /// Classification of the most recent failure, if any.
    pub last_error_kind: Option<ErrorKind>,

    /// Message of the most recent failure, if any.
    pub last_error: Option<String>,

    /// Remote post id once published.
    pub post_id: Option<String>,

    /// Correlation id assigned at discovery and preserved for the whole
    /// lifecycle, including across duplicate discovery events.
    pub trace_id: Uuid,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a work item.
///
/// Transitions only move forward, except the Retrying -> Admitted loop and
/// the escape hatch into Failed. Archived and Failed are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum State {
    /// Seen by the discovery feed, waiting for admission.
    Discovered,
    /// Admission granted, handed to the dispatcher.
    Admitted,
    /// Description service call in flight.
    Analyzing,
    /// Format re-encode in flight.
    Converting,
    /// Upload to the platform in flight.
    Publishing,
    /// Upload accepted, not yet moved to archive storage.
    Published,
    /// Failed transiently, waiting for re-admission.
    Retrying,
    /// Abandoned. Terminal.
    Failed,
    /// Published and moved to archive storage. Terminal.
    Archived,
}

impl State {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: State) -> bool {
        use State::*;
        if to == Failed {
            // Escape hatch from any non-terminal state.
            return !self.is_terminal();
        }
        matches!(
            (self, to),
            (Discovered, Admitted)
                | (Retrying, Admitted)      // retry loop
                | (Admitted, Analyzing)
                | (Admitted, Converting)    // analysis disabled
                | (Admitted, Publishing)    // analysis disabled, no conversion
                | (Admitted, Retrying)      // shutdown before first step
                | (Analyzing, Converting)
                | (Analyzing, Publishing)
                | (Analyzing, Retrying)
                | (Converting, Publishing)
                | (Converting, Retrying)
                | (Publishing, Published)
                | (Publishing, Retrying)
                | (Published, Archived)
        )
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Archived | State::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            State::Discovered => "discovered",
            State::Admitted => "admitted",
            State::Analyzing => "analyzing",
            State::Converting => "converting",
            State::Publishing => "publishing",
            State::Published => "published",
            State::Retrying => "retrying",
            State::Failed => "failed",
            State::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<State> {
        Some(match s {
            "discovered" => State::Discovered,
            "admitted" => State::Admitted,
            "analyzing" => State::Analyzing,
            "converting" => State::Converting,
            "publishing" => State::Publishing,
            "published" => State::Published,
            "retrying" => State::Retrying,
            "failed" => State::Failed,
            "archived" => State::Archived,
            _ => return None,
        })
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// Classification of a sub-step failure, assigned at the collaborator
/// boundary. The retry policy and the alert gate key off this, never off
/// raw error strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection refused, DNS failure, 5xx from the remote.
    Network,
    /// The per-step deadline elapsed.
    Timeout,
    /// The remote service told us to slow down.
    RateLimited,
    /// Credentials rejected.
    Auth,
    /// Corrupt or unsupported input file.
    InvalidInput,
    /// The remote rejected the content itself.
    Rejected,
    /// State-store contract violation. Programming error, not retried.
    Internal,
}

impl ErrorKind {
    /// Permanent failures are abandoned regardless of attempt count.
    pub fn is_permanent(self) -> bool {
        matches!(
            self,
            ErrorKind::Auth | ErrorKind::InvalidInput | ErrorKind::Rejected | ErrorKind::Internal
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::Auth => "auth",
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::Rejected => "rejected",
            ErrorKind::Internal => "internal",
        }
    }

    pub fn parse(s: &str) -> Option<ErrorKind> {
        Some(match s {
            "network" => ErrorKind::Network,
            "timeout" => ErrorKind::Timeout,
            "rate_limited" => ErrorKind::RateLimited,
            "auth" => ErrorKind::Auth,
            "invalid_input" => ErrorKind::InvalidInput,
            "rejected" => ErrorKind::Rejected,
            "internal" => ErrorKind::Internal,
            _ => return None,
        })
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// One event from the discovery feed: a file that appeared (or settled)
/// under the watch root. Duplicate events for an unchanged file are expected
/// and absorbed by idempotent ingestion.
#[derive(Debug, Clone)]
pub struct Discovery {
    pub path: PathBuf,
    pub category: String,
    pub size: u64,
    pub modified: SystemTime,
}

impl Discovery {
    pub fn file_id(&self) -> FileId {
        FileId::derive(&self.path, self.size, self.modified)
    }
}
