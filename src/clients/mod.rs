//! External collaborators.
//!
//! Thin, interchangeable I/O adapters behind object-safe traits. None of
//! them contains decision logic: each performs one call, classifies its
//! failure at the boundary, and hands the outcome back. The core never sees
//! a raw transport error.

pub mod convert;
pub mod describe;
pub mod files;
pub mod publish;
pub mod push;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use uuid::Uuid;

use crate::model::ErrorKind;

/// A classified sub-step failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct StepError {
    pub kind: ErrorKind,
    pub message: String,
}

impl StepError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Map a reqwest transport error onto the taxonomy.
    pub fn from_transport(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            ErrorKind::Timeout
        } else {
            ErrorKind::Network
        };
        Self::new(kind, err.to_string())
    }

    /// Map an HTTP status onto the taxonomy.
    pub fn from_status(status: reqwest::StatusCode, body: String) -> Self {
        let kind = match status.as_u16() {
            401 | 403 => ErrorKind::Auth,
            429 => ErrorKind::RateLimited,
            400..=499 => ErrorKind::Rejected,
            _ => ErrorKind::Network,
        };
        Self::new(kind, format!("{status}: {body}"))
    }
}

pub type StepResult<T> = std::result::Result<T, StepError>;

/// Everything the publisher needs for one post.
#[derive(Debug, Clone)]
pub struct PostRequest {
    pub file: PathBuf,
    pub category: String,
    pub tags: Vec<String>,
    pub caption: Option<String>,
    pub state: String,
    pub trace_id: Uuid,
}

/// Produces a one-or-two sentence description of an image.
#[async_trait]
pub trait Analyzer: Send + Sync {
    async fn analyze(&self, file: &Path) -> StepResult<String>;
}

/// Re-encodes a file into a platform-accepted format. Returns the path of
/// the converted file, written alongside the original.
#[async_trait]
pub trait Converter: Send + Sync {
    async fn convert(&self, file: &Path) -> StepResult<PathBuf>;
}

/// Uploads one post and returns the remote post id.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, request: &PostRequest) -> StepResult<String>;
}

/// Moves files to their terminal storage location. Either the file moved or
/// it did not; no half-states.
#[async_trait]
pub trait FileMover: Send + Sync {
    /// Terminal location for successfully published files.
    async fn archive(&self, file: &Path, category: &str) -> std::io::Result<PathBuf>;
    /// Terminal location for abandoned files, out of the watch root so a
    /// restart does not reprocess them.
    async fn quarantine(&self, file: &Path, category: &str) -> std::io::Result<PathBuf>;
}

/// Fire-and-forget push notification. The pipeline never depends on
/// delivery; failures are logged and dropped.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, title: &str, message: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        let cases = [
            (401, ErrorKind::Auth),
            (403, ErrorKind::Auth),
            (429, ErrorKind::RateLimited),
            (422, ErrorKind::Rejected),
            (500, ErrorKind::Network),
            (503, ErrorKind::Network),
        ];
        for (code, kind) in cases {
            let status = reqwest::StatusCode::from_u16(code).unwrap();
            assert_eq!(
                StepError::from_status(status, String::new()).kind,
                kind,
                "status {code}"
            );
        }
    }
}
