//! The transport session seam.
//!
//! A [`Transport`] owns the actual byte movement. The engine only issues
//! commands (start, resume-from-token, suspend, resume, cancel, enumerate)
//! and consumes the [`TransportEvent`] stream the session produces. All events
//! for one session arrive on a single channel, so whoever drains it handles
//! them in order.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

/// Receiving half of a session's event stream.
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;
/// Sending half of a session's event stream.
pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

/// Identifier a session assigns to each native transfer it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransferId(pub u64);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Run state of a native transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferState {
    Running,
    Suspended,
    Completed,
}

/// A snapshot of a transfer the session currently knows about.
///
/// After a relaunch a session may report transfers that were started by a
/// previous process; the batch reconciles them by URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeTransfer {
    pub id: TransferId,
    pub url: String,
    pub state: TransferState,
    pub bytes_received: u64,
    /// 0 when the server did not announce a length.
    pub bytes_expected: u64,
}

/// A request for a fresh transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub url: String,
    pub timeout: Duration,
}

/// Opaque state that lets a failed transfer continue instead of restarting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeToken {
    pub url: String,
    pub partial_path: PathBuf,
    pub offset: u64,
}

impl ResumeToken {
    /// Number of bytes already received when the token was captured.
    pub fn byte_len(&self) -> u64 {
        self.offset
    }
}

/// Failure categories the engine distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportErrorKind {
    NotConnectedToInternet,
    NetworkConnectionLost,
    TimedOut,
    BadServerResponse,
    ZeroByteResource,
    RedirectToNonExistentLocation,
    Cancelled,
    Io,
    Other,
}

impl TransportErrorKind {
    /// Numeric code used in diagnostics.
    pub fn code(&self) -> i32 {
        match self {
            TransportErrorKind::Cancelled => -999,
            TransportErrorKind::TimedOut => -1001,
            TransportErrorKind::NetworkConnectionLost => -1005,
            TransportErrorKind::NotConnectedToInternet => -1009,
            TransportErrorKind::RedirectToNonExistentLocation => -1010,
            TransportErrorKind::BadServerResponse => -1011,
            TransportErrorKind::ZeroByteResource => -1014,
            TransportErrorKind::Io => -3000,
            TransportErrorKind::Other => -1,
        }
    }
}

/// A network or server failure reported by the session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} (Code {})", .kind.code())]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
    pub resume_token: Option<ResumeToken>,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            resume_token: None,
        }
    }

    pub fn with_resume_token(mut self, token: ResumeToken) -> Self {
        self.resume_token = Some(token);
        self
    }

    pub fn is_resumable(&self) -> bool {
        self.resume_token.is_some()
    }
}

/// Callbacks a session delivers, keyed by the transfer's original URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Progress {
        url: String,
        total_bytes_written: u64,
        total_bytes_expected: u64,
    },
    Resumed {
        url: String,
        offset: u64,
        expected_total: u64,
    },
    Failed {
        url: String,
        error: TransportError,
    },
    Finished {
        url: String,
        location: PathBuf,
    },
}

impl TransportEvent {
    pub fn url(&self) -> &str {
        match self {
            TransportEvent::Progress { url, .. }
            | TransportEvent::Resumed { url, .. }
            | TransportEvent::Failed { url, .. }
            | TransportEvent::Finished { url, .. } => url,
        }
    }
}

/// A shared transport session.
///
/// One session serves many batches over the process lifetime and may carry
/// transfers that belong to other consumers, so every bulk operation filters
/// by URL first.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Lightweight size discovery. `Ok(None)` when the server gives no length.
    async fn probe_size(&self, url: &str) -> Result<Option<u64>, TransportError>;

    async fn start(&self, request: TransferRequest) -> Result<TransferId, TransportError>;

    async fn start_from_resume_token(
        &self,
        token: ResumeToken,
        timeout: Duration,
    ) -> Result<TransferId, TransportError>;

    async fn suspend(&self, id: TransferId);

    async fn resume(&self, id: TransferId);

    async fn cancel(&self, id: TransferId);

    /// Every transfer the session knows about, including ones it restored.
    async fn transfers(&self) -> Vec<NativeTransfer>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_carries_code() {
        let err = TransportError::new(TransportErrorKind::NotConnectedToInternet, "offline");
        assert_eq!(err.to_string(), "offline (Code -1009)");
        assert!(!err.is_resumable());
    }

    #[test]
    fn token_length_is_its_offset() {
        let token = ResumeToken {
            url: "http://example.com/a".into(),
            partial_path: PathBuf::from("/tmp/1.odm-part"),
            offset: 512,
        };
        assert_eq!(token.byte_len(), 512);
        let err = TransportError::new(TransportErrorKind::NetworkConnectionLost, "lost")
            .with_resume_token(token);
        assert!(err.is_resumable());
    }
}
