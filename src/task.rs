// src/task.rs

use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

use crate::integrity::file_digest;
use crate::models::{HashAlgorithm, TaskStatus, ValidatedDescriptor};
use crate::transport::{ResumeToken, TransportError, TransportErrorKind};

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// One URL-to-destination download and its verification state.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    pub identifier: Option<String>,
    /// Zero-based insertion index inside the owning batch. Never reassigned.
    pub position: usize,
    pub url: String,
    pub destination: PathBuf,
    pub absolute_destination: PathBuf,
    pub file_name: String,
    pub checksum: Option<String>,
    pub hash_algorithm: HashAlgorithm,
    pub expected_size: u64,
    pub bytes_written: u64,
    pub completed: bool,
    pub cached_progress: f32,
    pub download_error: Option<TransportError>,
    pub is_downloading: bool,
    pub is_probing: bool,
    /// The session holds this task's transfer suspended.
    pub is_suspended: bool,
    pub verification_failures: u32,
    /// Set once automatic re-downloads after failed verification are exhausted.
    pub gave_up: bool,
}

impl DownloadTask {
    /// Builds the task and reconciles it with whatever is already on disk.
    ///
    /// A file found at the destination is verified immediately: a match marks
    /// the task completed (work from an earlier run is trusted), a mismatch is
    /// deleted.
    pub async fn new(
        descriptor: ValidatedDescriptor,
        root: &Path,
        hash_algorithm: HashAlgorithm,
    ) -> Result<Self, TaskError> {
        let absolute_destination = descriptor.absolute_destination(root);
        let file_name = descriptor
            .destination
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut task = Self {
            identifier: descriptor.identifier,
            position: 0,
            url: descriptor.url,
            destination: descriptor.destination,
            absolute_destination,
            file_name,
            checksum: descriptor.checksum,
            hash_algorithm,
            expected_size: descriptor.expected_size,
            bytes_written: 0,
            completed: false,
            cached_progress: 0.0,
            download_error: None,
            is_downloading: false,
            is_probing: false,
            is_suspended: false,
            verification_failures: 0,
            gave_up: false,
        };
        task.prepare_folder_for_destination().await?;
        Ok(task)
    }

    async fn prepare_folder_for_destination(&mut self) -> Result<(), TaskError> {
        if let Some(parent) = self.absolute_destination.parent() {
            if !tokio::fs::try_exists(parent).await.unwrap_or(false) {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|source| TaskError::CreateDir {
                        path: parent.to_path_buf(),
                        source,
                    })?;
            }
        }

        if self.destination_exists().await {
            if self.verify_download().await {
                debug!("Task {}: existing file at {:?} verified", self.url, self.absolute_destination);
            } else {
                self.clean_up().await;
            }
        } else {
            self.clean_up().await;
        }
        Ok(())
    }

    /// Fraction in `[0, 1]`; 1 whenever the task is completed.
    pub fn downloading_progress(&self) -> f32 {
        if self.completed {
            return 1.0;
        }
        if self.expected_size > 0 {
            (self.bytes_written as f32 / self.expected_size as f32).clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    /// Checks the destination file against the checksum, or against the
    /// expected size when no checksum is configured.
    ///
    /// A rejected file still leaves `bytes_written == expected_size`, so raw
    /// progress reads 100% while `completed` stays false.
    pub async fn verify_download(&mut self) -> bool {
        if !self.destination_exists().await {
            return false;
        }

        let verified = match &self.checksum {
            Some(expected) => match file_digest(&self.absolute_destination, self.hash_algorithm).await {
                Ok(actual) => {
                    if &actual != expected {
                        debug!("Task {}: checksum mismatch, expected {} got {}", self.url, expected, actual);
                    }
                    &actual == expected
                }
                Err(e) => {
                    warn!("Task {}: could not hash {:?}: {}", self.url, self.absolute_destination, e);
                    false
                }
            },
            None => match tokio::fs::metadata(&self.absolute_destination).await {
                Ok(meta) => meta.len() == self.expected_size,
                Err(e) => {
                    warn!("Task {}: could not stat {:?}: {}", self.url, self.absolute_destination, e);
                    false
                }
            },
        };

        if verified {
            self.completed = true;
            self.cached_progress = 1.0;
        } else {
            self.bytes_written = self.expected_size;
        }
        verified
    }

    /// Back to the initial state, deleting any destination file.
    pub async fn clean_up(&mut self) {
        self.completed = false;
        self.download_error = None;
        self.bytes_written = 0;
        self.cached_progress = 0.0;
        self.delete_destination_file().await;
    }

    /// Like [`clean_up`](Self::clean_up) but keeps the progress the token
    /// represents.
    pub async fn clean_up_with_resumable_data(&mut self, token: &ResumeToken) {
        self.completed = false;
        self.bytes_written = token.byte_len();
        self.delete_destination_file().await;
        self.download_error = None;
    }

    pub fn capture_received_error(&mut self, error: TransportError) {
        self.is_downloading = false;
        self.is_probing = false;
        self.is_suspended = false;
        self.download_error = Some(error);
    }

    pub fn resume_token(&self) -> Option<&ResumeToken> {
        self.download_error.as_ref().and_then(|e| e.resume_token.as_ref())
    }

    pub fn is_hitting_error_because_offline(&self) -> bool {
        matches!(
            self.download_error.as_ref().map(|e| e.kind),
            Some(TransportErrorKind::NotConnectedToInternet | TransportErrorKind::NetworkConnectionLost)
        )
    }

    pub fn is_hitting_error_connecting_to_server(&self) -> bool {
        matches!(
            self.download_error.as_ref().map(|e| e.kind),
            Some(
                TransportErrorKind::RedirectToNonExistentLocation
                    | TransportErrorKind::BadServerResponse
                    | TransportErrorKind::ZeroByteResource
                    | TransportErrorKind::TimedOut
            )
        )
    }

    pub fn full_error_description(&self) -> String {
        match &self.download_error {
            Some(error) => format!(
                "Downloading URL {} failed because of error: {} (Code {})",
                self.url,
                error.message,
                error.kind.code()
            ),
            None => "No Error".to_string(),
        }
    }

    pub fn status(&self) -> TaskStatus {
        if self.completed {
            TaskStatus::Completed
        } else if self.gave_up {
            TaskStatus::Failed { resumable: false }
        } else if let Some(error) = &self.download_error {
            TaskStatus::Failed { resumable: error.is_resumable() }
        } else if self.is_probing {
            TaskStatus::Probing
        } else if self.is_suspended {
            TaskStatus::Suspended
        } else if self.is_downloading {
            TaskStatus::Transferring
        } else {
            TaskStatus::Idle
        }
    }

    async fn destination_exists(&self) -> bool {
        tokio::fs::try_exists(&self.absolute_destination).await.unwrap_or(false)
    }

    async fn delete_destination_file(&self) {
        if self.destination_exists().await {
            if let Err(e) = tokio::fs::remove_file(&self.absolute_destination).await {
                warn!("Removing existing file {:?} failed: {}", self.absolute_destination, e);
            }
        }
    }
}
