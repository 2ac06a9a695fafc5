// src/batch.rs

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::models::{HashAlgorithm, TaskDescriptor, ValidationError};
use crate::task::{DownloadTask, TaskError};
use crate::transport::{
    NativeTransfer, ResumeToken, TransferId, TransferRequest, TransferState, Transport,
    TransportError,
};

/// Timeout attached to every transfer request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Debug, Error)]
pub enum BatchError {
    #[error("invalid task descriptor: {0}")]
    Validation(#[from] ValidationError),
    #[error("task error: {0}")]
    Task(#[from] TaskError),
    #[error("batch is not bound to a transport session")]
    NotBound,
    #[error("no task at position {0}")]
    UnknownTask(usize),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Byte sums across every task of a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ByteTotals {
    pub downloaded: u64,
    pub expected: u64,
}

/// An ordered set of tasks sharing one transport session and one aggregate
/// completion state.
pub struct DownloadBatch {
    tasks: Vec<DownloadTask>,
    urls: HashMap<String, usize>,
    session: Option<Arc<dyn Transport>>,
    hash_algorithm: HashAlgorithm,
    download_root: PathBuf,
    request_timeout: Duration,
    /// Signed so a late, smaller byte count cancels out rather than wrapping.
    bytes_since_start: i64,
    start_time: Option<Instant>,
    completed: bool,
    completion_reported: bool,
}

impl DownloadBatch {
    pub fn new(download_root: impl Into<PathBuf>, hash_algorithm: HashAlgorithm) -> Self {
        Self {
            tasks: Vec::new(),
            urls: HashMap::new(),
            session: None,
            hash_algorithm,
            download_root: download_root.into(),
            request_timeout: REQUEST_TIMEOUT,
            bytes_since_start: 0,
            start_time: None,
            completed: false,
            completion_reported: false,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Adds a task for `descriptor`.
    ///
    /// Returns `Ok(None)` without touching the batch when a task for the same
    /// absolute URL already exists.
    pub async fn add_task(
        &mut self,
        descriptor: &TaskDescriptor,
    ) -> Result<Option<&DownloadTask>, BatchError> {
        let validated = descriptor.validate()?;
        if self.is_task_exist_with_url(&validated.url) {
            debug!("Batch: ignoring duplicate task for {}", validated.url);
            return Ok(None);
        }

        let mut task = DownloadTask::new(validated, &self.download_root, self.hash_algorithm).await?;
        let position = self.tasks.len();
        task.position = position;
        self.urls.insert(task.url.clone(), position);
        self.tasks.push(task);
        debug!("Batch: added task {} at position {}", self.tasks[position].url, position);
        Ok(self.tasks.get(position))
    }

    pub fn is_task_exist_with_url(&self, url: &str) -> bool {
        self.urls.contains_key(url)
    }

    pub fn tasks(&self) -> &[DownloadTask] {
        &self.tasks
    }

    pub fn task(&self, position: usize) -> Option<&DownloadTask> {
        self.tasks.get(position)
    }

    pub fn task_mut(&mut self, position: usize) -> Option<&mut DownloadTask> {
        self.tasks.get_mut(position)
    }

    pub fn position_of_url(&self, url: &str) -> Option<usize> {
        self.urls.get(url).copied()
    }

    pub fn task_for_url(&self, url: &str) -> Option<&DownloadTask> {
        self.position_of_url(url).and_then(|p| self.tasks.get(p))
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn hash_algorithm(&self) -> HashAlgorithm {
        self.hash_algorithm
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Binds the batch to `session` and starts the rate clock.
    pub fn set_downloading_session(&mut self, session: Arc<dyn Transport>) {
        self.start_time = Some(Instant::now());
        self.session = Some(session);
    }

    pub fn is_downloading(&self) -> bool {
        self.session.is_some()
    }

    fn bound_session(&self) -> Result<Arc<dyn Transport>, BatchError> {
        self.session.clone().ok_or(BatchError::NotBound)
    }

    /// Starts the transfer for the task at `position`, discovering its size
    /// first when unknown.
    pub async fn start_download_task(&mut self, position: usize) -> Result<TransferId, BatchError> {
        let session = self.bound_session()?;
        if self.needs_size(position)? {
            let url = self.begin_size_lookup(position)?;
            let size = session.probe_size(&url).await;
            self.finish_size_lookup(position, &url, size);
        }
        self.download_request(position).await
    }

    /// True when the task's size is still unknown.
    pub fn needs_size(&self, position: usize) -> Result<bool, BatchError> {
        let task = self.tasks.get(position).ok_or(BatchError::UnknownTask(position))?;
        Ok(task.expected_size == 0)
    }

    /// Marks the task as looking up its size and returns the URL to ask. The
    /// lookup may run anywhere; hand its result to
    /// [`finish_size_lookup`](Self::finish_size_lookup).
    pub fn begin_size_lookup(&mut self, position: usize) -> Result<String, BatchError> {
        self.bound_session()?;
        let task = self.tasks.get_mut(position).ok_or(BatchError::UnknownTask(position))?;
        task.is_probing = true;
        Ok(task.url.clone())
    }

    /// Stores a size lookup result. Returns false when the task at `position`
    /// no longer belongs to `url` or stopped waiting for its size.
    pub fn finish_size_lookup(
        &mut self,
        position: usize,
        url: &str,
        size: Result<Option<u64>, TransportError>,
    ) -> bool {
        let Some(task) = self.tasks.get_mut(position) else {
            return false;
        };
        if task.url != url || !task.is_probing {
            return false;
        }
        task.is_probing = false;
        match size {
            Ok(Some(size)) => {
                debug!("Batch: {} is {} bytes", task.url, size);
                task.expected_size = size;
            }
            Ok(None) => debug!("Batch: {} did not report a length", task.url),
            Err(e) => warn!("Batch: size lookup for {} failed: {}", task.url, e),
        }
        true
    }

    /// Issues the transfer, resuming from the task's captured token when one
    /// exists.
    pub async fn download_request(&mut self, position: usize) -> Result<TransferId, BatchError> {
        let token = self
            .tasks
            .get(position)
            .ok_or(BatchError::UnknownTask(position))?
            .resume_token()
            .cloned();
        self.issue(position, token).await
    }

    /// Restarts a task: from its token when the last error carried one,
    /// otherwise from byte zero.
    pub async fn redownload_request_of_task(&mut self, position: usize) -> Result<TransferId, BatchError> {
        match self.prepare_redownload(position).await? {
            Some(token) => self.resume_from_token(position, token).await,
            None => self.start_download_task(position).await,
        }
    }

    /// Resets the task for another attempt and hands back the token to resume
    /// from, if its last error carried one.
    pub async fn prepare_redownload(&mut self, position: usize) -> Result<Option<ResumeToken>, BatchError> {
        self.bound_session()?;
        let task = self.tasks.get_mut(position).ok_or(BatchError::UnknownTask(position))?;
        task.gave_up = false;
        task.verification_failures = 0;

        let token = task.resume_token().cloned();
        match &token {
            Some(token) => task.clean_up_with_resumable_data(token).await,
            None => task.clean_up().await,
        }
        Ok(token)
    }

    pub async fn resume_from_token(&mut self, position: usize, token: ResumeToken) -> Result<TransferId, BatchError> {
        self.issue(position, Some(token)).await
    }

    async fn issue(&mut self, position: usize, token: Option<ResumeToken>) -> Result<TransferId, BatchError> {
        let session = self.bound_session()?;
        let timeout = self.request_timeout;
        let task = self.tasks.get_mut(position).ok_or(BatchError::UnknownTask(position))?;

        let result = match token {
            Some(token) => {
                info!("Batch: resuming {} from byte {}", task.url, token.offset);
                session.start_from_resume_token(token, timeout).await
            }
            None => {
                info!("Batch: starting {}", task.url);
                session
                    .start(TransferRequest {
                        url: task.url.clone(),
                        timeout,
                    })
                    .await
            }
        };

        match result {
            Ok(id) => {
                task.download_error = None;
                task.is_downloading = true;
                task.is_suspended = false;
                Ok(id)
            }
            Err(e) => {
                warn!("Batch: could not start {}: {}", task.url, e);
                task.capture_received_error(e.clone());
                Err(e.into())
            }
        }
    }

    /// Adopts a transfer the session was already running for one of our URLs.
    pub fn capture_downloading_info_of_download_task(&mut self, transfer: &NativeTransfer) -> Option<usize> {
        let position = self.position_of_url(&transfer.url)?;
        let task = &mut self.tasks[position];
        task.bytes_written = transfer.bytes_received;
        if task.expected_size == 0 {
            task.expected_size = transfer.bytes_expected;
        }
        task.is_downloading = true;
        task.is_suspended = transfer.state == TransferState::Suspended;
        Some(position)
    }

    /// Records the latest byte count for `url`, adding only the delta to the
    /// since-start counter.
    pub fn update_progress_of_download_url(&mut self, url: &str, total_bytes_written: u64) -> Option<usize> {
        let position = self.position_of_url(url)?;
        let task = &mut self.tasks[position];
        self.bytes_since_start += total_bytes_written as i64 - task.bytes_written as i64;
        task.bytes_written = total_bytes_written;
        Some(position)
    }

    pub fn bytes_received_since_start(&self) -> u64 {
        self.bytes_since_start.max(0) as u64
    }

    /// Moves the arrived file into place and verifies it.
    ///
    /// Any filesystem failure while placing the file counts as a rejected
    /// file.
    pub async fn handle_download_file_at(&mut self, location: &Path, url: &str) -> bool {
        let Some(position) = self.position_of_url(url) else {
            return false;
        };
        let task = &mut self.tasks[position];
        task.is_downloading = false;
        task.is_suspended = false;

        if let Err(e) = place_file(location, &task.absolute_destination).await {
            warn!("Batch: could not move {:?} to {:?}: {}", location, task.absolute_destination, e);
            return false;
        }

        let verified = task.verify_download().await;
        if verified {
            info!("Batch: {} verified", task.url);
            self.update_complete_status();
        } else {
            warn!("Batch: {} failed verification", task.url);
        }
        verified
    }

    pub fn total_bytes_written_and_received(&self) -> ByteTotals {
        self.tasks.iter().fold(ByteTotals::default(), |mut totals, task| {
            totals.downloaded += task.bytes_written;
            totals.expected += task.expected_size;
            totals
        })
    }

    /// Recomputes the completed flag. Returns the new value.
    pub fn update_complete_status(&mut self) -> bool {
        self.completed = self.tasks.iter().all(|task| task.completed);
        if !self.completed {
            self.completion_reported = false;
        }
        self.completed
    }

    /// True exactly once per transition into the completed state.
    pub(crate) fn take_completion_notice(&mut self) -> bool {
        if self.completed && !self.completion_reported {
            self.completion_reported = true;
            true
        } else {
            false
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.map(|start| start.elapsed()).unwrap_or_default()
    }

    /// Bytes per second received since the session was bound.
    pub fn download_rate(&self) -> u64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0;
        }
        (self.bytes_received_since_start() as f64 / elapsed) as u64
    }

    /// Resumes this batch's suspended transfers. Returns how many were resumed.
    pub async fn resume_all_suspended_tasks(&mut self) -> usize {
        self.toggle_transfers(TransferState::Suspended).await
    }

    /// Suspends this batch's running transfers. Returns how many were suspended.
    pub async fn suspend_all_ongoing_download_tasks(&mut self) -> usize {
        self.toggle_transfers(TransferState::Running).await
    }

    async fn toggle_transfers(&mut self, from: TransferState) -> usize {
        let Some(session) = self.session.clone() else {
            return 0;
        };
        let mut toggled = 0;
        for transfer in session.transfers().await {
            if transfer.state != from {
                continue;
            }
            let Some(position) = self.position_of_url(&transfer.url) else {
                continue;
            };
            match from {
                TransferState::Suspended => session.resume(transfer.id).await,
                _ => session.suspend(transfer.id).await,
            }
            self.tasks[position].is_suspended = from == TransferState::Running;
            toggled += 1;
        }
        toggled
    }

    /// Cancels this batch's transfers on the session. Returns how many.
    pub async fn cancel_all_transfers(&mut self) -> usize {
        let Some(session) = self.session.clone() else {
            return 0;
        };
        let mut cancelled = 0;
        for transfer in session.transfers().await {
            if let Some(position) = self.position_of_url(&transfer.url) {
                session.cancel(transfer.id).await;
                self.tasks[position].is_downloading = false;
                cancelled += 1;
            }
        }
        for task in &mut self.tasks {
            task.is_probing = false;
        }
        cancelled
    }

    /// Starts every task that is not completed yet. A task that fails to start
    /// keeps the error and the others still start. Returns how many started.
    pub async fn continue_all_incomplete_download_tasks(&mut self) -> Result<usize, BatchError> {
        self.bound_session()?;
        let pending: Vec<usize> = self
            .tasks
            .iter()
            .filter(|task| !task.completed)
            .map(|task| task.position)
            .collect();
        let mut started = 0;
        for position in pending {
            match self.start_download_task(position).await {
                Ok(_) => started += 1,
                Err(e) => warn!("Batch: task {} did not start: {}", position, e),
            }
        }
        Ok(started)
    }
}

async fn place_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if tokio::fs::try_exists(to).await? {
        tokio::fs::remove_file(to).await?;
    }
    if tokio::fs::rename(from, to).await.is_err() {
        // Crossing filesystems; fall back to copy.
        tokio::fs::copy(from, to).await?;
        let _ = tokio::fs::remove_file(from).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskStatus;
    use crate::transport::memory::{MemoryTransport, TransportCall};
    use crate::transport::TransportErrorKind;
    use tempfile::TempDir;

    const A: &str = "http://example.com/a.bin";
    const B: &str = "http://example.com/b.bin";

    fn batch(root: &TempDir) -> DownloadBatch {
        DownloadBatch::new(root.path(), HashAlgorithm::Sha1)
    }

    async fn staged(dir: &TempDir, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        tokio::fs::write(&path, contents).await.unwrap();
        path
    }

    #[tokio::test]
    async fn add_task_assigns_positions_and_rejects_duplicates() {
        let root = TempDir::new().unwrap();
        let mut batch = batch(&root);

        let first = batch.add_task(&TaskDescriptor::new(A, "a.bin")).await.unwrap().unwrap();
        assert_eq!(first.position, 0);
        let second = batch.add_task(&TaskDescriptor::new(B, "b.bin")).await.unwrap().unwrap();
        assert_eq!(second.position, 1);

        let duplicate = batch.add_task(&TaskDescriptor::new(A, "elsewhere.bin")).await.unwrap();
        assert!(duplicate.is_none());
        assert_eq!(batch.len(), 2);
    }

    #[tokio::test]
    async fn add_task_reports_validation_errors() {
        let root = TempDir::new().unwrap();
        let mut batch = batch(&root);
        let err = batch.add_task(&TaskDescriptor::new("", "a.bin")).await;
        assert!(matches!(err, Err(BatchError::Validation(ValidationError::MissingField("url")))));
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn progress_uses_delta_accounting() {
        let root = TempDir::new().unwrap();
        let mut batch = batch(&root);
        batch.add_task(&TaskDescriptor::new(A, "a.bin").with_file_size(1000)).await.unwrap();

        batch.update_progress_of_download_url(A, 300);
        batch.update_progress_of_download_url(A, 700);
        assert_eq!(batch.bytes_received_since_start(), 700);

        // duplicate callback adds nothing
        batch.update_progress_of_download_url(A, 700);
        assert_eq!(batch.bytes_received_since_start(), 700);
        assert_eq!(batch.task(0).unwrap().bytes_written, 700);

        assert_eq!(batch.update_progress_of_download_url("http://example.com/other", 5), None);
    }

    #[tokio::test]
    async fn complete_status_requires_every_task() {
        let root = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let mut batch = batch(&root);
        batch.add_task(&TaskDescriptor::new(A, "a.bin").with_file_size(3)).await.unwrap();
        batch.add_task(&TaskDescriptor::new(B, "b.bin").with_file_size(3)).await.unwrap();
        assert!(!batch.update_complete_status());

        let file = staged(&staging, "a", b"abc").await;
        assert!(batch.handle_download_file_at(&file, A).await);
        assert!(!batch.is_completed());

        let file = staged(&staging, "b", b"abc").await;
        assert!(batch.handle_download_file_at(&file, B).await);
        assert!(batch.is_completed());
        assert!(batch.take_completion_notice());
        assert!(!batch.take_completion_notice());
    }

    #[tokio::test]
    async fn rejected_file_forces_full_totals_without_completion() {
        let root = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let mut batch = batch(&root);
        batch.add_task(&TaskDescriptor::new(A, "a.bin").with_file_size(1000)).await.unwrap();
        batch
            .add_task(&TaskDescriptor::new(B, "b.bin").with_file_size(2000).with_checksum("deadbeef"))
            .await
            .unwrap();

        batch.update_progress_of_download_url(A, 1000);
        let file = staged(&staging, "a", &[0u8; 1000]).await;
        assert!(batch.handle_download_file_at(&file, A).await);

        let file = staged(&staging, "b", &[1u8; 2000]).await;
        assert!(!batch.handle_download_file_at(&file, B).await);

        assert_eq!(batch.task(1).unwrap().bytes_written, 2000);
        assert_eq!(batch.total_bytes_written_and_received(), ByteTotals { downloaded: 3000, expected: 3000 });
        assert!(!batch.update_complete_status());
    }

    #[tokio::test]
    async fn handle_file_replaces_stale_destination() {
        let root = TempDir::new().unwrap();
        let staging = TempDir::new().unwrap();
        let mut batch = batch(&root);
        batch.add_task(&TaskDescriptor::new(A, "a.bin").with_file_size(3)).await.unwrap();
        tokio::fs::write(root.path().join("a.bin"), b"old-and-long").await.unwrap();

        let file = staged(&staging, "a", b"new").await;
        assert!(batch.handle_download_file_at(&file, A).await);
        assert_eq!(tokio::fs::read(root.path().join("a.bin")).await.unwrap(), b"new");
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn missing_arrival_is_a_rejection() {
        let root = TempDir::new().unwrap();
        let mut batch = batch(&root);
        batch.add_task(&TaskDescriptor::new(A, "a.bin").with_file_size(3)).await.unwrap();
        assert!(!batch.handle_download_file_at(Path::new("/nonexistent/odm-file"), A).await);
        assert!(!batch.handle_download_file_at(Path::new("/nonexistent/odm-file"), B).await);
    }

    #[tokio::test]
    async fn start_requires_a_session() {
        let root = TempDir::new().unwrap();
        let mut batch = batch(&root);
        batch.add_task(&TaskDescriptor::new(A, "a.bin").with_file_size(3)).await.unwrap();
        assert!(!batch.is_downloading());
        assert!(matches!(batch.start_download_task(0).await, Err(BatchError::NotBound)));
    }

    #[tokio::test]
    async fn start_looks_up_unknown_sizes_then_transfers() {
        let root = TempDir::new().unwrap();
        let (transport, _events) = MemoryTransport::new();
        transport.set_probe_size(A, Some(4096)).await;

        let mut batch = batch(&root);
        batch.add_task(&TaskDescriptor::new(A, "a.bin")).await.unwrap();
        batch.add_task(&TaskDescriptor::new(B, "b.bin").with_file_size(10)).await.unwrap();
        batch.set_downloading_session(Arc::new(transport.clone()));

        assert_eq!(batch.continue_all_incomplete_download_tasks().await.unwrap(), 2);

        assert_eq!(
            transport.calls().await,
            vec![
                TransportCall::Probe(A.to_string()),
                TransportCall::Start { url: A.to_string(), timeout: REQUEST_TIMEOUT },
                TransportCall::Start { url: B.to_string(), timeout: REQUEST_TIMEOUT },
            ]
        );
        assert_eq!(batch.task(0).unwrap().expected_size, 4096);
        assert!(batch.task(0).unwrap().is_downloading);
    }

    #[tokio::test]
    async fn continue_keeps_going_past_a_refused_start() {
        let root = TempDir::new().unwrap();
        let (transport, _events) = MemoryTransport::new();
        let refusal = TransportError::new(TransportErrorKind::BadServerResponse, "refused");
        transport.fail_starts_for(A, refusal.clone()).await;

        let mut batch = batch(&root);
        batch.add_task(&TaskDescriptor::new(A, "a.bin").with_file_size(10)).await.unwrap();
        batch.add_task(&TaskDescriptor::new(B, "b.bin").with_file_size(10)).await.unwrap();
        batch.set_downloading_session(Arc::new(transport.clone()));

        assert_eq!(batch.continue_all_incomplete_download_tasks().await.unwrap(), 1);
        assert_eq!(transport.started_urls().await, vec![A.to_string(), B.to_string()]);
        assert_eq!(batch.task(0).unwrap().download_error, Some(refusal));
        assert_eq!(batch.task(0).unwrap().status(), TaskStatus::Failed { resumable: false });
        assert_eq!(batch.task(1).unwrap().status(), TaskStatus::Transferring);
    }

    #[tokio::test]
    async fn continue_needs_a_session() {
        let root = TempDir::new().unwrap();
        let mut batch = batch(&root);
        batch.add_task(&TaskDescriptor::new(A, "a.bin").with_file_size(10)).await.unwrap();
        assert!(matches!(batch.continue_all_incomplete_download_tasks().await, Err(BatchError::NotBound)));
    }

    #[tokio::test]
    async fn late_size_is_dropped_once_the_task_moved_on() {
        let root = TempDir::new().unwrap();
        let (transport, _events) = MemoryTransport::new();
        let mut batch = batch(&root);
        batch.add_task(&TaskDescriptor::new(A, "a.bin")).await.unwrap();
        batch.set_downloading_session(Arc::new(transport));

        assert!(batch.needs_size(0).unwrap());
        let url = batch.begin_size_lookup(0).unwrap();
        assert_eq!(batch.task(0).unwrap().status(), TaskStatus::Probing);
        assert!(!batch.finish_size_lookup(0, B, Ok(Some(5))));

        batch
            .task_mut(0)
            .unwrap()
            .capture_received_error(TransportError::new(TransportErrorKind::TimedOut, "slow"));
        assert!(!batch.finish_size_lookup(0, &url, Ok(Some(5))));
        assert_eq!(batch.task(0).unwrap().expected_size, 0);
    }

    #[tokio::test]
    async fn suspend_and_resume_show_in_task_status() {
        let root = TempDir::new().unwrap();
        let (transport, _events) = MemoryTransport::new();
        let mut batch = batch(&root);
        batch.add_task(&TaskDescriptor::new(A, "a.bin").with_file_size(10)).await.unwrap();
        batch.set_downloading_session(Arc::new(transport));
        batch.start_download_task(0).await.unwrap();

        assert_eq!(batch.suspend_all_ongoing_download_tasks().await, 1);
        assert_eq!(batch.task(0).unwrap().status(), TaskStatus::Suspended);
        assert!(batch.task(0).unwrap().is_downloading);

        assert_eq!(batch.resume_all_suspended_tasks().await, 1);
        assert_eq!(batch.task(0).unwrap().status(), TaskStatus::Transferring);
    }

    #[tokio::test]
    async fn download_request_resumes_from_token() {
        let root = TempDir::new().unwrap();
        let (transport, _events) = MemoryTransport::new();
        let mut batch = batch(&root);
        batch.add_task(&TaskDescriptor::new(A, "a.bin").with_file_size(100)).await.unwrap();
        batch.set_downloading_session(Arc::new(transport.clone()));

        let token = ResumeToken { url: A.into(), partial_path: root.path().join("1.odm-part"), offset: 40 };
        batch.task_mut(0).unwrap().capture_received_error(
            TransportError::new(TransportErrorKind::NetworkConnectionLost, "lost").with_resume_token(token.clone()),
        );

        batch.download_request(0).await.unwrap();
        assert_eq!(transport.calls().await, vec![TransportCall::StartFromResumeToken(token)]);
        let task = batch.task(0).unwrap();
        assert!(task.download_error.is_none());
        assert!(task.is_downloading);
    }

    #[tokio::test]
    async fn redownload_without_token_starts_from_zero() {
        let root = TempDir::new().unwrap();
        let (transport, _events) = MemoryTransport::new();
        let mut batch = batch(&root);
        batch.add_task(&TaskDescriptor::new(A, "a.bin").with_file_size(100)).await.unwrap();
        batch.set_downloading_session(Arc::new(transport.clone()));
        batch.update_progress_of_download_url(A, 60);
        batch
            .task_mut(0)
            .unwrap()
            .capture_received_error(TransportError::new(TransportErrorKind::BadServerResponse, "500"));

        batch.redownload_request_of_task(0).await.unwrap();
        let task = batch.task(0).unwrap();
        assert_eq!(task.bytes_written, 0);
        assert!(task.download_error.is_none());
        assert_eq!(transport.started_urls().await, vec![A.to_string()]);
    }

    #[tokio::test]
    async fn redownload_with_token_keeps_partial_progress() {
        let root = TempDir::new().unwrap();
        let (transport, _events) = MemoryTransport::new();
        let mut batch = batch(&root);
        batch.add_task(&TaskDescriptor::new(A, "a.bin").with_file_size(100)).await.unwrap();
        batch.set_downloading_session(Arc::new(transport.clone()));

        let token = ResumeToken { url: A.into(), partial_path: root.path().join("1.odm-part"), offset: 25 };
        batch.task_mut(0).unwrap().capture_received_error(
            TransportError::new(TransportErrorKind::TimedOut, "slow").with_resume_token(token.clone()),
        );

        batch.redownload_request_of_task(0).await.unwrap();
        assert_eq!(batch.task(0).unwrap().bytes_written, 25);
        assert_eq!(transport.calls().await, vec![TransportCall::StartFromResumeToken(token)]);
    }

    #[tokio::test]
    async fn capture_backfills_unknown_sizes() {
        let root = TempDir::new().unwrap();
        let (transport, _events) = MemoryTransport::new();
        let mut batch = batch(&root);
        batch.add_task(&TaskDescriptor::new(A, "a.bin")).await.unwrap();
        batch.add_task(&TaskDescriptor::new(B, "b.bin").with_file_size(50)).await.unwrap();

        let id = transport.insert_transfer(A, TransferState::Running, 10, 80).await;
        let transfers = transport.transfers().await;
        assert_eq!(batch.capture_downloading_info_of_download_task(&transfers[0]), Some(0));
        let task = batch.task(0).unwrap();
        assert_eq!((task.bytes_written, task.expected_size), (10, 80));

        let other = NativeTransfer { id, url: B.into(), state: TransferState::Running, bytes_received: 5, bytes_expected: 999 };
        batch.capture_downloading_info_of_download_task(&other);
        assert_eq!(batch.task(1).unwrap().expected_size, 50);
    }

    #[tokio::test]
    async fn suspend_and_resume_ignore_foreign_transfers() {
        let root = TempDir::new().unwrap();
        let (transport, _events) = MemoryTransport::new();
        let mut batch = batch(&root);
        batch.add_task(&TaskDescriptor::new(A, "a.bin").with_file_size(10)).await.unwrap();

        let ours = transport.insert_transfer(A, TransferState::Running, 0, 10).await;
        let foreign = transport.insert_transfer("http://other.example.com/x", TransferState::Running, 0, 10).await;
        batch.set_downloading_session(Arc::new(transport.clone()));

        assert_eq!(batch.suspend_all_ongoing_download_tasks().await, 1);
        assert_eq!(batch.resume_all_suspended_tasks().await, 1);
        assert_eq!(
            transport.calls().await,
            vec![TransportCall::Suspend(ours), TransportCall::Resume(ours)]
        );
        assert!(!transport.calls().await.contains(&TransportCall::Suspend(foreign)));
    }

    #[tokio::test]
    async fn rate_is_zero_until_bound() {
        let root = TempDir::new().unwrap();
        let (transport, _events) = MemoryTransport::new();
        let mut batch = batch(&root);
        batch.add_task(&TaskDescriptor::new(A, "a.bin").with_file_size(10_000)).await.unwrap();
        batch.update_progress_of_download_url(A, 5000);
        assert_eq!(batch.download_rate(), 0);

        batch.set_downloading_session(Arc::new(transport));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(batch.download_rate() > 0);
    }
}
