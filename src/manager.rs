// src/manager.rs

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::batch::{BatchError, DownloadBatch};
use crate::config::ManagerConfig;
use crate::format::{format_rate, format_time_from_seconds};
use crate::models::{HashAlgorithm, TaskDescriptor};
use crate::observer::{DataHooks, DataObserver, Observers, UiDispatcher, UiHooks, UiObserver};
use crate::reachability::{Reachability, ReachabilityTracker};
use crate::task::DownloadTask;
use crate::transport::{TransferState, Transport, TransportEvent, TransportEvents};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("batch error: {0}")]
    Batch(#[from] BatchError),
    #[error("no batch has been added")]
    NoCurrentBatch,
}

/// Throughput and time-to-finish for the current batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateReport {
    pub bytes_per_second: u64,
    /// e.g. `1.2 MB/s`
    pub rate: String,
    pub remaining_seconds: Option<u64>,
    /// `HH:MM:SS`, or `Unknown` while nothing has been received.
    pub remaining: String,
}

/// A task whose transfer waits on its size being looked up.
struct SizeLookup {
    position: usize,
    url: String,
}

struct ManagerState {
    current_batch: Option<DownloadBatch>,
    initial_downloaded_bytes: u64,
    total_bytes: u64,
    hash_algorithm: HashAlgorithm,
    observers: Observers,
    reachability: ReachabilityTracker,
}

/// Binds one current batch to the shared transport session and turns
/// session events into task updates and observer notifications.
///
/// Cloning is cheap; clones share state. Every mutation of the batch happens
/// under one lock, so events are applied one at a time. Size lookups run
/// outside the lock.
#[derive(Clone)]
pub struct DownloadManager {
    state: Arc<Mutex<ManagerState>>,
    transport: Arc<dyn Transport>,
    config: Arc<ManagerConfig>,
}

impl DownloadManager {
    pub fn new(config: ManagerConfig, transport: Arc<dyn Transport>) -> Self {
        let state = ManagerState {
            current_batch: None,
            initial_downloaded_bytes: 0,
            total_bytes: 0,
            hash_algorithm: config.hash_algorithm,
            observers: Observers::default(),
            reachability: ReachabilityTracker::new(),
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            transport,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Bytes downloaded before this process started, counted into overall
    /// progress.
    pub async fn set_initial_downloaded_bytes(&self, bytes: u64) {
        self.state.lock().await.initial_downloaded_bytes = bytes;
    }

    /// Overrides the overall-progress denominator. 0 restores the sum of
    /// expected sizes.
    pub async fn set_total_bytes(&self, bytes: u64) {
        self.state.lock().await.total_bytes = bytes;
    }

    /// Algorithm applied to batches created after this call.
    pub async fn set_hash_algorithm(&self, algorithm: HashAlgorithm) {
        self.state.lock().await.hash_algorithm = algorithm;
    }

    pub async fn set_ui_observer(&self, observer: Arc<dyn UiObserver>, hooks: UiHooks, dispatcher: UiDispatcher) {
        self.state.lock().await.observers.set_ui(observer, hooks, dispatcher);
    }

    pub async fn set_data_observer(&self, observer: Arc<dyn DataObserver>, hooks: DataHooks) {
        self.state.lock().await.observers.set_data(observer, hooks);
    }

    fn new_batch(&self, hash_algorithm: HashAlgorithm) -> DownloadBatch {
        DownloadBatch::new(self.config.download_root.clone(), hash_algorithm)
            .with_request_timeout(self.config.request_timeout)
    }

    /// Replaces the current batch with one built from `descriptors`. Nothing
    /// is started. Invalid and duplicate descriptors are skipped.
    ///
    /// Transfers still running for a replaced batch are left alone.
    pub async fn add_batch(&self, descriptors: &[TaskDescriptor]) -> Vec<DownloadTask> {
        let hash_algorithm = self.state.lock().await.hash_algorithm;
        let mut batch = self.new_batch(hash_algorithm);
        for descriptor in descriptors {
            match batch.add_task(descriptor).await {
                Ok(Some(_)) => {}
                Ok(None) => debug!("Manager: duplicate descriptor for {} skipped", descriptor.url),
                Err(e) => warn!("Manager: descriptor for {:?} rejected: {}", descriptor.url, e),
            }
        }
        let tasks = batch.tasks().to_vec();

        let mut state = self.state.lock().await;
        if let Some(previous) = state.current_batch.replace(batch) {
            info!("Manager: replaced batch of {} tasks", previous.len());
        }
        info!("Manager: added batch with {} tasks", tasks.len());
        tasks
    }

    /// [`add_batch`](Self::add_batch) followed by
    /// [`start_downloading_current_batch`](Self::start_downloading_current_batch).
    pub async fn download_batch(&self, descriptors: &[TaskDescriptor]) -> Vec<DownloadTask> {
        self.add_batch(descriptors).await;
        self.start_downloading_current_batch().await;
        self.downloading_tasks().await
    }

    /// Adds one task to the current batch, creating the batch if needed.
    ///
    /// A task whose file is already verified on disk reports completion before
    /// this returns; otherwise it is started right away when the batch is
    /// already bound to the session.
    pub async fn add_download_task(&self, descriptor: &TaskDescriptor) -> Result<Option<DownloadTask>, ManagerError> {
        let mut guard = self.state.lock().await;
        let hash_algorithm = guard.hash_algorithm;
        let ManagerState {
            current_batch,
            observers,
            initial_downloaded_bytes,
            total_bytes,
            ..
        } = &mut *guard;
        let batch = current_batch.get_or_insert_with(|| self.new_batch(hash_algorithm));

        let Some(position) = batch.add_task(descriptor).await?.map(|task| task.position) else {
            return Ok(None);
        };

        let mut lookup = None;
        let completed = batch.task(position).is_some_and(|task| task.completed);
        if completed {
            if let Some(task) = batch.task(position) {
                observers.post_task_complete(task);
            }
            refresh_and_post_task_progress(batch, observers, position);
        } else if batch.is_downloading() {
            lookup = start_or_report(batch, observers, position).await;
        }

        batch.update_complete_status();
        observers.post_progress(overall_progress_of(batch, *initial_downloaded_bytes, *total_bytes));
        if batch.take_completion_notice() {
            observers.post_complete_all();
        }
        let task = batch.task(position).cloned();
        drop(guard);

        self.spawn_size_lookups(lookup);
        Ok(task)
    }

    /// Binds the session, adopts transfers it already holds for our URLs
    /// (resuming suspended ones) and starts every other incomplete task.
    pub async fn start_downloading_current_batch(&self) {
        let mut guard = self.state.lock().await;
        let ManagerState {
            current_batch,
            observers,
            initial_downloaded_bytes,
            total_bytes,
            ..
        } = &mut *guard;
        let Some(batch) = current_batch.as_mut() else {
            debug!("Manager: no batch to start");
            return;
        };

        batch.set_downloading_session(self.transport.clone());
        let live: Vec<_> = self
            .transport
            .transfers()
            .await
            .into_iter()
            .filter(|t| t.state != TransferState::Completed)
            .collect();

        let mut lookups = Vec::new();
        for position in 0..batch.len() {
            let mut in_flight = false;
            for transfer in &live {
                if batch.task(position).is_some_and(|task| task.url == transfer.url)
                    && batch.capture_downloading_info_of_download_task(transfer).is_some()
                {
                    debug!("Manager: adopted transfer {} for {}", transfer.id, transfer.url);
                    if transfer.state == TransferState::Suspended {
                        self.transport.resume(transfer.id).await;
                        if let Some(task) = batch.task_mut(position) {
                            task.is_suspended = false;
                        }
                        info!("Manager: resumed restored transfer {} for {}", transfer.id, transfer.url);
                    }
                    refresh_and_post_task_progress(batch, observers, position);
                    in_flight = true;
                }
            }

            let completed = batch.task(position).is_some_and(|task| task.completed);
            if completed {
                if let Some(task) = batch.task(position) {
                    observers.post_task_complete(task);
                }
                refresh_and_post_task_progress(batch, observers, position);
            } else if !in_flight {
                lookups.extend(start_or_report(batch, observers, position).await);
            }
        }

        batch.update_complete_status();
        observers.post_progress(overall_progress_of(batch, *initial_downloaded_bytes, *total_bytes));
        if batch.take_completion_notice() {
            observers.post_complete_all();
        }
        drop(guard);

        self.spawn_size_lookups(lookups);
    }

    /// Resumes the current batch's suspended transfers.
    pub async fn continue_incompleted_downloads(&self) -> usize {
        match self.state.lock().await.current_batch.as_mut() {
            Some(batch) => batch.resume_all_suspended_tasks().await,
            None => 0,
        }
    }

    /// Suspends the current batch's running transfers.
    pub async fn suspend_all_ongoing_downloads(&self) -> usize {
        match self.state.lock().await.current_batch.as_mut() {
            Some(batch) => batch.suspend_all_ongoing_download_tasks().await,
            None => 0,
        }
    }

    /// Restarts every task that holds a transport error or was given up on.
    pub async fn retry_failed_downloads(&self) -> usize {
        self.redownload_where(|task| task.download_error.is_some() || task.gave_up)
            .await
    }

    async fn retry_offline_failures(&self) -> usize {
        self.redownload_where(DownloadTask::is_hitting_error_because_offline).await
    }

    async fn redownload_where(&self, predicate: impl Fn(&DownloadTask) -> bool) -> usize {
        let mut guard = self.state.lock().await;
        let ManagerState { current_batch, observers, .. } = &mut *guard;
        let Some(batch) = current_batch.as_mut() else {
            return 0;
        };
        if !batch.is_downloading() {
            return 0;
        }

        let positions: Vec<usize> = batch
            .tasks()
            .iter()
            .filter(|task| !task.completed && predicate(task))
            .map(|task| task.position)
            .collect();
        let mut restarted = 0;
        let mut lookups = Vec::new();
        for position in positions {
            match restart_task(batch, position).await {
                Ok(lookup) => {
                    lookups.extend(lookup);
                    restarted += 1;
                }
                Err(e) => {
                    warn!("Manager: retry of task {} failed: {}", position, e);
                    if let Some(task) = batch.task(position) {
                        observers.post_task_error(task);
                    }
                }
            }
        }
        drop(guard);

        self.spawn_size_lookups(lookups);
        restarted
    }

    /// Restarts one task by position.
    pub async fn retry_task(&self, position: usize) -> Result<(), ManagerError> {
        let lookup = {
            let mut state = self.state.lock().await;
            let batch = state.current_batch.as_mut().ok_or(ManagerError::NoCurrentBatch)?;
            restart_task(batch, position).await?
        };
        self.spawn_size_lookups(lookup);
        Ok(())
    }

    /// Cancels every transfer of the current batch on the session.
    pub async fn cancel_all_outstanding_tasks(&self) -> usize {
        match self.state.lock().await.current_batch.as_mut() {
            Some(batch) => batch.cancel_all_transfers().await,
            None => 0,
        }
    }

    pub async fn overall_progress(&self) -> f32 {
        let state = self.state.lock().await;
        match &state.current_batch {
            Some(batch) => overall_progress_of(batch, state.initial_downloaded_bytes, state.total_bytes),
            None => 0.0,
        }
    }

    pub async fn download_rate_and_remaining_time(&self) -> Option<RateReport> {
        let state = self.state.lock().await;
        let batch = state.current_batch.as_ref()?;
        let bytes_per_second = batch.download_rate();

        let remaining_seconds = if bytes_per_second == 0 {
            None
        } else {
            let totals = batch.total_bytes_written_and_received();
            let total = if state.total_bytes == 0 { totals.expected } else { state.total_bytes };
            let downloaded = totals.downloaded + state.initial_downloaded_bytes;
            Some(total.saturating_sub(downloaded) / bytes_per_second)
        };

        Some(RateReport {
            bytes_per_second,
            rate: format_rate(bytes_per_second),
            remaining_seconds,
            remaining: remaining_seconds
                .map(format_time_from_seconds)
                .unwrap_or_else(|| "Unknown".to_string()),
        })
    }

    /// True while a batch exists that has not completed.
    pub async fn is_downloading(&self) -> bool {
        self.state
            .lock()
            .await
            .current_batch
            .as_ref()
            .is_some_and(|batch| !batch.is_completed())
    }

    pub async fn downloading_tasks(&self) -> Vec<DownloadTask> {
        self.state
            .lock()
            .await
            .current_batch
            .as_ref()
            .map(|batch| batch.tasks().to_vec())
            .unwrap_or_default()
    }

    /// Applies one session callback.
    pub async fn handle_transport_event(&self, event: TransportEvent) {
        let lookup = {
            let mut state = self.state.lock().await;
            self.apply_event(&mut state, event).await
        };
        self.spawn_size_lookups(lookup);
    }

    async fn apply_event(&self, state: &mut ManagerState, event: TransportEvent) -> Option<SizeLookup> {
        let ManagerState {
            current_batch,
            observers,
            initial_downloaded_bytes,
            total_bytes,
            ..
        } = state;
        let Some(batch) = current_batch.as_mut() else {
            debug!("Manager: event for {} with no current batch", event.url());
            return None;
        };

        match event {
            TransportEvent::Progress { url, total_bytes_written, .. } => {
                if let Some(position) = batch.update_progress_of_download_url(&url, total_bytes_written) {
                    observers.post_progress(overall_progress_of(batch, *initial_downloaded_bytes, *total_bytes));
                    refresh_and_post_task_progress(batch, observers, position);
                }
            }
            TransportEvent::Resumed { url, offset, .. } => {
                debug!("Manager: {} resumed at byte {}", url, offset);
            }
            TransportEvent::Failed { url, error } => {
                let Some(position) = batch.position_of_url(&url) else {
                    return None;
                };
                warn!("Manager: transfer of {} failed: {}", url, error);
                if let Some(task) = batch.task_mut(position) {
                    task.capture_received_error(error);
                    observers.post_task_error(task);
                }
            }
            TransportEvent::Finished { url, location } => {
                let Some(position) = batch.position_of_url(&url) else {
                    debug!("Manager: ignoring finished transfer {} - not in current batch", url);
                    return None;
                };
                if batch.task(position).is_some_and(|task| task.completed) {
                    debug!("Manager: {} already verified, ignoring repeated finish", url);
                    return None;
                }

                if batch.handle_download_file_at(&location, &url).await {
                    if let Some(task) = batch.task(position) {
                        observers.post_task_complete(task);
                    }
                    refresh_and_post_task_progress(batch, observers, position);
                    observers.post_progress(overall_progress_of(batch, *initial_downloaded_bytes, *total_bytes));
                    if batch.take_completion_notice() {
                        info!("Manager: batch complete");
                        observers.post_complete_all();
                    }
                    return None;
                }

                let max_restarts = self.config.max_verification_restarts;
                let exhausted = match batch.task_mut(position) {
                    Some(task) => {
                        task.verification_failures += 1;
                        task.verification_failures > max_restarts
                    }
                    None => return None,
                };

                let mut lookup = None;
                if exhausted {
                    if let Some(task) = batch.task_mut(position) {
                        task.gave_up = true;
                        warn!(
                            "Manager: giving up on {} after {} failed verifications",
                            task.url, task.verification_failures
                        );
                        observers.post_task_error(task);
                    }
                } else {
                    if let Some(task) = batch.task_mut(position) {
                        task.clean_up().await;
                    }
                    lookup = start_or_report(batch, observers, position).await;
                }
                observers.post_progress(overall_progress_of(batch, *initial_downloaded_bytes, *total_bytes));
                return lookup;
            }
        }
        None
    }

    fn spawn_size_lookups(&self, lookups: impl IntoIterator<Item = SizeLookup>) {
        for lookup in lookups {
            let manager = self.clone();
            tokio::spawn(async move { manager.start_after_size_lookup(lookup).await });
        }
    }

    /// Asks the session for the task's size without holding the lock, then
    /// issues the transfer unless the task stopped waiting meanwhile.
    async fn start_after_size_lookup(&self, lookup: SizeLookup) {
        let size = self.transport.probe_size(&lookup.url).await;

        let mut guard = self.state.lock().await;
        let ManagerState {
            current_batch,
            observers,
            initial_downloaded_bytes,
            total_bytes,
            ..
        } = &mut *guard;
        let Some(batch) = current_batch.as_mut() else {
            return;
        };
        if !batch.finish_size_lookup(lookup.position, &lookup.url, size) {
            debug!("Manager: size of {} arrived after the task moved on", lookup.url);
            return;
        }

        if let Err(e) = batch.download_request(lookup.position).await {
            warn!("Manager: could not start task {}: {}", lookup.position, e);
            if let Some(task) = batch.task(lookup.position) {
                observers.post_task_error(task);
            }
        }
        refresh_and_post_task_progress(batch, observers, lookup.position);
        observers.post_progress(overall_progress_of(batch, *initial_downloaded_bytes, *total_bytes));
    }

    /// Drains a session's event stream until the session drops its sender.
    pub async fn run(&self, mut events: TransportEvents) {
        while let Some(event) = events.recv().await {
            self.handle_transport_event(event).await;
        }
        info!("Manager: transport event stream closed");
    }

    pub fn spawn_event_loop(&self, events: TransportEvents) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move { manager.run(events).await })
    }

    /// Reacts to a connectivity change. Returns false when `reachability`
    /// repeats the previous state.
    ///
    /// Reachable resumes suspended transfers and restarts tasks that failed
    /// because the device was offline; unreachable suspends running ones.
    pub async fn on_reachability_changed(&self, reachability: Reachability) -> bool {
        let edge = self.state.lock().await.reachability.observe(reachability);
        match edge {
            None => false,
            Some(Reachability::Reachable) => {
                let resumed = self.continue_incompleted_downloads().await;
                let restarted = self.retry_offline_failures().await;
                info!("Manager: network reachable, resumed {} and restarted {} transfers", resumed, restarted);
                true
            }
            Some(Reachability::Unreachable) => {
                let suspended = self.suspend_all_ongoing_downloads().await;
                info!("Manager: network unreachable, suspended {} transfers", suspended);
                true
            }
        }
    }

    pub fn watch_reachability(&self, mut changes: mpsc::UnboundedReceiver<Reachability>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(reachability) = changes.recv().await {
                manager.on_reachability_changed(reachability).await;
            }
        })
    }
}

/// `(downloaded + initial) / (override or sum of expected)`; 0 when the
/// denominator is 0.
pub fn overall_progress_of(batch: &DownloadBatch, initial_downloaded_bytes: u64, total_bytes: u64) -> f32 {
    let totals = batch.total_bytes_written_and_received();
    let total = if total_bytes == 0 { totals.expected } else { total_bytes };
    if total == 0 {
        return 0.0;
    }
    (totals.downloaded + initial_downloaded_bytes) as f32 / total as f32
}

fn refresh_and_post_task_progress(batch: &mut DownloadBatch, observers: &Observers, position: usize) {
    if let Some(task) = batch.task_mut(position) {
        task.cached_progress = task.downloading_progress();
        observers.post_task_progress(task);
    }
}

/// Issues the task's transfer, or hands back a lookup when its size is
/// unknown.
async fn start_task(batch: &mut DownloadBatch, position: usize) -> Result<Option<SizeLookup>, BatchError> {
    if batch.needs_size(position)? {
        let url = batch.begin_size_lookup(position)?;
        return Ok(Some(SizeLookup { position, url }));
    }
    batch.download_request(position).await?;
    Ok(None)
}

async fn start_or_report(batch: &mut DownloadBatch, observers: &Observers, position: usize) -> Option<SizeLookup> {
    match start_task(batch, position).await {
        Ok(lookup) => lookup,
        Err(e) => {
            warn!("Manager: could not start task {}: {}", position, e);
            if let Some(task) = batch.task(position) {
                observers.post_task_error(task);
            }
            None
        }
    }
}

async fn restart_task(batch: &mut DownloadBatch, position: usize) -> Result<Option<SizeLookup>, BatchError> {
    match batch.prepare_redownload(position).await? {
        Some(token) => batch.resume_from_token(position, token).await.map(|_| None),
        None => start_task(batch, position).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryTransport;
    use tempfile::TempDir;

    #[tokio::test]
    async fn overall_progress_honours_offset_and_override() {
        let root = TempDir::new().unwrap();
        let mut batch = DownloadBatch::new(root.path(), HashAlgorithm::Sha1);
        assert_eq!(overall_progress_of(&batch, 0, 0), 0.0);

        batch
            .add_task(&TaskDescriptor::new("http://example.com/a", "a").with_file_size(400))
            .await
            .unwrap();
        batch.update_progress_of_download_url("http://example.com/a", 100);

        assert_eq!(overall_progress_of(&batch, 0, 0), 0.25);
        assert_eq!(overall_progress_of(&batch, 100, 0), 0.5);
        assert_eq!(overall_progress_of(&batch, 100, 800), 0.25);
    }

    #[tokio::test]
    async fn empty_manager_reports_nothing() {
        let (transport, _events) = MemoryTransport::new();
        let manager = DownloadManager::new(ManagerConfig::default(), Arc::new(transport));
        assert_eq!(manager.overall_progress().await, 0.0);
        assert!(!manager.is_downloading().await);
        assert!(manager.download_rate_and_remaining_time().await.is_none());
        assert_eq!(manager.continue_incompleted_downloads().await, 0);
        assert!(matches!(manager.retry_task(0).await, Err(ManagerError::NoCurrentBatch)));
    }
}
