//! A [`Transport`] that moves bytes over HTTP with reqwest.
//!
//! Each transfer streams into `<temp_dir>/<id>.odm-part`. Suspending stops the
//! worker but keeps the partial file and its offset; resuming continues from
//! there with a `Range` request. With a state database configured, transfers
//! that were running or suspended when the process exited come back as
//! suspended transfers on the next start.

use futures_util::StreamExt;
use reqwest::{header, Client, StatusCode};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    NativeTransfer, ResumeToken, TransferId, TransferRequest, TransferState, Transport, TransportError,
    TransportErrorKind, TransportEvent, TransportEventSender, TransportEvents,
};
use crate::batch::REQUEST_TIMEOUT;
use crate::config::HttpTransportConfig;
use crate::state_manager::{StateError, StateManager, TransferRecord};

const PARTIAL_EXTENSION: &str = "odm-part";

#[derive(Debug, Error)]
pub enum HttpTransportError {
    #[error("http client error: {0}")]
    Client(#[from] reqwest::Error),
    #[error("state error: {0}")]
    State(#[from] StateError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Entry {
    url: String,
    partial_path: PathBuf,
    state: TransferState,
    received: Arc<AtomicU64>,
    expected: Arc<AtomicU64>,
    timeout: Duration,
    worker: Option<Worker>,
}

impl Entry {
    fn record(&self, id: TransferId) -> TransferRecord {
        TransferRecord {
            id: id.0,
            url: self.url.clone(),
            partial_path: self.partial_path.clone(),
            bytes_received: self.received.load(Ordering::SeqCst),
            bytes_expected: self.expected.load(Ordering::SeqCst),
        }
    }
}

struct Job {
    id: TransferId,
    url: String,
    path: PathBuf,
    offset: u64,
    timeout: Duration,
    received: Arc<AtomicU64>,
    expected: Arc<AtomicU64>,
}

enum Outcome {
    Finished,
    Stopped,
}

struct Inner {
    client: Client,
    temp_dir: PathBuf,
    events: TransportEventSender,
    permits: Option<Arc<Semaphore>>,
    transfers: Mutex<HashMap<TransferId, Entry>>,
    next_id: AtomicU64,
    store: Option<StateManager>,
}

/// HTTP session. Cloning shares the session.
#[derive(Clone)]
pub struct HttpTransport {
    inner: Arc<Inner>,
}

impl HttpTransport {
    /// Builds the session and restores persisted transfers as suspended.
    pub async fn new(config: HttpTransportConfig) -> Result<(Self, TransportEvents), HttpTransportError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(&config.user_agent)
            .build()?;
        tokio::fs::create_dir_all(&config.temp_dir).await?;

        let store = match &config.state_db {
            Some(path) => Some(StateManager::new(path).await?),
            None => None,
        };

        let mut transfers = HashMap::new();
        let mut next_id = 1;
        if let Some(store) = &store {
            for record in store.load_all_records().await? {
                next_id = next_id.max(record.id + 1);
                let on_disk = match tokio::fs::metadata(&record.partial_path).await {
                    Ok(meta) => meta.len(),
                    Err(_) => {
                        debug!("HttpTransport: partial file for #{} is gone, dropping record", record.id);
                        store.delete_record(record.id).await?;
                        continue;
                    }
                };
                info!(
                    "HttpTransport: restored transfer #{} for {} at byte {}",
                    record.id, record.url, on_disk
                );
                transfers.insert(
                    TransferId(record.id),
                    Entry {
                        url: record.url,
                        partial_path: record.partial_path,
                        state: TransferState::Suspended,
                        received: Arc::new(AtomicU64::new(on_disk)),
                        expected: Arc::new(AtomicU64::new(record.bytes_expected)),
                        timeout: REQUEST_TIMEOUT,
                        worker: None,
                    },
                );
            }
        }

        let (events, rx) = mpsc::unbounded_channel();
        let inner = Inner {
            client,
            temp_dir: config.temp_dir,
            events,
            permits: config
                .max_concurrent_transfers
                .map(|n| Arc::new(Semaphore::new(n.max(1)))),
            transfers: Mutex::new(transfers),
            next_id: AtomicU64::new(next_id),
            store,
        };
        Ok((Self { inner: Arc::new(inner) }, rx))
    }
}

impl Inner {
    fn allocate_id(&self) -> TransferId {
        TransferId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn persist(&self, record: &TransferRecord) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_record(record).await {
                warn!("HttpTransport: could not persist transfer #{}: {}", record.id, e);
            }
        }
    }

    async fn forget(&self, id: TransferId) {
        if let Some(store) = &self.store {
            if let Err(e) = store.delete_record(id.0).await {
                warn!("HttpTransport: could not delete record #{}: {}", id.0, e);
            }
        }
    }

    async fn launch(
        self: &Arc<Self>,
        id: TransferId,
        url: String,
        path: PathBuf,
        offset: u64,
        timeout: Duration,
    ) -> Result<TransferId, TransportError> {
        tokio::fs::create_dir_all(&self.temp_dir).await.map_err(io_error)?;

        let entry = Entry {
            url: url.clone(),
            partial_path: path.clone(),
            state: TransferState::Running,
            received: Arc::new(AtomicU64::new(offset)),
            expected: Arc::new(AtomicU64::new(0)),
            timeout,
            worker: None,
        };
        self.persist(&entry.record(id)).await;

        let job = Job {
            id,
            url,
            path,
            offset,
            timeout,
            received: entry.received.clone(),
            expected: entry.expected.clone(),
        };
        // The worker only touches the map when it ends, so inserting under the
        // same lock keeps it from finishing before its entry exists.
        let mut transfers = self.transfers.lock().await;
        transfers.insert(id, entry);
        let worker = self.spawn_worker(job);
        if let Some(entry) = transfers.get_mut(&id) {
            entry.worker = Some(worker);
        }
        debug!("HttpTransport: transfer {} started at byte {}", id, offset);
        Ok(id)
    }

    fn spawn_worker(self: &Arc<Self>, job: Job) -> Worker {
        let cancel = CancellationToken::new();
        let inner = self.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { inner.run_worker(job, token).await });
        Worker { cancel, handle }
    }

    async fn run_worker(self: Arc<Self>, job: Job, cancel: CancellationToken) {
        match self.transfer(&job, &cancel).await {
            Ok(Outcome::Stopped) => {
                debug!("HttpTransport: transfer {} stopped", job.id);
            }
            Ok(Outcome::Finished) => {
                self.transfers.lock().await.remove(&job.id);
                self.forget(job.id).await;
                debug!("HttpTransport: transfer {} finished", job.id);
                let _ = self.events.send(TransportEvent::Finished {
                    url: job.url,
                    location: job.path,
                });
            }
            Err(mut error) => {
                self.transfers.lock().await.remove(&job.id);
                self.forget(job.id).await;
                let received = job.received.load(Ordering::SeqCst);
                if received > 0 {
                    error = error.with_resume_token(ResumeToken {
                        url: job.url.clone(),
                        partial_path: job.path.clone(),
                        offset: received,
                    });
                } else {
                    let _ = tokio::fs::remove_file(&job.path).await;
                }
                warn!("HttpTransport: transfer {} of {} failed: {}", job.id, job.url, error);
                let _ = self.events.send(TransportEvent::Failed { url: job.url, error });
            }
        }
    }

    async fn transfer(&self, job: &Job, cancel: &CancellationToken) -> Result<Outcome, TransportError> {
        let _permit = match &self.permits {
            Some(permits) => tokio::select! {
                _ = cancel.cancelled() => return Ok(Outcome::Stopped),
                permit = permits.clone().acquire_owned() => Some(
                    permit.map_err(|_| TransportError::new(TransportErrorKind::Cancelled, "session closed"))?,
                ),
            },
            None => None,
        };

        let mut request = self.client.get(&job.url);
        if job.offset > 0 {
            request = request.header(header::RANGE, format!("bytes={}-", job.offset));
            debug!("HttpTransport: requesting range: bytes={}-", job.offset);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Ok(Outcome::Stopped),
            sent = tokio::time::timeout(job.timeout, request.send()) => {
                sent.map_err(|_| timed_out())?.map_err(|e| classify(&e))?
            }
        };

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::new(
                TransportErrorKind::BadServerResponse,
                format!("server answered {} for {}", status, job.url),
            ));
        }

        let start = if job.offset > 0 && status == StatusCode::PARTIAL_CONTENT {
            job.offset
        } else {
            if job.offset > 0 {
                debug!("HttpTransport: {} ignored the range request, restarting", job.url);
            }
            0
        };
        let expected = response.content_length().map(|len| len + start).unwrap_or(0);
        job.expected.store(expected, Ordering::SeqCst);
        job.received.store(start, Ordering::SeqCst);

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&job.path)
            .await
            .map_err(io_error)?;
        file.set_len(start).await.map_err(io_error)?;
        file.seek(SeekFrom::Start(start)).await.map_err(io_error)?;

        let mut stream = response.bytes_stream();
        let mut received = start;
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    file.flush().await.map_err(io_error)?;
                    return Ok(Outcome::Stopped);
                }
                next = tokio::time::timeout(job.timeout, stream.next()) => next,
            };
            let chunk = match next {
                Err(_) => return Err(timed_out()),
                Ok(None) => break,
                Ok(Some(Err(e))) => return Err(classify(&e)),
                Ok(Some(Ok(chunk))) => chunk,
            };

            file.write_all(&chunk).await.map_err(io_error)?;
            received += chunk.len() as u64;
            job.received.store(received, Ordering::SeqCst);
            let _ = self.events.send(TransportEvent::Progress {
                url: job.url.clone(),
                total_bytes_written: received,
                total_bytes_expected: expected,
            });
        }
        file.flush().await.map_err(io_error)?;

        if received == 0 {
            return Err(TransportError::new(
                TransportErrorKind::ZeroByteResource,
                format!("{} returned no data", job.url),
            ));
        }
        Ok(Outcome::Finished)
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn probe_size(&self, url: &str) -> Result<Option<u64>, TransportError> {
        let response = self
            .inner
            .client
            .head(url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| classify(&e))?;
        if !response.status().is_success() {
            return Err(TransportError::new(
                TransportErrorKind::BadServerResponse,
                format!("server answered {} for {}", response.status(), url),
            ));
        }
        Ok(response
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok()))
    }

    async fn start(&self, request: TransferRequest) -> Result<TransferId, TransportError> {
        let id = self.inner.allocate_id();
        let path = self
            .inner
            .temp_dir
            .join(format!("{}.{}", id.0, PARTIAL_EXTENSION));
        self.inner.launch(id, request.url, path, 0, request.timeout).await
    }

    async fn start_from_resume_token(
        &self,
        token: ResumeToken,
        timeout: Duration,
    ) -> Result<TransferId, TransportError> {
        let on_disk = tokio::fs::metadata(&token.partial_path)
            .await
            .map(|meta| meta.len())
            .unwrap_or(0);
        let offset = token.offset.min(on_disk);
        let id = self.inner.allocate_id();
        let _ = self.inner.events.send(TransportEvent::Resumed {
            url: token.url.clone(),
            offset,
            expected_total: 0,
        });
        self.inner
            .launch(id, token.url, token.partial_path, offset, timeout)
            .await
    }

    async fn suspend(&self, id: TransferId) {
        let worker = {
            let mut transfers = self.inner.transfers.lock().await;
            match transfers.get_mut(&id) {
                Some(entry) if entry.state == TransferState::Running => {
                    entry.state = TransferState::Suspended;
                    entry.worker.take()
                }
                _ => return,
            }
        };
        if let Some(worker) = worker {
            worker.cancel.cancel();
            let _ = worker.handle.await;
        }

        let record = {
            let transfers = self.inner.transfers.lock().await;
            transfers
                .get(&id)
                .filter(|entry| entry.state == TransferState::Suspended)
                .map(|entry| entry.record(id))
        };
        if let Some(record) = record {
            debug!("HttpTransport: transfer {} suspended at byte {}", id, record.bytes_received);
            self.inner.persist(&record).await;
        }
    }

    async fn resume(&self, id: TransferId) {
        let mut transfers = self.inner.transfers.lock().await;
        let Some(entry) = transfers.get_mut(&id) else {
            return;
        };
        if entry.state != TransferState::Suspended {
            return;
        }
        let job = Job {
            id,
            url: entry.url.clone(),
            path: entry.partial_path.clone(),
            offset: entry.received.load(Ordering::SeqCst),
            timeout: entry.timeout,
            received: entry.received.clone(),
            expected: entry.expected.clone(),
        };
        debug!("HttpTransport: transfer {} resuming at byte {}", id, job.offset);
        entry.state = TransferState::Running;
        entry.worker = Some(self.inner.spawn_worker(job));
    }

    async fn cancel(&self, id: TransferId) {
        let Some(mut entry) = self.inner.transfers.lock().await.remove(&id) else {
            return;
        };
        if let Some(worker) = entry.worker.take() {
            worker.cancel.cancel();
            let _ = worker.handle.await;
        }
        let _ = tokio::fs::remove_file(&entry.partial_path).await;
        self.inner.forget(id).await;
        debug!("HttpTransport: transfer {} cancelled", id);
    }

    async fn transfers(&self) -> Vec<NativeTransfer> {
        let transfers = self.inner.transfers.lock().await;
        let mut snapshot: Vec<NativeTransfer> = transfers
            .iter()
            .map(|(id, entry)| NativeTransfer {
                id: *id,
                url: entry.url.clone(),
                state: entry.state,
                bytes_received: entry.received.load(Ordering::SeqCst),
                bytes_expected: entry.expected.load(Ordering::SeqCst),
            })
            .collect();
        snapshot.sort_by_key(|transfer| transfer.id);
        snapshot
    }
}

fn classify(err: &reqwest::Error) -> TransportError {
    let kind = if err.is_timeout() {
        TransportErrorKind::TimedOut
    } else if err.is_connect() {
        TransportErrorKind::NotConnectedToInternet
    } else if err.is_redirect() {
        TransportErrorKind::RedirectToNonExistentLocation
    } else if err.is_body() || err.is_decode() || err.is_request() {
        TransportErrorKind::NetworkConnectionLost
    } else {
        TransportErrorKind::Other
    };
    TransportError::new(kind, err.to_string())
}

fn timed_out() -> TransportError {
    TransportError::new(TransportErrorKind::TimedOut, "The request timed out.")
}

fn io_error(err: std::io::Error) -> TransportError {
    TransportError::new(TransportErrorKind::Io, err.to_string())
}
