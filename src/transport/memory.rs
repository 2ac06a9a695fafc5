//! An in-process transport session.
//!
//! Nothing moves over the network: callers script what the "server" does by
//! pushing progress, failures and finished files, and inspect which commands
//! the engine issued. Used by the test-suite and by embedders that feed bytes
//! from somewhere other than HTTP.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Notify};

use super::{
    NativeTransfer, ResumeToken, TransferId, TransferRequest, TransferState, Transport,
    TransportError, TransportEvent, TransportEventSender, TransportEvents,
};

/// A command the engine issued against the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    Probe(String),
    Start { url: String, timeout: Duration },
    StartFromResumeToken(ResumeToken),
    Suspend(TransferId),
    Resume(TransferId),
    Cancel(TransferId),
}

#[derive(Default)]
struct MemoryState {
    transfers: BTreeMap<TransferId, NativeTransfer>,
    probe_sizes: HashMap<String, Option<u64>>,
    held_sizes: HashMap<String, Arc<Notify>>,
    start_failures: HashMap<String, TransportError>,
    calls: Vec<TransportCall>,
}

/// See the module documentation.
#[derive(Clone)]
pub struct MemoryTransport {
    state: Arc<Mutex<MemoryState>>,
    events: TransportEventSender,
    next_id: Arc<AtomicU64>,
}

impl MemoryTransport {
    pub fn new() -> (Self, TransportEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            events: tx,
            next_id: Arc::new(AtomicU64::new(1)),
        };
        (transport, rx)
    }

    /// Answer future size lookups for `url` with `size`.
    pub async fn set_probe_size(&self, url: &str, size: Option<u64>) {
        self.state.lock().await.probe_sizes.insert(url.to_string(), size);
    }

    /// Keep size lookups for `url` unanswered until
    /// [`release_size_lookup`](Self::release_size_lookup).
    pub async fn hold_size_lookup(&self, url: &str) {
        self.state
            .lock()
            .await
            .held_sizes
            .insert(url.to_string(), Arc::new(Notify::new()));
    }

    pub async fn release_size_lookup(&self, url: &str) {
        if let Some(gate) = self.state.lock().await.held_sizes.remove(url) {
            gate.notify_one();
        }
    }

    /// Refuse every start for `url` with `error`.
    pub async fn fail_starts_for(&self, url: &str, error: TransportError) {
        self.state.lock().await.start_failures.insert(url.to_string(), error);
    }

    /// Register a transfer the session already carries, e.g. one that survived
    /// a relaunch.
    pub async fn insert_transfer(
        &self,
        url: &str,
        state: TransferState,
        bytes_received: u64,
        bytes_expected: u64,
    ) -> TransferId {
        let id = self.allocate_id();
        self.state.lock().await.transfers.insert(
            id,
            NativeTransfer {
                id,
                url: url.to_string(),
                state,
                bytes_received,
                bytes_expected,
            },
        );
        id
    }

    pub async fn calls(&self) -> Vec<TransportCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn clear_calls(&self) {
        self.state.lock().await.calls.clear();
    }

    /// URLs of every fresh or resumed start, in issue order.
    pub async fn started_urls(&self) -> Vec<String> {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter_map(|call| match call {
                TransportCall::Start { url, .. } => Some(url.clone()),
                TransportCall::StartFromResumeToken(token) => Some(token.url.clone()),
                _ => None,
            })
            .collect()
    }

    pub async fn transfer_for_url(&self, url: &str) -> Option<NativeTransfer> {
        self.state
            .lock()
            .await
            .transfers
            .values()
            .find(|t| t.url == url)
            .cloned()
    }

    /// Report bytes received for the live transfer of `url`.
    pub async fn progress(&self, url: &str, total_bytes_written: u64, total_bytes_expected: u64) {
        {
            let mut state = self.state.lock().await;
            if let Some(transfer) = state.transfers.values_mut().find(|t| t.url == url) {
                transfer.bytes_received = total_bytes_written;
                transfer.bytes_expected = total_bytes_expected;
            }
        }
        self.emit(TransportEvent::Progress {
            url: url.to_string(),
            total_bytes_written,
            total_bytes_expected,
        });
    }

    /// End the transfer of `url` with a file already written at `location`.
    pub async fn finish(&self, url: &str, location: PathBuf) {
        self.remove_transfer(url).await;
        self.emit(TransportEvent::Finished {
            url: url.to_string(),
            location,
        });
    }

    /// End the transfer of `url` with an error.
    pub async fn fail(&self, url: &str, error: TransportError) {
        self.remove_transfer(url).await;
        self.emit(TransportEvent::Failed {
            url: url.to_string(),
            error,
        });
    }

    pub fn emit(&self, event: TransportEvent) {
        // The receiver may be gone in tests that drive the manager directly.
        let _ = self.events.send(event);
    }

    fn allocate_id(&self) -> TransferId {
        TransferId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn remove_transfer(&self, url: &str) {
        self.state.lock().await.transfers.retain(|_, t| t.url != url);
    }

    async fn insert_running(&self, url: String, bytes_received: u64) -> TransferId {
        let id = self.allocate_id();
        self.state.lock().await.transfers.insert(
            id,
            NativeTransfer {
                id,
                url,
                state: TransferState::Running,
                bytes_received,
                bytes_expected: 0,
            },
        );
        id
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn probe_size(&self, url: &str) -> Result<Option<u64>, TransportError> {
        let gate = {
            let mut state = self.state.lock().await;
            state.calls.push(TransportCall::Probe(url.to_string()));
            state.held_sizes.get(url).cloned()
        };
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(self.state.lock().await.probe_sizes.get(url).copied().flatten())
    }

    async fn start(&self, request: TransferRequest) -> Result<TransferId, TransportError> {
        {
            let mut state = self.state.lock().await;
            state.calls.push(TransportCall::Start {
                url: request.url.clone(),
                timeout: request.timeout,
            });
            if let Some(error) = state.start_failures.get(&request.url) {
                return Err(error.clone());
            }
        }
        Ok(self.insert_running(request.url, 0).await)
    }

    async fn start_from_resume_token(
        &self,
        token: ResumeToken,
        _timeout: Duration,
    ) -> Result<TransferId, TransportError> {
        self.state
            .lock()
            .await
            .calls
            .push(TransportCall::StartFromResumeToken(token.clone()));
        let id = self.insert_running(token.url.clone(), token.offset).await;
        self.emit(TransportEvent::Resumed {
            url: token.url,
            offset: token.offset,
            expected_total: 0,
        });
        Ok(id)
    }

    async fn suspend(&self, id: TransferId) {
        let mut state = self.state.lock().await;
        state.calls.push(TransportCall::Suspend(id));
        if let Some(transfer) = state.transfers.get_mut(&id) {
            if transfer.state == TransferState::Running {
                transfer.state = TransferState::Suspended;
            }
        }
    }

    async fn resume(&self, id: TransferId) {
        let mut state = self.state.lock().await;
        state.calls.push(TransportCall::Resume(id));
        if let Some(transfer) = state.transfers.get_mut(&id) {
            if transfer.state == TransferState::Suspended {
                transfer.state = TransferState::Running;
            }
        }
    }

    async fn cancel(&self, id: TransferId) {
        let mut state = self.state.lock().await;
        state.calls.push(TransportCall::Cancel(id));
        state.transfers.remove(&id);
    }

    async fn transfers(&self) -> Vec<NativeTransfer> {
        self.state.lock().await.transfers.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn suspend_and_resume_toggle_state() {
        let (transport, _events) = MemoryTransport::new();
        let id = transport
            .start(TransferRequest {
                url: "http://example.com/a".into(),
                timeout: Duration::from_secs(90),
            })
            .await
            .unwrap();

        transport.suspend(id).await;
        assert_eq!(transport.transfers().await[0].state, TransferState::Suspended);
        transport.resume(id).await;
        assert_eq!(transport.transfers().await[0].state, TransferState::Running);
        assert_eq!(transport.started_urls().await, vec!["http://example.com/a".to_string()]);
    }

    #[tokio::test]
    async fn scripted_events_reach_the_receiver() {
        let (transport, mut events) = MemoryTransport::new();
        transport.progress("http://example.com/a", 10, 20).await;
        transport.fail(
            "http://example.com/a",
            TransportError::new(super::super::TransportErrorKind::TimedOut, "slow"),
        )
        .await;

        assert!(matches!(events.recv().await, Some(TransportEvent::Progress { total_bytes_written: 10, .. })));
        assert!(matches!(events.recv().await, Some(TransportEvent::Failed { .. })));
    }

    #[tokio::test]
    async fn held_size_lookup_waits_for_release() {
        let (transport, _events) = MemoryTransport::new();
        transport.set_probe_size("http://example.com/a", Some(42)).await;
        transport.hold_size_lookup("http://example.com/a").await;

        let lookup = tokio::spawn({
            let transport = transport.clone();
            async move { transport.probe_size("http://example.com/a").await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!lookup.is_finished());

        transport.release_size_lookup("http://example.com/a").await;
        assert_eq!(lookup.await.unwrap().unwrap(), Some(42));
    }

    #[tokio::test]
    async fn scripted_start_failure_is_returned() {
        let (transport, _events) = MemoryTransport::new();
        let error = TransportError::new(super::super::TransportErrorKind::BadServerResponse, "nope");
        transport.fail_starts_for("http://example.com/a", error.clone()).await;

        let result = transport
            .start(TransferRequest {
                url: "http://example.com/a".into(),
                timeout: Duration::from_secs(90),
            })
            .await;
        assert_eq!(result, Err(error));
        assert!(transport.transfers().await.is_empty());
    }
}
