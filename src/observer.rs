//! Observer contracts and the UI-affinity dispatcher.
//!
//! Each observer has one required method (a trait) and a record of optional
//! hooks. UI calls never run inline: they are queued on a [`UiDispatcher`],
//! which executes them in order on its own task. Data observer calls run
//! directly in the context that handles transport events.

use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::task::DownloadTask;

/// The presentation-side observer.
pub trait UiObserver: Send + Sync + 'static {
    /// Every task of the batch verified.
    fn on_all_complete(&self);
}

/// The business-logic observer.
pub trait DataObserver: Send + Sync + 'static {
    /// Every task of the batch verified.
    fn on_all_complete_for_business_logic(&self);
}

pub type ProgressHook = Arc<dyn Fn(f32) + Send + Sync>;
pub type TaskHook = Arc<dyn Fn(&DownloadTask) + Send + Sync>;
pub type TaskProgressHook = Arc<dyn Fn(f32, &DownloadTask) + Send + Sync>;

/// Optional UI callbacks. Unset hooks are skipped.
#[derive(Clone, Default)]
pub struct UiHooks {
    pub on_aggregate_progress: Option<ProgressHook>,
    pub on_task_error: Option<TaskHook>,
    pub on_task_complete: Option<TaskHook>,
    pub on_task_progress: Option<TaskProgressHook>,
}

impl UiHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_aggregate_progress(mut self, hook: impl Fn(f32) + Send + Sync + 'static) -> Self {
        self.on_aggregate_progress = Some(Arc::new(hook));
        self
    }

    pub fn on_task_error(mut self, hook: impl Fn(&DownloadTask) + Send + Sync + 'static) -> Self {
        self.on_task_error = Some(Arc::new(hook));
        self
    }

    pub fn on_task_complete(mut self, hook: impl Fn(&DownloadTask) + Send + Sync + 'static) -> Self {
        self.on_task_complete = Some(Arc::new(hook));
        self
    }

    pub fn on_task_progress(mut self, hook: impl Fn(f32, &DownloadTask) + Send + Sync + 'static) -> Self {
        self.on_task_progress = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for UiHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UiHooks")
            .field("on_aggregate_progress", &self.on_aggregate_progress.is_some())
            .field("on_task_error", &self.on_task_error.is_some())
            .field("on_task_complete", &self.on_task_complete.is_some())
            .field("on_task_progress", &self.on_task_progress.is_some())
            .finish()
    }
}

/// Optional data-observer callbacks.
#[derive(Clone, Default)]
pub struct DataHooks {
    pub on_task_complete: Option<TaskHook>,
}

impl DataHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_task_complete(mut self, hook: impl Fn(&DownloadTask) + Send + Sync + 'static) -> Self {
        self.on_task_complete = Some(Arc::new(hook));
        self
    }
}

type UiJob = Box<dyn FnOnce() + Send>;

enum UiMessage {
    Run(UiJob),
    Flush(oneshot::Sender<()>),
}

/// A single FIFO execution context for UI callbacks.
#[derive(Clone)]
pub struct UiDispatcher {
    tx: mpsc::UnboundedSender<UiMessage>,
}

impl UiDispatcher {
    /// Spawns the dispatcher loop on the current tokio runtime.
    pub fn spawn() -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<UiMessage>();
        let handle = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    UiMessage::Run(job) => job(),
                    UiMessage::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });
        (Self { tx }, handle)
    }

    pub fn dispatch(&self, job: impl FnOnce() + Send + 'static) {
        if self.tx.send(UiMessage::Run(Box::new(job))).is_err() {
            tracing::debug!("UI dispatcher stopped; dropping notification");
        }
    }

    /// Resolves once everything dispatched before this call has run.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(UiMessage::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

struct UiBinding {
    observer: Arc<dyn UiObserver>,
    hooks: UiHooks,
    dispatcher: UiDispatcher,
}

struct DataBinding {
    observer: Arc<dyn DataObserver>,
    hooks: DataHooks,
}

/// Fan-out to the (at most one) UI observer and (at most one) data observer.
#[derive(Default)]
pub(crate) struct Observers {
    ui: Option<UiBinding>,
    data: Option<DataBinding>,
}

impl Observers {
    pub(crate) fn set_ui(&mut self, observer: Arc<dyn UiObserver>, hooks: UiHooks, dispatcher: UiDispatcher) {
        self.ui = Some(UiBinding { observer, hooks, dispatcher });
    }

    pub(crate) fn set_data(&mut self, observer: Arc<dyn DataObserver>, hooks: DataHooks) {
        self.data = Some(DataBinding { observer, hooks });
    }

    pub(crate) fn post_progress(&self, progress: f32) {
        if let Some(ui) = &self.ui {
            if let Some(hook) = ui.hooks.on_aggregate_progress.clone() {
                ui.dispatcher.dispatch(move || hook(progress));
            }
        }
    }

    pub(crate) fn post_task_progress(&self, task: &DownloadTask) {
        if let Some(ui) = &self.ui {
            if let Some(hook) = ui.hooks.on_task_progress.clone() {
                let task = task.clone();
                ui.dispatcher.dispatch(move || hook(task.cached_progress, &task));
            }
        }
    }

    pub(crate) fn post_task_error(&self, task: &DownloadTask) {
        if let Some(ui) = &self.ui {
            if let Some(hook) = ui.hooks.on_task_error.clone() {
                let task = task.clone();
                ui.dispatcher.dispatch(move || hook(&task));
            }
        }
    }

    /// Data observer first (inline), then the UI observer (queued).
    pub(crate) fn post_task_complete(&self, task: &DownloadTask) {
        if let Some(data) = &self.data {
            if let Some(hook) = &data.hooks.on_task_complete {
                hook(task);
            }
        }
        if let Some(ui) = &self.ui {
            if let Some(hook) = ui.hooks.on_task_complete.clone() {
                let task = task.clone();
                ui.dispatcher.dispatch(move || hook(&task));
            }
        }
    }

    pub(crate) fn post_complete_all(&self) {
        if let Some(data) = &self.data {
            data.observer.on_all_complete_for_business_logic();
        }
        if let Some(ui) = &self.ui {
            let observer = ui.observer.clone();
            ui.dispatcher.dispatch(move || observer.on_all_complete());
        }
    }
}
