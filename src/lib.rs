pub mod batch;
pub mod config;
pub mod format;
pub mod integrity;
pub mod manager;
pub mod models;
pub mod observer;
pub mod reachability;
pub mod state_manager;
pub mod task;
pub mod transport;

/// Convenient type alias exposing common structs.
pub mod prelude {
    pub use crate::batch::{BatchError, DownloadBatch};
    pub use crate::config::{AppConfig, HttpTransportConfig, ManagerConfig};
    pub use crate::manager::{DownloadManager, ManagerError, RateReport};
    pub use crate::models::{HashAlgorithm, TaskDescriptor, TaskStatus, ValidationError};
    pub use crate::observer::{DataHooks, DataObserver, UiDispatcher, UiHooks, UiObserver};
    pub use crate::reachability::Reachability;
    pub use crate::task::DownloadTask;
    pub use crate::transport::http::HttpTransport;
    pub use crate::transport::{Transport, TransportError, TransportErrorKind, TransportEvent};
}
