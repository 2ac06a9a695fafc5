// src/config.rs

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::batch::REQUEST_TIMEOUT;
use crate::models::HashAlgorithm;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid json in {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Options for a [`DownloadManager`](crate::manager::DownloadManager).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ManagerConfig {
    /// Descriptor destinations are resolved against this directory.
    pub download_root: PathBuf,
    pub hash_algorithm: HashAlgorithm,
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
    /// How many times a transfer is restarted after its file fails
    /// verification before the task is given up on.
    pub max_verification_restarts: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            download_root: PathBuf::from("downloads"),
            hash_algorithm: HashAlgorithm::Sha1,
            request_timeout: REQUEST_TIMEOUT,
            max_verification_restarts: 3,
        }
    }
}

/// Options for the HTTP transport session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HttpTransportConfig {
    /// Where partial `.odm-part` files live until they are handed over.
    pub temp_dir: PathBuf,
    /// SQLite file holding resume records. `None` keeps them in memory only.
    pub state_db: Option<PathBuf>,
    /// Cap on simultaneously running transfers. `None` means unbounded.
    pub max_concurrent_transfers: Option<usize>,
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpTransportConfig {
    fn default() -> Self {
        Self {
            temp_dir: std::env::temp_dir().join("odm-batch"),
            state_db: None,
            max_concurrent_transfers: None,
            connect_timeout: Duration::from_secs(30),
            user_agent: format!("odm-batch/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// Everything the binary can read from one file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub manager: ManagerConfig,
    pub transport: HttpTransportConfig,
}

/// Reads and deserializes a JSON file.
pub async fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let raw = tokio::fs::read_to_string(path).await.map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom("duration must be a non-negative number of seconds"));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}
