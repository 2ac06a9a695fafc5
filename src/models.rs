// src/models.rs

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use url::Url;

/// Digest used to verify a finished file against its checksum.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Md5,
    #[default]
    Sha1,
    Sha256,
    Sha512,
}

/// Errors raised while validating a [`TaskDescriptor`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("descriptor is missing required field `{0}`")]
    MissingField(&'static str),
    #[error("invalid url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("invalid destination `{0}`: must be a relative path inside the download root")]
    InvalidDestination(String),
}

/// The caller-facing description of one file to download.
///
/// Field names follow the JSON shape clients already send (`fileSize`, not
/// `file_size`). Missing `url` or `destination` deserialize to empty strings
/// and are rejected by [`TaskDescriptor::validate`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskDescriptor {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub destination: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
}

impl TaskDescriptor {
    pub fn new(url: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            destination: destination.into(),
            ..Default::default()
        }
    }

    pub fn with_file_size(mut self, size: u64) -> Self {
        self.file_size = Some(size);
        self
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    /// Checks required fields and normalizes the URL to its absolute form.
    pub fn validate(&self) -> Result<ValidatedDescriptor, ValidationError> {
        let raw_url = self.url.trim();
        if raw_url.is_empty() {
            return Err(ValidationError::MissingField("url"));
        }
        let url = Url::parse(raw_url).map_err(|e| ValidationError::InvalidUrl {
            url: raw_url.to_string(),
            reason: e.to_string(),
        })?;
        if url.cannot_be_a_base() {
            return Err(ValidationError::InvalidUrl {
                url: raw_url.to_string(),
                reason: "not a hierarchical url".to_string(),
            });
        }

        if self.destination.trim().is_empty() {
            return Err(ValidationError::MissingField("destination"));
        }
        let destination = PathBuf::from(&self.destination);
        let escapes_root = destination.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if escapes_root || destination.file_name().is_none() {
            return Err(ValidationError::InvalidDestination(self.destination.clone()));
        }

        Ok(ValidatedDescriptor {
            url: url.to_string(),
            destination,
            expected_size: self.file_size.unwrap_or(0),
            checksum: self.checksum.clone().filter(|c| !c.is_empty()),
            identifier: self.identifier.clone(),
        })
    }
}

/// A descriptor that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedDescriptor {
    /// Absolute URL string; the key a batch uses for duplicate detection.
    pub url: String,
    /// Destination relative to the download root.
    pub destination: PathBuf,
    /// 0 when unknown.
    pub expected_size: u64,
    pub checksum: Option<String>,
    pub identifier: Option<String>,
}

impl ValidatedDescriptor {
    pub fn absolute_destination(&self, root: &Path) -> PathBuf {
        root.join(&self.destination)
    }
}

/// Lifecycle of a task as observed by the manager.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskStatus {
    Idle,
    Probing,
    Transferring,
    Suspended,
    Completed,
    Failed { resumable: bool },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_normalizes_url() {
        let validated = TaskDescriptor::new("HTTP://Example.com/a/../file.bin", "dir/file.bin")
            .with_file_size(10)
            .validate()
            .unwrap();
        assert_eq!(validated.url, "http://example.com/file.bin");
        assert_eq!(validated.expected_size, 10);
        assert_eq!(validated.destination, PathBuf::from("dir/file.bin"));
    }

    #[test]
    fn validate_rejects_missing_fields() {
        assert_eq!(
            TaskDescriptor::new("", "a.bin").validate(),
            Err(ValidationError::MissingField("url"))
        );
        assert_eq!(
            TaskDescriptor::new("http://example.com/a", " ").validate(),
            Err(ValidationError::MissingField("destination"))
        );
    }

    #[test]
    fn validate_rejects_malformed_values() {
        assert!(matches!(
            TaskDescriptor::new("not a url", "a.bin").validate(),
            Err(ValidationError::InvalidUrl { .. })
        ));
        assert!(matches!(
            TaskDescriptor::new("mailto:someone@example.com", "a.bin").validate(),
            Err(ValidationError::InvalidUrl { .. })
        ));
        assert!(matches!(
            TaskDescriptor::new("http://example.com/a", "../outside.bin").validate(),
            Err(ValidationError::InvalidDestination(_))
        ));
        assert!(matches!(
            TaskDescriptor::new("http://example.com/a", "/etc/passwd").validate(),
            Err(ValidationError::InvalidDestination(_))
        ));
    }

    #[test]
    fn empty_checksum_means_size_verification() {
        let validated = TaskDescriptor::new("http://example.com/a", "a.bin")
            .with_checksum("")
            .validate()
            .unwrap();
        assert_eq!(validated.checksum, None);
    }

    #[test]
    fn descriptor_deserializes_camel_case() {
        let json = r#"{"url":"http://example.com/a","destination":"a.bin","fileSize":42,"identifier":"row-1"}"#;
        let descriptor: TaskDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(descriptor.file_size, Some(42));
        assert_eq!(descriptor.identifier.as_deref(), Some("row-1"));

        let missing: TaskDescriptor = serde_json::from_str(r#"{"url":"http://example.com/a"}"#).unwrap();
        assert_eq!(missing.validate(), Err(ValidationError::MissingField("destination")));
    }
}
