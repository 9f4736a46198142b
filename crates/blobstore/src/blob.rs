//! Blob identifiers, references and the immutable blob model.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{BlobStoreError, Result};
use crate::partition::DatePath;

/// Well-known header names carried with every blob.
pub mod headers {
    pub const CONTENT_TYPE: &str = "content-type";
    pub const CREATED_BY: &str = "created-by";
    pub const CREATED_BY_IP: &str = "created-by-ip";
    pub const REPOSITORY: &str = "repository";
    pub const BLOB_NAME: &str = "blob-name";
}

/// Opaque, immutable blob identifier assigned at write time.
///
/// Generated ids end in the `YYYYMMDDhhmm` creation stamp, which lets a
/// backend find the date partition of a blob from its id alone.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlobId(String);

impl BlobId {
    pub fn generate(created: &DateTime<Utc>) -> Self {
        let stamp = DatePath::from_datetime(created).stamp();
        Self(format!("{}-{}", Uuid::new_v4(), stamp))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Date partition encoded in the id, if the id carries one.
    pub fn date_path(&self) -> Option<DatePath> {
        let (_, stamp) = self.0.rsplit_once('-')?;
        DatePath::from_stamp(stamp)
    }
}

impl FromStr for BlobId {
    type Err = BlobStoreError;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(BlobStoreError::InvalidBlobRef("empty blob id".into()));
        }
        if s.contains(['@', '/', '\\']) || s.chars().any(char::is_whitespace) {
            return Err(BlobStoreError::InvalidBlobRef(format!(
                "blob id '{s}' contains reserved characters"
            )));
        }
        Ok(Self(s.to_string()))
    }
}

impl TryFrom<String> for BlobId {
    type Error = BlobStoreError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<BlobId> for String {
    fn from(value: BlobId) -> Self {
        value.0
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Store-scoped pointer to a blob. The only blob pointer that is persisted
/// outside the storage engine; its string form is `<store>@<blobId>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlobRef {
    pub store: String,
    pub blob: BlobId,
}

impl BlobRef {
    pub fn new(store: impl Into<String>, blob: BlobId) -> Self {
        Self {
            store: store.into(),
            blob,
        }
    }
}

impl fmt::Display for BlobRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.store, self.blob)
    }
}

impl FromStr for BlobRef {
    type Err = BlobStoreError;

    fn from_str(s: &str) -> Result<Self> {
        let (store, blob) = s
            .rsplit_once('@')
            .ok_or_else(|| BlobStoreError::InvalidBlobRef(format!("missing '@' in '{s}'")))?;
        if store.is_empty() {
            return Err(BlobStoreError::InvalidBlobRef(format!(
                "missing store name in '{s}'"
            )));
        }
        Ok(Self {
            store: store.to_string(),
            blob: blob.parse()?,
        })
    }
}

impl TryFrom<String> for BlobRef {
    type Error = BlobStoreError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<BlobRef> for String {
    fn from(value: BlobRef) -> Self {
        value.to_string()
    }
}

/// Headers stored alongside a blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobHeaders(BTreeMap<String, String>);

impl BlobHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.get(headers::CONTENT_TYPE)
    }

    pub fn repository(&self) -> Option<&str> {
        self.get(headers::REPOSITORY)
    }

    /// A write must identify the blob and its creator.
    pub fn validate_required(&self) -> Result<()> {
        for key in [headers::BLOB_NAME, headers::CREATED_BY] {
            if self.get(key).map_or(true, str::is_empty) {
                return Err(BlobStoreError::InvalidHeaders(format!(
                    "missing required header '{key}'"
                )));
            }
        }
        Ok(())
    }
}

impl FromIterator<(String, String)> for BlobHeaders {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMetrics {
    pub created: DateTime<Utc>,
    pub sha256: String,
    pub size: u64,
}

impl BlobMetrics {
    pub fn compute(content: &[u8], created: DateTime<Utc>) -> Self {
        Self {
            created,
            sha256: hex::encode(Sha256::digest(content)),
            size: content.len() as u64,
        }
    }
}

/// An immutable blob: content plus headers and metrics.
#[derive(Debug, Clone)]
pub struct Blob {
    pub blob_ref: BlobRef,
    pub headers: BlobHeaders,
    pub metrics: BlobMetrics,
    pub content: Bytes,
}

impl Blob {
    pub fn id(&self) -> &BlobId {
        &self.blob_ref.blob
    }
}

/// Remote object metadata cached per blob for cloud backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalMetadata {
    pub etag: Option<String>,
    pub last_modified: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_blob_ref_round_trip() {
        let at = Utc.with_ymd_and_hms(2024, 6, 15, 12, 30, 0).unwrap();
        let blob_ref = BlobRef::new("Maven-Releases", BlobId::generate(&at));
        let text = blob_ref.to_string();
        assert!(text.starts_with("Maven-Releases@"));
        assert_eq!(text.parse::<BlobRef>().unwrap(), blob_ref);

        let json = serde_json::to_string(&blob_ref).unwrap();
        assert_eq!(json, format!("\"{text}\""));
        assert_eq!(serde_json::from_str::<BlobRef>(&json).unwrap(), blob_ref);
    }

    #[test]
    fn test_blob_ref_rejects_malformed() {
        assert!("no-separator".parse::<BlobRef>().is_err());
        assert!("@abc".parse::<BlobRef>().is_err());
        assert!("store@".parse::<BlobRef>().is_err());
        assert!("store@a/b".parse::<BlobRef>().is_err());
    }

    #[test]
    fn test_generated_id_carries_date_path() {
        let at = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let id = BlobId::generate(&at);
        assert_eq!(id.date_path().unwrap().to_string(), "2024/01/02/03/04");

        let legacy: BlobId = "plain-id".parse().unwrap();
        assert!(legacy.date_path().is_none());
    }

    #[test]
    fn test_required_headers() {
        let partial = BlobHeaders::new().with(headers::BLOB_NAME, "a.jar");
        assert!(partial.validate_required().is_err());

        let complete = partial.with(headers::CREATED_BY, "admin");
        assert!(complete.validate_required().is_ok());
    }

    #[test]
    fn test_metrics_hash_content() {
        let at = Utc::now();
        let metrics = BlobMetrics::compute(b"hello world", at);
        assert_eq!(metrics.size, 11);
        assert_eq!(
            metrics.sha256,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }
}
