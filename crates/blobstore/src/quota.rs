//! Soft quotas: thresholds that take a store out of write rotation inside a
//! group without blocking it.

use std::fmt;
use std::str::FromStr;

use crate::configuration::BlobStoreConfiguration;
use crate::error::{BlobStoreError, Result};
use crate::store::StoreMetrics;

pub const SECTION: &str = "softQuota";
pub const TYPE_KEY: &str = "type";
pub const LIMIT_KEY: &str = "limit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaKind {
    /// Total bytes stored
    SpaceUsed,
    BlobCount,
}

impl QuotaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaKind::SpaceUsed => "spaceUsedQuota",
            QuotaKind::BlobCount => "blobCountQuota",
        }
    }
}

impl fmt::Display for QuotaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QuotaKind {
    type Err = BlobStoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "spaceUsedQuota" => Ok(QuotaKind::SpaceUsed),
            "blobCountQuota" => Ok(QuotaKind::BlobCount),
            other => Err(BlobStoreError::configuration(format!(
                "unknown soft quota type '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoftQuota {
    pub kind: QuotaKind,
    pub limit: u64,
}

/// Outcome of checking a store against its quota.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaResult {
    pub violation: bool,
    pub message: String,
}

impl SoftQuota {
    /// Quota configured for a store, if any. A present but malformed
    /// `softQuota` section is an error.
    pub fn from_config(config: &BlobStoreConfiguration) -> Result<Option<Self>> {
        let Some(section) = config.section(SECTION) else {
            return Ok(None);
        };
        if section.is_empty() {
            return Ok(None);
        }
        let kind = config
            .string_attribute(SECTION, TYPE_KEY)
            .ok_or_else(|| {
                BlobStoreError::configuration(format!(
                    "soft quota of blob store '{}' is missing '{TYPE_KEY}'",
                    config.name
                ))
            })?
            .parse()?;
        let limit = config.u64_attribute(SECTION, LIMIT_KEY).ok_or_else(|| {
            BlobStoreError::configuration(format!(
                "soft quota of blob store '{}' needs a non-negative integer '{LIMIT_KEY}'",
                config.name
            ))
        })?;
        Ok(Some(Self { kind, limit }))
    }

    pub fn check(&self, store: &str, metrics: &StoreMetrics) -> QuotaResult {
        let (used, unit) = match self.kind {
            QuotaKind::SpaceUsed => (metrics.total_size, "bytes"),
            QuotaKind::BlobCount => (metrics.blob_count, "blobs"),
        };
        let violation = used > self.limit;
        let message = if violation {
            format!(
                "blob store '{store}' uses {used} {unit}, over its soft quota of {}",
                self.limit
            )
        } else {
            format!(
                "blob store '{store}' uses {used} of {} {unit}",
                self.limit
            )
        };
        QuotaResult { violation, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_check() {
        let config = BlobStoreConfiguration::new("a", "file")
            .with_attribute(SECTION, TYPE_KEY, "spaceUsedQuota")
            .with_attribute(SECTION, LIMIT_KEY, 100);
        let quota = SoftQuota::from_config(&config).unwrap().unwrap();
        assert_eq!(quota.kind, QuotaKind::SpaceUsed);

        let under = quota.check(
            "a",
            &StoreMetrics {
                blob_count: 1,
                total_size: 100,
            },
        );
        assert!(!under.violation);

        let over = quota.check(
            "a",
            &StoreMetrics {
                blob_count: 1,
                total_size: 101,
            },
        );
        assert!(over.violation);
        assert!(over.message.contains("over its soft quota"));
    }

    #[test]
    fn test_absent_and_invalid() {
        let plain = BlobStoreConfiguration::new("a", "file");
        assert_eq!(SoftQuota::from_config(&plain).unwrap(), None);

        let bad_type = plain
            .clone()
            .with_attribute(SECTION, TYPE_KEY, "percent")
            .with_attribute(SECTION, LIMIT_KEY, 1);
        assert!(SoftQuota::from_config(&bad_type).is_err());

        let bad_limit = plain
            .with_attribute(SECTION, TYPE_KEY, "blobCountQuota")
            .with_attribute(SECTION, LIMIT_KEY, -5);
        assert!(SoftQuota::from_config(&bad_limit).is_err());
    }
}
