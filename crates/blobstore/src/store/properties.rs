//! Codec for the `.properties` file stored next to every blob.
//!
//! One `key=value` pair per line. Metrics use fixed keys, headers are stored
//! as `header.<name>`. Backslashes and line breaks in values are escaped.

use chrono::{DateTime, Utc};

use crate::blob::{BlobHeaders, BlobMetrics};
use crate::error::{BlobStoreError, Result};

const CREATION_TIME: &str = "creation-time";
const SHA256: &str = "sha256";
const SIZE: &str = "size";
const DELETED: &str = "deleted";
const DELETED_AT: &str = "deleted-at";
const DELETED_REASON: &str = "deleted-reason";
const HEADER_PREFIX: &str = "header.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionMark {
    pub at: DateTime<Utc>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobProperties {
    pub headers: BlobHeaders,
    pub metrics: BlobMetrics,
    pub deleted: Option<DeletionMark>,
}

impl BlobProperties {
    pub fn new(headers: BlobHeaders, metrics: BlobMetrics) -> Self {
        Self {
            headers,
            metrics,
            deleted: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.is_some()
    }

    pub fn mark_deleted(&mut self, at: DateTime<Utc>, reason: &str) {
        self.deleted = Some(DeletionMark {
            at,
            reason: reason.to_string(),
        });
    }

    pub fn encode(&self) -> String {
        let mut out = String::new();
        let mut line = |key: &str, value: &str| {
            out.push_str(key);
            out.push('=');
            out.push_str(&escape(value));
            out.push('\n');
        };

        line(CREATION_TIME, &self.metrics.created.to_rfc3339());
        line(SHA256, &self.metrics.sha256);
        line(SIZE, &self.metrics.size.to_string());
        if let Some(mark) = &self.deleted {
            line(DELETED, "true");
            line(DELETED_AT, &mark.at.to_rfc3339());
            line(DELETED_REASON, &mark.reason);
        }
        for (name, value) in self.headers.iter() {
            line(&format!("{HEADER_PREFIX}{name}"), value);
        }
        out
    }

    pub fn decode(text: &str) -> Result<Self> {
        let mut headers = BlobHeaders::new();
        let mut created = None;
        let mut sha256 = None;
        let mut size = None;
        let mut deleted = false;
        let mut deleted_at = None;
        let mut deleted_reason = String::new();

        for raw in text.lines() {
            let raw = raw.trim_end_matches('\r');
            if raw.is_empty() || raw.starts_with('#') {
                continue;
            }
            let Some((key, value)) = raw.split_once('=') else {
                return Err(corrupt(format!("malformed line '{raw}'")));
            };
            let value = unescape(value);
            match key {
                CREATION_TIME => {
                    created = Some(
                        DateTime::parse_from_rfc3339(&value)
                            .map_err(|e| corrupt(format!("bad {CREATION_TIME}: {e}")))?
                            .with_timezone(&Utc),
                    )
                }
                SHA256 => sha256 = Some(value),
                SIZE => {
                    size = Some(
                        value
                            .parse::<u64>()
                            .map_err(|e| corrupt(format!("bad {SIZE}: {e}")))?,
                    )
                }
                DELETED => deleted = value == "true",
                DELETED_AT => {
                    deleted_at = Some(
                        DateTime::parse_from_rfc3339(&value)
                            .map_err(|e| corrupt(format!("bad {DELETED_AT}: {e}")))?
                            .with_timezone(&Utc),
                    )
                }
                DELETED_REASON => deleted_reason = value,
                other => {
                    if let Some(name) = other.strip_prefix(HEADER_PREFIX) {
                        headers.insert(name, value);
                    }
                }
            }
        }

        let metrics = BlobMetrics {
            created: created.ok_or_else(|| corrupt(format!("missing {CREATION_TIME}")))?,
            sha256: sha256.ok_or_else(|| corrupt(format!("missing {SHA256}")))?,
            size: size.ok_or_else(|| corrupt(format!("missing {SIZE}")))?,
        };
        let deleted = deleted.then(|| DeletionMark {
            at: deleted_at.unwrap_or(metrics.created),
            reason: deleted_reason,
        });

        Ok(Self {
            headers,
            metrics,
            deleted,
        })
    }
}

fn corrupt(message: String) -> BlobStoreError {
    BlobStoreError::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        format!("corrupt blob properties: {message}"),
    ))
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}
