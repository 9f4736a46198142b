//! Finds the blobs created at or after a cutoff by walking only the date
//! partitions that can contain them.
//!
//! At each level (year, month, day, hour, minute) a partition newer than the
//! cutoff's component is taken whole, an older one is pruned, and an equal one
//! is descended into. Cost is proportional to the partitions touched, not to
//! the number of blobs stored.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::blob::BlobId;
use crate::error::{BlobStoreError, Result};
use crate::partition::{DatePath, PARTITION_DEPTH};
use crate::store::layout::BYTES_EXTENSION;

/// Lower bound of a walk: a lookback from now or an explicit instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Since {
    Duration(Duration),
    Instant(DateTime<Utc>),
}

impl Since {
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Since::Instant(at) => *at,
            Since::Duration(lookback) => chrono::Duration::from_std(*lookback)
                .ok()
                .and_then(|lookback| now.checked_sub_signed(lookback))
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
        }
    }
}

/// Walks `<content root>/<YYYY>/<MM>/<DD>/<hh>/<mm>/<blobId>.bytes`.
#[derive(Debug, Clone)]
pub struct DatePathWalker {
    content_root: PathBuf,
}

impl DatePathWalker {
    pub fn new(content_root: impl Into<PathBuf>) -> Self {
        Self {
            content_root: content_root.into(),
        }
    }

    /// Blob ids created at or after `since`, mapped to their relative date
    /// path. `prefix` (e.g. `2024/06/15/09`) limits the walk to one
    /// partition.
    pub async fn walk(
        &self,
        since: Since,
        prefix: Option<&str>,
    ) -> Result<BTreeMap<BlobId, String>> {
        self.walk_at(since, Utc::now(), prefix).await
    }

    pub async fn walk_at(
        &self,
        since: Since,
        now: DateTime<Utc>,
        prefix: Option<&str>,
    ) -> Result<BTreeMap<BlobId, String>> {
        let cutoff = DatePath::from_datetime(&since.cutoff(now)).segments();
        let prefix = prefix.map(parse_prefix).transpose()?.unwrap_or_default();
        let root = self.content_root.clone();

        let found = tokio::task::spawn_blocking(move || {
            let mut found = BTreeMap::new();
            let mut walk = Walk {
                prefix: &prefix,
                relative: Vec::with_capacity(PARTITION_DEPTH),
                found: &mut found,
            };
            walk.level(&root, 0, Some(&cutoff))?;
            Ok::<_, io::Error>(found)
        })
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;

        debug!(
            root = %self.content_root.display(),
            blobs = found.len(),
            "date partition walk complete"
        );
        Ok(found)
    }
}

fn parse_prefix(prefix: &str) -> Result<Vec<u32>> {
    let segments = prefix
        .trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<u32>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| {
            BlobStoreError::configuration(format!("invalid date partition prefix '{prefix}'"))
        })?;
    if segments.len() > PARTITION_DEPTH {
        return Err(BlobStoreError::configuration(format!(
            "date partition prefix '{prefix}' is deeper than {PARTITION_DEPTH} levels"
        )));
    }
    Ok(segments)
}

struct Walk<'a> {
    prefix: &'a [u32],
    relative: Vec<String>,
    found: &'a mut BTreeMap<BlobId, String>,
}

impl Walk<'_> {
    /// `cutoff` is `None` once an ancestor partition was strictly newer than
    /// the cutoff, meaning everything below qualifies.
    fn level(
        &mut self,
        dir: &Path,
        depth: usize,
        cutoff: Option<&[u32; PARTITION_DEPTH]>,
    ) -> io::Result<()> {
        if depth == PARTITION_DEPTH {
            return self.collect(dir);
        }

        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };

        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(segment) = name.to_str() else {
                continue;
            };
            let Ok(value) = segment.parse::<u32>() else {
                continue;
            };
            if self.prefix.get(depth).is_some_and(|wanted| *wanted != value) {
                continue;
            }

            let next = match cutoff {
                None => Some(None),
                Some(cutoff) => match value.cmp(&cutoff[depth]) {
                    std::cmp::Ordering::Greater => Some(None),
                    std::cmp::Ordering::Equal => Some(Some(cutoff)),
                    std::cmp::Ordering::Less => None,
                },
            };
            let Some(next) = next else {
                continue;
            };

            self.relative.push(segment.to_string());
            let result = self.level(&entry.path(), depth + 1, next);
            self.relative.pop();
            result?;
        }
        Ok(())
    }

    fn collect(&mut self, dir: &Path) -> io::Result<()> {
        let date_path = self.relative.join("/");
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(BYTES_EXTENSION) {
                continue;
            }
            let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<BlobId>().ok())
            else {
                continue;
            };
            self.found.insert(id, date_path.clone());
        }
        Ok(())
    }
}
