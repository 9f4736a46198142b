//! Space reclamation across one, several or all blob stores.
//!
//! Before any store is compacted the coordinator refuses stores that another
//! task has claimed and stores named by an unfinished move. Selected stores
//! are then claimed for the duration of the run and compacted on a bounded
//! [`WorkerPool`].

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::configuration::normalize_name;
use crate::error::{BlobStoreError, Result};
use crate::manager::BlobStoreManager;
use crate::pool::WorkerPool;
use crate::store::{BlobStore, CompactionStats};

/// An in-flight migration of blobs from one store to another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveRecord {
    pub source: String,
    pub target: String,
}

impl MoveRecord {
    pub fn involves(&self, store: &str) -> bool {
        let store = normalize_name(store);
        normalize_name(&self.source) == store || normalize_name(&self.target) == store
    }
}

/// Reports store-to-store moves that have not completed.
#[async_trait]
pub trait MoveTracker: Send + Sync {
    async fn unfinished_moves(&self) -> anyhow::Result<Vec<MoveRecord>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoMoves;

#[async_trait]
impl MoveTracker for NoMoves {
    async fn unfinished_moves(&self) -> anyhow::Result<Vec<MoveRecord>> {
        Ok(Vec::new())
    }
}

/// Stores currently claimed by running maintenance tasks, shared between
/// every task that must not overlap.
#[derive(Debug, Clone, Default)]
pub struct TaskClaims {
    claims: Arc<Mutex<HashMap<String, String>>>,
}

impl TaskClaims {
    pub fn new() -> Self {
        Self::default()
    }

    /// Description of the task holding `store`, if any.
    pub fn holder(&self, store: &str) -> Option<String> {
        self.claims.lock().get(&normalize_name(store)).cloned()
    }

    /// Claim every store or none of them. Released when the guard drops.
    pub fn claim_all(&self, stores: &[String], holder: &str) -> Result<ClaimGuard> {
        let mut claims = self.claims.lock();
        let keys: Vec<String> = stores.iter().map(|s| normalize_name(s)).collect();
        for (store, key) in stores.iter().zip(&keys) {
            if let Some(existing) = claims.get(key) {
                return Err(in_use_by_task(store, existing));
            }
        }
        for key in &keys {
            claims.insert(key.clone(), holder.to_string());
        }
        Ok(ClaimGuard {
            claims: self.clone(),
            keys,
        })
    }
}

#[derive(Debug)]
pub struct ClaimGuard {
    claims: TaskClaims,
    keys: Vec<String>,
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        let mut claims = self.claims.claims.lock();
        for key in &self.keys {
            claims.remove(key);
        }
    }
}

fn in_use_by_task(store: &str, holder: &str) -> BlobStoreError {
    BlobStoreError::Conflict(format!(
        "Blob store '{store}' is in use by another task: {holder}"
    ))
}

/// Selected store names plus the members of every selected group, each
/// once. Compacting a group touches its members.
fn guarded_names(stores: &[Arc<dyn BlobStore>]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut names = Vec::new();
    for store in stores {
        let members = store.as_group().map(|g| g.members()).unwrap_or_default();
        for name in std::iter::once(store.name()).chain(members) {
            if seen.insert(normalize_name(&name)) {
                names.push(name);
            }
        }
    }
    names
}

/// Which stores a compaction run covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreSelection {
    All,
    Named(Vec<String>),
}

impl StoreSelection {
    pub fn describe(&self) -> String {
        match self {
            StoreSelection::All => "all blob stores".to_string(),
            StoreSelection::Named(names) if names.len() == 1 => {
                format!("blob store '{}'", names[0])
            }
            StoreSelection::Named(names) => format!(
                "blob stores {}",
                names
                    .iter()
                    .map(|n| format!("'{n}'"))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }
    }
}

impl fmt::Display for StoreSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreSelection::All => f.write_str("*"),
            StoreSelection::Named(names) => f.write_str(&names.join(",")),
        }
    }
}

impl FromStr for StoreSelection {
    type Err = BlobStoreError;

    /// `*` for every store, otherwise a comma separated list of names.
    fn from_str(s: &str) -> Result<Self> {
        if s.trim() == "*" {
            return Ok(StoreSelection::All);
        }
        let names: Vec<String> = s
            .split(',')
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .collect();
        if names.is_empty() {
            return Err(BlobStoreError::configuration(
                "no blob store selected for compaction",
            ));
        }
        Ok(StoreSelection::Named(names))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionSettings {
    pub concurrency: usize,
    pub queue_capacity: usize,
}

impl Default for CompactionSettings {
    fn default() -> Self {
        Self {
            concurrency: 2,
            queue_capacity: 64,
        }
    }
}

/// Result of one coordinated run.
#[derive(Debug, Clone, Default)]
pub struct CompactionOutcome {
    /// Stores whose compaction completed
    pub compacted: usize,
    /// `(store, error)` for stores whose compaction failed
    pub failed: Vec<(String, String)>,
    pub stats: CompactionStats,
    pub message: String,
}

impl CompactionOutcome {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct CompactionCoordinator {
    manager: BlobStoreManager,
    moves: Arc<dyn MoveTracker>,
    claims: TaskClaims,
    pool: WorkerPool,
}

impl fmt::Debug for CompactionCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompactionCoordinator")
            .field("claims", &self.claims)
            .field("pool", &self.pool)
            .finish()
    }
}

impl CompactionCoordinator {
    pub fn new(
        manager: BlobStoreManager,
        moves: Arc<dyn MoveTracker>,
        settings: CompactionSettings,
    ) -> Self {
        Self {
            manager,
            moves,
            claims: TaskClaims::new(),
            pool: WorkerPool::new(
                "compaction",
                settings.concurrency,
                settings.queue_capacity,
            ),
        }
    }

    /// Share claims with other maintenance tasks.
    pub fn with_claims(mut self, claims: TaskClaims) -> Self {
        self.claims = claims;
        self
    }

    pub fn claims(&self) -> &TaskClaims {
        &self.claims
    }

    /// Fails with [`BlobStoreError::Conflict`] if another task holds `name`
    /// or an unfinished move names it as source or target.
    pub async fn check_for_conflicts(&self, name: &str) -> Result<()> {
        let moves = self.moves.unfinished_moves().await?;
        self.check_against(name, &moves)
    }

    fn check_against(&self, name: &str, moves: &[MoveRecord]) -> Result<()> {
        if let Some(holder) = self.claims.holder(name) {
            return Err(in_use_by_task(name, &holder));
        }
        if let Some(record) = moves.iter().find(|m| m.involves(name)) {
            return Err(BlobStoreError::Conflict(format!(
                "Unable to compact blob store '{name}': unfinished move from '{}' to '{}'",
                record.source, record.target
            )));
        }
        Ok(())
    }

    fn select(&self, selection: &StoreSelection) -> Result<Vec<Arc<dyn BlobStore>>> {
        match selection {
            // members of groups are compacted directly
            StoreSelection::All => Ok(self
                .manager
                .browse()
                .into_iter()
                .filter(|store| store.as_group().is_none())
                .collect()),
            StoreSelection::Named(names) => {
                names.iter().map(|name| self.manager.require(name)).collect()
            }
        }
    }

    /// Compact the selected stores. Conflicts on a selected store or on a
    /// member of a selected group abort the whole run before any store is
    /// touched; a store whose own compaction fails is reported in
    /// [`CompactionOutcome::failed`] without stopping the others.
    pub async fn run(
        &self,
        selection: &StoreSelection,
        inactivity: Duration,
    ) -> Result<CompactionOutcome> {
        let description = selection.describe();
        let stores = self.select(selection)?;

        let guarded = guarded_names(&stores);
        let moves = self.moves.unfinished_moves().await?;
        for name in &guarded {
            self.check_against(name, &moves)?;
        }
        let _claim = self
            .claims
            .claim_all(&guarded, &format!("compaction of {description}"))?;

        info!(selection = %description, stores = stores.len(), "starting compaction");
        let usage = self.manager.usage_checker();
        let mut handles = Vec::with_capacity(stores.len());
        for store in stores {
            let usage = usage.clone();
            let name = store.name();
            let handle = self
                .pool
                .submit(async move { store.compact(usage.as_ref(), inactivity).await })
                .await?;
            handles.push((name, handle));
        }

        let mut outcome = CompactionOutcome::default();
        for (name, handle) in handles {
            match handle.join().await.and_then(|result| result) {
                Ok(stats) => {
                    outcome.compacted += 1;
                    outcome.stats += stats;
                }
                Err(e) => {
                    error!(store = %name, error = %e, "compaction failed");
                    outcome.failed.push((name, e.to_string()));
                }
            }
        }

        outcome.message = if outcome.failed.is_empty() {
            format!(
                "Compacted {description}: {} store(s), {} blob(s) reclaimed",
                outcome.compacted, outcome.stats.reclaimed
            )
        } else {
            format!(
                "Compacted {description}: {} store(s), {} failed ({})",
                outcome.compacted,
                outcome.failed.len(),
                outcome
                    .failed
                    .iter()
                    .map(|(store, _)| store.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        };
        info!(selection = %description, compacted = outcome.compacted, failed = outcome.failed.len(), "compaction finished");
        Ok(outcome)
    }
}
