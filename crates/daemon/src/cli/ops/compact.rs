use std::fmt;
use std::time::Duration;

use clap::Args;
use owo_colors::OwoColorize;

use blobstore::{BlobStoreError, CompactionOutcome, StoreSelection};
use depot_daemon::StateError;

/// Reclaim space held by deleted blobs.
#[derive(Args, Debug, Clone)]
pub struct Compact {
    /// `*` for every store, or a comma separated list of store names
    #[arg(default_value = "*")]
    pub selection: StoreSelection,

    /// Keep blobs deleted within this many seconds (defaults to the config)
    #[arg(long)]
    pub inactivity_secs: Option<u64>,
}

#[derive(Debug)]
pub struct CompactOutput {
    pub outcome: CompactionOutcome,
}

impl fmt::Display for CompactOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.outcome.is_success() {
            "OK".green().to_string()
        } else {
            "PARTIAL".yellow().to_string()
        };
        writeln!(f, "{} {}", status.bold(), self.outcome.message)?;
        let stats = &self.outcome.stats;
        write!(
            f,
            "  {} {} examined, {} reclaimed ({} bytes), {} in use, {} recent",
            "blobs:".dimmed(),
            stats.examined,
            stats.reclaimed,
            stats.reclaimed_bytes,
            stats.retained_in_use,
            stats.retained_recent
        )?;
        for (store, error) in &self.outcome.failed {
            write!(f, "\n  {} {}: {}", "failed:".red(), store, error)?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CompactError {
    #[error("failed to open depot state: {0}")]
    State(#[from] StateError),
    #[error("{0}")]
    Store(#[from] BlobStoreError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Compact {
    type Error = CompactError;
    type Output = CompactOutput;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let inactivity = self
            .inactivity_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| ctx.config.compaction.inactivity());

        let state = ctx.state().await?;
        let outcome = state.coordinator().run(&self.selection, inactivity).await;
        state.close().await;

        Ok(CompactOutput { outcome: outcome? })
    }
}
