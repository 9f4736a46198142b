use std::fmt;
use std::time::Duration;

use clap::Args;
use owo_colors::OwoColorize;

use depot_daemon::{MaintenanceService, StateError};

/// Start every store and compact on a schedule until interrupted.
#[derive(Args, Debug, Clone)]
pub struct Serve {
    /// Seconds between compaction runs (defaults to the config)
    #[arg(long)]
    pub interval_secs: Option<u64>,
}

#[derive(Debug)]
pub struct ServeOutput {
    pub runs: usize,
}

impl fmt::Display for ServeOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} after {} compaction run(s)",
            "Stopped".green().bold(),
            self.runs
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("failed to open depot state: {0}")]
    State(#[from] StateError),
    #[error("failed to wait for shutdown signal: {0}")]
    Signal(#[from] std::io::Error),
    #[error("maintenance task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Serve {
    type Error = ServeError;
    type Output = ServeOutput;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let compaction = ctx.config.compaction;
        let interval = self
            .interval_secs
            .map(|secs| Duration::from_secs(secs.max(1)))
            .unwrap_or_else(|| compaction.interval());

        let state = ctx.state().await?;
        let (shutdown, handle) =
            MaintenanceService::new(state.coordinator(), interval, compaction.inactivity())
                .spawn();

        let signal = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown requested");
        shutdown.shutdown();
        let runs = handle.await;
        state.close().await;

        signal?;
        Ok(ServeOutput { runs: runs? })
    }
}
