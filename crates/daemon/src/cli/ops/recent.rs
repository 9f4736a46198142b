use std::fmt;
use std::time::Duration;

use clap::Args;
use owo_colors::OwoColorize;

use blobstore::{BlobStoreError, Since};
use depot_daemon::StateError;

/// List blobs written to a file store within a recent time window.
#[derive(Args, Debug, Clone)]
pub struct Recent {
    /// Name of the file blob store
    pub store: String,

    /// Look back this many minutes
    #[arg(long, default_value = "60")]
    pub minutes: u64,

    /// Restrict the walk to a date partition prefix such as `2024/06/15`
    #[arg(long)]
    pub prefix: Option<String>,
}

#[derive(Debug)]
pub struct RecentOutput {
    pub store: String,
    /// `(blob id, path relative to the content directory)`
    pub blobs: Vec<(String, String)>,
}

impl fmt::Display for RecentOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.blobs.is_empty() {
            return write!(f, "No recent blobs in {}", self.store.bold());
        }
        write!(
            f,
            "{} recent blob(s) in {}",
            self.blobs.len().to_string().bold(),
            self.store.bold()
        )?;
        for (id, path) in &self.blobs {
            write!(f, "\n  {} {}", id, path.dimmed())?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RecentError {
    #[error("failed to open depot state: {0}")]
    State(#[from] StateError),
    #[error("{0}")]
    Store(#[from] BlobStoreError),
    #[error("blob store '{0}' is not a file blob store")]
    NotFileStore(String),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Recent {
    type Error = RecentError;
    type Output = RecentOutput;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let state = ctx.state().await?;
        let result = async {
            let store = state.manager.require(&self.store)?;
            let file = store
                .as_file()
                .ok_or_else(|| RecentError::NotFileStore(store.name()))?;
            let since = Since::Duration(Duration::from_secs(self.minutes.saturating_mul(60)));
            let found = file.blobs_since(since, self.prefix.as_deref()).await?;
            Ok::<_, RecentError>(RecentOutput {
                store: store.name(),
                blobs: found
                    .into_iter()
                    .map(|(id, path)| (id.to_string(), path))
                    .collect(),
            })
        }
        .await;
        state.close().await;
        result
    }
}
