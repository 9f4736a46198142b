use std::fmt;

use clap::Args;
use owo_colors::OwoColorize;

use blobstore::BlobStoreError;
use depot_daemon::StateError;

#[derive(Args, Debug, Clone)]
pub struct Delete {
    /// Name of the blob store to delete
    pub name: String,
}

#[derive(Debug)]
pub struct DeleteOutput {
    pub name: String,
}

impl fmt::Display for DeleteOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} blob store {}", "Deleted".green().bold(), self.name.bold())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DeleteError {
    #[error("failed to open depot state: {0}")]
    State(#[from] StateError),
    #[error("{0}")]
    Store(#[from] BlobStoreError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Delete {
    type Error = DeleteError;
    type Output = DeleteOutput;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let state = ctx.state().await?;
        let deleted = state.manager.delete(&self.name).await;
        state.close().await;
        deleted?;

        Ok(DeleteOutput {
            name: self.name.clone(),
        })
    }
}
