use std::fmt;

use clap::Args;
use owo_colors::OwoColorize;

use blobstore::{group, BlobStoreConfiguration, BlobStoreError};
use depot_daemon::StateError;

#[derive(Args, Debug, Clone)]
pub struct CreateGroup {
    /// Name of the group to create
    pub name: String,

    /// Member stores, in fill order
    #[arg(long, value_delimiter = ',', required = true)]
    pub members: Vec<String>,

    /// Keep writing to members that exceed their soft quota
    #[arg(long)]
    pub ignore_soft_quota: bool,
}

#[derive(Debug)]
pub struct CreateGroupOutput {
    pub name: String,
    pub members: Vec<String>,
}

impl fmt::Display for CreateGroupOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} blob store group {}",
            "Created".green().bold(),
            self.name.bold()
        )?;
        write!(f, "  {} {}", "members:".dimmed(), self.members.join(", "))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CreateGroupError {
    #[error("failed to open depot state: {0}")]
    State(#[from] StateError),
    #[error("{0}")]
    Store(#[from] BlobStoreError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for CreateGroup {
    type Error = CreateGroupError;
    type Output = CreateGroupOutput;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let config = BlobStoreConfiguration::new(&self.name, group::TYPE)
            .with_attribute(group::SECTION, group::MEMBERS, self.members.clone())
            .with_attribute(
                group::SECTION,
                group::RESPECT_SOFT_QUOTA,
                !self.ignore_soft_quota,
            );

        let state = ctx.state().await?;
        let created = state.manager.create(config).await;
        state.close().await;
        let store = created?;

        Ok(CreateGroupOutput {
            name: store.name(),
            members: store.as_group().map(|g| g.members()).unwrap_or_default(),
        })
    }
}
