use std::fmt;
use std::path::PathBuf;

use clap::{Args, ValueEnum};
use owo_colors::OwoColorize;

use blobstore::quota::{self, QuotaKind};
use blobstore::{file, BlobStoreConfiguration, BlobStoreError};
use depot_daemon::StateError;

/// Soft quota type for CLI selection
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum QuotaType {
    /// Total bytes stored
    SpaceUsed,
    /// Number of blobs stored
    BlobCount,
}

impl From<QuotaType> for QuotaKind {
    fn from(value: QuotaType) -> Self {
        match value {
            QuotaType::SpaceUsed => QuotaKind::SpaceUsed,
            QuotaType::BlobCount => QuotaKind::BlobCount,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct CreateFile {
    /// Name of the blob store to create
    pub name: String,

    /// Content directory (defaults to <data_dir>/blobs/<name>)
    #[arg(long)]
    pub path: Option<PathBuf>,

    /// Soft quota type; requires --quota-limit
    #[arg(long, value_enum, requires = "quota_limit")]
    pub quota_type: Option<QuotaType>,

    /// Soft quota limit (bytes or blob count)
    #[arg(long, requires = "quota_type")]
    pub quota_limit: Option<u64>,
}

impl CreateFile {
    fn configuration(&self, path: PathBuf) -> BlobStoreConfiguration {
        let mut config = BlobStoreConfiguration::new(&self.name, file::TYPE).with_attribute(
            file::SECTION,
            file::PATH,
            path.to_string_lossy().to_string(),
        );
        if let (Some(kind), Some(limit)) = (self.quota_type, self.quota_limit) {
            config.set_attribute(quota::SECTION, quota::TYPE_KEY, QuotaKind::from(kind).as_str());
            config.set_attribute(quota::SECTION, quota::LIMIT_KEY, limit);
        }
        config
    }
}

#[derive(Debug)]
pub struct CreateFileOutput {
    pub name: String,
    pub path: PathBuf,
    pub frozen: bool,
}

impl fmt::Display for CreateFileOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} file blob store {}",
            "Created".green().bold(),
            self.name.bold()
        )?;
        write!(f, "  {} {}", "path:".dimmed(), self.path.display())?;
        if self.frozen {
            write!(f, "\n  {} {}", "state:".dimmed(), "frozen".yellow())?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CreateFileError {
    #[error("failed to open depot state: {0}")]
    State(#[from] StateError),
    #[error("{0}")]
    Store(#[from] BlobStoreError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for CreateFile {
    type Error = CreateFileError;
    type Output = CreateFileOutput;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let path = self
            .path
            .clone()
            .unwrap_or_else(|| ctx.config.store_path(&self.name));

        let state = ctx.state().await?;
        let created = state.manager.create(self.configuration(path.clone())).await;
        state.close().await;
        let store = created?;

        Ok(CreateFileOutput {
            name: store.name(),
            path,
            frozen: store.is_frozen(),
        })
    }
}
