use std::fmt;

use clap::Args;
use comfy_table::Table;

use blobstore::{StoreMetrics, StoreState};
use depot_daemon::StateError;

#[derive(Args, Debug, Clone)]
pub struct List {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, serde::Serialize)]
pub struct StoreInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub state: StoreState,
    pub frozen: bool,
    pub metrics: StoreMetrics,
    /// Members, for groups
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<String>,
}

#[derive(Debug)]
pub struct ListOutput {
    pub stores: Vec<StoreInfo>,
    pub json: Option<String>,
}

impl fmt::Display for ListOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(json) = &self.json {
            return write!(f, "{json}");
        }
        if self.stores.is_empty() {
            return write!(f, "No blob stores configured");
        }

        let mut table = Table::new();
        table.set_header(vec!["NAME", "TYPE", "STATE", "FROZEN", "BLOBS", "BYTES", "MEMBERS"]);
        for store in &self.stores {
            table.add_row(vec![
                store.name.clone(),
                store.type_name.clone(),
                store.state.to_string(),
                if store.frozen { "yes" } else { "no" }.to_string(),
                store.metrics.blob_count.to_string(),
                store.metrics.total_size.to_string(),
                store.members.join(", "),
            ]);
        }
        write!(f, "{table}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ListError {
    #[error("failed to open depot state: {0}")]
    State(#[from] StateError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for List {
    type Error = ListError;
    type Output = ListOutput;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let state = ctx.state().await?;
        let stores: Vec<StoreInfo> = state
            .manager
            .browse()
            .into_iter()
            .map(|store| StoreInfo {
                name: store.name(),
                type_name: store.type_name(),
                state: store.state(),
                frozen: store.is_frozen(),
                metrics: store.metrics(),
                members: store.as_group().map(|g| g.members()).unwrap_or_default(),
            })
            .collect();
        state.close().await;

        let json = if self.json {
            Some(serde_json::to_string_pretty(&stores)?)
        } else {
            None
        };
        Ok(ListOutput { stores, json })
    }
}
