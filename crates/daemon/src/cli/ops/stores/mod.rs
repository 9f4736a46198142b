use clap::{Args, Subcommand};

pub mod create_file;
pub mod create_group;
pub mod delete;
pub mod list;

use crate::cli::op::Op;

crate::command_enum! {
    (List, list::List),
    (CreateFile, create_file::CreateFile),
    (CreateGroup, create_group::CreateGroup),
    (Delete, delete::Delete),
}

// Rename the generated Command to StoresCommand for clarity
pub type StoresCommand = Command;

#[derive(Args, Debug, Clone)]
pub struct Stores {
    #[command(subcommand)]
    pub command: StoresCommand,
}

#[async_trait::async_trait]
impl Op for Stores {
    type Error = OpError;
    type Output = OpOutput;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        self.command.execute(ctx).await
    }
}
