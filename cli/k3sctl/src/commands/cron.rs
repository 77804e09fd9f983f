//! Cron commands.

use anyhow::Result;
use clap::{Args, Subcommand};
use plfm_scheduler_k3s::cron::{collect_cron_entries, CronEntry};
use plfm_scheduler_k3s::providers::AppDirectory;
use serde::Serialize;
use tabled::Tabled;

use crate::output::print_output;

use super::CommandContext;

/// Cron commands.
#[derive(Debug, Args)]
pub struct CronCommand {
    #[command(subcommand)]
    command: CronSubcommand,
}

#[derive(Debug, Subcommand)]
enum CronSubcommand {
    /// List cron entries of every k3s app.
    List,
}

#[derive(Debug, Clone, Serialize, Tabled)]
struct CronRow {
    #[tabled(rename = "ID")]
    id: String,

    #[tabled(rename = "App")]
    app: String,

    #[tabled(rename = "Schedule")]
    schedule: String,

    #[tabled(rename = "Command")]
    command: String,
}

impl From<CronEntry> for CronRow {
    fn from(entry: CronEntry) -> Self {
        Self {
            id: entry.id,
            app: entry.app,
            schedule: entry.schedule,
            command: entry.command,
        }
    }
}

impl CronCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        match self.command {
            CronSubcommand::List => list(ctx).await,
        }
    }
}

async fn list(ctx: CommandContext) -> Result<()> {
    let apps = ctx.providers.apps().await?;
    let entries = collect_cron_entries(&ctx.properties, ctx.providers.clone(), &apps).await?;
    let rows: Vec<CronRow> = entries.into_iter().map(CronRow::from).collect();
    print_output(&rows, ctx.format);
    Ok(())
}
