//! Certificate commands.

use anyhow::Result;
use clap::{Args, Subcommand};
use serde::Serialize;
use tabled::Tabled;

use crate::output::{print_info, print_output, print_success};

use super::CommandContext;

/// Certificate commands.
#[derive(Debug, Args)]
pub struct CertsCommand {
    #[command(subcommand)]
    command: CertsSubcommand,
}

#[derive(Debug, Subcommand)]
enum CertsSubcommand {
    /// Push an app's imported certificate, or every stale one.
    Sync(SyncArgs),

    /// Remove an app's certificate release.
    Remove(RemoveArgs),
}

#[derive(Debug, Args)]
struct SyncArgs {
    /// App name. Omit to sync every app.
    app: Option<String>,
}

#[derive(Debug, Args)]
struct RemoveArgs {
    /// App name.
    app: String,
}

#[derive(Debug, Clone, Serialize, Tabled)]
struct SyncRow {
    #[tabled(rename = "App")]
    app: String,

    #[tabled(rename = "Result")]
    result: String,
}

impl CertsCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        match self.command {
            CertsSubcommand::Sync(args) => sync(ctx, args).await,
            CertsSubcommand::Remove(args) => remove(ctx, args).await,
        }
    }
}

async fn sync(ctx: CommandContext, args: SyncArgs) -> Result<()> {
    let tls = ctx.tls().await?;
    let Some(app) = args.app else {
        let summary = tls.sync_all(&ctx.cancel).await?;
        let rows: Vec<SyncRow> = summary
            .synced
            .into_iter()
            .map(|app| SyncRow {
                app,
                result: "synced".to_string(),
            })
            .chain(summary.failed.into_iter().map(|(app, err)| SyncRow { app, result: err }))
            .collect();
        print_output(&rows, ctx.format);
        return Ok(());
    };

    if tls.sync(&app, &ctx.cancel).await? {
        print_success(&format!("Synced certificate for {app}"));
    } else {
        print_info(&format!("{app} has no certificate to sync"));
    }
    Ok(())
}

async fn remove(ctx: CommandContext, args: RemoveArgs) -> Result<()> {
    if ctx.tls().await?.remove(&args.app).await? {
        print_success(&format!("Removed certificate for {}", args.app));
    } else {
        print_info(&format!("{} has no certificate release", args.app));
    }
    Ok(())
}
