//! Scheduler property commands.

use anyhow::Result;
use clap::Args;
use plfm_scheduler_k3s::properties::ReportEntry;
use serde::Serialize;
use tabled::Tabled;

use crate::output::{display_option, print_output, print_success};

use super::CommandContext;

#[derive(Debug, Args)]
pub struct SetCommand {
    /// App name, or `--global`.
    #[arg(allow_hyphen_values = true)]
    scope: String,

    /// Property name.
    property: String,

    /// New value. Omit to clear.
    value: Option<String>,
}

impl SetCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        ctx.properties
            .set(&self.scope, &self.property, self.value.as_deref())
            .await?;
        match self.value.as_deref().filter(|v| !v.is_empty()) {
            Some(value) => print_success(&format!("Set {} to {value} for {}", self.property, self.scope)),
            None => print_success(&format!("Cleared {} for {}", self.property, self.scope)),
        }
        Ok(())
    }
}

#[derive(Debug, Args)]
pub struct ReportCommand {
    /// App name.
    app: String,
}

#[derive(Debug, Clone, Serialize, Tabled)]
struct ReportRow {
    #[tabled(rename = "Property")]
    name: String,

    #[tabled(rename = "App", display = "display_option")]
    app: Option<String>,

    #[tabled(rename = "Global", display = "display_option")]
    global: Option<String>,

    #[tabled(rename = "Computed")]
    computed: String,
}

impl From<ReportEntry> for ReportRow {
    fn from(entry: ReportEntry) -> Self {
        Self {
            name: entry.name,
            app: entry.app,
            global: entry.global,
            computed: entry.computed,
        }
    }
}

impl ReportCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let rows: Vec<ReportRow> = ctx
            .properties
            .report(&self.app)
            .await?
            .into_iter()
            .map(ReportRow::from)
            .collect();
        print_output(&rows, ctx.format);
        Ok(())
    }
}
