//! One-off run and enter commands.

use std::collections::BTreeMap;
use std::io::IsTerminal;

use anyhow::Result;
use clap::Args;
use plfm_scheduler_k3s::{EnterRequest, RunRequest};
use serde::Serialize;

use crate::error::CliError;
use crate::output::{print_info, print_single, print_warning, OutputFormat};

use super::{parse_key_value, CommandContext};

#[derive(Debug, Args)]
pub struct RunCommand {
    /// App name.
    app: String,

    /// Return once the job is created.
    #[arg(long, short = 'd')]
    detach: bool,

    /// Delete the job when it finishes.
    #[arg(long)]
    rm: bool,

    /// Extra environment, `KEY=VALUE`.
    #[arg(long = "env", short = 'e', value_parser = parse_key_value)]
    env: Vec<(String, String)>,

    /// Command to run. Empty opens the app shell.
    #[arg(last = true)]
    command: Vec<String>,
}

#[derive(Debug, Serialize)]
struct RunResponse {
    job: String,
    pod: Option<String>,
    phase: Option<String>,
}

impl RunCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let request = RunRequest {
            app: self.app,
            command: self.command,
            env: self.env.into_iter().collect::<BTreeMap<_, _>>(),
            detach: self.detach,
            remove: self.rm,
        };

        let runner = ctx.runner().await?;
        let mut stdout = tokio::io::stdout();
        let outcome = runner.run(&request, &mut stdout, &ctx.cancel).await?;

        match ctx.format {
            OutputFormat::Table if request.detach => {
                print_info(&format!("Started job {}", outcome.job));
            }
            OutputFormat::Table => {}
            OutputFormat::Json => print_single(&RunResponse {
                job: outcome.job.clone(),
                pod: outcome.pod.clone(),
                phase: outcome.phase.clone(),
            }),
        }

        if outcome.failed() {
            return Err(CliError::JobFailed { job: outcome.job }.into());
        }
        if !request.detach && outcome.phase.is_none() {
            print_warning(&format!("Job {} finished without a pod phase", outcome.job));
        }
        Ok(())
    }
}

#[derive(Debug, Args)]
pub struct EnterCommand {
    /// App name.
    app: String,

    /// Pod name or `<process type>[.<index>]`. Defaults to `web`.
    target: Option<String>,

    /// Command to run. Empty opens the app shell.
    #[arg(last = true)]
    command: Vec<String>,
}

impl EnterCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let request = EnterRequest {
            app: self.app,
            target: self.target,
            command: self.command,
            tty: std::io::stdin().is_terminal(),
        };
        ctx.runner().await?.enter(&request).await?;
        Ok(())
    }
}
