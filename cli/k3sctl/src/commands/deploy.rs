//! Deploy and stop commands.

use std::collections::BTreeMap;

use anyhow::Result;
use clap::Args;
use plfm_scheduler_k3s::deploy::WEB_PROCESS;
use plfm_scheduler_k3s::manifest::ImageSourceType;
use plfm_scheduler_k3s::DeployRequest;
use serde::Serialize;
use tracing::debug;

use crate::error::CliError;
use crate::output::{print_info, print_single, print_success, OutputFormat};

use super::{parse_key_value, CommandContext};

#[derive(Debug, Args)]
pub struct DeployCommand {
    /// App name.
    app: String,

    /// Image reference to roll out.
    image: String,

    /// How the image was built (herokuish, dockerfile or pack).
    #[arg(long, default_value = "dockerfile")]
    image_source_type: String,

    /// Replicas per process type, e.g. `--process web=2`. Defaults to one web replica.
    #[arg(long = "process", value_parser = parse_key_value)]
    processes: Vec<(String, String)>,

    /// Working directory of the processes.
    #[arg(long)]
    working_dir: Option<String>,
}

#[derive(Debug, Serialize)]
struct DeployResponse {
    app: String,
    deployment_id: i64,
    releases: Vec<String>,
}

impl DeployCommand {
    fn processes(&self) -> Result<BTreeMap<String, u32>> {
        if self.processes.is_empty() {
            return Ok(BTreeMap::from([(WEB_PROCESS.to_string(), 1)]));
        }
        self.processes
            .iter()
            .map(|(process, raw)| {
                raw.parse::<u32>()
                    .map(|count| (process.clone(), count))
                    .map_err(|_| anyhow::Error::from(CliError::invalid("replica count", raw)))
            })
            .collect()
    }

    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let processes = self.processes()?;
        let image_source_type = self.image_source_type.parse::<ImageSourceType>()?;
        let healthchecks = match ctx.providers.app_json(&self.app).await {
            Ok(app_json) => app_json.healthchecks,
            Err(err) => {
                debug!(app = %self.app, error = %err, "No healthchecks loaded");
                BTreeMap::new()
            }
        };

        let request = DeployRequest {
            app: self.app,
            image: self.image,
            image_source_type,
            processes,
            healthchecks,
            working_dir: self.working_dir,
        };
        let outcome = ctx.deployer().await?.deploy(&request, &ctx.cancel).await?;

        match ctx.format {
            OutputFormat::Table => {
                print_success(&format!(
                    "Deployed {} (deployment {})",
                    request.app, outcome.deployment_id
                ));
                for release in &outcome.releases {
                    print_info(&format!("Release {release}"));
                }
            }
            OutputFormat::Json => print_single(&DeployResponse {
                app: request.app,
                deployment_id: outcome.deployment_id,
                releases: outcome.releases.into_iter().collect(),
            }),
        }
        Ok(())
    }
}

#[derive(Debug, Args)]
pub struct StopCommand {
    /// App name.
    app: String,
}

impl StopCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let stopped = ctx.deployer().await?.stop(&self.app).await?;
        if stopped.is_empty() {
            print_info(&format!("{} has no running deployments", self.app));
        } else {
            print_success(&format!("Stopped {}", stopped.join(", ")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Debug, Parser)]
    struct Harness {
        #[command(flatten)]
        deploy: DeployCommand,
    }

    fn parse(args: &[&str]) -> DeployCommand {
        let mut argv = vec!["deploy"];
        argv.extend_from_slice(args);
        Harness::try_parse_from(argv).unwrap().deploy
    }

    #[test]
    fn test_processes_default_to_one_web() {
        let cmd = parse(&["foo", "registry/foo:1"]);
        assert_eq!(cmd.processes().unwrap(), BTreeMap::from([("web".to_string(), 1)]));
    }

    #[test]
    fn test_processes_from_flags() {
        let cmd = parse(&["foo", "img", "--process", "web=2", "--process", "worker=0"]);
        let processes = cmd.processes().unwrap();
        assert_eq!(processes["web"], 2);
        assert_eq!(processes["worker"], 0);
    }

    #[test]
    fn test_negative_replicas_rejected() {
        let cmd = parse(&["foo", "img", "--process", "web=-1"]);
        let err = cmd.processes().unwrap_err();
        assert_eq!(err.to_string(), "Invalid replica count: -1");
    }
}
