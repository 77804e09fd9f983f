//! CLI commands.

mod certs;
mod cluster;
mod cron;
mod deploy;
mod properties;
mod run;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use plfm_properties::FilePropertyStore;
use plfm_scheduler_k3s::providers::FileProviders;
use plfm_scheduler_k3s::{
    cancel_on_shutdown, CancelToken, ChartManager, Clock, ClusterClient, ClusterManager, Deployer,
    HelmCli, LazyClusterClient, Properties, Providers, ReadinessWaiter, Runner, SchedulerConfig,
    SystemClock, TlsSynchronizer,
};

use crate::output::OutputFormat;

/// k3sctl - Manage the k3s cluster behind plfm apps.
#[derive(Debug, Parser)]
#[command(name = "k3sctl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Output format.
    #[arg(long, global = true, value_enum, default_value = "table")]
    format: OutputFormat,

    /// Emit logs as JSON.
    #[arg(long, global = true, env = "PLFM_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Install k3s on this host and bootstrap the cluster.
    Initialize(cluster::InitializeCommand),

    /// Manage cluster nodes.
    Cluster(cluster::ClusterCommand),

    /// Print the cluster kubeconfig.
    ShowKubeconfig,

    /// Remove k3s from this host.
    Uninstall,

    /// Set or clear a scheduler property.
    Set(properties::SetCommand),

    /// Show scheduler properties of an app.
    Report(properties::ReportCommand),

    /// Manage imported TLS certificates.
    Certs(certs::CertsCommand),

    /// Show cron entries of every app.
    Cron(cron::CronCommand),

    /// Deploy an image.
    Deploy(deploy::DeployCommand),

    /// Scale every process of an app to zero.
    Stop(deploy::StopCommand),

    /// Start a one-off job from the deployed release.
    Run(run::RunCommand),

    /// Open a shell or run a command in a running pod.
    Enter(run::EnterCommand),
}

impl Cli {
    pub fn log_json(&self) -> bool {
        self.log_json
    }

    /// Run the CLI command.
    pub async fn run(self) -> Result<()> {
        let config =
            SchedulerConfig::from_env().context("Failed to load scheduler configuration")?;
        let store = Arc::new(FilePropertyStore::new(config.properties_root.clone()));
        let ctx = CommandContext {
            properties: Properties::new(store.clone()),
            providers: Arc::new(FileProviders::new(&config, store)),
            config,
            format: self.format,
            clock: Arc::new(SystemClock),
            cancel: cancel_on_shutdown(),
        };

        match self.command {
            Commands::Initialize(cmd) => cmd.run(ctx).await,
            Commands::Cluster(cmd) => cmd.run(ctx).await,
            Commands::ShowKubeconfig => cluster::show_kubeconfig(ctx).await,
            Commands::Uninstall => cluster::uninstall(ctx).await,
            Commands::Set(cmd) => cmd.run(ctx).await,
            Commands::Report(cmd) => cmd.run(ctx).await,
            Commands::Certs(cmd) => cmd.run(ctx).await,
            Commands::Cron(cmd) => cmd.run(ctx).await,
            Commands::Deploy(cmd) => cmd.run(ctx).await,
            Commands::Stop(cmd) => cmd.run(ctx).await,
            Commands::Run(cmd) => cmd.run(ctx).await,
            Commands::Enter(cmd) => cmd.run(ctx).await,
        }
    }
}

/// Shared command context.
pub struct CommandContext {
    pub config: SchedulerConfig,
    pub format: OutputFormat,
    pub properties: Properties,
    pub providers: Arc<FileProviders>,
    pub clock: Arc<dyn Clock>,
    pub cancel: CancelToken,
}

/// Cluster-facing collaborators.
pub struct Backend {
    pub client: Arc<dyn ClusterClient>,
    pub charts: Arc<dyn ChartManager>,
}

impl CommandContext {
    async fn kubeconfig_path(&self) -> Result<PathBuf> {
        match &self.config.kubeconfig_override {
            Some(path) => Ok(path.clone()),
            None => self
                .properties
                .kubeconfig_path()
                .await
                .context("Failed to read kubeconfig-path"),
        }
    }

    /// Kubernetes client and helm, connecting on first use.
    pub async fn backend(&self) -> Result<Backend> {
        let kubeconfig = self.kubeconfig_path().await?;
        let context = self.properties.kube_context().await?;
        let client: Arc<dyn ClusterClient> =
            Arc::new(LazyClusterClient::new(kubeconfig.clone(), context.clone()));
        let charts = Arc::new(HelmCli::new(
            self.config.helm_bin.clone(),
            kubeconfig,
            context,
            client.clone(),
        ));
        Ok(Backend { client, charts })
    }

    pub fn providers(&self) -> Providers {
        Providers::from_single(self.providers.clone())
    }

    fn waiter(&self, client: Arc<dyn ClusterClient>) -> ReadinessWaiter {
        ReadinessWaiter::new(client, self.clock.clone()).with_poll_interval(self.config.poll_interval)
    }

    pub async fn cluster_manager(&self) -> Result<ClusterManager> {
        let backend = self.backend().await?;
        Ok(ClusterManager::new(
            self.config.clone(),
            self.properties.clone(),
            backend.client,
            backend.charts,
            self.clock.clone(),
        ))
    }

    pub async fn deployer(&self) -> Result<Deployer> {
        let backend = self.backend().await?;
        let waiter = self.waiter(backend.client.clone());
        Ok(Deployer::new(
            backend.client,
            backend.charts,
            self.properties.clone(),
            self.providers(),
            self.clock.clone(),
        )
        .with_waiter(waiter))
    }

    pub async fn runner(&self) -> Result<Runner> {
        let backend = self.backend().await?;
        let waiter = self.waiter(backend.client.clone());
        Ok(Runner::new(
            backend.client,
            self.properties.clone(),
            self.providers(),
            self.clock.clone(),
        )
        .with_waiter(waiter))
    }

    pub async fn tls(&self) -> Result<TlsSynchronizer> {
        let backend = self.backend().await?;
        Ok(TlsSynchronizer::new(
            backend.client,
            backend.charts,
            self.properties.clone(),
            self.providers.clone(),
            self.providers.clone(),
            self.clock.clone(),
        ))
    }
}

/// Parse `KEY=VALUE`.
pub(crate) fn parse_key_value(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("web=2", Some(("web", "2")))]
    #[case("A=b=c", Some(("A", "b=c")))]
    #[case("EMPTY=", Some(("EMPTY", "")))]
    #[case("=1", None)]
    #[case("web", None)]
    fn test_parse_key_value(#[case] raw: &str, #[case] expected: Option<(&str, &str)>) {
        let parsed = parse_key_value(raw).ok();
        let expected = expected.map(|(k, v)| (k.to_string(), v.to_string()));
        assert_eq!(parsed, expected);
    }

    #[test]
    fn test_cli_parses_global_set() {
        let cli = Cli::try_parse_from(["k3sctl", "set", "--global", "deploy-timeout", "60s"]).unwrap();
        assert!(matches!(cli.command, Commands::Set(_)));
    }

    #[test]
    fn test_cli_parses_run_with_trailing_command() {
        let cli = Cli::try_parse_from(["k3sctl", "run", "foo", "-e", "A=1", "--", "ls", "-la"]).unwrap();
        assert!(matches!(cli.command, Commands::Run(_)));
    }
}
