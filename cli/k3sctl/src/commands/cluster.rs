//! Cluster commands (k3s installation and membership).

use anyhow::Result;
use clap::{Args, Subcommand};
use plfm_scheduler_k3s::cluster::node::{Node, NodeRole};
use plfm_scheduler_k3s::properties::IngressClass;
use plfm_scheduler_k3s::{ClusterAddInput, InitializeInput};
use serde::Serialize;
use tabled::Tabled;

use crate::error::CliError;
use crate::output::{display_option, print_output, print_success};

use super::CommandContext;

#[derive(Debug, Args)]
pub struct InitializeCommand {
    /// Ingress controller to install (traefik or nginx). Defaults to the `ingress-class` property.
    #[arg(long)]
    ingress_class: Option<String>,

    /// Address the server registers with. Defaults to the `network-interface` address.
    #[arg(long)]
    server_ip: Option<String>,

    /// Keep app workloads off this server.
    #[arg(long)]
    taint_scheduling: bool,
}

impl InitializeCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let ingress_class = match self.ingress_class {
            Some(raw) => raw.parse::<IngressClass>()?,
            None => ctx.properties.ingress_class().await?,
        };
        let manager = ctx.cluster_manager().await?;
        manager
            .initialize(
                &InitializeInput {
                    ingress_class,
                    server_ip: self.server_ip,
                    taint_scheduling: self.taint_scheduling,
                },
                &ctx.cancel,
            )
            .await?;
        print_success("k3s cluster initialized");
        Ok(())
    }
}

/// Cluster commands.
#[derive(Debug, Args)]
pub struct ClusterCommand {
    #[command(subcommand)]
    command: ClusterSubcommand,
}

#[derive(Debug, Subcommand)]
enum ClusterSubcommand {
    /// Join a remote host to the cluster.
    Add(AddNodeArgs),

    /// Drain and remove a node.
    Remove(RemoveNodeArgs),

    /// List cluster nodes.
    List,
}

#[derive(Debug, Args)]
struct AddNodeArgs {
    /// `ssh://user@host[:port]` of the node to join.
    remote_host: String,

    /// Role of the new node (server or worker).
    #[arg(long, default_value = "worker")]
    role: String,

    /// Address of an existing server. Defaults to this host.
    #[arg(long)]
    server_ip: Option<String>,

    /// Accept ssh host keys not yet in known_hosts.
    #[arg(long)]
    insecure_allow_unknown_hosts: bool,

    /// Keep app workloads off a joining server.
    #[arg(long)]
    taint_scheduling: bool,
}

#[derive(Debug, Args)]
struct RemoveNodeArgs {
    /// Node name.
    node: String,
}

impl ClusterCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        match self.command {
            ClusterSubcommand::Add(args) => add_node(ctx, args).await,
            ClusterSubcommand::Remove(args) => remove_node(ctx, args).await,
            ClusterSubcommand::List => list_nodes(ctx).await,
        }
    }
}

#[derive(Debug, Clone, Serialize, Tabled)]
struct NodeRow {
    #[tabled(rename = "Name")]
    name: String,

    #[tabled(rename = "Ready")]
    ready: bool,

    #[tabled(rename = "Roles")]
    roles: String,

    #[tabled(rename = "Remote Host", display = "display_option")]
    remote_host: Option<String>,

    #[tabled(rename = "Version")]
    version: String,
}

impl From<Node> for NodeRow {
    fn from(node: Node) -> Self {
        Self {
            name: node.name,
            ready: node.ready,
            roles: node.roles.join(","),
            remote_host: node.remote_host,
            version: node.version,
        }
    }
}

async fn add_node(ctx: CommandContext, args: AddNodeArgs) -> Result<()> {
    let role = args
        .role
        .parse::<NodeRole>()
        .map_err(|_| CliError::invalid("role", &args.role))?;
    let manager = ctx.cluster_manager().await?;
    if !manager.is_k3s_installed().await? {
        return Err(CliError::NotInstalled.into());
    }
    manager
        .cluster_add(&ClusterAddInput {
            role,
            remote_host: args.remote_host.clone(),
            server_ip: args.server_ip,
            allow_unknown_hosts: args.insecure_allow_unknown_hosts,
            taint_scheduling: args.taint_scheduling,
        })
        .await?;
    print_success(&format!("Joined {} as {role}", args.remote_host));
    Ok(())
}

async fn remove_node(ctx: CommandContext, args: RemoveNodeArgs) -> Result<()> {
    ctx.cluster_manager().await?.cluster_remove(&args.node).await?;
    print_success(&format!("Removed node {}", args.node));
    Ok(())
}

async fn list_nodes(ctx: CommandContext) -> Result<()> {
    let nodes = ctx.cluster_manager().await?.list_nodes().await?;
    let rows: Vec<NodeRow> = nodes.into_iter().map(NodeRow::from).collect();
    print_output(&rows, ctx.format);
    Ok(())
}

pub async fn show_kubeconfig(ctx: CommandContext) -> Result<()> {
    let kubeconfig = ctx.cluster_manager().await?.show_kubeconfig().await?;
    print!("{kubeconfig}");
    Ok(())
}

pub async fn uninstall(ctx: CommandContext) -> Result<()> {
    ctx.cluster_manager().await?.uninstall().await?;
    print_success("k3s uninstalled");
    Ok(())
}
