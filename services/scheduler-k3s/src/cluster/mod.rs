//! Cluster membership.
//!
//! [`ClusterManager`] bootstraps k3s on the scheduler host, joins and removes
//! remote nodes over ssh, and installs the cluster-wide charts (ingress
//! controller, cert-manager, cluster issuers).
//!
//! Remote operations run strictly in order over fresh connections and stop at
//! the first failure. Nothing is rolled back; a half-joined node is cleaned up
//! with `cluster remove` or by re-running the installer.
//!
//! ## Modules
//!
//! - [`node`]: node view, roles and labels
//! - [`installer`]: k3s installer download and arguments
//! - [`registry`]: `registries.yaml` seeding and distribution
//! - [`local`]: host command runner
//! - [`remote`]: ssh and sftp executor

pub mod installer;
pub mod local;
pub mod node;
pub mod registry;
pub mod remote;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::cancel::CancelToken;
use crate::clock::Clock;
use crate::cluster_client::ClusterClient;
use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::helm::{system_charts, ChartInput, ChartManager};
use crate::manifest::chart::{write_chart, ChartMetadata};
use crate::manifest::ingress::{cluster_issuer, CERT_MANAGER_NAMESPACE};
use crate::manifest::Manifest;
use crate::properties::{IngressClass, LetsencryptServer, Properties};

use installer::{
    download_installer, generate_token, init_args, interface_ipv4, join_args, node_name,
    APT_PACKAGES, REMOTE_INSTALLER_PATH,
};
use local::{check_local, CommandRunner, SystemCommandRunner};
use node::{Node, NodeRole, REMOTE_HOST_ANNOTATION};
use remote::{run_checked, Connection, OpenSshExecutor, RemoteCommand, RemoteExecutor, RemoteHost};

/// Attempts made while waiting for a node to register.
pub const NODE_WAIT_ATTEMPTS: u32 = 20;

/// Pause between node lookups.
pub const NODE_WAIT_INTERVAL: Duration = Duration::from_secs(1);

/// Release holding the Let's Encrypt cluster issuers.
pub const CLUSTER_ISSUERS_RELEASE: &str = "cluster-issuers";

/// Options for bootstrapping a cluster on this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitializeInput {
    pub ingress_class: IngressClass,
    /// Address the node registers with. Defaults to the `network-interface` address.
    pub server_ip: Option<String>,
    pub taint_scheduling: bool,
}

/// Options for joining a remote node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterAddInput {
    pub role: NodeRole,
    /// `ssh://user@host:port`.
    pub remote_host: String,
    /// Address of an existing server. Defaults to this host.
    pub server_ip: Option<String>,
    pub allow_unknown_hosts: bool,
    pub taint_scheduling: bool,
}

pub struct ClusterManager {
    config: SchedulerConfig,
    properties: Properties,
    client: Arc<dyn ClusterClient>,
    charts: Arc<dyn ChartManager>,
    clock: Arc<dyn Clock>,
    local: Arc<dyn CommandRunner>,
    remote: Arc<dyn RemoteExecutor>,
    http: reqwest::Client,
}

impl ClusterManager {
    pub fn new(
        config: SchedulerConfig,
        properties: Properties,
        client: Arc<dyn ClusterClient>,
        charts: Arc<dyn ChartManager>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let remote = Arc::new(OpenSshExecutor::new(config.ssh_key_dir.clone()));
        Self {
            config,
            properties,
            client,
            charts,
            clock,
            local: Arc::new(SystemCommandRunner),
            remote,
            http: reqwest::Client::new(),
        }
    }

    pub fn with_local_runner(mut self, local: Arc<dyn CommandRunner>) -> Self {
        self.local = local;
        self
    }

    pub fn with_remote_executor(mut self, remote: Arc<dyn RemoteExecutor>) -> Self {
        self.remote = remote;
        self
    }

    async fn kubeconfig_path(&self) -> Result<PathBuf> {
        match &self.config.kubeconfig_override {
            Some(path) => Ok(path.clone()),
            None => self.properties.kubeconfig_path().await,
        }
    }

    /// Whether the k3s binary and its kubeconfig both exist.
    pub async fn is_k3s_installed(&self) -> Result<bool> {
        let binary = tokio::fs::try_exists(&self.config.k3s_bin)
            .await
            .unwrap_or(false);
        let kubeconfig = tokio::fs::try_exists(self.kubeconfig_path().await?)
            .await
            .unwrap_or(false);
        Ok(binary && kubeconfig)
    }

    async fn server_ip(&self, requested: Option<&str>) -> Result<String> {
        if let Some(ip) = requested.filter(|ip| !ip.is_empty()) {
            return Ok(ip.to_string());
        }
        let interface = self.properties.network_interface().await?;
        let ip = interface_ipv4(&interface)?.to_string();
        debug!(interface = %interface, ip = %ip, "Using server ip address");
        Ok(ip)
    }

    async fn run_local(&self, name: &str, program: &str, args: &[String]) -> Result<()> {
        check_local(name, self.local.run(program, args).await?)?;
        Ok(())
    }

    async fn install_dependencies(&self) -> Result<()> {
        info!("Updating apt");
        self.run_local("apt-get update", "apt-get", &["update".to_string()])
            .await?;

        info!("Installing k3s dependencies");
        let mut args = vec!["-y".to_string(), "install".to_string()];
        args.extend(APT_PACKAGES.iter().map(|p| p.to_string()));
        self.run_local("apt-get install", "apt-get", &args).await
    }

    /// Poll until `name` registers with the API server.
    async fn wait_for_node(&self, name: &str) -> Result<Node> {
        let mut last_error = None;
        for attempt in 1..=NODE_WAIT_ATTEMPTS {
            match self.client.get_node(name).await {
                Ok(node) => return Ok(Node::from(&node)),
                Err(err) if err.is_not_found() => {}
                Err(err) => last_error = Some(err),
            }
            debug!(node = %name, attempt, "Node not registered yet");
            self.clock.sleep(NODE_WAIT_INTERVAL).await;
        }
        Err(last_error.unwrap_or_else(|| {
            SchedulerError::config(format!(
                "Unable to find node {name} after joining cluster, node will not be labeled"
            ))
        }))
    }

    async fn label_node(&self, name: &str, role: NodeRole) -> Result<()> {
        for (key, value) in role.labels() {
            info!(node = %name, "Labeling node {key}={value}");
            self.client.label_node(name, key, value).await?;
        }
        Ok(())
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Install k3s on this host as the first server of a new cluster.
    pub async fn initialize(&self, input: &InitializeInput, cancel: &CancelToken) -> Result<()> {
        if self.is_k3s_installed().await? {
            return Err(SchedulerError::config(
                "k3s already installed, cannot re-initialize k3s",
            ));
        }
        let server_ip = self.server_ip(input.server_ip.as_deref()).await?;

        info!(server_ip = %server_ip, ingress_class = %input.ingress_class, "Initializing k3s");
        self.install_dependencies().await?;

        info!("Downloading k3s installer");
        let installer = download_installer(&self.http, &self.config.installer_url).await?;

        let token = match self.properties.token().await? {
            Some(token) => token,
            None => {
                let token = generate_token();
                self.properties.set_global("token", &token).await?;
                token
            }
        };

        let node = node_name(&server_ip);
        self.properties
            .set_global("ingress-class", input.ingress_class.as_str())
            .await?;

        info!(node = %node, "Running k3s installer");
        self.run_local(
            "k3s installer",
            &installer.display().to_string(),
            &init_args(&node, &token, input.taint_scheduling),
        )
        .await?;
        drop(installer);

        info!(node = %node, "Waiting for node to exist");
        self.wait_for_node(&node).await?;
        self.label_node(&node, NodeRole::Server).await?;

        registry::seed_registry_config(
            &self.config.registry_config_path,
            &self.config.system_user,
            self.local.as_ref(),
        )
        .await?;

        info!("Installing helm charts");
        for chart in system_charts(input.ingress_class) {
            self.charts.ensure_repo_chart(&chart, cancel).await?;
        }
        self.apply_cluster_issuers(cancel).await?;

        info!(node = %node, "Done");
        Ok(())
    }

    /// Join a remote host to the cluster.
    pub async fn cluster_add(&self, input: &ClusterAddInput) -> Result<()> {
        let token = self
            .properties
            .token()
            .await?
            .ok_or_else(|| SchedulerError::config("Missing k3s token"))?;
        if input.taint_scheduling && input.role == NodeRole::Worker {
            return Err(SchedulerError::config(
                "Taint scheduling can only be used on the server role",
            ));
        }
        if !self.is_k3s_installed().await? {
            return Err(SchedulerError::config(
                "k3s not installed, cannot add node to cluster",
            ));
        }
        self.client.ping().await.map_err(|e| {
            SchedulerError::Unavailable(format!("cannot add node to cluster: {e}"))
        })?;

        let server_ip = self.server_ip(input.server_ip.as_deref()).await?;
        let host: RemoteHost = input.remote_host.parse()?;
        let connection = Connection {
            host: host.clone(),
            allow_unknown_hosts: input.allow_unknown_hosts,
        };
        let remote = self.remote.as_ref();

        info!(host = %host, role = %input.role, "Joining host to k3s cluster");

        info!("Updating apt");
        run_checked(remote, &connection, &RemoteCommand::new("apt-get update", "apt-get", ["update"]).sudo())
            .await?;

        info!("Installing k3s dependencies");
        let mut packages = vec!["-y", "install"];
        packages.extend_from_slice(APT_PACKAGES);
        run_checked(
            remote,
            &connection,
            &RemoteCommand::new("apt-get install", "apt-get", packages).sudo(),
        )
        .await?;

        info!("Downloading k3s installer");
        run_checked(
            remote,
            &connection,
            &RemoteCommand::new(
                "curl",
                "curl",
                ["-sfL", "-o", REMOTE_INSTALLER_PATH, self.config.installer_url.as_str()],
            ),
        )
        .await?;
        run_checked(
            remote,
            &connection,
            &RemoteCommand::new("chmod", "chmod", ["0755", REMOTE_INSTALLER_PATH]),
        )
        .await?;

        registry::copy_registry_to_node(remote, &connection, &self.config.registry_config_path)
            .await?;

        let node = node_name(&host.host);
        let args = join_args(
            input.role == NodeRole::Server,
            &node,
            &server_ip,
            &token,
            input.taint_scheduling,
        );
        info!(node = %node, "Adding node to k3s cluster");
        run_checked(
            remote,
            &connection,
            &RemoteCommand::new("k3s installer", REMOTE_INSTALLER_PATH, args).sudo(),
        )
        .await?;

        info!(node = %node, "Waiting for node to exist");
        self.wait_for_node(&node).await?;
        self.label_node(&node, input.role).await?;

        info!(node = %node, "Annotating node with connection information");
        self.client
            .annotate_node(&node, REMOTE_HOST_ANNOTATION, &host.to_string())
            .await?;
        Ok(())
    }

    /// Uninstall k3s from a remote node and delete it from the cluster.
    pub async fn cluster_remove(&self, name: &str) -> Result<()> {
        if !self.is_k3s_installed().await? {
            return Err(SchedulerError::config(
                "k3s not installed, cannot remove node from cluster",
            ));
        }
        self.client.ping().await?;

        info!(node = %name, "Removing node from k3s cluster");
        let node = Node::from(&self.client.get_node(name).await?);
        let Some(remote_host) = node.remote_host else {
            return Err(SchedulerError::config(format!(
                "Node {name} is not a remote node managed by plfm"
            )));
        };

        let connection = Connection {
            host: remote_host.parse()?,
            allow_unknown_hosts: true,
        };
        let uninstall_script = self.config.k3s_uninstall_script.display().to_string();
        run_checked(
            self.remote.as_ref(),
            &connection,
            &RemoteCommand::new("k3s uninstall", &uninstall_script, Vec::<String>::new()).sudo(),
        )
        .await?;

        self.client.delete_node(name).await?;
        info!(node = %name, "Removed node");
        Ok(())
    }

    /// Every node in the cluster.
    pub async fn list_nodes(&self) -> Result<Vec<Node>> {
        self.client.ping().await?;
        let nodes = self.client.list_nodes(None).await?;
        Ok(nodes.iter().map(Node::from).collect())
    }

    /// Remove k3s from this host.
    pub async fn uninstall(&self) -> Result<()> {
        if !self.is_k3s_installed().await? {
            return Err(SchedulerError::config("k3s not installed, cannot uninstall"));
        }
        info!("Uninstalling k3s");
        let script = self.config.k3s_uninstall_script.display().to_string();
        self.run_local("k3s uninstaller", &script, &[]).await
    }

    /// Contents of the kubeconfig in use.
    pub async fn show_kubeconfig(&self) -> Result<String> {
        let path = self.kubeconfig_path().await?;
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(SchedulerError::config(format!(
                "Kubeconfig file does not exist: {}",
                path.display()
            )));
        }
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| SchedulerError::path_io(&path, e))
    }

    /// Install a ClusterIssuer for every Let's Encrypt environment with an email.
    ///
    /// Environments without an email are left out of the release, which
    /// removes a previously installed issuer.
    pub async fn apply_cluster_issuers(&self, cancel: &CancelToken) -> Result<()> {
        let class = self.properties.ingress_class().await?;
        let mut manifests = Vec::new();
        let mut enabled = Vec::new();
        for server in [LetsencryptServer::Prod, LetsencryptServer::Stag] {
            let Some(email) = self.properties.letsencrypt_email(server).await? else {
                continue;
            };
            let issuer = cluster_issuer(server, &email, class);
            manifests.push(Manifest::new("ClusterIssuer", server.issuer_name(), &issuer)?);
            enabled.push(server.issuer_name());
        }

        let values = serde_json::json!({ "clusterIssuers": enabled });
        let chart = write_chart(
            ChartMetadata::new(CLUSTER_ISSUERS_RELEASE, self.clock.unix_timestamp()),
            &values,
            &manifests,
        )
        .await?;

        info!(issuers = ?enabled, "Applying cluster issuers");
        self.charts
            .install_or_upgrade(
                &ChartInput {
                    chart_path: chart.path().to_path_buf(),
                    namespace: CERT_MANAGER_NAMESPACE.to_string(),
                    release_name: CLUSTER_ISSUERS_RELEASE.to_string(),
                    values,
                    rollback_on_failure: false,
                    timeout: self.properties.global_deploy_timeout().await?,
                    wait: false,
                },
                cancel,
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::cluster_client::MockClusterClient;
    use crate::helm::MockChartManager;
    use local::MockCommandRunner;
    use node::mock_node;
    use plfm_properties::MemoryPropertyStore;
    use remote::MockRemoteExecutor;
    use tempfile::TempDir;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Fixture {
        _dir: TempDir,
        config: SchedulerConfig,
        cluster: Arc<MockClusterClient>,
        charts: Arc<MockChartManager>,
        properties: Properties,
    }

    fn fixture(installed: bool) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = SchedulerConfig {
            k3s_bin: dir.path().join("k3s"),
            k3s_uninstall_script: dir.path().join("k3s-uninstall.sh"),
            registry_config_path: dir.path().join("registries.yaml"),
            kubeconfig_override: Some(dir.path().join("k3s.yaml")),
            ..SchedulerConfig::default()
        };
        if installed {
            std::fs::write(&config.k3s_bin, "").unwrap();
            std::fs::write(dir.path().join("k3s.yaml"), "apiVersion: v1\n").unwrap();
        }
        Fixture {
            _dir: dir,
            config,
            cluster: Arc::new(MockClusterClient::new()),
            charts: Arc::new(MockChartManager::new()),
            properties: Properties::new(Arc::new(MemoryPropertyStore::new())),
        }
    }

    impl Fixture {
        fn manager(&self) -> ClusterManager {
            ClusterManager::new(
                self.config.clone(),
                self.properties.clone(),
                self.cluster.clone(),
                self.charts.clone(),
                Arc::new(ManualClock::default()),
            )
        }
    }

    #[tokio::test]
    async fn test_initialize() {
        let f = fixture(false);
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("#!/bin/sh\n"))
            .mount(&server)
            .await;
        let mut config = f.config.clone();
        config.installer_url = server.uri();
        let runner = Arc::new(MockCommandRunner::new().with_cluster(f.cluster.clone()));
        let manager = ClusterManager::new(
            config,
            f.properties.clone(),
            f.cluster.clone(),
            f.charts.clone(),
            Arc::new(ManualClock::default()),
        )
        .with_local_runner(runner.clone());

        manager
            .initialize(
                &InitializeInput {
                    ingress_class: IngressClass::Nginx,
                    server_ip: Some("10.0.0.2".to_string()),
                    taint_scheduling: false,
                },
                &CancelToken::never(),
            )
            .await
            .unwrap();

        let calls = runner.calls();
        assert_eq!(calls[0], vec!["apt-get", "update"]);
        assert_eq!(calls[1][..3], ["apt-get", "-y", "install"]);
        assert!(calls[2].contains(&"--cluster-init".to_string()));
        assert_eq!(calls[3][0], "setfacl");

        let token = f.properties.token().await.unwrap().unwrap();
        assert!(calls[2].contains(&token));
        assert_eq!(f.properties.ingress_class().await.unwrap(), IngressClass::Nginx);

        let nodes = manager.list_nodes().await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert!(nodes[0].name.starts_with("ip-10-0-0-2-"));
        let labels = f.cluster.node(&nodes[0].name).unwrap().metadata.labels.unwrap();
        assert_eq!(labels["svccontroller.k3s.cattle.io/enablelb"], "true");

        assert_eq!(f.charts.system_charts(), vec!["cert-manager", "ingress-nginx"]);
        assert_eq!(f.charts.installs()[0].release, CLUSTER_ISSUERS_RELEASE);
        assert!(f.config.registry_config_path.exists());
    }

    #[tokio::test]
    async fn test_initialize_refuses_existing_install() {
        let f = fixture(true);
        let err = f
            .manager()
            .initialize(
                &InitializeInput {
                    ingress_class: IngressClass::Traefik,
                    server_ip: Some("10.0.0.2".to_string()),
                    taint_scheduling: false,
                },
                &CancelToken::never(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "k3s already installed, cannot re-initialize k3s");
    }

    fn add_input(role: NodeRole, taint: bool) -> ClusterAddInput {
        ClusterAddInput {
            role,
            remote_host: "ssh://root@10.0.0.3:22".to_string(),
            server_ip: Some("10.0.0.2".to_string()),
            allow_unknown_hosts: true,
            taint_scheduling: taint,
        }
    }

    #[tokio::test]
    async fn test_cluster_add_preconditions() {
        let f = fixture(true);
        let manager = f.manager();
        let err = manager.cluster_add(&add_input(NodeRole::Worker, false)).await.unwrap_err();
        assert_eq!(err.to_string(), "Missing k3s token");

        f.properties.set_global("token", "abc").await.unwrap();
        let err = manager.cluster_add(&add_input(NodeRole::Worker, true)).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Taint scheduling can only be used on the server role"
        );

        let offline = fixture(false);
        offline.properties.set_global("token", "abc").await.unwrap();
        let err = offline
            .manager()
            .cluster_add(&add_input(NodeRole::Server, true))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("k3s not installed"));
    }

    #[tokio::test]
    async fn test_cluster_add_worker() {
        let f = fixture(true);
        f.properties.set_global("token", "abc").await.unwrap();
        let remote = Arc::new(MockRemoteExecutor::new().with_cluster(f.cluster.clone()));
        let manager = f.manager().with_remote_executor(remote.clone());

        manager.cluster_add(&add_input(NodeRole::Worker, false)).await.unwrap();

        let steps = remote.steps();
        assert_eq!(steps[0], "ssh root@10.0.0.3 sudo apt-get update");
        assert!(steps[1].starts_with("ssh root@10.0.0.3 sudo apt-get -y install ca-certificates"));
        assert!(steps[2].contains("curl -sfL -o /tmp/k3s-installer.sh"));
        assert_eq!(steps[3], "ssh root@10.0.0.3 chmod 0755 /tmp/k3s-installer.sh");
        assert!(steps[4].starts_with("sftp root@10.0.0.3 "));
        assert!(steps[9].starts_with("ssh root@10.0.0.3 sudo /tmp/k3s-installer.sh --disable"));
        assert!(steps[9].contains("--disable-apiserver"));

        let nodes = manager.list_nodes().await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert!(nodes[0].name.starts_with("ip-10-0-0-3-"));
        let labels = f.cluster.node(&nodes[0].name).unwrap().metadata.labels.unwrap();
        assert_eq!(labels["node-role.kubernetes.io/worker"], "worker");
        assert_eq!(nodes[0].remote_host.as_deref(), Some("ssh://root@10.0.0.3:22"));
    }

    #[tokio::test]
    async fn test_cluster_add_stops_at_first_failure() {
        let f = fixture(true);
        f.properties.set_global("token", "abc").await.unwrap();
        let remote = Arc::new(MockRemoteExecutor::new().fail_at(1, 100, "E: broken packages"));
        let manager = f.manager().with_remote_executor(remote.clone());

        let err = manager.cluster_add(&add_input(NodeRole::Server, false)).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid exit code from apt-get install command over ssh: 100"
        );
        assert_eq!(err.stderr(), Some("E: broken packages"));
        assert_eq!(remote.steps().len(), 2);
    }

    #[tokio::test]
    async fn test_cluster_remove() {
        let f = fixture(true);
        f.cluster.insert_node(mock_node("local", &[], &[]));
        f.cluster.insert_node(mock_node(
            "ip-10-0-0-3-aa",
            &[],
            &[(REMOTE_HOST_ANNOTATION, "ssh://root@10.0.0.3:22")],
        ));
        let remote = Arc::new(MockRemoteExecutor::new());
        let manager = f.manager().with_remote_executor(remote.clone());

        let err = manager.cluster_remove("local").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Node local is not a remote node managed by plfm"
        );

        manager.cluster_remove("ip-10-0-0-3-aa").await.unwrap();
        assert_eq!(
            remote.steps(),
            vec![format!(
                "ssh root@10.0.0.3 sudo {}",
                f.config.k3s_uninstall_script.display()
            )]
        );
        assert!(f.cluster.node("ip-10-0-0-3-aa").is_none());
    }

    #[tokio::test]
    async fn test_show_kubeconfig() {
        let f = fixture(true);
        assert_eq!(f.manager().show_kubeconfig().await.unwrap(), "apiVersion: v1\n");

        let missing = fixture(false);
        let err = missing.manager().show_kubeconfig().await.unwrap_err();
        assert!(err.to_string().starts_with("Kubeconfig file does not exist"));
    }

    #[tokio::test]
    async fn test_uninstall_runs_script() {
        let f = fixture(true);
        let runner = Arc::new(MockCommandRunner::new());
        f.manager()
            .with_local_runner(runner.clone())
            .uninstall()
            .await
            .unwrap();
        assert_eq!(
            runner.calls(),
            vec![vec![f.config.k3s_uninstall_script.display().to_string()]]
        );
    }

    #[tokio::test]
    async fn test_apply_cluster_issuers() {
        let f = fixture(true);
        f.properties
            .set_global("letsencrypt-email-prod", "ops@example.com")
            .await
            .unwrap();
        f.manager()
            .apply_cluster_issuers(&CancelToken::never())
            .await
            .unwrap();

        let install = f.charts.latest(CERT_MANAGER_NAMESPACE, CLUSTER_ISSUERS_RELEASE).unwrap();
        assert_eq!(install.values["clusterIssuers"], serde_json::json!(["letsencrypt-prod"]));
        assert_eq!(install.files.len(), 1);
    }
}
