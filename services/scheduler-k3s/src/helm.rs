//! Release deployer.
//!
//! [`ChartManager`] installs, upgrades and removes chart releases.
//! [`HelmCli`] drives the `helm` binary; [`MockChartManager`] records calls
//! and can apply rendered objects to a [`MockClusterClient`].

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Output, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::Secret;
use serde::Deserialize;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::cluster_client::{mock_pod, ClusterClient, MockClusterClient};
use crate::error::{Result, SchedulerError};
use crate::properties::IngressClass;

/// Revisions helm keeps per release.
pub const HISTORY_MAX: u32 = 5;

/// How long helm may take to exit after SIGTERM.
pub const HELM_TERMINATE_GRACE: Duration = Duration::from_secs(30);

/// Timeout for system chart installs.
const SYSTEM_CHART_TIMEOUT: Duration = Duration::from_secs(600);

/// One install or upgrade.
#[derive(Debug, Clone, PartialEq)]
pub struct ChartInput {
    pub chart_path: PathBuf,
    pub namespace: String,
    pub release_name: String,
    pub values: serde_json::Value,
    pub rollback_on_failure: bool,
    pub timeout: Duration,
    pub wait: bool,
}

/// A chart installed from a public repository during initialization.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemChart {
    pub release_name: &'static str,
    pub namespace: &'static str,
    pub chart: &'static str,
    pub repo_url: &'static str,
    pub version: &'static str,
    pub values: serde_json::Value,
}

/// Charts installed by `initialize` for an ingress class.
pub fn system_charts(ingress_class: IngressClass) -> Vec<SystemChart> {
    let mut charts = vec![SystemChart {
        release_name: "cert-manager",
        namespace: "cert-manager",
        chart: "cert-manager",
        repo_url: "https://charts.jetstack.io",
        version: "v1.13.3",
        values: json!({ "installCRDs": true }),
    }];
    charts.push(match ingress_class {
        IngressClass::Traefik => SystemChart {
            release_name: "traefik",
            namespace: "traefik",
            chart: "traefik",
            repo_url: "https://helm.traefik.io/traefik",
            version: "26.0.0",
            values: json!({ "ingressClass": { "enabled": true, "isDefaultClass": true } }),
        },
        IngressClass::Nginx => SystemChart {
            release_name: "ingress-nginx",
            namespace: "ingress-nginx",
            chart: "ingress-nginx",
            repo_url: "https://kubernetes.github.io/ingress-nginx",
            version: "4.7.5",
            values: json!({ "controller": { "ingressClassResource": { "default": true } } }),
        },
    });
    charts
}

/// Secret helm stores a release revision in.
pub fn revision_secret_name(release: &str, revision: u32) -> String {
    format!("sh.helm.release.v1.{release}.v{revision}")
}

/// Chart release operations.
#[async_trait]
pub trait ChartManager: Send + Sync {
    /// Whether the release has any history.
    async fn chart_exists(&self, namespace: &str, release: &str) -> Result<bool>;

    /// Install a new release or upgrade an existing one.
    async fn install_or_upgrade(&self, input: &ChartInput, cancel: &CancelToken) -> Result<()>;

    /// Remove a release. Absent releases are ignored.
    async fn uninstall(&self, namespace: &str, release: &str) -> Result<()>;

    /// User-supplied values of the current revision.
    async fn get_values(&self, namespace: &str, release: &str) -> Result<serde_json::Value>;

    /// Drop one stored revision.
    async fn delete_revision(&self, namespace: &str, release: &str, revision: u32) -> Result<()>;

    /// Install or upgrade a repository chart.
    async fn ensure_repo_chart(&self, chart: &SystemChart, cancel: &CancelToken) -> Result<()>;
}

/// The fields of `Chart.yaml` helm requires.
#[derive(Debug, Clone, Deserialize)]
pub struct ChartFile {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub name: String,
    pub version: String,
}

/// Check a chart directory before handing it to helm.
pub async fn load_chart(path: &Path, release: &str) -> Result<ChartFile> {
    let is_dir = tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);
    if !is_dir {
        return Err(SchedulerError::chart(
            release,
            format!("Error locating chart: {}", path.display()),
        ));
    }

    let chart_yaml = path.join("Chart.yaml");
    let content = tokio::fs::read_to_string(&chart_yaml).await.map_err(|e| {
        SchedulerError::chart(release, format!("Error loading chart: {}: {e}", chart_yaml.display()))
    })?;
    let chart: ChartFile = serde_yaml::from_str(&content)
        .map_err(|e| SchedulerError::chart(release, format!("Error loading chart: {e}")))?;
    if chart.name.is_empty() || chart.version.is_empty() || chart.api_version.is_empty() {
        return Err(SchedulerError::chart(
            release,
            "Error loading chart: Chart.yaml is missing name, version or apiVersion",
        ));
    }
    Ok(chart)
}

// =============================================================================
// helm binary
// =============================================================================

/// [`ChartManager`] backed by the `helm` CLI.
#[derive(Clone)]
pub struct HelmCli {
    helm_bin: String,
    kubeconfig: PathBuf,
    kube_context: Option<String>,
    client: Arc<dyn ClusterClient>,
}

impl HelmCli {
    pub fn new(
        helm_bin: impl Into<String>,
        kubeconfig: PathBuf,
        kube_context: Option<String>,
        client: Arc<dyn ClusterClient>,
    ) -> Self {
        Self {
            helm_bin: helm_bin.into(),
            kubeconfig,
            kube_context,
            client,
        }
    }

    fn command(&self, namespace: &str) -> Command {
        let mut cmd = Command::new(&self.helm_bin);
        cmd.arg("--kubeconfig").arg(&self.kubeconfig);
        if let Some(context) = &self.kube_context {
            cmd.arg("--kube-context").arg(context);
        }
        cmd.arg("--namespace").arg(namespace);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Run helm. If `cancel` fires first, helm gets SIGTERM so it can mark
    /// the release failed or roll it back, and is killed only after
    /// [`HELM_TERMINATE_GRACE`].
    async fn run(&self, mut cmd: Command, release: &str, cancel: &CancelToken) -> Result<Output> {
        debug!(release = %release, command = ?cmd.as_std(), "Running helm");
        let child = cmd
            .spawn()
            .map_err(|e| SchedulerError::io(format!("unable to run {}", self.helm_bin), e))?;

        match wait_or_terminate(child, cancel, HELM_TERMINATE_GRACE)
            .await
            .map_err(|e| SchedulerError::io(format!("waiting for {}", self.helm_bin), e))?
        {
            Finished::Exited(output) => Ok(output),
            Finished::Terminated(status) => {
                info!(release = %release, status = %status, "helm stopped after cancellation");
                Err(SchedulerError::Cancelled(format!("Deployment of {release}")))
            }
        }
    }
}

/// How a supervised child ended.
#[derive(Debug)]
enum Finished {
    Exited(Output),
    Terminated(ExitStatus),
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

/// Wait for `child`. On cancellation send SIGTERM, wait up to `grace`, then kill.
async fn wait_or_terminate(mut child: Child, cancel: &CancelToken, grace: Duration) -> io::Result<Finished> {
    let pid = child.id();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let after_signal = {
        let collect = async { tokio::try_join!(child.wait(), read_pipe(stdout), read_pipe(stderr)) };
        tokio::pin!(collect);
        tokio::select! {
            done = &mut collect => {
                let (status, stdout, stderr) = done?;
                return Ok(Finished::Exited(Output { status, stdout, stderr }));
            }
            _ = cancel.cancelled() => {}
        }
        send_sigterm(pid);
        tokio::time::timeout(grace, &mut collect).await
    };

    match after_signal {
        Ok(done) => done.map(|(status, _, _)| Finished::Terminated(status)),
        Err(_) => {
            warn!(pid = ?pid, grace = ?grace, "Child ignored SIGTERM, killing it");
            child.kill().await?;
            Ok(Finished::Terminated(child.wait().await?))
        }
    }
}

fn send_sigterm(pid: Option<u32>) {
    // No pid means the child has already been reaped.
    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    if let Err(e) = signal::kill(Pid::from_raw(pid), Signal::SIGTERM) {
        warn!(pid, error = %e, "Unable to send SIGTERM");
    }
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

fn timeout_arg(timeout: Duration) -> String {
    format!("{}s", timeout.as_secs().max(1))
}

async fn write_values(values: &serde_json::Value) -> Result<tempfile::NamedTempFile> {
    let file = tempfile::Builder::new()
        .prefix("values-")
        .suffix(".yaml")
        .tempfile()
        .map_err(|e| SchedulerError::io("Error creating values file", e))?;
    tokio::fs::write(file.path(), serde_yaml::to_string(values)?)
        .await
        .map_err(|e| SchedulerError::path_io(file.path(), e))?;
    Ok(file)
}

#[async_trait]
impl ChartManager for HelmCli {
    async fn chart_exists(&self, namespace: &str, release: &str) -> Result<bool> {
        let mut cmd = self.command(namespace);
        cmd.args(["history", release, "--max", "1"]);
        let output = self.run(cmd, release, &CancelToken::never()).await?;
        if output.status.success() {
            return Ok(true);
        }
        let stderr = stderr_of(&output);
        if stderr.contains("release: not found") {
            return Ok(false);
        }
        Err(SchedulerError::chart(
            release,
            format!("Error checking release {release}: {stderr}"),
        ))
    }

    async fn install_or_upgrade(&self, input: &ChartInput, cancel: &CancelToken) -> Result<()> {
        let release = &input.release_name;
        load_chart(&input.chart_path, release).await?;
        let exists = self.chart_exists(&input.namespace, release).await?;
        let values = write_values(&input.values).await?;

        let mut cmd = self.command(&input.namespace);
        if exists {
            cmd.arg("upgrade")
                .arg(release)
                .arg(&input.chart_path)
                .arg("--cleanup-on-fail")
                .args(["--history-max", &HISTORY_MAX.to_string()]);
            if input.rollback_on_failure {
                cmd.arg("--atomic");
            } else if input.wait {
                cmd.arg("--wait");
            }
        } else {
            cmd.arg("install")
                .arg(release)
                .arg(&input.chart_path)
                .arg("--create-namespace");
            if input.wait {
                cmd.arg("--wait");
            }
        }
        cmd.args(["--timeout", &timeout_arg(input.timeout)])
            .arg("-f")
            .arg(values.path());

        info!(release = %release, namespace = %input.namespace, upgrade = exists, "Applying chart");
        let output = self.run(cmd, release, cancel).await?;
        if !output.status.success() {
            return Err(SchedulerError::chart(
                release.as_str(),
                format!("Error deploying {release}: {}", stderr_of(&output)),
            ));
        }
        Ok(())
    }

    async fn uninstall(&self, namespace: &str, release: &str) -> Result<()> {
        if !self.chart_exists(namespace, release).await? {
            debug!(release = %release, "Release not installed, skipping uninstall");
            return Ok(());
        }

        let mut cmd = self.command(namespace);
        cmd.args(["uninstall", release, "--wait"]);
        let output = self.run(cmd, release, &CancelToken::never()).await?;
        if !output.status.success() {
            return Err(SchedulerError::chart(
                release,
                format!("Error uninstalling {release}: {}", stderr_of(&output)),
            ));
        }
        info!(release = %release, namespace = %namespace, "Uninstalled release");
        Ok(())
    }

    async fn get_values(&self, namespace: &str, release: &str) -> Result<serde_json::Value> {
        let mut cmd = self.command(namespace);
        cmd.args(["get", "values", release, "--output", "json"]);
        let output = self.run(cmd, release, &CancelToken::never()).await?;
        if !output.status.success() {
            return Err(SchedulerError::chart(
                release,
                format!("Error getting values for {release}: {}", stderr_of(&output)),
            ));
        }
        let values: serde_json::Value = serde_json::from_slice(&output.stdout)?;
        Ok(if values.is_null() { json!({}) } else { values })
    }

    async fn delete_revision(&self, namespace: &str, release: &str, revision: u32) -> Result<()> {
        self.client
            .delete_secret(namespace, &revision_secret_name(release, revision))
            .await
    }

    async fn ensure_repo_chart(&self, chart: &SystemChart, cancel: &CancelToken) -> Result<()> {
        let values = write_values(&chart.values).await?;
        let mut cmd = self.command(chart.namespace);
        cmd.args(["upgrade", "--install", chart.release_name, chart.chart])
            .args(["--repo", chart.repo_url, "--version", chart.version])
            .args(["--create-namespace", "--wait"])
            .args(["--timeout", &timeout_arg(SYSTEM_CHART_TIMEOUT)])
            .arg("-f")
            .arg(values.path());

        info!(release = %chart.release_name, version = %chart.version, "Installing system chart");
        let output = self.run(cmd, chart.release_name, cancel).await?;
        if !output.status.success() {
            return Err(SchedulerError::chart(
                chart.release_name,
                format!("Error installing {}: {}", chart.release_name, stderr_of(&output)),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Mock
// =============================================================================

/// One recorded install or upgrade.
#[derive(Debug, Clone, PartialEq)]
pub struct InstallRecord {
    pub namespace: String,
    pub release: String,
    pub chart_version: String,
    pub values: serde_json::Value,
    /// Contents of `files/`, keyed by file name.
    pub files: BTreeMap<String, String>,
    pub upgrade: bool,
    pub rollback_on_failure: bool,
    pub wait: bool,
    pub timeout: Duration,
}

#[derive(Debug, Default)]
struct MockChartState {
    releases: BTreeMap<(String, String), Vec<InstallRecord>>,
    installs: Vec<InstallRecord>,
    uninstalls: Vec<(String, String)>,
    deleted_revisions: Vec<(String, String, u32)>,
    system_charts: Vec<String>,
    failing_release: Option<String>,
}

/// Records chart operations and keeps release history in memory.
///
/// With [`MockChartManager::with_cluster`], installed secrets, deployments
/// and cron jobs are applied to the mock cluster, and every deployment gets
/// running pods.
#[derive(Debug, Default)]
pub struct MockChartManager {
    state: Mutex<MockChartState>,
    cluster: Option<Arc<MockClusterClient>>,
}

impl MockChartManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cluster(cluster: Arc<MockClusterClient>) -> Self {
        Self {
            state: Mutex::default(),
            cluster: Some(cluster),
        }
    }

    /// Make installs of `release` fail.
    pub fn failing(self, release: &str) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.failing_release = Some(release.to_string());
        }
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, MockChartState>> {
        self.state
            .lock()
            .map_err(|_| SchedulerError::Provider("mock chart lock poisoned".to_string()))
    }

    pub fn installs(&self) -> Vec<InstallRecord> {
        self.lock().map(|s| s.installs.clone()).unwrap_or_default()
    }

    pub fn uninstalls(&self) -> Vec<(String, String)> {
        self.lock().map(|s| s.uninstalls.clone()).unwrap_or_default()
    }

    pub fn deleted_revisions(&self) -> Vec<(String, String, u32)> {
        self.lock().map(|s| s.deleted_revisions.clone()).unwrap_or_default()
    }

    pub fn system_charts(&self) -> Vec<String> {
        self.lock().map(|s| s.system_charts.clone()).unwrap_or_default()
    }

    /// Names of installed releases in a namespace.
    pub fn releases(&self, namespace: &str) -> Vec<String> {
        self.lock()
            .map(|s| {
                s.releases
                    .keys()
                    .filter(|(ns, _)| ns == namespace)
                    .map(|(_, r)| r.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Latest revision of a release.
    pub fn latest(&self, namespace: &str, release: &str) -> Option<InstallRecord> {
        self.lock()
            .ok()?
            .releases
            .get(&(namespace.to_string(), release.to_string()))
            .and_then(|history| history.last().cloned())
    }

    fn apply(&self, namespace: &str, files: &BTreeMap<String, String>) -> Result<()> {
        let Some(cluster) = &self.cluster else {
            return Ok(());
        };

        for content in files.values() {
            let doc: serde_json::Value = serde_yaml::from_str(content)?;
            match doc["kind"].as_str() {
                Some("Secret") => cluster.insert_secret(namespace, serde_json::from_value::<Secret>(doc)?),
                Some("CronJob") => cluster.insert_cron_job(namespace, serde_json::from_value::<CronJob>(doc)?),
                Some("Deployment") => {
                    let deployment: Deployment = serde_json::from_value(doc)?;
                    spawn_pods(cluster, namespace, &deployment);
                    cluster.insert_deployment(namespace, deployment);
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn spawn_pods(cluster: &MockClusterClient, namespace: &str, deployment: &Deployment) {
    let name = deployment.metadata.name.clone().unwrap_or_default();
    let Some(spec) = &deployment.spec else {
        return;
    };
    let metadata = spec.template.metadata.clone().unwrap_or_default();
    let labels = metadata.labels.unwrap_or_default();
    let annotations = metadata.annotations.unwrap_or_default();
    let label_refs: Vec<(&str, &str)> = labels.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
    let annotation_refs: Vec<(&str, &str)> =
        annotations.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
    let revision = labels
        .get(crate::manifest::DEPLOYMENT_ID_LABEL)
        .cloned()
        .unwrap_or_default();

    for index in 1..=spec.replicas.unwrap_or(1) {
        let pod_name = format!("{name}-{revision}-{index}");
        cluster.insert_pod(namespace, mock_pod(&pod_name, &label_refs, &annotation_refs, "Running"));
    }
}

async fn read_files(chart_path: &Path) -> Result<BTreeMap<String, String>> {
    let dir = chart_path.join("files");
    let mut files = BTreeMap::new();
    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
        Err(e) => return Err(SchedulerError::path_io(&dir, e)),
    };
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| SchedulerError::path_io(&dir, e))?
    {
        let content = tokio::fs::read_to_string(entry.path())
            .await
            .map_err(|e| SchedulerError::path_io(&entry.path(), e))?;
        files.insert(entry.file_name().to_string_lossy().into_owned(), content);
    }
    Ok(files)
}

#[async_trait]
impl ChartManager for MockChartManager {
    async fn chart_exists(&self, namespace: &str, release: &str) -> Result<bool> {
        Ok(self
            .lock()?
            .releases
            .contains_key(&(namespace.to_string(), release.to_string())))
    }

    async fn install_or_upgrade(&self, input: &ChartInput, cancel: &CancelToken) -> Result<()> {
        let release = &input.release_name;
        if cancel.is_cancelled() {
            return Err(SchedulerError::Cancelled(format!("Deployment of {release}")));
        }

        let chart = load_chart(&input.chart_path, release).await?;
        let files = read_files(&input.chart_path).await?;

        let key = (input.namespace.clone(), release.clone());
        {
            let state = self.lock()?;
            if state.failing_release.as_deref() == Some(release.as_str()) {
                return Err(SchedulerError::chart(
                    release.as_str(),
                    format!("Error deploying {release}: mock failure"),
                ));
            }
        }

        self.apply(&input.namespace, &files)?;

        let mut state = self.lock()?;
        let record = InstallRecord {
            namespace: input.namespace.clone(),
            release: release.clone(),
            chart_version: chart.version,
            values: input.values.clone(),
            files,
            upgrade: state.releases.contains_key(&key),
            rollback_on_failure: input.rollback_on_failure,
            wait: input.wait,
            timeout: input.timeout,
        };
        state.installs.push(record.clone());
        let history = state.releases.entry(key).or_default();
        history.push(record);
        if history.len() > HISTORY_MAX as usize {
            history.remove(0);
        }
        Ok(())
    }

    async fn uninstall(&self, namespace: &str, release: &str) -> Result<()> {
        let mut state = self.lock()?;
        if state
            .releases
            .remove(&(namespace.to_string(), release.to_string()))
            .is_some()
        {
            state.uninstalls.push((namespace.to_string(), release.to_string()));
        }
        Ok(())
    }

    async fn get_values(&self, namespace: &str, release: &str) -> Result<serde_json::Value> {
        self.latest(namespace, release)
            .map(|r| r.values)
            .ok_or_else(|| SchedulerError::NotFound(format!("release {release}")))
    }

    async fn delete_revision(&self, namespace: &str, release: &str, revision: u32) -> Result<()> {
        self.lock()?
            .deleted_revisions
            .push((namespace.to_string(), release.to_string(), revision));
        Ok(())
    }

    async fn ensure_repo_chart(&self, chart: &SystemChart, cancel: &CancelToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(SchedulerError::Cancelled(format!("Installation of {}", chart.release_name)));
        }
        self.lock()?.system_charts.push(chart.release_name.to_string());
        Ok(())
    }
}
