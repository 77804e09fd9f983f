//! Orchestration client facade.
//!
//! Every Kubernetes API call the scheduler makes goes through
//! [`ClusterClient`]. [`KubeClusterClient`] talks to a real cluster through
//! `kube`; [`MockClusterClient`] keeps objects in memory so deploy, readiness
//! and cluster flows can be tested without one.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use futures_util::io::AsyncBufReadExt;
use futures_util::TryStreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{Namespace, Node, Pod, PodStatus, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{
    Api, AttachParams, DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams,
};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use serde_json::json;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::error::{Result, SchedulerError};

/// Labels and annotations as stored on objects.
pub type Labels = BTreeMap<String, String>;

/// An exec into a running container with the caller's stdio attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub command: Vec<String>,
    pub tty: bool,
}

/// Kubernetes API facade.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Check the API server answers.
    async fn ping(&self) -> Result<()>;

    /// Create a namespace. An existing namespace is left as is.
    async fn create_namespace(&self, name: &str, labels: &Labels, annotations: &Labels) -> Result<()>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod>;

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>>;

    async fn list_deployments(&self, namespace: &str, selector: &str) -> Result<Vec<Deployment>>;

    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32) -> Result<()>;

    async fn list_cron_jobs(&self, namespace: &str, selector: &str) -> Result<Vec<CronJob>>;

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job>;

    /// Delete a job and its pods. A missing job is not an error.
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret>;

    /// Delete a secret. A missing secret is not an error.
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()>;

    async fn list_nodes(&self, selector: Option<&str>) -> Result<Vec<Node>>;

    async fn get_node(&self, name: &str) -> Result<Node>;

    async fn label_node(&self, name: &str, key: &str, value: &str) -> Result<()>;

    async fn annotate_node(&self, name: &str, key: &str, value: &str) -> Result<()>;

    async fn delete_node(&self, name: &str) -> Result<()>;

    /// Run a command in a container with stdio attached.
    async fn exec(&self, request: &ExecRequest) -> Result<()>;

    /// Copy a container's log lines to `out`.
    async fn stream_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
        follow: bool,
        out: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()>;
}

// =============================================================================
// kube-backed client
// =============================================================================

/// Client for a real cluster.
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from a kubeconfig file and optional context.
    pub async fn connect(kubeconfig_path: &Path, context: Option<&str>) -> Result<Self> {
        let kubeconfig = Kubeconfig::read_from(kubeconfig_path).map_err(|e| {
            SchedulerError::Unavailable(format!(
                "unable to read kubeconfig {}: {e}",
                kubeconfig_path.display()
            ))
        })?;
        let options = KubeConfigOptions {
            context: context.map(str::to_string),
            ..KubeConfigOptions::default()
        };
        let config = kube::Config::from_custom_kubeconfig(kubeconfig, &options)
            .await
            .map_err(|e| SchedulerError::Unavailable(format!("invalid kubeconfig: {e}")))?;
        let client = Client::try_from(config)
            .map_err(|e| SchedulerError::Unavailable(format!("unable to create client: {e}")))?;

        debug!(kubeconfig = %kubeconfig_path.display(), context = ?context, "kubernetes client created");
        Ok(Self { client })
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }
}

fn is_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == code)
}

fn not_found(kind: &str, name: &str) -> impl FnOnce(kube::Error) -> SchedulerError {
    let what = format!("{kind} {name}");
    move |err| {
        if is_status(&err, 404) {
            SchedulerError::NotFound(what)
        } else {
            SchedulerError::Kube(err)
        }
    }
}

fn ignore_not_found<T>(result: std::result::Result<T, kube::Error>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(err) if is_status(&err, 404) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn list_params(selector: &str) -> ListParams {
    if selector.is_empty() {
        ListParams::default()
    } else {
        ListParams::default().labels(selector)
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn ping(&self) -> Result<()> {
        self.client
            .apiserver_version()
            .await
            .map(|_| ())
            .map_err(|e| SchedulerError::Unavailable(e.to_string()))
    }

    async fn create_namespace(&self, name: &str, labels: &Labels, annotations: &Labels) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels.clone()),
                annotations: Some(annotations.clone()),
                ..ObjectMeta::default()
            },
            ..Namespace::default()
        };
        match api.create(&PostParams::default(), &namespace).await {
            Ok(_) => {
                info!(namespace = %name, "Created namespace");
                Ok(())
            }
            Err(err) if is_status(&err, 409) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        self.pods(namespace)
            .get(name)
            .await
            .map_err(not_found("pod", name))
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        Ok(self.pods(namespace).list(&list_params(selector)).await?.items)
    }

    async fn list_deployments(&self, namespace: &str, selector: &str) -> Result<Vec<Deployment>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&list_params(selector)).await?.items)
    }

    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "spec": { "replicas": replicas } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(not_found("deployment", name))?;
        Ok(())
    }

    async fn list_cron_jobs(&self, namespace: &str, selector: &str) -> Result<Vec<CronJob>> {
        let api: Api<CronJob> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&list_params(selector)).await?.items)
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), job).await?)
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.delete(name, &DeleteParams::background()).await)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.get(name).await.map_err(not_found("secret", name))
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.delete(name, &DeleteParams::default()).await)
    }

    async fn list_nodes(&self, selector: Option<&str>) -> Result<Vec<Node>> {
        Ok(self
            .nodes()
            .list(&list_params(selector.unwrap_or_default()))
            .await?
            .items)
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        self.nodes().get(name).await.map_err(not_found("node", name))
    }

    async fn label_node(&self, name: &str, key: &str, value: &str) -> Result<()> {
        let patch = json!({ "metadata": { "labels": { key: value } } });
        self.nodes()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(not_found("node", name))?;
        Ok(())
    }

    async fn annotate_node(&self, name: &str, key: &str, value: &str) -> Result<()> {
        let patch = json!({ "metadata": { "annotations": { key: value } } });
        self.nodes()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(not_found("node", name))?;
        Ok(())
    }

    async fn delete_node(&self, name: &str) -> Result<()> {
        self.nodes()
            .delete(name, &DeleteParams::default())
            .await
            .map_err(not_found("node", name))?;
        Ok(())
    }

    async fn exec(&self, request: &ExecRequest) -> Result<()> {
        let params = AttachParams::default()
            .container(request.container.clone())
            .stdin(true)
            .stdout(true)
            .stderr(!request.tty)
            .tty(request.tty);

        let mut attached = self
            .pods(&request.namespace)
            .exec(&request.pod, request.command.clone(), &params)
            .await?;

        let status = attached.take_status();
        let stdin_task = attached.stdin().map(|mut writer| {
            tokio::spawn(async move {
                let mut stdin = tokio::io::stdin();
                let _ = tokio::io::copy(&mut stdin, &mut writer).await;
            })
        });

        let stdout_reader = attached.stdout();
        let stderr_reader = attached.stderr();
        let stdout = async move {
            if let Some(mut reader) = stdout_reader {
                tokio::io::copy(&mut reader, &mut tokio::io::stdout()).await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let stderr = async move {
            if let Some(mut reader) = stderr_reader {
                tokio::io::copy(&mut reader, &mut tokio::io::stderr()).await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let (out, err) = tokio::join!(stdout, stderr);
        if let Some(task) = stdin_task {
            task.abort();
        }
        out.and(err)
            .map_err(|e| SchedulerError::io(format!("exec in pod {}", request.pod), e))?;

        if let Some(status) = status {
            if let Some(status) = status.await {
                if status.status.as_deref() == Some("Failure") {
                    return Err(SchedulerError::RemoteOperation {
                        message: format!(
                            "Command failed in pod {}: {}",
                            request.pod,
                            status.message.unwrap_or_default()
                        ),
                        stderr: String::new(),
                    });
                }
            }
        }
        Ok(())
    }

    async fn stream_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
        follow: bool,
        out: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()> {
        let params = LogParams {
            container: container.map(str::to_string),
            follow,
            ..LogParams::default()
        };
        let stream = self
            .pods(namespace)
            .log_stream(pod, &params)
            .await
            .map_err(not_found("pod", pod))?;

        let context = || format!("logs of pod {pod}");
        let mut lines = stream.lines();
        while let Some(line) = lines
            .try_next()
            .await
            .map_err(|e| SchedulerError::io(context(), e))?
        {
            out.write_all(line.as_bytes())
                .await
                .map_err(|e| SchedulerError::io(context(), e))?;
            out.write_all(b"\n")
                .await
                .map_err(|e| SchedulerError::io(context(), e))?;
        }
        out.flush().await.map_err(|e| SchedulerError::io(context(), e))?;
        Ok(())
    }
}

// =============================================================================
// Lazily connected client
// =============================================================================

/// Connects on first use.
///
/// The kubeconfig only exists once k3s has been installed, so commands that
/// install the cluster build their collaborators before it can be read.
pub struct LazyClusterClient {
    kubeconfig_path: PathBuf,
    context: Option<String>,
    inner: OnceCell<KubeClusterClient>,
}

impl LazyClusterClient {
    pub fn new(kubeconfig_path: PathBuf, context: Option<String>) -> Self {
        Self {
            kubeconfig_path,
            context,
            inner: OnceCell::new(),
        }
    }

    async fn client(&self) -> Result<&KubeClusterClient> {
        self.inner
            .get_or_try_init(|| {
                KubeClusterClient::connect(&self.kubeconfig_path, self.context.as_deref())
            })
            .await
    }
}

#[async_trait]
impl ClusterClient for LazyClusterClient {
    async fn ping(&self) -> Result<()> {
        self.client().await?.ping().await
    }

    async fn create_namespace(&self, name: &str, labels: &Labels, annotations: &Labels) -> Result<()> {
        self.client()
            .await?
            .create_namespace(name, labels, annotations)
            .await
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        self.client().await?.get_pod(namespace, name).await
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        self.client().await?.list_pods(namespace, selector).await
    }

    async fn list_deployments(&self, namespace: &str, selector: &str) -> Result<Vec<Deployment>> {
        self.client().await?.list_deployments(namespace, selector).await
    }

    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32) -> Result<()> {
        self.client()
            .await?
            .scale_deployment(namespace, name, replicas)
            .await
    }

    async fn list_cron_jobs(&self, namespace: &str, selector: &str) -> Result<Vec<CronJob>> {
        self.client().await?.list_cron_jobs(namespace, selector).await
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job> {
        self.client().await?.create_job(namespace, job).await
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()> {
        self.client().await?.delete_job(namespace, name).await
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret> {
        self.client().await?.get_secret(namespace, name).await
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()> {
        self.client().await?.delete_secret(namespace, name).await
    }

    async fn list_nodes(&self, selector: Option<&str>) -> Result<Vec<Node>> {
        self.client().await?.list_nodes(selector).await
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        self.client().await?.get_node(name).await
    }

    async fn label_node(&self, name: &str, key: &str, value: &str) -> Result<()> {
        self.client().await?.label_node(name, key, value).await
    }

    async fn annotate_node(&self, name: &str, key: &str, value: &str) -> Result<()> {
        self.client().await?.annotate_node(name, key, value).await
    }

    async fn delete_node(&self, name: &str) -> Result<()> {
        self.client().await?.delete_node(name).await
    }

    async fn exec(&self, request: &ExecRequest) -> Result<()> {
        self.client().await?.exec(request).await
    }

    async fn stream_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
        follow: bool,
        out: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()> {
        self.client()
            .await?
            .stream_logs(namespace, pod, container, follow, out)
            .await
    }
}

// =============================================================================
// In-memory client
// =============================================================================

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

#[derive(Debug)]
struct MockState {
    available: bool,
    namespaces: BTreeMap<String, Labels>,
    pods: BTreeMap<Key, Pod>,
    pod_phases: BTreeMap<Key, VecDeque<String>>,
    hidden_pod_lists: u32,
    deployments: BTreeMap<Key, Deployment>,
    cron_jobs: BTreeMap<Key, CronJob>,
    jobs: BTreeMap<Key, Job>,
    job_pod_phase: String,
    job_logs: String,
    secrets: BTreeMap<Key, Secret>,
    nodes: BTreeMap<String, Node>,
    logs: BTreeMap<Key, String>,
    exec_requests: Vec<ExecRequest>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            available: true,
            namespaces: BTreeMap::new(),
            pods: BTreeMap::new(),
            pod_phases: BTreeMap::new(),
            hidden_pod_lists: 0,
            deployments: BTreeMap::new(),
            cron_jobs: BTreeMap::new(),
            jobs: BTreeMap::new(),
            job_pod_phase: "Succeeded".to_string(),
            job_logs: String::new(),
            secrets: BTreeMap::new(),
            nodes: BTreeMap::new(),
            logs: BTreeMap::new(),
            exec_requests: Vec::new(),
        }
    }
}

/// In-memory cluster for tests and development.
///
/// Pods can be given a scripted phase sequence; each `get_pod` call advances
/// one step and the last phase sticks. Creating a job also creates its pod.
#[derive(Debug, Default)]
pub struct MockClusterClient {
    state: Mutex<MockState>,
}

impl MockClusterClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cluster whose API never answers.
    pub fn unavailable() -> Self {
        let mock = Self::default();
        if let Ok(mut state) = mock.state.lock() {
            state.available = false;
        }
        mock
    }

    fn lock(&self) -> Result<MutexGuard<'_, MockState>> {
        self.state
            .lock()
            .map_err(|_| SchedulerError::Provider("mock cluster lock poisoned".to_string()))
    }

    fn check(&self) -> Result<MutexGuard<'_, MockState>> {
        let state = self.lock()?;
        if !state.available {
            return Err(SchedulerError::Unavailable("connection refused".to_string()));
        }
        Ok(state)
    }

    pub fn insert_pod(&self, namespace: &str, pod: Pod) {
        if let Ok(mut state) = self.state.lock() {
            let name = pod.metadata.name.clone().unwrap_or_default();
            state.pods.insert(key(namespace, &name), pod);
        }
    }

    /// Script the phases `get_pod` reports for a pod.
    pub fn set_pod_phases(&self, namespace: &str, name: &str, phases: &[&str]) {
        if let Ok(mut state) = self.state.lock() {
            state.pod_phases.insert(
                key(namespace, name),
                phases.iter().map(|p| p.to_string()).collect(),
            );
        }
    }

    /// Make the next `count` pod listings come back empty.
    pub fn hide_pods_for(&self, count: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.hidden_pod_lists = count;
        }
    }

    /// Phase given to pods created for jobs.
    pub fn set_job_pod_phase(&self, phase: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.job_pod_phase = phase.to_string();
        }
    }

    /// Log output given to pods created for jobs.
    pub fn set_job_logs(&self, logs: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.job_logs = logs.to_string();
        }
    }

    pub fn insert_deployment(&self, namespace: &str, deployment: Deployment) {
        if let Ok(mut state) = self.state.lock() {
            let name = deployment.metadata.name.clone().unwrap_or_default();
            state.deployments.insert(key(namespace, &name), deployment);
        }
    }

    pub fn insert_cron_job(&self, namespace: &str, cron_job: CronJob) {
        if let Ok(mut state) = self.state.lock() {
            let name = cron_job.metadata.name.clone().unwrap_or_default();
            state.cron_jobs.insert(key(namespace, &name), cron_job);
        }
    }

    pub fn insert_secret(&self, namespace: &str, secret: Secret) {
        if let Ok(mut state) = self.state.lock() {
            let name = secret.metadata.name.clone().unwrap_or_default();
            state.secrets.insert(key(namespace, &name), secret);
        }
    }

    pub fn insert_node(&self, node: Node) {
        if let Ok(mut state) = self.state.lock() {
            let name = node.metadata.name.clone().unwrap_or_default();
            state.nodes.insert(name, node);
        }
    }

    pub fn set_logs(&self, namespace: &str, pod: &str, logs: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.logs.insert(key(namespace, pod), logs.to_string());
        }
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.lock().ok()?.secrets.get(&key(namespace, name)).cloned()
    }

    pub fn deployment(&self, namespace: &str, name: &str) -> Option<Deployment> {
        self.lock().ok()?.deployments.get(&key(namespace, name)).cloned()
    }

    pub fn node(&self, name: &str) -> Option<Node> {
        self.lock().ok()?.nodes.get(name).cloned()
    }

    pub fn namespace_labels(&self, name: &str) -> Option<Labels> {
        self.lock().ok()?.namespaces.get(name).cloned()
    }

    pub fn jobs(&self, namespace: &str) -> Vec<Job> {
        self.lock()
            .map(|s| {
                s.jobs
                    .iter()
                    .filter(|((ns, _), _)| ns == namespace)
                    .map(|(_, j)| j.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn exec_requests(&self) -> Vec<ExecRequest> {
        self.lock().map(|s| s.exec_requests.clone()).unwrap_or_default()
    }
}

/// Match `a=b,c==d,e!=f,g` style equality selectors.
pub fn selector_matches(selector: &str, labels: Option<&Labels>) -> bool {
    let empty = Labels::new();
    let labels = labels.unwrap_or(&empty);
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| {
            if let Some((k, v)) = term.split_once("!=") {
                labels.get(k.trim()).map(String::as_str) != Some(v.trim())
            } else if let Some((k, v)) = term.split_once('=') {
                let v = v.trim_start_matches('=');
                labels.get(k.trim()).map(String::as_str) == Some(v.trim())
            } else {
                labels.contains_key(term)
            }
        })
}

/// A pod fixture.
pub fn mock_pod(name: &str, labels: &[(&str, &str)], annotations: &[(&str, &str)], phase: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            annotations: Some(
                annotations
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..ObjectMeta::default()
        },
        status: Some(PodStatus {
            phase: Some(phase.to_string()),
            ..PodStatus::default()
        }),
        ..Pod::default()
    }
}

#[async_trait]
impl ClusterClient for MockClusterClient {
    async fn ping(&self) -> Result<()> {
        self.check().map(|_| ())
    }

    async fn create_namespace(&self, name: &str, labels: &Labels, _annotations: &Labels) -> Result<()> {
        self.check()?
            .namespaces
            .entry(name.to_string())
            .or_insert_with(|| labels.clone());
        Ok(())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        let mut state = self.check()?;
        let k = key(namespace, name);
        let phase = match state.pod_phases.get_mut(&k) {
            Some(phases) if phases.len() > 1 => phases.pop_front(),
            Some(phases) => phases.front().cloned(),
            None => None,
        };
        let pod = state
            .pods
            .get_mut(&k)
            .ok_or_else(|| SchedulerError::NotFound(format!("pod {name}")))?;
        if let Some(phase) = phase {
            pod.status.get_or_insert_with(PodStatus::default).phase = Some(phase);
        }
        Ok(pod.clone())
    }

    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>> {
        let mut state = self.check()?;
        if state.hidden_pod_lists > 0 {
            state.hidden_pod_lists -= 1;
            return Ok(Vec::new());
        }
        Ok(state
            .pods
            .iter()
            .filter(|((ns, _), pod)| {
                ns == namespace && selector_matches(selector, pod.metadata.labels.as_ref())
            })
            .map(|(_, pod)| pod.clone())
            .collect())
    }

    async fn list_deployments(&self, namespace: &str, selector: &str) -> Result<Vec<Deployment>> {
        Ok(self
            .check()?
            .deployments
            .iter()
            .filter(|((ns, _), d)| ns == namespace && selector_matches(selector, d.metadata.labels.as_ref()))
            .map(|(_, d)| d.clone())
            .collect())
    }

    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32) -> Result<()> {
        let mut state = self.check()?;
        let deployment = state
            .deployments
            .get_mut(&key(namespace, name))
            .ok_or_else(|| SchedulerError::NotFound(format!("deployment {name}")))?;
        deployment.spec.get_or_insert_with(Default::default).replicas = Some(replicas);
        Ok(())
    }

    async fn list_cron_jobs(&self, namespace: &str, selector: &str) -> Result<Vec<CronJob>> {
        Ok(self
            .check()?
            .cron_jobs
            .iter()
            .filter(|((ns, _), c)| ns == namespace && selector_matches(selector, c.metadata.labels.as_ref()))
            .map(|(_, c)| c.clone())
            .collect())
    }

    async fn create_job(&self, namespace: &str, job: &Job) -> Result<Job> {
        let mut state = self.check()?;
        let name = job.metadata.name.clone().unwrap_or_default();
        if state.jobs.contains_key(&key(namespace, &name)) {
            return Err(SchedulerError::Configuration(format!("job {name} already exists")));
        }

        let mut labels: Labels = job
            .spec
            .as_ref()
            .and_then(|s| s.template.metadata.as_ref())
            .and_then(|m| m.labels.clone())
            .unwrap_or_default();
        labels.insert("batch.kubernetes.io/job-name".to_string(), name.clone());
        let annotations: Labels = job
            .spec
            .as_ref()
            .and_then(|s| s.template.metadata.as_ref())
            .and_then(|m| m.annotations.clone())
            .unwrap_or_default();
        let label_refs: Vec<(&str, &str)> = labels.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let annotation_refs: Vec<(&str, &str)> =
            annotations.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let pod_name = format!("{name}-mock");
        let phase = state.job_pod_phase.clone();
        let logs = state.job_logs.clone();
        state.logs.insert(key(namespace, &pod_name), logs);
        state.pods.insert(
            key(namespace, &pod_name),
            mock_pod(&pod_name, &label_refs, &annotation_refs, &phase),
        );

        state.jobs.insert(key(namespace, &name), job.clone());
        Ok(job.clone())
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.check()?;
        state.jobs.remove(&key(namespace, name));
        state.pods.retain(|(ns, _), pod| {
            !(ns == namespace
                && pod
                    .metadata
                    .labels
                    .as_ref()
                    .and_then(|l| l.get("batch.kubernetes.io/job-name"))
                    .map(String::as_str)
                    == Some(name))
        });
        Ok(())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret> {
        self.check()?
            .secrets
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| SchedulerError::NotFound(format!("secret {name}")))
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<()> {
        self.check()?.secrets.remove(&key(namespace, name));
        Ok(())
    }

    async fn list_nodes(&self, selector: Option<&str>) -> Result<Vec<Node>> {
        let selector = selector.unwrap_or_default();
        Ok(self
            .check()?
            .nodes
            .values()
            .filter(|n| selector_matches(selector, n.metadata.labels.as_ref()))
            .cloned()
            .collect())
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        self.check()?
            .nodes
            .get(name)
            .cloned()
            .ok_or_else(|| SchedulerError::NotFound(format!("node {name}")))
    }

    async fn label_node(&self, name: &str, key: &str, value: &str) -> Result<()> {
        let mut state = self.check()?;
        let node = state
            .nodes
            .get_mut(name)
            .ok_or_else(|| SchedulerError::NotFound(format!("node {name}")))?;
        node.metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn annotate_node(&self, name: &str, key: &str, value: &str) -> Result<()> {
        let mut state = self.check()?;
        let node = state
            .nodes
            .get_mut(name)
            .ok_or_else(|| SchedulerError::NotFound(format!("node {name}")))?;
        node.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete_node(&self, name: &str) -> Result<()> {
        self.check()?
            .nodes
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| SchedulerError::NotFound(format!("node {name}")))
    }

    async fn exec(&self, request: &ExecRequest) -> Result<()> {
        let mut state = self.check()?;
        if !state.pods.contains_key(&key(&request.namespace, &request.pod)) {
            return Err(SchedulerError::NotFound(format!("pod {}", request.pod)));
        }
        state.exec_requests.push(request.clone());
        Ok(())
    }

    async fn stream_logs(
        &self,
        namespace: &str,
        pod: &str,
        _container: Option<&str>,
        _follow: bool,
        out: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<()> {
        let logs = self
            .check()?
            .logs
            .get(&key(namespace, pod))
            .cloned()
            .unwrap_or_default();
        out.write_all(logs.as_bytes())
            .await
            .map_err(|e| SchedulerError::io(format!("logs of pod {pod}"), e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[rstest]
    #[case("", true)]
    #[case("app=foo", true)]
    #[case("app==foo,tier=web", true)]
    #[case("app=bar", false)]
    #[case("app!=bar", true)]
    #[case("tier", true)]
    #[case("missing", false)]
    fn test_selector_matches(#[case] selector: &str, #[case] expected: bool) {
        let l = labels(&[("app", "foo"), ("tier", "web")]);
        assert_eq!(selector_matches(selector, Some(&l)), expected);
    }

    #[tokio::test]
    async fn test_mock_pod_phases_advance() {
        let client = MockClusterClient::new();
        client.insert_pod("default", mock_pod("foo-web-1", &[], &[], "Pending"));
        client.set_pod_phases("default", "foo-web-1", &["Pending", "Running"]);

        let phase = |pod: Pod| pod.status.and_then(|s| s.phase).unwrap();
        assert_eq!(phase(client.get_pod("default", "foo-web-1").await.unwrap()), "Pending");
        assert_eq!(phase(client.get_pod("default", "foo-web-1").await.unwrap()), "Running");
        assert_eq!(phase(client.get_pod("default", "foo-web-1").await.unwrap()), "Running");
    }

    #[tokio::test]
    async fn test_mock_unavailable() {
        let client = MockClusterClient::unavailable();
        assert!(client.ping().await.unwrap_err().is_unavailable());
    }

    #[tokio::test]
    async fn test_mock_job_creates_pod() {
        let client = MockClusterClient::new();
        let job: Job = serde_json::from_value(json!({
            "metadata": {"name": "foo-run-abc"},
            "spec": {"template": {
                "metadata": {"labels": {"app.kubernetes.io/part-of": "foo"}},
                "spec": {"containers": [{"name": "foo-run"}]}
            }}
        }))
        .unwrap();

        client.create_job("default", &job).await.unwrap();
        let pods = client
            .list_pods("default", "batch.kubernetes.io/job-name=foo-run-abc")
            .await
            .unwrap();
        assert_eq!(pods.len(), 1);

        client.delete_job("default", "foo-run-abc").await.unwrap();
        assert!(client.list_pods("default", "").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mock_namespace_is_idempotent() {
        let client = MockClusterClient::new();
        let first = labels(&[("plfm.dev/managed", "true")]);
        client.create_namespace("apps", &first, &Labels::new()).await.unwrap();
        client
            .create_namespace("apps", &labels(&[("other", "x")]), &Labels::new())
            .await
            .unwrap();
        assert_eq!(client.namespace_labels("apps"), Some(first));
    }

    #[tokio::test]
    async fn test_lazy_client_without_kubeconfig_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let client = LazyClusterClient::new(dir.path().join("k3s.yaml"), None);
        assert!(client.ping().await.unwrap_err().is_unavailable());
    }
}
