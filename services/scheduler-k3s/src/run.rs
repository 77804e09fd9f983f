//! One-off commands and interactive shells.
//!
//! `run` starts a job from the image of the live release: the `<app>-web`
//! deployment when present, otherwise the first deployment of the app.
//! `enter` execs into a running pod.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use tokio::io::AsyncWrite;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::clock::Clock;
use crate::cluster_client::ClusterClient;
use crate::error::{Result, SchedulerError};
use crate::manifest::job::{job, random_suffix, JobInput};
use crate::manifest::secret::env_secret_name;
use crate::manifest::{
    ImageSourceType, BUILDER_TYPE_ANNOTATION, DEPLOYMENT_ID_ANNOTATION, PART_OF_LABEL,
    PROCESS_TYPE_LABEL,
};
use crate::portmap::DEFAULT_CONTAINER_PORT;
use crate::properties::Properties;
use crate::providers::Providers;
use crate::readiness::{EnterPodInput, ReadinessWaiter, WaitForPodInput};
use crate::resources::ResourceResolver;
use crate::shell;

/// Process type given to one-off jobs.
pub const RUN_PROCESS: &str = "run";

/// App config key overriding the shell used by `enter` and bare `run`.
pub const APP_SHELL_KEY: &str = "PLFM_APP_SHELL";

/// Label the job controller puts on its pods.
pub const JOB_NAME_LABEL: &str = "batch.kubernetes.io/job-name";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunRequest {
    pub app: String,
    /// Command and args. Empty opens the app shell.
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Return once the job exists instead of attaching.
    pub detach: bool,
    /// Delete the job when it finishes.
    pub remove: bool,
}

/// A created job and, when attached, how its pod ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub job: String,
    pub pod: Option<String>,
    pub phase: Option<String>,
}

impl RunOutcome {
    pub fn failed(&self) -> bool {
        self.phase.as_deref() == Some("Failed")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnterRequest {
    pub app: String,
    /// Pod name or `<process type>[.<index>]`. Defaults to `web`.
    pub target: Option<String>,
    pub command: Vec<String>,
    pub tty: bool,
}

/// What a job borrows from the live release.
#[derive(Debug)]
struct ReleaseSource {
    image: String,
    image_source_type: ImageSourceType,
    deployment_id: i64,
    process_type: String,
}

impl ReleaseSource {
    fn from_deployment(app: &str, deployment: &Deployment) -> Result<Self> {
        let name = deployment.metadata.name.clone().unwrap_or_default();
        let annotations = deployment.metadata.annotations.clone().unwrap_or_default();
        let labels = deployment.metadata.labels.clone().unwrap_or_default();

        let image = deployment
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|s| s.containers.first())
            .and_then(|c| c.image.clone())
            .ok_or_else(|| SchedulerError::config(format!("Deployment {name} has no image")))?;
        let deployment_id = annotations
            .get(DEPLOYMENT_ID_ANNOTATION)
            .ok_or_else(|| SchedulerError::config(format!("Deployment ID is empty for {name}")))?
            .parse::<i64>()
            .map_err(|e| SchedulerError::config(format!("Error parsing deployment ID: {e}")))?;
        let image_source_type = match annotations.get(BUILDER_TYPE_ANNOTATION) {
            Some(kind) => kind.parse()?,
            None => ImageSourceType::default(),
        };
        let process_type = labels
            .get(PROCESS_TYPE_LABEL)
            .cloned()
            .unwrap_or_else(|| name.trim_start_matches(&format!("{app}-")).to_string());

        Ok(Self {
            image,
            image_source_type,
            deployment_id,
            process_type,
        })
    }
}

/// Starts one-off jobs and shells for apps.
pub struct Runner {
    client: Arc<dyn ClusterClient>,
    properties: Properties,
    providers: Providers,
    resources: ResourceResolver,
    waiter: ReadinessWaiter,
}

impl Runner {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        properties: Properties,
        providers: Providers,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            resources: ResourceResolver::new(properties.store().clone()),
            waiter: ReadinessWaiter::new(client.clone(), clock),
            client,
            properties,
            providers,
        }
    }

    pub fn with_waiter(mut self, waiter: ReadinessWaiter) -> Self {
        self.waiter = waiter;
        self
    }

    async fn source(&self, app: &str, namespace: &str) -> Result<ReleaseSource> {
        let selector = format!("{PART_OF_LABEL}={app}");
        let mut deployments = self.client.list_deployments(namespace, &selector).await?;
        deployments.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        let web = format!("{app}-web");
        let chosen = deployments
            .iter()
            .find(|d| d.metadata.name.as_deref() == Some(web.as_str()))
            .or_else(|| deployments.first())
            .ok_or_else(|| SchedulerError::config(format!("App {app} has not been deployed")))?;
        ReleaseSource::from_deployment(app, chosen)
    }

    async fn app_shell(&self, app: &str) -> Result<Option<String>> {
        Ok(self
            .providers
            .config
            .get(app, APP_SHELL_KEY)
            .await?
            .filter(|s| !s.is_empty()))
    }

    /// Command for the job: the app shell when empty, a Procfile entry when
    /// the only word names one.
    async fn command(&self, app: &str, command: &[String]) -> Result<Vec<String>> {
        match command {
            [] => Ok(vec![self
                .app_shell(app)
                .await?
                .unwrap_or_else(|| crate::readiness::DEFAULT_SHELL.to_string())]),
            [single] => {
                let procfile = self
                    .providers
                    .procfile
                    .command(app, single, DEFAULT_CONTAINER_PORT)
                    .await?;
                match procfile.filter(|c| !c.is_empty()) {
                    Some(line) => {
                        info!(app = %app, process_type = %single, "Found '{single}' in Procfile, running that command");
                        shell::split("Procfile command", &line)
                    }
                    None => Ok(command.to_vec()),
                }
            }
            _ => Ok(command.to_vec()),
        }
    }

    /// Create a job for `request` and, unless detached, attach to it.
    pub async fn run(
        &self,
        request: &RunRequest,
        out: &mut (dyn AsyncWrite + Send + Unpin),
        cancel: &CancelToken,
    ) -> Result<RunOutcome> {
        let app = request.app.as_str();
        let namespace = self.properties.namespace(app).await?;
        let source = self.source(app, &namespace).await?;
        let input = JobInput {
            app: app.to_string(),
            process_type: RUN_PROCESS.to_string(),
            namespace: namespace.clone(),
            deployment_id: source.deployment_id,
            image: source.image,
            image_source_type: source.image_source_type,
            image_pull_secrets: self.properties.image_pull_secrets(app).await?,
            command: self.command(app, &request.command).await?,
            env: request.env.clone(),
            env_secret: Some(env_secret_name(app, &source.process_type, source.deployment_id)),
            resources: self.resources.resolve(app, RUN_PROCESS).await?,
            suffix: random_suffix(),
        };

        self.client.ping().await?;
        let created = self.client.create_job(&namespace, &job(&input, request.remove)?).await?;
        let name = created.metadata.name.unwrap_or_else(|| input.name());
        info!(app = %app, job = %name, "Created job");

        let mut outcome = RunOutcome {
            job: name.clone(),
            pod: None,
            phase: None,
        };
        if request.detach {
            return Ok(outcome);
        }

        let attached = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SchedulerError::Cancelled(format!("Run of {app}"))),
            result = self.attach(app, &namespace, &name, out) => result,
        };
        match attached {
            Ok((pod, phase)) => {
                outcome.pod = Some(pod);
                outcome.phase = Some(phase);
            }
            Err(err) => {
                if let Err(cleanup) = self.client.delete_job(&namespace, &name).await {
                    warn!(job = %name, error = %cleanup, "Unable to delete job");
                }
                return Err(err);
            }
        }

        if request.remove {
            self.client.delete_job(&namespace, &name).await?;
            debug!(job = %name, "Deleted job");
        }
        Ok(outcome)
    }

    /// Wait for the job pod, copy its logs and return its final phase.
    async fn attach(
        &self,
        app: &str,
        namespace: &str,
        job: &str,
        out: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(String, String)> {
        let timeout = self.properties.deploy_timeout(app).await?;
        let selector = format!("{JOB_NAME_LABEL}={job}");
        self.waiter
            .wait_for_pod_running(&WaitForPodInput {
                namespace: namespace.to_string(),
                label_selector: selector.clone(),
                pod_name: None,
                timeout,
                allow_completion: true,
            })
            .await?;

        let pod = self
            .client
            .list_pods(namespace, &selector)
            .await?
            .into_iter()
            .find_map(|p| p.metadata.name)
            .ok_or_else(|| SchedulerError::NoPods {
                namespace: namespace.to_string(),
                selector: selector.clone(),
            })?;

        let container = format!("{app}-{RUN_PROCESS}");
        self.client
            .stream_logs(namespace, &pod, Some(&container), true, out)
            .await?;
        let phase = self.waiter.wait_for_completion(namespace, &pod, timeout).await?;
        info!(job = %job, pod = %pod, phase = %phase, "Job finished");
        Ok((pod, phase))
    }

    /// Exec into a pod of `request.app`.
    pub async fn enter(&self, request: &EnterRequest) -> Result<()> {
        let app = request.app.as_str();
        let namespace = self.properties.namespace(app).await?;
        let target = request.target.as_deref().unwrap_or("web");
        let pod = self.waiter.select_pod(&namespace, app, target).await?;
        let pod_name = pod
            .metadata
            .name
            .ok_or_else(|| SchedulerError::NotFound(format!("pod for {target}")))?;

        self.waiter
            .enter_pod(&EnterPodInput {
                namespace,
                pod: pod_name,
                container: None,
                command: request.command.clone(),
                shell: self.app_shell(app).await?,
                tty: request.tty,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::cluster_client::MockClusterClient;
    use crate::deploy::{DeployRequest, Deployer};
    use crate::helm::MockChartManager;
    use crate::manifest::job::HEROKUISH_EXEC;
    use crate::portmap::PortMap;
    use crate::properties::{K3S_SCHEDULER, SCHEDULER_DOMAIN, SCHEDULER_KEY};
    use crate::providers::MemoryProviders;
    use plfm_properties::{MemoryPropertyStore, PropertyStore, GLOBAL_SCOPE};

    const NOW: i64 = 1_700_000_000;

    struct Fixture {
        cluster: Arc<MockClusterClient>,
        runner: Runner,
    }

    async fn fixture(providers: MemoryProviders, processes: &[(&str, u32)]) -> Fixture {
        let store = Arc::new(MemoryPropertyStore::new());
        store
            .set(SCHEDULER_DOMAIN, GLOBAL_SCOPE, SCHEDULER_KEY, K3S_SCHEDULER)
            .await
            .unwrap();
        let properties = Properties::new(store);
        let cluster = Arc::new(MockClusterClient::new());
        let charts = Arc::new(MockChartManager::with_cluster(cluster.clone()));
        let clock = Arc::new(ManualClock::new(NOW));
        let providers = Providers::from_single(Arc::new(providers));

        if !processes.is_empty() {
            Deployer::new(cluster.clone(), charts, properties.clone(), providers.clone(), clock.clone())
                .deploy(
                    &DeployRequest {
                        app: "foo".into(),
                        image: "registry.local/foo:3".into(),
                        image_source_type: ImageSourceType::Herokuish,
                        processes: processes.iter().map(|(p, n)| (p.to_string(), *n)).collect(),
                        healthchecks: BTreeMap::new(),
                        working_dir: None,
                    },
                    &CancelToken::never(),
                )
                .await
                .unwrap();
        }

        Fixture {
            runner: Runner::new(cluster.clone(), properties, providers, clock),
            cluster,
        }
    }

    fn providers() -> MemoryProviders {
        MemoryProviders::new()
            .with_app("foo")
            .with_port_map("foo", PortMap::new("http", 80, 5000))
    }

    fn request(command: &[&str]) -> RunRequest {
        RunRequest {
            app: "foo".into(),
            command: command.iter().map(|c| c.to_string()).collect(),
            env: BTreeMap::from([("DEBUG".to_string(), "1".to_string())]),
            detach: false,
            remove: true,
        }
    }

    #[tokio::test]
    async fn test_run_attached_streams_logs_and_removes_job() {
        let f = fixture(providers(), &[("web", 1), ("worker", 1)]).await;
        f.cluster.set_job_logs("migrated\n");

        let mut out = Vec::new();
        let outcome = f
            .runner
            .run(&request(&["rake", "db:migrate"]), &mut out, &CancelToken::never())
            .await
            .unwrap();

        assert!(outcome.job.starts_with("foo-run-"), "{}", outcome.job);
        assert_eq!(outcome.phase.as_deref(), Some("Succeeded"));
        assert!(!outcome.failed());
        assert_eq!(String::from_utf8(out).unwrap(), "migrated\n");
        assert!(f.cluster.jobs("default").is_empty());
    }

    #[tokio::test]
    async fn test_run_uses_web_release() {
        let f = fixture(providers(), &[("web", 1), ("worker", 1)]).await;
        let mut request = request(&["rake", "db:migrate"]);
        request.detach = true;

        let outcome = f
            .runner
            .run(&request, &mut Vec::new(), &CancelToken::never())
            .await
            .unwrap();
        assert_eq!(outcome.phase, None);

        let jobs = f.cluster.jobs("default");
        assert_eq!(jobs.len(), 1);
        let spec = jobs[0].spec.clone().unwrap();
        assert_eq!(spec.backoff_limit, Some(0));
        assert!(spec.ttl_seconds_after_finished.is_some());
        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        let container = &pod.containers[0];
        assert_eq!(container.image.as_deref(), Some("registry.local/foo:3"));
        assert_eq!(container.command.clone().unwrap(), vec![HEROKUISH_EXEC]);
        assert_eq!(container.args.clone().unwrap(), vec!["rake", "db:migrate"]);
        let env_from = container.env_from.clone().unwrap();
        assert_eq!(
            env_from[0].secret_ref.as_ref().unwrap().name,
            format!("env-foo-web.{NOW}")
        );
    }

    #[tokio::test]
    async fn test_run_falls_back_to_first_deployment() {
        let f = fixture(providers(), &[("worker", 1)]).await;
        let mut request = request(&["true"]);
        request.detach = true;
        f.runner
            .run(&request, &mut Vec::new(), &CancelToken::never())
            .await
            .unwrap();
        let jobs = f.cluster.jobs("default");
        let container = jobs[0].spec.clone().unwrap().template.spec.unwrap().containers[0].clone();
        assert_eq!(
            container.env_from.unwrap()[0].secret_ref.as_ref().unwrap().name,
            format!("env-foo-worker.{NOW}")
        );
    }

    #[tokio::test]
    async fn test_run_reports_failed_pod() {
        let f = fixture(providers(), &[("web", 1)]).await;
        f.cluster.set_job_pod_phase("Failed");
        let outcome = f
            .runner
            .run(&request(&["false"]), &mut Vec::new(), &CancelToken::never())
            .await
            .unwrap();
        assert!(outcome.failed());
    }

    #[tokio::test]
    async fn test_run_without_deploy() {
        let f = fixture(providers(), &[]).await;
        let err = f
            .runner
            .run(&request(&["true"]), &mut Vec::new(), &CancelToken::never())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "App foo has not been deployed");
    }

    #[tokio::test]
    async fn test_bare_run_uses_app_shell_and_procfile() {
        let providers = providers()
            .with_env("foo", APP_SHELL_KEY, "/bin/sh")
            .with_procfile("foo", "console", "bin/console --quiet");
        let f = fixture(providers, &[("web", 1)]).await;

        assert_eq!(f.runner.command("foo", &[]).await.unwrap(), vec!["/bin/sh"]);
        assert_eq!(
            f.runner.command("foo", &["console".to_string()]).await.unwrap(),
            vec!["bin/console", "--quiet"]
        );
        assert_eq!(
            f.runner.command("foo", &["ls".to_string()]).await.unwrap(),
            vec!["ls"]
        );
    }

    #[tokio::test]
    async fn test_enter_uses_app_shell() {
        let f = fixture(providers().with_env("foo", APP_SHELL_KEY, "/bin/zsh"), &[("web", 2)]).await;
        f.runner
            .enter(&EnterRequest {
                app: "foo".into(),
                target: Some("web.2".into()),
                command: Vec::new(),
                tty: true,
            })
            .await
            .unwrap();

        let requests = f.cluster.exec_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].pod, format!("foo-web-{NOW}-2"));
        assert_eq!(requests[0].container, "foo-web");
        assert_eq!(requests[0].command, vec![HEROKUISH_EXEC, "/bin/zsh"]);
    }
}
