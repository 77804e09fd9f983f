//! Deploy orchestration.
//!
//! A deploy renders one chart per process type and installs it as release
//! `<app>-<process type>`. Cron commands share the `<app>-cron` release.
//! Releases recorded by the previous deploy that the new one no longer
//! produces are uninstalled once the new set is live.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::appjson::Healthcheck;
use crate::cancel::CancelToken;
use crate::clock::Clock;
use crate::cluster_client::ClusterClient;
use crate::cron::{app_cron_entries, CronEntry};
use crate::error::{Result, SchedulerError};
use crate::helm::{ChartInput, ChartManager};
use crate::manifest::chart::{write_chart, ChartMetadata};
use crate::manifest::command::start_command;
use crate::manifest::cron::cron_job;
use crate::manifest::ingress::{self, IngressInput, TlsSource};
use crate::manifest::job::{random_suffix, JobInput};
use crate::manifest::secret::{env_secret, env_secret_name, tls_secret_name};
use crate::manifest::workload;
use crate::manifest::{
    managed_marker, selector_labels, selector_string, ImageSourceType, Manifest, ProcessSpec,
    CRON_ID_ANNOTATION, DEPLOYMENT_ID_LABEL, JOB_SUFFIX_ANNOTATION, PART_OF_LABEL,
};
use crate::portmap::{primary_port, PortMap};
use crate::properties::{IngressClass, Properties};
use crate::providers::Providers;
use crate::readiness::{ReadinessWaiter, WaitForPodInput};
use crate::resources::ResourceResolver;
use crate::shell;

/// Process type owning the service and routes.
pub const WEB_PROCESS: &str = "web";

/// Process type of scheduled commands.
pub const CRON_PROCESS: &str = "cron";

/// A built image to roll out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployRequest {
    pub app: String,
    pub image: String,
    pub image_source_type: ImageSourceType,
    /// Replica count per process type.
    pub processes: BTreeMap<String, u32>,
    /// Health checks per process type.
    pub healthchecks: BTreeMap<String, Vec<Healthcheck>>,
    pub working_dir: Option<String>,
}

/// What a finished deploy left installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployOutcome {
    pub deployment_id: i64,
    pub releases: BTreeSet<String>,
}

/// Per-app settings read once per deploy.
#[derive(Debug, Clone)]
struct DeploySettings {
    namespace: String,
    timeout: Duration,
    rollback_on_failure: bool,
    image_pull_secrets: Option<String>,
    ingress_class: IngressClass,
    tls: TlsSource,
}

/// `<app>-cron`.
pub fn cron_release_name(app: &str) -> String {
    format!("{app}-{CRON_PROCESS}")
}

/// Rolls out, stops and removes apps.
pub struct Deployer {
    client: Arc<dyn ClusterClient>,
    charts: Arc<dyn ChartManager>,
    properties: Properties,
    providers: Providers,
    resources: ResourceResolver,
    waiter: ReadinessWaiter,
    clock: Arc<dyn Clock>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl Deployer {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        charts: Arc<dyn ChartManager>,
        properties: Properties,
        providers: Providers,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            resources: ResourceResolver::new(properties.store().clone()),
            waiter: ReadinessWaiter::new(client.clone(), clock.clone()),
            client,
            charts,
            properties,
            providers,
            clock,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the readiness waiter, e.g. to change the poll interval.
    pub fn with_waiter(mut self, waiter: ReadinessWaiter) -> Self {
        self.waiter = waiter;
        self
    }

    fn app_lock(&self, app: &str) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| SchedulerError::Provider("deploy lock poisoned".to_string()))?;
        Ok(locks.entry(app.to_string()).or_default().clone())
    }

    async fn settings(&self, app: &str) -> Result<DeploySettings> {
        let tls = if self.properties.tls_cert_imported(app).await? {
            TlsSource::Imported
        } else {
            let server = self.properties.letsencrypt_server(app).await?;
            match self.properties.letsencrypt_email(server).await? {
                Some(email) if !email.is_empty() => TlsSource::Letsencrypt(server),
                _ => TlsSource::None,
            }
        };

        Ok(DeploySettings {
            namespace: self.properties.namespace(app).await?,
            timeout: self.properties.deploy_timeout(app).await?,
            rollback_on_failure: self.properties.rollback_on_failure(app).await?,
            image_pull_secrets: self.properties.image_pull_secrets(app).await?,
            ingress_class: self.properties.ingress_class().await?,
            tls,
        })
    }

    /// Deploy every process of `request.app`.
    ///
    /// Concurrent deploys of the same app through one `Deployer` run one at a
    /// time.
    pub async fn deploy(&self, request: &DeployRequest, cancel: &CancelToken) -> Result<DeployOutcome> {
        let lock = self.app_lock(&request.app)?;
        let _guard = lock.lock().await;

        // `deploy_locked` observes `cancel` itself; helm must never be dropped mid-upgrade.
        self.deploy_locked(request, cancel).await.map_err(|err| {
            if err.is_cancelled() {
                warn!(app = %request.app, "Deployment of {} has been cancelled", request.app);
                cancelled(&request.app)
            } else {
                err
            }
        })
    }

    async fn deploy_locked(&self, request: &DeployRequest, cancel: &CancelToken) -> Result<DeployOutcome> {
        let app = request.app.as_str();
        let settings = self.settings(app).await?;

        let managed = managed_marker();
        self.client
            .create_namespace(&settings.namespace, &managed, &managed)
            .await?;

        let deployment_id = self.clock.unix_timestamp();
        let env = self.providers.config.env(app).await?;
        let port_maps = self.providers.ports.list(app).await?;
        info!(app = %app, deployment_id, image = %request.image, "Deploying app");

        let mut releases = BTreeSet::new();
        for (process_type, &replicas) in &request.processes {
            ensure_not_cancelled(cancel, app)?;
            let spec = self
                .process_spec(request, &settings, process_type, replicas, deployment_id, &port_maps)
                .await?;
            let mut manifests = vec![Manifest::new("Deployment", &spec.name(), &workload::deployment(&spec)?)?];
            if let Some(service) = workload::service(&spec)? {
                manifests.push(Manifest::new("Service", &format!("{app}-{WEB_PROCESS}"), &service)?);
            }
            manifests.push(Manifest::new(
                "Secret",
                &spec.env_secret_name(),
                &env_secret(app, process_type, &settings.namespace, deployment_id, &env),
            )?);
            if spec.is_web() {
                manifests.extend(self.ingress_manifests(app, &settings, deployment_id, &port_maps).await?);
            }

            let release = spec.name();
            let values = json!({
                "global": {
                    "appName": app,
                    "deploymentId": deployment_id.to_string(),
                    "image": request.image,
                },
                "processType": process_type,
                "replicas": replicas,
            });
            info!(app = %app, release = %release, "Installing {release}");
            self.install(&release, &settings, deployment_id, &values, &manifests, cancel)
                .await?;
            releases.insert(release);
        }

        ensure_not_cancelled(cancel, app)?;
        if let Some(release) = self
            .deploy_cron(request, &settings, deployment_id, &env, cancel)
            .await?
        {
            releases.insert(release);
        }

        for (process_type, &replicas) in &request.processes {
            if replicas == 0 {
                continue;
            }
            let mut selector = selector_labels(app, process_type);
            selector.insert(DEPLOYMENT_ID_LABEL.to_string(), deployment_id.to_string());
            debug!(app = %app, process_type = %process_type, "Waiting for pods");
            let input = WaitForPodInput {
                namespace: settings.namespace.clone(),
                label_selector: selector_string(&selector),
                pod_name: None,
                timeout: settings.timeout,
                allow_completion: false,
            };
            tokio::select! {
                result = self.waiter.wait_for_pod_running(&input) => result?,
                _ = cancel.cancelled() => return Err(cancelled(app)),
            };
        }

        self.prune(app, &settings.namespace, &releases).await?;
        self.properties.set_deployed_releases(app, &releases).await?;

        info!(app = %app, deployment_id, releases = releases.len(), "Deploy complete");
        Ok(DeployOutcome {
            deployment_id,
            releases,
        })
    }

    async fn process_spec(
        &self,
        request: &DeployRequest,
        settings: &DeploySettings,
        process_type: &str,
        replicas: u32,
        deployment_id: i64,
        port_maps: &[PortMap],
    ) -> Result<ProcessSpec> {
        let app = request.app.as_str();
        let port_maps = if process_type == WEB_PROCESS {
            port_maps.to_vec()
        } else {
            Vec::new()
        };
        let command = start_command(
            &self.providers,
            app,
            process_type,
            request.image_source_type,
            primary_port(&port_maps),
        )
        .await?;

        Ok(ProcessSpec {
            app: app.to_string(),
            process_type: process_type.to_string(),
            namespace: settings.namespace.clone(),
            deployment_id,
            image: request.image.clone(),
            image_source_type: request.image_source_type,
            command,
            image_pull_secrets: settings.image_pull_secrets.clone(),
            replicas,
            port_maps,
            resources: self.resources.resolve(app, process_type).await?,
            healthchecks: request
                .healthchecks
                .get(process_type)
                .cloned()
                .unwrap_or_default(),
            working_dir: request.working_dir.clone(),
        })
    }

    async fn ingress_manifests(
        &self,
        app: &str,
        settings: &DeploySettings,
        deployment_id: i64,
        port_maps: &[PortMap],
    ) -> Result<Vec<Manifest>> {
        if !self.providers.apps.vhost_enabled(app).await? {
            debug!(app = %app, "Domains disabled, skipping routes");
            return Ok(Vec::new());
        }
        ingress::manifests(&IngressInput {
            app: app.to_string(),
            namespace: settings.namespace.clone(),
            deployment_id,
            domains: self.providers.apps.domains(app).await?,
            port_maps: port_maps.to_vec(),
            class: settings.ingress_class,
            tls: settings.tls,
        })
    }

    async fn install(
        &self,
        release: &str,
        settings: &DeploySettings,
        deployment_id: i64,
        values: &serde_json::Value,
        manifests: &[Manifest],
        cancel: &CancelToken,
    ) -> Result<()> {
        let chart = write_chart(ChartMetadata::new(release, deployment_id), values, manifests).await?;
        self.charts
            .install_or_upgrade(
                &ChartInput {
                    chart_path: chart.path().to_path_buf(),
                    namespace: settings.namespace.clone(),
                    release_name: release.to_string(),
                    values: values.clone(),
                    rollback_on_failure: settings.rollback_on_failure,
                    timeout: settings.timeout,
                    wait: false,
                },
                cancel,
            )
            .await
    }

    /// Suffixes of live cron jobs keyed by cron id.
    async fn cron_suffixes(&self, app: &str, namespace: &str) -> Result<HashMap<String, String>> {
        let selector = selector_string(&selector_labels(app, CRON_PROCESS));
        let cron_jobs = self.client.list_cron_jobs(namespace, &selector).await?;
        Ok(cron_jobs
            .into_iter()
            .filter_map(|c| {
                let annotations = c.metadata.annotations?;
                Some((
                    annotations.get(CRON_ID_ANNOTATION)?.clone(),
                    annotations.get(JOB_SUFFIX_ANNOTATION)?.clone(),
                ))
            })
            .collect())
    }

    /// Install the cron release, or remove it when the app has no cron commands.
    async fn deploy_cron(
        &self,
        request: &DeployRequest,
        settings: &DeploySettings,
        deployment_id: i64,
        env: &BTreeMap<String, String>,
        cancel: &CancelToken,
    ) -> Result<Option<String>> {
        let app = request.app.as_str();
        let release = cron_release_name(app);
        let entries = app_cron_entries(self.providers.cron.as_ref(), app).await?;
        if entries.is_empty() {
            if self.charts.chart_exists(&settings.namespace, &release).await? {
                info!(app = %app, release = %release, "No cron commands, removing cron release");
                self.charts.uninstall(&settings.namespace, &release).await?;
            }
            return Ok(None);
        }

        let suffixes = self.cron_suffixes(app, &settings.namespace).await?;
        let resources = self.resources.resolve(app, CRON_PROCESS).await?;
        let secret_name = env_secret_name(app, CRON_PROCESS, deployment_id);

        let mut manifests = vec![Manifest::new(
            "Secret",
            &secret_name,
            &env_secret(app, CRON_PROCESS, &settings.namespace, deployment_id, env),
        )?];
        for entry in &entries {
            let input = JobInput {
                app: app.to_string(),
                process_type: CRON_PROCESS.to_string(),
                namespace: settings.namespace.clone(),
                deployment_id,
                image: request.image.clone(),
                image_source_type: request.image_source_type,
                image_pull_secrets: settings.image_pull_secrets.clone(),
                command: cron_command(entry)?,
                env: BTreeMap::new(),
                env_secret: Some(secret_name.clone()),
                resources: resources.clone(),
                suffix: suffixes.get(&entry.id).cloned().unwrap_or_else(random_suffix),
            };
            manifests.push(Manifest::new(
                "CronJob",
                &input.name(),
                &cron_job(&input, &entry.id, &entry.schedule)?,
            )?);
        }

        let values = json!({
            "global": {
                "appName": app,
                "deploymentId": deployment_id.to_string(),
                "image": request.image,
            },
            "cronIds": entries.iter().map(|e| e.id.as_str()).collect::<Vec<_>>(),
        });
        info!(app = %app, release = %release, entries = entries.len(), "Installing {release}");
        self.install(&release, settings, deployment_id, &values, &manifests, cancel)
            .await?;
        Ok(Some(release))
    }

    async fn prune(&self, app: &str, namespace: &str, current: &BTreeSet<String>) -> Result<()> {
        let previous = self.properties.deployed_releases(app).await?;
        for release in previous.difference(current) {
            info!(app = %app, release = %release, "Removing stale release");
            self.charts.uninstall(namespace, release).await?;
        }
        Ok(())
    }

    /// Scale every deployment of `app` to zero. Returns the deployments scaled.
    pub async fn stop(&self, app: &str) -> Result<Vec<String>> {
        let namespace = self.properties.namespace(app).await?;
        let selector = format!("{PART_OF_LABEL}={app}");
        let mut stopped = Vec::new();
        for deployment in self.client.list_deployments(&namespace, &selector).await? {
            let Some(name) = deployment.metadata.name else {
                continue;
            };
            self.client.scale_deployment(&namespace, &name, 0).await?;
            info!(app = %app, deployment = %name, "Stopped");
            stopped.push(name);
        }
        stopped.sort();
        Ok(stopped)
    }

    /// Remove everything installed for a deleted app and forget its settings.
    pub async fn post_delete(&self, app: &str) -> Result<()> {
        if !self.properties.uses_k3s(app).await? {
            return Ok(());
        }
        let namespace = self.properties.namespace(app).await?;
        let mut releases = self.properties.deployed_releases(app).await?;
        releases.insert(tls_secret_name(app));
        for release in &releases {
            if self.charts.chart_exists(&namespace, release).await? {
                info!(app = %app, release = %release, "Uninstalling release");
                self.charts.uninstall(&namespace, release).await?;
            }
        }
        self.properties.destroy_app(app).await
    }
}

fn cancelled(app: &str) -> SchedulerError {
    SchedulerError::Cancelled(format!("Deployment of {app}"))
}

fn ensure_not_cancelled(cancel: &CancelToken, app: &str) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(cancelled(app));
    }
    Ok(())
}

/// Split a cron command into container args.
fn cron_command(entry: &CronEntry) -> Result<Vec<String>> {
    shell::split(&format!("cron command for {}", entry.app), &entry.command)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::cancel_channel;
    use crate::clock::ManualClock;
    use crate::cluster_client::MockClusterClient;
    use crate::helm::MockChartManager;
    use crate::properties::{K3S_SCHEDULER, SCHEDULER_DOMAIN, SCHEDULER_KEY};
    use crate::providers::MemoryProviders;
    use k8s_openapi::api::batch::v1::CronJob;
    use plfm_properties::{MemoryPropertyStore, PropertyStore, GLOBAL_SCOPE};

    const NOW: i64 = 1_700_000_000;

    struct Fixture {
        cluster: Arc<MockClusterClient>,
        charts: Arc<MockChartManager>,
        properties: Properties,
        clock: Arc<ManualClock>,
        deployer: Deployer,
    }

    async fn fixture(providers: MemoryProviders) -> Fixture {
        let store = Arc::new(MemoryPropertyStore::new());
        store
            .set(SCHEDULER_DOMAIN, GLOBAL_SCOPE, SCHEDULER_KEY, K3S_SCHEDULER)
            .await
            .unwrap();
        let properties = Properties::new(store);
        let cluster = Arc::new(MockClusterClient::new());
        let charts = Arc::new(MockChartManager::with_cluster(cluster.clone()));
        let clock = Arc::new(ManualClock::new(NOW));
        let deployer = Deployer::new(
            cluster.clone(),
            charts.clone(),
            properties.clone(),
            Providers::from_single(Arc::new(providers)),
            clock.clone(),
        );
        Fixture {
            cluster,
            charts,
            properties,
            clock,
            deployer,
        }
    }

    fn request(processes: &[(&str, u32)]) -> DeployRequest {
        DeployRequest {
            app: "foo".into(),
            image: "registry.local/foo:1".into(),
            image_source_type: ImageSourceType::Dockerfile,
            processes: processes.iter().map(|(p, n)| (p.to_string(), *n)).collect(),
            healthchecks: BTreeMap::new(),
            working_dir: None,
        }
    }

    fn web_app() -> MemoryProviders {
        MemoryProviders::new()
            .with_app("foo")
            .with_port_map("foo", PortMap::new("http", 80, 5000))
            .with_env("foo", "DATABASE_URL", "postgres://db")
    }

    #[tokio::test]
    async fn test_deploy_installs_release_per_process() {
        let f = fixture(web_app().with_domain("foo", "foo.example.com")).await;
        let outcome = f
            .deployer
            .deploy(&request(&[("web", 1), ("worker", 2)]), &CancelToken::never())
            .await
            .unwrap();

        assert_eq!(outcome.deployment_id, NOW);
        assert_eq!(
            outcome.releases.iter().cloned().collect::<Vec<_>>(),
            vec!["foo-web", "foo-worker"]
        );
        assert_eq!(f.charts.releases("default"), vec!["foo-web", "foo-worker"]);
        assert_eq!(f.cluster.namespace_labels("default").unwrap()["plfm.dev/managed"], "true");

        let web = f.charts.latest("default", "foo-web").unwrap();
        assert_eq!(web.chart_version, format!("0.0.{NOW}"));
        assert!(web.files.contains_key("deployment-foo-web.yaml"));
        assert!(web.files.contains_key("service-foo-web.yaml"));
        assert!(web.files.contains_key(&format!("secret-env-foo-web.{NOW}.yaml")));
        assert!(web.files.keys().any(|k| k.starts_with("ingressroute-foo-web-http-80-5000")));

        let worker = f.charts.latest("default", "foo-worker").unwrap();
        assert!(!worker.files.keys().any(|k| k.starts_with("service-")));
        assert!(!worker.files.keys().any(|k| k.starts_with("ingressroute-")));

        let secret = f.cluster.secret("default", &format!("env-foo-web.{NOW}")).unwrap();
        assert!(secret.data.unwrap().contains_key("DATABASE_URL"));
        assert_eq!(
            f.properties.deployed_releases("foo").await.unwrap(),
            outcome.releases
        );
    }

    #[tokio::test]
    async fn test_deploy_prunes_stale_releases() {
        let f = fixture(web_app()).await;
        f.deployer
            .deploy(&request(&[("web", 1), ("worker", 1)]), &CancelToken::never())
            .await
            .unwrap();
        f.clock.advance(Duration::from_secs(60));

        f.deployer
            .deploy(&request(&[("web", 1)]), &CancelToken::never())
            .await
            .unwrap();

        assert_eq!(f.charts.uninstalls(), vec![("default".to_string(), "foo-worker".to_string())]);
        assert_eq!(f.charts.releases("default"), vec!["foo-web"]);
        let web = f.charts.latest("default", "foo-web").unwrap();
        assert!(web.upgrade);
        assert_eq!(web.chart_version, format!("0.0.{}", NOW + 60));
    }

    #[tokio::test]
    async fn test_zero_replicas_skips_wait() {
        let f = fixture(web_app()).await;
        f.cluster.hide_pods_for(100);
        f.deployer
            .deploy(&request(&[("worker", 0)]), &CancelToken::never())
            .await
            .unwrap();
        assert_eq!(f.charts.releases("default"), vec!["foo-worker"]);
    }

    #[tokio::test]
    async fn test_deploy_fails_without_pods() {
        let f = fixture(web_app()).await;
        f.cluster.hide_pods_for(100);
        let err = f
            .deployer
            .deploy(&request(&[("web", 1)]), &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::NoPods { .. }), "{err}");
        assert!(f.properties.deployed_releases("foo").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_rollback_flag_aborts_before_install() {
        let f = fixture(web_app()).await;
        f.properties
            .store()
            .set(crate::properties::DOMAIN, "foo", "rollback-on-failure", "maybe")
            .await
            .unwrap();
        let err = f
            .deployer
            .deploy(&request(&[("web", 1)]), &CancelToken::never())
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Configuration(_)), "{err}");
        assert!(f.charts.installs().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_deploy() {
        let f = fixture(web_app()).await;
        let (tx, cancel) = cancel_channel();
        tx.send(true).unwrap();
        let err = f
            .deployer
            .deploy(&request(&[("web", 1)]), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(err.to_string(), "Deployment of foo has been cancelled");
        assert!(f.charts.installs().is_empty());
        assert!(f.properties.deployed_releases("foo").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cron_release_reuses_suffix() {
        let providers = web_app().with_cron("foo", "rake cleanup", "@daily");
        let f = fixture(providers).await;
        let id = crate::cron::cron_id("foo", "rake cleanup", "@daily");

        let mut existing = CronJob::default();
        existing.metadata.name = Some("foo-cron-aaaaaaaaaa".into());
        existing.metadata.labels = Some(crate::manifest::managed_labels("foo", CRON_PROCESS));
        existing.metadata.annotations = Some(BTreeMap::from([
            (CRON_ID_ANNOTATION.to_string(), id.clone()),
            (JOB_SUFFIX_ANNOTATION.to_string(), "aaaaaaaaaa".to_string()),
        ]));
        f.cluster.insert_cron_job("default", existing);

        let outcome = f
            .deployer
            .deploy(&request(&[("web", 1)]), &CancelToken::never())
            .await
            .unwrap();
        assert!(outcome.releases.contains("foo-cron"));

        let cron = f.charts.latest("default", "foo-cron").unwrap();
        let file = cron.files.get("cronjob-foo-cron-aaaaaaaaaa.yaml").unwrap();
        assert!(file.contains("rake"));
        assert!(file.contains(&id));
        assert!(cron.files.contains_key(&format!("secret-env-foo-cron.{NOW}.yaml")));
    }

    #[tokio::test]
    async fn test_cron_release_removed_without_entries() {
        let f = fixture(web_app().with_cron("foo", "rake cleanup", "@daily")).await;
        f.deployer
            .deploy(&request(&[("web", 1)]), &CancelToken::never())
            .await
            .unwrap();
        assert!(f.charts.releases("default").contains(&"foo-cron".to_string()));

        let without_cron = Deployer::new(
            f.cluster.clone(),
            f.charts.clone(),
            f.properties.clone(),
            Providers::from_single(Arc::new(web_app())),
            f.clock.clone(),
        );
        let outcome = without_cron
            .deploy(&request(&[("web", 1)]), &CancelToken::never())
            .await
            .unwrap();
        assert!(!outcome.releases.contains("foo-cron"));
        assert_eq!(f.charts.releases("default"), vec!["foo-web"]);
    }

    #[tokio::test]
    async fn test_stop_scales_to_zero() {
        let f = fixture(web_app()).await;
        f.deployer
            .deploy(&request(&[("web", 2), ("worker", 1)]), &CancelToken::never())
            .await
            .unwrap();

        let stopped = f.deployer.stop("foo").await.unwrap();
        assert_eq!(stopped, vec!["foo-web", "foo-worker"]);
        let web = f.cluster.deployment("default", "foo-web").unwrap();
        assert_eq!(web.spec.unwrap().replicas, Some(0));
    }

    #[tokio::test]
    async fn test_post_delete_removes_releases_and_properties() {
        let f = fixture(web_app()).await;
        f.deployer
            .deploy(&request(&[("web", 1)]), &CancelToken::never())
            .await
            .unwrap();
        f.properties
            .set("foo", "deploy-timeout", Some("60"))
            .await
            .unwrap();

        f.deployer.post_delete("foo").await.unwrap();
        assert!(f.charts.releases("default").is_empty());
        assert!(f.properties.deployed_releases("foo").await.unwrap().is_empty());
        assert_eq!(f.properties.app_value("foo", "deploy-timeout").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_same_app_deploys_are_serialized() {
        let f = fixture(web_app()).await;
        let deployer = Arc::new(f.deployer);
        let first = {
            let deployer = deployer.clone();
            tokio::spawn(async move {
                deployer
                    .deploy(&request(&[("web", 1)]), &CancelToken::never())
                    .await
            })
        };
        let second = {
            let deployer = deployer.clone();
            tokio::spawn(async move {
                deployer
                    .deploy(&request(&[("web", 1)]), &CancelToken::never())
                    .await
            })
        };
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        let installs = f.charts.installs();
        assert_eq!(installs.len(), 2);
        assert!(!installs[0].upgrade);
        assert!(installs[1].upgrade);
    }
}
