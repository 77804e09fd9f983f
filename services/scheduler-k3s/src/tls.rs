//! TLS synchronizer.
//!
//! Imported certificates are shipped to the cluster as a `tls-<app>` release
//! holding a single secret. The secret is labelled with a checksum of the
//! material so unchanged certificates are not redeployed.

use std::sync::Arc;

use sha2::{Digest, Sha224};
use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::clock::Clock;
use crate::cluster_client::ClusterClient;
use crate::error::Result;
use crate::helm::{ChartInput, ChartManager};
use crate::manifest::chart::{write_chart, ChartMetadata};
use crate::manifest::secret::{tls_secret, tls_secret_name, TlsSecretValues};
use crate::manifest::{managed_marker, Manifest, CERT_CHECKSUM_LABEL};
use crate::properties::Properties;
use crate::providers::{AppDirectory, CertKind, CertProvider};

/// Hex SHA-224 of `cert + key`. 56 chars, short enough for a label value.
pub fn checksum(cert: &str, key: &str) -> String {
    let mut hasher = Sha224::new();
    hasher.update(cert.as_bytes());
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Outcome of a batch sync.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub synced: Vec<String>,
    pub failed: Vec<(String, String)>,
}

pub struct TlsSynchronizer {
    client: Arc<dyn ClusterClient>,
    charts: Arc<dyn ChartManager>,
    properties: Properties,
    certs: Arc<dyn CertProvider>,
    apps: Arc<dyn AppDirectory>,
    clock: Arc<dyn Clock>,
}

impl TlsSynchronizer {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        charts: Arc<dyn ChartManager>,
        properties: Properties,
        certs: Arc<dyn CertProvider>,
        apps: Arc<dyn AppDirectory>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            client,
            charts,
            properties,
            certs,
            apps,
            clock,
        }
    }

    async fn current_checksum(&self, app: &str) -> Result<String> {
        let crt = self.certs.get(app, CertKind::Crt).await?;
        let key = self.certs.get(app, CertKind::Key).await?;
        Ok(checksum(&crt, &key))
    }

    /// Whether the cluster secret is missing or stale.
    pub async fn needs_update(&self, app: &str) -> Result<bool> {
        let namespace = self.properties.namespace(app).await?;
        let secret = match self.client.get_secret(&namespace, &tls_secret_name(app)).await {
            Ok(secret) => secret,
            Err(_) => return Ok(true),
        };
        let Some(deployed) = secret
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(CERT_CHECKSUM_LABEL))
            .cloned()
        else {
            return Ok(true);
        };
        Ok(deployed != self.current_checksum(app).await?)
    }

    /// Deploy the app's certificate. Returns false when skipped.
    pub async fn sync(&self, app: &str, cancel: &CancelToken) -> Result<bool> {
        if let Err(err) = self.client.ping().await {
            if err.is_unavailable() {
                info!(app = %app, "Kubernetes not available, skipping certificate sync");
                return Ok(false);
            }
            return Err(err);
        }
        if !self.properties.uses_k3s(app).await? {
            return Ok(false);
        }

        let namespace = self.properties.namespace(app).await?;
        let crt = self.certs.get(app, CertKind::Crt).await?;
        let key = self.certs.get(app, CertKind::Key).await?;
        let values = TlsSecretValues::new(app, &namespace, &checksum(&crt, &key), &crt, &key);

        let release = tls_secret_name(app);
        let manifest = Manifest::new("Secret", &release, &tls_secret(&values)?)?;
        let chart = write_chart(
            ChartMetadata::new(&release, self.clock.unix_timestamp()),
            &serde_json::to_value(&values)?,
            &[manifest],
        )
        .await?;

        let managed = managed_marker();
        self.client
            .create_namespace(&namespace, &managed, &managed)
            .await?;

        info!(app = %app, release = %release, "Syncing certificate");
        self.charts
            .install_or_upgrade(
                &ChartInput {
                    chart_path: chart.path().to_path_buf(),
                    namespace,
                    release_name: release,
                    values: serde_json::to_value(&values)?,
                    rollback_on_failure: false,
                    timeout: self.properties.deploy_timeout(app).await?,
                    wait: true,
                },
                cancel,
            )
            .await?;

        self.properties.set_tls_cert_imported(app, true).await?;
        Ok(true)
    }

    /// Remove the app's certificate release. Returns whether one existed.
    pub async fn remove(&self, app: &str) -> Result<bool> {
        let namespace = self.properties.namespace(app).await?;
        let release = tls_secret_name(app);
        let existed = self.charts.chart_exists(&namespace, &release).await?;
        if existed {
            self.charts.uninstall(&namespace, &release).await?;
            info!(app = %app, release = %release, "Removed certificate");
        }
        self.properties.set_tls_cert_imported(app, false).await?;
        Ok(existed)
    }

    /// Sync every k3s app with a stale certificate. Failures do not stop the batch.
    pub async fn sync_all(&self, cancel: &CancelToken) -> Result<SyncSummary> {
        let mut summary = SyncSummary::default();
        for app in self.apps.apps().await? {
            match self.sync_if_needed(&app, cancel).await {
                Ok(true) => summary.synced.push(app),
                Ok(false) => {}
                Err(err) => {
                    warn!(app = %app, error = %err, "Unable to sync certificate");
                    summary.failed.push((app, err.to_string()));
                }
            }
        }
        Ok(summary)
    }

    async fn sync_if_needed(&self, app: &str, cancel: &CancelToken) -> Result<bool> {
        if !self.properties.uses_k3s(app).await? || !self.certs.exists(app).await? {
            return Ok(false);
        }
        if !self.needs_update(app).await? {
            return Ok(false);
        }
        self.sync(app, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::cluster_client::MockClusterClient;
    use crate::helm::MockChartManager;
    use crate::properties::{K3S_SCHEDULER, SCHEDULER_DOMAIN, SCHEDULER_KEY};
    use crate::providers::MemoryProviders;
    use plfm_properties::{MemoryPropertyStore, PropertyStore, GLOBAL_SCOPE};

    struct Fixture {
        cluster: Arc<MockClusterClient>,
        charts: Arc<MockChartManager>,
        providers: Arc<MemoryProviders>,
        properties: Properties,
        sync: TlsSynchronizer,
    }

    async fn fixture() -> Fixture {
        let cluster = Arc::new(MockClusterClient::new());
        let charts = Arc::new(MockChartManager::with_cluster(cluster.clone()));
        let providers = Arc::new(
            MemoryProviders::new()
                .with_cert("foo", "CRT", "KEY")
                .with_app("bar"),
        );
        let store = Arc::new(MemoryPropertyStore::new());
        store
            .set(SCHEDULER_DOMAIN, GLOBAL_SCOPE, SCHEDULER_KEY, K3S_SCHEDULER)
            .await
            .unwrap();
        let properties = Properties::new(store);
        let sync = TlsSynchronizer::new(
            cluster.clone(),
            charts.clone(),
            properties.clone(),
            providers.clone(),
            providers.clone(),
            Arc::new(ManualClock::default()),
        );
        Fixture {
            cluster,
            charts,
            providers,
            properties,
            sync,
        }
    }

    #[test]
    fn test_checksum() {
        let sum = checksum("CRT", "KEY");
        assert_eq!(sum.len(), 56);
        assert_eq!(sum, checksum("CR", "TKEY"));
        assert_ne!(sum, checksum("CRT", "KEY2"));
    }

    #[tokio::test]
    async fn test_sync_then_up_to_date() {
        let f = fixture().await;
        assert!(f.sync.needs_update("foo").await.unwrap());

        assert!(f.sync.sync("foo", &CancelToken::never()).await.unwrap());
        assert!(!f.sync.needs_update("foo").await.unwrap());
        assert!(f.properties.tls_cert_imported("foo").await.unwrap());

        let install = &f.charts.installs()[0];
        assert_eq!(install.release, "tls-foo");
        assert!(install.wait);
        assert!(f.cluster.secret("default", "tls-foo").is_some());

        f.providers.set_cert("foo", "CRT", "NEWKEY").unwrap();
        assert!(f.sync.needs_update("foo").await.unwrap());
    }

    #[tokio::test]
    async fn test_sync_skips_when_unavailable_or_not_k3s() {
        let f = fixture().await;
        f.properties
            .store()
            .set(SCHEDULER_DOMAIN, "foo", SCHEDULER_KEY, "docker-local")
            .await
            .unwrap();
        assert!(!f.sync.sync("foo", &CancelToken::never()).await.unwrap());

        let providers = Arc::new(MemoryProviders::new().with_cert("foo", "CRT", "KEY"));
        let offline = TlsSynchronizer::new(
            Arc::new(MockClusterClient::unavailable()),
            f.charts.clone(),
            f.properties.clone(),
            providers.clone(),
            providers,
            Arc::new(ManualClock::default()),
        );
        assert!(!offline.sync("foo", &CancelToken::never()).await.unwrap());
        assert!(f.charts.installs().is_empty());
    }

    #[tokio::test]
    async fn test_remove_clears_property() {
        let f = fixture().await;
        f.sync.sync("foo", &CancelToken::never()).await.unwrap();

        assert!(f.sync.remove("foo").await.unwrap());
        assert!(!f.properties.tls_cert_imported("foo").await.unwrap());
        assert!(!f.sync.remove("foo").await.unwrap());
    }

    #[tokio::test]
    async fn test_sync_all_isolates_failures() {
        let f = fixture().await;
        let failing = Arc::new(MockChartManager::new().failing("tls-foo"));
        let providers = Arc::new(
            MemoryProviders::new()
                .with_cert("foo", "CRT", "KEY")
                .with_cert("baz", "CRT2", "KEY2"),
        );
        let sync = TlsSynchronizer::new(
            f.cluster.clone(),
            failing.clone(),
            f.properties.clone(),
            providers.clone(),
            providers,
            Arc::new(ManualClock::default()),
        );

        let summary = sync.sync_all(&CancelToken::never()).await.unwrap();
        assert_eq!(summary.synced, vec!["baz"]);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].0, "foo");
    }
}
