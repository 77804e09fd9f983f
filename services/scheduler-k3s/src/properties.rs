//! Property-backed scheduler settings.
//!
//! Settings resolve in three layers: the app value, the global value, then a
//! built-in default. An empty value counts as unset at every layer.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use plfm_properties::{PropertyStore, GLOBAL_SCOPE};
use serde::Serialize;
use tracing::debug;

use crate::error::{Result, SchedulerError};

/// Property domain owned by the scheduler.
pub const DOMAIN: &str = "scheduler-k3s";

/// Domain and key holding the scheduler selected for an app.
pub const SCHEDULER_DOMAIN: &str = "scheduler";
pub const SCHEDULER_KEY: &str = "selected";

/// Scheduler used when nothing is selected.
pub const DEFAULT_SCHEDULER: &str = "docker-local";

/// Name under which this scheduler is selected.
pub const K3S_SCHEDULER: &str = "k3s";

/// Default kubeconfig written by k3s.
pub const KUBECONFIG_PATH: &str = "/etc/rancher/k3s/k3s.yaml";

const TLS_CERT_IMPORTED: &str = "tls-cert-imported";
const DEPLOYED_RELEASES: &str = "deployed-releases";

/// A user-settable property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertySpec {
    pub name: &'static str,
    pub default: &'static str,
    /// Only meaningful under `--global`.
    pub global_only: bool,
    /// Hidden from reports.
    pub secret: bool,
}

const fn app_property(name: &'static str, default: &'static str) -> PropertySpec {
    PropertySpec {
        name,
        default,
        global_only: false,
        secret: false,
    }
}

const fn global_property(name: &'static str, default: &'static str) -> PropertySpec {
    PropertySpec {
        name,
        default,
        global_only: true,
        secret: false,
    }
}

/// Every settable property, sorted by name.
pub const PROPERTIES: &[PropertySpec] = &[
    app_property("deploy-timeout", "300s"),
    app_property("image-pull-secrets", ""),
    global_property("ingress-class", "traefik"),
    global_property("kube-context", ""),
    global_property("kubeconfig-path", KUBECONFIG_PATH),
    global_property("letsencrypt-email-prod", ""),
    global_property("letsencrypt-email-stag", ""),
    app_property("letsencrypt-server", "prod"),
    app_property("namespace", "default"),
    global_property("network-interface", "eth0"),
    app_property("rollback-on-failure", "false"),
    PropertySpec {
        name: "token",
        default: "",
        global_only: true,
        secret: true,
    },
];

/// Look up a settable property by name.
pub fn property_spec(name: &str) -> Option<&'static PropertySpec> {
    PROPERTIES.iter().find(|p| p.name == name)
}

/// Ingress controller flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IngressClass {
    Traefik,
    Nginx,
}

impl IngressClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngressClass::Traefik => "traefik",
            IngressClass::Nginx => "nginx",
        }
    }
}

impl fmt::Display for IngressClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IngressClass {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "traefik" => Ok(IngressClass::Traefik),
            "nginx" => Ok(IngressClass::Nginx),
            other => Err(SchedulerError::config(format!(
                "Invalid ingress-class, must be either nginx or traefik: {other}"
            ))),
        }
    }
}

/// Let's Encrypt environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LetsencryptServer {
    Prod,
    Stag,
}

impl LetsencryptServer {
    /// Name of the cert-manager ClusterIssuer.
    pub fn issuer_name(&self) -> &'static str {
        match self {
            LetsencryptServer::Prod => "letsencrypt-prod",
            LetsencryptServer::Stag => "letsencrypt-stag",
        }
    }

    /// Global property holding the account email for this environment.
    pub fn email_property(&self) -> &'static str {
        match self {
            LetsencryptServer::Prod => "letsencrypt-email-prod",
            LetsencryptServer::Stag => "letsencrypt-email-stag",
        }
    }

    /// ACME directory URL.
    pub fn acme_url(&self) -> &'static str {
        match self {
            LetsencryptServer::Prod => "https://acme-v02.api.letsencrypt.org/directory",
            LetsencryptServer::Stag => "https://acme-staging-v02.api.letsencrypt.org/directory",
        }
    }
}

impl FromStr for LetsencryptServer {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "prod" | "production" => Ok(LetsencryptServer::Prod),
            "stag" | "staging" => Ok(LetsencryptServer::Stag),
            other => Err(SchedulerError::config(format!(
                "Invalid letsencrypt-server value: {other}"
            ))),
        }
    }
}

/// One row of `report`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportEntry {
    pub name: String,
    pub app: Option<String>,
    pub global: Option<String>,
    pub computed: String,
}

/// Scheduler settings over a property store.
#[derive(Clone)]
pub struct Properties {
    store: Arc<dyn PropertyStore>,
}

impl Properties {
    pub fn new(store: Arc<dyn PropertyStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn PropertyStore> {
        &self.store
    }

    async fn read(&self, domain: &str, scope: &str, key: &str) -> Result<Option<String>> {
        Ok(self
            .store
            .get(domain, scope, key)
            .await?
            .filter(|v| !v.is_empty()))
    }

    /// The app-level value only.
    pub async fn app_value(&self, app: &str, name: &str) -> Result<Option<String>> {
        self.read(DOMAIN, app, name).await
    }

    /// The global value only.
    pub async fn global_value(&self, name: &str) -> Result<Option<String>> {
        self.read(DOMAIN, GLOBAL_SCOPE, name).await
    }

    /// Global value, falling back to the default.
    pub async fn global_or_default(&self, name: &str) -> Result<String> {
        match self.global_value(name).await? {
            Some(value) => Ok(value),
            None => Ok(default_for(name).to_string()),
        }
    }

    /// App value, then global value, then default.
    pub async fn computed(&self, app: &str, name: &str) -> Result<String> {
        match self.app_value(app, name).await? {
            Some(value) => Ok(value),
            None => self.global_or_default(name).await,
        }
    }

    /// Set or clear a user property. `scope` is an app name or `--global`.
    pub async fn set(&self, scope: &str, name: &str, value: Option<&str>) -> Result<()> {
        let spec = property_spec(name)
            .ok_or_else(|| SchedulerError::config(format!("Invalid property specified: {name}")))?;
        if spec.global_only && scope != GLOBAL_SCOPE {
            return Err(SchedulerError::config(format!(
                "Property cannot be specified on a per-app basis: {name}"
            )));
        }

        match value.filter(|v| !v.is_empty()) {
            Some(value) => {
                validate_value(name, value)?;
                self.store.set(DOMAIN, scope, name, value).await?;
                debug!(scope, property = name, "property set");
            }
            None => {
                self.store.delete(DOMAIN, scope, name).await?;
                debug!(scope, property = name, "property cleared");
            }
        }
        Ok(())
    }

    pub async fn namespace(&self, app: &str) -> Result<String> {
        self.computed(app, "namespace").await
    }

    pub async fn deploy_timeout(&self, app: &str) -> Result<Duration> {
        timeout_from(&self.computed(app, "deploy-timeout").await?)
    }

    /// Deploy timeout for cluster-wide releases.
    pub async fn global_deploy_timeout(&self) -> Result<Duration> {
        timeout_from(&self.global_or_default("deploy-timeout").await?)
    }

    pub async fn rollback_on_failure(&self, app: &str) -> Result<bool> {
        let raw = self.computed(app, "rollback-on-failure").await?;
        parse_bool(&raw).ok_or_else(|| {
            SchedulerError::config(format!("Error parsing rollback-on-failure: invalid boolean '{raw}'"))
        })
    }

    pub async fn image_pull_secrets(&self, app: &str) -> Result<Option<String>> {
        let value = self.computed(app, "image-pull-secrets").await?;
        Ok(Some(value).filter(|v| !v.is_empty()))
    }

    pub async fn letsencrypt_server(&self, app: &str) -> Result<LetsencryptServer> {
        self.computed(app, "letsencrypt-server").await?.parse()
    }

    /// Account email for an environment, if configured.
    pub async fn letsencrypt_email(&self, server: LetsencryptServer) -> Result<Option<String>> {
        self.global_value(server.email_property()).await
    }

    pub async fn ingress_class(&self) -> Result<IngressClass> {
        self.global_or_default("ingress-class").await?.parse()
    }

    pub async fn kubeconfig_path(&self) -> Result<PathBuf> {
        Ok(PathBuf::from(self.global_or_default("kubeconfig-path").await?))
    }

    pub async fn kube_context(&self) -> Result<Option<String>> {
        self.global_value("kube-context").await
    }

    pub async fn network_interface(&self) -> Result<String> {
        self.global_or_default("network-interface").await
    }

    /// Cluster join token.
    pub async fn token(&self) -> Result<Option<String>> {
        self.global_value("token").await
    }

    /// Write a global value without user-facing validation.
    pub async fn set_global(&self, name: &str, value: &str) -> Result<()> {
        self.store.set(DOMAIN, GLOBAL_SCOPE, name, value).await?;
        Ok(())
    }

    /// Scheduler selected for an app, falling back to the global selection.
    pub async fn selected_scheduler(&self, app: &str) -> Result<String> {
        if let Some(value) = self.read(SCHEDULER_DOMAIN, app, SCHEDULER_KEY).await? {
            return Ok(value);
        }
        Ok(self
            .read(SCHEDULER_DOMAIN, GLOBAL_SCOPE, SCHEDULER_KEY)
            .await?
            .unwrap_or_else(|| DEFAULT_SCHEDULER.to_string()))
    }

    /// True when the app is scheduled on k3s.
    pub async fn uses_k3s(&self, app: &str) -> Result<bool> {
        Ok(self.selected_scheduler(app).await? == K3S_SCHEDULER)
    }

    pub async fn tls_cert_imported(&self, app: &str) -> Result<bool> {
        Ok(self.app_value(app, TLS_CERT_IMPORTED).await?.as_deref() == Some("true"))
    }

    pub async fn set_tls_cert_imported(&self, app: &str, imported: bool) -> Result<()> {
        if imported {
            self.store.set(DOMAIN, app, TLS_CERT_IMPORTED, "true").await?;
        } else {
            self.store.delete(DOMAIN, app, TLS_CERT_IMPORTED).await?;
        }
        Ok(())
    }

    /// Releases installed by the last successful deploy.
    pub async fn deployed_releases(&self, app: &str) -> Result<BTreeSet<String>> {
        Ok(self
            .app_value(app, DEPLOYED_RELEASES)
            .await?
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default())
    }

    pub async fn set_deployed_releases(&self, app: &str, releases: &BTreeSet<String>) -> Result<()> {
        if releases.is_empty() {
            self.store.delete(DOMAIN, app, DEPLOYED_RELEASES).await?;
        } else {
            let joined = releases.iter().cloned().collect::<Vec<_>>().join(",");
            self.store.set(DOMAIN, app, DEPLOYED_RELEASES, &joined).await?;
        }
        Ok(())
    }

    /// Drop every scheduler property of an app.
    pub async fn destroy_app(&self, app: &str) -> Result<()> {
        self.store.destroy(DOMAIN, app).await?;
        Ok(())
    }

    /// App, global and computed values of every non-secret property.
    pub async fn report(&self, app: &str) -> Result<Vec<ReportEntry>> {
        let mut entries = Vec::with_capacity(PROPERTIES.len());
        for spec in PROPERTIES.iter().filter(|p| !p.secret) {
            let app_value = if spec.global_only {
                None
            } else {
                self.app_value(app, spec.name).await?
            };
            let global = self.global_value(spec.name).await?;
            let computed = match (&app_value, &global) {
                (Some(v), _) | (None, Some(v)) => v.clone(),
                (None, None) => spec.default.to_string(),
            };
            entries.push(ReportEntry {
                name: spec.name.to_string(),
                app: app_value,
                global,
                computed,
            });
        }
        Ok(entries)
    }
}

fn default_for(name: &str) -> &'static str {
    property_spec(name).map(|p| p.default).unwrap_or("")
}

fn validate_value(name: &str, value: &str) -> Result<()> {
    match name {
        "deploy-timeout" => parse_duration(value)
            .map(|_| ())
            .map_err(|reason| SchedulerError::config(format!("Invalid deploy-timeout: {reason}"))),
        "rollback-on-failure" => parse_bool(value)
            .map(|_| ())
            .ok_or_else(|| SchedulerError::config(format!("Invalid rollback-on-failure: {value}"))),
        "ingress-class" => value.parse::<IngressClass>().map(|_| ()),
        "letsencrypt-server" => value.parse::<LetsencryptServer>().map(|_| ()),
        _ => Ok(()),
    }
}

fn timeout_from(raw: &str) -> Result<Duration> {
    parse_duration(raw).map_err(|reason| {
        SchedulerError::config(format!("Error parsing deploy-timeout '{raw}': {reason}"))
    })
}

/// Parse a duration such as `300s`, `5m`, `1m30s` or `250ms`. A bare
/// integer is read as seconds.
pub fn parse_duration(raw: &str) -> std::result::Result<Duration, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(secs) = raw.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = raw;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("missing unit in '{raw}'"))?;
        if digits == 0 {
            return Err(format!("expected a number in '{raw}'"));
        }
        let value: u64 = rest[..digits]
            .parse()
            .map_err(|_| format!("number out of range in '{raw}'"))?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        total += match unit {
            "ms" => Duration::from_millis(value),
            "s" => Duration::from_secs(value),
            "m" => Duration::from_secs(value * 60),
            "h" => Duration::from_secs(value * 3600),
            other => return Err(format!("unknown unit '{other}' in '{raw}'")),
        };
    }
    Ok(total)
}

/// Parse the boolean spellings accepted for flags.
pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Some(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Some(false),
        _ => None,
    }
}
