//! Manifest builder.
//!
//! Pure functions from already-resolved inputs to Kubernetes objects. The
//! only I/O is [`chart::write_chart`], which lays the rendered objects out as
//! a chart directory for helm.
//!
//! ## Modules
//!
//! - [`command`]: container start command resolution
//! - [`probes`]: health checks to probes
//! - [`workload`]: process deployment and web service
//! - [`ingress`]: ingress routes, certificates and cluster issuers
//! - [`secret`]: env and TLS secrets
//! - [`cron`]: scheduled jobs
//! - [`job`]: one-off run jobs
//! - [`chart`]: chart directory writer

pub mod chart;
pub mod command;
pub mod cron;
pub mod ingress;
pub mod job;
pub mod probes;
pub mod secret;
pub mod workload;

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::appjson::Healthcheck;
use crate::cluster_client::Labels;
use crate::error::{Result, SchedulerError};
use crate::portmap::PortMap;
use crate::resources::ProcessResourceMap;

// =============================================================================
// Labels and annotations
// =============================================================================

pub const MANAGED_LABEL: &str = "plfm.dev/managed";
pub const APP_NAME_LABEL: &str = "plfm.dev/app-name";
pub const PROCESS_TYPE_LABEL: &str = "plfm.dev/process-type";
pub const APP_PROCESS_TYPE_LABEL: &str = "plfm.dev/app-process-type";
pub const DEPLOYMENT_ID_LABEL: &str = "plfm.dev/deployment-id";
pub const DEPLOYMENT_ID_ANNOTATION: &str = "plfm.dev/deployment-id";
pub const BUILDER_TYPE_ANNOTATION: &str = "plfm.dev/builder-type";
pub const CERT_CHECKSUM_LABEL: &str = "plfm.dev/cert-checksum";
pub const CRON_ID_ANNOTATION: &str = "plfm.dev/cron-id";
pub const JOB_SUFFIX_ANNOTATION: &str = "plfm.dev/job-suffix";

pub const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";
pub const NAME_LABEL: &str = "app.kubernetes.io/name";
pub const PART_OF_LABEL: &str = "app.kubernetes.io/part-of";

pub const DEFAULT_CONTAINER_ANNOTATION: &str = "kubectl.kubernetes.io/default-container";

fn labels_from(pairs: &[(&str, &str)]) -> Labels {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Labels selecting the pods of one process.
pub fn selector_labels(app: &str, process_type: &str) -> Labels {
    labels_from(&[
        (INSTANCE_LABEL, &format!("{app}-{process_type}")),
        (NAME_LABEL, process_type),
        (PART_OF_LABEL, app),
    ])
}

/// Labels carried by every object managed for a process.
pub fn managed_labels(app: &str, process_type: &str) -> Labels {
    let mut labels = selector_labels(app, process_type);
    labels.extend(labels_from(&[
        (MANAGED_LABEL, "true"),
        (APP_NAME_LABEL, app),
        (PROCESS_TYPE_LABEL, process_type),
        (APP_PROCESS_TYPE_LABEL, &format!("{app}-{process_type}")),
    ]));
    labels
}

/// `plfm.dev/managed=true` alone, for namespaces.
pub fn managed_marker() -> Labels {
    labels_from(&[(MANAGED_LABEL, "true")])
}

/// Annotations carried by every managed object.
pub fn managed_annotations(deployment_id: i64) -> Labels {
    labels_from(&[
        (MANAGED_LABEL, "true"),
        (DEPLOYMENT_ID_ANNOTATION, &deployment_id.to_string()),
    ])
}

/// Render a selector map as `k=v,k=v`.
pub fn selector_string(labels: &Labels) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

// =============================================================================
// Process description
// =============================================================================

/// How an image was built.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageSourceType {
    #[default]
    Herokuish,
    Dockerfile,
    Pack,
}

impl ImageSourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageSourceType::Herokuish => "herokuish",
            ImageSourceType::Dockerfile => "dockerfile",
            ImageSourceType::Pack => "pack",
        }
    }
}

impl fmt::Display for ImageSourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageSourceType {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "herokuish" => Ok(ImageSourceType::Herokuish),
            "dockerfile" => Ok(ImageSourceType::Dockerfile),
            "pack" => Ok(ImageSourceType::Pack),
            other => Err(SchedulerError::config(format!(
                "Invalid image source type: {other}"
            ))),
        }
    }
}

/// Everything needed to render one process's workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub app: String,
    pub process_type: String,
    pub namespace: String,
    pub deployment_id: i64,
    pub image: String,
    pub image_source_type: ImageSourceType,
    /// Container args. Empty means the image default.
    pub command: Vec<String>,
    pub image_pull_secrets: Option<String>,
    pub replicas: u32,
    pub port_maps: Vec<PortMap>,
    pub resources: ProcessResourceMap,
    pub healthchecks: Vec<Healthcheck>,
    pub working_dir: Option<String>,
}

impl ProcessSpec {
    /// `<app>-<process type>`, the workload and release name.
    pub fn name(&self) -> String {
        format!("{}-{}", self.app, self.process_type)
    }

    pub fn is_web(&self) -> bool {
        self.process_type == "web"
    }

    /// Env secret mounted by this revision.
    pub fn env_secret_name(&self) -> String {
        secret::env_secret_name(&self.app, &self.process_type, self.deployment_id)
    }
}

// =============================================================================
// Rendered objects
// =============================================================================

/// One rendered object destined for a chart's `files/` directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    pub kind: String,
    pub name: String,
    pub yaml: String,
}

impl Manifest {
    pub fn new<T: Serialize>(kind: &str, name: &str, object: &T) -> Result<Self> {
        Ok(Self {
            kind: kind.to_string(),
            name: name.to_string(),
            yaml: serde_yaml::to_string(object)?,
        })
    }

    pub fn file_name(&self) -> String {
        format!("{}-{}.yaml", self.kind.to_lowercase(), self.name)
    }
}

/// Convert a JSON document into a typed object.
pub(crate) fn typed<T: DeserializeOwned>(value: serde_json::Value) -> Result<T> {
    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_managed_labels() {
        let labels = managed_labels("foo", "web");
        assert_eq!(labels[INSTANCE_LABEL], "foo-web");
        assert_eq!(labels[NAME_LABEL], "web");
        assert_eq!(labels[PART_OF_LABEL], "foo");
        assert_eq!(labels[APP_NAME_LABEL], "foo");
        assert_eq!(labels[APP_PROCESS_TYPE_LABEL], "foo-web");
        assert_eq!(labels[MANAGED_LABEL], "true");
    }

    #[test]
    fn test_selector_string_is_sorted() {
        assert_eq!(
            selector_string(&selector_labels("foo", "worker")),
            "app.kubernetes.io/instance=foo-worker,app.kubernetes.io/name=worker,app.kubernetes.io/part-of=foo"
        );
    }

    #[test]
    fn test_image_source_type() {
        assert_eq!("pack".parse::<ImageSourceType>().unwrap(), ImageSourceType::Pack);
        assert!("docker".parse::<ImageSourceType>().is_err());
        assert_eq!(ImageSourceType::Dockerfile.to_string(), "dockerfile");
    }

    #[test]
    fn test_manifest_file_name() {
        let m = Manifest::new("Deployment", "foo-web", &serde_json::json!({})).unwrap();
        assert_eq!(m.file_name(), "deployment-foo-web.yaml");
    }
}
