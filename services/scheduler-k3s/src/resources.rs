//! Resource limits and requests for process workloads.
//!
//! Values come from the `resource` property domain, keyed
//! `<process>.<limit|reserve>.<resource>`. A process without its own value
//! falls back to the `_default_` process, then to the built-in default.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity as KubeQuantity;
use plfm_properties::PropertyStore;
use serde::Serialize;

use crate::error::{Result, SchedulerError};
use crate::quantity::Quantity;

/// Property domain holding resource settings.
pub const RESOURCE_DOMAIN: &str = "resource";

/// Process name used for app-wide resource defaults.
pub const DEFAULT_PROCESS: &str = "_default_";

/// A resource kind that can be limited or reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Cpu,
    Memory,
    NvidiaGpu,
}

impl ResourceKind {
    /// Property key segment.
    pub fn property_name(&self) -> &'static str {
        match self {
            ResourceKind::Cpu => "cpu",
            ResourceKind::Memory => "memory",
            ResourceKind::NvidiaGpu => "nvidia-gpu",
        }
    }

    /// Name on the Kubernetes resource list.
    pub fn kube_name(&self) -> &'static str {
        match self {
            ResourceKind::Cpu => "cpu",
            ResourceKind::Memory => "memory",
            ResourceKind::NvidiaGpu => "nvidia.com/gpu",
        }
    }
}

/// Limit or reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourcePhase {
    Limit,
    Reserve,
}

impl ResourcePhase {
    fn property_name(&self) -> &'static str {
        match self {
            ResourcePhase::Limit => "limit",
            ResourcePhase::Reserve => "reserve",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            ResourcePhase::Limit => "limit",
            ResourcePhase::Reserve => "request",
        }
    }

    fn kinds(&self) -> &'static [ResourceKind] {
        match self {
            ResourcePhase::Limit => &[ResourceKind::Cpu, ResourceKind::Memory, ResourceKind::NvidiaGpu],
            ResourcePhase::Reserve => &[ResourceKind::Cpu, ResourceKind::Memory],
        }
    }

    fn default_for(&self, kind: ResourceKind) -> Option<&'static str> {
        match kind {
            ResourceKind::Cpu => Some("1000m"),
            ResourceKind::Memory => Some("512Mi"),
            ResourceKind::NvidiaGpu => None,
        }
    }
}

/// Resolved values for one phase, keyed by Kubernetes resource name.
pub type ResourceValues = BTreeMap<String, String>;

/// Limits and requests for one process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessResourceMap {
    pub limits: ResourceValues,
    pub requests: ResourceValues,
}

impl ProcessResourceMap {
    /// Convert to the pod spec representation.
    pub fn to_requirements(&self) -> ResourceRequirements {
        let convert = |values: &ResourceValues| {
            Some(values)
                .filter(|v| !v.is_empty())
                .map(|v| {
                    v.iter()
                        .map(|(k, q)| (k.clone(), KubeQuantity(q.clone())))
                        .collect::<BTreeMap<_, _>>()
                })
        };
        ResourceRequirements {
            limits: convert(&self.limits),
            requests: convert(&self.requests),
            ..Default::default()
        }
    }
}

/// Reads resource properties for processes.
#[derive(Clone)]
pub struct ResourceResolver {
    store: Arc<dyn PropertyStore>,
}

impl ResourceResolver {
    pub fn new(store: Arc<dyn PropertyStore>) -> Self {
        Self { store }
    }

    /// Resolve limits and requests for `process_type` of `app`.
    pub async fn resolve(&self, app: &str, process_type: &str) -> Result<ProcessResourceMap> {
        Ok(ProcessResourceMap {
            limits: self.resolve_phase(app, process_type, ResourcePhase::Limit).await?,
            requests: self
                .resolve_phase(app, process_type, ResourcePhase::Reserve)
                .await?,
        })
    }

    async fn resolve_phase(
        &self,
        app: &str,
        process_type: &str,
        phase: ResourcePhase,
    ) -> Result<ResourceValues> {
        let mut values = ResourceValues::new();
        for &kind in phase.kinds() {
            let configured = match self.lookup(app, process_type, phase, kind).await? {
                Some(value) => Some(value),
                None => self.lookup(app, DEFAULT_PROCESS, phase, kind).await?,
            };
            let Some(value) = configured.or_else(|| phase.default_for(kind).map(str::to_string))
            else {
                continue;
            };
            values.insert(kind.kube_name().to_string(), value);
        }
        Ok(values)
    }

    /// A configured, non-zero, valid value, or `None` when unset.
    async fn lookup(
        &self,
        app: &str,
        process_type: &str,
        phase: ResourcePhase,
        kind: ResourceKind,
    ) -> Result<Option<String>> {
        let key = format!(
            "{process_type}.{}.{}",
            phase.property_name(),
            kind.property_name()
        );
        let Some(raw) = self
            .store
            .get(RESOURCE_DOMAIN, app, &key)
            .await?
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
        else {
            return Ok(None);
        };

        let value = if kind == ResourceKind::Memory && raw.chars().all(|c| c.is_ascii_digit()) {
            format!("{raw}Mi")
        } else {
            raw
        };

        let parse_error = |reason: String| {
            SchedulerError::config(format!(
                "Error parsing {} {}: {reason}",
                kind.property_name(),
                phase.label()
            ))
        };
        let quantity = Quantity::parse(&value).map_err(|e| parse_error(e.to_string()))?;
        if quantity.is_negative() {
            return Err(parse_error(format!("quantity must not be negative: {value}")));
        }
        if quantity.is_zero() {
            return Ok(None);
        }
        Ok(Some(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plfm_properties::MemoryPropertyStore;

    fn resolver(store: MemoryPropertyStore) -> ResourceResolver {
        ResourceResolver::new(Arc::new(store))
    }

    #[tokio::test]
    async fn test_defaults() {
        let map = resolver(MemoryPropertyStore::new())
            .resolve("foo", "web")
            .await
            .unwrap();

        assert_eq!(map.limits.get("cpu").map(String::as_str), Some("1000m"));
        assert_eq!(map.limits.get("memory").map(String::as_str), Some("512Mi"));
        assert!(!map.limits.contains_key("nvidia.com/gpu"));
        assert_eq!(map.requests.get("cpu").map(String::as_str), Some("1000m"));
        assert_eq!(map.requests.get("memory").map(String::as_str), Some("512Mi"));
    }

    #[tokio::test]
    async fn test_process_value_wins_over_app_default() {
        let store = MemoryPropertyStore::new()
            .with(RESOURCE_DOMAIN, "foo", "_default_.limit.cpu", "2")
            .with(RESOURCE_DOMAIN, "foo", "web.limit.cpu", "500m")
            .with(RESOURCE_DOMAIN, "foo", "_default_.reserve.memory", "256")
            .with(RESOURCE_DOMAIN, "foo", "web.limit.nvidia-gpu", "1");
        let r = resolver(store);

        let web = r.resolve("foo", "web").await.unwrap();
        assert_eq!(web.limits["cpu"], "500m");
        assert_eq!(web.limits["nvidia.com/gpu"], "1");
        assert_eq!(web.requests["memory"], "256Mi");

        let worker = r.resolve("foo", "worker").await.unwrap();
        assert_eq!(worker.limits["cpu"], "2");
        assert!(!worker.limits.contains_key("nvidia.com/gpu"));
    }

    #[tokio::test]
    async fn test_zero_counts_as_unset() {
        let store = MemoryPropertyStore::new()
            .with(RESOURCE_DOMAIN, "foo", "web.limit.memory", "0")
            .with(RESOURCE_DOMAIN, "foo", "_default_.limit.memory", "1Gi");
        let map = resolver(store).resolve("foo", "web").await.unwrap();
        assert_eq!(map.limits["memory"], "1Gi");
    }

    #[tokio::test]
    async fn test_invalid_value_names_resource() {
        let store = MemoryPropertyStore::new().with(RESOURCE_DOMAIN, "foo", "web.reserve.cpu", "lots");
        let err = resolver(store).resolve("foo", "web").await.unwrap_err();

        assert!(matches!(err, SchedulerError::Configuration(_)));
        assert!(err.to_string().starts_with("Error parsing cpu request:"));
    }

    #[test]
    fn test_to_requirements() {
        let mut map = ProcessResourceMap::default();
        map.limits.insert("cpu".into(), "1000m".into());
        let req = map.to_requirements();

        assert_eq!(
            req.limits.unwrap().get("cpu"),
            Some(&KubeQuantity("1000m".into()))
        );
        assert!(req.requests.is_none());
    }
}
