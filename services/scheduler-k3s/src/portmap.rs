//! Port mappings between the router and app containers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::SchedulerError;

/// Container port used when an app declares none.
pub const DEFAULT_CONTAINER_PORT: i32 = 5000;

/// A `scheme:host:container` port mapping.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PortMap {
    pub scheme: String,
    pub host_port: i32,
    pub container_port: i32,
}

impl PortMap {
    pub fn new(scheme: impl Into<String>, host_port: i32, container_port: i32) -> Self {
        Self {
            scheme: scheme.into(),
            host_port,
            container_port,
        }
    }

    /// Parse the `scheme:host:container` declaration form.
    pub fn parse_declaration(raw: &str) -> Result<Self, SchedulerError> {
        parse_triplet(raw, ':')
    }

    pub fn is_allowed_http(&self) -> bool {
        self.scheme == "http" || self.container_port == 80
    }

    pub fn is_allowed_https(&self) -> bool {
        self.scheme == "https" || self.container_port == 443
    }

    /// Kubernetes protocol for the container port.
    pub fn protocol(&self) -> &'static str {
        if self.scheme == "udp" {
            "UDP"
        } else {
            "TCP"
        }
    }
}

/// Identity form `scheme-host-container`, also used as the port name.
impl fmt::Display for PortMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.scheme, self.host_port, self.container_port)
    }
}

impl FromStr for PortMap {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_triplet(s, '-')
    }
}

fn parse_triplet(raw: &str, separator: char) -> Result<PortMap, SchedulerError> {
    let invalid = || SchedulerError::config(format!("Invalid port mapping: {raw}"));
    let mut parts = raw.trim().split(separator);
    let (Some(scheme), Some(host), Some(container), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(invalid());
    };
    if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_lowercase()) {
        return Err(invalid());
    }
    let host_port = host.parse::<i32>().map_err(|_| invalid())?;
    let container_port = container.parse::<i32>().map_err(|_| invalid())?;
    if !(0..=65535).contains(&host_port) || !(0..=65535).contains(&container_port) {
        return Err(invalid());
    }
    Ok(PortMap::new(scheme, host_port, container_port))
}

/// First non-zero container port, or [`DEFAULT_CONTAINER_PORT`].
pub fn primary_port(port_maps: &[PortMap]) -> i32 {
    port_maps
        .iter()
        .map(|p| p.container_port)
        .find(|&port| port != 0)
        .unwrap_or(DEFAULT_CONTAINER_PORT)
}

/// Keep only maps the router can serve, warning about the rest.
pub fn routable(app: &str, port_maps: &[PortMap]) -> Vec<PortMap> {
    let mut allowed: Vec<PortMap> = port_maps
        .iter()
        .filter(|p| {
            let ok = p.is_allowed_http() || p.is_allowed_https();
            if !ok {
                warn!(app = %app, port_map = %p, "Skipping port mapping that is neither http nor https");
            }
            ok
        })
        .cloned()
        .collect();
    allowed.sort();
    allowed.dedup();
    allowed
}

/// Add the missing half of each http/https pair when TLS is enabled.
///
/// An `http` map gains `https-443-<cp>` and an `https` map gains
/// `http-80-<cp>`, unless a map with that scheme already targets the same
/// container port.
pub fn with_tls_companions(port_maps: &[PortMap]) -> Vec<PortMap> {
    let has = |scheme: &str, container_port: i32| {
        port_maps
            .iter()
            .any(|p| p.scheme == scheme && p.container_port == container_port)
    };

    let mut result = port_maps.to_vec();
    for p in port_maps {
        match p.scheme.as_str() {
            "http" if !has("https", p.container_port) => {
                result.push(PortMap::new("https", 443, p.container_port));
            }
            "https" if !has("http", p.container_port) => {
                result.push(PortMap::new("http", 80, p.container_port));
            }
            _ => {}
        }
    }
    result.sort();
    result.dedup();
    result
}
