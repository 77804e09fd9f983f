//! Health checks to container probes.

use k8s_openapi::api::core::v1::Probe;
use serde_json::{json, Map, Value};
use tracing::warn;

use super::typed;
use crate::appjson::{Healthcheck, HealthcheckType};
use crate::error::Result;

/// Probes for one container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Probes {
    pub startup: Option<Probe>,
    pub readiness: Option<Probe>,
    pub liveness: Option<Probe>,
    pub min_ready_seconds: Option<i32>,
}

impl Probes {
    fn slot(&mut self, kind: HealthcheckType) -> &mut Option<Probe> {
        match kind {
            HealthcheckType::Startup => &mut self.startup,
            HealthcheckType::Readiness => &mut self.readiness,
            HealthcheckType::Liveness => &mut self.liveness,
        }
    }
}

/// Map health checks onto probes. Only the first check of each kind is used.
pub fn build(checks: &[Healthcheck], primary_port: i32) -> Result<Probes> {
    let mut probes = Probes::default();
    let mut uptime_seen = false;

    for check in checks {
        if let Some(uptime) = check.uptime.filter(|&u| u > 0) {
            if check.command.is_empty() && !check.listening && check.path.is_none() {
                if uptime_seen {
                    warn!("Multiple uptime checks are not supported, only the first one will be used");
                } else {
                    probes.min_ready_seconds = Some(uptime);
                    uptime_seen = true;
                }
                continue;
            }
        }

        let Some(handler) = handler(check, primary_port) else {
            continue;
        };

        let slot = probes.slot(check.kind);
        if slot.is_some() {
            warn!(
                "Multiple {} checks are not supported, only the first one will be used",
                check.kind.as_str()
            );
            continue;
        }
        *slot = Some(probe(check, handler)?);
    }

    Ok(probes)
}

fn handler(check: &Healthcheck, primary_port: i32) -> Option<(&'static str, Value)> {
    if !check.command.is_empty() {
        return Some(("exec", json!({ "command": check.command })));
    }

    if check.listening {
        let mut tcp = Map::new();
        tcp.insert("port".into(), json!(primary_port));
        if let Some(host) = check.http_headers.iter().find(|h| h.name == "Host") {
            tcp.insert("host".into(), json!(host.value));
        }
        return Some(("tcpSocket", Value::Object(tcp)));
    }

    let path = check.path.as_ref().filter(|p| !p.is_empty())?;
    let mut http = Map::new();
    http.insert("path".into(), json!(path));
    http.insert("port".into(), json!(primary_port));
    if let Some(scheme) = check.scheme.as_ref().filter(|s| !s.is_empty()) {
        http.insert("scheme".into(), json!(scheme.to_uppercase()));
    }
    let headers: Vec<Value> = check
        .http_headers
        .iter()
        .map(|h| json!({ "name": h.name, "value": h.value }))
        .collect();
    if !headers.is_empty() {
        http.insert("httpHeaders".into(), Value::Array(headers));
    }
    Some(("httpGet", Value::Object(http)))
}

fn probe(check: &Healthcheck, (kind, body): (&'static str, Value)) -> Result<Probe> {
    let mut probe = Map::new();
    probe.insert(kind.into(), body);
    probe.insert("successThreshold".into(), json!(1));
    let fields = [
        ("initialDelaySeconds", check.initial_delay),
        ("periodSeconds", check.wait),
        ("timeoutSeconds", check.timeout),
        ("failureThreshold", check.attempts),
    ];
    for (name, value) in fields {
        if let Some(value) = value {
            probe.insert(name.into(), json!(value));
        }
    }
    typed(Value::Object(probe))
}
