//! Ingress routes, certificates and cluster issuers.
//!
//! Traefik and cert-manager objects are custom resources without
//! k8s-openapi types, so they get small serde structs here.

use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::secret::tls_secret_name;
use super::{managed_annotations, managed_labels, typed, Manifest};
use crate::error::Result;
use crate::portmap::{routable, with_tls_companions, PortMap};
use crate::properties::{IngressClass, LetsencryptServer};

/// Namespace the cluster issuer release lives in.
pub const CERT_MANAGER_NAMESPACE: &str = "cert-manager";

/// Where an app's TLS material comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsSource {
    None,
    /// An imported certificate synced into `tls-<app>`.
    Imported,
    /// cert-manager issues `tls-<app>-web`.
    Letsencrypt(LetsencryptServer),
}

impl TlsSource {
    pub fn enabled(&self) -> bool {
        !matches!(self, TlsSource::None)
    }

    /// Secret holding the certificate, if any.
    pub fn secret_name(&self, app: &str) -> Option<String> {
        match self {
            TlsSource::None => None,
            TlsSource::Imported => Some(tls_secret_name(app)),
            TlsSource::Letsencrypt(_) => Some(format!("tls-{app}-web")),
        }
    }
}

/// Routing inputs for one app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressInput {
    pub app: String,
    pub namespace: String,
    pub deployment_id: i64,
    pub domains: Vec<String>,
    pub port_maps: Vec<PortMap>,
    pub class: IngressClass,
    pub tls: TlsSource,
}

impl IngressInput {
    fn service_name(&self) -> String {
        format!("{}-web", self.app)
    }

    fn metadata(&self, name: String) -> ObjectMeta {
        ObjectMeta {
            name: Some(name),
            namespace: Some(self.namespace.clone()),
            labels: Some(managed_labels(&self.app, "web")),
            annotations: Some(managed_annotations(self.deployment_id)),
            ..ObjectMeta::default()
        }
    }

    /// Port maps that get a route, including synthesized TLS companions.
    pub fn routed_port_maps(&self) -> Vec<PortMap> {
        let maps = routable(&self.app, &self.port_maps);
        if self.tls.enabled() {
            with_tls_companions(&maps)
        } else {
            maps
        }
    }
}

fn is_secure(port_map: &PortMap) -> bool {
    port_map.scheme == "https" || (port_map.scheme != "http" && port_map.is_allowed_https())
}

// =============================================================================
// Traefik
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressRoute {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: IngressRouteSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressRouteSpec {
    pub entry_points: Vec<String>,
    pub routes: Vec<Route>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<RouteTls>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub kind: String,
    #[serde(rename = "match")]
    pub rule: String,
    pub services: Vec<RouteService>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteService {
    pub name: String,
    pub port: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteTls {
    pub secret_name: String,
}

fn host_rule(domains: &[String]) -> String {
    domains
        .iter()
        .map(|d| format!("Host(`{d}`)"))
        .collect::<Vec<_>>()
        .join(" || ")
}

pub fn ingress_route(input: &IngressInput, port_map: &PortMap) -> IngressRoute {
    let secure = is_secure(port_map);
    let entry_point = if secure { "websecure" } else { "web" };
    let tls = if secure {
        input.tls.secret_name(&input.app).map(|secret_name| RouteTls { secret_name })
    } else {
        None
    };

    IngressRoute {
        api_version: "traefik.io/v1alpha1".to_string(),
        kind: "IngressRoute".to_string(),
        metadata: input.metadata(format!("{}-{}", input.service_name(), port_map)),
        spec: IngressRouteSpec {
            entry_points: vec![entry_point.to_string()],
            routes: vec![Route {
                kind: "Rule".to_string(),
                rule: host_rule(&input.domains),
                services: vec![RouteService {
                    name: input.service_name(),
                    port: port_map.to_string(),
                }],
            }],
            tls,
        },
    }
}

// =============================================================================
// nginx
// =============================================================================

pub fn nginx_ingress(input: &IngressInput, port_map: &PortMap) -> Result<Ingress> {
    let rules: Vec<_> = input
        .domains
        .iter()
        .map(|domain| {
            json!({
                "host": domain,
                "http": { "paths": [{
                    "path": "/",
                    "pathType": "Prefix",
                    "backend": { "service": {
                        "name": input.service_name(),
                        "port": { "name": port_map.to_string() },
                    }},
                }]},
            })
        })
        .collect();

    let mut spec = json!({ "ingressClassName": "nginx", "rules": rules });
    if is_secure(port_map) {
        if let Some(secret) = input.tls.secret_name(&input.app) {
            spec["tls"] = json!([{ "hosts": input.domains, "secretName": secret }]);
        }
    }

    typed(json!({
        "apiVersion": "networking.k8s.io/v1",
        "kind": "Ingress",
        "metadata": input.metadata(format!("{}-{}", input.service_name(), port_map)),
        "spec": spec,
    }))
}

// =============================================================================
// cert-manager
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Certificate {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: CertificateSpec,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSpec {
    pub secret_name: String,
    pub dns_names: Vec<String>,
    pub issuer_ref: IssuerRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuerRef {
    pub name: String,
    pub kind: String,
}

pub fn certificate(input: &IngressInput, server: LetsencryptServer) -> Certificate {
    Certificate {
        api_version: "cert-manager.io/v1".to_string(),
        kind: "Certificate".to_string(),
        metadata: input.metadata(input.service_name()),
        spec: CertificateSpec {
            secret_name: format!("tls-{}", input.service_name()),
            dns_names: input.domains.clone(),
            issuer_ref: IssuerRef {
                name: server.issuer_name().to_string(),
                kind: "ClusterIssuer".to_string(),
            },
        },
    }
}

/// An ACME cluster issuer answering HTTP-01 challenges through `class`.
pub fn cluster_issuer(server: LetsencryptServer, email: &str, class: IngressClass) -> serde_json::Value {
    json!({
        "apiVersion": "cert-manager.io/v1",
        "kind": "ClusterIssuer",
        "metadata": {
            "name": server.issuer_name(),
            "labels": { super::MANAGED_LABEL: "true" },
        },
        "spec": { "acme": {
            "email": email,
            "server": server.acme_url(),
            "privateKeySecretRef": { "name": server.issuer_name() },
            "solvers": [{ "http01": { "ingress": { "ingressClassName": class.as_str() } } }],
        }},
    })
}

/// Every routing object for an app. Empty when there is nothing to route.
pub fn manifests(input: &IngressInput) -> Result<Vec<Manifest>> {
    if input.domains.is_empty() {
        return Ok(Vec::new());
    }

    let mut input = input.clone();
    input.domains.sort();
    input.domains.dedup();

    let mut manifests = Vec::new();
    for port_map in input.routed_port_maps() {
        let name = format!("{}-{}", input.service_name(), port_map);
        match input.class {
            IngressClass::Traefik => {
                manifests.push(Manifest::new("IngressRoute", &name, &ingress_route(&input, &port_map))?);
            }
            IngressClass::Nginx => {
                manifests.push(Manifest::new("Ingress", &name, &nginx_ingress(&input, &port_map)?)?);
            }
        }
    }

    if let TlsSource::Letsencrypt(server) = input.tls {
        manifests.push(Manifest::new(
            "Certificate",
            &input.service_name(),
            &certificate(&input, server),
        )?);
    }
    Ok(manifests)
}
