//! Env and TLS secrets.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{managed_annotations, managed_labels, typed, CERT_CHECKSUM_LABEL, MANAGED_LABEL};
use crate::error::Result;

/// `env-<app>-<process type>.<deployment id>`.
pub fn env_secret_name(app: &str, process_type: &str, deployment_id: i64) -> String {
    format!("env-{app}-{process_type}.{deployment_id}")
}

/// `tls-<app>`, shared by the secret and its release.
pub fn tls_secret_name(app: &str) -> String {
    format!("tls-{app}")
}

/// Opaque secret holding the app environment for one revision.
pub fn env_secret(
    app: &str,
    process_type: &str,
    namespace: &str,
    deployment_id: i64,
    env: &BTreeMap<String, String>,
) -> Secret {
    Secret {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: Some(env_secret_name(app, process_type, deployment_id)),
            namespace: Some(namespace.to_string()),
            labels: Some(managed_labels(app, process_type)),
            annotations: Some(managed_annotations(deployment_id)),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(
            env.iter()
                .map(|(k, v)| (k.clone(), ByteString(v.as_bytes().to_vec())))
                .collect(),
        ),
        ..Secret::default()
    }
}

/// Values of a `tls-<app>` release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsSecretValues {
    pub app: String,
    pub namespace: String,
    pub checksum: String,
    /// Base64 certificate chain.
    pub crt: String,
    /// Base64 private key.
    pub key: String,
}

impl TlsSecretValues {
    pub fn new(app: &str, namespace: &str, checksum: &str, crt: &str, key: &str) -> Self {
        Self {
            app: app.to_string(),
            namespace: namespace.to_string(),
            checksum: checksum.to_string(),
            crt: STANDARD.encode(crt),
            key: STANDARD.encode(key),
        }
    }
}

/// `kubernetes.io/tls` secret labelled with the material's checksum.
pub fn tls_secret(values: &TlsSecretValues) -> Result<Secret> {
    typed(json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "type": "kubernetes.io/tls",
        "metadata": {
            "name": tls_secret_name(&values.app),
            "namespace": values.namespace,
            "labels": {
                MANAGED_LABEL: "true",
                CERT_CHECKSUM_LABEL: values.checksum,
                "app.kubernetes.io/part-of": values.app,
                "plfm.dev/app-name": values.app,
            },
            "annotations": { MANAGED_LABEL: "true" },
        },
        "data": {
            "tls.crt": values.crt,
            "tls.key": values.key,
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_secret() {
        let env = BTreeMap::from([("DATABASE_URL".to_string(), "postgres://db".to_string())]);
        let secret = env_secret("foo", "web", "apps", 42, &env);
        assert_eq!(secret.metadata.name.as_deref(), Some("env-foo-web.42"));
        assert_eq!(secret.type_.as_deref(), Some("Opaque"));
        assert_eq!(secret.data.unwrap()["DATABASE_URL"].0, b"postgres://db".to_vec());
    }

    #[test]
    fn test_env_secret_yaml_is_base64() {
        let env = BTreeMap::from([("A".to_string(), "b".to_string())]);
        let yaml = serde_yaml::to_string(&env_secret("foo", "web", "default", 1, &env)).unwrap();
        assert!(yaml.contains("A: Yg=="));
        assert!(yaml.contains("kind: Secret"));
    }

    #[test]
    fn test_tls_secret() {
        let values = TlsSecretValues::new("foo", "default", "abc123", "CRT", "KEY");
        let secret = tls_secret(&values).unwrap();
        assert_eq!(secret.metadata.name.as_deref(), Some("tls-foo"));
        assert_eq!(secret.metadata.labels.unwrap()[CERT_CHECKSUM_LABEL], "abc123");
        let data = secret.data.unwrap();
        assert_eq!(data["tls.crt"].0, b"CRT".to_vec());
        assert_eq!(data["tls.key"].0, b"KEY".to_vec());
    }
}
