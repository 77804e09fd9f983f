//! Process deployments and the web service.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use serde_json::{json, Map, Value};

use super::{
    managed_annotations, managed_labels, probes, selector_labels, typed, ProcessSpec,
    BUILDER_TYPE_ANNOTATION, DEFAULT_CONTAINER_ANNOTATION, DEPLOYMENT_ID_LABEL,
};
use crate::error::Result;
use crate::portmap::primary_port;

/// Revisions kept for rollbacks.
pub const REVISION_HISTORY_LIMIT: i32 = 5;

/// The process deployment `<app>-<process type>`.
pub fn deployment(spec: &ProcessSpec) -> Result<Deployment> {
    let name = spec.name();
    let port = primary_port(&spec.port_maps);

    let labels = managed_labels(&spec.app, &spec.process_type);
    let mut annotations = managed_annotations(spec.deployment_id);
    annotations.insert(
        BUILDER_TYPE_ANNOTATION.to_string(),
        spec.image_source_type.to_string(),
    );

    let mut pod_labels = labels.clone();
    pod_labels.insert(DEPLOYMENT_ID_LABEL.to_string(), spec.deployment_id.to_string());
    let mut pod_annotations = annotations.clone();
    pod_annotations.insert(DEFAULT_CONTAINER_ANNOTATION.to_string(), name.clone());

    let mut container = Map::new();
    container.insert("name".into(), json!(name));
    container.insert("image".into(), json!(spec.image));
    container.insert("imagePullPolicy".into(), json!("Always"));
    container.insert(
        "envFrom".into(),
        json!([{ "secretRef": { "name": spec.env_secret_name(), "optional": true } }]),
    );
    container.insert("resources".into(), serde_json::to_value(spec.resources.to_requirements())?);
    if !spec.command.is_empty() {
        container.insert("args".into(), json!(spec.command));
    }
    if let Some(dir) = spec.working_dir.as_ref().filter(|d| !d.is_empty()) {
        container.insert("workingDir".into(), json!(dir));
    }

    let probes = probes::build(&spec.healthchecks, port)?;
    for (field, probe) in [
        ("startupProbe", &probes.startup),
        ("readinessProbe", &probes.readiness),
        ("livenessProbe", &probes.liveness),
    ] {
        if let Some(probe) = probe {
            container.insert(field.into(), serde_json::to_value(probe)?);
        }
    }

    if spec.is_web() {
        let ports: Vec<Value> = spec
            .port_maps
            .iter()
            .map(|p| {
                json!({
                    "name": p.to_string(),
                    "containerPort": p.container_port,
                    "protocol": p.protocol(),
                })
            })
            .collect();
        if !ports.is_empty() {
            container.insert("ports".into(), Value::Array(ports));
        }
        container.insert("env".into(), json!([{ "name": "PORT", "value": port.to_string() }]));
    }

    let mut pod_spec = Map::new();
    pod_spec.insert("containers".into(), json!([Value::Object(container)]));
    if let Some(secret) = spec.image_pull_secrets.as_ref().filter(|s| !s.is_empty()) {
        pod_spec.insert("imagePullSecrets".into(), json!([{ "name": secret }]));
    }

    let mut deployment_spec = Map::new();
    deployment_spec.insert("replicas".into(), json!(spec.replicas));
    deployment_spec.insert("revisionHistoryLimit".into(), json!(REVISION_HISTORY_LIMIT));
    deployment_spec.insert(
        "selector".into(),
        json!({ "matchLabels": selector_labels(&spec.app, &spec.process_type) }),
    );
    deployment_spec.insert(
        "template".into(),
        json!({
            "metadata": { "labels": pod_labels, "annotations": pod_annotations },
            "spec": Value::Object(pod_spec),
        }),
    );
    if let Some(seconds) = probes.min_ready_seconds {
        deployment_spec.insert("minReadySeconds".into(), json!(seconds));
    }

    typed(json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": name,
            "namespace": spec.namespace,
            "labels": labels,
            "annotations": annotations,
        },
        "spec": Value::Object(deployment_spec),
    }))
}

/// The `<app>-web` service. Only web processes get one.
pub fn service(spec: &ProcessSpec) -> Result<Option<Service>> {
    if !spec.is_web() || spec.port_maps.is_empty() {
        return Ok(None);
    }

    let name = format!("{}-web", spec.app);
    let ports: Vec<Value> = spec
        .port_maps
        .iter()
        .map(|p| {
            json!({
                "name": p.to_string(),
                "port": p.host_port,
                "targetPort": p.to_string(),
                "protocol": p.protocol(),
            })
        })
        .collect();

    typed(json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": name,
            "namespace": spec.namespace,
            "labels": managed_labels(&spec.app, &spec.process_type),
            "annotations": managed_annotations(spec.deployment_id),
        },
        "spec": {
            "type": "ClusterIP",
            "selector": selector_labels(&spec.app, &spec.process_type),
            "ports": ports,
        },
    }))
    .map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{ImageSourceType, APP_NAME_LABEL};
    use crate::portmap::PortMap;
    use crate::resources::ProcessResourceMap;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

    fn web_spec() -> ProcessSpec {
        let mut resources = ProcessResourceMap::default();
        resources.limits.insert("cpu".into(), "1000m".into());
        resources.limits.insert("memory".into(), "512Mi".into());
        resources.requests.insert("cpu".into(), "1000m".into());
        resources.requests.insert("memory".into(), "512Mi".into());
        ProcessSpec {
            app: "foo".into(),
            process_type: "web".into(),
            namespace: "default".into(),
            deployment_id: 1_700_000_000,
            image: "registry.local/foo:1".into(),
            image_source_type: ImageSourceType::Dockerfile,
            command: vec![],
            image_pull_secrets: Some("regcred".into()),
            replicas: 2,
            port_maps: vec![PortMap::new("http", 80, 5000)],
            resources,
            healthchecks: vec![],
            working_dir: None,
        }
    }

    #[test]
    fn test_web_deployment() {
        let deployment = deployment(&web_spec()).unwrap();
        assert_eq!(deployment.metadata.name.as_deref(), Some("foo-web"));
        assert_eq!(deployment.metadata.labels.as_ref().unwrap()[APP_NAME_LABEL], "foo");

        let spec = deployment.spec.unwrap();
        assert_eq!(spec.replicas, Some(2));
        assert_eq!(spec.revision_history_limit, Some(5));

        let template = spec.template;
        let pod_labels = template.metadata.unwrap().labels.unwrap();
        assert_eq!(pod_labels[DEPLOYMENT_ID_LABEL], "1700000000");

        let pod = template.spec.unwrap();
        assert_eq!(pod.image_pull_secrets.unwrap().len(), 1);
        let container = &pod.containers[0];
        assert_eq!(container.name, "foo-web");
        assert_eq!(container.image_pull_policy.as_deref(), Some("Always"));
        assert!(container.args.is_none());

        let port = &container.ports.as_ref().unwrap()[0];
        assert_eq!(port.container_port, 5000);
        assert_eq!(port.name.as_deref(), Some("http-80-5000"));
        assert_eq!(port.protocol.as_deref(), Some("TCP"));

        let env = container.env.as_ref().unwrap();
        assert_eq!(env[0].name, "PORT");
        assert_eq!(env[0].value.as_deref(), Some("5000"));

        let resources = container.resources.as_ref().unwrap();
        assert_eq!(
            resources.limits.as_ref().unwrap()["memory"],
            Quantity("512Mi".into())
        );
        assert_eq!(
            resources.requests.as_ref().unwrap()["cpu"],
            Quantity("1000m".into())
        );

        let env_from = container.env_from.as_ref().unwrap();
        let secret_ref = env_from[0].secret_ref.as_ref().unwrap();
        assert_eq!(secret_ref.optional, Some(true));
    }

    #[test]
    fn test_worker_has_no_ports_or_service() {
        let spec = ProcessSpec {
            process_type: "worker".into(),
            command: vec!["celery".into(), "worker".into()],
            ..web_spec()
        };
        let deployment = deployment(&spec).unwrap();
        let container = &deployment.spec.unwrap().template.spec.unwrap().containers[0];
        assert!(container.ports.is_none());
        assert!(container.env.is_none());
        assert_eq!(container.args.as_ref().unwrap(), &vec!["celery".to_string(), "worker".into()]);
        assert!(service(&spec).unwrap().is_none());
    }

    #[test]
    fn test_web_service() {
        let service = service(&web_spec()).unwrap().unwrap();
        assert_eq!(service.metadata.name.as_deref(), Some("foo-web"));
        let port = &service.spec.unwrap().ports.unwrap()[0];
        assert_eq!(port.port, 80);
        assert_eq!(port.target_port, Some(IntOrString::String("http-80-5000".into())));
    }
}
