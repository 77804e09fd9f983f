//! One-off jobs and the pod template shared with cron jobs.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::Job;
use serde_json::{json, Map, Value};

use super::{
    managed_annotations, managed_labels, typed, ImageSourceType, BUILDER_TYPE_ANNOTATION,
    DEFAULT_CONTAINER_ANNOTATION, DEPLOYMENT_ID_LABEL, JOB_SUFFIX_ANNOTATION,
};
use crate::error::Result;
use crate::resources::ProcessResourceMap;

/// Entrypoint herokuish images use to run arbitrary commands.
pub const HEROKUISH_EXEC: &str = "/exec";

/// Seconds a finished job is kept when it should be removed.
pub const FINISHED_JOB_TTL_SECONDS: i32 = 60;

/// 10 lowercase hex chars from 5 random bytes.
pub fn random_suffix() -> String {
    hex::encode(rand::random::<[u8; 5]>())
}

/// Container and pod settings of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInput {
    pub app: String,
    /// `run` or `cron`; names the container `<app>-<process type>`.
    pub process_type: String,
    pub namespace: String,
    pub deployment_id: i64,
    pub image: String,
    pub image_source_type: ImageSourceType,
    pub image_pull_secrets: Option<String>,
    pub command: Vec<String>,
    /// Inline env vars, set on top of the env secret.
    pub env: BTreeMap<String, String>,
    pub env_secret: Option<String>,
    pub resources: ProcessResourceMap,
    pub suffix: String,
}

impl JobInput {
    pub fn name(&self) -> String {
        format!("{}-{}-{}", self.app, self.process_type, self.suffix)
    }

    fn container_name(&self) -> String {
        format!("{}-{}", self.app, self.process_type)
    }

    pub(crate) fn labels(&self) -> BTreeMap<String, String> {
        managed_labels(&self.app, &self.process_type)
    }

    pub(crate) fn annotations(&self) -> BTreeMap<String, String> {
        let mut annotations = managed_annotations(self.deployment_id);
        annotations.insert(
            BUILDER_TYPE_ANNOTATION.to_string(),
            self.image_source_type.to_string(),
        );
        annotations.insert(JOB_SUFFIX_ANNOTATION.to_string(), self.suffix.clone());
        annotations
    }

    /// Pod template with `restartPolicy: Never`.
    pub(crate) fn pod_template(&self) -> Result<Value> {
        let mut container = Map::new();
        container.insert("name".into(), json!(self.container_name()));
        container.insert("image".into(), json!(self.image));
        container.insert("imagePullPolicy".into(), json!("Always"));
        if self.image_source_type == ImageSourceType::Herokuish {
            container.insert("command".into(), json!([HEROKUISH_EXEC]));
        }
        if !self.command.is_empty() {
            container.insert("args".into(), json!(self.command));
        }
        if let Some(secret) = &self.env_secret {
            container.insert(
                "envFrom".into(),
                json!([{ "secretRef": { "name": secret, "optional": true } }]),
            );
        }
        if !self.env.is_empty() {
            let env: Vec<Value> = self
                .env
                .iter()
                .map(|(k, v)| json!({ "name": k, "value": v }))
                .collect();
            container.insert("env".into(), Value::Array(env));
        }
        container.insert(
            "resources".into(),
            serde_json::to_value(self.resources.to_requirements())?,
        );

        let mut pod_spec = Map::new();
        pod_spec.insert("restartPolicy".into(), json!("Never"));
        pod_spec.insert("containers".into(), json!([Value::Object(container)]));
        if let Some(secret) = self.image_pull_secrets.as_ref().filter(|s| !s.is_empty()) {
            pod_spec.insert("imagePullSecrets".into(), json!([{ "name": secret }]));
        }

        let mut pod_labels = self.labels();
        pod_labels.insert(DEPLOYMENT_ID_LABEL.to_string(), self.deployment_id.to_string());
        let mut pod_annotations = self.annotations();
        pod_annotations.insert(DEFAULT_CONTAINER_ANNOTATION.to_string(), self.container_name());

        Ok(json!({
            "metadata": { "labels": pod_labels, "annotations": pod_annotations },
            "spec": Value::Object(pod_spec),
        }))
    }
}

/// A job that runs once and is never retried.
pub fn job(input: &JobInput, remove: bool) -> Result<Job> {
    let mut spec = Map::new();
    spec.insert("backoffLimit".into(), json!(0));
    spec.insert("template".into(), input.pod_template()?);
    if remove {
        spec.insert("ttlSecondsAfterFinished".into(), json!(FINISHED_JOB_TTL_SECONDS));
    }

    typed(json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {
            "name": input.name(),
            "namespace": input.namespace,
            "labels": input.labels(),
            "annotations": input.annotations(),
        },
        "spec": Value::Object(spec),
    }))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn run_input(kind: ImageSourceType) -> JobInput {
        JobInput {
            app: "foo".into(),
            process_type: "run".into(),
            namespace: "default".into(),
            deployment_id: 7,
            image: "foo:latest".into(),
            image_source_type: kind,
            image_pull_secrets: None,
            command: vec!["rake".into(), "db:migrate".into()],
            env: BTreeMap::from([("DEBUG".into(), "1".into())]),
            env_secret: Some("env-foo-web.7".into()),
            resources: ProcessResourceMap::default(),
            suffix: "0a1b2c3d4e".into(),
        }
    }

    #[test]
    fn test_random_suffix() {
        let suffix = random_suffix();
        assert_eq!(suffix.len(), 10);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_herokuish_job() {
        let job = job(&run_input(ImageSourceType::Herokuish), true).unwrap();
        assert_eq!(job.metadata.name.as_deref(), Some("foo-run-0a1b2c3d4e"));

        let spec = job.spec.unwrap();
        assert_eq!(spec.backoff_limit, Some(0));
        assert_eq!(spec.ttl_seconds_after_finished, Some(60));

        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("Never"));
        let container = &pod.containers[0];
        assert_eq!(container.command.as_ref().unwrap(), &vec!["/exec".to_string()]);
        assert_eq!(container.args.as_ref().unwrap()[0], "rake");
        assert_eq!(container.env.as_ref().unwrap()[0].name, "DEBUG");
    }

    #[test]
    fn test_dockerfile_job_keeps_entrypoint() {
        let job = job(&run_input(ImageSourceType::Dockerfile), false).unwrap();
        let spec = job.spec.unwrap();
        assert!(spec.ttl_seconds_after_finished.is_none());
        assert!(spec.template.spec.unwrap().containers[0].command.is_none());
    }
}
