//! Scheduled jobs.

use k8s_openapi::api::batch::v1::CronJob;
use serde_json::json;

use super::job::JobInput;
use super::{typed, CRON_ID_ANNOTATION};
use crate::error::Result;

/// A cron job running `input`'s command on `schedule`.
///
/// `input.suffix` should be reused from an existing cron job with the same
/// `cron_id` so the object is updated rather than replaced.
pub fn cron_job(input: &JobInput, cron_id: &str, schedule: &str) -> Result<CronJob> {
    let mut annotations = input.annotations();
    annotations.insert(CRON_ID_ANNOTATION.to_string(), cron_id.to_string());

    typed(json!({
        "apiVersion": "batch/v1",
        "kind": "CronJob",
        "metadata": {
            "name": input.name(),
            "namespace": input.namespace,
            "labels": input.labels(),
            "annotations": annotations,
        },
        "spec": {
            "schedule": schedule,
            "concurrencyPolicy": "Forbid",
            "successfulJobsHistoryLimit": 1,
            "failedJobsHistoryLimit": 1,
            "jobTemplate": {
                "metadata": { "labels": input.labels(), "annotations": annotations },
                "spec": {
                    "backoffLimit": 0,
                    "template": input.pod_template()?,
                },
            },
        },
    }))
}
