//! Cron aggregation.
//!
//! Every app scheduled on k3s declares its cron commands in `app.json`. Each
//! command gets a stable id derived from the app, command and schedule, which
//! the cron job carries as an annotation.

use std::sync::Arc;

use croner::Cron;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::debug;

use crate::error::{Result, SchedulerError};
use crate::properties::Properties;
use crate::providers::CronProvider;

/// One scheduled command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CronEntry {
    pub id: String,
    pub app: String,
    pub command: String,
    pub schedule: String,
}

const BASE36_ALPHABET: &str = "0123456789abcdefghijklmnopqrstuvwxyz";

/// Nicknames accepted in place of a five-field expression.
pub const SCHEDULE_DESCRIPTORS: &[&str] = &[
    "@yearly",
    "@annually",
    "@monthly",
    "@weekly",
    "@daily",
    "@midnight",
    "@hourly",
];

/// Lowercase base36 of `bytes` read as a big-endian integer. Each leading
/// zero byte becomes a leading `0`.
fn base36(bytes: &[u8]) -> String {
    base_x::encode(BASE36_ALPHABET, bytes)
}

/// Stable id of a cron command.
pub fn cron_id(app: &str, command: &str, schedule: &str) -> String {
    base36(format!("{app}==={command}==={schedule}").as_bytes())
}

/// Accept five-field expressions with in-range values and the nicknames in
/// [`SCHEDULE_DESCRIPTORS`].
pub fn validate_schedule(schedule: &str) -> Result<()> {
    let schedule = schedule.trim();
    if schedule.starts_with('@') {
        if SCHEDULE_DESCRIPTORS.contains(&schedule) {
            return Ok(());
        }
        return Err(SchedulerError::config(format!(
            "unknown schedule descriptor: {schedule}"
        )));
    }

    let fields = schedule.split_whitespace().count();
    if fields != 5 {
        return Err(SchedulerError::config(format!(
            "expected exactly 5 fields, found {fields}: {schedule}"
        )));
    }
    Cron::new(schedule)
        .parse()
        .map_err(|e| SchedulerError::config(format!("invalid schedule {schedule:?}: {e}")))?;
    Ok(())
}

/// Validated cron entries of one app.
pub async fn app_cron_entries(provider: &dyn CronProvider, app: &str) -> Result<Vec<CronEntry>> {
    let mut entries = Vec::new();
    for command in provider.commands(app).await? {
        validate_schedule(&command.schedule)?;
        entries.push(CronEntry {
            id: cron_id(app, &command.command, &command.schedule),
            app: app.to_string(),
            command: command.command,
            schedule: command.schedule,
        });
    }
    Ok(entries)
}

/// Cron entries of every k3s app, sorted by id.
///
/// Apps are read concurrently. The first failure aborts the remaining reads
/// and is returned.
pub async fn collect_cron_entries(
    properties: &Properties,
    provider: Arc<dyn CronProvider>,
    apps: &[String],
) -> Result<Vec<CronEntry>> {
    let mut set = JoinSet::new();
    for app in apps {
        let app = app.clone();
        let properties = properties.clone();
        let provider = provider.clone();
        set.spawn(async move {
            if !properties.uses_k3s(&app).await? {
                return Ok(Vec::new());
            }
            app_cron_entries(provider.as_ref(), &app).await
        });
    }

    let mut entries = Vec::new();
    while let Some(joined) = set.join_next().await {
        let result = joined
            .map_err(|e| SchedulerError::Provider(format!("cron task failed: {e}")))
            .and_then(|r| r);
        match result {
            Ok(app_entries) => entries.extend(app_entries),
            Err(err) => {
                set.abort_all();
                return Err(err);
            }
        }
    }

    entries.sort_by(|a, b| a.id.cmp(&b.id));
    debug!(count = entries.len(), "Collected cron entries");
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::properties::{K3S_SCHEDULER, SCHEDULER_DOMAIN, SCHEDULER_KEY};
    use crate::providers::MemoryProviders;
    use plfm_properties::{MemoryPropertyStore, PropertyStore, GLOBAL_SCOPE};
    use rstest::rstest;

    #[rstest]
    #[case(&[0, 0, 1], "001")]
    #[case(&[35], "z")]
    #[case(&[36], "10")]
    #[case(&[1, 0], "74")]
    #[case(b"hello", "5pzcszu7")]
    fn test_base36(#[case] input: &[u8], #[case] expected: &str) {
        assert_eq!(base36(input), expected);
    }

    #[test]
    fn test_cron_id_is_stable() {
        let id = cron_id("foo", "echo hi", "@daily");
        assert_eq!(id, base36(b"foo===echo hi===@daily"));
        assert_ne!(id, cron_id("foo", "echo hi", "@hourly"));
        assert!(id.chars().all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
    }

    #[rstest]
    #[case("*/5 * * * *", true)]
    #[case("0 3 * * 1-5", true)]
    #[case("30 2 1 JAN,JUL *", true)]
    #[case("@daily", true)]
    #[case("@midnight", true)]
    #[case("0 0 * * * *", false)]
    #[case("* * *", false)]
    #[case("99 99 99 99 99", false)]
    #[case("60 * * * *", false)]
    #[case("* * 32 * *", false)]
    #[case("a b c d e", false)]
    #[case("@bogus", false)]
    #[case("@", false)]
    fn test_validate_schedule(#[case] schedule: &str, #[case] valid: bool) {
        assert_eq!(validate_schedule(schedule).is_ok(), valid);
    }

    async fn k3s_properties() -> Properties {
        let store = Arc::new(MemoryPropertyStore::new());
        store
            .set(SCHEDULER_DOMAIN, GLOBAL_SCOPE, SCHEDULER_KEY, K3S_SCHEDULER)
            .await
            .unwrap();
        Properties::new(store)
    }

    #[tokio::test]
    async fn test_collect_sorted_and_filtered() {
        let properties = k3s_properties().await;
        properties
            .store()
            .set(SCHEDULER_DOMAIN, "docker-app", SCHEDULER_KEY, "docker-local")
            .await
            .unwrap();
        let providers = Arc::new(
            MemoryProviders::new()
                .with_cron("foo", "echo a", "@hourly")
                .with_cron("bar", "echo b", "*/5 * * * *")
                .with_cron("docker-app", "echo c", "@daily"),
        );
        let apps = vec!["foo".to_string(), "bar".to_string(), "docker-app".to_string()];

        let entries = collect_cron_entries(&properties, providers, &apps).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].id < entries[1].id);
        assert!(entries.iter().all(|e| e.app != "docker-app"));
    }

    #[tokio::test]
    async fn test_collect_returns_first_error() {
        let properties = k3s_properties().await;
        let providers = Arc::new(
            MemoryProviders::new()
                .with_cron("foo", "echo a", "@hourly")
                .with_failing_cron("bar"),
        );
        let apps = vec!["foo".to_string(), "bar".to_string()];

        let err = collect_cron_entries(&properties, providers, &apps)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("bar"), "{err}");
    }

    #[tokio::test]
    async fn test_out_of_range_schedule_fails_app() {
        let providers = MemoryProviders::new().with_cron("foo", "echo a", "99 99 99 99 99");
        let err = app_cron_entries(&providers, "foo").await.unwrap_err();
        assert!(matches!(err, SchedulerError::Configuration(_)), "{err}");
        assert!(err.to_string().contains("99 99 99 99 99"), "{err}");
    }

    #[tokio::test]
    async fn test_invalid_schedule_fails_app() {
        let providers = MemoryProviders::new().with_cron("foo", "echo a", "every minute");
        let err = app_cron_entries(&providers, "foo").await.unwrap_err();
        assert!(err.to_string().contains("expected exactly 5 fields"));
    }
}
