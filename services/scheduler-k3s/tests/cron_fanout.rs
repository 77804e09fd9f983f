//! Integration tests for cron aggregation across apps.

use std::sync::Arc;

use plfm_properties::{MemoryPropertyStore, PropertyStore, GLOBAL_SCOPE};
use plfm_scheduler_k3s::cron::{collect_cron_entries, cron_id};
use plfm_scheduler_k3s::properties::{K3S_SCHEDULER, SCHEDULER_DOMAIN, SCHEDULER_KEY};
use plfm_scheduler_k3s::providers::MemoryProviders;
use plfm_scheduler_k3s::Properties;

async fn properties() -> Properties {
    let store = Arc::new(MemoryPropertyStore::new());
    store
        .set(SCHEDULER_DOMAIN, GLOBAL_SCOPE, SCHEDULER_KEY, K3S_SCHEDULER)
        .await
        .unwrap();
    Properties::new(store)
}

fn apps(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("app{i:02}")).collect()
}

#[tokio::test]
async fn test_entries_from_many_apps_are_sorted() {
    let names = apps(20);
    let providers = names.iter().fold(MemoryProviders::new(), |p, app| {
        p.with_cron(app, "bin/tick", "*/10 * * * *")
    });

    let entries = collect_cron_entries(&properties().await, Arc::new(providers), &names)
        .await
        .unwrap();
    assert_eq!(entries.len(), 20);
    assert!(entries.windows(2).all(|w| w[0].id <= w[1].id));
    let first = entries.iter().find(|e| e.app == "app00").unwrap();
    assert_eq!(first.id, cron_id("app00", "bin/tick", "*/10 * * * *"));
}

#[tokio::test]
async fn test_failure_in_one_app_fails_the_batch() {
    let names = apps(8);
    let providers = names
        .iter()
        .fold(MemoryProviders::new(), |p, app| p.with_cron(app, "bin/tick", "@hourly"))
        .with_failing_cron("app05");

    let err = collect_cron_entries(&properties().await, Arc::new(providers), &names)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Cannot parse app.json for app05");
}
