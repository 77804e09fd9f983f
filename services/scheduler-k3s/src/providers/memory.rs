//! In-memory collaborators for tests and dry runs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{
    AppDirectory, CertKind, CertProvider, ConfigProvider, CronProvider, PortMapProvider,
    ProcfileProvider,
};
use crate::appjson::CronCommand;
use crate::error::{Result, SchedulerError};
use crate::portmap::PortMap;

#[derive(Debug, Default)]
struct State {
    apps: BTreeSet<String>,
    env: BTreeMap<String, BTreeMap<String, String>>,
    port_maps: BTreeMap<String, Vec<PortMap>>,
    certs: BTreeMap<String, (String, String)>,
    procfiles: BTreeMap<(String, String), String>,
    domains: BTreeMap<String, BTreeSet<String>>,
    vhost_disabled: BTreeSet<String>,
    cron: BTreeMap<String, Vec<CronCommand>>,
    failing_cron: BTreeSet<String>,
}

/// Every collaborator backed by one in-memory state.
#[derive(Debug, Default)]
pub struct MemoryProviders {
    state: Mutex<State>,
}

impl MemoryProviders {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| SchedulerError::Provider("provider state lock poisoned".to_string()))
    }

    fn update(self, f: impl FnOnce(&mut State)) -> Self {
        if let Ok(mut state) = self.state.lock() {
            f(&mut state);
        }
        self
    }

    pub fn with_app(self, app: &str) -> Self {
        self.update(|s| {
            s.apps.insert(app.to_string());
        })
    }

    pub fn with_env(self, app: &str, key: &str, value: &str) -> Self {
        self.update(|s| {
            s.apps.insert(app.to_string());
            s.env
                .entry(app.to_string())
                .or_default()
                .insert(key.to_string(), value.to_string());
        })
    }

    pub fn with_port_map(self, app: &str, port_map: PortMap) -> Self {
        self.update(|s| {
            s.apps.insert(app.to_string());
            s.port_maps.entry(app.to_string()).or_default().push(port_map);
        })
    }

    pub fn with_cert(self, app: &str, crt: &str, key: &str) -> Self {
        self.update(|s| {
            s.apps.insert(app.to_string());
            s.certs
                .insert(app.to_string(), (crt.to_string(), key.to_string()));
        })
    }

    pub fn with_procfile(self, app: &str, process_type: &str, command: &str) -> Self {
        self.update(|s| {
            s.apps.insert(app.to_string());
            s.procfiles.insert(
                (app.to_string(), process_type.to_string()),
                command.to_string(),
            );
        })
    }

    pub fn with_domain(self, app: &str, domain: &str) -> Self {
        self.update(|s| {
            s.apps.insert(app.to_string());
            s.domains
                .entry(app.to_string())
                .or_default()
                .insert(domain.to_string());
        })
    }

    pub fn with_vhost_disabled(self, app: &str) -> Self {
        self.update(|s| {
            s.vhost_disabled.insert(app.to_string());
        })
    }

    pub fn with_cron(self, app: &str, command: &str, schedule: &str) -> Self {
        self.update(|s| {
            s.apps.insert(app.to_string());
            s.cron.entry(app.to_string()).or_default().push(CronCommand {
                command: command.to_string(),
                schedule: schedule.to_string(),
            });
        })
    }

    /// Make cron lookups for `app` fail.
    pub fn with_failing_cron(self, app: &str) -> Self {
        self.update(|s| {
            s.apps.insert(app.to_string());
            s.failing_cron.insert(app.to_string());
        })
    }

    /// Replace an app's certificate after construction.
    pub fn set_cert(&self, app: &str, crt: &str, key: &str) -> Result<()> {
        self.lock()?
            .certs
            .insert(app.to_string(), (crt.to_string(), key.to_string()));
        Ok(())
    }

    pub fn remove_cert(&self, app: &str) -> Result<()> {
        self.lock()?.certs.remove(app);
        Ok(())
    }
}

#[async_trait]
impl ConfigProvider for MemoryProviders {
    async fn get(&self, app: &str, key: &str) -> Result<Option<String>> {
        Ok(self.lock()?.env.get(app).and_then(|env| env.get(key)).cloned())
    }

    async fn env(&self, app: &str) -> Result<BTreeMap<String, String>> {
        Ok(self.lock()?.env.get(app).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl PortMapProvider for MemoryProviders {
    async fn list(&self, app: &str) -> Result<Vec<PortMap>> {
        Ok(self.lock()?.port_maps.get(app).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl CertProvider for MemoryProviders {
    async fn exists(&self, app: &str) -> Result<bool> {
        Ok(self.lock()?.certs.contains_key(app))
    }

    async fn get(&self, app: &str, kind: CertKind) -> Result<String> {
        let state = self.lock()?;
        let (crt, key) = state
            .certs
            .get(app)
            .ok_or_else(|| SchedulerError::Provider(format!("No certificate imported for {app}")))?;
        Ok(match kind {
            CertKind::Crt => crt.clone(),
            CertKind::Key => key.clone(),
        })
    }
}

#[async_trait]
impl ProcfileProvider for MemoryProviders {
    async fn command(&self, app: &str, process_type: &str, _port: i32) -> Result<Option<String>> {
        Ok(self
            .lock()?
            .procfiles
            .get(&(app.to_string(), process_type.to_string()))
            .cloned())
    }
}

#[async_trait]
impl AppDirectory for MemoryProviders {
    async fn apps(&self) -> Result<Vec<String>> {
        Ok(self.lock()?.apps.iter().cloned().collect())
    }

    async fn vhost_enabled(&self, app: &str) -> Result<bool> {
        Ok(!self.lock()?.vhost_disabled.contains(app))
    }

    async fn domains(&self, app: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()?
            .domains
            .get(app)
            .map(|d| d.iter().cloned().collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl CronProvider for MemoryProviders {
    async fn commands(&self, app: &str) -> Result<Vec<CronCommand>> {
        let state = self.lock()?;
        if state.failing_cron.contains(app) {
            return Err(SchedulerError::Provider(format!(
                "Cannot parse app.json for {app}"
            )));
        }
        Ok(state.cron.get(app).cloned().unwrap_or_default())
    }
}
