//! Collaborators over the on-disk app layout.
//!
//! ```text
//! <root>/ENV                          global environment
//! <root>/<app>/ENV                    app environment
//! <root>/<app>/VHOST                  one domain per line
//! <root>/<app>/Procfile               `type: command` lines
//! <root>/<app>/tls/server.{crt,key}   imported certificate
//! <lib_root>/data/app-json/<app>/app.json
//! ```
//!
//! Port mappings live in the property store (domain `ports`, key `map`).

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use plfm_envfile::{EnvFile, ENV_FILE_NAME};
use plfm_properties::PropertyStore;

use super::{
    AppDirectory, CertKind, CertProvider, ConfigProvider, CronProvider, PortMapProvider,
    ProcfileProvider,
};
use crate::appjson::{AppJson, CronCommand};
use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::portmap::PortMap;

/// Property domain and key of declared port mappings.
pub const PORTS_DOMAIN: &str = "ports";
pub const PORTS_KEY: &str = "map";

/// Env var that turns off vhost routing for an app.
const NO_VHOST: &str = "NO_VHOST";

/// Collaborators reading the app directories.
#[derive(Clone)]
pub struct FileProviders {
    root: PathBuf,
    lib_root: PathBuf,
    store: Arc<dyn PropertyStore>,
}

impl FileProviders {
    pub fn new(config: &SchedulerConfig, store: Arc<dyn PropertyStore>) -> Self {
        Self {
            root: config.root.clone(),
            lib_root: config.lib_root.clone(),
            store,
        }
    }

    fn app_dir(&self, app: &str) -> PathBuf {
        self.root.join(app)
    }

    /// Location of the app's extracted `app.json`.
    pub fn app_json_path(&self, app: &str) -> PathBuf {
        self.lib_root
            .join("data")
            .join("app-json")
            .join(app)
            .join("app.json")
    }

    /// The app's parsed `app.json`.
    pub async fn app_json(&self, app: &str) -> Result<AppJson> {
        AppJson::read_from(&self.app_json_path(app)).await
    }

    /// Persist port mappings in declaration form.
    pub async fn set_port_maps(&self, app: &str, port_maps: &[PortMap]) -> Result<()> {
        let value = port_maps
            .iter()
            .map(|p| format!("{}:{}:{}", p.scheme, p.host_port, p.container_port))
            .collect::<Vec<_>>()
            .join(" ");
        self.store.set(PORTS_DOMAIN, app, PORTS_KEY, &value).await?;
        Ok(())
    }
}

async fn read_optional(path: &Path) -> Result<Option<String>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(SchedulerError::path_io(path, e)),
    }
}

async fn read_env(path: &Path) -> Result<EnvFile> {
    match read_optional(path).await? {
        Some(content) => EnvFile::parse(&content)
            .map_err(|e| SchedulerError::Provider(format!("{}: {e}", path.display()))),
        None => Ok(EnvFile::new()),
    }
}

#[async_trait]
impl ConfigProvider for FileProviders {
    async fn get(&self, app: &str, key: &str) -> Result<Option<String>> {
        Ok(self.env(app).await?.remove(key))
    }

    async fn env(&self, app: &str) -> Result<BTreeMap<String, String>> {
        let global = read_env(&self.root.join(ENV_FILE_NAME)).await?;
        let app_env = read_env(&self.app_dir(app).join(ENV_FILE_NAME)).await?;
        Ok(global.merged(&app_env).into_map())
    }
}

#[async_trait]
impl PortMapProvider for FileProviders {
    async fn list(&self, app: &str) -> Result<Vec<PortMap>> {
        let Some(raw) = self.store.get(PORTS_DOMAIN, app, PORTS_KEY).await? else {
            return Ok(Vec::new());
        };
        raw.split_whitespace()
            .map(PortMap::parse_declaration)
            .collect()
    }
}

#[async_trait]
impl CertProvider for FileProviders {
    async fn exists(&self, app: &str) -> Result<bool> {
        let tls = self.app_dir(app).join("tls");
        Ok(tokio::fs::try_exists(tls.join("server.crt")).await.unwrap_or(false)
            && tokio::fs::try_exists(tls.join("server.key")).await.unwrap_or(false))
    }

    async fn get(&self, app: &str, kind: CertKind) -> Result<String> {
        let path = self.app_dir(app).join("tls").join(format!("server.{kind}"));
        read_optional(&path)
            .await?
            .ok_or_else(|| SchedulerError::Provider(format!("No certificate imported for {app}")))
    }
}

#[async_trait]
impl ProcfileProvider for FileProviders {
    async fn command(&self, app: &str, process_type: &str, _port: i32) -> Result<Option<String>> {
        let Some(content) = read_optional(&self.app_dir(app).join("Procfile")).await? else {
            return Ok(None);
        };
        Ok(parse_procfile(&content).remove(process_type))
    }
}

#[async_trait]
impl AppDirectory for FileProviders {
    async fn apps(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SchedulerError::path_io(&self.root, e)),
        };

        let mut apps = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SchedulerError::path_io(&self.root, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if is_dir && !name.starts_with('.') {
                apps.push(name);
            }
        }
        apps.sort();
        Ok(apps)
    }

    async fn vhost_enabled(&self, app: &str) -> Result<bool> {
        Ok(ConfigProvider::get(self, app, NO_VHOST).await?.as_deref() != Some("1"))
    }

    async fn domains(&self, app: &str) -> Result<Vec<String>> {
        let Some(content) = read_optional(&self.app_dir(app).join("VHOST")).await? else {
            return Ok(Vec::new());
        };
        let mut domains: Vec<String> = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        domains.sort();
        domains.dedup();
        Ok(domains)
    }
}

#[async_trait]
impl CronProvider for FileProviders {
    async fn commands(&self, app: &str) -> Result<Vec<CronCommand>> {
        Ok(self.app_json(app).await?.cron)
    }
}

/// Parse `type: command` lines. Later duplicates win.
fn parse_procfile(content: &str) -> BTreeMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, v)| !k.is_empty() && !v.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use plfm_properties::MemoryPropertyStore;

    fn providers(dir: &Path) -> FileProviders {
        let config = SchedulerConfig {
            root: dir.join("apps"),
            lib_root: dir.join("lib"),
            ..SchedulerConfig::default()
        };
        FileProviders::new(&config, Arc::new(MemoryPropertyStore::new()))
    }

    #[test]
    fn test_parse_procfile() {
        let procs = parse_procfile("# c\nweb: gunicorn app:app -b 0.0.0.0:$PORT\nworker:  celery\nbad line\n");
        assert_eq!(procs["web"], "gunicorn app:app -b 0.0.0.0:$PORT");
        assert_eq!(procs["worker"], "celery");
        assert_eq!(procs.len(), 2);
    }

    #[tokio::test]
    async fn test_env_merges_global_and_app() {
        let dir = tempfile::tempdir().unwrap();
        let p = providers(dir.path());
        std::fs::create_dir_all(dir.path().join("apps/foo")).unwrap();
        std::fs::write(dir.path().join("apps/ENV"), "export A='global'\nexport B='global'\n").unwrap();
        std::fs::write(dir.path().join("apps/foo/ENV"), "export B='app'\n").unwrap();

        let env = p.env("foo").await.unwrap();
        assert_eq!(env["A"], "global");
        assert_eq!(env["B"], "app");
        assert_eq!(ConfigProvider::get(&p, "foo", "B").await.unwrap().as_deref(), Some("app"));
    }

    #[tokio::test]
    async fn test_apps_domains_and_certs() {
        let dir = tempfile::tempdir().unwrap();
        let p = providers(dir.path());
        std::fs::create_dir_all(dir.path().join("apps/foo/tls")).unwrap();
        std::fs::create_dir_all(dir.path().join("apps/bar")).unwrap();
        std::fs::create_dir_all(dir.path().join("apps/.ssh")).unwrap();
        std::fs::write(dir.path().join("apps/foo/VHOST"), "b.example.com\na.example.com\n").unwrap();
        std::fs::write(dir.path().join("apps/foo/tls/server.crt"), "CRT").unwrap();
        std::fs::write(dir.path().join("apps/foo/tls/server.key"), "KEY").unwrap();

        assert_eq!(p.apps().await.unwrap(), vec!["bar", "foo"]);
        assert_eq!(
            p.domains("foo").await.unwrap(),
            vec!["a.example.com", "b.example.com"]
        );
        assert!(p.vhost_enabled("foo").await.unwrap());
        assert!(CertProvider::exists(&p, "foo").await.unwrap());
        assert!(!CertProvider::exists(&p, "bar").await.unwrap());
        assert_eq!(CertProvider::get(&p, "foo", CertKind::Key).await.unwrap(), "KEY");
    }

    #[tokio::test]
    async fn test_port_maps_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let p = providers(dir.path());
        let maps = vec![PortMap::new("http", 80, 5000), PortMap::new("https", 443, 5000)];

        p.set_port_maps("foo", &maps).await.unwrap();
        assert_eq!(p.list("foo").await.unwrap(), maps);
        assert!(p.list("bar").await.unwrap().is_empty());
    }
}
