//! Collaborators the scheduler consumes but does not own.
//!
//! App configuration, port declarations, certificates, process commands and
//! cron declarations are managed elsewhere in the platform. The scheduler
//! reads them through these traits so every component can be exercised with
//! in-memory fakes.
//!
//! - [`fs`]: implementations over the on-disk app layout
//! - [`memory`]: in-memory implementations for tests

pub mod fs;
pub mod memory;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::appjson::CronCommand;
use crate::error::Result;
use crate::portmap::PortMap;

pub use fs::FileProviders;
pub use memory::MemoryProviders;

/// App environment lookups.
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    /// One value from the merged (global + app) environment.
    async fn get(&self, app: &str, key: &str) -> Result<Option<String>>;

    /// The merged environment.
    async fn env(&self, app: &str) -> Result<BTreeMap<String, String>>;
}

/// Declared port mappings.
#[async_trait]
pub trait PortMapProvider: Send + Sync {
    async fn list(&self, app: &str) -> Result<Vec<PortMap>>;
}

/// Parts of an imported certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertKind {
    Crt,
    Key,
}

impl fmt::Display for CertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CertKind::Crt => f.write_str("crt"),
            CertKind::Key => f.write_str("key"),
        }
    }
}

/// Imported TLS material.
#[async_trait]
pub trait CertProvider: Send + Sync {
    async fn exists(&self, app: &str) -> Result<bool>;

    /// PEM contents of one part.
    async fn get(&self, app: &str, kind: CertKind) -> Result<String>;
}

/// Process commands from the app's Procfile.
#[async_trait]
pub trait ProcfileProvider: Send + Sync {
    async fn command(&self, app: &str, process_type: &str, port: i32) -> Result<Option<String>>;
}

/// App inventory and routing metadata.
#[async_trait]
pub trait AppDirectory: Send + Sync {
    /// Every app name, sorted.
    async fn apps(&self) -> Result<Vec<String>>;

    /// Whether vhost routing is enabled for an app.
    async fn vhost_enabled(&self, app: &str) -> Result<bool>;

    /// Configured domains, sorted.
    async fn domains(&self, app: &str) -> Result<Vec<String>>;
}

/// Cron declarations.
#[async_trait]
pub trait CronProvider: Send + Sync {
    async fn commands(&self, app: &str) -> Result<Vec<CronCommand>>;
}

/// Bundle of every collaborator.
#[derive(Clone)]
pub struct Providers {
    pub config: Arc<dyn ConfigProvider>,
    pub ports: Arc<dyn PortMapProvider>,
    pub certs: Arc<dyn CertProvider>,
    pub procfile: Arc<dyn ProcfileProvider>,
    pub apps: Arc<dyn AppDirectory>,
    pub cron: Arc<dyn CronProvider>,
}

impl Providers {
    /// Use one object for every role.
    pub fn from_single<P>(provider: Arc<P>) -> Self
    where
        P: ConfigProvider
            + PortMapProvider
            + CertProvider
            + ProcfileProvider
            + AppDirectory
            + CronProvider
            + 'static,
    {
        Self {
            config: provider.clone(),
            ports: provider.clone(),
            certs: provider.clone(),
            procfile: provider.clone(),
            apps: provider.clone(),
            cron: provider,
        }
    }
}
