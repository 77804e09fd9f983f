//! Host configuration for the scheduler.
//!
//! Values here describe the machine the scheduler runs on (paths, binaries,
//! the service account). Per-app settings live in the property store, see
//! [`crate::properties`].

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, SchedulerError};

/// Default root of app directories.
pub const DEFAULT_ROOT: &str = "/home/plfm";

/// Default root of platform state.
pub const DEFAULT_LIB_ROOT: &str = "/var/lib/plfm";

/// Path of the k3s binary once installed.
pub const K3S_BIN: &str = "/usr/local/bin/k3s";

/// Uninstall script written by the k3s installer.
pub const K3S_UNINSTALL_SCRIPT: &str = "/usr/local/bin/k3s-uninstall.sh";

/// Private registry configuration read by k3s.
pub const REGISTRY_CONFIG_PATH: &str = "/etc/rancher/k3s/registries.yaml";

/// Upstream installer script.
pub const K3S_INSTALLER_URL: &str = "https://get.k3s.io";

/// Scheduler host configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Root of app directories (`<root>/<app>/...`).
    pub root: PathBuf,

    /// Root of platform state.
    pub lib_root: PathBuf,

    /// Property store root.
    pub properties_root: PathBuf,

    /// helm executable.
    pub helm_bin: String,

    /// Kubeconfig override; wins over the `kubeconfig-path` property.
    pub kubeconfig_override: Option<PathBuf>,

    /// k3s binary path.
    pub k3s_bin: PathBuf,

    /// k3s uninstall script path.
    pub k3s_uninstall_script: PathBuf,

    /// Registry configuration file.
    pub registry_config_path: PathBuf,

    /// Service account that must be able to write the registry file.
    pub system_user: String,

    /// Directory holding the ssh identity used for remote nodes.
    pub ssh_key_dir: PathBuf,

    /// Installer download URL.
    pub installer_url: String,

    /// Interval between readiness polls.
    pub poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let root = PathBuf::from(DEFAULT_ROOT);
        let lib_root = PathBuf::from(DEFAULT_LIB_ROOT);
        Self {
            ssh_key_dir: root.join(".ssh"),
            properties_root: lib_root.join("config"),
            root,
            lib_root,
            helm_bin: "helm".to_string(),
            kubeconfig_override: None,
            k3s_bin: PathBuf::from(K3S_BIN),
            k3s_uninstall_script: PathBuf::from(K3S_UNINSTALL_SCRIPT),
            registry_config_path: PathBuf::from(REGISTRY_CONFIG_PATH),
            system_user: "plfm".to_string(),
            installer_url: K3S_INSTALLER_URL.to_string(),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl SchedulerConfig {
    /// Load configuration from `PLFM_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let var = |key: &str| lookup(key).filter(|v| !v.is_empty());

        let root = var("PLFM_ROOT").map(PathBuf::from).unwrap_or(defaults.root);
        let lib_root = var("PLFM_LIB_ROOT")
            .map(PathBuf::from)
            .unwrap_or(defaults.lib_root);

        let poll_interval = match var("PLFM_POLL_INTERVAL_MS") {
            Some(raw) => raw.parse::<u64>().map(Duration::from_millis).map_err(|_| {
                SchedulerError::config(format!("PLFM_POLL_INTERVAL_MS must be an integer, got '{raw}'"))
            })?,
            None => defaults.poll_interval,
        };

        Ok(Self {
            properties_root: var("PLFM_PROPERTIES_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| lib_root.join("config")),
            ssh_key_dir: var("PLFM_SSH_KEY_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| root.join(".ssh")),
            helm_bin: var("PLFM_HELM_BIN").unwrap_or(defaults.helm_bin),
            kubeconfig_override: var("PLFM_KUBECONFIG").map(PathBuf::from),
            k3s_bin: var("PLFM_K3S_BIN").map(PathBuf::from).unwrap_or(defaults.k3s_bin),
            k3s_uninstall_script: var("PLFM_K3S_UNINSTALL_SCRIPT")
                .map(PathBuf::from)
                .unwrap_or(defaults.k3s_uninstall_script),
            registry_config_path: var("PLFM_K3S_REGISTRY_CONFIG")
                .map(PathBuf::from)
                .unwrap_or(defaults.registry_config_path),
            system_user: var("PLFM_SYSTEM_USER").unwrap_or(defaults.system_user),
            installer_url: var("PLFM_K3S_INSTALLER_URL").unwrap_or(defaults.installer_url),
            poll_interval,
            root,
            lib_root,
        })
    }

    /// Directory of one app.
    pub fn app_dir(&self, app: &str) -> PathBuf {
        self.root.join(app)
    }
}
