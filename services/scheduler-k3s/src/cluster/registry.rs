//! Private registry configuration shared by every node.
//!
//! k3s reads `registries.yaml` at startup. The server keeps the master copy,
//! writable by the platform's service account, and pushes it to joining nodes.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use tracing::{debug, info};

use super::local::{check_local, CommandRunner};
use super::remote::{run_checked, upload_checked, Connection, RemoteCommand, RemoteExecutor};
use crate::config::REGISTRY_CONFIG_PATH;
use crate::error::{Result, SchedulerError};

/// Staging path for the copy on a remote node.
pub const REMOTE_STAGING_PATH: &str = "/tmp/registries.yaml";

const EMPTY_REGISTRY_CONFIG: &str = "{}\n";

/// Create the registry file if missing and grant `system_user` write access.
pub async fn seed_registry_config(
    path: &Path,
    system_user: &str,
    runner: &dyn CommandRunner,
) -> Result<()> {
    let exists = tokio::fs::try_exists(path)
        .await
        .map_err(|e| SchedulerError::path_io(path, e))?;
    if !exists {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SchedulerError::path_io(parent, e))?;
        }
        tokio::fs::write(path, EMPTY_REGISTRY_CONFIG)
            .await
            .map_err(|e| SchedulerError::path_io(path, e))?;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o644))
            .await
            .map_err(|e| SchedulerError::path_io(path, e))?;
        debug!(path = %path.display(), "Created registry configuration");
    }

    let args = vec![
        "-m".to_string(),
        format!("user:{system_user}:rw"),
        path.display().to_string(),
    ];
    check_local("setfacl", runner.run("setfacl", &args).await?)?;
    Ok(())
}

/// Install the local registry file on a remote node.
pub async fn copy_registry_to_node(
    executor: &dyn RemoteExecutor,
    connection: &Connection,
    local: &Path,
) -> Result<()> {
    info!(host = %connection.host, "Updating k3s registry configuration");
    upload_checked(executor, connection, local, REMOTE_STAGING_PATH).await?;

    let config_dir = Path::new(REGISTRY_CONFIG_PATH)
        .parent()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    let steps = [
        RemoteCommand::new("mkdir", "mkdir", ["-p", config_dir.as_str()]).sudo(),
        RemoteCommand::new("mv", "mv", [REMOTE_STAGING_PATH, REGISTRY_CONFIG_PATH]).sudo(),
        RemoteCommand::new("chmod", "chmod", ["0644", REGISTRY_CONFIG_PATH]).sudo(),
        RemoteCommand::new("chown", "chown", ["root:root", REGISTRY_CONFIG_PATH]).sudo(),
    ];
    for step in &steps {
        run_checked(executor, connection, step).await?;
    }
    Ok(())
}
