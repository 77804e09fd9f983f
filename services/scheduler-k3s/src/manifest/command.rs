//! Container start command resolution.

use std::collections::BTreeMap;

use super::ImageSourceType;
use crate::error::Result;
use crate::providers::Providers;
use crate::shell;

/// App config key overriding the start command.
pub const START_CMD_KEY: &str = "PLFM_START_CMD";

/// App config key overriding the start command of dockerfile images.
pub const DOCKERFILE_START_CMD_KEY: &str = "PLFM_DOCKERFILE_START_CMD";

/// Raw command sources for one process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSources {
    pub start_cmd: Option<String>,
    pub dockerfile_start_cmd: Option<String>,
    pub procfile_cmd: Option<String>,
}

/// Pick and split the start command.
///
/// Herokuish images always run `/start <process type>`. Other images use the
/// configured override, then the Procfile entry. `$PORT` expands to `port`
/// and other variables come from `env`.
pub fn resolve(
    image_source_type: ImageSourceType,
    process_type: &str,
    sources: &CommandSources,
    port: i32,
    env: &BTreeMap<String, String>,
) -> Result<Vec<String>> {
    if image_source_type == ImageSourceType::Herokuish {
        return Ok(vec!["/start".to_string(), process_type.to_string()]);
    }

    let non_empty = |v: &Option<String>| v.clone().filter(|s| !s.trim().is_empty());
    let dockerfile = if image_source_type == ImageSourceType::Dockerfile {
        non_empty(&sources.dockerfile_start_cmd)
    } else {
        None
    };
    let Some(raw) = dockerfile
        .or_else(|| non_empty(&sources.start_cmd))
        .or_else(|| non_empty(&sources.procfile_cmd))
    else {
        return Ok(Vec::new());
    };

    let port = port.to_string();
    shell::split_expanded("start command", &raw, |name| {
        if name == "PORT" {
            Some(port.clone())
        } else {
            env.get(name).cloned()
        }
    })
}

/// Look up the command sources and resolve the start command.
pub async fn start_command(
    providers: &Providers,
    app: &str,
    process_type: &str,
    image_source_type: ImageSourceType,
    port: i32,
) -> Result<Vec<String>> {
    let env = providers.config.env(app).await?;
    let sources = CommandSources {
        start_cmd: env.get(START_CMD_KEY).cloned(),
        dockerfile_start_cmd: env.get(DOCKERFILE_START_CMD_KEY).cloned(),
        procfile_cmd: providers.procfile.command(app, process_type, port).await?,
    };
    resolve(image_source_type, process_type, &sources, port, &env)
}
