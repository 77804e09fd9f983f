//! `app.json` sections read by the scheduler: health checks and cron.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};

/// Parsed `app.json`. Unknown sections are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppJson {
    #[serde(default)]
    pub cron: Vec<CronCommand>,

    /// Health checks keyed by process type.
    #[serde(default)]
    pub healthchecks: BTreeMap<String, Vec<Healthcheck>>,
}

impl AppJson {
    pub fn parse(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_str(content)?)
    }

    /// Read `path`. A missing or empty file is an empty document.
    pub async fn read_from(path: &Path) -> Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(content) => Self::parse(&content).map_err(|e| {
                SchedulerError::Provider(format!("Cannot parse {}: {e}", path.display()))
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(SchedulerError::path_io(path, e)),
        }
    }
}

/// A scheduled command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronCommand {
    pub command: String,
    pub schedule: String,
}

/// Which probe a health check feeds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthcheckType {
    #[default]
    Startup,
    Readiness,
    Liveness,
}

impl HealthcheckType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthcheckType::Startup => "startup",
            HealthcheckType::Readiness => "readiness",
            HealthcheckType::Liveness => "liveness",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpHeader {
    pub name: String,
    pub value: String,
}

/// One health check declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Healthcheck {
    #[serde(rename = "type", default)]
    pub kind: HealthcheckType,

    #[serde(default)]
    pub name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    #[serde(default)]
    pub listening: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub http_headers: Vec<HttpHeader>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_delay: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uptime: Option<i32>,
}
